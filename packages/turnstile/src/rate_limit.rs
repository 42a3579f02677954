//! Sliding-window rate limiting against the shared store.
//!
//! A caller is admitted when fewer than `limit` of its hits fall within the
//! trailing `window`. Windows are keyed `limit:<scope>:<uid>` so that a
//! caller's general API quota and its token issuance quota never collide.
//!
//! This module does not retry: store failures surface as
//! [`LimitError::StoreUnavailable`] and the admission pipeline decides
//! whether to fail open or closed.

use std::time::Duration;

use derive_more::{Debug, Display, Error};
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::{
    identity::RequestTier,
    store::{Hit, Store},
};

/// Distinguishes the quota classes a single uid can be charged against.
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq, Hash)]
pub enum Scope {
    /// General API traffic.
    #[display("app")]
    App,

    /// Token issuance.
    #[display("auth")]
    Auth,

    /// Aggregate across every caller.
    #[display("global")]
    Global,
}

/// A rate limit key: `limit:<scope>:<uid>`.
#[derive(Clone, Debug, Display, PartialEq, Eq, Hash)]
pub struct LimitKey(String);

impl LimitKey {
    pub fn new(scope: Scope, uid: &str) -> Self {
        Self(format!("limit:{scope}:{uid}"))
    }

    /// The key every request shares for the aggregate quota.
    pub fn global() -> Self {
        Self::new(Scope::Global, "all")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// How many hits are allowed within a window.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Quota {
    pub limit: u64,
    pub window: Duration,
}

/// Per-tier quota configuration.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Limits {
    pub normal: u64,
    pub throttled: u64,
    pub auth: u64,
    pub global: u64,
    pub window: Duration,
}

impl Limits {
    /// The quota that applies to a tier.
    pub fn quota(&self, tier: RequestTier) -> Quota {
        let limit = match tier {
            RequestTier::Normal => self.normal,
            RequestTier::Throttled => self.throttled,
            RequestTier::Global => self.global,
            RequestTier::AuthEndpoint => self.auth,
        };
        Quota {
            limit,
            window: self.window,
        }
    }
}

/// The outcome of a rate limit check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub admitted: bool,
    pub key: String,

    /// Hits already in the window when this one arrived.
    pub count: u64,
}

#[derive(Clone, Debug, Display, Error, PartialEq, Eq)]
pub enum LimitError {
    /// The key already has `limit` hits within the window.
    #[display("rate limit exceeded for {key} ({limit} per {window:?})")]
    Exceeded {
        key: String,
        limit: u64,
        window: Duration,
    },

    /// The store failed or did not answer within the timeout.
    #[display("rate limit store unavailable: {_0}")]
    StoreUnavailable(#[error(not(source))] String),
}

/// Sliding-window limiter backed by the shared store.
#[derive(Clone, Debug)]
pub struct RateLimiter {
    store: Store,
    timeout: Duration,
}

impl RateLimiter {
    pub fn new(store: Store, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    /// Check and record a hit against `key` at the current time.
    pub async fn check_limit(
        &self,
        key: &LimitKey,
        quota: Quota,
    ) -> Result<RateLimitDecision, LimitError> {
        self.check_limit_at(key, quota, now_ms()).await
    }

    /// Check and record a hit against `key` as if the current time were
    /// `now_ms` milliseconds since the Unix epoch.
    pub async fn check_limit_at(
        &self,
        key: &LimitKey,
        quota: Quota,
        now_ms: i64,
    ) -> Result<RateLimitDecision, LimitError> {
        let decision = self.evaluate_at(key, quota, now_ms).await?;
        if decision.admitted {
            Ok(decision)
        } else {
            Err(LimitError::Exceeded {
                key: decision.key,
                limit: quota.limit,
                window: quota.window,
            })
        }
    }

    /// Run the window transaction and report whether the hit was admitted.
    ///
    /// Admitted hits stay in the window; rejected hits are retracted. The
    /// store call runs on its own task so that it completes even if the
    /// request that triggered it goes away, and is bounded by the configured
    /// timeout.
    #[tracing::instrument(name = "RateLimiter::evaluate", skip(self))]
    pub async fn evaluate_at(
        &self,
        key: &LimitKey,
        quota: Quota,
        now_ms: i64,
    ) -> Result<RateLimitDecision, LimitError> {
        let hit = Hit::new(key.as_str(), now_ms, quota.window);
        let store = self.store.clone();
        let limit = quota.limit;
        let task = tokio::spawn(async move {
            let count = store.record(&hit).await?;
            if count >= limit {
                if let Err(error) = store.retract(&hit).await {
                    warn!(?error, key = %hit.key, "rate_limit.retract_failed");
                }
            }
            color_eyre::Result::<u64>::Ok(count)
        });

        let count = match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(Ok(count))) => count,
            Ok(Ok(Err(error))) => {
                return Err(LimitError::StoreUnavailable(format!("{error:#}")));
            }
            Ok(Err(error)) => return Err(LimitError::StoreUnavailable(error.to_string())),
            Err(_) => {
                return Err(LimitError::StoreUnavailable(format!(
                    "timed out after {:?}",
                    self.timeout
                )));
            }
        };

        let admitted = count < limit;
        debug!(key = %key, count, limit, admitted, "rate_limit.check");
        Ok(RateLimitDecision {
            admitted,
            key: key.to_string(),
            count,
        })
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    let nanos = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
    i64::try_from(nanos).unwrap_or(i64::MAX)
}
