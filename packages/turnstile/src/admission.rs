//! The admission pipeline.
//!
//! Every routed request passes through three stages, in order:
//!
//! 1. Identity: classify the `anon_id` cookie and resolve the caller from its
//!    bearer token or device fingerprint.
//! 2. Scoped quota: charge the caller's own window for the route's scope.
//! 3. Global quota: charge the aggregate window shared by every caller.
//!
//! The global window only sees requests the caller's own quota admitted, so
//! a single caller hammering a closed window cannot exhaust it for others.
//!
//! Each stage either continues with a richer context or terminates the
//! request with a [`Rejection`]. Only this module terminates requests early;
//! handlers downstream read the resolved [`RequestContext`] and can assume
//! the caller was admitted.

use std::sync::Arc;

use axum::{
    Json,
    extract::{FromRequestParts, Request, State},
    http::{HeaderValue, StatusCode, header::RETRY_AFTER, header::SET_COOKIE, request::Parts},
    middleware::Next,
    response::{IntoResponse, Response},
};
use clap::ValueEnum;
use derive_more::{Debug, Display, Error, From};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    auth::{Claims, TokenError},
    identity::{AuthMode, ClientIdentity, IdentityError, IdentityResolver, RequestTier},
    rate_limit::{LimitError, LimitKey, Limits, RateLimiter, Scope},
};

/// What to do with a request when the store cannot be reached.
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq, ValueEnum)]
pub enum FailMode {
    /// Reject with `500`.
    #[display("closed")]
    Closed,

    /// Log a warning and admit.
    #[display("open")]
    Open,
}

/// How a route is admitted.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RoutePolicy {
    pub auth: AuthMode,
    pub scope: Scope,
}

impl RoutePolicy {
    /// A verified token is required; charged against the caller's app quota.
    pub const PROTECTED: Self = Self {
        auth: AuthMode::Required,
        scope: Scope::App,
    };

    /// Tokens are honored when valid; otherwise the caller is fingerprinted.
    pub const OPTIONAL: Self = Self {
        auth: AuthMode::Optional,
        scope: Scope::App,
    };

    /// Token issuance: any resolvable caller, charged against the dedicated
    /// issuance quota.
    pub const TOKEN_ISSUANCE: Self = Self {
        auth: AuthMode::Optional,
        scope: Scope::Auth,
    };
}

/// Identity resolved for an admitted request.
///
/// Inserted into the request extensions by [`gate`]; handlers extract it
/// directly.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestContext {
    pub client: ClientIdentity,
    pub tier: RequestTier,
    pub uid: String,

    /// Present only when the caller presented a verified token.
    pub claims: Option<Claims>,
}

impl<S: Send + Sync> FromRequestParts<S> for RequestContext {
    type Rejection = Rejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<RequestContext>()
            .cloned()
            .ok_or(Rejection::Identity(IdentityError::ContextMissing))
    }
}

/// Why a request was not admitted.
#[derive(Debug, Display, Error, From)]
pub enum Rejection {
    #[display("{_0}")]
    Identity(IdentityError),

    #[display("{_0}")]
    Limit(LimitError),
}

impl From<TokenError> for Rejection {
    fn from(err: TokenError) -> Self {
        Rejection::Identity(IdentityError::Token(err))
    }
}

impl Rejection {
    pub fn status(&self) -> StatusCode {
        match self {
            Rejection::Identity(IdentityError::Token(_)) => StatusCode::UNAUTHORIZED,
            Rejection::Identity(IdentityError::FingerprintUnavailable(_)) => StatusCode::FORBIDDEN,
            Rejection::Identity(IdentityError::ContextMissing) => StatusCode::INTERNAL_SERVER_ERROR,
            Rejection::Limit(LimitError::Exceeded { .. }) => StatusCode::TOO_MANY_REQUESTS,
            Rejection::Limit(LimitError::StoreUnavailable(_)) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The message sent to the client. Infrastructure details stay in logs.
    fn public_message(&self) -> String {
        match self {
            Rejection::Identity(IdentityError::ContextMissing)
            | Rejection::Limit(LimitError::StoreUnavailable(_)) => ErrorBody::internal().error,
            Rejection::Limit(LimitError::Exceeded { .. }) => String::from("rate limit exceeded"),
            other => other.to_string(),
        }
    }
}

/// JSON body of every error response.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

impl ErrorBody {
    /// The body sent for failures whose details belong in logs only.
    pub fn internal() -> Self {
        Self {
            error: String::from("internal server error"),
        }
    }
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(ErrorBody {
            error: self.public_message(),
        });
        match self {
            Rejection::Limit(LimitError::Exceeded { window, .. }) => {
                let retry_after = window.as_secs().max(1).to_string();
                (status, [(RETRY_AFTER, retry_after)], body).into_response()
            }
            _ => (status, body).into_response(),
        }
    }
}

/// Composes identity resolution and rate limiting into one pipeline.
#[derive(Clone, Debug)]
pub struct Admission {
    resolver: IdentityResolver,
    limiter: RateLimiter,
    limits: Limits,
    fail_mode: FailMode,
}

impl Admission {
    pub fn new(
        resolver: IdentityResolver,
        limiter: RateLimiter,
        limits: Limits,
        fail_mode: FailMode,
    ) -> Self {
        Self {
            resolver,
            limiter,
            limits,
            fail_mode,
        }
    }

    /// Run the pipeline for a request.
    #[tracing::instrument(
        name = "Admission::admit",
        skip(self, parts),
        fields(path = %parts.uri.path()),
    )]
    pub async fn admit(
        &self,
        parts: &Parts,
        policy: RoutePolicy,
    ) -> Result<RequestContext, Rejection> {
        let client = ClientIdentity::from_headers(&parts.headers);
        let caller = self.resolver.resolve(parts, policy.auth)?;

        let tier = match policy.scope {
            Scope::App => caller.tier,
            Scope::Auth => RequestTier::AuthEndpoint,
            Scope::Global => RequestTier::Global,
        };
        self.charge(&LimitKey::new(policy.scope, &caller.uid), tier)
            .await?;

        self.charge(&LimitKey::global(), RequestTier::Global).await?;

        debug!(tier = %caller.tier, client = %client.class, "admission.admitted");
        Ok(RequestContext {
            client,
            tier: caller.tier,
            uid: caller.uid,
            claims: caller.claims,
        })
    }

    async fn charge(&self, key: &LimitKey, tier: RequestTier) -> Result<(), Rejection> {
        match self.limiter.check_limit(key, self.limits.quota(tier)).await {
            Ok(_) => Ok(()),
            Err(LimitError::StoreUnavailable(reason)) if self.fail_mode == FailMode::Open => {
                warn!(%key, %reason, "admission.fail_open");
                Ok(())
            }
            Err(err) => Err(Rejection::Limit(err)),
        }
    }
}

/// Middleware state: the shared pipeline plus the policy for the routes it
/// wraps.
#[derive(Clone, Debug)]
pub struct Gate {
    admission: Arc<Admission>,
    policy: RoutePolicy,
}

impl Gate {
    pub fn new(admission: Arc<Admission>, policy: RoutePolicy) -> Self {
        Self { admission, policy }
    }
}

/// Admission middleware.
///
/// On success the resolved [`RequestContext`] is attached to the request
/// and, if a fresh `anon_id` was minted, its cookie is set on the response.
pub async fn gate(State(gate): State<Gate>, request: Request, next: Next) -> Response {
    let (mut parts, body) = request.into_parts();
    let context = match gate.admission.admit(&parts, gate.policy).await {
        Ok(context) => context,
        Err(rejection) => {
            let status = rejection.status();
            if status.is_server_error() {
                warn!(error = %rejection, %status, "admission.failed");
            } else {
                info!(error = %rejection, %status, "admission.rejected");
            }
            return rejection.into_response();
        }
    };

    let cookie = context.client.cookie();
    parts.extensions.insert(context);
    let mut response = next.run(Request::from_parts(parts, body)).await;

    if let Some(cookie) = cookie {
        match HeaderValue::from_str(&cookie.to_string()) {
            Ok(value) => {
                response.headers_mut().append(SET_COOKIE, value);
            }
            Err(err) => warn!(?err, "admission.cookie_invalid"),
        }
    }
    response
}
