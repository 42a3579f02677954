//! Shared counter store holding rate limit windows.
//!
//! Each rate limit key maps to an ordered collection of hits scored by their
//! millisecond timestamp. A check runs as one atomic unit against the store:
//!
//! 1. Remove hits scored in `[0, window_start]`.
//! 2. Count the remaining hits.
//! 3. Record the current hit.
//! 4. Reset the key's expiry to the window length.
//!
//! The store is the only place rate limit state lives, which is what lets
//! many instances of the service enforce one quota.
//!
//! Two backends share this contract:
//! - [`Redis`]: production. One `MULTI/EXEC` pipeline per check.
//! - [`Memory`]: tests and single-process development.

use std::{collections::BTreeSet, path::PathBuf, sync::Arc, time::Duration};

use color_eyre::{
    Result,
    eyre::{Context, bail, eyre},
};
use dashmap::DashMap;
use derive_more::Debug;
use redis::{AsyncCommands, IntoConnectionInfo, TlsCertificates, aio::ConnectionManager};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, info};

use crate::rate_limit::now_ms;

/// A single request occurrence being recorded against a rate limit key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Hit {
    /// The rate limit key, e.g. `limit:app:<uid>`.
    pub key: String,

    /// Unique member identifying this occurrence within the window.
    pub member: String,

    /// Score of this hit: milliseconds since the Unix epoch.
    pub now_ms: i64,

    /// Hits scored at or below this value have left the window.
    pub window_start_ms: i64,

    /// Window length, also used as the key's expiry.
    pub window_ms: i64,
}

impl Hit {
    /// Build a hit for `key` at `now_ms` against a window of `window`.
    pub fn new(key: impl Into<String>, now_ms: i64, window: Duration) -> Self {
        let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
        Self {
            key: key.into(),
            member: format!("{now_ms}-{}", uuid::Uuid::new_v4()),
            now_ms,
            window_start_ms: now_ms.saturating_sub(window_ms),
            window_ms,
        }
    }
}

/// Connection settings for the Redis backend.
#[derive(Clone, Debug)]
pub struct RedisConfig {
    /// `host:port` of the Redis server.
    pub addr: String,

    #[debug(skip)]
    pub password: Option<String>,

    /// Connect with TLS.
    pub tls: bool,

    /// CA certificate (PEM) used to verify the server when TLS is enabled.
    pub ca_cert_path: Option<PathBuf>,
}

/// The shared store, selected at startup.
#[derive(Clone, Debug)]
pub enum Store {
    Redis(Redis),
    Memory(Memory),

    /// Answers every call with an error.
    #[cfg(test)]
    Failing,

    /// Never answers.
    #[cfg(test)]
    Stalled,
}

impl Store {
    /// Run the window transaction for `hit`, returning how many hits were
    /// already in the window before it was recorded.
    pub async fn record(&self, hit: &Hit) -> Result<u64> {
        match self {
            Store::Redis(redis) => redis.record(hit).await,
            Store::Memory(memory) => Ok(memory.record(hit)),
            #[cfg(test)]
            Store::Failing => Err(eyre!("connection refused")),
            #[cfg(test)]
            Store::Stalled => std::future::pending().await,
        }
    }

    /// Remove a hit recorded by [`Store::record`].
    ///
    /// Used when the hit was over the limit, so that rejected requests do not
    /// occupy space in the window.
    pub async fn retract(&self, hit: &Hit) -> Result<()> {
        match self {
            Store::Redis(redis) => redis.retract(hit).await,
            Store::Memory(memory) => {
                memory.retract(hit);
                Ok(())
            }
            #[cfg(test)]
            Store::Failing => Err(eyre!("connection refused")),
            #[cfg(test)]
            Store::Stalled => std::future::pending().await,
        }
    }

    /// Check that the store is reachable.
    pub async fn ping(&self) -> Result<()> {
        match self {
            Store::Redis(redis) => redis.ping().await,
            Store::Memory(_) => Ok(()),
            #[cfg(test)]
            Store::Failing => Err(eyre!("connection refused")),
            #[cfg(test)]
            Store::Stalled => std::future::pending().await,
        }
    }
}

impl From<Redis> for Store {
    fn from(redis: Redis) -> Self {
        Store::Redis(redis)
    }
}

impl From<Memory> for Store {
    fn from(memory: Memory) -> Self {
        Store::Memory(memory)
    }
}

/// A connected Redis instance.
#[derive(Clone, Debug)]
#[debug("Redis(..)")]
pub struct Redis {
    conn: ConnectionManager,
}

impl Redis {
    const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

    /// Connect to Redis and confirm it answers a ping.
    #[tracing::instrument(name = "Redis::connect")]
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let scheme = if config.tls { "rediss" } else { "redis" };
        let mut info = format!("{scheme}://{}", config.addr)
            .into_connection_info()
            .with_context(|| format!("parse redis address {:?}", config.addr))?;
        info.redis.password = config.password.clone();

        let client = match (&config.ca_cert_path, config.tls) {
            (Some(path), true) => {
                let root_cert = tokio::fs::read(path)
                    .await
                    .with_context(|| format!("read redis CA cert {path:?}"))?;
                let certs = TlsCertificates {
                    client_tls: None,
                    root_cert: Some(root_cert),
                };
                redis::Client::build_with_tls(info, certs).context("build redis TLS client")?
            }
            (Some(_), false) => bail!("redis CA cert configured but TLS is disabled"),
            (None, _) => redis::Client::open(info).context("build redis client")?,
        };

        let conn = tokio::time::timeout(Self::CONNECT_TIMEOUT, ConnectionManager::new(client))
            .await
            .map_err(|_| eyre!("connect to redis: timed out"))?
            .context("connect to redis")?;

        let redis = Self { conn };
        tokio::time::timeout(Self::CONNECT_TIMEOUT, redis.ping())
            .await
            .map_err(|_| eyre!("ping redis: timed out"))??;

        info!(addr = %config.addr, tls = config.tls, "redis.connected");
        Ok(redis)
    }

    #[tracing::instrument(name = "Redis::record", skip(self))]
    async fn record(&self, hit: &Hit) -> Result<u64> {
        let mut conn = self.conn.clone();
        let (count,): (u64,) = redis::pipe()
            .atomic()
            .zrembyscore(&hit.key, 0, hit.window_start_ms)
            .ignore()
            .zcard(&hit.key)
            .zadd(&hit.key, &hit.member, hit.now_ms)
            .ignore()
            .pexpire(&hit.key, hit.window_ms)
            .ignore()
            .query_async(&mut conn)
            .await
            .context("run rate limit window transaction")?;
        debug!(key = %hit.key, count, "redis.window");
        Ok(count)
    }

    #[tracing::instrument(name = "Redis::retract", skip(self))]
    async fn retract(&self, hit: &Hit) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .zrem(&hit.key, &hit.member)
            .await
            .context("retract rejected hit")?;
        Ok(())
    }

    #[tracing::instrument(name = "Redis::ping", skip(self))]
    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let pong = redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .context("ping redis")?;
        if pong != "PONG" {
            bail!("redis ping failed; unexpected response: {pong:?}");
        }
        Ok(())
    }
}

/// In-process store with the same window semantics as [`Redis`].
///
/// State is local to this process, so this backend only enforces correct
/// quotas when a single instance is serving traffic. Windows whose expiry has
/// passed are dropped on access and by [`Memory::sweep`]; long-running
/// processes should run [`Memory::spawn_sweeper`] so that keys for callers
/// who never return are reclaimed.
#[derive(Clone, Debug, Default)]
#[debug("Memory(keys = {})", self.windows.len())]
pub struct Memory {
    windows: Arc<DashMap<String, Window>>,
}

#[derive(Debug, Default)]
struct Window {
    hits: BTreeSet<(i64, String)>,
    expires_at_ms: i64,
}

impl Memory {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, hit: &Hit) -> u64 {
        // The entry guard holds the shard lock, making this block atomic
        // with respect to other callers on the same key.
        let mut window = self.windows.entry(hit.key.clone()).or_default();
        if window.expires_at_ms <= hit.now_ms {
            window.hits.clear();
        }
        window
            .hits
            .retain(|(score, _)| *score > hit.window_start_ms);

        let count = window.hits.len() as u64;
        window.hits.insert((hit.now_ms, hit.member.clone()));
        window.expires_at_ms = hit.now_ms.saturating_add(hit.window_ms);
        count
    }

    fn retract(&self, hit: &Hit) {
        if let Some(mut window) = self.windows.get_mut(&hit.key) {
            window.hits.remove(&(hit.now_ms, hit.member.clone()));
        }
    }

    /// Drop every window that expired at or before `now_ms`, returning how
    /// many were removed.
    pub fn sweep(&self, now_ms: i64) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, window| window.expires_at_ms > now_ms);
        before.saturating_sub(self.windows.len())
    }

    /// Sweep expired windows every `every` until the returned task is
    /// aborted.
    pub fn spawn_sweeper(&self, every: Duration) -> JoinHandle<()> {
        let memory = self.clone();
        let every = every.max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let removed = memory.sweep(now_ms());
                if removed > 0 {
                    debug!(removed, remaining = memory.key_count(), "memory.sweep");
                }
            }
        })
    }

    /// Number of keys currently held, expired or not.
    pub fn key_count(&self) -> usize {
        self.windows.len()
    }

    /// Number of hits currently stored for `key`, ignoring expiry.
    pub fn len(&self, key: &str) -> usize {
        self.windows
            .get(key)
            .map(|window| window.hits.len())
            .unwrap_or_default()
    }

    pub fn is_empty(&self, key: &str) -> bool {
        self.len(key) == 0
    }
}
