//! Command line and environment configuration.

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::{Args, Parser, Subcommand, ValueEnum};
use color_eyre::{Result, eyre::Context};
use derive_more::Debug;
use jiff::SignedDuration;
use tracing::level_filters::LevelFilter;

use crate::{admission::FailMode, rate_limit::Limits, store::RedisConfig};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the API server.
    Serve(Config),

    /// Generate a fresh ES256 keypair, printed as base64-encoded PEM in
    /// `.env` format.
    Keygen,
}

#[derive(Args, Debug)]
pub struct Config {
    /// Host to bind to
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to listen on
    #[arg(long, env = "PORT", default_value = "8080")]
    pub port: u16,

    /// Default log level; `RUST_LOG` takes precedence when set
    #[arg(long, env = "LOG_LEVEL", value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    #[command(flatten)]
    pub keys: KeyArgs,

    #[command(flatten)]
    pub limits: LimitArgs,

    #[command(flatten)]
    pub store: StoreArgs,
}

impl Config {
    pub fn addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("parse listen address {}:{}", self.host, self.port))
    }
}

#[derive(Args, Debug)]
pub struct KeyArgs {
    /// Base64-encoded PEM EC private key used to sign tokens
    #[arg(long = "private-key", env = "SECRET_JWT_PRIVATE_KEY", hide_env_values = true)]
    #[debug(skip)]
    pub private: String,

    /// Base64-encoded PEM public key used to verify tokens
    #[arg(long = "public-key", env = "SECRET_JWT_PUBLIC_KEY", hide_env_values = true)]
    #[debug(skip)]
    pub public: String,
}

#[derive(Args, Debug, Clone)]
pub struct LimitArgs {
    /// Requests per window for callers with a verified token
    #[arg(long = "limit-normal", env = "RATE_LIMIT_CLIENT_NORMAL", default_value = "100")]
    pub normal: u64,

    /// Requests per window for anonymous callers
    #[arg(long = "limit-throttled", env = "RATE_LIMIT_CLIENT_THROTTLED", default_value = "20")]
    pub throttled: u64,

    /// Token issuance requests per window
    #[arg(long = "limit-auth", env = "RATE_LIMIT_AUTH", default_value = "5")]
    pub auth: u64,

    /// Requests per window across all callers
    #[arg(long = "limit-global", env = "RATE_LIMIT_GLOBAL", default_value = "10000")]
    pub global: u64,

    /// Sliding window length, e.g. `60`, `90s`, `1m`, `1.5h`
    #[arg(long = "limit-window", env = "RATE_LIMIT_WINDOW", default_value = "1m", value_parser = parse_window)]
    pub window: Duration,

    /// Whether to admit (`open`) or reject (`closed`) requests when the
    /// store is unavailable
    #[arg(long, env = "RATE_LIMIT_FAIL_MODE", value_enum, default_value_t = FailMode::Closed)]
    pub fail_mode: FailMode,

    /// Upper bound on each store call
    #[arg(long, env = "STORE_TIMEOUT", default_value = "2s", value_parser = parse_duration)]
    pub store_timeout: Duration,
}

impl LimitArgs {
    pub fn limits(&self) -> Limits {
        Limits {
            normal: self.normal,
            throttled: self.throttled,
            auth: self.auth,
            global: self.global,
            window: self.window,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct StoreArgs {
    /// Which store holds rate limit windows
    #[arg(long = "store", env = "STORE_BACKEND", value_enum, default_value_t = StoreBackend::Redis)]
    pub backend: StoreBackend,

    /// Redis address (`host:port`)
    #[arg(long, env = "REDIS_ADDR", default_value = "127.0.0.1:6379")]
    pub redis_addr: String,

    /// Redis password
    #[arg(long, env = "REDIS_PASSWORD", hide_env_values = true)]
    #[debug(skip)]
    pub redis_password: Option<String>,

    /// Connect to Redis over TLS
    #[arg(long, env = "REDIS_TLS")]
    pub redis_tls: bool,

    /// CA certificate used to verify the Redis server; requires TLS
    #[arg(long, env = "REDIS_CA_CERT_PATH")]
    pub redis_ca_cert_path: Option<PathBuf>,
}

impl StoreArgs {
    pub fn redis(&self) -> RedisConfig {
        RedisConfig {
            addr: self.redis_addr.clone(),
            password: self.redis_password.clone().filter(|p| !p.is_empty()),
            tls: self.redis_tls,
            ca_cert_path: self.redis_ca_cert_path.clone(),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum StoreBackend {
    /// Shared Redis instance; required when running more than one instance.
    Redis,

    /// In-process store; only correct for a single instance.
    Memory,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

/// Parse a duration such as `500ms`, `2s`, `1.5m`, `1h30m`, or a bare
/// integer number of seconds.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let input = input.trim();
    let friendly = if !input.is_empty() && input.bytes().all(|b| b.is_ascii_digit()) {
        format!("{input}s")
    } else {
        String::from(input)
    };
    let signed = friendly
        .parse::<SignedDuration>()
        .map_err(|err| format!("invalid duration {input:?}: {err}"))?;
    Duration::try_from(signed).map_err(|err| format!("invalid duration {input:?}: {err}"))
}

/// Parse a rate limit window. Windows are tracked in whole milliseconds, so
/// anything shorter is rejected.
pub fn parse_window(input: &str) -> Result<Duration, String> {
    match parse_duration(input)? {
        window if window.as_millis() == 0 => Err(format!(
            "invalid window {input:?}: must be at least 1ms"
        )),
        window => Ok(window),
    }
}
