use std::net::SocketAddr;

use clap::Parser;
use color_eyre::{Result, eyre::Context};
use tap::Pipe;
use tokio::signal;
use tracing::info;
use turnstile::{
    api::{self, AppState},
    config::{Cli, Command, Config, StoreBackend},
    keys::{EncodedKeypair, Keypair},
    store::{Memory, Redis, Store},
    telemetry,
};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    color_eyre::install()?;

    match cli.command {
        Command::Serve(config) => {
            telemetry::init(config.log_level.into());
            serve(config).await
        }
        Command::Keygen => keygen(),
    }
}

async fn serve(config: Config) -> Result<()> {
    // Invalid key material must stop the process before it binds.
    let keypair = Keypair::decode(&config.keys.private, &config.keys.public)
        .context("decode signing keypair")?;

    let store = match config.store.backend {
        StoreBackend::Redis => Redis::connect(&config.store.redis())
            .await
            .context("connect rate limit store")?
            .pipe(Store::from),
        StoreBackend::Memory => {
            tracing::warn!("store.memory: rate limits are local to this process");
            let memory = Memory::new();
            memory.spawn_sweeper(config.limits.window);
            Store::from(memory)
        }
    };

    let state = AppState::new(
        keypair,
        store,
        config.limits.limits(),
        config.limits.fail_mode,
        config.limits.store_timeout,
    );
    let app = api::router(state);

    let addr = config.addr()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(
        addr = %listener.local_addr()?,
        fail_mode = %config.limits.fail_mode,
        "server.listening"
    );

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("serve")?;

    info!("server.stopped");
    Ok(())
}

fn keygen() -> Result<()> {
    let keypair = EncodedKeypair::generate().context("generate keypair")?;
    println!("SECRET_JWT_PRIVATE_KEY={}", keypair.private);
    println!("SECRET_JWT_PUBLIC_KEY={}", keypair.public);
    Ok(())
}

/// Resolves on SIGINT or SIGTERM; in-flight requests are then drained.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!(?err, "server.signal_handler_failed");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => tracing::error!(?err, "server.signal_handler_failed"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!(signal = "SIGINT", "server.shutdown"),
        _ = terminate => info!(signal = "SIGTERM", "server.shutdown"),
    }
}
