use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{error, info, warn};

mod api;
mod app_state;
mod archive;
mod auth;
mod builtins;
mod capability;
mod command;
mod config;
mod dispatch;
mod error;
mod events;
mod exec;
mod rate_limit;
mod router;
mod secret;
mod security;
mod store;
#[cfg(test)]
mod test_support;
mod util;
mod validate;

use app_state::AppState;
use config::ServerConfig;

/// How often stale staged archives are reaped.
const HOUSEKEEPING_EVERY: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() {
    foundry_otel::init();

    let config = match ServerConfig::load() {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(2);
        }
    };
    let addr = match config.listen_addr() {
        Ok(addr) => addr,
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(2);
        }
    };

    if let Err(err) = run(config, addr).await {
        error!("agent exited with error: {err:#}");
        std::process::exit(1);
    }
}

async fn run(config: ServerConfig, addr: SocketAddr) -> anyhow::Result<()> {
    util::private_dir(&config.state_dir)
        .await
        .with_context(|| format!("creating state dir {}", config.state_dir.display()))?;
    let state = AppState::build(config, Arc::new(util::SystemClock))?;
    info!(
        app_root = %state.config().app_root.display(),
        state_dir = %state.config().state_dir.display(),
        tool = %state.config().wp_bin,
        "foundry agent starting"
    );
    // Resolve the secret now so a fresh install writes it before the first request.
    let fingerprint = state.secrets().fingerprint().await;
    info!(
        fingerprint = %fingerprint,
        path = %state.config().secret_path().display(),
        "shared secret ready"
    );

    let housekeeping = tokio::spawn(housekeeping(state.clone()));
    let (app, endpoints) = router::build_router(state);
    info!(routes = ?endpoints, "routes registered");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    housekeeping.abort();
    info!("agent stopped");
    Ok(())
}

async fn housekeeping(state: AppState) {
    let mut tick = tokio::time::interval(HOUSEKEEPING_EVERY);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        state.archives().sweep().await;
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
            }
            Err(err) => {
                warn!("SIGTERM handler unavailable: {err}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("shutdown signal received");
}
