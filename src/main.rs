use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::{watch, Mutex};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use voicebridge::assets::AssetResolver;
use voicebridge::control;
use voicebridge::http::{self, AppState};
use voicebridge::paths::{Cli, Paths};
use voicebridge::registry::Registry;
use voicebridge::session::{self, Session};
use voicebridge_config::PersistedConfig;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(cli.log_level.clone()))
        .init();

    let paths = Paths::resolve(&cli);
    if let Err(e) = paths.ensure_dirs() {
        error!(error = %e, "failed to create daemon directories");
        std::process::exit(1);
    }

    let config = PersistedConfig::load(&paths.config_path).unwrap_or_else(|e| {
        error!(error = %e, "failed to load config, starting from defaults");
        PersistedConfig::default()
    });

    let registry = Arc::new(Mutex::new(Registry::new(config, paths.config_path.clone())));
    let session = Session::new();
    let assets = AssetResolver::new(paths.user_assets_dir.clone(), paths.default_assets_dir.clone());

    let http_addr: SocketAddr = match cli.http_addr.parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!(error = %e, addr = %cli.http_addr, "invalid --http-addr");
            std::process::exit(1);
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let session_task = tokio::spawn(session::run(
        session.clone(),
        registry.clone(),
        paths.clone(),
        shutdown_rx.clone(),
    ));

    let app_state = AppState {
        registry: registry.clone(),
        session: session.clone(),
        assets: assets.clone(),
    };
    let http_task = tokio::spawn(http::serve(app_state, paths.clone(), http_addr, shutdown_rx.clone()));

    let control_task = tokio::spawn(control::serve(
        registry.clone(),
        session.clone(),
        assets.clone(),
        paths.clone(),
        cli.http_addr.clone(),
        shutdown_rx.clone(),
    ));

    info!(http_addr = %cli.http_addr, socket = %paths.control_socket_path.display(), "voicebridged started");
    shutdown_signal().await;
    let _ = shutdown_tx.send(true);

    let _ = session_task.await;
    let _ = http_task.await;
    let _ = control_task.await;
    info!("voicebridged shut down gracefully");
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
