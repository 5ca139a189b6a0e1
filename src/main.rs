use std::time::Duration;

use clap::Parser;
use tokio::{
    net::TcpListener,
    signal::unix::{SignalKind, signal},
    sync::broadcast,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use turnstile::{
    Turnstile,
    config::AppConfig,
    server::{AppState, build_router},
};

#[derive(Parser, Debug)]
#[command(
    name = "turnstile",
    about = "An in-memory key-value store with queued advisory locks, served over HTTP."
)]
struct Args {
    /// Path to the JSON configuration file.
    #[arg(long, default_value = "turnstile.conf.json")]
    config: String,

    /// Print the effective configuration and exit.
    #[arg(long)]
    show_config: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let config = AppConfig::load(&args.config);

    let default_directives = if config.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_directives)),
        )
        .init();

    if args.show_config {
        println!("{config:#?}");
        return;
    }

    info!("======== application start ========");
    info!(?config, "configuration loaded");

    let turnstile = Turnstile::launch(&config);
    let state = AppState::new(&turnstile, config.acquire_timeout());
    let app = build_router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .expect("could not bind http listener");
    info!(%addr, "listening for http connections");

    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(turnstile.stop_signal()))
        .await
    {
        error!(%err, "http server failed");
    }

    // Let the dispatcher tasks finish logging their shutdown.
    tokio::time::sleep(Duration::from_millis(250)).await;
    info!("======== application exit ========");
}

/// Resolves once SIGINT or SIGTERM arrives, closing the stop channel so
/// the dispatcher tasks exit alongside the http server.
async fn shutdown_signal(stop: broadcast::Sender<()>) {
    let mut sigterm = signal(SignalKind::terminate()).expect("could not install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("SIGINT received, shutting down"),
        _ = sigterm.recv() => info!("SIGTERM received, shutting down"),
    }
    let _ = stop.send(());
}
