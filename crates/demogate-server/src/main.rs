mod api;
mod gateway;

use std::net::SocketAddr;
use std::path::PathBuf;

use axum::Router;
use axum::routing::{get, post};
use clap::Parser;
use libdemogate::{Broker, Config};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "demogate-server", about = "Single-concurrency demo session broker")]
struct Args {
    /// Path to the TOML config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the configured listen address.
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "demogate=info,demogate_server=info,libdemogate=info".into()),
        )
        .init();

    let args = Args::parse();
    let mut cfg = Config::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        cfg.listen = listen;
    }

    let listen = cfg.listen.clone();
    let cors = cors_layer(&cfg.cors_origins);
    let broker = Broker::new(cfg).await?;

    let app = Router::new()
        .route("/ws", get(gateway::ws_handler))
        .route("/api/status", get(api::status))
        .route("/api/session/validate", get(api::session_validate))
        .route("/api/session/cookie", post(api::cookie_set))
        .route("/api/invite/validate", get(api::invite_validate))
        .layer(cors)
        .with_state(broker.clone());

    let shutdown = CancellationToken::new();
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutting down...");
        shutdown_signal.cancel();
    });

    // Evict idle addresses from the rate-limit counters.
    let sweeper = broker.clone();
    let sweep_stop = shutdown.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(300));
        loop {
            tokio::select! {
                _ = tick.tick() => sweeper.limits.cleanup(),
                _ = sweep_stop.cancelled() => break,
            }
        }
    });

    let listener = tokio::net::TcpListener::bind(&listen).await?;
    info!(listen = %listen, "demogate-server started");

    let serve = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    );
    tokio::select! {
        result = serve => result?,
        _ = shutdown.cancelled() => {
            // Any live session ends with reason=shutdown before we exit;
            // open sockets are dropped rather than awaited.
            broker.shutdown().await;
        }
    }
    info!("server stopped");

    Ok(())
}

fn cors_layer(origins: &str) -> CorsLayer {
    if origins == "*" {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = origins
            .split(',')
            .filter_map(|origin| origin.trim().parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}
