use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{error, info};

use mercato_gateway::app;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mercato_gateway=info,tower_http=debug".into()),
        )
        .init();

    // load config: explicit path via MERCATO_CONFIG > ~/.mercato/mercato.toml
    let config_path = std::env::var("MERCATO_CONFIG").ok();
    let config =
        mercato_core::config::MercatoConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
            tracing::warn!("Config load failed ({}), using defaults", e);
            mercato_core::config::MercatoConfig::default()
        });

    let bind = config.gateway.bind.clone();
    let port = config.gateway.port;

    let (turn_tx, mut turn_rx) = mpsc::channel(256);
    let state = Arc::new(app::AppState::new(config, turn_tx)?);
    let router = app::build_router(state.clone());

    // Turn consumer: harmonized bursts come out of the buffer and run the
    // full agent pipeline, serialised per conversation by the orchestrator.
    let turn_state = state.clone();
    tokio::spawn(async move {
        while let Some(turn) = turn_rx.recv().await {
            let state = turn_state.clone();
            tokio::spawn(async move {
                if let Err(e) = state.orchestrator.process_turn(turn).await {
                    error!("turn processing failed: {e}");
                }
            });
        }
    });

    // Scheduler pool: consent/quiet-hour gated outbound dispatch.
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(state.dispatcher.clone().run(shutdown_rx));

    let addr: SocketAddr = format!("{}:{}", bind, port).parse()?;
    info!("Mercato gateway listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}
