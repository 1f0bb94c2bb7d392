//! Tunnel broker entry point.
//!
//! Starts the browser-facing HTTP/WebSocket surface. Per connection, the
//! browser authenticates with its own provider token, selects a workspace,
//! and the broker drives it through relay connect, port discovery, SSH
//! provisioning, and terminal streaming.

use std::sync::Arc;

use log::info;

use tunnel_broker::config;
use tunnel_broker::transport::{self, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    config::init();
    let cfg = config::get();
    info!("tunnel broker starting on port {}", cfg.port);

    let state = Arc::new(AppState::new(Arc::new(cfg.clone())));

    let app = transport::router(state);
    let addr = format!("0.0.0.0:{}", cfg.port);
    info!("listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
