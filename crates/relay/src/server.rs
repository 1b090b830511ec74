//! Process composition: shared [`RelayState`] plus the dual-port bind (§6 —
//! WebSocket on `ws_port`, REST on `ws_port + 1`).

use std::sync::Arc;

use agora_config::RelayConfig;
use anyhow::Context;
use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::registry::Registry;
use crate::signing::{Ed25519Verifier, Verifier};
use crate::ws::ws_upgrade_handler;

pub struct RelayState {
    pub config: RelayConfig,
    pub registry: Arc<Registry>,
    pub verifier: Arc<dyn Verifier>,
}

impl RelayState {
    pub fn new(config: RelayConfig) -> Arc<Self> {
        let registry = Registry::new(config.buffer_capacity);
        Arc::new(Self { config, registry, verifier: Arc::new(Ed25519Verifier) })
    }
}

/// Binds and serves both listeners concurrently. Returns only on error or
/// when one of the servers is shut down (they're run with `tokio::select!`,
/// so either exiting ends the pair).
pub async fn run(state: Arc<RelayState>) -> anyhow::Result<()> {
    let ws_addr = format!("{}:{}", state.config.bind_host, state.config.ws_port);
    let rest_addr = format!("{}:{}", state.config.bind_host, state.config.ws_port + 1);

    let ws_router = Router::new().route("/v1/ws", get(ws_upgrade_handler)).with_state(state.clone());

    let rest_router = crate::routes::router(state.clone()).layer(CorsLayer::permissive());

    let ws_listener = tokio::net::TcpListener::bind(&ws_addr).await.context("binding websocket listener")?;
    let rest_listener = tokio::net::TcpListener::bind(&rest_addr).await.context("binding rest listener")?;

    info!(%ws_addr, %rest_addr, "relay listening");

    let ws_server = axum::serve(ws_listener, ws_router);
    let rest_server = axum::serve(rest_listener, rest_router);

    tokio::select! {
        result = ws_server => result.context("websocket server exited"),
        result = rest_server => result.context("rest server exited"),
    }
}
