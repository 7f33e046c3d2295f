//! Rendezvous signaling server.
//!
//! Peers connect to `/websocket`, register an identity and exchange `sdp`
//! and `trickle` messages addressed by role label. The server never looks
//! inside the SDP or candidate payloads beyond size checks.

pub mod signal;

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{FromRef, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::RwLock;

pub use signal::{ConnectionMap, Peer};

#[derive(Clone, FromRef)]
pub struct AppState {
    pub connections: ConnectionMap,
}

impl AppState {
    pub fn new() -> Self {
        Self {
            connections: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Serialize)]
struct HealthReport {
    active_ws_connections: usize,
    registered: Vec<String>,
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let mut registered: Vec<String> = state.connections.read().await.keys().cloned().collect();
    registered.sort();
    Json(HealthReport {
        active_ws_connections: signal::active_connections(),
        registered,
    })
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(|| async { "PeerLink Gateway Online" }))
        .route("/health", get(health))
        .route("/websocket", get(signal::ws_handler))
        .with_state(state)
}

/// Serve the gateway on an already bound listener until the task is dropped.
pub async fn serve(listener: TcpListener, state: AppState) -> std::io::Result<()> {
    axum::serve(listener, router(state)).await
}
