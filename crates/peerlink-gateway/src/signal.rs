use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use peerlink_common::SignalingMessage;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

const WS_OUTBOX_CAPACITY: usize = 128;
const WS_MAX_TEXT_BYTES: usize = 64 * 1024;
const MAX_SIGNAL_SDP_BYTES: usize = 32 * 1024;
const MAX_SIGNAL_CANDIDATE_BYTES: usize = 4096;
const MAX_IDENTITY_BYTES: usize = 128;

static ACTIVE_WS_CONNECTIONS: AtomicUsize = AtomicUsize::new(0);
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// A registered connection. `id` tells a replaced registration apart from
/// the one that currently owns the identity.
#[derive(Clone)]
pub struct Peer {
    id: u64,
    tx: mpsc::Sender<Message>,
}

pub type ConnectionMap = Arc<RwLock<HashMap<String, Peer>>>;

pub fn active_connections() -> usize {
    ACTIVE_WS_CONNECTIONS.load(Ordering::Relaxed)
}

fn ws_connection_limit() -> usize {
    std::env::var("PEERLINK_GATEWAY_MAX_CONNECTIONS")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(4096)
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(connections): State<ConnectionMap>,
) -> impl IntoResponse {
    if active_connections() >= ws_connection_limit() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    ws.max_message_size(WS_MAX_TEXT_BYTES)
        .max_frame_size(WS_MAX_TEXT_BYTES)
        .on_upgrade(move |socket| handle_socket(socket, connections))
        .into_response()
}

async fn handle_socket(stream: WebSocket, connections: ConnectionMap) {
    let conn_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
    ACTIVE_WS_CONNECTIONS.fetch_add(1, Ordering::Relaxed);
    debug!(conn_id, "client connected");

    let (mut sender, mut receiver) = stream.split();
    let (tx, mut rx) = mpsc::channel::<Message>(WS_OUTBOX_CAPACITY);

    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(msg).await.is_err() {
                break;
            }
        }
    });

    let mut identity: Option<String> = None;

    while let Some(msg) = receiver.next().await {
        let Ok(msg) = msg else { break };

        let text = match msg {
            Message::Text(text) => text,
            Message::Binary(_) => {
                warn!(conn_id, "binary signaling frames are not supported");
                continue;
            }
            // Keep reading after a close frame so the close reply is flushed.
            Message::Close(_) | Message::Ping(_) | Message::Pong(_) => continue,
        };

        if text.len() > WS_MAX_TEXT_BYTES {
            warn!(conn_id, len = text.len(), "dropping oversized signaling frame");
            continue;
        }

        let message = match peerlink_common::decode(&text) {
            Ok(message) => message,
            Err(err) => {
                warn!(conn_id, "dropping undecodable signaling message: {}", err);
                continue;
            }
        };

        match message {
            SignalingMessage::Register { user_id } => {
                if user_id.is_empty() || user_id.len() > MAX_IDENTITY_BYTES {
                    warn!(conn_id, "rejecting invalid identity registration");
                    continue;
                }
                if let Some(previous) = identity.replace(user_id.clone()) {
                    if previous != user_id {
                        unbind(&connections, &previous, conn_id).await;
                    }
                }

                let replaced = connections.write().await.insert(
                    user_id.clone(),
                    Peer {
                        id: conn_id,
                        tx: tx.clone(),
                    },
                );
                if replaced.is_some_and(|peer| peer.id != conn_id) {
                    info!("registration for {} replaced by a newer connection", user_id);
                }
                info!(conn_id, "registered signaling identity {}", user_id);
            }
            SignalingMessage::Sdp {
                ref body,
                receiver: target,
                ..
            } => {
                if identity.is_none() {
                    warn!(conn_id, "dropping sdp from unregistered connection");
                    continue;
                }
                if body.len() > MAX_SIGNAL_SDP_BYTES {
                    warn!(conn_id, len = body.len(), "dropping oversized sdp");
                    continue;
                }
                relay_text(&connections, target.identity(), text).await;
            }
            SignalingMessage::Trickle {
                ref candidate,
                receiver: target,
                ..
            } => {
                if identity.is_none() {
                    warn!(conn_id, "dropping trickle from unregistered connection");
                    continue;
                }
                if candidate.candidate.len() > MAX_SIGNAL_CANDIDATE_BYTES {
                    warn!(conn_id, "dropping oversized candidate");
                    continue;
                }
                relay_text(&connections, target.identity(), text).await;
            }
        }
    }

    if let Some(user) = identity {
        info!("client disconnected: {}", user);
        unbind(&connections, &user, conn_id).await;
    }
    ACTIVE_WS_CONNECTIONS.fetch_sub(1, Ordering::Relaxed);
}

/// Remove `identity` only if this connection still owns it.
async fn unbind(connections: &ConnectionMap, identity: &str, conn_id: u64) {
    let mut guard = connections.write().await;
    if guard.get(identity).is_some_and(|peer| peer.id == conn_id) {
        guard.remove(identity);
    }
}

/// Forward the unmodified frame text to whoever is registered as `target`.
async fn relay_text(connections: &ConnectionMap, target: &str, text: String) {
    let tx = {
        let guard = connections.read().await;
        guard.get(target).map(|peer| peer.tx.clone())
    };
    match tx {
        Some(tx) => {
            if tx.try_send(Message::Text(text)).is_err() {
                warn!("failed to queue signaling message for {}", target);
            } else {
                debug!("relayed signaling message to {}", target);
            }
        }
        None => warn!("target not connected: {}", target),
    }
}
