//! Live WebSocket session registry and push endpoints.
//!
//! One process-local map of client id → outbound channel. Each socket gets a
//! single writer task draining its channel, so messages to one peer are
//! serialized while different peers proceed in parallel. Delivery is
//! best-effort, at-most-once, in order per peer.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use medpulse_core::auth::{verify_token, AuthError};
use medpulse_core::ApiResponse;

use crate::state::AppState;

/// Policy violation (bad/expired token).
const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// Internal error during authentication.
const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Outbound queue depth per peer before sends start waiting.
const PEER_BUFFER: usize = 32;

// ── Registry ─────────────────────────────────────────────────

#[derive(Default)]
pub struct ConnectionRegistry {
    peers: RwLock<HashMap<String, mpsc::Sender<Message>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `client_id` to an outbound channel. A reconnect under the same
    /// id replaces the previous binding; the stale writer task ends when its
    /// channel closes.
    pub async fn register(&self, client_id: &str, tx: mpsc::Sender<Message>) {
        let previous = self.peers.write().await.insert(client_id.to_string(), tx);
        if previous.is_some() {
            debug!(client_id = %client_id, "replaced existing connection");
        }
    }

    /// Remove the binding. Driven by the read loop only.
    pub async fn unregister(&self, client_id: &str) {
        self.peers.write().await.remove(client_id);
    }

    pub async fn is_connected(&self, client_id: &str) -> bool {
        self.peers.read().await.contains_key(client_id)
    }

    pub async fn connected_count(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Directed send. `false` when the peer is absent or its connection has
    /// gone away; the message is dropped, never queued for later.
    pub async fn send_to(&self, client_id: &str, text: &str) -> bool {
        let tx = { self.peers.read().await.get(client_id).cloned() };
        match tx {
            Some(tx) => tx.send(Message::Text(text.to_string().into())).await.is_ok(),
            None => false,
        }
    }

    /// Broadcast over a snapshot of the registry. Peers that error are
    /// skipped, not removed — removal is the read loop's job.
    pub async fn broadcast(&self, text: &str) {
        let snapshot: Vec<(String, mpsc::Sender<Message>)> = {
            self.peers
                .read()
                .await
                .iter()
                .map(|(id, tx)| (id.clone(), tx.clone()))
                .collect()
        };
        for (client_id, tx) in snapshot {
            if tx
                .send(Message::Text(text.to_string().into()))
                .await
                .is_err()
            {
                debug!(client_id = %client_id, "skipping dead peer during broadcast");
            }
        }
    }
}

// ── WebSocket endpoint ───────────────────────────────────────

#[derive(Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

/// Peer-to-peer relay frame accepted on the socket.
#[derive(Deserialize)]
struct RelayFrame {
    to: String,
    content: String,
}

pub async fn ws_endpoint(
    ws: WebSocketUpgrade,
    Path(client_id): Path<String>,
    Query(query): Query<WsQuery>,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, client_id, query.token, state))
}

/// Token check for the upgrade flow. Err carries the close code.
fn authenticate(state: &AppState, token: Option<&str>) -> Result<i64, u16> {
    let Some(token) = token else {
        return Err(CLOSE_POLICY_VIOLATION);
    };
    match verify_token(&state.config.jwt, token) {
        Ok(user_id) => Ok(user_id),
        Err(AuthError::Expired) | Err(AuthError::Invalid(_)) => Err(CLOSE_POLICY_VIOLATION),
        Err(AuthError::UnsupportedAlgorithm(_)) => Err(CLOSE_INTERNAL_ERROR),
    }
}

async fn handle_socket(
    mut socket: WebSocket,
    client_id: String,
    token: Option<String>,
    state: Arc<AppState>,
) {
    let user_id = match authenticate(&state, token.as_deref()) {
        Ok(user_id) => user_id,
        Err(code) => {
            // The registry is never touched for a failed authentication.
            warn!(client_id = %client_id, code, "ws authentication failed");
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code,
                    reason: "authentication failed".into(),
                })))
                .await;
            return;
        }
    };

    info!(client_id = %client_id, user_id, "ws connected");

    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(PEER_BUFFER);
    state.registry.register(&client_id, tx.clone()).await;

    // Single writer per socket: everything outbound funnels through the
    // channel, which is what serializes concurrent sends to this peer.
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(msg).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => {
                let echo = format!("you sent: {text}");
                if tx.send(Message::Text(echo.into())).await.is_err() {
                    break;
                }
                // Frames shaped {to, content} are relayed to the target peer.
                if let Ok(frame) = serde_json::from_str::<RelayFrame>(text.as_str()) {
                    let payload = serde_json::json!({
                        "to": frame.to,
                        "content": frame.content,
                    })
                    .to_string();
                    if !state.registry.send_to(&frame.to, &payload).await {
                        debug!(to = %frame.to, "relay target not connected, dropped");
                    }
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    state.registry.unregister(&client_id).await;
    drop(tx);
    let _ = writer.await;
    state
        .registry
        .broadcast(&format!("client #{client_id} left"))
        .await;
    info!(client_id = %client_id, "ws disconnected");
}

// ── Push endpoints ───────────────────────────────────────────

#[derive(Deserialize)]
pub struct PushRequest {
    pub message: String,
}

pub async fn ws_send(
    State(state): State<Arc<AppState>>,
    Path(client_id): Path<String>,
    Json(req): Json<PushRequest>,
) -> Response {
    if state.registry.send_to(&client_id, &req.message).await {
        Json(ApiResponse::ok(serde_json::json!({
            "message": "Message sent",
            "client_id": client_id,
        })))
        .into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::<()>::err(404, "client not connected")),
        )
            .into_response()
    }
}

pub async fn ws_broadcast(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PushRequest>,
) -> Json<ApiResponse<serde_json::Value>> {
    state.registry.broadcast(&req.message).await;
    Json(ApiResponse::ok(serde_json::json!({
        "message": "Broadcast sent",
        "clients": state.registry.connected_count().await,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registry_entry_lifecycle() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::channel(4);

        registry.register("a", tx).await;
        assert!(registry.is_connected("a").await);
        assert_eq!(registry.connected_count().await, 1);

        registry.unregister("a").await;
        assert!(!registry.is_connected("a").await);
        assert_eq!(registry.connected_count().await, 0);
    }

    #[tokio::test]
    async fn directed_send_reaches_only_target() {
        let registry = ConnectionRegistry::new();
        let (tx_a, mut rx_a) = mpsc::channel(4);
        let (tx_b, mut rx_b) = mpsc::channel(4);
        registry.register("a", tx_a).await;
        registry.register("b", tx_b).await;

        assert!(registry.send_to("b", "hi").await);

        let received = rx_b.recv().await.unwrap();
        assert!(matches!(received, Message::Text(t) if t.as_str() == "hi"));
        assert!(rx_a.try_recv().is_err(), "peer a receives nothing");
    }

    #[tokio::test]
    async fn send_to_absent_peer_reports_false() {
        let registry = ConnectionRegistry::new();
        assert!(!registry.send_to("ghost", "hello?").await);
    }

    #[tokio::test]
    async fn send_to_dead_peer_reports_false() {
        let registry = ConnectionRegistry::new();
        let (tx, rx) = mpsc::channel(4);
        registry.register("a", tx).await;
        drop(rx);
        assert!(!registry.send_to("a", "anyone?").await);
    }

    #[tokio::test]
    async fn broadcast_skips_dead_peer_without_removal() {
        let registry = ConnectionRegistry::new();
        let (tx_live, mut rx_live) = mpsc::channel(4);
        let (tx_dead, rx_dead) = mpsc::channel(4);
        registry.register("live", tx_live).await;
        registry.register("dead", tx_dead).await;
        drop(rx_dead);

        registry.broadcast("to everyone").await;

        let received = rx_live.recv().await.unwrap();
        assert!(matches!(received, Message::Text(t) if t.as_str() == "to everyone"));
        // Removal is the read loop's job, not broadcast's.
        assert!(registry.is_connected("dead").await);
    }

    #[tokio::test]
    async fn messages_to_one_peer_stay_ordered() {
        let registry = ConnectionRegistry::new();
        let (tx, mut rx) = mpsc::channel(8);
        registry.register("a", tx).await;

        for i in 0..5 {
            assert!(registry.send_to("a", &format!("msg-{i}")).await);
        }
        for i in 0..5 {
            let received = rx.recv().await.unwrap();
            assert!(matches!(received, Message::Text(t) if t.as_str() == format!("msg-{i}")));
        }
    }
}
