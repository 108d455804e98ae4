//! Per-node connection ownership and local fan-out.
//!
//! The hub owns every open socket on this node. Each socket gets a UUID
//! client id, a handshake frame on accept, and a bounded mailbox drained
//! by a dedicated writer task so fan-out loops never block on a slow
//! consumer.
//!
//! Backpressure policy: awareness traffic is droppable (idempotent by
//! latest), so an overflowing mailbox sheds it. Content, membership, and
//! termination frames are never shed — if one cannot be queued the socket
//! is beyond saving and gets closed instead.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;
use weft_sdk::protocol::{self, Request, Response};

use crate::commands;
use crate::server::SharedState;

/// Per-socket mailbox depth.
const MAILBOX_CAPACITY: usize = 256;

/// Inbound frames larger than this are rejected without parsing.
const MAX_FRAME_LEN: usize = 1024 * 1024;

/// A frame queued for a socket.
pub struct Outbound {
    pub payload: String,
    /// Shed on overflow instead of killing the socket.
    pub droppable: bool,
}

/// Role assigned at `/auth`, per connection — not per user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Owner,
    Editor,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Owner => "owner",
            Role::Editor => "editor",
        }
    }
}

/// Authenticated binding of a socket to a session.
#[derive(Debug, Clone)]
pub struct AuthBinding {
    pub document_id: String,
    pub session_did: String,
    pub role: Role,
}

struct ClientHandle {
    tx: mpsc::Sender<Outbound>,
    auth: Option<AuthBinding>,
}

/// The set of open client sockets on this node.
pub struct ConnectionHub {
    connections: Mutex<HashMap<String, ClientHandle>>,
}

impl ConnectionHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            connections: Mutex::new(HashMap::new()),
        })
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    fn insert(&self, client_id: &str, tx: mpsc::Sender<Outbound>) {
        self.connections.lock().insert(
            client_id.to_string(),
            ClientHandle { tx, auth: None },
        );
    }

    fn remove(&self, client_id: &str) -> Option<AuthBinding> {
        self.connections
            .lock()
            .remove(client_id)
            .and_then(|h| h.auth)
    }

    /// Record a successful `/auth` on the socket. Role is recomputed on
    /// every auth, never on later commands.
    pub fn bind_auth(&self, client_id: &str, binding: AuthBinding) {
        if let Some(handle) = self.connections.lock().get_mut(client_id) {
            handle.auth = Some(binding);
        }
    }

    pub fn auth_binding(&self, client_id: &str) -> Option<AuthBinding> {
        self.connections
            .lock()
            .get(client_id)
            .and_then(|h| h.auth.clone())
    }

    /// Queue a frame for one socket. Returns false if the socket is gone
    /// or was closed for overflow.
    pub fn send_to(&self, client_id: &str, payload: &str, droppable: bool) -> bool {
        let overflowed = {
            let conns = self.connections.lock();
            let Some(handle) = conns.get(client_id) else {
                return false;
            };
            match handle.tx.try_send(Outbound {
                payload: payload.to_string(),
                droppable,
            }) {
                Ok(()) => return true,
                Err(mpsc::error::TrySendError::Full(out)) if out.droppable => {
                    tracing::debug!(client_id, "mailbox full, shedding droppable frame");
                    return true;
                }
                Err(_) => true,
            }
        };
        if overflowed {
            // Undeliverable critical frame: drop the handle so the writer
            // task ends and closes the socket.
            tracing::warn!(client_id, "mailbox overflow on critical frame, closing socket");
            self.connections.lock().remove(client_id);
        }
        false
    }

    /// Local delivery for a broadcast: filter the session's client set to
    /// sockets that live on this node and queue the payload on each.
    pub fn deliver(
        &self,
        candidate_clients: &[String],
        payload: &str,
        exclude_client_id: Option<&str>,
        droppable: bool,
    ) {
        for client_id in candidate_clients {
            if Some(client_id.as_str()) == exclude_client_id {
                continue;
            }
            // Ids with no socket here belong to other nodes.
            self.send_to(client_id, payload, droppable);
        }
    }

    /// Drop every socket (graceful shutdown).
    pub fn close_all(&self) {
        self.connections.lock().clear();
    }
}

/// Drive one accepted WebSocket until it closes.
pub async fn handle_socket(socket: WebSocket, state: Arc<SharedState>) {
    let client_id = Uuid::new_v4().to_string();
    tracing::info!(%client_id, "connection accepted");

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Handshake goes out before anything else, directly on the sink.
    let handshake = serde_json::to_string(&Response::handshake(&state.server_did))
        .expect("handshake serialization is infallible");
    if ws_tx.send(Message::Text(handshake.into())).await.is_err() {
        return;
    }

    let (tx, mut rx) = mpsc::channel::<Outbound>(MAILBOX_CAPACITY);
    state.hub.insert(&client_id, tx);

    // Writer task: the only owner of the sink, so sends never race.
    let writer_id = client_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(out) = rx.recv().await {
            if let Err(e) = ws_tx.send(Message::Text(out.payload.into())).await {
                tracing::debug!(client_id = %writer_id, "write failed: {e}");
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    // Read loop: frames from one socket are processed sequentially.
    while let Some(frame) = ws_rx.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                if text.len() > MAX_FRAME_LEN {
                    let reply =
                        Response::error(None, protocol::STATUS_BAD_REQUEST, "frame too large");
                    send_reply(&state, &client_id, &reply);
                    continue;
                }
                match serde_json::from_str::<Request>(&text) {
                    Ok(request) => {
                        commands::dispatch(&state, &client_id, request).await;
                    }
                    Err(e) => {
                        tracing::debug!(%client_id, "malformed frame: {e}");
                        let reply = Response::error(
                            None,
                            protocol::STATUS_BAD_REQUEST,
                            "malformed request frame",
                        );
                        send_reply(&state, &client_id, &reply);
                    }
                }
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {} // ping/pong handled by axum
        }
    }

    disconnect_cleanup(&state, &client_id);
    writer.abort();
    tracing::info!(%client_id, "connection closed");
}

/// Serialize and queue a sequenced reply (never droppable).
pub fn send_reply(state: &SharedState, client_id: &str, reply: &Response) {
    match serde_json::to_string(reply) {
        Ok(json) => {
            state.hub.send_to(client_id, &json, false);
        }
        Err(e) => tracing::error!(client_id, "reply serialization failed: {e}"),
    }
}

/// Runs when a socket closes for any reason: announce the departure to the
/// room (before removing the client, excluding the leaver so it gets no
/// farewell of its own), then release session membership and the handle.
fn disconnect_cleanup(state: &SharedState, client_id: &str) {
    if let Some(auth) = state.hub.auth_binding(client_id) {
        let farewell = weft_sdk::protocol::EventEnvelope::new(
            protocol::EVENT_ROOM_MEMBERSHIP_CHANGE,
            &auth.document_id,
            serde_json::json!({
                "action": "user_left",
                "clientId": client_id,
            }),
        );
        if let Ok(payload) = serde_json::to_string(&farewell) {
            state.sessions.broadcast_to_all_nodes(
                &auth.document_id,
                &auth.session_did,
                &payload,
                Some(client_id),
                false,
            );
        }
        state
            .sessions
            .remove_client_from_session(&auth.document_id, &auth.session_did, client_id);
    }
    state.hub.remove(client_id);
}
