//! Request/response handlers for the wire commands.
//!
//! One handler per command; each returns the reply payload or a
//! [`RelayError`] that maps onto the wire status code. Unknown commands
//! get 404. Frames from a single socket are dispatched sequentially by the
//! hub's read loop, so handlers never race against their own socket.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;
use weft_sdk::protocol::{
    self, EventEnvelope, Request, Response, CMD_AUTH, CMD_AWARENESS, CMD_COMMIT_HISTORY,
    CMD_DOCUMENT_COMMIT, CMD_DOCUMENT_UPDATE, CMD_PEERS_LIST, CMD_TERMINATE, CMD_UPDATE_HISTORY,
};

use crate::db::{self, CommitQuery, CommitRow, SortOrder, UpdateQuery, UpdateRow};
use crate::error::RelayError;
use crate::hub::{self, AuthBinding, Role};
use crate::server::SharedState;
use crate::session::SessionState;

/// Dispatch one parsed request and send the sequenced reply.
pub async fn dispatch(state: &Arc<SharedState>, client_id: &str, request: Request) {
    let seq_id = request.seq_id.clone();
    let result = match request.cmd.as_str() {
        CMD_AUTH => auth(state, client_id, request.args).await,
        CMD_DOCUMENT_UPDATE => document_update(state, client_id, request.args).await,
        CMD_DOCUMENT_COMMIT => document_commit(state, client_id, request.args).await,
        CMD_UPDATE_HISTORY => update_history(state, client_id, request.args),
        CMD_COMMIT_HISTORY => commit_history(state, client_id, request.args),
        CMD_PEERS_LIST => peers_list(state, client_id, request.args),
        CMD_AWARENESS => awareness(state, client_id, request.args),
        CMD_TERMINATE => terminate(state, client_id, request.args).await,
        other => Err(RelayError::NotFound(format!("no such command: {other}"))),
    };

    let reply = match result {
        Ok(data) => Response::ok(&seq_id, data),
        Err(e) => Response::error(Some(seq_id.as_str()), e.status_code(), &e.public_message()),
    };
    hub::send_reply(state, client_id, &reply);
}

fn parse_args<T: serde::de::DeserializeOwned>(args: serde_json::Value) -> Result<T, RelayError> {
    serde_json::from_value(args).map_err(|e| RelayError::BadRequest(format!("invalid arguments: {e}")))
}

fn require_auth(state: &SharedState, client_id: &str) -> Result<AuthBinding, RelayError> {
    state
        .hub
        .auth_binding(client_id)
        .ok_or_else(|| RelayError::Unauthorized("authentication required".into()))
}

/// All session-scoped commands must name the document their socket is
/// bound to.
fn require_document(auth: &AuthBinding, document_id: &str) -> Result<(), RelayError> {
    if auth.document_id != document_id {
        return Err(RelayError::Forbidden(
            "socket is bound to a different document".into(),
        ));
    }
    Ok(())
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ── /auth ──────────────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthArgs {
    document_id: Option<String>,
    session_did: Option<String>,
    collaboration_token: Option<String>,
    owner_token: Option<String>,
    contract_address: Option<String>,
    owner_address: Option<String>,
    room_info: Option<serde_json::Value>,
}

async fn auth(
    state: &Arc<SharedState>,
    client_id: &str,
    args: serde_json::Value,
) -> Result<serde_json::Value, RelayError> {
    let args: AuthArgs = parse_args(args)?;
    let document_id = args
        .document_id
        .filter(|s| !s.is_empty())
        .ok_or_else(|| RelayError::BadRequest("documentId is required".into()))?;
    let session_did = args
        .session_did
        .filter(|s| !s.is_empty())
        .ok_or_else(|| RelayError::BadRequest("sessionDid is required".into()))?;

    let existing = state.sessions.get_session(&document_id, &session_did);

    let (role, session_type, room_info) = match existing {
        // Live session: this is a join.
        Some(session) if session.state == SessionState::Active => {
            let token = args.collaboration_token.ok_or_else(|| {
                RelayError::Unauthorized("collaboration token required".into())
            })?;
            state
                .verifier
                .verify_collaboration_token(&token, &session.session_did)?;

            let mut role = Role::Editor;
            let mut room_info = session.room_info.clone();
            if let (Some(owner_token), Some(contract), Some(owner_addr)) = (
                args.owner_token.as_deref(),
                args.contract_address.as_deref(),
                args.owner_address.as_deref(),
            ) {
                // A supplied-but-invalid owner token fails the whole auth
                // rather than silently downgrading to editor.
                let owner_did = state
                    .verifier
                    .verify_owner_token(owner_token, contract, owner_addr)
                    .await?;
                if owner_did == session.owner_did {
                    role = Role::Owner;
                    if let Some(new_info) = args.room_info.clone() {
                        state.sessions.update_room_info(
                            &document_id,
                            &session_did,
                            Some(new_info.clone()),
                        );
                        room_info = Some(new_info);
                    }
                }
            }
            (role, "existing", room_info)
        }

        // No live session: setup, or re-setup of an idle pair.
        previous => {
            let owner_token = args.owner_token.ok_or_else(|| {
                RelayError::Unauthorized("owner token required for session setup".into())
            })?;
            let contract = args
                .contract_address
                .ok_or_else(|| RelayError::BadRequest("contractAddress is required".into()))?;
            let owner_addr = args
                .owner_address
                .ok_or_else(|| RelayError::BadRequest("ownerAddress is required".into()))?;

            let owner_did = state
                .verifier
                .verify_owner_token(&owner_token, &contract, &owner_addr)
                .await?;

            // A pair keeps its owner for life.
            if let Some(ref prev) = previous {
                if prev.owner_did != owner_did {
                    return Err(RelayError::Unauthorized(
                        "owner mismatch for existing session".into(),
                    ));
                }
            }

            let session_type = if previous.is_some() { "existing" } else { "new" };
            let room_info = args
                .room_info
                .clone()
                .or_else(|| previous.as_ref().and_then(|s| s.room_info.clone()));
            state
                .sessions
                .create_session(&document_id, &session_did, &owner_did, room_info.clone())?;
            (Role::Owner, session_type, room_info)
        }
    };

    // A connection belongs to at most one session: re-authing against a
    // different pair releases the old membership first.
    if let Some(prev) = state.hub.auth_binding(client_id) {
        if prev.document_id != document_id || prev.session_did != session_did {
            state
                .sessions
                .remove_client_from_session(&prev.document_id, &prev.session_did, client_id);
        }
    }

    state
        .sessions
        .add_client_to_session(&document_id, &session_did, client_id)?;
    state.hub.bind_auth(
        client_id,
        AuthBinding {
            document_id: document_id.clone(),
            session_did: session_did.clone(),
            role,
        },
    );

    let joined = EventEnvelope::new(
        protocol::EVENT_ROOM_MEMBERSHIP_CHANGE,
        &document_id,
        json!({"action": "user_joined", "clientId": client_id}),
    );
    if let Ok(payload) = serde_json::to_string(&joined) {
        state.sessions.broadcast_to_all_nodes(
            &document_id,
            &session_did,
            &payload,
            Some(client_id),
            false,
        );
    }

    Ok(json!({
        "role": role.as_str(),
        "sessionType": session_type,
        "roomInfo": room_info,
    }))
}

// ── /documents/update ──────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateArgs {
    document_id: String,
    data: String,
    collaboration_token: String,
}

async fn document_update(
    state: &Arc<SharedState>,
    client_id: &str,
    args: serde_json::Value,
) -> Result<serde_json::Value, RelayError> {
    let args: UpdateArgs = parse_args(args)?;
    let auth = require_auth(state, client_id)?;
    require_document(&auth, &args.document_id)?;

    state
        .verifier
        .verify_collaboration_token(&args.collaboration_token, &auth.session_did)?;

    let row = UpdateRow {
        id: Uuid::new_v4().to_string(),
        document_id: args.document_id.clone(),
        session_did: auth.session_did.clone(),
        data: args.data,
        update_type: db::UPDATE_TYPE_CRDT.to_string(),
        committed: false,
        commit_cid: None,
        created_at: now_ms(),
    };
    state.db.lock().insert_update(&row)?;

    let event = EventEnvelope::new(
        protocol::EVENT_CONTENT_UPDATE,
        &args.document_id,
        json!({"id": row.id, "data": row.data, "createdAt": row.created_at}),
    );
    if let Ok(payload) = serde_json::to_string(&event) {
        state.sessions.broadcast_to_all_nodes(
            &args.document_id,
            &auth.session_did,
            &payload,
            Some(client_id),
            false,
        );
    }

    Ok(serde_json::to_value(&row).unwrap_or_default())
}

// ── /documents/commit ──────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommitArgs {
    document_id: String,
    updates: Vec<String>,
    cid: String,
    owner_token: String,
    contract_address: String,
    owner_address: String,
}

async fn document_commit(
    state: &Arc<SharedState>,
    client_id: &str,
    args: serde_json::Value,
) -> Result<serde_json::Value, RelayError> {
    let args: CommitArgs = parse_args(args)?;
    let auth = require_auth(state, client_id)?;
    require_document(&auth, &args.document_id)?;
    if auth.role != Role::Owner {
        return Err(RelayError::Forbidden("owner role required".into()));
    }

    // Owner token is re-verified on every commit regardless of role.
    let owner_did = state
        .verifier
        .verify_owner_token(&args.owner_token, &args.contract_address, &args.owner_address)
        .await?;
    let session = state
        .sessions
        .get_session(&args.document_id, &auth.session_did)
        .ok_or_else(|| RelayError::NotFound("session not found".into()))?;
    if session.owner_did != owner_did {
        return Err(RelayError::Unauthorized("owner mismatch".into()));
    }

    let row = CommitRow {
        id: Uuid::new_v4().to_string(),
        document_id: args.document_id,
        session_did: auth.session_did,
        cid: args.cid,
        updates: args.updates,
        created_at: now_ms(),
    };
    let transitioned = state.db.lock().insert_commit(&row)?;
    tracing::debug!(
        commit_id = %row.id,
        transitioned,
        referenced = row.updates.len(),
        "commit persisted"
    );

    // Commits are owner-private: no broadcast. Peers observe them through
    // the externally-addressed snapshot.
    Ok(serde_json::to_value(&row).unwrap_or_default())
}

// ── /documents/update/history and /documents/commit/history ───────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryFilters {
    committed: Option<bool>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryArgs {
    document_id: String,
    offset: Option<usize>,
    limit: Option<usize>,
    sort: Option<String>,
    filters: Option<HistoryFilters>,
}

fn update_history(
    state: &Arc<SharedState>,
    client_id: &str,
    args: serde_json::Value,
) -> Result<serde_json::Value, RelayError> {
    let args: HistoryArgs = parse_args(args)?;
    let auth = require_auth(state, client_id)?;
    require_document(&auth, &args.document_id)?;

    let query = UpdateQuery {
        limit: args.limit.unwrap_or(db::DEFAULT_UPDATE_LIMIT),
        offset: args.offset.unwrap_or(0),
        committed: args.filters.and_then(|f| f.committed),
        sort: SortOrder::parse(args.sort.as_deref()),
    };
    let rows = state.db.lock().updates_by_document(&args.document_id, &query)?;
    Ok(json!({"updates": rows}))
}

fn commit_history(
    state: &Arc<SharedState>,
    client_id: &str,
    args: serde_json::Value,
) -> Result<serde_json::Value, RelayError> {
    let args: HistoryArgs = parse_args(args)?;
    let auth = require_auth(state, client_id)?;
    require_document(&auth, &args.document_id)?;

    let query = CommitQuery {
        limit: args.limit.unwrap_or(db::DEFAULT_COMMIT_LIMIT),
        offset: args.offset.unwrap_or(0),
        sort: SortOrder::parse(args.sort.as_deref()),
    };
    let rows = state.db.lock().commits_by_document(&args.document_id, &query)?;
    Ok(json!({"commits": rows}))
}

// ── /documents/peers/list ──────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PeersArgs {
    document_id: String,
}

fn peers_list(
    state: &Arc<SharedState>,
    client_id: &str,
    args: serde_json::Value,
) -> Result<serde_json::Value, RelayError> {
    let args: PeersArgs = parse_args(args)?;
    let auth = require_auth(state, client_id)?;
    require_document(&auth, &args.document_id)?;

    let mut peers = state
        .sessions
        .cluster_clients(&args.document_id, &auth.session_did);
    peers.sort();
    Ok(json!({"peers": peers}))
}

// ── /documents/awareness ───────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AwarenessArgs {
    document_id: String,
    data: serde_json::Value,
}

fn awareness(
    state: &Arc<SharedState>,
    client_id: &str,
    args: serde_json::Value,
) -> Result<serde_json::Value, RelayError> {
    let args: AwarenessArgs = parse_args(args)?;
    let auth = require_auth(state, client_id)?;
    require_document(&auth, &args.document_id)?;

    // Presence is never persisted; it only rides the fan-out, and it is
    // droppable under backpressure (idempotent by latest).
    let event = EventEnvelope::new(
        protocol::EVENT_AWARENESS_UPDATE,
        &args.document_id,
        args.data,
    );
    if let Ok(payload) = serde_json::to_string(&event) {
        state.sessions.broadcast_to_all_nodes(
            &args.document_id,
            &auth.session_did,
            &payload,
            Some(client_id),
            true,
        );
    }
    Ok(json!({}))
}

// ── /documents/terminate ───────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TerminateArgs {
    document_id: String,
    session_did: String,
    owner_token: String,
    contract_address: String,
    owner_address: String,
}

async fn terminate(
    state: &Arc<SharedState>,
    client_id: &str,
    args: serde_json::Value,
) -> Result<serde_json::Value, RelayError> {
    let args: TerminateArgs = parse_args(args)?;

    let session = state
        .sessions
        .get_session(&args.document_id, &args.session_did)
        .ok_or_else(|| RelayError::NotFound("session not found".into()))?;

    let owner_did = state
        .verifier
        .verify_owner_token(&args.owner_token, &args.contract_address, &args.owner_address)
        .await?;
    if owner_did != session.owner_did {
        return Err(RelayError::Unauthorized(
            "only the session owner may terminate it".into(),
        ));
    }

    let event = EventEnvelope::new(
        protocol::EVENT_SESSION_TERMINATED,
        &args.document_id,
        json!({"documentId": args.document_id, "sessionDid": args.session_did}),
    );
    if let Ok(payload) = serde_json::to_string(&event) {
        state.sessions.broadcast_to_all_nodes(
            &args.document_id,
            &args.session_did,
            &payload,
            Some(client_id),
            false,
        );
    }

    state
        .sessions
        .terminate_session(&args.document_id, &args.session_did)?;

    Ok(json!({"terminated": true}))
}
