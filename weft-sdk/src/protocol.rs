//! Framed JSON wire protocol.
//!
//! Every client→server frame is a [`Request`]; every server→client frame is
//! either a [`Response`] (handshake or sequenced reply) or an unsolicited
//! [`EventEnvelope`]. All frames are WebSocket text frames carrying JSON.

use serde::{Deserialize, Serialize};

// ── Commands ───────────────────────────────────────────────────────────

pub const CMD_AUTH: &str = "/auth";
pub const CMD_DOCUMENT_UPDATE: &str = "/documents/update";
pub const CMD_DOCUMENT_COMMIT: &str = "/documents/commit";
pub const CMD_UPDATE_HISTORY: &str = "/documents/update/history";
pub const CMD_COMMIT_HISTORY: &str = "/documents/commit/history";
pub const CMD_PEERS_LIST: &str = "/documents/peers/list";
pub const CMD_AWARENESS: &str = "/documents/awareness";
pub const CMD_TERMINATE: &str = "/documents/terminate";

// ── Event types ────────────────────────────────────────────────────────

pub const EVENT_CONTENT_UPDATE: &str = "CONTENT_UPDATE";
pub const EVENT_AWARENESS_UPDATE: &str = "AWARENESS_UPDATE";
pub const EVENT_ROOM_MEMBERSHIP_CHANGE: &str = "ROOM_MEMBERSHIP_CHANGE";
pub const EVENT_SESSION_TERMINATED: &str = "SESSION_TERMINATED";

// ── Status codes ───────────────────────────────────────────────────────

pub const STATUS_OK: u16 = 200;
pub const STATUS_BAD_REQUEST: u16 = 400;
pub const STATUS_UNAUTHORIZED: u16 = 401;
pub const STATUS_FORBIDDEN: u16 = 403;
pub const STATUS_NOT_FOUND: u16 = 404;
pub const STATUS_INTERNAL: u16 = 500;

// ── Envelopes ──────────────────────────────────────────────────────────

/// Client request: `{"cmd": "...", "args": {...}, "seqId": "..."}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub cmd: String,
    #[serde(default)]
    pub args: serde_json::Value,
    #[serde(rename = "seqId")]
    pub seq_id: String,
}

/// Server reply, sequenced against the request's `seqId`. The handshake
/// frame is a `Response` with `is_handshake_response = true` and no seq.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub status: bool,
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    #[serde(rename = "seqId")]
    pub seq_id: Option<String>,
    #[serde(default)]
    pub is_handshake_response: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

impl Response {
    pub fn ok(seq_id: &str, data: serde_json::Value) -> Self {
        Self {
            status: true,
            status_code: STATUS_OK,
            seq_id: Some(seq_id.to_string()),
            is_handshake_response: false,
            data: Some(data),
            err: None,
        }
    }

    pub fn error(seq_id: Option<&str>, status_code: u16, err: &str) -> Self {
        Self {
            status: false,
            status_code,
            seq_id: seq_id.map(|s| s.to_string()),
            is_handshake_response: false,
            data: None,
            err: Some(err.to_string()),
        }
    }

    /// The frame sent immediately after a socket is accepted.
    pub fn handshake(server_did: &str) -> Self {
        Self {
            status: true,
            status_code: STATUS_OK,
            seq_id: None,
            is_handshake_response: true,
            data: Some(serde_json::json!({
                "server_did": server_did,
                "message": "connected",
            })),
            err: None,
        }
    }
}

/// Body of an unsolicited event: the payload plus the room it belongs to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBody {
    pub data: serde_json::Value,
    #[serde(rename = "roomId")]
    pub room_id: String,
}

/// Unsolicited server→client event:
/// `{"type": "event", "event_type": "...", "event": {"data": ..., "roomId": "..."}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub event_type: String,
    pub event: EventBody,
}

impl EventEnvelope {
    pub fn new(event_type: &str, room_id: &str, data: serde_json::Value) -> Self {
        Self {
            kind: "event".to_string(),
            event_type: event_type.to_string(),
            event: EventBody {
                data,
                room_id: room_id.to_string(),
            },
        }
    }
}

/// Anything the server can put on a socket.
#[derive(Debug, Clone)]
pub enum ServerFrame {
    Response(Response),
    Event(EventEnvelope),
}

impl ServerFrame {
    /// Classify a raw inbound text frame. Events carry `"type": "event"`,
    /// everything else is a response.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        if value.get("type").and_then(|v| v.as_str()) == Some("event") {
            Ok(ServerFrame::Event(serde_json::from_value(value)?))
        } else {
            Ok(ServerFrame::Response(serde_json::from_value(value)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_wire_field_names() {
        let req = Request {
            cmd: CMD_AUTH.into(),
            args: serde_json::json!({"documentId": "d1"}),
            seq_id: "7".into(),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["seqId"], "7");
        assert_eq!(json["cmd"], "/auth");
    }

    #[test]
    fn response_omits_empty_fields() {
        let resp = Response::ok("1", serde_json::json!({"role": "owner"}));
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("statusCode"));
        assert!(!json.contains("\"err\""));
    }

    #[test]
    fn handshake_frame_shape() {
        let resp = Response::handshake("did:key:zServer");
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["is_handshake_response"], true);
        assert_eq!(json["statusCode"], 200);
        assert_eq!(json["data"]["server_did"], "did:key:zServer");
        assert_eq!(json["seqId"], serde_json::Value::Null);
    }

    #[test]
    fn frame_classification() {
        let event = EventEnvelope::new(EVENT_AWARENESS_UPDATE, "d1", serde_json::json!({"c": 7}));
        let text = serde_json::to_string(&event).unwrap();
        assert!(matches!(
            ServerFrame::parse(&text).unwrap(),
            ServerFrame::Event(e) if e.event_type == EVENT_AWARENESS_UPDATE
        ));

        let resp = Response::error(Some("3"), STATUS_NOT_FOUND, "no such command");
        let text = serde_json::to_string(&resp).unwrap();
        assert!(matches!(
            ServerFrame::parse(&text).unwrap(),
            ServerFrame::Response(r) if r.status_code == STATUS_NOT_FOUND
        ));
    }

    #[test]
    fn event_envelope_room_id() {
        let event = EventEnvelope::new(EVENT_CONTENT_UPDATE, "doc-9", serde_json::json!({}));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"]["roomId"], "doc-9");
        assert_eq!(json["type"], "event");
    }
}
