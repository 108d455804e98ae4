//! Wire-level error behavior: handshake shape, malformed frames, unknown
//! commands, and commands on unauthenticated sockets.

mod common;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use weft_sdk::protocol::{CMD_AWARENESS, CMD_DOCUMENT_UPDATE, CMD_PEERS_LIST};

use common::{Harness, DOCUMENT};

#[tokio::test]
async fn handshake_arrives_first_with_server_did() {
    let h = Harness::new();
    let addr = h.start_node().await;

    let (mut ws, _) = connect_async(format!("ws://{addr}/")).await.unwrap();
    let frame = ws.next().await.unwrap().unwrap();
    let Message::Text(text) = frame else {
        panic!("expected text handshake frame");
    };
    let value: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(value["is_handshake_response"], true);
    assert_eq!(value["statusCode"], 200);
    assert_eq!(value["data"]["server_did"], h.server.did.as_str());
}

#[tokio::test]
async fn malformed_frame_gets_400_and_socket_stays_open() {
    let h = Harness::new();
    let addr = h.start_node().await;

    let (mut ws, _) = connect_async(format!("ws://{addr}/")).await.unwrap();
    let _handshake = ws.next().await.unwrap().unwrap();

    ws.send(Message::Text("this is not json".into())).await.unwrap();
    let frame = ws.next().await.unwrap().unwrap();
    let Message::Text(text) = frame else {
        panic!("expected error reply");
    };
    let value: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(value["statusCode"], 400);
    assert_eq!(value["seqId"], serde_json::Value::Null);

    // Socket survives: a well-formed request on the same socket still
    // gets a sequenced reply.
    let request = json!({"cmd": "/nonsense", "args": {}, "seqId": "42"});
    ws.send(Message::Text(request.to_string().into())).await.unwrap();
    let frame = ws.next().await.unwrap().unwrap();
    let Message::Text(text) = frame else {
        panic!("expected reply");
    };
    let value: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(value["seqId"], "42");
    assert_eq!(value["statusCode"], 404);
}

#[tokio::test]
async fn unknown_command_is_404() {
    let h = Harness::new();
    let addr = h.start_node().await;

    let mut client = h.connect(addr).await;
    let reply = client.request("/documents/rename", json!({})).await.unwrap();
    assert!(!reply.status);
    assert_eq!(reply.status_code, 404);
}

#[tokio::test]
async fn session_commands_require_auth() {
    let h = Harness::new();
    let addr = h.start_node().await;

    let mut client = h.connect(addr).await;
    for (cmd, args) in [
        (
            CMD_DOCUMENT_UPDATE,
            json!({"documentId": DOCUMENT, "data": "x", "collaborationToken": "t"}),
        ),
        (CMD_AWARENESS, json!({"documentId": DOCUMENT, "data": {}})),
        (CMD_PEERS_LIST, json!({"documentId": DOCUMENT})),
    ] {
        let reply = client.request(cmd, args).await.unwrap();
        assert!(!reply.status, "{cmd} should require auth");
        assert_eq!(reply.status_code, 401, "{cmd}");
    }
}

#[tokio::test]
async fn auth_with_missing_args_is_rejected() {
    let h = Harness::new();
    let addr = h.start_node().await;

    let mut client = h.connect(addr).await;
    // No sessionDid.
    let reply = client
        .request("/auth", json!({"documentId": DOCUMENT}))
        .await
        .unwrap();
    assert!(!reply.status);
    assert_eq!(reply.status_code, 400);

    // Setup without an owner token.
    let reply = client
        .request(
            "/auth",
            json!({"documentId": DOCUMENT, "sessionDid": h.session.did}),
        )
        .await
        .unwrap();
    assert!(!reply.status);
    assert_eq!(reply.status_code, 401);
}
