//! WebSocket relay client.
//!
//! Thin consumer of the [`crate::protocol`] envelopes: connects, captures
//! the handshake, and multiplexes sequenced replies against unsolicited
//! events. Integration tests and bots drive the relay through this.
//!
//! The client does not reconnect. Consumers wanting resilience should
//! implement their own backoff loop around [`RelayClient::connect`].

use std::collections::VecDeque;

use anyhow::{anyhow, bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::protocol::{EventEnvelope, Request, Response, ServerFrame};

pub struct RelayClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    /// From the handshake frame.
    pub server_did: String,
    seq: u64,
    /// Events that arrived while a reply was being awaited.
    buffered: VecDeque<EventEnvelope>,
}

impl RelayClient {
    /// Connect and consume the handshake frame.
    pub async fn connect(url: &str) -> Result<Self> {
        let (mut ws, _) = connect_async(url).await.context("WebSocket connect failed")?;

        let handshake = loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => break text.to_string(),
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(other)) => bail!("unexpected pre-handshake frame: {other:?}"),
                Some(Err(e)) => return Err(e).context("handshake read failed"),
                None => bail!("socket closed before handshake"),
            }
        };
        let frame = ServerFrame::parse(&handshake).context("handshake parse failed")?;
        let ServerFrame::Response(resp) = frame else {
            bail!("first frame was not a handshake response");
        };
        if !resp.is_handshake_response {
            bail!("first frame was not a handshake response");
        }
        let server_did = resp
            .data
            .as_ref()
            .and_then(|d| d.get("server_did"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("handshake carried no server_did"))?
            .to_string();

        Ok(Self {
            ws,
            server_did,
            seq: 0,
            buffered: VecDeque::new(),
        })
    }

    /// Send a command and await its sequenced reply. Events that arrive in
    /// the meantime are buffered for [`next_event`](Self::next_event).
    pub async fn request(&mut self, cmd: &str, args: serde_json::Value) -> Result<Response> {
        self.seq += 1;
        let seq_id = self.seq.to_string();
        let req = Request {
            cmd: cmd.to_string(),
            args,
            seq_id: seq_id.clone(),
        };
        let text = serde_json::to_string(&req)?;
        self.ws.send(Message::Text(text.into())).await?;

        loop {
            match self.recv_frame().await? {
                ServerFrame::Response(resp) if resp.seq_id.as_deref() == Some(&seq_id) => {
                    return Ok(resp);
                }
                ServerFrame::Response(resp) => {
                    tracing::debug!(?resp.seq_id, "discarding stale reply");
                }
                ServerFrame::Event(event) => self.buffered.push_back(event),
            }
        }
    }

    /// Next unsolicited event (buffered first, then from the socket).
    pub async fn next_event(&mut self) -> Result<EventEnvelope> {
        if let Some(event) = self.buffered.pop_front() {
            return Ok(event);
        }
        loop {
            match self.recv_frame().await? {
                ServerFrame::Event(event) => return Ok(event),
                ServerFrame::Response(resp) => {
                    tracing::debug!(?resp.seq_id, "discarding unawaited reply");
                }
            }
        }
    }

    /// Close the connection.
    pub async fn close(mut self) -> Result<()> {
        self.ws.close(None).await?;
        Ok(())
    }

    async fn recv_frame(&mut self) -> Result<ServerFrame> {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    return ServerFrame::parse(&text).context("frame parse failed");
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) | None => bail!("socket closed"),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e).context("socket read failed"),
            }
        }
    }
}
