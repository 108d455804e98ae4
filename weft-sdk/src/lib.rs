//! Client SDK and shared protocol layer for the weft collaboration relay.
//!
//! This crate holds everything a relay client and the relay server must
//! agree on:
//!
//! - [`did`] — `did:key` encoding for ed25519 keys
//! - [`canonical`] — JCS canonicalization used before signing
//! - [`token`] — capability tokens (sign, verify, wire encoding)
//! - [`protocol`] — the framed JSON request/response/event envelopes
//! - [`client`] — a WebSocket client for tests, bots, and tools

pub mod canonical;
pub mod client;
pub mod did;
pub mod protocol;
pub mod token;
