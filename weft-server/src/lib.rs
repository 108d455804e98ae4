//! Stateless real-time collaboration relay.
//!
//! A horizontally scalable WebSocket relay: capability-token
//! authentication against an on-chain owner registry, ephemeral
//! per-document sessions, cluster-wide fan-out of encrypted CRDT updates
//! and awareness signals, and an append-only update log with owner-issued
//! commit markers. Payloads are opaque — clients encrypt with a room key
//! the relay never sees.

pub mod bus;
pub mod commands;
pub mod config;
pub mod db;
pub mod error;
pub mod hub;
pub mod registry;
pub mod server;
pub mod session;
pub mod tokens;
