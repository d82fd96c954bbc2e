//! # duel-server
//!
//! Connection lifecycle and matchmaking core, plus the axum surface that
//! hosts it.
//!
//! - [`websocket`]: per-connection read/write pumps over a pluggable frame
//!   transport, and the registry of live connections
//! - [`broker`]: FIFO pairing, admission budget, and per-session supervision
//! - [`play`]: relays moves between a connection and its session
//! - HTTP endpoints: `/health`, `/stats`, `/metrics`, `/ws`
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod broker;
pub mod config;
pub mod health;
pub mod metrics;
pub mod play;
pub mod protocol;
pub mod server;
pub mod shutdown;
pub mod websocket;
