//! Connection lifecycle: frame transport, per-connection pumps, and the
//! live-connection registry.

pub mod axum_ws;
pub mod connection;
pub mod pump;
pub mod registry;
pub mod transport;
