//! # duel-core
//!
//! Foundation types shared by every duel crate:
//!
//! - [`ids`]: branded ID newtypes for participants, sessions, and connections
//! - [`engine`]: the plug-in seam between the session broker and a rule engine
//! - [`logging`]: `tracing` subscriber setup

#![deny(unsafe_code)]

pub mod engine;
pub mod ids;
pub mod logging;

pub use engine::{EngineError, EngineFactory, RuleEngine};
pub use ids::{ConnectionId, ParticipantId, SessionId};
