//! Game relay messages sent to players.
//!
//! Clients send raw move objects (`{"type": "attack", ...}`) which are
//! passed to the rule engine untouched; only server messages are typed here.

use bytes::Bytes;
use duel_core::{ParticipantId, SessionId};
use serde::Serialize;
use serde_json::Value;

use crate::broker::SessionEnd;

/// Error code sent when a player moves before being paired.
pub const NOT_MATCHED: &str = "not_matched";
/// Error code sent for a frame that is not valid JSON.
pub const MALFORMED: &str = "malformed";

/// A message from the server to one player.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// The player was paired and admitted.
    Matched {
        /// Session ID.
        session: SessionId,
        /// The receiving player's own ID, generated when they joined
        /// without one.
        player: ParticipantId,
        /// The other participant.
        opponent: ParticipantId,
        /// 0 moves first.
        seat: usize,
        /// Initial game state.
        state: Value,
    },
    /// Game state after a move.
    State {
        /// Engine snapshot.
        state: Value,
    },
    /// A request or move failed.
    Error {
        /// Stable snake_case code.
        code: String,
        /// Human-readable detail.
        message: String,
    },
    /// The session is over.
    End {
        /// How it ended.
        outcome: SessionEnd,
        /// Final game state.
        state: Value,
    },
}

impl ServerMessage {
    /// Build an [`ServerMessage::Error`] from a code and any displayable error.
    pub fn error(code: &str, err: impl std::fmt::Display) -> Self {
        Self::Error {
            code: code.to_owned(),
            message: err.to_string(),
        }
    }

    /// Encode as a JSON frame.
    pub fn encode(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }
}
