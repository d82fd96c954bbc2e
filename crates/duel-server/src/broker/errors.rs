//! Matchmaking and session errors.

use duel_core::EngineError;
use thiserror::Error;

/// Why a join request failed. Each request receives exactly one of these or
/// a session.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum MatchError {
    /// The join queue is at capacity. Reported without waiting.
    #[error("matchmaking queue is full")]
    QueueFull,
    /// No reply arrived before the matchmaking deadline.
    #[error("matchmaking timed out")]
    TimedOut,
    /// The broker is stopping or not running.
    #[error("broker is shutting down")]
    ShuttingDown,
    /// A partner was found but no admission token was free.
    #[error("no session capacity available")]
    CapacityExceeded,
    /// The rule engine rejected a participant or refused to start.
    #[error("session construction failed: {0}")]
    SessionConstruction(EngineError),
}

impl MatchError {
    /// Whether the failure came from shutdown rather than runtime
    /// conditions. Callers should not resubmit these.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::ShuttingDown)
    }

    /// Stable snake_case code for metrics labels and client errors.
    pub fn code(&self) -> &'static str {
        match self {
            Self::QueueFull => "queue_full",
            Self::TimedOut => "timed_out",
            Self::ShuttingDown => "shutting_down",
            Self::CapacityExceeded => "capacity_exceeded",
            Self::SessionConstruction(_) => "session_construction_failed",
        }
    }
}

/// Why an operation on a session failed.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum SessionError {
    /// The session hit its hard deadline.
    #[error("session deadline exceeded")]
    DeadlineExceeded,
    /// The session is over (completed or cancelled).
    #[error("session has ended")]
    Ended,
    /// The caller is not seated in this session.
    #[error("not a participant in this session")]
    NotParticipant,
    /// The rule engine rejected the action.
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl SessionError {
    /// Stable snake_case code for client errors.
    pub fn code(&self) -> &'static str {
        match self {
            Self::DeadlineExceeded => "session_deadline_exceeded",
            Self::Ended => "session_ended",
            Self::NotParticipant => "not_participant",
            Self::Engine(_) => "rejected_move",
        }
    }
}
