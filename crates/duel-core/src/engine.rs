//! Rule-engine plug-in seam.
//!
//! The session broker never interprets moves. It asks a [`EngineFactory`] for
//! a fresh game, seats both participants, starts it, and afterwards only polls
//! [`RuleEngine::is_terminal`]. Move application is driven by whatever
//! handler layer sits on top of the connection pumps.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::{ParticipantId, SessionId};

/// Errors reported by a rule engine.
#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum EngineError {
    /// Both seats are already taken.
    #[error("game is full")]
    Full,
    /// The participant already holds a seat in this game.
    #[error("participant {0} is already seated")]
    DuplicateParticipant(ParticipantId),
    /// The game has not been started (seats still open).
    #[error("game has not started")]
    NotStarted,
    /// The game is already over.
    #[error("game is finished")]
    Finished,
    /// A move was submitted out of turn.
    #[error("not your turn")]
    NotYourTurn,
    /// The move is well-formed but breaks a rule.
    #[error("illegal move: {0}")]
    IllegalMove(String),
    /// The move payload could not be interpreted.
    #[error("invalid action: {0}")]
    InvalidAction(String),
}

/// A turn-based two-party game.
///
/// Implementations are plain state machines with no concurrency of their
/// own; the broker serializes every call behind a mutex.
pub trait RuleEngine: Send + 'static {
    /// Seat a participant. Fails with [`EngineError::Full`] once both seats
    /// are taken and [`EngineError::DuplicateParticipant`] on a repeat.
    fn add_participant(&mut self, participant: &ParticipantId) -> Result<(), EngineError>;

    /// Begin play. Fails if the seats are not filled.
    fn start(&mut self) -> Result<(), EngineError>;

    /// Apply one move on behalf of a seated participant.
    fn apply(
        &mut self,
        participant: &ParticipantId,
        action: &serde_json::Value,
    ) -> Result<(), EngineError>;

    /// Whether the game has concluded, by play or by [`RuleEngine::terminate`].
    fn is_terminal(&self) -> bool;

    /// The winner, if play produced one.
    fn winner(&self) -> Option<ParticipantId>;

    /// Force the game into its terminal state without a winner.
    fn terminate(&mut self);

    /// Serializable view of the current state for clients.
    fn snapshot(&self) -> serde_json::Value;
}

/// Produces a fresh [`RuleEngine`] for every admitted session.
pub trait EngineFactory: Send + Sync + 'static {
    /// Build an empty game for the given session.
    fn create(&self, session_id: &SessionId) -> Box<dyn RuleEngine>;
}

impl<F> EngineFactory for F
where
    F: Fn(&SessionId) -> Box<dyn RuleEngine> + Send + Sync + 'static,
{
    fn create(&self, session_id: &SessionId) -> Box<dyn RuleEngine> {
        self(session_id)
    }
}
