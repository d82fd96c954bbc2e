//! Admitted sessions and the table that owns their admission tokens.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use duel_core::{ParticipantId, RuleEngine, SessionId};
use metrics::{counter, gauge};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::info;

use super::errors::SessionError;
use crate::metrics::{ADMISSION_TOKENS_AVAILABLE, SESSIONS_ACTIVE, SESSIONS_ENDED_TOTAL};

/// How a session ended.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionEnd {
    /// The rule engine reached a terminal state.
    Completed {
        /// Winner, if the game produced one.
        winner: Option<ParticipantId>,
    },
    /// The session ran past its hard deadline.
    DeadlineExceeded,
    /// The session was cancelled (a participant left, or shutdown).
    Cancelled,
    /// The stale sweep removed it.
    Swept,
}

impl SessionEnd {
    /// Metrics label.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Completed { .. } => "completed",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::Cancelled => "cancelled",
            Self::Swept => "swept",
        }
    }
}

/// A paired, admitted session.
///
/// The rule engine sits behind a mutex; every call on it is serialized.
pub struct SessionHandle {
    id: SessionId,
    participants: [ParticipantId; 2],
    pub(super) engine: Mutex<Box<dyn RuleEngine>>,
    cancel: CancellationToken,
    created_at: Instant,
    deadline: Instant,
    outcome: Mutex<Option<SessionEnd>>,
}

impl SessionHandle {
    pub(crate) fn new(
        id: SessionId,
        participants: [ParticipantId; 2],
        engine: Box<dyn RuleEngine>,
        cancel: CancellationToken,
        max_duration: Duration,
    ) -> Self {
        let created_at = Instant::now();
        Self {
            id,
            participants,
            engine: Mutex::new(engine),
            cancel,
            created_at,
            deadline: created_at + max_duration,
            outcome: Mutex::new(None),
        }
    }

    /// Session ID.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Both participants, in arrival order.
    pub fn participants(&self) -> &[ParticipantId; 2] {
        &self.participants
    }

    /// Seat index (0 or 1) of `participant`.
    pub fn seat_of(&self, participant: &ParticipantId) -> Option<usize> {
        self.participants.iter().position(|p| p == participant)
    }

    /// The other participant.
    pub fn opponent_of(&self, participant: &ParticipantId) -> Option<&ParticipantId> {
        self.seat_of(participant).map(|seat| &self.participants[1 - seat])
    }

    /// When the session was admitted.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Time since admission.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Absolute hard deadline.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Apply a move for `participant` and return the new snapshot.
    pub fn apply(
        &self,
        participant: &ParticipantId,
        action: &serde_json::Value,
    ) -> Result<serde_json::Value, SessionError> {
        if self.seat_of(participant).is_none() {
            return Err(SessionError::NotParticipant);
        }
        if self.cancel.is_cancelled() {
            return Err(self.ended_error());
        }
        let mut engine = self.engine.lock();
        engine.apply(participant, action)?;
        Ok(engine.snapshot())
    }

    /// Client-facing view of the game.
    pub fn snapshot(&self) -> serde_json::Value {
        self.engine.lock().snapshot()
    }

    /// Whether the game has concluded or the session was cancelled.
    pub fn is_finished(&self) -> bool {
        self.cancel.is_cancelled() || self.engine.lock().is_terminal()
    }

    pub(crate) fn engine_terminal(&self) -> bool {
        self.engine.lock().is_terminal()
    }

    /// Winner reported by the rule engine.
    pub fn winner(&self) -> Option<ParticipantId> {
        self.engine.lock().winner()
    }

    /// Cancel the session. Its supervisor retires it and releases its token.
    pub fn end(&self) {
        self.cancel.cancel();
    }

    /// Resolves once the session is cancelled, ended, or retired.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// Recorded outcome, once retired.
    pub fn outcome(&self) -> Option<SessionEnd> {
        self.outcome.lock().clone()
    }

    /// The recorded outcome or, for a session that was cancelled but not
    /// yet retired, the one its supervisor will record. `None` while live.
    pub fn end_reason(&self) -> Option<SessionEnd> {
        if let Some(end) = self.outcome() {
            return Some(end);
        }
        if !self.cancel.is_cancelled() {
            return None;
        }
        Some(if self.engine_terminal() {
            SessionEnd::Completed {
                winner: self.winner(),
            }
        } else {
            SessionEnd::Cancelled
        })
    }

    /// Record the outcome (first one wins), force the engine terminal, and
    /// cancel the session context.
    pub(crate) fn finish(&self, end: SessionEnd) {
        {
            let mut outcome = self.outcome.lock();
            if outcome.is_none() {
                *outcome = Some(end);
            }
        }
        self.engine.lock().terminate();
        self.cancel.cancel();
    }

    fn ended_error(&self) -> SessionError {
        match self.outcome() {
            Some(SessionEnd::DeadlineExceeded | SessionEnd::Swept) => SessionError::DeadlineExceeded,
            _ => SessionError::Ended,
        }
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("participants", &self.participants)
            .field("cancelled", &self.cancel.is_cancelled())
            .field("outcome", &self.outcome())
            .finish_non_exhaustive()
    }
}

/// A table entry: dropping it releases the admission token.
struct ActiveSession {
    handle: Arc<SessionHandle>,
    _permit: OwnedSemaphorePermit,
}

/// Active sessions keyed by ID, each holding one admission token.
///
/// Whoever removes an entry drops its permit, so a token is released
/// exactly once however many paths race to retire the session.
#[derive(Clone)]
pub(crate) struct SessionTable {
    inner: Arc<RwLock<HashMap<SessionId, ActiveSession>>>,
    admission: Arc<Semaphore>,
}

impl SessionTable {
    pub(crate) fn new(admission: Arc<Semaphore>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            admission,
        }
    }

    pub(crate) fn insert(&self, handle: Arc<SessionHandle>, permit: OwnedSemaphorePermit) {
        let id = handle.id().clone();
        let entry = ActiveSession {
            handle,
            _permit: permit,
        };
        let _ = self.inner.write().insert(id, entry);
        self.record_gauges();
    }

    pub(crate) fn get(&self, id: &SessionId) -> Option<Arc<SessionHandle>> {
        self.inner.read().get(id).map(|e| e.handle.clone())
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub(crate) fn handles(&self) -> Vec<Arc<SessionHandle>> {
        self.inner.read().values().map(|e| e.handle.clone()).collect()
    }

    /// Sessions older than `max_age`.
    pub(crate) fn stale(&self, max_age: Duration) -> Vec<SessionId> {
        self.inner
            .read()
            .values()
            .filter(|e| e.handle.age() > max_age)
            .map(|e| e.handle.id().clone())
            .collect()
    }

    /// Remove a session and release its token. Returns `false` if another
    /// path already retired it.
    pub(crate) fn retire(&self, id: &SessionId, end: SessionEnd) -> bool {
        let Some(entry) = self.inner.write().remove(id) else {
            return false;
        };
        let handle = &entry.handle;
        handle.finish(end.clone());
        counter!(SESSIONS_ENDED_TOTAL, "outcome" => end.label()).increment(1);
        info!(
            session_id = %id,
            outcome = end.label(),
            age_secs = handle.age().as_secs(),
            "session ended"
        );
        drop(entry);
        self.record_gauges();
        true
    }

    fn record_gauges(&self) {
        #[allow(clippy::cast_precision_loss)]
        {
            gauge!(SESSIONS_ACTIVE).set(self.len() as f64);
            gauge!(ADMISSION_TOKENS_AVAILABLE).set(self.admission.available_permits() as f64);
        }
    }
}
