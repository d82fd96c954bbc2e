//! Join requests and their single-use reply slot.

use std::sync::Arc;

use duel_core::ParticipantId;
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::errors::MatchError;
use super::session::SessionHandle;

/// What a join request eventually resolves to.
pub type MatchResult = Result<Arc<SessionHandle>, MatchError>;

/// A participant waiting for a partner.
#[derive(Debug)]
pub(crate) struct JoinRequest {
    pub(crate) participant: ParticipantId,
    pub(crate) enqueued_at: Instant,
    reply: oneshot::Sender<MatchResult>,
}

impl JoinRequest {
    pub(crate) fn new(participant: ParticipantId) -> (Self, oneshot::Receiver<MatchResult>) {
        let (reply, rx) = oneshot::channel();
        let req = Self {
            participant,
            enqueued_at: Instant::now(),
            reply,
        };
        (req, rx)
    }

    /// The caller stopped waiting (timed out or dropped its future).
    pub(crate) fn is_withdrawn(&self) -> bool {
        self.reply.is_closed()
    }

    /// Deliver the one reply. Returns `false` if the caller already left.
    pub(crate) fn respond(self, result: MatchResult) -> bool {
        self.reply.send(result).is_ok()
    }
}
