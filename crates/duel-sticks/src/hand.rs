//! A single hand.

use duel_core::EngineError;
use serde::{Deserialize, Serialize};

/// Fingers at which a hand is out of play.
pub const DEAD_AT: u8 = 5;

/// One hand: a finger count, dead once it reaches [`DEAD_AT`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hand {
    fingers: u8,
}

impl Hand {
    /// A fresh hand with one finger raised.
    pub fn new() -> Self {
        Self { fingers: 1 }
    }

    /// A hand with an explicit finger count.
    pub fn with_fingers(fingers: u8) -> Self {
        Self { fingers }
    }

    /// Current finger count.
    pub fn fingers(self) -> u8 {
        self.fingers
    }

    /// Whether the hand is still in play.
    pub fn alive(self) -> bool {
        self.fingers < DEAD_AT
    }

    /// Tap `target` with this hand, adding this hand's fingers to it.
    pub fn attack(self, target: &mut Hand) -> Result<(), EngineError> {
        if !self.alive() {
            return Err(EngineError::IllegalMove("attacking hand is out".into()));
        }
        if !target.alive() {
            return Err(EngineError::IllegalMove("target hand is out".into()));
        }
        target.fingers = target.fingers.saturating_add(self.fingers);
        Ok(())
    }

    /// Move `points` fingers from `other` into this hand.
    ///
    /// Both hands must stay in play and `other` cannot go below zero.
    pub fn take(&mut self, other: &mut Hand, points: u8) -> Result<(), EngineError> {
        if points == 0 {
            return Err(EngineError::IllegalMove("must move at least one finger".into()));
        }
        if !other.alive() {
            return Err(EngineError::IllegalMove("cannot take from a hand that is out".into()));
        }
        if points > other.fingers {
            return Err(EngineError::IllegalMove(
                "the other hand does not have enough fingers".into(),
            ));
        }
        if self.fingers + points >= DEAD_AT {
            return Err(EngineError::IllegalMove(
                "this is more fingers than the hand can take".into(),
            ));
        }
        self.fingers += points;
        other.fingers -= points;
        Ok(())
    }
}

impl Default for Hand {
    fn default() -> Self {
        Self::new()
    }
}
