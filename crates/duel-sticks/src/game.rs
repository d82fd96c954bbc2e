//! Two-seat game state machine: `Waiting -> Playing -> Finished`.

use duel_core::{EngineError, EngineFactory, ParticipantId, RuleEngine, SessionId};
use serde::{Deserialize, Serialize};

use crate::hand::Hand;

/// Lifecycle of a game.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Seats still open or play not yet started.
    Waiting,
    /// Moves are being accepted.
    Playing,
    /// Someone won or the game was terminated.
    Finished,
}

/// A move submitted by the player whose turn it is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Move {
    /// Tap one of the opponent's hands with one of yours.
    Attack {
        /// Attack with the left hand (otherwise right).
        with_left: bool,
        /// Target the opponent's left hand (otherwise right).
        attack_left: bool,
    },
    /// Move fingers from your other hand into the chosen hand.
    Split {
        /// The receiving hand is the left one (otherwise right).
        with_left: bool,
        /// Fingers to move.
        points: u8,
    },
}

#[derive(Clone, Debug, Serialize)]
struct Seat {
    id: ParticipantId,
    left: Hand,
    right: Hand,
}

impl Seat {
    fn new(id: ParticipantId) -> Self {
        Self {
            id,
            left: Hand::new(),
            right: Hand::new(),
        }
    }

    fn alive(&self) -> bool {
        self.left.alive() || self.right.alive()
    }

    fn hand(&self, left: bool) -> Hand {
        if left { self.left } else { self.right }
    }

    fn hand_mut(&mut self, left: bool) -> &mut Hand {
        if left { &mut self.left } else { &mut self.right }
    }
}

/// One game of sticks.
#[derive(Clone, Debug)]
pub struct SticksGame {
    id: SessionId,
    seats: [Option<Seat>; 2],
    turn: usize,
    status: Status,
    winner: Option<ParticipantId>,
}

impl SticksGame {
    /// An empty game waiting for two participants.
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            seats: [None, None],
            turn: 0,
            status: Status::Waiting,
            winner: None,
        }
    }

    /// Current lifecycle state.
    pub fn status(&self) -> Status {
        self.status
    }

    /// Participant whose turn it is, once play has started.
    pub fn current_player(&self) -> Option<&ParticipantId> {
        match self.status {
            Status::Playing => self.seats[self.turn].as_ref().map(|s| &s.id),
            _ => None,
        }
    }

    /// Apply a typed move for `participant`.
    pub fn play(&mut self, participant: &ParticipantId, mv: Move) -> Result<(), EngineError> {
        match self.status {
            Status::Waiting => return Err(EngineError::NotStarted),
            Status::Finished => return Err(EngineError::Finished),
            Status::Playing => {}
        }
        if self.current_player() != Some(participant) {
            return Err(EngineError::NotYourTurn);
        }

        let (mine, theirs) = self.split_seats();
        match mv {
            Move::Attack {
                with_left,
                attack_left,
            } => mine.hand(with_left).attack(theirs.hand_mut(attack_left))?,
            Move::Split { with_left, points } => {
                let (into, from) = if with_left {
                    (&mut mine.left, &mut mine.right)
                } else {
                    (&mut mine.right, &mut mine.left)
                };
                into.take(from, points)?;
            }
        }

        if !theirs.alive() {
            self.winner = Some(participant.clone());
            self.status = Status::Finished;
        } else {
            self.turn = 1 - self.turn;
        }
        Ok(())
    }

    /// Mutable access to the mover's seat and the opponent's seat.
    fn split_seats(&mut self) -> (&mut Seat, &mut Seat) {
        let (first, second) = self.seats.split_at_mut(1);
        let (a, b) = match (first[0].as_mut(), second[0].as_mut()) {
            (Some(a), Some(b)) => (a, b),
            // play() only runs in Playing, which requires both seats
            _ => unreachable!("both seats are filled while playing"),
        };
        if self.turn == 0 { (a, b) } else { (b, a) }
    }
}

impl RuleEngine for SticksGame {
    fn add_participant(&mut self, participant: &ParticipantId) -> Result<(), EngineError> {
        if self.seats.iter().flatten().any(|s| &s.id == participant) {
            return Err(EngineError::DuplicateParticipant(participant.clone()));
        }
        let Some(slot) = self.seats.iter_mut().find(|s| s.is_none()) else {
            return Err(EngineError::Full);
        };
        *slot = Some(Seat::new(participant.clone()));
        Ok(())
    }

    fn start(&mut self) -> Result<(), EngineError> {
        match self.status {
            Status::Finished => Err(EngineError::Finished),
            _ if self.seats.iter().any(Option::is_none) => Err(EngineError::NotStarted),
            _ => {
                self.status = Status::Playing;
                self.turn = 0;
                Ok(())
            }
        }
    }

    fn apply(
        &mut self,
        participant: &ParticipantId,
        action: &serde_json::Value,
    ) -> Result<(), EngineError> {
        let mv: Move = serde_json::from_value(action.clone())
            .map_err(|e| EngineError::InvalidAction(e.to_string()))?;
        self.play(participant, mv)
    }

    fn is_terminal(&self) -> bool {
        self.status == Status::Finished
    }

    fn winner(&self) -> Option<ParticipantId> {
        self.winner.clone()
    }

    fn terminate(&mut self) {
        self.status = Status::Finished;
    }

    fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "gameId": self.id,
            "status": self.status,
            "turn": self.current_player(),
            "players": self.seats.iter().flatten().collect::<Vec<_>>(),
            "winner": self.winner,
        })
    }
}

/// [`EngineFactory`] producing [`SticksGame`]s.
#[derive(Clone, Copy, Debug, Default)]
pub struct SticksFactory;

impl EngineFactory for SticksFactory {
    fn create(&self, session_id: &SessionId) -> Box<dyn RuleEngine> {
        Box::new(SticksGame::new(session_id.clone()))
    }
}
