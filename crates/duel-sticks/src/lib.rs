//! # duel-sticks
//!
//! "Sticks": each player raises one finger on each of two hands. On your
//! turn you either tap an opponent's hand with one of yours (adding your
//! fingers to it) or shift fingers between your own hands. A hand holding
//! five or more fingers is out; lose both and you lose the game.

#![deny(unsafe_code)]

pub mod game;
pub mod hand;

pub use game::{Move, SticksFactory, SticksGame, Status};
pub use hand::Hand;
