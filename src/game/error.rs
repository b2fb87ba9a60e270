//! Error taxonomy for the simulation core

use crate::ws::protocol::{BulletId, PlayerId};

/// Errors raised while applying intents or mutating rooms
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GameError {
    #[error("Invalid intent: {0}")]
    InvalidIntent(String),

    #[error("Room is full")]
    RoomFull,

    #[error("Room not found")]
    RoomNotFound,

    #[error("Player is already in a room")]
    AlreadyInRoom,

    #[error("Player is not in that room")]
    NotInRoom,

    #[error("Only the host can do that")]
    NotHost,

    #[error("Slot {0} is not available")]
    SlotUnavailable(usize),

    #[error("Cannot start a game in the current room state")]
    CannotStart,
}

impl GameError {
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidIntent(reason.into())
    }

    /// Stable wire code sent back to the client
    pub fn code(&self) -> &'static str {
        match self {
            GameError::InvalidIntent(_) => "invalid_intent",
            GameError::RoomFull => "room_full",
            GameError::RoomNotFound => "room_not_found",
            GameError::AlreadyInRoom => "already_in_room",
            GameError::NotInRoom => "not_in_room",
            GameError::NotHost => "not_host",
            GameError::SlotUnavailable(_) => "slot_unavailable",
            GameError::CannotStart => "cannot_start",
        }
    }
}

/// Internal fault while stepping a room. Contained per room by the scheduler.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PhysicsError {
    #[error("Player {0} reached a non-finite position")]
    NonFinitePlayer(PlayerId),

    #[error("Bullet {0} reached a non-finite position")]
    NonFiniteBullet(BulletId),
}
