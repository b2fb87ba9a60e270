//! Game simulation modules

pub mod combat;
pub mod error;
pub mod manager;
pub mod physics;
pub mod player;
pub mod room;
pub mod scheduler;
pub mod snapshot;

pub use error::GameError;
pub use manager::RoomManager;

use std::collections::BTreeSet;

use glam::Vec2;

use crate::ws::protocol::Direction;

/// Validated player intent, applied to a room under its lock
#[derive(Debug, Clone, PartialEq)]
pub enum Intent {
    /// Replace the held movement directions
    Move { directions: BTreeSet<Direction> },
    /// Fire along an aim vector
    Shoot { aim: Vec2 },
}
