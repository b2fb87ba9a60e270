//! Fallback snapshot cadence

use crate::util::time::SNAPSHOT_INTERVAL_TICKS;
use crate::ws::protocol::GameEvent;

use super::room::Room;

/// Decides when a room owes its subscribers a full authoritative snapshot
#[derive(Debug, Clone, Copy)]
pub struct SnapshotBuilder {
    /// Snapshot interval in ticks
    interval: u64,
}

impl SnapshotBuilder {
    pub fn new(interval: u64) -> Self {
        Self {
            interval: interval.max(1),
        }
    }

    /// Check if the room's current frame is a snapshot frame
    pub fn is_due(&self, frame: u64) -> bool {
        frame % self.interval == 0
    }

    /// Build a fallback snapshot if one is due and the room changed since the last one.
    /// Clears the dirty flag when a snapshot is produced.
    pub fn fallback(&self, room: &mut Room) -> Option<GameEvent> {
        if !self.is_due(room.frame) || !room.take_dirty() {
            return None;
        }
        Some(GameEvent::StateSnapshot {
            state: room.snapshot(),
        })
    }
}

impl Default for SnapshotBuilder {
    fn default() -> Self {
        Self::new(SNAPSHOT_INTERVAL_TICKS)
    }
}
