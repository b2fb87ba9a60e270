//! Tank state and per-tick movement

use std::collections::BTreeSet;

use glam::Vec2;

use crate::ws::protocol::{Direction, PlayerId, PlayerSnapshot};

use super::combat::CombatSystem;
use super::physics::{clamp_to_arena, MOVEMENT_EPSILON};

/// Tank speed per held axis, in units per second
pub const TANK_SPEED: f32 = 300.0;
/// Full health
pub const MAX_HEALTH: i32 = 100;

/// Player state in a room (authoritative)
#[derive(Debug, Clone)]
pub struct Player {
    pub id: PlayerId,
    pub display_name: String,
    pub slot: usize,
    /// Position in the room's join sequence, used for deterministic tie-breaks
    pub join_order: u64,

    // Position and movement
    pub position: Vec2,
    pub velocity: Vec2,
    pub directions: BTreeSet<Direction>,

    // Combat
    pub health: i32,
    pub max_health: i32,
    pub alive: bool,
    pub last_shot_at: Option<f64>,
}

impl Player {
    pub fn new(
        id: PlayerId,
        display_name: String,
        slot: usize,
        join_order: u64,
        spawn: Vec2,
    ) -> Self {
        Self {
            id,
            display_name,
            slot,
            join_order,
            position: spawn,
            velocity: Vec2::ZERO,
            directions: BTreeSet::new(),
            health: MAX_HEALTH,
            max_health: MAX_HEALTH,
            alive: true,
            last_shot_at: None,
        }
    }

    /// Velocity produced by a set of held directions. Axes are not normalized,
    /// so diagonals are faster; clients predict with the same rule.
    pub fn velocity_for(directions: &BTreeSet<Direction>) -> Vec2 {
        directions
            .iter()
            .fold(Vec2::ZERO, |acc, d| acc + d.axis())
            * TANK_SPEED
    }

    /// Replace held directions. Returns true if the set changed.
    pub fn set_directions(&mut self, directions: BTreeSet<Direction>) -> bool {
        let changed = self.directions != directions;
        self.velocity = Self::velocity_for(&directions);
        self.directions = directions;
        changed
    }

    /// Integrate one step and clamp to the arena.
    /// Returns true if the tank moved more than the jitter epsilon.
    pub fn advance(&mut self, dt: f32) -> bool {
        let previous = self.position;
        self.velocity = Self::velocity_for(&self.directions);
        self.position = clamp_to_arena(self.position + self.velocity * dt);
        self.position.distance(previous) > MOVEMENT_EPSILON
    }

    pub fn can_fire(&self, now: f64) -> bool {
        self.alive && CombatSystem::can_fire(self.last_shot_at, now)
    }

    /// Bring a dead tank back at `spawn`
    pub fn respawn(&mut self, spawn: Vec2) {
        self.position = spawn;
        self.velocity = Vec2::ZERO;
        self.directions.clear();
        self.health = self.max_health;
        self.alive = true;
        self.last_shot_at = None;
    }

    pub fn snapshot(&self) -> PlayerSnapshot {
        PlayerSnapshot {
            player_id: self.id,
            display_name: self.display_name.clone(),
            slot: self.slot,
            position: self.position,
            velocity: self.velocity,
            health: self.health,
            max_health: self.max_health,
            alive: self.alive,
            directions: self.directions.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::physics::{ARENA_HEIGHT, ARENA_WIDTH};
    use uuid::Uuid;

    fn player_at(x: f32, y: f32) -> Player {
        Player::new(Uuid::new_v4(), "tank".to_string(), 0, 0, Vec2::new(x, y))
    }

    fn held(directions: &[Direction]) -> BTreeSet<Direction> {
        directions.iter().copied().collect()
    }

    #[test]
    fn idle_tank_does_not_move() {
        let mut player = player_at(100.0, 100.0);
        assert!(!player.advance(1.0 / 60.0));
        assert_eq!(player.position, Vec2::new(100.0, 100.0));
    }

    #[test]
    fn opposite_directions_cancel() {
        let mut player = player_at(100.0, 100.0);
        player.set_directions(held(&[Direction::Left, Direction::Right]));
        assert!(!player.advance(1.0 / 60.0));
    }

    #[test]
    fn diagonal_moves_both_axes() {
        let mut player = player_at(100.0, 100.0);
        player.set_directions(held(&[Direction::Up, Direction::Right]));
        assert!(player.advance(0.1));
        assert!((player.position.x - 130.0).abs() < 1e-3);
        assert!((player.position.y - 70.0).abs() < 1e-3);
    }

    #[test]
    fn movement_is_clamped_to_arena() {
        let mut player = player_at(ARENA_WIDTH - 1.0, ARENA_HEIGHT - 1.0);
        player.set_directions(held(&[Direction::Down, Direction::Right]));
        player.advance(1.0);
        assert_eq!(player.position, Vec2::new(ARENA_WIDTH, ARENA_HEIGHT));

        // Pinned against the wall: no movement reported
        assert!(!player.advance(1.0 / 60.0));
    }

    #[test]
    fn set_directions_reports_change() {
        let mut player = player_at(0.0, 0.0);
        assert!(player.set_directions(held(&[Direction::Up])));
        assert!(!player.set_directions(held(&[Direction::Up])));
        assert!(player.set_directions(BTreeSet::new()));
        assert_eq!(player.velocity, Vec2::ZERO);
    }

    #[test]
    fn respawn_restores_health() {
        let mut player = player_at(10.0, 10.0);
        player.health = 0;
        player.alive = false;
        player.respawn(Vec2::new(100.0, 100.0));
        assert!(player.alive);
        assert_eq!(player.health, MAX_HEALTH);
        assert_eq!(player.position, Vec2::new(100.0, 100.0));
    }
}
