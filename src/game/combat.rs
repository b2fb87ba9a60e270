//! Combat system - bullets, damage, fire rate

use glam::Vec2;

use crate::ws::protocol::{BulletId, BulletSnapshot, PlayerId};

/// Bullet speed in units per second
pub const BULLET_SPEED: f32 = 300.0;
/// Damage per hit
pub const BULLET_DAMAGE: i32 = 25;
/// Bullet lifetime in seconds
pub const BULLET_TTL: f32 = 5.0;
/// Minimum simulation time between two shots of the same tank
pub const FIRE_COOLDOWN: f64 = 0.2;
/// Live bullets allowed per room
pub const MAX_BULLETS_PER_ROOM: usize = 256;

/// Active bullet in a room
#[derive(Debug, Clone)]
pub struct Bullet {
    pub id: BulletId,
    pub owner_id: PlayerId,
    pub position: Vec2,
    pub velocity: Vec2,
    pub damage: i32,
    /// Remaining lifetime in seconds
    pub ttl: f32,
    /// Room simulation time at spawn
    pub spawned_at: f64,
}

impl Bullet {
    /// Create a bullet travelling along `direction` (must be normalized)
    pub fn new(
        id: BulletId,
        owner_id: PlayerId,
        position: Vec2,
        direction: Vec2,
        spawned_at: f64,
    ) -> Self {
        Self {
            id,
            owner_id,
            position,
            velocity: direction * BULLET_SPEED,
            damage: BULLET_DAMAGE,
            ttl: BULLET_TTL,
            spawned_at,
        }
    }

    /// Integrate position and burn lifetime
    pub fn advance(&mut self, dt: f32) {
        self.position += self.velocity * dt;
        self.ttl -= dt;
    }

    pub fn snapshot(&self) -> BulletSnapshot {
        BulletSnapshot {
            bullet_id: self.id,
            owner_id: self.owner_id,
            position: self.position,
            velocity: self.velocity,
            ttl: self.ttl,
            spawned_at: self.spawned_at,
        }
    }
}

/// Combat rules shared by intents and the physics step
pub struct CombatSystem;

impl CombatSystem {
    /// Check if a tank can fire given its last shot time
    pub fn can_fire(last_shot_at: Option<f64>, now: f64) -> bool {
        match last_shot_at {
            Some(last) => now - last >= FIRE_COOLDOWN,
            None => true,
        }
    }

    /// Turn a raw aim vector into a firing direction
    pub fn aim_direction(aim: Vec2) -> Option<Vec2> {
        if !aim.is_finite() {
            return None;
        }
        aim.try_normalize()
    }

    /// Apply damage to health, returns (new_health, is_dead)
    pub fn apply_damage(current_health: i32, damage: i32) -> (i32, bool) {
        let new_health = current_health.saturating_sub(damage).max(0);
        (new_health, new_health == 0)
    }
}
