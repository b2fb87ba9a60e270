//! Fixed-step physics and collision resolution
//!
//! Arena bounds, hit radius and speeds are engine constants shared with client
//! prediction. Changing any of them is a protocol change.

use glam::Vec2;
use tracing::trace;

use crate::ws::protocol::{BulletId, DestroyReason, GameEvent, PlayerId};

use super::combat::CombatSystem;
use super::error::PhysicsError;
use super::room::Room;

/// Arena width in world units
pub const ARENA_WIDTH: f32 = 800.0;
/// Arena height in world units
pub const ARENA_HEIGHT: f32 = 600.0;
/// Bullet-to-tank hit radius
pub const HIT_RADIUS: f32 = 25.0;
/// Position changes at or below this are treated as float jitter
pub const MOVEMENT_EPSILON: f32 = 1e-3;

/// Clamp a point to the arena rectangle
pub fn clamp_to_arena(position: Vec2) -> Vec2 {
    position.clamp(Vec2::ZERO, Vec2::new(ARENA_WIDTH, ARENA_HEIGHT))
}

/// Check whether a point lies inside the arena (edges included)
pub fn in_arena(position: Vec2) -> bool {
    (0.0..=ARENA_WIDTH).contains(&position.x) && (0.0..=ARENA_HEIGHT).contains(&position.y)
}

/// Circle test between a bullet and a tank centre
pub fn check_hit(bullet: Vec2, target: Vec2) -> bool {
    bullet.distance_squared(target) < HIT_RADIUS * HIT_RADIUS
}

/// Physics system for advancing a room by one step
pub struct PhysicsSystem;

impl PhysicsSystem {
    /// Advance every entity in the room by exactly one step of `dt`.
    ///
    /// Returns the events of the tick in causal order: boundary/expiry
    /// destructions first, then per-bullet collision, collision destruction
    /// and death events, then a game-over event if the tick decided the game.
    ///
    /// Entities with non-finite state are quarantined first: such bullets are
    /// removed, such tanks go back to their spawn point, the step is abandoned
    /// with an error, and the room steps normally from the next tick.
    pub fn step(room: &mut Room, dt: f32) -> Result<Vec<GameEvent>, PhysicsError> {
        Self::quarantine(room)?;

        room.pending_events.clear();
        room.frame += 1;
        room.sim_time += f64::from(dt);

        // Tanks
        let mut moved = false;
        for player in room.players.values_mut() {
            if !player.alive {
                continue;
            }
            if player.advance(dt) {
                moved = true;
            }
        }
        if moved {
            room.mark_dirty();
        }

        // Bullets: integrate, then boundary before TTL
        let mut expired: Vec<(BulletId, DestroyReason)> = Vec::new();
        for bullet in room.bullets.values_mut() {
            bullet.advance(dt);
            if !in_arena(bullet.position) {
                expired.push((bullet.id, DestroyReason::Boundary));
            } else if bullet.ttl <= 0.0 {
                expired.push((bullet.id, DestroyReason::Expired));
            }
        }
        for (bullet_id, reason) in expired {
            room.bullets.remove(&bullet_id);
            room.pending_events
                .push(GameEvent::BulletDestroyed { bullet_id, reason });
        }

        let deaths = Self::resolve_collisions(room);

        if deaths > 0 {
            if let Some(winner_id) = room.decided_winner() {
                room.pending_events.push(GameEvent::GameOver { winner_id });
            }
        }

        if !room.pending_events.is_empty() {
            room.mark_dirty();
        }

        trace!(
            room_id = %room.id,
            frame = room.frame,
            events = room.pending_events.len(),
            "Room stepped"
        );

        Ok(std::mem::take(&mut room.pending_events))
    }

    /// Drop or reset entities that can no longer be integrated
    fn quarantine(room: &mut Room) -> Result<(), PhysicsError> {
        let bad_bullets: Vec<BulletId> = room
            .bullets
            .values()
            .filter(|b| !(b.position.is_finite() && b.velocity.is_finite()))
            .map(|b| b.id)
            .collect();
        let bad_players: Vec<PlayerId> = room
            .players
            .values()
            .filter(|p| !p.position.is_finite())
            .map(|p| p.id)
            .collect();

        for bullet_id in &bad_bullets {
            room.bullets.remove(bullet_id);
        }
        for player_id in &bad_players {
            room.restore_player(player_id);
        }
        if !bad_bullets.is_empty() {
            room.mark_dirty();
        }

        match (bad_players.first(), bad_bullets.first()) {
            (Some(player_id), _) => Err(PhysicsError::NonFinitePlayer(*player_id)),
            (None, Some(bullet_id)) => Err(PhysicsError::NonFiniteBullet(*bullet_id)),
            (None, None) => Ok(()),
        }
    }

    /// Collision pass. Returns the number of deaths caused this tick.
    ///
    /// Targets are the tanks alive when the pass starts, in join order, so a
    /// tank destroyed by an earlier bullet still absorbs later bullets of the
    /// same tick (at zero health, without a second death).
    fn resolve_collisions(room: &mut Room) -> usize {
        let mut targets: Vec<(u64, PlayerId)> = room
            .players
            .values()
            .filter(|p| p.alive)
            .map(|p| (p.join_order, p.id))
            .collect();
        targets.sort_unstable();

        // Bullets iterate in ascending id order
        let mut hits: Vec<(BulletId, PlayerId)> = Vec::new();
        for bullet in room.bullets.values() {
            let hit = targets.iter().find(|(_, target_id)| {
                *target_id != bullet.owner_id
                    && room
                        .players
                        .get(target_id)
                        .map(|target| check_hit(bullet.position, target.position))
                        .unwrap_or(false)
            });
            if let Some((_, target_id)) = hit {
                hits.push((bullet.id, *target_id));
            }
        }

        let mut deaths = 0;
        for (bullet_id, target_id) in hits {
            let Some(bullet) = room.bullets.remove(&bullet_id) else {
                continue;
            };
            let Some(target) = room.players.get_mut(&target_id) else {
                continue;
            };

            let was_alive = target.health > 0;
            let (new_health, killed) = CombatSystem::apply_damage(target.health, bullet.damage);
            target.health = new_health;

            room.pending_events.push(GameEvent::Collision {
                bullet_id,
                target_id,
                damage: bullet.damage,
                new_health,
                position: bullet.position,
            });
            room.pending_events.push(GameEvent::BulletDestroyed {
                bullet_id,
                reason: DestroyReason::Collision,
            });

            if killed && was_alive {
                target.alive = false;
                target.directions.clear();
                target.velocity = Vec2::ZERO;
                deaths += 1;
                room.pending_events.push(GameEvent::PlayerDeath {
                    player_id: target_id,
                    killer_id: bullet.owner_id,
                    position: target.position,
                });
            }
        }

        deaths
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::combat::{Bullet, BULLET_DAMAGE, BULLET_TTL};
    use crate::ws::protocol::Direction;
    use uuid::Uuid;

    const DT: f32 = 1.0 / 60.0;

    fn room_with_players(count: usize) -> (Room, Vec<PlayerId>) {
        let mut room = Room::new(Uuid::new_v4(), "arena".to_string(), 8, None, 7);
        let ids: Vec<PlayerId> = (0..count).map(|_| Uuid::new_v4()).collect();
        for (i, id) in ids.iter().enumerate() {
            room.add_player(*id, format!("p{}", i)).unwrap();
        }
        (room, ids)
    }

    fn place(room: &mut Room, id: PlayerId, x: f32, y: f32) {
        room.players.get_mut(&id).unwrap().position = Vec2::new(x, y);
    }

    fn spawn_bullet(room: &mut Room, owner: PlayerId, position: Vec2, velocity: Vec2) -> BulletId {
        let id = room.next_bullet_id();
        let mut bullet = Bullet::new(id, owner, position, Vec2::X, room.sim_time);
        bullet.velocity = velocity;
        room.bullets.insert(id, bullet);
        id
    }

    fn count<F: Fn(&GameEvent) -> bool>(events: &[GameEvent], f: F) -> usize {
        events.iter().filter(|e| f(e)).count()
    }

    #[test]
    fn frame_and_time_advance_by_exactly_one_step() {
        let (mut room, _) = room_with_players(1);
        for n in 1..=120u64 {
            let before = room.sim_time;
            PhysicsSystem::step(&mut room, DT).unwrap();
            assert_eq!(room.frame, n);
            assert!((room.sim_time - before - f64::from(DT)).abs() < 1e-12);
        }
    }

    #[test]
    fn tank_moving_right_covers_speed_in_one_second() {
        let (mut room, ids) = room_with_players(1);
        place(&mut room, ids[0], 0.0, 0.0);
        room.players
            .get_mut(&ids[0])
            .unwrap()
            .set_directions([Direction::Right].into_iter().collect());

        for _ in 0..60 {
            PhysicsSystem::step(&mut room, DT).unwrap();
        }

        let position = room.players[&ids[0]].position;
        assert!((position.x - 300.0).abs() < 0.01, "x = {}", position.x);
        assert!(position.y.abs() < 1e-6);
    }

    #[test]
    fn idle_room_is_not_dirty() {
        let (mut room, _) = room_with_players(2);
        room.take_dirty();
        for _ in 0..30 {
            let events = PhysicsSystem::step(&mut room, DT).unwrap();
            assert!(events.is_empty());
        }
        assert!(!room.take_dirty());
    }

    #[test]
    fn movement_marks_room_dirty() {
        let (mut room, ids) = room_with_players(1);
        room.take_dirty();
        room.players
            .get_mut(&ids[0])
            .unwrap()
            .set_directions([Direction::Down].into_iter().collect());
        PhysicsSystem::step(&mut room, DT).unwrap();
        assert!(room.take_dirty());
    }

    #[test]
    fn bullet_leaving_arena_is_destroyed_at_boundary() {
        let (mut room, ids) = room_with_players(1);
        place(&mut room, ids[0], 400.0, 590.0);
        let bullet_id = spawn_bullet(&mut room, ids[0], Vec2::new(0.0, 0.0), Vec2::new(300.0, 0.0));

        let mut destroyed_at = None;
        for _ in 0..400 {
            let events = PhysicsSystem::step(&mut room, DT).unwrap();
            let boundary = count(&events, |e| {
                matches!(e, GameEvent::BulletDestroyed { bullet_id: id, reason: DestroyReason::Boundary } if *id == bullet_id)
            });
            let expired = count(&events, |e| {
                matches!(e, GameEvent::BulletDestroyed { reason: DestroyReason::Expired, .. })
            });
            assert_eq!(expired, 0);
            if boundary == 1 {
                destroyed_at = Some(room.sim_time);
                break;
            }
        }

        let t = destroyed_at.expect("bullet never left the arena");
        assert!((t - 2.67).abs() < 0.02, "destroyed at {}", t);
        assert!(room.bullets.is_empty());
    }

    #[test]
    fn expired_bullet_is_destroyed_once() {
        let (mut room, ids) = room_with_players(1);
        place(&mut room, ids[0], 0.0, 0.0);
        let bullet_id = spawn_bullet(&mut room, ids[0], Vec2::new(400.0, 300.0), Vec2::ZERO);

        let mut expiries = 0;
        let ticks = (BULLET_TTL / DT).ceil() as usize + 10;
        for _ in 0..ticks {
            let events = PhysicsSystem::step(&mut room, DT).unwrap();
            expiries += count(&events, |e| {
                matches!(e, GameEvent::BulletDestroyed { bullet_id: id, reason: DestroyReason::Expired } if *id == bullet_id)
            });
        }
        assert_eq!(expiries, 1);
        assert!(room.bullets.is_empty());
    }

    #[test]
    fn boundary_wins_over_expiry_in_same_tick() {
        let (mut room, ids) = room_with_players(1);
        let bullet_id = spawn_bullet(&mut room, ids[0], Vec2::new(799.0, 300.0), Vec2::new(300.0, 0.0));
        room.bullets.get_mut(&bullet_id).unwrap().ttl = DT / 2.0;

        let events = PhysicsSystem::step(&mut room, DT).unwrap();
        assert_eq!(
            events,
            vec![GameEvent::BulletDestroyed {
                bullet_id,
                reason: DestroyReason::Boundary
            }]
        );
    }

    #[test]
    fn collision_damages_target_and_destroys_bullet() {
        let (mut room, ids) = room_with_players(2);
        place(&mut room, ids[0], 100.0, 100.0);
        place(&mut room, ids[1], 300.0, 100.0);
        let bullet_id = spawn_bullet(&mut room, ids[0], Vec2::new(290.0, 100.0), Vec2::ZERO);

        let events = PhysicsSystem::step(&mut room, DT).unwrap();

        assert_eq!(count(&events, |e| matches!(e, GameEvent::Collision { .. })), 1);
        assert_eq!(
            count(&events, |e| matches!(e, GameEvent::BulletDestroyed { reason: DestroyReason::Collision, .. })),
            1
        );
        match &events[0] {
            GameEvent::Collision {
                bullet_id: id,
                target_id,
                damage,
                new_health,
                ..
            } => {
                assert_eq!(*id, bullet_id);
                assert_eq!(*target_id, ids[1]);
                assert_eq!(*damage, BULLET_DAMAGE);
                assert_eq!(*new_health, 100 - BULLET_DAMAGE);
            }
            other => panic!("expected collision first, got {:?}", other),
        }
        assert_eq!(room.players[&ids[1]].health, 100 - BULLET_DAMAGE);
        assert!(room.bullets.is_empty());
    }

    #[test]
    fn bullet_never_hits_its_owner() {
        let (mut room, ids) = room_with_players(1);
        place(&mut room, ids[0], 300.0, 300.0);
        spawn_bullet(&mut room, ids[0], Vec2::new(300.0, 300.0), Vec2::ZERO);

        let events = PhysicsSystem::step(&mut room, DT).unwrap();
        assert!(events.is_empty());
        assert_eq!(room.bullets.len(), 1);
    }

    #[test]
    fn killing_blow_emits_single_death_credited_to_owner() {
        let (mut room, ids) = room_with_players(3);
        place(&mut room, ids[0], 50.0, 50.0);
        place(&mut room, ids[1], 400.0, 300.0);
        place(&mut room, ids[2], 700.0, 500.0);
        room.players.get_mut(&ids[1]).unwrap().health = 10;

        spawn_bullet(&mut room, ids[0], Vec2::new(400.0, 300.0), Vec2::ZERO);
        spawn_bullet(&mut room, ids[2], Vec2::new(405.0, 300.0), Vec2::ZERO);

        let events = PhysicsSystem::step(&mut room, DT).unwrap();

        let deaths: Vec<&GameEvent> = events
            .iter()
            .filter(|e| matches!(e, GameEvent::PlayerDeath { .. }))
            .collect();
        assert_eq!(deaths.len(), 1);
        match deaths[0] {
            GameEvent::PlayerDeath { player_id, killer_id, .. } => {
                assert_eq!(*player_id, ids[1]);
                assert_eq!(*killer_id, ids[0]);
            }
            _ => unreachable!(),
        }

        // Second bullet still registers against the zero-health tank
        let healths: Vec<i32> = events
            .iter()
            .filter_map(|e| match e {
                GameEvent::Collision { new_health, .. } => Some(*new_health),
                _ => None,
            })
            .collect();
        assert_eq!(healths, vec![0, 0]);
        assert_eq!(
            count(&events, |e| matches!(e, GameEvent::BulletDestroyed { reason: DestroyReason::Collision, .. })),
            2
        );
        assert!(!room.players[&ids[1]].alive);
        assert_eq!(room.players[&ids[1]].health, 0);
    }

    #[test]
    fn dead_tank_produces_no_further_deaths() {
        let (mut room, ids) = room_with_players(2);
        place(&mut room, ids[0], 50.0, 50.0);
        place(&mut room, ids[1], 400.0, 300.0);
        {
            let target = room.players.get_mut(&ids[1]).unwrap();
            target.health = 0;
            target.alive = false;
        }
        spawn_bullet(&mut room, ids[0], Vec2::new(400.0, 300.0), Vec2::ZERO);

        let events = PhysicsSystem::step(&mut room, DT).unwrap();
        assert!(events.is_empty());
        assert_eq!(room.bullets.len(), 1);
    }

    #[test]
    fn tie_break_prefers_earliest_joined_target() {
        let (mut room, ids) = room_with_players(3);
        place(&mut room, ids[0], 50.0, 50.0);
        place(&mut room, ids[1], 400.0, 300.0);
        place(&mut room, ids[2], 400.0, 300.0);
        spawn_bullet(&mut room, ids[0], Vec2::new(400.0, 300.0), Vec2::ZERO);

        let events = PhysicsSystem::step(&mut room, DT).unwrap();
        assert_eq!(count(&events, |e| matches!(e, GameEvent::Collision { .. })), 1);
        assert!(matches!(
            events[0],
            GameEvent::Collision { target_id, .. } if target_id == ids[1]
        ));
        assert_eq!(room.players[&ids[2]].health, 100);
    }

    #[test]
    fn expiry_events_precede_collision_events() {
        let (mut room, ids) = room_with_players(2);
        place(&mut room, ids[0], 50.0, 50.0);
        place(&mut room, ids[1], 400.0, 300.0);
        spawn_bullet(&mut room, ids[0], Vec2::new(400.0, 300.0), Vec2::ZERO);
        let stray = spawn_bullet(&mut room, ids[1], Vec2::new(800.0, 10.0), Vec2::new(300.0, 0.0));

        let events = PhysicsSystem::step(&mut room, DT).unwrap();
        assert_eq!(
            events[0],
            GameEvent::BulletDestroyed {
                bullet_id: stray,
                reason: DestroyReason::Boundary
            }
        );
        assert!(matches!(events[1], GameEvent::Collision { .. }));
    }

    #[test]
    fn last_tank_standing_ends_the_game() {
        let (mut room, ids) = room_with_players(2);
        place(&mut room, ids[0], 50.0, 50.0);
        place(&mut room, ids[1], 400.0, 300.0);
        room.players.get_mut(&ids[1]).unwrap().health = BULLET_DAMAGE;
        spawn_bullet(&mut room, ids[0], Vec2::new(400.0, 300.0), Vec2::ZERO);

        let events = PhysicsSystem::step(&mut room, DT).unwrap();
        assert_eq!(
            events.last(),
            Some(&GameEvent::GameOver { winner_id: ids[0] })
        );
    }

    #[test]
    fn non_finite_bullet_is_removed_and_room_recovers() {
        let (mut room, ids) = room_with_players(1);
        spawn_bullet(&mut room, ids[0], Vec2::new(100.0, 100.0), Vec2::new(f32::NAN, 0.0));
        spawn_bullet(&mut room, ids[0], Vec2::new(300.0, 300.0), Vec2::new(0.0, 10.0));
        room.take_dirty();

        let err = PhysicsSystem::step(&mut room, DT).unwrap_err();
        assert!(matches!(err, PhysicsError::NonFiniteBullet(_)));
        assert_eq!(room.frame, 0);
        assert_eq!(room.bullets.len(), 1);
        assert!(room.take_dirty());

        assert!(PhysicsSystem::step(&mut room, DT).is_ok());
        assert_eq!(room.frame, 1);
        assert_eq!(room.bullets.len(), 1);
    }

    #[test]
    fn non_finite_tank_goes_back_to_spawn() {
        let (mut room, ids) = room_with_players(1);
        {
            let player = room.players.get_mut(&ids[0]).unwrap();
            player.alive = false;
            player.position = Vec2::new(f32::INFINITY, 10.0);
        }

        let err = PhysicsSystem::step(&mut room, DT).unwrap_err();
        assert_eq!(err, PhysicsError::NonFinitePlayer(ids[0]));
        assert_eq!(room.players[&ids[0]].position, Vec2::new(100.0, 100.0));
        assert!(PhysicsSystem::step(&mut room, DT).is_ok());
    }
}
