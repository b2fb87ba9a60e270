//! Room state: players, bullets, frame clock and intent application

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use glam::Vec2;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::ws::protocol::{
    BulletId, Envelope, GameEvent, PlayerId, PlayerSnapshot, RoomId, RoomSnapshot, RoomState,
    RoomSummary, ServerMsg,
};

use super::combat::{Bullet, CombatSystem, MAX_BULLETS_PER_ROOM};
use super::error::GameError;
use super::physics::{clamp_to_arena, ARENA_HEIGHT, ARENA_WIDTH, MOVEMENT_EPSILON};
use super::player::Player;
use super::Intent;

/// Distance from the arena edge for generated spawn points
const SPAWN_MARGIN: f32 = 50.0;

/// Fixed spawn points for the first eight slots, around the arena edge
const SLOT_SPAWNS: [(f32, f32); 8] = [
    (100.0, 100.0),
    (ARENA_WIDTH - 100.0, 100.0),
    (100.0, ARENA_HEIGHT - 100.0),
    (ARENA_WIDTH - 100.0, ARENA_HEIGHT - 100.0),
    (ARENA_WIDTH / 2.0, 100.0),
    (ARENA_WIDTH / 2.0, ARENA_HEIGHT - 100.0),
    (100.0, ARENA_HEIGHT / 2.0),
    (ARENA_WIDTH - 100.0, ARENA_HEIGHT / 2.0),
];

/// Room state (guarded by the room lock)
pub struct Room {
    pub id: RoomId,
    pub name: String,
    pub capacity: usize,
    pub host_id: Option<PlayerId>,
    pub created_at: DateTime<Utc>,
    pub state: RoomState,

    pub players: HashMap<PlayerId, Player>,
    pub bullets: BTreeMap<BulletId, Bullet>,

    /// Monotonic, advanced only by the physics step
    pub frame: u64,
    /// Accumulated simulation seconds, advanced only by the physics step
    pub sim_time: f64,

    /// Working buffer for the current tick's events
    pub pending_events: Vec<GameEvent>,
    state_changed: bool,
    game_over_announced: bool,

    next_seq: u64,
    next_bullet_id: BulletId,
    next_join_order: u64,
    rng: ChaCha8Rng,
}

impl Room {
    pub fn new(
        id: RoomId,
        name: String,
        capacity: usize,
        host_id: Option<PlayerId>,
        seed: u64,
    ) -> Self {
        Self {
            id,
            name,
            capacity,
            host_id,
            created_at: Utc::now(),
            state: RoomState::Waiting,
            players: HashMap::new(),
            bullets: BTreeMap::new(),
            frame: 0,
            sim_time: 0.0,
            pending_events: Vec::new(),
            state_changed: false,
            game_over_announced: false,
            next_seq: 0,
            next_bullet_id: 0,
            next_join_order: 0,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.players.len() >= self.capacity
    }

    pub fn player(&self, id: &PlayerId) -> Option<&Player> {
        self.players.get(id)
    }

    pub fn mark_dirty(&mut self) {
        self.state_changed = true;
    }

    /// Read and clear the dirty flag
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.state_changed)
    }

    pub fn next_bullet_id(&mut self) -> BulletId {
        self.next_bullet_id += 1;
        self.next_bullet_id
    }

    /// Wrap a message with the next room sequence number
    pub fn stamp(&mut self, msg: ServerMsg) -> Envelope {
        self.next_seq += 1;
        Envelope::room(self.id, self.next_seq, self.frame, msg)
    }

    pub fn stamp_event(&mut self, event: GameEvent) -> Envelope {
        self.stamp(ServerMsg::Event { event })
    }

    /// Add a player in the lowest free slot
    pub fn add_player(&mut self, id: PlayerId, display_name: String) -> Result<&Player, GameError> {
        if self.players.contains_key(&id) {
            return Err(GameError::AlreadyInRoom);
        }
        if self.is_full() {
            return Err(GameError::RoomFull);
        }

        let slot = (0..self.capacity)
            .find(|slot| !self.players.values().any(|p| p.slot == *slot))
            .unwrap_or(self.players.len());
        let spawn = self.spawn_point(slot);

        self.next_join_order += 1;
        let player = Player::new(id, display_name, slot, self.next_join_order, spawn);
        self.players.insert(id, player);

        if self.host_id.is_none() {
            self.host_id = Some(id);
        }
        self.mark_dirty();

        self.players.get(&id).ok_or(GameError::RoomNotFound)
    }

    /// Remove a player. The host role passes to the earliest-joined player left.
    pub fn remove_player(&mut self, id: &PlayerId) -> Option<Player> {
        let player = self.players.remove(id)?;
        self.mark_dirty();

        if self.host_id == Some(*id) {
            self.host_id = self
                .players
                .values()
                .min_by_key(|p| p.join_order)
                .map(|p| p.id);
        }

        Some(player)
    }

    /// Validate and apply a player intent.
    ///
    /// Returns the notification event to broadcast, or `None` when the intent
    /// changed nothing observable.
    pub fn apply_intent(
        &mut self,
        player_id: &PlayerId,
        intent: Intent,
    ) -> Result<Option<GameEvent>, GameError> {
        let now = self.sim_time;
        let bullet_count = self.bullets.len();

        let player = self
            .players
            .get_mut(player_id)
            .ok_or_else(|| GameError::invalid("player is not in this room"))?;
        if !player.alive {
            return Err(GameError::invalid("player is dead"));
        }

        match intent {
            Intent::Move { directions } => {
                if !player.set_directions(directions) {
                    return Ok(None);
                }
                let event = GameEvent::PlayerMove {
                    player_id: player.id,
                    directions: player.directions.clone(),
                    position: player.position,
                };
                self.mark_dirty();
                Ok(Some(event))
            }
            Intent::Shoot { aim } => {
                let direction = CombatSystem::aim_direction(aim)
                    .ok_or_else(|| GameError::invalid("aim vector must be finite and non-zero"))?;
                if bullet_count >= MAX_BULLETS_PER_ROOM {
                    return Err(GameError::invalid("room bullet limit reached"));
                }
                if !player.can_fire(now) {
                    return Err(GameError::invalid("weapon is cooling down"));
                }
                player.last_shot_at = Some(now);
                let (owner_id, origin) = (player.id, player.position);

                let bullet_id = self.next_bullet_id();
                let bullet = Bullet::new(bullet_id, owner_id, origin, direction, now);
                let event = GameEvent::BulletFired {
                    bullet_id,
                    owner_id,
                    position: bullet.position,
                    velocity: bullet.velocity,
                    damage: bullet.damage,
                };
                self.bullets.insert(bullet_id, bullet);
                self.mark_dirty();
                Ok(Some(event))
            }
        }
    }

    /// Overwrite a player's position with an accepted client prediction
    pub fn accept_client_position(&mut self, player_id: &PlayerId, position: Vec2) {
        if let Some(player) = self.players.get_mut(player_id) {
            let position = clamp_to_arena(position);
            if player.position.distance(position) > MOVEMENT_EPSILON {
                player.position = position;
                self.state_changed = true;
            }
        }
    }

    /// Bring a dead player back at its slot spawn point
    pub fn respawn(&mut self, player_id: &PlayerId) -> Result<PlayerSnapshot, GameError> {
        let slot = match self.players.get(player_id) {
            Some(player) if player.alive => {
                return Err(GameError::invalid("player is alive"));
            }
            Some(player) => player.slot,
            None => return Err(GameError::invalid("player is not in this room")),
        };

        let spawn = self.spawn_point(slot);
        let player = self
            .players
            .get_mut(player_id)
            .ok_or_else(|| GameError::invalid("player is not in this room"))?;
        player.respawn(spawn);
        let snapshot = player.snapshot();

        self.game_over_announced = false;
        self.mark_dirty();
        Ok(snapshot)
    }

    /// Move a player to a free slot and that slot's spawn point.
    /// Returns the old slot and the new position.
    pub fn change_slot(&mut self, player_id: &PlayerId, target: usize) -> Result<(usize, Vec2), GameError> {
        if self.state == RoomState::Playing {
            return Err(GameError::invalid("slots are locked while a round is running"));
        }
        let old_slot = self
            .players
            .get(player_id)
            .map(|p| p.slot)
            .ok_or_else(|| GameError::invalid("player is not in this room"))?;
        let taken = self
            .players
            .values()
            .any(|p| p.id != *player_id && p.slot == target);
        if target >= self.capacity || taken {
            return Err(GameError::SlotUnavailable(target));
        }

        let spawn = self.spawn_point(target);
        if let Some(player) = self.players.get_mut(player_id) {
            player.slot = target;
            player.position = spawn;
            player.velocity = Vec2::ZERO;
            player.directions.clear();
        }
        self.mark_dirty();
        Ok((old_slot, spawn))
    }

    /// Free slots in ascending order
    pub fn available_slots(&self) -> Vec<usize> {
        (0..self.capacity)
            .filter(|slot| !self.players.values().any(|p| p.slot == *slot))
            .collect()
    }

    /// Begin a round: bullets are cleared and every tank is back at its
    /// slot spawn point with full health.
    pub fn start_game(&mut self) -> Result<RoomSnapshot, GameError> {
        if self.state == RoomState::Playing || self.players.is_empty() {
            return Err(GameError::CannotStart);
        }

        self.bullets.clear();
        let mut slots: Vec<(PlayerId, usize)> = self.players.values().map(|p| (p.id, p.slot)).collect();
        slots.sort_by_key(|(_, slot)| *slot);
        for (player_id, slot) in slots {
            let spawn = self.spawn_point(slot);
            if let Some(player) = self.players.get_mut(&player_id) {
                player.respawn(spawn);
            }
        }

        self.state = RoomState::Playing;
        self.game_over_announced = false;
        self.mark_dirty();
        Ok(self.snapshot())
    }

    /// Put a tank whose state went non-finite back at its slot spawn point
    pub fn restore_player(&mut self, player_id: &PlayerId) {
        let Some(slot) = self.players.get(player_id).map(|p| p.slot) else {
            return;
        };
        let spawn = self.spawn_point(slot);
        if let Some(player) = self.players.get_mut(player_id) {
            player.position = spawn;
            player.velocity = Vec2::ZERO;
            player.directions.clear();
        }
        self.mark_dirty();
    }

    /// The sole survivor, reported once per round
    pub fn decided_winner(&mut self) -> Option<PlayerId> {
        if self.game_over_announced || self.players.len() < 2 {
            return None;
        }
        let mut alive = self.players.values().filter(|p| p.alive);
        let winner = alive.next()?;
        if alive.next().is_some() {
            return None;
        }
        let winner_id = winner.id;
        self.game_over_announced = true;
        self.state = RoomState::Finished;
        Some(winner_id)
    }

    fn spawn_point(&mut self, slot: usize) -> Vec2 {
        match SLOT_SPAWNS.get(slot) {
            Some(&(x, y)) => Vec2::new(x, y),
            None => Vec2::new(
                self.rng.gen_range(SPAWN_MARGIN..ARENA_WIDTH - SPAWN_MARGIN),
                self.rng.gen_range(SPAWN_MARGIN..ARENA_HEIGHT - SPAWN_MARGIN),
            ),
        }
    }

    /// Full authoritative state
    pub fn snapshot(&self) -> RoomSnapshot {
        let mut players: Vec<PlayerSnapshot> = self.players.values().map(Player::snapshot).collect();
        players.sort_by_key(|p| p.slot);

        RoomSnapshot {
            room_id: self.id,
            room_state: self.state,
            sim_time: self.sim_time,
            players,
            bullets: self.bullets.values().map(Bullet::snapshot).collect(),
        }
    }

    pub fn summary(&self) -> RoomSummary {
        RoomSummary {
            room_id: self.id,
            name: self.name.clone(),
            host_id: self.host_id,
            current_players: self.players.len(),
            max_players: self.capacity,
            room_state: self.state,
            available_slots: self.available_slots(),
            created_at: self.created_at,
        }
    }
}
