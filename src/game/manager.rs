//! Room registry, membership and per-room locking

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info};
use uuid::Uuid;

use crate::ws::dispatch::Subscriber;
use crate::ws::protocol::{Envelope, PlayerId, RoomId, RoomSummary};

use super::error::{GameError, PhysicsError};
use super::physics::PhysicsSystem;
use super::player::Player;
use super::room::Room;
use super::snapshot::SnapshotBuilder;

/// Shared handle to one room.
///
/// The room state sits behind its own exclusive lock so intent application and
/// the physics step never interleave. The guard is never held across an await.
pub struct RoomHandle {
    pub id: RoomId,
    state: Mutex<Room>,
    subscribers: DashMap<PlayerId, Subscriber>,
    closed: AtomicBool,
}

impl RoomHandle {
    fn new(room: Room) -> Self {
        Self {
            id: room.id,
            state: Mutex::new(room),
            subscribers: DashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Lock the room state
    pub fn lock(&self) -> MutexGuard<'_, Room> {
        self.state.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn player_count(&self) -> usize {
        self.state.lock().players.len()
    }

    pub fn summary(&self) -> RoomSummary {
        self.state.lock().summary()
    }

    /// Current subscriber set, cloned so callers can await on sends
    pub fn subscribers(&self) -> Vec<Subscriber> {
        self.subscribers.iter().map(|s| s.value().clone()).collect()
    }

    pub fn subscribe(&self, subscriber: Subscriber) {
        self.subscribers.insert(subscriber.player_id, subscriber);
    }

    pub fn unsubscribe(&self, player_id: &PlayerId) -> Option<Subscriber> {
        self.subscribers.remove(player_id).map(|(_, s)| s)
    }

    /// Remove a subscriber only if it is still the same connection
    pub fn unsubscribe_connection(&self, subscriber: &Subscriber) -> bool {
        self.subscribers
            .remove_if(&subscriber.player_id, |_, current| current.same_connection(subscriber))
            .is_some()
    }

    fn take_subscribers(&self) -> Vec<Subscriber> {
        let ids: Vec<PlayerId> = self.subscribers.iter().map(|s| *s.key()).collect();
        ids.iter().filter_map(|id| self.unsubscribe(id)).collect()
    }
}

/// A player removed from a room
pub struct Departure {
    pub handle: Arc<RoomHandle>,
    pub player: Player,
}

/// A room removed from the registry, with the subscribers it still had
pub struct ClosedRoom {
    pub handle: Arc<RoomHandle>,
    pub subscribers: Vec<Subscriber>,
}

/// Owns every room and the player-to-room membership map
pub struct RoomManager {
    rooms: DashMap<RoomId, Arc<RoomHandle>>,
    /// A player belongs to at most one room
    memberships: DashMap<PlayerId, RoomId>,
    max_players: usize,
}

impl RoomManager {
    pub fn new(max_players: usize) -> Self {
        Self {
            rooms: DashMap::new(),
            memberships: DashMap::new(),
            max_players: max_players.max(1),
        }
    }

    pub fn max_players(&self) -> usize {
        self.max_players
    }

    /// Open a new room. Requested capacity is clamped to the server maximum.
    pub fn open(
        &self,
        name: String,
        host_id: Option<PlayerId>,
        max_players: Option<usize>,
    ) -> Arc<RoomHandle> {
        let capacity = max_players
            .unwrap_or(self.max_players)
            .clamp(1, self.max_players);
        let room = Room::new(Uuid::new_v4(), name, capacity, host_id, rand::random());
        let handle = Arc::new(RoomHandle::new(room));
        self.rooms.insert(handle.id, handle.clone());

        info!(room_id = %handle.id, capacity = capacity, "Room opened");
        handle
    }

    /// Remove a room from the registry and detach everyone in it
    pub fn close(&self, room_id: &RoomId) -> Option<ClosedRoom> {
        let (_, handle) = self.rooms.remove(room_id)?;

        let members: Vec<PlayerId> = {
            let room = handle.lock();
            handle.closed.store(true, Ordering::Release);
            room.players.keys().copied().collect()
        };
        for player_id in &members {
            self.memberships.remove_if(player_id, |_, r| r == room_id);
        }
        let subscribers = handle.take_subscribers();

        info!(room_id = %room_id, players = members.len(), "Room closed");
        Some(ClosedRoom {
            handle,
            subscribers,
        })
    }

    pub fn get(&self, room_id: &RoomId) -> Option<Arc<RoomHandle>> {
        self.rooms.get(room_id).map(|r| r.value().clone())
    }

    /// Snapshot of every open room handle
    pub fn handles(&self) -> Vec<Arc<RoomHandle>> {
        self.rooms.iter().map(|r| r.value().clone()).collect()
    }

    /// Room the player currently belongs to
    pub fn room_of(&self, player_id: &PlayerId) -> Option<RoomId> {
        self.memberships.get(player_id).map(|r| *r.value())
    }

    /// Add a player to a room and subscribe its connection.
    /// Marks the room dirty so the next fallback snapshot includes the newcomer.
    pub fn join(
        &self,
        room_id: RoomId,
        player_id: PlayerId,
        display_name: String,
        subscriber: Subscriber,
    ) -> Result<Arc<RoomHandle>, GameError> {
        let handle = self.get(&room_id).ok_or(GameError::RoomNotFound)?;

        // Lock order: membership entry, then room
        match self.memberships.entry(player_id) {
            Entry::Occupied(_) => return Err(GameError::AlreadyInRoom),
            Entry::Vacant(membership) => {
                let mut room = handle.lock();
                if handle.is_closed() {
                    return Err(GameError::RoomNotFound);
                }
                let slot = room.add_player(player_id, display_name)?.slot;
                handle.subscribe(subscriber);
                membership.insert(room_id);

                info!(
                    room_id = %room_id,
                    player_id = %player_id,
                    slot = slot,
                    players = room.players.len(),
                    "Player joined room"
                );
            }
        }

        Ok(handle)
    }

    /// Remove a player from a room. The room is kept even when it becomes empty.
    pub fn leave(&self, room_id: &RoomId, player_id: &PlayerId) -> Result<Departure, GameError> {
        let handle = self.get(room_id).ok_or(GameError::RoomNotFound)?;
        if self
            .memberships
            .remove_if(player_id, |_, r| r == room_id)
            .is_none()
        {
            return Err(GameError::NotInRoom);
        }

        let player = {
            let mut room = handle.lock();
            let player = room.remove_player(player_id).ok_or(GameError::NotInRoom)?;
            debug!(
                room_id = %room_id,
                host_id = ?room.host_id,
                remaining = room.players.len(),
                "Room membership changed"
            );
            player
        };
        handle.unsubscribe(player_id);

        info!(room_id = %room_id, player_id = %player_id, "Player left room");
        Ok(Departure { handle, player })
    }

    /// Remove a player from whatever room it is in
    pub fn leave_any(&self, player_id: &PlayerId) -> Option<Departure> {
        let room_id = self.room_of(player_id)?;
        self.leave(&room_id, player_id).ok()
    }

    /// Rooms with at least one player, oldest first
    pub fn list(&self) -> Vec<RoomSummary> {
        let mut rooms: Vec<RoomSummary> = self
            .handles()
            .iter()
            .map(|h| h.summary())
            .filter(|s| s.current_players > 0)
            .collect();
        rooms.sort_by_key(|s| s.created_at);
        rooms
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn player_count(&self) -> usize {
        self.memberships.len()
    }

    /// Run one tick for a room and stamp the resulting events.
    ///
    /// Returns `None` for empty or closed rooms: they are skipped entirely and
    /// their frame counter does not advance.
    pub fn step_room(
        &self,
        handle: &RoomHandle,
        snapshots: &SnapshotBuilder,
        dt: f32,
    ) -> Result<Option<Vec<Envelope>>, PhysicsError> {
        let mut room = handle.lock();
        if room.is_empty() || handle.is_closed() {
            return Ok(None);
        }

        let events = PhysicsSystem::step(&mut room, dt)?;
        let mut batch: Vec<Envelope> = events
            .into_iter()
            .map(|event| room.stamp_event(event))
            .collect();

        if let Some(snapshot) = snapshots.fallback(&mut room) {
            batch.push(room.stamp_event(snapshot));
        }
        Ok(Some(batch))
    }
}
