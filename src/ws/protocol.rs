//! WebSocket protocol message definitions
//! These are the wire types for client-server communication

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use glam::Vec2;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current envelope version. Bumped only on breaking changes; new fields are additive.
pub const PROTOCOL_VERSION: u16 = 1;

pub type RoomId = Uuid;
pub type PlayerId = Uuid;
/// Per-room bullet id, assigned in firing order
pub type BulletId = u64;

/// Movement keys a tank can hold down
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

impl Direction {
    /// Unit axis in screen coordinates (y grows downwards)
    pub fn axis(self) -> Vec2 {
        match self {
            Direction::Up => Vec2::new(0.0, -1.0),
            Direction::Down => Vec2::new(0.0, 1.0),
            Direction::Left => Vec2::new(-1.0, 0.0),
            Direction::Right => Vec2::new(1.0, 0.0),
        }
    }
}

/// Round lifecycle of a room
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomState {
    /// Lobby: players pick slots, the host has not started a round
    #[default]
    Waiting,
    Playing,
    /// A round ended with a single survivor
    Finished,
}

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMsg {
    /// Open a new room hosted by the sender
    CreateRoom {
        name: String,
        /// Requested capacity, clamped to the server maximum
        #[serde(default)]
        max_players: Option<usize>,
    },

    /// Request the list of rooms with players in them
    ListRooms,

    /// Join an existing room
    Join {
        room_id: RoomId,
        display_name: String,
    },

    /// Replace the set of held movement keys (empty set = stop)
    Move {
        room_id: RoomId,
        directions: BTreeSet<Direction>,
        /// Client-predicted position, checked by the reconciliation policy
        #[serde(default)]
        position: Option<Vec2>,
    },

    /// Fire a bullet along the aim vector
    Shoot {
        room_id: RoomId,
        aim: Vec2,
    },

    /// Come back after being destroyed
    Respawn {
        room_id: RoomId,
    },

    /// Leave the room
    Leave {
        room_id: RoomId,
    },

    /// Close a room (host only)
    CloseRoom {
        room_id: RoomId,
    },

    /// Move to another free slot and its spawn point
    ChangeSlot {
        room_id: RoomId,
        target_slot: usize,
    },

    /// Start a round (host only)
    StartGame {
        room_id: RoomId,
    },

    /// Ping for latency measurement
    Ping {
        /// Client timestamp
        t: u64,
    },
}

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMsg {
    /// Welcome message after connection
    Welcome {
        player_id: PlayerId,
        server_time: u64,
        protocol_version: u16,
    },

    /// Confirmation of room creation
    RoomCreated {
        room: RoomSummary,
    },

    /// Rooms currently in use
    RoomList {
        rooms: Vec<RoomSummary>,
    },

    /// Confirmation of room join, with the full room state
    RoomJoined {
        player_id: PlayerId,
        slot: usize,
        state: RoomSnapshot,
    },

    /// Another player joined the room
    PlayerJoined {
        player: PlayerSnapshot,
    },

    /// Player left the room
    PlayerLeft {
        player_id: PlayerId,
        reason: String,
    },

    /// Dead player came back
    PlayerRespawned {
        player: PlayerSnapshot,
    },

    /// A player moved to another slot
    SlotChanged {
        player_id: PlayerId,
        old_slot: usize,
        new_slot: usize,
        position: Vec2,
    },

    /// The host started a round; everyone is back at full health
    GameStarted {
        state: RoomSnapshot,
    },

    /// Authoritative position for a client whose prediction drifted too far
    PositionCorrection {
        player_id: PlayerId,
        position: Vec2,
    },

    /// Room was closed; clients are detached from it
    RoomClosed {
        reason: String,
    },

    /// Simulation or intent event
    Event {
        event: GameEvent,
    },

    /// Error message
    Error {
        code: String,
        message: String,
    },

    /// Pong response
    Pong {
        /// Echo back client timestamp
        t: u64,
        server_time: u64,
    },
}

/// Why a bullet left the simulation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestroyReason {
    Expired,
    Collision,
    Boundary,
}

/// Game events (movement, shots, hits, deaths, snapshots)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum GameEvent {
    /// Held movement keys changed
    PlayerMove {
        player_id: PlayerId,
        directions: BTreeSet<Direction>,
        position: Vec2,
    },

    /// Bullet fired
    BulletFired {
        bullet_id: BulletId,
        owner_id: PlayerId,
        position: Vec2,
        velocity: Vec2,
        damage: i32,
    },

    /// Bullet struck a tank
    Collision {
        bullet_id: BulletId,
        target_id: PlayerId,
        damage: i32,
        new_health: i32,
        position: Vec2,
    },

    /// Tank destroyed
    PlayerDeath {
        player_id: PlayerId,
        killer_id: PlayerId,
        position: Vec2,
    },

    /// Bullet removed from the simulation
    BulletDestroyed {
        bullet_id: BulletId,
        reason: DestroyReason,
    },

    /// Full authoritative room state (fallback sync)
    StateSnapshot {
        state: RoomSnapshot,
    },

    /// Only one tank left standing
    GameOver {
        winner_id: PlayerId,
    },
}

/// Player state in a snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerSnapshot {
    pub player_id: PlayerId,
    pub display_name: String,
    pub slot: usize,
    pub position: Vec2,
    pub velocity: Vec2,
    pub health: i32,
    pub max_health: i32,
    pub alive: bool,
    pub directions: BTreeSet<Direction>,
}

/// Bullet state in a snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulletSnapshot {
    pub bullet_id: BulletId,
    pub owner_id: PlayerId,
    pub position: Vec2,
    pub velocity: Vec2,
    /// Remaining time-to-live in seconds
    pub ttl: f32,
    /// Room simulation time at spawn
    pub spawned_at: f64,
}

/// Full room state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomSnapshot {
    pub room_id: RoomId,
    #[serde(default)]
    pub room_state: RoomState,
    pub sim_time: f64,
    pub players: Vec<PlayerSnapshot>,
    pub bullets: Vec<BulletSnapshot>,
}

/// Room info for lobby listings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomSummary {
    pub room_id: RoomId,
    pub name: String,
    pub host_id: Option<PlayerId>,
    pub current_players: usize,
    pub max_players: usize,
    #[serde(default)]
    pub room_state: RoomState,
    #[serde(default)]
    pub available_slots: Vec<usize>,
    pub created_at: DateTime<Utc>,
}

/// Outbound frame: every server message travels inside one
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub v: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<RoomId>,
    /// Per-room sequence number; 0 for connection-scoped replies
    pub seq: u64,
    /// Room frame at which the message was produced
    pub frame: u64,
    #[serde(flatten)]
    pub msg: ServerMsg,
}

impl Envelope {
    /// Wrap a reply addressed to a single connection
    pub fn direct(msg: ServerMsg) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            room_id: None,
            seq: 0,
            frame: 0,
            msg,
        }
    }

    /// Wrap a room-scoped message
    pub fn room(room_id: RoomId, seq: u64, frame: u64, msg: ServerMsg) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            room_id: Some(room_id),
            seq,
            frame,
            msg,
        }
    }

    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::direct(ServerMsg::Error {
            code: code.to_string(),
            message: message.into(),
        })
    }

    /// The game event carried by this frame, if any
    pub fn event(&self) -> Option<&GameEvent> {
        match &self.msg {
            ServerMsg::Event { event } => Some(event),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn move_message_decodes_directions_and_optional_position() {
        let room_id = Uuid::new_v4();
        let raw = format!(
            r#"{{"type":"move","room_id":"{}","directions":["right","up"]}}"#,
            room_id
        );
        match serde_json::from_str::<ClientMsg>(&raw).unwrap() {
            ClientMsg::Move {
                room_id: decoded,
                directions,
                position,
            } => {
                assert_eq!(decoded, room_id);
                assert!(directions.contains(&Direction::Right));
                assert!(directions.contains(&Direction::Up));
                assert!(position.is_none());
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let raw = r#"{"type":"ping","t":42,"added_later":true}"#;
        match serde_json::from_str::<ClientMsg>(raw).unwrap() {
            ClientMsg::Ping { t } => assert_eq!(t, 42),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn envelope_flattens_kind_and_carries_sequence() {
        let room_id = Uuid::new_v4();
        let envelope = Envelope::room(
            room_id,
            7,
            120,
            ServerMsg::Event {
                event: GameEvent::BulletDestroyed {
                    bullet_id: 3,
                    reason: DestroyReason::Boundary,
                },
            },
        );

        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["v"], 1);
        assert_eq!(value["seq"], 7);
        assert_eq!(value["frame"], 120);
        assert_eq!(value["type"], "event");
        assert_eq!(value["event"]["event_type"], "bullet_destroyed");
        assert_eq!(value["event"]["reason"], "boundary");
        assert_eq!(value["room_id"], room_id.to_string());
    }

    #[test]
    fn direct_envelope_omits_room() {
        let value = serde_json::to_value(Envelope::error("room_full", "Room is full")).unwrap();
        assert!(value.get("room_id").is_none());
        assert_eq!(value["seq"], 0);
        assert_eq!(value["code"], "room_full");
    }

    #[test]
    fn slot_and_start_messages_decode() {
        let room_id = Uuid::new_v4();
        let raw = format!(r#"{{"type":"change_slot","room_id":"{}","target_slot":3}}"#, room_id);
        assert!(matches!(
            serde_json::from_str::<ClientMsg>(&raw).unwrap(),
            ClientMsg::ChangeSlot { target_slot: 3, .. }
        ));

        let raw = format!(r#"{{"type":"start_game","room_id":"{}"}}"#, room_id);
        assert!(matches!(
            serde_json::from_str::<ClientMsg>(&raw).unwrap(),
            ClientMsg::StartGame { room_id: decoded } if decoded == room_id
        ));
        assert_eq!(serde_json::to_value(RoomState::Playing).unwrap(), "playing");
    }

    #[test]
    fn direction_axes_use_screen_coordinates() {
        assert_eq!(Direction::Up.axis(), Vec2::new(0.0, -1.0));
        assert_eq!(Direction::Right.axis(), Vec2::new(1.0, 0.0));
    }
}
