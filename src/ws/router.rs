//! Message router - maps decoded client messages to room mutations
//!
//! Player-originated notifications (movement, shots, joins, leaves) are
//! broadcast as soon as the intent is applied rather than waiting for the next
//! tick. The room lock is released before any send is awaited.

use std::collections::BTreeSet;
use std::sync::Arc;

use futures::future::join_all;
use glam::Vec2;
use tracing::{debug, info, warn};

use crate::game::manager::{RoomHandle, RoomManager};
use crate::game::physics::clamp_to_arena;
use crate::game::{GameError, Intent};
use crate::util::time::unix_millis;
use crate::ws::dispatch::{Dispatcher, Subscriber, SEND_DEADLINE};
use crate::ws::protocol::{ClientMsg, Direction, Envelope, PlayerId, RoomId, ServerMsg};

/// Default divergence allowed between client prediction and server position
pub const DEFAULT_RECONCILE_THRESHOLD: f32 = 200.0;

/// What to do with a client-reported position
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reconciliation {
    /// Adopt this position as authoritative
    Accept(Vec2),
    /// Keep the server position and tell the client
    Correct,
    /// Keep the server position silently
    Ignore,
}

/// Trust policy for client-predicted positions.
///
/// This is a trust boundary, not an anti-cheat guarantee: a client may still
/// misreport anything the policy accepts.
pub trait ReconcilePolicy: Send + Sync {
    fn reconcile(&self, server: Vec2, client: Vec2) -> Reconciliation;
}

/// Accept client positions within a fixed distance of the server's
#[derive(Debug, Clone, Copy)]
pub struct ThresholdReconciler {
    threshold: f32,
}

impl ThresholdReconciler {
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold: threshold.max(0.0),
        }
    }
}

impl Default for ThresholdReconciler {
    fn default() -> Self {
        Self::new(DEFAULT_RECONCILE_THRESHOLD)
    }
}

impl ReconcilePolicy for ThresholdReconciler {
    fn reconcile(&self, server: Vec2, client: Vec2) -> Reconciliation {
        if !client.is_finite() {
            return Reconciliation::Correct;
        }
        let client = clamp_to_arena(client);
        if server.distance(client) <= self.threshold {
            Reconciliation::Accept(client)
        } else {
            Reconciliation::Correct
        }
    }
}

/// Never trust client positions
#[derive(Debug, Clone, Copy, Default)]
pub struct ServerAuthoritative;

impl ReconcilePolicy for ServerAuthoritative {
    fn reconcile(&self, _server: Vec2, _client: Vec2) -> Reconciliation {
        Reconciliation::Ignore
    }
}

/// Single entry point for inbound client messages
#[derive(Clone)]
pub struct MessageRouter {
    manager: Arc<RoomManager>,
    dispatcher: Dispatcher,
    reconciler: Arc<dyn ReconcilePolicy>,
}

impl MessageRouter {
    pub fn new(
        manager: Arc<RoomManager>,
        dispatcher: Dispatcher,
        reconciler: Arc<dyn ReconcilePolicy>,
    ) -> Self {
        Self {
            manager,
            dispatcher,
            reconciler,
        }
    }

    /// Handle one message from `sender`. Rejections are reported back to the
    /// sender as an error frame and never propagate further.
    pub async fn handle(&self, sender: &Subscriber, msg: ClientMsg) {
        if let Err(e) = self.route(sender, msg).await {
            debug!(player_id = %sender.player_id, error = %e, "Rejected client message");
            self.reply(sender, Envelope::error(e.code(), e.to_string()))
                .await;
        }
    }

    /// Dispatch table keyed by message kind
    async fn route(&self, sender: &Subscriber, msg: ClientMsg) -> Result<(), GameError> {
        match msg {
            ClientMsg::CreateRoom { name, max_players } => {
                self.create_room(sender, name, max_players).await
            }
            ClientMsg::ListRooms => {
                let rooms = self.manager.list();
                self.reply(sender, Envelope::direct(ServerMsg::RoomList { rooms }))
                    .await;
                Ok(())
            }
            ClientMsg::Join {
                room_id,
                display_name,
            } => self.join(sender, room_id, display_name).await,
            ClientMsg::Move {
                room_id,
                directions,
                position,
            } => self.move_tank(sender, room_id, directions, position).await,
            ClientMsg::Shoot { room_id, aim } => self.shoot(sender, room_id, aim).await,
            ClientMsg::Respawn { room_id } => self.respawn(sender, room_id).await,
            ClientMsg::Leave { room_id } => {
                let departure = self.manager.leave(&room_id, &sender.player_id)?;
                self.announce_departure(&departure.handle, sender.player_id, "left")
                    .await;
                Ok(())
            }
            ClientMsg::CloseRoom { room_id } => self.close_room(sender, room_id).await,
            ClientMsg::ChangeSlot {
                room_id,
                target_slot,
            } => self.change_slot(sender, room_id, target_slot).await,
            ClientMsg::StartGame { room_id } => self.start_game(sender, room_id).await,
            ClientMsg::Ping { t } => {
                let pong = ServerMsg::Pong {
                    t,
                    server_time: unix_millis(),
                };
                self.reply(sender, Envelope::direct(pong)).await;
                Ok(())
            }
        }
    }

    /// Connection closed: drop the player from its room, if any
    pub async fn disconnect(&self, player_id: PlayerId) {
        if let Some(departure) = self.manager.leave_any(&player_id) {
            self.announce_departure(&departure.handle, player_id, "disconnected")
                .await;
        }
    }

    async fn create_room(
        &self,
        sender: &Subscriber,
        name: String,
        max_players: Option<usize>,
    ) -> Result<(), GameError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(GameError::invalid("room name must not be empty"));
        }
        let handle = self
            .manager
            .open(name.to_string(), Some(sender.player_id), max_players);
        let room = handle.summary();

        info!(room_id = %room.room_id, host_id = %sender.player_id, "Room created");
        self.reply(sender, Envelope::direct(ServerMsg::RoomCreated { room }))
            .await;
        Ok(())
    }

    async fn join(
        &self,
        sender: &Subscriber,
        room_id: RoomId,
        display_name: String,
    ) -> Result<(), GameError> {
        let player_id = sender.player_id;
        let handle = self
            .manager
            .join(room_id, player_id, display_name, sender.clone())?;

        let (joined, announce) = {
            let mut room = handle.lock();
            let player = room
                .player(&player_id)
                .map(|p| p.snapshot())
                .ok_or(GameError::NotInRoom)?;
            let state = room.snapshot();
            let joined = room.stamp(ServerMsg::RoomJoined {
                player_id,
                slot: player.slot,
                state,
            });
            let announce = room.stamp(ServerMsg::PlayerJoined { player });
            (joined, announce)
        };

        self.reply(sender, joined).await;
        self.dispatcher
            .broadcast_to_room(room_id, announce, Some(player_id))
            .await;
        Ok(())
    }

    async fn move_tank(
        &self,
        sender: &Subscriber,
        room_id: RoomId,
        directions: BTreeSet<Direction>,
        client_position: Option<Vec2>,
    ) -> Result<(), GameError> {
        let player_id = sender.player_id;
        let handle = self.member_room(room_id, player_id)?;

        let (notification, correction) = {
            let mut room = handle.lock();
            let mut correction = None;

            if let Some(client) = client_position {
                let server = room
                    .player(&player_id)
                    .filter(|p| p.alive)
                    .map(|p| p.position);
                if let Some(server) = server {
                    match self.reconciler.reconcile(server, client) {
                        Reconciliation::Accept(position) => {
                            room.accept_client_position(&player_id, position)
                        }
                        Reconciliation::Correct => {
                            correction = Some(room.stamp(ServerMsg::PositionCorrection {
                                player_id,
                                position: server,
                            }));
                        }
                        Reconciliation::Ignore => {}
                    }
                }
            }

            let notification = room
                .apply_intent(&player_id, Intent::Move { directions })?
                .map(|event| room.stamp_event(event));
            (notification, correction)
        };

        if let Some(correction) = correction {
            debug!(room_id = %room_id, player_id = %player_id, "Client position corrected");
            self.reply(sender, correction).await;
        }
        if let Some(notification) = notification {
            // The sender already knows its own keys
            self.dispatcher
                .broadcast_to_room(room_id, notification, Some(player_id))
                .await;
        }
        Ok(())
    }

    async fn shoot(&self, sender: &Subscriber, room_id: RoomId, aim: Vec2) -> Result<(), GameError> {
        let player_id = sender.player_id;
        let handle = self.member_room(room_id, player_id)?;

        let fired = {
            let mut room = handle.lock();
            room.apply_intent(&player_id, Intent::Shoot { aim })?
                .map(|event| room.stamp_event(event))
        };

        if let Some(fired) = fired {
            // Everyone, shooter included, learns the server bullet id
            self.dispatcher.broadcast_to_room(room_id, fired, None).await;
        }
        Ok(())
    }

    async fn respawn(&self, sender: &Subscriber, room_id: RoomId) -> Result<(), GameError> {
        let player_id = sender.player_id;
        let handle = self.member_room(room_id, player_id)?;

        let respawned = {
            let mut room = handle.lock();
            let player = room.respawn(&player_id)?;
            room.stamp(ServerMsg::PlayerRespawned { player })
        };

        info!(room_id = %room_id, player_id = %player_id, "Player respawned");
        self.dispatcher
            .broadcast_to_room(room_id, respawned, None)
            .await;
        Ok(())
    }

    async fn change_slot(
        &self,
        sender: &Subscriber,
        room_id: RoomId,
        target_slot: usize,
    ) -> Result<(), GameError> {
        let player_id = sender.player_id;
        let handle = self.member_room(room_id, player_id)?;

        let changed = {
            let mut room = handle.lock();
            let (old_slot, position) = room.change_slot(&player_id, target_slot)?;
            room.stamp(ServerMsg::SlotChanged {
                player_id,
                old_slot,
                new_slot: target_slot,
                position,
            })
        };

        debug!(room_id = %room_id, player_id = %player_id, slot = target_slot, "Slot changed");
        self.dispatcher.broadcast_to_room(room_id, changed, None).await;
        Ok(())
    }

    async fn start_game(&self, sender: &Subscriber, room_id: RoomId) -> Result<(), GameError> {
        let handle = self.manager.get(&room_id).ok_or(GameError::RoomNotFound)?;

        let started = {
            let mut room = handle.lock();
            if room.host_id != Some(sender.player_id) {
                return Err(GameError::NotHost);
            }
            let state = room.start_game()?;
            room.stamp(ServerMsg::GameStarted { state })
        };

        info!(room_id = %room_id, host_id = %sender.player_id, "Round started");
        self.dispatcher.broadcast_to_room(room_id, started, None).await;
        Ok(())
    }

    async fn close_room(&self, sender: &Subscriber, room_id: RoomId) -> Result<(), GameError> {
        let handle = self.manager.get(&room_id).ok_or(GameError::RoomNotFound)?;
        if handle.lock().host_id != Some(sender.player_id) {
            return Err(GameError::NotHost);
        }

        let Some(closed) = self.manager.close(&room_id) else {
            return Err(GameError::RoomNotFound);
        };
        let notice = Arc::new(closed.handle.lock().stamp(ServerMsg::RoomClosed {
            reason: "closed_by_host".to_string(),
        }));

        self.dispatcher.retire(&room_id);

        let mut recipients = closed.subscribers;
        if !recipients.iter().any(|s| s.player_id == sender.player_id) {
            recipients.push(sender.clone());
        }
        let frames = std::slice::from_ref(&notice);
        let results = join_all(recipients.iter().map(|subscriber| async move {
            (subscriber, subscriber.send_batch(frames, SEND_DEADLINE).await)
        }))
        .await;
        for (subscriber, result) in results {
            if let Err(e) = result {
                warn!(room_id = %room_id, player_id = %subscriber.player_id, error = %e, "Close notice not delivered");
            }
        }
        Ok(())
    }

    /// Room the sender belongs to, if it is the one named by the message
    fn member_room(&self, room_id: RoomId, player_id: PlayerId) -> Result<Arc<RoomHandle>, GameError> {
        if self.manager.room_of(&player_id) != Some(room_id) {
            return Err(GameError::invalid("player is not in this room"));
        }
        self.manager.get(&room_id).ok_or(GameError::RoomNotFound)
    }

    async fn announce_departure(&self, handle: &RoomHandle, player_id: PlayerId, reason: &str) {
        let left = handle.lock().stamp(ServerMsg::PlayerLeft {
            player_id,
            reason: reason.to_string(),
        });
        self.dispatcher
            .broadcast_to_room(handle.id, left, Some(player_id))
            .await;
    }

    async fn reply(&self, sender: &Subscriber, msg: Envelope) {
        if let Err(e) = sender.send(msg).await {
            warn!(player_id = %sender.player_id, error = %e, "Reply not delivered");
        }
    }
}
