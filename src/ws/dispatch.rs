//! Broadcast dispatcher - fans room messages out to subscriber connections
//!
//! Tick events go through a per-room fan-out lane: a background task that
//! delivers one batch at a time, so batches reach every subscriber in tick
//! order while the scheduler never waits on a socket.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::game::manager::{RoomHandle, RoomManager};
use crate::ws::protocol::{Envelope, PlayerId, RoomId};

/// Deadline for delivering one batch to one subscriber
pub const SEND_DEADLINE: Duration = Duration::from_millis(50);
/// Outbound frames buffered per connection before it counts as slow
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;
/// Tick batches buffered per room while its lane is delivering
pub const ROOM_LANE_CAPACITY: usize = 128;

/// Frame shared between every subscriber it is sent to
pub type Outbound = Arc<Envelope>;

type Batch = Vec<Outbound>;

/// Delivery errors for a single subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("Connection closed")]
    Closed,

    #[error("Send deadline exceeded")]
    TimedOut,
}

/// A connection's outbound queue
#[derive(Debug, Clone)]
pub struct Subscriber {
    pub player_id: PlayerId,
    tx: mpsc::Sender<Outbound>,
}

impl Subscriber {
    /// Create a subscriber and the receiving end drained by the connection writer
    pub fn channel(player_id: PlayerId) -> (Self, mpsc::Receiver<Outbound>) {
        Self::with_capacity(player_id, OUTBOUND_QUEUE_CAPACITY)
    }

    pub fn with_capacity(player_id: PlayerId, capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { player_id, tx }, rx)
    }

    /// Send frames in order, giving up on the whole batch after `deadline`
    pub async fn send_batch(&self, frames: &[Outbound], deadline: Duration) -> Result<(), DeliveryError> {
        timeout(deadline, async {
            for frame in frames {
                self.tx
                    .send(frame.clone())
                    .await
                    .map_err(|_| DeliveryError::Closed)?;
            }
            Ok(())
        })
        .await
        .map_err(|_| DeliveryError::TimedOut)?
    }

    /// Send a single message addressed to this connection only
    pub async fn send(&self, msg: Envelope) -> Result<(), DeliveryError> {
        self.send_batch(&[Arc::new(msg)], SEND_DEADLINE).await
    }

    /// Whether both handles feed the same connection
    pub fn same_connection(&self, other: &Subscriber) -> bool {
        self.tx.same_channel(&other.tx)
    }
}

/// Outcome of one fan-out
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub dropped: usize,
}

/// Broadcast dispatcher
#[derive(Clone)]
pub struct Dispatcher {
    manager: Arc<RoomManager>,
    deadline: Duration,
    lanes: Arc<DashMap<RoomId, mpsc::Sender<Batch>>>,
}

impl Dispatcher {
    pub fn new(manager: Arc<RoomManager>) -> Self {
        Self::with_deadline(manager, SEND_DEADLINE)
    }

    pub fn with_deadline(manager: Arc<RoomManager>, deadline: Duration) -> Self {
        Self {
            manager,
            deadline,
            lanes: Arc::new(DashMap::new()),
        }
    }

    /// Queue a tick's events for every subscriber of the room.
    ///
    /// Returns immediately; delivery happens on the room's fan-out lane.
    /// Returns false when nothing was queued.
    pub fn broadcast_events(&self, room_id: RoomId, events: Vec<Envelope>) -> bool {
        if events.is_empty() {
            return false;
        }
        let batch: Batch = events.into_iter().map(Arc::new).collect();

        match self.lane(room_id).try_send(batch) {
            Ok(()) => true,
            Err(TrySendError::Full(batch)) => {
                warn!(room_id = %room_id, frames = batch.len(), "Fan-out lane full, batch dropped");
                false
            }
            Err(TrySendError::Closed(batch)) => {
                // The lane stopped after its room went away; start over
                self.lanes.remove(&room_id);
                self.lane(room_id).try_send(batch).is_ok()
            }
        }
    }

    /// Stop the room's fan-out lane once its queued batches are delivered
    pub fn retire(&self, room_id: &RoomId) {
        if self.lanes.remove(room_id).is_some() {
            debug!(room_id = %room_id, "Fan-out lane retired");
        }
    }

    /// Send one message to the room, optionally skipping the originating connection
    pub async fn broadcast_to_room(
        &self,
        room_id: RoomId,
        msg: Envelope,
        excluding: Option<PlayerId>,
    ) -> DeliveryReport {
        let Some(handle) = self.manager.get(&room_id) else {
            return DeliveryReport::default();
        };
        self.fan_out(&handle, &[Arc::new(msg)], excluding).await
    }

    /// Deliver to every subscriber concurrently; failures only affect the failing subscriber
    pub async fn fan_out(
        &self,
        handle: &RoomHandle,
        frames: &[Outbound],
        excluding: Option<PlayerId>,
    ) -> DeliveryReport {
        deliver(handle, frames, excluding, self.deadline).await
    }

    fn lane(&self, room_id: RoomId) -> mpsc::Sender<Batch> {
        self.lanes
            .entry(room_id)
            .or_insert_with(|| spawn_lane(self.manager.clone(), room_id, self.deadline))
            .clone()
    }
}

fn spawn_lane(manager: Arc<RoomManager>, room_id: RoomId, deadline: Duration) -> mpsc::Sender<Batch> {
    let (tx, mut rx) = mpsc::channel::<Batch>(ROOM_LANE_CAPACITY);

    tokio::spawn(async move {
        debug!(room_id = %room_id, "Fan-out lane started");
        while let Some(batch) = rx.recv().await {
            let Some(handle) = manager.get(&room_id) else {
                break;
            };
            deliver(&handle, &batch, None, deadline).await;
        }
        debug!(room_id = %room_id, "Fan-out lane stopped");
    });

    tx
}

async fn deliver(
    handle: &RoomHandle,
    frames: &[Outbound],
    excluding: Option<PlayerId>,
    deadline: Duration,
) -> DeliveryReport {
    let subscribers: Vec<Subscriber> = handle
        .subscribers()
        .into_iter()
        .filter(|s| Some(s.player_id) != excluding)
        .collect();

    let results = join_all(subscribers.iter().map(|subscriber| async move {
        (subscriber, subscriber.send_batch(frames, deadline).await)
    }))
    .await;

    let mut report = DeliveryReport::default();
    for (subscriber, result) in results {
        match result {
            Ok(()) => report.delivered += 1,
            Err(e) => {
                warn!(
                    room_id = %handle.id,
                    player_id = %subscriber.player_id,
                    error = %e,
                    "Dropping subscriber after failed delivery"
                );
                handle.unsubscribe_connection(subscriber);
                report.dropped += 1;
            }
        }
    }

    debug!(
        room_id = %handle.id,
        frames = frames.len(),
        delivered = report.delivered,
        dropped = report.dropped,
        "Fan-out complete"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::protocol::{GameEvent, ServerMsg};
    use uuid::Uuid;

    fn event_frame(room_id: RoomId, seq: u64) -> Envelope {
        Envelope::room(
            room_id,
            seq,
            0,
            ServerMsg::Event {
                event: GameEvent::GameOver {
                    winner_id: Uuid::nil(),
                },
            },
        )
    }

    fn frames(room_id: RoomId, seqs: std::ops::RangeInclusive<u64>) -> Vec<Outbound> {
        seqs.map(|seq| Arc::new(event_frame(room_id, seq))).collect()
    }

    fn setup() -> (Arc<RoomManager>, Dispatcher, Arc<RoomHandle>) {
        let manager = Arc::new(RoomManager::new(8));
        let dispatcher = Dispatcher::with_deadline(manager.clone(), Duration::from_millis(20));
        let handle = manager.open("arena".into(), None, None);
        (manager, dispatcher, handle)
    }

    fn join(manager: &RoomManager, room_id: RoomId, capacity: usize) -> (Subscriber, mpsc::Receiver<Outbound>) {
        let (subscriber, rx) = Subscriber::with_capacity(Uuid::new_v4(), capacity);
        manager
            .join(room_id, subscriber.player_id, "tank".into(), subscriber.clone())
            .unwrap();
        (subscriber, rx)
    }

    async fn recv_seq(rx: &mut mpsc::Receiver<Outbound>) -> u64 {
        timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("frame not delivered")
            .expect("channel closed")
            .seq
    }

    #[tokio::test]
    async fn empty_batch_is_a_no_op() {
        let (manager, dispatcher, handle) = setup();
        let (_sub, mut rx) = join(&manager, handle.id, 8);
        assert!(!dispatcher.broadcast_events(handle.id, Vec::new()));
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn fan_out_keeps_generation_order() {
        let (manager, dispatcher, handle) = setup();
        let (_a, mut rx_a) = join(&manager, handle.id, 8);
        let (_b, mut rx_b) = join(&manager, handle.id, 8);

        let report = dispatcher.fan_out(&handle, &frames(handle.id, 1..=3), None).await;
        assert_eq!(report.delivered, 2);

        for rx in [&mut rx_a, &mut rx_b] {
            let seqs: Vec<u64> = (0..3).map(|_| rx.try_recv().unwrap().seq).collect();
            assert_eq!(seqs, vec![1, 2, 3]);
        }
    }

    #[tokio::test]
    async fn queued_batches_arrive_in_tick_order() {
        let (manager, dispatcher, handle) = setup();
        let (_a, mut rx) = join(&manager, handle.id, 8);

        assert!(dispatcher.broadcast_events(handle.id, vec![event_frame(handle.id, 1), event_frame(handle.id, 2)]));
        assert!(dispatcher.broadcast_events(handle.id, vec![event_frame(handle.id, 3)]));

        for expected in 1..=3 {
            assert_eq!(recv_seq(&mut rx).await, expected);
        }
    }

    #[tokio::test]
    async fn queueing_does_not_wait_for_slow_subscribers() {
        let (manager, dispatcher, handle) = setup();
        let (_fast, mut rx_fast) = join(&manager, handle.id, 8);
        let (_slow, _rx_slow) = join(&manager, handle.id, 1);

        let started = std::time::Instant::now();
        let events = (1..=3).map(|seq| event_frame(handle.id, seq)).collect();
        assert!(dispatcher.broadcast_events(handle.id, events));
        assert!(started.elapsed() < Duration::from_millis(5));

        for expected in 1..=3 {
            assert_eq!(recv_seq(&mut rx_fast).await, expected);
        }
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(handle.subscribers().len(), 1);
    }

    #[tokio::test]
    async fn closed_subscriber_is_dropped_without_affecting_others() {
        let (manager, dispatcher, handle) = setup();
        let (_alive, mut rx_alive) = join(&manager, handle.id, 8);
        let (_gone, rx_gone) = join(&manager, handle.id, 8);
        drop(rx_gone);

        let report = dispatcher.fan_out(&handle, &frames(handle.id, 1..=1), None).await;
        assert_eq!(report, DeliveryReport { delivered: 1, dropped: 1 });
        assert!(rx_alive.try_recv().is_ok());
        assert_eq!(handle.subscribers().len(), 1);
    }

    #[tokio::test]
    async fn slow_subscriber_is_dropped_after_deadline() {
        let (manager, dispatcher, handle) = setup();
        let (_fast, mut rx_fast) = join(&manager, handle.id, 8);
        let (_slow, _rx_slow) = join(&manager, handle.id, 1);

        let report = dispatcher.fan_out(&handle, &frames(handle.id, 1..=3), None).await;

        assert_eq!(report, DeliveryReport { delivered: 1, dropped: 1 });
        assert_eq!(rx_fast.try_recv().unwrap().seq, 1);
        assert_eq!(handle.subscribers().len(), 1);
    }

    #[tokio::test]
    async fn broadcast_can_exclude_the_sender() {
        let (manager, dispatcher, handle) = setup();
        let (sender, mut rx_sender) = join(&manager, handle.id, 8);
        let (_other, mut rx_other) = join(&manager, handle.id, 8);

        let report = dispatcher
            .broadcast_to_room(handle.id, event_frame(handle.id, 1), Some(sender.player_id))
            .await;
        assert_eq!(report.delivered, 1);
        assert!(rx_sender.try_recv().is_err());
        assert!(rx_other.try_recv().is_ok());
    }

    #[tokio::test]
    async fn direct_send_reports_closed_connection() {
        let (subscriber, rx) = Subscriber::channel(Uuid::new_v4());
        tokio_test::assert_ok!(subscriber.send(Envelope::error("x", "first")).await);
        drop(rx);
        let err = tokio_test::assert_err!(subscriber.send(Envelope::error("x", "second")).await);
        assert_eq!(err, DeliveryError::Closed);
    }

    #[tokio::test]
    async fn unknown_room_is_ignored() {
        let (_manager, dispatcher, _handle) = setup();
        let report = dispatcher
            .broadcast_to_room(Uuid::new_v4(), event_frame(Uuid::nil(), 1), None)
            .await;
        assert_eq!(report, DeliveryReport::default());
    }

    #[tokio::test]
    async fn retired_lane_restarts_on_next_batch() {
        let (manager, dispatcher, handle) = setup();
        let (_a, mut rx) = join(&manager, handle.id, 8);

        assert!(dispatcher.broadcast_events(handle.id, vec![event_frame(handle.id, 1)]));
        assert_eq!(recv_seq(&mut rx).await, 1);

        dispatcher.retire(&handle.id);
        assert!(dispatcher.broadcast_events(handle.id, vec![event_frame(handle.id, 2)]));
        assert_eq!(recv_seq(&mut rx).await, 2);
    }
}
