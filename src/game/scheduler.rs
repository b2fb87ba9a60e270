//! Fixed-rate simulation scheduler

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::util::time::{tick_delta, tick_duration, Timer, SIMULATION_TPS};
use crate::ws::dispatch::Dispatcher;
use crate::ws::protocol::{Envelope, RoomId};

use super::manager::RoomManager;
use super::snapshot::SnapshotBuilder;

/// Counters exposed on the health endpoint
#[derive(Debug, Default)]
pub struct TickStats {
    ticks: AtomicU64,
    overruns: AtomicU64,
    faults: AtomicU64,
    last_tick_micros: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TickStatsSnapshot {
    pub ticks: u64,
    pub overruns: u64,
    pub faults: u64,
    pub last_tick_micros: u64,
}

impl TickStats {
    pub fn snapshot(&self) -> TickStatsSnapshot {
        TickStatsSnapshot {
            ticks: self.ticks.load(Ordering::Relaxed),
            overruns: self.overruns.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
            last_tick_micros: self.last_tick_micros.load(Ordering::Relaxed),
        }
    }
}

/// Drives every non-empty room once per tick
pub struct Scheduler {
    manager: Arc<RoomManager>,
    dispatcher: Dispatcher,
    snapshots: SnapshotBuilder,
    stats: Arc<TickStats>,
    dt: f32,
    period: Duration,
}

impl Scheduler {
    pub fn new(manager: Arc<RoomManager>, dispatcher: Dispatcher, stats: Arc<TickStats>) -> Self {
        Self {
            manager,
            dispatcher,
            snapshots: SnapshotBuilder::default(),
            stats,
            dt: tick_delta(),
            period: tick_duration(),
        }
    }

    /// Run until the shutdown signal flips to true.
    ///
    /// A tick that overruns its period is followed immediately by the next one;
    /// missed ticks are never stepped twice, so simulation time lags wall-clock
    /// time under sustained overload.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(tps = SIMULATION_TPS, "Simulation scheduler started");

        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick();
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(ticks = self.stats.snapshot().ticks, "Simulation scheduler stopped");
    }

    /// One scheduler iteration: step every room, then queue their events on
    /// the rooms' fan-out lanes. Delivery is never awaited here.
    /// Returns the number of rooms stepped.
    pub fn tick(&self) -> usize {
        let timer = Timer::new();

        let batches = self.step_rooms();
        let stepped = batches.len();

        for (room_id, batch) in batches {
            self.dispatcher.broadcast_events(room_id, batch);
        }

        let elapsed = timer.elapsed();
        self.stats.ticks.fetch_add(1, Ordering::Relaxed);
        self.stats
            .last_tick_micros
            .store(elapsed.as_micros() as u64, Ordering::Relaxed);
        if elapsed > self.period {
            self.stats.overruns.fetch_add(1, Ordering::Relaxed);
            debug!(
                elapsed_micros = elapsed.as_micros() as u64,
                rooms = stepped,
                "Tick overran its period"
            );
        }

        stepped
    }

    /// Step rooms one after another. A fault in one room is logged and does not
    /// stop the others.
    fn step_rooms(&self) -> Vec<(RoomId, Vec<Envelope>)> {
        let mut batches = Vec::new();
        for handle in self.manager.handles() {
            match self.manager.step_room(&handle, &self.snapshots, self.dt) {
                Ok(Some(batch)) => batches.push((handle.id, batch)),
                Ok(None) => {}
                Err(e) => {
                    self.stats.faults.fetch_add(1, Ordering::Relaxed);
                    error!(room_id = %handle.id, error = %e, "Physics step failed");
                }
            }
        }
        batches
    }
}
