//! Application state shared across routes

use std::sync::Arc;

use crate::config::Config;
use crate::game::scheduler::{Scheduler, TickStats};
use crate::game::RoomManager;
use crate::ws::dispatch::Dispatcher;
use crate::ws::router::{MessageRouter, ThresholdReconciler};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub rooms: Arc<RoomManager>,
    pub dispatcher: Dispatcher,
    pub router: MessageRouter,
    pub tick_stats: Arc<TickStats>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let config = Arc::new(config);

        // One manager instance, passed by handle to everything acting on rooms
        let rooms = Arc::new(RoomManager::new(config.max_players_per_room));
        let dispatcher = Dispatcher::new(rooms.clone());

        let reconciler = Arc::new(ThresholdReconciler::new(config.reconcile_threshold));
        let router = MessageRouter::new(rooms.clone(), dispatcher.clone(), reconciler);

        Self {
            config,
            rooms,
            dispatcher,
            router,
            tick_stats: Arc::new(TickStats::default()),
        }
    }

    /// Build the simulation scheduler for this state
    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(
            self.rooms.clone(),
            self.dispatcher.clone(),
            self.tick_stats.clone(),
        )
    }
}
