//! HTTP route definitions

use axum::{
    extract::State,
    http::{header, HeaderValue, Method},
    response::Json,
    routing::get,
    Router,
};
use serde::Serialize;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};

use crate::app::AppState;
use crate::game::scheduler::TickStatsSnapshot;
use crate::util::time::uptime_secs;
use crate::ws::handler::ws_handler;

/// Build the application router
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(allowed_origins(&state.config.client_origin))
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// CORS origins from a comma-separated list; `*` allows any
fn allowed_origins(raw: &str) -> AllowOrigin {
    if raw.split(',').any(|s| s.trim() == "*") {
        return AllowOrigin::from(Any);
    }
    let origins: Vec<HeaderValue> = raw
        .split(',')
        .filter_map(|s| s.trim().parse::<HeaderValue>().ok())
        .collect();
    AllowOrigin::list(origins)
}

// ============================================================================
// Health endpoint
// ============================================================================

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    ticks: TickStatsSnapshot,
    rooms: usize,
    players: usize,
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: uptime_secs(),
        ticks: state.tick_stats.snapshot(),
        rooms: state.rooms.room_count(),
        players: state.rooms.player_count(),
    })
}

// ============================================================================
// Status endpoint
// ============================================================================

#[derive(Debug, Serialize)]
struct StatusResponse {
    rooms: usize,
    players: usize,
    max_players_per_room: usize,
    version: &'static str,
}

async fn status_handler(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        rooms: state.rooms.room_count(),
        players: state.rooms.player_count(),
        max_players_per_room: state.rooms.max_players(),
        version: env!("CARGO_PKG_VERSION"),
    })
}
