// =============================================================================
// HTTP Router — health output and the WebSocket fan-out endpoint
// =============================================================================
//
// Two routes only:
//   GET /health — structured health: per-symbol book lifecycles/stats,
//                 snapshot-fetcher backoff state, logger drop counters,
//                 connector connectivity, realized PnL tally.
//   GET /ws     — metric fan-out (see ws.rs).
// =============================================================================

use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tower_http::cors::CorsLayer;

use crate::broadcast::WsHub;
use crate::feed::ingestor::SharedBookHealth;
use crate::feed::SnapshotFetcher;
use crate::logger::OrchestratorLogger;
use crate::orchestrator::Orchestrator;

/// Shared state for the API routes.
pub struct ApiState {
    pub orchestrator: Arc<Orchestrator>,
    pub hub: Arc<WsHub>,
    pub fetcher: Arc<SnapshotFetcher>,
    pub logger: Arc<OrchestratorLogger>,
    pub book_health: SharedBookHealth,
    pub start_time: Instant,
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws::ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

use super::ws;

async fn health(State(state): State<Arc<ApiState>>) -> Json<serde_json::Value> {
    let core = state.orchestrator.core();
    Json(json!({
        "uptime_s": state.start_time.elapsed().as_secs(),
        "books": &*state.book_health.read(),
        "snapshot_fetcher": state.fetcher.health(),
        "logger": {
            "drop_total": state.logger.drop_total(),
            "drop_window": state.logger.drop_window(),
        },
        "execution": {
            "enabled": core.execution_enabled(),
            "connected": core.connector().connected(),
            "symbols": state.orchestrator.execution_symbols(),
            "realized_pnl": state.orchestrator.realized_pnl(),
            "decisions": core.ledger_len(),
        },
        "required_symbols": state.hub.required(),
    }))
}
