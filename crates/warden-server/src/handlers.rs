//! API route handlers.

use axum::extract::State;
use axum::Json;
use warden_engine::EngineStatus;

use crate::state::AppState;

/// GET /api/status - Engine status snapshot.
pub async fn get_status(State(state): State<AppState>) -> Json<EngineStatus> {
    Json(state.supervisor.status())
}
