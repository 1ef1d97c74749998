use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::admin::state::SharedState;

/// GET /api/health
///
/// Reports `degraded` when the router has no pipelines, since every packet
/// would then be rejected or ignored.
pub async fn health_check(State(state): State<SharedState>) -> Json<Value> {
    let packet_kinds = state.router.registered_kinds().len();
    let status = if packet_kinds == 0 { "degraded" } else { "healthy" };

    Json(json!({
        "status": status,
        "started_at": state.started_at.to_rfc3339(),
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "sessions": state.sessions.len(),
        "packet_kinds": packet_kinds,
        "version": env!("CARGO_PKG_VERSION")
    }))
}
