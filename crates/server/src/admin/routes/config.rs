use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::admin::state::SharedState;

/// GET /api/config
///
/// The configuration the server was started with.
pub async fn get_config(State(state): State<SharedState>) -> Json<Value> {
    Json(serde_json::to_value(&state.config).unwrap_or(json!({"error": "serialization failed"})))
}
