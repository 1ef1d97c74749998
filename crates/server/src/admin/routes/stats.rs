use axum::extract::State;
use axum::Json;
use prometheus::core::Collector;
use serde_json::{json, Value};

use crate::admin::state::SharedState;

/// GET /api/stats
///
/// Traffic totals from the Prometheus counters plus live session counts.
pub async fn get_stats(State(state): State<SharedState>) -> Json<Value> {
    let uptime_secs = state.start_time.elapsed().as_secs();
    let metrics = &state.metrics;

    let packets: u64 = metrics
        .packets_total
        .collect()
        .iter()
        .flat_map(|family| family.get_metric())
        .map(|metric| metric.get_counter().get_value() as u64)
        .sum();

    let packets_per_second = if uptime_secs > 0 {
        packets as f64 / uptime_secs as f64
    } else {
        0.0
    };

    let mut kinds: Vec<String> = state
        .router
        .registered_kinds()
        .iter()
        .map(|kind| kind.name().to_string())
        .collect();
    kinds.sort();

    Json(json!({
        "started_at": state.started_at.to_rfc3339(),
        "uptime_secs": uptime_secs,
        "packets_total": packets,
        "packets_rate_limited": metrics.packets_rate_limited.get(),
        "dispatch_errors": metrics.dispatch_errors.get(),
        "decode_errors": metrics.decode_errors.get(),
        "connections_total": metrics.connections_total.get(),
        "connections_active": metrics.connections_active.get(),
        "sessions": state.sessions.len(),
        "rooms": state.sessions.room_count(),
        "packets_per_second": packets_per_second,
        "registered_kinds": kinds
    }))
}
