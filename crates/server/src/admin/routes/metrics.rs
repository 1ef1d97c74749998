use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;

use crate::admin::state::SharedState;

/// GET /api/metrics
///
/// Prometheus text exposition of every registered metric.
pub async fn get_metrics(State(state): State<SharedState>) -> impl IntoResponse {
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        ),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode prometheus metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain; charset=utf-8")],
                format!("failed to encode metrics: {e}"),
            )
        }
    }
}
