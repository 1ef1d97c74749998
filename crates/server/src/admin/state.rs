use std::sync::Arc;
use std::time::Instant;

use chatfront_common::AppConfig;
use chatfront_pipeline::Router;
use chrono::{DateTime, Utc};

use crate::metrics::ChatMetrics;
use crate::session::SessionRegistry;

/// Shared state type alias used across all route handlers.
pub type SharedState = Arc<AdminState>;

/// Read-only view of the running server for the admin API.
pub struct AdminState {
    pub config: AppConfig,
    pub metrics: Arc<ChatMetrics>,
    pub sessions: Arc<SessionRegistry>,
    pub router: Arc<Router>,
    pub started_at: DateTime<Utc>,
    pub start_time: Instant,
}

impl AdminState {
    pub fn new(
        config: AppConfig,
        metrics: Arc<ChatMetrics>,
        sessions: Arc<SessionRegistry>,
        router: Arc<Router>,
    ) -> Self {
        Self {
            config,
            metrics,
            sessions,
            router,
            started_at: Utc::now(),
            start_time: Instant::now(),
        }
    }
}

#[cfg(test)]
pub(crate) fn test_state() -> SharedState {
    let config = AppConfig::from_yaml(
        "server:\n  listen: [\"127.0.0.1:0\"]\ncache:\n  sweep_interval_secs: 0\n",
    )
    .unwrap();
    let sessions = Arc::new(SessionRegistry::new(std::time::Duration::from_secs(60)));
    let metrics = Arc::new(ChatMetrics::new().unwrap());
    let router = crate::pipeline::build_router(&config, sessions.clone(), metrics.clone()).unwrap();
    Arc::new(AdminState::new(config, metrics, sessions, Arc::new(router)))
}
