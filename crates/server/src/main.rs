mod admin;
mod config;
mod connection;
mod handlers;
mod metrics;
mod packets;
mod pipeline;
mod session;
#[cfg(test)]
mod testing;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::GatewayConfig;
use crate::connection::ConnectionServices;
use crate::metrics::ChatMetrics;
use crate::session::SessionRegistry;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).json().init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/chatfront.yaml".to_string());

    info!(config_path = %config_path, "starting chat front end");

    let loaded = GatewayConfig::load(&config_path)?;
    let app_config = loaded.config;
    info!(path = %loaded.config_path.display(), "configuration loaded");

    let metrics = Arc::new(ChatMetrics::new().context("failed to register metrics")?);
    let sessions = Arc::new(SessionRegistry::from_config(&app_config.cache)?);
    let router = Arc::new(pipeline::build_router(
        &app_config,
        sessions.clone(),
        metrics.clone(),
    )?);

    let shutdown = CancellationToken::new();
    let mut tasks = JoinSet::new();

    let services = ConnectionServices {
        router: router.clone(),
        sessions: sessions.clone(),
        metrics: metrics.clone(),
        outbound_queue: app_config.server.outbound_queue,
        max_frame_bytes: app_config.server.max_frame_bytes,
    };

    for listen_addr in &app_config.server.listen {
        let listener = TcpListener::bind(listen_addr)
            .await
            .with_context(|| format!("failed to bind {listen_addr}"))?;
        info!(addr = %listen_addr, "accepting chat clients");
        tasks.spawn(accept_loop(listener, services.clone(), shutdown.clone()));
    }

    if app_config.server.admin.enabled {
        let state = Arc::new(admin::AdminState::new(
            app_config.clone(),
            metrics.clone(),
            sessions.clone(),
            router.clone(),
        ));
        let admin_listen = app_config.server.admin.listen.clone();
        let admin_shutdown = shutdown.clone();
        tasks.spawn(async move {
            if let Err(e) = admin::run_admin_server(state, &admin_listen, admin_shutdown).await {
                error!(error = %e, "admin API server error");
            }
        });
    }

    info!("chat front end started");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutdown requested");
    shutdown.cancel();

    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            warn!(error = %e, "background task ended abnormally");
        }
    }

    sessions.shutdown();
    info!("chat front end stopped");
    Ok(())
}

/// Accept clients until shutdown, running each connection on its own task.
async fn accept_loop(listener: TcpListener, services: ConnectionServices, shutdown: CancellationToken) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let services = services.clone();
                    let shutdown = shutdown.clone();
                    connections.spawn(async move {
                        if let Err(e) = connection::serve(stream, peer, services, shutdown).await {
                            if !e.is_cancelled() {
                                warn!(peer = %peer, error = %e, "connection closed with error");
                            }
                        }
                    });
                }
                Err(e) => warn!(error = %e, "failed to accept connection"),
            },
            // Reap finished connections so the set does not grow unbounded.
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    while connections.join_next().await.is_some() {}
}
