use std::sync::Arc;

use anyhow::Result;
use chatfront_common::AppConfig;
use chatfront_pipeline::{AnyPacket, Router, TracingMiddleware};
use chatfront_rate_limit::RateLimitedEvent;
use tracing::{debug, info};

use crate::handlers::{
    HelloHandler, JoinRoomHandler, PingHandler, RoomMembershipGuard, SendMessageHandler,
};
use crate::metrics::ChatMetrics;
use crate::packets::{ClientPacket, Hello, JoinRoom, Outbound, Ping, RoomPacket, SendMessage};
use crate::session::SessionRegistry;

/// Assemble the packet router.
///
/// Middleware is registered from the root down so every concrete pipeline
/// inherits the full chain: tracing, then per-client rate limiting, then the
/// room membership guard for room packets.
pub fn build_router(
    config: &AppConfig,
    sessions: Arc<SessionRegistry>,
    metrics: Arc<ChatMetrics>,
) -> Result<Router> {
    let router = Router::from_config(&config.router);

    router.use_middleware::<AnyPacket, _>(TracingMiddleware);

    if let Some(mut builder) = chatfront_rate_limit::per_client_from_config(&config.rate_limit)? {
        let limited = metrics.clone();
        builder = builder.on_rate_limited(move |event| notify_rate_limited(&limited, event));
        if let Some(interval) = config.cache.sweep_interval() {
            builder = builder.sweep_interval(interval);
        }
        router.use_middleware::<ClientPacket, _>(builder.build()?);
    }

    router.use_middleware::<RoomPacket, _>(RoomMembershipGuard::new(sessions.clone()));

    router.use_handler::<Ping, _>(PingHandler);
    router.use_handler::<Hello, _>(HelloHandler::new(sessions.clone()));
    router.use_handler::<JoinRoom, _>(JoinRoomHandler::new(sessions.clone()));
    router.use_handler::<SendMessage, _>(SendMessageHandler::new(sessions));

    info!(
        kinds = router.registered_kinds().len(),
        throw_on_unregistered = router.throw_on_unregistered(),
        "packet router ready"
    );
    Ok(router)
}

fn notify_rate_limited(metrics: &ChatMetrics, event: &RateLimitedEvent<'_>) {
    metrics.packets_rate_limited.inc();

    let client = event.client.clone();
    let frame = Arc::new(Outbound::RateLimited {
        retry_after_ms: event.wait.as_millis().min(u64::MAX as u128) as u64,
    });
    // Observers are synchronous; deliver the notice off the dispatch path.
    tokio::spawn(async move {
        if let Err(e) = client.send(frame).await {
            debug!(client = %client.id(), error = %e, "failed to deliver rate limit notice");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingClient;
    use chatfront_pipeline::{PacketContext, PacketType};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn config(yaml_rate_limit: &str) -> AppConfig {
        let yaml = format!(
            "server:\n  listen: [\"127.0.0.1:0\"]\ncache:\n  sweep_interval_secs: 0\n{yaml_rate_limit}"
        );
        AppConfig::from_yaml(&yaml).unwrap()
    }

    fn setup(config: &AppConfig) -> (Router, Arc<SessionRegistry>, Arc<ChatMetrics>) {
        let sessions = Arc::new(SessionRegistry::new(Duration::from_secs(60)));
        let metrics = Arc::new(ChatMetrics::new().unwrap());
        let router = build_router(config, sessions.clone(), metrics.clone()).unwrap();
        (router, sessions, metrics)
    }

    #[tokio::test]
    async fn every_client_packet_has_a_pipeline() {
        let (router, _, _) = setup(&config(""));

        for kind in [Ping::KIND, Hello::KIND, JoinRoom::KIND, SendMessage::KIND] {
            let pipeline = router.resolve(kind).unwrap();
            assert!(router.is_registered(kind));
            assert!(pipeline.middleware_len() >= 2, "{kind} is missing middleware");
        }
        assert_eq!(router.resolve(SendMessage::KIND).unwrap().middleware_len(), 3);
    }

    #[tokio::test]
    async fn unjoined_room_message_is_refused() {
        let (router, sessions, _) = setup(&config(""));
        let (client, sent) = RecordingClient::new("mallory");
        sessions.register(client.clone());
        let ctx = PacketContext::new(client, CancellationToken::new());

        router
            .execute(
                &ctx,
                Arc::new(SendMessage {
                    room: "secret".into(),
                    text: "hi".into(),
                }),
            )
            .await
            .unwrap();

        assert!(matches!(&sent.lock().unwrap()[0], Outbound::Error { .. }));
        assert!(sessions.last_message("secret").unwrap().is_none());
    }

    #[tokio::test]
    async fn rate_limited_client_is_told_and_counted() {
        let config = config(
            "rate_limit:\n  max_tokens: 1\n  tokens_per_period: 1\n  period_ms: 3600000\n",
        );
        let (router, sessions, metrics) = setup(&config);
        let (client, sent) = RecordingClient::new("chatty");
        sessions.register(client.clone());
        let ctx = PacketContext::new(client, CancellationToken::new());

        router.execute(&ctx, Arc::new(Ping { nonce: None })).await.unwrap();
        router.execute(&ctx, Arc::new(Ping { nonce: None })).await.unwrap();

        for _ in 0..10 {
            if sent.lock().unwrap().len() == 2 {
                break;
            }
            tokio::task::yield_now().await;
        }

        let sent = sent.lock().unwrap();
        assert_eq!(sent[0], Outbound::Pong { nonce: None });
        assert!(matches!(sent[1], Outbound::RateLimited { retry_after_ms } if retry_after_ms > 0));
        assert_eq!(metrics.packets_rate_limited.get(), 1);
    }

    #[tokio::test]
    async fn disabled_rate_limit_adds_no_middleware() {
        let (router, _, _) = setup(&config("rate_limit:\n  enabled: false\n"));
        assert_eq!(router.resolve(Ping::KIND).unwrap().middleware_len(), 1);
    }
}
