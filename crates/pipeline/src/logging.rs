use std::sync::Arc;

use async_trait::async_trait;
use chatfront_common::GatewayResult;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::middleware::{Middleware, Next};
use crate::packet::{Packet, PacketContext};

/// Logs every dispatch that passes through it, with its outcome and latency.
///
/// Register it on the root kind so it wraps every other stage.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMiddleware;

#[async_trait]
impl Middleware for TracingMiddleware {
    async fn invoke(
        &self,
        ctx: &PacketContext,
        packet: Arc<dyn Packet>,
        next: Next<'_>,
    ) -> GatewayResult<()> {
        let kind = packet.kind();
        let started = Instant::now();

        let result = next.run(ctx, packet).await;
        let elapsed_us = started.elapsed().as_micros() as u64;

        match &result {
            Ok(()) => debug!(
                client = %ctx.client().id(),
                kind = kind.name(),
                elapsed_us,
                "packet dispatched"
            ),
            Err(e) if e.is_cancelled() => debug!(
                client = %ctx.client().id(),
                kind = kind.name(),
                "packet dispatch cancelled"
            ),
            Err(e) => warn!(
                client = %ctx.client().id(),
                kind = kind.name(),
                elapsed_us,
                error = %e,
                "packet dispatch failed"
            ),
        }

        result
    }
}
