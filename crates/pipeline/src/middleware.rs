use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use chatfront_common::GatewayResult;

use crate::packet::{Packet, PacketContext};

/// A cross-cutting stage in a packet pipeline.
///
/// A middleware either forwards the packet with [`Next::run`] (possibly a
/// different packet than it received) or returns without calling it, which
/// stops the chain. Errors propagate straight back to the caller of
/// [`Router::execute`](crate::Router::execute).
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn invoke(
        &self,
        ctx: &PacketContext,
        packet: Arc<dyn Packet>,
        next: Next<'_>,
    ) -> GatewayResult<()>;
}

/// The terminal processor of a packet type.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, ctx: &PacketContext, packet: Arc<dyn Packet>) -> GatewayResult<()>;
}

/// The remainder of a pipeline after the current middleware.
pub struct Next<'a> {
    middleware: &'a [Arc<dyn Middleware>],
    handler: &'a dyn Handler,
}

impl<'a> Next<'a> {
    pub(crate) fn new(middleware: &'a [Arc<dyn Middleware>], handler: &'a dyn Handler) -> Self {
        Self {
            middleware,
            handler,
        }
    }

    /// Run the next link; the handler when no middleware is left.
    ///
    /// Fails with `Cancelled` instead of running anything once the
    /// dispatch's cancellation token has fired.
    pub async fn run(self, ctx: &PacketContext, packet: Arc<dyn Packet>) -> GatewayResult<()> {
        ctx.ensure_not_cancelled()?;

        match self.middleware.split_first() {
            Some((current, rest)) => {
                current
                    .invoke(ctx, packet, Next::new(rest, self.handler))
                    .await
            }
            None => self.handler.handle(ctx, packet).await,
        }
    }

    /// Number of middleware still ahead of the handler.
    pub fn remaining(&self) -> usize {
        self.middleware.len()
    }
}

/// Handler that accepts every packet and does nothing.
///
/// Used for pipelines that only have middleware registered.
pub struct NoopHandler;

#[async_trait]
impl Handler for NoopHandler {
    async fn handle(&self, _ctx: &PacketContext, _packet: Arc<dyn Packet>) -> GatewayResult<()> {
        Ok(())
    }
}

/// Handler backed by an async closure. See [`handler_fn`].
pub struct HandlerFn<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

/// Build a [`Handler`] from an async closure taking owned arguments.
///
/// ```
/// use chatfront_pipeline::handler_fn;
///
/// let handler = handler_fn(|ctx, packet| async move {
///     tracing::info!(client = %ctx.client().id(), kind = %packet.kind(), "handled");
///     Ok(())
/// });
/// # let _ = handler;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F, Fut>
where
    F: Fn(PacketContext, Arc<dyn Packet>) -> Fut + Send + Sync,
    Fut: Future<Output = GatewayResult<()>> + Send,
{
    HandlerFn {
        f,
        _fut: PhantomData,
    }
}

#[async_trait]
impl<F, Fut> Handler for HandlerFn<F, Fut>
where
    F: Fn(PacketContext, Arc<dyn Packet>) -> Fut + Send + Sync,
    Fut: Future<Output = GatewayResult<()>> + Send,
{
    async fn handle(&self, ctx: &PacketContext, packet: Arc<dyn Packet>) -> GatewayResult<()> {
        (self.f)(ctx.clone(), packet).await
    }
}
