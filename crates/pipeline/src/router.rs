use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use chatfront_common::{GatewayError, GatewayResult, RouterConfig};
use tracing::{debug, info};

use crate::kind::{PacketKind, PacketType};
use crate::middleware::{Handler, Middleware, Next, NoopHandler};
use crate::packet::{Packet, PacketContext};

/// Middleware chain plus terminal handler for one packet kind.
#[derive(Clone)]
pub struct Pipeline {
    middleware: Vec<Arc<dyn Middleware>>,
    handler: Arc<dyn Handler>,
}

impl Pipeline {
    fn empty() -> Self {
        Self {
            middleware: Vec::new(),
            handler: Arc::new(NoopHandler),
        }
    }

    pub fn middleware_len(&self) -> usize {
        self.middleware.len()
    }

    /// Run the middleware in order, then the handler.
    pub async fn run(&self, ctx: &PacketContext, packet: Arc<dyn Packet>) -> GatewayResult<()> {
        Next::new(&self.middleware, self.handler.as_ref())
            .run(ctx, packet)
            .await
    }
}

type PipelineIndex = HashMap<PacketKind, Arc<Pipeline>>;

/// Routes packets to the pipeline registered for their kind, falling back to
/// the nearest registered ancestor.
///
/// Registration is meant to happen during setup. The kind index is swapped
/// atomically on every registration, so concurrent dispatches always see a
/// consistent snapshot and never block on a lock.
pub struct Router {
    pipelines: ArcSwap<PipelineIndex>,
    throw_on_unregistered: bool,
}

impl Router {
    pub fn new(throw_on_unregistered: bool) -> Self {
        Self {
            pipelines: ArcSwap::from_pointee(HashMap::new()),
            throw_on_unregistered,
        }
    }

    pub fn from_config(config: &RouterConfig) -> Self {
        Self::new(config.throw_on_unregistered)
    }

    pub fn throw_on_unregistered(&self) -> bool {
        self.throw_on_unregistered
    }

    /// Append `middleware` to the pipeline of `T` and of every kind already
    /// registered below `T`.
    pub fn use_middleware<T, M>(&self, middleware: M)
    where
        T: PacketType,
        M: Middleware + 'static,
    {
        self.use_middleware_for(T::KIND, Arc::new(middleware));
    }

    /// Register `handler` as the terminal stage of `T`, replacing any
    /// previous handler for exactly `T`.
    pub fn use_handler<T, H>(&self, handler: H)
    where
        T: PacketType,
        H: Handler + 'static,
    {
        self.use_handler_for(T::KIND, Arc::new(handler));
    }

    pub fn use_middleware_for(&self, kind: PacketKind, middleware: Arc<dyn Middleware>) {
        self.pipelines.rcu(|current| {
            let mut index = PipelineIndex::clone(current);

            let mut pipeline = pipeline_or_inherited(&index, kind);
            pipeline.middleware.push(Arc::clone(&middleware));
            index.insert(kind, Arc::new(pipeline));

            for (registered, existing) in index.iter_mut() {
                if registered.is_descendant_of(kind) {
                    let mut updated = Pipeline::clone(existing);
                    updated.middleware.push(Arc::clone(&middleware));
                    *existing = Arc::new(updated);
                }
            }

            index
        });

        debug!(kind = kind.name(), "registered middleware");
    }

    pub fn use_handler_for(&self, kind: PacketKind, handler: Arc<dyn Handler>) {
        self.pipelines.rcu(|current| {
            let mut index = PipelineIndex::clone(current);

            let mut pipeline = pipeline_or_inherited(&index, kind);
            pipeline.handler = Arc::clone(&handler);
            index.insert(kind, Arc::new(pipeline));

            index
        });

        debug!(kind = kind.name(), "registered handler");
    }

    /// Dispatch `packet` through the pipeline resolved for its kind.
    ///
    /// Packets with no pipeline anywhere in their ancestry fail with
    /// [`GatewayError::Unregistered`] when the router is strict, and are
    /// accepted without effect otherwise.
    pub async fn execute(&self, ctx: &PacketContext, packet: Arc<dyn Packet>) -> GatewayResult<()> {
        let kind = packet.kind();

        match self.resolve(kind) {
            Some(pipeline) => pipeline.run(ctx, packet).await,
            None if self.throw_on_unregistered => {
                Err(GatewayError::Unregistered { kind: kind.name() })
            }
            None => {
                debug!(kind = kind.name(), "ignoring packet with no registered pipeline");
                Ok(())
            }
        }
    }

    /// The pipeline that would run for `kind`: its own, or the nearest
    /// registered ancestor's.
    pub fn resolve(&self, kind: PacketKind) -> Option<Arc<Pipeline>> {
        let index = self.pipelines.load();
        kind.lineage().find_map(|k| index.get(&k).cloned())
    }

    /// Returns `true` if `kind` has a pipeline of its own.
    pub fn is_registered(&self, kind: PacketKind) -> bool {
        self.pipelines.load().contains_key(&kind)
    }

    pub fn registered_kinds(&self) -> Vec<PacketKind> {
        self.pipelines.load().keys().copied().collect()
    }

    /// Drop every registration.
    pub fn remove_all(&self) {
        self.pipelines.store(Arc::new(HashMap::new()));
        info!("cleared all packet pipelines");
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::from_config(&RouterConfig::default())
    }
}

/// The existing pipeline for `kind`, or a new one seeded from the nearest
/// registered ancestor's middleware and handler.
fn pipeline_or_inherited(index: &PipelineIndex, kind: PacketKind) -> Pipeline {
    if let Some(existing) = index.get(&kind) {
        return Pipeline::clone(existing);
    }

    kind.ancestors()
        .find_map(|ancestor| index.get(&ancestor))
        .map(|inherited| Pipeline::clone(inherited))
        .unwrap_or_else(Pipeline::empty)
}
