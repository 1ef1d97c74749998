use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chatfront_cache::TtlCache;
use chatfront_common::{GatewayError, GatewayResult};
use chatfront_pipeline::{Client, Middleware, Next, Packet, PacketContext};
use tracing::debug;

use crate::token_bucket::{RateLimitSettings, TokenBucketLimiter};

/// Produces a fresh limiter for a partition seen for the first time.
pub type LimiterFactory = Arc<dyn Fn() -> TokenBucketLimiter + Send + Sync>;

/// Maps a client to the partition whose limiter it draws from.
pub type PartitionFn<K> = Arc<dyn Fn(&dyn Client) -> K + Send + Sync>;

/// Called for every packet dropped by the limiter.
pub type RateLimitedObserver = Arc<dyn Fn(&RateLimitedEvent<'_>) + Send + Sync>;

/// Details of a packet dropped because its partition ran out of tokens.
pub struct RateLimitedEvent<'a> {
    pub client: &'a Arc<dyn Client>,
    pub packet: &'a Arc<dyn Packet>,
    /// Time until the partition could admit the packet.
    pub wait: Duration,
}

/// Middleware that gives each partition its own token bucket.
///
/// Limiters live in a [`TtlCache`] for twice their refill window, so a
/// partition that goes quiet is forgotten and starts over with a full bucket
/// the next time it shows up. Packets from a partition without tokens are
/// dropped: the rest of the chain is skipped, registered observers are told,
/// and the dispatch still succeeds.
pub struct PartitionedRateLimit<K> {
    factory: LimiterFactory,
    partition: PartitionFn<K>,
    limiters: TtlCache<K, Arc<TokenBucketLimiter>>,
    observers: Vec<RateLimitedObserver>,
}

impl PartitionedRateLimit<String> {
    /// A builder that partitions by [`Client::id`] and creates limiters
    /// from `settings`.
    pub fn per_client(settings: RateLimitSettings) -> PartitionedRateLimitBuilder<String> {
        PartitionedRateLimit::builder()
            .factory(move || TokenBucketLimiter::from_settings(settings))
            .partition_by(|client| client.id().to_string())
    }
}

impl<K> PartitionedRateLimit<K>
where
    K: Eq + Hash + Send + Sync + 'static,
{
    pub fn builder() -> PartitionedRateLimitBuilder<K> {
        PartitionedRateLimitBuilder {
            factory: None,
            partition: None,
            observers: Vec::new(),
            sweep_interval: None,
        }
    }

    /// Number of partitions currently holding a limiter, including expired
    /// ones not yet evicted.
    pub fn partition_count(&self) -> usize {
        self.limiters.len()
    }

    /// The live limiter for `key`, if the partition has one.
    pub fn limiter(&self, key: &K) -> GatewayResult<Option<Arc<TokenBucketLimiter>>> {
        Ok(self.limiters.try_get(key)?.map(|(limiter, _)| limiter))
    }

    fn limiter_for(&self, key: K) -> GatewayResult<Arc<TokenBucketLimiter>> {
        self.limiters.get_or_add(
            key,
            |_, factory: &LimiterFactory| {
                let limiter = factory();
                let lifetime = limiter.time_window().saturating_mul(2);
                (Arc::new(limiter), lifetime)
            },
            &self.factory,
        )
    }
}

#[async_trait]
impl<K> Middleware for PartitionedRateLimit<K>
where
    K: Eq + Hash + Send + Sync + 'static,
{
    async fn invoke(
        &self,
        ctx: &PacketContext,
        packet: Arc<dyn Packet>,
        next: Next<'_>,
    ) -> GatewayResult<()> {
        let key = (self.partition)(ctx.client().as_ref());
        let limiter = self.limiter_for(key)?;

        let wait = limiter.consume_cancellable(1, ctx.cancellation()).await?;
        if !wait.is_zero() {
            debug!(
                client = %ctx.client().id(),
                kind = packet.kind().name(),
                wait_ms = wait.as_millis() as u64,
                "packet dropped by rate limit"
            );

            let event = RateLimitedEvent {
                client: ctx.client(),
                packet: &packet,
                wait,
            };
            for observer in &self.observers {
                observer(&event);
            }
            return Ok(());
        }

        next.run(ctx, packet).await
    }
}

pub struct PartitionedRateLimitBuilder<K> {
    factory: Option<LimiterFactory>,
    partition: Option<PartitionFn<K>>,
    observers: Vec<RateLimitedObserver>,
    sweep_interval: Option<Duration>,
}

impl<K> PartitionedRateLimitBuilder<K>
where
    K: Eq + Hash + Send + Sync + 'static,
{
    pub fn factory<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> TokenBucketLimiter + Send + Sync + 'static,
    {
        self.factory = Some(Arc::new(factory));
        self
    }

    pub fn partition_by<F>(mut self, partition: F) -> Self
    where
        F: Fn(&dyn Client) -> K + Send + Sync + 'static,
    {
        self.partition = Some(Arc::new(partition));
        self
    }

    /// Add an observer for dropped packets. Observers run synchronously, in
    /// the order they were added.
    pub fn on_rate_limited<F>(mut self, observer: F) -> Self
    where
        F: Fn(&RateLimitedEvent<'_>) + Send + Sync + 'static,
    {
        self.observers.push(Arc::new(observer));
        self
    }

    /// Sweep idle partitions in the background every `interval`.
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = Some(interval);
        self
    }

    pub fn build(self) -> GatewayResult<PartitionedRateLimit<K>> {
        let factory = self.factory.ok_or_else(|| {
            GatewayError::InvalidArgument("rate limit middleware needs a limiter factory".into())
        })?;
        let partition = self.partition.ok_or_else(|| {
            GatewayError::InvalidArgument("rate limit middleware needs a partition function".into())
        })?;

        // Entries always carry an explicit lifetime; the default is unused.
        let limiters = TtlCache::new(Duration::from_secs(60));
        if let Some(interval) = self.sweep_interval {
            limiters.start_sweeper(interval)?;
        }

        Ok(PartitionedRateLimit {
            factory,
            partition,
            limiters,
            observers: self.observers,
        })
    }
}
