//! Rate limiting for the chat front end.
//!
//! [`TokenBucketLimiter`] is a single continuously refilling bucket. It never
//! sleeps: a request either takes its tokens immediately or is told how long
//! it would have to wait.
//!
//! [`PartitionedRateLimit`] is pipeline middleware that keeps one bucket per
//! partition (per client by default) in a TTL cache and drops packets from
//! partitions that are out of tokens.

pub mod partitioned;
pub mod token_bucket;

use chatfront_common::{GatewayResult, RateLimitConfig};

pub use partitioned::{
    LimiterFactory, PartitionFn, PartitionedRateLimit, PartitionedRateLimitBuilder,
    RateLimitedEvent, RateLimitedObserver,
};
pub use token_bucket::{RateLimitSettings, TokenBucketLimiter};

/// Build per-client rate limiting from configuration.
///
/// Returns `None` when rate limiting is disabled.
pub fn per_client_from_config(
    config: &RateLimitConfig,
) -> GatewayResult<Option<PartitionedRateLimitBuilder<String>>> {
    if !config.enabled {
        tracing::info!("per-client rate limiting disabled");
        return Ok(None);
    }

    let settings = RateLimitSettings::from_config(config)?;
    tracing::info!(
        max_tokens = settings.max_tokens(),
        tokens_per_period = settings.tokens_per_period(),
        period_ms = settings.period().as_millis() as u64,
        "creating per-client token bucket rate limiter"
    );
    Ok(Some(PartitionedRateLimit::per_client(settings)))
}
