use std::time::Duration;

use chatfront_common::{GatewayError, GatewayResult, RateLimitConfig};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Validated construction parameters for a [`TokenBucketLimiter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitSettings {
    max_tokens: u64,
    tokens_per_period: u64,
    period: Duration,
}

impl RateLimitSettings {
    /// * `max_tokens`        - bucket capacity, also the initial balance
    /// * `tokens_per_period` - tokens added back every `period`
    /// * `period`            - refill window
    pub fn new(max_tokens: u64, tokens_per_period: u64, period: Duration) -> GatewayResult<Self> {
        if max_tokens == 0 {
            return Err(GatewayError::InvalidArgument(
                "max_tokens must be greater than zero".into(),
            ));
        }
        if tokens_per_period == 0 {
            return Err(GatewayError::InvalidArgument(
                "tokens_per_period must be greater than zero".into(),
            ));
        }
        if period.is_zero() {
            return Err(GatewayError::InvalidArgument(
                "period must be greater than zero".into(),
            ));
        }

        Ok(Self {
            max_tokens,
            tokens_per_period,
            period,
        })
    }

    pub fn from_config(config: &RateLimitConfig) -> GatewayResult<Self> {
        Self::new(config.max_tokens, config.tokens_per_period, config.period())
    }

    pub fn max_tokens(&self) -> u64 {
        self.max_tokens
    }

    pub fn tokens_per_period(&self) -> u64 {
        self.tokens_per_period
    }

    pub fn period(&self) -> Duration {
        self.period
    }
}

struct BucketState {
    /// Fractional balance in `[0, max_tokens]`.
    tokens: f64,
    last_refill: Instant,
}

/// A single token bucket guarding one partition.
///
/// The bucket starts full and refills continuously at
/// `tokens_per_period / period`. [`consume`](Self::consume) never blocks
/// waiting for tokens: it either takes them immediately or reports how long
/// the caller would have to wait, leaving the balance untouched.
///
/// The refill-then-decide sequence runs under an async mutex, so concurrent
/// callers on the same bucket are serialized while independent buckets never
/// contend.
pub struct TokenBucketLimiter {
    settings: RateLimitSettings,
    /// Tokens accrued per nanosecond.
    rate: f64,
    state: Mutex<BucketState>,
}

impl TokenBucketLimiter {
    pub fn new(max_tokens: u64, tokens_per_period: u64, period: Duration) -> GatewayResult<Self> {
        RateLimitSettings::new(max_tokens, tokens_per_period, period).map(Self::from_settings)
    }

    pub fn from_settings(settings: RateLimitSettings) -> Self {
        let rate = settings.tokens_per_period as f64 / settings.period.as_nanos() as f64;

        Self {
            settings,
            rate,
            state: Mutex::new(BucketState {
                tokens: settings.max_tokens as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Try to take `count` tokens.
    ///
    /// Returns [`Duration::ZERO`] when the tokens were taken, otherwise the
    /// time until enough tokens will have accrued. Tokens are not reserved
    /// for a caller that has to wait.
    pub async fn consume(&self, count: u64) -> Duration {
        let mut state = self.state.lock().await;
        self.take(&mut state, count, Instant::now())
    }

    /// Like [`consume`](Self::consume), but gives up with
    /// [`GatewayError::Cancelled`] if `cancel` fires before the bucket's
    /// lock is acquired. A cancelled call leaves the balance untouched.
    pub async fn consume_cancellable(
        &self,
        count: u64,
        cancel: &CancellationToken,
    ) -> GatewayResult<Duration> {
        let mut state = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
            guard = self.state.lock() => guard,
        };
        Ok(self.take(&mut state, count, Instant::now()))
    }

    /// Current whole-token balance after accounting for refill.
    pub async fn available_tokens(&self) -> u64 {
        let mut state = self.state.lock().await;
        self.refill(&mut state, Instant::now());
        state.tokens.floor() as u64
    }

    pub fn settings(&self) -> RateLimitSettings {
        self.settings
    }

    pub fn max_tokens(&self) -> u64 {
        self.settings.max_tokens
    }

    pub fn tokens_per_period(&self) -> u64 {
        self.settings.tokens_per_period
    }

    /// The refill window.
    pub fn time_window(&self) -> Duration {
        self.settings.period
    }

    pub fn rate_per_second(&self) -> f64 {
        self.rate * 1e9
    }

    /// Refill rate per nanosecond, the native tick of [`Duration`].
    pub fn rate_per_nanosecond(&self) -> f64 {
        self.rate
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last_refill);
        // Multiply before dividing so whole fractions of the period stay exact.
        let accrued = elapsed.as_nanos() as f64 * self.settings.tokens_per_period as f64
            / self.settings.period.as_nanos() as f64;
        state.tokens = (state.tokens + accrued).min(self.settings.max_tokens as f64);
        state.last_refill = now;
    }

    fn take(&self, state: &mut BucketState, count: u64, now: Instant) -> Duration {
        self.refill(state, now);

        let requested = count as f64;
        if state.tokens >= requested {
            state.tokens -= requested;
            return Duration::ZERO;
        }

        let shortfall = requested - state.tokens;
        let wait_secs = shortfall * self.settings.period.as_secs_f64()
            / self.settings.tokens_per_period as f64;
        Duration::try_from_secs_f64(wait_secs).unwrap_or(Duration::MAX)
    }
}

impl std::fmt::Debug for TokenBucketLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucketLimiter")
            .field("settings", &self.settings)
            .field("rate_per_second", &self.rate_per_second())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: Duration = Duration::from_secs(24 * 3600);

    fn assert_close(actual: Duration, expected: Duration, tolerance: f64) {
        let diff = (actual.as_secs_f64() - expected.as_secs_f64()).abs();
        assert!(
            diff <= expected.as_secs_f64() * tolerance,
            "expected ~{expected:?}, got {actual:?}"
        );
    }

    #[tokio::test]
    async fn bucket_starts_full() {
        let limiter = TokenBucketLimiter::new(1, 1, Duration::from_secs(1)).unwrap();
        assert_eq!(limiter.consume(1).await, Duration::ZERO);
    }

    #[tokio::test]
    async fn full_bucket_admits_whole_capacity_at_once() {
        let limiter = TokenBucketLimiter::new(10, 10, Duration::from_secs(60)).unwrap();
        assert_eq!(limiter.consume(10).await, Duration::ZERO);
        assert_eq!(limiter.available_tokens().await, 0);
    }

    // One token per period, so one missing token costs a whole period. With
    // ten tokens per period the same shortfall only waits a tenth of it;
    // `wait_is_shortfall_over_rate` covers that case.
    #[tokio::test]
    async fn exhausted_bucket_reports_wait_of_one_period() {
        let period = 365 * DAY;
        let limiter = TokenBucketLimiter::new(10, 1, period).unwrap();

        assert_eq!(limiter.consume(10).await, Duration::ZERO);
        let wait = limiter.consume(1).await;

        assert!(wait > Duration::ZERO);
        assert_close(wait, period, 0.1);
    }

    #[tokio::test]
    async fn wait_is_shortfall_over_rate() {
        let period = 365 * DAY;
        let limiter = TokenBucketLimiter::new(10, 10, period).unwrap();

        assert_eq!(limiter.consume(10).await, Duration::ZERO);
        assert_close(limiter.consume(1).await, period / 10, 0.1);
        assert_close(limiter.consume(5).await, period / 2, 0.1);
    }

    // The rate is tokens_per_period / period and ignores capacity, so a rate
    // of 3 / period needs three tokens per period, not a capacity of three.
    #[test]
    fn rate_is_tokens_per_period_over_period() {
        let period = Duration::from_secs(60);
        let limiter = TokenBucketLimiter::new(1, 3, period).unwrap();

        let per_nanos = 3.0 / period.as_nanos() as f64;
        let per_second = 3.0 / period.as_secs_f64();

        assert!((limiter.rate_per_nanosecond() - per_nanos).abs() < 1e-18);
        assert!((limiter.rate_per_second() - per_second).abs() < 1e-9);
    }

    #[test]
    fn rejects_invalid_settings() {
        assert!(matches!(
            TokenBucketLimiter::new(0, 1, Duration::from_secs(1)),
            Err(GatewayError::InvalidArgument(_))
        ));
        assert!(matches!(
            TokenBucketLimiter::new(1, 0, Duration::from_secs(1)),
            Err(GatewayError::InvalidArgument(_))
        ));
        assert!(matches!(
            TokenBucketLimiter::new(1, 1, Duration::ZERO),
            Err(GatewayError::InvalidArgument(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn refills_continuously_up_to_capacity() {
        let limiter = TokenBucketLimiter::new(4, 2, Duration::from_secs(1)).unwrap();
        assert_eq!(limiter.consume(4).await, Duration::ZERO);
        assert!(limiter.consume(1).await > Duration::ZERO);

        // Half a token after 250ms is not enough.
        tokio::time::advance(Duration::from_millis(250)).await;
        assert_close(limiter.consume(1).await, Duration::from_millis(250), 0.01);

        tokio::time::advance(Duration::from_millis(250)).await;
        assert_eq!(limiter.consume(1).await, Duration::ZERO);

        // Long idle periods never overfill the bucket.
        tokio::time::advance(Duration::from_secs(3600)).await;
        assert_eq!(limiter.available_tokens().await, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn denied_requests_do_not_deduct() {
        let limiter = TokenBucketLimiter::new(2, 1, Duration::from_secs(1)).unwrap();
        assert_eq!(limiter.consume(2).await, Duration::ZERO);

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(limiter.consume(1).await > Duration::ZERO);
        assert!(limiter.consume(1).await > Duration::ZERO);

        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(limiter.consume(1).await, Duration::ZERO);
    }

    #[tokio::test]
    async fn cancelled_consume_leaves_balance_untouched() {
        let limiter = TokenBucketLimiter::new(3, 1, DAY).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = limiter.consume_cancellable(1, &cancel).await;
        assert!(matches!(result, Err(GatewayError::Cancelled)));
        assert_eq!(limiter.available_tokens().await, 3);
    }

    #[tokio::test]
    async fn cancellation_while_waiting_for_lock_releases_cleanly() {
        let limiter = std::sync::Arc::new(TokenBucketLimiter::new(3, 1, DAY).unwrap());
        let held = limiter.state.lock().await;

        let cancel = CancellationToken::new();
        let waiter = {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { limiter.consume_cancellable(1, &cancel).await })
        };

        tokio::task::yield_now().await;
        cancel.cancel();
        assert!(matches!(waiter.await.unwrap(), Err(GatewayError::Cancelled)));

        drop(held);
        assert_eq!(limiter.consume(1).await, Duration::ZERO);
        assert_eq!(limiter.available_tokens().await, 2);
    }

    #[tokio::test]
    async fn concurrent_consumers_never_overdraw() {
        let limiter = std::sync::Arc::new(TokenBucketLimiter::new(50, 1, DAY).unwrap());

        let mut tasks = Vec::new();
        for _ in 0..200 {
            let limiter = limiter.clone();
            tasks.push(tokio::spawn(async move { limiter.consume(1).await.is_zero() }));
        }

        let mut admitted = 0;
        for task in tasks {
            if task.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 50);
    }
}
