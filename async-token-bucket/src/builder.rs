use std::sync::Arc;
use std::time::Duration;

use crate::bucket::TokenBucket;
use crate::clock::ClockSource;
use crate::clock::MonotonicClock;
use crate::default_resolution_nanos;
use crate::rate::DynamicRate;
use crate::rate::FixedRate;
use crate::rate::RateModel;
use crate::rate::Supplier;

const NANOS_PER_SECOND: u64 = 1_000_000_000;

/// Errors produced when a bucket configuration fails validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuildError {
    /// No rate was configured.
    #[error("rate must be configured")]
    MissingRate,

    /// The configured rate was zero.
    #[error("rate must be > 0")]
    ZeroRate,

    /// The configured rate period was zero.
    #[error("rate period must be > 0")]
    ZeroRatePeriod,

    /// A scaling factor was negative, NaN, or infinite.
    #[error("{0} must be a finite, non-negative factor")]
    InvalidFactor(&'static str),
}

/// Configures a bucket with a constant rate.
///
/// `rate` is required; everything else defaults per the table on each
/// setter. Validation happens in [`build`](TokenBucketBuilder::build).
#[derive(Default)]
pub struct TokenBucketBuilder {
    rate: Option<u64>,
    capacity: Option<u64>,
    initial_tokens: Option<u64>,
    rate_period: Option<Duration>,
    resolution: Option<Duration>,
    clock: Option<Arc<dyn ClockSource>>,
}

impl TokenBucketBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tokens produced per rate period. Required.
    pub fn rate(mut self, rate: u64) -> Self {
        self.rate = Some(rate);
        self
    }

    /// Maximum stored tokens. Defaults to `rate`.
    pub fn capacity(mut self, capacity: u64) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Tokens at construction. Defaults to `rate`.
    pub fn initial_tokens(mut self, initial_tokens: u64) -> Self {
        self.initial_tokens = Some(initial_tokens);
        self
    }

    /// Period over which `rate` tokens are produced. Defaults to 1 s.
    pub fn rate_period(mut self, rate_period: Duration) -> Self {
        self.rate_period = Some(rate_period);
        self
    }

    /// Reconciliation interval. Defaults to the process-wide default
    /// (16 ms). Zero makes every operation reconcile.
    pub fn resolution(mut self, resolution: Duration) -> Self {
        self.resolution = Some(resolution);
        self
    }

    /// Monotonic clock to read. Defaults to a direct high-precision clock.
    pub fn clock_source(mut self, clock: Arc<dyn ClockSource>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> Result<TokenBucket, BuildError> {
        let rate = self.rate.ok_or(BuildError::MissingRate)?;
        if rate == 0 {
            return Err(BuildError::ZeroRate);
        }
        let rate_period_nanos = self
            .rate_period
            .map(|period| period.as_nanos() as u64)
            .unwrap_or(NANOS_PER_SECOND);
        if rate_period_nanos == 0 {
            return Err(BuildError::ZeroRatePeriod);
        }

        let capacity = self.capacity.unwrap_or(rate);
        let initial_tokens = self.initial_tokens.unwrap_or(rate);
        let resolution_nanos = self
            .resolution
            .map(|resolution| resolution.as_nanos() as u64)
            .unwrap_or_else(default_resolution_nanos);
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(MonotonicClock::new()));

        let target_after_throttling = (resolution_nanos as u128 * rate as u128
            / rate_period_nanos as u128)
            .max(1) as u64;

        tracing::debug!(rate, capacity, resolution_nanos, "token bucket built");
        Ok(TokenBucket::new(
            RateModel::Fixed(FixedRate {
                rate,
                rate_period_nanos,
                capacity,
                target_after_throttling,
            }),
            initial_tokens,
            resolution_nanos,
            clock,
        ))
    }
}

/// Configures a bucket whose rate and period are evaluated on demand.
///
/// A rate supplier is required. Capacity, initial fill, and the
/// post-throttling target are derived from the supplied rate through
/// scaling factors.
#[derive(Default)]
pub struct DynamicTokenBucketBuilder {
    rate: Option<Supplier>,
    rate_period: Option<Supplier>,
    capacity_factor: Option<f64>,
    initial_fill_factor: Option<f64>,
    target_fill_factor: Option<f64>,
    resolution: Option<Duration>,
    clock: Option<Arc<dyn ClockSource>>,
}

impl DynamicTokenBucketBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Supplier of the current rate. Required.
    pub fn rate_supplier(mut self, rate: impl Fn() -> u64 + Send + Sync + 'static) -> Self {
        self.rate = Some(Arc::new(rate));
        self
    }

    /// Supplier of the current rate period in nanoseconds. Defaults to a
    /// constant 1 s.
    pub fn rate_period_supplier(
        mut self,
        rate_period: impl Fn() -> u64 + Send + Sync + 'static,
    ) -> Self {
        self.rate_period = Some(Arc::new(rate_period));
        self
    }

    /// `capacity = rate × factor`. Defaults to 1.0.
    pub fn capacity_factor(mut self, factor: f64) -> Self {
        self.capacity_factor = Some(factor);
        self
    }

    /// `initial tokens = rate × factor`, evaluated once at build. Defaults
    /// to 1.0.
    pub fn initial_fill_factor(mut self, factor: f64) -> Self {
        self.initial_fill_factor = Some(factor);
        self
    }

    /// `post-throttling target = rate × factor`. Defaults to 0.01.
    pub fn target_fill_factor(mut self, factor: f64) -> Self {
        self.target_fill_factor = Some(factor);
        self
    }

    /// Reconciliation interval. Defaults to the process-wide default
    /// (16 ms). Zero makes every operation reconcile.
    pub fn resolution(mut self, resolution: Duration) -> Self {
        self.resolution = Some(resolution);
        self
    }

    /// Monotonic clock to read. Defaults to a direct high-precision clock.
    pub fn clock_source(mut self, clock: Arc<dyn ClockSource>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> Result<TokenBucket, BuildError> {
        let rate = self.rate.ok_or(BuildError::MissingRate)?;
        let rate_period = self
            .rate_period
            .unwrap_or_else(|| Arc::new(|| NANOS_PER_SECOND));

        let capacity_factor = validated_factor("capacity factor", self.capacity_factor, 1.0)?;
        let initial_fill_factor =
            validated_factor("initial fill factor", self.initial_fill_factor, 1.0)?;
        let target_fill_factor =
            validated_factor("target fill factor", self.target_fill_factor, 0.01)?;

        let resolution_nanos = self
            .resolution
            .map(|resolution| resolution.as_nanos() as u64)
            .unwrap_or_else(default_resolution_nanos);
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(MonotonicClock::new()));

        let initial_tokens = (rate() as f64 * initial_fill_factor) as u64;

        tracing::debug!(resolution_nanos, "dynamic token bucket built");
        Ok(TokenBucket::new(
            RateModel::Dynamic(DynamicRate {
                rate,
                rate_period_nanos: rate_period,
                capacity_factor,
                target_fill_factor,
            }),
            initial_tokens,
            resolution_nanos,
            clock,
        ))
    }
}

fn validated_factor(
    name: &'static str,
    factor: Option<f64>,
    default: f64,
) -> Result<f64, BuildError> {
    let factor = factor.unwrap_or(default);
    if !factor.is_finite() || factor < 0.0 {
        return Err(BuildError::InvalidFactor(name));
    }
    Ok(factor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::restore_default_resolution;
    use crate::strict_resolution_for_tests;

    #[test]
    fn rate_is_required() {
        assert_eq!(
            TokenBucketBuilder::new().build().unwrap_err(),
            BuildError::MissingRate
        );
        assert_eq!(
            DynamicTokenBucketBuilder::new().build().unwrap_err(),
            BuildError::MissingRate
        );
    }

    #[test]
    fn zero_rate_and_zero_period_are_rejected() {
        assert_eq!(
            TokenBucketBuilder::new().rate(0).build().unwrap_err(),
            BuildError::ZeroRate
        );
        assert_eq!(
            TokenBucketBuilder::new()
                .rate(10)
                .rate_period(Duration::ZERO)
                .build()
                .unwrap_err(),
            BuildError::ZeroRatePeriod
        );
    }

    #[test]
    fn capacity_and_initial_tokens_default_to_rate() {
        let bucket = TokenBucketBuilder::new().rate(25).build().unwrap();
        assert_eq!(bucket.capacity(), 25);
        assert_eq!(bucket.rate(), 25);
        assert_eq!(bucket.rate_period(), Duration::from_secs(1));
        assert_eq!(bucket.tokens(), 25);
    }

    #[test]
    fn throttling_target_scales_with_resolution() {
        let bucket = TokenBucketBuilder::new()
            .rate(1_000)
            .resolution(Duration::from_millis(16))
            .build()
            .unwrap();
        assert_eq!(bucket.target_tokens_after_throttling(), 16);

        // Too small for a whole token per tick: floor of one token.
        let bucket = TokenBucketBuilder::new()
            .rate(10)
            .resolution(Duration::from_millis(16))
            .build()
            .unwrap();
        assert_eq!(bucket.target_tokens_after_throttling(), 1);
    }

    #[test]
    fn invalid_factors_are_rejected() {
        assert_eq!(
            DynamicTokenBucketBuilder::new()
                .rate_supplier(|| 10)
                .capacity_factor(-1.0)
                .build()
                .unwrap_err(),
            BuildError::InvalidFactor("capacity factor")
        );
        assert_eq!(
            DynamicTokenBucketBuilder::new()
                .rate_supplier(|| 10)
                .target_fill_factor(f64::NAN)
                .build()
                .unwrap_err(),
            BuildError::InvalidFactor("target fill factor")
        );
    }

    #[test]
    fn dynamic_defaults_follow_the_supplied_rate() {
        let bucket = DynamicTokenBucketBuilder::new()
            .rate_supplier(|| 100)
            .build()
            .unwrap();
        assert_eq!(bucket.capacity(), 100);
        assert_eq!(bucket.tokens(), 100);
        assert_eq!(bucket.target_tokens_after_throttling(), 1);
    }

    #[test]
    fn strict_toggle_changes_the_default_resolution() {
        strict_resolution_for_tests();
        let strict = TokenBucketBuilder::new().rate(10).build().unwrap();
        assert_eq!(strict.resolution(), Duration::ZERO);

        restore_default_resolution();
        let batched = TokenBucketBuilder::new().rate(10).build().unwrap();
        assert_eq!(batched.resolution(), Duration::from_millis(16));
    }
}
