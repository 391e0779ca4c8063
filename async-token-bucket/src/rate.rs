use std::fmt;
use std::sync::Arc;

/// A caller-supplied configuration source, re-evaluated on demand.
pub type Supplier = Arc<dyn Fn() -> u64 + Send + Sync>;

/// Rate configuration for a bucket.
///
/// The fixed arm holds constants resolved at build time; the dynamic arm
/// re-evaluates its suppliers on every read, so the rate can change while
/// the bucket is live. The variant check is a branch on the hot path, not a
/// virtual call.
pub(crate) enum RateModel {
    Fixed(FixedRate),
    Dynamic(DynamicRate),
}

pub(crate) struct FixedRate {
    pub(crate) rate: u64,
    pub(crate) rate_period_nanos: u64,
    pub(crate) capacity: u64,
    pub(crate) target_after_throttling: u64,
}

pub(crate) struct DynamicRate {
    pub(crate) rate: Supplier,
    pub(crate) rate_period_nanos: Supplier,
    pub(crate) capacity_factor: f64,
    pub(crate) target_fill_factor: f64,
}

impl RateModel {
    /// Tokens produced per rate period.
    #[inline]
    pub(crate) fn rate(&self) -> u64 {
        match self {
            Self::Fixed(fixed) => fixed.rate,
            Self::Dynamic(dynamic) => (dynamic.rate)(),
        }
    }

    /// Period over which `rate` tokens are produced.
    #[inline]
    pub(crate) fn rate_period_nanos(&self) -> u64 {
        match self {
            Self::Fixed(fixed) => fixed.rate_period_nanos,
            Self::Dynamic(dynamic) => (dynamic.rate_period_nanos)(),
        }
    }

    /// Maximum number of stored tokens.
    #[inline]
    pub(crate) fn capacity(&self) -> u64 {
        match self {
            Self::Fixed(fixed) => fixed.capacity,
            Self::Dynamic(dynamic) => ((dynamic.rate)() as f64 * dynamic.capacity_factor) as u64,
        }
    }

    /// Token level the bucket must refill to before throttled callers are
    /// eligible to resume.
    #[inline]
    pub(crate) fn target_tokens_after_throttling(&self) -> u64 {
        match self {
            Self::Fixed(fixed) => fixed.target_after_throttling,
            Self::Dynamic(dynamic) => {
                ((dynamic.rate)() as f64 * dynamic.target_fill_factor) as u64
            }
        }
    }
}

impl fmt::Debug for RateModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(fixed) => f
                .debug_struct("Fixed")
                .field("rate", &fixed.rate)
                .field("rate_period_nanos", &fixed.rate_period_nanos)
                .field("capacity", &fixed.capacity)
                .field("target_after_throttling", &fixed.target_after_throttling)
                .finish(),
            Self::Dynamic(dynamic) => f
                .debug_struct("Dynamic")
                .field("capacity_factor", &dynamic.capacity_factor)
                .field("target_fill_factor", &dynamic.target_fill_factor)
                .finish_non_exhaustive(),
        }
    }
}
