//! # async-token-bucket
//!
//! `async-token-bucket` provides a lock-free token-bucket calculator built
//! to sit under a high-throughput rate limiter.
//!
//! ## Core Philosophy
//!
//! A token bucket guarded by a `Mutex`, or even a single shared atomic
//! counter, becomes the bottleneck of whatever it is throttling once enough
//! threads hammer it. This crate splits the work into a hot path and a cold
//! path:
//!
//! * the **hot path** (`consume`) touches no contended memory location: it
//!   adds into a cache-line-striped counter and returns;
//! * once per **resolution interval** (16 ms by default), a single caller is
//!   elected by CAS to fold elapsed time and pending consumption into the
//!   authoritative balance;
//! * the **cold path** (`tokens_synced`, `throttling_duration`) forces that
//!   reconciliation and answers from a coherent view.
//!
//! The balance is therefore eventually consistent between ticks and exact
//! on demand. Sub-tick nanoseconds are carried forward, so production is
//! precise over time even at rates like 1 token/s.
//!
//! ## Key Concepts
//!
//! * **Lock-Free**: a few atomics and a branch per `consume`; CAS-retry
//!   only on the once-per-tick commit.
//! * **Granular Clock**: clock reads can be served from a snapshot cached
//!   by a background ticker, for platforms where the monotonic-time
//!   syscall dominates hot-path cost.
//! * **Fixed and Dynamic Rates**: configuration is either frozen at build
//!   time or re-evaluated from caller-supplied functions on demand.
//!
//! ## Example
//!
//! ```rust
//! use async_token_bucket::TokenBucket;
//!
//! let bucket = TokenBucket::builder()
//!     .rate(1_000)
//!     .capacity(10_000)
//!     .build()
//!     .unwrap();
//!
//! bucket.consume(1);
//! if !bucket.contains_tokens() {
//!     let wait = bucket.throttling_duration();
//!     // hand `wait` to the throttling queue
//! }
//! ```

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

mod adder;
mod bucket;
mod builder;
mod clock;
mod rate;

pub use bucket::TokenBucket;
pub use builder::BuildError;
pub use builder::DynamicTokenBucketBuilder;
pub use builder::TokenBucketBuilder;
pub use clock::ClockError;
pub use clock::ClockSource;
pub use clock::GranularClock;
pub use clock::ManualClock;
pub use clock::MonotonicClock;
pub use rate::Supplier;

/// Default reconciliation interval.
const DEFAULT_RESOLUTION_NANOS: u64 = 16_000_000;

/// Process-wide default resolution, applied by builders that were not given
/// an explicit one.
static DEFAULT_RESOLUTION: AtomicU64 = AtomicU64::new(DEFAULT_RESOLUTION_NANOS);

/// Switches the process-wide default resolution to zero, so every bucket
/// built afterwards reconciles on every operation.
///
/// Strict mode exists for deterministic test harnesses; it defeats the
/// batching that makes the hot path cheap. Production code should configure
/// resolution per bucket instead. Pair with
/// [`restore_default_resolution`].
pub fn strict_resolution_for_tests() {
    DEFAULT_RESOLUTION.store(0, Ordering::Release);
}

/// Restores the process-wide default resolution to 16 ms.
pub fn restore_default_resolution() {
    DEFAULT_RESOLUTION.store(DEFAULT_RESOLUTION_NANOS, Ordering::Release);
}

pub(crate) fn default_resolution_nanos() -> u64 {
    DEFAULT_RESOLUTION.load(Ordering::Acquire)
}
