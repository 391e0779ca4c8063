use std::sync::Arc;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use crate::adder::StripedAdder;
use crate::builder::DynamicTokenBucketBuilder;
use crate::builder::TokenBucketBuilder;
use crate::clock::ClockSource;
use crate::rate::RateModel;

/// An asynchronous, lock-free token bucket.
///
/// The bucket keeps an authoritative balance that is only reconciled once
/// per resolution interval (16 ms by default). Between reconciliations,
/// consumption accumulates in a striped adder and the balance is eventually
/// consistent: reads are cheap but may lag behind in-flight consumption.
/// Precise answers are available on demand through the `_synced` variants
/// and [`throttling_duration`](TokenBucket::throttling_duration), which
/// force a reconciliation.
///
/// Reconciliation is performed by whichever caller first crosses a tick
/// boundary and wins a compare-and-swap on the tick index; every other
/// caller stays on the wait-free fast path. The winner folds elapsed time
/// into produced tokens (clamped to capacity), drains the pending
/// consumption, and commits the new balance with a single CAS-retry loop.
///
/// The balance is a signed count: consuming more than the bucket holds
/// drives it negative, and refill arithmetic wraps rather than saturates,
/// so sustained deliberate over-consumption cannot poison the state.
#[derive(Debug)]
pub struct TokenBucket {
    tokens: AtomicI64,
    last_nanos: AtomicU64,
    last_increment: AtomicU64,
    remainder_nanos: AtomicU64,
    pending_consumed: StripedAdder,
    resolution_nanos: u64,
    rate: RateModel,
    clock: Arc<dyn ClockSource>,
}

impl TokenBucket {
    /// Starts configuring a bucket with a constant rate.
    pub fn builder() -> TokenBucketBuilder {
        TokenBucketBuilder::new()
    }

    /// Starts configuring a bucket whose configuration is supplied on demand.
    pub fn dynamic() -> DynamicTokenBucketBuilder {
        DynamicTokenBucketBuilder::new()
    }

    pub(crate) fn new(
        rate: RateModel,
        initial_tokens: u64,
        resolution_nanos: u64,
        clock: Arc<dyn ClockSource>,
    ) -> Self {
        // last_nanos stays zero until the first reconciliation: that commit
        // only establishes the baseline, so time spent idle between
        // construction and first use is never credited as production.
        Self {
            tokens: AtomicI64::new(initial_tokens as i64),
            last_nanos: AtomicU64::new(0),
            last_increment: AtomicU64::new(0),
            remainder_nanos: AtomicU64::new(0),
            pending_consumed: StripedAdder::new(),
            resolution_nanos,
            rate,
            clock,
        }
    }

    /// Consumes `amount` tokens.
    ///
    /// Wait-free unless this call crosses a tick boundary, in which case it
    /// may perform the reconciliation for that tick.
    pub fn consume(&self, amount: u64) {
        self.reconcile(amount, false);
    }

    /// Consumes `amount` tokens and reports whether the bucket likely still
    /// holds tokens.
    ///
    /// When this call performs a reconciliation the answer is exact. When it
    /// stays on the fast path, the answer is computed against the committed
    /// balance and knowingly ignores consumption still pending in other
    /// cells; use [`contains_tokens_synced`](TokenBucket::contains_tokens_synced)
    /// or [`throttling_duration`](TokenBucket::throttling_duration) for a
    /// definitive answer.
    pub fn consume_and_check(&self, amount: u64) -> bool {
        match self.reconcile(amount, false) {
            Some(after) => after > 0,
            None => {
                self.tokens
                    .load(Ordering::Acquire)
                    .wrapping_sub(amount as i64)
                    > 0
            }
        }
    }

    /// Whether the bucket holds tokens, against the eventually-consistent
    /// balance.
    pub fn contains_tokens(&self) -> bool {
        self.balance(false) > 0
    }

    /// Whether the bucket holds tokens, after a forced reconciliation.
    pub fn contains_tokens_synced(&self) -> bool {
        self.balance(true) > 0
    }

    /// The eventually-consistent balance. Reconciles first when this call
    /// crosses a tick boundary.
    pub fn tokens(&self) -> i64 {
        self.balance(false)
    }

    /// The balance after a forced reconciliation, which observes every
    /// `consume` call that completed before it.
    pub fn tokens_synced(&self) -> i64 {
        self.balance(true)
    }

    /// How long a throttled caller must wait before the bucket has refilled
    /// to its post-throttling target.
    ///
    /// Always reconciles. Returns [`Duration::ZERO`] when the target is
    /// already met. The target is deliberately far below capacity; waiting
    /// for a full bucket would release throttled callers in bursts.
    pub fn throttling_duration(&self) -> Duration {
        let balance = self.balance(true);
        let target = self.rate.target_tokens_after_throttling() as i64;
        let deficit = target.saturating_sub(balance);
        if deficit <= 0 {
            return Duration::ZERO;
        }
        let nanos =
            deficit as u128 * self.rate.rate_period_nanos() as u128 / self.rate.rate() as u128;
        Duration::from_nanos(nanos as u64)
    }

    /// Maximum number of stored tokens.
    pub fn capacity(&self) -> u64 {
        self.rate.capacity()
    }

    /// Tokens produced per [`rate_period`](TokenBucket::rate_period).
    pub fn rate(&self) -> u64 {
        self.rate.rate()
    }

    pub fn rate_period(&self) -> Duration {
        Duration::from_nanos(self.rate.rate_period_nanos())
    }

    /// Token level the bucket refills to before throttled callers resume.
    pub fn target_tokens_after_throttling(&self) -> u64 {
        self.rate.target_tokens_after_throttling()
    }

    /// The reconciliation interval. Zero means every operation reconciles.
    pub fn resolution(&self) -> Duration {
        Duration::from_nanos(self.resolution_nanos)
    }

    fn balance(&self, force: bool) -> i64 {
        self.reconcile(0, force)
            .unwrap_or_else(|| self.tokens.load(Ordering::Acquire))
    }

    /// Folds `consumed` into the bucket, reconciling if this caller is
    /// elected for the current tick.
    ///
    /// Returns the post-commit balance, or `None` when the caller lost the
    /// election and its consumption went into the pending adder instead.
    fn reconcile(&self, consumed: u64, force: bool) -> Option<i64> {
        let now = self.clock.nanos(force);
        if self.elected(now, force) {
            Some(self.commit(now, consumed))
        } else {
            if consumed > 0 {
                self.pending_consumed.add(consumed as i64);
            }
            None
        }
    }

    fn elected(&self, now: u64, force: bool) -> bool {
        if force || self.resolution_nanos == 0 {
            return true;
        }
        let tick = now / self.resolution_nanos;
        let last = self.last_increment.load(Ordering::Acquire);
        tick > last
            && self
                .last_increment
                .compare_exchange(last, tick, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }

    fn commit(&self, now: u64, consumed: u64) -> i64 {
        let previous = self.last_nanos.swap(now, Ordering::AcqRel);
        let produced = if previous == 0 {
            0
        } else {
            self.produced_since(previous, now)
        };

        // Drained exactly once, outside the retry loop below.
        let drained = self.pending_consumed.sum_and_reset();
        let spent = (consumed as i64).wrapping_add(drained);
        let capacity = self.rate.capacity() as i64;

        loop {
            let current = self.tokens.load(Ordering::Acquire);
            let next = current
                .wrapping_add(produced)
                .min(capacity)
                .wrapping_sub(spent);
            if self
                .tokens
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return next;
            }
        }
    }

    /// Tokens produced over `[previous, now]` plus any carried remainder.
    ///
    /// Nanoseconds that did not amount to a whole token are pushed back
    /// into the remainder, so production is exact over long runs of short
    /// intervals.
    fn produced_since(&self, previous: u64, now: u64) -> i64 {
        let carried = self.remainder_nanos.swap(0, Ordering::AcqRel);
        let duration = now.saturating_sub(previous).saturating_add(carried);
        let rate = self.rate.rate();
        let period = self.rate.rate_period_nanos();

        let produced = (duration as u128 * rate as u128 / period as u128) as u64;
        let covered = (produced as u128 * period as u128 / rate as u128) as u64;
        let residue = duration.saturating_sub(covered);
        if residue > 0 {
            self.remainder_nanos.fetch_add(residue, Ordering::AcqRel);
        }
        produced as i64
    }
}
