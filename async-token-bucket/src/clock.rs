use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use quanta::Clock;
use quanta::Instant;

/// A monotonic nanosecond clock.
///
/// Values returned by [`nanos`](ClockSource::nanos) never decrease across
/// calls on the same instance, regardless of the precision requested.
/// High-precision requests must sample the underlying clock directly;
/// coarse requests may return a cached value.
pub trait ClockSource: Send + Sync + Debug {
    /// Returns the current monotonic time in nanoseconds.
    fn nanos(&self, high_precision: bool) -> u64;
}

/// Errors produced while setting up a clock source.
#[derive(Debug, thiserror::Error)]
pub enum ClockError {
    /// The background ticker thread could not be spawned.
    #[error("failed to spawn clock ticker thread: {0}")]
    Spawn(#[from] io::Error),
}

/// Direct clock source backed by [`quanta::Clock`].
///
/// Every read samples the clock, so both precision levels are equivalent.
/// This is the default clock for token buckets.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    clock: Clock,
    anchor: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::with_clock(Clock::new())
    }

    /// Builds a source over a caller-supplied clock, e.g. `quanta::Clock::mock()`.
    pub fn with_clock(clock: Clock) -> Self {
        let anchor = clock.now();
        Self { clock, anchor }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ClockSource for MonotonicClock {
    #[inline]
    fn nanos(&self, _high_precision: bool) -> u64 {
        self.clock.now().duration_since(self.anchor).as_nanos() as u64
    }
}

/// Cached clock source updated by a background ticker thread.
///
/// The ticker samples the raw clock once per `granularity` and publishes the
/// sample into an atomic snapshot. Coarse reads return the snapshot without
/// touching the platform clock, which matters on hosts where the monotonic
/// time syscall dominates hot-path cost. High-precision reads sample the raw
/// clock directly and also refresh the snapshot.
///
/// The ticker stops on [`close`](GranularClock::close) (also invoked on
/// drop); afterwards the snapshot is frozen at its last published sample and
/// coarse readers keep seeing that frozen value. There is no way to restart
/// a closed clock, construct a new one instead.
#[derive(Debug)]
pub struct GranularClock {
    clock: Clock,
    anchor: Instant,
    snapshot: Arc<AtomicU64>,
    stop: Arc<AtomicBool>,
    granularity: Duration,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl GranularClock {
    /// Starts a granular clock whose snapshot is refreshed every `granularity`.
    pub fn start(granularity: Duration) -> Result<Self, ClockError> {
        Self::with_clock(Clock::new(), granularity)
    }

    /// Starts the ticker over a caller-supplied clock.
    pub fn with_clock(clock: Clock, granularity: Duration) -> Result<Self, ClockError> {
        let anchor = clock.now();
        let snapshot = Arc::new(AtomicU64::new(0));
        let stop = Arc::new(AtomicBool::new(false));

        let handle = {
            let clock = clock.clone();
            let snapshot = Arc::clone(&snapshot);
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("granular-clock".into())
                .spawn(move || {
                    tracing::debug!(granularity_ns = granularity.as_nanos() as u64, "clock ticker started");
                    while !stop.load(Ordering::Acquire) {
                        let sample = clock.now().duration_since(anchor).as_nanos() as u64;
                        snapshot.fetch_max(sample, Ordering::AcqRel);
                        thread::park_timeout(granularity);
                    }
                    tracing::debug!("clock ticker stopped");
                })?
        };

        Ok(Self {
            clock,
            anchor,
            snapshot,
            stop,
            granularity,
            ticker: Mutex::new(Some(handle)),
        })
    }

    /// The refresh cadence of the snapshot.
    pub fn granularity(&self) -> Duration {
        self.granularity
    }

    /// Stops the ticker thread and freezes the snapshot. Idempotent.
    pub fn close(&self) {
        if self.stop.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Ok(mut ticker) = self.ticker.lock()
            && let Some(handle) = ticker.take()
        {
            handle.thread().unpark();
            let _ = handle.join();
        }
    }
}

impl ClockSource for GranularClock {
    #[inline]
    fn nanos(&self, high_precision: bool) -> u64 {
        if high_precision {
            let sample = self.clock.now().duration_since(self.anchor).as_nanos() as u64;
            // Publishing keeps the snapshot monotonic with respect to
            // high-precision reads observed by other threads.
            let previous = self.snapshot.fetch_max(sample, Ordering::AcqRel);
            sample.max(previous)
        } else {
            self.snapshot.load(Ordering::Acquire)
        }
    }
}

impl Drop for GranularClock {
    fn drop(&mut self) {
        self.close();
    }
}

/// Manually advanced clock for deterministic tests and simulations.
///
/// Time only moves when [`advance`](ManualClock::advance) or
/// [`set_nanos`](ManualClock::set_nanos) is called; both are monotonic by
/// construction (an attempt to move backwards is ignored).
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    pub fn starting_at(nanos: u64) -> Self {
        Self {
            nanos: AtomicU64::new(nanos),
        }
    }

    /// Moves the clock forward by `delta`.
    pub fn advance(&self, delta: Duration) {
        self.nanos
            .fetch_add(delta.as_nanos() as u64, Ordering::AcqRel);
    }

    /// Moves the clock to `nanos`, unless it is already past it.
    pub fn set_nanos(&self, nanos: u64) {
        self.nanos.fetch_max(nanos, Ordering::AcqRel);
    }
}

impl ClockSource for ManualClock {
    #[inline]
    fn nanos(&self, _high_precision: bool) -> u64 {
        self.nanos.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use more_asserts::assert_ge;

    use super::*;

    #[test]
    fn direct_clock_is_monotonic() {
        let clock = MonotonicClock::new();
        let mut previous = 0;
        for _ in 0..1_000 {
            let now = clock.nanos(true);
            assert_ge!(now, previous);
            previous = now;
        }
    }

    #[test]
    fn manual_clock_only_moves_forward() {
        let clock = ManualClock::starting_at(100);
        clock.advance(Duration::from_nanos(50));
        assert_eq!(clock.nanos(false), 150);

        // Rewinding is ignored
        clock.set_nanos(10);
        assert_eq!(clock.nanos(true), 150);

        clock.set_nanos(500);
        assert_eq!(clock.nanos(false), 500);
    }

    #[test]
    fn granular_snapshot_advances_without_direct_reads() {
        let clock = GranularClock::start(Duration::from_millis(1)).unwrap();

        thread::sleep(Duration::from_millis(20));
        let first = clock.nanos(false);
        assert_ge!(first, 1);

        thread::sleep(Duration::from_millis(20));
        let second = clock.nanos(false);
        assert_ge!(second, first + 1_000_000);
    }

    #[test]
    fn high_precision_read_refreshes_snapshot() {
        // A slow ticker, so only direct reads can move the snapshot quickly.
        let clock = GranularClock::start(Duration::from_secs(3600)).unwrap();
        thread::sleep(Duration::from_millis(5));

        let coarse_before = clock.nanos(false);
        let precise = clock.nanos(true);
        assert_ge!(precise, coarse_before);

        // The coarse view must have caught up with the direct sample.
        assert_ge!(clock.nanos(false), precise);
    }

    #[test]
    fn close_freezes_coarse_reads() {
        let clock = GranularClock::start(Duration::from_millis(1)).unwrap();
        thread::sleep(Duration::from_millis(10));
        clock.close();

        let frozen = clock.nanos(false);
        thread::sleep(Duration::from_millis(10));
        assert_eq!(clock.nanos(false), frozen);

        // close is idempotent
        clock.close();
        assert_eq!(clock.nanos(false), frozen);
    }

    #[test]
    fn mixed_precision_reads_are_monotonic() {
        let clock = GranularClock::start(Duration::from_millis(1)).unwrap();
        let mut previous = 0;
        for i in 0..10_000u64 {
            let now = clock.nanos(i % 7 == 0);
            assert_ge!(now, previous);
            previous = now;
        }
    }
}
