use std::sync::atomic::AtomicI64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::thread::available_parallelism;

use crossbeam_utils::CachePadded;

/// Global counter handing out cell slots, one per thread, round-robin.
static NEXT_SLOT: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    /// Slot assigned to the current thread, stable for its lifetime.
    static THREAD_SLOT: usize = NEXT_SLOT.fetch_add(1, Ordering::Relaxed);
}

/// A counter striped over cache-line-padded cells.
///
/// Writers add into a per-thread cell so that no single memory location is
/// contended; a reader drains the whole counter with
/// [`sum_and_reset`](StripedAdder::sum_and_reset). Two concurrent drains
/// collectively observe every `add` exactly once.
#[derive(Debug)]
pub(crate) struct StripedAdder {
    cells: Box<[CachePadded<AtomicI64>]>,
    mask: usize,
}

impl StripedAdder {
    /// Creates an adder with one cell per hardware thread, rounded up to a
    /// power of two.
    pub(crate) fn new() -> Self {
        let parallelism = available_parallelism().map(|n| n.get()).unwrap_or(1);
        Self::with_cells(parallelism.next_power_of_two())
    }

    pub(crate) fn with_cells(cells: usize) -> Self {
        debug_assert!(cells.is_power_of_two());
        let cells: Box<[CachePadded<AtomicI64>]> = (0..cells)
            .map(|_| CachePadded::new(AtomicI64::new(0)))
            .collect();
        let mask = cells.len() - 1;
        Self { cells, mask }
    }

    /// Adds `value` to the current thread's cell.
    ///
    /// Relaxed ordering suffices: the value becomes visible under the
    /// release barrier of the next reconciliation that drains it.
    #[inline]
    pub(crate) fn add(&self, value: i64) {
        let slot = THREAD_SLOT.with(|slot| *slot) & self.mask;
        self.cells[slot].fetch_add(value, Ordering::Relaxed);
    }

    /// Zeroes every cell and returns the total that was stored.
    pub(crate) fn sum_and_reset(&self) -> i64 {
        self.cells
            .iter()
            .fold(0i64, |sum, cell| sum.wrapping_add(cell.swap(0, Ordering::AcqRel)))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn drains_to_zero() {
        let adder = StripedAdder::with_cells(4);
        adder.add(5);
        adder.add(-2);
        assert_eq!(adder.sum_and_reset(), 3);
        assert_eq!(adder.sum_and_reset(), 0);
    }

    #[test]
    fn no_adds_lost_under_concurrency() {
        let adder = Arc::new(StripedAdder::new());
        let writers = 8;
        let per_writer = 100_000i64;

        let mut handles = vec![];
        for _ in 0..writers {
            let adder = Arc::clone(&adder);
            handles.push(thread::spawn(move || {
                for _ in 0..per_writer {
                    adder.add(1);
                }
            }));
        }

        // Drain concurrently with the writers; whatever the drains collect
        // plus the final drain must equal the grand total.
        let mut collected = 0i64;
        for handle in handles {
            collected += adder.sum_and_reset();
            handle.join().unwrap();
        }
        collected += adder.sum_and_reset();

        assert_eq!(collected, writers as i64 * per_writer);
        assert_eq!(adder.sum_and_reset(), 0);
    }

    #[test]
    fn threads_spread_over_cells() {
        let adder = Arc::new(StripedAdder::with_cells(8));
        let mut handles = vec![];
        for _ in 0..8 {
            let adder = Arc::clone(&adder);
            handles.push(thread::spawn(move || adder.add(1)));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(adder.sum_and_reset(), 8);
    }
}
