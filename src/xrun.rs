//! Lock-free buffer fault accounting.

use std::sync::atomic::{AtomicU32, Ordering};

/// Counts over- and underruns seen by the data path.
///
/// The transport context increments; the control context reads and resets.
/// Both are single atomic operations, so a reset racing an increment leaves
/// either `0` or `1`, never a torn value.
#[derive(Debug, Default)]
pub struct XrunCounter {
    count: AtomicU32,
}

impl XrunCounter {
    /// Counter starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one discontinuity, returning the updated count.
    pub fn increment(&self) -> u32 {
        self.count.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
    }

    /// Current count.
    pub fn count(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    /// Zero the counter.
    pub fn reset(&self) {
        self.count.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn reset_racing_increments_stays_in_range() {
        const THREADS: u32 = 4;
        const PER_THREAD: u32 = 10_000;
        const TOTAL: u32 = THREADS * PER_THREAD;

        let counter = XrunCounter::new();
        let done = AtomicBool::new(false);

        std::thread::scope(|scope| {
            let workers: Vec<_> = (0..THREADS)
                .map(|_| {
                    scope.spawn(|| {
                        for _ in 0..PER_THREAD {
                            counter.increment();
                        }
                    })
                })
                .collect();

            let observer = scope.spawn(|| {
                let mut max_seen = 0;
                while !done.load(Ordering::Acquire) {
                    let seen = counter.count();
                    assert!(seen <= TOTAL, "observed {seen} > {TOTAL}");
                    max_seen = max_seen.max(seen);
                }
                max_seen
            });

            std::thread::yield_now();
            counter.reset();

            for worker in workers {
                worker.join().unwrap();
            }
            done.store(true, Ordering::Release);
            observer.join().unwrap();
        });

        assert!(counter.count() <= TOTAL);
    }

    #[test]
    fn increment_reports_new_value() {
        let counter = XrunCounter::new();
        assert_eq!(counter.increment(), 1);
        assert_eq!(counter.increment(), 2);
        counter.reset();
        assert_eq!(counter.count(), 0);
    }
}
