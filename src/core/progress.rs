//! Progress aggregation across pool workers

use std::sync::{Arc, Mutex, PoisonError};

/// `callback(bytes_done, bytes_total)`
pub type ProgressCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Cumulative byte counter shared by the workers of one transfer
///
/// The callback runs while the counter lock is held, so reports reach the
/// caller in non-decreasing order even when parts finish concurrently.
pub struct ProgressTracker {
    total: u64,
    done: Mutex<u64>,
    callback: Option<ProgressCallback>,
}

impl ProgressTracker {
    /// `already_done` counts parts completed by earlier attempts
    pub fn new(total: u64, already_done: u64, callback: Option<ProgressCallback>) -> Self {
        Self {
            total,
            done: Mutex::new(already_done.min(total)),
            callback,
        }
    }

    /// Report the starting position
    pub fn start(&self) {
        let done = self.done.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(cb) = &self.callback {
            cb(*done, self.total);
        }
    }

    /// Add a finished part and report the new total
    pub fn advance(&self, bytes: u64) -> u64 {
        let mut done = self.done.lock().unwrap_or_else(PoisonError::into_inner);
        *done = done.saturating_add(bytes).min(self.total);
        if let Some(cb) = &self.callback {
            cb(*done, self.total);
        }
        *done
    }

    pub fn done(&self) -> u64 {
        *self.done.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn total(&self) -> u64 {
        self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (ProgressCallback, Arc<Mutex<Vec<(u64, u64)>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&calls);
        let cb: ProgressCallback = Arc::new(move |done, total| {
            sink.lock().unwrap().push((done, total));
        });
        (cb, calls)
    }

    #[test]
    fn test_reports_start_then_each_part() {
        let (cb, calls) = recorder();
        let tracker = ProgressTracker::new(1000, 300, Some(cb));
        tracker.start();
        tracker.advance(500);
        tracker.advance(200);

        assert_eq!(
            *calls.lock().unwrap(),
            vec![(300, 1000), (800, 1000), (1000, 1000)]
        );
    }

    #[test]
    fn test_capped_at_total() {
        let tracker = ProgressTracker::new(100, 0, None);
        assert_eq!(tracker.advance(150), 100);
        assert_eq!(tracker.done(), 100);
        assert_eq!(tracker.total(), 100);
    }

    #[test]
    fn test_concurrent_advances_are_monotonic() {
        let (cb, calls) = recorder();
        let tracker = Arc::new(ProgressTracker::new(8 * 1000, 0, Some(cb)));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tracker = Arc::clone(&tracker);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        tracker.advance(10);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 800);
        assert!(calls.windows(2).all(|w| w[0].0 < w[1].0));
        assert_eq!(calls.last().unwrap().0, 8000);
    }
}
