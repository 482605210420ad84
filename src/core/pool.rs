/*!
 * Bounded part worker pool
 *
 * A fixed number of tokio tasks pull parts from a shared FIFO queue. Each
 * task runs one part to completion before taking the next. The first part
 * failure stops dispatch: parts already in flight finish, queued parts stay
 * queued, and the failure is reported to the caller with everything that
 * did complete.
 *
 * The pool knows nothing about transports or checkpoints. The worker
 * closure does the transfer and records its own success.
 */

use futures::FutureExt;
use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::lock;
use super::planner::Part;
use crate::error::{Result, TransferError};

/// A part whose worker returned an error
#[derive(Debug)]
pub struct PartFailure {
    pub part_number: u32,
    pub error: TransferError,
}

/// What happened during one pool run
#[derive(Debug)]
pub struct PoolReport<T> {
    /// Worker outputs, in completion order
    pub completed: Vec<T>,
    /// Failures in the order they were observed
    pub failures: Vec<PartFailure>,
    /// Parts never handed to a worker
    pub undispatched: Vec<u32>,
}

impl<T> PoolReport<T> {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty() && self.undispatched.is_empty()
    }

    /// The first failure, if any part failed
    pub fn first_failure(self) -> Option<TransferError> {
        self.failures.into_iter().next().map(|f| f.error)
    }
}

/// Fixed-size pool of part workers
#[derive(Debug, Clone, Copy)]
pub struct PartWorkerPool {
    concurrency: usize,
}

struct PoolShared {
    queue: Mutex<VecDeque<Part>>,
    failures: Mutex<Vec<PartFailure>>,
    abort: AtomicBool,
}

impl PoolShared {
    fn next_part(&self, cancel: &CancellationToken) -> Option<Part> {
        let mut queue = lock(&self.queue);
        if self.abort.load(Ordering::Acquire) || cancel.is_cancelled() {
            return None;
        }
        queue.pop_front()
    }

    fn fail(&self, part_number: u32, error: TransferError) {
        {
            let _queue = lock(&self.queue);
            self.abort.store(true, Ordering::Release);
        }
        warn!(part_number, error = %error, "Part failed, stopping dispatch");
        lock(&self.failures).push(PartFailure { part_number, error });
    }
}

impl PartWorkerPool {
    /// A concurrency of 0 is treated as 1
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Run `worker` over `parts`
    ///
    /// Parts are dispatched in the given order. Cancelling `cancel` stops
    /// dispatch the same way a failure does, without recording a failure.
    pub async fn run<T, F, Fut>(
        &self,
        parts: Vec<Part>,
        cancel: &CancellationToken,
        worker: F,
    ) -> PoolReport<T>
    where
        T: Send + 'static,
        F: Fn(Part) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let workers = self.concurrency.min(parts.len());
        let shared = Arc::new(PoolShared {
            queue: Mutex::new(parts.into()),
            failures: Mutex::new(Vec::new()),
            abort: AtomicBool::new(false),
        });
        let worker = Arc::new(worker);

        let mut join_set = JoinSet::new();
        for worker_id in 0..workers {
            let shared = Arc::clone(&shared);
            let worker = Arc::clone(&worker);
            let cancel = cancel.clone();

            join_set.spawn(async move {
                let mut completed = Vec::new();
                while let Some(part) = shared.next_part(&cancel) {
                    debug!(worker_id, part_number = part.part_number, "Dispatching part");
                    match AssertUnwindSafe((*worker)(part)).catch_unwind().await {
                        Ok(Ok(value)) => completed.push(value),
                        Ok(Err(error)) => {
                            shared.fail(part.part_number, error);
                            break;
                        }
                        Err(_) => {
                            let error = TransferError::Io(io::Error::other(format!(
                                "worker panicked on part {}",
                                part.part_number
                            )));
                            shared.fail(part.part_number, error);
                            break;
                        }
                    }
                }
                completed
            });
        }

        let mut completed = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(mut values) => completed.append(&mut values),
                Err(e) => warn!(error = %e, "Part worker task ended abnormally"),
            }
        }

        let undispatched = lock(&shared.queue)
            .drain(..)
            .map(|p| p.part_number)
            .collect();
        let failures = std::mem::take(&mut *lock(&shared.failures));

        PoolReport {
            completed,
            failures,
            undispatched,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::planner::plan;
    use crate::transport::TransportError;
    use std::collections::BTreeSet;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn part_failure(part_number: u32) -> TransferError {
        TransferError::PartTransfer {
            fingerprint: "fp".into(),
            part_number,
            source: TransportError::Network("injected".into()),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_runs_every_part() {
        let parts = plan(5130, 500).unwrap();
        let pool = PartWorkerPool::new(3);

        let report = pool
            .run(parts, &CancellationToken::new(), |part| async move {
                Ok::<_, TransferError>(part.part_number)
            })
            .await;

        assert!(report.is_complete());
        let done: BTreeSet<u32> = report.completed.into_iter().collect();
        assert_eq!(done, (1..=11).collect());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_stops_dispatch_and_lets_in_flight_finish() {
        let parts = plan(5130, 500).unwrap();
        let pool = PartWorkerPool::new(3);

        let report = pool
            .run(parts, &CancellationToken::new(), |part| async move {
                if part.part_number == 2 {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    return Err(part_failure(2));
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(part.part_number)
            })
            .await;

        let done: BTreeSet<u32> = report.completed.iter().copied().collect();
        assert_eq!(done, BTreeSet::from([1, 3]));
        assert_eq!(report.undispatched, (4..=11).collect::<Vec<_>>());
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].part_number, 2);
        assert_eq!(report.first_failure().unwrap().part_number(), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_observed_failure_is_reported_first() {
        let parts = plan(3000, 500).unwrap();
        let pool = PartWorkerPool::new(3);

        let report = pool
            .run(parts, &CancellationToken::new(), |part| async move {
                let delay = match part.part_number {
                    1 => 50,
                    2 => 10,
                    _ => 30,
                };
                tokio::time::sleep(Duration::from_millis(delay)).await;
                if part.part_number <= 2 {
                    Err(part_failure(part.part_number))
                } else {
                    Ok(part.part_number)
                }
            })
            .await;

        let order: Vec<u32> = report.failures.iter().map(|f| f.part_number).collect();
        assert_eq!(order, vec![2, 1]);
        assert_eq!(report.completed, vec![3]);
        assert_eq!(report.undispatched, vec![4, 5, 6]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_is_bounded() {
        let parts = plan(10_000, 100).unwrap();
        let pool = PartWorkerPool::new(4);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let (a, p) = (Arc::clone(&active), Arc::clone(&peak));
        let report = pool
            .run(parts, &CancellationToken::new(), move |part| {
                let (active, peak) = (Arc::clone(&a), Arc::clone(&p));
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(part.part_number)
                }
            })
            .await;

        assert!(report.is_complete());
        assert_eq!(report.completed.len(), 100);
        assert_eq!(peak.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = PartWorkerPool::new(2)
            .run(plan(1000, 500).unwrap(), &cancel, |part| async move {
                Ok::<_, TransferError>(part.part_number)
            })
            .await;

        assert!(report.completed.is_empty());
        assert!(report.failures.is_empty());
        assert_eq!(report.undispatched, vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_mid_run_keeps_in_flight_results() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();

        let report = PartWorkerPool::new(2)
            .run(plan(2000, 200).unwrap(), &cancel, move |part| {
                let trigger = trigger.clone();
                async move {
                    if part.part_number == 1 {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        trigger.cancel();
                    } else {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                    }
                    Ok::<_, TransferError>(part.part_number)
                }
            })
            .await;

        let done: BTreeSet<u32> = report.completed.into_iter().collect();
        assert_eq!(done, BTreeSet::from([1, 2]));
        assert!(report.failures.is_empty());
        assert_eq!(report.undispatched, (3..=10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_panicking_worker_becomes_failure() {
        let report = PartWorkerPool::new(1)
            .run(plan(1000, 500).unwrap(), &CancellationToken::new(), |part| async move {
                if part.part_number == 1 {
                    panic!("boom");
                }
                Ok::<_, TransferError>(part.part_number)
            })
            .await;

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].part_number, 1);
        assert_eq!(report.undispatched, vec![2]);
    }

    #[tokio::test]
    async fn test_empty_part_list() {
        let report = PartWorkerPool::new(8)
            .run(Vec::new(), &CancellationToken::new(), |part| async move {
                Ok::<_, TransferError>(part.part_number)
            })
            .await;
        assert!(report.is_complete());
        assert!(report.completed.is_empty());
    }
}
