use futures::{stream, FutureExt, StreamExt};
use std::collections::HashSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tracing::{debug, info, warn};

use crate::error::{PersistenceError, PersistenceResult};

#[derive(Debug, Clone, PartialEq)]
pub struct BatchFailure {
    pub id: String,
    pub error: PersistenceError,
}

/// Per-item outcome of a batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchSummary {
    pub succeeded: Vec<String>,
    pub failed: Vec<BatchFailure>,
}

impl BatchSummary {
    pub fn succeeded_count(&self) -> usize {
        self.succeeded.len()
    }

    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }

    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    pub fn is_complete_success(&self) -> bool {
        self.failed.is_empty()
    }
}

impl std::fmt::Display for BatchSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} succeeded, {} failed",
            self.succeeded_count(),
            self.failed_count()
        )
    }
}

/// Runs independent operations concurrently, at most `max_parallelism` at a
/// time, and waits for every one of them.
#[derive(Debug, Clone, Copy)]
pub struct BatchExecutor {
    max_parallelism: usize,
}

impl BatchExecutor {
    pub fn new(max_parallelism: usize) -> PersistenceResult<Self> {
        if max_parallelism == 0 {
            return Err(PersistenceError::validation(
                "Batch parallelism must be at least 1",
            ));
        }
        Ok(Self { max_parallelism })
    }

    pub fn max_parallelism(&self) -> usize {
        self.max_parallelism
    }

    /// Applies `operation` to every item. Repeated ids run once. Results are
    /// reported in input order; a panicking operation becomes an `Internal`
    /// failure for its item.
    pub async fn run<T, F, Fut>(&self, items: Vec<(String, T)>, operation: F) -> BatchSummary
    where
        F: Fn(String, T) -> Fut,
        Fut: Future<Output = PersistenceResult<()>>,
    {
        let mut seen = HashSet::new();
        let items: Vec<(usize, String, T)> = items
            .into_iter()
            .filter(|(id, _)| {
                let fresh = seen.insert(id.clone());
                if !fresh {
                    debug!("Skipping repeated batch id {}", id);
                }
                fresh
            })
            .enumerate()
            .map(|(index, (id, item))| (index, id, item))
            .collect();
        let total = items.len();

        let mut outcomes: Vec<(usize, String, PersistenceResult<()>)> = stream::iter(items)
            .map(|(index, id, item)| {
                let pending = operation(id.clone(), item);
                async move {
                    let outcome = match AssertUnwindSafe(pending).catch_unwind().await {
                        Ok(result) => result,
                        Err(_) => Err(PersistenceError::internal(format!(
                            "Batch operation for {} panicked",
                            id
                        ))),
                    };
                    (index, id, outcome)
                }
            })
            .buffer_unordered(self.max_parallelism)
            .collect()
            .await;
        outcomes.sort_by_key(|(index, _, _)| *index);

        let mut summary = BatchSummary::default();
        for (_, id, outcome) in outcomes {
            match outcome {
                Ok(()) => summary.succeeded.push(id),
                Err(error) => {
                    if error.is_not_found() {
                        debug!("Batch item {} failed: {}", id, error);
                    } else {
                        warn!("Batch item {} failed: {}", id, error);
                    }
                    summary.failed.push(BatchFailure { id, error });
                }
            }
        }

        info!("Batch of {} items finished: {}", total, summary);
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn ids(names: &[&str]) -> Vec<(String, ())> {
        names.iter().map(|n| (n.to_string(), ())).collect()
    }

    #[test]
    fn zero_parallelism_is_rejected() {
        assert!(matches!(
            BatchExecutor::new(0),
            Err(PersistenceError::Validation { .. })
        ));
    }

    #[tokio::test]
    async fn failures_do_not_short_circuit() {
        let executor = BatchExecutor::new(2).unwrap();
        let attempted = Arc::new(AtomicUsize::new(0));

        let summary = executor
            .run(ids(&["a", "b", "c", "d"]), |id, _| {
                let attempted = attempted.clone();
                async move {
                    attempted.fetch_add(1, Ordering::SeqCst);
                    if id == "b" {
                        Err(PersistenceError::not_found("dataset", id))
                    } else {
                        Ok(())
                    }
                }
            })
            .await;

        assert_eq!(attempted.load(Ordering::SeqCst), 4);
        assert_eq!(summary.succeeded, vec!["a", "c", "d"]);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].id, "b");
        assert_eq!(summary.to_string(), "3 succeeded, 1 failed");
    }

    #[tokio::test]
    async fn parallelism_is_bounded() {
        let executor = BatchExecutor::new(3).unwrap();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let names: Vec<String> = (0..12).map(|i| format!("item-{}", i)).collect();
        let items = names.into_iter().map(|n| (n, ())).collect();

        let summary = executor
            .run(items, |_, _| {
                let in_flight = in_flight.clone();
                let peak = peak.clone();
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;

        assert!(summary.is_complete_success());
        assert_eq!(summary.succeeded_count(), 12);
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn panics_become_item_failures() {
        let executor = BatchExecutor::new(4).unwrap();
        let summary = executor
            .run(ids(&["ok", "boom"]), |id, _| async move {
                if id == "boom" {
                    panic!("operation exploded");
                }
                Ok(())
            })
            .await;

        assert_eq!(summary.succeeded, vec!["ok"]);
        assert!(matches!(
            summary.failed[0].error,
            PersistenceError::Internal { .. }
        ));
    }

    #[tokio::test]
    async fn repeated_ids_run_once() {
        let executor = BatchExecutor::new(4).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let summary = executor
            .run(ids(&["x", "x", "y"]), |_, _| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(summary.total(), 2);
    }
}
