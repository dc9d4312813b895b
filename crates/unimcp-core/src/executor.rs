//! Bounded parallel fan-out.
//!
//! [`ParallelExecutor`] runs a per-item async handler over a finite input
//! set with at most `max_concurrent` in flight, emitting start/complete
//! events as it goes. One item failing never cancels its siblings; the
//! batch result maps every input to its own `Result`.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Semaphore, mpsc};

/// Progress events emitted while a batch runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutorEvent {
    /// An item's handler has been scheduled.
    ItemStart { index: usize },
    /// An item's handler finished (ok or err).
    ItemComplete { index: usize, ok: bool },
    /// The whole batch settled.
    BatchComplete { total: usize, failed: usize },
}

/// Result of one batch: inputs paired with their outcomes, input order preserved.
pub struct BatchOutcome<I, O, E> {
    pub results: Vec<(I, Result<O, E>)>,
}

impl<I, O, E> BatchOutcome<I, O, E> {
    /// Count of failed items.
    pub fn failed(&self) -> usize {
        self.results.iter().filter(|(_, r)| r.is_err()).count()
    }

    /// Iterate over successful `(input, output)` pairs.
    pub fn successes(&self) -> impl Iterator<Item = (&I, &O)> {
        self.results
            .iter()
            .filter_map(|(i, r)| r.as_ref().ok().map(|o| (i, o)))
    }
}

/// Bounded-concurrency executor over a finite input sequence.
#[derive(Debug, Clone)]
pub struct ParallelExecutor {
    max_concurrent: usize,
}

impl ParallelExecutor {
    /// Create an executor allowing up to `max_concurrent` handlers in flight.
    /// Zero is clamped to one.
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// Run `handler` over `inputs`, returning every outcome in input order.
    ///
    /// `events` receives [`ExecutorEvent`]s when provided; a closed or full
    /// receiver never stalls the batch.
    pub async fn run<I, O, E, F, Fut>(
        &self,
        inputs: Vec<I>,
        handler: F,
        events: Option<mpsc::UnboundedSender<ExecutorEvent>>,
    ) -> BatchOutcome<I, O, E>
    where
        I: Clone + Send + 'static,
        O: Send + 'static,
        E: Send + 'static,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, E>> + Send,
    {
        let total = inputs.len();
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let handler = Arc::new(handler);

        let mut handles = Vec::with_capacity(total);
        for (index, input) in inputs.into_iter().enumerate() {
            let semaphore = Arc::clone(&semaphore);
            let handler = Arc::clone(&handler);
            let events = events.clone();
            handles.push(tokio::spawn(async move {
                // Acquire never fails: the semaphore is never closed.
                let _permit = semaphore.acquire_owned().await.ok();
                if let Some(tx) = &events {
                    let _ = tx.send(ExecutorEvent::ItemStart { index });
                }
                let result = handler(input.clone()).await;
                if let Some(tx) = &events {
                    let _ = tx.send(ExecutorEvent::ItemComplete {
                        index,
                        ok: result.is_ok(),
                    });
                }
                (index, input, result)
            }));
        }

        let mut settled: Vec<Option<(I, Result<O, E>)>> = (0..total).map(|_| None).collect();
        for handle in handles {
            // A panicked handler drops its slot; the join error is not
            // representable as E, so the item is simply absent. Panics in
            // handlers are bugs, not data errors.
            if let Ok((index, input, result)) = handle.await {
                settled[index] = Some((input, result));
            }
        }

        let results: Vec<(I, Result<O, E>)> = settled.into_iter().flatten().collect();
        if let Some(tx) = &events {
            let failed = results.iter().filter(|(_, r)| r.is_err()).count();
            let _ = tx.send(ExecutorEvent::BatchComplete { total, failed });
        }
        BatchOutcome { results }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn runs_everything_and_preserves_order() {
        let exec = ParallelExecutor::new(3);
        let outcome: BatchOutcome<u32, u32, String> = exec
            .run(vec![1, 2, 3, 4, 5], |n| async move { Ok(n * 10) }, None)
            .await;
        let outputs: Vec<u32> = outcome
            .results
            .iter()
            .map(|(_, r)| *r.as_ref().unwrap())
            .collect();
        assert_eq!(outputs, vec![10, 20, 30, 40, 50]);
    }

    #[tokio::test]
    async fn failures_do_not_cancel_siblings() {
        let exec = ParallelExecutor::new(2);
        let outcome: BatchOutcome<u32, u32, String> = exec
            .run(
                vec![1, 2, 3],
                |n| async move {
                    if n == 2 {
                        Err("boom".to_string())
                    } else {
                        Ok(n)
                    }
                },
                None,
            )
            .await;
        assert_eq!(outcome.failed(), 1);
        assert_eq!(outcome.successes().count(), 2);
    }

    #[tokio::test]
    async fn respects_concurrency_bound() {
        static IN_FLIGHT: AtomicUsize = AtomicUsize::new(0);
        static PEAK: AtomicUsize = AtomicUsize::new(0);

        let exec = ParallelExecutor::new(2);
        let _: BatchOutcome<u32, (), String> = exec
            .run(
                (0..8).collect(),
                |_| async {
                    let now = IN_FLIGHT.fetch_add(1, Ordering::SeqCst) + 1;
                    PEAK.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                    IN_FLIGHT.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                },
                None,
            )
            .await;
        assert!(PEAK.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn emits_batch_complete() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let exec = ParallelExecutor::new(4);
        let _: BatchOutcome<u32, u32, String> = exec
            .run(vec![1, 2], |n| async move { Ok(n) }, Some(tx))
            .await;
        let mut saw_batch = false;
        while let Ok(event) = rx.try_recv() {
            if let ExecutorEvent::BatchComplete { total, failed } = event {
                assert_eq!(total, 2);
                assert_eq!(failed, 0);
                saw_batch = true;
            }
        }
        assert!(saw_batch);
    }
}
