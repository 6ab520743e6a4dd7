//! [`WorkerPool`] – bounded task queue for command execution.
//!
//! Bus deliveries must never wait on hardware.  Command handlers submit a
//! job here and return immediately; a fixed set of worker tasks drains the
//! queue.  The pool size is independent of the [`CommandThrottle`] permit
//! count: workers waiting on a permit only occupy a queue slot, never an
//! extra task.
//!
//! [`CommandThrottle`]: crate::throttle::CommandThrottle

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use vlxbridge_types::BridgeError;

/// A unit of work executed by the pool.
pub type Job = BoxFuture<'static, ()>;

/// Fixed-size pool of worker tasks fed by a bounded queue.
pub struct WorkerPool {
    sender: mpsc::Sender<Job>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `workers` tasks sharing a queue of `queue_capacity` jobs.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(workers: usize, queue_capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel::<Job>(queue_capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..workers.max(1))
            .map(|index| {
                let receiver = receiver.clone();
                tokio::spawn(async move {
                    loop {
                        // Only the lock holder waits on the queue; the lock is
                        // released before the job runs.
                        let job = receiver.lock().await.recv().await;
                        let Some(job) = job else { break };
                        // A panicking job must not take the worker with it.
                        if let Err(panic) = AssertUnwindSafe(job).catch_unwind().await {
                            error!(worker = index, panic = panic_message(&*panic), "job panicked");
                        }
                    }
                    debug!(worker = index, "worker stopped");
                })
            })
            .collect();

        Self { sender, workers }
    }

    /// Queue `job` without waiting.
    ///
    /// # Errors
    ///
    /// [`BridgeError::QueueFull`] when every slot is taken,
    /// [`BridgeError::PoolClosed`] after shutdown.
    pub fn submit(&self, job: Job) -> Result<(), BridgeError> {
        try_submit(&self.sender, job)
    }

    /// A cheap handle for submitting jobs from other tasks.
    pub fn submitter(&self) -> JobSubmitter {
        JobSubmitter {
            sender: self.sender.clone(),
        }
    }

    /// Stop accepting jobs and wait until every queued job has run.
    ///
    /// Outstanding [`JobSubmitter`]s keep the queue open; drop them first.
    pub async fn shutdown(self) {
        drop(self.sender);
        for worker in self.workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "worker task ended abnormally");
            }
        }
    }
}

/// Clonable submission handle for a [`WorkerPool`].
#[derive(Clone, Debug)]
pub struct JobSubmitter {
    sender: mpsc::Sender<Job>,
}

impl JobSubmitter {
    /// Same contract as [`WorkerPool::submit`].
    pub fn submit(&self, job: Job) -> Result<(), BridgeError> {
        try_submit(&self.sender, job)
    }
}

fn try_submit(sender: &mpsc::Sender<Job>, job: Job) -> Result<(), BridgeError> {
    sender.try_send(job).map_err(|e| match e {
        mpsc::error::TrySendError::Full(_) => {
            warn!("command queue full, rejecting job");
            BridgeError::QueueFull
        }
        mpsc::error::TrySendError::Closed(_) => BridgeError::PoolClosed,
    })
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn runs_submitted_jobs() {
        let pool = WorkerPool::new(2, 8);
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let done = done.clone();
            pool.submit(
                async move {
                    done.fetch_add(1, Ordering::SeqCst);
                }
                .boxed(),
            )
            .unwrap();
        }
        pool.shutdown().await;
        assert_eq!(done.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn rejects_when_queue_is_full() {
        let pool = WorkerPool::new(1, 1);
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        // Occupy the single worker.
        pool.submit(
            async move {
                let _ = release_rx.await;
            }
            .boxed(),
        )
        .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Fill the single queue slot.
        pool.submit(async {}.boxed()).unwrap();
        assert_eq!(pool.submit(async {}.boxed()), Err(BridgeError::QueueFull));

        release_tx.send(()).unwrap();
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn submitter_feeds_the_same_queue() {
        let pool = WorkerPool::new(1, 4);
        let submitter = pool.submitter();
        let (tx, rx) = tokio::sync::oneshot::channel();
        submitter
            .submit(
                async move {
                    let _ = tx.send(());
                }
                .boxed(),
            )
            .unwrap();
        rx.await.unwrap();
        drop(submitter);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn worker_survives_a_panicking_job() {
        let pool = WorkerPool::new(1, 4);
        let fail = true;
        pool.submit(
            async move {
                if fail {
                    panic!("gateway driver bug");
                }
            }
            .boxed(),
        )
        .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let (tx, rx) = tokio::sync::oneshot::channel();
        pool.submit(
            async move {
                let _ = tx.send(());
            }
            .boxed(),
        )
        .unwrap();
        tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .expect("follow-up job ran")
            .unwrap();
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn submitter_reports_full_queue_like_the_pool() {
        let pool = WorkerPool::new(1, 1);
        let submitter = pool.submitter();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        submitter
            .submit(
                async move {
                    let _ = release_rx.await;
                }
                .boxed(),
            )
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        submitter.submit(async {}.boxed()).unwrap();
        assert_eq!(submitter.submit(async {}.boxed()), Err(BridgeError::QueueFull));

        release_tx.send(()).unwrap();
        drop(submitter);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn slow_job_does_not_block_submission() {
        let pool = WorkerPool::new(1, 16);
        pool.submit(tokio::time::sleep(Duration::from_secs(5)).boxed())
            .unwrap();
        let started = std::time::Instant::now();
        for _ in 0..10 {
            pool.submit(async {}.boxed()).unwrap();
        }
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
