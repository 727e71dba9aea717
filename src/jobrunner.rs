//! Queued, concurrency-limited job execution for the Lifecycle/Delivery Engines
//! (`SPEC_FULL.md` §4.4, §4.6).
//!
//! Generalizes the teacher's `daemon::Daemon`: there, one semaphore per model gates HTTP
//! dispatch inside a single hardcoded claim-loop. Here, one semaphore per named *queue* gates
//! arbitrary boxed jobs, and the loop itself is the Lifecycle Engine's job — `JobRunner` only
//! owns dispatch, backoff, and periodic scheduling.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Semaphore;

use crate::error::Result;

/// A unit of work submitted to a queue. Errors are logged by the runner; the Lifecycle Engine's
/// own state guards make re-running a job a no-op, so the runner never needs to inspect the
/// error to decide whether to retry — retry is requested explicitly via `enqueue_after`.
pub type Job = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// Queued execution with per-queue concurrency limits, delayed re-enqueue (for delivery
/// backoff), and periodic triggers (for polling actions like `check_status`).
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Run `job` on `queue` as soon as a concurrency permit is available.
    async fn enqueue(&self, queue: &str, job: Job) -> Result<()>;

    /// Run `job` on `queue` after `delay` — used for delivery-retry backoff
    /// (`SPEC_FULL.md` §4.6: "let the JobRunner retry with backoff").
    async fn enqueue_after(&self, queue: &str, delay: Duration, job: Job) -> Result<()>;

    /// Re-create and enqueue a job on `queue` every `interval`, indefinitely — used for
    /// `check_status` polling and the `building`/`expires_at` sweeps.
    fn schedule_periodic(
        &self,
        queue: &'static str,
        interval: Duration,
        job_factory: Arc<dyn Fn() -> Job + Send + Sync>,
    );
}

/// In-process JobRunner. Grounded in `daemon::mod::Daemon`'s per-model `Semaphore` registry
/// (`get_semaphore`/`try_acquire_permit`) and its `JoinSet`-based dispatch loop, generalized
/// from "semaphore per model" to "semaphore per named queue".
pub struct InMemoryJobRunner {
    semaphores: DashMap<String, Arc<Semaphore>>,
    queue_concurrency: HashMap<String, usize>,
    default_concurrency: usize,
}

impl InMemoryJobRunner {
    /// `queue_concurrency` overrides the default for named queues — e.g. `batch_processing: 1`
    /// and `batch_uploads: 1` per `SPEC_FULL.md` §4.4's "1 per node"/"concurrency 1" queues.
    pub fn new(queue_concurrency: HashMap<String, usize>, default_concurrency: usize) -> Self {
        Self {
            semaphores: DashMap::new(),
            queue_concurrency,
            default_concurrency,
        }
    }

    fn semaphore_for(&self, queue: &str) -> Arc<Semaphore> {
        self.semaphores
            .entry(queue.to_string())
            .or_insert_with(|| {
                let limit = self
                    .queue_concurrency
                    .get(queue)
                    .copied()
                    .unwrap_or(self.default_concurrency);
                Arc::new(Semaphore::new(limit))
            })
            .clone()
    }
}

impl Default for InMemoryJobRunner {
    fn default() -> Self {
        Self::new(HashMap::new(), 10)
    }
}

#[async_trait]
impl JobRunner for InMemoryJobRunner {
    async fn enqueue(&self, queue: &str, job: Job) -> Result<()> {
        let semaphore = self.semaphore_for(queue);
        let queue = queue.to_string();

        tokio::spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return;
            };
            if let Err(e) = job.await {
                tracing::error!(error = %e, %queue, "job failed");
            }
        });

        Ok(())
    }

    async fn enqueue_after(&self, queue: &str, delay: Duration, job: Job) -> Result<()> {
        let semaphore = self.semaphore_for(queue);
        let queue = queue.to_string();

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return;
            };
            if let Err(e) = job.await {
                tracing::error!(error = %e, %queue, "delayed job failed");
            }
        });

        Ok(())
    }

    fn schedule_periodic(
        &self,
        queue: &'static str,
        interval: Duration,
        job_factory: Arc<dyn Fn() -> Job + Send + Sync>,
    ) {
        let semaphore = self.semaphore_for(queue);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Ok(permit) = semaphore.clone().acquire_owned().await else {
                    break;
                };
                let job = job_factory();
                tokio::spawn(async move {
                    let _permit = permit;
                    if let Err(e) = job.await {
                        tracing::error!(error = %e, %queue, "periodic job failed");
                    }
                });
            }
        });
    }
}
