//! Bounded execution pool guarding a shared, expensive context.
//!
//! Architecture:
//! - W dedicated worker threads, each running one handler at a time
//! - One FIFO queue shared by all workers; a worker pulls the next job only
//!   after finishing its current one
//! - Admission is bounded by a semaphore holding `queue_capacity + W` permits,
//!   so at most `queue_capacity` jobs wait while every worker is busy
//! - Handler failures and panics are captured into the job outcome and never
//!   take a worker down

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use sluice_core::{HandlerError, HandlerMode, HandlerResult, Response, panic_message};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError, mpsc, oneshot};

use crate::job::{Job, JobOutcome, JobStatus, JobTicket, JobTrace, now_millis};

// ========== Configuration ==========

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of worker threads, i.e. how many handlers may run at once
    pub num_workers: usize,
    /// Jobs allowed to wait while every worker is busy (0 = reject when busy)
    pub queue_capacity: usize,
    /// Finished jobs kept for `recent_jobs`
    pub history_limit: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 1,
            queue_capacity: 32,
            history_limit: 200,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("queue saturated: {capacity} jobs already waiting")]
    QueueSaturated { capacity: usize },

    #[error("pool is closed")]
    Closed,

    #[error("worker dropped job {0} before reporting an outcome")]
    WorkerLost(String),
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("pool needs at least one worker")]
    NoWorkers,

    #[error("queue capacity {queue_capacity} plus {num_workers} workers exceeds the admission limit")]
    CapacityTooLarge {
        queue_capacity: usize,
        num_workers: usize,
    },

    #[error("failed to spawn worker {worker_id}: {source}")]
    Spawn {
        worker_id: usize,
        #[source]
        source: std::io::Error,
    },
}

// ========== Pool Metrics ==========

#[derive(Default)]
struct PoolMetrics {
    queued: AtomicUsize,
    running: AtomicUsize,
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub workers: usize,
    pub queue_capacity: usize,
    pub queued: usize,
    pub running: usize,
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub rejected: u64,
    pub idle: bool,
}

struct QueuedJob<C> {
    job: Job<C>,
    permit: OwnedSemaphorePermit,
    response_tx: oneshot::Sender<JobOutcome>,
}

type SharedQueue<C> = Arc<Mutex<mpsc::UnboundedReceiver<QueuedJob<C>>>>;
type History = Arc<Mutex<VecDeque<JobTrace>>>;

// ========== Main Pool ==========

pub struct ExecutionPool<C> {
    sender: Mutex<Option<mpsc::UnboundedSender<QueuedJob<C>>>>,
    admission: Arc<Semaphore>,
    config: PoolConfig,
    metrics: Arc<PoolMetrics>,
    history: History,
}

impl<C: Send + Sync + 'static> ExecutionPool<C> {
    /// Start the worker threads. Every worker shares the same context.
    pub fn new(config: PoolConfig, context: Arc<C>) -> Result<Self, PoolError> {
        if config.num_workers == 0 {
            return Err(PoolError::NoWorkers);
        }
        let permits = config
            .queue_capacity
            .checked_add(config.num_workers)
            .filter(|total| *total <= Semaphore::MAX_PERMITS)
            .ok_or(PoolError::CapacityTooLarge {
                queue_capacity: config.queue_capacity,
                num_workers: config.num_workers,
            })?;

        let (tx, rx) = mpsc::unbounded_channel();
        let queue: SharedQueue<C> = Arc::new(Mutex::new(rx));
        let metrics = Arc::new(PoolMetrics::default());
        let history: History = Arc::new(Mutex::new(VecDeque::new()));

        tracing::info!(
            "Starting execution pool: {} workers, queue capacity {}",
            config.num_workers,
            config.queue_capacity
        );

        // Workers are detached; they exit once the queue sender is gone and the queue is empty.
        for worker_id in 0..config.num_workers {
            let worker = WorkerThread {
                worker_id,
                context: Arc::clone(&context),
                queue: Arc::clone(&queue),
                metrics: Arc::clone(&metrics),
                history: Arc::clone(&history),
                history_limit: config.history_limit,
            };
            thread::Builder::new()
                .name(format!("sluice-worker-{}", worker_id))
                .spawn(move || worker.run())
                .map_err(|source| PoolError::Spawn { worker_id, source })?;
        }

        Ok(Self {
            sender: Mutex::new(Some(tx)),
            admission: Arc::new(Semaphore::new(permits)),
            config,
            metrics,
            history,
        })
    }

    /// Admit a job without blocking, or reject it when the queue is full.
    pub fn submit(&self, mut job: Job<C>) -> Result<JobTicket, SubmitError> {
        // Held across permit + send so queue order is admission order.
        let sender = lock(&self.sender);
        let Some(sender) = sender.as_ref() else {
            return Err(SubmitError::Closed);
        };

        let permit = match Arc::clone(&self.admission).try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => {
                self.metrics.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    "Queue saturated, rejecting job for {} ({} waiting)",
                    job.route(),
                    self.metrics.queued.load(Ordering::Relaxed)
                );
                return Err(SubmitError::QueueSaturated {
                    capacity: self.config.queue_capacity,
                });
            }
            Err(TryAcquireError::Closed) => return Err(SubmitError::Closed),
        };

        let (response_tx, response_rx) = oneshot::channel();
        let id = job.id.clone();
        job.status = JobStatus::Queued;
        job.enqueued_at = Instant::now();

        self.metrics.queued.fetch_add(1, Ordering::Relaxed);
        if sender
            .send(QueuedJob {
                job,
                permit,
                response_tx,
            })
            .is_err()
        {
            self.metrics.queued.fetch_sub(1, Ordering::Relaxed);
            return Err(SubmitError::Closed);
        }
        self.metrics.submitted.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Job {} queued", id);

        Ok(JobTicket {
            id,
            outcome: response_rx,
        })
    }
}

impl<C> ExecutionPool<C> {
    /// Stop admitting jobs. Jobs already queued still run.
    pub fn close(&self) {
        if lock(&self.sender).take().is_some() {
            self.admission.close();
            tracing::info!("Execution pool closed to new jobs");
        }
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.sender).is_none()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn stats(&self) -> PoolStats {
        let queued = self.metrics.queued.load(Ordering::SeqCst);
        let running = self.metrics.running.load(Ordering::SeqCst);
        PoolStats {
            workers: self.config.num_workers,
            queue_capacity: self.config.queue_capacity,
            queued,
            running,
            submitted: self.metrics.submitted.load(Ordering::Relaxed),
            completed: self.metrics.completed.load(Ordering::Relaxed),
            failed: self.metrics.failed.load(Ordering::Relaxed),
            rejected: self.metrics.rejected.load(Ordering::Relaxed),
            idle: queued == 0 && running == 0,
        }
    }

    /// Most recent finished jobs, oldest first.
    pub fn recent_jobs(&self, limit: usize) -> Vec<JobTrace> {
        let history = lock(&self.history);
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    /// Wait until nothing is queued or running, up to `timeout`.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.stats().idle {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ========== Worker Thread ==========

struct WorkerThread<C> {
    worker_id: usize,
    context: Arc<C>,
    queue: SharedQueue<C>,
    metrics: Arc<PoolMetrics>,
    history: History,
    history_limit: usize,
}

impl<C> WorkerThread<C> {
    fn run(self) {
        tracing::debug!("Worker {} started", self.worker_id);
        loop {
            let next = lock(&self.queue).blocking_recv();
            let Some(queued) = next else {
                break;
            };
            self.process(queued);
        }
        tracing::debug!("Worker {} shutting down", self.worker_id);
    }

    fn process(&self, queued: QueuedJob<C>) {
        let QueuedJob {
            mut job,
            permit,
            response_tx,
        } = queued;

        // Running goes up first so stats never see a dequeued job as idle.
        self.metrics.running.fetch_add(1, Ordering::SeqCst);
        self.metrics.queued.fetch_sub(1, Ordering::SeqCst);

        let queue_wait = job.enqueued_at.elapsed();
        let request = job.start();
        let spec = Arc::clone(&job.spec);
        let started = Instant::now();

        let result = match panic::catch_unwind(AssertUnwindSafe(|| {
            spec.call(&self.context, request)
        })) {
            Ok(result) => result,
            Err(payload) => Err(HandlerError::Panicked(panic_message(payload.as_ref()))),
        }
        .and_then(|response| validate_response(spec.mode, response));
        let run_time = started.elapsed();

        job.status = if result.is_ok() {
            JobStatus::Completed
        } else {
            JobStatus::Failed
        };

        self.metrics.running.fetch_sub(1, Ordering::Relaxed);
        match &result {
            Ok(_) => {
                self.metrics.completed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    "Job {} on {} completed in {}ms",
                    job.id,
                    job.route(),
                    run_time.as_millis()
                );
            }
            Err(err) => {
                self.metrics.failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!("Job {} on {} failed: {}", job.id, job.route(), err);
            }
        }

        self.record_trace(JobTrace {
            id: job.id.clone(),
            route: job.route().to_string(),
            worker_id: self.worker_id,
            state: job.status,
            error: result.as_ref().err().map(|err| err.to_string()),
            queue_wait_ms: queue_wait.as_millis() as u64,
            run_time_ms: run_time.as_millis() as u64,
            finished_at_ms: now_millis(),
        });

        // Free the slot before replying so a caller reacting to the reply can submit again.
        drop(permit);

        let _ = response_tx.send(JobOutcome {
            route: job.route().to_string(),
            mode: job.mode(),
            job_id: job.id,
            worker_id: self.worker_id,
            status: job.status,
            result,
            queue_wait,
            run_time,
        });
    }

    fn record_trace(&self, trace: JobTrace) {
        if self.history_limit == 0 {
            return;
        }
        let mut history = lock(&self.history);
        while history.len() >= self.history_limit {
            history.pop_front();
        }
        history.push_back(trace);
    }
}

/// Sync replies go straight back to the caller, so their body must be a JSON object.
fn validate_response(mode: HandlerMode, response: Response) -> HandlerResult {
    if mode == HandlerMode::Sync && !response.json.is_object() {
        return Err(HandlerError::InvalidResponse(
            "response json must be an object".to_string(),
        ));
    }
    Ok(response)
}
