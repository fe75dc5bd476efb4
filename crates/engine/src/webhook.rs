//! Best-effort webhook delivery for background job results.
//!
//! Deliveries are handed to a bounded channel and drained by a runner task on
//! the Tokio runtime, never on a pool worker. A slow or failing receiver only
//! ever costs runner capacity; once retries are exhausted the result is logged
//! and dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{Semaphore, mpsc};

use crate::config::WebhookConfig;
use crate::retry::RetryPolicy;

pub const JOB_ID_HEADER: &str = "X-Sluice-Job-Id";

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("failed to build webhook client: {0}")]
    Client(String),

    #[error("webhook returned status {status}")]
    Status { status: u16 },

    #[error("webhook request failed: {0}")]
    Transport(String),

    #[error("webhook {url} failed after {attempts} attempts: {last}")]
    Exhausted {
        url: String,
        attempts: u32,
        last: Box<WebhookError>,
    },
}

/// One result notification.
#[derive(Debug, Clone)]
pub struct WebhookJob {
    pub url: String,
    pub job_id: String,
    pub route: String,
    pub payload: Value,
}

#[derive(Default)]
struct DeliveryMetrics {
    delivered: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    pending: AtomicUsize,
}

/// Keeps a result counted as pending until it is delivered, dropped, or lost.
pub struct PendingDelivery {
    metrics: Arc<DeliveryMetrics>,
}

impl Drop for PendingDelivery {
    fn drop(&mut self) {
        self.metrics.pending.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WebhookStats {
    pub delivered: u64,
    pub failed: u64,
    pub dropped: u64,
    pub pending: usize,
}

#[derive(Clone)]
pub struct WebhookDelivery {
    tx: mpsc::Sender<(WebhookJob, PendingDelivery)>,
    metrics: Arc<DeliveryMetrics>,
}

impl WebhookDelivery {
    /// Start the delivery runner. Must be called from within a Tokio runtime.
    pub fn spawn(config: &WebhookConfig) -> Result<Self, WebhookError> {
        let policy = config.retry_policy();
        let client = reqwest::Client::builder()
            .timeout(policy.attempt_timeout)
            .build()
            .map_err(|err| WebhookError::Client(err.to_string()))?;

        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let metrics = Arc::new(DeliveryMetrics::default());
        tokio::spawn(run_deliveries(
            rx,
            client,
            policy,
            config.concurrency,
            Arc::clone(&metrics),
        ));

        Ok(Self { tx, metrics })
    }

    /// Count a result that will be enqueued later, e.g. once its job finishes.
    pub fn track(&self) -> PendingDelivery {
        self.metrics.pending.fetch_add(1, Ordering::SeqCst);
        PendingDelivery {
            metrics: Arc::clone(&self.metrics),
        }
    }

    /// Hand a result to the runner. Returns false when it had to be dropped.
    pub fn enqueue(&self, job: WebhookJob) -> bool {
        match self.tx.try_send((job, self.track())) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full((job, _))) => {
                self.metrics.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    "Webhook queue full, dropping result of job {} for {}",
                    job.job_id,
                    job.url
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed((job, _))) => {
                self.metrics.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Webhook runner stopped, dropping result of job {}", job.job_id);
                false
            }
        }
    }

    pub fn stats(&self) -> WebhookStats {
        WebhookStats {
            delivered: self.metrics.delivered.load(Ordering::Relaxed),
            failed: self.metrics.failed.load(Ordering::Relaxed),
            dropped: self.metrics.dropped.load(Ordering::Relaxed),
            pending: self.metrics.pending.load(Ordering::SeqCst),
        }
    }

    /// Wait until every tracked result has settled.
    /// Returns false if some were still pending when `timeout` ran out.
    pub async fn flush(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.metrics.pending.load(Ordering::SeqCst) == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

async fn run_deliveries(
    mut rx: mpsc::Receiver<(WebhookJob, PendingDelivery)>,
    client: reqwest::Client,
    policy: RetryPolicy,
    concurrency: usize,
    metrics: Arc<DeliveryMetrics>,
) {
    let limit = Arc::new(Semaphore::new(concurrency.max(1)));
    while let Some((job, pending)) = rx.recv().await {
        let Ok(permit) = Arc::clone(&limit).acquire_owned().await else {
            break;
        };
        let client = client.clone();
        let policy = policy.clone();
        let metrics = Arc::clone(&metrics);
        tokio::spawn(async move {
            let _permit = permit;
            let _pending = pending;
            match deliver(&client, &policy, &job).await {
                Ok(attempts) => {
                    metrics.delivered.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(
                        "Delivered result of job {} to {} ({} attempts)",
                        job.job_id,
                        job.url,
                        attempts
                    );
                }
                Err(err) => {
                    metrics.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::error!("Dropping result of job {}: {}", job.job_id, err);
                }
            }
        });
    }
    tracing::debug!("Webhook runner stopped");
}

/// POST the payload, retrying transport errors and non-2xx replies.
/// Returns the number of attempts it took.
pub async fn deliver(
    client: &reqwest::Client,
    policy: &RetryPolicy,
    job: &WebhookJob,
) -> Result<u32, WebhookError> {
    let mut attempts = 0;
    loop {
        attempts += 1;
        let err = match send_once(client, job).await {
            Ok(()) => return Ok(attempts),
            Err(err) => err,
        };

        if !policy.should_retry(attempts) {
            return Err(WebhookError::Exhausted {
                url: job.url.clone(),
                attempts,
                last: Box::new(err),
            });
        }

        let delay = policy.backoff.delay_for_attempt(attempts - 1);
        tracing::warn!(
            "Webhook attempt {} for job {} failed: {}; retrying in {}ms",
            attempts,
            job.job_id,
            err,
            delay.as_millis()
        );
        tokio::time::sleep(delay).await;
    }
}

async fn send_once(client: &reqwest::Client, job: &WebhookJob) -> Result<(), WebhookError> {
    let response = client
        .post(&job.url)
        .header(JOB_ID_HEADER, &job.job_id)
        .json(&job.payload)
        .send()
        .await
        .map_err(|err| WebhookError::Transport(err.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        return Err(WebhookError::Status {
            status: status.as_u16(),
        });
    }
    Ok(())
}
