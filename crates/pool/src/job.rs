use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use nanoid::nanoid;
use serde::Serialize;
use sluice_core::{HandlerMode, HandlerResult, HandlerSpec, Request};
use tokio::sync::oneshot;

use crate::SubmitError;

const ID_ALPHABET: [char; 62] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H', 'I',
    'J', 'K', 'L', 'M', 'N', 'O', 'P', 'Q', 'R', 'S', 'T', 'U', 'V', 'W', 'X', 'Y', 'Z', 'a', 'b',
    'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's', 't', 'u',
    'v', 'w', 'x', 'y', 'z',
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

/// One invocation of a handler against a specific request.
pub struct Job<C> {
    pub id: String,
    pub spec: Arc<HandlerSpec<C>>,
    pub request: Request,
    pub enqueued_at: Instant,
    pub status: JobStatus,
}

impl<C> Job<C> {
    pub fn new(spec: Arc<HandlerSpec<C>>, request: Request) -> Self {
        Self {
            id: format!("job_{}", nanoid!(12, &ID_ALPHABET)),
            spec,
            request,
            enqueued_at: Instant::now(),
            status: JobStatus::Queued,
        }
    }

    pub fn route(&self) -> &str {
        &self.spec.route
    }

    pub fn mode(&self) -> HandlerMode {
        self.spec.mode
    }

    /// Mark the job running and hand its request over to the handler.
    pub(crate) fn start(&mut self) -> Request {
        self.status = JobStatus::Running;
        std::mem::take(&mut self.request)
    }
}

/// Final state of a job, reported once by the worker that ran it.
#[derive(Debug)]
pub struct JobOutcome {
    pub job_id: String,
    pub route: String,
    pub mode: HandlerMode,
    pub worker_id: usize,
    pub status: JobStatus,
    pub result: HandlerResult,
    pub queue_wait: Duration,
    pub run_time: Duration,
}

/// Handle returned by a successful submission.
pub struct JobTicket {
    pub id: String,
    pub(crate) outcome: oneshot::Receiver<JobOutcome>,
}

impl JobTicket {
    /// Wait for the job to leave `Running`. Dropping the future does not cancel the job.
    pub async fn wait(self) -> Result<JobOutcome, SubmitError> {
        let id = self.id;
        self.outcome.await.map_err(|_| SubmitError::WorkerLost(id))
    }
}

/// Recent job entry kept for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct JobTrace {
    pub id: String,
    pub route: String,
    pub worker_id: usize,
    pub state: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub queue_wait_ms: u64,
    pub run_time_ms: u64,
    pub finished_at_ms: u64,
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
