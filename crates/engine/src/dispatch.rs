use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use sluice_core::{
    ENDPOINT_TYPE_HEADER, HandlerError, HandlerMode, HandlerSpec, Registry, Request,
    normalize_route,
};
use sluice_pool::{ExecutionPool, Job, JobOutcome, JobTicket, SubmitError};
use thiserror::Error;

use crate::envelope::{RequestEnvelope, ResponseEnvelope};
use crate::webhook::{WebhookDelivery, WebhookJob};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("route not found: {0}")]
    RouteNotFound(String),

    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("server busy: queue is full ({capacity} waiting)")]
    QueueSaturated { capacity: usize },

    #[error("server is shutting down")]
    Unavailable,

    #[error(transparent)]
    HandlerFailed(#[from] HandlerError),

    #[error("handler did not finish within {0:?}")]
    Timeout(Duration),

    #[error("job {0} was lost before it finished")]
    WorkerLost(String),
}

impl DispatchError {
    pub fn status(&self) -> u16 {
        match self {
            DispatchError::RouteNotFound(_) => 404,
            DispatchError::MalformedRequest(_) => 400,
            DispatchError::QueueSaturated { .. } | DispatchError::Unavailable => 503,
            DispatchError::Timeout(_) => 504,
            DispatchError::HandlerFailed(_) | DispatchError::WorkerLost(_) => 500,
        }
    }

    pub fn into_response(self) -> ResponseEnvelope {
        ResponseEnvelope::error(self.status(), self.to_string())
    }
}

impl From<SubmitError> for DispatchError {
    fn from(err: SubmitError) -> Self {
        match err {
            SubmitError::QueueSaturated { capacity } => DispatchError::QueueSaturated { capacity },
            SubmitError::Closed => DispatchError::Unavailable,
            SubmitError::WorkerLost(id) => DispatchError::WorkerLost(id),
        }
    }
}

/// Turns an inbound call into a job and its outcome into a reply.
pub struct Dispatcher<C> {
    registry: Arc<Registry<C>>,
    pool: Arc<ExecutionPool<C>>,
    webhooks: WebhookDelivery,
    request_timeout: Option<Duration>,
}

impl<C: Send + Sync + 'static> Dispatcher<C> {
    pub fn new(
        registry: Arc<Registry<C>>,
        pool: Arc<ExecutionPool<C>>,
        webhooks: WebhookDelivery,
        request_timeout: Option<Duration>,
    ) -> Self {
        Self {
            registry,
            pool,
            webhooks,
            request_timeout,
        }
    }

    pub async fn handle(&self, request: RequestEnvelope) -> ResponseEnvelope {
        let spec = match self.registry.resolve(&request.route) {
            Ok(spec) => spec,
            Err(_) => {
                return DispatchError::RouteNotFound(normalize_route(&request.route))
                    .into_response();
            }
        };
        let mode = spec.mode;
        let route = spec.route.clone();

        let result = match mode {
            HandlerMode::Sync => self.run_sync(spec, request).await,
            HandlerMode::Async => self.run_async(spec, request),
        };
        let response = result.unwrap_or_else(|err| {
            if err.status() >= 500 {
                tracing::debug!("Request for {} failed: {}", route, err);
            }
            err.into_response()
        });
        response.with_header(ENDPOINT_TYPE_HEADER, mode.endpoint_type())
    }

    fn submit(
        &self,
        spec: &Arc<HandlerSpec<C>>,
        request: RequestEnvelope,
    ) -> Result<JobTicket, DispatchError> {
        let json = request
            .parse_body()
            .map_err(DispatchError::MalformedRequest)?;
        let request = Request::new(spec.route.clone(), json).with_headers(request.headers);
        Ok(self.pool.submit(Job::new(Arc::clone(spec), request))?)
    }

    async fn run_sync(
        &self,
        spec: Arc<HandlerSpec<C>>,
        request: RequestEnvelope,
    ) -> Result<ResponseEnvelope, DispatchError> {
        let ticket = self.submit(&spec, request)?;
        let outcome = match self.request_timeout {
            Some(limit) => tokio::time::timeout(limit, ticket.wait())
                .await
                .map_err(|_| DispatchError::Timeout(limit))??,
            None => ticket.wait().await?,
        };

        let response = outcome.result?;
        Ok(ResponseEnvelope {
            status: response.status,
            headers: response.headers,
            body: response.json,
        })
    }

    fn run_async(
        &self,
        spec: Arc<HandlerSpec<C>>,
        request: RequestEnvelope,
    ) -> Result<ResponseEnvelope, DispatchError> {
        let ticket = self.submit(&spec, request)?;

        // Without a webhook the ticket is dropped and the result discarded.
        if let Some(url) = spec.webhook.clone() {
            let webhooks = self.webhooks.clone();
            let pending = webhooks.track();
            tokio::spawn(async move {
                let _pending = pending;
                match ticket.wait().await {
                    Ok(outcome) => {
                        webhooks.enqueue(webhook_job(url, outcome));
                    }
                    Err(err) => tracing::error!("Background job lost: {}", err),
                }
            });
        }

        Ok(ResponseEnvelope::new(200, json!({ "success": true })))
    }
}

fn webhook_job(url: String, outcome: JobOutcome) -> WebhookJob {
    let payload = match outcome.result {
        Ok(response) => response.json,
        Err(err) => json!({
            "error": err.to_string(),
            "job_id": &outcome.job_id,
            "route": &outcome.route,
        }),
    };
    WebhookJob {
        url,
        job_id: outcome.job_id,
        route: outcome.route,
        payload,
    }
}
