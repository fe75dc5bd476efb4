use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use sluice_core::{HandlerSpec, Registry};
use sluice_pool::{ExecutionPool, JobTrace, PoolStats};

use crate::config::ServeConfig;
use crate::dispatch::Dispatcher;
use crate::envelope::{RequestEnvelope, ResponseEnvelope};
use crate::webhook::{WebhookDelivery, WebhookStats};

/// A started application: context built, workers running, ready to dispatch.
pub struct RuntimeEngine<C> {
    name: String,
    config: ServeConfig,
    context: Arc<C>,
    registry: Arc<Registry<C>>,
    pool: Arc<ExecutionPool<C>>,
    dispatcher: Dispatcher<C>,
    webhooks: WebhookDelivery,
}

/// Snapshot served by the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub name: String,
    #[serde(flatten)]
    pub pool: PoolStats,
    pub webhooks: WebhookStats,
    pub recent: Vec<JobTrace>,
}

impl<C: Send + Sync + 'static> RuntimeEngine<C> {
    pub(crate) fn new(
        name: String,
        config: ServeConfig,
        context: Arc<C>,
        registry: Arc<Registry<C>>,
        pool: Arc<ExecutionPool<C>>,
        dispatcher: Dispatcher<C>,
        webhooks: WebhookDelivery,
    ) -> Self {
        Self {
            name,
            config,
            context,
            registry,
            pool,
            dispatcher,
            webhooks,
        }
    }

    pub async fn dispatch(&self, request: RequestEnvelope) -> ResponseEnvelope {
        self.dispatcher.handle(request).await
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ServeConfig {
        &self.config
    }

    pub fn context(&self) -> Arc<C> {
        Arc::clone(&self.context)
    }

    pub fn routes(&self) -> Vec<Arc<HandlerSpec<C>>> {
        self.registry.routes()
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn status(&self, recent: usize) -> EngineStatus {
        EngineStatus {
            name: self.name.clone(),
            pool: self.pool.stats(),
            webhooks: self.webhooks.stats(),
            recent: self.pool.recent_jobs(recent),
        }
    }

    /// Stop admitting jobs; anything submitted afterwards gets a 503.
    pub fn close(&self) {
        self.pool.close();
    }

    /// Refuse new jobs, wait for queued ones to finish, then for their webhook
    /// results to be delivered. Returns false if `timeout` ran out first.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.close();
        let deadline = Instant::now() + timeout;
        if !self.pool.drain(timeout).await {
            let stats = self.pool.stats();
            tracing::warn!(
                "{} shut down with {} jobs still in flight",
                self.name,
                stats.queued + stats.running
            );
            return false;
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if !self.webhooks.flush(remaining).await {
            tracing::warn!(
                "{} shut down with {} webhook results undelivered",
                self.name,
                self.webhooks.stats().pending
            );
            return false;
        }

        tracing::info!("{} drained", self.name);
        true
    }
}
