use std::sync::Arc;

use sluice_core::{
    HandlerMode, HandlerResult, InitError, InitLifecycle, RegistryBuilder, RegistryError, Request,
};
use sluice_pool::{ExecutionPool, PoolError};
use thiserror::Error;

use crate::config::{ConfigError, ServeConfig};
use crate::dispatch::Dispatcher;
use crate::engine::RuntimeEngine;
use crate::webhook::{WebhookDelivery, WebhookError};

type InitFn<C> = Box<dyn FnOnce() -> anyhow::Result<C> + Send>;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("no init function registered")]
    MissingInit,

    #[error(transparent)]
    Init(#[from] InitError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Webhook(#[from] WebhookError),
}

/// Composition phase: collect the init function and handlers, then `start`.
///
/// ```ignore
/// let app = App::new("echo")
///     .init(|| Ok(Model::load()?))?
///     .handler("/", |model, req| Ok(Response::ok(model.run(&req.json)?)))?;
/// let engine = app.start().await?;
/// ```
pub struct App<C> {
    name: String,
    init: Option<InitFn<C>>,
    registry: RegistryBuilder<C>,
    config: Option<ServeConfig>,
}

impl<C: Send + Sync + 'static> App<C> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            init: None,
            registry: RegistryBuilder::new(),
            config: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register the function that builds the shared context. Only one is allowed.
    pub fn init<F>(mut self, init: F) -> Result<Self, RegistryError>
    where
        F: FnOnce() -> anyhow::Result<C> + Send + 'static,
    {
        if self.init.is_some() {
            return Err(RegistryError::DuplicateInit);
        }
        self.init = Some(Box::new(init));
        Ok(self)
    }

    /// Register a handler whose caller waits for the result.
    pub fn handler<F>(self, route: &str, handler: F) -> Result<Self, RegistryError>
    where
        F: Fn(&C, Request) -> HandlerResult + Send + Sync + 'static,
    {
        self.register(route, HandlerMode::Sync, handler, None)
    }

    /// Register a handler whose caller is acknowledged right away.
    pub fn background<F>(self, route: &str, handler: F) -> Result<Self, RegistryError>
    where
        F: Fn(&C, Request) -> HandlerResult + Send + Sync + 'static,
    {
        self.register(route, HandlerMode::Async, handler, None)
    }

    /// Background handler whose result is POSTed to `webhook`.
    pub fn background_with_webhook<F>(
        self,
        route: &str,
        webhook: &str,
        handler: F,
    ) -> Result<Self, RegistryError>
    where
        F: Fn(&C, Request) -> HandlerResult + Send + Sync + 'static,
    {
        self.register(route, HandlerMode::Async, handler, Some(webhook.to_string()))
    }

    pub fn with_config(mut self, config: ServeConfig) -> Self {
        self.config = Some(config);
        self
    }

    fn register<F>(
        mut self,
        route: &str,
        mode: HandlerMode,
        handler: F,
        webhook: Option<String>,
    ) -> Result<Self, RegistryError>
    where
        F: Fn(&C, Request) -> HandlerResult + Send + Sync + 'static,
    {
        self.registry
            .register(route, mode, Arc::new(handler), webhook)?;
        Ok(self)
    }

    /// Freeze the registry, run init, then start the workers.
    ///
    /// Any failure returns before a worker exists, so no handler ever runs
    /// against a missing or half-built context.
    pub async fn start(self) -> Result<RuntimeEngine<C>, StartupError> {
        let App {
            name,
            init,
            mut registry,
            config,
        } = self;

        let config = match config {
            Some(config) => config,
            None => ServeConfig::load()?,
        };
        config.validate()?;
        let init = init.ok_or(StartupError::MissingInit)?;

        for (route, url) in &config.webhooks {
            match registry.mode_of(route) {
                Some(HandlerMode::Async) => registry.set_webhook(route, url)?,
                Some(HandlerMode::Sync) => {
                    tracing::warn!("Ignoring webhook for sync route {}", route)
                }
                None => tracing::warn!("Ignoring webhook for unknown route {}", route),
            }
        }
        let registry = Arc::new(registry.freeze()?);

        tracing::info!("Starting {}", name);
        let lifecycle = Arc::new(InitLifecycle::new());
        let runner = Arc::clone(&lifecycle);
        let context = tokio::task::spawn_blocking(move || runner.run(init))
            .await
            .map_err(|err| InitError::Panicked(err.to_string()))??;

        let pool = Arc::new(ExecutionPool::new(config.pool_config(), Arc::clone(&context))?);
        let webhooks = WebhookDelivery::spawn(&config.webhook)?;
        let dispatcher = Dispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&pool),
            webhooks.clone(),
            config.request_timeout(),
        );

        tracing::info!("{} ready with {} routes", name, registry.len());
        Ok(RuntimeEngine::new(
            name, config, context, registry, pool, dispatcher, webhooks,
        ))
    }
}
