use thiserror::Error;

/// Failure of the one-time initializer. Always fatal: the server never binds.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InitError {
    #[error("init failed: {0}")]
    Failed(String),

    #[error("init panicked: {0}")]
    Panicked(String),

    #[error("context is already initialized")]
    AlreadyInitialized,

    #[error("init already ran and failed; it is not retried")]
    PreviouslyFailed,

    #[error("init is already running")]
    InProgress,
}

/// Composition-time and lookup errors of the handler registry.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("route {route} is already registered")]
    DuplicateRoute { route: String },

    #[error("route {route} is reserved")]
    ReservedRoute { route: String },

    #[error("route {route} is a sync handler and cannot carry a webhook")]
    WebhookOnSyncHandler { route: String },

    #[error("invalid webhook url for route {route}: {url}")]
    InvalidWebhookUrl { route: String, url: String },

    #[error("no handlers registered")]
    NoHandlers,

    #[error("an init function is already registered")]
    DuplicateInit,

    #[error("route not found: {0}")]
    RouteNotFound(String),
}

/// Outcome of a handler that did not produce a usable response.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    #[error("handler returned an invalid response: {0}")]
    InvalidResponse(String),

    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    pub fn msg(message: impl std::fmt::Display) -> Self {
        Self::Failed(message.to_string())
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        Self::Failed(format!("{:#}", err))
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Failed(err.to_string())
    }
}

/// Turn a caught panic payload into something loggable.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return message.clone();
    }
    "unknown panic payload".to_string()
}
