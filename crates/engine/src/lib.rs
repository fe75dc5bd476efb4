pub mod app;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod envelope;
pub mod retry;
pub mod webhook;

pub use app::{App, StartupError};
pub use config::{ConfigError, ServeConfig, WebhookConfig};
pub use dispatch::{DispatchError, Dispatcher};
pub use engine::{EngineStatus, RuntimeEngine};
pub use envelope::{RequestEnvelope, ResponseEnvelope};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use webhook::{JOB_ID_HEADER, WebhookDelivery, WebhookError, WebhookJob, WebhookStats};
