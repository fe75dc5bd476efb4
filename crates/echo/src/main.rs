use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Context;
use serde::Deserialize;
use serde_json::json;
use sluice_core::{HandlerError, Request, Response};
use sluice_engine::{App, ServeConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Stand-in for an expensive model: built once, shared by every handler.
struct EchoModel {
    name: String,
    calls: AtomicU64,
}

impl EchoModel {
    fn load() -> anyhow::Result<Self> {
        let name = std::env::var("ECHO_MODEL_NAME").unwrap_or_else(|_| "echo".to_string());
        if name.trim().is_empty() {
            anyhow::bail!("ECHO_MODEL_NAME must not be empty");
        }
        Ok(Self {
            name,
            calls: AtomicU64::new(0),
        })
    }
}

#[derive(Deserialize)]
struct Prompt {
    prompt: String,
}

fn generate(model: &EchoModel, request: Request) -> Result<Response, HandlerError> {
    let Prompt { prompt } = request.parse::<Prompt>()?;
    let call = model.calls.fetch_add(1, Ordering::Relaxed) + 1;
    Ok(Response::ok(json!({ "outputs": prompt }))
        .with_header("X-Model", model.name.as_str())
        .with_header("X-Model-Call", call.to_string()))
}

fn summarize(model: &EchoModel, request: Request) -> Result<Response, HandlerError> {
    let Prompt { prompt } = request.parse::<Prompt>()?;
    let words = prompt.split_whitespace().count();
    tracing::info!("{} summarized {} words", model.name, words);
    Ok(Response::ok(json!({
        "model": model.name,
        "words": words,
        "summary": prompt.split_whitespace().take(8).collect::<Vec<_>>().join(" "),
    })))
}

fn build_app(config: ServeConfig) -> anyhow::Result<App<EchoModel>> {
    let app = App::new("sluice-echo")
        .init(EchoModel::load)?
        .handler("/", generate)?
        .background("/summarize", summarize)?
        .with_config(config);
    Ok(app)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServeConfig::load().context("failed to load configuration")?;
    let app = build_app(config)?;
    sluice_http::serve_http(app).await?;
    Ok(())
}
