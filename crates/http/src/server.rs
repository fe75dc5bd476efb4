use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use sluice_engine::{App, RuntimeEngine, StartupError};
use thiserror::Error;
use tokio::net::TcpListener;

use crate::router::app_router;

/// How long queued jobs get to finish after the listener stops.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ServeError {
    #[error(transparent)]
    Startup(#[from] StartupError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("server error: {0}")]
    Io(#[from] std::io::Error),
}

/// Start the app and serve it on the configured host and port until Ctrl-C or SIGTERM.
///
/// Init runs before the socket is bound; if it fails nothing ever listens.
pub async fn serve_http<C: Send + Sync + 'static>(app: App<C>) -> Result<(), ServeError> {
    let engine = Arc::new(app.start().await?);

    let addr = engine.config().bind_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|source| ServeError::Bind {
            addr: addr.clone(),
            source,
        })?;

    serve_listener(engine, listener, shutdown_signal()).await
}

/// Serve a started engine on an already bound listener until `shutdown` resolves.
pub async fn serve_listener<C, F>(
    engine: Arc<RuntimeEngine<C>>,
    listener: TcpListener,
    shutdown: F,
) -> Result<(), ServeError>
where
    C: Send + Sync + 'static,
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    tracing::info!("{} listening on {}", engine.name(), addr);

    let closing = Arc::clone(&engine);
    let signal = async move {
        shutdown.await;
        tracing::info!("Shutting down, no new jobs accepted");
        closing.close();
    };

    axum::serve(listener, app_router(Arc::clone(&engine)))
        .with_graceful_shutdown(signal)
        .await?;

    engine.shutdown(DRAIN_TIMEOUT).await;
    Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!("Failed to listen for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
