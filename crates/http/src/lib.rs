mod router;
mod server;

pub use router::{STATUS_PATH, app_router};
pub use server::{ServeError, serve_http, serve_listener, shutdown_signal};
