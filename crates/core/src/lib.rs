pub mod context;
pub mod error;
pub mod handler;
pub mod registry;

pub use context::{ContextStore, InitLifecycle, InitState};
pub use error::{HandlerError, InitError, RegistryError, panic_message};
pub use handler::{
    ENDPOINT_TYPE_HEADER, HandlerFn, HandlerMode, HandlerResult, HandlerSpec, Request, Response,
    STATUS_ROUTE, normalize_route,
};
pub use registry::{Registry, RegistryBuilder};
