use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::HandlerError;

pub const ENDPOINT_TYPE_HEADER: &str = "X-Endpoint-Type";

/// Served by the runtime itself; no handler may claim it.
pub const STATUS_ROUTE: &str = "/__status__";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandlerMode {
    /// Caller waits for the handler result.
    Sync,
    /// Caller gets an acknowledgment; the result goes to a webhook, if any.
    Async,
}

impl HandlerMode {
    pub fn endpoint_type(&self) -> &'static str {
        match self {
            HandlerMode::Sync => "handler",
            HandlerMode::Async => "background",
        }
    }
}

/// Parsed inbound call handed to a handler.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Request {
    pub route: String,
    pub headers: HashMap<String, String>,
    pub json: serde_json::Value,
}

impl Request {
    pub fn new(route: impl Into<String>, json: serde_json::Value) -> Self {
        Self {
            route: route.into(),
            headers: HashMap::new(),
            json,
        }
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    /// Header lookup, ignoring case.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Top-level field of the JSON body.
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.json.get(key)
    }

    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        serde_json::from_value(self.json.clone()).map_err(HandlerError::from)
    }
}

/// What a handler hands back: status, JSON body and extra headers.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    pub json: serde_json::Value,
    pub headers: HashMap<String, String>,
}

impl Response {
    pub fn new(status: u16, json: serde_json::Value) -> Self {
        Self {
            status,
            json,
            headers: HashMap::new(),
        }
    }

    pub fn ok(json: serde_json::Value) -> Self {
        Self::new(200, json)
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

pub type HandlerResult = Result<Response, HandlerError>;

pub type HandlerFn<C> = Arc<dyn Fn(&C, Request) -> HandlerResult + Send + Sync>;

/// A registered route. Immutable once the registry is frozen.
pub struct HandlerSpec<C> {
    pub route: String,
    pub mode: HandlerMode,
    pub webhook: Option<String>,
    pub handler: HandlerFn<C>,
}

impl<C> HandlerSpec<C> {
    pub fn call(&self, context: &C, request: Request) -> HandlerResult {
        (self.handler)(context, request)
    }
}

impl<C> std::fmt::Debug for HandlerSpec<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerSpec")
            .field("route", &self.route)
            .field("mode", &self.mode)
            .field("webhook", &self.webhook)
            .finish_non_exhaustive()
    }
}

/// `"predict"`, `"/predict"` and `"/predict/"` all name the same route.
pub fn normalize_route(route: &str) -> String {
    let trimmed = route.trim().trim_matches('/');
    if trimmed.is_empty() {
        return "/".to_string();
    }
    format!("/{}", trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn routes_normalize_to_single_leading_slash() {
        assert_eq!(normalize_route(""), "/");
        assert_eq!(normalize_route("/"), "/");
        assert_eq!(normalize_route("predict"), "/predict");
        assert_eq!(normalize_route("/predict/"), "/predict");
        assert_eq!(normalize_route("v1/models/run"), "/v1/models/run");
    }

    #[test]
    fn request_header_lookup_ignores_case() {
        let request = Request::new("/", json!({})).with_headers(HashMap::from([(
            "content-type".to_string(),
            "application/json".to_string(),
        )]));
        assert_eq!(request.header("Content-Type"), Some("application/json"));
        assert_eq!(request.header("x-missing"), None);
    }

    #[test]
    fn request_parse_reports_shape_errors() {
        #[derive(Deserialize)]
        struct Prompt {
            prompt: String,
        }

        let request = Request::new("/", json!({"prompt": "hi"}));
        let parsed: Prompt = request.parse().unwrap();
        assert_eq!(parsed.prompt, "hi");

        let bad = Request::new("/", json!({"prompt": 3}));
        assert!(matches!(bad.parse::<Prompt>(), Err(HandlerError::Failed(_))));
    }

    #[test]
    fn endpoint_types_match_mode() {
        assert_eq!(HandlerMode::Sync.endpoint_type(), "handler");
        assert_eq!(HandlerMode::Async.endpoint_type(), "background");
    }
}
