use bytes::Bytes;
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::HashMap;

/// Transport-neutral inbound call: a route and the raw body bytes.
#[derive(Debug, Clone, Default)]
pub struct RequestEnvelope {
    pub route: String,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

impl RequestEnvelope {
    pub fn new(route: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            route: route.into(),
            headers: HashMap::new(),
            body: body.into(),
        }
    }

    pub fn json(route: impl Into<String>, body: &Value) -> Self {
        Self::new(route, body.to_string())
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    /// Decode the body. An empty body is malformed, not `null`.
    pub fn parse_body(&self) -> Result<Value, String> {
        if self.body.iter().all(u8::is_ascii_whitespace) {
            return Err("request body is empty".to_string());
        }
        serde_json::from_slice(&self.body).map_err(|err| format!("invalid JSON body: {}", err))
    }
}

/// Reply handed back to the transport: status, headers and a JSON body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseEnvelope {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Value,
}

impl ResponseEnvelope {
    pub fn new(status: u16, body: Value) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body,
        }
    }

    pub fn error(status: u16, message: impl Into<String>) -> Self {
        Self::new(status, json!({ "error": message.into() }))
    }

    /// Set a header, replacing any existing one whose name differs only in case.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        self.headers
            .retain(|existing, _| !existing.eq_ignore_ascii_case(&key));
        self.headers.insert(key, value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}
