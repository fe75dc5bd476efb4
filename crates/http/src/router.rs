use std::collections::HashMap;
use std::sync::Arc;

use axum::http::header::ALLOW;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::routing::get;
use axum::{
    Json, Router,
    extract::{Request, State},
    response::{IntoResponse, Response},
};
use sluice_engine::{RequestEnvelope, ResponseEnvelope, RuntimeEngine};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

pub const STATUS_PATH: &str = sluice_core::STATUS_ROUTE;

/// Finished jobs listed by the status endpoint.
const RECENT_JOBS: usize = 20;

/// Every `POST /<path>` goes to the dispatcher with route `/<path>`.
pub fn app_router<C: Send + Sync + 'static>(engine: Arc<RuntimeEngine<C>>) -> Router {
    let body_limit = engine.config().max_body_bytes;
    Router::new()
        .route(STATUS_PATH, get(status::<C>))
        .fallback(handle_request::<C>)
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(engine)
}

async fn status<C: Send + Sync + 'static>(
    State(engine): State<Arc<RuntimeEngine<C>>>,
) -> impl IntoResponse {
    Json(engine.status(RECENT_JOBS))
}

async fn handle_request<C: Send + Sync + 'static>(
    State(engine): State<Arc<RuntimeEngine<C>>>,
    request: Request,
) -> Response {
    if request.method() != Method::POST {
        return method_not_allowed(request.method());
    }

    let route = request.uri().path().to_string();
    let mut headers = HashMap::with_capacity(request.headers().len());
    for (key, value) in request.headers().iter() {
        if let Ok(value) = value.to_str() {
            headers.insert(key.as_str().to_string(), value.to_string());
        }
    }

    let limit = engine.config().max_body_bytes;
    let body = match axum::body::to_bytes(request.into_body(), limit).await {
        Ok(bytes) => bytes,
        Err(err) => {
            tracing::debug!("Rejecting body for {}: {}", route, err);
            return into_http_response(ResponseEnvelope::error(
                StatusCode::PAYLOAD_TOO_LARGE.as_u16(),
                format!("request body exceeds {} bytes", limit),
            ));
        }
    };

    let envelope = engine
        .dispatch(RequestEnvelope {
            route,
            headers,
            body,
        })
        .await;
    into_http_response(envelope)
}

fn method_not_allowed(method: &Method) -> Response {
    let mut response = into_http_response(ResponseEnvelope::error(
        StatusCode::METHOD_NOT_ALLOWED.as_u16(),
        format!("method {} not allowed, use POST", method),
    ));
    response
        .headers_mut()
        .insert(ALLOW, HeaderValue::from_static("POST"));
    response
}

fn into_http_response(envelope: ResponseEnvelope) -> Response {
    let status =
        StatusCode::from_u16(envelope.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    let mut headers = HeaderMap::with_capacity(envelope.headers.len());
    for (key, value) in &envelope.headers {
        match (
            HeaderName::try_from(key.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => tracing::warn!("Dropping invalid response header {:?}", key),
        }
    }

    (status, headers, Json(envelope.body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use serde_json::json;
    use sluice_core::{ENDPOINT_TYPE_HEADER, Response as HandlerResponse};
    use sluice_engine::{App, ServeConfig};
    use tower::ServiceExt;

    async fn echo_router(config: ServeConfig) -> Router {
        let engine = App::new("echo")
            .init(|| Ok("echo".to_string()))
            .unwrap()
            .handler("/", |model: &String, req| {
                Ok(HandlerResponse::ok(json!({
                    "model": model,
                    "outputs": req.json["prompt"],
                })))
            })
            .unwrap()
            .background("/jobs/train", |_, _| Ok(HandlerResponse::ok(json!({}))))
            .unwrap()
            .with_config(config)
            .start()
            .await
            .unwrap();
        app_router(Arc::new(engine))
    }

    fn post(path: &str, body: &'static str) -> Request {
        Request::builder()
            .method(Method::POST)
            .uri(path)
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn post_root_reaches_sync_handler() {
        let router = echo_router(ServeConfig::default()).await;
        let response = router.oneshot(post("/", r#"{"prompt":"hi"}"#)).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[ENDPOINT_TYPE_HEADER], "handler");
        assert_eq!(
            response.headers()["content-type"],
            "application/json"
        );
        assert_eq!(
            json_body(response).await,
            json!({"model": "echo", "outputs": "hi"})
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn nested_paths_route_to_background_handlers() {
        let router = echo_router(ServeConfig::default()).await;
        let response = router
            .oneshot(post("/jobs/train/", r#"{"epochs":1}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[ENDPOINT_TYPE_HEADER], "background");
        assert_eq!(json_body(response).await, json!({"success": true}));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unknown_path_is_404_and_bad_json_is_400() {
        let router = echo_router(ServeConfig::default()).await;

        let missing = router
            .clone()
            .oneshot(post("/missing", "{}"))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let malformed = router.oneshot(post("/", "not json")).await.unwrap();
        assert_eq!(malformed.status(), StatusCode::BAD_REQUEST);
        assert!(
            json_body(malformed).await["error"]
                .as_str()
                .unwrap()
                .starts_with("malformed request")
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn non_post_methods_are_rejected() {
        let router = echo_router(ServeConfig::default()).await;
        let request = Request::builder()
            .method(Method::GET)
            .uri("/")
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers()[ALLOW], "POST");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn oversized_body_is_413() {
        let router = echo_router(ServeConfig {
            max_body_bytes: 16,
            ..ServeConfig::default()
        })
        .await;
        let response = router
            .oneshot(post("/", r#"{"prompt":"this body is longer than sixteen bytes"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn status_endpoint_reports_pool_counters() {
        let router = echo_router(ServeConfig {
            workers: 2,
            queue_capacity: 5,
            ..ServeConfig::default()
        })
        .await;
        let ok = router
            .clone()
            .oneshot(post("/", r#"{"prompt":"x"}"#))
            .await
            .unwrap();
        assert_eq!(ok.status(), StatusCode::OK);

        let request = Request::builder()
            .method(Method::GET)
            .uri(STATUS_PATH)
            .body(Body::empty())
            .unwrap();
        let status = json_body(router.oneshot(request).await.unwrap()).await;
        assert_eq!(status["workers"], json!(2));
        assert_eq!(status["queue_capacity"], json!(5));
        assert_eq!(status["completed"], json!(1));
        assert_eq!(status["idle"], json!(true));
        assert_eq!(status["recent"][0]["route"], json!("/"));
        assert_eq!(status["recent"][0]["state"], json!("completed"));
    }

    #[test]
    fn invalid_handler_headers_are_dropped() {
        let envelope = ResponseEnvelope::new(200, json!({}))
            .with_header("X-Good", "yes")
            .with_header("bad header", "no");
        let response = into_http_response(envelope);
        assert_eq!(response.headers()["x-good"], "yes");
        assert_eq!(response.headers().len(), 2);
    }
}
