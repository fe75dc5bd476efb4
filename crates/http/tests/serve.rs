use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use serde_json::{Value, json};
use sluice_core::Response;
use sluice_engine::{App, RuntimeEngine, ServeConfig};
use sluice_http::{ServeError, serve_http, serve_listener};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

struct Server {
    addr: SocketAddr,
    stop: oneshot::Sender<()>,
    handle: JoinHandle<Result<(), ServeError>>,
}

impl Server {
    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    async fn stop(self) -> Result<(), ServeError> {
        let _ = self.stop.send(());
        self.handle.await.unwrap()
    }
}

async fn spawn_server<C: Send + Sync + 'static>(engine: RuntimeEngine<C>) -> Server {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop, stopped) = oneshot::channel::<()>();
    let handle = tokio::spawn(serve_listener(Arc::new(engine), listener, async move {
        let _ = stopped.await;
    }));
    Server { addr, stop, handle }
}

fn config(workers: usize, queue_capacity: usize) -> ServeConfig {
    ServeConfig {
        host: "127.0.0.1".to_string(),
        workers,
        queue_capacity,
        ..ServeConfig::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn echo_round_trip_over_http() {
    let engine = App::new("echo")
        .init(|| Ok(json!({"model": "echo"})))
        .unwrap()
        .handler("/", |ctx: &Value, req| {
            assert_eq!(ctx["model"], "echo");
            Ok(Response::ok(json!({ "outputs": req.json["prompt"] })))
        })
        .unwrap()
        .with_config(config(1, 8))
        .start()
        .await
        .unwrap();
    let server = spawn_server(engine).await;

    let response = reqwest::Client::new()
        .post(server.url("/"))
        .json(&json!({"prompt": "hi"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.headers()["x-endpoint-type"], "handler");
    let body: Value = response.json().await.unwrap();
    assert_eq!(body, json!({"outputs": "hi"}));

    server.stop().await.unwrap();
}

#[derive(Default)]
struct Gauge {
    active: AtomicUsize,
    peak: AtomicUsize,
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_never_exceed_worker_count() {
    let engine = App::new("gauge")
        .init(|| Ok(Gauge::default()))
        .unwrap()
        .handler("/", |gauge: &Gauge, _| {
            let now = gauge.active.fetch_add(1, Ordering::SeqCst) + 1;
            gauge.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(20));
            gauge.active.fetch_sub(1, Ordering::SeqCst);
            Ok(Response::ok(json!({})))
        })
        .unwrap()
        .with_config(config(2, 64))
        .start()
        .await
        .unwrap();
    let gauge = engine.context();
    let server = spawn_server(engine).await;

    let client = reqwest::Client::new();
    let calls: Vec<_> = (0..12)
        .map(|_| {
            let request = client.post(server.url("/")).json(&json!({})).send();
            tokio::spawn(async move { request.await.map(|r| r.status().as_u16()) })
        })
        .collect();
    for call in calls {
        assert_eq!(call.await.unwrap().unwrap(), 200);
    }

    assert!(gauge.peak.load(Ordering::SeqCst) <= 2);
    server.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn second_caller_waits_for_first_with_single_slot_queue() {
    let engine = App::new("slow")
        .init(|| Ok(()))
        .unwrap()
        .handler("/", |_, _| {
            std::thread::sleep(Duration::from_millis(200));
            Ok(Response::ok(json!({"done": true})))
        })
        .unwrap()
        .with_config(config(1, 1))
        .start()
        .await
        .unwrap();
    let server = spawn_server(engine).await;
    let client = reqwest::Client::new();

    let started = Instant::now();
    let first = tokio::spawn(client.post(server.url("/")).json(&json!({})).send());
    tokio::time::sleep(Duration::from_millis(20)).await;
    let second = tokio::spawn(client.post(server.url("/")).json(&json!({})).send());

    assert_eq!(first.await.unwrap().unwrap().status().as_u16(), 200);
    assert_eq!(second.await.unwrap().unwrap().status().as_u16(), 200);
    assert!(started.elapsed() >= Duration::from_millis(400));

    server.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn background_route_acks_and_webhook_gets_result() {
    let (hook_url, mut hook_rx) = spawn_hook().await;

    let engine = App::new("train")
        .init(|| Ok(()))
        .unwrap()
        .background_with_webhook("/train", &hook_url, |_, req| {
            std::thread::sleep(Duration::from_millis(500));
            Ok(Response::ok(json!({"trained": req.json["dataset"]})))
        })
        .unwrap()
        .with_config(config(1, 8))
        .start()
        .await
        .unwrap();
    let server = spawn_server(engine).await;

    let started = Instant::now();
    let response = reqwest::Client::new()
        .post(server.url("/train"))
        .json(&json!({"dataset": "mnist"}))
        .send()
        .await
        .unwrap();
    let elapsed = started.elapsed();
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.headers()["x-endpoint-type"], "background");
    assert_eq!(response.json::<Value>().await.unwrap(), json!({"success": true}));
    assert!(elapsed < Duration::from_millis(250), "ack took {:?}", elapsed);

    let delivered = tokio::time::timeout(Duration::from_secs(5), hook_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(delivered, json!({"trained": "mnist"}));

    server.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_init_never_binds() {
    let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = probe.local_addr().unwrap().port();
    drop(probe);

    let ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ran);
    let app = App::<()>::new("broken")
        .init(|| anyhow::bail!("cuda device not found"))
        .unwrap()
        .handler("/", move |_, _| {
            flag.store(true, Ordering::SeqCst);
            Ok(Response::ok(json!({})))
        })
        .unwrap()
        .with_config(ServeConfig {
            port,
            ..config(1, 8)
        });

    let result = serve_http(app).await;
    assert!(matches!(result, Err(ServeError::Startup(_))));
    assert!(!ran.load(Ordering::SeqCst));
    assert!(std::net::TcpListener::bind(("127.0.0.1", port)).is_ok());
}

async fn spawn_hook() -> (String, tokio::sync::mpsc::UnboundedReceiver<Value>) {
    let (hook_tx, hook_rx) = tokio::sync::mpsc::unbounded_channel::<Value>();
    let hook = axum::Router::new().route(
        "/done",
        axum::routing::post(move |axum::Json(body): axum::Json<Value>| {
            let hook_tx = hook_tx.clone();
            async move {
                let _ = hook_tx.send(body);
            }
        }),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/done", listener.local_addr().unwrap());
    tokio::spawn(async move {
        axum::serve(listener, hook).await.unwrap();
    });
    (url, hook_rx)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_lets_queued_background_jobs_finish() {
    let (hook_url, mut hook_rx) = spawn_hook().await;
    let finished = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&finished);
    let engine = App::new("drain")
        .init(|| Ok(()))
        .unwrap()
        .background_with_webhook("/work", &hook_url, move |_, req| {
            std::thread::sleep(Duration::from_millis(100));
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Response::ok(json!({"batch": req.json["batch"]})))
        })
        .unwrap()
        .with_config(config(1, 8))
        .start()
        .await
        .unwrap();
    let server = spawn_server(engine).await;

    let client = reqwest::Client::new();
    for batch in 0..3 {
        let response = client
            .post(server.url("/work"))
            .json(&json!({"batch": batch}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 200);
    }

    server.stop().await.unwrap();
    assert_eq!(finished.load(Ordering::SeqCst), 3);

    let mut batches = Vec::new();
    while let Ok(body) = hook_rx.try_recv() {
        batches.push(body["batch"].as_i64().unwrap());
    }
    batches.sort();
    assert_eq!(batches, vec![0, 1, 2]);
}
