use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use refetch::{
    CancellationToken, FetchConfig, FetchController, FetchError, HttpTransport, Transport,
    TransportOptions,
};
use serde_json::{json, Value as JsonValue};

#[derive(Clone)]
struct MockResponse {
    status: StatusCode,
    body: String,
    delay: Duration,
}

impl MockResponse {
    fn json(status: StatusCode, body: JsonValue) -> Self {
        Self {
            status,
            body: body.to_string(),
            delay: Duration::from_millis(0),
        }
    }

    fn raw(status: StatusCode, body: &str) -> Self {
        Self {
            status,
            body: body.to_owned(),
            delay: Duration::from_millis(0),
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[derive(Clone, Debug, Default)]
struct SeenHeaders {
    content_type: Option<String>,
    authorization: Option<String>,
}

#[derive(Clone)]
struct MockState {
    responses: Arc<Mutex<VecDeque<MockResponse>>>,
    hits: Arc<AtomicUsize>,
    headers: Arc<Mutex<Vec<SeenHeaders>>>,
}

async fn get_handler(State(state): State<MockState>, headers: HeaderMap) -> impl IntoResponse {
    state.hits.fetch_add(1, Ordering::SeqCst);

    let header_value = |name: header::HeaderName| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned)
    };
    state
        .headers
        .lock()
        .expect("header log mutex must not be poisoned")
        .push(SeenHeaders {
            content_type: header_value(header::CONTENT_TYPE),
            authorization: header_value(header::AUTHORIZATION),
        });

    let response = {
        let mut queue = state
            .responses
            .lock()
            .expect("response queue mutex must not be poisoned");
        queue.pop_front().unwrap_or_else(|| {
            MockResponse::json(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({"error": "no mock response available"}),
            )
        })
    };

    if !response.delay.is_zero() {
        tokio::time::sleep(response.delay).await;
    }

    (
        response.status,
        [(header::CONTENT_TYPE, "application/json")],
        response.body,
    )
}

struct TestServer {
    base_url: String,
    hits: Arc<AtomicUsize>,
    headers: Arc<Mutex<Vec<SeenHeaders>>>,
    task: tokio::task::JoinHandle<()>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl TestServer {
    fn api_url(&self) -> String {
        format!("{}/api/", self.base_url)
    }

    fn seen_headers(&self) -> Vec<SeenHeaders> {
        self.headers
            .lock()
            .expect("header log mutex must not be poisoned")
            .clone()
    }
}

async fn spawn_server(responses: Vec<MockResponse>) -> TestServer {
    let state = MockState {
        responses: Arc::new(Mutex::new(responses.into())),
        hits: Arc::new(AtomicUsize::new(0)),
        headers: Arc::new(Mutex::new(Vec::new())),
    };

    let app = Router::new()
        .route("/api/posts/:id", get(get_handler))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("must bind test listener");
    let address = listener.local_addr().expect("must have local addr");
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .await
            .expect("mock server must run");
    });

    TestServer {
        base_url: format!("http://{address}"),
        hits: state.hits,
        headers: state.headers,
        task,
    }
}

#[tokio::test]
async fn get_returns_json_payload() {
    let server = spawn_server(vec![MockResponse::json(
        StatusCode::OK,
        json!({ "id": 1, "title": "hello" }),
    )])
    .await;
    let transport = HttpTransport::with_base_url(server.api_url());

    let payload = transport
        .fetch("posts/1", CancellationToken::new())
        .await
        .expect("fetch must succeed");

    assert_eq!(payload, json!({ "id": 1, "title": "hello" }));
    assert_eq!(server.hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn sends_default_and_bearer_headers() {
    let server = spawn_server(vec![
        MockResponse::json(StatusCode::OK, json!({})),
        MockResponse::json(StatusCode::OK, json!({})),
    ])
    .await;

    HttpTransport::with_base_url(server.api_url())
        .fetch("posts/1", CancellationToken::new())
        .await
        .expect("anonymous fetch must succeed");
    HttpTransport::with_base_url(server.api_url())
        .with_bearer_token("abc123")
        .fetch("posts/1", CancellationToken::new())
        .await
        .expect("authorized fetch must succeed");

    let seen = server.seen_headers();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].content_type.as_deref(), Some("application/json"));
    assert_eq!(seen[0].authorization, None);
    assert_eq!(seen[1].authorization.as_deref(), Some("Bearer abc123"));
}

#[tokio::test]
async fn non_success_status_surfaces_http_error() {
    let server = spawn_server(vec![MockResponse::json(
        StatusCode::NOT_FOUND,
        json!({ "error": "no such post" }),
    )])
    .await;
    let transport = HttpTransport::with_base_url(server.api_url());

    let err = transport
        .fetch("posts/404", CancellationToken::new())
        .await
        .expect_err("fetch must fail");

    match err {
        FetchError::Http { status, body } => {
            assert_eq!(status, 404);
            assert!(body.contains("no such post"));
        }
        other => panic!("expected http error, got {other:?}"),
    }
}

#[tokio::test]
async fn invalid_json_surfaces_decode_error() {
    let server = spawn_server(vec![MockResponse::raw(StatusCode::OK, "<html>")]).await;
    let transport = HttpTransport::with_base_url(server.api_url());

    let err = transport
        .fetch("posts/1", CancellationToken::new())
        .await
        .expect_err("fetch must fail");

    assert!(matches!(err, FetchError::Decode(_)));
}

#[tokio::test]
async fn empty_body_decodes_as_null() {
    let server = spawn_server(vec![MockResponse::raw(StatusCode::OK, "")]).await;
    let transport = HttpTransport::with_base_url(server.api_url());

    let payload = transport
        .fetch("posts/1", CancellationToken::new())
        .await
        .expect("fetch must succeed");

    assert_eq!(payload, JsonValue::Null);
}

#[tokio::test]
async fn request_timeout_surfaces_transport_error() {
    let server = spawn_server(vec![MockResponse::json(StatusCode::OK, json!({}))
        .with_delay(Duration::from_millis(150))])
    .await;
    let transport = HttpTransport::new().with_options(TransportOptions {
        base_url: Some(server.api_url()),
        timeout_ms: 20,
        ..TransportOptions::default()
    });

    let err = transport
        .fetch("posts/1", CancellationToken::new())
        .await
        .expect_err("request must timeout");

    match err {
        FetchError::Transport(inner) => assert!(inner.is_timeout()),
        other => panic!("expected transport timeout error, got {other:?}"),
    }
}

#[tokio::test]
async fn cancellation_aborts_pending_request() {
    let server = spawn_server(vec![MockResponse::json(StatusCode::OK, json!({}))
        .with_delay(Duration::from_secs(5))])
    .await;
    let transport = HttpTransport::with_base_url(server.api_url());
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let err = transport
        .fetch("posts/1", cancel)
        .await
        .expect_err("request must be cancelled");

    assert!(err.is_cancelled());
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn controller_retries_over_http_and_transforms() {
    let server = spawn_server(vec![
        MockResponse::json(StatusCode::INTERNAL_SERVER_ERROR, json!({ "error": "boom" })),
        MockResponse::json(StatusCode::OK, json!({ "id": 1, "title": "hello" })),
    ])
    .await;

    let config = FetchConfig::<JsonValue>::new("posts/1")
        .with_retry(2, Duration::from_millis(10))
        .with_transformer(|mut raw| {
            let upper = raw["title"].as_str().unwrap_or_default().to_uppercase();
            raw["title"] = JsonValue::String(upper);
            Ok(raw)
        });
    let controller = FetchController::new(config, HttpTransport::with_base_url(server.api_url()))
        .expect("valid config");

    let state = controller
        .subscribe()
        .wait_for(|state| !state.loading)
        .await
        .expect("state channel must stay open")
        .clone();

    assert!(state.error.is_none());
    assert_eq!(state.data, Some(json!({ "id": 1, "title": "HELLO" })));
    assert_eq!(server.hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn controller_surfaces_http_failure_after_budget() {
    let server = spawn_server(vec![
        MockResponse::json(StatusCode::BAD_GATEWAY, json!({})),
        MockResponse::json(StatusCode::SERVICE_UNAVAILABLE, json!({})),
    ])
    .await;

    let errors = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&errors);
    let config = FetchConfig::<JsonValue>::new("posts/1")
        .with_retry(1, Duration::from_millis(10))
        .with_on_error(move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
        });
    let controller = FetchController::new(config, HttpTransport::with_base_url(server.api_url()))
        .expect("valid config");

    let state = controller
        .subscribe()
        .wait_for(|state| !state.loading)
        .await
        .expect("state channel must stay open")
        .clone();

    assert_eq!(state.error.and_then(|err| err.status()), Some(503));
    assert_eq!(errors.load(Ordering::SeqCst), 1);
    assert_eq!(server.hits.load(Ordering::SeqCst), 2);
}
