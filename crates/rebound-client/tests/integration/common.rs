use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::extract::{RawQuery, State};
use axum::http::{HeaderMap, Method, StatusCode, header};
use axum::response::{Html, IntoResponse};
use axum::routing::{any, get};
use serde_json::json;
use tracing_subscriber::EnvFilter;

use rebound_client::ReqwestTransport;
use rebound_core::backoff::BackoffPolicy;
use rebound_core::error::ErrorKind;
use rebound_core::fetcher::{ResilientFetcher, StatusBackoff};
use rebound_core::identity::IdentityProvider;
use rebound_core::rate_limit::RateLimiter;

pub const TEST_USER_AGENT: &str = "rebound-test/1.0";

/// 429 responses served by `/flaky` before it starts answering 200.
pub const FLAKY_FAILURES: usize = 2;

pub const PRODUCTS_HTML: &str = r#"<!doctype html>
<html><body>
  <ul>
    <li class="item" data-id="1"><a href="/p/1">First</a><span class="price">9.99</span></li>
    <li class="item" data-id="2"><a href="/p/2">Second</a></li>
  </ul>
</body></html>"#;

#[derive(Default)]
pub struct Hits {
    pub flaky: AtomicUsize,
    pub blocked: AtomicUsize,
    pub missing: AtomicUsize,
}

impl Hits {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

pub struct TestServer {
    pub base_url: String,
    pub hits: Arc<Hits>,
}

impl TestServer {
    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

/// Route fetcher logs to the test harness; `RUST_LOG` selects the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Bind a local axum server on an ephemeral port and serve it in the background.
pub async fn spawn_server() -> TestServer {
    init_tracing();
    let hits = Arc::new(Hits::default());

    let app = Router::new()
        .route("/flaky", get(flaky))
        .route("/blocked", get(blocked))
        .route("/missing", get(missing))
        .route("/slow", get(slow))
        .route("/products", get(products))
        .route("/api/items", get(api_items))
        .route("/echo", any(echo))
        .with_state(hits.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind test server");
    let addr = listener.local_addr().expect("Failed to read local addr");

    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("Test server failed");
    });

    TestServer {
        base_url: format!("http://{addr}"),
        hits,
    }
}

/// Fetcher wired for fast tests: no pacing, millisecond backoffs.
pub fn fast_fetcher() -> ResilientFetcher<ReqwestTransport> {
    let transport = ReqwestTransport::new().expect("Failed to build transport");
    ResilientFetcher::new(
        transport,
        Arc::new(RateLimiter::new(100.0, 20)),
        Arc::new(IdentityProvider::new(vec![TEST_USER_AGENT.to_string()], Vec::new())),
    )
    .with_pacing(Duration::ZERO, Duration::ZERO)
    .with_backoff(
        BackoffPolicy::new([ErrorKind::Transport])
            .with_tries(2)
            .with_base_delay(Duration::from_millis(10))
            .with_jitter(Duration::ZERO)
            .with_default_timeout(Some(Duration::from_secs(5))),
    )
    .with_status_backoff(StatusBackoff {
        base_delay: Duration::from_millis(10),
        jitter_max: Duration::ZERO,
        max_delay: Duration::from_millis(100),
    })
}

async fn flaky(State(hits): State<Arc<Hits>>) -> impl IntoResponse {
    let n = hits.flaky.fetch_add(1, Ordering::SeqCst);
    if n < FLAKY_FAILURES {
        (StatusCode::TOO_MANY_REQUESTS, Html("slow down".to_string()))
    } else {
        (StatusCode::OK, Html(PRODUCTS_HTML.to_string()))
    }
}

async fn blocked(State(hits): State<Arc<Hits>>) -> impl IntoResponse {
    hits.blocked.fetch_add(1, Ordering::SeqCst);
    (StatusCode::SERVICE_UNAVAILABLE, "maintenance")
}

async fn missing(State(hits): State<Arc<Hits>>) -> impl IntoResponse {
    hits.missing.fetch_add(1, Ordering::SeqCst);
    (StatusCode::NOT_FOUND, "no such page")
}

async fn slow() -> impl IntoResponse {
    tokio::time::sleep(Duration::from_secs(3)).await;
    "too late"
}

async fn products() -> Html<&'static str> {
    Html(PRODUCTS_HTML)
}

async fn api_items() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "application/json; charset=utf-8")],
        json!({"results": [{"id": 1, "name": "First"}, {"id": 2, "name": "Second"}]})
            .to_string(),
    )
}

async fn echo(
    method: Method,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    body: String,
) -> Json<serde_json::Value> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    Json(json!({
        "method": method.as_str(),
        "user_agent": header("user-agent"),
        "content_type": header("content-type"),
        "x_trace": header("x-trace"),
        "query": query,
        "body": body,
    }))
}
