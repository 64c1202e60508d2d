use std::time::Duration;

use rebound_core::error::{AppError, ErrorKind};
use rebound_core::models::{FetchRequest, HttpMethod};

use crate::common::{FLAKY_FAILURES, Hits, TEST_USER_AGENT, fast_fetcher, spawn_server};

#[tokio::test]
async fn anti_bot_statuses_are_retried_until_success() {
    let server = spawn_server().await;

    let result = fast_fetcher()
        .fetch(&FetchRequest::get(server.url("/flaky")))
        .await
        .unwrap();

    assert_eq!(result.status, 200);
    assert!(result.text().contains("class=\"item\""));
    assert_eq!(Hits::get(&server.hits.flaky), FLAKY_FAILURES + 1);
}

#[tokio::test]
async fn status_budget_exhaustion_returns_last_response() {
    let server = spawn_server().await;

    let err = fast_fetcher()
        .fetch(&FetchRequest::get(server.url("/blocked")).with_status_retry_budget(1))
        .await
        .unwrap_err();

    match err {
        AppError::Blocked { result, attempts } => {
            assert_eq!(result.status, 503);
            assert_eq!(result.text(), "maintenance");
            assert_eq!(attempts, 3);
        }
        other => panic!("expected Blocked, got {other:?}"),
    }
    assert_eq!(Hits::get(&server.hits.blocked), 3);
}

#[tokio::test]
async fn other_error_statuses_are_not_retried() {
    let server = spawn_server().await;

    let err = fast_fetcher()
        .fetch(&FetchRequest::get(server.url("/missing")))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::HttpError);
    assert_eq!(err.fetch_result().map(|r| r.status), Some(404));
    assert_eq!(Hits::get(&server.hits.missing), 1);
}

#[tokio::test]
async fn query_form_and_identity_reach_the_wire() {
    let server = spawn_server().await;

    let request = FetchRequest::new(HttpMethod::Post, server.url("/echo"))
        .with_query("q", "rust")
        .with_query("page", "2")
        .with_form("sort", "asc")
        .with_form("limit", "10")
        .with_header("X-Trace", "abc123");
    let result = fast_fetcher().fetch(&request).await.unwrap();
    let echo: serde_json::Value = serde_json::from_slice(&result.body).unwrap();

    assert_eq!(echo["method"], "POST");
    assert_eq!(echo["user_agent"], TEST_USER_AGENT);
    assert_eq!(echo["x_trace"], "abc123");
    assert_eq!(echo["query"], "q=rust&page=2");
    assert_eq!(echo["body"], "sort=asc&limit=10");
    assert_eq!(echo["content_type"], "application/x-www-form-urlencoded");
    assert_eq!(
        result.content_type().as_deref(),
        Some("application/json")
    );
}

#[tokio::test]
async fn caller_user_agent_overrides_identity() {
    let server = spawn_server().await;

    let request = FetchRequest::get(server.url("/echo")).with_header("user-agent", "pinned/9.9");
    let result = fast_fetcher().fetch(&request).await.unwrap();
    let echo: serde_json::Value = serde_json::from_slice(&result.body).unwrap();

    assert_eq!(echo["user_agent"], "pinned/9.9");
    assert_eq!(echo["method"], "GET");
}

#[tokio::test]
async fn per_attempt_timeout_surfaces_after_retries() {
    let server = spawn_server().await;

    let started = std::time::Instant::now();
    let err = fast_fetcher()
        .fetch(&FetchRequest::get(server.url("/slow")).with_timeout(Duration::from_millis(200)))
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::Timeout(d) if d == Duration::from_millis(200)), "got {err:?}");
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn unreachable_host_is_a_network_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let err = fast_fetcher()
        .fetch(&FetchRequest::get(format!("http://127.0.0.1:{port}/")))
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::NetworkError(_)), "got {err:?}");
}
