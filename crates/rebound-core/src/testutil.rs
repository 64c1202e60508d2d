//! Test doubles shared by the unit tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use url::Url;

use crate::error::AppError;
use crate::fetcher::{FetchEvent, FetchReporter};
use crate::models::{FetchResult, Headers, HttpMethod};
use crate::traits::{Transport, TransportRequest};

pub fn response(status: u16, content_type: &str, body: &str) -> FetchResult {
    let mut headers = Headers::new();
    headers.insert("Content-Type", content_type);
    FetchResult::new(status, headers, body.as_bytes().to_vec())
}

/// Owned copy of a [`TransportRequest`] as seen by [`MockTransport`].
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub method: HttpMethod,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub form: Vec<(String, String)>,
    pub headers: Headers,
    pub proxy: Option<Url>,
    pub timeout: Option<Duration>,
}

/// Transport that replays scripted outcomes in order, then falls back to a
/// default outcome (200 with an empty HTML body unless built with `always`).
#[derive(Clone)]
pub struct MockTransport {
    script: Arc<Mutex<VecDeque<Result<FetchResult, AppError>>>>,
    fallback: FetchResult,
    calls: Arc<Mutex<Vec<RecordedCall>>>,
}

impl MockTransport {
    pub fn new(script: Vec<Result<FetchResult, AppError>>) -> Self {
        Self {
            script: Arc::new(Mutex::new(script.into())),
            fallback: response(200, "text/html", ""),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn always(result: FetchResult) -> Self {
        Self {
            fallback: result,
            ..Self::new(Vec::new())
        }
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }
}

impl Transport for MockTransport {
    async fn send(&self, request: TransportRequest<'_>) -> Result<FetchResult, AppError> {
        self.calls.lock().unwrap().push(RecordedCall {
            method: request.method,
            url: request.url.to_string(),
            query: request.query.to_vec(),
            form: request.form.to_vec(),
            headers: request.headers.clone(),
            proxy: request.proxy.cloned(),
            timeout: request.timeout,
        });
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(self.fallback.clone()))
    }
}

/// Reporter that keeps a compact trace of fetch events.
#[derive(Default)]
pub struct RecordingReporter {
    events: Mutex<Vec<String>>,
}

impl RecordingReporter {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl FetchReporter for RecordingReporter {
    fn report(&self, event: FetchEvent<'_>) {
        let line = match event {
            FetchEvent::Paced { delay, .. } => format!("paced:{}", delay.as_millis()),
            FetchEvent::AttemptStarted { attempt, .. } => format!("attempt:{attempt}"),
            FetchEvent::TransportRetry { attempt, .. } => format!("transport_retry:{attempt}"),
            FetchEvent::StatusBackoff { status, round, .. } => {
                format!("status_backoff:{status}:{round}")
            }
            FetchEvent::Blocked {
                status, attempts, ..
            } => format!("blocked:{status}:{attempts}"),
            FetchEvent::Completed {
                status, attempts, ..
            } => format!("completed:{status}:{attempts}"),
        };
        self.events.lock().unwrap().push(line);
    }
}
