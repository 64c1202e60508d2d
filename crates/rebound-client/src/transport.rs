use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rebound_core::error::AppError;
use rebound_core::models::{FetchResult, Headers, HttpMethod};
use rebound_core::traits::{Transport, TransportRequest};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, ClientBuilder, Method};
use url::Url;

/// HTTP transport using reqwest.
///
/// Performs exactly one round-trip per [`Transport::send`]; retries, pacing
/// and identity selection live in the fetcher. Every HTTP status is returned
/// as a [`FetchResult`]. Clients are built lazily per proxy and reused across
/// clones so connection pools survive identity rotation.
#[derive(Clone)]
pub struct ReqwestTransport {
    direct: Client,
    proxied: Arc<Mutex<HashMap<String, Client>>>,
    connect_timeout: Duration,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, AppError> {
        Self::with_connect_timeout(Duration::from_secs(10))
    }

    pub fn with_connect_timeout(connect_timeout: Duration) -> Result<Self, AppError> {
        let direct = Self::builder(connect_timeout)
            .build()
            .map_err(|e| AppError::ConfigError(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            direct,
            proxied: Arc::new(Mutex::new(HashMap::new())),
            connect_timeout,
        })
    }

    fn builder(connect_timeout: Duration) -> ClientBuilder {
        Client::builder().connect_timeout(connect_timeout)
    }

    fn lock_proxied(&self) -> MutexGuard<'_, HashMap<String, Client>> {
        self.proxied.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn client_for(&self, proxy: Option<&Url>) -> Result<Client, AppError> {
        let Some(proxy) = proxy else {
            return Ok(self.direct.clone());
        };

        let mut clients = self.lock_proxied();
        if let Some(client) = clients.get(proxy.as_str()) {
            return Ok(client.clone());
        }

        let client = Self::builder(self.connect_timeout)
            .proxy(
                reqwest::Proxy::all(proxy.as_str())
                    .map_err(|e| AppError::ConfigError(format!("Invalid proxy '{proxy}': {e}")))?,
            )
            .build()
            .map_err(|e| AppError::ConfigError(format!("Failed to build proxied client: {e}")))?;
        tracing::debug!(proxy = %proxy, "Built proxied HTTP client");
        clients.insert(proxy.as_str().to_string(), client.clone());
        Ok(client)
    }
}

impl Transport for ReqwestTransport {
    async fn send(&self, request: TransportRequest<'_>) -> Result<FetchResult, AppError> {
        let client = self.client_for(request.proxy)?;

        let mut url = Url::parse(request.url)
            .map_err(|e| AppError::RequestError(format!("Invalid URL '{}': {e}", request.url)))?;
        if !request.query.is_empty() {
            url.query_pairs_mut().extend_pairs(request.query);
        }

        let mut builder = client.request(to_method(request.method), url);
        for (name, value) in request.headers.iter() {
            builder = builder.header(name, value);
        }
        if !request.form.is_empty() {
            let body = url::form_urlencoded::Serializer::new(String::new())
                .extend_pairs(request.form)
                .finish();
            if !request.headers.contains("content-type") {
                builder = builder.header(CONTENT_TYPE, "application/x-www-form-urlencoded");
            }
            builder = builder.body(body);
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| map_send_error(e, request.timeout))?;

        let status = response.status().as_u16();
        let headers: Headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str(), value.to_string()))
            })
            .collect();

        let body = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                AppError::Timeout(request.timeout.unwrap_or_default())
            } else {
                AppError::NetworkError(format!("Failed to read response body: {e}"))
            }
        })?;

        Ok(FetchResult::new(status, headers, body.to_vec()))
    }
}

fn to_method(method: HttpMethod) -> Method {
    match method {
        HttpMethod::Get => Method::GET,
        HttpMethod::Post => Method::POST,
        HttpMethod::Put => Method::PUT,
        HttpMethod::Patch => Method::PATCH,
        HttpMethod::Delete => Method::DELETE,
        HttpMethod::Head => Method::HEAD,
    }
}

fn map_send_error(e: reqwest::Error, timeout: Option<Duration>) -> AppError {
    if e.is_builder() {
        AppError::RequestError(e.to_string())
    } else if e.is_timeout() {
        AppError::Timeout(timeout.unwrap_or_default())
    } else if e.is_connect() || e.is_request() {
        AppError::NetworkError(format!("Connection failed: {e}"))
    } else {
        AppError::RequestError(e.to_string())
    }
}
