use std::future::Future;
use std::time::Duration;

use url::Url;

use crate::error::AppError;
use crate::models::{Extraction, ExtractionSchema, FetchResult, Headers, HttpMethod};

/// One concrete outbound HTTP call, identity already applied.
#[derive(Debug, Clone, Copy)]
pub struct TransportRequest<'a> {
    pub method: HttpMethod,
    pub url: &'a str,
    pub query: &'a [(String, String)],
    pub form: &'a [(String, String)],
    pub headers: &'a Headers,
    pub proxy: Option<&'a Url>,
    pub timeout: Option<Duration>,
}

/// Performs a single HTTP round-trip.
///
/// Implementations report connection failures as [`AppError::NetworkError`]
/// and timeouts as [`AppError::Timeout`]; any HTTP status, including error
/// statuses, is a successful round-trip.
pub trait Transport: Send + Sync + Clone {
    fn send(
        &self,
        request: TransportRequest<'_>,
    ) -> impl Future<Output = Result<FetchResult, AppError>> + Send;
}

/// Turns a response into normalized items according to a schema.
pub trait Extractor: Send + Sync + Clone {
    fn extract(&self, result: &FetchResult, schema: &ExtractionSchema)
    -> Result<Extraction, AppError>;
}

/// Supplies rendered page source for a URL (e.g. a headless browser).
pub trait PageSource: Send + Sync + Clone {
    fn page_source(&self, url: &str) -> impl Future<Output = Result<String, AppError>> + Send;
}
