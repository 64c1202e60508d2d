use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default number of extra cycles allowed for anti-bot status codes.
pub const DEFAULT_STATUS_RETRY_BUDGET: u32 = 3;

/// HTTP verb for a [`FetchRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Head => "HEAD",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "PATCH" => Ok(HttpMethod::Patch),
            "DELETE" => Ok(HttpMethod::Delete),
            "HEAD" => Ok(HttpMethod::Head),
            _ => Err(format!("Unknown HTTP method: {}", s)),
        }
    }
}

/// Header map with case-insensitive names.
///
/// Names are stored lowercased; insertion order is not preserved.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Headers(BTreeMap<String, String>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a header.
    pub fn insert(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        self.0
            .insert(name.as_ref().trim().to_ascii_lowercase(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .get(&name.trim().to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Copy every header of `other` that is not already present here.
    pub fn merge_missing(&mut self, other: &Headers) {
        for (name, value) in other.iter() {
            if !self.contains(name) {
                self.insert(name, value);
            }
        }
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (k, v) in iter {
            headers.insert(k, v);
        }
        headers
    }
}

/// A logical request handed to the resilient fetcher.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub method: HttpMethod,
    pub url: String,
    /// Query-string parameters. Order is kept but carries no meaning.
    pub query: Vec<(String, String)>,
    /// Form-encoded body parameters.
    pub form: Vec<(String, String)>,
    /// Caller headers; these win over identity headers on conflict.
    pub headers: Headers,
    /// Per-attempt timeout. `None` lets the retry policy inject its default.
    pub timeout: Option<Duration>,
    /// Extra cycles allowed purely for anti-bot status codes.
    pub status_retry_budget: u32,
}

impl FetchRequest {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            query: Vec::new(),
            form: Vec::new(),
            headers: Headers::new(),
            timeout: None,
            status_retry_budget: DEFAULT_STATUS_RETRY_BUDGET,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Post, url)
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn with_form(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.form.push((key.into(), value.into()));
        self
    }

    pub fn with_header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_status_retry_budget(mut self, budget: u32) -> Self {
        self.status_retry_budget = budget;
        self
    }
}

/// Raw response of one successful transport round-trip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetchResult {
    pub status: u16,
    pub headers: Headers,
    #[serde(skip)]
    pub body: Vec<u8>,
}

impl FetchResult {
    pub fn new(status: u16, headers: Headers, body: Vec<u8>) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    /// Declared `Content-Type`, lowercased, if any.
    pub fn content_type(&self) -> Option<String> {
        self.headers
            .get("content-type")
            .map(|ct| ct.trim().to_ascii_lowercase())
            .filter(|ct| !ct.is_empty())
    }

    /// Body decoded as UTF-8, replacing invalid sequences.
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    pub fn is_error_status(&self) -> bool {
        self.status >= 400
    }
}

/// Declarative mapping from output fields to markup selectors.
///
/// Each field expression is either a CSS selector evaluated inside the item
/// container, or `attr:<name>` to read an attribute of the container itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionSchema {
    #[serde(default)]
    pub list_selector: Option<String>,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

impl ExtractionSchema {
    pub fn new(list_selector: impl Into<String>) -> Self {
        Self {
            list_selector: Some(list_selector.into()),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, expr: impl Into<String>) -> Self {
        self.fields.insert(name.into(), expr.into());
        self
    }
}

/// One extracted record: field name to string (or null for HTML items).
pub type ExtractedItem = serde_json::Map<String, serde_json::Value>;

/// Which parsing path produced an [`Extraction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionSource {
    Structured,
    Semistructured,
}

impl ExtractionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractionSource::Structured => "structured",
            ExtractionSource::Semistructured => "semistructured",
        }
    }
}

impl fmt::Display for ExtractionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of running an extractor over a response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Extraction {
    pub source: ExtractionSource,
    pub items: Vec<serde_json::Value>,
    pub status_code: u16,
}
