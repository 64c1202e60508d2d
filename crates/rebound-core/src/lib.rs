pub mod backoff;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod identity;
pub mod models;
pub mod rate_limit;
pub mod traits;

#[cfg(test)]
mod testutil;

pub use backoff::{Attempt, BackoffPolicy, Classify, HookError};
pub use config::FetchConfig;
pub use error::{AppError, ErrorKind};
pub use fetcher::{
    ANTI_BOT_STATUSES, FetchEvent, FetchReporter, ResilientFetcher, StatusBackoff,
    TracingFetchReporter, is_anti_bot_status,
};
pub use identity::{Identity, IdentityProvider};
pub use models::{
    DEFAULT_STATUS_RETRY_BUDGET, ExtractedItem, Extraction, ExtractionSchema, ExtractionSource,
    FetchRequest, FetchResult, Headers, HttpMethod,
};
pub use rate_limit::RateLimiter;
pub use traits::{Extractor, PageSource, Transport, TransportRequest};
