use std::path::PathBuf;
use std::time::Duration;

use crate::error::AppError;

/// Fetch engine configuration.
///
/// Every value is optional in the environment and falls back to the defaults
/// below. Present but malformed values are rejected.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchConfig {
    /// `CRAWL_RATE`: tokens per second (default 1.0).
    pub rate: f64,
    /// `CRAWL_BURST`: bucket capacity (default 5).
    pub burst: u32,
    /// `PAGE_DELAY_MIN`: lower pacing bound in seconds (default 0.1).
    pub page_delay_min: Duration,
    /// `PAGE_DELAY_MAX`: upper pacing bound in seconds (default 0.5).
    pub page_delay_max: Duration,
    /// `CRAWL_USER_AGENTS` followed by `USER_AGENTS`.
    pub user_agents: Vec<String>,
    /// `USER_AGENT_FILE` (default `ua_list.txt`).
    pub user_agent_file: PathBuf,
    /// `HTTP_PROXIES`.
    pub proxies: Vec<String>,
    /// `FETCH_TRIES`: transport attempts per status cycle (default 5).
    pub tries: u32,
    /// `FETCH_TIMEOUT`: per-attempt timeout in seconds (default 15).
    pub timeout: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            rate: 1.0,
            burst: 5,
            page_delay_min: Duration::from_millis(100),
            page_delay_max: Duration::from_millis(500),
            user_agents: Vec::new(),
            user_agent_file: PathBuf::from("ua_list.txt"),
            proxies: Vec::new(),
            tries: 5,
            timeout: Duration::from_secs(15),
        }
    }
}

impl FetchConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let rate = match get("CRAWL_RATE") {
            None => defaults.rate,
            Some(raw) => parse_non_negative("CRAWL_RATE", &raw)?,
        };

        let burst = match get("CRAWL_BURST") {
            None => defaults.burst,
            Some(raw) => {
                let parsed: u32 = raw.trim().parse().map_err(|_| {
                    AppError::ConfigError(format!(
                        "Invalid CRAWL_BURST '{raw}': must be a positive integer"
                    ))
                })?;
                if parsed == 0 {
                    return Err(AppError::ConfigError("CRAWL_BURST must be at least 1".into()));
                }
                parsed
            }
        };

        let page_delay_min = match get("PAGE_DELAY_MIN") {
            None => defaults.page_delay_min,
            Some(raw) => Duration::from_secs_f64(parse_non_negative("PAGE_DELAY_MIN", &raw)?),
        };
        let page_delay_max = match get("PAGE_DELAY_MAX") {
            None => defaults.page_delay_max,
            Some(raw) => Duration::from_secs_f64(parse_non_negative("PAGE_DELAY_MAX", &raw)?),
        };

        let mut user_agents = Vec::new();
        for key in ["CRAWL_USER_AGENTS", "USER_AGENTS"] {
            if let Some(raw) = get(key) {
                user_agents.extend(parse_list(&raw));
            }
        }

        let user_agent_file = get("USER_AGENT_FILE")
            .map(|raw| PathBuf::from(raw.trim()))
            .unwrap_or(defaults.user_agent_file);

        let proxies = get("HTTP_PROXIES")
            .map(|raw| parse_list(&raw))
            .unwrap_or_default();

        let tries = match get("FETCH_TRIES") {
            None => defaults.tries,
            Some(raw) => {
                let parsed: u32 = raw.trim().parse().map_err(|_| {
                    AppError::ConfigError(format!(
                        "Invalid FETCH_TRIES '{raw}': must be a positive integer"
                    ))
                })?;
                if parsed == 0 {
                    return Err(AppError::ConfigError("FETCH_TRIES must be at least 1".into()));
                }
                parsed
            }
        };

        let timeout = match get("FETCH_TIMEOUT") {
            None => defaults.timeout,
            Some(raw) => Duration::from_secs_f64(parse_non_negative("FETCH_TIMEOUT", &raw)?),
        };

        Ok(Self {
            rate,
            burst,
            page_delay_min,
            page_delay_max,
            user_agents,
            user_agent_file,
            proxies,
            tries,
            timeout,
        })
    }

    /// Pacing window with its bounds ordered.
    pub fn pacing(&self) -> (Duration, Duration) {
        let lo = self.page_delay_min.min(self.page_delay_max);
        let hi = self.page_delay_min.max(self.page_delay_max);
        (lo, hi)
    }
}

fn parse_non_negative(key: &str, raw: &str) -> Result<f64, AppError> {
    let value: f64 = raw.trim().parse().map_err(|_| {
        AppError::ConfigError(format!("Invalid {key} '{raw}': must be a number"))
    })?;
    if !value.is_finite() || value < 0.0 {
        return Err(AppError::ConfigError(format!(
            "Invalid {key} '{raw}': must be a finite, non-negative number"
        )));
    }
    Ok(value)
}

/// Parse a list value: a JSON array (`["a", "b"]`) or a comma-separated
/// string. Entries are trimmed and blanks dropped.
pub fn parse_list(raw: &str) -> Vec<String> {
    if let Ok(serde_json::Value::Array(values)) = serde_json::from_str::<serde_json::Value>(raw) {
        return values
            .into_iter()
            .map(|v| match v {
                serde_json::Value::String(s) => s.trim().to_string(),
                other => other.to_string(),
            })
            .filter(|s| !s.is_empty())
            .collect();
    }
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
