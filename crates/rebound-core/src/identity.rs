//! Client identity rotation (user agent + optional proxy).

use std::path::Path;
use std::sync::{Arc, OnceLock};

use rand::seq::SliceRandom;
use url::Url;

use crate::error::AppError;

/// Used when neither configuration nor the fallback file yields a user agent.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

const PROXY_SCHEMES: &[&str] = &["http", "https", "socks5", "socks5h"];

static GLOBAL_IDENTITIES: OnceLock<Arc<IdentityProvider>> = OnceLock::new();

/// The client identity presented for one transport attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_agent: String,
    /// `None` means a direct connection.
    pub proxy: Option<Url>,
}

/// Read-only pools of user agents and proxies.
///
/// The two pools are sampled independently; the user-agent pool always
/// holds at least one entry.
#[derive(Debug, Clone)]
pub struct IdentityProvider {
    user_agents: Vec<String>,
    proxies: Vec<Url>,
}

impl IdentityProvider {
    /// Build from explicit pools. Blank user agents are dropped and an empty
    /// pool falls back to [`DEFAULT_USER_AGENT`].
    pub fn new(user_agents: Vec<String>, proxies: Vec<Url>) -> Self {
        let mut user_agents: Vec<String> = user_agents
            .into_iter()
            .map(|ua| ua.trim().to_string())
            .filter(|ua| !ua.is_empty())
            .collect();
        if user_agents.is_empty() {
            user_agents.push(DEFAULT_USER_AGENT.to_string());
        }
        Self {
            user_agents,
            proxies,
        }
    }

    /// Resolve the pools from their sources.
    ///
    /// User agents come from `configured` if non-empty, else from
    /// `fallback_file` (one per line), else the built-in default. A missing
    /// or unreadable fallback file is not an error. Every proxy entry must be
    /// a valid proxy URL.
    pub fn from_sources(
        configured: Vec<String>,
        fallback_file: Option<&Path>,
        proxies: &[String],
    ) -> Result<Self, AppError> {
        let mut user_agents: Vec<String> = configured
            .into_iter()
            .filter(|ua| !ua.trim().is_empty())
            .collect();

        if user_agents.is_empty()
            && let Some(path) = fallback_file
        {
            user_agents = load_user_agent_file(path);
            if !user_agents.is_empty() {
                tracing::debug!(
                    path = %path.display(),
                    count = user_agents.len(),
                    "Loaded user agents from fallback file"
                );
            }
        }

        let proxies = proxies
            .iter()
            .map(|raw| parse_proxy(raw))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self::new(user_agents, proxies))
    }

    /// Initialise the process-wide provider. Later calls return the instance
    /// registered by the first one.
    pub fn init_global(provider: IdentityProvider) -> Arc<IdentityProvider> {
        GLOBAL_IDENTITIES
            .get_or_init(|| {
                tracing::info!(
                    user_agents = provider.user_agents.len(),
                    proxies = provider.proxies.len(),
                    "Global identity provider initialized"
                );
                Arc::new(provider)
            })
            .clone()
    }

    pub fn global() -> Option<Arc<IdentityProvider>> {
        GLOBAL_IDENTITIES.get().cloned()
    }

    /// Draw a fresh identity uniformly at random from both pools.
    pub fn next(&self) -> Identity {
        let mut rng = rand::thread_rng();
        let user_agent = self
            .user_agents
            .choose(&mut rng)
            .cloned()
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string());
        let proxy = self.proxies.choose(&mut rng).cloned();
        Identity { user_agent, proxy }
    }

    pub fn user_agents(&self) -> &[String] {
        &self.user_agents
    }

    pub fn proxies(&self) -> &[Url] {
        &self.proxies
    }
}

impl Default for IdentityProvider {
    fn default() -> Self {
        Self::new(Vec::new(), Vec::new())
    }
}

/// Read a user-agent file: one per line, surrounding whitespace trimmed,
/// blank lines ignored. Returns an empty list if the file cannot be read.
pub fn load_user_agent_file(path: &Path) -> Vec<String> {
    match std::fs::read_to_string(path) {
        Ok(contents) => contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect(),
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "User agent file not readable");
            Vec::new()
        }
    }
}

fn parse_proxy(raw: &str) -> Result<Url, AppError> {
    let url = Url::parse(raw.trim())
        .map_err(|e| AppError::ConfigError(format!("Invalid proxy URL '{raw}': {e}")))?;
    if !PROXY_SCHEMES.contains(&url.scheme()) {
        return Err(AppError::ConfigError(format!(
            "Proxy scheme '{}' is not supported (expected one of {})",
            url.scheme(),
            PROXY_SCHEMES.join(", ")
        )));
    }
    if url.host_str().is_none() {
        return Err(AppError::ConfigError(format!("Proxy URL '{raw}' has no host")));
    }
    Ok(url)
}
