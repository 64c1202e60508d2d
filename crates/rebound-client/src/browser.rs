use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chromiumoxide::cdp::browser_protocol::emulation::SetUserAgentOverrideParams;
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use rebound_core::error::AppError;
use rebound_core::identity::IdentityProvider;
use rebound_core::traits::PageSource;

/// Headless Chromium page source via the Chrome DevTools Protocol.
///
/// Renders JavaScript before returning the DOM, for pages whose items only
/// exist after client-side rendering. Feed the result to
/// [`crate::extractor::extract_html`].
///
/// One Chromium process is shared by all clones. Each call opens a tab,
/// reads the rendered HTML and closes the tab again, also when rendering
/// fails or times out. With [`with_identities`](Self::with_identities) every
/// tab presents a freshly drawn user agent.
///
/// # Example
///
/// ```rust,no_run
/// use rebound_client::BrowserPageSource;
/// use rebound_client::extractor::extract_html;
/// use rebound_core::{ExtractionSchema, PageSource};
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let source = BrowserPageSource::new().await?;
/// let html = source.page_source("https://example.com").await?;
/// let schema = ExtractionSchema::new("article").with_field("title", "h2");
/// let extraction = extract_html(&html, &schema, 200)?;
/// println!("{} items", extraction.items.len());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct BrowserPageSource {
    browser: Arc<Browser>,
    timeout: Duration,
    identities: Option<Arc<IdentityProvider>>,
}

impl BrowserPageSource {
    /// Launch headless Chromium with a 30 s navigation timeout.
    pub async fn new() -> Result<Self, AppError> {
        Self::with_timeout(Duration::from_secs(30)).await
    }

    pub async fn with_timeout(timeout: Duration) -> Result<Self, AppError> {
        let mut builder = BrowserConfig::builder().no_sandbox().disable_default_args();

        if let Some(bin) = find_chrome_binary() {
            tracing::info!(binary = %bin.display(), "Using Chrome binary");
            builder = builder.chrome_executable(bin);
        }

        let config = builder
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--no-first-run")
            .build()
            .map_err(|e| AppError::BrowserError(format!("Browser config error: {e}")))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| AppError::BrowserError(format!("Failed to launch browser: {e}")))?;

        // The CDP handler must be polled for the connection to make progress.
        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    tracing::warn!(error = %e, "Browser CDP handler error");
                    break;
                }
            }
        });

        Ok(Self {
            browser: Arc::new(browser),
            timeout,
            identities: None,
        })
    }

    /// Rotate the tab user agent through `identities`. Proxies are not
    /// applied; Chromium takes its proxy at launch.
    pub fn with_identities(mut self, identities: Arc<IdentityProvider>) -> Self {
        self.identities = Some(identities);
        self
    }

    fn next_user_agent(&self) -> Option<String> {
        self.identities
            .as_ref()
            .map(|identities| identities.next().user_agent)
    }

    async fn render(&self, page: &Page, url: &str) -> Result<String, AppError> {
        if let Some(user_agent) = self.next_user_agent() {
            page.set_user_agent(SetUserAgentOverrideParams::new(user_agent))
                .await
                .map_err(|e| AppError::BrowserError(format!("Failed to set user agent: {e}")))?;
        }

        page.goto(url)
            .await
            .map_err(|e| AppError::BrowserError(format!("Failed to navigate to {url}: {e}")))?;

        page.find_element("body")
            .await
            .map_err(|e| AppError::BrowserError(format!("Page did not render body: {e}")))?;

        page.content()
            .await
            .map_err(|e| AppError::BrowserError(format!("Failed to read page content: {e}")))
    }
}

/// `CHROME_BIN`, then well-known install locations. The snap wrapper strips
/// headless flags, so the binary inside the snap is preferred.
fn find_chrome_binary() -> Option<PathBuf> {
    if let Ok(p) = std::env::var("CHROME_BIN") {
        let path = PathBuf::from(p);
        if path.exists() {
            return Some(path);
        }
    }

    [
        "/snap/chromium/current/usr/lib/chromium-browser/chrome",
        "/usr/bin/google-chrome-stable",
        "/usr/bin/google-chrome",
        "/usr/bin/chromium",
        "/usr/bin/chromium-browser",
    ]
    .iter()
    .map(PathBuf::from)
    .find(|p| p.exists())
}

impl PageSource for BrowserPageSource {
    async fn page_source(&self, url: &str) -> Result<String, AppError> {
        let page = tokio::time::timeout(self.timeout, self.browser.new_page("about:blank"))
            .await
            .map_err(|_| AppError::Timeout(self.timeout))?
            .map_err(|e| AppError::BrowserError(format!("Failed to open tab: {e}")))?;

        let rendered = tokio::time::timeout(self.timeout, self.render(&page, url))
            .await
            .unwrap_or(Err(AppError::Timeout(self.timeout)));

        if let Err(e) = page.close().await {
            tracing::debug!(error = %e, "Failed to close browser tab");
        }
        rendered
    }
}
