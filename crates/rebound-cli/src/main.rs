mod output;

use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use tracing_subscriber::EnvFilter;

use rebound_client::{ReqwestTransport, SelectorExtractor};
use rebound_core::config::FetchConfig;
use rebound_core::error::AppError;
use rebound_core::fetcher::ResilientFetcher;
use rebound_core::models::{
    DEFAULT_STATUS_RETRY_BUDGET, Extraction, ExtractionSchema, FetchRequest, HttpMethod,
};
use rebound_core::traits::Extractor;

use crate::output::{OutputFormat, UrlExtraction, write_csv, write_json};

#[derive(Parser)]
#[command(
    name = "rebound",
    version,
    about = "Rate-limited, retrying fetcher with schema-driven extraction"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch a single URL and print the response body
    Fetch {
        /// Target URL
        #[arg(short, long)]
        url: String,

        /// HTTP method
        #[arg(short, long, default_value = "GET")]
        method: HttpMethod,

        /// Query parameter as key=value (repeatable)
        #[arg(short, long = "query", value_parser = parse_pair)]
        query: Vec<(String, String)>,

        /// Form body parameter as key=value (repeatable)
        #[arg(short, long = "form", value_parser = parse_pair)]
        form: Vec<(String, String)>,

        /// Request header as 'Name: value' (repeatable)
        #[arg(short = 'H', long = "header", value_parser = parse_header)]
        header: Vec<(String, String)>,

        /// Per-attempt timeout in seconds (defaults to FETCH_TIMEOUT)
        #[arg(long, value_parser = parse_seconds)]
        timeout: Option<Duration>,

        /// Extra cycles allowed for 403/429/503 responses
        #[arg(long, default_value_t = DEFAULT_STATUS_RETRY_BUDGET)]
        status_retries: u32,

        /// Overall deadline in seconds across all retries
        #[arg(long, value_parser = parse_seconds)]
        deadline: Option<Duration>,

        /// Write the body to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Fetch one or more URLs and extract items with CSS selectors
    Extract {
        /// Target URL (repeatable)
        #[arg(short, long = "url", required = true)]
        url: Vec<String>,

        /// JSON file with `list_selector` and `fields`
        #[arg(short, long)]
        schema: Option<PathBuf>,

        /// CSS selector for item containers (overrides the schema file)
        #[arg(short, long)]
        list_selector: Option<String>,

        /// Field as name=expr, where expr is a CSS selector or attr:<name> (repeatable)
        #[arg(long = "field", value_parser = parse_pair)]
        field: Vec<(String, String)>,

        /// Output format
        #[arg(long, value_enum, default_value_t = OutputFormat::Json)]
        format: OutputFormat,

        /// Maximum URLs in flight
        #[arg(short, long, default_value_t = 4)]
        concurrency: usize,

        /// Extra cycles allowed for 403/429/503 responses
        #[arg(long, default_value_t = DEFAULT_STATUS_RETRY_BUDGET)]
        status_retries: u32,

        /// Per-URL deadline in seconds across all retries
        #[arg(long, value_parser = parse_seconds)]
        deadline: Option<Duration>,

        /// Render pages in headless Chromium instead of plain HTTP
        #[cfg(feature = "browser")]
        #[arg(long, default_value_t = false)]
        browser: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("rebound=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = FetchConfig::from_env().context("Invalid fetch configuration")?;

    match cli.command {
        Commands::Fetch {
            url,
            method,
            query,
            form,
            header,
            timeout,
            status_retries,
            deadline,
            output,
        } => {
            let mut request = FetchRequest::new(method, url).with_status_retry_budget(status_retries);
            request.query = query;
            request.form = form;
            for (name, value) in header {
                request.headers.insert(name, value);
            }
            request.timeout = timeout;

            cmd_fetch(&config, &request, deadline, output.as_deref()).await?;
        }
        Commands::Extract {
            url,
            schema,
            list_selector,
            field,
            format,
            concurrency,
            status_retries,
            deadline,
            #[cfg(feature = "browser")]
            browser,
        } => {
            let schema = build_schema(schema.as_deref(), list_selector, field)?;
            let options = ExtractOptions {
                concurrency: concurrency.max(1),
                status_retries,
                deadline,
                #[cfg(feature = "browser")]
                browser,
            };
            cmd_extract(&config, &url, &schema, format, &options).await?;
        }
    }

    Ok(())
}

async fn cmd_fetch(
    config: &FetchConfig,
    request: &FetchRequest,
    deadline: Option<Duration>,
    output: Option<&Path>,
) -> Result<()> {
    let transport = ReqwestTransport::new().context("Failed to create HTTP client")?;
    let fetcher = ResilientFetcher::from_config(transport, config)?;

    tracing::info!(url = %request.url, method = %request.method, "Fetching");
    let result = with_deadline(deadline, fetcher.fetch(request)).await?;

    eprintln!("HTTP {}", result.status);
    for (name, value) in result.headers.iter() {
        eprintln!("{name}: {value}");
    }

    match output {
        Some(path) => {
            std::fs::write(path, &result.body)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            tracing::info!(bytes = result.body.len(), path = %path.display(), "Saved body");
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&result.body)?;
            stdout.flush()?;
        }
    }

    Ok(())
}

struct ExtractOptions {
    concurrency: usize,
    status_retries: u32,
    deadline: Option<Duration>,
    #[cfg(feature = "browser")]
    browser: bool,
}

async fn cmd_extract(
    config: &FetchConfig,
    urls: &[String],
    schema: &ExtractionSchema,
    format: OutputFormat,
    options: &ExtractOptions,
) -> Result<()> {
    let transport = ReqwestTransport::new().context("Failed to create HTTP client")?;
    let fetcher = ResilientFetcher::from_config(transport, config)?;

    #[cfg(feature = "browser")]
    let browser = if options.browser {
        Some(
            rebound_client::BrowserPageSource::new()
                .await
                .context("Failed to launch headless browser")?
                .with_identities(fetcher.identities().clone()),
        )
    } else {
        None
    };

    tracing::info!(
        urls = urls.len(),
        concurrency = options.concurrency,
        "Extracting"
    );

    let mut outcomes: Vec<(usize, String, Result<Extraction, AppError>)> =
        futures::stream::iter(urls.iter().cloned().enumerate())
            .map(|(index, url)| {
                let fetcher = &fetcher;
                #[cfg(feature = "browser")]
                let browser = browser.as_ref();
                async move {
                    #[cfg(feature = "browser")]
                    if let Some(browser) = browser {
                        let outcome = with_deadline(
                            options.deadline,
                            render_one(fetcher, browser, &url, schema),
                        )
                        .await;
                        return (index, url, outcome);
                    }

                    let outcome = with_deadline(
                        options.deadline,
                        extract_one(fetcher, &url, schema, options.status_retries),
                    )
                    .await;
                    (index, url, outcome)
                }
            })
            .buffer_unordered(options.concurrency)
            .collect()
            .await;
    outcomes.sort_by_key(|(index, _, _)| *index);

    let mut extractions = Vec::with_capacity(outcomes.len());
    let mut failed = 0usize;
    for (_, url, outcome) in outcomes {
        match outcome {
            Ok(extraction) => {
                tracing::info!(
                    %url,
                    source = %extraction.source,
                    items = extraction.items.len(),
                    "Extracted"
                );
                extractions.push(UrlExtraction { url, extraction });
            }
            Err(e) => {
                tracing::error!(%url, error = %e, "Extraction failed");
                failed += 1;
            }
        }
    }

    let stdout = std::io::stdout().lock();
    match format {
        OutputFormat::Json => write_json(stdout, &extractions)?,
        OutputFormat::Csv => write_csv(stdout, schema, &extractions)?,
    }

    if failed > 0 {
        bail!("{failed} of {} URLs failed", urls.len());
    }
    Ok(())
}

async fn extract_one(
    fetcher: &ResilientFetcher<ReqwestTransport>,
    url: &str,
    schema: &ExtractionSchema,
    status_retries: u32,
) -> Result<Extraction, AppError> {
    let request = FetchRequest::get(url).with_status_retry_budget(status_retries);
    let result = fetcher.fetch(&request).await?;
    SelectorExtractor.extract(&result, schema)
}

#[cfg(feature = "browser")]
async fn render_one(
    fetcher: &ResilientFetcher<ReqwestTransport>,
    browser: &rebound_client::BrowserPageSource,
    url: &str,
    schema: &ExtractionSchema,
) -> Result<Extraction, AppError> {
    use rebound_core::traits::PageSource;

    fetcher.limiter().admit(1.0).await?;
    let html = browser.page_source(url).await?;
    rebound_client::extract_html(&html, schema, 200)
}

/// Bound `fut` by `deadline`, mapping expiry to [`AppError::Timeout`].
async fn with_deadline<T>(
    deadline: Option<Duration>,
    fut: impl Future<Output = Result<T, AppError>>,
) -> Result<T, AppError> {
    match deadline {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .unwrap_or(Err(AppError::Timeout(limit))),
        None => fut.await,
    }
}

/// Schema file first, then command-line overrides.
fn build_schema(
    path: Option<&Path>,
    list_selector: Option<String>,
    fields: Vec<(String, String)>,
) -> Result<ExtractionSchema> {
    let mut schema = match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read schema file: {}", path.display()))?;
            serde_json::from_str::<ExtractionSchema>(&raw)
                .with_context(|| format!("Invalid schema file: {}", path.display()))?
        }
        None => ExtractionSchema::default(),
    };

    if list_selector.is_some() {
        schema.list_selector = list_selector;
    }
    schema.fields.extend(fields);

    if schema.list_selector.is_none() {
        tracing::warn!("No list selector given; HTML pages will yield no items");
    }
    Ok(schema)
}

fn parse_pair(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty key in '{raw}'"));
    }
    Ok((key.to_string(), value.to_string()))
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected 'Name: value', got '{raw}'"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("empty header name in '{raw}'"));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

fn parse_seconds(raw: &str) -> Result<Duration, String> {
    let secs: f64 = raw
        .trim()
        .parse()
        .map_err(|_| format!("'{raw}' is not a number of seconds"))?;
    if secs <= 0.0 {
        return Err(format!("'{raw}' must be positive"));
    }
    Duration::try_from_secs_f64(secs).map_err(|e| format!("'{raw}': {e}"))
}
