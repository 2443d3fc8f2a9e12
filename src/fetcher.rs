//! Transport abstraction for retrieving result pages.
//!
//! A transport turns one [`Job`] into a [`FetchOutcome`]. Three
//! implementations share this contract: blocking HTTP, cooperative async
//! HTTP and the driven browser. Each instance is bound to at most one
//! proxy for its lifetime unless the owner explicitly switches it.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ScrapeConfig;
use crate::engine::SearchType;
use crate::job::Job;
use crate::proxy::Proxy;
use crate::{Result, ScrapeError};

/// How requests reach the search engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ScrapeMethod {
    /// One request at a time per worker.
    #[default]
    #[serde(rename = "http")]
    Http,
    /// Many requests in flight on a single scheduler loop.
    #[serde(rename = "http-async")]
    HttpAsync,
    /// A driven browser, one instance per worker.
    #[serde(rename = "selenium")]
    Selenium,
}

impl ScrapeMethod {
    /// Tag stored with SERPs and mixed into cache fingerprints.
    pub fn tag(&self) -> &'static str {
        match self {
            ScrapeMethod::Http => "http",
            ScrapeMethod::HttpAsync => "http-async",
            ScrapeMethod::Selenium => "selenium",
        }
    }

    /// Whether requests go out as plain GET requests.
    pub fn is_http(&self) -> bool {
        !matches!(self, ScrapeMethod::Selenium)
    }
}

impl fmt::Display for ScrapeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for ScrapeMethod {
    type Err = ScrapeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "http" => Ok(ScrapeMethod::Http),
            "http-async" | "http_async" | "async" => Ok(ScrapeMethod::HttpAsync),
            "selenium" | "browser" => Ok(ScrapeMethod::Selenium),
            other => Err(ScrapeError::Config(format!(
                "scrape_method must be one of http, http-async, selenium (got '{}')",
                other
            ))),
        }
    }
}

/// Request shaping shared by every transport of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchSettings {
    pub request_timeout: Duration,
    pub num_results_per_page: u32,
    pub search_type: SearchType,
}

impl FetchSettings {
    pub fn from_config(config: &ScrapeConfig) -> Self {
        Self {
            request_timeout: config.request_timeout(),
            num_results_per_page: config.num_results_per_page,
            search_type: config.search_type,
        }
    }
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            num_results_per_page: 10,
            search_type: SearchType::Normal,
        }
    }
}

/// A successfully retrieved result page.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub body: Vec<u8>,
    pub status: u16,
    pub requested_at: DateTime<Utc>,
    /// URL after redirects (or the browser's current URL).
    pub url: String,
    pub method: ScrapeMethod,
    /// The engine reported that no further pages exist.
    pub exhausted: bool,
}

impl RawResponse {
    pub fn new(body: impl Into<Vec<u8>>, url: impl Into<String>, method: ScrapeMethod) -> Self {
        Self {
            body: body.into(),
            status: 200,
            requested_at: Utc::now(),
            url: url.into(),
            method,
            exhausted: false,
        }
    }

    /// Body decoded as UTF-8, replacing invalid sequences.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Classification of one fetch attempt.
#[derive(Debug)]
pub enum FetchOutcome {
    /// 2xx response (or a rendered result page).
    Ok(RawResponse),
    /// The engine answered with a blocking page, captcha or non-2xx status.
    Denied { status: Option<u16>, reason: String },
    /// Timeout, reset, DNS failure. Retryable.
    NetworkError(String),
    /// Unrecoverable transport failure; the worker stops.
    StopScraping(String),
    /// The engine ran out of result pages before the requested one.
    /// `last_page` is the final page it actually served.
    PastLastPage { last_page: u32 },
}

impl FetchOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            FetchOutcome::Ok(_) => "ok",
            FetchOutcome::Denied { .. } => "denied",
            FetchOutcome::NetworkError(_) => "network_error",
            FetchOutcome::StopScraping(_) => "stop_scraping",
            FetchOutcome::PastLastPage { .. } => "past_last_page",
        }
    }
}

/// What happened after a transport dealt with a denial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenialResolution {
    /// The block was lifted (captcha solved, operator intervened). Retry the job.
    Resolved,
    /// Nothing could be done; the job fails.
    Unresolved,
    /// The worker is detected and must stop.
    Detected,
}

/// Uniform contract over all transports.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Transport kind.
    fn method(&self) -> ScrapeMethod;

    /// Proxy currently bound to this instance, `None` for the local IP.
    fn proxy(&self) -> Option<Proxy>;

    /// Retrieves the result page for a job.
    async fn fetch(&self, job: &Job) -> FetchOutcome;

    /// Rebinds this instance to another proxy.
    async fn switch_proxy(&self, proxy: Option<Proxy>) -> Result<()>;

    /// Reacts to a denial reported by `fetch` for the same job.
    async fn handle_denied(&self, _job: &Job) -> DenialResolution {
        DenialResolution::Unresolved
    }

    /// Releases resources and aborts outstanding I/O.
    async fn close(&self) {}
}

/// Builds transport instances for workers.
pub trait TransportFactory: Send + Sync {
    /// Creates a transport bound to `proxy` for the worker's lifetime.
    fn create(
        &self,
        method: ScrapeMethod,
        proxy: Option<Proxy>,
        worker_id: usize,
    ) -> Result<Arc<dyn Transport>>;
}

/// Builds the real transports from the run configuration.
pub struct DefaultTransportFactory {
    settings: FetchSettings,
    #[cfg(feature = "headless")]
    browser: crate::browser::BrowserSettings,
    #[cfg(feature = "headless")]
    solver: Arc<dyn crate::captcha::CaptchaSolver>,
}

impl DefaultTransportFactory {
    pub fn from_config(config: &ScrapeConfig) -> Self {
        Self {
            settings: FetchSettings::from_config(config),
            #[cfg(feature = "headless")]
            browser: crate::browser::BrowserSettings::from_config(config),
            #[cfg(feature = "headless")]
            solver: Arc::new(crate::captcha::StdinSolver::new(config.captcha_timeout())),
        }
    }
}

impl TransportFactory for DefaultTransportFactory {
    #[cfg_attr(not(feature = "headless"), allow(unused_variables))]
    fn create(
        &self,
        method: ScrapeMethod,
        proxy: Option<Proxy>,
        worker_id: usize,
    ) -> Result<Arc<dyn Transport>> {
        use crate::fetcher_http::HttpTransport;

        match method {
            ScrapeMethod::Http => Ok(Arc::new(HttpTransport::blocking(
                proxy,
                self.settings.clone(),
            )?)),
            ScrapeMethod::HttpAsync => Ok(Arc::new(HttpTransport::concurrent(
                proxy,
                self.settings.clone(),
            )?)),
            #[cfg(feature = "headless")]
            ScrapeMethod::Selenium => Ok(Arc::new(crate::browser::BrowserTransport::new(
                worker_id,
                proxy,
                self.browser.clone(),
                Arc::clone(&self.solver),
            ))),
            #[cfg(not(feature = "headless"))]
            ScrapeMethod::Selenium => Err(ScrapeError::Config(
                "the selenium transport requires the `headless` feature".to_string(),
            )),
        }
    }
}
