//! Error types for the scraper.

use thiserror::Error;

/// Result type alias for scrape operations.
pub type Result<T> = std::result::Result<T, ScrapeError>;

/// Errors that can occur while planning or running a scrape.
#[derive(Error, Debug)]
pub enum ScrapeError {
    /// Invalid or incomplete configuration. Fatal before any scraping starts.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// File system error (cache, keyword file, output file).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP request failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// URL parsing error.
    #[error("URL parsing error: {0}")]
    UrlParse(#[from] url::ParseError),

    /// Failed to parse a result page.
    #[error("Failed to parse response: {0}")]
    Parse(String),

    /// Durable store error.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Browser automation error.
    #[error("Browser error: {0}")]
    Browser(String),

    /// Proxy list or proxy probe error.
    #[error("Proxy error: {0}")]
    Proxy(String),

    /// No parser or engine profile for this name.
    #[error("Unknown search engine '{0}'")]
    UnknownEngine(String),

    /// The result sink stopped accepting SERPs.
    #[error("Result sink failed: {0}")]
    Sink(String),

    /// The run was cancelled by the operator.
    #[error("Scrape cancelled")]
    Cancelled,

    /// The engine blocked the scraper and the run stops on detection.
    #[error("Scraper detected by {0}")]
    Detected(String),

    /// Generic error.
    #[error("{0}")]
    Other(String),
}

impl ScrapeError {
    /// Whether this error must abort the process before scraping starts.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_) | Self::UnknownEngine(_))
    }
}
