//! # a3s-serp
//!
//! A search engine results page scraper.
//!
//! Queries are expanded into jobs (query × engine × page), partitioned over
//! workers and fetched through one of three transports:
//!
//! - `http`: one blocking request at a time per worker
//! - `http-async`: many requests in flight on a single loop
//! - `selenium`: a driven headless Chrome per worker
//!
//! Every fetched page is cached on disk, parsed into a SERP with ranked
//! links and handed to a sink that commits it to SQLite and streams it to
//! stdout, CSV or JSON.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use a3s_serp::{build_jobs, DefaultTransportFactory, ScrapeConfig, Scheduler, SerpStore};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ScrapeConfig {
//!         keyword: Some("rust programming".to_string()),
//!         search_engines: vec!["bing".to_string(), "duckduckgo".to_string()],
//!         ..Default::default()
//!     };
//!     config.validate()?;
//!
//!     let jobs = build_jobs(&config)?;
//!     let store = Arc::new(SerpStore::connect(&config.database_url).await?);
//!     let factory = Arc::new(DefaultTransportFactory::from_config(&config));
//!     let report = Scheduler::new(Arc::new(config), factory, store).run(jobs).await?;
//!
//!     println!("{}", report.summary());
//!     Ok(())
//! }
//! ```

mod error;
mod pacing;
mod user_agents;

pub mod cache;
pub mod config;
pub mod engine;
pub mod engines;
pub mod fetcher;
pub mod fetcher_http;
pub mod job;
pub mod proxy;
pub mod scheduler;
pub mod serp;
pub mod sink;
pub mod worker;

#[cfg(feature = "headless")]
pub mod browser;
#[cfg(feature = "headless")]
pub mod browser_setup;
#[cfg(feature = "headless")]
pub mod captcha;

pub use cache::{CacheLookup, CacheStore, Fingerprint};
pub use config::{LogFormat, OutputTarget, ScrapeConfig};
pub use engine::{SearchEngine, SearchType};
pub use error::{Result, ScrapeError};
pub use fetcher::{
    DefaultTransportFactory, DenialResolution, FetchOutcome, RawResponse, ScrapeMethod, Transport,
    TransportFactory,
};
pub use job::{build_jobs, Job, JobState};
pub use pacing::SleepRanges;
pub use proxy::{Proxy, ProxyPool};
pub use scheduler::{RunReport, Scheduler, Simulation};
pub use serp::{Link, LinkType, ParsedSerp, ScraperRun, Serp, SerpStatus};
pub use sink::{OutputWriter, SerpSink, SerpStore, CSV_HEADER};
pub use user_agents::random_user_agent;
