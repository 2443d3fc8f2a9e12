//! Result page types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::SearchEngine;
use crate::fetcher::ScrapeMethod;
use crate::job::Job;
use crate::{Result, ScrapeError};

/// Kind of a link on a result page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkType {
    /// Standard web result.
    #[default]
    Organic,
    /// Ad above or below the organic results.
    AdMain,
    /// Ad in the side column.
    AdAside,
    Image,
    News,
    Video,
}

impl LinkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkType::Organic => "organic",
            LinkType::AdMain => "ad_main",
            LinkType::AdAside => "ad_aside",
            LinkType::Image => "image",
            LinkType::News => "news",
            LinkType::Video => "video",
        }
    }
}

impl fmt::Display for LinkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LinkType {
    type Err = ScrapeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "organic" => Ok(LinkType::Organic),
            "ad_main" => Ok(LinkType::AdMain),
            "ad_aside" => Ok(LinkType::AdAside),
            "image" => Ok(LinkType::Image),
            "news" => Ok(LinkType::News),
            "video" => Ok(LinkType::Video),
            other => Err(ScrapeError::Parse(format!("unknown link type '{}'", other))),
        }
    }
}

/// A single link on a result page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    /// 1-based, contiguous within the page.
    pub rank: u32,
    pub title: String,
    pub snippet: String,
    /// Target URL.
    pub link: String,
    /// Host of the target URL.
    pub domain: String,
    /// URL as displayed by the engine.
    pub visible_link: String,
    pub link_type: LinkType,
}

impl Link {
    /// Creates an unranked link. The domain is derived from the URL.
    pub fn new(link_type: LinkType, link: impl Into<String>) -> Self {
        let link = link.into();
        let domain = domain_of(&link);
        Self {
            rank: 0,
            title: String::new(),
            snippet: String::new(),
            link,
            domain,
            visible_link: String::new(),
            link_type,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_snippet(mut self, snippet: impl Into<String>) -> Self {
        self.snippet = snippet.into();
        self
    }

    pub fn with_visible_link(mut self, visible_link: impl Into<String>) -> Self {
        self.visible_link = visible_link.into();
        self
    }
}

/// Host part of a URL, empty when the URL does not parse.
pub fn domain_of(link: &str) -> String {
    url::Url::parse(link)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_default()
}

/// What a parser extracted from one page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedSerp {
    /// Links in the page's main result list; zero when `no_results`.
    pub num_results: u32,
    /// The engine's own result count text, e.g. "About 232.000.000 results".
    pub num_results_for_query: String,
    /// Query the engine actually searched for, when it rewrote the input.
    pub effective_query: String,
    pub no_results: bool,
    /// Page number shown by the engine's pager.
    pub page_number: Option<u32>,
    pub links: Vec<Link>,
}

impl ParsedSerp {
    /// Sets `num_results` from the links of the main result list.
    pub fn count_results(&mut self, primary: LinkType) {
        self.num_results = if self.no_results {
            0
        } else {
            self.links.iter().filter(|l| l.link_type == primary).count() as u32
        };
    }

    /// Links of one kind, in rank order.
    pub fn links_of(&self, link_type: LinkType) -> impl Iterator<Item = &Link> {
        self.links.iter().filter(move |l| l.link_type == link_type)
    }
}

/// Whether the page could be parsed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SerpStatus {
    #[default]
    Successful,
    ParseFailed,
}

impl SerpStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SerpStatus::Successful => "successful",
            SerpStatus::ParseFailed => "parse_failed",
        }
    }
}

impl FromStr for SerpStatus {
    type Err = ScrapeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "successful" => Ok(SerpStatus::Successful),
            "parse_failed" => Ok(SerpStatus::ParseFailed),
            other => Err(ScrapeError::Parse(format!("unknown serp status '{}'", other))),
        }
    }
}

/// One engine's result page for one query, ready for the sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Serp {
    pub run_id: i64,
    pub engine: SearchEngine,
    pub method: ScrapeMethod,
    pub page: u32,
    pub query: String,
    pub requested_at: DateTime<Utc>,
    /// Worker identity that produced the page.
    pub requested_by: String,
    pub num_results: u32,
    pub num_results_for_query: String,
    pub effective_query: String,
    pub no_results: bool,
    pub status: SerpStatus,
    pub links: Vec<Link>,
}

impl Serp {
    /// Builds a SERP from parser output.
    pub fn from_parsed(
        job: &Job,
        parsed: ParsedSerp,
        run_id: i64,
        requested_at: DateTime<Utc>,
        requested_by: impl Into<String>,
    ) -> Self {
        Self {
            run_id,
            engine: job.engine,
            method: job.method,
            page: job.page,
            query: job.query.clone(),
            requested_at,
            requested_by: requested_by.into(),
            num_results: if parsed.no_results { 0 } else { parsed.num_results },
            num_results_for_query: parsed.num_results_for_query,
            effective_query: parsed.effective_query,
            no_results: parsed.no_results,
            status: SerpStatus::Successful,
            links: parsed.links,
        }
    }

    /// Records a page the parser could not make sense of.
    pub fn parse_failed(
        job: &Job,
        run_id: i64,
        requested_at: DateTime<Utc>,
        requested_by: impl Into<String>,
    ) -> Self {
        let mut serp = Self::from_parsed(
            job,
            ParsedSerp::default(),
            run_id,
            requested_at,
            requested_by,
        );
        serp.status = SerpStatus::ParseFailed;
        serp
    }

    /// Sink deduplication key.
    pub fn key(&self) -> (SearchEngine, String, u32) {
        (self.engine, self.query.clone(), self.page)
    }
}

/// One scheduler invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScraperRun {
    pub id: i64,
    pub keyword_file: Option<String>,
    pub engines: Vec<SearchEngine>,
    pub proxy_count: usize,
    pub query_count: usize,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
}

impl ScraperRun {
    pub fn new(engines: Vec<SearchEngine>, proxy_count: usize, query_count: usize) -> Self {
        Self {
            id: 0,
            keyword_file: None,
            engines,
            proxy_count,
            query_count,
            started_at: Utc::now(),
            stopped_at: None,
        }
    }

    /// Comma separated engine names, as stored.
    pub fn engine_names(&self) -> String {
        self.engines
            .iter()
            .map(|e| e.name())
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Closes the run; the stop time never precedes the start time.
    pub fn finish(&mut self) {
        self.stopped_at = Some(Utc::now().max(self.started_at));
    }
}
