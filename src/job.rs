//! Scrape jobs and their expansion from keyword sources.
//!
//! A run is a flat list of [`Job`]s, one per `(query, engine, page,
//! transport)`. Jobs come either from the cartesian product of queries,
//! engines and pages, or from an explicit job list whose entries may
//! override engine, transport, proxy and page count. Duplicates are
//! removed right after expansion so no two workers ever share a cache
//! entry.

use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ScrapeConfig;
use crate::engine::SearchEngine;
use crate::fetcher::ScrapeMethod;
use crate::proxy::Proxy;
use crate::{Result, ScrapeError};

/// Lifecycle of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobState {
    #[default]
    Pending,
    InFlight,
    Done,
    Failed,
    Skipped,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Done | JobState::Failed | JobState::Skipped)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Pending => "pending",
            JobState::InFlight => "in-flight",
            JobState::Done => "done",
            JobState::Failed => "failed",
            JobState::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// One unit of scraping work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: usize,
    pub query: String,
    pub engine: SearchEngine,
    pub page: u32,
    pub method: ScrapeMethod,
    /// Pins the job to this proxy instead of the worker's round-robin one.
    pub proxy: Option<Proxy>,
    pub state: JobState,
    /// Fetch attempts made so far.
    pub attempts: u32,
    /// Last failure, if any.
    pub error: Option<String>,
}

impl Job {
    pub fn new(query: impl Into<String>, engine: SearchEngine, page: u32, method: ScrapeMethod) -> Self {
        Self {
            id: 0,
            query: query.into(),
            engine,
            page,
            method,
            proxy: None,
            state: JobState::Pending,
            attempts: 0,
            error: None,
        }
    }

    pub fn with_proxy(mut self, proxy: Proxy) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Deduplication key.
    pub fn key(&self) -> (&str, SearchEngine, u32, ScrapeMethod) {
        (self.query.as_str(), self.engine, self.page, self.method)
    }

    /// `pending → in-flight`.
    pub fn start(&mut self) -> Result<()> {
        if self.state != JobState::Pending {
            return Err(self.invalid_transition(JobState::InFlight));
        }
        self.state = JobState::InFlight;
        self.attempts += 1;
        Ok(())
    }

    /// `in-flight → done | failed | skipped`. Happens exactly once.
    pub fn finish(&mut self, state: JobState) -> Result<()> {
        if self.state != JobState::InFlight || !state.is_terminal() {
            return Err(self.invalid_transition(state));
        }
        self.state = state;
        Ok(())
    }

    /// Marks the job failed with a reason.
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<()> {
        self.error = Some(reason.into());
        self.finish(JobState::Failed)
    }

    /// Skips a job that is not terminal yet. Returns whether it changed.
    pub fn skip(&mut self) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = JobState::Skipped;
        true
    }

    /// Puts an in-flight job back for another attempt.
    pub fn retry(&mut self) -> Result<()> {
        if self.state != JobState::InFlight {
            return Err(self.invalid_transition(JobState::Pending));
        }
        self.state = JobState::Pending;
        Ok(())
    }

    fn invalid_transition(&self, to: JobState) -> ScrapeError {
        ScrapeError::Other(format!(
            "job {} ({} '{}' page {}): invalid transition {} -> {}",
            self.id, self.engine, self.query, self.page, self.state, to
        ))
    }
}

/// One entry of an explicit job list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub query: String,
    /// Single engine override; all configured engines when absent.
    #[serde(default)]
    pub engine: Option<SearchEngine>,
    #[serde(default)]
    pub transport: Option<ScrapeMethod>,
    /// Proxy line in proxy file syntax, e.g. `socks5 10.0.0.1:1080`.
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default)]
    pub num_pages: Option<u32>,
}

/// Where the queries of a run come from.
#[derive(Debug, Clone, PartialEq)]
pub enum KeywordSource {
    Queries(Vec<String>),
    Jobs(Vec<JobSpec>),
}

impl KeywordSource {
    /// Reads a keyword file: JSON job list for `.json`, one query per line otherwise.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ScrapeError::Config(format!("cannot read keyword file '{}': {}", path.display(), e))
        })?;
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            let specs: Vec<JobSpec> = serde_json::from_str(&text).map_err(|e| {
                ScrapeError::Config(format!("invalid job list '{}': {}", path.display(), e))
            })?;
            Ok(KeywordSource::Jobs(specs))
        } else {
            Ok(KeywordSource::Queries(parse_keyword_lines(&text)))
        }
    }

    /// Resolves the keyword source of a configuration.
    pub fn from_config(config: &ScrapeConfig) -> Result<Self> {
        if let Some(path) = &config.keyword_file {
            return Self::from_file(path);
        }
        let mut queries: Vec<String> = config.keyword.iter().cloned().collect();
        queries.extend(config.keywords.iter().cloned());
        let queries: Vec<String> = queries
            .into_iter()
            .map(|q| q.trim().to_string())
            .filter(|q| !q.is_empty())
            .collect();
        if queries.is_empty() {
            return Err(ScrapeError::Config(
                "no keywords given (keyword, keywords or keyword_file)".to_string(),
            ));
        }
        Ok(KeywordSource::Queries(queries))
    }
}

/// One query per non-blank line.
pub fn parse_keyword_lines(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Cartesian product `query × engine × page ∈ [1..pages]`.
pub fn expand(
    queries: &[String],
    engines: &[SearchEngine],
    pages: u32,
    method: ScrapeMethod,
) -> Vec<Job> {
    let mut jobs = Vec::with_capacity(queries.len() * engines.len() * pages as usize);
    for query in queries {
        for engine in engines {
            for page in 1..=pages {
                jobs.push(Job::new(query.clone(), *engine, page, method));
            }
        }
    }
    jobs
}

/// Expands an explicit job list, filling gaps from run-wide defaults.
pub fn expand_specs(
    specs: &[JobSpec],
    engines: &[SearchEngine],
    pages: u32,
    method: ScrapeMethod,
) -> Result<Vec<Job>> {
    let mut jobs = Vec::new();
    for spec in specs {
        let query = spec.query.trim();
        if query.is_empty() {
            return Err(ScrapeError::Config("job list entry with empty query".to_string()));
        }
        let spec_engines = match spec.engine {
            Some(engine) => vec![engine],
            None => engines.to_vec(),
        };
        let proxy = spec
            .proxy
            .as_deref()
            .map(Proxy::parse_line)
            .transpose()
            .map_err(|e| ScrapeError::Config(format!("job list entry '{}': {}", query, e)))?;
        let method = spec.transport.unwrap_or(method);
        let pages = spec.num_pages.unwrap_or(pages);
        if pages == 0 {
            return Err(ScrapeError::Config(format!(
                "job list entry '{}' asks for zero pages",
                query
            )));
        }
        for engine in spec_engines {
            for page in 1..=pages {
                let mut job = Job::new(query, engine, page, method);
                job.proxy = proxy.clone();
                jobs.push(job);
            }
        }
    }
    Ok(jobs)
}

/// Drops repeated `(query, engine, page, transport)` jobs, keeping the first,
/// and numbers the survivors.
pub fn dedupe(jobs: Vec<Job>) -> Vec<Job> {
    let before = jobs.len();
    let mut seen = HashSet::new();
    let mut unique: Vec<Job> = jobs
        .into_iter()
        .filter(|job| seen.insert((job.query.clone(), job.engine, job.page, job.method)))
        .collect();
    for (id, job) in unique.iter_mut().enumerate() {
        job.id = id;
    }
    if unique.len() < before {
        debug!("Removed {} duplicate jobs", before - unique.len());
    }
    unique
}

/// Builds the deduplicated job list of a run.
pub fn build_jobs(config: &ScrapeConfig) -> Result<Vec<Job>> {
    let engines = config.engines()?;
    let pages = config.num_pages_for_keyword;
    let method = config.scrape_method;
    let jobs = match KeywordSource::from_config(config)? {
        KeywordSource::Queries(queries) => expand(&queries, &engines, pages, method),
        KeywordSource::Jobs(specs) => expand_specs(&specs, &engines, pages, method)?,
    };
    if jobs.is_empty() {
        return Err(ScrapeError::Config("keyword source produced no jobs".to_string()));
    }
    Ok(dedupe(jobs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn queries(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_expand_cartesian_product() {
        let jobs = expand(
            &queries(&["a", "b"]),
            &[SearchEngine::Google, SearchEngine::Bing],
            3,
            ScrapeMethod::Http,
        );
        assert_eq!(jobs.len(), 12);
        assert_eq!(jobs[0].key(), ("a", SearchEngine::Google, 1, ScrapeMethod::Http));
        assert_eq!(jobs[2].page, 3);
        assert_eq!(jobs[3].engine, SearchEngine::Bing);
        assert!(jobs.iter().all(|j| j.state == JobState::Pending));
    }

    #[test]
    fn test_dedupe_keeps_first_and_renumbers() {
        let mut jobs = expand(&queries(&["a", "a"]), &[SearchEngine::Google], 2, ScrapeMethod::Http);
        jobs.push(Job::new("a", SearchEngine::Google, 1, ScrapeMethod::Selenium));
        let jobs = dedupe(jobs);
        assert_eq!(jobs.len(), 3);
        assert_eq!(jobs.iter().map(|j| j.id).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(jobs[2].method, ScrapeMethod::Selenium);
    }

    #[test]
    fn test_expand_specs_overrides() {
        let specs = vec![
            JobSpec {
                query: "rust".into(),
                engine: Some(SearchEngine::Yahoo),
                transport: Some(ScrapeMethod::HttpAsync),
                proxy: Some("socks5 10.0.0.1:1080".into()),
                num_pages: Some(2),
            },
            JobSpec {
                query: "go".into(),
                ..Default::default()
            },
        ];
        let jobs = expand_specs(
            &specs,
            &[SearchEngine::Google, SearchEngine::Bing],
            1,
            ScrapeMethod::Http,
        )
        .unwrap();
        assert_eq!(jobs.len(), 4);
        assert_eq!(jobs[0].engine, SearchEngine::Yahoo);
        assert_eq!(jobs[0].method, ScrapeMethod::HttpAsync);
        assert_eq!(jobs[1].page, 2);
        assert_eq!(jobs[0].proxy.as_ref().unwrap().port, 1080);
        assert_eq!(jobs[2].engine, SearchEngine::Google);
        assert_eq!(jobs[3].method, ScrapeMethod::Http);
        assert!(jobs[3].proxy.is_none());
    }

    #[test]
    fn test_expand_specs_rejects_bad_entries() {
        let empty = vec![JobSpec::default()];
        assert!(expand_specs(&empty, &[SearchEngine::Google], 1, ScrapeMethod::Http).is_err());
        let bad_proxy = vec![JobSpec {
            query: "x".into(),
            proxy: Some("nonsense".into()),
            ..Default::default()
        }];
        assert!(expand_specs(&bad_proxy, &[SearchEngine::Google], 1, ScrapeMethod::Http).is_err());
    }

    #[test]
    fn test_job_transitions() {
        let mut job = Job::new("q", SearchEngine::Google, 1, ScrapeMethod::Http);
        assert!(job.finish(JobState::Done).is_err());
        job.start().unwrap();
        assert_eq!(job.attempts, 1);
        assert!(job.start().is_err());
        job.finish(JobState::Done).unwrap();
        assert!(job.finish(JobState::Failed).is_err());
        assert!(!job.skip());
        assert_eq!(job.state, JobState::Done);
    }

    #[test]
    fn test_job_retry_and_fail() {
        let mut job = Job::new("q", SearchEngine::Bing, 1, ScrapeMethod::Http);
        job.start().unwrap();
        job.retry().unwrap();
        job.start().unwrap();
        assert_eq!(job.attempts, 2);
        job.fail("timeout").unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.error.as_deref(), Some("timeout"));
    }

    #[test]
    fn test_skip_pending_and_in_flight() {
        let mut pending = Job::new("q", SearchEngine::Bing, 1, ScrapeMethod::Http);
        assert!(pending.skip());
        let mut in_flight = Job::new("q", SearchEngine::Bing, 2, ScrapeMethod::Http);
        in_flight.start().unwrap();
        assert!(in_flight.skip());
        assert_eq!(in_flight.state, JobState::Skipped);
    }

    #[test]
    fn test_keyword_lines() {
        assert_eq!(
            parse_keyword_lines("one\n\n  two words  \n"),
            vec!["one".to_string(), "two words".to_string()]
        );
    }

    #[test]
    fn test_keyword_file_formats() {
        let dir = tempfile::tempdir().unwrap();
        let txt = dir.path().join("kw.txt");
        std::fs::File::create(&txt)
            .unwrap()
            .write_all(b"apple\nbanana\n")
            .unwrap();
        assert_eq!(
            KeywordSource::from_file(&txt).unwrap(),
            KeywordSource::Queries(queries(&["apple", "banana"]))
        );

        let json = dir.path().join("jobs.json");
        std::fs::write(&json, r#"[{"query": "apple", "engine": "bing", "num_pages": 2}]"#).unwrap();
        match KeywordSource::from_file(&json).unwrap() {
            KeywordSource::Jobs(specs) => {
                assert_eq!(specs[0].engine, Some(SearchEngine::Bing));
                assert_eq!(specs[0].num_pages, Some(2));
            }
            other => panic!("expected job list, got {:?}", other),
        }
    }

    #[test]
    fn test_build_jobs_from_config() {
        let config = ScrapeConfig {
            keywords: queries(&["a", "b", "a"]),
            search_engines: vec!["google".into(), "bing".into()],
            num_pages_for_keyword: 2,
            ..Default::default()
        };
        let jobs = build_jobs(&config).unwrap();
        assert_eq!(jobs.len(), 8);
    }

    #[test]
    fn test_build_jobs_without_keywords_fails() {
        let config = ScrapeConfig::default();
        assert!(build_jobs(&config).unwrap_err().is_config());
    }
}
