//! Scrape configuration.
//!
//! One immutable [`ScrapeConfig`] value describes a run. It is loaded from
//! a TOML file, overlaid with command line flags by the binary, validated
//! once, and then shared as `Arc<ScrapeConfig>` by the scheduler, the
//! workers and the transports.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};

use crate::engine::{SearchEngine, SearchType};
use crate::fetcher::ScrapeMethod;
use crate::pacing::SleepRanges;
use crate::proxy::ProxyCheckPolicy;
use crate::{Result, ScrapeError};

/// Upper bound accepted by every engine for one result page.
pub const MAX_RESULTS_PER_PAGE: u32 = 100;

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

/// Streaming output selected by the output file extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputTarget {
    Stdout,
    Csv(PathBuf),
    Json(PathBuf),
}

/// Configuration of one scrape run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScrapeConfig {
    /// Engine names, or `*` for all of them.
    #[serde(deserialize_with = "deserialize_engine_list")]
    pub search_engines: Vec<String>,
    pub scrape_method: ScrapeMethod,
    pub num_pages_for_keyword: u32,
    pub num_results_per_page: u32,
    pub search_type: SearchType,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub keyword: Option<String>,
    pub keywords: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keyword_file: Option<PathBuf>,

    pub num_workers: usize,
    pub maximum_workers: usize,
    pub max_concurrent_requests: usize,
    /// Network errors retried per job before it fails.
    pub max_retries: u32,
    /// Seconds before one HTTP request times out.
    pub request_timeout: u64,

    pub use_own_ip: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_file: Option<PathBuf>,
    /// Connection string of a database with a `proxies` table.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mysql_proxy_db: Option<String>,
    pub check_proxies: bool,
    pub proxy_check_policy: ProxyCheckPolicy,
    pub proxy_info_url: String,
    pub proxy_check_url: String,
    /// Seconds a denied worker backs off when the run keeps going.
    pub proxy_detected_timeout: u64,
    pub stop_on_detection: bool,
    /// Denials across the run that halt scheduling under `stop_on_detection`.
    pub detection_threshold: u32,

    pub do_caching: bool,
    pub compress_cached_files: bool,
    pub cachedir: PathBuf,
    /// Hours after which a cache entry is stale.
    pub clean_cache_after: u64,

    pub sleeping_ranges: SleepRanges,
    /// Per-engine sleep ranges, keyed by engine name.
    pub engine_sleeping_ranges: BTreeMap<String, SleepRanges>,

    pub sel_browser: String,
    pub headless: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chrome_path: Option<PathBuf>,
    pub manual_captcha_solving: bool,
    /// Seconds to wait for the operator's captcha answer.
    pub captcha_timeout: u64,
    /// Seconds to wait for a browser DOM condition.
    pub browser_wait_timeout: u64,
    /// Seconds a blocked browser waits for human intervention.
    pub detection_wait: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_filename: Option<PathBuf>,
    pub database_url: String,
    pub sink_batch_size: usize,
    pub sink_queue_capacity: usize,

    pub verbosity: u8,
    pub log_format: LogFormat,
    /// Print the plan and exit without network traffic.
    pub simulate: bool,
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        let mut engine_sleeping_ranges = BTreeMap::new();
        engine_sleeping_ranges.insert("google".to_string(), SleepRanges::google_ranges());
        Self {
            search_engines: vec!["google".to_string()],
            scrape_method: ScrapeMethod::Http,
            num_pages_for_keyword: 1,
            num_results_per_page: 10,
            search_type: SearchType::Normal,
            keyword: None,
            keywords: Vec::new(),
            keyword_file: None,
            num_workers: 1,
            maximum_workers: 20,
            max_concurrent_requests: 100,
            max_retries: 0,
            request_timeout: 10,
            use_own_ip: true,
            proxy_file: None,
            mysql_proxy_db: None,
            check_proxies: true,
            proxy_check_policy: ProxyCheckPolicy::Remove,
            proxy_info_url: "http://ipinfo.io/json".to_string(),
            proxy_check_url: "http://canihazip.com/s".to_string(),
            proxy_detected_timeout: 400,
            stop_on_detection: true,
            detection_threshold: 1,
            do_caching: true,
            compress_cached_files: true,
            cachedir: PathBuf::from(".scrapecache"),
            clean_cache_after: 48,
            sleeping_ranges: SleepRanges::default_ranges(),
            engine_sleeping_ranges,
            sel_browser: "chrome".to_string(),
            headless: true,
            chrome_path: None,
            manual_captcha_solving: false,
            captcha_timeout: 300,
            browser_wait_timeout: 10,
            detection_wait: 36_000,
            output_filename: None,
            database_url: "sqlite://serp_results.db".to_string(),
            sink_batch_size: 20,
            sink_queue_capacity: 256,
            verbosity: 1,
            log_format: LogFormat::Pretty,
            simulate: false,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum EngineList {
    One(String),
    Many(Vec<String>),
}

fn deserialize_engine_list<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let names = match EngineList::deserialize(deserializer)? {
        EngineList::One(list) => list.split(',').map(|s| s.trim().to_string()).collect(),
        EngineList::Many(names) => names,
    };
    Ok(names.into_iter().filter(|s| !s.is_empty()).collect())
}

impl ScrapeConfig {
    /// Loads and validates a TOML configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let config = Self::read(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a TOML configuration file without validating it, so that
    /// command line overrides can still complete it.
    pub fn read(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ScrapeError::Config(format!("Failed to read config file '{}': {}", path.display(), e))
        })?;
        Self::from_toml(&content).map_err(|e| match e {
            ScrapeError::Config(msg) => {
                ScrapeError::Config(format!("{} ({})", msg, path.display()))
            }
            other => other,
        })
    }

    /// Parses TOML without validating.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| ScrapeError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Renders the configuration as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| ScrapeError::Other(format!("Failed to render config: {}", e)))
    }

    /// Validate all configuration fields.
    ///
    /// Every problem is collected and reported in one error.
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        match self.engines() {
            Ok(engines) => {
                for engine in engines {
                    if !crate::engines::parser_for(engine).supports(self.search_type) {
                        errors.push(format!(
                            "{} does not support {} search",
                            engine, self.search_type
                        ));
                    }
                }
            }
            Err(e) => errors.push(e.to_string()),
        }
        for name in self.engine_sleeping_ranges.keys() {
            if name.parse::<SearchEngine>().is_err() {
                errors.push(format!("engine_sleeping_ranges names unknown engine '{}'", name));
            }
        }

        let has_inline = self.keyword.as_deref().is_some_and(|k| !k.trim().is_empty())
            || self.keywords.iter().any(|k| !k.trim().is_empty());
        match (&self.keyword_file, has_inline) {
            (Some(_), true) => errors.push(
                "keyword_file is mutually exclusive with keyword/keywords".to_string(),
            ),
            (None, false) => {
                errors.push("no keywords given (keyword, keywords or keyword_file)".to_string())
            }
            _ => {}
        }

        if self.num_pages_for_keyword == 0 {
            errors.push("num_pages_for_keyword must be positive".to_string());
        }
        if self.num_results_per_page == 0 || self.num_results_per_page > MAX_RESULTS_PER_PAGE {
            errors.push(format!(
                "num_results_per_page must be between 1 and {}",
                MAX_RESULTS_PER_PAGE
            ));
        }
        if self.num_workers == 0 {
            errors.push("num_workers must be positive".to_string());
        }
        if self.maximum_workers == 0 {
            errors.push("maximum_workers must be positive".to_string());
        }
        if self.max_concurrent_requests == 0 {
            errors.push("max_concurrent_requests must be positive".to_string());
        }
        if self.request_timeout == 0 {
            errors.push("request_timeout must be positive".to_string());
        }
        if self.detection_threshold == 0 {
            errors.push("detection_threshold must be positive".to_string());
        }
        if self.sink_batch_size == 0 {
            errors.push("sink_batch_size must be positive".to_string());
        }
        if self.sink_queue_capacity == 0 {
            errors.push("sink_queue_capacity must be positive".to_string());
        }

        errors.extend(self.sleeping_ranges.problems());
        for (name, ranges) in &self.engine_sleeping_ranges {
            errors.extend(ranges.problems().into_iter().map(|p| format!("{}: {}", name, p)));
        }

        match self.sel_browser.to_lowercase().as_str() {
            "chrome" | "chromium" => {}
            "firefox" | "phantomjs" => errors.push(format!(
                "sel_browser '{}' is not supported, only chrome can be driven",
                self.sel_browser
            )),
            other => errors.push(format!("unknown sel_browser '{}'", other)),
        }

        if let Err(e) = self.output_target() {
            errors.push(e.to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ScrapeError::Config(errors.join("; ")))
        }
    }

    /// Resolved engine list, `*` expanded.
    pub fn engines(&self) -> Result<Vec<SearchEngine>> {
        let engines = SearchEngine::parse_list(&self.search_engines.join(","))?;
        if engines.is_empty() {
            return Err(ScrapeError::Config("no search engines configured".to_string()));
        }
        Ok(engines)
    }

    /// Sleep ranges for an engine; engine-specific ranges take precedence.
    pub fn sleep_ranges_for(&self, engine: SearchEngine) -> &SleepRanges {
        self.engine_sleeping_ranges
            .get(engine.name())
            .unwrap_or(&self.sleeping_ranges)
    }

    /// Worker count for parallel transports, capped by `maximum_workers`.
    pub fn worker_count(&self) -> usize {
        self.num_workers.clamp(1, self.maximum_workers.max(1))
    }

    /// Streaming output derived from `output_filename`.
    pub fn output_target(&self) -> Result<OutputTarget> {
        let Some(path) = &self.output_filename else {
            return Ok(OutputTarget::Stdout);
        };
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase);
        match ext.as_deref() {
            Some("csv") => Ok(OutputTarget::Csv(path.clone())),
            Some("json") => Ok(OutputTarget::Json(path.clone())),
            _ => Err(ScrapeError::Config(format!(
                "output_filename '{}' must end in .csv or .json",
                path.display()
            ))),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    pub fn browser_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.browser_wait_timeout)
    }

    pub fn captcha_timeout(&self) -> Duration {
        Duration::from_secs(self.captcha_timeout)
    }

    pub fn detection_wait(&self) -> Duration {
        Duration::from_secs(self.detection_wait)
    }

    pub fn proxy_detected_timeout(&self) -> Duration {
        Duration::from_secs(self.proxy_detected_timeout)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.clean_cache_after * 3600)
    }

    /// Log filter directive for the configured verbosity.
    pub fn log_filter(&self) -> &'static str {
        match self.verbosity {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> ScrapeConfig {
        ScrapeConfig {
            keyword: Some("rust".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults() {
        let cfg = ScrapeConfig::default();
        assert_eq!(cfg.scrape_method, ScrapeMethod::Http);
        assert_eq!(cfg.num_results_per_page, 10);
        assert_eq!(cfg.maximum_workers, 20);
        assert_eq!(cfg.max_concurrent_requests, 100);
        assert_eq!(cfg.proxy_detected_timeout, 400);
        assert_eq!(cfg.clean_cache_after, 48);
        assert_eq!(cfg.cachedir, PathBuf::from(".scrapecache"));
        assert!(cfg.stop_on_detection);
        assert!(cfg.compress_cached_files);
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let cfg = ScrapeConfig {
            search_engines: vec!["lycos".into()],
            num_results_per_page: 500,
            num_workers: 0,
            sel_browser: "firefox".into(),
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.is_config());
        let msg = err.to_string();
        assert!(msg.contains("lycos"), "{}", msg);
        assert!(msg.contains("no keywords"), "{}", msg);
        assert!(msg.contains("num_results_per_page"), "{}", msg);
        assert!(msg.contains("num_workers"), "{}", msg);
        assert!(msg.contains("firefox"), "{}", msg);
    }

    #[test]
    fn test_keyword_file_excludes_inline_keywords() {
        let cfg = ScrapeConfig {
            keyword_file: Some(PathBuf::from("kw.txt")),
            ..valid_config()
        };
        let msg = cfg.validate().unwrap_err().to_string();
        assert!(msg.contains("mutually exclusive"), "{}", msg);
    }

    #[test]
    fn test_unsupported_search_type_rejected() {
        let cfg = ScrapeConfig {
            search_engines: vec!["google".into(), "ask".into()],
            search_type: SearchType::Image,
            ..valid_config()
        };
        let msg = cfg.validate().unwrap_err().to_string();
        assert!(msg.contains("ask does not support image search"), "{}", msg);
        assert!(!msg.contains("google"), "{}", msg);
    }

    #[test]
    fn test_engines_star() {
        let cfg = ScrapeConfig {
            search_engines: vec!["*".into()],
            ..valid_config()
        };
        assert_eq!(cfg.engines().unwrap().len(), 7);
    }

    #[test]
    fn test_engine_list_from_string_or_array() {
        let cfg = ScrapeConfig::from_toml("search_engines = \"google, bing\"\nkeyword = \"x\"\n").unwrap();
        assert_eq!(cfg.search_engines, vec!["google", "bing"]);
        let cfg = ScrapeConfig::from_toml("search_engines = [\"yahoo\"]\n").unwrap();
        assert_eq!(cfg.engines().unwrap(), vec![SearchEngine::Yahoo]);
    }

    #[test]
    fn test_from_toml_overrides() {
        let toml = r#"
            scrape_method = "http-async"
            keywords = ["a", "b"]
            max_concurrent_requests = 50
            clean_cache_after = 1

            [sleeping_ranges]
            1 = [0, 0]

            [engine_sleeping_ranges.bing]
            1 = [5, 6]
        "#;
        let cfg = ScrapeConfig::from_toml(toml).unwrap();
        assert_eq!(cfg.scrape_method, ScrapeMethod::HttpAsync);
        assert_eq!(cfg.max_concurrent_requests, 50);
        assert_eq!(cfg.cache_ttl(), Duration::from_secs(3600));
        assert_eq!(cfg.sleep_ranges_for(SearchEngine::Bing).range_for(1), (5.0, 6.0));
        assert_eq!(cfg.sleep_ranges_for(SearchEngine::Yahoo).range_for(1), (0.0, 0.0));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_google_ranges_take_precedence_by_default() {
        let cfg = valid_config();
        assert_eq!(cfg.sleep_ranges_for(SearchEngine::Google).range_for(1), (2.0, 3.0));
        assert_eq!(cfg.sleep_ranges_for(SearchEngine::Bing).range_for(1), (1.0, 2.0));
    }

    #[test]
    fn test_infinite_sleep_range_rejected() {
        let toml = r#"
            keyword = "rust"

            [sleeping_ranges]
            1 = [1.0, inf]
        "#;
        let cfg = ScrapeConfig::from_toml(toml).unwrap();
        let err = cfg.validate().unwrap_err();
        assert!(err.is_config());
        assert!(err.to_string().contains("finite"), "{}", err);
    }

    #[test]
    fn test_unknown_engine_sleep_ranges_rejected() {
        let mut cfg = valid_config();
        cfg.engine_sleeping_ranges
            .insert("lycos".into(), SleepRanges::none());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_output_target_by_extension() {
        let mut cfg = valid_config();
        assert_eq!(cfg.output_target().unwrap(), OutputTarget::Stdout);
        cfg.output_filename = Some(PathBuf::from("out.CSV"));
        assert!(matches!(cfg.output_target().unwrap(), OutputTarget::Csv(_)));
        cfg.output_filename = Some(PathBuf::from("out.json"));
        assert!(matches!(cfg.output_target().unwrap(), OutputTarget::Json(_)));
        cfg.output_filename = Some(PathBuf::from("out.xml"));
        assert!(cfg.output_target().is_err());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_worker_count_capped() {
        let cfg = ScrapeConfig {
            num_workers: 50,
            maximum_workers: 20,
            ..valid_config()
        };
        assert_eq!(cfg.worker_count(), 20);
    }

    #[test]
    fn test_toml_roundtrip() {
        let cfg = valid_config();
        let text = cfg.to_toml().unwrap();
        let back = ScrapeConfig::from_toml(&text).unwrap();
        assert_eq!(back, cfg);
    }

    #[test]
    fn test_load_missing_file() {
        let err = ScrapeConfig::load(Path::new("/no/such/config.toml")).unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_log_filter() {
        let mut cfg = valid_config();
        cfg.verbosity = 0;
        assert_eq!(cfg.log_filter(), "warn");
        cfg.verbosity = 2;
        assert_eq!(cfg.log_filter(), "debug");
        cfg.verbosity = 9;
        assert_eq!(cfg.log_filter(), "trace");
    }
}
