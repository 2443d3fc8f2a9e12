//! End-to-end tests over captured result pages.
//!
//! Tests that talk to real search engines are marked with `#[ignore]`
//! because they require network access and may be slow or flaky.
//!
//! Run them with: `cargo test -p a3s-serp --test integration -- --ignored`

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use a3s_serp::config::OutputTarget;
use a3s_serp::engines::parse_page;
use a3s_serp::job::{dedupe, expand};
use a3s_serp::{
    FetchOutcome, Job, JobState, OutputWriter, ParsedSerp, Proxy, RawResponse, Result,
    RunReport, ScrapeConfig, ScrapeMethod, ScraperRun, Scheduler, SearchEngine, SearchType, Serp,
    SerpStore, SleepRanges, Transport, TransportFactory, CSV_HEADER,
};

const GOOGLE: &str = include_str!("fixtures/google_sonic_youth.html");
const GOOGLE_NO_RESULTS: &str = include_str!("fixtures/google_no_results.html");
const YANDEX_5: &str = include_str!("fixtures/yandex_5.html");
const BING_5: &str = include_str!("fixtures/bing_5.html");
const YAHOO_3: &str = include_str!("fixtures/yahoo_3.html");
const BAIDU_9: &str = include_str!("fixtures/baidu_9.html");
const ASK_7: &str = include_str!("fixtures/ask_7.html");
const DUCKDUCKGO: &str = include_str!("fixtures/duckduckgo.html");

fn fixture_for(engine: SearchEngine) -> &'static str {
    match engine {
        SearchEngine::Google => GOOGLE,
        SearchEngine::Yandex => YANDEX_5,
        SearchEngine::Bing => BING_5,
        SearchEngine::Yahoo => YAHOO_3,
        SearchEngine::Baidu => BAIDU_9,
        SearchEngine::Ask => ASK_7,
        SearchEngine::DuckDuckGo => DUCKDUCKGO,
    }
}

fn parse(engine: SearchEngine, html: &str, query: &str) -> ParsedSerp {
    parse_page(engine, html, query, SearchType::Normal).unwrap()
}

fn assert_well_formed(parsed: &ParsedSerp) {
    if parsed.no_results {
        assert_eq!(parsed.num_results, 0);
        return;
    }
    assert!(parsed.num_results > 0);
    for (i, link) in parsed.links.iter().enumerate() {
        assert_eq!(link.rank, i as u32 + 1, "ranks must be contiguous from 1");
        assert!(!link.link.is_empty());
    }
}

/// Serves the captured page of the requested engine.
struct FixtureTransport {
    method: ScrapeMethod,
    fetches: Arc<AtomicUsize>,
}

#[async_trait]
impl Transport for FixtureTransport {
    fn method(&self) -> ScrapeMethod {
        self.method
    }

    fn proxy(&self) -> Option<Proxy> {
        None
    }

    async fn fetch(&self, job: &Job) -> FetchOutcome {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        FetchOutcome::Ok(RawResponse::new(
            fixture_for(job.engine),
            job.engine.profile().base_url(job.method.is_http()),
            self.method,
        ))
    }

    async fn switch_proxy(&self, _proxy: Option<Proxy>) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct FixtureFactory {
    fetches: Arc<AtomicUsize>,
}

impl TransportFactory for FixtureFactory {
    fn create(
        &self,
        method: ScrapeMethod,
        _proxy: Option<Proxy>,
        _worker_id: usize,
    ) -> Result<Arc<dyn Transport>> {
        Ok(Arc::new(FixtureTransport {
            method,
            fetches: Arc::clone(&self.fetches),
        }))
    }
}

fn test_config(cachedir: &Path) -> ScrapeConfig {
    ScrapeConfig {
        sleeping_ranges: SleepRanges::none(),
        engine_sleeping_ranges: BTreeMap::new(),
        cachedir: cachedir.to_path_buf(),
        ..Default::default()
    }
}

fn jobs(engines: &[SearchEngine], pages: u32, method: ScrapeMethod) -> Vec<Job> {
    dedupe(expand(&["rust programming".to_string()], engines, pages, method))
}

async fn run(
    config: ScrapeConfig,
    factory: Arc<dyn TransportFactory>,
    store: &Arc<SerpStore>,
    jobs: Vec<Job>,
) -> RunReport {
    Scheduler::new(Arc::new(config), factory, Arc::clone(store))
        .run(jobs)
        .await
        .unwrap()
}

mod parser_tests {
    use super::*;

    #[test]
    fn test_google_result_page() {
        let parsed = parse(SearchEngine::Google, GOOGLE, "sonic youth");

        assert!(parsed.num_results_for_query.contains("232.000.000"));
        assert!(parsed.num_results >= 10);
        assert!(!parsed.no_results);
        assert!(parsed
            .links
            .iter()
            .any(|l| l.visible_link.starts_with("www.extremnews.com")));
        assert!(parsed
            .links
            .iter()
            .any(|l| l.snippet.contains("Noise-Rock-Band Sonic Youth")));
        assert!(parsed
            .links
            .iter()
            .any(|l| l.link == "https://www.musikexpress.de/sonic-youth/"));
        assert_well_formed(&parsed);
    }

    #[test]
    fn test_google_no_results_page() {
        let parsed = parse(
            SearchEngine::Google,
            GOOGLE_NO_RESULTS,
            "\"be dealt and be evaluated\"",
        );
        assert_eq!(parsed.effective_query, "be dealt and be evaluated");
        assert!(parsed.no_results);
        assert_eq!(parsed.num_results, 0);
    }

    #[test]
    fn test_page_numbers() {
        let cases = [
            (SearchEngine::Yandex, YANDEX_5, 5),
            (SearchEngine::Bing, BING_5, 5),
            (SearchEngine::Yahoo, YAHOO_3, 3),
            (SearchEngine::Baidu, BAIDU_9, 9),
            (SearchEngine::Ask, ASK_7, 7),
        ];
        for (engine, html, page) in cases {
            let parsed = parse(engine, html, "rust programming");
            assert_eq!(parsed.page_number, Some(page), "{} page number", engine);
            assert_well_formed(&parsed);
        }
    }

    #[test]
    fn test_every_fixture_parses() {
        for html in [GOOGLE, GOOGLE_NO_RESULTS] {
            assert_well_formed(&parse(SearchEngine::Google, html, "sonic youth"));
        }
        for engine in SearchEngine::ALL {
            let parsed = parse(engine, fixture_for(engine), "rust programming");
            assert!(!parsed.no_results, "{} fixture has results", engine);
            assert_well_formed(&parsed);
        }
    }

    #[test]
    fn test_duckduckgo_result_page() {
        let parsed = parse(SearchEngine::DuckDuckGo, DUCKDUCKGO, "rust programming");
        assert_eq!(parsed.num_results, 10);
        assert_eq!(parsed.links[0].link, "https://www.rust-lang.org/");
        assert_eq!(parsed.links[0].domain, "www.rust-lang.org");
        assert!(parsed
            .links
            .iter()
            .any(|l| l.link == "https://en.wikipedia.org/wiki/Rust_(programming_language)"));
        assert!(parsed.links.iter().all(|l| !l.snippet.is_empty()));
        assert_well_formed(&parsed);
    }
}

mod store_tests {
    use super::*;

    #[tokio::test]
    async fn test_parsed_serp_round_trip() {
        let store = SerpStore::connect("sqlite::memory:").await.unwrap();
        let mut run = ScraperRun::new(vec![SearchEngine::Google], 0, 1);
        let run_id = store.begin_run(&mut run).await.unwrap();

        let job = Job::new("sonic youth", SearchEngine::Google, 1, ScrapeMethod::Http);
        let parsed = parse(SearchEngine::Google, GOOGLE, &job.query);
        let serp = Serp::from_parsed(&job, parsed, run_id, Utc::now(), "http-worker-0");
        store.insert_batch(std::slice::from_ref(&serp)).await.unwrap();

        assert_eq!(store.load_serps(run_id).await.unwrap(), vec![serp]);
    }
}

mod scheduler_tests {
    use super::*;

    fn serp_set(serps: Vec<Serp>) -> Vec<(SearchEngine, String, u32, u32, Vec<String>)> {
        let mut set: Vec<_> = serps
            .into_iter()
            .map(|s| {
                let links = s.links.iter().map(|l| l.link.clone()).collect();
                (s.engine, s.query, s.page, s.num_results, links)
            })
            .collect();
        set.sort();
        set
    }

    #[tokio::test]
    async fn test_second_run_served_from_cache() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SerpStore::connect("sqlite::memory:").await.unwrap());
        let factory = Arc::new(FixtureFactory::default());
        let engines = [SearchEngine::Bing, SearchEngine::Yahoo];

        let first = run(
            test_config(dir.path()),
            factory.clone(),
            &store,
            jobs(&engines, 2, ScrapeMethod::Http),
        )
        .await;
        assert_eq!(factory.fetches.load(Ordering::SeqCst), 4);
        assert_eq!(first.count(JobState::Done), 4);

        let second = run(
            test_config(dir.path()),
            factory.clone(),
            &store,
            jobs(&engines, 2, ScrapeMethod::Http),
        )
        .await;
        assert_eq!(factory.fetches.load(Ordering::SeqCst), 4, "no network on replay");
        assert_eq!(second.cache_hits, 4);
        assert_ne!(first.run_id, second.run_id);

        let first_serps = store.load_serps(first.run_id).await.unwrap();
        let second_serps = store.load_serps(second.run_id).await.unwrap();
        assert_eq!(first_serps.len(), 4);
        assert_eq!(serp_set(first_serps), serp_set(second_serps));
    }

    #[tokio::test]
    async fn test_csv_output_shape() {
        let dir = tempfile::tempdir().unwrap();
        let csv_path = dir.path().join("results.csv");
        let store = Arc::new(SerpStore::connect("sqlite::memory:").await.unwrap());
        let engines = SearchEngine::ALL;
        let config = ScrapeConfig {
            num_workers: 2,
            do_caching: false,
            ..test_config(dir.path())
        };

        let output = OutputWriter::open(&OutputTarget::Csv(csv_path.clone())).unwrap();
        let report = Scheduler::new(
            Arc::new(config),
            Arc::new(FixtureFactory::default()),
            Arc::clone(&store),
        )
        .with_output(output)
        .run(jobs(&engines, 2, ScrapeMethod::Selenium))
        .await
        .unwrap();
        assert_eq!(report.count(JobState::Done), engines.len() * 2);

        let mut reader = csv::Reader::from_path(&csv_path).unwrap();
        let header: Vec<String> = reader.headers().unwrap().iter().map(String::from).collect();
        assert_eq!(header, CSV_HEADER);

        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        let links: usize = store
            .load_serps(report.run_id)
            .await
            .unwrap()
            .iter()
            .map(|s| s.links.len())
            .sum();
        assert_eq!(rows.len(), links);
        let expected = engines.len() * 2 * 10;
        assert!(
            rows.len() + 30 >= expected && rows.len() <= expected + 30,
            "{} rows, expected {} +/- 30",
            rows.len(),
            expected
        );
        for row in &rows {
            assert_eq!(row.len(), CSV_HEADER.len());
            // link, title, snippet, query, search_engine_name, scrapemethod, page_number
            for column in [0, 1, 2, 5, 6, 8, 9] {
                assert!(!row[column].is_empty(), "empty column {} in {:?}", column, row);
            }
            assert_eq!(&row[8], "selenium");
        }
    }

    #[tokio::test]
    async fn test_no_duplicate_serp_per_run() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SerpStore::connect("sqlite::memory:").await.unwrap());
        let mut jobs = dedupe(vec![
            Job::new("rust programming", SearchEngine::Bing, 1, ScrapeMethod::Http),
            Job::new("rust programming", SearchEngine::Bing, 1, ScrapeMethod::Selenium),
        ]);
        assert_eq!(jobs.len(), 2);
        jobs.sort_by_key(|j| j.id);

        let config = ScrapeConfig {
            do_caching: false,
            ..test_config(dir.path())
        };
        let report = run(config, Arc::new(FixtureFactory::default()), &store, jobs).await;

        assert!(report.is_complete());
        assert_eq!(report.sink.duplicates, 1);
        assert_eq!(store.load_serps(report.run_id).await.unwrap().len(), 1);
    }

    /// Tracks how many fetches overlap.
    #[derive(Default)]
    struct CountingTransport {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl Transport for CountingTransport {
        fn method(&self) -> ScrapeMethod {
            ScrapeMethod::HttpAsync
        }

        fn proxy(&self) -> Option<Proxy> {
            None
        }

        async fn fetch(&self, _job: &Job) -> FetchOutcome {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            FetchOutcome::Ok(RawResponse::new(
                BING_5,
                "https://www.bing.com/search",
                ScrapeMethod::HttpAsync,
            ))
        }

        async fn switch_proxy(&self, _proxy: Option<Proxy>) -> Result<()> {
            Ok(())
        }
    }

    struct SharedFactory(Arc<CountingTransport>);

    impl TransportFactory for SharedFactory {
        fn create(
            &self,
            _method: ScrapeMethod,
            _proxy: Option<Proxy>,
            _worker_id: usize,
        ) -> Result<Arc<dyn Transport>> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_async_mode_bounds_in_flight_requests() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SerpStore::connect("sqlite::memory:").await.unwrap());
        let transport = Arc::new(CountingTransport::default());
        let queries: Vec<String> = (0..200).map(|i| format!("query {}", i)).collect();
        let jobs = dedupe(expand(
            &queries,
            &[SearchEngine::Bing],
            1,
            ScrapeMethod::HttpAsync,
        ));
        let config = ScrapeConfig {
            max_concurrent_requests: 50,
            do_caching: false,
            ..test_config(dir.path())
        };

        let report = run(
            config,
            Arc::new(SharedFactory(Arc::clone(&transport))),
            &store,
            jobs,
        )
        .await;

        let peak = transport.peak.load(Ordering::SeqCst);
        assert!(peak <= 50, "peak in-flight {} exceeds the limit", peak);
        assert!(peak > 1, "requests never overlapped");
        assert!(report.is_complete());
        assert_eq!(report.count(JobState::Done), 200);
        assert_eq!(report.sink.stored, 200);
    }
}

mod live_tests {
    use super::*;
    use a3s_serp::fetcher::FetchSettings;
    use a3s_serp::fetcher_http::HttpTransport;

    async fn fetch_and_parse(engine: SearchEngine) -> ParsedSerp {
        let transport = HttpTransport::blocking(None, FetchSettings::default()).unwrap();
        let job = Job::new("rust programming", engine, 1, ScrapeMethod::Http);
        match transport.fetch(&job).await {
            FetchOutcome::Ok(raw) => {
                let parsed = parse_page(engine, &raw.text(), &job.query, SearchType::Normal)
                    .unwrap_or_default();
                println!(
                    "{} returned {} results ({})",
                    engine, parsed.num_results, parsed.num_results_for_query
                );
                for link in parsed.links.iter().take(3) {
                    println!("  {}. {} - {}", link.rank, link.title, link.link);
                }
                parsed
            }
            other => {
                println!("{} failed: {}", engine, other.label());
                ParsedSerp::default()
            }
        }
    }

    #[tokio::test]
    #[ignore]
    async fn test_live_bing() {
        let parsed = fetch_and_parse(SearchEngine::Bing).await;
        assert!(parsed.num_results > 0, "Bing should return results");
    }

    #[tokio::test]
    #[ignore]
    async fn test_live_duckduckgo() {
        let parsed = fetch_and_parse(SearchEngine::DuckDuckGo).await;
        assert!(parsed.num_results > 0, "DuckDuckGo should return results");
    }

    #[tokio::test]
    #[ignore]
    async fn test_live_yahoo() {
        let parsed = fetch_and_parse(SearchEngine::Yahoo).await;
        println!("Yahoo returned {} results", parsed.num_results);
    }
}
