//! Browser transport driving Chrome/Chromium over the DevTools protocol.
//!
//! Only available with the `headless` Cargo feature. Each worker owns one
//! browser process launched with its proxy. A job is served by walking a
//! small per-engine state machine:
//!
//! ```text
//! Blank -> Landing -> QueryEntered -> ResultsVisible <-> NextClicked
//! ```
//!
//! Every transition waits on a DOM condition with an upper-bound timeout.
//! The next page of the query currently on screen is reached by clicking the
//! engine's "next" link (or scrolling, for DuckDuckGo) instead of searching
//! again.

use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::element::Element;
use chromiumoxide::error::CdpError;
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::Page;
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::browser_setup::resolve_chrome;
use crate::captcha::{solve_exclusive, CaptchaSolver};
use crate::config::ScrapeConfig;
use crate::engine::{EngineProfile, SearchEngine};
use crate::fetcher::{
    DenialResolution, FetchOutcome, FetchSettings, RawResponse, ScrapeMethod, Transport,
};
use crate::job::Job;
use crate::proxy::Proxy;
use crate::{Result, ScrapeError};

/// Chrome's `--headless=new` mode puts "HeadlessChrome" in the user agent,
/// which engines trivially detect.
const CHROME_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

const POLL_INTERVAL: Duration = Duration::from_millis(250);
/// Time given to DuckDuckGo to append results after scrolling.
const SCROLL_SETTLE: Duration = Duration::from_secs(2);
const CAPTCHA_INPUT: &str = "input[name='captcha'], #captcha";

/// Browser-specific part of the configuration.
#[derive(Debug, Clone)]
pub struct BrowserSettings {
    pub headless: bool,
    pub chrome_path: Option<PathBuf>,
    /// Upper bound for every DOM wait.
    pub wait_timeout: Duration,
    /// How long a blocked worker waits for an operator when captchas are
    /// not solved interactively.
    pub detection_wait: Duration,
    pub manual_captcha_solving: bool,
    pub stop_on_detection: bool,
    pub fetch: FetchSettings,
}

impl BrowserSettings {
    pub fn from_config(config: &ScrapeConfig) -> Self {
        Self {
            headless: config.headless,
            chrome_path: config.chrome_path.clone(),
            wait_timeout: config.browser_wait_timeout(),
            detection_wait: config.detection_wait(),
            manual_captcha_solving: config.manual_captcha_solving,
            stop_on_detection: config.stop_on_detection,
            fetch: FetchSettings::from_config(config),
        }
    }
}

/// Where the browser tab is in the search flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrowserStage {
    Blank,
    Landing,
    QueryEntered,
    ResultsVisible,
    NextClicked,
}

impl BrowserStage {
    /// Whether the flow may move from `self` to `next`. Starting over is
    /// always allowed.
    pub fn can_advance_to(self, next: BrowserStage) -> bool {
        use BrowserStage::*;
        matches!(
            (self, next),
            (_, Blank)
                | (_, Landing)
                | (Landing, QueryEntered)
                | (QueryEntered, ResultsVisible)
                | (ResultsVisible, NextClicked)
                | (NextClicked, ResultsVisible)
        )
    }
}

#[derive(Debug)]
struct Session {
    stage: BrowserStage,
    engine: Option<SearchEngine>,
    query: String,
    /// Result page currently on screen, 0 before the first one.
    page: u32,
}

impl Session {
    fn new() -> Self {
        Self {
            stage: BrowserStage::Blank,
            engine: None,
            query: String::new(),
            page: 0,
        }
    }

    fn advance(&mut self, next: BrowserStage) -> Result<()> {
        if !self.stage.can_advance_to(next) {
            return Err(ScrapeError::Browser(format!(
                "Invalid browser transition {:?} -> {:?}",
                self.stage, next
            )));
        }
        debug!("Browser stage {:?} -> {:?}", self.stage, next);
        self.stage = next;
        Ok(())
    }

    fn reset(&mut self) {
        *self = Self::new();
    }

    /// Whether `job` is the page right after the one on screen.
    fn continues(&self, job: &Job) -> bool {
        self.stage == BrowserStage::ResultsVisible
            && self.engine == Some(job.engine)
            && self.query == job.query
            && job.page == self.page + 1
    }
}

struct Launched {
    browser: Browser,
    page: Page,
    handler: JoinHandle<()>,
}

struct Inner {
    launched: Option<Launched>,
    session: Session,
}

/// Arguments Chrome is started with.
pub(crate) fn launch_args(headless: bool, proxy: Option<&Proxy>) -> Vec<String> {
    let mut args = Vec::new();
    if headless {
        args.push("--headless=new".to_string());
    }
    args.push(format!("--user-agent={}", CHROME_USER_AGENT));
    // Hide navigator.webdriver and other automation indicators.
    args.push("--disable-blink-features=AutomationControlled".to_string());
    args.extend(
        [
            "--disable-gpu",
            "--no-sandbox",
            "--disable-dev-shm-usage",
            "--disable-extensions",
            "--disable-background-networking",
            "--disable-default-apps",
            "--disable-sync",
            "--disable-translate",
            "--mute-audio",
            "--no-first-run",
            "--window-size=1920,1080",
        ]
        .map(str::to_string),
    );
    if let Some(proxy) = proxy {
        args.push(format!(
            "--proxy-server={}://{}",
            proxy.protocol.scheme(),
            proxy.address()
        ));
    }
    args
}

fn cdp_error(context: &'static str) -> impl Fn(CdpError) -> ScrapeError {
    move |e| ScrapeError::Browser(format!("{}: {}", context, e))
}

fn input_selector(profile: &EngineProfile) -> String {
    format!("input[name='{}'], textarea[name='{}']", profile.input_field, profile.input_field)
}

/// Polls for an element until it shows up or `timeout` elapses.
async fn wait_for_selector(page: &Page, css: &str, timeout: Duration) -> Result<Element> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if let Ok(Ok(element)) = tokio::time::timeout(remaining, page.find_element(css)).await {
            return Ok(element);
        }
        if Instant::now() >= deadline {
            return Err(ScrapeError::Browser(format!(
                "Timed out after {:?} waiting for '{}'",
                timeout, css
            )));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Polls the current URL until it contains any of `needles`.
async fn wait_for_url(page: &Page, needles: &[String], timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if let Ok(Some(url)) = page.url().await {
            if needles.iter().any(|n| url.contains(n.as_str())) {
                return true;
            }
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    false
}

/// Transport backed by one browser process.
pub struct BrowserTransport {
    worker_id: usize,
    settings: BrowserSettings,
    proxy: RwLock<Option<Proxy>>,
    solver: Arc<dyn CaptchaSolver>,
    inner: Mutex<Inner>,
}

impl BrowserTransport {
    /// The browser itself is launched lazily on the first fetch.
    pub fn new(
        worker_id: usize,
        proxy: Option<Proxy>,
        settings: BrowserSettings,
        solver: Arc<dyn CaptchaSolver>,
    ) -> Self {
        Self {
            worker_id,
            settings,
            proxy: RwLock::new(proxy),
            solver,
            inner: Mutex::new(Inner {
                launched: None,
                session: Session::new(),
            }),
        }
    }

    async fn launch(&self) -> Result<Launched> {
        let chrome = resolve_chrome(self.settings.chrome_path.as_deref())?;
        debug!("Launching {} for worker {}", chrome.display(), self.worker_id);

        let proxy = self.proxy();
        if proxy.as_ref().is_some_and(|p| p.username.is_some()) {
            warn!("Chrome cannot pass proxy credentials on the command line; they are ignored");
        }

        let mut builder = BrowserConfig::builder()
            .chrome_executable(chrome)
            .request_timeout(self.settings.wait_timeout);
        if !self.settings.headless {
            builder = builder.with_head();
        }
        for arg in launch_args(self.settings.headless, proxy.as_ref()) {
            builder = builder.arg(arg);
        }
        let config = builder
            .build()
            .map_err(|e| ScrapeError::Browser(format!("Failed to build browser config: {}", e)))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(cdp_error("Failed to launch browser"))?;

        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    warn!("Browser CDP handler error: {}", e);
                }
            }
            debug!("Browser CDP handler exited");
        });

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(cdp_error("Failed to open tab"))?;

        info!(
            "Browser for worker {} started{}",
            self.worker_id,
            proxy.map(|p| format!(" via {}", p)).unwrap_or_default()
        );
        Ok(Launched {
            browser,
            page,
            handler,
        })
    }

    async fn drive(&self, job: &Job) -> Result<FetchOutcome> {
        let mut guard = self.inner.lock().await;
        if guard.launched.is_none() {
            match self.launch().await {
                Ok(launched) => guard.launched = Some(launched),
                Err(e) => return Ok(FetchOutcome::StopScraping(e.to_string())),
            }
        }
        let Inner { launched, session } = &mut *guard;
        let Some(launched) = launched.as_ref() else {
            return Ok(FetchOutcome::StopScraping("browser is not running".to_string()));
        };
        let page = &launched.page;
        let profile = job.engine.profile();

        let mut reached = true;
        if session.continues(job) {
            reached = self.turn_page(page, job, session).await?;
        } else {
            if let Some(denied) = self.start_query(page, job, session).await? {
                return Ok(denied);
            }
            while session.page < job.page && reached {
                reached = self.turn_page(page, job, session).await?;
            }
        }

        let html = page.content().await.map_err(cdp_error("Failed to get page content"))?;
        let url = page.url().await.ok().flatten().unwrap_or_default();

        if profile.denial.is_some_and(|n| n.matches(&url, &html)) {
            warn!("{} shows a blocking page to worker {}", job.engine, self.worker_id);
            session.reset();
            return Ok(FetchOutcome::Denied {
                status: None,
                reason: "unusual traffic page".to_string(),
            });
        }

        // The DOM still shows the last real page; it must not be stored as this one.
        if !reached {
            return Ok(FetchOutcome::PastLastPage {
                last_page: session.page,
            });
        }

        let exhausted = profile.exhausted_marker.is_some_and(|m| html.contains(m));
        let mut raw = RawResponse::new(html.into_bytes(), url, ScrapeMethod::Selenium);
        raw.exhausted = exhausted;
        Ok(FetchOutcome::Ok(raw))
    }

    /// Landing page, query typed and submitted, first results visible.
    /// Returns a denial when the search box never shows up on a block page.
    async fn start_query(
        &self,
        page: &Page,
        job: &Job,
        session: &mut Session,
    ) -> Result<Option<FetchOutcome>> {
        let profile = job.engine.profile();
        let search_type = self.settings.fetch.search_type;
        let landing = profile.landing_url_for(search_type).ok_or_else(|| {
            ScrapeError::Browser(format!(
                "{} has no landing page for {} search",
                job.engine, search_type
            ))
        })?;

        session.advance(BrowserStage::Landing)?;
        session.engine = Some(job.engine);
        session.query = job.query.clone();
        session.page = 0;

        page.goto(landing).await.map_err(cdp_error("Navigation failed"))?;

        let input = match wait_for_selector(page, &input_selector(profile), self.settings.wait_timeout)
            .await
        {
            Ok(input) => input,
            Err(e) => {
                let html = page.content().await.unwrap_or_default();
                let url = page.url().await.ok().flatten().unwrap_or_default();
                if profile.denial.is_some_and(|n| n.matches(&url, &html)) {
                    session.reset();
                    return Ok(Some(FetchOutcome::Denied {
                        status: None,
                        reason: "search box hidden behind a blocking page".to_string(),
                    }));
                }
                return Err(e);
            }
        };

        input
            .click()
            .await
            .map_err(cdp_error("Failed to focus search box"))?
            .type_str(&job.query)
            .await
            .map_err(cdp_error("Failed to type query"))?
            .press_key("Enter")
            .await
            .map_err(cdp_error("Failed to submit query"))?;
        session.advance(BrowserStage::QueryEntered)?;

        self.wait_for_results(page, job, profile).await;
        session.advance(BrowserStage::ResultsVisible)?;
        session.page = 1;
        Ok(None)
    }

    /// Moves to the next result page. Returns `false` when there is none.
    async fn turn_page(&self, page: &Page, job: &Job, session: &mut Session) -> Result<bool> {
        let profile = job.engine.profile();
        session.advance(BrowserStage::NextClicked)?;

        match profile.next_page_selector {
            Some(css) => {
                let Ok(next) = page.find_element(css).await else {
                    debug!("{} has no page after {} for '{}'", job.engine, session.page, job.query);
                    session.advance(BrowserStage::ResultsVisible)?;
                    return Ok(false);
                };
                next.click().await.map_err(cdp_error("Failed to click next page"))?;
                self.wait_for_results(page, job, profile).await;
            }
            None => {
                page.evaluate("window.scrollTo(0, document.body.scrollHeight)")
                    .await
                    .map_err(cdp_error("Failed to scroll"))?;
                tokio::time::sleep(SCROLL_SETTLE).await;
            }
        }

        session.advance(BrowserStage::ResultsVisible)?;
        session.page += 1;
        Ok(true)
    }

    /// Best effort: the last page has no next link, and an empty result
    /// page may lack the ready marker.
    async fn wait_for_results(&self, page: &Page, job: &Job, profile: &EngineProfile) {
        let timeout = self.settings.wait_timeout;
        let ready = if profile.query_in_url {
            let needles = [
                urlencoding::encode(&job.query).into_owned(),
                job.query.replace(' ', "+"),
            ];
            wait_for_url(page, &needles, timeout).await
        } else if let Some(css) = profile.results_ready_selector.or(profile.next_page_selector) {
            wait_for_selector(page, css, timeout).await.is_ok()
        } else {
            page.wait_for_navigation().await.is_ok()
        };
        if !ready {
            debug!("{} results for '{}' not confirmed within {:?}", job.engine, job.query, timeout);
        }
    }

    async fn solve_captcha(&self, page: &Page, job: &Job) -> Result<bool> {
        let shot = page
            .screenshot(ScreenshotParams::builder().full_page(true).build())
            .await
            .map_err(cdp_error("Failed to take screenshot"))?;
        let path = std::env::temp_dir().join(format!("a3s-serp-captcha-{}.png", self.worker_id));
        tokio::fs::write(&path, shot).await?;

        let answer = solve_exclusive(self.solver.as_ref(), job.engine, &path).await;
        if let Err(e) = tokio::fs::remove_file(&path).await {
            debug!("Could not remove {}: {}", path.display(), e);
        }
        let Some(answer) = answer? else {
            return Ok(false);
        };

        wait_for_selector(page, CAPTCHA_INPUT, self.settings.wait_timeout)
            .await?
            .click()
            .await
            .map_err(cdp_error("Failed to focus captcha input"))?
            .type_str(&answer)
            .await
            .map_err(cdp_error("Failed to type captcha"))?
            .press_key("Enter")
            .await
            .map_err(cdp_error("Failed to submit captcha"))?;

        let profile = job.engine.profile();
        Ok(wait_for_selector(page, &input_selector(profile), self.settings.wait_timeout)
            .await
            .is_ok())
    }
}

#[async_trait]
impl Transport for BrowserTransport {
    fn method(&self) -> ScrapeMethod {
        ScrapeMethod::Selenium
    }

    fn proxy(&self) -> Option<Proxy> {
        self.proxy.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    async fn fetch(&self, job: &Job) -> FetchOutcome {
        match self.drive(job).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.inner.lock().await.session.reset();
                FetchOutcome::NetworkError(e.to_string())
            }
        }
    }

    /// Takes effect on the next launch; the running browser is closed.
    async fn switch_proxy(&self, proxy: Option<Proxy>) -> Result<()> {
        *self.proxy.write().unwrap_or_else(PoisonError::into_inner) = proxy;
        self.close().await;
        Ok(())
    }

    async fn handle_denied(&self, job: &Job) -> DenialResolution {
        let guard = self.inner.lock().await;
        let Some(launched) = guard.launched.as_ref() else {
            return DenialResolution::Unresolved;
        };
        let page = &launched.page;

        if self.settings.manual_captcha_solving {
            return match self.solve_captcha(page, job).await {
                Ok(true) => DenialResolution::Resolved,
                Ok(false) => DenialResolution::Unresolved,
                Err(e) => {
                    warn!("Captcha for {} not solved: {}", job.engine, e);
                    DenialResolution::Unresolved
                }
            };
        }

        if self.settings.stop_on_detection {
            warn!("Worker {} detected by {}", self.worker_id, job.engine);
            return DenialResolution::Detected;
        }

        info!(
            "Worker {} waiting up to {:?} for the block on {} to be lifted",
            self.worker_id, self.settings.detection_wait, job.engine
        );
        let css = input_selector(job.engine.profile());
        match wait_for_selector(page, &css, self.settings.detection_wait).await {
            Ok(_) => DenialResolution::Resolved,
            Err(_) => DenialResolution::Unresolved,
        }
    }

    async fn close(&self) {
        let mut guard = self.inner.lock().await;
        if let Some(mut launched) = guard.launched.take() {
            if let Err(e) = launched.browser.close().await {
                warn!("Failed to close browser: {}", e);
            }
            if let Err(e) = launched.browser.wait().await {
                debug!("Browser process wait failed: {}", e);
            }
            launched.handler.abort();
            debug!("Browser for worker {} closed", self.worker_id);
        }
        guard.session.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::ProxyProtocol;

    #[test]
    fn test_launch_args_with_proxy() {
        let proxy = Proxy::new("10.1.2.3", 1080).with_protocol(ProxyProtocol::Socks5);
        let args = launch_args(true, Some(&proxy));
        assert!(args.contains(&"--headless=new".to_string()));
        assert!(args.contains(&"--proxy-server=socks5://10.1.2.3:1080".to_string()));
        assert!(args
            .iter()
            .any(|a| a.starts_with("--user-agent=") && !a.contains("Headless")));
    }

    #[test]
    fn test_launch_args_headed_without_proxy() {
        let args = launch_args(false, None);
        assert!(!args.iter().any(|a| a.starts_with("--headless")));
        assert!(!args.iter().any(|a| a.starts_with("--proxy-server")));
        assert!(args.contains(&"--disable-blink-features=AutomationControlled".to_string()));
    }

    #[test]
    fn test_stage_transitions() {
        use BrowserStage::*;
        assert!(Blank.can_advance_to(Landing));
        assert!(Landing.can_advance_to(QueryEntered));
        assert!(QueryEntered.can_advance_to(ResultsVisible));
        assert!(ResultsVisible.can_advance_to(NextClicked));
        assert!(NextClicked.can_advance_to(ResultsVisible));
        assert!(ResultsVisible.can_advance_to(Landing));
        assert!(!Blank.can_advance_to(ResultsVisible));
        assert!(!Landing.can_advance_to(NextClicked));
        assert!(!QueryEntered.can_advance_to(NextClicked));
    }

    #[test]
    fn test_session_continues_only_on_next_page() {
        let mut session = Session::new();
        let page2 = Job::new("rust", SearchEngine::Bing, 2, ScrapeMethod::Selenium);
        assert!(!session.continues(&page2));

        session.advance(BrowserStage::Landing).unwrap();
        session.advance(BrowserStage::QueryEntered).unwrap();
        session.advance(BrowserStage::ResultsVisible).unwrap();
        session.engine = Some(SearchEngine::Bing);
        session.query = "rust".to_string();
        session.page = 1;
        assert!(session.continues(&page2));

        let page3 = Job::new("rust", SearchEngine::Bing, 3, ScrapeMethod::Selenium);
        assert!(!session.continues(&page3));
        let other_engine = Job::new("rust", SearchEngine::Yahoo, 2, ScrapeMethod::Selenium);
        assert!(!session.continues(&other_engine));

        assert!(session.advance(BrowserStage::QueryEntered).is_err());
        session.reset();
        assert_eq!(session.stage, BrowserStage::Blank);
    }

    #[test]
    fn test_input_selector() {
        let css = input_selector(SearchEngine::Yandex.profile());
        assert!(css.contains("input[name='text']"));
    }

    #[tokio::test]
    #[ignore] // Requires Chrome and network access
    async fn test_browser_fetch_live() {
        let settings = BrowserSettings {
            headless: true,
            chrome_path: None,
            wait_timeout: Duration::from_secs(15),
            detection_wait: Duration::from_secs(1),
            manual_captcha_solving: false,
            stop_on_detection: true,
            fetch: FetchSettings::default(),
        };
        let solver = Arc::new(crate::captcha::StdinSolver::new(Duration::from_secs(1)));
        let transport = BrowserTransport::new(0, None, settings, solver);
        let job = Job::new("rust programming", SearchEngine::Bing, 1, ScrapeMethod::Selenium);
        let outcome = transport.fetch(&job).await;
        transport.close().await;
        assert!(matches!(outcome, FetchOutcome::Ok(_) | FetchOutcome::Denied { .. }));
    }
}
