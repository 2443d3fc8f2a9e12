//! Job execution.
//!
//! A [`Worker`] owns one transport (and so at most one proxy identity) and
//! walks its jobs in order: cache lookup, fetch, parse, hand the SERP to the
//! sink. Parallel transports run one worker per task; the async transport
//! drives a single worker from many concurrent futures, so every method
//! takes `&self`.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{CacheLookup, CacheStore, Fingerprint};
use crate::config::ScrapeConfig;
use crate::engine::SearchEngine;
use crate::engines;
use crate::fetcher::{DenialResolution, FetchOutcome, ScrapeMethod, Transport};
use crate::job::{Job, JobState};
use crate::serp::Serp;
use crate::sink::SerpSink;
use crate::Result;

/// Retries granted after a denial the transport reports as resolved.
const MAX_DENIAL_RETRIES: u32 = 3;

/// Everything a worker shares with the rest of the run.
pub struct RunContext {
    pub run_id: i64,
    pub config: Arc<ScrapeConfig>,
    /// `None` when caching is off.
    pub cache: Option<CacheStore>,
    pub sink: SerpSink,
    pub denials: Arc<DenialTracker>,
    pub cancel: CancellationToken,
}

/// Run-wide denial counter for the HTTP transports.
#[derive(Debug)]
pub struct DenialTracker {
    count: AtomicU32,
    threshold: u32,
    stop_on_detection: bool,
    halted: AtomicBool,
}

impl DenialTracker {
    pub fn new(threshold: u32, stop_on_detection: bool) -> Self {
        Self {
            count: AtomicU32::new(0),
            threshold: threshold.max(1),
            stop_on_detection,
            halted: AtomicBool::new(false),
        }
    }

    pub fn from_config(config: &ScrapeConfig) -> Self {
        Self::new(config.detection_threshold, config.stop_on_detection)
    }

    /// Records a denial. Returns true when scheduling must halt.
    pub fn record(&self) -> bool {
        let count = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        if self.stop_on_detection && count >= self.threshold {
            self.halted.store(true, Ordering::SeqCst);
        }
        self.is_halted()
    }

    pub fn count(&self) -> u32 {
        self.count.load(Ordering::SeqCst)
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }
}

/// Worker lifecycle: `created → started → running ↔ sleeping → draining → closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Created,
    Started,
    Running,
    Sleeping,
    Draining,
    Closed,
}

impl WorkerState {
    pub fn can_transition_to(&self, next: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (*self, next),
            (Created, Started)
                | (Started, Running)
                | (Started, Sleeping)
                | (Running, Sleeping)
                | (Sleeping, Running)
                | (Running, Running)
                | (Started | Running | Sleeping, Draining)
                | (Draining, Closed)
        )
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerState::Created => "created",
            WorkerState::Started => "started",
            WorkerState::Running => "running",
            WorkerState::Sleeping => "sleeping",
            WorkerState::Draining => "draining",
            WorkerState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Whether the worker keeps taking jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    missed: AtomicU64,
    succeeded: AtomicU64,
    cache_hits: AtomicU64,
    denials: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Snapshot of a worker's counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub id: usize,
    pub name: String,
    pub method: ScrapeMethod,
    pub proxy: Option<String>,
    /// Requests sent over the network.
    pub sent: u64,
    /// Requests that were denied or failed.
    pub missed: u64,
    pub succeeded: u64,
    pub cache_hits: u64,
    pub denials: u64,
    /// Engine that detected this worker and made it stop.
    pub detected_by: Option<String>,
    pub state: WorkerState,
}

pub struct Worker {
    id: usize,
    name: String,
    transport: Arc<dyn Transport>,
    ctx: Arc<RunContext>,
    state: Mutex<WorkerState>,
    counters: Counters,
    requests: AtomicU64,
    exhausted: Mutex<HashSet<(SearchEngine, String)>>,
    detected_by: Mutex<Option<SearchEngine>>,
}

impl Worker {
    pub fn new(id: usize, transport: Arc<dyn Transport>, ctx: Arc<RunContext>) -> Self {
        let mut name = format!("{}-worker-{}", transport.method().tag(), id);
        if let Some(proxy) = transport.proxy() {
            name.push('@');
            name.push_str(&proxy.host);
        }
        Self {
            id,
            name,
            transport,
            ctx,
            state: Mutex::new(WorkerState::Created),
            counters: Counters::default(),
            requests: AtomicU64::new(0),
            exhausted: Mutex::new(HashSet::new()),
            detected_by: Mutex::new(None),
        }
    }

    /// Identity recorded as `requested_by` on every SERP.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: WorkerState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == next {
            return;
        }
        if state.can_transition_to(next) {
            *state = next;
        } else {
            debug!(worker = %self.name, "Ignoring transition {} -> {}", *state, next);
        }
    }

    /// Marks the worker started; no-op when it already is.
    pub fn start(&self) {
        self.set_state(WorkerState::Started);
    }

    pub fn stats(&self) -> WorkerStats {
        let detected_by = *self.detected_by.lock().unwrap_or_else(PoisonError::into_inner);
        WorkerStats {
            id: self.id,
            name: self.name.clone(),
            method: self.transport.method(),
            proxy: self.transport.proxy().map(|p| p.address()),
            sent: self.counters.sent.load(Ordering::Relaxed),
            missed: self.counters.missed.load(Ordering::Relaxed),
            succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            denials: self.counters.denials.load(Ordering::Relaxed),
            detected_by: detected_by.map(|engine| engine.to_string()),
            state: self.state(),
        }
    }

    /// Whether no further job may start.
    pub fn should_stop(&self) -> bool {
        self.ctx.cancel.is_cancelled()
            || self.ctx.denials.is_halted()
            || matches!(self.state(), WorkerState::Draining | WorkerState::Closed)
    }

    /// Processes jobs in order and returns them in terminal states.
    pub async fn run(&self, mut jobs: Vec<Job>) -> Vec<Job> {
        self.start();
        info!(worker = %self.name, "Worker started with {} jobs", jobs.len());

        let mut stopped = false;
        for job in jobs.iter_mut() {
            if stopped || self.should_stop() {
                job.skip();
                continue;
            }
            if self.process(job).await == Flow::Stop {
                stopped = true;
            }
        }

        self.close().await;
        jobs
    }

    /// Releases the transport. The worker takes no jobs afterwards.
    pub async fn close(&self) {
        if self.state() == WorkerState::Closed {
            return;
        }
        self.set_state(WorkerState::Draining);
        self.transport.close().await;
        self.set_state(WorkerState::Closed);
        let stats = self.stats();
        info!(
            worker = %self.name,
            "Worker closed (sent={}, succeeded={}, missed={}, cache_hits={})",
            stats.sent, stats.succeeded, stats.missed, stats.cache_hits
        );
    }

    /// Runs one job to a terminal state.
    pub async fn process(&self, job: &mut Job) -> Flow {
        match self.attempt(job).await {
            Ok(flow) => flow,
            Err(e) => {
                warn!(worker = %self.name, "Job {} aborted: {}", job.id, e);
                job.skip();
                Flow::Continue
            }
        }
    }

    async fn attempt(&self, job: &mut Job) -> Result<Flow> {
        if self.is_exhausted(job) {
            debug!(
                worker = %self.name,
                "{} has no more pages for '{}', skipping page {}",
                job.engine, job.query, job.page
            );
            job.skip();
            return Ok(Flow::Continue);
        }
        if job.method.is_http() && job.page > 1 && job.engine.profile().page_param.is_none() {
            debug!(
                worker = %self.name,
                "{} cannot page over http, skipping page {} of '{}'",
                job.engine, job.page, job.query
            );
            job.skip();
            return Ok(Flow::Continue);
        }

        let fingerprint = Fingerprint::for_job(job);
        if let Some(cache) = &self.ctx.cache {
            if let CacheLookup::Hit(body) = cache.lookup(&fingerprint).await {
                debug!(worker = %self.name, "Cache hit for {} '{}' page {}", job.engine, job.query, job.page);
                bump(&self.counters.cache_hits);
                job.start()?;
                return self.complete(job, &body, Utc::now(), false).await;
            }
        }

        let mut denial_retries = 0;
        loop {
            job.start()?;
            if !self.pace(job).await {
                job.skip();
                return Ok(Flow::Stop);
            }

            self.set_state(WorkerState::Running);
            bump(&self.counters.sent);
            debug!(
                worker = %self.name,
                "Fetching {} '{}' page {} (attempt {})",
                job.engine, job.query, job.page, job.attempts
            );

            let outcome = tokio::select! {
                outcome = self.transport.fetch(job) => Some(outcome),
                _ = self.ctx.cancel.cancelled() => None,
            };
            let Some(outcome) = outcome else {
                job.skip();
                return Ok(Flow::Stop);
            };

            match outcome {
                FetchOutcome::Ok(raw) => {
                    bump(&self.counters.succeeded);
                    if let Some(cache) = &self.ctx.cache {
                        if let Err(e) = cache.store(&fingerprint, &raw.body).await {
                            warn!(worker = %self.name, "Failed to cache {}: {}", fingerprint, e);
                        }
                    }
                    return self.complete(job, &raw.body, raw.requested_at, raw.exhausted).await;
                }
                FetchOutcome::Denied { status, reason } => {
                    bump(&self.counters.missed);
                    bump(&self.counters.denials);
                    warn!(
                        worker = %self.name,
                        "{} denied '{}' page {} (status {:?}): {}",
                        job.engine, job.query, job.page, status, reason
                    );

                    match self.transport.handle_denied(job).await {
                        DenialResolution::Resolved if denial_retries < MAX_DENIAL_RETRIES => {
                            denial_retries += 1;
                            info!(worker = %self.name, "Denial resolved, retrying job {}", job.id);
                            job.retry()?;
                        }
                        DenialResolution::Detected => {
                            self.mark_detected(job.engine);
                            job.fail(format!("detected: {}", reason))?;
                            return Ok(Flow::Stop);
                        }
                        _ => {
                            job.fail(reason)?;
                            return Ok(self.after_denial(job).await);
                        }
                    }
                }
                FetchOutcome::NetworkError(message) => {
                    bump(&self.counters.missed);
                    if job.attempts <= self.ctx.config.max_retries {
                        warn!(worker = %self.name, "Network error on job {}, retrying: {}", job.id, message);
                        job.retry()?;
                        continue;
                    }
                    warn!(worker = %self.name, "Network error on job {}: {}", job.id, message);
                    job.fail(message)?;
                    return Ok(Flow::Continue);
                }
                FetchOutcome::StopScraping(message) => {
                    bump(&self.counters.missed);
                    warn!(worker = %self.name, "Stopping worker: {}", message);
                    job.fail(message)?;
                    return Ok(Flow::Stop);
                }
                FetchOutcome::PastLastPage { last_page } => {
                    debug!(
                        worker = %self.name,
                        "{} stops at page {} for '{}', page {} does not exist",
                        job.engine, last_page, job.query, job.page
                    );
                    self.mark_exhausted(job);
                    job.skip();
                    return Ok(Flow::Continue);
                }
            }
        }
    }

    /// Applies the run-wide denial policy after a failed job.
    async fn after_denial(&self, job: &Job) -> Flow {
        if !job.method.is_http() {
            return Flow::Continue;
        }
        if self.ctx.denials.record() {
            self.mark_detected(job.engine);
            warn!(
                worker = %self.name,
                "Denial threshold reached ({} denials), halting the run",
                self.ctx.denials.count()
            );
            return Flow::Stop;
        }
        if !self.ctx.config.stop_on_detection {
            let backoff = self.ctx.config.proxy_detected_timeout();
            info!(worker = %self.name, "Backing off for {}s after denial", backoff.as_secs());
            if !self.sleep(backoff).await {
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    async fn complete(
        &self,
        job: &mut Job,
        body: &[u8],
        requested_at: DateTime<Utc>,
        exhausted: bool,
    ) -> Result<Flow> {
        let html = String::from_utf8_lossy(body);
        let serp = match engines::parse_page(
            job.engine,
            &html,
            &job.query,
            self.ctx.config.search_type,
        ) {
            Ok(parsed) => Serp::from_parsed(job, parsed, self.ctx.run_id, requested_at, self.name.as_str()),
            Err(e) => {
                warn!(
                    worker = %self.name,
                    "Could not parse {} page {} for '{}': {}",
                    job.engine, job.page, job.query, e
                );
                Serp::parse_failed(job, self.ctx.run_id, requested_at, self.name.as_str())
            }
        };

        let marker = job.engine.profile().exhausted_marker;
        if exhausted || marker.is_some_and(|m| html.contains(m)) {
            self.mark_exhausted(job);
        }

        if let Err(e) = self.ctx.sink.submit(serp).await {
            job.fail(e.to_string())?;
            return Ok(Flow::Stop);
        }
        job.finish(JobState::Done)?;
        Ok(Flow::Continue)
    }

    fn mark_detected(&self, engine: SearchEngine) {
        self.detected_by
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_insert(engine);
    }

    fn is_exhausted(&self, job: &Job) -> bool {
        self.exhausted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&(job.engine, job.query.clone()))
    }

    fn mark_exhausted(&self, job: &Job) {
        debug!(worker = %self.name, "{} reported the last page for '{}'", job.engine, job.query);
        self.exhausted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((job.engine, job.query.clone()));
    }

    /// Sleeps before every request but the first. Returns false on cancellation.
    async fn pace(&self, job: &Job) -> bool {
        if job.method == ScrapeMethod::HttpAsync {
            return !self.ctx.cancel.is_cancelled();
        }
        let done = self.requests.fetch_add(1, Ordering::Relaxed);
        if done == 0 {
            return !self.ctx.cancel.is_cancelled();
        }
        let delay = self.ctx.config.sleep_ranges_for(job.engine).delay_for(done);
        self.sleep(delay).await
    }

    async fn sleep(&self, delay: Duration) -> bool {
        if delay.is_zero() {
            return !self.ctx.cancel.is_cancelled();
        }
        self.set_state(WorkerState::Sleeping);
        debug!(worker = %self.name, "Sleeping {:.1}s", delay.as_secs_f64());
        let completed = tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = self.ctx.cancel.cancelled() => false,
        };
        self.set_state(WorkerState::Running);
        completed
    }
}
