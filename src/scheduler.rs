//! Run orchestration.
//!
//! The scheduler partitions jobs over workers, binds every worker to one
//! proxy identity, runs them to completion and drains the sink.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use futures::future::join_all;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::{CacheLookup, CacheStore, Fingerprint};
use crate::config::ScrapeConfig;
use crate::engine::SearchEngine;
use crate::fetcher::{ScrapeMethod, TransportFactory};
use crate::job::{Job, JobState};
use crate::proxy::Proxy;
use crate::serp::ScraperRun;
use crate::sink::{OutputWriter, SerpSink, SerpStore, SinkOptions, SinkStats};
use crate::worker::{DenialTracker, Flow, RunContext, Worker, WorkerStats};
use crate::{Result, ScrapeError};

/// One worker's share of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub worker_id: usize,
    pub method: ScrapeMethod,
    /// Identity for the worker's lifetime; `None` is the local IP.
    pub proxy: Option<Proxy>,
    pub jobs: Vec<Job>,
}

/// Splits jobs into `parts` contiguous chunks whose sizes differ by at most one.
fn chunk_evenly(jobs: Vec<Job>, parts: usize) -> Vec<Vec<Job>> {
    let parts = parts.max(1);
    let base = jobs.len() / parts;
    let extra = jobs.len() % parts;
    let mut jobs = jobs.into_iter();
    (0..parts)
        .map(|i| jobs.by_ref().take(base + usize::from(i < extra)).collect::<Vec<_>>())
        .filter(|chunk| !chunk.is_empty())
        .collect()
}

/// Partitions jobs over workers.
///
/// Jobs pinned to a proxy get a dedicated worker per `(transport, proxy)`.
/// The rest are chunked per transport: parallel transports over
/// `worker_count` workers, the async transport over one worker per proxy
/// identity. Proxies are dealt round-robin, so workers share proxies when
/// they outnumber them.
pub fn plan(jobs: Vec<Job>, proxies: &[Option<Proxy>], worker_count: usize) -> Vec<Assignment> {
    let identities: Vec<Option<Proxy>> = if proxies.is_empty() {
        vec![None]
    } else {
        proxies.to_vec()
    };

    let mut pinned: Vec<Assignment> = Vec::new();
    let mut shared: BTreeMap<ScrapeMethod, Vec<Job>> = BTreeMap::new();
    for job in jobs {
        let Some(proxy) = job.proxy.clone() else {
            shared.entry(job.method).or_default().push(job);
            continue;
        };
        match pinned
            .iter_mut()
            .find(|a| a.method == job.method && a.proxy.as_ref() == Some(&proxy))
        {
            Some(assignment) => assignment.jobs.push(job),
            None => pinned.push(Assignment {
                worker_id: 0,
                method: job.method,
                proxy: Some(proxy),
                jobs: vec![job],
            }),
        }
    }

    let mut assignments = Vec::new();
    for (method, jobs) in shared {
        let workers = match method {
            ScrapeMethod::HttpAsync => identities.len(),
            _ => worker_count.max(1),
        };
        for (i, chunk) in chunk_evenly(jobs, workers).into_iter().enumerate() {
            assignments.push(Assignment {
                worker_id: 0,
                method,
                proxy: identities[i % identities.len()].clone(),
                jobs: chunk,
            });
        }
    }
    assignments.extend(pinned);

    for (id, assignment) in assignments.iter_mut().enumerate() {
        assignment.worker_id = id;
    }
    assignments
}

/// Outcome of a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: i64,
    /// Every job of the run, in terminal state, ordered by id.
    pub jobs: Vec<Job>,
    pub workers: Vec<WorkerStats>,
    pub denials: u32,
    pub cache_hits: u64,
    pub sink: SinkStats,
    pub cancelled: bool,
    /// Engine whose detection stopped a worker or halted the run.
    pub detected_by: Option<String>,
}

impl RunReport {
    pub fn count(&self, state: JobState) -> usize {
        self.jobs.iter().filter(|j| j.state == state).count()
    }

    /// Whether every job reached a terminal state.
    pub fn is_complete(&self) -> bool {
        self.jobs.iter().all(|j| j.state.is_terminal())
    }

    /// Turns an interrupted or detected run into the matching error.
    pub fn status(&self) -> Result<()> {
        if self.cancelled {
            return Err(ScrapeError::Cancelled);
        }
        match &self.detected_by {
            Some(engine) => Err(ScrapeError::Detected(engine.clone())),
            None => Ok(()),
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "run {}: {} jobs (done={}, failed={}, skipped={}), {} SERPs stored, {} cache hits, {} denials",
            self.run_id,
            self.jobs.len(),
            self.count(JobState::Done),
            self.count(JobState::Failed),
            self.count(JobState::Skipped),
            self.sink.stored,
            self.cache_hits,
            self.denials
        )
    }
}

/// Orchestrates one run.
pub struct Scheduler {
    config: Arc<ScrapeConfig>,
    factory: Arc<dyn TransportFactory>,
    store: Arc<SerpStore>,
    proxies: Vec<Option<Proxy>>,
    output: Option<OutputWriter>,
    cancel: CancellationToken,
}

impl Scheduler {
    /// Creates a scheduler that scrapes from the local IP.
    pub fn new(
        config: Arc<ScrapeConfig>,
        factory: Arc<dyn TransportFactory>,
        store: Arc<SerpStore>,
    ) -> Self {
        Self {
            config,
            factory,
            store,
            proxies: vec![None],
            output: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Sets the proxy identities, as returned by `ProxyPool::endpoints`.
    pub fn with_proxies(mut self, proxies: Vec<Option<Proxy>>) -> Self {
        self.proxies = proxies;
        self
    }

    pub fn with_output(mut self, output: OutputWriter) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that stops the run when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    async fn prepare_cache(&self) -> Option<CacheStore> {
        if !self.config.do_caching {
            return None;
        }
        let cache = CacheStore::new(
            &self.config.cachedir,
            self.config.compress_cached_files,
            self.config.cache_ttl(),
        );
        match cache.purge_expired().await {
            Ok(0) => {}
            Ok(purged) => info!("Purged {} expired cache entries", purged),
            Err(e) => warn!("Cache purge failed: {}", e),
        }
        Some(cache)
    }

    /// Runs every job to a terminal state and drains the sink.
    pub async fn run(self, jobs: Vec<Job>) -> Result<RunReport> {
        let total = jobs.len();
        let mut engines: Vec<SearchEngine> = Vec::new();
        for job in &jobs {
            if !engines.contains(&job.engine) {
                engines.push(job.engine);
            }
        }
        let query_count = jobs
            .iter()
            .map(|j| j.query.as_str())
            .collect::<HashSet<_>>()
            .len();
        let proxy_count = self.proxies.iter().flatten().count();

        let assignments = plan(jobs, &self.proxies, self.config.worker_count());
        let transports = assignments
            .iter()
            .map(|a| self.factory.create(a.method, a.proxy.clone(), a.worker_id))
            .collect::<Result<Vec<_>>>()?;

        let cache = self.prepare_cache().await;

        let mut run = ScraperRun::new(engines, proxy_count, query_count);
        run.keyword_file = self
            .config
            .keyword_file
            .as_ref()
            .map(|p| p.display().to_string());
        let run_id = self.store.begin_run(&mut run).await?;
        info!(
            "Run {} started: {} jobs on {} workers",
            run_id,
            total,
            assignments.len()
        );

        let options = SinkOptions {
            batch_size: self.config.sink_batch_size,
            queue_capacity: self.config.sink_queue_capacity,
            total_jobs: total,
        };
        let (sink, sink_task) =
            SerpSink::start(Arc::clone(&self.store), self.output, options, self.cancel.clone());

        let denials = Arc::new(DenialTracker::from_config(&self.config));
        let ctx = Arc::new(RunContext {
            run_id,
            config: Arc::clone(&self.config),
            cache,
            sink: sink.clone(),
            denials: Arc::clone(&denials),
            cancel: self.cancel.clone(),
        });

        let mut workers = Vec::new();
        let mut parallel = Vec::new();
        let mut concurrent = Vec::new();
        for (assignment, transport) in assignments.into_iter().zip(transports) {
            let worker = Arc::new(Worker::new(assignment.worker_id, transport, Arc::clone(&ctx)));
            debug!(
                worker = worker.name(),
                "Assigned {} jobs",
                assignment.jobs.len()
            );
            workers.push(Arc::clone(&worker));
            if assignment.method == ScrapeMethod::HttpAsync {
                concurrent.push((worker, assignment.jobs));
            } else {
                parallel.push((worker, assignment.jobs));
            }
        }

        let (mut finished, async_jobs) = tokio::join!(
            run_parallel(parallel),
            run_concurrent(concurrent, self.config.max_concurrent_requests)
        );
        finished.extend(async_jobs);

        let cancelled = self.cancel.is_cancelled();
        if cancelled {
            info!("Run {} cancelled, draining results", run_id);
        }

        let drained = sink.drain().await;
        if let Err(e) = sink_task.await {
            warn!("Sink task ended abnormally: {}", e);
        }

        run.finish();
        let recorded = self.store.finish_run(&run).await;
        let sink_stats = drained?;
        recorded?;

        for job in finished.iter_mut() {
            if job.skip() {
                debug!("Job {} never finished, marked skipped", job.id);
            }
        }
        finished.sort_by_key(|j| j.id);

        let worker_stats: Vec<WorkerStats> = workers.iter().map(|w| w.stats()).collect();
        let report = RunReport {
            run_id,
            cache_hits: worker_stats.iter().map(|w| w.cache_hits).sum(),
            detected_by: worker_stats.iter().find_map(|w| w.detected_by.clone()),
            workers: worker_stats,
            jobs: finished,
            denials: denials.count(),
            sink: sink_stats,
            cancelled,
        };
        info!("Finished {}", report.summary());
        Ok(report)
    }
}

/// One task per worker; each walks its jobs in order.
async fn run_parallel(workers: Vec<(Arc<Worker>, Vec<Job>)>) -> Vec<Job> {
    let (handles, backups): (Vec<_>, Vec<_>) = workers
        .into_iter()
        .map(|(worker, jobs)| {
            let backup = jobs.clone();
            (tokio::spawn(async move { worker.run(jobs).await }), backup)
        })
        .unzip();

    let mut finished = Vec::new();
    for (result, backup) in join_all(handles).await.into_iter().zip(backups) {
        match result {
            Ok(jobs) => finished.extend(jobs),
            Err(e) => {
                error!("Worker task failed: {}", e);
                finished.extend(backup.into_iter().map(|mut job| {
                    job.state = JobState::Failed;
                    job.error = Some(format!("worker task failed: {}", e));
                    job
                }));
            }
        }
    }
    finished
}

/// All async jobs on one loop, at most `limit` in flight.
async fn run_concurrent(workers: Vec<(Arc<Worker>, Vec<Job>)>, limit: usize) -> Vec<Job> {
    if workers.is_empty() {
        return Vec::new();
    }
    let handles: Vec<Arc<Worker>> = workers.iter().map(|(w, _)| Arc::clone(w)).collect();
    for (worker, jobs) in &workers {
        worker.start();
        info!(worker = worker.name(), "Worker started with {} jobs", jobs.len());
    }

    let tasks = workers.into_iter().flat_map(|(worker, jobs)| {
        jobs.into_iter().map(move |job| (Arc::clone(&worker), job))
    });
    let finished = stream::iter(tasks)
        .map(|(worker, mut job)| async move {
            if worker.should_stop() {
                job.skip();
            } else if worker.process(&mut job).await == Flow::Stop {
                worker.close().await;
            }
            job
        })
        .buffer_unordered(limit.max(1))
        .collect::<Vec<_>>()
        .await;

    for worker in handles {
        worker.close().await;
    }
    finished
}

/// A planned worker, as shown by `--simulate`.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedWorker {
    pub id: usize,
    pub method: ScrapeMethod,
    pub proxy: Option<String>,
    pub jobs: usize,
}

/// What a run would do.
#[derive(Debug, Clone, Serialize)]
pub struct Simulation {
    pub jobs: usize,
    pub workers: Vec<PlannedWorker>,
    /// Jobs whose page is already cached.
    pub cache_hits: usize,
}

impl fmt::Display for Simulation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} jobs on {} workers, {} cached",
            self.jobs,
            self.workers.len(),
            self.cache_hits
        )?;
        for worker in &self.workers {
            writeln!(
                f,
                "  worker {:>3}  {:<10}  {:<21}  {} jobs",
                worker.id,
                worker.method.tag(),
                worker.proxy.as_deref().unwrap_or("local"),
                worker.jobs
            )?;
        }
        Ok(())
    }
}

/// Plans a run without touching the network.
pub async fn simulate(config: &ScrapeConfig, jobs: Vec<Job>, proxies: &[Option<Proxy>]) -> Simulation {
    let mut cache_hits = 0;
    if config.do_caching {
        let cache = CacheStore::new(
            &config.cachedir,
            config.compress_cached_files,
            config.cache_ttl(),
        );
        for job in &jobs {
            if let CacheLookup::Hit(_) = cache.lookup(&Fingerprint::for_job(job)).await {
                cache_hits += 1;
            }
        }
    }

    let total = jobs.len();
    let workers = plan(jobs, proxies, config.worker_count())
        .into_iter()
        .map(|a| PlannedWorker {
            id: a.worker_id,
            method: a.method,
            proxy: a.proxy.map(|p| p.address()),
            jobs: a.jobs.len(),
        })
        .collect();
    Simulation {
        jobs: total,
        workers,
        cache_hits,
    }
}
