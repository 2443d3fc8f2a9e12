//! Result sink.
//!
//! Workers hand SERPs to a bounded queue drained by a single consumer task.
//! The consumer drops repeated `(engine, query, page)` SERPs, streams the
//! rest to the configured output and commits them to the store in batches.
//! A store failure cancels the run.

pub mod output;
pub mod store;

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub use output::{OutputWriter, CSV_HEADER};
pub use store::SerpStore;

use crate::engine::SearchEngine;
use crate::serp::Serp;
use crate::{Result, ScrapeError};

/// Messages understood by the sink consumer.
pub enum SinkMessage {
    Serp(Box<Serp>),
    /// Flush everything, close the output and stop.
    Drain(oneshot::Sender<Result<SinkStats>>),
}

/// What the sink did over its lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SinkStats {
    pub received: usize,
    pub stored: usize,
    pub duplicates: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct SinkOptions {
    pub batch_size: usize,
    pub queue_capacity: usize,
    /// Jobs in the run, for progress reporting.
    pub total_jobs: usize,
}

/// Producer handle; cheap to clone into every worker.
#[derive(Clone)]
pub struct SerpSink {
    tx: mpsc::Sender<SinkMessage>,
}

impl SerpSink {
    /// Spawns the consumer task.
    pub fn start(
        store: Arc<SerpStore>,
        output: Option<OutputWriter>,
        options: SinkOptions,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(options.queue_capacity.max(1));
        let consumer = SinkConsumer {
            rx,
            store,
            output,
            batch: Vec::with_capacity(options.batch_size),
            batch_size: options.batch_size.max(1),
            seen: HashSet::new(),
            stats: SinkStats::default(),
            total_jobs: options.total_jobs,
            failure: None,
            cancel,
        };
        let handle = tokio::spawn(consumer.run());
        (Self { tx }, handle)
    }

    /// Queues a SERP, waiting while the queue is full.
    pub async fn submit(&self, serp: Serp) -> Result<()> {
        self.tx
            .send(SinkMessage::Serp(Box::new(serp)))
            .await
            .map_err(|_| ScrapeError::Sink("Sink is closed".to_string()))
    }

    /// Sends the drain sentinel and waits until everything queued before it
    /// is committed.
    pub async fn drain(&self) -> Result<SinkStats> {
        let (respond_to, response) = oneshot::channel();
        self.tx
            .send(SinkMessage::Drain(respond_to))
            .await
            .map_err(|_| ScrapeError::Sink("Sink is closed".to_string()))?;
        response
            .await
            .map_err(|_| ScrapeError::Sink("Sink stopped before draining".to_string()))?
    }
}

struct SinkConsumer {
    rx: mpsc::Receiver<SinkMessage>,
    store: Arc<SerpStore>,
    output: Option<OutputWriter>,
    batch: Vec<Serp>,
    batch_size: usize,
    seen: HashSet<(SearchEngine, String, u32)>,
    stats: SinkStats,
    total_jobs: usize,
    failure: Option<String>,
    cancel: CancellationToken,
}

impl SinkConsumer {
    async fn run(mut self) {
        info!(
            "Sink started (batch_size={}, total_jobs={})",
            self.batch_size, self.total_jobs
        );

        while let Some(message) = self.rx.recv().await {
            match message {
                SinkMessage::Serp(serp) => self.accept(*serp).await,
                SinkMessage::Drain(respond_to) => {
                    let result = self.close().await;
                    let _ = respond_to.send(result);
                    info!("Sink stopped");
                    return;
                }
            }
        }

        // Every producer went away without draining.
        if let Err(e) = self.close().await {
            error!("Sink shutdown failed: {}", e);
        }
    }

    async fn accept(&mut self, serp: Serp) {
        if self.failure.is_some() {
            return;
        }
        if !self.seen.insert(serp.key()) {
            self.stats.duplicates += 1;
            debug!(
                "Dropping duplicate SERP {} page {} for '{}'",
                serp.engine, serp.page, serp.query
            );
            return;
        }
        self.stats.received += 1;

        if let Some(output) = self.output.as_mut() {
            if let Err(e) = output.write_serp(&serp) {
                self.fail(e);
                return;
            }
        }

        self.batch.push(serp);
        if self.batch.len() >= self.batch_size {
            self.flush().await;
        }
        self.log_progress();
    }

    fn log_progress(&self) {
        let done = self.stats.received;
        debug!("Processed {}/{} jobs", done, self.total_jobs);
        let step = (self.total_jobs / 10).max(1);
        if done % step == 0 || done == self.total_jobs {
            info!("Progress: {}/{} result pages", done, self.total_jobs);
        }
    }

    async fn flush(&mut self) {
        if self.batch.is_empty() || self.failure.is_some() {
            return;
        }
        match self.store.insert_batch(&self.batch).await {
            Ok(()) => {
                debug!("Committed {} SERPs", self.batch.len());
                self.stats.stored += self.batch.len();
                self.batch.clear();
            }
            Err(e) => self.fail(e),
        }
    }

    fn fail(&mut self, e: ScrapeError) {
        error!("Sink failure, stopping the run: {}", e);
        self.failure = Some(e.to_string());
        self.cancel.cancel();
    }

    async fn close(&mut self) -> Result<SinkStats> {
        self.flush().await;
        if let Some(output) = self.output.as_mut() {
            if let Err(e) = output.finish() {
                if self.failure.is_none() {
                    self.fail(e);
                }
            }
        }
        match &self.failure {
            Some(message) => Err(ScrapeError::Sink(message.clone())),
            None => Ok(self.stats),
        }
    }
}
