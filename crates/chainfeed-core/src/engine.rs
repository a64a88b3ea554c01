//! The indexing engine: batching, bounded write jobs, backpressure and
//! height-safe checkpointing.
//!
//! # Producer
//! A single producer pulls blocks from the [`BlockFetcher`], feeds them to the
//! indexer's accumulator and dispatches full batches as write jobs. Only the
//! producer touches the batch, the job queue and the checkpoint.
//!
//! # Jobs
//! Each job runs `Indexer::write` under [`ExponentialBackoff`] on a
//! [`JoinSet`], gated by a semaphore with `concurrency` permits. The join set
//! doubles as the completion queue.
//!
//! # Checkpoints
//! Jobs are queued in dispatch order. A succeeded job at the front of the
//! queue is popped and its highest block becomes the confirmed position; a
//! failed job stays at the front. The committed checkpoint therefore never
//! passes a block whose write has not been confirmed.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};

use crate::backoff::ExponentialBackoff;
use crate::checkpoint::{Checkpoint, CheckpointManager};
use crate::error::IndexerError;
use crate::fetcher::BlockFetcher;
use crate::indexer::{Batch, EngineConfig, IndexOutcome, Indexer, RunState};
use crate::types::{BlockHash, ChainedHeader};

/// Progress counters, safe to read from a reporting task.
#[derive(Debug, Default)]
pub struct IndexCounters {
    scheduled: AtomicU64,
    indexed: AtomicU64,
}

impl IndexCounters {
    /// Items handed to write jobs.
    pub fn scheduled(&self) -> u64 {
        self.scheduled.load(Ordering::Relaxed)
    }

    /// Items whose write job succeeded.
    pub fn indexed(&self) -> u64 {
        self.indexed.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobState {
    Running,
    Succeeded,
    Failed,
}

/// One dispatched write job, as tracked by the producer.
#[derive(Debug)]
struct IndexJob {
    id: u64,
    /// Header of the highest block covered by the job.
    highest: Option<ChainedHeader>,
    items: u64,
    state: JobState,
}

/// Output of a job task: `(job id, result)`.
type JobResult = (u64, Result<(), IndexerError>);

/// Drives one indexer over a [`BlockFetcher`].
pub struct IndexingEngine<I: Indexer> {
    indexer: Arc<I>,
    checkpoints: CheckpointManager,
    config: EngineConfig,
    counters: Arc<IndexCounters>,
    state: RunState,
    permits: Arc<Semaphore>,
    tasks: JoinSet<JobResult>,
    queue: VecDeque<IndexJob>,
    next_job_id: u64,
    peak_outstanding: usize,
    stalls: u64,
    resume_outstanding: usize,
    fatal: Option<IndexerError>,
    confirmed: Option<ChainedHeader>,
}

impl<I: Indexer> IndexingEngine<I> {
    /// Create an engine. The checkpoint manager adopts the configured save
    /// interval and progression flag.
    pub fn new(indexer: I, checkpoints: CheckpointManager, config: EngineConfig) -> Self {
        let checkpoints = checkpoints
            .with_save_interval(config.save_interval)
            .with_save_progression(config.save_progression);
        Self {
            indexer: Arc::new(indexer),
            checkpoints,
            permits: Arc::new(Semaphore::new(config.concurrency.max(1))),
            config,
            counters: Arc::new(IndexCounters::default()),
            state: RunState::Idle,
            tasks: JoinSet::new(),
            queue: VecDeque::new(),
            next_job_id: 0,
            peak_outstanding: 0,
            stalls: 0,
            resume_outstanding: 0,
            fatal: None,
            confirmed: None,
        }
    }

    pub fn indexer(&self) -> &I {
        &self.indexer
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Shared counters; clone the `Arc` into a reporting task.
    pub fn counters(&self) -> Arc<IndexCounters> {
        self.counters.clone()
    }

    /// Most jobs ever outstanding at once during the run.
    pub fn peak_outstanding(&self) -> usize {
        self.peak_outstanding
    }

    /// Number of times dispatch paused on backpressure.
    pub fn stalls(&self) -> u64 {
        self.stalls
    }

    /// Most jobs outstanding when dispatch resumed after a pause.
    pub fn resume_outstanding(&self) -> usize {
        self.resume_outstanding
    }

    /// Last loaded or committed checkpoint.
    pub fn checkpoint(&self) -> Option<&Checkpoint> {
        self.checkpoints.checkpoint()
    }

    /// Load the checkpoint to resume from, or start at `genesis`.
    pub async fn load_checkpoint(&mut self, genesis: BlockHash) -> Result<Checkpoint, IndexerError> {
        self.checkpoints.load_or_create(genesis).await
    }

    /// Run the indexer until the fetcher is exhausted or cancelled.
    ///
    /// Returns the first fatal error once in-flight jobs have drained and the
    /// last safe checkpoint has been committed.
    pub async fn run(&mut self, fetcher: &mut BlockFetcher) -> Result<IndexOutcome, IndexerError> {
        let name = self.indexer.name().to_string();
        tracing::info!(
            indexer = %name,
            checkpoint = %self.checkpoints.id(),
            concurrency = self.config.concurrency,
            max_queued = self.config.max_queued,
            "indexing started"
        );

        if self.config.ensure_setup {
            self.state = RunState::Setup;
            if let Err(e) = self.indexer.setup().await {
                tracing::error!(indexer = %name, error = %e, "setup failed");
                self.state = RunState::Failed;
                return Err(e);
            }
        }

        if self.indexer.skip_to_end() {
            self.state = RunState::Draining;
            match fetcher.skip_to_end().await {
                Ok(header) => self.confirmed = header,
                Err(e) => self.record_fatal(e),
            }
        } else {
            self.state = RunState::Streaming;
            self.stream(fetcher).await;
            self.state = RunState::Draining;
        }

        self.wait_all().await;
        if let Err(e) = self.commit(fetcher).await {
            tracing::error!(indexer = %name, error = %e, "final checkpoint failed");
            self.record_fatal(e);
        }

        let result = match self.fatal.take() {
            Some(e) => {
                self.state = RunState::Failed;
                tracing::error!(indexer = %name, error = %e, "indexing failed");
                Err(e)
            }
            None if fetcher.is_cancelled() => {
                self.state = RunState::Cancelled;
                Ok(IndexOutcome::Cancelled)
            }
            None => {
                self.state = RunState::Completed;
                Ok(IndexOutcome::Completed)
            }
        };
        tracing::info!(
            indexer = %name,
            state = %self.state,
            scheduled = self.counters.scheduled(),
            indexed = self.counters.indexed(),
            height = self.confirmed.as_ref().map(|h| h.height),
            "indexing finished"
        );
        result
    }

    async fn stream(&mut self, fetcher: &mut BlockFetcher) {
        let indexer = self.indexer.clone();
        let mut batch = Batch::new();
        loop {
            self.reap_ready();
            if self.fatal.is_some() || fetcher.is_cancelled() {
                return;
            }

            if self.checkpoints.needs_save() {
                self.dispatch(&mut batch, fetcher).await;
                self.wait_all().await;
                if let Err(e) = self.commit(fetcher).await {
                    self.record_fatal(e);
                    return;
                }
            }

            let block = match fetcher.next().await {
                Ok(Some(block)) => block,
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(error = %e, "block fetch failed");
                    self.record_fatal(e);
                    return;
                }
            };

            let full = indexer.accumulate(&block, &mut batch);
            batch.mark(&block);
            if full {
                self.dispatch(&mut batch, fetcher).await;
            }
        }
        self.dispatch(&mut batch, fetcher).await;
    }

    /// Hand `batch` to a new write job, waiting first if too many are
    /// outstanding.
    async fn dispatch(&mut self, batch: &mut Batch<I::Item>, fetcher: &BlockFetcher) {
        if batch.is_idle() || fetcher.is_cancelled() || self.fatal.is_some() {
            return;
        }

        let max_queued = self.config.max_queued.max(1);
        if self.queue.len() >= max_queued {
            tracing::debug!(outstanding = self.queue.len(), max_queued, "backpressure, waiting for jobs");
            self.stalls += 1;
            while self.queue.len() > max_queued / 2
                && self.fatal.is_none()
                && !fetcher.is_cancelled()
            {
                if !self.reap_next().await {
                    break;
                }
            }
            if self.fatal.is_some() || fetcher.is_cancelled() {
                return;
            }
            self.resume_outstanding = self.resume_outstanding.max(self.queue.len());
        }

        let (items, highest) = batch.take();
        let id = self.next_job_id;
        self.next_job_id += 1;
        let count = items.len() as u64;
        self.counters.scheduled.fetch_add(count, Ordering::Relaxed);
        tracing::debug!(
            job = id,
            items = count,
            height = highest.as_ref().map(|h| h.height),
            "dispatching job"
        );
        self.queue.push_back(IndexJob {
            id,
            highest,
            items: count,
            state: JobState::Running,
        });
        self.peak_outstanding = self.peak_outstanding.max(self.queue.len());

        let indexer = self.indexer.clone();
        let permits = self.permits.clone();
        let retry: ExponentialBackoff = self.config.retry.clone();
        self.tasks.spawn(async move {
            let job = async {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|e| IndexerError::Other(e.to_string()))?;
                retry.run(|| indexer.write(&items)).await
            };
            let result = AssertUnwindSafe(job)
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(IndexerError::JobPanicked(panic_message(&*panic))));
            (id, result)
        });
    }

    /// Collect completions that are already available.
    fn reap_ready(&mut self) {
        while let Some(Some(joined)) = self.tasks.join_next().now_or_never() {
            self.complete(joined);
        }
    }

    /// Wait for the next completion. Returns `false` when no job is running.
    async fn reap_next(&mut self) -> bool {
        match self.tasks.join_next().await {
            Some(joined) => {
                self.complete(joined);
                true
            }
            None => false,
        }
    }

    async fn wait_all(&mut self) {
        while self.reap_next().await {}
    }

    fn complete(&mut self, joined: Result<JobResult, JoinError>) {
        let (id, result) = match joined {
            Ok(out) => out,
            Err(e) => {
                self.record_fatal(IndexerError::JobPanicked(e.to_string()));
                return;
            }
        };
        let Some(job) = self.queue.iter_mut().find(|j| j.id == id) else {
            return;
        };
        match result {
            Ok(()) => {
                job.state = JobState::Succeeded;
                self.counters.indexed.fetch_add(job.items, Ordering::Relaxed);
            }
            Err(e) => {
                job.state = JobState::Failed;
                tracing::error!(
                    job = id,
                    height = job.highest.as_ref().map(|h| h.height),
                    error = %e,
                    "write job failed"
                );
                self.record_fatal(e);
            }
        }

        while self
            .queue
            .front()
            .is_some_and(|j| j.state == JobState::Succeeded)
        {
            if let Some(done) = self.queue.pop_front() {
                if done.highest.is_some() {
                    self.confirmed = done.highest;
                }
            }
        }
    }

    fn record_fatal(&mut self, e: IndexerError) {
        if self.fatal.is_none() {
            self.fatal = Some(e);
        }
    }

    /// Commit the confirmed position, if any.
    async fn commit(&mut self, fetcher: &mut BlockFetcher) -> Result<(), IndexerError> {
        let Some(header) = self.confirmed.clone() else {
            self.checkpoints.mark_saved();
            return Ok(());
        };
        let locator = fetcher.locator_for(&header)?;
        let cp = self.checkpoints.commit(locator).await?;
        tracing::info!(
            checkpoint = %cp.id(),
            height = header.height,
            hash = %header.hash(),
            saved = self.checkpoints.save_progression(),
            "checkpoint committed"
        );
        fetcher.set_checkpoint(cp);
        Ok(())
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
