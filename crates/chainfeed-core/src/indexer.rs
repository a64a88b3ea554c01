//! Indexer capability, engine configuration and run state types.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::backoff::ExponentialBackoff;
use crate::error::IndexerError;
use crate::types::{ChainedHeader, PositionedBlock};

/// Configuration for an [`IndexingEngine`](crate::engine::IndexingEngine) run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum number of write jobs running at once.
    pub concurrency: usize,
    /// Outstanding job count at which the producer pauses. It resumes once
    /// half of them are confirmed.
    pub max_queued: usize,
    /// Minimum time between periodic checkpoint saves.
    pub save_interval: Duration,
    /// When `false`, checkpoints are neither loaded nor saved.
    pub save_progression: bool,
    /// Run the indexer's setup hook before streaming.
    pub ensure_setup: bool,
    /// Retry policy wrapped around every write job.
    pub retry: ExponentialBackoff,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            max_queued: 100,
            save_interval: Duration::from_secs(15),
            save_progression: true,
            ensure_setup: true,
            retry: ExponentialBackoff::default(),
        }
    }
}

/// Runtime state of an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    /// Not yet started.
    Idle,
    /// Running the indexer's setup hook.
    Setup,
    /// Pulling blocks and dispatching batches.
    Streaming,
    /// Waiting for in-flight jobs before the final checkpoint.
    Draining,
    Completed,
    /// Stopped after a fatal error.
    Failed,
    /// Stopped on request, in-flight work drained.
    Cancelled,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Setup => write!(f, "setup"),
            Self::Streaming => write!(f, "streaming"),
            Self::Draining => write!(f, "draining"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// How a run ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOutcome {
    /// The fetcher ran out of blocks.
    Completed,
    /// Cancellation was requested; dispatched work was still checkpointed.
    Cancelled,
}

// ─── Batch ────────────────────────────────────────────────────────────────────

/// Items accumulated by the producer for the next write job.
///
/// The engine records the header of the highest block fed into the batch, so
/// a batch with no items still carries progress.
#[derive(Debug)]
pub struct Batch<T> {
    items: Vec<T>,
    highest: Option<ChainedHeader>,
}

impl<T> Default for Batch<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            highest: None,
        }
    }
}

impl<T> Batch<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, item: T) {
        self.items.push(item);
    }

    pub fn extend(&mut self, items: impl IntoIterator<Item = T>) {
        self.items.extend(items);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    /// Height of the highest block fed into this batch.
    pub fn highest_height(&self) -> Option<u64> {
        self.highest.as_ref().map(|h| h.height)
    }

    /// `true` when there is nothing to write and no progress to record.
    pub fn is_idle(&self) -> bool {
        self.items.is_empty() && self.highest.is_none()
    }

    pub(crate) fn mark(&mut self, block: &PositionedBlock) {
        if self.highest_height().map_or(true, |h| block.height > h) {
            self.highest = Some(ChainedHeader::new(block.height, block.block.header.clone()));
        }
    }

    pub(crate) fn take(&mut self) -> (Vec<T>, Option<ChainedHeader>) {
        (std::mem::take(&mut self.items), self.highest.take())
    }
}

// ─── Indexer ──────────────────────────────────────────────────────────────────

/// A pass that turns blocks into stored records.
///
/// The engine owns batching, concurrency, retries and checkpoints; an indexer
/// only decides what goes into a batch and how a batch is written.
#[async_trait]
pub trait Indexer: Send + Sync + 'static {
    type Item: Send + Sync + 'static;

    /// Short name, used as the checkpoint suffix and in logs.
    fn name(&self) -> &str;

    /// Idempotent setup hook (create tables, collections).
    async fn setup(&self) -> Result<(), IndexerError> {
        Ok(())
    }

    /// Only the chain tip matters; skip block-by-block streaming.
    fn skip_to_end(&self) -> bool {
        false
    }

    /// Add the records derived from `block` to `batch`. Returns `true` when
    /// the batch should be written.
    fn accumulate(&self, block: &PositionedBlock, batch: &mut Batch<Self::Item>) -> bool;

    /// Durably write one batch. May be retried, so it must be idempotent.
    async fn write(&self, items: &[Self::Item]) -> Result<(), IndexerError>;
}
