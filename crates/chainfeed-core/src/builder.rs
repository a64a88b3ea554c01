//! Fluent builder for [`IndexingEngine`].
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use chainfeed_core::EngineBuilder;
//!
//! let config = EngineBuilder::new()
//!     .concurrency(4)
//!     .max_queued(50)
//!     .save_interval(Duration::from_secs(60))
//!     .build_config();
//! ```

use std::time::Duration;

use crate::backoff::ExponentialBackoff;
use crate::checkpoint::CheckpointManager;
use crate::engine::IndexingEngine;
use crate::indexer::{EngineConfig, Indexer};

/// Fluent builder for `EngineConfig`.
#[derive(Default)]
pub struct EngineBuilder {
    config: EngineConfig,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
        }
    }

    /// Set the number of write jobs allowed to run at once.
    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n;
        self
    }

    /// Set the outstanding job count that triggers backpressure.
    pub fn max_queued(mut self, n: usize) -> Self {
        self.config.max_queued = n;
        self
    }

    /// Set the minimum time between periodic checkpoint saves.
    pub fn save_interval(mut self, interval: Duration) -> Self {
        self.config.save_interval = interval;
        self
    }

    /// Disable to neither load nor save checkpoints.
    pub fn save_progression(mut self, enabled: bool) -> Self {
        self.config.save_progression = enabled;
        self
    }

    pub fn ensure_setup(mut self, enabled: bool) -> Self {
        self.config.ensure_setup = enabled;
        self
    }

    /// Set the retry policy for write jobs.
    pub fn retry(mut self, retry: ExponentialBackoff) -> Self {
        self.config.retry = retry;
        self
    }

    /// Build the `EngineConfig`.
    pub fn build_config(self) -> EngineConfig {
        self.config
    }

    /// Build an engine running `indexer`.
    pub fn build<I: Indexer>(self, indexer: I, checkpoints: CheckpointManager) -> IndexingEngine<I> {
        IndexingEngine::new(indexer, checkpoints, self.config)
    }
}
