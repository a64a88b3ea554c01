//! chainfeed-core: resumable, backpressured block ingestion.
//!
//! # Architecture
//!
//! ```text
//! EngineBuilder → IndexingEngine ── Indexer (accumulate / write)
//!                      ├── BlockFetcher      (fork point → target height)
//!                      │      ├── HeaderChain  (local best header chain)
//!                      │      └── BlockSource  (peer serving block bodies)
//!                      ├── write jobs        (JoinSet + Semaphore + ExponentialBackoff)
//!                      └── CheckpointManager (locator checkpoints in a DocumentStore)
//! ```

pub mod backoff;
pub mod builder;
pub mod chain;
pub mod checkpoint;
pub mod engine;
pub mod error;
pub mod fetcher;
pub mod indexer;
pub mod locator;
pub mod store;
pub mod types;

pub use backoff::ExponentialBackoff;
pub use builder::EngineBuilder;
pub use chain::{BlockSource, HeaderChain, MemoryChain};
pub use checkpoint::{Checkpoint, CheckpointManager};
pub use engine::{IndexCounters, IndexingEngine};
pub use error::IndexerError;
pub use fetcher::BlockFetcher;
pub use indexer::{Batch, EngineConfig, IndexOutcome, Indexer, RunState};
pub use locator::BlockLocator;
pub use store::{Attachment, AttachmentBatch, Document, DocumentStore, MemoryDocumentStore};
pub use tokio_util::sync::CancellationToken;
pub use types::{Block, BlockHash, BlockHeader, ChainedHeader, Hash256, PositionedBlock, Transaction, TxHash};
