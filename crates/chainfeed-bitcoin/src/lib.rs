//! chainfeed-bitcoin: Bitcoin networks, stored record shapes and the block
//! and transaction indexers.
//!
//! # Quick start
//! ```rust,no_run
//! use std::sync::Arc;
//! use chainfeed_bitcoin::{BlockIndexer, Network, ReplayChain};
//! use chainfeed_core::{BlockFetcher, CancellationToken, CheckpointManager, EngineBuilder, MemoryDocumentStore};
//!
//! # async fn example() -> Result<(), chainfeed_core::IndexerError> {
//! let chain = Arc::new(ReplayChain::load("chain.jsonl").await?);
//! let store = Arc::new(MemoryDocumentStore::new());
//! let checkpoints = CheckpointManager::new(store.clone(), "default:Blocks", Network::Main.name(), Default::default());
//! let mut engine = EngineBuilder::new().build(BlockIndexer::new(store), checkpoints);
//!
//! let checkpoint = engine.load_checkpoint(chain.genesis_hash()).await?;
//! let mut fetcher = BlockFetcher::new(checkpoint, chain.clone(), chain, CancellationToken::new());
//! engine.run(&mut fetcher).await?;
//! # Ok(())
//! # }
//! ```

pub mod block_indexer;
pub mod network;
pub mod records;
pub mod replay;
pub mod transaction_indexer;

pub use block_indexer::{BlockIndexer, BLOCKS_PER_BATCH};
pub use network::Network;
pub use records::{BlockEntry, TransactionEntry, TransactionKind};
pub use replay::ReplayChain;
pub use transaction_indexer::{TransactionIndexer, TRANSACTIONS_PER_BATCH};
