//! Chain source boundary: the local header chain and the peer that serves
//! block bodies.
//!
//! [`MemoryChain`] implements both sides over an in-memory vector and is what
//! tests and the replay source use.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::error::IndexerError;
use crate::locator::BlockLocator;
use crate::types::{Block, BlockHash, BlockHeader, ChainedHeader, Hash256, Transaction};

/// Synchronized view of the best header chain.
pub trait HeaderChain: Send + Sync {
    /// Highest header present both locally and in `locator`.
    fn find_fork(&self, locator: &BlockLocator) -> Option<ChainedHeader>;

    /// Height of the best known header.
    fn tip_height(&self) -> u64;

    fn header_at(&self, height: u64) -> Option<ChainedHeader>;

    /// Headers strictly after `height`, in ascending order.
    fn headers_after(&self, height: u64) -> Box<dyn Iterator<Item = ChainedHeader> + Send + '_>;

    /// Locator describing the chain up to `height`.
    fn locator_at(&self, height: u64) -> Option<BlockLocator> {
        let hashes = BlockLocator::heights(height)
            .into_iter()
            .map(|h| self.header_at(h).map(|c| c.hash()))
            .collect::<Option<Vec<_>>>()?;
        BlockLocator::new(hashes).ok()
    }
}

/// Peer that serves full block bodies.
#[async_trait]
pub trait BlockSource: Send + Sync {
    /// Fetch bodies for `hashes` in order.
    ///
    /// The returned vector ends at the first body the peer does not have
    /// (a trailing `None`) or when `cancel` fires, so it may be shorter than
    /// `hashes`.
    async fn get_blocks(
        &self,
        hashes: &[BlockHash],
        cancel: &CancellationToken,
    ) -> Result<Vec<Option<Block>>, IndexerError>;
}

// ─── MemoryChain ──────────────────────────────────────────────────────────────

/// In-memory header chain plus body source.
#[derive(Debug, Clone)]
pub struct MemoryChain {
    headers: Vec<ChainedHeader>,
    heights: HashMap<BlockHash, u64>,
    bodies: HashMap<BlockHash, Block>,
}

impl MemoryChain {
    /// A chain holding only `genesis` at height 0.
    pub fn new(genesis: Block) -> Self {
        let mut chain = Self {
            headers: Vec::new(),
            heights: HashMap::new(),
            bodies: HashMap::new(),
        };
        chain.insert(genesis.header.clone());
        chain.bodies.insert(genesis.hash(), genesis);
        chain
    }

    /// Build a chain from blocks ordered by height, starting at genesis.
    pub fn from_blocks(blocks: Vec<Block>) -> Result<Self, IndexerError> {
        let mut iter = blocks.into_iter();
        let genesis = iter
            .next()
            .ok_or_else(|| IndexerError::Source("chain has no genesis block".into()))?;
        let mut chain = Self::new(genesis);
        for block in iter {
            chain.push(block)?;
        }
        Ok(chain)
    }

    /// A deterministic chain of `len` blocks (heights `0..len`), each carrying
    /// `txs_per_block` transactions.
    pub fn synthetic(len: u64, txs_per_block: usize) -> Self {
        let mut chain = Self::new(synthetic_block(0, BlockHash::default(), txs_per_block));
        for height in 1..len.max(1) {
            let parent = chain.tip().hash();
            chain.insert_unchecked(synthetic_block(height, parent, txs_per_block));
        }
        chain
    }

    /// Append a block with its body. It must extend the current tip.
    pub fn push(&mut self, block: Block) -> Result<u64, IndexerError> {
        let height = self.push_header(block.header.clone())?;
        self.bodies.insert(block.hash(), block);
        Ok(height)
    }

    /// Append a header whose body the peer does not have.
    pub fn push_header(&mut self, header: BlockHeader) -> Result<u64, IndexerError> {
        let tip = self.tip();
        if header.previous_hash != tip.hash() {
            return Err(IndexerError::Source(format!(
                "block {} does not extend tip {} at height {}",
                header.hash,
                tip.hash(),
                tip.height
            )));
        }
        Ok(self.insert(header))
    }

    /// Drop every body above `height`, keeping the headers.
    pub fn truncate_bodies(&mut self, height: u64) {
        for header in self.headers.iter().skip(height as usize + 1) {
            self.bodies.remove(&header.hash());
        }
    }

    pub fn genesis_hash(&self) -> BlockHash {
        self.headers[0].hash()
    }

    pub fn tip(&self) -> &ChainedHeader {
        &self.headers[self.headers.len() - 1]
    }

    pub fn block_at(&self, height: u64) -> Option<&Block> {
        let header = self.headers.get(usize::try_from(height).ok()?)?;
        self.bodies.get(&header.hash())
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    /// Always `false`: a chain holds at least its genesis.
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    fn insert(&mut self, header: BlockHeader) -> u64 {
        let height = self.headers.len() as u64;
        self.heights.insert(header.hash, height);
        self.headers.push(ChainedHeader::new(height, header));
        height
    }

    fn insert_unchecked(&mut self, block: Block) {
        self.insert(block.header.clone());
        self.bodies.insert(block.hash(), block);
    }
}

impl HeaderChain for MemoryChain {
    fn find_fork(&self, locator: &BlockLocator) -> Option<ChainedHeader> {
        locator
            .hashes()
            .iter()
            .find_map(|hash| self.heights.get(hash))
            .map(|&height| self.headers[height as usize].clone())
    }

    fn tip_height(&self) -> u64 {
        self.tip().height
    }

    fn header_at(&self, height: u64) -> Option<ChainedHeader> {
        self.headers.get(usize::try_from(height).ok()?).cloned()
    }

    fn headers_after(&self, height: u64) -> Box<dyn Iterator<Item = ChainedHeader> + Send + '_> {
        let start = usize::try_from(height.saturating_add(1)).unwrap_or(usize::MAX);
        Box::new(self.headers.iter().skip(start).cloned())
    }
}

#[async_trait]
impl BlockSource for MemoryChain {
    async fn get_blocks(
        &self,
        hashes: &[BlockHash],
        cancel: &CancellationToken,
    ) -> Result<Vec<Option<Block>>, IndexerError> {
        let mut out = Vec::with_capacity(hashes.len());
        for hash in hashes {
            if cancel.is_cancelled() {
                break;
            }
            let body = self.bodies.get(hash).cloned();
            let absent = body.is_none();
            out.push(body);
            if absent {
                break;
            }
        }
        Ok(out)
    }
}

// ─── Fixtures ─────────────────────────────────────────────────────────────────

/// Deterministic block at `height` on top of `parent`.
///
/// Block hashes carry `height + 1` in their low bytes so that the genesis hash
/// is never all zeros. Transaction hashes set a marker byte to keep them apart
/// from block hashes.
pub fn synthetic_block(height: u64, parent: BlockHash, txs: usize) -> Block {
    let hash = Hash256::from_low_u64_be(height + 1);
    let time = DateTime::<Utc>::from_timestamp(1_231_006_505 + height as i64 * 600, 0)
        .unwrap_or_default();

    let mut raw = Vec::with_capacity(80);
    raw.extend_from_slice(&1u32.to_le_bytes());
    raw.extend_from_slice(parent.as_bytes());
    raw.extend_from_slice(hash.as_bytes());
    raw.extend_from_slice(&(time.timestamp() as u32).to_le_bytes());
    raw.extend_from_slice(&[0u8; 8]);

    let transactions = (0..txs)
        .map(|i| {
            let mut bytes = *Hash256::from_low_u64_be(height).as_bytes();
            bytes[0] = 0x74;
            bytes[1..5].copy_from_slice(&(i as u32).to_be_bytes());
            Transaction {
                hash: Hash256::new(bytes),
                raw: [&height.to_le_bytes()[..], &(i as u32).to_le_bytes()[..]].concat(),
            }
        })
        .collect();

    Block {
        header: BlockHeader {
            hash,
            previous_hash: parent,
            time,
            raw,
        },
        transactions,
    }
}
