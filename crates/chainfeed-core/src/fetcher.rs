//! Resumable, cancellable block cursor.
//!
//! A [`BlockFetcher`] walks the header chain from the fork point of its
//! checkpoint's locator up to a target height, downloading bodies from the
//! peer in windows and yielding one [`PositionedBlock`] per call to
//! [`next`](BlockFetcher::next). A body the peer does not have ends the pass
//! quietly; only peer I/O and protocol errors surface as `Err`.

use std::collections::VecDeque;
use std::iter;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::chain::{BlockSource, HeaderChain};
use crate::checkpoint::Checkpoint;
use crate::error::IndexerError;
use crate::locator::BlockLocator;
use crate::types::{Block, ChainedHeader, PositionedBlock};

/// Number of bodies requested from the peer at once.
pub const FETCH_WINDOW: usize = 64;

/// Cursor position of a fetch pass.
#[derive(Debug)]
enum Cursor {
    /// Fork point not resolved yet.
    AtFork,
    Streaming {
        next_height: u64,
        end_height: u64,
        pending: VecDeque<PositionedBlock>,
    },
    Exhausted,
}

/// Single-pass block cursor over `[from_height, to_height]`.
pub struct BlockFetcher {
    checkpoint: Checkpoint,
    headers: Arc<dyn HeaderChain>,
    source: Arc<dyn BlockSource>,
    cancel: CancellationToken,
    from_height: u64,
    to_height: u64,
    cursor: Cursor,
    last_processed: Option<ChainedHeader>,
}

impl BlockFetcher {
    pub fn new(
        checkpoint: Checkpoint,
        headers: Arc<dyn HeaderChain>,
        source: Arc<dyn BlockSource>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            checkpoint,
            headers,
            source,
            cancel,
            from_height: 0,
            to_height: u64::MAX,
            cursor: Cursor::AtFork,
            last_processed: None,
        }
    }

    /// Skip blocks below `height`.
    pub fn with_from_height(mut self, height: u64) -> Self {
        self.from_height = height;
        self
    }

    /// Stop after `height` (inclusive).
    pub fn with_to_height(mut self, height: u64) -> Self {
        self.to_height = height;
        self
    }

    pub fn from_height(&self) -> u64 {
        self.from_height
    }

    pub fn to_height(&self) -> u64 {
        self.to_height
    }

    pub fn checkpoint(&self) -> &Checkpoint {
        &self.checkpoint
    }

    /// Hand back the checkpoint the engine last committed.
    pub fn set_checkpoint(&mut self, checkpoint: Checkpoint) {
        self.checkpoint = checkpoint;
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Header of the most recently yielded block.
    pub fn last_processed(&self) -> Option<&ChainedHeader> {
        self.last_processed.as_ref()
    }

    /// `true` once the pass has ended.
    pub fn is_exhausted(&self) -> bool {
        matches!(self.cursor, Cursor::Exhausted)
    }

    /// Locator of the header chain at `header`, for committing progress.
    pub fn locator_for(&self, header: &ChainedHeader) -> Result<BlockLocator, IndexerError> {
        self.headers
            .locator_at(header.height)
            .filter(|loc| loc.tip() == header.hash())
            .ok_or_else(|| {
                IndexerError::Source(format!(
                    "header {} at height {} is no longer on the best chain",
                    header.hash(),
                    header.height
                ))
            })
    }

    /// Yield the next block, `None` once the pass is over or cancelled.
    pub async fn next(&mut self) -> Result<Option<PositionedBlock>, IndexerError> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(None);
            }
            match std::mem::replace(&mut self.cursor, Cursor::Exhausted) {
                Cursor::AtFork => {
                    self.cursor = self.resolve_range()?;
                }
                Cursor::Streaming {
                    mut next_height,
                    end_height,
                    mut pending,
                } => {
                    if let Some(block) = pending.pop_front() {
                        self.last_processed = Some(ChainedHeader::new(
                            block.height,
                            block.block.header.clone(),
                        ));
                        self.cursor = Cursor::Streaming {
                            next_height,
                            end_height,
                            pending,
                        };
                        return Ok(Some(block));
                    }
                    if next_height > end_height {
                        continue;
                    }
                    let complete = self.fill_window(next_height, end_height, &mut pending).await?;
                    next_height = match (complete, pending.back()) {
                        (true, Some(last)) => last.height + 1,
                        _ => end_height.saturating_add(1).max(next_height + 1),
                    };
                    if pending.is_empty() {
                        continue;
                    }
                    self.cursor = Cursor::Streaming {
                        next_height,
                        end_height,
                        pending,
                    };
                }
                Cursor::Exhausted => return Ok(None),
            }
        }
    }

    /// Jump straight to the block at `min(to_height, tip)`.
    ///
    /// Only that block is downloaded; it becomes [`last_processed`](Self::last_processed)
    /// and the cursor is exhausted.
    pub async fn skip_to_end(&mut self) -> Result<Option<ChainedHeader>, IndexerError> {
        self.cursor = Cursor::Exhausted;
        if self.cancel.is_cancelled() {
            return Ok(None);
        }
        let end = self.to_height.min(self.headers.tip_height());
        let Some(header) = self.headers.header_at(end) else {
            return Ok(None);
        };
        let bodies = self.source.get_blocks(&[header.hash()], &self.cancel).await?;
        match bodies.into_iter().next().flatten() {
            Some(block) => {
                check_body(&header, &block)?;
                tracing::info!(height = header.height, hash = %header.hash(), "skipped to end");
                self.last_processed = Some(header.clone());
                Ok(Some(header))
            }
            None => Ok(None),
        }
    }

    /// Heights to stream: after the fork point, within the requested bounds.
    ///
    /// A range starting at height 1 is widened to include genesis. This also
    /// holds when the checkpoint sits exactly at genesis, so block 0 is
    /// yielded again on that resume.
    fn resolve_range(&self) -> Result<Cursor, IndexerError> {
        let fork = self
            .headers
            .find_fork(self.checkpoint.locator())
            .ok_or(IndexerError::ForkNotFound)?;
        let end_height = self.to_height.min(self.headers.tip_height());
        let mut next_height = fork.height.saturating_add(1).max(self.from_height);
        // Resuming right after genesis re-yields genesis so numbering starts at 0.
        if next_height == 1 {
            next_height = 0;
        }
        tracing::debug!(
            fork = fork.height,
            from = next_height,
            to = end_height,
            "resolved fetch range"
        );
        if next_height > end_height {
            return Ok(Cursor::Exhausted);
        }
        Ok(Cursor::Streaming {
            next_height,
            end_height,
            pending: VecDeque::new(),
        })
    }

    /// Download up to [`FETCH_WINDOW`] bodies starting at `start`.
    ///
    /// Returns `false` when the peer ran out of data or the pass was cancelled.
    async fn fill_window(
        &self,
        start: u64,
        end: u64,
        pending: &mut VecDeque<PositionedBlock>,
    ) -> Result<bool, IndexerError> {
        let Some(first) = self.headers.header_at(start) else {
            return Ok(false);
        };
        let headers: Vec<ChainedHeader> = iter::once(first)
            .chain(self.headers.headers_after(start))
            .take_while(|h| h.height <= end)
            .take(FETCH_WINDOW)
            .collect();
        let hashes: Vec<_> = headers.iter().map(ChainedHeader::hash).collect();
        let bodies = self.source.get_blocks(&hashes, &self.cancel).await?;

        let mut complete = bodies.len() == headers.len();
        for (header, body) in headers.into_iter().zip(bodies) {
            match body {
                Some(block) => {
                    check_body(&header, &block)?;
                    pending.push_back(PositionedBlock::new(header.height, block));
                }
                None => {
                    tracing::debug!(height = header.height, "peer has no body yet, ending pass");
                    complete = false;
                    break;
                }
            }
        }
        Ok(complete)
    }
}

fn check_body(header: &ChainedHeader, block: &Block) -> Result<(), IndexerError> {
    if block.hash() != header.hash() {
        return Err(IndexerError::Source(format!(
            "peer returned block {} for header {} at height {}",
            block.hash(),
            header.hash(),
            header.height
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MemoryChain;

    fn fetcher(chain: MemoryChain, locator: BlockLocator) -> BlockFetcher {
        let chain = Arc::new(chain);
        let cp = Checkpoint::new("test", "Main", locator);
        BlockFetcher::new(cp, chain.clone(), chain, CancellationToken::new())
    }

    async fn drain(f: &mut BlockFetcher) -> Vec<u64> {
        let mut heights = Vec::new();
        while let Some(b) = f.next().await.unwrap() {
            heights.push(b.height);
        }
        heights
    }

    #[tokio::test]
    async fn genesis_locator_yields_from_zero() {
        let chain = MemoryChain::synthetic(3, 0);
        let genesis = chain.genesis_hash();
        let mut f = fetcher(chain, BlockLocator::genesis(genesis));
        assert_eq!(drain(&mut f).await, vec![0, 1, 2]);
        assert_eq!(f.last_processed().unwrap().height, 2);
        assert!(f.is_exhausted());
    }

    #[tokio::test]
    async fn resumes_strictly_after_fork() {
        let chain = MemoryChain::synthetic(200, 0);
        let loc = chain.locator_at(120).unwrap();
        let mut f = fetcher(chain, loc);
        let heights = drain(&mut f).await;
        assert_eq!(heights.first(), Some(&121));
        assert_eq!(heights.last(), Some(&199));
        assert!(heights.windows(2).all(|w| w[1] == w[0] + 1));
    }

    #[tokio::test]
    async fn consecutive_blocks_are_linked() {
        let chain = MemoryChain::synthetic(150, 1);
        let genesis = chain.genesis_hash();
        let mut f = fetcher(chain, BlockLocator::genesis(genesis));
        let mut prev: Option<PositionedBlock> = None;
        while let Some(b) = f.next().await.unwrap() {
            if let Some(p) = &prev {
                assert!(b.extends(p));
            }
            prev = Some(b);
        }
        assert_eq!(prev.unwrap().height, 149);
    }

    #[tokio::test]
    async fn bounded_by_from_and_to() {
        let chain = MemoryChain::synthetic(50, 0);
        let genesis = chain.genesis_hash();
        let mut f = fetcher(chain, BlockLocator::genesis(genesis))
            .with_from_height(10)
            .with_to_height(20);
        assert_eq!(drain(&mut f).await, (10..=20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn stops_quietly_at_missing_body() {
        let mut chain = MemoryChain::synthetic(11, 0);
        chain.truncate_bodies(7);
        let genesis = chain.genesis_hash();
        let mut f = fetcher(chain, BlockLocator::genesis(genesis)).with_to_height(10);
        assert_eq!(drain(&mut f).await, (0..=7).collect::<Vec<_>>());
        assert!(f.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn skip_to_end_lands_on_tip() {
        let chain = MemoryChain::synthetic(8, 0);
        let genesis = chain.genesis_hash();
        let mut f = fetcher(chain, BlockLocator::genesis(genesis)).with_to_height(10);
        let header = f.skip_to_end().await.unwrap().unwrap();
        assert_eq!(header.height, 7);
        assert_eq!(f.last_processed().unwrap().height, 7);
        assert!(f.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_locator_is_an_error() {
        let chain = MemoryChain::synthetic(3, 0);
        let mut f = fetcher(chain, BlockLocator::genesis(crate::types::BlockHash::from_low_u64_be(999)));
        assert!(matches!(f.next().await, Err(IndexerError::ForkNotFound)));
    }

    #[tokio::test]
    async fn cancellation_ends_pass() {
        let chain = MemoryChain::synthetic(10, 0);
        let genesis = chain.genesis_hash();
        let mut f = fetcher(chain, BlockLocator::genesis(genesis));
        assert_eq!(f.next().await.unwrap().unwrap().height, 0);
        f.cancellation_token().cancel();
        assert!(f.next().await.unwrap().is_none());
        assert_eq!(f.last_processed().unwrap().height, 0);
    }

    #[tokio::test]
    async fn locator_for_checks_best_chain() {
        let chain = MemoryChain::synthetic(30, 0);
        let genesis = chain.genesis_hash();
        let header = chain.header_at(25).unwrap();
        let f = fetcher(chain, BlockLocator::genesis(genesis));
        let loc = f.locator_for(&header).unwrap();
        assert_eq!(loc.tip(), header.hash());
        assert_eq!(loc.anchor(), genesis);
    }
}
