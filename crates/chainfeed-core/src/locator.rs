//! Block locators: compact, fork-tolerant descriptions of a chain position.
//!
//! A locator lists block hashes from the most recent one backwards, densely at
//! first and then at exponentially increasing depth, always ending with the
//! genesis block. Two parties that disagree on the tip can still find their
//! highest common ancestor by scanning a locator.

use crate::error::IndexerError;
use crate::types::BlockHash;

/// Number of consecutive recent hashes before the step starts doubling.
const DENSE_PREFIX: usize = 10;

/// An ordered, never-empty list of block hashes, most recent first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockLocator {
    hashes: Vec<BlockHash>,
}

impl BlockLocator {
    /// Create a locator; fails if `hashes` is empty.
    pub fn new(hashes: Vec<BlockHash>) -> Result<Self, IndexerError> {
        if hashes.is_empty() {
            return Err(IndexerError::InvalidLocator("locator is empty".into()));
        }
        Ok(Self { hashes })
    }

    /// A locator that only references the genesis block.
    pub fn genesis(genesis: BlockHash) -> Self {
        Self {
            hashes: vec![genesis],
        }
    }

    /// The most recent hash (`locator[0]`).
    pub fn tip(&self) -> BlockHash {
        self.hashes[0]
    }

    /// The anchor hash (`locator[last]`), normally the genesis block.
    pub fn anchor(&self) -> BlockHash {
        self.hashes[self.hashes.len() - 1]
    }

    pub fn hashes(&self) -> &[BlockHash] {
        &self.hashes
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    /// Always `false`; present for API symmetry with `len`.
    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    /// Heights a locator built at `tip_height` refers to, most recent first.
    pub fn heights(tip_height: u64) -> Vec<u64> {
        let mut heights = Vec::new();
        let mut height = tip_height;
        let mut step = 1u64;
        loop {
            heights.push(height);
            if height == 0 {
                break;
            }
            if heights.len() >= DENSE_PREFIX {
                step = step.saturating_mul(2);
            }
            height = height.saturating_sub(step);
        }
        heights
    }

    /// Serialize as a compact-size count followed by the raw 32-byte hashes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(9 + self.hashes.len() * BlockHash::LEN);
        write_compact_size(&mut out, self.hashes.len() as u64);
        for hash in &self.hashes {
            out.extend_from_slice(hash.as_bytes());
        }
        out
    }

    /// Inverse of [`to_bytes`](Self::to_bytes).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IndexerError> {
        let (count, mut rest) = read_compact_size(bytes)?;
        let count = usize::try_from(count)
            .map_err(|_| IndexerError::InvalidLocator("hash count overflows usize".into()))?;
        if rest.len() != count.saturating_mul(BlockHash::LEN) {
            return Err(IndexerError::InvalidLocator(format!(
                "expected {count} hashes, found {} trailing bytes",
                rest.len()
            )));
        }
        let mut hashes = Vec::with_capacity(count);
        while !rest.is_empty() {
            let (hash, tail) = rest.split_at(BlockHash::LEN);
            hashes.push(BlockHash::from_slice(hash)?);
            rest = tail;
        }
        Self::new(hashes)
    }
}

fn write_compact_size(out: &mut Vec<u8>, n: u64) {
    match n {
        0..=0xfc => out.push(n as u8),
        0xfd..=0xffff => {
            out.push(0xfd);
            out.extend_from_slice(&(n as u16).to_le_bytes());
        }
        0x1_0000..=0xffff_ffff => {
            out.push(0xfe);
            out.extend_from_slice(&(n as u32).to_le_bytes());
        }
        _ => {
            out.push(0xff);
            out.extend_from_slice(&n.to_le_bytes());
        }
    }
}

fn read_compact_size(bytes: &[u8]) -> Result<(u64, &[u8]), IndexerError> {
    let truncated = || IndexerError::InvalidLocator("truncated hash count".into());
    let (&tag, rest) = bytes.split_first().ok_or_else(truncated)?;
    let width = match tag {
        0xfd => 2,
        0xfe => 4,
        0xff => 8,
        n => return Ok((u64::from(n), rest)),
    };
    if rest.len() < width {
        return Err(truncated());
    }
    let (num, rest) = rest.split_at(width);
    let mut buf = [0u8; 8];
    buf[..width].copy_from_slice(num);
    Ok((u64::from_le_bytes(buf), rest))
}
