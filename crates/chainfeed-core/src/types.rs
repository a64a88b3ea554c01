//! Shared chain types for the ingestion pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::IndexerError;

// ─── Hash256 ──────────────────────────────────────────────────────────────────

/// A 32-byte block or transaction hash, rendered as lowercase hex.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash256([u8; 32]);

/// Hash identifying a block header.
pub type BlockHash = Hash256;

/// Hash identifying a transaction.
pub type TxHash = Hash256;

impl Hash256 {
    pub const LEN: usize = 32;

    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Build a hash from a slice, which must be exactly 32 bytes long.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, IndexerError> {
        let arr: [u8; 32] = bytes.try_into().map_err(|_| {
            IndexerError::InvalidLocator(format!("expected 32 hash bytes, got {}", bytes.len()))
        })?;
        Ok(Self(arr))
    }

    /// A hash whose last eight bytes hold `n` big-endian. Handy for fixtures.
    pub fn from_low_u64_be(n: u64) -> Self {
        let mut bytes = [0u8; 32];
        bytes[24..].copy_from_slice(&n.to_be_bytes());
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash256({self})")
    }
}

impl FromStr for Hash256 {
    type Err = IndexerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(s)
            .map_err(|e| IndexerError::Config(format!("invalid hash '{s}': {e}")))?;
        Self::from_slice(&bytes)
            .map_err(|_| IndexerError::Config(format!("invalid hash '{s}': expected 64 hex chars")))
    }
}

impl Serialize for Hash256 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Hash256 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Document id prefix for block records.
pub const BLOCK_ID_PREFIX: &str = "blk:";

/// Document id of the block with `hash`.
pub fn block_document_id(hash: &BlockHash) -> String {
    format!("{BLOCK_ID_PREFIX}{hash}")
}

// ─── Headers and blocks ───────────────────────────────────────────────────────

/// A block header as delivered by the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub hash: BlockHash,
    pub previous_hash: BlockHash,
    /// Block timestamp (UTC).
    pub time: DateTime<Utc>,
    /// Canonical wire-format bytes of the header.
    pub raw: Vec<u8>,
}

/// A header placed at a height in the local header chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainedHeader {
    pub height: u64,
    pub header: BlockHeader,
}

impl ChainedHeader {
    pub fn new(height: u64, header: BlockHeader) -> Self {
        Self { height, header }
    }

    pub fn hash(&self) -> BlockHash {
        self.header.hash
    }
}

/// A transaction with its canonical wire bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub hash: TxHash,
    pub raw: Vec<u8>,
}

/// A full block body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> BlockHash {
        self.header.hash
    }
}

// ─── PositionedBlock ──────────────────────────────────────────────────────────

/// A block together with the height it was fetched at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionedBlock {
    pub height: u64,
    pub block: Block,
}

impl PositionedBlock {
    pub fn new(height: u64, block: Block) -> Self {
        Self { height, block }
    }

    pub fn hash(&self) -> BlockHash {
        self.block.header.hash
    }

    pub fn previous_hash(&self) -> BlockHash {
        self.block.header.previous_hash
    }

    pub fn time(&self) -> DateTime<Utc> {
        self.block.header.time
    }

    pub fn raw_header(&self) -> &[u8] {
        &self.block.header.raw
    }

    /// Returns `true` if `parent` is the direct parent of `self`.
    pub fn extends(&self, parent: &PositionedBlock) -> bool {
        self.height == parent.height + 1 && self.previous_hash() == parent.hash()
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
