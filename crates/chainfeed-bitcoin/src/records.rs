//! Stored record shapes for blocks and transactions.

use std::ops::BitOr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use chainfeed_core::types::{block_document_id, BlockHash, PositionedBlock, Transaction, TxHash, BLOCK_ID_PREFIX};

/// Document id prefix for transaction records.
pub const TX_ID_PREFIX: &str = "tx:";

/// Attachment holding a block's raw header bytes.
pub const HEADER_ATTACHMENT: &str = "header";

/// Attachment holding a transaction's raw bytes.
pub const TRANSACTION_ATTACHMENT: &str = "transaction";

/// 100ns ticks between 0001-01-01 and the Unix epoch.
const UNIX_EPOCH_TICKS: i64 = 621_355_968_000_000_000;

/// Sortable UTC timestamp in 100ns ticks since 0001-01-01.
pub fn to_ticks(time: DateTime<Utc>) -> i64 {
    UNIX_EPOCH_TICKS + time.timestamp() * 10_000_000 + i64::from(time.timestamp_subsec_nanos() / 100)
}

/// `blk:<hash>`; an id that already has the prefix is returned as is.
pub fn block_id(hash: &str) -> String {
    if hash.starts_with(BLOCK_ID_PREFIX) {
        hash.to_string()
    } else {
        format!("{BLOCK_ID_PREFIX}{hash}")
    }
}

/// `tx:<hash>`; an id that already has the prefix is returned as is.
pub fn transaction_id(hash: &str) -> String {
    if hash.starts_with(TX_ID_PREFIX) {
        hash.to_string()
    } else {
        format!("{TX_ID_PREFIX}{hash}")
    }
}

pub fn transaction_document_id(hash: &TxHash) -> String {
    format!("{TX_ID_PREFIX}{hash}")
}

// ─── BlockEntry ───────────────────────────────────────────────────────────────

/// One stored block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockEntry {
    pub id: String,
    pub height: u64,
    pub previous_block: String,
    /// UTC ticks, for range queries.
    pub time: i64,
    pub unix_time: i64,
    pub human_time: DateTime<Utc>,
    pub transaction_count: usize,
    /// Ids of the block's transactions, in block order.
    pub transactions: Vec<String>,
    /// Raw header bytes, stored as an attachment.
    #[serde(skip)]
    pub header: Vec<u8>,
}

impl BlockEntry {
    pub fn new(block: &PositionedBlock) -> Self {
        let time = block.time();
        let transactions: Vec<String> = block
            .block
            .transactions
            .iter()
            .map(|tx| transaction_document_id(&tx.hash))
            .collect();
        Self {
            id: block_document_id(&block.hash()),
            height: block.height,
            previous_block: block_document_id(&block.previous_hash()),
            time: to_ticks(time),
            unix_time: time.timestamp(),
            human_time: time,
            transaction_count: transactions.len(),
            transactions,
            header: block.raw_header().to_vec(),
        }
    }
}

// ─── TransactionEntry ─────────────────────────────────────────────────────────

/// Flags describing a stored transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionKind(u8);

impl TransactionKind {
    pub const STANDARD: Self = Self(0);
    /// Included in a block.
    pub const CONFIRMED: Self = Self(1);
    /// Carries colored-coin markers.
    pub const COLORED: Self = Self(2);

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_confirmed(&self) -> bool {
        self.contains(Self::CONFIRMED)
    }

    pub fn is_colored(&self) -> bool {
        self.contains(Self::COLORED)
    }
}

impl BitOr for TransactionKind {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// One stored transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionEntry {
    pub id: String,
    pub block_id: String,
    #[serde(rename = "type")]
    pub kind: TransactionKind,
    pub time: i64,
    pub unix_time: i64,
    pub human_time: DateTime<Utc>,
    /// Raw transaction bytes, stored as an attachment.
    #[serde(skip)]
    pub raw: Vec<u8>,
}

impl TransactionEntry {
    /// Record for `tx`, confirmed in the block `block_hash` mined at `time`.
    pub fn confirmed(tx: &Transaction, block_hash: &BlockHash, time: DateTime<Utc>) -> Self {
        Self {
            id: transaction_document_id(&tx.hash),
            block_id: block_document_id(block_hash),
            kind: TransactionKind::STANDARD | TransactionKind::CONFIRMED,
            time: to_ticks(time),
            unix_time: time.timestamp(),
            human_time: time,
            raw: tx.raw.clone(),
        }
    }

    /// Records for every transaction of `block`.
    pub fn from_block(block: &PositionedBlock) -> impl Iterator<Item = Self> + '_ {
        let hash = block.hash();
        let time = block.time();
        block
            .block
            .transactions
            .iter()
            .map(move |tx| Self::confirmed(tx, &hash, time))
    }
}
