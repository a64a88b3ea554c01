//! Replay source: a chain recorded as JSON lines, one block per line,
//! genesis first.
//!
//! ```text
//! {"hash":"…","previous_hash":"…","time":1231006505,"header":"0100…","transactions":[{"hash":"…","raw":"01…"}]}
//! ```
//!
//! A line with `"pruned": true` contributes its header only, so the replayed
//! peer reports its body as missing.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use chainfeed_core::chain::MemoryChain;
use chainfeed_core::error::IndexerError;
use chainfeed_core::types::{Block, BlockHash, BlockHeader, Transaction, TxHash};

#[derive(Debug, Serialize, Deserialize)]
struct TransactionLine {
    hash: TxHash,
    #[serde(with = "hex_bytes")]
    raw: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct BlockLine {
    hash: BlockHash,
    previous_hash: BlockHash,
    /// Unix seconds.
    time: i64,
    #[serde(with = "hex_bytes")]
    header: Vec<u8>,
    #[serde(default)]
    transactions: Vec<TransactionLine>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pruned: bool,
}

impl BlockLine {
    fn into_block(self) -> Result<Block, IndexerError> {
        let time = DateTime::<Utc>::from_timestamp(self.time, 0)
            .ok_or_else(|| IndexerError::Source(format!("block {} has invalid time {}", self.hash, self.time)))?;
        Ok(Block {
            header: BlockHeader {
                hash: self.hash,
                previous_hash: self.previous_hash,
                time,
                raw: self.header,
            },
            transactions: self
                .transactions
                .into_iter()
                .map(|tx| Transaction {
                    hash: tx.hash,
                    raw: tx.raw,
                })
                .collect(),
        })
    }
}

/// Loads recorded chains into a [`MemoryChain`].
pub struct ReplayChain;

impl ReplayChain {
    /// Read and parse a chain file.
    pub async fn load(path: impl AsRef<Path>) -> Result<MemoryChain, IndexerError> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| IndexerError::Source(format!("cannot read {}: {e}", path.display())))?;
        let chain = Self::parse(&text)?;
        tracing::info!(
            path = %path.display(),
            blocks = chain.len(),
            tip = chain.tip().height,
            "chain file loaded"
        );
        Ok(chain)
    }

    /// Parse JSON lines. Blank lines and lines starting with `#` are ignored.
    pub fn parse(text: &str) -> Result<MemoryChain, IndexerError> {
        let mut chain: Option<MemoryChain> = None;
        for (n, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let record: BlockLine = serde_json::from_str(line)
                .map_err(|e| IndexerError::Source(format!("line {}: {e}", n + 1)))?;
            let pruned = record.pruned;
            let block = record.into_block()?;
            match chain.as_mut() {
                None => chain = Some(MemoryChain::new(block)),
                Some(c) if pruned => {
                    c.push_header(block.header)?;
                }
                Some(c) => {
                    c.push(block)?;
                }
            }
        }
        chain.ok_or_else(|| IndexerError::Source("chain file has no blocks".into()))
    }

    /// Render `block` as one line of a chain file.
    pub fn to_json_line(block: &Block) -> Result<String, IndexerError> {
        let line = BlockLine {
            hash: block.hash(),
            previous_hash: block.header.previous_hash,
            time: block.header.time.timestamp(),
            header: block.header.raw.clone(),
            transactions: block
                .transactions
                .iter()
                .map(|tx| TransactionLine {
                    hash: tx.hash,
                    raw: tx.raw.clone(),
                })
                .collect(),
            pruned: false,
        };
        Ok(serde_json::to_string(&line)?)
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(s.trim_start_matches("0x")).map_err(serde::de::Error::custom)
    }
}
