//! Supported Bitcoin networks.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use chainfeed_core::error::IndexerError;
use chainfeed_core::types::BlockHash;

const MAIN_GENESIS: [u8; 32] = [
    0x00, 0x00, 0x00, 0x00, 0x00, 0x19, 0xd6, 0x68, 0x9c, 0x08, 0x5a, 0xe1, 0x65, 0x83, 0x1e, 0x93,
    0x4f, 0xf7, 0x63, 0xae, 0x46, 0xa2, 0xa6, 0xc1, 0x72, 0xb3, 0xf1, 0xb6, 0x0a, 0x8c, 0xe2, 0x6f,
];

const TEST_GENESIS: [u8; 32] = [
    0x00, 0x00, 0x00, 0x00, 0x09, 0x33, 0xea, 0x01, 0xad, 0x0e, 0xe9, 0x84, 0x20, 0x97, 0x79, 0xba,
    0xae, 0xc3, 0xce, 0xd9, 0x0f, 0xa3, 0xf4, 0x08, 0x71, 0x95, 0x26, 0xf8, 0xd7, 0x7f, 0x49, 0x43,
];

/// Bitcoin network a run indexes. Its name namespaces checkpoint ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Network {
    Main,
    Test,
}

impl Network {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Main => "Main",
            Self::Test => "Test",
        }
    }

    /// Hash of the network's genesis block, in display order.
    pub fn genesis_hash(&self) -> BlockHash {
        match self {
            Self::Main => BlockHash::new(MAIN_GENESIS),
            Self::Test => BlockHash::new(TEST_GENESIS),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Network {
    type Err = IndexerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "main" | "mainnet" => Ok(Self::Main),
            "test" | "testnet" => Ok(Self::Test),
            _ => Err(IndexerError::Config(format!(
                "unknown network '{s}' (expected Main or Test)"
            ))),
        }
    }
}
