//! Block records: one document per block plus its raw header.

use std::sync::Arc;

use async_trait::async_trait;

use chainfeed_core::error::IndexerError;
use chainfeed_core::indexer::{Batch, Indexer};
use chainfeed_core::store::{AttachmentBatch, Document, DocumentStore};
use chainfeed_core::types::PositionedBlock;

use crate::records::{BlockEntry, HEADER_ATTACHMENT};

/// Blocks per write job.
pub const BLOCKS_PER_BATCH: usize = 10_000;

/// Writes a [`BlockEntry`] document and a `header` attachment per block.
pub struct BlockIndexer {
    store: Arc<dyn DocumentStore>,
    batch_size: usize,
}

impl BlockIndexer {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            batch_size: BLOCKS_PER_BATCH,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }
}

#[async_trait]
impl Indexer for BlockIndexer {
    type Item = BlockEntry;

    fn name(&self) -> &str {
        "Blocks"
    }

    fn accumulate(&self, block: &PositionedBlock, batch: &mut Batch<BlockEntry>) -> bool {
        batch.push(BlockEntry::new(block));
        batch.len() >= self.batch_size
    }

    async fn write(&self, items: &[BlockEntry]) -> Result<(), IndexerError> {
        if items.is_empty() {
            return Ok(());
        }

        let documents = items
            .iter()
            .map(|entry| Document::from_record(entry.id.clone(), entry))
            .collect::<Result<Vec<_>, _>>()?;
        self.store.bulk_insert(documents).await?;

        let mut attachments = AttachmentBatch::new();
        for entry in items {
            attachments.add(entry.id.clone(), HEADER_ATTACHMENT, entry.header.clone())?;
        }
        self.store.store_attachments(attachments).await?;

        tracing::debug!(
            blocks = items.len(),
            first = items.first().map(|e| e.height),
            last = items.last().map(|e| e.height),
            "blocks written"
        );
        Ok(())
    }
}
