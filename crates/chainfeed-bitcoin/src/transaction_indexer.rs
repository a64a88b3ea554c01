//! Transaction records: one document per confirmed transaction plus its raw
//! bytes.

use std::sync::Arc;

use async_trait::async_trait;

use chainfeed_core::error::IndexerError;
use chainfeed_core::indexer::{Batch, Indexer};
use chainfeed_core::store::{AttachmentBatch, Document, DocumentStore};
use chainfeed_core::types::PositionedBlock;

use crate::records::{TransactionEntry, TRANSACTION_ATTACHMENT};

/// Transactions per write job.
pub const TRANSACTIONS_PER_BATCH: usize = 1_000;

/// Writes a [`TransactionEntry`] document and a `transaction` attachment per
/// transaction.
///
/// Two historical coinbase transactions share their hash with an earlier
/// one. When both land in the same batch the second attachment is skipped
/// with a warning; the document keeps the later block.
pub struct TransactionIndexer {
    store: Arc<dyn DocumentStore>,
    batch_size: usize,
}

impl TransactionIndexer {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            batch_size: TRANSACTIONS_PER_BATCH,
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
impl Indexer for TransactionIndexer {
    type Item = TransactionEntry;

    fn name(&self) -> &str {
        "Transactions"
    }

    fn accumulate(&self, block: &PositionedBlock, batch: &mut Batch<TransactionEntry>) -> bool {
        batch.extend(TransactionEntry::from_block(block));
        batch.len() >= self.batch_size
    }

    async fn write(&self, items: &[TransactionEntry]) -> Result<(), IndexerError> {
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
            match attachments.add(entry.id.clone(), TRANSACTION_ATTACHMENT, entry.raw.clone()) {
                Ok(()) => {}
                Err(e) if e.is_duplicate_attachment() => {
                    tracing::warn!(id = %entry.id, block = %entry.block_id, "duplicate transaction hash, attachment skipped");
                }
                Err(e) => return Err(e),
            }
        }
        self.store.store_attachments(attachments).await?;

        tracing::debug!(transactions = items.len(), "transactions written");
        Ok(())
    }
}
