//! Checkpoints: persist the pipeline's position for crash recovery.
//!
//! A checkpoint stores a [`BlockLocator`] rather than a single height, so a
//! restarted run can find its fork point even if the previous tip was
//! reorganized away. Each checkpoint is one document keyed
//! `"<network>/Checkpoint/<name>"` plus a `locator` attachment holding the
//! serialized locator.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::IndexerError;
use crate::locator::BlockLocator;
use crate::store::{AttachmentBatch, Document, DocumentStore};
use crate::types::{block_document_id, BlockHash};

/// Infix between the network and the checkpoint name in document ids.
const ID_INFIX: &str = "/Checkpoint/";

/// Attachment name holding the serialized locator.
pub const LOCATOR_ATTACHMENT: &str = "locator";

/// Persisted document body.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CheckpointRecord {
    name: String,
    network: String,
    block_id: String,
    genesis_id: String,
    /// Unix timestamp of the last write.
    updated_at: i64,
}

/// A named, per-network resume position.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    name: String,
    network: String,
    locator: BlockLocator,
    block_id: String,
    genesis_id: String,
    bytes: OnceLock<Vec<u8>>,
}

impl Checkpoint {
    /// Build an unsaved checkpoint. A `name` that already carries the
    /// `<network>/Checkpoint/` prefix is accepted.
    pub fn new(name: &str, network: &str, locator: BlockLocator) -> Self {
        let name = name
            .strip_prefix(&Self::to_prefix(network))
            .unwrap_or(name)
            .to_string();
        let mut cp = Self {
            name,
            network: network.to_string(),
            block_id: String::new(),
            genesis_id: String::new(),
            locator: BlockLocator::genesis(BlockHash::default()),
            bytes: OnceLock::new(),
        };
        cp.set_locator(locator);
        cp
    }

    /// Document id for `(name, network)`.
    pub fn to_id(name: &str, network: &str) -> String {
        let prefix = Self::to_prefix(network);
        if name.starts_with(&prefix) {
            name.to_string()
        } else {
            format!("{prefix}{name}")
        }
    }

    /// Id prefix shared by every checkpoint of `network`.
    pub fn to_prefix(network: &str) -> String {
        format!("{network}{ID_INFIX}")
    }

    pub fn id(&self) -> String {
        Self::to_id(&self.name, &self.network)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    pub fn locator(&self) -> &BlockLocator {
        &self.locator
    }

    /// `blk:<hash>` of the most recent locator entry.
    pub fn block_id(&self) -> &str {
        &self.block_id
    }

    /// `blk:<hash>` of the locator anchor.
    pub fn genesis_id(&self) -> &str {
        &self.genesis_id
    }

    /// Replace the locator, recomputing derived ids and dropping cached bytes.
    pub fn set_locator(&mut self, locator: BlockLocator) {
        self.block_id = block_document_id(&locator.tip());
        self.genesis_id = block_document_id(&locator.anchor());
        self.locator = locator;
        self.bytes = OnceLock::new();
    }

    /// Serialized locator, computed once per locator value.
    pub fn locator_bytes(&self) -> &[u8] {
        self.bytes.get_or_init(|| self.locator.to_bytes())
    }

    // ─── Store operations ────────────────────────────────────────────────────

    /// Load a checkpoint, failing with [`IndexerError::CheckpointNotFound`].
    pub async fn load(
        store: &dyn DocumentStore,
        name: &str,
        network: &str,
    ) -> Result<Self, IndexerError> {
        Self::try_load(store, name, network)
            .await?
            .ok_or_else(|| IndexerError::CheckpointNotFound {
                id: Self::to_id(name, network),
            })
    }

    /// Load a checkpoint, `None` if it was never saved.
    pub async fn try_load(
        store: &dyn DocumentStore,
        name: &str,
        network: &str,
    ) -> Result<Option<Self>, IndexerError> {
        match store.load(&Self::to_id(name, network)).await? {
            Some(doc) => Self::from_document(store, doc).await.map(Some),
            None => Ok(None),
        }
    }

    /// Upsert the checkpoint document and its locator attachment.
    pub async fn create_or_update(
        store: &dyn DocumentStore,
        name: &str,
        network: &str,
        locator: BlockLocator,
    ) -> Result<Self, IndexerError> {
        let cp = Self::new(name, network, locator);
        cp.save(store).await?;
        Ok(cp)
    }

    /// Write the document and its locator attachment in one atomic store write.
    pub async fn save(&self, store: &dyn DocumentStore) -> Result<(), IndexerError> {
        let record = CheckpointRecord {
            name: self.name.clone(),
            network: self.network.clone(),
            block_id: self.block_id.clone(),
            genesis_id: self.genesis_id.clone(),
            updated_at: chrono::Utc::now().timestamp(),
        };
        let id = self.id();
        let document = Document::from_record(&id, &record)?;

        let mut batch = AttachmentBatch::new();
        batch.add(&id, LOCATOR_ATTACHMENT, self.locator_bytes().to_vec())?;
        store.store_with_attachments(document, batch).await
    }

    /// Delete a checkpoint and its locator.
    pub async fn delete(
        store: &dyn DocumentStore,
        name: &str,
        network: &str,
    ) -> Result<(), IndexerError> {
        let id = Self::to_id(name, network);
        if store.delete(&id).await? {
            Ok(())
        } else {
            Err(IndexerError::CheckpointNotFound { id })
        }
    }

    /// Every checkpoint of `network`, ordered by id.
    pub async fn list(store: &dyn DocumentStore, network: &str) -> Result<Vec<Self>, IndexerError> {
        let docs = store.load_starting_with(&Self::to_prefix(network)).await?;
        let mut out = Vec::with_capacity(docs.len());
        for doc in docs {
            out.push(Self::from_document(store, doc).await?);
        }
        Ok(out)
    }

    async fn from_document(store: &dyn DocumentStore, doc: Document) -> Result<Self, IndexerError> {
        let record: CheckpointRecord = doc.to_record()?;
        let bytes = store
            .get_attachment(&doc.id, LOCATOR_ATTACHMENT)
            .await?
            .ok_or_else(|| {
                IndexerError::Storage(format!("checkpoint {} has no locator attachment", doc.id))
            })?;
        let cp = Self::new(&record.name, &record.network, BlockLocator::from_bytes(&bytes)?);
        if cp.block_id != record.block_id {
            return Err(IndexerError::Storage(format!(
                "checkpoint {} is inconsistent: document points at {}, locator at {}",
                doc.id, record.block_id, cp.block_id
            )));
        }
        Ok(cp)
    }
}

// ─── CheckpointManager ────────────────────────────────────────────────────────

/// Engine-side owner of one checkpoint.
///
/// Only the producer commits through the manager, which gives the checkpoint
/// its single writer.
pub struct CheckpointManager {
    store: Arc<dyn DocumentStore>,
    name: String,
    network: String,
    /// Minimum time between periodic saves.
    save_interval: Duration,
    /// When `false`, checkpoints are neither loaded nor saved.
    save_progression: bool,
    last_saved: Instant,
    current: Option<Checkpoint>,
}

impl CheckpointManager {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        name: impl Into<String>,
        network: impl Into<String>,
        save_interval: Duration,
    ) -> Self {
        Self {
            store,
            name: name.into(),
            network: network.into(),
            save_interval,
            save_progression: true,
            last_saved: Instant::now(),
            current: None,
        }
    }

    pub fn with_save_progression(mut self, save_progression: bool) -> Self {
        self.save_progression = save_progression;
        self
    }

    pub fn with_save_interval(mut self, save_interval: Duration) -> Self {
        self.save_interval = save_interval;
        self
    }

    pub fn save_progression(&self) -> bool {
        self.save_progression
    }

    pub fn save_interval(&self) -> Duration {
        self.save_interval
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn id(&self) -> String {
        Checkpoint::to_id(&self.name, &self.network)
    }

    /// Resume from the persisted checkpoint, or start at `genesis`.
    ///
    /// Nothing is written here; a fresh checkpoint is first persisted by
    /// [`commit`](Self::commit).
    pub async fn load_or_create(&mut self, genesis: BlockHash) -> Result<Checkpoint, IndexerError> {
        let loaded = if self.save_progression {
            Checkpoint::try_load(self.store.as_ref(), &self.name, &self.network).await?
        } else {
            None
        };
        let cp = match loaded {
            Some(cp) => {
                tracing::info!(checkpoint = %cp.id(), block = %cp.locator().tip(), "resuming from checkpoint");
                cp
            }
            None => {
                tracing::info!(checkpoint = %self.id(), %genesis, "starting from genesis");
                Checkpoint::new(&self.name, &self.network, BlockLocator::genesis(genesis))
            }
        };
        self.last_saved = Instant::now();
        self.current = Some(cp.clone());
        Ok(cp)
    }

    /// `true` once the save interval has elapsed and progression is saved.
    pub fn needs_save(&self) -> bool {
        self.save_progression && self.last_saved.elapsed() >= self.save_interval
    }

    /// Persist `locator` as the new position and reset the interval timer.
    pub async fn commit(&mut self, locator: BlockLocator) -> Result<Checkpoint, IndexerError> {
        self.last_saved = Instant::now();
        let cp = if self.save_progression {
            let cp = Checkpoint::create_or_update(
                self.store.as_ref(),
                &self.name,
                &self.network,
                locator,
            )
            .await?;
            tracing::debug!(checkpoint = %cp.id(), block = %cp.locator().tip(), "checkpoint saved");
            cp
        } else {
            Checkpoint::new(&self.name, &self.network, locator)
        };
        self.current = Some(cp.clone());
        Ok(cp)
    }

    /// Restart the save interval without writing anything.
    pub fn mark_saved(&mut self) {
        self.last_saved = Instant::now();
    }

    /// The last loaded or committed checkpoint.
    pub fn checkpoint(&self) -> Option<&Checkpoint> {
        self.current.as_ref()
    }
}
