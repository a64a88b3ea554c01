//! End-to-end engine runs over an in-memory chain and store.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chainfeed_core::{
    AttachmentBatch, Batch, Block, BlockFetcher, BlockHash, BlockSource, CancellationToken,
    Checkpoint, CheckpointManager, Document, DocumentStore, EngineBuilder, EngineConfig, ExponentialBackoff,
    HeaderChain, IndexOutcome, Indexer, IndexerError, IndexingEngine, MemoryChain,
    MemoryDocumentStore, PositionedBlock, RunState,
};

const NETWORK: &str = "Main";
const CHECKPOINT: &str = "test:Heights";

// ─── Test indexer ─────────────────────────────────────────────────────────────

/// Writes block heights; failure, delay, panic and cancellation are scripted.
#[derive(Default, Clone)]
struct HeightIndexer {
    threshold: usize,
    written: Arc<Mutex<Vec<u64>>>,
    writes: Arc<AtomicU32>,
    /// A batch containing one of these heights always fails.
    fail_on: HashSet<u64>,
    /// The first `flaky` write attempts fail.
    flaky: u32,
    /// A batch containing this height panics.
    panic_on: Option<u64>,
    /// Per-batch write delay in milliseconds, keyed by the batch's first height.
    delay: Option<fn(u64) -> u64>,
    /// Cancel `token` when this height is accumulated.
    cancel_at: Option<(u64, CancellationToken)>,
    /// Cancel `token` once the batch holding this height has been written.
    cancel_after_write: Option<(u64, CancellationToken)>,
    skip: bool,
}

impl HeightIndexer {
    fn new(threshold: usize) -> Self {
        Self {
            threshold,
            ..Default::default()
        }
    }

    fn written(&self) -> Vec<u64> {
        let mut w = self.written.lock().unwrap().clone();
        w.sort_unstable();
        w
    }
}

#[async_trait]
impl Indexer for HeightIndexer {
    type Item = u64;

    fn name(&self) -> &str {
        "Heights"
    }

    fn skip_to_end(&self) -> bool {
        self.skip
    }

    fn accumulate(&self, block: &PositionedBlock, batch: &mut Batch<u64>) -> bool {
        if let Some((height, token)) = &self.cancel_at {
            if block.height == *height {
                token.cancel();
            }
        }
        batch.push(block.height);
        batch.len() >= self.threshold
    }

    async fn write(&self, items: &[u64]) -> Result<(), IndexerError> {
        let attempt = self.writes.fetch_add(1, Ordering::SeqCst);
        if let (Some(delay), Some(first)) = (self.delay, items.first()) {
            tokio::time::sleep(Duration::from_millis(delay(*first))).await;
        }
        if self.panic_on.is_some_and(|h| items.contains(&h)) {
            panic!("scripted panic");
        }
        if items.iter().any(|h| self.fail_on.contains(h)) {
            return Err(IndexerError::Storage(format!("cannot write batch at {}", items[0])));
        }
        if attempt < self.flaky {
            return Err(IndexerError::Storage("transient".into()));
        }
        self.written.lock().unwrap().extend_from_slice(items);
        if let Some((height, token)) = &self.cancel_after_write {
            if items.contains(height) {
                token.cancel();
            }
        }
        Ok(())
    }
}

// ─── Harness ──────────────────────────────────────────────────────────────────

fn fast_retry() -> ExponentialBackoff {
    ExponentialBackoff::new(
        2,
        Duration::from_millis(1),
        Duration::from_millis(5),
        Duration::from_millis(1),
    )
}

fn config() -> EngineConfig {
    EngineBuilder::new()
        .concurrency(4)
        .retry(fast_retry())
        .build_config()
}

struct Harness {
    chain: Arc<MemoryChain>,
    store: Arc<MemoryDocumentStore>,
}

impl Harness {
    fn new(chain: MemoryChain) -> Self {
        Self {
            chain: Arc::new(chain),
            store: Arc::new(MemoryDocumentStore::new()),
        }
    }

    async fn run(
        &self,
        indexer: HeightIndexer,
        config: EngineConfig,
        to_height: Option<u64>,
        cancel: CancellationToken,
    ) -> (Result<IndexOutcome, IndexerError>, IndexingEngine<HeightIndexer>) {
        self.run_with_source(indexer, config, to_height, cancel, self.chain.clone())
            .await
    }

    async fn run_with_source(
        &self,
        indexer: HeightIndexer,
        config: EngineConfig,
        to_height: Option<u64>,
        cancel: CancellationToken,
        source: Arc<dyn BlockSource>,
    ) -> (Result<IndexOutcome, IndexerError>, IndexingEngine<HeightIndexer>) {
        let manager = CheckpointManager::new(
            self.store.clone(),
            CHECKPOINT,
            NETWORK,
            config.save_interval,
        );
        let mut engine = IndexingEngine::new(indexer, manager, config);
        let cp = engine
            .load_checkpoint(self.chain.genesis_hash())
            .await
            .unwrap();
        let mut fetcher = BlockFetcher::new(cp, self.chain.clone(), source, cancel);
        if let Some(h) = to_height {
            fetcher = fetcher.with_to_height(h);
        }
        let result = engine.run(&mut fetcher).await;
        (result, engine)
    }

    /// Height of the persisted checkpoint, `None` if none was saved.
    async fn checkpoint_height(&self) -> Option<u64> {
        let cp = Checkpoint::try_load(self.store.as_ref(), CHECKPOINT, NETWORK)
            .await
            .unwrap()?;
        self.chain.find_fork(cp.locator()).map(|h| h.height)
    }
}

// ─── Scenarios ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn genesis_checkpoint_indexes_whole_chain() {
    let h = Harness::new(MemoryChain::synthetic(3, 0));
    let indexer = HeightIndexer::new(100);
    let (result, engine) = h
        .run(indexer.clone(), config(), None, CancellationToken::new())
        .await;

    assert_eq!(result.unwrap(), IndexOutcome::Completed);
    assert_eq!(engine.state(), RunState::Completed);
    assert_eq!(indexer.written(), vec![0, 1, 2]);
    assert_eq!(h.checkpoint_height().await, Some(2));

    let cp = Checkpoint::load(h.store.as_ref(), CHECKPOINT, NETWORK).await.unwrap();
    assert_eq!(cp.locator().tip(), h.chain.header_at(2).unwrap().hash());
    assert_eq!(engine.counters().scheduled(), 3);
    assert_eq!(engine.counters().indexed(), 3);
}

#[tokio::test]
async fn failed_job_holds_checkpoint_below_it() {
    let h = Harness::new(MemoryChain::synthetic(1000, 0));
    let mut indexer = HeightIndexer::new(100);
    indexer.fail_on.insert(500);
    // The failing batch is slow, so later batches finish first.
    indexer.delay = Some(|first| if first == 500 { 50 } else { 0 });

    let (result, engine) = h
        .run(indexer.clone(), config(), None, CancellationToken::new())
        .await;

    let err = result.unwrap_err();
    assert!(matches!(err, IndexerError::Storage(_)), "{err}");
    assert_eq!(engine.state(), RunState::Failed);
    assert!(indexer.written().contains(&650));
    assert!(!indexer.written().contains(&500));
    assert_eq!(h.checkpoint_height().await, Some(499));
}

#[tokio::test]
async fn stops_where_peer_data_ends() {
    let mut chain = MemoryChain::synthetic(11, 0);
    chain.truncate_bodies(7);
    let h = Harness::new(chain);
    let indexer = HeightIndexer::new(3);
    let (result, _) = h
        .run(indexer.clone(), config(), Some(10), CancellationToken::new())
        .await;

    assert_eq!(result.unwrap(), IndexOutcome::Completed);
    assert_eq!(indexer.written(), (0..=7).collect::<Vec<_>>());
    assert_eq!(h.checkpoint_height().await, Some(7));
}

#[tokio::test]
async fn skip_to_end_checkpoints_tip_only() {
    let h = Harness::new(MemoryChain::synthetic(8, 0));
    let mut indexer = HeightIndexer::new(3);
    indexer.skip = true;
    let (result, engine) = h
        .run(indexer.clone(), config(), Some(10), CancellationToken::new())
        .await;

    assert_eq!(result.unwrap(), IndexOutcome::Completed);
    assert!(indexer.written().is_empty());
    assert_eq!(engine.counters().scheduled(), 0);
    assert_eq!(h.checkpoint_height().await, Some(7));
}

#[tokio::test]
async fn cancellation_drains_dispatched_jobs() {
    let h = Harness::new(MemoryChain::synthetic(30, 0));
    let token = CancellationToken::new();
    let mut indexer = HeightIndexer::new(10);
    indexer.delay = Some(|_| 20);
    indexer.cancel_at = Some((20, token.clone()));

    let (result, engine) = h.run(indexer.clone(), config(), None, token).await;

    assert_eq!(result.unwrap(), IndexOutcome::Cancelled);
    assert_eq!(engine.state(), RunState::Cancelled);
    assert_eq!(indexer.written(), (0..20).collect::<Vec<_>>());
    assert_eq!(engine.counters().scheduled(), 20);
    assert_eq!(engine.counters().indexed(), 20);
    assert_eq!(h.checkpoint_height().await, Some(19));
}

// ─── Properties ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn backpressure_bounds_outstanding_jobs() {
    let h = Harness::new(MemoryChain::synthetic(60, 0));
    let mut indexer = HeightIndexer::new(1);
    indexer.delay = Some(|_| 2);
    let config = EngineBuilder::new()
        .concurrency(1)
        .max_queued(4)
        .retry(fast_retry())
        .build_config();

    let (result, engine) = h.run(indexer.clone(), config, None, CancellationToken::new()).await;

    assert_eq!(result.unwrap(), IndexOutcome::Completed);
    assert!(engine.peak_outstanding() <= 4, "peak {}", engine.peak_outstanding());
    assert!(engine.peak_outstanding() >= 2);
    assert_eq!(indexer.written(), (0..60).collect::<Vec<_>>());
}

#[tokio::test]
async fn backpressure_resumes_at_half_the_limit() {
    let h = Harness::new(MemoryChain::synthetic(40, 0));
    let mut indexer = HeightIndexer::new(1);
    indexer.delay = Some(|_| 3);
    let config = EngineBuilder::new()
        .concurrency(1)
        .max_queued(6)
        .retry(fast_retry())
        .build_config();

    let (result, engine) = h.run(indexer.clone(), config, None, CancellationToken::new()).await;

    assert_eq!(result.unwrap(), IndexOutcome::Completed);
    assert!(engine.stalls() > 0);
    assert!(
        engine.resume_outstanding() <= 3,
        "resumed with {} outstanding",
        engine.resume_outstanding()
    );
    assert_eq!(indexer.written(), (0..40).collect::<Vec<_>>());
}

#[tokio::test]
async fn cancellation_during_backpressure_stops_dispatch() {
    let h = Harness::new(MemoryChain::synthetic(40, 0));
    let token = CancellationToken::new();
    let mut indexer = HeightIndexer::new(1);
    indexer.delay = Some(|_| 10);
    indexer.cancel_after_write = Some((0, token.clone()));
    let config = EngineBuilder::new()
        .concurrency(1)
        .max_queued(4)
        .retry(fast_retry())
        .build_config();

    let (result, engine) = h.run(indexer.clone(), config, None, token).await;

    assert_eq!(result.unwrap(), IndexOutcome::Cancelled);
    assert_eq!(engine.stalls(), 1);
    assert_eq!(engine.counters().scheduled(), 4);
    assert_eq!(indexer.written(), vec![0, 1, 2, 3]);
    assert_eq!(h.checkpoint_height().await, Some(3));
}

#[tokio::test]
async fn resumes_without_gap_or_duplicate() {
    let h = Harness::new(MemoryChain::synthetic(50, 0));
    let first = HeightIndexer::new(7);
    let (result, _) = h
        .run(first.clone(), config(), Some(20), CancellationToken::new())
        .await;
    assert_eq!(result.unwrap(), IndexOutcome::Completed);
    assert_eq!(h.checkpoint_height().await, Some(20));

    let second = HeightIndexer::new(7);
    let (result, _) = h
        .run(second.clone(), config(), None, CancellationToken::new())
        .await;
    assert_eq!(result.unwrap(), IndexOutcome::Completed);

    assert_eq!(second.written().first(), Some(&21));
    let mut all = first.written();
    all.extend(second.written());
    assert_eq!(all, (0..50).collect::<Vec<_>>());
}

#[tokio::test]
async fn periodic_save_flushes_partial_batches() {
    let h = Harness::new(MemoryChain::synthetic(10, 0));
    let indexer = HeightIndexer::new(1_000);
    let config = EngineBuilder::new()
        .save_interval(Duration::ZERO)
        .retry(fast_retry())
        .build_config();

    let (result, _) = h.run(indexer.clone(), config, None, CancellationToken::new()).await;

    assert_eq!(result.unwrap(), IndexOutcome::Completed);
    assert_eq!(indexer.writes.load(Ordering::SeqCst), 10);
    assert_eq!(indexer.written(), (0..10).collect::<Vec<_>>());
    assert_eq!(h.checkpoint_height().await, Some(9));
}

#[tokio::test]
async fn transient_failures_are_retried() {
    let h = Harness::new(MemoryChain::synthetic(5, 0));
    let mut indexer = HeightIndexer::new(100);
    indexer.flaky = 2;
    let (result, _) = h
        .run(indexer.clone(), config(), None, CancellationToken::new())
        .await;

    assert_eq!(result.unwrap(), IndexOutcome::Completed);
    assert_eq!(indexer.writes.load(Ordering::SeqCst), 3);
    assert_eq!(indexer.written(), (0..5).collect::<Vec<_>>());
}

#[tokio::test]
async fn panicking_job_fails_the_run() {
    let h = Harness::new(MemoryChain::synthetic(30, 0));
    let mut indexer = HeightIndexer::new(10);
    indexer.panic_on = Some(15);
    let (result, _) = h
        .run(indexer.clone(), config(), None, CancellationToken::new())
        .await;

    assert!(matches!(result, Err(IndexerError::JobPanicked(_))));
    assert!(h.checkpoint_height().await.unwrap() < 10);
}

#[tokio::test]
async fn ignoring_checkpoints_writes_none() {
    let h = Harness::new(MemoryChain::synthetic(5, 0));
    let indexer = HeightIndexer::new(2);
    let config = EngineBuilder::new()
        .save_progression(false)
        .retry(fast_retry())
        .build_config();
    let (result, engine) = h.run(indexer.clone(), config, None, CancellationToken::new()).await;

    assert_eq!(result.unwrap(), IndexOutcome::Completed);
    assert_eq!(indexer.written(), (0..5).collect::<Vec<_>>());
    assert_eq!(h.store.document_count(), 0);
    assert_eq!(engine.checkpoint().unwrap().locator().tip(), h.chain.header_at(4).unwrap().hash());
}

/// Serves no bodies at all.
struct BrokenPeer;

#[async_trait]
impl BlockSource for BrokenPeer {
    async fn get_blocks(
        &self,
        _hashes: &[BlockHash],
        _cancel: &CancellationToken,
    ) -> Result<Vec<Option<Block>>, IndexerError> {
        Err(IndexerError::Source("connection reset".into()))
    }
}

#[tokio::test]
async fn peer_errors_are_fatal() {
    let h = Harness::new(MemoryChain::synthetic(5, 0));
    let indexer = HeightIndexer::new(2);
    let (result, engine) = h
        .run_with_source(
            indexer.clone(),
            config(),
            None,
            CancellationToken::new(),
            Arc::new(BrokenPeer),
        )
        .await;

    assert!(matches!(result, Err(IndexerError::Source(_))));
    assert_eq!(engine.state(), RunState::Failed);
    assert!(h.checkpoint_height().await.is_none());
}

/// Records a violation if a running job's blocks are already checkpointed.
struct WatchingIndexer {
    chain: Arc<MemoryChain>,
    store: Arc<dyn DocumentStore>,
    violations: Arc<Mutex<Vec<(u64, u64)>>>,
}

#[async_trait]
impl Indexer for WatchingIndexer {
    type Item = u64;

    fn name(&self) -> &str {
        "Watching"
    }

    fn accumulate(&self, block: &PositionedBlock, batch: &mut Batch<u64>) -> bool {
        batch.push(block.height);
        batch.len() >= 5
    }

    async fn write(&self, items: &[u64]) -> Result<(), IndexerError> {
        let first = items.first().copied().unwrap_or_default();
        tokio::time::sleep(Duration::from_millis(first * 7919 % 13)).await;
        if let Some(cp) = Checkpoint::try_load(self.store.as_ref(), CHECKPOINT, NETWORK).await? {
            if let Some(fork) = self.chain.find_fork(cp.locator()) {
                if fork.height >= first {
                    self.violations.lock().unwrap().push((first, fork.height));
                }
            }
        }
        Ok(())
    }
}

#[tokio::test]
async fn checkpoint_never_passes_running_jobs() {
    let h = Harness::new(MemoryChain::synthetic(200, 0));
    let violations = Arc::new(Mutex::new(Vec::new()));
    let indexer = WatchingIndexer {
        chain: h.chain.clone(),
        store: h.store.clone(),
        violations: violations.clone(),
    };
    let config = EngineBuilder::new()
        .concurrency(8)
        .save_interval(Duration::from_millis(5))
        .retry(fast_retry())
        .build_config();
    let manager = CheckpointManager::new(h.store.clone(), CHECKPOINT, NETWORK, config.save_interval);
    let mut engine = IndexingEngine::new(indexer, manager, config);
    let cp = engine.load_checkpoint(h.chain.genesis_hash()).await.unwrap();
    let mut fetcher = BlockFetcher::new(cp, h.chain.clone(), h.chain.clone(), CancellationToken::new());

    assert_eq!(engine.run(&mut fetcher).await.unwrap(), IndexOutcome::Completed);
    assert!(violations.lock().unwrap().is_empty(), "{:?}", violations.lock().unwrap());
    assert_eq!(h.checkpoint_height().await, Some(199));
}

/// Memory store whose checkpoint writes start failing after `good_saves`.
struct FailingCheckpointStore {
    inner: MemoryDocumentStore,
    good_saves: u32,
    saves: AtomicU32,
}

impl FailingCheckpointStore {
    fn new(good_saves: u32) -> Self {
        Self {
            inner: MemoryDocumentStore::new(),
            good_saves,
            saves: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl DocumentStore for FailingCheckpointStore {
    async fn load(&self, id: &str) -> Result<Option<Document>, IndexerError> {
        self.inner.load(id).await
    }

    async fn store(&self, document: Document) -> Result<(), IndexerError> {
        self.inner.store(document).await
    }

    async fn delete(&self, id: &str) -> Result<bool, IndexerError> {
        self.inner.delete(id).await
    }

    async fn bulk_insert(&self, documents: Vec<Document>) -> Result<(), IndexerError> {
        self.inner.bulk_insert(documents).await
    }

    async fn store_attachments(&self, batch: AttachmentBatch) -> Result<(), IndexerError> {
        self.inner.store_attachments(batch).await
    }

    async fn store_with_attachments(
        &self,
        document: Document,
        batch: AttachmentBatch,
    ) -> Result<(), IndexerError> {
        if self.saves.fetch_add(1, Ordering::SeqCst) >= self.good_saves {
            return Err(IndexerError::Storage("disk full".into()));
        }
        self.inner.store_with_attachments(document, batch).await
    }

    async fn get_attachment(&self, id: &str, name: &str) -> Result<Option<Vec<u8>>, IndexerError> {
        self.inner.get_attachment(id, name).await
    }

    async fn load_starting_with(&self, prefix: &str) -> Result<Vec<Document>, IndexerError> {
        self.inner.load_starting_with(prefix).await
    }
}

#[tokio::test]
async fn failed_checkpoint_write_fails_the_run() {
    let chain = Arc::new(MemoryChain::synthetic(10, 0));
    let store = Arc::new(FailingCheckpointStore::new(2));
    let indexer = HeightIndexer::new(1_000);
    let config = EngineBuilder::new()
        .save_interval(Duration::ZERO)
        .retry(fast_retry())
        .build_config();
    let manager = CheckpointManager::new(store.clone(), CHECKPOINT, NETWORK, config.save_interval);
    let mut engine = IndexingEngine::new(indexer.clone(), manager, config);
    let cp = engine.load_checkpoint(chain.genesis_hash()).await.unwrap();
    let mut fetcher = BlockFetcher::new(cp, chain.clone(), chain.clone(), CancellationToken::new());

    let result = engine.run(&mut fetcher).await;

    assert!(matches!(result, Err(IndexerError::Storage(_))));
    assert_eq!(engine.state(), RunState::Failed);
    // Heights 0 and 1 were committed before the store started failing.
    let saved = Checkpoint::load(store.as_ref(), CHECKPOINT, NETWORK).await.unwrap();
    assert_eq!(chain.find_fork(saved.locator()).map(|h| h.height), Some(1));
    assert_eq!(indexer.written(), vec![0, 1, 2]);
}
