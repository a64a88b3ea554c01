//! ChainFeed CLI: run indexing passes over a recorded chain and manage
//! checkpoints.
//!
//! # Commands
//! ```text
//! chainfeed --chain-file chain.jsonl --db feed.db index --blocks --transactions
//! chainfeed --chain-file chain.jsonl index --all --from 100 --to 2000 --checkpoint-interval 00:01:00
//! chainfeed --db feed.db checkpoints list
//! chainfeed --db feed.db --chain-file chain.jsonl checkpoints add default:Blocks:1500
//! chainfeed --db feed.db checkpoints delete default:Blocks
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};

use chainfeed_bitcoin::{BlockIndexer, Network, ReplayChain, TransactionIndexer};
use chainfeed_core::{
    BlockFetcher, CancellationToken, Checkpoint, CheckpointManager, DocumentStore, EngineBuilder,
    HeaderChain, IndexCounters, IndexOutcome, Indexer, IndexerError, MemoryChain,
};
use chainfeed_storage::{MemoryDocumentStore, SqliteDocumentStore};

mod logging;

use logging::{init_tracing, LogConfig};

#[derive(Parser)]
#[command(
    name = "chainfeed",
    about = "Resumable block and transaction ingestion into a document store",
    long_about = "
ChainFeed walks a chain from its last checkpoint and writes block and
transaction records into a document store. Runs resume where the previous
one stopped.

While indexing, type q + Enter (or press Ctrl-C) to stop gracefully.

ENVIRONMENT VARIABLES:
  RUST_LOG    Log filter, overrides --log-level
",
    version
)]
struct Cli {
    /// Network: main | test
    #[arg(long, global = true, default_value = "main")]
    network: Network,

    /// SQLite database file (default: in-memory store)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Recorded chain, one JSON block per line, genesis first
    #[arg(long, global = true)]
    chain_file: Option<PathBuf>,

    /// Log filter directives
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Emit JSON structured logs
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run indexing passes
    Index(IndexArgs),

    /// Inspect and edit checkpoints
    Checkpoints {
        #[command(subcommand)]
        action: CheckpointAction,
    },
}

#[derive(Args, Debug, Clone)]
struct IndexArgs {
    /// Index blocks
    #[arg(long)]
    blocks: bool,
    /// Index transactions
    #[arg(long)]
    transactions: bool,
    /// Index address balances
    #[arg(long)]
    addresses: bool,
    /// Index wallet balances
    #[arg(long)]
    wallets: bool,
    /// Index the main chain
    #[arg(long)]
    main_chain: bool,
    /// Every available pass (blocks and transactions)
    #[arg(long)]
    all: bool,
    /// First height to index
    #[arg(long, default_value_t = 0)]
    from: u64,
    /// Last height to index (inclusive)
    #[arg(long, default_value_t = 99_999_999)]
    to: u64,
    /// Checkpoint name; each pass appends its own suffix
    #[arg(long, default_value = "default")]
    checkpoint: String,
    /// Time between checkpoint saves, HH:MM:SS or seconds
    #[arg(long, default_value = "00:15:00", value_parser = parse_interval)]
    checkpoint_interval: Duration,
    /// Neither resume from nor save checkpoints
    #[arg(long)]
    ignore_checkpoints: bool,
    /// Write jobs running at once
    #[arg(long)]
    concurrency: Option<usize>,
}

#[derive(Subcommand)]
enum CheckpointAction {
    /// List the network's checkpoints
    List,
    /// Create or move a checkpoint: <name>:<height>
    Add {
        spec: String,
    },
    /// Delete a checkpoint
    Delete {
        name: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    Blocks,
    Transactions,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&LogConfig {
        level: cli.log_level.clone(),
        json: cli.json_logs,
    });

    let store = open_store(cli.db.as_deref()).await?;

    match &cli.command {
        Commands::Index(args) => {
            let passes = selected_passes(args)?;
            let chain = load_chain(cli.chain_file.as_deref(), cli.network).await?;
            cmd_index(args, &passes, cli.network, chain, store).await
        }
        Commands::Checkpoints { action } => match action {
            CheckpointAction::List => cmd_checkpoints_list(store.as_ref(), cli.network).await,
            CheckpointAction::Add { spec } => {
                let (name, height) = parse_checkpoint_spec(spec)?;
                let chain = load_chain(cli.chain_file.as_deref(), cli.network).await?;
                cmd_checkpoints_add(store.as_ref(), cli.network, &chain, &name, height).await
            }
            CheckpointAction::Delete { name } => {
                Checkpoint::delete(store.as_ref(), name, cli.network.name()).await?;
                println!("Deleted {}", Checkpoint::to_id(name, cli.network.name()));
                Ok(())
            }
        },
    }
}

// ─── Setup ───────────────────────────────────────────────────────────────────

async fn open_store(db: Option<&Path>) -> Result<Arc<dyn DocumentStore>> {
    match db {
        Some(path) => {
            let store = SqliteDocumentStore::open(&path.to_string_lossy())
                .await
                .with_context(|| format!("open database {}", path.display()))?;
            Ok(Arc::new(store))
        }
        None => {
            tracing::warn!("no --db given, records are kept in memory only");
            Ok(Arc::new(MemoryDocumentStore::new()))
        }
    }
}

async fn load_chain(path: Option<&Path>, network: Network) -> Result<Arc<MemoryChain>> {
    let Some(path) = path else {
        bail!("--chain-file is required to read the chain");
    };
    let chain = ReplayChain::load(path).await?;
    if chain.genesis_hash() != network.genesis_hash() {
        tracing::warn!(
            network = %network,
            expected = %network.genesis_hash(),
            found = %chain.genesis_hash(),
            "chain file genesis does not match the network"
        );
    }
    Ok(Arc::new(chain))
}

/// Passes requested by `args`, failing before any work for passes that do
/// not exist yet.
fn selected_passes(args: &IndexArgs) -> Result<Vec<Pass>, IndexerError> {
    if args.addresses {
        return Err(IndexerError::NotImplemented("address indexing".into()));
    }
    if args.wallets {
        return Err(IndexerError::NotImplemented("wallet indexing".into()));
    }
    if args.main_chain {
        return Err(IndexerError::NotImplemented("main chain indexing".into()));
    }

    let mut passes = Vec::new();
    if args.blocks || args.all {
        passes.push(Pass::Blocks);
    }
    if args.transactions || args.all {
        passes.push(Pass::Transactions);
    }
    if passes.is_empty() {
        return Err(IndexerError::Config(
            "no pass selected, use --blocks, --transactions or --all".into(),
        ));
    }
    if args.from > args.to {
        return Err(IndexerError::Config(format!(
            "--from {} is above --to {}",
            args.from, args.to
        )));
    }
    Ok(passes)
}

/// `HH:MM:SS` or a plain number of seconds.
fn parse_interval(s: &str) -> Result<Duration, String> {
    let parts: Vec<&str> = s.trim().split(':').collect();
    let number = |p: &str| p.parse::<u64>().map_err(|_| format!("invalid interval '{s}'"));
    let secs = match parts.as_slice() {
        [secs] => number(secs)?,
        [h, m, sec] => {
            let (h, m, sec) = (number(h)?, number(m)?, number(sec)?);
            if m >= 60 || sec >= 60 {
                return Err(format!("invalid interval '{s}'"));
            }
            h * 3600 + m * 60 + sec
        }
        _ => return Err(format!("invalid interval '{s}', expected HH:MM:SS or seconds")),
    };
    Ok(Duration::from_secs(secs))
}

/// Split `<name>:<height>` on its last colon.
fn parse_checkpoint_spec(spec: &str) -> Result<(String, u64), IndexerError> {
    let invalid = || IndexerError::Config(format!("expected <name>:<height>, got '{spec}'"));
    let (name, height) = spec.rsplit_once(':').ok_or_else(invalid)?;
    if name.is_empty() {
        return Err(invalid());
    }
    let height = height.parse::<u64>().map_err(|_| invalid())?;
    Ok((name.to_string(), height))
}

/// Cancel `token` on `q` + Enter or Ctrl-C.
fn watch_for_quit(token: CancellationToken) -> Result<()> {
    let stdin_token = token.clone();
    std::thread::Builder::new()
        .name("quit-watcher".into())
        .spawn(move || {
            for line in std::io::stdin().lines() {
                match line {
                    Ok(l) if l.trim().eq_ignore_ascii_case("q") => {
                        tracing::info!("stop requested, finishing dispatched jobs");
                        stdin_token.cancel();
                        break;
                    }
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
        })
        .context("spawn stdin watcher")?;

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupted, finishing dispatched jobs");
            token.cancel();
        }
    });
    Ok(())
}

fn spawn_reporter(pass: String, counters: Arc<IndexCounters>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(2));
        tick.tick().await;
        loop {
            tick.tick().await;
            tracing::info!(
                pass = %pass,
                scheduled = counters.scheduled(),
                indexed = counters.indexed(),
                "progress"
            );
        }
    })
}

// ─── Command implementations ─────────────────────────────────────────────────

async fn cmd_index(
    args: &IndexArgs,
    passes: &[Pass],
    network: Network,
    chain: Arc<MemoryChain>,
    store: Arc<dyn DocumentStore>,
) -> Result<()> {
    let cancel = CancellationToken::new();
    watch_for_quit(cancel.clone())?;
    println!("Indexing {network} up to height {}. Type q + Enter to stop.", args.to.min(chain.tip_height()));

    for pass in passes {
        let outcome = match pass {
            Pass::Blocks => {
                run_pass(BlockIndexer::new(store.clone()), args, network, &chain, &store, &cancel).await?
            }
            Pass::Transactions => {
                run_pass(TransactionIndexer::new(store.clone()), args, network, &chain, &store, &cancel)
                    .await?
            }
        };
        if outcome == IndexOutcome::Cancelled {
            println!("Stopped before {pass:?} finished; the next run resumes from its checkpoint.");
            break;
        }
    }
    Ok(())
}

async fn run_pass<I: Indexer>(
    indexer: I,
    args: &IndexArgs,
    network: Network,
    chain: &Arc<MemoryChain>,
    store: &Arc<dyn DocumentStore>,
    cancel: &CancellationToken,
) -> Result<IndexOutcome> {
    let checkpoint = format!("{}:{}", args.checkpoint, indexer.name());
    let manager = CheckpointManager::new(
        store.clone(),
        checkpoint.clone(),
        network.name(),
        args.checkpoint_interval,
    );

    let mut builder = EngineBuilder::new()
        .save_interval(args.checkpoint_interval)
        .save_progression(!args.ignore_checkpoints);
    if let Some(n) = args.concurrency {
        builder = builder.concurrency(n);
    }
    let mut engine = builder.build(indexer, manager);

    let cp = engine.load_checkpoint(chain.genesis_hash()).await?;
    let mut fetcher = BlockFetcher::new(cp, chain.clone(), chain.clone(), cancel.clone())
        .with_from_height(args.from)
        .with_to_height(args.to);

    let reporter = spawn_reporter(checkpoint.clone(), engine.counters());
    let result = engine.run(&mut fetcher).await;
    reporter.abort();

    let outcome = result.with_context(|| format!("indexing {checkpoint}"))?;
    let counters = engine.counters();
    println!(
        "{checkpoint}: {} items indexed, {:?}",
        counters.indexed(),
        outcome
    );
    Ok(outcome)
}

async fn cmd_checkpoints_list(store: &dyn DocumentStore, network: Network) -> Result<()> {
    let checkpoints = Checkpoint::list(store, network.name()).await?;
    if checkpoints.is_empty() {
        println!("No checkpoints for {network}");
        return Ok(());
    }
    println!("{:<32} {:<72} {}", "NAME", "BLOCK", "LOCATOR");
    for cp in &checkpoints {
        println!("{:<32} {:<72} {}", cp.name(), cp.block_id(), cp.locator().len());
    }
    Ok(())
}

async fn cmd_checkpoints_add(
    store: &dyn DocumentStore,
    network: Network,
    chain: &MemoryChain,
    name: &str,
    height: u64,
) -> Result<()> {
    let Some(locator) = chain.locator_at(height) else {
        bail!(
            "height {height} is above the chain tip {}",
            chain.tip_height()
        );
    };
    let cp = Checkpoint::create_or_update(store, name, network.name(), locator).await?;
    println!("{} -> {} (height {height})", cp.id(), cp.block_id());
    Ok(())
}
