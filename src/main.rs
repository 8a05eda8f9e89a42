//! txharvest: incremental token transfer harvester.
//!
//! Usage:
//!   txharvest fetch   --config harvest.toml   # page backwards, write chunks
//!   txharvest merge   --config harvest.toml   # append unmerged chunks to the output
//!   txharvest status  --config harvest.toml   # coverage / merge progress
//!   txharvest reindex --config harvest.toml   # adopt chunk files missing from the index

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::DateTime;
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use txharvest::config::Config;
use txharvest::etherscan::EtherscanClient;
use txharvest::fetcher::Fetcher;
use txharvest::merger::Merger;
use txharvest::output::CsvOutput;
use txharvest::source::{PageSource, RetryingSource};
use txharvest::storage::chunk_store::ChunkStore;
use txharvest::storage::index::{ChunkId, RangeIndex};
use txharvest::storage::persistence::{IndexStore, JsonIndexStore};

#[derive(Parser)]
#[command(name = "txharvest", about = "Incremental token transfer harvester", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch new chunks from the explorer API.
    Fetch {
        /// Path to the TOML configuration file.
        #[arg(short, long, default_value = "harvest.toml")]
        config: PathBuf,
    },
    /// Append unmerged chunks to the consolidated output.
    Merge {
        #[arg(short, long, default_value = "harvest.toml")]
        config: PathBuf,
    },
    /// Print coverage and merge progress.
    Status {
        #[arg(short, long, default_value = "harvest.toml")]
        config: PathBuf,
    },
    /// Record chunk files that exist on disk but not in the index.
    Reindex {
        #[arg(short, long, default_value = "harvest.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let outcome = match cli.command {
        Command::Fetch { config } => run_fetch(config).await,
        Command::Merge { config } => run_merge(config),
        Command::Status { config } => run_status(config),
        Command::Reindex { config } => run_reindex(config),
    };

    if let Err(e) = outcome {
        error!(error = ?e, "Run failed; the last committed index is intact");
        std::process::exit(1);
    }
}

struct Workspace {
    cfg: Config,
    chunks: ChunkStore,
    store: JsonIndexStore,
    index: RangeIndex,
}

fn open_workspace(config_path: PathBuf) -> Result<Workspace> {
    let cfg = Config::from_file(&config_path)
        .with_context(|| format!("loading config {config_path:?}"))?;
    let chunks = ChunkStore::open(&cfg.storage.chunk_dir)?;
    let store = JsonIndexStore::new(cfg.storage.index_path());
    let index = RangeIndex::load(&store)
        .with_context(|| format!("loading index {:?}", store.path()))?;
    Ok(Workspace { cfg, chunks, store, index })
}

async fn run_fetch(config_path: PathBuf) -> Result<()> {
    let Workspace { cfg, chunks, mut store, mut index } = open_workspace(config_path)?;

    let client = EtherscanClient::new(&cfg.source)?;
    let mut source = RetryingSource::new(client, cfg.source.retry_policy());

    let floor = match (cfg.fetch.floor_block, cfg.fetch.floor_timestamp()) {
        (Some(block), _) => block,
        (None, Some(ts)) => {
            let block = source
                .get_mut()
                .block_at(ts)
                .await
                .context("resolving floor_date to a block")?;
            info!(floor_date = ?cfg.fetch.floor_date, block, "Floor date resolved");
            block
        }
        (None, None) => {
            warn!("No floor configured, walking back to block 0");
            0
        }
    };

    let start = match cfg.fetch.start_block {
        Some(block) => block,
        None => source.head().await.context("looking up newest block")?,
    };

    info!(
        contract = %cfg.source.contract_address,
        start,
        floor,
        coverage = ?index.global_coverage(),
        "Starting fetch"
    );

    let report = Fetcher::new(&mut source, &chunks, &mut store)
        .run(&mut index, start, floor)
        .await
        .context("fetch")?;
    println!(
        "Fetched {} chunk(s), {} row(s); stopped: {:?}",
        report.chunks_written, report.rows_written, report.stop
    );
    Ok(())
}

fn run_merge(config_path: PathBuf) -> Result<()> {
    let Workspace { cfg, chunks, mut store, mut index } = open_workspace(config_path)?;

    let committed = index.merge_state().committed_output_len();
    let mut output = CsvOutput::open(&cfg.storage.output_path, committed)?;
    let report = Merger::new(&chunks, &mut store, &mut output, cfg.merge.checkpoint_interval)
        .run(&mut index)
        .context("merge")?;

    println!(
        "Merged {} chunk(s), {} row(s) into {:?}",
        report.merged.len(),
        report.rows_appended,
        output.path()
    );
    if !report.skipped.is_empty() {
        println!("Skipped (left unmerged, retry after repair):");
        for id in &report.skipped {
            println!("  {}", chunks.path_for(id).display());
        }
    }
    Ok(())
}

fn run_status(config_path: PathBuf) -> Result<()> {
    let Workspace { cfg, chunks, store, index } = open_workspace(config_path)?;
    let merge = index.merge_state();

    println!("=== txharvest status ===");
    println!("Index       : {}", store.path().display());
    println!("Chunks      : {}", index.len());
    match index.global_coverage() {
        Some(b) => println!("Coverage    : blocks {} .. {}", b.min, b.max),
        None => println!("Coverage    : none"),
    }
    println!("Merged      : {} / {}", merge.files.len(), index.len());
    if let Some(b) = merge.bounds {
        println!("Merged span : blocks {} .. {}", b.min, b.max);
    }
    println!("Output      : {}", cfg.storage.output_path.display());

    println!("Covered intervals:");
    for span in index.coverage().spans() {
        println!("  {span}");
    }
    let gaps = index.coverage().gaps();
    if !gaps.is_empty() {
        println!("Gaps:");
        for gap in gaps {
            println!("  {gap}");
        }
    }

    if let Some((oldest, newest)) = date_extremes(&chunks, &index) {
        println!("Oldest tx   : {oldest}");
        println!("Newest tx   : {newest}");
    }
    Ok(())
}

/// Transaction dates at both ends of coverage, read from the two edge chunks.
fn date_extremes(chunks: &ChunkStore, index: &RangeIndex) -> Option<(String, String)> {
    let mut all: Vec<(&ChunkId, _)> = index.chunks().collect();
    all.sort_by_key(|(_, r)| r.low());
    let oldest_id = all.first()?.0;
    all.sort_by_key(|(_, r)| r.high());
    let newest_id = all.last()?.0;

    let oldest = chunks.read(oldest_id).ok()?.iter().map(|r| r.time_stamp).min()?;
    let newest = chunks.read(newest_id).ok()?.iter().map(|r| r.time_stamp).max()?;
    let fmt = |ts: i64| DateTime::from_timestamp(ts, 0).map(|d| d.to_rfc3339()).unwrap_or_default();
    Some((fmt(oldest), fmt(newest)))
}

fn run_reindex(config_path: PathBuf) -> Result<()> {
    let Workspace { chunks, mut store, mut index, .. } = open_workspace(config_path)?;

    let adopted = index.adopt_orphans(chunks.scan()?);
    for id in &adopted {
        info!(chunk = %id, "Adopted chunk file missing from index");
    }
    if !adopted.is_empty() {
        store.commit(&index)?;
    }
    println!("Adopted {} chunk file(s); index holds {}", adopted.len(), index.len());
    Ok(())
}
