//! DAG Node
//!
//! Main entry point: opens the durable stores, restores the ledger, runs the
//! ingest loop and serves the JSON-RPC query surface until Ctrl+C.

use anyhow::Result;
use clap::Parser;
use dag_consensus::{Coordinator, Sequence, StabilityListener, Unit, UnitId};
use dag_runtime::{DurableUnitStore, Ingestor, RecordUnits, SledStore, SUBMIT_QUEUE_CAPACITY};
use rpc_server::{methods::RpcContext, HttpRpcServer};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;

use config::NodeConfig;

/// DAG main-chain consensus node
#[derive(Parser, Debug)]
#[command(name = "dag-node")]
#[command(about = "Witness-based main chain and finality for a DAG ledger", long_about = None)]
struct Args {
    /// JSON config file; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// HTTP RPC bind address
    #[arg(long)]
    rpc_addr: Option<String>,

    /// Data directory for persistent state
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Ingest tick in milliseconds
    #[arg(long)]
    tick_ms: Option<u64>,

    /// Submit units from a JSON-lines file before serving
    #[arg(long)]
    import: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn node_config(&self) -> Result<NodeConfig> {
        let mut config = match &self.config {
            Some(path) => NodeConfig::load(path)?,
            None => NodeConfig::default(),
        };
        if let Some(addr) = &self.rpc_addr {
            config.rpc_addr = addr.clone();
        }
        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
        }
        if let Some(tick) = self.tick_ms {
            config.tick_ms = tick;
        }
        config.validate()?;
        Ok(config)
    }
}

/// Logs every stabilized unit and keeps a running count
#[derive(Default)]
struct StabilityLog {
    stabilized: AtomicU64,
    final_bad: AtomicU64,
}

impl StabilityListener for StabilityLog {
    fn on_unit_stabilized(&self, unit_id: &UnitId, mci: u64, sequence: Sequence) {
        self.stabilized.fetch_add(1, Ordering::Relaxed);
        if sequence == Sequence::FinalBad {
            self.final_bad.fetch_add(1, Ordering::Relaxed);
        }
        tracing::debug!("Unit {} final at MCI {} ({:?})", unit_id.short(), mci, sequence);
    }
}

/// Feed a JSON-lines file of units through the ingestor
fn import_units<S: RecordUnits>(path: &Path, ingestor: &mut Ingestor<S>) -> Result<usize> {
    let reader = BufReader::new(std::fs::File::open(path)?);
    let sender = ingestor.unit_sender();
    let mut queued = 0;
    let mut admitted = 0;

    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let unit: Unit = serde_json::from_str(&line)
            .map_err(|e| anyhow::anyhow!("{}:{}: {}", path.display(), line_no + 1, e))?;
        sender.send(unit)?;
        queued += 1;
        if queued == SUBMIT_QUEUE_CAPACITY {
            admitted += drain(ingestor);
            queued = 0;
        }
    }
    admitted += drain(ingestor);
    Ok(admitted)
}

fn drain<S: RecordUnits>(ingestor: &mut Ingestor<S>) -> usize {
    let mut admitted = 0;
    while let Some(update) = ingestor.process_pending() {
        admitted += update.admitted.len();
    }
    admitted
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = args.node_config()?;
    run(args, config).await
}

async fn run(args: Args, config: NodeConfig) -> Result<()> {
    tracing::info!("Starting DAG node");
    tracing::info!("  HTTP RPC: {}", config.rpc_addr);
    tracing::info!("  Data directory: {:?}", config.data_dir);
    tracing::info!("  Ingest tick: {}ms", config.tick_ms);
    tracing::info!(
        "  Witnesses: {} (majority {})",
        config.consensus.witness_count,
        config.consensus.majority
    );

    std::fs::create_dir_all(&config.data_dir)?;
    let store = Arc::new(SledStore::open(&config.data_dir)?);
    let units = Arc::new(DurableUnitStore::open(store.db(), config.consensus.witness_count)?);

    let metadata = store.metadata()?;
    if metadata.commits == 0 {
        tracing::info!("No existing state found, starting fresh");
    } else {
        tracing::info!(
            "Loading state from disk: {} units, last stable MCI {}",
            metadata.unit_count,
            metadata.last_stable_mci
        );
    }

    let stability_log = Arc::new(StabilityLog::default());
    let coordinator = Arc::new(
        Coordinator::builder(units.clone(), store.clone())
            .config(config.consensus.clone())
            .listener(stability_log.clone())
            .open()?,
    );
    coordinator.catch_up()?;
    if let Err(e) = coordinator.verify_against_store() {
        tracing::error!("Ledger and unit store disagree: {}", e);
    }

    let mut ingestor = Ingestor::new(coordinator.clone(), units.clone(), config.ingest(args.verbose));
    if let Some(path) = &args.import {
        let admitted = import_units(path, &mut ingestor)?;
        tracing::info!("Imported {} units from {:?}", admitted, path);
    }

    let rpc_context = Arc::new(RpcContext {
        coordinator: coordinator.clone(),
        unit_sender: ingestor.unit_sender(),
    });

    // Log ingest progress when stability advances
    let mut updates = ingestor.subscribe();
    let update_logger = tokio::spawn(async move {
        let mut last_stable = 0;
        while let Ok(update) = updates.recv().await {
            if update.last_stable_mci > last_stable {
                tracing::info!(
                    "Last stable MCI {} ({} parked, tip {:?})",
                    update.last_stable_mci,
                    update.parked,
                    update.tip.map(|t| t.short())
                );
                last_stable = update.last_stable_mci;
            }
        }
    });

    let running = ingestor.running_flag();
    let ingest_handle = tokio::spawn(ingestor.run_async());

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let http_addr = config.rpc_addr.clone();
    let http_server = tokio::spawn(async move {
        let server = HttpRpcServer::new(rpc_context);
        let shutdown = async move {
            let _ = shutdown_rx.await;
        };
        if let Err(e) = server.run(&http_addr, shutdown).await {
            tracing::error!("HTTP RPC server error: {}", e);
        }
    });

    tracing::info!("DAG node running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down...");

    running.store(false, std::sync::atomic::Ordering::SeqCst);
    let _ = shutdown_tx.send(());
    if let Err(e) = ingest_handle.await {
        tracing::error!("Ingest loop panicked: {}", e);
    }
    if let Err(e) = http_server.await {
        tracing::error!("HTTP RPC server task failed: {}", e);
    }
    update_logger.abort();

    units.flush()?;
    store.flush()?;

    let stats = coordinator.stats();
    tracing::info!(
        "Node stopped: {} units, last stable MCI {}, {} stabilized this run ({} final-bad)",
        stats.units,
        stats.last_stable_mci,
        stability_log.stabilized.load(Ordering::Relaxed),
        stability_log.final_bad.load(Ordering::Relaxed)
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dag_consensus::{Address, MemoryStore, MemoryUnitStore, WitnessListRef};
    use dag_runtime::IngestConfig;
    use std::io::Write;

    fn ingestor() -> (Ingestor<MemoryUnitStore>, Arc<Coordinator>) {
        let units = Arc::new(MemoryUnitStore::new());
        let coordinator = Arc::new(
            Coordinator::builder(units.clone(), Arc::new(MemoryStore::new()))
                .open()
                .unwrap(),
        );
        (Ingestor::new(coordinator.clone(), units, IngestConfig::default()), coordinator)
    }

    #[test]
    fn test_import_jsonl() {
        let witnesses = (1..=12).map(|i| Address::new(format!("W{:02}", i))).collect();
        let genesis = Unit::new(vec![], vec!["W01".into()], WitnessListRef::Inline(witnesses), Sequence::Good, 0);
        let child = Unit::new(
            vec![genesis.id],
            vec!["W02".into()],
            WitnessListRef::SameAs(genesis.id),
            Sequence::Good,
            1,
        );

        let mut file = tempfile::NamedTempFile::new().unwrap();
        // Child first: it waits in the parking area until genesis is read
        writeln!(file, "{}", serde_json::to_string(&child).unwrap()).unwrap();
        writeln!(file).unwrap();
        writeln!(file, "{}", serde_json::to_string(&genesis).unwrap()).unwrap();

        let (mut ingestor, coordinator) = ingestor();
        assert_eq!(import_units(file.path(), &mut ingestor).unwrap(), 2);
        assert_eq!(coordinator.tip(), Some(child.id));
    }

    #[test]
    fn test_import_reports_bad_line() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{{ not json").unwrap();
        let (mut ingestor, _) = ingestor();
        let err = import_units(file.path(), &mut ingestor).unwrap_err();
        assert!(err.to_string().contains(":1:"));
    }
}
