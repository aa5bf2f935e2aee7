// =============================================================================
// Orion Orderflow Engine — Main Entry Point
// =============================================================================
//
// Live mode wires the full pipeline: feed ingestor -> per-symbol metrics ->
// broadcast gate -> orchestrator -> symbol actors -> execution connector,
// with JSONL logging throughout.  Execution starts disabled unless the
// config explicitly enables it.
//
// `orion-flow replay <dir>` re-runs logged metrics/execution JSONL files
// through the same orchestrator and prints the deterministic result hashes.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod actor;
mod api;
mod broadcast;
mod config;
mod connector;
mod decision;
mod feed;
mod gate;
mod logger;
mod market_data;
mod orchestrator;
mod replay;
mod types;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::ApiState;
use crate::broadcast::{BroadcastGate, WsHub};
use crate::config::EngineConfig;
use crate::connector::binance::BinanceFuturesConnector;
use crate::connector::{ExecutionConnector, NullConnector};
use crate::feed::ingestor::SharedBookHealth;
use crate::feed::{FeedIngestor, SnapshotFetcher};
use crate::logger::OrchestratorLogger;
use crate::orchestrator::Orchestrator;
use crate::replay::ReplayRunner;

const REST_BASE_URL: &str = "https://fapi.binance.com";
const WS_BASE_URL: &str = "wss://fstream.binance.com";

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║          Orion Orderflow Engine — Starting Up            ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = EngineConfig::load("engine_config.json").unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        EngineConfig::default()
    });

    // Override symbols from env if available.
    if let Ok(syms) = std::env::var("ORION_SYMBOLS") {
        config.symbols = syms
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
    }

    let args: Vec<String> = std::env::args().collect();
    if args.get(1).map(|s| s.as_str()) == Some("replay") {
        let dir = args
            .get(2)
            .map(PathBuf::from)
            .unwrap_or_else(|| Path::new(&config.logs_dir).join("orchestrator"));
        return run_replay(config, &dir).await;
    }

    run_live(config).await
}

// =============================================================================
// Live mode
// =============================================================================

async fn run_live(config: EngineConfig) -> Result<()> {
    info!(symbols = ?config.symbols, gate_mode = ?config.gate.mode, "Configured symbols");
    let cfg = Arc::new(config);

    // ── 1. Logger with drop-spike halt channel ───────────────────────────
    let (halt_tx, mut halt_rx) = tokio::sync::mpsc::unbounded_channel::<u64>();
    let log_dir = Path::new(&cfg.logs_dir).join("orchestrator");
    let logger = OrchestratorLogger::new(
        log_dir,
        cfg.logger_queue_limit,
        cfg.logger_drop_halt_threshold,
        Arc::new(move |dropped| {
            let _ = halt_tx.send(dropped);
        }),
    )?;

    // ── 2. Execution connector ───────────────────────────────────────────
    let api_key = std::env::var("BINANCE_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("BINANCE_API_SECRET").unwrap_or_default();
    let connector = BinanceFuturesConnector::new(api_key, api_secret);
    connector.start(&cfg.symbols);

    // ── 3. Orchestrator + actors ─────────────────────────────────────────
    let orchestrator = Orchestrator::new(cfg.clone(), connector.clone(), logger.clone());

    // Drop-spike halts.
    {
        let orch = orchestrator.clone();
        tokio::spawn(async move {
            while let Some(dropped) = halt_rx.recv().await {
                orch.halt_all(&format!("logger_drop_spike:{dropped}"));
            }
        });
    }

    // Connector push events.
    if let Some(mut events) = connector.take_event_stream() {
        let orch = orchestrator.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                orch.ingest_execution(event);
            }
        });
    }

    // ── 4. Market data pipeline ──────────────────────────────────────────
    let (hub, required_rx) = WsHub::new(&cfg.symbols);
    let (fetcher, snapshot_rx) = SnapshotFetcher::new(&cfg, REST_BASE_URL)?;

    let (oi_tx, oi_rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(feed::open_interest::run_open_interest_poller(
        REST_BASE_URL.to_string(),
        required_rx.clone(),
        oi_tx,
    ));

    let book_health: SharedBookHealth = Arc::default();
    let broadcast_gate = BroadcastGate::new(
        cfg.broadcast_throttle_ms,
        hub.clone(),
        orchestrator.clone(),
    );
    let ingestor = FeedIngestor::new(
        cfg.clone(),
        WS_BASE_URL,
        fetcher.clone(),
        snapshot_rx,
        required_rx,
        oi_rx,
        broadcast_gate,
        book_health.clone(),
    );
    tokio::spawn(ingestor.run());
    info!(count = cfg.symbols.len(), "Market data pipeline launched");

    // ── 5. API server (health + WebSocket fan-out) ───────────────────────
    let api_state = Arc::new(ApiState {
        orchestrator: orchestrator.clone(),
        hub,
        fetcher,
        logger: logger.clone(),
        book_health,
        start_time: std::time::Instant::now(),
    });
    let bind_addr = std::env::var("ORION_BIND_ADDR").unwrap_or_else(|_| cfg.bind_addr.clone());
    tokio::spawn(async move {
        let app = api::router(api_state);
        let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
            Ok(l) => l,
            Err(e) => {
                error!(addr = %bind_addr, error = %e, "Failed to bind API server");
                return;
            }
        };
        info!(addr = %bind_addr, "API server listening");
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server failed");
        }
    });

    info!(
        execution_enabled = orchestrator.core().execution_enabled(),
        "All subsystems running. Press Ctrl+C to stop."
    );

    // ── 6. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    orchestrator.flush().await;
    logger.shutdown().await;

    info!("Orion Orderflow Engine shut down complete.");
    Ok(())
}

// =============================================================================
// Replay mode
// =============================================================================

async fn run_replay(config: EngineConfig, dir: &Path) -> Result<()> {
    info!(dir = %dir.display(), "Replay mode");
    let cfg = Arc::new(config);

    let (metrics_files, execution_files) = discover_replay_files(dir)?;
    if metrics_files.is_empty() && execution_files.is_empty() {
        anyhow::bail!("no metrics_*.jsonl or execution_*.jsonl files in {}", dir.display());
    }

    // Replay writes nothing and talks to no venue.
    let scratch = std::env::temp_dir().join(format!("orion-replay-{}", std::process::id()));
    let logger = OrchestratorLogger::new(
        scratch,
        cfg.logger_queue_limit,
        cfg.logger_drop_halt_threshold,
        Arc::new(|_| {}),
    )?;
    let orchestrator = Orchestrator::new(cfg, Arc::new(NullConnector::new()), logger.clone());

    let runner = ReplayRunner::new(orchestrator);
    let report = runner.run(&metrics_files, &execution_files).await?;
    logger.shutdown().await;

    println!("metrics_lines:    {}", report.metrics_lines);
    println!("execution_lines:  {}", report.execution_lines);
    println!("decisions:        {}", report.decisions);
    println!("decision_hash:    {}", report.decision_hash);
    println!("final_state_hash: {}", report.final_state_hash);
    Ok(())
}

/// Collect `metrics_*.jsonl` and `execution_*.jsonl` files, sorted by name
/// so multi-day logs replay in date order.
fn discover_replay_files(dir: &Path) -> Result<(Vec<PathBuf>, Vec<PathBuf>)> {
    let mut metrics = Vec::new();
    let mut execution = Vec::new();

    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("failed to read replay directory {}", dir.display()))?;
    for entry in entries {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !name.ends_with(".jsonl") {
            continue;
        }
        if name.starts_with("metrics_") {
            metrics.push(path);
        } else if name.starts_with("execution_") {
            execution.push(path);
        }
    }
    metrics.sort();
    execution.sort();
    Ok((metrics, execution))
}
