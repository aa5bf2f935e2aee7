// =============================================================================
// Orchestrator Logger — bounded-queue JSONL writer with drop-spike halt
// =============================================================================
//
// Three logical streams (metrics, execution, decision) share one bounded
// in-memory queue drained by a single flusher task that owns every file
// handle.  Producers never block: an enqueue against a full queue drops the
// line and bumps two counters.  A 10 s monitor turns a drop spike into a
// halt signal — the orchestrator uses it to SYSTEM_HALT every symbol,
// because decisions made while their audit trail is being discarded are
// decisions nobody can reconstruct.
//
// Files rotate on the UTC date of the line's event time (not wall clock), so
// replayed or backfilled events land in the file their timestamp names.
// =============================================================================

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Interval of the drop-spike monitor.
const DROP_CHECK_INTERVAL_SECS: u64 = 10;

/// Logical output stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogKind {
    Metrics,
    Execution,
    Decision,
}

impl LogKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Metrics => "metrics",
            Self::Execution => "execution",
            Self::Decision => "decision",
        }
    }
}

/// One queued line.
struct LogItem {
    kind: LogKind,
    event_time_ms: i64,
    value: serde_json::Value,
}

/// Callback invoked with the window's drop count when the spike threshold is
/// crossed.
pub type DropSpikeCallback = Arc<dyn Fn(u64) + Send + Sync>;

/// Bounded-queue JSONL writer.
pub struct OrchestratorLogger {
    dir: PathBuf,
    tx: Mutex<Option<mpsc::Sender<LogItem>>>,
    drop_total: AtomicU64,
    drop_window: AtomicU64,
    drop_halt_threshold: u64,
    on_drop_spike: DropSpikeCallback,
    flusher: Mutex<Option<JoinHandle<()>>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl OrchestratorLogger {
    /// Create the logger and spawn its flusher and drop-spike monitor.
    pub fn new(
        dir: impl Into<PathBuf>,
        queue_limit: usize,
        drop_halt_threshold: u64,
        on_drop_spike: DropSpikeCallback,
    ) -> Result<Arc<Self>> {
        let (logger, rx) = Self::build(dir, queue_limit, drop_halt_threshold, on_drop_spike)?;

        let flusher = tokio::spawn(run_flusher(logger.dir.clone(), rx));
        *logger.flusher.lock() = Some(flusher);

        let monitor_logger = logger.clone();
        let monitor = tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(
                DROP_CHECK_INTERVAL_SECS,
            ));
            interval.tick().await; // first tick fires immediately
            loop {
                interval.tick().await;
                monitor_logger.check_drop_window();
            }
        });
        *logger.monitor.lock() = Some(monitor);

        Ok(logger)
    }

    /// Construct without spawning background tasks. The caller owns the
    /// receiver; used directly by tests.
    fn build(
        dir: impl Into<PathBuf>,
        queue_limit: usize,
        drop_halt_threshold: u64,
        on_drop_spike: DropSpikeCallback,
    ) -> Result<(Arc<Self>, mpsc::Receiver<LogItem>)> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create log directory {}", dir.display()))?;

        let (tx, rx) = mpsc::channel(queue_limit.max(1));
        let logger = Arc::new(Self {
            dir,
            tx: Mutex::new(Some(tx)),
            drop_total: AtomicU64::new(0),
            drop_window: AtomicU64::new(0),
            drop_halt_threshold,
            on_drop_spike,
            flusher: Mutex::new(None),
            monitor: Mutex::new(None),
        });
        Ok((logger, rx))
    }

    /// Enqueue one line. Never blocks: on a full queue the line is dropped
    /// and the drop counters are incremented.
    pub fn enqueue(&self, kind: LogKind, event_time_ms: i64, value: serde_json::Value) {
        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            // Logger already shut down.
            self.record_drop();
            return;
        };
        let item = LogItem {
            kind,
            event_time_ms,
            value,
        };
        if tx.try_send(item).is_err() {
            self.record_drop();
        }
    }

    fn record_drop(&self) {
        self.drop_total.fetch_add(1, Ordering::Relaxed);
        self.drop_window.fetch_add(1, Ordering::Relaxed);
    }

    /// Evaluate the drop window and fire the spike callback if the threshold
    /// was crossed. Resets the window either way. Called by the 10 s monitor.
    pub fn check_drop_window(&self) {
        let window = self.drop_window.swap(0, Ordering::Relaxed);
        if window >= self.drop_halt_threshold {
            warn!(
                dropped = window,
                threshold = self.drop_halt_threshold,
                "logger drop spike — signalling halt"
            );
            (self.on_drop_spike)(window);
        }
    }

    pub fn drop_total(&self) -> u64 {
        self.drop_total.load(Ordering::Relaxed)
    }

    pub fn drop_window(&self) -> u64 {
        self.drop_window.load(Ordering::Relaxed)
    }

    /// Stop accepting lines, drain the queue, and close all file handles.
    pub async fn shutdown(&self) {
        let monitor = self.monitor.lock().take();
        if let Some(m) = monitor {
            m.abort();
        }

        // Dropping the sender ends the flusher's recv loop after the queue
        // drains.
        let tx = self.tx.lock().take();
        drop(tx);

        let flusher = self.flusher.lock().take();
        if let Some(f) = flusher {
            let _ = f.await;
        }
        info!("logger shut down");
    }
}

/// Drain the queue into per-(kind, date) JSONL files.
async fn run_flusher(dir: PathBuf, mut rx: mpsc::Receiver<LogItem>) {
    let mut writers: HashMap<LogKind, (String, BufWriter<File>)> = HashMap::new();

    while let Some(item) = rx.recv().await {
        if let Err(e) = write_line(&dir, &mut writers, &item) {
            error!(kind = item.kind.as_str(), error = %e, "failed to write log line");
        }
    }

    for (_, (_, mut w)) in writers.drain() {
        let _ = w.flush();
    }
}

/// UTC date string (YYYYMMDD) of an event timestamp.
fn file_date(event_time_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(event_time_ms)
        .map(|dt| dt.format("%Y%m%d").to_string())
        .unwrap_or_else(|| "00000000".to_string())
}

fn write_line(
    dir: &PathBuf,
    writers: &mut HashMap<LogKind, (String, BufWriter<File>)>,
    item: &LogItem,
) -> Result<()> {
    let date = file_date(item.event_time_ms);

    // Rotate: one open handle per kind, keyed by the event-time date.
    let needs_open = match writers.get(&item.kind) {
        Some((open_date, _)) => *open_date != date,
        None => true,
    };
    if needs_open {
        if let Some((_, mut old)) = writers.remove(&item.kind) {
            let _ = old.flush();
        }
        let path = dir.join(format!("{}_{}.jsonl", item.kind.as_str(), date));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        writers.insert(item.kind, (date.clone(), BufWriter::new(file)));
    }

    let (_, writer) = writers.get_mut(&item.kind).expect("writer just inserted");
    serde_json::to_writer(&mut *writer, &item.value).context("failed to serialise log line")?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(())
}
