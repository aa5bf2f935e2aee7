// =============================================================================
// Replay Runner — deterministic re-run of logged metrics + execution streams
// =============================================================================
//
// Reads the metrics and execution JSONL files, merges every line by event
// time (stable, so same-timestamp lines keep file order), feeds them through
// the orchestrator exactly as the live path would, waits for all actors to
// drain, and hashes the outcome:
//
//   decision_hash    — SHA-256 over the canonically-serialized ledger
//   final_state_hash — SHA-256 over the per-symbol state snapshots
//
// Metrics lines that already carry a gate verdict are routed through
// `ingest_logged_metrics` (no re-gate, no re-log); lines without one re-run
// the gate.  Given the same files and config, both hashes are identical on
// every run.
// =============================================================================

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::gate::GateResult;
use crate::orchestrator::Orchestrator;
use crate::types::{ExecutionEvent, MetricsEnvelope};

/// Outcome of one replay run.
#[derive(Debug, Clone)]
pub struct ReplayReport {
    pub decision_hash: String,
    pub final_state_hash: String,
    pub metrics_lines: usize,
    pub execution_lines: usize,
    pub decisions: usize,
}

enum ReplayEntry {
    Metrics(Value),
    Execution(Value),
}

/// Replays logged streams through an orchestrator.
pub struct ReplayRunner {
    orchestrator: Arc<Orchestrator>,
}

impl ReplayRunner {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }

    pub async fn run(
        &self,
        metrics_files: &[PathBuf],
        execution_files: &[PathBuf],
    ) -> Result<ReplayReport> {
        let mut entries: Vec<(i64, ReplayEntry)> = Vec::new();
        let mut metrics_lines = 0usize;
        let mut execution_lines = 0usize;

        for path in metrics_files {
            for line in read_jsonl(path)? {
                let at = line["canonical_time_ms"]
                    .as_i64()
                    .or_else(|| line["exchange_event_time_ms"].as_i64())
                    .unwrap_or(0);
                entries.push((at, ReplayEntry::Metrics(line)));
                metrics_lines += 1;
            }
        }

        for path in execution_files {
            for line in read_jsonl(path)? {
                let at = line["event_time_ms"]
                    .as_i64()
                    .or_else(|| line["event"]["event_time_ms"].as_i64())
                    .unwrap_or(0);
                entries.push((at, ReplayEntry::Execution(line)));
                execution_lines += 1;
            }
        }

        // Stable: same-timestamp entries keep their file order.
        entries.sort_by_key(|(at, _)| *at);

        info!(
            metrics_lines,
            execution_lines, "replay input merged — starting"
        );

        let core = self.orchestrator.core();
        self.orchestrator.reset_for_replay();
        core.set_logging_enabled(false);

        for (_, entry) in entries {
            match entry {
                ReplayEntry::Metrics(line) => self.route_metrics(line),
                ReplayEntry::Execution(line) => self.route_execution(line),
            }
        }

        self.orchestrator.flush().await;

        let ledger = core.ledger_snapshot();
        let decisions = ledger.len();
        let decision_hash = sha256_hex(&canonical_json(
            &serde_json::to_value(&ledger).context("failed to serialise ledger")?,
        ));

        let states = self.orchestrator.state_snapshots().await;
        let final_state_hash = sha256_hex(&canonical_json(
            &serde_json::to_value(&states).context("failed to serialise state snapshots")?,
        ));

        core.set_logging_enabled(true);

        info!(decisions, %decision_hash, %final_state_hash, "replay complete");

        Ok(ReplayReport {
            decision_hash,
            final_state_hash,
            metrics_lines,
            execution_lines,
            decisions,
        })
    }

    fn route_metrics(&self, line: Value) {
        let has_gate = line.get("gate").map(|g| !g.is_null()).unwrap_or(false);
        let metrics = if line.get("metrics").is_some() {
            line["metrics"].clone()
        } else {
            line.clone()
        };

        let envelope: MetricsEnvelope = match serde_json::from_value(metrics) {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "skipping unparseable metrics line");
                return;
            }
        };

        if has_gate {
            let gate: GateResult = match serde_json::from_value(line["gate"].clone()) {
                Ok(g) => g,
                Err(e) => {
                    warn!(error = %e, "skipping metrics line with unparseable gate");
                    return;
                }
            };
            self.orchestrator.ingest_logged_metrics(envelope, gate);
        } else {
            // No logged verdict: re-run the gate.
            self.orchestrator.ingest(envelope);
        }
    }

    fn route_execution(&self, line: Value) {
        let raw = if line.get("event").is_some() {
            line["event"].clone()
        } else {
            line
        };
        match serde_json::from_value::<ExecutionEvent>(raw) {
            Ok(event) => self.orchestrator.ingest_execution_replay(event),
            Err(e) => warn!(error = %e, "skipping unparseable execution line"),
        }
    }
}

fn read_jsonl(path: &Path) -> Result<Vec<Value>> {
    let file = File::open(path)
        .with_context(|| format!("failed to open replay file {}", path.display()))?;
    let mut out = Vec::new();
    for (i, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("failed to read {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let value: Value = serde_json::from_str(&line)
            .with_context(|| format!("bad JSON at {}:{}", path.display(), i + 1))?;
        out.push(value);
    }
    Ok(out)
}

/// Serialize with every object's keys sorted, recursively, so semantically
/// equal values always hash identically.
pub fn canonical_json(value: &Value) -> String {
    fn canonicalize(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut sorted: Vec<(&String, &Value)> = map.iter().collect();
                sorted.sort_by_key(|(k, _)| k.as_str());
                let mut out = serde_json::Map::with_capacity(sorted.len());
                for (k, v) in sorted {
                    out.insert(k.clone(), canonicalize(v));
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
            other => other.clone(),
        }
    }
    canonicalize(value).to_string()
}

pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}
