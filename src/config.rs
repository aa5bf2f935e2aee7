// =============================================================================
// Engine Configuration — frozen settings with atomic save
// =============================================================================
//
// Every tunable lives here and is loaded once at startup; the struct is
// frozen afterwards.  The only runtime-mutable knobs are `capital` and the
// execution symbol set, both owned by the orchestrator behind its own locks.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.  All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::gate::GateConfig;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbols() -> Vec<String> {
    vec![
        "BTCUSDT".to_string(),
        "ETHUSDT".to_string(),
        "SOLUSDT".to_string(),
    ]
}

fn default_initial_margin_usdt() -> f64 {
    50.0
}

fn default_max_leverage() -> f64 {
    10.0
}

fn default_cooldown_min_ms() -> i64 {
    2_000
}

fn default_cooldown_max_ms() -> i64 {
    30_000
}

fn default_logger_queue_limit() -> usize {
    5_000
}

fn default_logger_drop_halt_threshold() -> u64 {
    200
}

fn default_logs_dir() -> String {
    "logs".to_string()
}

fn default_snapshot_min_interval_ms() -> u64 {
    60_000
}

fn default_snapshot_backoff_min_ms() -> u64 {
    5_000
}

fn default_snapshot_backoff_max_ms() -> u64 {
    120_000
}

fn default_max_gap_tolerance() -> u64 {
    100
}

fn default_broadcast_throttle_ms() -> u64 {
    250
}

fn default_trade_window_ms() -> i64 {
    60_000
}

fn default_cvd_timeframes_s() -> Vec<u64> {
    vec![60, 300, 900]
}

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

// =============================================================================
// CapitalSettings
// =============================================================================

/// Sizing inputs for probe entries and adds. Runtime-mutable (guarded by the
/// orchestrator); everything else in [`EngineConfig`] is frozen.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapitalSettings {
    /// Margin committed per probe, in quote currency.
    #[serde(default = "default_initial_margin_usdt")]
    pub initial_margin_usdt: f64,

    /// Sizing ceiling: probe notional = margin x leverage.
    #[serde(default = "default_max_leverage")]
    pub max_leverage: f64,
}

impl Default for CapitalSettings {
    fn default() -> Self {
        Self {
            initial_margin_usdt: default_initial_margin_usdt(),
            max_leverage: default_max_leverage(),
        }
    }
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Top-level configuration for the Orion engine.
///
/// Every field has a serde default so that older JSON files missing new
/// fields will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Symbols the feed ingestor always tracks (clients may add more).
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Data-quality gate thresholds and mode.
    #[serde(default)]
    pub gate: GateConfig,

    /// Probe/add sizing inputs.
    #[serde(default)]
    pub capital: CapitalSettings,

    /// Lower clamp for the post-exit entry cooldown.
    #[serde(default = "default_cooldown_min_ms")]
    pub cooldown_min_ms: i64,

    /// Upper clamp for the post-exit entry cooldown.
    #[serde(default = "default_cooldown_max_ms")]
    pub cooldown_max_ms: i64,

    /// Bounded queue capacity of the JSONL logger.
    #[serde(default = "default_logger_queue_limit")]
    pub logger_queue_limit: usize,

    /// Dropped-line count within one 10 s window that halts all actors.
    #[serde(default = "default_logger_drop_halt_threshold")]
    pub logger_drop_halt_threshold: u64,

    /// Root directory for JSONL logs (`<logs_dir>/orchestrator/...`).
    #[serde(default = "default_logs_dir")]
    pub logs_dir: String,

    /// Minimum interval between depth snapshot attempts for a seeded symbol.
    #[serde(default = "default_snapshot_min_interval_ms")]
    pub snapshot_min_interval_ms: u64,

    /// Lower bound of the snapshot retry backoff.
    #[serde(default = "default_snapshot_backoff_min_ms")]
    pub snapshot_backoff_min_ms: u64,

    /// Upper bound of the snapshot retry backoff.
    #[serde(default = "default_snapshot_backoff_max_ms")]
    pub snapshot_backoff_max_ms: u64,

    /// Largest forward sequence gap a diff may have and still be applied.
    #[serde(default = "default_max_gap_tolerance")]
    pub max_gap_tolerance: u64,

    /// Minimum spacing between metric broadcasts for one symbol.
    #[serde(default = "default_broadcast_throttle_ms")]
    pub broadcast_throttle_ms: u64,

    /// Rolling trade-tape window (exchange event time).
    #[serde(default = "default_trade_window_ms")]
    pub trade_window_ms: i64,

    /// CVD aggregation horizons in seconds.
    #[serde(default = "default_cvd_timeframes_s")]
    pub cvd_timeframes_s: Vec<u64>,

    /// Master switch: when false, decisions are recorded but no order ever
    /// reaches the venue.
    #[serde(default)]
    pub execution_enabled: bool,

    /// HTTP/WS bind address for the fan-out server.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            gate: GateConfig::default(),
            capital: CapitalSettings::default(),
            cooldown_min_ms: default_cooldown_min_ms(),
            cooldown_max_ms: default_cooldown_max_ms(),
            logger_queue_limit: default_logger_queue_limit(),
            logger_drop_halt_threshold: default_logger_drop_halt_threshold(),
            logs_dir: default_logs_dir(),
            snapshot_min_interval_ms: default_snapshot_min_interval_ms(),
            snapshot_backoff_min_ms: default_snapshot_backoff_min_ms(),
            snapshot_backoff_max_ms: default_snapshot_backoff_max_ms(),
            max_gap_tolerance: default_max_gap_tolerance(),
            broadcast_throttle_ms: default_broadcast_throttle_ms(),
            trade_window_ms: default_trade_window_ms(),
            cvd_timeframes_s: default_cvd_timeframes_s(),
            execution_enabled: false,
            bind_addr: default_bind_addr(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse engine config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            gate_mode = ?config.gate.mode,
            "engine config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise engine config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "engine config saved (atomic)");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::GateMode;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.symbols[0], "BTCUSDT");
        assert_eq!(cfg.max_gap_tolerance, 100);
        assert_eq!(cfg.broadcast_throttle_ms, 250);
        assert_eq!(cfg.trade_window_ms, 60_000);
        assert_eq!(cfg.cvd_timeframes_s, vec![60, 300, 900]);
        assert_eq!(cfg.logger_queue_limit, 5_000);
        assert_eq!(cfg.logger_drop_halt_threshold, 200);
        assert_eq!(cfg.snapshot_backoff_min_ms, 5_000);
        assert_eq!(cfg.snapshot_backoff_max_ms, 120_000);
        assert!(!cfg.execution_enabled);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.snapshot_min_interval_ms, 60_000);
        assert_eq!(cfg.gate.mode, GateMode::V1NoLatency);
        assert!((cfg.capital.max_leverage - 10.0).abs() < f64::EPSILON);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "symbols": ["ETHUSDT"], "gate": { "mode": "V2" } }"#;
        let cfg: EngineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.symbols, vec!["ETHUSDT"]);
        assert_eq!(cfg.gate.mode, GateMode::V2NetworkLatency);
        assert_eq!(cfg.cooldown_max_ms, 30_000);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = EngineConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.symbols, cfg2.symbols);
        assert_eq!(cfg.max_gap_tolerance, cfg2.max_gap_tolerance);
        assert_eq!(cfg.logger_queue_limit, cfg2.logger_queue_limit);
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine_config.json");
        let mut cfg = EngineConfig::default();
        cfg.symbols = vec!["BNBUSDT".into()];
        cfg.save(&path).unwrap();
        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded.symbols, vec!["BNBUSDT"]);
    }
}
