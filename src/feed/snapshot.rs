// =============================================================================
// Snapshot Fetcher — rate-limited REST depth seeding with global backoff
// =============================================================================
//
// The depth snapshot endpoint is expensive (limit=1000 costs real request
// weight), so every fetch goes through two gates:
//
//   - a process-wide backoff armed by HTTP 429/418 (Retry-After honoured),
//     respected by every symbol with no exceptions;
//   - a per-symbol throttle: seeded (Live/Stale) symbols re-fetch at most
//     every max(min_interval, backoff); unseeded and resyncing symbols skip
//     the interval but still honour their error backoff.
//
// Fetches run as detached tasks; results return to the ingest task over a
// channel so book ownership never leaves that task.  Four consecutive
// failures for a symbol escalate it to STALE.
// =============================================================================

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::market_data::BookLifecycle;
use crate::types::DepthSnapshot;

/// REST request timeout.
const HTTP_TIMEOUT_SECS: u64 = 10;
/// Depth levels requested per snapshot.
const SNAPSHOT_DEPTH_LIMIT: u32 = 1000;
/// Consecutive failures that degrade the book to STALE.
const ESCALATE_AFTER_ERRORS: u32 = 4;
/// Fallback global backoff when a 429 carries no Retry-After.
const DEFAULT_RETRY_AFTER_SECS: u64 = 30;

/// Message sent back to the ingest task.
pub enum SnapshotOutcome {
    Fetched {
        symbol: String,
        snapshot: DepthSnapshot,
    },
    /// The symbol failed too many times in a row; degrade it.
    Escalate { symbol: String },
}

#[derive(Debug, Clone)]
struct FetchState {
    last_attempt: Option<Instant>,
    last_ok: Option<Instant>,
    backoff_ms: u64,
    consecutive_errors: u32,
    /// Single-flight: a fetch for this symbol is in the air.
    resyncing: bool,
}

/// Per-symbol health projection for the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct SymbolFetchHealth {
    pub backoff_ms: u64,
    pub consecutive_errors: u32,
    pub resyncing: bool,
    pub last_ok_age_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotFetcherHealth {
    pub global_backoff_remaining_ms: u64,
    pub symbols: BTreeMap<String, SymbolFetchHealth>,
}

/// Rate-limited REST depth fetcher shared by the ingest loop.
pub struct SnapshotFetcher {
    http: reqwest::Client,
    base_url: String,
    min_interval_ms: u64,
    backoff_min_ms: u64,
    backoff_max_ms: u64,
    states: Mutex<HashMap<String, FetchState>>,
    global_backoff_until: Mutex<Option<Instant>>,
    tx: mpsc::UnboundedSender<SnapshotOutcome>,
}

impl SnapshotFetcher {
    pub fn new(
        cfg: &EngineConfig,
        base_url: impl Into<String>,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<SnapshotOutcome>)> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()
            .context("failed to build snapshot HTTP client")?;
        let (tx, rx) = mpsc::unbounded_channel();
        Ok((
            Arc::new(Self {
                http,
                base_url: base_url.into(),
                min_interval_ms: cfg.snapshot_min_interval_ms,
                backoff_min_ms: cfg.snapshot_backoff_min_ms,
                backoff_max_ms: cfg.snapshot_backoff_max_ms,
                states: Mutex::new(HashMap::new()),
                global_backoff_until: Mutex::new(None),
                tx,
            }),
            rx,
        ))
    }

    /// Request a snapshot for `symbol` if the throttles allow it. Returns
    /// fast either way; the fetch itself runs detached.
    pub fn request(self: &Arc<Self>, symbol: &str, lifecycle: BookLifecycle) {
        if !self.admit(symbol, lifecycle, Instant::now()) {
            return;
        }
        let fetcher = self.clone();
        let symbol = symbol.to_string();
        tokio::spawn(async move {
            fetcher.fetch(symbol).await;
        });
    }

    /// True while a fetch for `symbol` is in flight.
    pub fn is_resyncing(&self, symbol: &str) -> bool {
        self.states
            .lock()
            .get(symbol)
            .map(|s| s.resyncing)
            .unwrap_or(false)
    }

    /// Throttle decision; on admit, marks the attempt and raises the
    /// single-flight flag.
    fn admit(&self, symbol: &str, lifecycle: BookLifecycle, now: Instant) -> bool {
        if let Some(until) = *self.global_backoff_until.lock() {
            if now < until {
                debug!(symbol, "snapshot blocked by global backoff");
                return false;
            }
        }

        let mut states = self.states.lock();
        let state = states.entry(symbol.to_string()).or_insert(FetchState {
            last_attempt: None,
            last_ok: None,
            backoff_ms: self.backoff_min_ms,
            consecutive_errors: 0,
            resyncing: false,
        });

        if state.resyncing {
            return false;
        }

        if let Some(last) = state.last_attempt {
            let elapsed = now.duration_since(last);
            let threshold = match lifecycle {
                // Seeded symbols re-fetch at most every
                // max(min_interval, backoff).
                BookLifecycle::Live | BookLifecycle::Stale => {
                    Duration::from_millis(self.min_interval_ms.max(state.backoff_ms))
                }
                // Unseeded/resyncing symbols skip the interval but honour
                // the error backoff.
                BookLifecycle::Unseeded | BookLifecycle::Resyncing => {
                    if state.consecutive_errors > 0 {
                        Duration::from_millis(state.backoff_ms)
                    } else {
                        Duration::ZERO
                    }
                }
            };
            if elapsed < threshold {
                return false;
            }
        }

        state.last_attempt = Some(now);
        state.resyncing = true;
        true
    }

    async fn fetch(self: Arc<Self>, symbol: String) {
        let url = format!(
            "{}/fapi/v1/depth?symbol={}&limit={}",
            self.base_url, symbol, SNAPSHOT_DEPTH_LIMIT
        );
        debug!(symbol = %symbol, "fetching depth snapshot");

        let result = self.fetch_once(&url).await;
        match result {
            Ok(FetchResult::Snapshot(snapshot)) => {
                self.on_success(&symbol);
                let _ = self.tx.send(SnapshotOutcome::Fetched { symbol, snapshot });
            }
            Ok(FetchResult::RateLimited { retry_after_secs }) => {
                self.on_rate_limit(&symbol, retry_after_secs);
            }
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "snapshot fetch failed");
                if self.on_failure(&symbol) {
                    let _ = self.tx.send(SnapshotOutcome::Escalate { symbol });
                }
            }
        }
    }

    async fn fetch_once(&self, url: &str) -> Result<FetchResult> {
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .context("depth snapshot request failed")?;

        let status = resp.status();
        if status.as_u16() == 429 || status.as_u16() == 418 {
            let retry_after_secs = resp
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(DEFAULT_RETRY_AFTER_SECS);
            return Ok(FetchResult::RateLimited { retry_after_secs });
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse depth snapshot response")?;

        if !status.is_success() {
            anyhow::bail!("depth snapshot returned {}: {}", status, body);
        }

        Ok(FetchResult::Snapshot(parse_snapshot(&body)?))
    }

    fn on_success(&self, symbol: &str) {
        let mut states = self.states.lock();
        if let Some(state) = states.get_mut(symbol) {
            state.backoff_ms = self.backoff_min_ms;
            state.consecutive_errors = 0;
            state.resyncing = false;
            state.last_ok = Some(Instant::now());
        }
        info!(symbol, "depth snapshot fetched");
    }

    /// Arm the process-wide backoff and double the symbol's own backoff.
    fn on_rate_limit(&self, symbol: &str, retry_after_secs: u64) {
        warn!(
            symbol,
            retry_after_secs, "snapshot rate limited — arming global backoff"
        );
        *self.global_backoff_until.lock() =
            Some(Instant::now() + Duration::from_secs(retry_after_secs));

        let mut states = self.states.lock();
        if let Some(state) = states.get_mut(symbol) {
            state.backoff_ms = (state.backoff_ms * 2).min(self.backoff_max_ms);
            state.resyncing = false;
        }
    }

    /// Record a failure; true when the symbol crossed the escalation bar.
    fn on_failure(&self, symbol: &str) -> bool {
        let mut states = self.states.lock();
        let Some(state) = states.get_mut(symbol) else {
            return false;
        };
        state.consecutive_errors += 1;
        state.backoff_ms = (state.backoff_ms * 2).min(self.backoff_max_ms);
        state.resyncing = false;
        state.consecutive_errors >= ESCALATE_AFTER_ERRORS
    }

    pub fn health(&self) -> SnapshotFetcherHealth {
        let now = Instant::now();
        let global_backoff_remaining_ms = self
            .global_backoff_until
            .lock()
            .map(|until| until.saturating_duration_since(now).as_millis() as u64)
            .unwrap_or(0);

        let symbols = self
            .states
            .lock()
            .iter()
            .map(|(symbol, s)| {
                (
                    symbol.clone(),
                    SymbolFetchHealth {
                        backoff_ms: s.backoff_ms,
                        consecutive_errors: s.consecutive_errors,
                        resyncing: s.resyncing,
                        last_ok_age_ms: s
                            .last_ok
                            .map(|t| now.duration_since(t).as_millis() as u64),
                    },
                )
            })
            .collect();

        SnapshotFetcherHealth {
            global_backoff_remaining_ms,
            symbols,
        }
    }
}

enum FetchResult {
    Snapshot(DepthSnapshot),
    RateLimited { retry_after_secs: u64 },
}

/// Parse the venue's snapshot shape:
/// `{"lastUpdateId": n, "bids": [["p","q"],...], "asks": [...]}`.
fn parse_snapshot(body: &serde_json::Value) -> Result<DepthSnapshot> {
    let last_update_id = body["lastUpdateId"]
        .as_u64()
        .context("snapshot missing lastUpdateId")?;

    let parse_side = |key: &str| -> Result<Vec<(Decimal, f64)>> {
        let levels = body[key]
            .as_array()
            .with_context(|| format!("snapshot missing {key}"))?;
        let mut out = Vec::with_capacity(levels.len());
        for level in levels {
            let price: Decimal = level
                .get(0)
                .and_then(|v| v.as_str())
                .context("level missing price")?
                .parse()
                .context("failed to parse level price")?;
            let size: f64 = level
                .get(1)
                .and_then(|v| v.as_str())
                .context("level missing size")?
                .parse()
                .context("failed to parse level size")?;
            out.push((price, size));
        }
        Ok(out)
    };

    Ok(DepthSnapshot {
        last_update_id,
        bids: parse_side("bids")?,
        asks: parse_side("asks")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fetcher() -> Arc<SnapshotFetcher> {
        let cfg = EngineConfig::default();
        let (fetcher, _rx) = SnapshotFetcher::new(&cfg, "http://127.0.0.1:0").unwrap();
        fetcher
    }

    #[tokio::test]
    async fn unseeded_bypasses_interval_but_single_flights() {
        let f = fetcher();
        let now = Instant::now();
        assert!(f.admit("BTCUSDT", BookLifecycle::Unseeded, now));
        // In flight: second request refused.
        assert!(!f.admit("BTCUSDT", BookLifecycle::Unseeded, now));
        assert!(f.is_resyncing("BTCUSDT"));

        // After completion an unseeded symbol may retry immediately when it
        // has no error history.
        f.on_success("BTCUSDT");
        assert!(f.admit("BTCUSDT", BookLifecycle::Unseeded, now + Duration::from_millis(1)));
    }

    #[tokio::test]
    async fn live_symbols_respect_min_interval() {
        let f = fetcher();
        let now = Instant::now();
        assert!(f.admit("BTCUSDT", BookLifecycle::Live, now));
        f.on_success("BTCUSDT");
        // 60 s minimum interval for seeded symbols.
        assert!(!f.admit("BTCUSDT", BookLifecycle::Live, now + Duration::from_secs(30)));
        assert!(f.admit("BTCUSDT", BookLifecycle::Live, now + Duration::from_secs(61)));
    }

    #[tokio::test]
    async fn global_backoff_blocks_everyone_including_unseeded() {
        let f = fetcher();
        let now = Instant::now();
        assert!(f.admit("BTCUSDT", BookLifecycle::Unseeded, now));
        f.on_rate_limit("BTCUSDT", 30);
        assert!(!f.admit("BTCUSDT", BookLifecycle::Unseeded, Instant::now()));
        assert!(!f.admit("ETHUSDT", BookLifecycle::Live, Instant::now()));
    }

    #[tokio::test]
    async fn rate_limit_doubles_backoff_capped() {
        let f = fetcher();
        let now = Instant::now();
        assert!(f.admit("BTCUSDT", BookLifecycle::Unseeded, now));
        f.on_rate_limit("BTCUSDT", 1);
        {
            let states = f.states.lock();
            assert_eq!(states["BTCUSDT"].backoff_ms, 10_000);
        }
        for _ in 0..10 {
            f.on_rate_limit("BTCUSDT", 1);
        }
        let states = f.states.lock();
        assert_eq!(states["BTCUSDT"].backoff_ms, 120_000);
    }

    #[tokio::test]
    async fn four_consecutive_failures_escalate() {
        let f = fetcher();
        let now = Instant::now();
        assert!(f.admit("BTCUSDT", BookLifecycle::Unseeded, now));
        assert!(!f.on_failure("BTCUSDT"));
        assert!(!f.on_failure("BTCUSDT"));
        assert!(!f.on_failure("BTCUSDT"));
        assert!(f.on_failure("BTCUSDT"));
        // Errors also arm the per-symbol backoff.
        let backoff = f.states.lock()["BTCUSDT"].backoff_ms;
        assert!(backoff > 5_000);
    }

    #[tokio::test]
    async fn success_resets_backoff_and_errors() {
        let f = fetcher();
        let now = Instant::now();
        assert!(f.admit("BTCUSDT", BookLifecycle::Unseeded, now));
        f.on_failure("BTCUSDT");
        f.on_failure("BTCUSDT");
        f.on_success("BTCUSDT");
        let states = f.states.lock();
        assert_eq!(states["BTCUSDT"].backoff_ms, 5_000);
        assert_eq!(states["BTCUSDT"].consecutive_errors, 0);
        assert!(!states["BTCUSDT"].resyncing);
    }

    #[test]
    fn snapshot_parsing() {
        let body = serde_json::json!({
            "lastUpdateId": 100,
            "bids": [["10.00", "1.5"], ["9.50", "0.0"]],
            "asks": [["11.00", "2.0"]],
        });
        let snap = parse_snapshot(&body).unwrap();
        assert_eq!(snap.last_update_id, 100);
        assert_eq!(snap.bids.len(), 2);
        assert!((snap.bids[0].1 - 1.5).abs() < f64::EPSILON);
        assert_eq!(snap.asks.len(), 1);
    }

    #[test]
    fn snapshot_parse_rejects_missing_fields() {
        let body = serde_json::json!({"bids": [], "asks": []});
        assert!(parse_snapshot(&body).is_err());
    }
}
