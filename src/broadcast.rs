// =============================================================================
// Broadcast Gate + WebSocket Hub — throttled per-symbol metric fan-out
// =============================================================================
//
// Every trade and every applied depth diff asks the gate to broadcast.  The
// gate enforces a per-symbol minimum spacing (default 250 ms), builds the
// MetricsEnvelope plus the full client payload (top-20 levels, tape, CVD,
// absorption), and fans out to (a) WebSocket subscribers through the hub and
// (b) the orchestrator's ingest path.
//
// The hub also tracks which symbols clients currently require; the feed
// ingestor watches that set and reconciles its exchange subscription when it
// changes.
// =============================================================================

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tracing::debug;

use crate::market_data::{AbsorptionState, BookLifecycle, CvdFrameSummary, SymbolMarket, TapeSummary};
use crate::orchestrator::Orchestrator;
use crate::types::{now_ms, FlowSnapshot, MetricsEnvelope};

/// Book depth included in each payload.
const PAYLOAD_DEPTH_LEVELS: usize = 20;
/// Per-symbol fan-out channel capacity; slow clients skip, never block.
const CHANNEL_CAPACITY: usize = 64;

/// What triggered a broadcast attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastReason {
    Trade,
    Depth,
}

// =============================================================================
// WsHub
// =============================================================================

/// Per-symbol fan-out channels plus the client-required symbol registry.
pub struct WsHub {
    channels: RwLock<HashMap<String, broadcast::Sender<String>>>,
    client_counts: Mutex<HashMap<String, usize>>,
    base: Mutex<BTreeSet<String>>,
    required_tx: watch::Sender<BTreeSet<String>>,
}

impl WsHub {
    /// `base_symbols` are always required regardless of connected clients.
    pub fn new(base_symbols: &[String]) -> (Arc<Self>, watch::Receiver<BTreeSet<String>>) {
        let base: BTreeSet<String> = base_symbols.iter().cloned().collect();
        let (required_tx, required_rx) = watch::channel(base.clone());
        (
            Arc::new(Self {
                channels: RwLock::new(HashMap::new()),
                client_counts: Mutex::new(HashMap::new()),
                base: Mutex::new(base),
                required_tx,
            }),
            required_rx,
        )
    }

    /// Replace the always-required base set (engine + execution symbols).
    pub fn set_base(&self, symbols: &[String]) {
        *self.base.lock() = symbols.iter().cloned().collect();
        self.recompute_required();
    }

    /// Register a client for `symbols` and hand back one receiver each.
    pub fn subscribe(&self, symbols: &[String]) -> Vec<(String, broadcast::Receiver<String>)> {
        let mut receivers = Vec::with_capacity(symbols.len());
        {
            let mut channels = self.channels.write();
            let mut counts = self.client_counts.lock();
            for symbol in symbols {
                let tx = channels
                    .entry(symbol.clone())
                    .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
                receivers.push((symbol.clone(), tx.subscribe()));
                *counts.entry(symbol.clone()).or_default() += 1;
            }
        }
        self.recompute_required();
        receivers
    }

    /// Drop a client registration previously made with [`subscribe`].
    pub fn unsubscribe(&self, symbols: &[String]) {
        {
            let mut counts = self.client_counts.lock();
            for symbol in symbols {
                if let Some(count) = counts.get_mut(symbol) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        counts.remove(symbol);
                    }
                }
            }
        }
        self.recompute_required();
    }

    pub fn publish(&self, symbol: &str, payload: String) {
        if let Some(tx) = self.channels.read().get(symbol) {
            // Send errors just mean nobody is listening right now.
            let _ = tx.send(payload);
        }
    }

    /// Union of base symbols and client-required symbols.
    pub fn required(&self) -> BTreeSet<String> {
        self.required_tx.borrow().clone()
    }

    fn recompute_required(&self) {
        let mut required = self.base.lock().clone();
        required.extend(self.client_counts.lock().keys().cloned());
        self.required_tx.send_if_modified(|current| {
            if *current != required {
                *current = required;
                true
            } else {
                false
            }
        });
    }
}

// =============================================================================
// Client payload
// =============================================================================

/// The JSON message pushed to WebSocket subscribers on every broadcast.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BroadcastPayload<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    symbol: &'a str,
    #[serde(rename = "event_time_ms")]
    event_time_ms: i64,
    state: BookLifecycle,
    time_and_sales: &'a TapeSummary,
    cvd: HashMap<String, &'a CvdFrameSummary>,
    absorption: &'a AbsorptionState,
    legacy_metrics: Option<&'a FlowSnapshot>,
    bids: &'a [[f64; 2]],
    asks: &'a [[f64; 2]],
    best_bid: Option<f64>,
    best_ask: Option<f64>,
    spread_pct: Option<f64>,
    mid_price: Option<f64>,
    last_update_id: u64,
}

fn cvd_frame_label(window_s: u64) -> String {
    if window_s % 60 == 0 && window_s >= 60 {
        format!("tf{}m", window_s / 60)
    } else {
        format!("tf{}s", window_s)
    }
}

// =============================================================================
// BroadcastGate
// =============================================================================

/// Throttled per-symbol emitter feeding WebSocket clients and the
/// orchestrator.
pub struct BroadcastGate {
    throttle: Duration,
    last_emit: HashMap<String, Instant>,
    hub: Arc<WsHub>,
    orchestrator: Arc<Orchestrator>,
}

impl BroadcastGate {
    pub fn new(throttle_ms: u64, hub: Arc<WsHub>, orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            throttle: Duration::from_millis(throttle_ms),
            last_emit: HashMap::new(),
            hub,
            orchestrator,
        }
    }

    /// Emit for `symbol` unless its previous emission was under the throttle
    /// ago.
    pub fn broadcast(
        &mut self,
        market: &SymbolMarket,
        reason: BroadcastReason,
        event_time_ms: i64,
    ) {
        let symbol = market.book.symbol().to_string();
        if !self.should_emit(&symbol, Instant::now()) {
            return;
        }
        debug!(symbol = %symbol, reason = ?reason, "broadcasting metrics");

        let envelope = build_envelope(market, now_ms(), event_time_ms);
        let payload = build_payload(market, event_time_ms);
        self.hub.publish(&symbol, payload);
        self.orchestrator.ingest(envelope);
    }

    fn should_emit(&mut self, symbol: &str, now: Instant) -> bool {
        if let Some(last) = self.last_emit.get(symbol) {
            if now.duration_since(*last) < self.throttle {
                return false;
            }
        }
        self.last_emit.insert(symbol.to_string(), now);
        true
    }
}

/// Envelope forwarded to `Orchestrator::ingest`: canonical time is the
/// wall clock at the broadcast boundary, exchange time the feed's event time.
pub fn build_envelope(
    market: &SymbolMarket,
    canonical_time_ms: i64,
    exchange_event_time_ms: i64,
) -> MetricsEnvelope {
    let tape = market.tape.summary();
    MetricsEnvelope {
        symbol: market.book.symbol().to_string(),
        canonical_time_ms,
        exchange_event_time_ms,
        spread_pct: market.book.spread_pct(),
        prints_per_second: tape.prints_per_second,
        best_bid: market.book.best_bid().map(|(p, _)| p),
        best_ask: market.book.best_ask().map(|(p, _)| p),
        flow: market.flow.snapshot(&market.book),
    }
}

/// Serialize the full client payload for one symbol.
pub fn build_payload(market: &SymbolMarket, event_time_ms: i64) -> String {
    let tape = market.tape.summary();
    let cvd_frames = market.cvd.summary();
    let cvd: HashMap<String, &CvdFrameSummary> = cvd_frames
        .iter()
        .map(|f| (cvd_frame_label(f.window_s), f))
        .collect();
    let flow = market.flow.snapshot(&market.book);
    let (bids, asks) = market.book.top_levels(PAYLOAD_DEPTH_LEVELS);

    let payload = BroadcastPayload {
        kind: "metrics",
        symbol: market.book.symbol(),
        event_time_ms,
        state: market.book.lifecycle(),
        time_and_sales: &tape,
        cvd,
        absorption: &market.absorption,
        legacy_metrics: flow.as_ref(),
        bids: &bids,
        asks: &asks,
        best_bid: market.book.best_bid().map(|(p, _)| p),
        best_ask: market.book.best_ask().map(|(p, _)| p),
        spread_pct: market.book.spread_pct(),
        mid_price: market.book.mid_price(),
        last_update_id: market.book.last_update_id(),
    };

    serde_json::to_string(&payload).unwrap_or_else(|_| "{}".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::connector::NullConnector;
    use crate::logger::OrchestratorLogger;
    use crate::types::{DepthSnapshot, Side, Trade};
    use rust_decimal_macros::dec;

    fn market_with_data() -> SymbolMarket {
        let cfg = EngineConfig::default();
        let mut market = SymbolMarket::new("BTCUSDT", &cfg);
        market.book.apply_snapshot(&DepthSnapshot {
            last_update_id: 10,
            bids: vec![(dec!(100), 1.0)],
            asks: vec![(dec!(101), 2.0)],
        });
        market.ingest_trade(
            Trade {
                price: 100.5,
                quantity: 1.0,
                side: Side::Buy,
                event_time_ms: 1_000,
            },
            cfg.trade_window_ms,
        );
        market
    }

    fn gate(dir: &std::path::Path) -> BroadcastGate {
        let cfg = Arc::new(EngineConfig::default());
        let logger = OrchestratorLogger::new(dir, 100, 1_000, Arc::new(|_| {})).unwrap();
        let orchestrator = Orchestrator::new(cfg, Arc::new(NullConnector::new()), logger);
        let (hub, _rx) = WsHub::new(&[]);
        BroadcastGate::new(250, hub, orchestrator)
    }

    #[tokio::test]
    async fn throttle_suppresses_rapid_emissions() {
        let dir = tempfile::tempdir().unwrap();
        let mut gate = gate(dir.path());
        let t0 = Instant::now();
        assert!(gate.should_emit("BTCUSDT", t0));
        assert!(!gate.should_emit("BTCUSDT", t0 + Duration::from_millis(100)));
        assert!(gate.should_emit("BTCUSDT", t0 + Duration::from_millis(300)));
    }

    #[tokio::test]
    async fn throttle_is_per_symbol() {
        let dir = tempfile::tempdir().unwrap();
        let mut gate = gate(dir.path());
        let t0 = Instant::now();
        assert!(gate.should_emit("BTCUSDT", t0));
        assert!(gate.should_emit("ETHUSDT", t0));
    }

    #[test]
    fn envelope_carries_book_and_tape_reads() {
        let market = market_with_data();
        let env = build_envelope(&market, 5_000, 1_000);
        assert_eq!(env.symbol, "BTCUSDT");
        assert_eq!(env.canonical_time_ms, 5_000);
        assert_eq!(env.exchange_event_time_ms, 1_000);
        assert_eq!(env.best_bid, Some(100.0));
        assert_eq!(env.best_ask, Some(101.0));
        assert!(env.flow.is_some());
        assert!(env.prints_per_second > 0.0);
    }

    #[test]
    fn envelope_flow_none_on_empty_book() {
        let cfg = EngineConfig::default();
        let market = SymbolMarket::new("BTCUSDT", &cfg);
        let env = build_envelope(&market, 5_000, 1_000);
        assert!(env.flow.is_none());
        assert!(env.spread_pct.is_none());
    }

    #[test]
    fn payload_shape_matches_client_contract() {
        let market = market_with_data();
        let payload: serde_json::Value =
            serde_json::from_str(&build_payload(&market, 1_000)).unwrap();
        assert_eq!(payload["type"], "metrics");
        assert_eq!(payload["symbol"], "BTCUSDT");
        assert_eq!(payload["event_time_ms"], 1_000);
        assert_eq!(payload["state"], "LIVE");
        assert_eq!(payload["lastUpdateId"], 10);
        assert!(payload["cvd"]["tf1m"].is_object());
        assert!(payload["cvd"]["tf5m"].is_object());
        assert!(payload["cvd"]["tf15m"].is_object());
        assert!(payload["legacyMetrics"].is_object());
        assert!(payload["timeAndSales"]["trade_count"].is_number());
        assert_eq!(payload["bids"][0][0], 100.0);
        assert_eq!(payload["asks"][0][0], 101.0);
        assert!(payload["bestBid"].is_number());
        assert!(payload["spreadPct"].is_number());
        assert!(payload["midPrice"].is_number());
    }

    #[test]
    fn hub_required_set_tracks_clients_and_base() {
        let (hub, rx) = WsHub::new(&["BTCUSDT".to_string()]);
        assert_eq!(rx.borrow().len(), 1);

        hub.subscribe(&["ETHUSDT".to_string()]);
        assert!(hub.required().contains("ETHUSDT"));
        assert!(hub.required().contains("BTCUSDT"));

        hub.unsubscribe(&["ETHUSDT".to_string()]);
        assert!(!hub.required().contains("ETHUSDT"));
    }

    #[tokio::test]
    async fn hub_publish_reaches_subscribers() {
        let (hub, _rx) = WsHub::new(&[]);
        let mut receivers = hub.subscribe(&["BTCUSDT".to_string()]);
        hub.publish("BTCUSDT", "{\"x\":1}".to_string());
        let (_, rx) = &mut receivers[0];
        assert_eq!(rx.recv().await.unwrap(), "{\"x\":1}");
    }
}
