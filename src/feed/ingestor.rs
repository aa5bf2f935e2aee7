// =============================================================================
// Feed Ingestor — single multiplexed exchange stream demuxer
// =============================================================================
//
// Exactly one WebSocket connection carries, per required symbol, a depth-diff
// channel (~100 ms cadence) and an aggTrade channel.  The ingest task owns
// every SymbolMarket outright; snapshot results and open-interest polls come
// back over channels so no other task ever touches the books.
//
// Subscription reconciliation: the hub publishes the union of base and
// client-required symbols through a watch channel; when the set differs from
// the active connection's, the ingestor reconnects with the new stream list.
//
// Reconnect policy is a fixed 5 s delay on close or error — rate limiting
// lives in the snapshot fetcher, not here.
// =============================================================================

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::broadcast::{BroadcastGate, BroadcastReason};
use crate::config::EngineConfig;
use crate::feed::snapshot::{SnapshotFetcher, SnapshotOutcome};
use crate::market_data::{ApplyOutcome, BookLifecycle, BookStats, SymbolMarket};
use crate::types::{DepthDiff, Side, Trade};

/// Fixed reconnect delay after a stream drop.
const RECONNECT_DELAY_SECS: u64 = 5;
/// Cadence of the shared book-health refresh.
const HEALTH_REFRESH_SECS: u64 = 5;

/// Open-interest poll result: (symbol, poll time, open interest).
pub type OiSample = (String, i64, f64);

/// Per-symbol book health published for the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct BookHealth {
    pub lifecycle: BookLifecycle,
    pub stats: BookStats,
    pub last_update_id: u64,
    pub last_event_time_ms: i64,
}

/// Health map shared between the ingest task (writer) and the API (reader).
pub type SharedBookHealth = Arc<RwLock<HashMap<String, BookHealth>>>;

/// Owns all per-symbol market state and the exchange connection.
pub struct FeedIngestor {
    cfg: Arc<EngineConfig>,
    ws_base_url: String,
    markets: HashMap<String, SymbolMarket>,
    fetcher: Arc<SnapshotFetcher>,
    snapshot_rx: mpsc::UnboundedReceiver<SnapshotOutcome>,
    required_rx: watch::Receiver<BTreeSet<String>>,
    oi_rx: mpsc::UnboundedReceiver<OiSample>,
    broadcast: BroadcastGate,
    health_out: SharedBookHealth,
}

impl FeedIngestor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: Arc<EngineConfig>,
        ws_base_url: impl Into<String>,
        fetcher: Arc<SnapshotFetcher>,
        snapshot_rx: mpsc::UnboundedReceiver<SnapshotOutcome>,
        required_rx: watch::Receiver<BTreeSet<String>>,
        oi_rx: mpsc::UnboundedReceiver<OiSample>,
        broadcast: BroadcastGate,
        health_out: SharedBookHealth,
    ) -> Self {
        Self {
            cfg,
            ws_base_url: ws_base_url.into(),
            markets: HashMap::new(),
            fetcher,
            snapshot_rx,
            required_rx,
            oi_rx,
            broadcast,
            health_out,
        }
    }

    /// Run forever: connect over the current required set, demux, reconnect
    /// on drop or on subscription change.
    pub async fn run(mut self) {
        loop {
            let required: BTreeSet<String> = self.required_rx.borrow_and_update().clone();
            if required.is_empty() {
                if self.required_rx.changed().await.is_err() {
                    return;
                }
                continue;
            }

            for symbol in &required {
                self.markets
                    .entry(symbol.clone())
                    .or_insert_with(|| SymbolMarket::new(symbol, &self.cfg));
            }

            let resubscribe = match self.run_connection(&required).await {
                Ok(resub) => resub,
                Err(e) => {
                    error!(error = %e, "feed connection error");
                    false
                }
            };

            if !resubscribe {
                info!(
                    delay_secs = RECONNECT_DELAY_SECS,
                    "feed disconnected — reconnecting"
                );
                tokio::time::sleep(std::time::Duration::from_secs(RECONNECT_DELAY_SECS)).await;
            }
        }
    }

    /// One connection lifetime. Returns Ok(true) when the subscription set
    /// changed and the caller should reconnect immediately.
    async fn run_connection(&mut self, active: &BTreeSet<String>) -> Result<bool> {
        let url = combined_stream_url(&self.ws_base_url, active);
        info!(url = %url, symbols = active.len(), "connecting to market data stream");

        let (ws_stream, _response) = connect_async(&url)
            .await
            .context("failed to connect to market data stream")?;
        info!("market data stream connected");

        let (mut write, mut read) = ws_stream.split();
        let mut health_interval =
            tokio::time::interval(std::time::Duration::from_secs(HEALTH_REFRESH_SECS));

        loop {
            tokio::select! {
                _ = health_interval.tick() => {
                    self.publish_health();
                }

                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => self.handle_message(&text),
                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = write.send(Message::Pong(data)).await {
                                warn!(error = %e, "failed to answer ping");
                                return Ok(false);
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            warn!("market data stream closed");
                            return Ok(false);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            error!(error = %e, "market data stream read error");
                            return Ok(false);
                        }
                    }
                }

                Some(outcome) = self.snapshot_rx.recv() => {
                    self.handle_snapshot_outcome(outcome);
                }

                Some((symbol, poll_time_ms, oi)) = self.oi_rx.recv() => {
                    if let Some(market) = self.markets.get_mut(&symbol) {
                        market.flow.record_open_interest(poll_time_ms, oi);
                    }
                }

                changed = self.required_rx.changed() => {
                    if changed.is_err() {
                        return Ok(false);
                    }
                    let new_set = self.required_rx.borrow().clone();
                    if new_set != *active {
                        info!(
                            old = active.len(),
                            new = new_set.len(),
                            "subscription set changed — reconnecting"
                        );
                        return Ok(true);
                    }
                }
            }
        }
    }

    fn handle_message(&mut self, text: &str) {
        let root: serde_json::Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "failed to parse stream message");
                return;
            }
        };
        let data = if root.get("data").is_some() {
            &root["data"]
        } else {
            &root
        };

        match data["e"].as_str() {
            Some("depthUpdate") => match parse_depth_event(data) {
                Ok((symbol, diff)) => self.handle_depth(&symbol, diff),
                Err(e) => warn!(error = %e, "failed to parse depth event"),
            },
            Some("aggTrade") => match parse_agg_trade(data) {
                Ok((symbol, trade)) => self.handle_trade(&symbol, trade),
                Err(e) => warn!(error = %e, "failed to parse aggTrade event"),
            },
            _ => {}
        }
    }

    fn handle_depth(&mut self, symbol: &str, diff: DepthDiff) {
        let Some(market) = self.markets.get_mut(symbol) else {
            return;
        };
        let event_time_ms = diff.event_time_ms;

        match market.book.apply_diff(diff) {
            ApplyOutcome::Applied => {
                self.broadcast
                    .broadcast(market, BroadcastReason::Depth, event_time_ms);
            }
            ApplyOutcome::Buffered => {
                // First seed request for an unseeded book; a resyncing book
                // retries here too, throttled inside the fetcher.
                let lifecycle = market.book.lifecycle();
                if matches!(
                    lifecycle,
                    BookLifecycle::Unseeded | BookLifecycle::Resyncing
                ) && !self.fetcher.is_resyncing(symbol)
                {
                    self.fetcher.request(symbol, lifecycle);
                }
            }
            ApplyOutcome::Desync => {
                if !self.fetcher.is_resyncing(symbol) {
                    market.book.mark_resyncing();
                    self.fetcher.request(symbol, BookLifecycle::Resyncing);
                }
            }
        }
    }

    fn handle_trade(&mut self, symbol: &str, trade: Trade) {
        let window_ms = self.cfg.trade_window_ms;
        let Some(market) = self.markets.get_mut(symbol) else {
            return;
        };
        let event_time_ms = trade.event_time_ms;
        market.ingest_trade(trade, window_ms);
        self.broadcast
            .broadcast(market, BroadcastReason::Trade, event_time_ms);
    }

    fn handle_snapshot_outcome(&mut self, outcome: SnapshotOutcome) {
        match outcome {
            SnapshotOutcome::Fetched { symbol, snapshot } => {
                if let Some(market) = self.markets.get_mut(&symbol) {
                    market.book.apply_snapshot(&snapshot);
                    let event_time_ms = market.book.last_event_time_ms();
                    self.broadcast
                        .broadcast(market, BroadcastReason::Depth, event_time_ms);
                }
            }
            SnapshotOutcome::Escalate { symbol } => {
                if let Some(market) = self.markets.get_mut(&symbol) {
                    market.book.mark_stale();
                }
            }
        }
    }

    /// Refresh the shared per-symbol book health map.
    fn publish_health(&self) {
        let snapshot: HashMap<String, BookHealth> = self
            .markets
            .iter()
            .map(|(s, m)| {
                (
                    s.clone(),
                    BookHealth {
                        lifecycle: m.book.lifecycle(),
                        stats: m.book.stats(),
                        last_update_id: m.book.last_update_id(),
                        last_event_time_ms: m.book.last_event_time_ms(),
                    },
                )
            })
            .collect();
        *self.health_out.write() = snapshot;
    }
}

/// `wss://.../stream?streams=btcusdt@depth@100ms/btcusdt@aggTrade/...`
fn combined_stream_url(base: &str, symbols: &BTreeSet<String>) -> String {
    let streams: Vec<String> = symbols
        .iter()
        .flat_map(|s| {
            let lower = s.to_lowercase();
            [format!("{lower}@depth@100ms"), format!("{lower}@aggTrade")]
        })
        .collect();
    format!("{}/stream?streams={}", base, streams.join("/"))
}

/// Parse a depth diff event:
/// `{"e":"depthUpdate","s":"BTCUSDT","E":t,"U":n,"u":n,"b":[["p","q"],..],"a":[..]}`.
fn parse_depth_event(data: &serde_json::Value) -> Result<(String, DepthDiff)> {
    let symbol = data["s"]
        .as_str()
        .context("depth event missing symbol")?
        .to_string();
    let first_update_id = data["U"].as_u64().context("depth event missing U")?;
    let final_update_id = data["u"].as_u64().context("depth event missing u")?;
    let event_time_ms = data["E"].as_i64().unwrap_or(0);

    let parse_side = |key: &str| -> Result<Vec<(Decimal, f64)>> {
        let Some(levels) = data[key].as_array() else {
            return Ok(Vec::new());
        };
        let mut out = Vec::with_capacity(levels.len());
        for level in levels {
            let price: Decimal = level
                .get(0)
                .and_then(|v| v.as_str())
                .context("depth level missing price")?
                .parse()
                .context("failed to parse depth price")?;
            let size: f64 = level
                .get(1)
                .and_then(|v| v.as_str())
                .context("depth level missing size")?
                .parse()
                .context("failed to parse depth size")?;
            out.push((price, size));
        }
        Ok(out)
    };

    Ok((
        symbol,
        DepthDiff {
            first_update_id,
            final_update_id,
            bids: parse_side("b")?,
            asks: parse_side("a")?,
            event_time_ms,
        },
    ))
}

/// Parse an aggTrade event:
/// `{"e":"aggTrade","s":"BTCUSDT","p":"100.0","q":"1.2","T":t,"m":true}`.
/// `m == true` means the buyer was the maker, so the taker sold.
fn parse_agg_trade(data: &serde_json::Value) -> Result<(String, Trade)> {
    let symbol = data["s"]
        .as_str()
        .context("aggTrade missing symbol")?
        .to_string();
    let price: f64 = data["p"]
        .as_str()
        .context("aggTrade missing p")?
        .parse()
        .context("failed to parse trade price")?;
    let quantity: f64 = data["q"]
        .as_str()
        .context("aggTrade missing q")?
        .parse()
        .context("failed to parse trade quantity")?;
    let event_time_ms = data["T"].as_i64().context("aggTrade missing T")?;
    let buyer_is_maker = data["m"].as_bool().context("aggTrade missing m")?;

    let side = if buyer_is_maker { Side::Sell } else { Side::Buy };
    debug!(symbol = %symbol, price, quantity, side = %side, "trade parsed");

    Ok((
        symbol,
        Trade {
            price,
            quantity,
            side,
            event_time_ms,
        },
    ))
}
