// =============================================================================
// Symbol Actor — single-writer owner of one symbol's trading state
// =============================================================================
//
// One tokio task per symbol drains a FIFO queue of envelopes (metrics or
// execution events).  The task is the only writer of its SymbolState, which
// gives strict per-symbol serialization for free; across symbols processing
// interleaves independently.  The actor does not pull the next envelope
// until the current one — including dispatch of its full action list — has
// completed.
//
// State snapshots handed outward (decision records, execution log lines)
// are clones; the live state never leaves the task.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::decision::{self, DecisionContext, DecisionEngine, DecisionRecord, MAX_ADDS};
use crate::gate::GateResult;
use crate::orchestrator::OrchestratorCore;
use crate::types::{
    ExecutionEvent, MetricsEnvelope, OpenOrder, PositionSide, Quotes,
};

/// Cap on the latency/slippage sample rings.
const EXEC_QUALITY_RING_CAP: usize = 20;
/// Average fill latency above which execution quality is poor (ms).
const POOR_LATENCY_MS: f64 = 2_000.0;
/// Average slippage above which execution quality is poor (bps).
const POOR_SLIPPAGE_BPS: f64 = 30.0;

/// Rolling execution-quality sample rings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecQuality {
    pub poor: bool,
    pub recent_latency_ms: VecDeque<f64>,
    pub recent_slippage_bps: VecDeque<f64>,
}

impl ExecQuality {
    fn push(&mut self, latency_ms: f64, slippage_bps: f64) {
        self.recent_latency_ms.push_back(latency_ms);
        while self.recent_latency_ms.len() > EXEC_QUALITY_RING_CAP {
            self.recent_latency_ms.pop_front();
        }
        self.recent_slippage_bps.push_back(slippage_bps);
        while self.recent_slippage_bps.len() > EXEC_QUALITY_RING_CAP {
            self.recent_slippage_bps.pop_front();
        }

        let avg = |ring: &VecDeque<f64>| {
            if ring.is_empty() {
                0.0
            } else {
                ring.iter().sum::<f64>() / ring.len() as f64
            }
        };
        self.poor = avg(&self.recent_latency_ms) > POOR_LATENCY_MS
            || avg(&self.recent_slippage_bps) > POOR_SLIPPAGE_BPS;
    }
}

/// An open position as tracked by the actor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub side: PositionSide,
    pub qty: f64,
    pub entry_price: f64,
    /// Unrealized PnL as a signed fraction of position notional
    /// (0.10 = +10%). Venue USDT amounts are converted on ingest.
    pub unrealized_pnl_pct: f64,
    pub adds_used: u32,
    pub peak_pnl_pct: f64,
}

/// The complete per-symbol trading state. Exclusively owned by the actor
/// task; everything leaving the task is a clone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolState {
    pub symbol: String,
    pub halted: bool,
    pub available_balance: f64,
    pub wallet_balance: f64,
    pub position: Option<Position>,
    pub open_orders: HashMap<String, OpenOrder>,
    pub has_open_entry_order: bool,
    pub cooldown_until_ms: i64,
    pub last_exit_event_time_ms: i64,
    pub exec_quality: ExecQuality,
}

impl SymbolState {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            halted: false,
            available_balance: 0.0,
            wallet_balance: 0.0,
            position: None,
            open_orders: HashMap::new(),
            has_open_entry_order: false,
            cooldown_until_ms: 0,
            last_exit_event_time_ms: 0,
            exec_quality: ExecQuality::default(),
        }
    }

    fn recompute_entry_order_flag(&mut self) {
        self.has_open_entry_order = self.open_orders.values().any(|o| !o.reduce_only);
    }
}

/// Messages accepted by the actor task.
pub enum ActorEnvelope {
    Metrics(Box<MetricsEnvelope>, GateResult),
    Execution(ExecutionEvent),
    /// Resolves once every envelope enqueued before it has been processed.
    Flush(oneshot::Sender<()>),
    /// Returns a deep copy of the current state.
    Snapshot(oneshot::Sender<SymbolState>),
}

/// Handle to a running symbol actor.
pub struct SymbolActorHandle {
    symbol: String,
    tx: mpsc::UnboundedSender<ActorEnvelope>,
    _join: JoinHandle<()>,
}

impl SymbolActorHandle {
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn send_metrics(&self, envelope: MetricsEnvelope, gate: GateResult) {
        if self
            .tx
            .send(ActorEnvelope::Metrics(Box::new(envelope), gate))
            .is_err()
        {
            warn!(symbol = %self.symbol, "actor queue closed — metrics dropped");
        }
    }

    pub fn send_execution(&self, event: ExecutionEvent) {
        if self.tx.send(ActorEnvelope::Execution(event)).is_err() {
            warn!(symbol = %self.symbol, "actor queue closed — execution event dropped");
        }
    }

    /// Wait until all previously enqueued envelopes are processed.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(ActorEnvelope::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Deep copy of the actor's current state.
    pub async fn snapshot(&self) -> Option<SymbolState> {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(ActorEnvelope::Snapshot(tx)).is_err() {
            return None;
        }
        rx.await.ok()
    }
}

/// Spawn the actor task for `symbol`.
pub fn spawn_symbol_actor(
    symbol: impl Into<String>,
    core: Arc<OrchestratorCore>,
) -> SymbolActorHandle {
    let symbol = symbol.into();
    let (tx, rx) = mpsc::unbounded_channel();
    let worker = ActorWorker {
        state: SymbolState::new(symbol.clone()),
        core,
        last_delta_z: 0.0,
        last_prints_per_second: 0.0,
    };
    let join = tokio::spawn(worker.run(rx));
    SymbolActorHandle {
        symbol,
        tx,
        _join: join,
    }
}

struct ActorWorker {
    state: SymbolState,
    core: Arc<OrchestratorCore>,
    /// Cached from the latest envelope; used only for the cooldown formula
    /// when a later exit lands.
    last_delta_z: f64,
    last_prints_per_second: f64,
}

impl ActorWorker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<ActorEnvelope>) {
        debug!(symbol = %self.state.symbol, "symbol actor started");
        while let Some(envelope) = rx.recv().await {
            match envelope {
                ActorEnvelope::Metrics(env, gate) => self.process_metrics(*env, gate).await,
                ActorEnvelope::Execution(event) => self.process_execution(event),
                ActorEnvelope::Flush(ack) => {
                    let _ = ack.send(());
                }
                ActorEnvelope::Snapshot(reply) => {
                    let _ = reply.send(self.state.clone());
                }
            }
        }
        debug!(symbol = %self.state.symbol, "symbol actor stopped");
    }

    // -------------------------------------------------------------------------
    // Metrics envelopes
    // -------------------------------------------------------------------------

    async fn process_metrics(&mut self, envelope: MetricsEnvelope, gate: GateResult) {
        if let Some(flow) = &envelope.flow {
            self.last_delta_z = flow.delta_z;
        }
        self.last_prints_per_second = envelope.prints_per_second;

        let quotes = self.resolve_quotes(&envelope);
        let capital = self.core.capital();

        let actions = DecisionEngine::evaluate(&DecisionContext {
            symbol: &self.state.symbol,
            event_time_ms: envelope.exchange_event_time_ms,
            gate: &gate,
            envelope: &envelope,
            state: &self.state,
            quotes,
            capital: &capital,
        });

        let record = DecisionRecord {
            symbol: self.state.symbol.clone(),
            canonical_time_ms: envelope.canonical_time_ms,
            exchange_event_time_ms: envelope.exchange_event_time_ms,
            gate,
            actions: actions.clone(),
            state: self.state.clone(),
        };
        self.core.record_decision(record);

        if actions.iter().any(|a| !a.is_noop()) {
            self.core.execute_actions(&actions, &self.state).await;
        }
    }

    /// Venue ticker quotes when the connector has them, else the envelope's
    /// own book top. The fallback keeps replay (no live ticker) fully
    /// deterministic.
    fn resolve_quotes(&self, envelope: &MetricsEnvelope) -> Quotes {
        let ticker = self.core.ticker_quotes(&self.state.symbol);
        Quotes {
            best_bid: ticker.best_bid.or(envelope.best_bid),
            best_ask: ticker.best_ask.or(envelope.best_ask),
        }
    }

    // -------------------------------------------------------------------------
    // Execution envelopes
    // -------------------------------------------------------------------------

    fn process_execution(&mut self, event: ExecutionEvent) {
        match &event {
            ExecutionEvent::SystemHalt { reason, .. } => {
                info!(symbol = %self.state.symbol, reason = %reason, "symbol halted");
                self.state.halted = true;
            }
            ExecutionEvent::SystemResume { .. } => {
                info!(symbol = %self.state.symbol, "symbol resumed");
                self.state.halted = false;
            }
            ExecutionEvent::OrderUpdate { order, .. } => {
                if order.status.is_terminal() {
                    self.state.open_orders.remove(&order.order_id);
                } else {
                    self.state
                        .open_orders
                        .insert(order.order_id.clone(), order.clone());
                }
                self.state.recompute_entry_order_flag();
            }
            ExecutionEvent::OpenOrdersSnapshot { orders, .. } => {
                self.state.open_orders = orders
                    .iter()
                    .map(|o| (o.order_id.clone(), o.clone()))
                    .collect();
                self.state.recompute_entry_order_flag();
            }
            ExecutionEvent::TradeUpdate {
                event_time_ms,
                order_id,
                fill_price,
                ..
            } => {
                self.apply_trade_update(*event_time_ms, order_id, *fill_price);
            }
            ExecutionEvent::AccountUpdate {
                event_time_ms,
                available_balance,
                wallet_balance,
                position_amt,
                entry_price,
                unrealized_pnl,
                ..
            } => {
                self.apply_account_update(
                    *event_time_ms,
                    *available_balance,
                    *wallet_balance,
                    *position_amt,
                    *entry_price,
                    *unrealized_pnl,
                );
            }
        }

        self.core.log_execution(&event, &self.state);
    }

    fn apply_trade_update(&mut self, event_time_ms: i64, order_id: &str, fill_price: f64) {
        let Some(meta) = self.core.order_meta(order_id) else {
            debug!(
                symbol = %self.state.symbol,
                order_id,
                "fill for unknown order — no quality sample"
            );
            return;
        };

        let latency_ms = (event_time_ms - meta.sent_at_ms).max(0) as f64;
        let slippage_bps = if meta.expected_price > 0.0 {
            (fill_price - meta.expected_price).abs() / meta.expected_price * 10_000.0
        } else {
            0.0
        };
        self.state.exec_quality.push(latency_ms, slippage_bps);

        if meta.is_add {
            if let Some(pos) = &mut self.state.position {
                pos.adds_used = (pos.adds_used + 1).min(MAX_ADDS);
            }
        }
    }

    fn apply_account_update(
        &mut self,
        event_time_ms: i64,
        available_balance: f64,
        wallet_balance: f64,
        position_amt: f64,
        entry_price: f64,
        unrealized_pnl: f64,
    ) {
        self.state.available_balance = available_balance;
        self.state.wallet_balance = wallet_balance;

        if position_amt == 0.0 {
            if self.state.position.take().is_some() {
                // Position closed: arm the entry cooldown off the last seen
                // flow context.
                let cfg = self.core.config();
                let cooldown = decision::cooldown_ms(
                    self.last_delta_z,
                    self.last_prints_per_second,
                    cfg.cooldown_min_ms,
                    cfg.cooldown_max_ms,
                );
                self.state.last_exit_event_time_ms = event_time_ms;
                self.state.cooldown_until_ms = event_time_ms + cooldown;
                info!(
                    symbol = %self.state.symbol,
                    cooldown_ms = cooldown,
                    "position closed — cooldown armed"
                );
            }
            return;
        }

        let side = if position_amt > 0.0 {
            PositionSide::Long
        } else {
            PositionSide::Short
        };
        let qty = position_amt.abs();
        let notional = entry_price * qty;
        let unrealized_pnl_pct = if notional > 0.0 {
            unrealized_pnl / notional
        } else {
            0.0
        };

        self.state.position = Some(match self.state.position.take() {
            Some(prev) if prev.side == side => Position {
                side,
                qty,
                entry_price,
                unrealized_pnl_pct,
                adds_used: prev.adds_used,
                peak_pnl_pct: prev.peak_pnl_pct.max(unrealized_pnl_pct),
            },
            _ => Position {
                side,
                qty,
                entry_price,
                unrealized_pnl_pct,
                adds_used: 0,
                peak_pnl_pct: unrealized_pnl_pct.max(0.0),
            },
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::connector::NullConnector;
    use crate::logger::OrchestratorLogger;
    use crate::orchestrator::{OrderMeta, OrchestratorCore};
    use crate::types::{OrderStatus, OrderType, Side};

    fn test_core(dir: &std::path::Path) -> Arc<OrchestratorCore> {
        let cfg = Arc::new(EngineConfig::default());
        let logger =
            OrchestratorLogger::new(dir, 100, 1_000, Arc::new(|_| {})).unwrap();
        Arc::new(OrchestratorCore::new(
            cfg,
            Arc::new(NullConnector::new()),
            logger,
        ))
    }

    fn order(id: &str, reduce_only: bool, status: OrderStatus) -> OpenOrder {
        OpenOrder {
            order_id: id.into(),
            client_order_id: None,
            side: Side::Buy,
            order_type: OrderType::Market,
            quantity: 1.0,
            price: None,
            reduce_only,
            status,
        }
    }

    fn account_update(amt: f64, entry: f64, upnl: f64, t: i64) -> ExecutionEvent {
        ExecutionEvent::AccountUpdate {
            symbol: "BTCUSDT".into(),
            event_time_ms: t,
            available_balance: 900.0,
            wallet_balance: 1_000.0,
            position_amt: amt,
            entry_price: entry,
            unrealized_pnl: upnl,
        }
    }

    #[tokio::test]
    async fn halt_and_resume_toggle_state() {
        let dir = tempfile::tempdir().unwrap();
        let core = test_core(dir.path());
        let actor = spawn_symbol_actor("BTCUSDT", core);

        actor.send_execution(ExecutionEvent::SystemHalt {
            symbol: "BTCUSDT".into(),
            event_time_ms: 1,
            reason: "test".into(),
        });
        assert!(actor.snapshot().await.unwrap().halted);

        actor.send_execution(ExecutionEvent::SystemResume {
            symbol: "BTCUSDT".into(),
            event_time_ms: 2,
        });
        assert!(!actor.snapshot().await.unwrap().halted);
    }

    #[tokio::test]
    async fn order_updates_track_open_entry_flag() {
        let dir = tempfile::tempdir().unwrap();
        let core = test_core(dir.path());
        let actor = spawn_symbol_actor("BTCUSDT", core);

        actor.send_execution(ExecutionEvent::OrderUpdate {
            symbol: "BTCUSDT".into(),
            event_time_ms: 1,
            order: order("o1", false, OrderStatus::New),
        });
        let state = actor.snapshot().await.unwrap();
        assert_eq!(state.open_orders.len(), 1);
        assert!(state.has_open_entry_order);

        // Terminal status removes the order and clears the flag.
        actor.send_execution(ExecutionEvent::OrderUpdate {
            symbol: "BTCUSDT".into(),
            event_time_ms: 2,
            order: order("o1", false, OrderStatus::Filled),
        });
        let state = actor.snapshot().await.unwrap();
        assert!(state.open_orders.is_empty());
        assert!(!state.has_open_entry_order);
    }

    #[tokio::test]
    async fn open_orders_snapshot_replaces_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let core = test_core(dir.path());
        let actor = spawn_symbol_actor("BTCUSDT", core);

        actor.send_execution(ExecutionEvent::OrderUpdate {
            symbol: "BTCUSDT".into(),
            event_time_ms: 1,
            order: order("stale", false, OrderStatus::New),
        });
        actor.send_execution(ExecutionEvent::OpenOrdersSnapshot {
            symbol: "BTCUSDT".into(),
            event_time_ms: 2,
            orders: vec![order("fresh", true, OrderStatus::New)],
        });
        let state = actor.snapshot().await.unwrap();
        assert_eq!(state.open_orders.len(), 1);
        assert!(state.open_orders.contains_key("fresh"));
        // The only open order is reduce-only.
        assert!(!state.has_open_entry_order);
    }

    #[tokio::test]
    async fn account_update_opens_and_closes_position_with_cooldown() {
        let dir = tempfile::tempdir().unwrap();
        let core = test_core(dir.path());
        let actor = spawn_symbol_actor("BTCUSDT", core);

        actor.send_execution(account_update(2.0, 100.0, 10.0, 1_000));
        let state = actor.snapshot().await.unwrap();
        let pos = state.position.unwrap();
        assert_eq!(pos.side, PositionSide::Long);
        assert!((pos.qty - 2.0).abs() < f64::EPSILON);
        // 10 USDT on 200 notional = +5%.
        assert!((pos.unrealized_pnl_pct - 0.05).abs() < 1e-12);
        assert!((pos.peak_pnl_pct - 0.05).abs() < 1e-12);

        actor.send_execution(account_update(0.0, 0.0, 0.0, 5_000));
        let state = actor.snapshot().await.unwrap();
        assert!(state.position.is_none());
        assert_eq!(state.last_exit_event_time_ms, 5_000);
        // Cooldown is at least the configured minimum past the exit.
        assert!(state.cooldown_until_ms >= 5_000 + 2_000);
    }

    #[tokio::test]
    async fn peak_pnl_is_monotonic_for_a_held_position() {
        let dir = tempfile::tempdir().unwrap();
        let core = test_core(dir.path());
        let actor = spawn_symbol_actor("BTCUSDT", core);

        actor.send_execution(account_update(1.0, 100.0, 20.0, 1_000)); // +20%
        actor.send_execution(account_update(1.0, 100.0, 5.0, 2_000)); // +5%
        let state = actor.snapshot().await.unwrap();
        let pos = state.position.unwrap();
        assert!((pos.unrealized_pnl_pct - 0.05).abs() < 1e-12);
        assert!((pos.peak_pnl_pct - 0.20).abs() < 1e-12);
    }

    #[tokio::test]
    async fn side_flip_resets_adds_and_peak() {
        let dir = tempfile::tempdir().unwrap();
        let core = test_core(dir.path());
        let actor = spawn_symbol_actor("BTCUSDT", core);

        actor.send_execution(account_update(1.0, 100.0, 30.0, 1_000));
        actor.send_execution(account_update(-1.0, 100.0, -5.0, 2_000));
        let state = actor.snapshot().await.unwrap();
        let pos = state.position.unwrap();
        assert_eq!(pos.side, PositionSide::Short);
        assert_eq!(pos.adds_used, 0);
        assert!((pos.peak_pnl_pct - 0.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn trade_update_samples_quality_and_counts_adds() {
        let dir = tempfile::tempdir().unwrap();
        let core = test_core(dir.path());
        core.remember_order(
            "o1",
            OrderMeta {
                expected_price: 100.0,
                sent_at_ms: 1_000,
                is_add: true,
            },
        );
        let actor = spawn_symbol_actor("BTCUSDT", core.clone());

        actor.send_execution(account_update(1.0, 100.0, 0.0, 500));
        actor.send_execution(ExecutionEvent::TradeUpdate {
            symbol: "BTCUSDT".into(),
            event_time_ms: 4_500,
            order_id: "o1".into(),
            fill_price: 100.5,
            fill_qty: 1.0,
            realized_pnl: 0.0,
        });

        let state = actor.snapshot().await.unwrap();
        assert_eq!(state.exec_quality.recent_latency_ms.len(), 1);
        // 3500 ms latency alone averages above the 2000 ms bar.
        assert!(state.exec_quality.poor);
        // |100.5 - 100| / 100 * 1e4 = 50 bps.
        assert!((state.exec_quality.recent_slippage_bps[0] - 50.0).abs() < 1e-9);
        assert_eq!(state.position.unwrap().adds_used, 1);
    }

    #[tokio::test]
    async fn unknown_fill_leaves_quality_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let core = test_core(dir.path());
        let actor = spawn_symbol_actor("BTCUSDT", core);

        actor.send_execution(ExecutionEvent::TradeUpdate {
            symbol: "BTCUSDT".into(),
            event_time_ms: 1_000,
            order_id: "mystery".into(),
            fill_price: 100.0,
            fill_qty: 1.0,
            realized_pnl: 0.0,
        });
        let state = actor.snapshot().await.unwrap();
        assert!(state.exec_quality.recent_latency_ms.is_empty());
        assert!(!state.exec_quality.poor);
    }

    #[tokio::test]
    async fn quality_rings_capped_at_twenty() {
        let dir = tempfile::tempdir().unwrap();
        let core = test_core(dir.path());
        for i in 0..30 {
            core.remember_order(
                &format!("o{i}"),
                OrderMeta {
                    expected_price: 100.0,
                    sent_at_ms: 0,
                    is_add: false,
                },
            );
        }
        let actor = spawn_symbol_actor("BTCUSDT", core);
        for i in 0..30 {
            actor.send_execution(ExecutionEvent::TradeUpdate {
                symbol: "BTCUSDT".into(),
                event_time_ms: 100,
                order_id: format!("o{i}"),
                fill_price: 100.0,
                fill_qty: 1.0,
                realized_pnl: 0.0,
            });
        }
        let state = actor.snapshot().await.unwrap();
        assert_eq!(state.exec_quality.recent_latency_ms.len(), EXEC_QUALITY_RING_CAP);
        assert_eq!(state.exec_quality.recent_slippage_bps.len(), EXEC_QUALITY_RING_CAP);
    }
}
