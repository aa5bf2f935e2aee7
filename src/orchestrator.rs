// =============================================================================
// Orchestrator — owns the actors, the decision ledger, and execution routing
// =============================================================================
//
// The orchestrator sits between the metric broadcast, the per-symbol actors,
// and the execution venue connector.  It gates incoming envelopes, writes
// the metrics/execution/decision JSONL streams, lazily constructs actors on
// first observation, and turns non-NOOP actions into serialized connector
// calls with expected-price metadata recorded per order id.
//
// Ownership: actors communicate with the orchestrator core only by value
// (clones and messages), never by reference into live state.
// =============================================================================

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::actor::{spawn_symbol_actor, SymbolActorHandle, SymbolState};
use crate::config::{CapitalSettings, EngineConfig};
use crate::connector::{ExecutionConnector, PlaceOrderRequest};
use crate::decision::{DecisionAction, DecisionRecord};
use crate::gate::{self, GateResult};
use crate::logger::{LogKind, OrchestratorLogger};
use crate::types::{
    now_ms, ExecutionEvent, MetricsEnvelope, OrderType, Quotes, RealizedPnlBySymbol, Side,
};

/// Metadata captured when an order is sent, consumed later to derive fill
/// latency and slippage.
#[derive(Debug, Clone)]
pub struct OrderMeta {
    pub expected_price: f64,
    pub sent_at_ms: i64,
    pub is_add: bool,
}

// =============================================================================
// OrchestratorCore
// =============================================================================

/// Shared services handed to every actor: config, connector access, the
/// decision ledger, and the JSONL logger.
pub struct OrchestratorCore {
    cfg: Arc<EngineConfig>,
    connector: Arc<dyn ExecutionConnector>,
    logger: Arc<OrchestratorLogger>,
    ledger: RwLock<Vec<DecisionRecord>>,
    order_meta: RwLock<HashMap<String, OrderMeta>>,
    capital: RwLock<CapitalSettings>,
    execution_enabled: AtomicBool,
    /// Cleared during replay so re-ingested lines are not re-logged.
    logging_enabled: AtomicBool,
}

impl OrchestratorCore {
    pub fn new(
        cfg: Arc<EngineConfig>,
        connector: Arc<dyn ExecutionConnector>,
        logger: Arc<OrchestratorLogger>,
    ) -> Self {
        let capital = cfg.capital.clone();
        let execution_enabled = cfg.execution_enabled;
        Self {
            cfg,
            connector,
            logger,
            ledger: RwLock::new(Vec::new()),
            order_meta: RwLock::new(HashMap::new()),
            capital: RwLock::new(capital),
            execution_enabled: AtomicBool::new(execution_enabled),
            logging_enabled: AtomicBool::new(true),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    pub fn connector(&self) -> &Arc<dyn ExecutionConnector> {
        &self.connector
    }

    pub fn capital(&self) -> CapitalSettings {
        self.capital.read().clone()
    }

    /// The only runtime-mutable sizing knob.
    pub fn set_capital(&self, capital: CapitalSettings) {
        *self.capital.write() = capital;
    }

    pub fn set_execution_enabled(&self, enabled: bool) {
        self.execution_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn execution_enabled(&self) -> bool {
        self.execution_enabled.load(Ordering::SeqCst)
    }

    pub fn set_logging_enabled(&self, enabled: bool) {
        self.logging_enabled.store(enabled, Ordering::SeqCst);
    }

    /// Best bid/ask from the connector's ticker cache.
    pub fn ticker_quotes(&self, symbol: &str) -> Quotes {
        Quotes {
            best_bid: self
                .connector
                .expected_price(symbol, Side::Sell, OrderType::Market, None),
            best_ask: self
                .connector
                .expected_price(symbol, Side::Buy, OrderType::Market, None),
        }
    }

    // -------------------------------------------------------------------------
    // Ledger + logging
    // -------------------------------------------------------------------------

    /// Append to the in-memory ledger and the decision JSONL stream.
    pub fn record_decision(&self, record: DecisionRecord) {
        if self.logging_enabled.load(Ordering::SeqCst) {
            if let Ok(value) = serde_json::to_value(&record) {
                self.logger
                    .enqueue(LogKind::Decision, record.canonical_time_ms, value);
            }
        }
        self.ledger.write().push(record);
    }

    /// Execution JSONL line: the raw event wrapped with a state projection.
    pub fn log_execution(&self, event: &ExecutionEvent, state: &SymbolState) {
        if !self.logging_enabled.load(Ordering::SeqCst) {
            return;
        }
        let line = json!({
            "symbol": event.symbol(),
            "event_time_ms": event.event_time_ms(),
            "event": event,
            "state": state,
        });
        self.logger
            .enqueue(LogKind::Execution, event.event_time_ms(), line);
    }

    fn log_metrics_line(&self, envelope: &MetricsEnvelope, gate: &GateResult) {
        if !self.logging_enabled.load(Ordering::SeqCst) {
            return;
        }
        let line = json!({
            "canonical_time_ms": envelope.canonical_time_ms,
            "exchange_event_time_ms": envelope.exchange_event_time_ms,
            "symbol": envelope.symbol,
            "gate": gate,
            "metrics": envelope,
        });
        self.logger
            .enqueue(LogKind::Metrics, envelope.canonical_time_ms, line);
    }

    pub fn ledger_snapshot(&self) -> Vec<DecisionRecord> {
        self.ledger.read().clone()
    }

    pub fn ledger_len(&self) -> usize {
        self.ledger.read().len()
    }

    pub fn clear_ledger_and_meta(&self) {
        self.ledger.write().clear();
        self.order_meta.write().clear();
    }

    // -------------------------------------------------------------------------
    // Order metadata
    // -------------------------------------------------------------------------

    pub fn order_meta(&self, order_id: &str) -> Option<OrderMeta> {
        self.order_meta.read().get(order_id).cloned()
    }

    pub fn remember_order(&self, order_id: &str, meta: OrderMeta) {
        self.order_meta.write().insert(order_id.to_string(), meta);
    }

    // -------------------------------------------------------------------------
    // Action execution
    // -------------------------------------------------------------------------

    /// Turn an action list into serialized connector calls.
    ///
    /// A connector failure is logged and the originating decision is NOT
    /// retried; later decisions reconsider from fresh state.
    pub async fn execute_actions(&self, actions: &[DecisionAction], state: &SymbolState) {
        if !self.execution_enabled() {
            debug!("execution disabled — actions not dispatched");
            return;
        }
        if !self.connector.connected() {
            warn!("connector disconnected — actions not dispatched");
            return;
        }

        for action in actions {
            match action {
                DecisionAction::Noop { .. } => {}
                DecisionAction::CancelOpenEntryOrders { symbol, .. } => {
                    // Cancel only working entry orders; reduce-only exits
                    // stay alive.
                    let entry_ids: Vec<String> = state
                        .open_orders
                        .values()
                        .filter(|o| !o.reduce_only)
                        .map(|o| o.order_id.clone())
                        .collect();
                    for order_id in entry_ids {
                        if let Err(e) = self
                            .connector
                            .cancel_order(symbol, Some(&order_id), None)
                            .await
                        {
                            warn!(symbol = %symbol, order_id = %order_id, error = %e, "cancel failed");
                        }
                    }
                }
                DecisionAction::EntryProbe {
                    symbol,
                    side,
                    quantity,
                    expected_price,
                    reason,
                    ..
                }
                | DecisionAction::AddPosition {
                    symbol,
                    side,
                    quantity,
                    expected_price,
                    reason,
                    ..
                } => {
                    let is_add = matches!(action, DecisionAction::AddPosition { .. });
                    self.submit_market_order(
                        symbol,
                        *side,
                        *quantity,
                        false,
                        *expected_price,
                        is_add,
                        reason,
                    )
                    .await;
                }
                DecisionAction::ExitMarket {
                    symbol,
                    side,
                    quantity,
                    expected_price,
                    reason,
                    ..
                } => {
                    self.submit_market_order(
                        symbol,
                        *side,
                        *quantity,
                        true,
                        *expected_price,
                        false,
                        reason,
                    )
                    .await;
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn submit_market_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
        reduce_only: bool,
        expected_price: Option<f64>,
        is_add: bool,
        reason: &str,
    ) {
        let sent_at_ms = now_ms();
        let req = PlaceOrderRequest {
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Market,
            quantity,
            reduce_only,
            client_order_id: Some(uuid::Uuid::new_v4().to_string()),
        };

        match self.connector.place_order(req).await {
            Ok(placed) => {
                info!(
                    symbol,
                    side = %side,
                    quantity,
                    reduce_only,
                    reason,
                    order_id = %placed.order_id,
                    "order submitted"
                );
                self.remember_order(
                    &placed.order_id,
                    OrderMeta {
                        expected_price: expected_price.unwrap_or(0.0),
                        sent_at_ms,
                        is_add,
                    },
                );
            }
            Err(e) => {
                warn!(symbol, side = %side, reason, error = %e, "order submission failed");
            }
        }
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Top-level coordinator: actor map, execution symbol filter, realized-PnL
/// tally.
pub struct Orchestrator {
    core: Arc<OrchestratorCore>,
    actors: RwLock<HashMap<String, Arc<SymbolActorHandle>>>,
    execution_symbols: RwLock<BTreeSet<String>>,
    realized_pnl: RwLock<RealizedPnlBySymbol>,
}

impl Orchestrator {
    pub fn new(
        cfg: Arc<EngineConfig>,
        connector: Arc<dyn ExecutionConnector>,
        logger: Arc<OrchestratorLogger>,
    ) -> Arc<Self> {
        Arc::new(Self {
            core: Arc::new(OrchestratorCore::new(cfg, connector, logger)),
            actors: RwLock::new(HashMap::new()),
            execution_symbols: RwLock::new(BTreeSet::new()),
            realized_pnl: RwLock::new(HashMap::new()),
        })
    }

    pub fn core(&self) -> Arc<OrchestratorCore> {
        self.core.clone()
    }

    /// Get or lazily spawn the actor for `symbol`.
    fn actor_for(&self, symbol: &str) -> Arc<SymbolActorHandle> {
        if let Some(handle) = self.actors.read().get(symbol) {
            return handle.clone();
        }
        let mut actors = self.actors.write();
        actors
            .entry(symbol.to_string())
            .or_insert_with(|| {
                info!(symbol, "spawning symbol actor");
                Arc::new(spawn_symbol_actor(symbol, self.core.clone()))
            })
            .clone()
    }

    // -------------------------------------------------------------------------
    // Ingest paths
    // -------------------------------------------------------------------------

    /// Live path: filter, gate, log the metrics line, enqueue to the actor.
    pub fn ingest(&self, envelope: MetricsEnvelope) {
        {
            let exec_symbols = self.execution_symbols.read();
            if !exec_symbols.is_empty() && !exec_symbols.contains(&envelope.symbol) {
                return;
            }
        }

        let gate = gate::evaluate(&envelope, &self.core.cfg.gate);
        self.core.log_metrics_line(&envelope, &gate);
        self.actor_for(&envelope.symbol).send_metrics(envelope, gate);
    }

    /// Replay path for lines that already carry a gate verdict: no re-gate,
    /// no re-log.
    pub fn ingest_logged_metrics(&self, envelope: MetricsEnvelope, gate: GateResult) {
        self.actor_for(&envelope.symbol).send_metrics(envelope, gate);
    }

    /// Live execution-event path: tallies realized PnL, logs via the actor.
    pub fn ingest_execution(&self, event: ExecutionEvent) {
        if let ExecutionEvent::TradeUpdate {
            symbol,
            realized_pnl,
            ..
        } = &event
        {
            *self.realized_pnl.write().entry(symbol.clone()).or_default() += realized_pnl;
        }
        self.actor_for(event.symbol()).send_execution(event);
    }

    /// Replay execution-event path: routes without touching the PnL tally.
    pub fn ingest_execution_replay(&self, event: ExecutionEvent) {
        self.actor_for(event.symbol()).send_execution(event);
    }

    // -------------------------------------------------------------------------
    // Control surface
    // -------------------------------------------------------------------------

    /// Replace the execution symbol set. Dropped symbols get their open
    /// orders cancelled and their actor discarded; added symbols get an
    /// actor up front. The connector then refreshes subscriptions and
    /// re-syncs state.
    pub async fn set_execution_symbols(&self, symbols: Vec<String>) {
        let new_set: BTreeSet<String> = symbols.iter().cloned().collect();
        let old_set = std::mem::replace(&mut *self.execution_symbols.write(), new_set.clone());

        for dropped in old_set.difference(&new_set) {
            info!(symbol = %dropped, "execution symbol dropped");
            if let Err(e) = self.core.connector.cancel_all_open_orders(dropped).await {
                warn!(symbol = %dropped, error = %e, "failed to cancel orders for dropped symbol");
            }
            self.actors.write().remove(dropped);
            self.realized_pnl.write().remove(dropped);
        }

        for added in new_set.difference(&old_set) {
            info!(symbol = %added, "execution symbol added");
            self.actor_for(added);
        }

        if let Err(e) = self.core.connector.refresh_subscriptions(&symbols).await {
            warn!(error = %e, "failed to refresh connector subscriptions");
        }
        if let Err(e) = self.core.connector.sync_state().await {
            warn!(error = %e, "connector state sync failed");
        }
    }

    pub fn execution_symbols(&self) -> Vec<String> {
        self.execution_symbols.read().iter().cloned().collect()
    }

    /// SYSTEM_HALT every live actor (logger drop spikes, stream loss).
    pub fn halt_all(&self, reason: &str) {
        let actors = self.actors.read();
        warn!(reason, count = actors.len(), "halting all symbols");
        for (symbol, handle) in actors.iter() {
            handle.send_execution(ExecutionEvent::SystemHalt {
                symbol: symbol.clone(),
                event_time_ms: now_ms(),
                reason: reason.to_string(),
            });
        }
    }

    /// Wait until every actor has drained its queue.
    pub async fn flush(&self) {
        let handles: Vec<Arc<SymbolActorHandle>> =
            self.actors.read().values().cloned().collect();
        for handle in handles {
            handle.flush().await;
        }
    }

    /// Deep copies of all actor states, keyed by symbol.
    pub async fn state_snapshots(&self) -> BTreeMap<String, SymbolState> {
        let handles: Vec<Arc<SymbolActorHandle>> =
            self.actors.read().values().cloned().collect();
        let mut out = BTreeMap::new();
        for handle in handles {
            if let Some(state) = handle.snapshot().await {
                out.insert(handle.symbol().to_string(), state);
            }
        }
        out
    }

    pub fn realized_pnl(&self) -> RealizedPnlBySymbol {
        self.realized_pnl.read().clone()
    }

    /// Drop all actors, order metadata, and the decision ledger ahead of a
    /// replay run.
    pub fn reset_for_replay(&self) {
        self.actors.write().clear();
        self.core.clear_ledger_and_meta();
    }
}
