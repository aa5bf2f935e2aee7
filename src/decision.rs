// =============================================================================
// Decision Engine — pure mapping from gated metrics + state to actions
// =============================================================================
//
// Every metric envelope that reaches a symbol actor is turned into an
// ordered action list here.  The function is pure: it reads only its
// arguments, so identical logged inputs always replay to identical records.
//
// Rule order:
//   1. Gate failure short-circuits to NOOP.
//   2. Halted with a working entry order prepends a cancel.
//   3. Flat book of rules (no position): guards, then a directional probe
//      sized off delta-Z sign and expected market price.
//   4. Open position: terminal exits first-match-wins, then add-to-winner.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::actor::SymbolState;
use crate::config::CapitalSettings;
use crate::gate::GateResult;
use crate::types::{MetricsEnvelope, PositionSide, Quotes, Side};

/// Z-score magnitude beyond which flow is considered reversing.
const REVERSAL_DELTA_Z: f64 = 3.0;
/// CVD slope magnitude confirming a reversal.
const REVERSAL_CVD_SLOPE: f64 = 0.5;
/// Peak PnL that arms the profit lock.
const PROFIT_LOCK_ARM_PCT: f64 = 0.5;
/// Give-back from peak that triggers the profit lock.
const PROFIT_LOCK_DRAWDOWN_PCT: f64 = 0.2;
/// Unrealized PnL required before adding to a winner.
const ADD_MIN_PNL_PCT: f64 = 0.10;
/// Maximum adds per position.
pub const MAX_ADDS: u32 = 2;
/// Latency samples required before the emergency exec-quality exit can fire.
const EXEC_QUALITY_MIN_SAMPLES: usize = 3;

/// One trading intent produced by the decision engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum DecisionAction {
    #[serde(rename = "NOOP")]
    Noop {
        symbol: String,
        event_time_ms: i64,
        reason: String,
    },
    #[serde(rename = "ENTRY_PROBE")]
    EntryProbe {
        symbol: String,
        event_time_ms: i64,
        reason: String,
        side: Side,
        quantity: f64,
        reduce_only: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expected_price: Option<f64>,
    },
    #[serde(rename = "ADD_POSITION")]
    AddPosition {
        symbol: String,
        event_time_ms: i64,
        reason: String,
        side: Side,
        quantity: f64,
        reduce_only: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expected_price: Option<f64>,
    },
    #[serde(rename = "EXIT_MARKET")]
    ExitMarket {
        symbol: String,
        event_time_ms: i64,
        reason: String,
        side: Side,
        quantity: f64,
        reduce_only: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expected_price: Option<f64>,
    },
    #[serde(rename = "CANCEL_OPEN_ENTRY_ORDERS")]
    CancelOpenEntryOrders {
        symbol: String,
        event_time_ms: i64,
        reason: String,
    },
}

impl DecisionAction {
    pub fn is_noop(&self) -> bool {
        matches!(self, Self::Noop { .. })
    }

    pub fn reason(&self) -> &str {
        match self {
            Self::Noop { reason, .. }
            | Self::EntryProbe { reason, .. }
            | Self::AddPosition { reason, .. }
            | Self::ExitMarket { reason, .. }
            | Self::CancelOpenEntryOrders { reason, .. } => reason,
        }
    }
}

/// Immutable record of one decision: the inputs, the action list, and a deep
/// state snapshot taken at decision time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub symbol: String,
    pub canonical_time_ms: i64,
    pub exchange_event_time_ms: i64,
    pub gate: GateResult,
    pub actions: Vec<DecisionAction>,
    pub state: SymbolState,
}

/// Inputs to one evaluation.
pub struct DecisionContext<'a> {
    pub symbol: &'a str,
    pub event_time_ms: i64,
    pub gate: &'a GateResult,
    pub envelope: &'a MetricsEnvelope,
    pub state: &'a SymbolState,
    /// Resolved best bid/ask for expected-price computation.
    pub quotes: Quotes,
    pub capital: &'a CapitalSettings,
}

/// Post-exit entry cooldown: scales with how violent the exit context was.
pub fn cooldown_ms(delta_z: f64, prints_per_second: f64, min_ms: i64, max_ms: i64) -> i64 {
    let raw = (200.0 * (delta_z.abs() + prints_per_second / 10.0)).round() as i64;
    raw.clamp(min_ms, max_ms)
}

/// Round an order quantity to six decimals.
pub fn round_qty(qty: f64) -> f64 {
    (qty * 1e6).round() / 1e6
}

fn direction_of(delta_z: f64) -> Option<Side> {
    if !delta_z.is_finite() || delta_z == 0.0 {
        None
    } else if delta_z > 0.0 {
        Some(Side::Buy)
    } else {
        Some(Side::Sell)
    }
}

fn matches_position(side: PositionSide, delta_z: f64) -> bool {
    match side {
        PositionSide::Long => delta_z > 0.0,
        PositionSide::Short => delta_z < 0.0,
    }
}

/// Stateless decision evaluator.
pub struct DecisionEngine;

impl DecisionEngine {
    /// Produce the ordered action list for one envelope. Never returns an
    /// empty list: a decision with nothing to do is an explicit NOOP.
    pub fn evaluate(ctx: &DecisionContext) -> Vec<DecisionAction> {
        let noop = |reason: String| DecisionAction::Noop {
            symbol: ctx.symbol.to_string(),
            event_time_ms: ctx.event_time_ms,
            reason,
        };

        if !ctx.gate.passed {
            let reason = ctx
                .gate
                .reason
                .map(|r| r.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            return vec![noop(format!("gate_fail:{reason}"))];
        }

        let mut actions = Vec::new();

        if ctx.state.halted && ctx.state.has_open_entry_order {
            actions.push(DecisionAction::CancelOpenEntryOrders {
                symbol: ctx.symbol.to_string(),
                event_time_ms: ctx.event_time_ms,
                reason: "halted_with_open_entry".to_string(),
            });
        }

        let flow = ctx.envelope.flow.as_ref();
        let delta_z = flow.map(|m| m.delta_z).unwrap_or(f64::NAN);
        let cvd_slope = flow.map(|m| m.cvd_slope).unwrap_or(f64::NAN);

        match &ctx.state.position {
            None => {
                if ctx.state.halted {
                    actions.push(noop("halted".into()));
                } else if ctx.state.has_open_entry_order {
                    actions.push(noop("entry_order_pending".into()));
                } else if !ctx.state.open_orders.is_empty() {
                    actions.push(noop("open_orders_present".into()));
                } else if ctx.event_time_ms < ctx.state.cooldown_until_ms {
                    actions.push(noop("cooldown_active".into()));
                } else {
                    match direction_of(delta_z) {
                        None => actions.push(noop("no_directional_signal".into())),
                        Some(side) => match ctx.quotes.expected_for(side) {
                            None => actions.push(noop("no_expected_price".into())),
                            Some(expected) if expected > 0.0 => {
                                let qty = round_qty(
                                    ctx.capital.initial_margin_usdt * ctx.capital.max_leverage
                                        / expected,
                                );
                                if qty > 0.0 {
                                    actions.push(DecisionAction::EntryProbe {
                                        symbol: ctx.symbol.to_string(),
                                        event_time_ms: ctx.event_time_ms,
                                        reason: "probe_entry".to_string(),
                                        side,
                                        quantity: qty,
                                        reduce_only: false,
                                        expected_price: Some(expected),
                                    });
                                } else {
                                    actions.push(noop("qty_below_minimum".into()));
                                }
                            }
                            Some(_) => actions.push(noop("no_expected_price".into())),
                        },
                    }
                }
            }
            Some(pos) => {
                // Terminal exits, first match wins.
                let exit_reason = if pos.peak_pnl_pct > PROFIT_LOCK_ARM_PCT
                    && pos.peak_pnl_pct - pos.unrealized_pnl_pct > PROFIT_LOCK_DRAWDOWN_PCT
                {
                    Some("profit_lock_drawdown")
                } else if pos.side == PositionSide::Long
                    && delta_z < -REVERSAL_DELTA_Z
                    && cvd_slope < -REVERSAL_CVD_SLOPE
                {
                    Some("reversal_exit_long")
                } else if pos.side == PositionSide::Short
                    && delta_z > REVERSAL_DELTA_Z
                    && cvd_slope > REVERSAL_CVD_SLOPE
                {
                    Some("reversal_exit_short")
                } else if ctx.state.exec_quality.poor
                    && ctx.state.exec_quality.recent_latency_ms.len() >= EXEC_QUALITY_MIN_SAMPLES
                {
                    Some("emergency_exec_quality_exit")
                } else {
                    None
                };

                if let Some(reason) = exit_reason {
                    let side = pos.side.closing_side();
                    actions.push(DecisionAction::ExitMarket {
                        symbol: ctx.symbol.to_string(),
                        event_time_ms: ctx.event_time_ms,
                        reason: reason.to_string(),
                        side,
                        quantity: pos.qty,
                        reduce_only: true,
                        expected_price: ctx.quotes.expected_for(side),
                    });
                } else if !ctx.state.halted
                    && pos.adds_used < MAX_ADDS
                    && pos.unrealized_pnl_pct > ADD_MIN_PNL_PCT
                    && !ctx.state.exec_quality.poor
                    && matches_position(pos.side, delta_z)
                {
                    let side = match pos.side {
                        PositionSide::Long => Side::Buy,
                        PositionSide::Short => Side::Sell,
                    };
                    if let Some(expected) = ctx.quotes.expected_for(side).filter(|p| *p > 0.0) {
                        let qty = round_qty(
                            ctx.capital.initial_margin_usdt * ctx.capital.max_leverage / expected,
                        );
                        if qty > 0.0 {
                            actions.push(DecisionAction::AddPosition {
                                symbol: ctx.symbol.to_string(),
                                event_time_ms: ctx.event_time_ms,
                                reason: "add_to_winner".to_string(),
                                side,
                                quantity: qty,
                                reduce_only: false,
                                expected_price: Some(expected),
                            });
                        }
                    }
                }
            }
        }

        if actions.is_empty() {
            actions.push(noop("no_action".into()));
        }
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::{ExecQuality, Position};
    use crate::gate::{self, GateConfig, GateMode};
    use crate::types::FlowSnapshot;

    fn envelope(delta_z: f64, cvd_slope: f64) -> MetricsEnvelope {
        MetricsEnvelope {
            symbol: "BTCUSDT".into(),
            canonical_time_ms: 10_000,
            exchange_event_time_ms: 10_000,
            spread_pct: Some(0.01),
            prints_per_second: 4.0,
            best_bid: Some(100.0),
            best_ask: Some(100.1),
            flow: Some(FlowSnapshot {
                obi_weighted: 0.3,
                obi_deep: 0.3,
                obi_divergence: 0.0,
                delta_z,
                cvd_slope,
                oi_delta_1m: 0.0,
                oi_delta_5m: 0.0,
            }),
        }
    }

    fn passing_gate(env: &MetricsEnvelope) -> GateResult {
        gate::evaluate(env, &GateConfig { mode: GateMode::V1NoLatency, ..GateConfig::default() })
    }

    fn capital() -> CapitalSettings {
        CapitalSettings {
            initial_margin_usdt: 50.0,
            max_leverage: 10.0,
        }
    }

    fn quotes() -> Quotes {
        Quotes {
            best_bid: Some(100.0),
            best_ask: Some(100.1),
        }
    }

    fn evaluate(env: &MetricsEnvelope, gate: &GateResult, state: &SymbolState) -> Vec<DecisionAction> {
        let cap = capital();
        DecisionEngine::evaluate(&DecisionContext {
            symbol: "BTCUSDT",
            event_time_ms: env.exchange_event_time_ms,
            gate,
            envelope: env,
            state,
            quotes: quotes(),
            capital: &cap,
        })
    }

    fn long_position(upnl: f64, peak: f64) -> Position {
        Position {
            side: PositionSide::Long,
            qty: 5.0,
            entry_price: 100.0,
            unrealized_pnl_pct: upnl,
            adds_used: 0,
            peak_pnl_pct: peak,
        }
    }

    #[test]
    fn gate_fail_is_single_noop_with_reason() {
        let mut env = envelope(1.0, 0.2);
        env.flow = None;
        let gate = passing_gate(&env);
        assert!(!gate.passed);
        let state = SymbolState::new("BTCUSDT");
        let actions = evaluate(&env, &gate, &state);
        assert_eq!(actions.len(), 1);
        assert!(actions[0].is_noop());
        assert_eq!(actions[0].reason(), "gate_fail:missing_metrics");
    }

    #[test]
    fn flat_state_probes_in_delta_z_direction() {
        let env = envelope(1.5, 0.2);
        let gate = passing_gate(&env);
        let state = SymbolState::new("BTCUSDT");
        let actions = evaluate(&env, &gate, &state);
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            DecisionAction::EntryProbe { side, quantity, reduce_only, expected_price, .. } => {
                assert_eq!(*side, Side::Buy);
                // 50 * 10 / 100.1 rounded to 6 dp.
                assert!((quantity - round_qty(500.0 / 100.1)).abs() < 1e-12);
                assert!(!reduce_only);
                assert_eq!(*expected_price, Some(100.1));
            }
            other => panic!("expected EntryProbe, got {other:?}"),
        }
    }

    #[test]
    fn negative_delta_z_probes_short() {
        let env = envelope(-1.5, -0.2);
        let gate = passing_gate(&env);
        let state = SymbolState::new("BTCUSDT");
        let actions = evaluate(&env, &gate, &state);
        match &actions[0] {
            DecisionAction::EntryProbe { side, expected_price, .. } => {
                assert_eq!(*side, Side::Sell);
                assert_eq!(*expected_price, Some(100.0));
            }
            other => panic!("expected EntryProbe, got {other:?}"),
        }
    }

    #[test]
    fn cooldown_blocks_entry() {
        let env = envelope(1.5, 0.2);
        let gate = passing_gate(&env);
        let mut state = SymbolState::new("BTCUSDT");
        state.cooldown_until_ms = env.exchange_event_time_ms + 5_000;
        let actions = evaluate(&env, &gate, &state);
        assert_eq!(actions[0].reason(), "cooldown_active");
    }

    #[test]
    fn open_orders_block_entry() {
        let env = envelope(1.5, 0.2);
        let gate = passing_gate(&env);
        let mut state = SymbolState::new("BTCUSDT");
        state.open_orders.insert(
            "1".into(),
            crate::types::OpenOrder {
                order_id: "1".into(),
                client_order_id: None,
                side: Side::Sell,
                order_type: crate::types::OrderType::Limit,
                quantity: 1.0,
                price: Some(105.0),
                reduce_only: true,
                status: crate::types::OrderStatus::New,
            },
        );
        let actions = evaluate(&env, &gate, &state);
        assert_eq!(actions[0].reason(), "open_orders_present");
    }

    #[test]
    fn halted_with_entry_order_prepends_cancel() {
        let env = envelope(1.5, 0.2);
        let gate = passing_gate(&env);
        let mut state = SymbolState::new("BTCUSDT");
        state.halted = true;
        state.has_open_entry_order = true;
        let actions = evaluate(&env, &gate, &state);
        assert!(matches!(
            actions[0],
            DecisionAction::CancelOpenEntryOrders { .. }
        ));
        assert_eq!(actions[1].reason(), "halted");
    }

    #[test]
    fn reversal_exit_long() {
        let env = envelope(-3.5, -0.6);
        let gate = passing_gate(&env);
        let mut state = SymbolState::new("BTCUSDT");
        state.position = Some(long_position(0.05, 0.05));
        let actions = evaluate(&env, &gate, &state);
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            DecisionAction::ExitMarket { side, reduce_only, reason, quantity, .. } => {
                assert_eq!(*side, Side::Sell);
                assert!(reduce_only);
                assert_eq!(reason, "reversal_exit_long");
                assert!((quantity - 5.0).abs() < f64::EPSILON);
            }
            other => panic!("expected ExitMarket, got {other:?}"),
        }
    }

    #[test]
    fn reversal_exit_short_is_symmetric() {
        let env = envelope(3.5, 0.6);
        let gate = passing_gate(&env);
        let mut state = SymbolState::new("BTCUSDT");
        state.position = Some(Position {
            side: PositionSide::Short,
            ..long_position(0.05, 0.05)
        });
        let actions = evaluate(&env, &gate, &state);
        match &actions[0] {
            DecisionAction::ExitMarket { side, reason, .. } => {
                assert_eq!(*side, Side::Buy);
                assert_eq!(reason, "reversal_exit_short");
            }
            other => panic!("expected ExitMarket, got {other:?}"),
        }
    }

    #[test]
    fn profit_lock_drawdown_beats_reversal() {
        let env = envelope(-3.5, -0.6);
        let gate = passing_gate(&env);
        let mut state = SymbolState::new("BTCUSDT");
        state.position = Some(long_position(0.25, 0.6));
        let actions = evaluate(&env, &gate, &state);
        assert_eq!(actions[0].reason(), "profit_lock_drawdown");
    }

    #[test]
    fn exec_quality_exit_requires_samples() {
        let env = envelope(0.5, 0.1);
        let gate = passing_gate(&env);
        let mut state = SymbolState::new("BTCUSDT");
        state.position = Some(long_position(0.02, 0.02));
        state.exec_quality = ExecQuality {
            poor: true,
            recent_latency_ms: vec![3000.0, 3000.0].into(),
            recent_slippage_bps: vec![].into(),
        };
        // Only two latency samples: not enough to exit.
        let actions = evaluate(&env, &gate, &state);
        assert!(actions[0].is_noop());

        state.exec_quality.recent_latency_ms.push_back(3000.0);
        let actions = evaluate(&env, &gate, &state);
        assert_eq!(actions[0].reason(), "emergency_exec_quality_exit");
    }

    #[test]
    fn add_to_winner_when_aligned_and_profitable() {
        let env = envelope(1.2, 0.3);
        let gate = passing_gate(&env);
        let mut state = SymbolState::new("BTCUSDT");
        state.position = Some(long_position(0.15, 0.15));
        let actions = evaluate(&env, &gate, &state);
        match &actions[0] {
            DecisionAction::AddPosition { side, reduce_only, .. } => {
                assert_eq!(*side, Side::Buy);
                assert!(!reduce_only);
            }
            other => panic!("expected AddPosition, got {other:?}"),
        }
    }

    #[test]
    fn adds_bounded_at_two() {
        let env = envelope(1.2, 0.3);
        let gate = passing_gate(&env);
        let mut state = SymbolState::new("BTCUSDT");
        state.position = Some(Position {
            adds_used: MAX_ADDS,
            ..long_position(0.15, 0.15)
        });
        let actions = evaluate(&env, &gate, &state);
        assert!(actions[0].is_noop());
    }

    #[test]
    fn no_add_against_position_direction() {
        let env = envelope(-1.2, -0.3);
        let gate = passing_gate(&env);
        let mut state = SymbolState::new("BTCUSDT");
        state.position = Some(long_position(0.15, 0.15));
        let actions = evaluate(&env, &gate, &state);
        assert!(actions[0].is_noop());
    }

    #[test]
    fn cooldown_formula_clamps() {
        assert_eq!(cooldown_ms(0.0, 0.0, 2_000, 30_000), 2_000);
        // 200 * (3.5 + 40/10) = 1500 -> clamped up to min.
        assert_eq!(cooldown_ms(3.5, 40.0, 2_000, 30_000), 2_000);
        // 200 * (10 + 100) = 22_000 within bounds.
        assert_eq!(cooldown_ms(10.0, 1_000.0, 2_000, 30_000), 22_000);
        // Huge inputs clamp to max.
        assert_eq!(cooldown_ms(500.0, 0.0, 2_000, 30_000), 30_000);
    }

    #[test]
    fn qty_rounding_six_decimals() {
        assert!((round_qty(0.12345678) - 0.123457).abs() < 1e-12);
        assert!((round_qty(1.0) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn zero_delta_z_is_no_signal() {
        let env = envelope(0.0, 0.0);
        // Zero delta-z still passes the gate (finite), but gives no side.
        let gate = passing_gate(&env);
        assert!(gate.passed);
        let state = SymbolState::new("BTCUSDT");
        let actions = evaluate(&env, &gate, &state);
        assert_eq!(actions[0].reason(), "no_directional_signal");
    }
}
