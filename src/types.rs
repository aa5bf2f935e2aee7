// =============================================================================
// Shared types used across the Orion orderflow engine
// =============================================================================

use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Taker side of a trade or order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    #[serde(rename = "BUY")]
    Buy,
    #[serde(rename = "SELL")]
    Sell,
}

impl Side {
    /// The opposite side (used when closing a position).
    pub fn flipped(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// Direction of an open position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionSide {
    #[serde(rename = "LONG")]
    Long,
    #[serde(rename = "SHORT")]
    Short,
}

impl PositionSide {
    /// Order side that closes a position of this direction.
    pub fn closing_side(self) -> Side {
        match self {
            Self::Long => Side::Sell,
            Self::Short => Side::Buy,
        }
    }
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

/// Supported order types on the execution venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    #[serde(rename = "MARKET")]
    Market,
    #[serde(rename = "LIMIT")]
    Limit,
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Market => write!(f, "MARKET"),
            Self::Limit => write!(f, "LIMIT"),
        }
    }
}

/// Venue order status. Terminal statuses remove the order from tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    #[serde(rename = "NEW")]
    New,
    #[serde(rename = "PARTIALLY_FILLED")]
    PartiallyFilled,
    #[serde(rename = "FILLED")]
    Filled,
    #[serde(rename = "CANCELED")]
    Canceled,
    #[serde(rename = "REJECTED")]
    Rejected,
    #[serde(rename = "EXPIRED")]
    Expired,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Filled | Self::Canceled | Self::Rejected | Self::Expired
        )
    }
}

// ---------------------------------------------------------------------------
// Market data
// ---------------------------------------------------------------------------

/// A single aggressive (taker) trade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub price: f64,
    pub quantity: f64,
    /// Taker side. The venue reports "buyer is maker"; maker-buy inverts to
    /// taker-sell.
    pub side: Side,
    pub event_time_ms: i64,
}

impl Trade {
    /// Signed quote volume: positive for taker buys, negative for taker sells.
    pub fn signed_volume(&self) -> f64 {
        let vol = self.price * self.quantity;
        match self.side {
            Side::Buy => vol,
            Side::Sell => -vol,
        }
    }
}

/// An incremental depth update from the diff stream.
///
/// `first_update_id`/`final_update_id` are the venue's `U`/`u` sequence pair.
/// A level with size 0 deletes that price.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepthDiff {
    pub first_update_id: u64,
    pub final_update_id: u64,
    pub bids: Vec<(Decimal, f64)>,
    pub asks: Vec<(Decimal, f64)>,
    pub event_time_ms: i64,
}

/// A full REST depth snapshot used to (re)seed the book.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepthSnapshot {
    pub last_update_id: u64,
    pub bids: Vec<(Decimal, f64)>,
    pub asks: Vec<(Decimal, f64)>,
}

// ---------------------------------------------------------------------------
// Derived metrics
// ---------------------------------------------------------------------------

/// Derived orderflow indicators for one symbol at one instant.
///
/// Serialized under the `legacyMetrics` key of the client payload for
/// dashboard compatibility.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowSnapshot {
    /// Distance-weighted order book imbalance in [-1, 1].
    pub obi_weighted: f64,
    /// Deep (top-20-level) order book imbalance in [-1, 1].
    pub obi_deep: f64,
    /// `obi_weighted - obi_deep`; surface pressure diverging from depth.
    pub obi_divergence: f64,
    /// Z-scored trade-side imbalance over the tape window.
    pub delta_z: f64,
    /// Normalized slope of cumulative volume delta over the tape window.
    pub cvd_slope: f64,
    /// Open interest change over the last minute (contracts).
    pub oi_delta_1m: f64,
    /// Open interest change over the last five minutes (contracts).
    pub oi_delta_5m: f64,
}

/// Best bid/ask pair used for expected-price resolution in decisions.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Quotes {
    pub best_bid: Option<f64>,
    pub best_ask: Option<f64>,
}

impl Quotes {
    /// Expected market fill price for an aggressive order of `side`:
    /// buys lift the ask, sells hit the bid.
    pub fn expected_for(&self, side: Side) -> Option<f64> {
        match side {
            Side::Buy => self.best_ask,
            Side::Sell => self.best_bid,
        }
    }
}

/// The per-symbol metric envelope fanned out to subscribers and fed to the
/// decision pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsEnvelope {
    pub symbol: String,
    /// Wall-clock receipt time at the broadcast boundary.
    pub canonical_time_ms: i64,
    /// Exchange event time carried on the triggering feed message.
    pub exchange_event_time_ms: i64,
    pub spread_pct: Option<f64>,
    pub prints_per_second: f64,
    pub best_bid: Option<f64>,
    pub best_ask: Option<f64>,
    /// None when the book is empty on either side.
    pub flow: Option<FlowSnapshot>,
}

// ---------------------------------------------------------------------------
// Execution events
// ---------------------------------------------------------------------------

/// An order as tracked in `SymbolState.open_orders`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenOrder {
    pub order_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_order_id: Option<String>,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    pub reduce_only: bool,
    pub status: OrderStatus,
}

/// Typed events pushed by the execution venue connector.
///
/// Every variant carries `symbol` and `event_time_ms`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ExecutionEvent {
    #[serde(rename = "ACCOUNT_UPDATE")]
    AccountUpdate {
        symbol: String,
        event_time_ms: i64,
        available_balance: f64,
        wallet_balance: f64,
        /// Signed position amount; 0 means flat.
        position_amt: f64,
        entry_price: f64,
        /// Venue-reported unrealized PnL in quote currency (USDT).
        unrealized_pnl: f64,
    },
    #[serde(rename = "ORDER_UPDATE")]
    OrderUpdate {
        symbol: String,
        event_time_ms: i64,
        order: OpenOrder,
    },
    #[serde(rename = "TRADE_UPDATE")]
    TradeUpdate {
        symbol: String,
        event_time_ms: i64,
        order_id: String,
        fill_price: f64,
        fill_qty: f64,
        realized_pnl: f64,
    },
    #[serde(rename = "OPEN_ORDERS_SNAPSHOT")]
    OpenOrdersSnapshot {
        symbol: String,
        event_time_ms: i64,
        orders: Vec<OpenOrder>,
    },
    #[serde(rename = "SYSTEM_HALT")]
    SystemHalt {
        symbol: String,
        event_time_ms: i64,
        reason: String,
    },
    #[serde(rename = "SYSTEM_RESUME")]
    SystemResume { symbol: String, event_time_ms: i64 },
}

impl ExecutionEvent {
    pub fn symbol(&self) -> &str {
        match self {
            Self::AccountUpdate { symbol, .. }
            | Self::OrderUpdate { symbol, .. }
            | Self::TradeUpdate { symbol, .. }
            | Self::OpenOrdersSnapshot { symbol, .. }
            | Self::SystemHalt { symbol, .. }
            | Self::SystemResume { symbol, .. } => symbol,
        }
    }

    pub fn event_time_ms(&self) -> i64 {
        match self {
            Self::AccountUpdate { event_time_ms, .. }
            | Self::OrderUpdate { event_time_ms, .. }
            | Self::TradeUpdate { event_time_ms, .. }
            | Self::OpenOrdersSnapshot { event_time_ms, .. }
            | Self::SystemHalt { event_time_ms, .. }
            | Self::SystemResume { event_time_ms, .. } => *event_time_ms,
        }
    }
}

/// Realized PnL tally keyed by symbol, exposed in health output.
pub type RealizedPnlBySymbol = HashMap<String, f64>;

/// Current UNIX time in milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_flip_and_display() {
        assert_eq!(Side::Buy.flipped(), Side::Sell);
        assert_eq!(Side::Sell.flipped(), Side::Buy);
        assert_eq!(Side::Buy.to_string(), "BUY");
        assert_eq!(PositionSide::Short.closing_side(), Side::Buy);
    }

    #[test]
    fn terminal_statuses() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Canceled.is_terminal());
        assert!(OrderStatus::Rejected.is_terminal());
        assert!(OrderStatus::Expired.is_terminal());
        assert!(!OrderStatus::New.is_terminal());
        assert!(!OrderStatus::PartiallyFilled.is_terminal());
    }

    #[test]
    fn signed_volume_sign_follows_taker_side() {
        let buy = Trade {
            price: 100.0,
            quantity: 2.0,
            side: Side::Buy,
            event_time_ms: 0,
        };
        let sell = Trade { side: Side::Sell, ..buy.clone() };
        assert!((buy.signed_volume() - 200.0).abs() < f64::EPSILON);
        assert!((sell.signed_volume() + 200.0).abs() < f64::EPSILON);
    }

    #[test]
    fn execution_event_tagged_serialization() {
        let ev = ExecutionEvent::SystemHalt {
            symbol: "BTCUSDT".into(),
            event_time_ms: 123,
            reason: "logger_drop_spike:200".into(),
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "SYSTEM_HALT");
        let back: ExecutionEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back.symbol(), "BTCUSDT");
        assert_eq!(back.event_time_ms(), 123);
    }

    #[test]
    fn quotes_expected_price_per_side() {
        let q = Quotes { best_bid: Some(10.0), best_ask: Some(11.0) };
        assert_eq!(q.expected_for(Side::Buy), Some(11.0));
        assert_eq!(q.expected_for(Side::Sell), Some(10.0));
    }
}
