// =============================================================================
// Execution Venue Connector — the orchestrator's only route to the venue
// =============================================================================
//
// The core depends on this trait alone: order placement/cancellation, a
// synchronous expected-price read off the connector's ticker cache, state
// sync, and a push stream of typed execution events.  The signed Binance
// futures implementation lives in `binance.rs`; replay and tests use
// [`NullConnector`].
// =============================================================================

pub mod binance;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::types::{ExecutionEvent, OrderType, Side};

/// Request for a new order.
#[derive(Debug, Clone)]
pub struct PlaceOrderRequest {
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: f64,
    pub reduce_only: bool,
    pub client_order_id: Option<String>,
}

/// Acknowledgement of a placed order.
#[derive(Debug, Clone)]
pub struct PlacedOrder {
    pub order_id: String,
}

/// Operations the engine requires from an execution venue.
#[async_trait]
pub trait ExecutionConnector: Send + Sync {
    async fn place_order(&self, req: PlaceOrderRequest) -> Result<PlacedOrder>;

    /// Cancel one order by venue id or client id.
    async fn cancel_order(
        &self,
        symbol: &str,
        order_id: Option<&str>,
        client_order_id: Option<&str>,
    ) -> Result<()>;

    async fn cancel_all_open_orders(&self, symbol: &str) -> Result<()>;

    /// Expected fill price from the ticker cache: best ask for market buys,
    /// best bid for market sells. `limit` passes through for LIMIT orders.
    fn expected_price(
        &self,
        symbol: &str,
        side: Side,
        order_type: OrderType,
        limit: Option<f64>,
    ) -> Option<f64>;

    /// Emit ACCOUNT_UPDATE + OPEN_ORDERS_SNAPSHOT for each tracked symbol.
    async fn sync_state(&self) -> Result<()>;

    /// Point the connector's market subscriptions at a new symbol set.
    async fn refresh_subscriptions(&self, symbols: &[String]) -> Result<()>;

    fn connected(&self) -> bool;

    /// Hand over the push-event receiver. Yields once; later calls return
    /// None.
    fn take_event_stream(&self) -> Option<mpsc::UnboundedReceiver<ExecutionEvent>>;
}

// =============================================================================
// NullConnector
// =============================================================================

/// Inert connector for replay runs and tests: orders are acknowledged with
/// synthetic ids and nothing touches the network.
pub struct NullConnector {
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ExecutionEvent>>>,
}

impl NullConnector {
    pub fn new() -> Self {
        let (_tx, rx) = mpsc::unbounded_channel();
        Self {
            events_rx: Mutex::new(Some(rx)),
        }
    }
}

impl Default for NullConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutionConnector for NullConnector {
    async fn place_order(&self, _req: PlaceOrderRequest) -> Result<PlacedOrder> {
        Ok(PlacedOrder {
            order_id: uuid::Uuid::new_v4().to_string(),
        })
    }

    async fn cancel_order(
        &self,
        _symbol: &str,
        _order_id: Option<&str>,
        _client_order_id: Option<&str>,
    ) -> Result<()> {
        Ok(())
    }

    async fn cancel_all_open_orders(&self, _symbol: &str) -> Result<()> {
        Ok(())
    }

    fn expected_price(
        &self,
        _symbol: &str,
        _side: Side,
        order_type: OrderType,
        limit: Option<f64>,
    ) -> Option<f64> {
        match order_type {
            OrderType::Limit => limit,
            OrderType::Market => None,
        }
    }

    async fn sync_state(&self) -> Result<()> {
        Ok(())
    }

    async fn refresh_subscriptions(&self, _symbols: &[String]) -> Result<()> {
        Ok(())
    }

    fn connected(&self) -> bool {
        false
    }

    fn take_event_stream(&self) -> Option<mpsc::UnboundedReceiver<ExecutionEvent>> {
        self.events_rx.lock().take()
    }
}
