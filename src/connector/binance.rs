// =============================================================================
// Binance Futures Connector — HMAC-SHA256 signed REST + user data stream
// =============================================================================
//
// SECURITY: The secret key is never logged or serialized. All signed
// requests carry X-MBX-APIKEY as a header and a recvWindow of 5 000 ms to
// tolerate minor clock drift against the venue.
//
// Besides the REST surface, the connector runs two background tasks:
//
//   - a book-ticker stream keeping the expected-price cache current;
//   - the user data stream (listen key) translating raw venue events into
//     typed ExecutionEvents.  A disconnect emits SYSTEM_HALT for every
//     tracked symbol; a successful reconnect re-syncs state and emits
//     SYSTEM_RESUME.
//
// A process-wide exchange-info cache (1 h TTL) provides quantity step sizes;
// its only write path is the fetch-on-miss below.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use hmac::{Hmac, Mac};
use parking_lot::{Mutex, RwLock};
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::connector::{ExecutionConnector, PlaceOrderRequest, PlacedOrder};
use crate::types::{
    now_ms, ExecutionEvent, OpenOrder, OrderStatus, OrderType, Side,
};

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;
/// Exchange-info cache TTL.
const EXCHANGE_INFO_TTL: Duration = Duration::from_secs(3600);
/// Listen-key keepalive cadence (venue expires keys after 60 min).
const LISTEN_KEY_KEEPALIVE_SECS: u64 = 1800;
/// Reconnect delay for both background streams.
const STREAM_RECONNECT_SECS: u64 = 5;

/// Quantity/price rounding steps for one symbol.
#[derive(Debug, Clone, Copy)]
struct SymbolFilters {
    step_size: f64,
}

/// Process-wide exchange-info cache with a 1 h TTL.
struct ExchangeInfoCache {
    entries: RwLock<HashMap<String, (Instant, SymbolFilters)>>,
}

impl ExchangeInfoCache {
    fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn get(&self, symbol: &str) -> Option<SymbolFilters> {
        let entries = self.entries.read();
        let (at, filters) = entries.get(symbol)?;
        if at.elapsed() > EXCHANGE_INFO_TTL {
            return None;
        }
        Some(*filters)
    }

    fn put(&self, symbol: &str, filters: SymbolFilters) {
        self.entries
            .write()
            .insert(symbol.to_string(), (Instant::now(), filters));
    }
}

/// Binance USDⓈ-M futures connector.
pub struct BinanceFuturesConnector {
    api_key: String,
    secret: String,
    base_url: String,
    ws_base_url: String,
    client: reqwest::Client,
    /// symbol -> (best bid, best ask) from the book-ticker stream.
    tickers: RwLock<HashMap<String, (f64, f64)>>,
    tracked_tx: watch::Sender<Vec<String>>,
    connected: AtomicBool,
    events_tx: mpsc::UnboundedSender<ExecutionEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ExecutionEvent>>>,
    exchange_info: ExchangeInfoCache,
}

impl BinanceFuturesConnector {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Create a new connector.
    ///
    /// # Arguments
    /// * `api_key` — venue API key (sent as a header, never in query params).
    /// * `secret`  — secret key used exclusively for HMAC signing.
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>) -> Arc<Self> {
        let api_key = api_key.into();
        let secret = secret.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (tracked_tx, _) = watch::channel(Vec::new());

        debug!("BinanceFuturesConnector initialised (base_url=https://fapi.binance.com)");

        Arc::new(Self {
            api_key,
            secret,
            base_url: "https://fapi.binance.com".to_string(),
            ws_base_url: "wss://fstream.binance.com".to_string(),
            client,
            tickers: RwLock::new(HashMap::new()),
            tracked_tx,
            connected: AtomicBool::new(false),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            exchange_info: ExchangeInfoCache::new(),
        })
    }

    /// Spawn the book-ticker and user-data stream tasks.
    pub fn start(self: &Arc<Self>, symbols: &[String]) {
        let _ = self.tracked_tx.send(symbols.to_vec());

        let ticker_self = self.clone();
        tokio::spawn(async move {
            ticker_self.run_ticker_stream().await;
        });

        let user_self = self.clone();
        tokio::spawn(async move {
            user_self.run_user_stream().await;
        });
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// Produce an HMAC-SHA256 hex signature of `query`.
    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Current UNIX timestamp in milliseconds.
    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    /// Build the full query string for a signed request (appends timestamp,
    /// recvWindow, and signature).
    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    async fn signed_request(
        &self,
        method: reqwest::Method,
        path: &str,
        params: &str,
    ) -> Result<serde_json::Value> {
        let qs = self.signed_query(params);
        let url = format!("{}{}?{}", self.base_url, path, qs);

        let resp = self
            .client
            .request(method.clone(), &url)
            .send()
            .await
            .with_context(|| format!("{method} {path} request failed"))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse {path} response"))?;

        if !status.is_success() {
            anyhow::bail!("{} {} returned {}: {}", method, path, status, body);
        }
        Ok(body)
    }

    // -------------------------------------------------------------------------
    // Exchange info
    // -------------------------------------------------------------------------

    /// Quantity step for `symbol`, from cache or a fetch-on-miss.
    async fn symbol_filters(&self, symbol: &str) -> Option<SymbolFilters> {
        if let Some(filters) = self.exchange_info.get(symbol) {
            return Some(filters);
        }

        let url = format!("{}/fapi/v1/exchangeInfo?symbol={}", self.base_url, symbol);
        let body: serde_json::Value = self.client.get(&url).send().await.ok()?.json().await.ok()?;

        let filters = body["symbols"].as_array()?.first().map(|info| {
            let step_size = info["filters"]
                .as_array()
                .and_then(|fs| {
                    fs.iter()
                        .find(|f| f["filterType"] == "LOT_SIZE")
                        .and_then(|f| f["stepSize"].as_str())
                        .and_then(|s| s.parse::<f64>().ok())
                })
                .unwrap_or(0.0);
            SymbolFilters { step_size }
        })?;

        self.exchange_info.put(symbol, filters);
        debug!(symbol, step_size = filters.step_size, "exchange info cached");
        Some(filters)
    }

    fn round_to_step(quantity: f64, step: f64) -> f64 {
        if step <= 0.0 {
            return quantity;
        }
        (quantity / step).floor() * step
    }

    // -------------------------------------------------------------------------
    // Book ticker stream
    // -------------------------------------------------------------------------

    async fn run_ticker_stream(self: Arc<Self>) {
        let mut tracked_rx = self.tracked_tx.subscribe();
        loop {
            let symbols = tracked_rx.borrow_and_update().clone();
            if symbols.is_empty() {
                if tracked_rx.changed().await.is_err() {
                    return;
                }
                continue;
            }

            let streams: Vec<String> = symbols
                .iter()
                .map(|s| format!("{}@bookTicker", s.to_lowercase()))
                .collect();
            let url = format!("{}/stream?streams={}", self.ws_base_url, streams.join("/"));

            match connect_async(&url).await {
                Ok((ws_stream, _)) => {
                    info!(symbols = symbols.len(), "book ticker stream connected");
                    let (mut write, mut read) = ws_stream.split();
                    loop {
                        tokio::select! {
                            msg = read.next() => match msg {
                                Some(Ok(Message::Text(text))) => self.handle_ticker(&text),
                                Some(Ok(Message::Ping(data))) => {
                                    if write.send(Message::Pong(data)).await.is_err() {
                                        break;
                                    }
                                }
                                Some(Ok(_)) => {}
                                Some(Err(e)) => {
                                    warn!(error = %e, "book ticker read error");
                                    break;
                                }
                                None => break,
                            },
                            changed = tracked_rx.changed() => {
                                if changed.is_err() {
                                    return;
                                }
                                // Subscription set changed: reconnect.
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "book ticker connect failed");
                }
            }
            tokio::time::sleep(Duration::from_secs(STREAM_RECONNECT_SECS)).await;
        }
    }

    fn handle_ticker(&self, text: &str) {
        let Ok(root) = serde_json::from_str::<serde_json::Value>(text) else {
            return;
        };
        let data = if root.get("data").is_some() {
            &root["data"]
        } else {
            &root
        };
        let Some(symbol) = data["s"].as_str() else {
            return;
        };
        let bid = data["b"].as_str().and_then(|s| s.parse::<f64>().ok());
        let ask = data["a"].as_str().and_then(|s| s.parse::<f64>().ok());
        if let (Some(bid), Some(ask)) = (bid, ask) {
            self.tickers.write().insert(symbol.to_string(), (bid, ask));
        }
    }

    // -------------------------------------------------------------------------
    // User data stream
    // -------------------------------------------------------------------------

    async fn listen_key(&self) -> Result<String> {
        let url = format!("{}/fapi/v1/listenKey", self.base_url);
        let resp = self
            .client
            .post(&url)
            .send()
            .await
            .context("POST /fapi/v1/listenKey request failed")?;
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse listenKey response")?;
        body["listenKey"]
            .as_str()
            .map(|s| s.to_string())
            .context("listenKey missing in response")
    }

    async fn keepalive_listen_key(&self) -> Result<()> {
        let url = format!("{}/fapi/v1/listenKey", self.base_url);
        self.client
            .put(&url)
            .send()
            .await
            .context("PUT /fapi/v1/listenKey request failed")?;
        Ok(())
    }

    async fn run_user_stream(self: Arc<Self>) {
        if self.api_key.is_empty() {
            warn!("no API key configured — user data stream disabled");
            return;
        }

        loop {
            let listen_key = match self.listen_key().await {
                Ok(k) => k,
                Err(e) => {
                    error!(error = %e, "failed to obtain listen key");
                    tokio::time::sleep(Duration::from_secs(STREAM_RECONNECT_SECS)).await;
                    continue;
                }
            };

            let url = format!("{}/ws/{}", self.ws_base_url, listen_key);
            match connect_async(&url).await {
                Ok((ws_stream, _)) => {
                    info!("user data stream connected");
                    self.connected.store(true, Ordering::SeqCst);

                    // Fresh state + resume for every tracked symbol.
                    if let Err(e) = self.sync_state().await {
                        warn!(error = %e, "state sync after connect failed");
                    }
                    for symbol in self.tracked_tx.borrow().iter() {
                        let _ = self.events_tx.send(ExecutionEvent::SystemResume {
                            symbol: symbol.clone(),
                            event_time_ms: now_ms(),
                        });
                    }

                    let (mut write, mut read) = ws_stream.split();
                    let mut keepalive = tokio::time::interval(Duration::from_secs(
                        LISTEN_KEY_KEEPALIVE_SECS,
                    ));
                    keepalive.tick().await;

                    loop {
                        tokio::select! {
                            msg = read.next() => match msg {
                                Some(Ok(Message::Text(text))) => self.handle_user_event(&text),
                                Some(Ok(Message::Ping(data))) => {
                                    if write.send(Message::Pong(data)).await.is_err() {
                                        break;
                                    }
                                }
                                Some(Ok(_)) => {}
                                Some(Err(e)) => {
                                    error!(error = %e, "user data stream read error");
                                    break;
                                }
                                None => break,
                            },
                            _ = keepalive.tick() => {
                                if let Err(e) = self.keepalive_listen_key().await {
                                    warn!(error = %e, "listen key keepalive failed");
                                }
                            }
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, "user data stream connect failed");
                }
            }

            // Disconnected: halt every tracked symbol until resync.
            self.connected.store(false, Ordering::SeqCst);
            for symbol in self.tracked_tx.borrow().iter() {
                let _ = self.events_tx.send(ExecutionEvent::SystemHalt {
                    symbol: symbol.clone(),
                    event_time_ms: now_ms(),
                    reason: "user_stream_disconnect".to_string(),
                });
            }
            tokio::time::sleep(Duration::from_secs(STREAM_RECONNECT_SECS)).await;
        }
    }

    fn handle_user_event(&self, text: &str) {
        let Ok(root) = serde_json::from_str::<serde_json::Value>(text) else {
            warn!("unparseable user stream message");
            return;
        };

        match root["e"].as_str() {
            Some("ORDER_TRADE_UPDATE") => self.handle_order_trade_update(&root),
            Some("ACCOUNT_UPDATE") => self.handle_account_update(&root),
            Some("listenKeyExpired") => {
                warn!("listen key expired — stream will reconnect");
            }
            _ => {}
        }
    }

    fn handle_order_trade_update(&self, root: &serde_json::Value) {
        let o = &root["o"];
        let Some(symbol) = o["s"].as_str() else {
            return;
        };
        let event_time_ms = root["E"].as_i64().unwrap_or_else(now_ms);

        let order = OpenOrder {
            order_id: o["i"]
                .as_u64()
                .map(|v| v.to_string())
                .unwrap_or_default(),
            client_order_id: o["c"].as_str().map(|s| s.to_string()),
            side: if o["S"].as_str() == Some("SELL") {
                Side::Sell
            } else {
                Side::Buy
            },
            order_type: if o["o"].as_str() == Some("LIMIT") {
                OrderType::Limit
            } else {
                OrderType::Market
            },
            quantity: parse_num(&o["q"]),
            price: Some(parse_num(&o["p"])).filter(|p| *p > 0.0),
            reduce_only: o["R"].as_bool().unwrap_or(false),
            status: parse_status(o["X"].as_str().unwrap_or("NEW")),
        };
        let order_id = order.order_id.clone();

        let _ = self.events_tx.send(ExecutionEvent::OrderUpdate {
            symbol: symbol.to_string(),
            event_time_ms,
            order,
        });

        // A non-zero last fill also produces a trade update.
        let fill_qty = parse_num(&o["l"]);
        if fill_qty > 0.0 {
            let _ = self.events_tx.send(ExecutionEvent::TradeUpdate {
                symbol: symbol.to_string(),
                event_time_ms,
                order_id,
                fill_price: parse_num(&o["L"]),
                fill_qty,
                realized_pnl: parse_num(&o["rp"]),
            });
        }
    }

    fn handle_account_update(&self, root: &serde_json::Value) {
        let event_time_ms = root["E"].as_i64().unwrap_or_else(now_ms);
        let a = &root["a"];

        let wallet_balance = a["B"]
            .as_array()
            .and_then(|balances| {
                balances
                    .iter()
                    .find(|b| b["a"].as_str() == Some("USDT"))
                    .map(|b| parse_num(&b["wb"]))
            })
            .unwrap_or(0.0);
        let available_balance = a["B"]
            .as_array()
            .and_then(|balances| {
                balances
                    .iter()
                    .find(|b| b["a"].as_str() == Some("USDT"))
                    .map(|b| parse_num(&b["cw"]))
            })
            .unwrap_or(wallet_balance);

        let Some(positions) = a["P"].as_array() else {
            return;
        };
        for p in positions {
            let Some(symbol) = p["s"].as_str() else {
                continue;
            };
            let _ = self.events_tx.send(ExecutionEvent::AccountUpdate {
                symbol: symbol.to_string(),
                event_time_ms,
                available_balance,
                wallet_balance,
                position_amt: parse_num(&p["pa"]),
                entry_price: parse_num(&p["ep"]),
                unrealized_pnl: parse_num(&p["up"]),
            });
        }
    }
}

/// Parse a JSON value that may be either a decimal string or a number.
fn parse_num(value: &serde_json::Value) -> f64 {
    if let Some(s) = value.as_str() {
        s.parse().unwrap_or(0.0)
    } else {
        value.as_f64().unwrap_or(0.0)
    }
}

fn parse_status(status: &str) -> OrderStatus {
    match status {
        "PARTIALLY_FILLED" => OrderStatus::PartiallyFilled,
        "FILLED" => OrderStatus::Filled,
        "CANCELED" => OrderStatus::Canceled,
        "REJECTED" => OrderStatus::Rejected,
        "EXPIRED" => OrderStatus::Expired,
        _ => OrderStatus::New,
    }
}

#[async_trait]
impl ExecutionConnector for BinanceFuturesConnector {
    async fn place_order(&self, req: PlaceOrderRequest) -> Result<PlacedOrder> {
        let quantity = match self.symbol_filters(&req.symbol).await {
            Some(filters) => Self::round_to_step(req.quantity, filters.step_size),
            None => req.quantity,
        };
        if quantity <= 0.0 {
            anyhow::bail!("quantity rounds to zero for {}", req.symbol);
        }

        let mut params = format!(
            "symbol={}&side={}&type={}&quantity={}",
            req.symbol, req.side, req.order_type, quantity
        );
        if req.reduce_only {
            params.push_str("&reduceOnly=true");
        }
        if let Some(coid) = &req.client_order_id {
            params.push_str(&format!("&newClientOrderId={coid}"));
        }

        debug!(symbol = %req.symbol, side = %req.side, quantity, "placing order");
        let body = self
            .signed_request(reqwest::Method::POST, "/fapi/v1/order", &params)
            .await?;

        let order_id = body["orderId"]
            .as_u64()
            .map(|v| v.to_string())
            .context("order response missing orderId")?;
        debug!(symbol = %req.symbol, order_id = %order_id, "order placed");
        Ok(PlacedOrder { order_id })
    }

    async fn cancel_order(
        &self,
        symbol: &str,
        order_id: Option<&str>,
        client_order_id: Option<&str>,
    ) -> Result<()> {
        let params = match (order_id, client_order_id) {
            (Some(id), _) => format!("symbol={symbol}&orderId={id}"),
            (None, Some(coid)) => format!("symbol={symbol}&origClientOrderId={coid}"),
            (None, None) => anyhow::bail!("cancel_order needs an order id or client id"),
        };
        self.signed_request(reqwest::Method::DELETE, "/fapi/v1/order", &params)
            .await?;
        debug!(symbol, "order cancelled");
        Ok(())
    }

    async fn cancel_all_open_orders(&self, symbol: &str) -> Result<()> {
        let params = format!("symbol={symbol}");
        self.signed_request(
            reqwest::Method::DELETE,
            "/fapi/v1/allOpenOrders",
            &params,
        )
        .await?;
        info!(symbol, "all open orders cancelled");
        Ok(())
    }

    fn expected_price(
        &self,
        symbol: &str,
        side: Side,
        order_type: OrderType,
        limit: Option<f64>,
    ) -> Option<f64> {
        if order_type == OrderType::Limit {
            return limit;
        }
        let tickers = self.tickers.read();
        let &(bid, ask) = tickers.get(symbol)?;
        match side {
            Side::Buy => Some(ask),
            Side::Sell => Some(bid),
        }
    }

    async fn sync_state(&self) -> Result<()> {
        let account = self
            .signed_request(reqwest::Method::GET, "/fapi/v2/account", "")
            .await?;

        let available_balance = parse_num(&account["availableBalance"]);
        let wallet_balance = parse_num(&account["totalWalletBalance"]);
        let positions: HashMap<String, &serde_json::Value> = account["positions"]
            .as_array()
            .map(|ps| {
                ps.iter()
                    .filter_map(|p| p["symbol"].as_str().map(|s| (s.to_string(), p)))
                    .collect()
            })
            .unwrap_or_default();

        let symbols = self.tracked_tx.borrow().clone();
        for symbol in &symbols {
            let (position_amt, entry_price, unrealized_pnl) = positions
                .get(symbol)
                .map(|p| {
                    (
                        parse_num(&p["positionAmt"]),
                        parse_num(&p["entryPrice"]),
                        parse_num(&p["unrealizedProfit"]),
                    )
                })
                .unwrap_or((0.0, 0.0, 0.0));

            let _ = self.events_tx.send(ExecutionEvent::AccountUpdate {
                symbol: symbol.clone(),
                event_time_ms: now_ms(),
                available_balance,
                wallet_balance,
                position_amt,
                entry_price,
                unrealized_pnl,
            });

            let params = format!("symbol={symbol}");
            let open_orders = self
                .signed_request(reqwest::Method::GET, "/fapi/v1/openOrders", &params)
                .await?;
            let orders: Vec<OpenOrder> = open_orders
                .as_array()
                .map(|arr| {
                    arr.iter()
                        .map(|o| OpenOrder {
                            order_id: o["orderId"]
                                .as_u64()
                                .map(|v| v.to_string())
                                .unwrap_or_default(),
                            client_order_id: o["clientOrderId"].as_str().map(|s| s.to_string()),
                            side: if o["side"].as_str() == Some("SELL") {
                                Side::Sell
                            } else {
                                Side::Buy
                            },
                            order_type: if o["type"].as_str() == Some("LIMIT") {
                                OrderType::Limit
                            } else {
                                OrderType::Market
                            },
                            quantity: parse_num(&o["origQty"]),
                            price: Some(parse_num(&o["price"])).filter(|p| *p > 0.0),
                            reduce_only: o["reduceOnly"].as_bool().unwrap_or(false),
                            status: parse_status(o["status"].as_str().unwrap_or("NEW")),
                        })
                        .collect()
                })
                .unwrap_or_default();

            let _ = self.events_tx.send(ExecutionEvent::OpenOrdersSnapshot {
                symbol: symbol.clone(),
                event_time_ms: now_ms(),
                orders,
            });
        }
        info!(symbols = symbols.len(), "state synced from venue");
        Ok(())
    }

    async fn refresh_subscriptions(&self, symbols: &[String]) -> Result<()> {
        let _ = self.tracked_tx.send(symbols.to_vec());
        Ok(())
    }

    fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn take_event_stream(&self) -> Option<mpsc::UnboundedReceiver<ExecutionEvent>> {
        self.events_rx.lock().take()
    }
}

impl std::fmt::Debug for BinanceFuturesConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceFuturesConnector")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}
