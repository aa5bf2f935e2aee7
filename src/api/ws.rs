// =============================================================================
// WebSocket Handler — per-symbol metric push
// =============================================================================
//
// Clients connect to `/ws?symbols=BTCUSDT,ETHUSDT` and receive one JSON
// message per broadcast for each requested symbol.  Connecting registers the
// symbols with the hub, which may widen the feed ingestor's exchange
// subscription; disconnecting unregisters them again.
//
// The handler also:
//   - Responds to Ping frames with Pong frames.
//   - Ignores client text (treated as heartbeat) and binary frames.
//   - Skips messages a slow client missed rather than disconnecting it.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::api::rest::ApiState;

#[derive(Deserialize)]
pub struct WsQuery {
    symbols: Option<String>,
}

/// Axum handler for the WebSocket upgrade request.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ApiState>>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    let symbols: Vec<String> = query
        .symbols
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect();

    if symbols.is_empty() {
        return (
            axum::http::StatusCode::BAD_REQUEST,
            "missing ?symbols=S1,S2",
        )
            .into_response();
    }

    info!(symbols = ?symbols, "WebSocket client connecting");
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state, symbols))
        .into_response()
}

/// Manage one client connection: forward hub messages, answer pings, clean
/// up the subscription on exit.
async fn handle_ws_connection(socket: WebSocket, state: Arc<ApiState>, symbols: Vec<String>) {
    let receivers = state.hub.subscribe(&symbols);

    // Funnel every symbol channel into one queue for this connection.
    let (merged_tx, mut merged_rx) = mpsc::unbounded_channel::<String>();
    let mut forwarders = Vec::with_capacity(receivers.len());
    for (symbol, mut rx) in receivers {
        let tx = merged_tx.clone();
        forwarders.push(tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => {
                        if tx.send(payload).is_err() {
                            return;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(symbol = %symbol, skipped, "slow WebSocket client skipped messages");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                }
            }
        }));
    }
    drop(merged_tx);

    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            payload = merged_rx.recv() => {
                match payload {
                    Some(json) => {
                        if let Err(e) = sender.send(Message::Text(json.into())).await {
                            debug!(error = %e, "WebSocket send failed — disconnecting");
                            break;
                        }
                    }
                    None => break,
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Text(_)) | Ok(Message::Pong(_)) | Ok(Message::Binary(_))) => {
                        // Heartbeats and stray frames are ignored.
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("WebSocket client closed");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket receive error — disconnecting");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    for task in forwarders {
        task.abort();
    }
    state.hub.unsubscribe(&symbols);
    info!(symbols = ?symbols, "WebSocket client cleaned up");
}
