// =============================================================================
// Open Interest Poller — periodic participation signal per symbol
// =============================================================================
//
// Open interest moves slowly; a 30 s REST poll per tracked symbol is plenty.
// Samples flow into the ingest task over a channel, where FlowMetrics turns
// them into the 1 m / 5 m deltas carried on every snapshot.

use std::collections::BTreeSet;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::feed::ingestor::OiSample;
use crate::types::now_ms;

/// Poll cadence.
const POLL_INTERVAL_SECS: u64 = 30;

/// Fetch the current open interest for one symbol.
async fn fetch_open_interest(
    client: &reqwest::Client,
    base_url: &str,
    symbol: &str,
) -> Result<f64> {
    let url = format!("{base_url}/fapi/v1/openInterest?symbol={symbol}");
    let resp = client
        .get(&url)
        .send()
        .await
        .with_context(|| format!("GET open interest for {symbol}"))?;

    let status = resp.status();
    let body: serde_json::Value = resp
        .json()
        .await
        .context("failed to parse open interest response")?;

    if !status.is_success() {
        anyhow::bail!("open interest API returned {}: {}", status, body);
    }

    let oi: f64 = body["openInterest"]
        .as_str()
        .context("open interest response missing openInterest")?
        .parse()
        .context("failed to parse openInterest value")?;
    Ok(oi)
}

/// Poll open interest for every required symbol until the channel closes.
pub async fn run_open_interest_poller(
    base_url: String,
    required_rx: watch::Receiver<BTreeSet<String>>,
    tx: mpsc::UnboundedSender<OiSample>,
) {
    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
    {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "failed to build open interest HTTP client");
            return;
        }
    };

    let mut interval = tokio::time::interval(Duration::from_secs(POLL_INTERVAL_SECS));
    loop {
        interval.tick().await;
        let symbols: Vec<String> = required_rx.borrow().iter().cloned().collect();
        for symbol in symbols {
            match fetch_open_interest(&client, &base_url, &symbol).await {
                Ok(oi) => {
                    debug!(symbol = %symbol, oi, "open interest fetched");
                    if tx.send((symbol, now_ms(), oi)).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "open interest poll failed");
                }
            }
        }
    }
}
