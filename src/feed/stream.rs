// =============================================================================
// Exchange ticker streams — WebSocket mids feeding the PriceFeed
// =============================================================================
//
// One task per exchange, each connecting to the public ticker stream for all
// four underlyings. Tasks run until the stream disconnects or errors, then
// return so the caller (main.rs) can reconnect after a short sleep.
//
// A slow REST poller fetches the Binance perpetual funding rate per crypto.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use tokio_tungstenite::connect_async;
use tracing::{debug, info, warn};

use crate::feed::PriceFeed;
use crate::types::Crypto;

/// Parse a JSON value that may be either a string or a number into `f64`.
fn parse_json_f64(val: &serde_json::Value, name: &str) -> Result<f64> {
    match val {
        serde_json::Value::String(s) => s
            .parse::<f64>()
            .with_context(|| format!("failed to parse {name} as f64: {s}")),
        serde_json::Value::Number(n) => n
            .as_f64()
            .with_context(|| format!("field {name} is not a valid f64")),
        _ => anyhow::bail!("field {name} has unexpected JSON type"),
    }
}

// =============================================================================
// Binance — combined bookTicker stream
// =============================================================================

fn binance_stream_url() -> String {
    let streams: Vec<String> = Crypto::ALL
        .iter()
        .map(|c| format!("{}@bookTicker", c.exchange_symbol().to_lowercase()))
        .collect();
    format!(
        "wss://stream.binance.com:9443/stream?streams={}",
        streams.join("/")
    )
}

/// Parse one combined-stream bookTicker message into `(crypto, mid)`.
fn parse_binance_ticker(text: &str) -> Result<(Crypto, f64)> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse bookTicker JSON")?;
    let data = if root.get("data").is_some() {
        &root["data"]
    } else {
        &root
    };

    let symbol = data["s"].as_str().context("missing field s")?;
    let crypto = Crypto::ALL
        .into_iter()
        .find(|c| c.exchange_symbol() == symbol)
        .with_context(|| format!("unexpected symbol {symbol}"))?;

    let bid = parse_json_f64(&data["b"], "b")?;
    let ask = parse_json_f64(&data["a"], "a")?;
    Ok((crypto, (bid + ask) / 2.0))
}

/// Connect to the Binance bookTicker stream and feed mids until disconnect.
pub async fn run_binance_ticker(feed: &Arc<PriceFeed>) -> Result<()> {
    let url = binance_stream_url();
    info!(url = %url, "connecting to binance ticker stream");

    let (ws_stream, _response) = connect_async(&url)
        .await
        .context("failed to connect to binance ticker stream")?;
    info!("binance ticker stream connected");

    let (_write, mut read) = ws_stream.split();
    loop {
        match read.next().await {
            Some(Ok(msg)) => {
                if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                    match parse_binance_ticker(&text) {
                        Ok((crypto, mid)) => {
                            debug!(crypto = %crypto, mid, "binance mid");
                            feed.record_mid(crypto, "binance", mid);
                        }
                        Err(e) => warn!(error = %e, "failed to parse binance ticker"),
                    }
                }
            }
            Some(Err(e)) => return Err(e.into()),
            None => {
                warn!("binance ticker stream ended");
                return Ok(());
            }
        }
    }
}

// =============================================================================
// Coinbase — ticker channel
// =============================================================================

fn coinbase_product(crypto: Crypto) -> String {
    format!("{}-USD", crypto.slug().to_uppercase())
}

fn coinbase_subscribe_message() -> String {
    let products: Vec<String> = Crypto::ALL.iter().map(|c| coinbase_product(*c)).collect();
    serde_json::json!({
        "type": "subscribe",
        "product_ids": products,
        "channels": ["ticker"],
    })
    .to_string()
}

/// Parse a Coinbase ticker message into `(crypto, mid)`. Non-ticker messages
/// (subscription acks, heartbeats) return `Ok(None)`.
fn parse_coinbase_ticker(text: &str) -> Result<Option<(Crypto, f64)>> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse coinbase JSON")?;

    if root["type"].as_str() != Some("ticker") {
        return Ok(None);
    }

    let product = root["product_id"].as_str().context("missing product_id")?;
    let slug = product.split('-').next().unwrap_or("");
    let Some(crypto) = Crypto::from_slug(slug) else {
        return Ok(None);
    };

    let bid = parse_json_f64(&root["best_bid"], "best_bid")?;
    let ask = parse_json_f64(&root["best_ask"], "best_ask")?;
    Ok(Some((crypto, (bid + ask) / 2.0)))
}

/// Connect to the Coinbase ticker channel and feed mids until disconnect.
pub async fn run_coinbase_ticker(feed: &Arc<PriceFeed>) -> Result<()> {
    use futures_util::SinkExt;

    let url = "wss://ws-feed.exchange.coinbase.com";
    info!(url, "connecting to coinbase ticker stream");

    let (ws_stream, _response) = connect_async(url)
        .await
        .context("failed to connect to coinbase ticker stream")?;
    let (mut write, mut read) = ws_stream.split();

    write
        .send(tokio_tungstenite::tungstenite::Message::Text(
            coinbase_subscribe_message(),
        ))
        .await
        .context("failed to send coinbase subscribe message")?;
    info!("coinbase ticker stream subscribed");

    loop {
        match read.next().await {
            Some(Ok(msg)) => {
                if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                    match parse_coinbase_ticker(&text) {
                        Ok(Some((crypto, mid))) => {
                            debug!(crypto = %crypto, mid, "coinbase mid");
                            feed.record_mid(crypto, "coinbase", mid);
                        }
                        Ok(None) => {}
                        Err(e) => warn!(error = %e, "failed to parse coinbase ticker"),
                    }
                }
            }
            Some(Err(e)) => return Err(e.into()),
            None => {
                warn!("coinbase ticker stream ended");
                return Ok(());
            }
        }
    }
}

// =============================================================================
// Kraken — v2 ticker channel
// =============================================================================

fn kraken_pair(crypto: Crypto) -> String {
    format!("{}/USD", crypto.slug().to_uppercase())
}

fn kraken_subscribe_message() -> String {
    let pairs: Vec<String> = Crypto::ALL.iter().map(|c| kraken_pair(*c)).collect();
    serde_json::json!({
        "method": "subscribe",
        "params": { "channel": "ticker", "symbol": pairs },
    })
    .to_string()
}

/// Parse a Kraken v2 ticker message into `(crypto, mid)`. Status/heartbeat
/// frames return `Ok(None)`.
fn parse_kraken_ticker(text: &str) -> Result<Option<(Crypto, f64)>> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse kraken JSON")?;

    if root["channel"].as_str() != Some("ticker") {
        return Ok(None);
    }
    let Some(entry) = root["data"].as_array().and_then(|a| a.first()) else {
        return Ok(None);
    };

    let pair = entry["symbol"].as_str().context("missing symbol")?;
    let slug = pair.split('/').next().unwrap_or("");
    let Some(crypto) = Crypto::from_slug(slug) else {
        return Ok(None);
    };

    let bid = parse_json_f64(&entry["bid"], "bid")?;
    let ask = parse_json_f64(&entry["ask"], "ask")?;
    Ok(Some((crypto, (bid + ask) / 2.0)))
}

/// Connect to the Kraken v2 ticker channel and feed mids until disconnect.
pub async fn run_kraken_ticker(feed: &Arc<PriceFeed>) -> Result<()> {
    use futures_util::SinkExt;

    let url = "wss://ws.kraken.com/v2";
    info!(url, "connecting to kraken ticker stream");

    let (ws_stream, _response) = connect_async(url)
        .await
        .context("failed to connect to kraken ticker stream")?;
    let (mut write, mut read) = ws_stream.split();

    write
        .send(tokio_tungstenite::tungstenite::Message::Text(
            kraken_subscribe_message(),
        ))
        .await
        .context("failed to send kraken subscribe message")?;
    info!("kraken ticker stream subscribed");

    loop {
        match read.next().await {
            Some(Ok(msg)) => {
                if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                    match parse_kraken_ticker(&text) {
                        Ok(Some((crypto, mid))) => {
                            debug!(crypto = %crypto, mid, "kraken mid");
                            feed.record_mid(crypto, "kraken", mid);
                        }
                        Ok(None) => {}
                        Err(e) => warn!(error = %e, "failed to parse kraken ticker"),
                    }
                }
            }
            Some(Err(e)) => return Err(e.into()),
            None => {
                warn!("kraken ticker stream ended");
                return Ok(());
            }
        }
    }
}

// =============================================================================
// Funding-rate poller
// =============================================================================

/// Fetch the latest perpetual funding rate for one crypto.
async fn fetch_funding_rate(client: &reqwest::Client, crypto: Crypto) -> Result<f64> {
    let url = format!(
        "https://fapi.binance.com/fapi/v1/fundingRate?symbol={}&limit=1",
        crypto.exchange_symbol()
    );

    let resp = client
        .get(&url)
        .send()
        .await
        .with_context(|| format!("GET funding rate for {crypto}"))?;

    let status = resp.status();
    let body: serde_json::Value = resp
        .json()
        .await
        .context("failed to parse funding rate response")?;

    if !status.is_success() {
        anyhow::bail!("funding rate API returned {status}: {body}");
    }

    let entry = body
        .as_array()
        .and_then(|a| a.first())
        .context("funding rate response array is empty")?;

    parse_json_f64(&entry["fundingRate"], "fundingRate")
}

/// Poll funding rates for all underlyings forever on a slow timer.
pub async fn run_funding_poller(feed: Arc<PriceFeed>, interval: Duration) {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .expect("failed to build reqwest client for funding poller");

    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        for crypto in Crypto::ALL {
            match fetch_funding_rate(&client, crypto).await {
                Ok(rate) => {
                    debug!(crypto = %crypto, rate, "funding rate updated");
                    feed.set_funding_rate(crypto, rate);
                }
                Err(e) => warn!(crypto = %crypto, error = %e, "funding rate fetch failed"),
            }
        }
    }
}
