// =============================================================================
// CLOB Client — HMAC-SHA256 signed venue REST API + settlement-chain RPC
// =============================================================================
//
// SECURITY: the API secret and private key are never logged or serialized.
// Every signed request carries the API key, passphrase, timestamp and an
// HMAC-SHA256 signature of `timestamp + method + path + body` as headers.
//
// Each endpoint sits behind its own circuit breaker; transient failures
// (timeouts, 5xx, 429) open it after repeated misses, business rejections do
// not.
// =============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{debug, warn};

use crate::config::Credentials;
use crate::gateway::circuit::CircuitBreaker;
use crate::gateway::{GatewayError, Market, MarketGateway, OrderFill, VenuePosition};
use crate::types::{epoch_of, Crypto, Position, EPOCH_SECS};

type HmacSha256 = Hmac<Sha256>;

/// Wall-clock deadline for every outbound call.
const REQUEST_TIMEOUT_SECS: u64 = 10;

struct Circuits {
    markets: CircuitBreaker,
    orders: CircuitBreaker,
    positions: CircuitBreaker,
    redeem: CircuitBreaker,
    balance: CircuitBreaker,
}

/// Signed REST client for the binary-markets venue plus the settlement chain.
pub struct ClobClient {
    creds: Credentials,
    base_url: String,
    client: reqwest::Client,
    circuits: Circuits,
}

impl ClobClient {
    pub fn new(creds: Credentials) -> Self {
        Self::with_base_url(creds, "https://clob.quorum-venue.example")
    }

    pub fn with_base_url(creds: Credentials, base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .expect("failed to build reqwest client");

        Self {
            creds,
            base_url: base_url.into(),
            client,
            circuits: Circuits {
                markets: CircuitBreaker::new("markets"),
                orders: CircuitBreaker::new("orders"),
                positions: CircuitBreaker::new("positions"),
                redeem: CircuitBreaker::new("redeem"),
                balance: CircuitBreaker::new("balance"),
            },
        }
    }

    // -------------------------------------------------------------------------
    // Signing
    // -------------------------------------------------------------------------

    /// HMAC-SHA256 hex signature of the canonical request string.
    fn sign(&self, payload: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.creds.api_secret.as_bytes())
            .expect("HMAC accepts any key size");
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Issue a signed request; returns `(status, body)`.
    async fn signed_request(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<(reqwest::StatusCode, serde_json::Value), GatewayError> {
        let ts = chrono::Utc::now().timestamp().to_string();
        let body_str = body
            .as_ref()
            .map(|b| b.to_string())
            .unwrap_or_default();
        let payload = format!("{ts}{method}{path}{body_str}");
        let signature = self.sign(&payload);

        let url = format!("{}{}", self.base_url, path);
        let mut req = self
            .client
            .request(method, &url)
            .header("QUORUM-API-KEY", &self.creds.api_key)
            .header("QUORUM-PASSPHRASE", &self.creds.api_passphrase)
            .header("QUORUM-TIMESTAMP", &ts)
            .header("QUORUM-SIGNATURE", &signature);
        if let Some(b) = body {
            req = req.json(&b);
        }

        let resp = req.send().await.map_err(map_reqwest_error)?;
        let status = resp.status();
        let json: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| GatewayError::Transient(format!("body parse: {e}")))?;
        Ok((status, json))
    }

    /// Unsigned JSON-RPC call against the settlement chain.
    async fn chain_call(
        &self,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, GatewayError> {
        let resp = self
            .client
            .post(&self.creds.chain_rpc_url)
            .json(&body)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = resp.status();
        let json: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| GatewayError::Transient(format!("body parse: {e}")))?;
        if !status.is_success() {
            return Err(error_from_status(status, &json));
        }
        Ok(json)
    }

    /// Run `call` behind `breaker`: skipped while open, success closes it,
    /// transient failures feed it.
    async fn guarded<T, F>(breaker: &CircuitBreaker, call: F) -> Result<T, GatewayError>
    where
        F: std::future::Future<Output = Result<T, GatewayError>>,
    {
        let now = chrono::Utc::now().timestamp();
        if !breaker.allows(now) {
            return Err(GatewayError::CircuitOpen);
        }
        match call.await {
            Ok(v) => {
                breaker.record_success();
                Ok(v)
            }
            Err(e) => {
                if e.is_transient() {
                    breaker.record_failure(chrono::Utc::now().timestamp());
                }
                Err(e)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

fn map_reqwest_error(e: reqwest::Error) -> GatewayError {
    if e.is_timeout() {
        GatewayError::Timeout
    } else {
        GatewayError::Transient(e.to_string())
    }
}

/// Map an HTTP error status + body to a categorised gateway error.
fn error_from_status(status: reqwest::StatusCode, body: &serde_json::Value) -> GatewayError {
    if status.as_u16() == 429 {
        return GatewayError::RateLimited;
    }
    if status.is_server_error() {
        return GatewayError::Transient(format!("{status}: {body}"));
    }
    // 4xx business rejections.
    let code = body["error"].as_str().unwrap_or("");
    if code == "insufficient_liquidity" {
        return GatewayError::InsufficientLiquidity;
    }
    let message = body["message"]
        .as_str()
        .map(str::to_string)
        .unwrap_or_else(|| format!("{status}: {body}"));
    GatewayError::Rejected(message)
}

// ---------------------------------------------------------------------------
// Response parsing
// ---------------------------------------------------------------------------

/// Parse a venue market slug of the form `btc-updown-15m-<start_ts>`.
fn parse_updown_slug(slug: &str) -> Option<(Crypto, i64)> {
    let lower = slug.to_ascii_lowercase();
    for crypto in Crypto::ALL {
        let prefix = format!("{}-updown-15m-", crypto.slug());
        if let Some(rest) = lower.strip_prefix(&prefix) {
            let start_ts = rest.split('-').next()?.parse::<i64>().ok()?;
            return Some((crypto, start_ts));
        }
    }
    None
}

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

fn parse_markets(body: &serde_json::Value, now_unix: i64) -> Vec<Market> {
    let Some(entries) = body["markets"].as_array().or_else(|| body.as_array()) else {
        return Vec::new();
    };

    let mut out = Vec::new();
    for entry in entries {
        let Some(slug) = entry["slug"].as_str() else {
            continue;
        };
        let Some((crypto, start_ts)) = parse_updown_slug(slug) else {
            continue;
        };
        let (Ok(up_ask), Ok(down_ask)) = (
            parse_json_f64(&entry["up_ask"], "up_ask"),
            parse_json_f64(&entry["down_ask"], "down_ask"),
        ) else {
            warn!(slug, "market entry missing ask prices — skipped");
            continue;
        };
        let (Some(up_token), Some(down_token)) =
            (entry["up_token"].as_str(), entry["down_token"].as_str())
        else {
            warn!(slug, "market entry missing token ids — skipped");
            continue;
        };

        out.push(Market {
            crypto,
            epoch: epoch_of(start_ts),
            up_token: up_token.to_string(),
            down_token: down_token.to_string(),
            up_ask,
            down_ask,
            secs_to_close: start_ts + EPOCH_SECS - now_unix,
        });
    }
    out
}

// ---------------------------------------------------------------------------
// MarketGateway implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl MarketGateway for ClobClient {
    async fn list_active_markets(&self) -> Result<Vec<Market>, GatewayError> {
        Self::guarded(&self.circuits.markets, async {
            let (status, body) = self
                .signed_request(reqwest::Method::GET, "/markets?tag=updown-15m", None)
                .await?;
            if !status.is_success() {
                return Err(error_from_status(status, &body));
            }
            let now = chrono::Utc::now().timestamp();
            let markets = parse_markets(&body, now);
            debug!(count = markets.len(), "active markets listed");
            Ok(markets)
        })
        .await
    }

    async fn place_order(&self, token_id: &str, size_usd: f64) -> Result<OrderFill, GatewayError> {
        Self::guarded(&self.circuits.orders, async {
            let body = serde_json::json!({
                "token_id": token_id,
                "size_usd": size_usd,
                "order_type": "market",
                "address": self.creds.wallet_address,
            });
            let (status, resp) = self
                .signed_request(reqwest::Method::POST, "/orders", Some(body))
                .await?;
            if !status.is_success() {
                return Err(error_from_status(status, &resp));
            }

            let shares = parse_json_f64(&resp["shares"], "shares")
                .map_err(|e| GatewayError::Rejected(e.to_string()))?;
            let entry_price = parse_json_f64(&resp["avg_price"], "avg_price")
                .map_err(|e| GatewayError::Rejected(e.to_string()))?;

            debug!(token_id, size_usd, shares, entry_price, "order filled");
            Ok(OrderFill {
                token_id: token_id.to_string(),
                shares,
                entry_price,
            })
        })
        .await
    }

    async fn read_positions(&self) -> Result<Vec<VenuePosition>, GatewayError> {
        Self::guarded(&self.circuits.positions, async {
            let (status, body) = self
                .signed_request(reqwest::Method::GET, "/positions", None)
                .await?;
            if !status.is_success() {
                return Err(error_from_status(status, &body));
            }

            let entries = body["positions"]
                .as_array()
                .cloned()
                .unwrap_or_default();
            let mut out = Vec::with_capacity(entries.len());
            for entry in &entries {
                let Some(token_id) = entry["token_id"].as_str() else {
                    continue;
                };
                let Ok(shares) = parse_json_f64(&entry["shares"], "shares") else {
                    continue;
                };
                out.push(VenuePosition {
                    token_id: token_id.to_string(),
                    shares,
                });
            }
            debug!(count = out.len(), "venue positions read");
            Ok(out)
        })
        .await
    }

    async fn redeem(&self, position: &Position) -> Result<f64, GatewayError> {
        Self::guarded(&self.circuits.redeem, async {
            let body = serde_json::json!({
                "method": "redeem_positions",
                "address": self.creds.wallet_address,
                "token_id": position.token_id,
                "shares": position.shares,
            });
            let resp = self.chain_call(body).await?;
            let amount = parse_json_f64(&resp["redeemed_usd"], "redeemed_usd")
                .map_err(|e| GatewayError::Transient(e.to_string()))?;
            debug!(token_id = %position.token_id, amount, "position redeemed");
            Ok(amount)
        })
        .await
    }

    async fn cash_balance(&self) -> Result<f64, GatewayError> {
        Self::guarded(&self.circuits.balance, async {
            let body = serde_json::json!({
                "method": "usdc_balance",
                "address": self.creds.wallet_address,
            });
            let resp = self.chain_call(body).await?;
            let balance = parse_json_f64(&resp["balance"], "balance")
                .map_err(|e| GatewayError::Transient(e.to_string()))?;
            debug!(balance, "chain cash balance read");
            Ok(balance)
        })
        .await
    }
}

impl std::fmt::Debug for ClobClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClobClient")
            .field("creds", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_parse_all_assets() {
        for crypto in Crypto::ALL {
            let slug = format!("{}-updown-15m-1704067200", crypto.slug());
            let (parsed, ts) = parse_updown_slug(&slug).unwrap();
            assert_eq!(parsed, crypto);
            assert_eq!(ts, 1_704_067_200);
        }
        assert!(parse_updown_slug("doge-updown-15m-1704067200").is_none());
        assert!(parse_updown_slug("btc-updown-15m-notanumber").is_none());
        assert!(parse_updown_slug("btc-updown-1h-1704067200").is_none());
    }

    #[test]
    fn markets_parse_and_skip_malformed() {
        let now = 1_704_067_200;
        let body = serde_json::json!({
            "markets": [
                {
                    "slug": "btc-updown-15m-1704067200",
                    "up_token": "tok-up",
                    "down_token": "tok-down",
                    "up_ask": "0.42",
                    "down_ask": 0.60
                },
                { "slug": "btc-updown-15m-1704067200" },
                { "slug": "unrelated-market" }
            ]
        });
        let markets = parse_markets(&body, now + 120);
        assert_eq!(markets.len(), 1);
        let m = &markets[0];
        assert_eq!(m.crypto, Crypto::Btc);
        assert_eq!(m.epoch, epoch_of(now));
        assert!((m.up_ask - 0.42).abs() < 1e-9);
        assert_eq!(m.secs_to_close, 780);
    }

    #[test]
    fn status_mapping() {
        let empty = serde_json::json!({});
        assert_eq!(
            error_from_status(reqwest::StatusCode::TOO_MANY_REQUESTS, &empty),
            GatewayError::RateLimited
        );
        assert!(matches!(
            error_from_status(reqwest::StatusCode::BAD_GATEWAY, &empty),
            GatewayError::Transient(_)
        ));
        let liq = serde_json::json!({ "error": "insufficient_liquidity" });
        assert_eq!(
            error_from_status(reqwest::StatusCode::BAD_REQUEST, &liq),
            GatewayError::InsufficientLiquidity
        );
        let rej = serde_json::json!({ "message": "size below minimum" });
        assert!(matches!(
            error_from_status(reqwest::StatusCode::BAD_REQUEST, &rej),
            GatewayError::Rejected(msg) if msg.contains("below minimum")
        ));
    }

    fn test_creds() -> Credentials {
        Credentials {
            wallet_address: "0xabc".into(),
            private_key: "pk".into(),
            api_key: "key".into(),
            api_secret: "secret".into(),
            api_passphrase: "phrase".into(),
            chain_rpc_url: "http://localhost:1".into(),
        }
    }

    #[test]
    fn signature_is_deterministic_hex() {
        let client = ClobClient::with_base_url(test_creds(), "http://localhost:1");
        let a = client.sign("1700000000GET/markets");
        let b = client.sign("1700000000GET/markets");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, client.sign("1700000001GET/markets"));
    }

    #[test]
    fn debug_redacts_credentials() {
        let client = ClobClient::with_base_url(test_creds(), "http://localhost:1");
        let dbg = format!("{client:?}");
        assert!(!dbg.contains("secret"));
        assert!(!dbg.contains("phrase"));
        assert!(dbg.contains("<redacted>"));
    }
}
