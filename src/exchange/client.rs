// =============================================================================
// Futures REST API Client — HMAC-SHA256 signed requests
// =============================================================================
//
// SECURITY: The secret key is never logged or serialized. All signed requests
// include X-MBX-APIKEY as a header and a recvWindow of 5 000 ms to tolerate
// minor clock drift between the engine and the exchange servers.
//
// Every response updates the shared rate-limit tracker from the usage
// headers, so all tasks observe the same budget.
// =============================================================================

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use tracing::{debug, instrument, warn};

use crate::exchange::models::{
    AccountTrade, AlgoOrder, AlgoOrderRequest, ExchangePosition, FundingInfo, OrderAck, OrderInfo,
    PremiumIndex, SymbolRules, TickerStats,
};
use crate::exchange::rate_limit::RateLimitTracker;
use crate::types::Kline;

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

/// Futures REST API client with HMAC-SHA256 request signing.
#[derive(Clone)]
pub struct ExchangeClient {
    api_key: String,
    secret: String,
    base_url: String,
    client: reqwest::Client,
    limiter: Arc<RateLimitTracker>,
}

impl ExchangeClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Create a new `ExchangeClient`.
    ///
    /// # Arguments
    /// * `api_key` — API key (sent as a header, never in query params).
    /// * `secret`  — secret key used exclusively for HMAC signing.
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>) -> Self {
        let api_key = api_key.into();
        let secret = secret.into();

        let mut default_headers = HeaderMap::new();
        // The API key header is required for all signed endpoints.
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        debug!("ExchangeClient initialised (base_url=https://fapi.binance.com)");

        Self {
            api_key,
            secret,
            base_url: "https://fapi.binance.com".to_string(),
            client,
            limiter: Arc::new(RateLimitTracker::new()),
        }
    }

    /// Override the base URL (testnet, mock server in tests).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// The shared rate-limit tracker. Monitor loops check its circuit before
    /// starting a cycle.
    pub fn limiter(&self) -> Arc<RateLimitTracker> {
        self.limiter.clone()
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// Produce an HMAC-SHA256 hex signature of `query`.
    pub fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Current UNIX timestamp in milliseconds.
    pub fn timestamp_ms() -> u64 {
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

    // -------------------------------------------------------------------------
    // Transport helpers
    // -------------------------------------------------------------------------

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        query: &str,
    ) -> Result<serde_json::Value> {
        let url = if query.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, query)
        };

        let resp = self
            .client
            .request(method.clone(), &url)
            .send()
            .await
            .with_context(|| format!("{method} {path} request failed"))?;

        self.limiter.update_from_headers(resp.headers());

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

    async fn signed_get(&self, path: &str, params: &str) -> Result<serde_json::Value> {
        self.request(reqwest::Method::GET, path, &self.signed_query(params))
            .await
    }

    async fn signed_post(&self, path: &str, params: &str) -> Result<serde_json::Value> {
        self.request(reqwest::Method::POST, path, &self.signed_query(params))
            .await
    }

    async fn signed_delete(&self, path: &str, params: &str) -> Result<serde_json::Value> {
        self.request(reqwest::Method::DELETE, path, &self.signed_query(params))
            .await
    }

    async fn public_get(&self, path: &str, params: &str) -> Result<serde_json::Value> {
        self.request(reqwest::Method::GET, path, params).await
    }

    // -------------------------------------------------------------------------
    // Market data
    // -------------------------------------------------------------------------

    /// GET /fapi/v1/premiumIndex — mark price and funding snapshot.
    #[instrument(skip(self), name = "exchange::get_premium_index")]
    pub async fn get_premium_index(&self, symbol: &str) -> Result<PremiumIndex> {
        let body = self
            .public_get("/fapi/v1/premiumIndex", &format!("symbol={symbol}"))
            .await?;

        Ok(PremiumIndex {
            symbol: body["symbol"].as_str().unwrap_or(symbol).to_string(),
            mark_price: Self::parse_str_f64(&body["markPrice"])?,
            last_funding_rate: Self::parse_str_f64(&body["lastFundingRate"]).unwrap_or(0.0),
            next_funding_time: body["nextFundingTime"].as_i64().unwrap_or(0),
        })
    }

    /// Current mark price for `symbol`.
    pub async fn get_mark_price(&self, symbol: &str) -> Result<f64> {
        Ok(self.get_premium_index(symbol).await?.mark_price)
    }

    /// Funding rate and next funding time for `symbol`.
    pub async fn get_funding(&self, symbol: &str) -> Result<FundingInfo> {
        let idx = self.get_premium_index(symbol).await?;
        Ok(FundingInfo {
            rate: idx.last_funding_rate,
            next_funding_time: idx.next_funding_time,
        })
    }

    /// GET /fapi/v1/klines (public — no signature required).
    ///
    /// Array indices:
    ///   [0] openTime, [1] open, [2] high, [3] low, [4] close, [5] volume,
    ///   [6] closeTime, ...
    #[instrument(skip(self), name = "exchange::get_klines")]
    pub async fn get_klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Kline>> {
        let body = self
            .public_get(
                "/fapi/v1/klines",
                &format!("symbol={symbol}&interval={interval}&limit={limit}"),
            )
            .await?;

        let raw = body.as_array().context("klines response is not an array")?;

        let mut klines = Vec::with_capacity(raw.len());
        for entry in raw {
            let arr = entry.as_array().context("kline entry is not an array")?;
            if arr.len() < 7 {
                warn!("skipping malformed kline entry with {} elements", arr.len());
                continue;
            }

            klines.push(Kline::new(
                arr[0].as_i64().unwrap_or(0),
                Self::parse_str_f64(&arr[1])?,
                Self::parse_str_f64(&arr[2])?,
                Self::parse_str_f64(&arr[3])?,
                Self::parse_str_f64(&arr[4])?,
                Self::parse_str_f64(&arr[5])?,
                arr[6].as_i64().unwrap_or(0),
            ));
        }

        debug!(symbol, interval, count = klines.len(), "klines fetched");
        Ok(klines)
    }

    /// GET /fapi/v1/ticker/24hr for all symbols (market movers sources).
    #[instrument(skip(self), name = "exchange::get_24h_tickers")]
    pub async fn get_24h_tickers(&self) -> Result<Vec<TickerStats>> {
        let body = self.public_get("/fapi/v1/ticker/24hr", "").await?;
        let raw = body.as_array().context("ticker response is not an array")?;

        let mut tickers = Vec::with_capacity(raw.len());
        for t in raw {
            tickers.push(TickerStats {
                symbol: t["symbol"].as_str().unwrap_or("").to_string(),
                last_price: Self::parse_str_f64(&t["lastPrice"]).unwrap_or(0.0),
                price_change_percent: Self::parse_str_f64(&t["priceChangePercent"]).unwrap_or(0.0),
                quote_volume: Self::parse_str_f64(&t["quoteVolume"]).unwrap_or(0.0),
                high_price: Self::parse_str_f64(&t["highPrice"]).unwrap_or(0.0),
                low_price: Self::parse_str_f64(&t["lowPrice"]).unwrap_or(0.0),
            });
        }
        Ok(tickers)
    }

    /// GET /fapi/v1/exchangeInfo — distil per-symbol trading rules from the
    /// PRICE_FILTER, LOT_SIZE, MARKET_LOT_SIZE, and MIN_NOTIONAL filters.
    #[instrument(skip(self), name = "exchange::get_exchange_rules")]
    pub async fn get_exchange_rules(&self) -> Result<Vec<SymbolRules>> {
        let body = self.public_get("/fapi/v1/exchangeInfo", "").await?;

        let symbols = body["symbols"]
            .as_array()
            .context("exchangeInfo response missing 'symbols' array")?;

        let now = chrono::Utc::now().to_rfc3339();
        let mut rules = Vec::with_capacity(symbols.len());

        for s in symbols {
            let symbol = match s["symbol"].as_str() {
                Some(sym) => sym.to_string(),
                None => continue,
            };

            let mut r = SymbolRules {
                symbol,
                tick_size: 0.0,
                step_size: 0.0,
                min_qty: 0.0,
                max_qty: f64::MAX,
                market_min_qty: 0.0,
                market_max_qty: 0.0,
                min_price: 0.0,
                max_price: f64::MAX,
                min_notional: 0.0,
                price_precision: s["pricePrecision"].as_u64().unwrap_or(8) as u32,
                qty_precision: s["quantityPrecision"].as_u64().unwrap_or(8) as u32,
                status: s["status"].as_str().unwrap_or("").to_string(),
                last_synced_at: now.clone(),
            };

            if let Some(filters) = s["filters"].as_array() {
                for f in filters {
                    match f["filterType"].as_str() {
                        Some("PRICE_FILTER") => {
                            r.tick_size = Self::parse_str_f64(&f["tickSize"]).unwrap_or(0.0);
                            r.min_price = Self::parse_str_f64(&f["minPrice"]).unwrap_or(0.0);
                            r.max_price = Self::parse_str_f64(&f["maxPrice"]).unwrap_or(f64::MAX);
                        }
                        Some("LOT_SIZE") => {
                            r.step_size = Self::parse_str_f64(&f["stepSize"]).unwrap_or(0.0);
                            r.min_qty = Self::parse_str_f64(&f["minQty"]).unwrap_or(0.0);
                            r.max_qty = Self::parse_str_f64(&f["maxQty"]).unwrap_or(f64::MAX);
                        }
                        Some("MARKET_LOT_SIZE") => {
                            r.market_min_qty = Self::parse_str_f64(&f["minQty"]).unwrap_or(0.0);
                            r.market_max_qty = Self::parse_str_f64(&f["maxQty"]).unwrap_or(0.0);
                        }
                        Some("MIN_NOTIONAL") => {
                            r.min_notional = Self::parse_str_f64(&f["notional"]).unwrap_or(0.0);
                        }
                        _ => {}
                    }
                }
            }

            rules.push(r);
        }

        debug!(count = rules.len(), "exchange rules fetched");
        Ok(rules)
    }

    // -------------------------------------------------------------------------
    // Account
    // -------------------------------------------------------------------------

    /// GET /fapi/v2/balance (signed) — available USDT margin.
    #[instrument(skip(self), name = "exchange::get_available_balance")]
    pub async fn get_available_balance(&self) -> Result<f64> {
        let body = self.signed_get("/fapi/v2/balance", "").await?;

        let balances = body.as_array().context("balance response is not an array")?;
        for b in balances {
            if b["asset"].as_str() == Some("USDT") {
                let avail = Self::parse_str_f64(&b["availableBalance"]).unwrap_or(0.0);
                debug!(available = avail, "available balance retrieved");
                return Ok(avail);
            }
        }

        warn!("USDT not found in balances — returning 0.0");
        Ok(0.0)
    }

    /// GET /fapi/v1/positionSide/dual (signed) — `true` means hedge mode.
    #[instrument(skip(self), name = "exchange::get_position_mode")]
    pub async fn get_position_mode(&self) -> Result<bool> {
        let body = self.signed_get("/fapi/v1/positionSide/dual", "").await?;
        Ok(body["dualSidePosition"].as_bool().unwrap_or(false))
    }

    /// POST /fapi/v1/leverage (signed).
    #[instrument(skip(self), name = "exchange::set_leverage")]
    pub async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()> {
        self.signed_post(
            "/fapi/v1/leverage",
            &format!("symbol={symbol}&leverage={leverage}"),
        )
        .await?;
        debug!(symbol, leverage, "leverage set");
        Ok(())
    }

    /// GET /fapi/v2/positionRisk (signed) — open positions only.
    #[instrument(skip(self), name = "exchange::get_positions")]
    pub async fn get_positions(&self) -> Result<Vec<ExchangePosition>> {
        let body = self.signed_get("/fapi/v2/positionRisk", "").await?;
        let raw = body
            .as_array()
            .context("positionRisk response is not an array")?;

        let mut positions = Vec::new();
        for p in raw {
            let amt = Self::parse_str_f64(&p["positionAmt"]).unwrap_or(0.0);
            if amt == 0.0 {
                continue;
            }
            positions.push(ExchangePosition {
                symbol: p["symbol"].as_str().unwrap_or("").to_string(),
                position_side: p["positionSide"].as_str().unwrap_or("BOTH").to_string(),
                position_amt: amt,
                entry_price: Self::parse_str_f64(&p["entryPrice"]).unwrap_or(0.0),
                unrealized_pnl: Self::parse_str_f64(&p["unRealizedProfit"]).unwrap_or(0.0),
                leverage: Self::parse_str_f64(&p["leverage"]).unwrap_or(1.0) as u32,
            });
        }

        debug!(count = positions.len(), "exchange positions retrieved");
        Ok(positions)
    }

    /// GET /fapi/v1/userTrades (signed) — recent fills for `symbol`.
    #[instrument(skip(self), name = "exchange::get_user_trades")]
    pub async fn get_user_trades(&self, symbol: &str, limit: u32) -> Result<Vec<AccountTrade>> {
        let body = self
            .signed_get(
                "/fapi/v1/userTrades",
                &format!("symbol={symbol}&limit={limit}"),
            )
            .await?;
        let raw = body
            .as_array()
            .context("userTrades response is not an array")?;

        let mut trades = Vec::with_capacity(raw.len());
        for t in raw {
            trades.push(AccountTrade {
                symbol: t["symbol"].as_str().unwrap_or("").to_string(),
                side: t["side"].as_str().unwrap_or("").to_string(),
                price: Self::parse_str_f64(&t["price"]).unwrap_or(0.0),
                qty: Self::parse_str_f64(&t["qty"]).unwrap_or(0.0),
                realized_pnl: Self::parse_str_f64(&t["realizedPnl"]).unwrap_or(0.0),
                commission: Self::parse_str_f64(&t["commission"]).unwrap_or(0.0),
                time: t["time"].as_i64().unwrap_or(0),
            });
        }
        Ok(trades)
    }

    // -------------------------------------------------------------------------
    // Orders
    // -------------------------------------------------------------------------

    /// POST /fapi/v1/order (signed) — market order.
    #[instrument(skip(self), name = "exchange::place_market_order")]
    pub async fn place_market_order(
        &self,
        symbol: &str,
        side: &str,
        position_side: &str,
        quantity: f64,
    ) -> Result<OrderAck> {
        self.limiter.record_order_sent();

        let params = format!(
            "symbol={symbol}&side={side}&positionSide={position_side}&type=MARKET&quantity={quantity}"
        );
        let body = self.signed_post("/fapi/v1/order", &params).await?;

        let ack = Self::parse_ack(&body)?;
        debug!(symbol, side, quantity, order_id = ack.order_id, "market order placed");
        Ok(ack)
    }

    /// POST /fapi/v1/order (signed) — conditional SL/TP order triggered
    /// against mark price.
    #[instrument(skip(self, req), name = "exchange::place_algo_order", fields(symbol = %req.symbol, order_type = %req.order_type))]
    pub async fn place_algo_order(&self, req: &AlgoOrderRequest) -> Result<OrderAck> {
        self.limiter.record_order_sent();

        let mut params = format!(
            "symbol={}&side={}&positionSide={}&type={}&stopPrice={}&workingType=MARK_PRICE",
            req.symbol, req.side, req.position_side, req.order_type, req.trigger_price
        );
        if req.close_position {
            params.push_str("&closePosition=true");
        } else if let Some(q) = req.quantity {
            params.push_str(&format!("&quantity={q}&reduceOnly=true"));
        }

        let body = self.signed_post("/fapi/v1/order", &params).await?;

        let ack = Self::parse_ack(&body)?;
        debug!(
            symbol = %req.symbol,
            order_type = %req.order_type,
            trigger = req.trigger_price,
            order_id = ack.order_id,
            "algo order placed"
        );
        Ok(ack)
    }

    /// GET /fapi/v1/order (signed) — query a single order.
    #[instrument(skip(self), name = "exchange::query_order")]
    pub async fn query_order(&self, symbol: &str, order_id: u64) -> Result<OrderInfo> {
        let body = self
            .signed_get("/fapi/v1/order", &format!("symbol={symbol}&orderId={order_id}"))
            .await?;

        Ok(OrderInfo {
            order_id: body["orderId"].as_u64().unwrap_or(order_id),
            symbol: body["symbol"].as_str().unwrap_or(symbol).to_string(),
            status: body["status"].as_str().unwrap_or("").to_string(),
            avg_price: Self::parse_str_f64(&body["avgPrice"]).unwrap_or(0.0),
            executed_qty: Self::parse_str_f64(&body["executedQty"]).unwrap_or(0.0),
            orig_qty: Self::parse_str_f64(&body["origQty"]).unwrap_or(0.0),
        })
    }

    /// DELETE /fapi/v1/order (signed) — cancel a single order.
    #[instrument(skip(self), name = "exchange::cancel_order")]
    pub async fn cancel_order(&self, symbol: &str, order_id: u64) -> Result<()> {
        self.signed_delete("/fapi/v1/order", &format!("symbol={symbol}&orderId={order_id}"))
            .await?;
        debug!(symbol, order_id, "order cancelled");
        Ok(())
    }

    /// DELETE /fapi/v1/allOpenOrders (signed) — cancel every open order
    /// (including conditional orders) for `symbol`.
    #[instrument(skip(self), name = "exchange::cancel_all_orders")]
    pub async fn cancel_all_orders(&self, symbol: &str) -> Result<()> {
        self.signed_delete("/fapi/v1/allOpenOrders", &format!("symbol={symbol}"))
            .await?;
        debug!(symbol, "all open orders cancelled");
        Ok(())
    }

    /// GET /fapi/v1/openOrders (signed) — open conditional orders for
    /// `symbol` (plain limit orders are filtered out).
    #[instrument(skip(self), name = "exchange::list_open_algo_orders")]
    pub async fn list_open_algo_orders(&self, symbol: &str) -> Result<Vec<AlgoOrder>> {
        let body = self
            .signed_get("/fapi/v1/openOrders", &format!("symbol={symbol}"))
            .await?;
        Self::parse_algo_orders(&body, Some(symbol))
    }

    /// GET /fapi/v1/openOrders (signed) without a symbol — every open
    /// conditional order on the account (orphan sweep).
    #[instrument(skip(self), name = "exchange::list_all_open_algo_orders")]
    pub async fn list_all_open_algo_orders(&self) -> Result<Vec<AlgoOrder>> {
        let body = self.signed_get("/fapi/v1/openOrders", "").await?;
        Self::parse_algo_orders(&body, None)
    }

    fn parse_algo_orders(
        body: &serde_json::Value,
        symbol: Option<&str>,
    ) -> Result<Vec<AlgoOrder>> {
        let raw = body
            .as_array()
            .context("openOrders response is not an array")?;

        let mut orders = Vec::new();
        for o in raw {
            let order_type = o["type"].as_str().unwrap_or("").to_string();
            if !crate::exchange::models::SL_ORDER_TYPES.contains(&order_type.as_str())
                && !crate::exchange::models::TP_ORDER_TYPES.contains(&order_type.as_str())
            {
                continue;
            }
            orders.push(AlgoOrder {
                order_id: o["orderId"].as_u64().unwrap_or(0),
                symbol: o["symbol"]
                    .as_str()
                    .or(symbol)
                    .unwrap_or("")
                    .to_string(),
                side: o["side"].as_str().unwrap_or("").to_string(),
                position_side: o["positionSide"].as_str().unwrap_or("BOTH").to_string(),
                order_type,
                stop_price: Self::parse_str_f64(&o["stopPrice"]).unwrap_or(0.0),
                close_position: o["closePosition"].as_bool().unwrap_or(false),
                quantity: Self::parse_str_f64(&o["origQty"]).unwrap_or(0.0),
                status: o["status"].as_str().unwrap_or("NEW").to_string(),
            });
        }

        debug!(count = orders.len(), "open algo orders retrieved");
        Ok(orders)
    }

    // -------------------------------------------------------------------------
    // Internal helpers
    // -------------------------------------------------------------------------

    fn parse_ack(body: &serde_json::Value) -> Result<OrderAck> {
        Ok(OrderAck {
            order_id: body["orderId"]
                .as_u64()
                .context("order response missing 'orderId'")?,
            client_order_id: body["clientOrderId"].as_str().unwrap_or("").to_string(),
            status: body["status"].as_str().unwrap_or("NEW").to_string(),
            avg_price: Self::parse_str_f64(&body["avgPrice"]).unwrap_or(0.0),
            executed_qty: Self::parse_str_f64(&body["executedQty"]).unwrap_or(0.0),
        })
    }

    /// Parse a JSON value that may be either a string or a number into `f64`.
    fn parse_str_f64(val: &serde_json::Value) -> Result<f64> {
        if let Some(s) = val.as_str() {
            s.parse::<f64>()
                .with_context(|| format!("failed to parse '{s}' as f64"))
        } else if let Some(n) = val.as_f64() {
            Ok(n)
        } else {
            anyhow::bail!("expected string or number, got: {val}")
        }
    }
}

impl std::fmt::Debug for ExchangeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeClient")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_deterministic_hex() {
        let client = ExchangeClient::new("key", "secret");
        let sig1 = client.sign("symbol=BTCUSDT&timestamp=1");
        let sig2 = client.sign("symbol=BTCUSDT&timestamp=1");
        assert_eq!(sig1, sig2);
        assert_eq!(sig1.len(), 64);
        assert!(sig1.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn parse_str_f64_accepts_both_forms() {
        assert_eq!(
            ExchangeClient::parse_str_f64(&serde_json::json!("60000.5")).unwrap(),
            60000.5
        );
        assert_eq!(
            ExchangeClient::parse_str_f64(&serde_json::json!(42.0)).unwrap(),
            42.0
        );
        assert!(ExchangeClient::parse_str_f64(&serde_json::json!(null)).is_err());
    }

    #[test]
    fn debug_redacts_credentials() {
        let client = ExchangeClient::new("my-key", "my-secret");
        let dbg = format!("{client:?}");
        assert!(!dbg.contains("my-key"));
        assert!(!dbg.contains("my-secret"));
        assert!(dbg.contains("<redacted>"));
    }
}
