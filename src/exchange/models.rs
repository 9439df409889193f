// =============================================================================
// Typed exchange payloads — orders, positions, funding, symbol filters
// =============================================================================
//
// The REST API returns most numeric fields as strings; parsing happens in the
// client so the rest of the engine only ever sees `f64`s.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::types::Side;

/// Conditional ("algo") order kinds the engine places and recognises.
pub const SL_ORDER_TYPES: [&str; 2] = ["STOP", "STOP_MARKET"];
pub const TP_ORDER_TYPES: [&str; 2] = ["TAKE_PROFIT", "TAKE_PROFIT_MARKET"];

/// Acknowledgement returned when an order is accepted by the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: u64,
    pub client_order_id: String,
    pub status: String,
    /// Average fill price (0.0 until filled).
    pub avg_price: f64,
    pub executed_qty: f64,
}

/// Full order state as returned by the order-query endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderInfo {
    pub order_id: u64,
    pub symbol: String,
    pub status: String,
    pub avg_price: f64,
    pub executed_qty: f64,
    pub orig_qty: f64,
}

impl OrderInfo {
    pub fn is_filled(&self) -> bool {
        self.status == "FILLED"
    }

    pub fn is_working(&self) -> bool {
        matches!(self.status.as_str(), "NEW" | "PARTIALLY_FILLED")
    }
}

/// An open conditional order on the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlgoOrder {
    pub order_id: u64,
    pub symbol: String,
    /// "BUY" / "SELL".
    pub side: String,
    /// "LONG" / "SHORT" / "BOTH".
    pub position_side: String,
    /// "STOP_MARKET", "TAKE_PROFIT_MARKET", ...
    pub order_type: String,
    pub stop_price: f64,
    pub close_position: bool,
    pub quantity: f64,
    pub status: String,
}

impl AlgoOrder {
    pub fn is_stop_loss(&self) -> bool {
        SL_ORDER_TYPES.contains(&self.order_type.as_str())
    }

    pub fn is_take_profit(&self) -> bool {
        TP_ORDER_TYPES.contains(&self.order_type.as_str())
    }

    /// Whether this order protects a position on `side`, accounting for
    /// one-way accounts where `positionSide` is always "BOTH".
    pub fn matches_position_side(&self, side: Side) -> bool {
        self.position_side == "BOTH" || self.position_side == side.position_side()
    }
}

/// Request body for placing a conditional order.
#[derive(Debug, Clone)]
pub struct AlgoOrderRequest {
    pub symbol: String,
    /// Order side — opposite the position for SL/TP.
    pub side: String,
    /// "BOTH" in one-way mode, "LONG"/"SHORT" in hedge mode.
    pub position_side: String,
    /// "STOP_MARKET" or "TAKE_PROFIT_MARKET".
    pub order_type: String,
    pub trigger_price: f64,
    /// Mutually exclusive with `close_position`.
    pub quantity: Option<f64>,
    /// Close the entire remaining position when triggered.
    pub close_position: bool,
}

/// One position row from the position-risk endpoint. `position_amt` is
/// signed: positive = long, negative = short.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangePosition {
    pub symbol: String,
    pub position_side: String,
    pub position_amt: f64,
    pub entry_price: f64,
    pub unrealized_pnl: f64,
    pub leverage: u32,
}

impl ExchangePosition {
    pub fn side(&self) -> Side {
        if self.position_amt >= 0.0 {
            Side::Long
        } else {
            Side::Short
        }
    }

    pub fn qty(&self) -> f64 {
        self.position_amt.abs()
    }

    pub fn is_open(&self) -> bool {
        self.position_amt.abs() > 0.0
    }
}

/// Mark price + funding snapshot from the premium-index endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PremiumIndex {
    pub symbol: String,
    pub mark_price: f64,
    pub last_funding_rate: f64,
    /// Milliseconds since epoch.
    pub next_funding_time: i64,
}

/// Funding information consumed by entry filters and the pre-funding exit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingInfo {
    pub rate: f64,
    pub next_funding_time: i64,
}

impl FundingInfo {
    /// Minutes until the next funding event (negative if in the past).
    pub fn minutes_until(&self, now_ms: i64) -> i64 {
        (self.next_funding_time - now_ms) / 60_000
    }
}

/// A single fill from the user-trades endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountTrade {
    pub symbol: String,
    pub side: String,
    pub price: f64,
    pub qty: f64,
    pub realized_pnl: f64,
    pub commission: f64,
    /// Milliseconds since epoch.
    pub time: i64,
}

/// Per-symbol trading rules distilled from the exchange-info filters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolRules {
    pub symbol: String,
    pub tick_size: f64,
    pub step_size: f64,
    pub min_qty: f64,
    pub max_qty: f64,
    #[serde(default)]
    pub market_min_qty: f64,
    #[serde(default)]
    pub market_max_qty: f64,
    pub min_price: f64,
    pub max_price: f64,
    pub min_notional: f64,
    pub price_precision: u32,
    pub qty_precision: u32,
    pub status: String,
    /// ISO-8601 time of the last exchange sync.
    #[serde(default)]
    pub last_synced_at: String,
}

/// 24-hour ticker statistics, used by the market-movers watchlist sources.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickerStats {
    pub symbol: String,
    pub last_price: f64,
    pub price_change_percent: f64,
    pub quote_volume: f64,
    pub high_price: f64,
    pub low_price: f64,
}

impl TickerStats {
    /// Intraday range as a percentage of the last price — a cheap
    /// volatility proxy for the volatility watchlist source.
    pub fn range_percent(&self) -> f64 {
        if self.last_price <= 0.0 {
            return 0.0;
        }
        (self.high_price - self.low_price) / self.last_price * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn algo_order_type_classification() {
        let mut o = AlgoOrder {
            order_id: 1,
            symbol: "BTCUSDT".into(),
            side: "SELL".into(),
            position_side: "LONG".into(),
            order_type: "STOP_MARKET".into(),
            stop_price: 59_000.0,
            close_position: true,
            quantity: 0.0,
            status: "NEW".into(),
        };
        assert!(o.is_stop_loss());
        assert!(!o.is_take_profit());

        o.order_type = "TAKE_PROFIT_MARKET".into();
        assert!(o.is_take_profit());
    }

    #[test]
    fn algo_order_position_side_matching() {
        let o = AlgoOrder {
            order_id: 1,
            symbol: "BTCUSDT".into(),
            side: "SELL".into(),
            position_side: "BOTH".into(),
            order_type: "STOP_MARKET".into(),
            stop_price: 1.0,
            close_position: true,
            quantity: 0.0,
            status: "NEW".into(),
        };
        // One-way accounts report BOTH, which matches either direction.
        assert!(o.matches_position_side(Side::Long));
        assert!(o.matches_position_side(Side::Short));
    }

    #[test]
    fn exchange_position_sign_determines_side() {
        let long = ExchangePosition {
            symbol: "ETHUSDT".into(),
            position_side: "BOTH".into(),
            position_amt: 1.5,
            entry_price: 2000.0,
            unrealized_pnl: 10.0,
            leverage: 5,
        };
        assert_eq!(long.side(), Side::Long);
        assert_eq!(long.qty(), 1.5);

        let short = ExchangePosition {
            position_amt: -2.0,
            ..long.clone()
        };
        assert_eq!(short.side(), Side::Short);
        assert_eq!(short.qty(), 2.0);
    }

    #[test]
    fn funding_minutes_until() {
        let f = FundingInfo {
            rate: 0.0001,
            next_funding_time: 600_000,
        };
        assert_eq!(f.minutes_until(0), 10);
        assert_eq!(f.minutes_until(540_000), 1);
    }
}
