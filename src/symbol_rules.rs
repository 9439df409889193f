// =============================================================================
// Symbol Validator — exchange trading rules, directional rounding, pre-flight
// =============================================================================
//
// Translates desired price/quantity into exchange-acceptable values and
// rejects malformed orders before they reach the exchange.
//
// Rounding policy:
//   - Quantity rounds DOWN to the step size (never over-sell).
//   - TP prices round AWAY from entry in the profitable direction.
//   - SL prices round TOWARD the position so the stop is never loosened.
//
// The cache is loaded from storage on start, refreshed from the exchange at
// most every 6 hours in the background, and synchronously on a cache miss.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::exchange::models::SymbolRules;
use crate::exchange::ExchangeClient;
use crate::storage::TradeStore;
use crate::types::Side;

/// Background refresh interval for the rules cache.
const REFRESH_INTERVAL_HOURS: i64 = 6;

/// Result of a pre-flight order validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub valid: bool,
    pub rounded_qty: f64,
    pub rounded_price: f64,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Caches per-symbol exchange rules and applies directional rounding.
pub struct SymbolValidator {
    client: Arc<ExchangeClient>,
    store: Arc<dyn TradeStore>,
    rules: RwLock<HashMap<String, SymbolRules>>,
    last_refresh: RwLock<Option<DateTime<Utc>>>,
}

impl SymbolValidator {
    pub fn new(client: Arc<ExchangeClient>, store: Arc<dyn TradeStore>) -> Self {
        Self {
            client,
            store,
            rules: RwLock::new(HashMap::new()),
            last_refresh: RwLock::new(None),
        }
    }

    // -------------------------------------------------------------------------
    // Cache management
    // -------------------------------------------------------------------------

    /// Load the persisted rules cache (called once on start).
    pub async fn load_persisted(&self) -> anyhow::Result<()> {
        let saved = self.store.saved_symbol_rules().await?;
        if saved.is_empty() {
            return Ok(());
        }
        let mut map = self.rules.write();
        for r in saved {
            map.insert(r.symbol.clone(), r);
        }
        info!(count = map.len(), "symbol rules loaded from storage");
        Ok(())
    }

    /// Refresh all symbols from the exchange and persist the result.
    pub async fn refresh(&self) -> anyhow::Result<()> {
        let fetched = self.client.get_exchange_rules().await?;

        {
            let mut map = self.rules.write();
            map.clear();
            for r in &fetched {
                map.insert(r.symbol.clone(), r.clone());
            }
        }
        *self.last_refresh.write() = Some(Utc::now());

        if let Err(e) = self.store.save_symbol_rules(&fetched).await {
            warn!(error = %e, "failed to persist symbol rules cache");
        }

        info!(count = fetched.len(), "symbol rules refreshed from exchange");
        Ok(())
    }

    /// Whether the background refresh is due.
    pub fn refresh_due(&self) -> bool {
        match *self.last_refresh.read() {
            Some(t) => Utc::now() - t >= Duration::hours(REFRESH_INTERVAL_HOURS),
            None => true,
        }
    }

    /// Rules for `symbol`, synchronously refreshing on a cache miss.
    pub async fn rules_for(&self, symbol: &str) -> anyhow::Result<SymbolRules> {
        if let Some(r) = self.rules.read().get(symbol).cloned() {
            return Ok(r);
        }

        debug!(symbol, "symbol rules cache miss — refreshing");
        self.refresh().await?;

        self.rules
            .read()
            .get(symbol)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("symbol {symbol} unknown to the exchange"))
    }

    /// Cached rules without triggering a refresh (None on miss).
    pub fn cached_rules(&self, symbol: &str) -> Option<SymbolRules> {
        self.rules.read().get(symbol).cloned()
    }

    /// Test/bootstrap helper: seed the cache directly.
    pub fn insert_rules(&self, rules: SymbolRules) {
        self.rules.write().insert(rules.symbol.clone(), rules);
    }

    // -------------------------------------------------------------------------
    // Rounding
    // -------------------------------------------------------------------------

    /// Round a quantity DOWN to the symbol's step size.
    pub fn round_qty(&self, symbol: &str, qty: f64) -> f64 {
        match self.cached_rules(symbol) {
            Some(r) => round_down(qty, r.step_size, r.qty_precision),
            None => qty,
        }
    }

    /// Round a TP trigger price AWAY from entry in the profitable direction.
    pub fn round_price_for_tp(&self, symbol: &str, price: f64, side: Side) -> f64 {
        match self.cached_rules(symbol) {
            Some(r) => match side {
                Side::Long => round_up(price, r.tick_size, r.price_precision),
                Side::Short => round_down(price, r.tick_size, r.price_precision),
            },
            None => price,
        }
    }

    /// Round an SL trigger price TOWARD the position (never loosens the stop).
    pub fn round_price_for_sl(&self, symbol: &str, price: f64, side: Side) -> f64 {
        match self.cached_rules(symbol) {
            // Long SL sits below entry; rounding up pulls it tighter.
            Some(r) => match side {
                Side::Long => round_up(price, r.tick_size, r.price_precision),
                Side::Short => round_down(price, r.tick_size, r.price_precision),
            },
            None => price,
        }
    }

    // -------------------------------------------------------------------------
    // Validation
    // -------------------------------------------------------------------------

    /// Validate an order against the cached rules for `symbol`.
    pub fn validate(&self, symbol: &str, qty: f64, price: f64, is_market: bool) -> ValidationOutcome {
        let rules = match self.cached_rules(symbol) {
            Some(r) => r,
            None => {
                return ValidationOutcome {
                    valid: false,
                    rounded_qty: qty,
                    rounded_price: price,
                    errors: vec![format!("no exchange rules cached for {symbol}")],
                    warnings: Vec::new(),
                }
            }
        };
        validate_with(&rules, qty, price, is_market)
    }
}

/// Pure validation against a known rule set.
pub fn validate_with(
    rules: &SymbolRules,
    qty: f64,
    price: f64,
    is_market: bool,
) -> ValidationOutcome {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if !rules.status.is_empty() && rules.status != "TRADING" {
        errors.push(format!(
            "symbol {} is not trading (status {})",
            rules.symbol, rules.status
        ));
    }

    let rounded_qty = round_down(qty, rules.step_size, rules.qty_precision);
    if rounded_qty < qty {
        warnings.push(format!("quantity rounded down {qty} -> {rounded_qty}"));
    }

    let mut rounded_price = round_down(price, rules.tick_size, rules.price_precision);
    if rounded_price < rules.min_price {
        rounded_price = rules.min_price;
        warnings.push(format!("price clamped up to min_price {}", rules.min_price));
    }
    if rounded_price > rules.max_price {
        rounded_price = rules.max_price;
        warnings.push(format!("price clamped down to max_price {}", rules.max_price));
    }

    // Market orders use the MARKET_LOT_SIZE bounds when the exchange
    // publishes them.
    let (min_qty, max_qty) = if is_market && rules.market_max_qty > 0.0 {
        (rules.market_min_qty, rules.market_max_qty)
    } else {
        (rules.min_qty, rules.max_qty)
    };

    if rounded_qty < min_qty {
        errors.push(format!(
            "quantity {rounded_qty} below minimum {min_qty} for {}",
            rules.symbol
        ));
    }
    if rounded_qty > max_qty {
        errors.push(format!(
            "quantity {rounded_qty} above maximum {max_qty} for {}",
            rules.symbol
        ));
    }

    let notional = rounded_qty * rounded_price;
    if notional < rules.min_notional {
        errors.push(format!(
            "notional {notional:.4} below minimum {} for {}",
            rules.min_notional, rules.symbol
        ));
    }

    ValidationOutcome {
        valid: errors.is_empty(),
        rounded_qty,
        rounded_price,
        errors,
        warnings,
    }
}

/// Background refresh loop: re-syncs the rules cache from the exchange
/// whenever it is older than the refresh interval.
pub async fn run_rules_refresh(
    ap: std::sync::Arc<crate::autopilot::Autopilot>,
    mut stop: tokio::sync::watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(15 * 60));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop.changed() => return,
        }
        if ap.validator.refresh_due() {
            if let Err(e) = ap.validator.refresh().await {
                warn!(error = %e, "scheduled symbol-rules refresh failed");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Step rounding helpers
// ---------------------------------------------------------------------------

/// Round `value` down to a multiple of `step`, then snap to `precision`
/// decimals to shake off float residue. A tiny relative epsilon keeps values
/// already sitting on a step boundary from dropping a full step.
fn round_down(value: f64, step: f64, precision: u32) -> f64 {
    if step <= 0.0 {
        return value;
    }
    let steps = (value / step + 1e-9).floor();
    snap(steps * step, precision)
}

/// Round `value` up to a multiple of `step`.
fn round_up(value: f64, step: f64, precision: u32) -> f64 {
    if step <= 0.0 {
        return value;
    }
    let steps = (value / step - 1e-9).ceil();
    snap(steps * step, precision)
}

fn snap(value: f64, precision: u32) -> f64 {
    let factor = 10f64.powi(precision.min(12) as i32);
    (value * factor).round() / factor
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> SymbolRules {
        SymbolRules {
            symbol: "ETHUSDT".into(),
            tick_size: 0.01,
            step_size: 0.001,
            min_qty: 0.001,
            max_qty: 10_000.0,
            market_min_qty: 0.001,
            market_max_qty: 2_000.0,
            min_price: 0.01,
            max_price: 1_000_000.0,
            min_notional: 5.0,
            price_precision: 2,
            qty_precision: 3,
            status: "TRADING".into(),
            last_synced_at: String::new(),
        }
    }

    #[test]
    fn qty_rounds_down_to_step() {
        assert_eq!(round_down(0.1234, 0.001, 3), 0.123);
        assert_eq!(round_down(0.5, 0.001, 3), 0.5);
        // Boundary value must not lose a step to float error.
        assert_eq!(round_down(0.123, 0.001, 3), 0.123);
    }

    #[test]
    fn rounding_is_idempotent() {
        let r = rules();
        let q1 = round_down(0.123456, r.step_size, r.qty_precision);
        let q2 = round_down(q1, r.step_size, r.qty_precision);
        assert_eq!(q1, q2);

        let p1 = round_up(2001.2345, r.tick_size, r.price_precision);
        let p2 = round_up(p1, r.tick_size, r.price_precision);
        assert_eq!(p1, p2);
    }

    #[test]
    fn tp_rounds_away_from_entry() {
        // Long TP sits above entry: rounding must not pull it closer.
        let tp_long = round_up(2020.003, 0.01, 2);
        assert!(tp_long >= 2020.003);
        // Short TP sits below entry: rounding must not push it up.
        let tp_short = round_down(1980.007, 0.01, 2);
        assert!(tp_short <= 1980.007);
    }

    #[test]
    fn sl_rounds_toward_position() {
        // Long SL below entry: rounding up keeps the stop at least as tight.
        let sl_long = round_up(1959.992, 0.01, 2);
        assert!(sl_long >= 1959.992);
        // Short SL above entry: rounding down keeps it tight.
        let sl_short = round_down(2040.008, 0.01, 2);
        assert!(sl_short <= 2040.008);
    }

    #[test]
    fn validates_min_notional() {
        let r = rules();
        let out = validate_with(&r, 0.001, 2000.0, false);
        // 0.001 * 2000 = 2.0 < 5.0 min notional
        assert!(!out.valid);
        assert!(out.errors.iter().any(|e| e.contains("notional")));
    }

    #[test]
    fn validates_qty_bounds_market_vs_limit() {
        let r = rules();
        // 3000 exceeds market_max_qty (2000) but not limit max (10000).
        let market = validate_with(&r, 3000.0, 2000.0, true);
        assert!(!market.valid);
        let limit = validate_with(&r, 3000.0, 2000.0, false);
        assert!(limit.valid);
    }

    #[test]
    fn rejects_non_trading_symbol() {
        let mut r = rules();
        r.status = "SETTLING".into();
        let out = validate_with(&r, 1.0, 2000.0, false);
        assert!(!out.valid);
    }

    #[test]
    fn warns_on_rounding() {
        let r = rules();
        let out = validate_with(&r, 0.1239, 2000.0, false);
        assert!(out.valid);
        assert_eq!(out.rounded_qty, 0.123);
        assert!(!out.warnings.is_empty());
    }
}
