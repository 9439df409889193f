// =============================================================================
// Reconciliation Engine — align local position state with the exchange
// =============================================================================
//
// Four phases per pass:
//   A (lock-free)  fetch exchange positions.
//   B (under lock) diff: local-but-not-on-exchange -> remove;
//                  exchange-but-not-local -> adopt; size drift > 1% -> resize
//                  (a grown exchange position adopts the DCA'd entry price).
//   C (lock-free)  removed symbols: realized PnL and volume-weighted exit
//                  price from the last 5 minutes of trade history, synthetic
//                  full-close record, cancel leftover algos, delete.
//   D (lock-free)  adopted positions: first enabled of Swing/Scalp/Position,
//                  default 2% SL, mode-default TPs, persisted trade (reusing
//                  an OPEN record when one exists), then initial protection
//                  placement.
//
// The orphan sweep cancels algo orders whose symbol has no position, or
// whose count exceeds the expected handful.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::autopilot::Autopilot;
use crate::exchange::models::{AccountTrade, ExchangePosition};
use crate::position::{stop_loss_price, tp_plan_for, Position, ProtectionStatus};
use crate::protection::placer;
use crate::storage::FuturesTrade;
use crate::types::{Side, SignalSource, TradeMode};

/// Orphan sweep cadence.
const ORPHAN_SWEEP_INTERVAL_SECS: u64 = 300;
/// Relative size drift tolerated before a resize.
const SIZE_DRIFT_TOLERANCE: f64 = 0.01;
/// Trade-history window used to reconstruct an external close.
const EXIT_LOOKBACK_MS: i64 = 5 * 60 * 1000;
/// More algo orders than this per symbol is an anomaly.
const EXPECTED_MAX_ALGO_ORDERS: usize = 4;
/// Default SL distance for adopted positions, percent.
const ADOPTED_SL_PERCENT: f64 = 2.0;

/// Summary of one reconciliation pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub removed: usize,
    pub adopted: usize,
    pub resized: usize,
}

// ---------------------------------------------------------------------------
// Pure planning
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Resize {
    pub symbol: String,
    pub new_qty: f64,
    /// Set when the exchange position grew (DCA): adopt its entry price.
    pub new_entry: Option<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct ReconcilePlan {
    pub to_remove: Vec<String>,
    pub to_adopt: Vec<ExchangePosition>,
    pub to_resize: Vec<Resize>,
}

/// Diff local positions against the exchange.
pub fn plan_reconciliation(
    local: &HashMap<String, (Side, f64, f64)>,
    exchange: &[ExchangePosition],
) -> ReconcilePlan {
    let mut plan = ReconcilePlan::default();

    let by_key: HashMap<(String, Side), &ExchangePosition> = exchange
        .iter()
        .filter(|p| p.is_open())
        .map(|p| ((p.symbol.clone(), p.side()), p))
        .collect();

    for (symbol, (side, local_qty, _local_entry)) in local {
        match by_key.get(&(symbol.clone(), *side)) {
            None => plan.to_remove.push(symbol.clone()),
            Some(exch) => {
                let exch_qty = exch.qty();
                if *local_qty > 0.0
                    && (exch_qty - local_qty).abs() / local_qty > SIZE_DRIFT_TOLERANCE
                {
                    plan.to_resize.push(Resize {
                        symbol: symbol.clone(),
                        new_qty: exch_qty,
                        new_entry: (exch_qty > *local_qty).then_some(exch.entry_price),
                    });
                }
            }
        }
    }

    for exch in exchange.iter().filter(|p| p.is_open()) {
        if !local.contains_key(&exch.symbol) {
            plan.to_adopt.push(exch.clone());
        }
    }

    plan
}

/// Realized PnL and volume-weighted exit price from recent fills.
pub fn summarize_recent_exit(trades: &[AccountTrade], now_ms: i64) -> (f64, f64) {
    let cutoff = now_ms - EXIT_LOOKBACK_MS;
    let recent: Vec<&AccountTrade> = trades.iter().filter(|t| t.time >= cutoff).collect();

    let pnl: f64 = recent.iter().map(|t| t.realized_pnl).sum();
    let volume: f64 = recent.iter().map(|t| t.qty).sum();
    let vwap = if volume > 0.0 {
        recent.iter().map(|t| t.price * t.qty).sum::<f64>() / volume
    } else {
        0.0
    };
    (pnl, vwap)
}

/// Which symbols' algo orders should be swept away.
pub fn plan_orphan_sweep(
    order_counts: &HashMap<String, usize>,
    position_symbols: &HashSet<String>,
) -> Vec<String> {
    let mut doomed: Vec<String> = order_counts
        .iter()
        .filter(|(symbol, count)| {
            !position_symbols.contains(*symbol) || **count > EXPECTED_MAX_ALGO_ORDERS
        })
        .map(|(symbol, _)| symbol.clone())
        .collect();
    doomed.sort();
    doomed
}

// ---------------------------------------------------------------------------
// Reconciliation pass
// ---------------------------------------------------------------------------

/// Run one full reconciliation pass.
pub async fn reconcile_once(ap: Arc<Autopilot>) -> anyhow::Result<ReconcileReport> {
    let client = ap.client();

    // Phase A — exchange truth.
    let exchange_positions = client.get_positions().await?;

    // Phase B — diff and apply resizes under the lock.
    let plan = {
        let mut state = ap.state.write();
        let local: HashMap<String, (Side, f64, f64)> = state
            .positions
            .values()
            .map(|p| (p.symbol.clone(), (p.side, p.remaining_qty, p.entry_price)))
            .collect();

        let plan = plan_reconciliation(&local, &exchange_positions);

        for resize in &plan.to_resize {
            if let Some(p) = state.positions.get_mut(&resize.symbol) {
                info!(
                    symbol = %resize.symbol,
                    old_qty = p.remaining_qty,
                    new_qty = resize.new_qty,
                    "reconcile: size drift — adopting exchange quantity"
                );
                p.remaining_qty = resize.new_qty;
                if p.original_qty < resize.new_qty {
                    p.original_qty = resize.new_qty;
                }
                if let Some(entry) = resize.new_entry {
                    p.entry_price = entry;
                }
            }
        }

        plan
    };

    let mut report = ReconcileReport {
        resized: plan.to_resize.len(),
        ..Default::default()
    };

    // Phase C — positions that vanished from the exchange.
    for symbol in &plan.to_remove {
        match handle_external_close(&ap, symbol).await {
            Ok(()) => report.removed += 1,
            Err(e) => warn!(symbol = %symbol, error = %e, "reconcile: external-close handling failed"),
        }
    }

    // Phase D — positions the exchange has that we do not.
    for exch in &plan.to_adopt {
        match adopt_position(&ap, exch).await {
            Ok(()) => report.adopted += 1,
            Err(e) => warn!(symbol = %exch.symbol, error = %e, "reconcile: adoption failed"),
        }
    }

    if report.removed + report.adopted + report.resized > 0 {
        info!(
            user = %ap.user_id,
            removed = report.removed,
            adopted = report.adopted,
            resized = report.resized,
            "reconciliation applied changes"
        );
    } else {
        debug!(user = %ap.user_id, "reconciliation: no drift");
    }

    Ok(report)
}

/// Phase C for one symbol: reconstruct the exit and clean up.
async fn handle_external_close(ap: &Arc<Autopilot>, symbol: &str) -> anyhow::Result<()> {
    let client = ap.client();
    let now_ms = Utc::now().timestamp_millis();

    let trades = client.get_user_trades(symbol, 50).await.unwrap_or_default();
    let (pnl, vwap) = summarize_recent_exit(&trades, now_ms);

    let exit_price = if vwap > 0.0 {
        vwap
    } else {
        ap.state
            .read()
            .positions
            .get(symbol)
            .map(|p| p.entry_price)
            .unwrap_or(0.0)
    };

    let reason = if pnl >= 0.0 {
        "full_close: external (profit)"
    } else {
        "full_close: external (loss)"
    };

    if let Err(e) = client.cancel_all_orders(symbol).await {
        debug!(symbol, error = %e, "reconcile: leftover algo cancel failed");
    }

    warn!(symbol, pnl, exit_price, "position closed externally — recording");
    ap.finalize_external_close(symbol, exit_price, pnl, reason).await;
    Ok(())
}

/// Mode an adopted position is filed under: the first enabled of Swing,
/// Scalp, Position. UltraFast is never a candidate — its hold-time and
/// target semantics make no sense for a position we did not open.
pub fn adoption_mode(settings: &crate::settings::Settings) -> TradeMode {
    ADOPTION_MODE_PRIORITY
        .iter()
        .copied()
        .find(|m| settings.mode(*m).enabled)
        .unwrap_or(TradeMode::Swing)
}

/// Candidate modes for adopted positions, in priority order.
const ADOPTION_MODE_PRIORITY: [TradeMode; 3] =
    [TradeMode::Swing, TradeMode::Scalp, TradeMode::Position];

/// Phase D for one exchange position: create the local record and protect it.
async fn adopt_position(ap: &Arc<Autopilot>, exch: &ExchangePosition) -> anyhow::Result<()> {
    let now = Utc::now();
    let side = exch.side();
    let settings = ap.settings.read().clone();

    let mode = adoption_mode(&settings);
    let mode_cfg = settings.mode(mode);

    // Reuse an existing OPEN trade record to avoid duplicates.
    let trade_id = match ap.store.open_trade_for(&ap.user_id, &exch.symbol).await? {
        Some(trade) => trade.id,
        None => {
            ap.store
                .create_trade(FuturesTrade {
                    id: String::new(),
                    user_id: ap.user_id.clone(),
                    symbol: exch.symbol.clone(),
                    side,
                    mode,
                    entry_price: exch.entry_price,
                    exit_price: None,
                    quantity: exch.qty(),
                    leverage: exch.leverage,
                    realized_pnl: 0.0,
                    status: "OPEN".to_string(),
                    trade_source: "sync".to_string(),
                    open_time: now,
                    close_time: None,
                    close_reason: None,
                })
                .await?
        }
    };

    let position = Position {
        symbol: exch.symbol.clone(),
        side,
        mode,
        entry_price: exch.entry_price,
        original_qty: exch.qty(),
        remaining_qty: exch.qty(),
        leverage: exch.leverage.max(1),
        entry_time: now,
        futures_trade_id: trade_id,
        tp_levels: tp_plan_for(exch.entry_price, side, &mode_cfg.sltp),
        stop_loss: stop_loss_price(exch.entry_price, side, ADOPTED_SL_PERCENT),
        original_sl: stop_loss_price(exch.entry_price, side, ADOPTED_SL_PERCENT),
        moved_to_breakeven: false,
        trailing_active: false,
        highest_price: exch.entry_price,
        lowest_price: exch.entry_price,
        trailing_percent: mode_cfg.sltp.trailing_stop_percent,
        trailing_activation_percent: mode_cfg.sltp.trailing_stop_activation,
        stop_loss_algo_id: None,
        take_profit_algo_ids: Vec::new(),
        protection: ProtectionStatus::new(now),
        realized_pnl: 0.0,
        unrealized_pnl: exch.unrealized_pnl,
        custom_roi_percent: None,
        ultra_fast_signal: None,
        ultra_fast_target_percent: None,
        max_hold_time_secs: mode_cfg.max_hold_time_secs,
        source: SignalSource::Ai,
        strategy_id: None,
        strategy_name: None,
        decision: None,
        last_advisor_update: None,
    };

    {
        let mut state = ap.state.write();
        // Another task may have created it while we were minting the trade.
        if state.positions.contains_key(&exch.symbol) {
            return Ok(());
        }
        let margin = exch.entry_price * exch.qty() / exch.leverage.max(1) as f64;
        state.allocator.allocate(mode, margin);
        state.positions.insert(exch.symbol.clone(), position);
    }

    info!(
        symbol = %exch.symbol,
        %side,
        %mode,
        entry = exch.entry_price,
        qty = exch.qty(),
        "adopted external position"
    );

    if let Err(e) = placer::place_protection(ap, &exch.symbol).await {
        warn!(symbol = %exch.symbol, error = %e, "adopted position protection failed — guardian will heal");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Orphan sweep
// ---------------------------------------------------------------------------

/// Cancel algo orders for symbols with no position, or with suspiciously
/// many orders.
pub async fn sweep_orphan_orders(ap: &Arc<Autopilot>) -> anyhow::Result<()> {
    let client = ap.client();

    let orders = client.list_all_open_algo_orders().await?;
    let positions = client.get_positions().await?;

    let mut order_counts: HashMap<String, usize> = HashMap::new();
    for o in &orders {
        *order_counts.entry(o.symbol.clone()).or_insert(0) += 1;
    }
    let position_symbols: HashSet<String> =
        positions.iter().map(|p| p.symbol.clone()).collect();

    for symbol in plan_orphan_sweep(&order_counts, &position_symbols) {
        warn!(
            symbol = %symbol,
            orders = order_counts[&symbol],
            has_position = position_symbols.contains(&symbol),
            "orphan algo orders — cancelling all"
        );
        if let Err(e) = client.cancel_all_orders(&symbol).await {
            warn!(symbol = %symbol, error = %e, "orphan cancel failed");
        }
    }
    Ok(())
}

/// Standalone orphan-cleanup loop (5-minute cadence).
pub async fn run_orphan_cleanup(ap: Arc<Autopilot>, mut stop: watch::Receiver<bool>) {
    info!(user = %ap.user_id, interval_secs = ORPHAN_SWEEP_INTERVAL_SECS, "orphan-order cleanup started");

    let mut ticker = tokio::time::interval(Duration::from_secs(ORPHAN_SWEEP_INTERVAL_SECS));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop.changed() => {
                info!(user = %ap.user_id, "orphan cleanup stopping");
                return;
            }
        }
        if ap.client().limiter().circuit_open() {
            continue;
        }
        if let Err(e) = sweep_orphan_orders(&ap).await {
            warn!(user = %ap.user_id, error = %e, "orphan sweep failed");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn exch(symbol: &str, amt: f64, entry: f64) -> ExchangePosition {
        ExchangePosition {
            symbol: symbol.into(),
            position_side: "BOTH".into(),
            position_amt: amt,
            entry_price: entry,
            unrealized_pnl: 0.0,
            leverage: 5,
        }
    }

    #[test]
    fn plan_removes_vanished_positions() {
        let mut local = HashMap::new();
        local.insert("ETHUSDT".to_string(), (Side::Long, 1.0, 2000.0));

        let plan = plan_reconciliation(&local, &[]);
        assert_eq!(plan.to_remove, vec!["ETHUSDT"]);
        assert!(plan.to_adopt.is_empty());
    }

    #[test]
    fn plan_adopts_unknown_positions() {
        let local = HashMap::new();
        let plan = plan_reconciliation(&local, &[exch("ETHUSDT", 1.0, 2000.0)]);
        assert_eq!(plan.to_adopt.len(), 1);
        assert_eq!(plan.to_adopt[0].symbol, "ETHUSDT");
    }

    #[test]
    fn plan_removes_on_side_flip() {
        // Locally long, exchange short: treat the local record as stale.
        let mut local = HashMap::new();
        local.insert("ETHUSDT".to_string(), (Side::Long, 1.0, 2000.0));
        let plan = plan_reconciliation(&local, &[exch("ETHUSDT", -1.0, 2000.0)]);
        assert_eq!(plan.to_remove, vec!["ETHUSDT"]);
    }

    #[test]
    fn plan_resizes_on_drift() {
        let mut local = HashMap::new();
        local.insert("ETHUSDT".to_string(), (Side::Long, 1.0, 2000.0));

        // 2% shrink -> resize without entry update.
        let plan = plan_reconciliation(&local, &[exch("ETHUSDT", 0.98, 2000.0)]);
        assert_eq!(
            plan.to_resize,
            vec![Resize {
                symbol: "ETHUSDT".into(),
                new_qty: 0.98,
                new_entry: None,
            }]
        );

        // Growth (DCA) -> adopt the exchange entry too.
        let plan = plan_reconciliation(&local, &[exch("ETHUSDT", 2.0, 1950.0)]);
        assert_eq!(plan.to_resize[0].new_entry, Some(1950.0));
    }

    #[test]
    fn plan_tolerates_small_drift() {
        let mut local = HashMap::new();
        local.insert("ETHUSDT".to_string(), (Side::Long, 1.0, 2000.0));
        let plan = plan_reconciliation(&local, &[exch("ETHUSDT", 1.005, 2000.0)]);
        assert!(plan.to_resize.is_empty());
        assert!(plan.to_remove.is_empty());
    }

    fn fill(price: f64, qty: f64, pnl: f64, age_ms: i64, now_ms: i64) -> AccountTrade {
        AccountTrade {
            symbol: "ETHUSDT".into(),
            side: "SELL".into(),
            price,
            qty,
            realized_pnl: pnl,
            commission: 0.01,
            time: now_ms - age_ms,
        }
    }

    #[test]
    fn exit_summary_is_volume_weighted_and_windowed() {
        let now_ms = 10 * 60 * 1000 + EXIT_LOOKBACK_MS;
        let trades = vec![
            fill(2000.0, 1.0, 5.0, 60_000, now_ms),
            fill(2010.0, 3.0, 10.0, 120_000, now_ms),
            // Too old:
            fill(1900.0, 10.0, -50.0, EXIT_LOOKBACK_MS + 1, now_ms),
        ];
        let (pnl, vwap) = summarize_recent_exit(&trades, now_ms);
        assert!((pnl - 15.0).abs() < 1e-9);
        // (2000*1 + 2010*3) / 4 = 2007.5
        assert!((vwap - 2007.5).abs() < 1e-9);
    }

    #[test]
    fn exit_summary_empty_history() {
        let (pnl, vwap) = summarize_recent_exit(&[], 0);
        assert_eq!(pnl, 0.0);
        assert_eq!(vwap, 0.0);
    }

    #[test]
    fn adoption_prefers_swing_then_scalp_then_position() {
        use crate::settings::Settings;

        // Defaults enable Scalp and Swing: Swing wins despite Scalp coming
        // first in scan order.
        let mut settings = Settings::default();
        assert_eq!(adoption_mode(&settings), TradeMode::Swing);

        settings.modes.get_mut(&TradeMode::Swing).unwrap().enabled = false;
        assert_eq!(adoption_mode(&settings), TradeMode::Scalp);

        settings.modes.get_mut(&TradeMode::Scalp).unwrap().enabled = false;
        settings.modes.get_mut(&TradeMode::Position).unwrap().enabled = true;
        assert_eq!(adoption_mode(&settings), TradeMode::Position);
    }

    #[test]
    fn adoption_never_picks_ultra_fast() {
        use crate::settings::Settings;

        // Only UltraFast enabled: fall back to Swing rather than file an
        // adopted position under UltraFast.
        let mut settings = Settings::default();
        for cfg in settings.modes.values_mut() {
            cfg.enabled = false;
        }
        settings
            .modes
            .get_mut(&TradeMode::UltraFast)
            .unwrap()
            .enabled = true;
        assert_eq!(adoption_mode(&settings), TradeMode::Swing);
    }

    #[test]
    fn orphan_sweep_targets_positionless_and_crowded_symbols() {
        let mut counts = HashMap::new();
        counts.insert("AAAUSDT".to_string(), 2); // no position -> sweep
        counts.insert("BBBUSDT".to_string(), 2); // position, 2 orders -> keep
        counts.insert("CCCUSDT".to_string(), 5); // position, too many -> sweep

        let positions: HashSet<String> =
            ["BBBUSDT".to_string(), "CCCUSDT".to_string()].into();

        let doomed = plan_orphan_sweep(&counts, &positions);
        assert_eq!(doomed, vec!["AAAUSDT", "CCCUSDT"]);
    }
}
