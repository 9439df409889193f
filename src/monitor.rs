// =============================================================================
// Position Monitor — 5-second management loop for every open position
// =============================================================================
//
// Per tick, per position, strictly in this order:
//   funding-exit -> proactive breakeven -> trailing activation -> trailing
//   update -> early profit booking -> stop-loss -> take-profits -> trailing
//   exit (-> max-hold exit).
//
// The loop snapshots symbols under the read lock, fetches prices outside any
// lock, then re-acquires per position and re-checks existence — the
// reconciler may delete a position between two acquisitions.
//
// Every 6th tick a reconciliation pass is launched; every 12th tick an
// orphan-order sweep. UltraFast positions are managed by their own faster
// loop.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::autopilot::Autopilot;
use crate::exchange::models::PremiumIndex;
use crate::position::{sl_hit, tp_hit, TpStatus};
use crate::protection::placer;
use crate::settings::FundingConfig;
use crate::storage::TradeEvent;
use crate::types::{Side, TradeMode};

/// Main monitor cadence.
const MONITOR_INTERVAL_SECS: u64 = 5;
/// Launch a reconciliation every N ticks (≈ 30 s).
const RECONCILE_EVERY_TICKS: u64 = 6;
/// Launch an orphan sweep every N ticks (≈ 60 s).
const ORPHAN_EVERY_TICKS: u64 = 12;
/// Slack subtracted from the trailing distance when checking the pullback.
const TRAILING_EXIT_SLACK: f64 = 0.01;

// ---------------------------------------------------------------------------
// Pure decision helpers
// ---------------------------------------------------------------------------

/// Pre-funding exit: within the exit window, close a profitable position
/// whose upcoming funding fee would eat too much of the profit (or whose
/// rate is outright extreme).
pub fn funding_exit_reason(
    side: Side,
    pnl_usd: f64,
    notional_usd: f64,
    funding_rate: f64,
    minutes_until_funding: i64,
    cfg: &FundingConfig,
) -> Option<String> {
    if minutes_until_funding <= 0 || minutes_until_funding > cfg.exit_time_minutes {
        return None;
    }
    // This side only pays when rate × direction is positive.
    let pays = funding_rate * side.direction() > 0.0;
    if !pays || pnl_usd <= 0.0 {
        return None;
    }

    let fee = funding_rate.abs() * notional_usd;
    if funding_rate.abs() >= cfg.extreme_rate {
        return Some(format!(
            "funding_rate_exit: extreme rate {:.4}% in {minutes_until_funding} min",
            funding_rate * 100.0
        ));
    }
    if fee > cfg.fee_threshold_percent / 100.0 * pnl_usd {
        return Some(format!(
            "funding_rate_exit: fee {fee:.2} > {:.0}% of profit {pnl_usd:.2}",
            cfg.fee_threshold_percent
        ));
    }
    None
}

/// Resolve the early profit-booking ROI threshold.
/// Priority: per-position custom > per-user-per-symbol > per-symbol >
/// mode default (TP% × leverage), floored.
pub fn early_booking_threshold(
    custom_roi: Option<f64>,
    user_symbol_roi: Option<f64>,
    symbol_roi: Option<f64>,
    mode_tp_percent: f64,
    leverage: u32,
    floor: f64,
) -> f64 {
    let threshold = custom_roi
        .or(user_symbol_roi)
        .or(symbol_roi)
        .unwrap_or(mode_tp_percent * leverage as f64);
    threshold.max(floor)
}

// ---------------------------------------------------------------------------
// Loops
// ---------------------------------------------------------------------------

/// Main monitor: every open position except UltraFast ones.
pub async fn run_position_monitor(ap: Arc<Autopilot>, mut stop: watch::Receiver<bool>) {
    info!(user = %ap.user_id, interval_secs = MONITOR_INTERVAL_SECS, "position monitor started");

    let mut ticker = tokio::time::interval(Duration::from_secs(MONITOR_INTERVAL_SECS));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut tick: u64 = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop.changed() => {
                info!(user = %ap.user_id, "position monitor stopping");
                return;
            }
        }
        tick += 1;

        if ap.client().limiter().circuit_open() {
            debug!(user = %ap.user_id, "monitor skipping cycle — rate-limit circuit open");
            continue;
        }

        monitor_pass(&ap, |mode| mode != TradeMode::UltraFast).await;

        if tick % RECONCILE_EVERY_TICKS == 0 {
            let ap = ap.clone();
            tokio::spawn(async move {
                if let Err(e) = crate::reconcile::reconcile_once(ap).await {
                    warn!(error = %e, "background reconciliation failed");
                }
            });
        }
        if tick % ORPHAN_EVERY_TICKS == 0 {
            let ap = ap.clone();
            tokio::spawn(async move {
                if let Err(e) = crate::reconcile::sweep_orphan_orders(&ap).await {
                    warn!(error = %e, "background orphan sweep failed");
                }
            });
        }
    }
}

/// Faster loop dedicated to UltraFast positions.
pub async fn run_ultra_fast_monitor(ap: Arc<Autopilot>, mut stop: watch::Receiver<bool>) {
    let interval_secs = ap.settings.read().ultra_fast_monitor_secs.max(1);
    info!(user = %ap.user_id, interval_secs, "ultra-fast monitor started");

    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop.changed() => {
                info!(user = %ap.user_id, "ultra-fast monitor stopping");
                return;
            }
        }
        if ap.client().limiter().circuit_open() {
            continue;
        }
        monitor_pass(&ap, |mode| mode == TradeMode::UltraFast).await;
    }
}

/// One pass over the positions selected by `filter`.
async fn monitor_pass(ap: &Arc<Autopilot>, filter: impl Fn(TradeMode) -> bool) {
    // 1. Snapshot under the read lock.
    let symbols: Vec<String> = ap
        .state
        .read()
        .positions
        .values()
        .filter(|p| filter(p.mode))
        .map(|p| p.symbol.clone())
        .collect();

    if symbols.is_empty() {
        return;
    }

    // 2. Fetch prices (and funding) outside the lock.
    let client = ap.client();
    for symbol in symbols {
        let idx = match client.get_premium_index(&symbol).await {
            Ok(idx) => idx,
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "price fetch failed — next tick retries");
                continue;
            }
        };
        if idx.mark_price <= 0.0 {
            warn!(symbol = %symbol, "invalid mark price — skipping");
            continue;
        }
        if let Err(e) = monitor_symbol(ap, &symbol, &idx).await {
            warn!(symbol = %symbol, error = %e, "monitor pass failed for symbol");
        }
    }
}

// ---------------------------------------------------------------------------
// Per-symbol evaluation
// ---------------------------------------------------------------------------

async fn monitor_symbol(
    ap: &Arc<Autopilot>,
    symbol: &str,
    idx: &PremiumIndex,
) -> anyhow::Result<()> {
    let now = Utc::now();
    let price = idx.mark_price;
    let settings = ap.settings.read().clone();

    // 3. Re-acquire, re-check, update marks, and copy the working set.
    struct Working {
        side: Side,
        mode: TradeMode,
        pnl_usd: f64,
        pnl_percent: f64,
        notional: f64,
        stop_loss: f64,
        moved_to_breakeven: bool,
        trailing_active: bool,
        current_tp_level: usize,
        custom_roi: Option<f64>,
        leverage: u32,
        roi_after_fees: f64,
        max_hold_exceeded: bool,
        breakeven_sl: f64,
        trailing_candidate: f64,
        trailing_activation: f64,
        trailing_percent: f64,
        pullback: f64,
        improves_trailing: bool,
    }

    let w = {
        let mut state = ap.state.write();
        let Some(p) = state.positions.get_mut(symbol) else {
            return Ok(());
        };

        p.update_water_marks(price);
        let (pnl_usd, pnl_percent) = p.pnl_at(price);
        p.unrealized_pnl = pnl_usd;

        let candidate = p.trailing_candidate();
        Working {
            side: p.side,
            mode: p.mode,
            pnl_usd,
            pnl_percent,
            notional: price * p.remaining_qty,
            stop_loss: p.stop_loss,
            moved_to_breakeven: p.moved_to_breakeven,
            trailing_active: p.trailing_active,
            current_tp_level: p.current_tp_level(),
            custom_roi: p.custom_roi_percent,
            leverage: p.leverage,
            roi_after_fees: p.roi_after_fees(price, settings.taker_fee_percent),
            max_hold_exceeded: p.max_hold_time_secs > 0
                && p.hold_duration_secs(now) > p.max_hold_time_secs,
            breakeven_sl: p.breakeven_sl(settings.breakeven_buffer_percent),
            trailing_candidate: candidate,
            trailing_activation: p.trailing_activation_percent,
            trailing_percent: p.trailing_percent,
            pullback: p.pullback_percent(price),
            improves_trailing: p.improves_sl(candidate, settings.trailing_sl_update_threshold),
        }
    };
    let mode_cfg = settings.mode(w.mode);

    // ── Funding exit ────────────────────────────────────────────────────
    let minutes_to_funding = (idx.next_funding_time - now.timestamp_millis()) / 60_000;
    if let Some(reason) = funding_exit_reason(
        w.side,
        w.pnl_usd,
        w.notional,
        idx.last_funding_rate,
        minutes_to_funding,
        &settings.funding,
    ) {
        info!(symbol, %reason, "pre-funding exit");
        ap.execute_market_close(symbol, &reason).await?;
        return Ok(());
    }

    // ── Proactive breakeven ─────────────────────────────────────────────
    if !w.moved_to_breakeven
        && w.current_tp_level == 0
        && w.pnl_percent >= settings.proactive_breakeven_percent
    {
        info!(symbol, new_sl = w.breakeven_sl, "proactive breakeven move");
        if placer::replace_stop_loss(ap, symbol, w.breakeven_sl).await.is_ok() {
            let mut state = ap.state.write();
            if let Some(p) = state.positions.get_mut(symbol) {
                p.moved_to_breakeven = true;
            }
            drop(state);
            ap.events.log_event(
                &ap.user_id,
                TradeEvent::MovedToBreakeven {
                    symbol: symbol.to_string(),
                    new_sl: w.breakeven_sl,
                },
            );
        }
    }

    // ── Trailing activation ─────────────────────────────────────────────
    if mode_cfg.sltp.trailing_stop_enabled && !w.trailing_active {
        let tp1_secured = w.current_tp_level >= 1 && w.moved_to_breakeven;
        if tp1_secured || w.pnl_percent >= w.trailing_activation {
            let mut state = ap.state.write();
            if let Some(p) = state.positions.get_mut(symbol) {
                p.trailing_active = true;
            }
            drop(state);
            info!(symbol, "trailing stop armed");
            ap.events.log_event(
                &ap.user_id,
                TradeEvent::TrailingActivated {
                    symbol: symbol.to_string(),
                },
            );
        }
    }

    // ── Trailing SL update (debounced) ──────────────────────────────────
    let trailing_now = ap
        .state
        .read()
        .positions
        .get(symbol)
        .map(|p| p.trailing_active)
        .unwrap_or(false);
    if trailing_now && w.improves_trailing {
        debug!(symbol, candidate = w.trailing_candidate, "trailing SL update");
        if placer::replace_stop_loss(ap, symbol, w.trailing_candidate).await.is_ok() {
            ap.events.log_event(
                &ap.user_id,
                TradeEvent::TrailingUpdated {
                    symbol: symbol.to_string(),
                    new_sl: w.trailing_candidate,
                },
            );
        }
    }

    // ── Early profit booking ────────────────────────────────────────────
    if w.current_tp_level == 0 {
        let user_roi = ap
            .store
            .symbol_roi(&ap.user_id, symbol)
            .await
            .unwrap_or(None);
        let threshold = early_booking_threshold(
            w.custom_roi,
            user_roi,
            settings.symbol_roi_override.get(symbol).copied(),
            mode_cfg.sltp.take_profit_percent,
            w.leverage,
            settings.early_roi_floor_percent,
        );
        if w.roi_after_fees >= threshold {
            info!(
                symbol,
                roi = w.roi_after_fees,
                threshold,
                "early profit booking"
            );
            ap.execute_market_close(symbol, "early_profit").await?;
            return Ok(());
        }
    }

    // ── Stop-loss ───────────────────────────────────────────────────────
    if sl_hit(price, w.stop_loss, w.side) {
        info!(symbol, price, stop_loss = w.stop_loss, "stop-loss hit");
        ap.execute_market_close(symbol, "stop_loss").await?;
        return Ok(());
    }

    // ── Take-profits ────────────────────────────────────────────────────
    if process_take_profits(ap, symbol, price, &settings).await? {
        // Position fully closed by the final TP.
        return Ok(());
    }

    // ── Trailing exit ───────────────────────────────────────────────────
    let trailing_now = ap
        .state
        .read()
        .positions
        .get(symbol)
        .map(|p| p.trailing_active)
        .unwrap_or(false);
    if trailing_now && w.pullback >= w.trailing_percent - TRAILING_EXIT_SLACK {
        info!(symbol, pullback = w.pullback, "trailing-stop exit");
        ap.execute_market_close(symbol, "trailing_stop").await?;
        return Ok(());
    }

    // ── Max hold time (UltraFast / Scalp) ───────────────────────────────
    if w.max_hold_exceeded {
        info!(symbol, "max hold time exceeded");
        ap.execute_market_close(symbol, "max_hold_time").await?;
    }

    Ok(())
}

/// Walk the TP ladder. Returns true when the position was fully closed.
async fn process_take_profits(
    ap: &Arc<Autopilot>,
    symbol: &str,
    price: f64,
    settings: &crate::settings::Settings,
) -> anyhow::Result<bool> {
    loop {
        // Copy the next pending level under the lock.
        let Some((tp, side, original_qty, is_final, active_tp_order, position_side)) = ({
            let state = ap.state.read();
            state.positions.get(symbol).and_then(|p| {
                p.next_pending_tp().map(|tp| {
                    (
                        tp.clone(),
                        p.side,
                        p.original_qty,
                        p.next_tp_is_final(),
                        p.take_profit_algo_ids.first().copied(),
                        state.position_side_for(p.side),
                    )
                })
            })
        }) else {
            return Ok(false);
        };

        if !tp_hit(price, tp.trigger_price, side) {
            return Ok(false);
        }

        let client = ap.client();

        // If the exchange algo order already fired, only advance local state.
        let exchange_already_filled = match active_tp_order {
            Some(order_id) => match client.query_order(symbol, order_id).await {
                Ok(info) => matches!(info.status.as_str(), "TRIGGERED" | "FILLED"),
                Err(_) => false,
            },
            None => false,
        };

        if is_final {
            // Final level: the whole remainder goes.
            if exchange_already_filled {
                ap.finalize_close(symbol, tp.trigger_price, "take_profit_final")
                    .await;
            } else {
                ap.execute_market_close(symbol, "take_profit_final").await?;
            }
            ap.state.write().tp_hit_times.push(Utc::now());
            ap.events.log_event(
                &ap.user_id,
                TradeEvent::TpHit {
                    symbol: symbol.to_string(),
                    level: tp.level,
                    trigger_price: tp.trigger_price,
                    closed_qty: 0.0,
                },
            );
            return Ok(true);
        }

        let slice = ap
            .validator
            .round_qty(symbol, placer::tp_slice_qty(original_qty, tp.allocation_percent));

        let exit_price = if exchange_already_filled {
            tp.trigger_price
        } else {
            match client
                .place_market_order(symbol, side.exit_order_side(), position_side, slice)
                .await
            {
                Ok(ack) if ack.avg_price > 0.0 => ack.avg_price,
                Ok(_) => tp.trigger_price,
                Err(e) => {
                    ap.state.write().failed_close_times.push(Utc::now());
                    warn!(symbol, level = tp.level, error = %e, "TP partial close failed");
                    return Ok(false);
                }
            }
        };

        // Mark the level hit and advance.
        {
            let mut state = ap.state.write();
            let Some(p) = state.positions.get_mut(symbol) else {
                return Ok(false);
            };
            if let Some(level) = p.next_pending_tp_mut() {
                level.status = TpStatus::Hit;
            }
            state.tp_hit_times.push(Utc::now());
        }

        ap.finalize_partial_close(symbol, slice, exit_price, &format!("take_profit_{}", tp.level))
            .await;

        ap.events.log_event(
            &ap.user_id,
            TradeEvent::TpHit {
                symbol: symbol.to_string(),
                level: tp.level,
                trigger_price: tp.trigger_price,
                closed_qty: slice,
            },
        );

        // Breakeven after TP1.
        let needs_breakeven = {
            let state = ap.state.read();
            state
                .positions
                .get(symbol)
                .map(|p| tp.level == 1 && !p.moved_to_breakeven)
                .unwrap_or(false)
        };
        if needs_breakeven {
            let be = {
                let state = ap.state.read();
                state
                    .positions
                    .get(symbol)
                    .map(|p| p.breakeven_sl(settings.breakeven_buffer_percent))
            };
            if let Some(be) = be {
                if placer::replace_stop_loss(ap, symbol, be).await.is_ok() {
                    let mut state = ap.state.write();
                    if let Some(p) = state.positions.get_mut(symbol) {
                        p.moved_to_breakeven = true;
                    }
                    drop(state);
                    ap.events.log_event(
                        &ap.user_id,
                        TradeEvent::MovedToBreakeven {
                            symbol: symbol.to_string(),
                            new_sl: be,
                        },
                    );
                }
            }
        }

        // Put the next TP level on the exchange.
        if let Err(e) = placer::place_tp_only(ap, symbol).await {
            warn!(symbol, error = %e, "next TP placement failed — guardian will heal");
        }

        info!(symbol, level = tp.level, slice, exit_price, "TP level banked");
        // Loop: a gap move may have run through several levels.
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn funding_cfg() -> FundingConfig {
        FundingConfig {
            max_funding_rate: 0.0003,
            block_time_minutes: 30,
            exit_time_minutes: 10,
            fee_threshold_percent: 30.0,
            extreme_rate: 0.004,
        }
    }

    #[test]
    fn funding_exit_when_fee_eats_profit() {
        // LONG, 8 min to funding, rate +0.004: fee $4 eats >30% of the $10 profit.
        let reason = funding_exit_reason(Side::Long, 10.0, 1000.0, 0.004, 8, &funding_cfg());
        assert!(reason.is_some());
    }

    #[test]
    fn funding_exit_skips_receiving_side() {
        // Shorts receive positive funding — no exit.
        let reason = funding_exit_reason(Side::Short, 10.0, 1000.0, 0.004, 8, &funding_cfg());
        assert!(reason.is_none());
    }

    #[test]
    fn funding_exit_requires_window() {
        // 20 min out — outside the 10-minute exit window.
        let reason = funding_exit_reason(Side::Long, 10.0, 1000.0, 0.004, 20, &funding_cfg());
        assert!(reason.is_none());
    }

    #[test]
    fn funding_exit_requires_profit() {
        let reason = funding_exit_reason(Side::Long, -5.0, 1000.0, 0.004, 8, &funding_cfg());
        assert!(reason.is_none());
    }

    #[test]
    fn funding_exit_small_fee_tolerated() {
        // Fee 0.0002 × 1000 = $0.20 against $10 profit: under 30%.
        let reason = funding_exit_reason(Side::Long, 10.0, 1000.0, 0.0002, 8, &funding_cfg());
        assert!(reason.is_none());
    }

    #[test]
    fn early_booking_priority_chain() {
        // Per-position custom wins.
        let t = early_booking_threshold(Some(3.0), Some(2.0), Some(1.0), 0.6, 5, 0.1);
        assert_eq!(t, 3.0);
        // Then per-user-per-symbol.
        let t = early_booking_threshold(None, Some(2.0), Some(1.0), 0.6, 5, 0.1);
        assert_eq!(t, 2.0);
        // Then per-symbol.
        let t = early_booking_threshold(None, None, Some(1.0), 0.6, 5, 0.1);
        assert_eq!(t, 1.0);
        // Then mode default TP% × leverage.
        let t = early_booking_threshold(None, None, None, 0.6, 5, 0.1);
        assert!((t - 3.0).abs() < 1e-9);
    }

    #[test]
    fn early_booking_floor_applies() {
        let t = early_booking_threshold(Some(0.01), None, None, 0.6, 5, 0.1);
        assert_eq!(t, 0.1);
    }
}
