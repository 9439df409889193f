// =============================================================================
// Adaptive SL/TP Updater — advisor-driven stop management with strict rules
// =============================================================================
//
// Runs on a 10-second base cadence but touches a position only when its
// mode-specific advisor interval has elapsed (60 s / 300 s / 900 s).
//
// Advisor recommendations are untrusted. A suggested SL must pass:
//   Rule 1 — direction: LONG needs new_sl < price, SHORT needs new_sl > price
//   Rule 2 — never widen: LONG needs new_sl ≥ current, SHORT needs ≤
//   Rule 3 — bounded move: |new − current| / current ≤ 10 %
//   Rule 4 — min distance: |price − new_sl| ≥ 0.5 × ATR(14)
//
// Three consecutive rejections flip the per-symbol kill switch; the advisor
// is then ignored for that symbol until a manual reset.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::advisor::{AdvisorAction, PositionInfo};
use crate::autopilot::Autopilot;
use crate::indicators::{calculate_atr, ATR_PERIOD};
use crate::journal::{LlmSwitch, SlUpdateRecord, SlUpdateStatus};
use crate::position::{sl_hit, TpStatus};
use crate::protection::placer;
use crate::storage::TradeEvent;
use crate::types::Side;

/// Base cadence of the updater loop.
const BASE_INTERVAL_SECS: u64 = 10;
/// Consecutive rejections before the per-symbol kill switch flips.
const KILL_SWITCH_AFTER: u32 = 3;
/// Advisor verdicts below this confidence are ignored.
const MIN_CONFIDENCE: f64 = 0.5;
/// Rule 3 bound: maximum SL move as a fraction of the current SL.
const MAX_SL_MOVE_FRACTION: f64 = 0.10;
/// Rule 4: minimum distance between price and SL, in ATRs.
const MIN_ATR_DISTANCE: f64 = 0.5;
/// Klines fetched per consultation.
const KLINE_COUNT: u32 = 50;

// ---------------------------------------------------------------------------
// Validation (pure)
// ---------------------------------------------------------------------------

/// Validate an advisor-recommended SL against the never-widen / bounded-move
/// / ATR-distance policy. Returns the violated rule on rejection.
pub fn validate_sl_update(
    side: Side,
    current_price: f64,
    current_sl: f64,
    new_sl: f64,
    atr: Option<f64>,
) -> Result<(), String> {
    // Rule 1 — direction.
    match side {
        Side::Long if new_sl >= current_price => {
            return Err(format!(
                "Rule 1: SL must be below price for LONG (new {new_sl} >= price {current_price})"
            ));
        }
        Side::Short if new_sl <= current_price => {
            return Err(format!(
                "Rule 1: SL must be above price for SHORT (new {new_sl} <= price {current_price})"
            ));
        }
        _ => {}
    }

    // Rule 2 — never widen.
    if current_sl > 0.0 {
        match side {
            Side::Long if new_sl < current_sl => {
                return Err(format!(
                    "Rule 2: Cannot widen SL for LONG (new {new_sl} < current {current_sl})"
                ));
            }
            Side::Short if new_sl > current_sl => {
                return Err(format!(
                    "Rule 2: Cannot widen SL for SHORT (new {new_sl} > current {current_sl})"
                ));
            }
            _ => {}
        }

        // Rule 3 — bounded move.
        let move_fraction = (new_sl - current_sl).abs() / current_sl;
        if move_fraction > MAX_SL_MOVE_FRACTION {
            return Err(format!(
                "Rule 3: SL move {:.1}% exceeds {:.0}% bound",
                move_fraction * 100.0,
                MAX_SL_MOVE_FRACTION * 100.0
            ));
        }
    }

    // Rule 4 — minimum ATR distance.
    if let Some(atr) = atr {
        if atr > 0.0 {
            let distance = (current_price - new_sl).abs();
            let min_distance = MIN_ATR_DISTANCE * atr;
            if distance < min_distance {
                return Err(format!(
                    "Rule 4: SL within {MIN_ATR_DISTANCE}×ATR of price ({distance:.6} < {min_distance:.6})"
                ));
            }
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Rejection bookkeeping
// ---------------------------------------------------------------------------

/// Record a rejected advisor SL and bump the bad-call counter. Returns true
/// when this rejection flipped the kill switch.
pub fn record_sl_rejection(
    ap: &Autopilot,
    symbol: &str,
    rule: &str,
    old_sl: f64,
    new_sl: f64,
) -> bool {
    let now = Utc::now();
    let mut state = ap.state.write();

    state.sl_update_log.push(SlUpdateRecord {
        time: now,
        symbol: symbol.to_string(),
        status: SlUpdateStatus::Rejected,
        rejection_rule: Some(rule.to_string()),
        old_sl,
        new_sl,
        source: "advisor".to_string(),
    });

    let count = state
        .bad_llm_calls
        .entry(symbol.to_string())
        .and_modify(|c| *c += 1)
        .or_insert(1);
    let count = *count;

    warn!(symbol, rule, bad_calls = count, "advisor SL rejected");

    if count >= KILL_SWITCH_AFTER && !state.llm_sl_disabled.contains(symbol) {
        state.llm_sl_disabled.insert(symbol.to_string());
        state.llm_switches.push(LlmSwitch {
            time: now,
            symbol: symbol.to_string(),
            disabled: true,
            reason: format!("{count} consecutive rejected SL updates"),
        });
        warn!(symbol, "advisor SL kill switch ACTIVATED");
        return true;
    }
    false
}

fn record_sl_applied(ap: &Autopilot, symbol: &str, old_sl: f64, new_sl: f64) {
    let mut state = ap.state.write();
    state.sl_update_log.push(SlUpdateRecord {
        time: Utc::now(),
        symbol: symbol.to_string(),
        status: SlUpdateStatus::Applied,
        rejection_rule: None,
        old_sl,
        new_sl,
        source: "advisor".to_string(),
    });
    state.bad_llm_calls.remove(symbol);
}

// ---------------------------------------------------------------------------
// Loop
// ---------------------------------------------------------------------------

/// Run the adaptive updater. Spawned once per Autopilot.
pub async fn run_adaptive_updater(ap: Arc<Autopilot>, mut stop: watch::Receiver<bool>) {
    info!(user = %ap.user_id, base_secs = BASE_INTERVAL_SECS, "adaptive SL/TP updater started");

    let mut ticker = tokio::time::interval(Duration::from_secs(BASE_INTERVAL_SECS));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop.changed() => {
                info!(user = %ap.user_id, "adaptive updater stopping");
                return;
            }
        }
        if ap.client().limiter().circuit_open() {
            continue;
        }
        refresh_all_positions(ap.clone(), false).await;
    }
}

/// Consult the advisor for every due position. Returns how many positions
/// were actually reviewed.
pub async fn refresh_all_positions(ap: Arc<Autopilot>, force: bool) -> usize {
    let now = Utc::now();

    let due: Vec<String> = {
        let settings = ap.settings.read();
        let state = ap.state.read();
        state
            .positions
            .values()
            .filter(|p| !state.llm_sl_disabled.contains(&p.symbol))
            .filter(|p| {
                force
                    || match p.last_advisor_update {
                        None => true,
                        Some(last) => {
                            let interval =
                                settings.mode(p.mode).advisor_interval_secs as i64;
                            (now - last).num_seconds() >= interval
                        }
                    }
            })
            .map(|p| p.symbol.clone())
            .collect()
    };

    let mut touched = 0usize;
    for symbol in due {
        match update_symbol(&ap, &symbol).await {
            Ok(true) => touched += 1,
            Ok(false) => {}
            Err(e) => warn!(symbol = %symbol, error = %e, "advisor update failed"),
        }
    }
    touched
}

/// One advisor consultation for one symbol. Returns whether the advisor was
/// actually called.
async fn update_symbol(ap: &Arc<Autopilot>, symbol: &str) -> anyhow::Result<bool> {
    let now = Utc::now();

    let Some((info_base, mode)) = ({
        let state = ap.state.read();
        state.positions.get(symbol).map(|p| {
            (
                PositionInfo {
                    symbol: p.symbol.clone(),
                    side: p.side,
                    mode: p.mode,
                    entry_price: p.entry_price,
                    current_price: 0.0,
                    quantity: p.remaining_qty,
                    unrealized_pnl: p.unrealized_pnl,
                    pnl_percent: 0.0,
                    current_sl: p.stop_loss,
                    current_tp: p
                        .next_pending_tp()
                        .map(|t| t.trigger_price)
                        .unwrap_or(0.0),
                    hold_duration_secs: p.hold_duration_secs(now),
                },
                p.mode,
            )
        })
    }) else {
        return Ok(false);
    };

    let client = ap.client();
    let klines = client
        .get_klines(symbol, mode.timeframe(), KLINE_COUNT)
        .await?;
    let price = client.get_mark_price(symbol).await?;
    let atr = calculate_atr(&klines, ATR_PERIOD);

    let mut info = info_base;
    info.current_price = price;
    info.pnl_percent = if info.entry_price > 0.0 {
        info.side.direction() * (price - info.entry_price) / info.entry_price * 100.0
    } else {
        0.0
    };

    let verdict = ap.advisor.review_position(&info, &klines).await?;

    // Stamp the consultation time; re-check existence after the RPCs.
    {
        let mut state = ap.state.write();
        let Some(p) = state.positions.get_mut(symbol) else {
            return Ok(false);
        };
        p.last_advisor_update = Some(now);
    }

    if verdict.confidence < MIN_CONFIDENCE {
        debug!(symbol, confidence = verdict.confidence, "advisor verdict below confidence floor");
        return Ok(true);
    }

    if verdict.action == AdvisorAction::CloseNow {
        info!(symbol, urgency = %verdict.urgency, "advisor requested immediate close");
        let _ = client.cancel_all_orders(symbol).await;
        ap.execute_market_close(symbol, "advisor_close").await?;
        return Ok(true);
    }

    let current_sl = info.current_sl;
    let new_sl = verdict.recommended_sl;

    if new_sl > 0.0 && (new_sl - current_sl).abs() > f64::EPSILON {
        match validate_sl_update(info.side, price, current_sl, new_sl, atr) {
            Err(rule) => {
                record_sl_rejection(ap, symbol, &rule, current_sl, new_sl);
                return Ok(true);
            }
            Ok(()) => {
                if sl_hit(price, new_sl, info.side) {
                    info!(symbol, new_sl, price, "advisor SL would trigger immediately — closing");
                    let _ = client.cancel_all_orders(symbol).await;
                    ap.execute_market_close(symbol, "advisor_sl_immediate").await?;
                    return Ok(true);
                }

                placer::replace_stop_loss(ap, symbol, new_sl).await?;
                record_sl_applied(ap, symbol, current_sl, new_sl);
                ap.events.log_event(
                    &ap.user_id,
                    TradeEvent::SlRevised {
                        symbol: symbol.to_string(),
                        old_sl: current_sl,
                        new_sl,
                        source: "advisor".to_string(),
                    },
                );
                info!(symbol, old_sl = current_sl, new_sl, reasoning = %verdict.sl_reasoning, "advisor SL applied");
            }
        }
    }

    // TP update: scale every pending level by new_tp1 / current_tp1 —
    // monotonic-preserving.
    let current_tp1 = info.current_tp;
    if verdict.recommended_tp > 0.0 && current_tp1 > 0.0 {
        let factor = verdict.recommended_tp / current_tp1;
        if factor.is_finite() && factor > 0.0 && (factor - 1.0).abs() > 1e-6 {
            {
                let mut state = ap.state.write();
                let Some(p) = state.positions.get_mut(symbol) else {
                    return Ok(true);
                };
                for level in p
                    .tp_levels
                    .iter_mut()
                    .filter(|l| l.status == TpStatus::Pending)
                {
                    level.trigger_price *= factor;
                }
            }
            if let Err(e) = placer::place_tp_only(ap, symbol).await {
                warn!(symbol, error = %e, "TP refresh after advisor scale failed");
            }
            debug!(symbol, factor, "TP ladder rescaled from advisor target");
        }
    }

    Ok(true)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::advisor::NullAdvisor;
    use crate::analyzer::FixedAnalyzer;
    use crate::exchange::ExchangeClient;
    use crate::position::{build_tp_levels, stop_loss_price, Position, ProtectionStatus};
    use crate::settings::Settings;
    use crate::storage::MemoryStore;
    use crate::types::{SignalSource, TradeMode};

    #[test]
    fn rule1_rejects_sl_on_wrong_side_of_price() {
        let err = validate_sl_update(Side::Long, 60_000.0, 59_500.0, 60_100.0, None).unwrap_err();
        assert!(err.starts_with("Rule 1"));

        let err = validate_sl_update(Side::Short, 60_000.0, 60_500.0, 59_900.0, None).unwrap_err();
        assert!(err.starts_with("Rule 1"));
    }

    #[test]
    fn rule2_never_widen() {
        // LONG at 60000 with SL 59500; a suggestion of 59000 widens the stop.
        let err = validate_sl_update(Side::Long, 60_000.0, 59_500.0, 59_000.0, None).unwrap_err();
        assert!(
            err.contains("Rule 2: Cannot widen SL for LONG (new 59000 < current 59500)"),
            "got: {err}"
        );

        let err = validate_sl_update(Side::Short, 60_000.0, 60_400.0, 60_600.0, None).unwrap_err();
        assert!(err.starts_with("Rule 2"));
    }

    #[test]
    fn rule3_bounded_move() {
        // 59500 -> 65700 would be a 10.4% move (and rejected by rule 1 as
        // well); use a tighter scenario: current 50000, new 56000 = 12%.
        let err =
            validate_sl_update(Side::Long, 60_000.0, 50_000.0, 56_000.0, None).unwrap_err();
        assert!(err.starts_with("Rule 3"), "got: {err}");
    }

    #[test]
    fn rule4_min_atr_distance() {
        // ATR 800: SL must stay at least 400 away from price.
        let err = validate_sl_update(Side::Long, 60_000.0, 59_500.0, 59_700.0, Some(800.0))
            .unwrap_err();
        assert!(err.starts_with("Rule 4"), "got: {err}");

        // 59,500 is 500 away — fine.
        validate_sl_update(Side::Long, 60_000.0, 59_400.0, 59_500.0, Some(800.0)).unwrap();
    }

    #[test]
    fn tightening_within_bounds_passes() {
        validate_sl_update(Side::Long, 60_000.0, 59_000.0, 59_400.0, Some(400.0)).unwrap();
        validate_sl_update(Side::Short, 60_000.0, 61_000.0, 60_500.0, Some(400.0)).unwrap();
    }

    fn test_autopilot() -> Arc<Autopilot> {
        let store = Arc::new(MemoryStore::new());
        Autopilot::new(
            "u1",
            Arc::new(ExchangeClient::new("k", "s")),
            Arc::new(FixedAnalyzer::new()),
            Arc::new(NullAdvisor),
            store.clone(),
            store,
            Settings::default(),
        )
    }

    fn btc_position() -> Position {
        let entry = 60_000.0;
        Position {
            symbol: "BTCUSDT".into(),
            side: Side::Long,
            mode: TradeMode::Swing,
            entry_price: entry,
            original_qty: 0.1,
            remaining_qty: 0.1,
            leverage: 5,
            entry_time: Utc::now(),
            futures_trade_id: "t1".into(),
            tp_levels: build_tp_levels(entry, Side::Long, &[1.0, 2.0, 3.0, 4.0], &[25.0; 4]),
            stop_loss: 59_500.0,
            original_sl: stop_loss_price(entry, Side::Long, 2.0),
            moved_to_breakeven: false,
            trailing_active: false,
            highest_price: entry,
            lowest_price: entry,
            trailing_percent: 1.0,
            trailing_activation_percent: 1.5,
            stop_loss_algo_id: None,
            take_profit_algo_ids: Vec::new(),
            protection: ProtectionStatus::new(Utc::now()),
            realized_pnl: 0.0,
            unrealized_pnl: 0.0,
            custom_roi_percent: None,
            ultra_fast_signal: None,
            ultra_fast_target_percent: None,
            max_hold_time_secs: 0,
            source: SignalSource::Ai,
            strategy_id: None,
            strategy_name: None,
            decision: None,
            last_advisor_update: None,
        }
    }

    #[test]
    fn kill_switch_after_three_rejections() {
        let ap = test_autopilot();
        ap.insert_position(btc_position());

        // Three consecutive rejections flip the switch.
        assert!(!record_sl_rejection(&ap, "BTCUSDT", "Rule 2: ...", 59_500.0, 59_000.0));
        assert_eq!(ap.state.read().bad_llm_calls["BTCUSDT"], 1);

        assert!(!record_sl_rejection(&ap, "BTCUSDT", "Rule 1: ...", 59_500.0, 61_000.0));
        let flipped = record_sl_rejection(&ap, "BTCUSDT", "Rule 3: ...", 59_500.0, 53_000.0);
        assert!(flipped);
        assert!(ap.state.read().llm_sl_disabled.contains("BTCUSDT"));

        // History recorded all three rejections.
        let history = ap.get_sl_update_history(10);
        assert_eq!(history.len(), 3);
        assert!(history
            .iter()
            .all(|r| r.status == SlUpdateStatus::Rejected));

        // Manual reset clears it.
        assert!(ap.reset_llm_sl_for_symbol("BTCUSDT"));
        assert!(!ap.state.read().llm_sl_disabled.contains("BTCUSDT"));
        assert!(!ap.state.read().bad_llm_calls.contains_key("BTCUSDT"));
    }

    #[test]
    fn applied_update_resets_bad_counter() {
        let ap = test_autopilot();
        ap.insert_position(btc_position());

        record_sl_rejection(&ap, "BTCUSDT", "Rule 2: ...", 59_500.0, 59_000.0);
        record_sl_rejection(&ap, "BTCUSDT", "Rule 2: ...", 59_500.0, 59_100.0);
        record_sl_applied(&ap, "BTCUSDT", 59_500.0, 59_600.0);

        assert!(!ap.state.read().bad_llm_calls.contains_key("BTCUSDT"));
        // Two more rejections must NOT flip the switch (counter restarted).
        assert!(!record_sl_rejection(&ap, "BTCUSDT", "Rule 2: ...", 59_600.0, 59_000.0));
        assert!(!record_sl_rejection(&ap, "BTCUSDT", "Rule 2: ...", 59_600.0, 59_000.0));
        assert!(!ap.state.read().llm_sl_disabled.contains("BTCUSDT"));
    }

    #[tokio::test]
    async fn disabled_symbols_are_skipped() {
        let ap = test_autopilot();
        ap.insert_position(btc_position());
        ap.state.write().llm_sl_disabled.insert("BTCUSDT".into());

        // The only position is disabled, so nothing is due and no RPC is made.
        let touched = refresh_all_positions(ap, false).await;
        assert_eq!(touched, 0);
    }
}
