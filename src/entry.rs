// =============================================================================
// Entry Executor — guardrails, sizing, fill verification, initial protection
// =============================================================================
//
// Turns an accepted signal into an open, protected position. Every step is
// recoverable: a failure before the market order leaves nothing behind; a
// failure after the fill either closes the position (immediate SL, failed
// protection) or leaves it for the guardian to secure.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::analyzer::{Decision, UltraFastSignal};
use crate::autopilot::Autopilot;
use crate::error::{EngineError, EngineResult};
use crate::exchange::models::FundingInfo;
use crate::indicators::{calculate_atr_pct, ATR_PERIOD};
use crate::position::{
    blend_sl_percent, single_tp_level, sl_hit, stop_loss_price, tp_plan_for, Position,
    ProtectionStatus,
};
use crate::protection::placer;
use crate::settings::{FundingConfig, SizeConfig};
use crate::storage::{FuturesTrade, TradeEvent};
use crate::types::{RiskLevel, Side, SignalSource, TradeMode};

/// Fill polling: attempts × delay.
const FILL_POLL_ATTEMPTS: u32 = 5;
const FILL_POLL_DELAY_SECS: u64 = 1;

// ---------------------------------------------------------------------------
// Entry request
// ---------------------------------------------------------------------------

/// Normalised entry request produced by the scanner / strategy evaluator.
#[derive(Debug, Clone)]
pub struct EntryRequest {
    pub symbol: String,
    pub side: Side,
    pub mode: TradeMode,
    /// 0–100.
    pub confidence: f64,
    pub source: SignalSource,
    pub suggested_sl_percent: Option<f64>,
    pub decision: Option<Decision>,
    pub ultra_fast: Option<UltraFastSignal>,
    pub strategy_id: Option<String>,
    pub strategy_name: Option<String>,
}

// ---------------------------------------------------------------------------
// Adaptive position sizing (pure)
// ---------------------------------------------------------------------------

/// Compute the USD margin to commit, before funding adjustment.
///
/// ```text
/// usable = available × safety_margin
/// base   = usable / (max_positions − current_positions)
/// size   = base × risk_multiplier × (conf_base + conf/100 × conf_scale)
/// ```
/// clamped to `[min, min(per_symbol_cap, max)]`; below min is a rejection.
pub fn compute_position_size(
    mode: TradeMode,
    available: f64,
    current_positions: u32,
    risk: RiskLevel,
    confidence: f64,
    cfg: &SizeConfig,
) -> EngineResult<f64> {
    if current_positions >= cfg.max_positions {
        return Err(EngineError::AllocationDenied {
            mode,
            reason: format!(
                "no free position slots ({current_positions}/{})",
                cfg.max_positions
            ),
        });
    }

    let usable = available * cfg.safety_margin;
    let base = usable / (cfg.max_positions - current_positions) as f64;
    let conf_m = cfg.confidence_base + (confidence / 100.0) * cfg.confidence_scale;
    let mut size = base * risk.multiplier() * conf_m;

    size = size.min(cfg.per_symbol_cap_usd).min(cfg.max_position_usd);

    if size < cfg.min_position_usd {
        return Err(EngineError::SizingTooSmall {
            size_usd: size,
            min_usd: cfg.min_position_usd,
        });
    }
    Ok(size)
}

// ---------------------------------------------------------------------------
// Funding gate (pure)
// ---------------------------------------------------------------------------

/// What the funding filter decided for an entry.
#[derive(Debug, Clone, PartialEq)]
pub enum FundingGate {
    Allow,
    /// Scale position size by this factor (0.75 elevated, 0.5 high).
    Scale(f64),
    Block(String),
}

/// Entry-time funding filter: block adverse funding close to the funding
/// event, scale size when the cost is elevated.
pub fn funding_gate(
    funding: &FundingInfo,
    side: Side,
    now_ms: i64,
    cfg: &FundingConfig,
) -> FundingGate {
    // Positive cost means this side pays.
    let cost = funding.rate * side.direction();
    let minutes = funding.minutes_until(now_ms);

    if cost > cfg.max_funding_rate && minutes > 0 && minutes < cfg.block_time_minutes {
        return FundingGate::Block(format!(
            "funding {:.4}% against {side} with {minutes} min to funding",
            funding.rate * 100.0
        ));
    }
    if cost > 2.0 * cfg.max_funding_rate {
        return FundingGate::Scale(0.5);
    }
    if cost > cfg.max_funding_rate {
        return FundingGate::Scale(0.75);
    }
    FundingGate::Allow
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// Execute one entry end-to-end. Returns the symbol's new position on
/// success.
pub async fn execute_entry(ap: &Arc<Autopilot>, req: EntryRequest) -> EngineResult<()> {
    let symbol = req.symbol.clone();
    let now = Utc::now();

    let mode_cfg = ap.settings.read().mode(req.mode);
    let funding_cfg = ap.settings.read().funding.clone();
    let settings = ap.settings.read().clone();

    // ── 1. Guardrails (under the lock) ───────────────────────────────────
    let (risk_level, current_positions) = {
        let mut state = ap.state.write();

        if state.positions.contains_key(&symbol) {
            return Err(EngineError::Validation {
                symbol: symbol.clone(),
                reason: "already holding a position".to_string(),
            });
        }
        if let Some(reason) = state.blocked.is_blocked(&symbol, now) {
            return Err(EngineError::CoinBlocked(format!("{symbol}: {reason}")));
        }
        let (ok, reason) = state.global_breaker.can_trade(now);
        if !ok {
            return Err(EngineError::CircuitOpen(
                reason.unwrap_or_else(|| "global breaker".to_string()),
            ));
        }
        if let Some(cb) = state.mode_breakers.get_mut(&req.mode) {
            let (ok, reason) = cb.can_trade(now);
            if !ok {
                return Err(EngineError::ModePaused {
                    mode: req.mode,
                    reason: reason.unwrap_or_else(|| "mode breaker".to_string()),
                });
            }
        }
        if let Some(safety) = state.mode_safety.get_mut(&req.mode) {
            let (ok, reason) = safety.can_trade(now, &mode_cfg.safety);
            if !ok {
                return Err(EngineError::ModePaused {
                    mode: req.mode,
                    reason: reason.unwrap_or_else(|| "mode safety".to_string()),
                });
            }
        }

        (state.risk_level, state.allocator.positions_in(req.mode))
    };

    let client = ap.client();

    // ── 2. Funding filter ────────────────────────────────────────────────
    let funding = client
        .get_funding(&symbol)
        .await
        .map_err(EngineError::Exchange)?;
    let funding_scale = match funding_gate(&funding, req.side, now.timestamp_millis(), &funding_cfg)
    {
        FundingGate::Block(reason) => return Err(EngineError::FundingAdverse(reason)),
        FundingGate::Scale(s) => s,
        FundingGate::Allow => 1.0,
    };

    // ── 3. Sizing ────────────────────────────────────────────────────────
    let available = client
        .get_available_balance()
        .await
        .map_err(EngineError::Exchange)?;
    {
        ap.state.write().allocator.update_balance(available);
    }

    let mut size_usd = compute_position_size(
        req.mode,
        available,
        current_positions,
        risk_level,
        req.confidence,
        &mode_cfg.size,
    )?;
    size_usd *= funding_scale;
    if size_usd < mode_cfg.size.min_position_usd {
        return Err(EngineError::SizingTooSmall {
            size_usd,
            min_usd: mode_cfg.size.min_position_usd,
        });
    }

    {
        let state = ap.state.read();
        let (ok, reason) = state.allocator.can_allocate(req.mode, size_usd, &settings);
        if !ok {
            return Err(EngineError::AllocationDenied {
                mode: req.mode,
                reason: reason.unwrap_or_default(),
            });
        }
    }

    // ── 4. Price, leverage, quantity ─────────────────────────────────────
    let price = client
        .get_mark_price(&symbol)
        .await
        .map_err(EngineError::Exchange)?;
    if price <= 0.0 {
        return Err(EngineError::Validation {
            symbol: symbol.clone(),
            reason: "no mark price available".to_string(),
        });
    }

    if let Err(e) = client.set_leverage(&symbol, mode_cfg.leverage).await {
        warn!(symbol = %symbol, error = %e, "leverage set failed — continuing with account default");
    }

    let rules = ap
        .validator
        .rules_for(&symbol)
        .await
        .map_err(EngineError::Exchange)?;
    let raw_qty = size_usd * mode_cfg.leverage as f64 / price;
    let outcome = crate::symbol_rules::validate_with(&rules, raw_qty, price, true);
    if !outcome.valid {
        return Err(EngineError::Validation {
            symbol: symbol.clone(),
            reason: outcome.errors.join("; "),
        });
    }
    let qty = outcome.rounded_qty;

    // ── 5. Market order + fill verification ──────────────────────────────
    let position_side = ap.state.read().position_side_for(req.side);
    {
        let mut state = ap.state.write();
        state.allocator.allocate(req.mode, size_usd);
    }

    let ack = match client
        .place_market_order(&symbol, req.side.entry_order_side(), position_side, qty)
        .await
    {
        Ok(ack) => ack,
        Err(e) => {
            ap.state.write().allocator.release(req.mode, size_usd, true);
            return Err(EngineError::OrderRejected(e.to_string()));
        }
    };

    let fill_price = match verify_fill(ap, &symbol, ack.order_id, ack.avg_price).await {
        Ok(p) => p,
        Err(e) => {
            ap.state.write().allocator.release(req.mode, size_usd, true);
            let _ = client.cancel_order(&symbol, ack.order_id).await;
            return Err(e);
        }
    };

    // ── 6. SL/TP recalculated against the ACTUAL fill price ─────────────
    let atr_pct = client
        .get_klines(&symbol, req.mode.timeframe(), (ATR_PERIOD + 10) as u32)
        .await
        .ok()
        .and_then(|k| calculate_atr_pct(&k, ATR_PERIOD));

    let sl_percent = blend_sl_percent(req.suggested_sl_percent, atr_pct, &mode_cfg.sltp);
    let stop_loss = ap.validator.round_price_for_sl(
        &symbol,
        stop_loss_price(fill_price, req.side, sl_percent),
        req.side,
    );

    let mut tp_levels = match &req.ultra_fast {
        Some(signal) if signal.min_profit_target > 0.0 => {
            let target = signal
                .min_profit_target
                .max(mode_cfg.sltp.take_profit_percent);
            single_tp_level(fill_price, req.side, target)
        }
        _ => tp_plan_for(fill_price, req.side, &mode_cfg.sltp),
    };
    for tp in &mut tp_levels {
        tp.trigger_price = ap
            .validator
            .round_price_for_tp(&symbol, tp.trigger_price, req.side);
    }

    // ── 7. Persist the trade, create the position record ─────────────────
    let trade = FuturesTrade {
        id: String::new(),
        user_id: ap.user_id.clone(),
        symbol: symbol.clone(),
        side: req.side,
        mode: req.mode,
        entry_price: fill_price,
        exit_price: None,
        quantity: qty,
        leverage: mode_cfg.leverage,
        realized_pnl: 0.0,
        status: "OPEN".to_string(),
        trade_source: match req.source {
            SignalSource::Ai => "autopilot".to_string(),
            SignalSource::Strategy => "strategy".to_string(),
        },
        open_time: now,
        close_time: None,
        close_reason: None,
    };
    let trade_id = ap
        .store
        .create_trade(trade)
        .await
        .map_err(EngineError::Exchange)?;

    let ultra_fast_target = req.ultra_fast.as_ref().map(|s| {
        s.min_profit_target
            .max(mode_cfg.sltp.take_profit_percent)
    });

    let position = Position {
        symbol: symbol.clone(),
        side: req.side,
        mode: req.mode,
        entry_price: fill_price,
        original_qty: qty,
        remaining_qty: qty,
        leverage: mode_cfg.leverage,
        entry_time: now,
        futures_trade_id: trade_id,
        tp_levels,
        stop_loss,
        original_sl: stop_loss,
        moved_to_breakeven: false,
        trailing_active: false,
        highest_price: fill_price,
        lowest_price: fill_price,
        trailing_percent: mode_cfg.sltp.trailing_stop_percent,
        trailing_activation_percent: mode_cfg.sltp.trailing_stop_activation,
        stop_loss_algo_id: None,
        take_profit_algo_ids: Vec::new(),
        protection: ProtectionStatus::new(now),
        realized_pnl: 0.0,
        unrealized_pnl: 0.0,
        custom_roi_percent: None,
        ultra_fast_signal: req.ultra_fast.clone(),
        ultra_fast_target_percent: ultra_fast_target,
        max_hold_time_secs: mode_cfg.max_hold_time_secs,
        source: req.source,
        strategy_id: req.strategy_id.clone(),
        strategy_name: req.strategy_name.clone(),
        decision: req.decision.clone(),
        last_advisor_update: None,
    };

    {
        let mut state = ap.state.write();
        state.positions.insert(symbol.clone(), position);
        state.daily_trades += 1;
        state.global_breaker.record_entry(now);
        if let Some(cb) = state.mode_breakers.get_mut(&req.mode) {
            cb.record_entry(now);
        }
        if let Some(safety) = state.mode_safety.get_mut(&req.mode) {
            safety.record_entry(now);
        }
    }

    ap.events.log_event(
        &ap.user_id,
        TradeEvent::PositionOpened {
            symbol: symbol.clone(),
            side: req.side,
            mode: req.mode,
            entry_price: fill_price,
            quantity: qty,
            leverage: mode_cfg.leverage,
        },
    );

    info!(
        user = %ap.user_id,
        symbol = %symbol,
        side = %req.side,
        mode = %req.mode,
        fill_price,
        qty,
        size_usd,
        stop_loss,
        confidence = req.confidence,
        "position opened"
    );

    // ── 8. Immediate-SL sanity, then initial protection ──────────────────
    let current = client.get_mark_price(&symbol).await.unwrap_or(fill_price);
    if sl_hit(current, stop_loss, req.side) {
        warn!(symbol = %symbol, stop_loss, current, "SL would trigger immediately — aborting entry");
        let _ = ap.execute_market_close(&symbol, "immediate_stop_loss").await;
        return Err(EngineError::ImmediateStopLoss {
            stop_loss,
            price: current,
        });
    }

    if let Err(e) = placer::place_protection(ap, &symbol).await {
        // Strict policy: an entry whose SL cannot be placed is closed
        // rather than left for the guardian.
        warn!(symbol = %symbol, error = %e, "initial SL placement failed — closing entry");
        let _ = ap
            .execute_market_close(&symbol, "protection_placement_failed")
            .await;
        return Err(EngineError::ProtectionFailure {
            symbol: symbol.clone(),
            reason: e.to_string(),
        });
    }

    Ok(())
}

/// Poll the entry order until it fills. Returns the fill price.
async fn verify_fill(
    ap: &Arc<Autopilot>,
    symbol: &str,
    order_id: u64,
    ack_avg_price: f64,
) -> EngineResult<f64> {
    if ack_avg_price > 0.0 {
        return Ok(ack_avg_price);
    }

    let client = ap.client();
    for _ in 0..FILL_POLL_ATTEMPTS {
        tokio::time::sleep(Duration::from_secs(FILL_POLL_DELAY_SECS)).await;

        match client.query_order(symbol, order_id).await {
            Ok(info) if info.is_filled() => {
                return Ok(if info.avg_price > 0.0 {
                    info.avg_price
                } else {
                    ack_avg_price
                });
            }
            Ok(info) if info.is_working() => continue,
            Ok(info) => {
                return Err(EngineError::OrderRejected(format!(
                    "order {order_id} on {symbol} ended {status}",
                    status = info.status
                )));
            }
            Err(e) => {
                warn!(symbol, order_id, error = %e, "fill poll failed");
            }
        }
    }

    Err(EngineError::OrderNotFilled {
        symbol: symbol.to_string(),
        order_id,
        waited_secs: FILL_POLL_ATTEMPTS as u64 * FILL_POLL_DELAY_SECS,
    })
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn size_cfg() -> SizeConfig {
        SizeConfig {
            safety_margin: 0.9,
            confidence_base: 0.8,
            confidence_scale: 0.4,
            min_position_usd: 10.0,
            max_position_usd: 500.0,
            per_symbol_cap_usd: 250.0,
            max_positions: 3,
        }
    }

    #[test]
    fn sizing_formula_caps_at_per_symbol_limit() {
        // usable = 1000*0.9 = 900; base = 900/3 = 300;
        // conf_m = 0.8 + 0.75*0.4 = 1.1; size = 300*0.8*1.1 = 264 -> capped 250.
        let size =
            compute_position_size(TradeMode::Scalp, 1000.0, 0, RiskLevel::Moderate, 75.0, &size_cfg()).unwrap();
        assert!((size - 250.0).abs() < 1e-9);
    }

    #[test]
    fn sizing_scales_with_free_slots() {
        // 2 slots used of 3: base = 900/1 = 900 -> conservative 0.6, conf 50:
        // conf_m = 1.0; 900*0.6*1.0 = 540 -> cap 250.
        let size =
            compute_position_size(TradeMode::Scalp, 1000.0, 2, RiskLevel::Conservative, 50.0, &size_cfg()).unwrap();
        assert!((size - 250.0).abs() < 1e-9);

        // Small balance: 100*0.9/3 = 30; aggressive conf 100: 30*1.0*1.2 = 36.
        let size =
            compute_position_size(TradeMode::Scalp, 100.0, 0, RiskLevel::Aggressive, 100.0, &size_cfg()).unwrap();
        assert!((size - 36.0).abs() < 1e-9);
    }

    #[test]
    fn sizing_rejects_below_minimum() {
        let err =
            compute_position_size(TradeMode::Scalp, 20.0, 0, RiskLevel::Conservative, 0.0, &size_cfg()).unwrap_err();
        assert!(matches!(err, EngineError::SizingTooSmall { .. }));
    }

    #[test]
    fn sizing_rejects_when_no_slots() {
        let err =
            compute_position_size(TradeMode::Scalp, 1000.0, 3, RiskLevel::Moderate, 50.0, &size_cfg()).unwrap_err();
        assert!(matches!(err, EngineError::AllocationDenied { .. }));
    }

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
    fn funding_blocks_adverse_rate_near_funding() {
        let funding = FundingInfo {
            rate: 0.0005,
            next_funding_time: 20 * 60_000, // 20 min away
        };
        // Longs pay positive funding.
        let gate = funding_gate(&funding, Side::Long, 0, &funding_cfg());
        assert!(matches!(gate, FundingGate::Block(_)));

        // Shorts RECEIVE positive funding — allowed.
        let gate = funding_gate(&funding, Side::Short, 0, &funding_cfg());
        assert_eq!(gate, FundingGate::Allow);
    }

    #[test]
    fn funding_scales_when_far_from_funding() {
        let funding = FundingInfo {
            rate: 0.0005,
            next_funding_time: 4 * 60 * 60_000, // 4 h away
        };
        let gate = funding_gate(&funding, Side::Long, 0, &funding_cfg());
        assert_eq!(gate, FundingGate::Scale(0.75));

        let funding = FundingInfo {
            rate: 0.0008, // > 2 × max
            next_funding_time: 4 * 60 * 60_000,
        };
        let gate = funding_gate(&funding, Side::Long, 0, &funding_cfg());
        assert_eq!(gate, FundingGate::Scale(0.5));
    }

    #[test]
    fn funding_neutral_rate_allows() {
        let funding = FundingInfo {
            rate: 0.0001,
            next_funding_time: 5 * 60_000,
        };
        assert_eq!(
            funding_gate(&funding, Side::Long, 0, &funding_cfg()),
            FundingGate::Allow
        );
    }
}
