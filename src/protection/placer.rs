// =============================================================================
// SL/TP Order Placer — total-replacement protection placement
// =============================================================================
//
// Contract: after `place_protection` returns Ok, at most one SL and one TP
// algo order exist for the position on the exchange, matching `stop_loss`
// and the next-due TP level, and the local algo-order ids reflect that.
//
// Total replacement (cancel-all + place) is used instead of diff-based
// updates: it stays correct in the presence of orphan orders.
//
// Retries: cancellation 3 attempts with 50/100/150 ms backoff then a 500 ms
// settle; placements 3 attempts with 500 ms × attempt backoff.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::autopilot::Autopilot;
use crate::exchange::models::AlgoOrderRequest;
use crate::exchange::{ExchangeClient, OrderAck};
use crate::position::{tp_hit, ProtectionState, TpStatus};
use crate::storage::TradeEvent;
use crate::types::Side;

/// Placement attempts for algo orders.
const PLACE_ATTEMPTS: u32 = 3;
/// Cancellation attempts.
const CANCEL_ATTEMPTS: u32 = 3;
/// Backoff per cancellation attempt (ms): 50, 100, 150.
const CANCEL_BACKOFF_MS: u64 = 50;
/// Settle delay after a successful cancel-all.
const CANCEL_SETTLE_MS: u64 = 500;

/// What `place_protection` did.
#[derive(Debug, Clone, Default)]
pub struct PlacementOutcome {
    pub sl_order_id: Option<u64>,
    pub tp_order_id: Option<u64>,
    /// The next TP was already past price and was executed at market.
    pub late_tp_executed: bool,
}

/// Quantity for one TP slice.
pub fn tp_slice_qty(original_qty: f64, allocation_percent: f64) -> f64 {
    original_qty * allocation_percent / 100.0
}

// ---------------------------------------------------------------------------
// Retry helpers
// ---------------------------------------------------------------------------

/// Cancel every open order for `symbol`, with bounded retries.
pub async fn cancel_all_with_retries(client: &ExchangeClient, symbol: &str) -> Result<()> {
    let mut last_err = None;
    for attempt in 1..=CANCEL_ATTEMPTS {
        match client.cancel_all_orders(symbol).await {
            Ok(()) => {
                tokio::time::sleep(Duration::from_millis(CANCEL_SETTLE_MS)).await;
                return Ok(());
            }
            Err(e) => {
                warn!(symbol, attempt, error = %e, "cancel-all failed");
                last_err = Some(e);
                tokio::time::sleep(Duration::from_millis(CANCEL_BACKOFF_MS * attempt as u64))
                    .await;
            }
        }
    }
    Err(last_err
        .unwrap_or_else(|| anyhow::anyhow!("cancel-all failed"))
        .context(format!("cancel-all for {symbol} exhausted retries")))
}

/// Place an algo order with linear-backoff retries.
pub async fn place_algo_with_retries(
    client: &ExchangeClient,
    req: &AlgoOrderRequest,
) -> Result<OrderAck> {
    let mut last_err = None;
    for attempt in 1..=PLACE_ATTEMPTS {
        match client.place_algo_order(req).await {
            Ok(ack) => return Ok(ack),
            Err(e) => {
                warn!(
                    symbol = %req.symbol,
                    order_type = %req.order_type,
                    attempt,
                    error = %e,
                    "algo order placement failed"
                );
                last_err = Some(e);
                tokio::time::sleep(Duration::from_millis(500 * attempt as u64)).await;
            }
        }
    }
    Err(last_err
        .unwrap_or_else(|| anyhow::anyhow!("placement failed"))
        .context(format!(
            "{} placement for {} exhausted retries",
            req.order_type, req.symbol
        )))
}

// ---------------------------------------------------------------------------
// Full protection placement
// ---------------------------------------------------------------------------

/// Cancel-all then place the SL and the next-due TP for `symbol`.
pub async fn place_protection(ap: &Arc<Autopilot>, symbol: &str) -> Result<PlacementOutcome> {
    // Copy everything we need, then release the lock.
    let (side, position_side, stop_loss, next_tp, original_qty, remaining_qty) = {
        let mut state = ap.state.write();
        let hedge = state.hedge_mode;
        let Some(p) = state.positions.get_mut(symbol) else {
            return Ok(PlacementOutcome::default());
        };
        p.protection.set_state(ProtectionState::PlacingSl, Utc::now());
        let position_side = if hedge { p.side.position_side() } else { "BOTH" };
        (
            p.side,
            position_side,
            p.stop_loss,
            p.next_pending_tp().cloned(),
            p.original_qty,
            p.remaining_qty,
        )
    };

    let client = ap.client();

    // (a) total replacement starts from a clean slate.
    cancel_all_with_retries(&client, symbol).await?;

    // (b) local ids no longer point at anything.
    {
        let mut state = ap.state.write();
        if let Some(p) = state.positions.get_mut(symbol) {
            p.stop_loss_algo_id = None;
            p.take_profit_algo_ids.clear();
        } else {
            return Ok(PlacementOutcome::default());
        }
    }

    let mut outcome = PlacementOutcome::default();

    // (c) stop-loss first — it is the protection that matters.
    let sl_price = ap.validator.round_price_for_sl(symbol, stop_loss, side);
    let sl_req = AlgoOrderRequest {
        symbol: symbol.to_string(),
        side: side.exit_order_side().to_string(),
        position_side: position_side.to_string(),
        order_type: "STOP_MARKET".to_string(),
        trigger_price: sl_price,
        quantity: None,
        close_position: true,
    };
    let sl_ack = place_algo_with_retries(&client, &sl_req).await?;
    outcome.sl_order_id = Some(sl_ack.order_id);

    {
        let mut state = ap.state.write();
        if let Some(p) = state.positions.get_mut(symbol) {
            p.stop_loss_algo_id = Some(sl_ack.order_id);
            p.protection.set_state(ProtectionState::PlacingTp, Utc::now());
        }
    }

    // (d) the next-due TP, if the ladder still has one.
    let mut placed_tp_price = None;
    if let Some(tp) = next_tp {
        let price = client.get_mark_price(symbol).await.unwrap_or(0.0);

        if price > 0.0 && tp_hit(price, tp.trigger_price, side) {
            // Late-TP fast path: the market already ran through the trigger.
            outcome.late_tp_executed =
                execute_late_tp(ap, symbol, side, position_side, original_qty, remaining_qty, &tp)
                    .await;
        } else {
            let is_final = {
                let state = ap.state.read();
                state
                    .positions
                    .get(symbol)
                    .map(|p| p.next_tp_is_final())
                    .unwrap_or(true)
            };
            let tp_price = ap.validator.round_price_for_tp(symbol, tp.trigger_price, side);
            let qty = ap
                .validator
                .round_qty(symbol, tp_slice_qty(original_qty, tp.allocation_percent));

            let tp_req = AlgoOrderRequest {
                symbol: symbol.to_string(),
                side: side.exit_order_side().to_string(),
                position_side: position_side.to_string(),
                order_type: "TAKE_PROFIT_MARKET".to_string(),
                trigger_price: tp_price,
                quantity: (!is_final).then_some(qty),
                close_position: is_final,
            };

            match place_algo_with_retries(&client, &tp_req).await {
                Ok(ack) => {
                    outcome.tp_order_id = Some(ack.order_id);
                    placed_tp_price = Some(tp_price);
                    let mut state = ap.state.write();
                    if let Some(p) = state.positions.get_mut(symbol) {
                        p.take_profit_algo_ids.insert(0, ack.order_id);
                    }
                }
                // A missing TP is partial protection, not a failure: the
                // guardian's partial heal re-attempts it.
                Err(e) => warn!(symbol, error = %e, "TP placement failed — SL remains in place"),
            }
        }
    }

    ap.events.log_event(
        &ap.user_id,
        TradeEvent::SlTpPlaced {
            symbol: symbol.to_string(),
            stop_loss: sl_price,
            take_profit: placed_tp_price,
        },
    );

    info!(
        symbol,
        sl_order = ?outcome.sl_order_id,
        tp_order = ?outcome.tp_order_id,
        late_tp = outcome.late_tp_executed,
        "protection placed"
    );
    Ok(outcome)
}

/// The next TP is already past price: close the slice at market and advance
/// the ladder. Rolled back (level left pending) when the market order fails.
async fn execute_late_tp(
    ap: &Arc<Autopilot>,
    symbol: &str,
    side: Side,
    position_side: &str,
    original_qty: f64,
    remaining_qty: f64,
    tp: &crate::position::TpLevel,
) -> bool {
    let client = ap.client();
    let is_final = {
        let state = ap.state.read();
        state
            .positions
            .get(symbol)
            .map(|p| p.next_tp_is_final())
            .unwrap_or(true)
    };
    let qty = if is_final {
        remaining_qty
    } else {
        ap.validator
            .round_qty(symbol, tp_slice_qty(original_qty, tp.allocation_percent))
    };

    match client
        .place_market_order(symbol, side.exit_order_side(), position_side, qty)
        .await
    {
        Ok(ack) => {
            let exit_price = if ack.avg_price > 0.0 {
                ack.avg_price
            } else {
                tp.trigger_price
            };

            if is_final {
                ap.finalize_close(symbol, exit_price, "take_profit_final").await;
            } else {
                {
                    let mut state = ap.state.write();
                    if let Some(p) = state.positions.get_mut(symbol) {
                        if let Some(level) = p.next_pending_tp_mut() {
                            level.status = TpStatus::Hit;
                        }
                    }
                    state.tp_hit_times.push(Utc::now());
                }
                ap.finalize_partial_close(symbol, qty, exit_price, "take_profit_late")
                    .await;
                ap.events.log_event(
                    &ap.user_id,
                    TradeEvent::TpHit {
                        symbol: symbol.to_string(),
                        level: tp.level,
                        trigger_price: tp.trigger_price,
                        closed_qty: qty,
                    },
                );
            }
            info!(symbol, level = tp.level, qty, "late TP executed at market");
            true
        }
        Err(e) => {
            // Strict roll-back: the level stays pending and the ladder will
            // be retried on the next placement.
            warn!(symbol, level = tp.level, error = %e, "late TP market order failed — level left pending");
            false
        }
    }
}

// ---------------------------------------------------------------------------
// Targeted updates (keep the other leg intact)
// ---------------------------------------------------------------------------

/// Replace only the stop-loss order: cancel the tracked SL algo and place a
/// new one at `new_sl`. The TP leg is untouched.
pub async fn replace_stop_loss(ap: &Arc<Autopilot>, symbol: &str, new_sl: f64) -> Result<()> {
    let (side, old_id) = {
        let state = ap.state.read();
        let Some(p) = state.positions.get(symbol) else {
            return Ok(());
        };
        (p.side, p.stop_loss_algo_id)
    };
    let position_side = ap.state.read().position_side_for(side);
    let client = ap.client();

    if let Some(id) = old_id {
        if let Err(e) = client.cancel_order(symbol, id).await {
            debug!(symbol, order_id = id, error = %e, "old SL cancel failed (may already be gone)");
        }
    }

    let sl_price = ap.validator.round_price_for_sl(symbol, new_sl, side);
    let req = AlgoOrderRequest {
        symbol: symbol.to_string(),
        side: side.exit_order_side().to_string(),
        position_side: position_side.to_string(),
        order_type: "STOP_MARKET".to_string(),
        trigger_price: sl_price,
        quantity: None,
        close_position: true,
    };
    let ack = place_algo_with_retries(&client, &req).await?;

    let mut state = ap.state.write();
    if let Some(p) = state.positions.get_mut(symbol) {
        p.stop_loss = sl_price;
        p.stop_loss_algo_id = Some(ack.order_id);
    }
    Ok(())
}

/// Place only the next-due TP (guardian partial heal — the SL is alive and
/// must not be cancelled).
pub async fn place_tp_only(ap: &Arc<Autopilot>, symbol: &str) -> Result<()> {
    let (side, tp, original_qty, is_final, old_ids) = {
        let state = ap.state.read();
        let Some(p) = state.positions.get(symbol) else {
            return Ok(());
        };
        let Some(tp) = p.next_pending_tp().cloned() else {
            return Ok(());
        };
        (
            p.side,
            tp,
            p.original_qty,
            p.next_tp_is_final(),
            p.take_profit_algo_ids.clone(),
        )
    };
    let position_side = ap.state.read().position_side_for(side);
    let client = ap.client();

    // Drop any stale TP orders we still track.
    for id in old_ids {
        let _ = client.cancel_order(symbol, id).await;
    }

    let tp_price = ap.validator.round_price_for_tp(symbol, tp.trigger_price, side);
    let qty = ap
        .validator
        .round_qty(symbol, tp_slice_qty(original_qty, tp.allocation_percent));

    let req = AlgoOrderRequest {
        symbol: symbol.to_string(),
        side: side.exit_order_side().to_string(),
        position_side: position_side.to_string(),
        order_type: "TAKE_PROFIT_MARKET".to_string(),
        trigger_price: tp_price,
        quantity: (!is_final).then_some(qty),
        close_position: is_final,
    };
    let ack = place_algo_with_retries(&client, &req).await?;

    let mut state = ap.state.write();
    if let Some(p) = state.positions.get_mut(symbol) {
        p.take_profit_algo_ids = vec![ack.order_id];
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tp_slice_is_share_of_original_qty() {
        assert!((tp_slice_qty(0.5, 25.0) - 0.125).abs() < 1e-12);
        assert!((tp_slice_qty(1.0, 100.0) - 1.0).abs() < 1e-12);
        assert_eq!(tp_slice_qty(0.0, 25.0), 0.0);
    }
}
