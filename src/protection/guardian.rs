// =============================================================================
// Protection Guardian — verifies SL/TP exist on the exchange, heals, escalates
// =============================================================================
//
// Every 5 seconds, for every open position:
//   1. List open algo orders and classify: SL present? TP present?
//   2. Both present            -> Protected
//      SL present, TP missing  -> SlVerified (acceptable; partial heal
//                                 after 10 s of TP absence)
//      SL missing              -> Unprotected -> heal
//   3. Heal: cancel-all, 300 ms, replay full placement, 500 ms, re-verify.
//   4. Escalate to Emergency (market close) when the position stayed
//      unprotected for > 30 s or healing failed 3 times.
//
// All mutations of algo-order ids happen under the engine lock; the monitor
// and the guardian never race on them.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::autopilot::Autopilot;
use crate::exchange::models::AlgoOrder;
use crate::position::{ProtectionState, ProtectionStatus};
use crate::protection::placer;
use crate::types::Side;

/// Guardian cadence.
const GUARDIAN_INTERVAL_SECS: u64 = 5;
/// Unprotected longer than this escalates to emergency close.
const UNPROTECTED_ESCALATION_SECS: i64 = 30;
/// Heal attempts before escalation.
const MAX_HEAL_ATTEMPTS: u32 = 3;
/// TP absent longer than this triggers the partial heal.
const TP_MISSING_HEAL_SECS: i64 = 10;
/// Settle delay between cancel-all and replay during healing.
const HEAL_CANCEL_SETTLE_MS: u64 = 300;
/// Settle delay between replay and re-verification.
const HEAL_VERIFY_DELAY_MS: u64 = 500;

/// Pure classification of one position's exchange-side protection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtectionVerdict {
    pub sl_present: bool,
    pub tp_present: bool,
}

/// Classify the open algo orders for a position on `side`.
pub fn classify_orders(orders: &[AlgoOrder], side: Side) -> ProtectionVerdict {
    let sl_present = orders
        .iter()
        .any(|o| o.is_stop_loss() && o.matches_position_side(side));
    let tp_present = orders
        .iter()
        .any(|o| o.is_take_profit() && o.matches_position_side(side));
    ProtectionVerdict {
        sl_present,
        tp_present,
    }
}

/// Whether a position in this protection state must be escalated.
pub fn should_escalate(protection: &ProtectionStatus, now: chrono::DateTime<Utc>) -> bool {
    if protection.heal_attempts >= MAX_HEAL_ATTEMPTS {
        return true;
    }
    match protection.unprotected_since {
        Some(since) => (now - since).num_seconds() > UNPROTECTED_ESCALATION_SECS,
        None => false,
    }
}

/// Run the guardian loop. Spawned once per Autopilot.
pub async fn run_guardian(ap: Arc<Autopilot>, mut stop: watch::Receiver<bool>) {
    info!(user = %ap.user_id, interval_secs = GUARDIAN_INTERVAL_SECS, "protection guardian started");

    let mut ticker = tokio::time::interval(Duration::from_secs(GUARDIAN_INTERVAL_SECS));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop.changed() => {
                info!(user = %ap.user_id, "protection guardian stopping");
                return;
            }
        }

        if ap.client().limiter().circuit_open() {
            debug!(user = %ap.user_id, "guardian skipping cycle — rate-limit circuit open");
            continue;
        }

        let symbols: Vec<String> = ap.state.read().positions.keys().cloned().collect();
        for symbol in symbols {
            if *stop.borrow() {
                return;
            }
            if let Err(e) = guard_symbol(&ap, &symbol).await {
                warn!(symbol = %symbol, error = %e, "guardian cycle failed for symbol");
            }
        }
    }
}

/// One guardian pass over one symbol.
async fn guard_symbol(ap: &Arc<Autopilot>, symbol: &str) -> anyhow::Result<()> {
    let side = match ap.state.read().positions.get(symbol) {
        Some(p) => p.side,
        None => return Ok(()),
    };

    let orders = ap.client().list_open_algo_orders(symbol).await?;
    let verdict = classify_orders(&orders, side);
    let now = Utc::now();

    // Commit the verdict and decide the next action under the lock.
    #[derive(PartialEq)]
    enum Action {
        None,
        Heal,
        PartialHeal,
        Escalate,
    }

    let action = {
        let mut state = ap.state.write();
        let Some(p) = state.positions.get_mut(symbol) else {
            return Ok(());
        };

        // Expected TP only while the ladder still has pending levels.
        let tp_expected = p.next_pending_tp().is_some();

        p.protection.sl_verified = verdict.sl_present;
        if verdict.sl_present {
            p.protection.sl_verified_at = Some(now);
        }
        p.protection.tp_verified = verdict.tp_present;
        if verdict.tp_present {
            p.protection.tp_verified_at = Some(now);
            p.protection.tp_missing_since = None;
        } else if tp_expected && p.protection.tp_missing_since.is_none() {
            p.protection.tp_missing_since = Some(now);
        }

        if p.protection.state == ProtectionState::Emergency {
            Action::Escalate
        } else if verdict.sl_present && (verdict.tp_present || !tp_expected) {
            p.protection.set_state(ProtectionState::Protected, now);
            p.protection.heal_attempts = 0;
            Action::None
        } else if verdict.sl_present {
            p.protection.set_state(ProtectionState::SlVerified, now);
            let tp_overdue = p
                .protection
                .tp_missing_since
                .map(|t| (now - t).num_seconds() > TP_MISSING_HEAL_SECS)
                .unwrap_or(false);
            if tp_overdue {
                Action::PartialHeal
            } else {
                Action::None
            }
        } else {
            p.protection.set_state(ProtectionState::Unprotected, now);
            if should_escalate(&p.protection, now) {
                p.protection.set_state(ProtectionState::Emergency, now);
                Action::Escalate
            } else {
                Action::Heal
            }
        }
    };

    match action {
        Action::None => {}
        Action::PartialHeal => {
            // SL is alive — add the TP without touching the SL.
            info!(symbol, "TP missing — partial heal");
            if let Err(e) = placer::place_tp_only(ap, symbol).await {
                warn!(symbol, error = %e, "partial TP heal failed");
            }
        }
        Action::Heal => heal_symbol(ap, symbol, side).await,
        Action::Escalate => {
            error!(symbol, "protection unhealable — EMERGENCY close");
            match ap
                .execute_market_close(symbol, "emergency_close: protection unhealable")
                .await
            {
                Ok(()) => {}
                Err(e) => {
                    // The record stays; the next tick retries the close.
                    error!(symbol, error = %e, "emergency close failed — will retry");
                }
            }
        }
    }

    Ok(())
}

/// Full heal: cancel-all, replay placement, re-verify.
async fn heal_symbol(ap: &Arc<Autopilot>, symbol: &str, side: Side) {
    warn!(symbol, "position UNPROTECTED — healing");

    {
        let mut state = ap.state.write();
        let Some(p) = state.positions.get_mut(symbol) else {
            return;
        };
        p.protection.set_state(ProtectionState::Healing, Utc::now());
        p.protection.heal_attempts += 1;
    }

    let client = ap.client();
    if let Err(e) = placer::cancel_all_with_retries(&client, symbol).await {
        warn!(symbol, error = %e, "heal: cancel-all failed");
    }
    tokio::time::sleep(Duration::from_millis(HEAL_CANCEL_SETTLE_MS)).await;

    if let Err(e) = placer::place_protection(ap, symbol).await {
        let now = Utc::now();
        let mut state = ap.state.write();
        if let Some(p) = state.positions.get_mut(symbol) {
            p.protection.failure_count += 1;
            p.protection.last_failure = Some(e.to_string());
            p.protection.set_state(ProtectionState::Unprotected, now);
        }
        warn!(symbol, error = %e, "heal: placement replay failed");
        return;
    }

    tokio::time::sleep(Duration::from_millis(HEAL_VERIFY_DELAY_MS)).await;

    // Re-verify immediately rather than waiting a full tick.
    match ap.client().list_open_algo_orders(symbol).await {
        Ok(orders) => {
            let verdict = classify_orders(&orders, side);
            let now = Utc::now();
            let mut state = ap.state.write();
            if let Some(p) = state.positions.get_mut(symbol) {
                if verdict.sl_present {
                    p.protection.sl_verified = true;
                    p.protection.sl_verified_at = Some(now);
                    p.protection.heal_attempts = 0;
                    let new_state = if verdict.tp_present || p.next_pending_tp().is_none() {
                        ProtectionState::Protected
                    } else {
                        ProtectionState::SlVerified
                    };
                    p.protection.set_state(new_state, now);
                    info!(symbol, state = %new_state, "heal succeeded");
                } else {
                    p.protection.set_state(ProtectionState::Unprotected, now);
                    warn!(
                        symbol,
                        attempts = p.protection.heal_attempts,
                        "heal did not restore the SL"
                    );
                }
            }
        }
        Err(e) => warn!(symbol, error = %e, "heal: re-verification failed"),
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn algo(order_type: &str, position_side: &str) -> AlgoOrder {
        AlgoOrder {
            order_id: 1,
            symbol: "ETHUSDT".into(),
            side: "SELL".into(),
            position_side: position_side.into(),
            order_type: order_type.into(),
            stop_price: 1960.0,
            close_position: true,
            quantity: 0.0,
            status: "NEW".into(),
        }
    }

    #[test]
    fn classify_both_present() {
        let orders = vec![algo("STOP_MARKET", "LONG"), algo("TAKE_PROFIT_MARKET", "LONG")];
        let v = classify_orders(&orders, Side::Long);
        assert!(v.sl_present);
        assert!(v.tp_present);
    }

    #[test]
    fn classify_sl_only() {
        let orders = vec![algo("STOP_MARKET", "BOTH")];
        let v = classify_orders(&orders, Side::Long);
        assert!(v.sl_present);
        assert!(!v.tp_present);
    }

    #[test]
    fn classify_ignores_wrong_position_side() {
        // Hedge-mode SHORT orders do not protect a LONG.
        let orders = vec![algo("STOP_MARKET", "SHORT")];
        let v = classify_orders(&orders, Side::Long);
        assert!(!v.sl_present);
    }

    #[test]
    fn classify_empty() {
        let v = classify_orders(&[], Side::Short);
        assert!(!v.sl_present);
        assert!(!v.tp_present);
    }

    #[test]
    fn escalation_on_heal_attempts() {
        let now = Utc::now();
        let mut p = ProtectionStatus::new(now);
        p.heal_attempts = MAX_HEAL_ATTEMPTS;
        assert!(should_escalate(&p, now));
    }

    #[test]
    fn escalation_on_unprotected_duration() {
        let now = Utc::now();
        let mut p = ProtectionStatus::new(now);
        p.set_state(ProtectionState::Unprotected, now);
        assert!(!should_escalate(&p, now + ChronoDuration::seconds(10)));
        assert!(should_escalate(&p, now + ChronoDuration::seconds(31)));
    }

    #[test]
    fn no_escalation_while_protected() {
        let now = Utc::now();
        let mut p = ProtectionStatus::new(now);
        p.set_state(ProtectionState::Protected, now);
        assert!(!should_escalate(&p, now + ChronoDuration::minutes(5)));
    }
}
