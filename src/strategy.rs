// =============================================================================
// Strategy Evaluator — persisted user strategies, evaluated in parallel
// =============================================================================
//
// User strategies are simple momentum triggers persisted in storage: "go
// LONG on SOLUSDT when the close moves +1.5% over the last 12 bars". They
// bypass the analyzer entirely; the entry executor still applies every
// guardrail (blocks, breakers, funding, sizing).
// =============================================================================

use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::autopilot::Autopilot;
use crate::entry::{execute_entry, EntryRequest};
use crate::storage::UserStrategy;
use crate::types::{Kline, Side, SignalSource};

/// Confidence assigned to strategy-driven entries (strategies carry no
/// analyzer confidence of their own).
const STRATEGY_CONFIDENCE: f64 = 75.0;

/// Whether `strategy` fires on this kline window.
pub fn strategy_triggers(strategy: &UserStrategy, klines: &[Kline]) -> bool {
    if strategy.lookback_bars == 0 || klines.len() < strategy.lookback_bars + 1 {
        return false;
    }
    let first = klines[klines.len() - 1 - strategy.lookback_bars].close;
    let last = klines[klines.len() - 1].close;
    if first <= 0.0 {
        return false;
    }
    let change = (last - first) / first * 100.0;

    match strategy.side {
        Side::Long => change >= strategy.trigger_change_percent,
        Side::Short => change <= -strategy.trigger_change_percent,
    }
}

/// Evaluate every enabled strategy concurrently and fire entries for the
/// ones that trigger.
pub async fn evaluate_strategies(ap: &Arc<Autopilot>) {
    let strategies = match ap.store.strategies(&ap.user_id).await {
        Ok(s) => s,
        Err(e) => {
            warn!(user = %ap.user_id, error = %e, "strategy load failed");
            return;
        }
    };
    if strategies.is_empty() {
        return;
    }

    let mut set: JoinSet<Option<(UserStrategy, bool)>> = JoinSet::new();

    for strategy in strategies.into_iter().filter(|s| s.enabled) {
        if ap.state.read().positions.contains_key(&strategy.symbol) {
            continue;
        }

        let client = ap.client();
        set.spawn(async move {
            let klines = client
                .get_klines(
                    &strategy.symbol,
                    strategy.mode.timeframe(),
                    (strategy.lookback_bars + 2) as u32,
                )
                .await
                .ok()?;
            let fired = strategy_triggers(&strategy, &klines);
            Some((strategy, fired))
        });
    }

    while let Some(joined) = set.join_next().await {
        let Ok(Some((strategy, fired))) = joined else {
            continue;
        };
        if !fired {
            continue;
        }

        info!(
            user = %ap.user_id,
            strategy = %strategy.name,
            symbol = %strategy.symbol,
            side = %strategy.side,
            "strategy triggered"
        );

        let req = EntryRequest {
            symbol: strategy.symbol.clone(),
            side: strategy.side,
            mode: strategy.mode,
            confidence: STRATEGY_CONFIDENCE,
            source: SignalSource::Strategy,
            suggested_sl_percent: None,
            decision: None,
            ultra_fast: None,
            strategy_id: Some(strategy.id.clone()),
            strategy_name: Some(strategy.name.clone()),
        };

        if let Err(e) = execute_entry(ap, req).await {
            debug!(
                symbol = %strategy.symbol,
                strategy = %strategy.name,
                error = %e,
                "strategy entry rejected"
            );
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TradeMode;

    fn strategy(side: Side, trigger: f64, lookback: usize) -> UserStrategy {
        UserStrategy {
            id: "s1".into(),
            name: "momo".into(),
            symbol: "SOLUSDT".into(),
            side,
            mode: TradeMode::Scalp,
            lookback_bars: lookback,
            trigger_change_percent: trigger,
            enabled: true,
        }
    }

    fn closes(values: &[f64]) -> Vec<Kline> {
        values
            .iter()
            .enumerate()
            .map(|(i, c)| Kline::new(i as i64, *c, *c, *c, *c, 1.0, i as i64))
            .collect()
    }

    #[test]
    fn long_fires_on_upward_move() {
        let s = strategy(Side::Long, 1.5, 3);
        // 100 -> 102 over 3 bars = +2%.
        let k = closes(&[99.0, 100.0, 101.0, 101.5, 102.0]);
        assert!(strategy_triggers(&s, &k));
    }

    #[test]
    fn long_ignores_insufficient_move() {
        let s = strategy(Side::Long, 1.5, 3);
        let k = closes(&[99.0, 100.0, 100.2, 100.5, 101.0]); // +1%
        assert!(!strategy_triggers(&s, &k));
    }

    #[test]
    fn short_fires_on_downward_move() {
        let s = strategy(Side::Short, 1.0, 2);
        let k = closes(&[101.0, 100.0, 99.5, 98.9]); // -1.1% over 2 bars
        assert!(strategy_triggers(&s, &k));
    }

    #[test]
    fn short_ignores_upward_move() {
        let s = strategy(Side::Short, 1.0, 2);
        let k = closes(&[99.0, 100.0, 101.0, 102.0]);
        assert!(!strategy_triggers(&s, &k));
    }

    #[test]
    fn too_few_klines_never_fires() {
        let s = strategy(Side::Long, 1.0, 10);
        let k = closes(&[100.0, 102.0]);
        assert!(!strategy_triggers(&s, &k));
    }
}
