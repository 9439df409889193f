// =============================================================================
// Scan/Decision Loop — watchlist iteration, filters, entry dispatch
// =============================================================================
//
// The main loop drives every enabled mode except UltraFast, which gets its
// own sub-second ticker and signal shape. Per mode pass, each symbol runs
// through the filter chain in order:
//   recommendation=Execute -> symbol enabled -> confidence ≥ effective
//   threshold (base + category boost) -> coin not blocked -> action is
//   LONG/SHORT -> per-mode circuit breaker.
// Every rejection lands in the signal ring buffer with its reason.
//
// The watchlist is reassembled every 30 minutes from the user's sources:
// saved coins, advisor picks, and market movers (gainers / losers / volume /
// volatility).
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::analyzer::{Decision, DecisionAction, Recommendation, TrendBias, VolatilityRegime};
use crate::autopilot::Autopilot;
use crate::entry::{execute_entry, EntryRequest};
use crate::exchange::models::TickerStats;
use crate::journal::{SignalLog, SignalStatus};
use crate::storage::ScanSourceSettings;
use crate::types::{Side, SignalSource, TradeMode};

/// Driver granularity of the main loop; per-mode intervals gate the scans.
const LOOP_DRIVER_SECS: u64 = 10;
/// Strategy evaluation cadence.
const STRATEGY_EVAL_SECS: i64 = 60;
/// Watchlist refresh cadence.
const WATCHLIST_REFRESH_SECS: i64 = 30 * 60;
/// How many symbols each market-mover source contributes.
const MOVERS_PER_SOURCE: usize = 10;

// ---------------------------------------------------------------------------
// Filter chain (pure)
// ---------------------------------------------------------------------------

/// Apply the scan filter chain to a decision. `Ok(side)` means the entry
/// executor should run; `Err((reason, details))` is logged as a rejection.
pub fn evaluate_filters(
    decision: &Decision,
    symbol_enabled: bool,
    effective_threshold: f64,
    blocked_reason: Option<&str>,
    mode_cb: (bool, Option<String>),
) -> Result<Side, (String, Option<String>)> {
    if decision.recommendation != Recommendation::Execute {
        return Err((
            "not_executable".to_string(),
            Some(format!("recommendation {:?}", decision.recommendation)),
        ));
    }
    if !symbol_enabled {
        return Err(("symbol_disabled".to_string(), None));
    }
    if decision.confidence < effective_threshold {
        return Err((
            "confidence_below_threshold".to_string(),
            Some(format!(
                "{:.1} < {:.1}",
                decision.confidence, effective_threshold
            )),
        ));
    }
    if let Some(reason) = blocked_reason {
        return Err((
            format!("coin_blocked: {}", decision.symbol),
            Some(reason.to_string()),
        ));
    }
    let side = match decision.action {
        DecisionAction::Long => Side::Long,
        DecisionAction::Short => Side::Short,
        DecisionAction::Hold => {
            return Err(("action_hold".to_string(), None));
        }
    };
    let (ok, reason) = mode_cb;
    if !ok {
        return Err(("mode_circuit_breaker".to_string(), reason));
    }
    Ok(side)
}

// ---------------------------------------------------------------------------
// Watchlist assembly (pure)
// ---------------------------------------------------------------------------

/// Assemble the watchlist from the user's sources, deduplicated in priority
/// order and capped at `max_symbols`.
pub fn assemble_watchlist(
    sources: &ScanSourceSettings,
    tickers: &[TickerStats],
    advisor_coins: &[String],
    disabled: &[String],
) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut push = |symbol: &str, out: &mut Vec<String>| {
        if !symbol.ends_with("USDT") {
            return;
        }
        if disabled.iter().any(|d| d == symbol) {
            return;
        }
        if !out.iter().any(|s| s == symbol) {
            out.push(symbol.to_string());
        }
    };

    if sources.use_saved_coins {
        for s in &sources.saved_coins {
            push(s, &mut out);
        }
    }
    if sources.use_ai_selected {
        for s in advisor_coins {
            push(s, &mut out);
        }
    }

    let mut ranked = tickers.to_vec();
    if sources.use_gainers {
        ranked.sort_by(|a, b| {
            b.price_change_percent
                .partial_cmp(&a.price_change_percent)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        for t in ranked.iter().take(MOVERS_PER_SOURCE) {
            push(&t.symbol, &mut out);
        }
    }
    if sources.use_losers {
        ranked.sort_by(|a, b| {
            a.price_change_percent
                .partial_cmp(&b.price_change_percent)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        for t in ranked.iter().take(MOVERS_PER_SOURCE) {
            push(&t.symbol, &mut out);
        }
    }
    if sources.use_volume {
        ranked.sort_by(|a, b| {
            b.quote_volume
                .partial_cmp(&a.quote_volume)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        for t in ranked.iter().take(MOVERS_PER_SOURCE) {
            push(&t.symbol, &mut out);
        }
    }
    if sources.use_volatility {
        ranked.sort_by(|a, b| {
            b.range_percent()
                .partial_cmp(&a.range_percent())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        for t in ranked.iter().take(MOVERS_PER_SOURCE) {
            push(&t.symbol, &mut out);
        }
    }

    out.truncate(sources.max_symbols.max(1));
    out
}

// ---------------------------------------------------------------------------
// Main loop
// ---------------------------------------------------------------------------

/// Run the main scan loop. Spawned once per Autopilot.
pub async fn run_scan_loop(ap: Arc<Autopilot>, mut stop: watch::Receiver<bool>) {
    info!(user = %ap.user_id, "scan loop started");

    let mut last_mode_scan: std::collections::HashMap<TradeMode, chrono::DateTime<Utc>> =
        std::collections::HashMap::new();
    let mut last_strategy_eval = Utc::now() - chrono::Duration::seconds(STRATEGY_EVAL_SECS);
    let mut last_watchlist = Utc::now() - chrono::Duration::seconds(WATCHLIST_REFRESH_SECS);

    let mut ticker = tokio::time::interval(Duration::from_secs(LOOP_DRIVER_SECS));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop.changed() => {
                info!(user = %ap.user_id, "scan loop stopping");
                return;
            }
        }

        let now = Utc::now();

        // Watchlist refresh (every 30 min, and on the first pass).
        if (now - last_watchlist).num_seconds() >= WATCHLIST_REFRESH_SECS {
            last_watchlist = now;
            if let Err(e) = load_watchlist(&ap).await {
                warn!(user = %ap.user_id, error = %e, "watchlist refresh failed");
            }
        }

        // Balance refresh keeps the allocator honest.
        if let Ok(balance) = ap.client().get_available_balance().await {
            ap.state.write().allocator.update_balance(balance);
        }

        let (can_trade, reason) = ap.can_trade();
        if !can_trade {
            let mut state = ap.state.write();
            state.scan_status.phase = "idle".to_string();
            drop(state);
            debug!(user = %ap.user_id, reason = ?reason, "scan skipped — trading gated");
            continue;
        }

        let enabled: Vec<TradeMode> = ap
            .settings
            .read()
            .enabled_modes()
            .into_iter()
            .filter(|m| *m != TradeMode::UltraFast)
            .collect();

        for mode in enabled {
            let interval = ap.settings.read().mode(mode).scan_interval_secs as i64;
            let due = last_mode_scan
                .get(&mode)
                .map(|last| (now - *last).num_seconds() >= interval)
                .unwrap_or(true);
            if due {
                last_mode_scan.insert(mode, now);
                scan_mode(&ap, mode).await;
            }
        }

        // Strategy evaluation every 60 s.
        if (now - last_strategy_eval).num_seconds() >= STRATEGY_EVAL_SECS {
            last_strategy_eval = now;
            crate::strategy::evaluate_strategies(&ap).await;
        }
    }
}

/// One scan pass over the watchlist for `mode`.
async fn scan_mode(ap: &Arc<Autopilot>, mode: TradeMode) {
    let started = std::time::Instant::now();
    let watchlist: Vec<String> = ap.state.read().watchlist.clone();
    let interval = ap.settings.read().mode(mode).scan_interval_secs;

    {
        let mut state = ap.state.write();
        state.scan_status.phase = format!("scanning {mode}");
        state.scan_status.total_symbols = watchlist.len();
        state.scan_status.scanned_this_cycle = 0;
    }

    let mut scanned = 0usize;
    for symbol in &watchlist {
        if ap.state.read().positions.contains_key(symbol) {
            continue;
        }

        let decision = match ap.analyzer.analyze(symbol, mode).await {
            Ok(d) => d,
            Err(e) => {
                debug!(symbol = %symbol, %mode, error = %e, "analyzer failed for symbol");
                continue;
            }
        };
        scanned += 1;

        process_decision(ap, decision).await;
    }

    let elapsed = started.elapsed().as_millis() as u64;
    {
        let now = Utc::now();
        let mut state = ap.state.write();
        state.scan_status.phase = "idle".to_string();
        state.scan_status.last_scan_time = Some(now);
        state.scan_status.scanned_this_cycle = scanned;
        state.scan_status.last_scan_duration_ms = elapsed;
        state.scan_status.next_scan_time = Some(now + chrono::Duration::seconds(interval as i64));
    }
    debug!(user = %ap.user_id, %mode, scanned, elapsed_ms = elapsed, "mode scan complete");
}

/// Filter one decision and dispatch the entry executor on pass.
async fn process_decision(ap: &Arc<Autopilot>, decision: Decision) {
    let now = Utc::now();
    let symbol = decision.symbol.clone();
    let mode = decision.mode;

    let (symbol_enabled, threshold) = {
        let settings = ap.settings.read();
        (
            !settings.disabled_symbols.iter().any(|s| s == &symbol),
            settings.effective_confidence_threshold(mode, &symbol),
        )
    };
    let (blocked_reason, mode_cb) = {
        let mut state = ap.state.write();
        let blocked = state.blocked.is_blocked(&symbol, now);
        let cb = state
            .mode_breakers
            .get_mut(&mode)
            .map(|cb| cb.can_trade(now))
            .unwrap_or((true, None));
        (blocked, cb)
    };

    let verdict = evaluate_filters(
        &decision,
        symbol_enabled,
        threshold,
        blocked_reason.as_deref(),
        mode_cb,
    );

    match verdict {
        Err((reason, details)) => {
            let mut state = ap.state.write();
            state.signal_logs.push(SignalLog {
                time: now,
                symbol,
                mode,
                status: SignalStatus::Rejected,
                reason,
                rejection_details: details,
                confidence: decision.confidence,
            });
        }
        Ok(side) => {
            let req = EntryRequest {
                symbol: symbol.clone(),
                side,
                mode,
                confidence: decision.confidence,
                source: SignalSource::Ai,
                suggested_sl_percent: decision.suggested_sl_percent,
                decision: Some(decision.clone()),
                ultra_fast: None,
                strategy_id: None,
                strategy_name: None,
            };

            match execute_entry(ap, req).await {
                Ok(()) => {
                    let mut state = ap.state.write();
                    state.signal_logs.push(SignalLog {
                        time: now,
                        symbol,
                        mode,
                        status: SignalStatus::Executed,
                        reason: "executed".to_string(),
                        rejection_details: None,
                        confidence: decision.confidence,
                    });
                }
                Err(e) => {
                    warn!(symbol = %symbol, %mode, error = %e, "entry failed");
                    let mut state = ap.state.write();
                    state.signal_logs.push(SignalLog {
                        time: now,
                        symbol,
                        mode,
                        status: SignalStatus::Rejected,
                        reason: "entry_failed".to_string(),
                        rejection_details: Some(e.to_string()),
                        confidence: decision.confidence,
                    });
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// UltraFast loop
// ---------------------------------------------------------------------------

/// UltraFast scanner: sub-second ticker, distinct signal shape and gates.
pub async fn run_ultra_fast_loop(ap: Arc<Autopilot>, mut stop: watch::Receiver<bool>) {
    let tick_ms = ap.settings.read().ultra_fast_tick_ms.max(50);
    info!(user = %ap.user_id, tick_ms, "ultra-fast scan loop started");

    let mut ticker = tokio::time::interval(Duration::from_millis(tick_ms));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop.changed() => {
                info!(user = %ap.user_id, "ultra-fast loop stopping");
                return;
            }
        }

        let cfg = ap.settings.read().mode(TradeMode::UltraFast);
        if !cfg.enabled {
            // Re-check occasionally instead of burning the ticker.
            tokio::time::sleep(Duration::from_secs(5)).await;
            continue;
        }
        let (can_trade, _) = ap.can_trade();
        if !can_trade {
            continue;
        }

        let watchlist: Vec<String> = ap.state.read().watchlist.clone();
        for symbol in watchlist {
            if ap.state.read().positions.contains_key(&symbol) {
                continue;
            }

            let signal = match ap.analyzer.ultra_fast_signal(&symbol).await {
                Ok(s) => s,
                Err(_) => continue,
            };

            let side = match signal.trend_bias {
                TrendBias::Bullish => Side::Long,
                TrendBias::Bearish => Side::Short,
                TrendBias::Neutral => continue,
            };
            if signal.entry_confidence < cfg.confidence_threshold {
                continue;
            }
            if signal.volatility_regime == VolatilityRegime::Extreme {
                let mut state = ap.state.write();
                state.signal_logs.push(SignalLog {
                    time: Utc::now(),
                    symbol: symbol.clone(),
                    mode: TradeMode::UltraFast,
                    status: SignalStatus::Rejected,
                    reason: "volatility_extreme".to_string(),
                    rejection_details: None,
                    confidence: signal.entry_confidence,
                });
                continue;
            }

            let req = EntryRequest {
                symbol: symbol.clone(),
                side,
                mode: TradeMode::UltraFast,
                confidence: signal.entry_confidence,
                source: SignalSource::Ai,
                suggested_sl_percent: None,
                decision: None,
                ultra_fast: Some(signal.clone()),
                strategy_id: None,
                strategy_name: None,
            };

            match execute_entry(&ap, req).await {
                Ok(()) => {
                    let mut state = ap.state.write();
                    state.signal_logs.push(SignalLog {
                        time: Utc::now(),
                        symbol,
                        mode: TradeMode::UltraFast,
                        status: SignalStatus::Executed,
                        reason: "executed".to_string(),
                        rejection_details: None,
                        confidence: signal.entry_confidence,
                    });
                }
                Err(e) if !e.skips_symbol() => {
                    debug!(symbol = %symbol, error = %e, "ultra-fast entry failed");
                }
                Err(_) => {}
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Watchlist loading
// ---------------------------------------------------------------------------

/// Rebuild the watchlist from the user's configured sources.
pub async fn load_watchlist(ap: &Arc<Autopilot>) -> anyhow::Result<()> {
    let sources = ap.store.scan_sources(&ap.user_id).await?;

    let needs_tickers =
        sources.use_gainers || sources.use_losers || sources.use_volume || sources.use_volatility;
    let tickers = if needs_tickers {
        ap.client().get_24h_tickers().await.unwrap_or_default()
    } else {
        Vec::new()
    };

    let advisor_coins = if sources.use_ai_selected {
        ap.advisor
            .select_coins(MOVERS_PER_SOURCE)
            .await
            .unwrap_or_default()
    } else {
        Vec::new()
    };

    let disabled = ap.settings.read().disabled_symbols.clone();
    let watchlist = assemble_watchlist(&sources, &tickers, &advisor_coins, &disabled);

    info!(user = %ap.user_id, count = watchlist.len(), "watchlist assembled");
    ap.state.write().watchlist = watchlist;
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn decision(confidence: f64, action: DecisionAction, rec: Recommendation) -> Decision {
        Decision {
            symbol: "ETHUSDT".into(),
            mode: TradeMode::Scalp,
            action,
            recommendation: rec,
            confidence,
            entry_price: 2000.0,
            suggested_sl_percent: Some(1.0),
            suggested_tp_percent: Some(2.0),
            signals: Vec::new(),
            summary: "test".into(),
        }
    }

    #[test]
    fn filters_pass_in_order() {
        let d = decision(80.0, DecisionAction::Long, Recommendation::Execute);
        let side = evaluate_filters(&d, true, 65.0, None, (true, None)).unwrap();
        assert_eq!(side, Side::Long);
    }

    #[test]
    fn filter_rejects_non_execute() {
        let d = decision(80.0, DecisionAction::Long, Recommendation::Monitor);
        let (reason, _) = evaluate_filters(&d, true, 65.0, None, (true, None)).unwrap_err();
        assert_eq!(reason, "not_executable");
    }

    #[test]
    fn filter_rejects_disabled_symbol() {
        let d = decision(80.0, DecisionAction::Long, Recommendation::Execute);
        let (reason, _) = evaluate_filters(&d, false, 65.0, None, (true, None)).unwrap_err();
        assert_eq!(reason, "symbol_disabled");
    }

    #[test]
    fn filter_rejects_low_confidence() {
        let d = decision(60.0, DecisionAction::Long, Recommendation::Execute);
        let (reason, details) = evaluate_filters(&d, true, 65.0, None, (true, None)).unwrap_err();
        assert_eq!(reason, "confidence_below_threshold");
        assert!(details.unwrap().contains("60.0 < 65.0"));
    }

    #[test]
    fn filter_rejects_blocked_coin_with_prefix() {
        // The rejection reason carries the coin_blocked prefix.
        let d = decision(80.0, DecisionAction::Long, Recommendation::Execute);
        let (reason, _) =
            evaluate_filters(&d, true, 65.0, Some("big loss -55.0% ROI"), (true, None))
                .unwrap_err();
        assert!(reason.starts_with("coin_blocked:"));
    }

    #[test]
    fn filter_rejects_hold_action() {
        let d = decision(80.0, DecisionAction::Hold, Recommendation::Execute);
        let (reason, _) = evaluate_filters(&d, true, 65.0, None, (true, None)).unwrap_err();
        assert_eq!(reason, "action_hold");
    }

    #[test]
    fn filter_rejects_mode_breaker_last() {
        let d = decision(80.0, DecisionAction::Short, Recommendation::Execute);
        let (reason, details) =
            evaluate_filters(&d, true, 65.0, None, (false, Some("paused".into()))).unwrap_err();
        assert_eq!(reason, "mode_circuit_breaker");
        assert_eq!(details.unwrap(), "paused");
    }

    fn ticker(symbol: &str, change: f64, volume: f64, range: f64) -> TickerStats {
        TickerStats {
            symbol: symbol.into(),
            last_price: 100.0,
            price_change_percent: change,
            quote_volume: volume,
            high_price: 100.0 + range / 2.0,
            low_price: 100.0 - range / 2.0,
        }
    }

    #[test]
    fn watchlist_saved_coins_first_and_deduped() {
        let sources = ScanSourceSettings {
            use_saved_coins: true,
            saved_coins: vec!["BTCUSDT".into(), "ETHUSDT".into()],
            use_ai_selected: false,
            use_gainers: true,
            use_losers: false,
            use_volume: false,
            use_volatility: false,
            max_symbols: 20,
        };
        let tickers = vec![
            ticker("BTCUSDT", 12.0, 1e9, 5.0), // duplicate of a saved coin
            ticker("AAAUSDT", 9.0, 1e8, 4.0),
        ];
        let list = assemble_watchlist(&sources, &tickers, &[], &[]);
        assert_eq!(list[0], "BTCUSDT");
        assert_eq!(list[1], "ETHUSDT");
        assert!(list.contains(&"AAAUSDT".to_string()));
        assert_eq!(list.iter().filter(|s| *s == "BTCUSDT").count(), 1);
    }

    #[test]
    fn watchlist_respects_disabled_and_cap() {
        let sources = ScanSourceSettings {
            use_saved_coins: true,
            saved_coins: vec!["BTCUSDT".into(), "ETHUSDT".into(), "XRPUSDT".into()],
            use_ai_selected: false,
            use_gainers: false,
            use_losers: false,
            use_volume: false,
            use_volatility: false,
            max_symbols: 2,
        };
        let list = assemble_watchlist(&sources, &[], &[], &["ETHUSDT".to_string()]);
        assert_eq!(list, vec!["BTCUSDT", "XRPUSDT"]);
    }

    #[test]
    fn watchlist_filters_non_usdt_pairs() {
        let sources = ScanSourceSettings {
            use_saved_coins: false,
            saved_coins: vec![],
            use_ai_selected: false,
            use_gainers: true,
            use_losers: false,
            use_volume: false,
            use_volatility: false,
            max_symbols: 20,
        };
        let tickers = vec![ticker("BTCBUSD", 20.0, 1e9, 5.0), ticker("AAAUSDT", 9.0, 1e8, 4.0)];
        let list = assemble_watchlist(&sources, &tickers, &[], &[]);
        assert_eq!(list, vec!["AAAUSDT"]);
    }

    #[test]
    fn watchlist_volume_source_ranks_by_quote_volume() {
        let sources = ScanSourceSettings {
            use_saved_coins: false,
            saved_coins: vec![],
            use_ai_selected: false,
            use_gainers: false,
            use_losers: false,
            use_volume: true,
            use_volatility: false,
            max_symbols: 2,
        };
        let tickers = vec![
            ticker("LOWUSDT", 1.0, 1e6, 1.0),
            ticker("HIGHUSDT", 1.0, 1e9, 1.0),
            ticker("MIDUSDT", 1.0, 1e7, 1.0),
        ];
        let list = assemble_watchlist(&sources, &tickers, &[], &[]);
        assert_eq!(list[0], "HIGHUSDT");
    }
}
