// =============================================================================
// Per-Mode Safety State — rate windows, profit window, recent win rate
// =============================================================================
//
// Three independent gates, OR-combined into a single paused flag:
//   (i)   sliding-window rate limits (trades per minute / hour / day)
//   (ii)  profit-window threshold — pause when the sum of PnL percentages
//         over the last N minutes drops below the configured floor
//   (iii) win-rate check against the most recent sample of trades
//
// Lives inside the engine state lock; no interior mutability.
// =============================================================================

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::settings::SafetyConfig;
use crate::types::TradeMode;

/// Serialisable snapshot for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetySnapshot {
    pub mode: TradeMode,
    pub is_paused: bool,
    pub pause_reason: Option<String>,
    pub trades_last_minute: u32,
    pub trades_last_hour: u32,
    pub trades_last_day: u32,
    pub window_pnl_percent: f64,
    pub recent_win_rate: Option<f64>,
}

/// Safety gates for one trading mode.
#[derive(Debug, Clone)]
pub struct ModeSafety {
    mode: TradeMode,
    /// Entry timestamps over the last 24 h.
    entries: VecDeque<DateTime<Utc>>,
    /// (close time, pnl percent) results over the last 24 h.
    results: VecDeque<(DateTime<Utc>, f64)>,
    paused_until: Option<DateTime<Utc>>,
    pause_reason: Option<String>,
}

impl ModeSafety {
    pub fn new(mode: TradeMode) -> Self {
        Self {
            mode,
            entries: VecDeque::new(),
            results: VecDeque::new(),
            paused_until: None,
            pause_reason: None,
        }
    }

    /// Record an accepted entry (rate accounting).
    pub fn record_entry(&mut self, now: DateTime<Utc>) {
        self.prune(now);
        self.entries.push_back(now);
    }

    /// Record a closed trade result and re-evaluate the pause gates.
    pub fn record_result(&mut self, pnl_percent: f64, now: DateTime<Utc>, cfg: &SafetyConfig) {
        self.prune(now);
        self.results.push_back((now, pnl_percent));

        if self.paused_until.is_some() {
            return;
        }

        // (ii) profit-window threshold
        let window_sum = self.window_pnl(now, cfg);
        if window_sum < cfg.max_loss_percent_in_window {
            let reason = format!(
                "{}: window PnL {:.2}% below floor {:.2}% over {} min",
                self.mode, window_sum, cfg.max_loss_percent_in_window, cfg.profit_window_minutes
            );
            warn!(mode = %self.mode, reason = %reason, "safety pause (profit window)");
            self.pause(now, cfg, reason);
            return;
        }

        // (iii) recent win rate
        if let Some(rate) = self.recent_win_rate(cfg) {
            if rate < cfg.min_recent_win_rate {
                let reason = format!(
                    "{}: win rate {:.0}% over last {} trades below floor {:.0}%",
                    self.mode,
                    rate * 100.0,
                    cfg.win_rate_sample_size,
                    cfg.min_recent_win_rate * 100.0
                );
                warn!(mode = %self.mode, reason = %reason, "safety pause (win rate)");
                self.pause(now, cfg, reason);
            }
        }
    }

    /// Whether the mode may take a new entry right now.
    pub fn can_trade(&mut self, now: DateTime<Utc>, cfg: &SafetyConfig) -> (bool, Option<String>) {
        self.prune(now);

        if let Some(until) = self.paused_until {
            if now < until {
                return (false, self.pause_reason.clone());
            }
            self.paused_until = None;
            self.pause_reason = None;
        }

        // (i) sliding-window rate limits
        let minute = self.entries_within(now, Duration::minutes(1));
        if minute >= cfg.max_trades_per_minute {
            return (
                false,
                Some(format!(
                    "{}: {} trades in the last minute (limit {})",
                    self.mode, minute, cfg.max_trades_per_minute
                )),
            );
        }
        let hour = self.entries_within(now, Duration::hours(1));
        if hour >= cfg.max_trades_per_hour {
            return (
                false,
                Some(format!(
                    "{}: {} trades in the last hour (limit {})",
                    self.mode, hour, cfg.max_trades_per_hour
                )),
            );
        }
        let day = self.entries_within(now, Duration::days(1));
        if day >= cfg.max_trades_per_day {
            return (
                false,
                Some(format!(
                    "{}: {} trades in the last day (limit {})",
                    self.mode, day, cfg.max_trades_per_day
                )),
            );
        }

        (true, None)
    }

    pub fn snapshot(&self, now: DateTime<Utc>, cfg: &SafetyConfig) -> SafetySnapshot {
        SafetySnapshot {
            mode: self.mode,
            is_paused: self.paused_until.map(|u| now < u).unwrap_or(false),
            pause_reason: self.pause_reason.clone(),
            trades_last_minute: self.entries_within(now, Duration::minutes(1)),
            trades_last_hour: self.entries_within(now, Duration::hours(1)),
            trades_last_day: self.entries_within(now, Duration::days(1)),
            window_pnl_percent: self.window_pnl(now, cfg),
            recent_win_rate: self.recent_win_rate(cfg),
        }
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn pause(&mut self, now: DateTime<Utc>, cfg: &SafetyConfig, reason: String) {
        self.paused_until = Some(now + Duration::minutes(cfg.pause_cooldown_minutes as i64));
        self.pause_reason = Some(reason);
    }

    fn window_pnl(&self, now: DateTime<Utc>, cfg: &SafetyConfig) -> f64 {
        let cutoff = now - Duration::minutes(cfg.profit_window_minutes as i64);
        self.results
            .iter()
            .filter(|(t, _)| *t >= cutoff)
            .map(|(_, p)| *p)
            .sum()
    }

    fn recent_win_rate(&self, cfg: &SafetyConfig) -> Option<f64> {
        if cfg.win_rate_sample_size == 0 || self.results.len() < cfg.win_rate_sample_size {
            return None;
        }
        let sample = self
            .results
            .iter()
            .rev()
            .take(cfg.win_rate_sample_size)
            .map(|(_, p)| *p);
        let mut wins = 0usize;
        let mut total = 0usize;
        for pnl in sample {
            total += 1;
            if pnl > 0.0 {
                wins += 1;
            }
        }
        Some(wins as f64 / total as f64)
    }

    fn entries_within(&self, now: DateTime<Utc>, window: Duration) -> u32 {
        let cutoff = now - window;
        self.entries.iter().filter(|t| **t >= cutoff).count() as u32
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - Duration::days(1);
        while matches!(self.entries.front(), Some(t) if *t < cutoff) {
            self.entries.pop_front();
        }
        while matches!(self.results.front(), Some((t, _)) if *t < cutoff) {
            self.results.pop_front();
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> SafetyConfig {
        SafetyConfig {
            max_trades_per_minute: 2,
            max_trades_per_hour: 5,
            max_trades_per_day: 10,
            profit_window_minutes: 60,
            max_loss_percent_in_window: -10.0,
            pause_cooldown_minutes: 30,
            win_rate_sample_size: 4,
            min_recent_win_rate: 0.5,
        }
    }

    #[test]
    fn minute_rate_window_slides() {
        let mut s = ModeSafety::new(TradeMode::Scalp);
        let cfg = cfg();
        let now = Utc::now();

        s.record_entry(now);
        s.record_entry(now);
        let (ok, reason) = s.can_trade(now, &cfg);
        assert!(!ok);
        assert!(reason.unwrap().contains("minute"));

        let (ok, _) = s.can_trade(now + Duration::seconds(61), &cfg);
        assert!(ok);
    }

    #[test]
    fn hourly_and_daily_caps() {
        let mut s = ModeSafety::new(TradeMode::Scalp);
        let cfg = cfg();
        let now = Utc::now();

        // Spread 5 entries over the hour to dodge the minute cap.
        for i in 0..5 {
            s.record_entry(now - Duration::minutes(50 - i * 10));
        }
        let (ok, reason) = s.can_trade(now, &cfg);
        assert!(!ok);
        assert!(reason.unwrap().contains("hour"));
    }

    #[test]
    fn profit_window_pauses_and_recovers() {
        let mut s = ModeSafety::new(TradeMode::Swing);
        let cfg = cfg();
        let now = Utc::now();

        s.record_result(-6.0, now, &cfg);
        let (ok, _) = s.can_trade(now, &cfg);
        assert!(ok, "still above the window floor");

        s.record_result(-5.0, now, &cfg);
        let (ok, reason) = s.can_trade(now, &cfg);
        assert!(!ok);
        assert!(reason.unwrap().contains("window PnL"));

        // Pause expires after the cooldown.
        let (ok, _) = s.can_trade(now + Duration::minutes(31), &cfg);
        assert!(ok);
    }

    #[test]
    fn old_results_fall_out_of_the_window() {
        let mut s = ModeSafety::new(TradeMode::Swing);
        let cfg = cfg();
        let now = Utc::now();

        s.record_result(-8.0, now - Duration::minutes(90), &cfg);
        s.record_result(-5.0, now, &cfg);
        // Window only sees -5.0.
        let (ok, _) = s.can_trade(now, &cfg);
        assert!(ok);
    }

    #[test]
    fn recent_win_rate_floor() {
        let mut s = ModeSafety::new(TradeMode::Scalp);
        let cfg = cfg();
        let now = Utc::now();

        // Wins first, then losses: last 4 = 1 win / 3 losses = 25% < 50%.
        s.record_result(1.0, now, &cfg);
        s.record_result(1.0, now, &cfg);
        s.record_result(-1.0, now, &cfg);
        s.record_result(-1.0, now, &cfg);
        s.record_result(-1.0, now, &cfg);

        let (ok, reason) = s.can_trade(now, &cfg);
        assert!(!ok);
        assert!(reason.unwrap().contains("win rate"));
    }

    #[test]
    fn win_rate_needs_full_sample() {
        let mut s = ModeSafety::new(TradeMode::Scalp);
        let cfg = cfg();
        let now = Utc::now();

        s.record_result(-1.0, now, &cfg);
        s.record_result(-1.0, now, &cfg);
        // Only 2 of the 4-trade sample — no pause yet.
        let (ok, _) = s.can_trade(now, &cfg);
        assert!(ok);
    }
}
