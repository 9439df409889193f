// =============================================================================
// Circuit Breakers — rolling-loss and trade-rate gates protecting capital
// =============================================================================
//
// One global breaker plus one per trading mode, all instances of the same
// state machine. A breaker trips open when any of:
//   1. Rolling hourly loss ≥ max_loss_per_hour (PnL percentage points)
//   2. Rolling daily loss  ≥ max_daily_loss
//   3. Consecutive losses  ≥ max_consecutive_losses
//   4. Trades this minute  ≥ max_trades_per_minute
//   5. Trades today        ≥ max_trades_per_day
//
// Mode-scoped breakers additionally enforce a win-rate floor once enough
// trades have accumulated, pausing the mode for the cooldown window.
//
// The breaker lives inside the engine state lock; it has no interior
// mutability of its own.
// =============================================================================

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::settings::CircuitBreakerConfig;
use crate::types::TradeMode;

/// Binary breaker gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BreakerState {
    Closed,
    Open,
}

/// Counter group selected by `reset_stats`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetPeriod {
    Minute,
    Hour,
    Day,
}

/// Serialisable snapshot for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub hourly_loss: f64,
    pub daily_loss: f64,
    pub consecutive_losses: u32,
    /// Accepted entries per rolling window (closes do not count).
    pub trades_this_minute: u32,
    pub trades_this_hour: u32,
    pub trades_this_day: u32,
    pub total_wins: u32,
    pub total_trades: u32,
    pub is_paused: bool,
    pub pause_reason: Option<String>,
    pub cooldown_remaining_secs: i64,
}

/// Which unit this breaker guards (affects logging and the win-rate floor).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Global,
    Mode(TradeMode),
}

/// Circuit breaker over realized-PnL percentages and trade rates.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    cfg: CircuitBreakerConfig,
    scope: Scope,

    state: BreakerState,
    opened_at: Option<DateTime<Utc>>,
    open_reason: Option<String>,

    /// (close time, pnl percent) events within the last 24 h.
    pnl_events: VecDeque<(DateTime<Utc>, f64)>,
    /// Accepted-entry timestamps within the last 24 h. Only entries feed the
    /// rate windows; closes never consume rate budget.
    entry_times: VecDeque<DateTime<Utc>>,

    consecutive_losses: u32,
    total_wins: u32,
    total_trades: u32,

    /// Win-rate pause (mode scope only).
    paused_until: Option<DateTime<Utc>>,
    pause_reason: Option<String>,
}

impl CircuitBreaker {
    pub fn global(cfg: CircuitBreakerConfig) -> Self {
        Self::new(cfg, Scope::Global)
    }

    pub fn for_mode(mode: TradeMode, cfg: CircuitBreakerConfig) -> Self {
        Self::new(cfg, Scope::Mode(mode))
    }

    fn new(cfg: CircuitBreakerConfig, scope: Scope) -> Self {
        Self {
            cfg,
            scope,
            state: BreakerState::Closed,
            opened_at: None,
            open_reason: None,
            pnl_events: VecDeque::new(),
            entry_times: VecDeque::new(),
            consecutive_losses: 0,
            total_wins: 0,
            total_trades: 0,
            paused_until: None,
            pause_reason: None,
        }
    }

    fn label(&self) -> String {
        match self.scope {
            Scope::Global => "global".to_string(),
            Scope::Mode(m) => m.to_string(),
        }
    }

    // -------------------------------------------------------------------------
    // Trade recording
    // -------------------------------------------------------------------------

    /// Record the realized-PnL percentage of a completed trade.
    pub fn record_trade(&mut self, pnl_percent: f64, now: DateTime<Utc>) {
        self.prune(now);

        self.pnl_events.push_back((now, pnl_percent));
        self.total_trades += 1;

        if pnl_percent >= 0.0 {
            self.total_wins += 1;
            self.consecutive_losses = 0;
        } else {
            self.consecutive_losses += 1;
        }

        self.evaluate(now);
    }

    /// Record that an entry was accepted (rate accounting without PnL).
    pub fn record_entry(&mut self, now: DateTime<Utc>) {
        self.prune(now);
        self.entry_times.push_back(now);
    }

    // -------------------------------------------------------------------------
    // Gate
    // -------------------------------------------------------------------------

    /// Whether trading is currently allowed. Returns `(false, reason)` while
    /// the breaker is open, the cooldown is active, or a rate cap is live.
    pub fn can_trade(&mut self, now: DateTime<Utc>) -> (bool, Option<String>) {
        self.prune(now);

        // Open gate with cooldown.
        if self.state == BreakerState::Open {
            let opened = self.opened_at.unwrap_or(now);
            let cooldown = Duration::minutes(self.cfg.cooldown_minutes as i64);
            if now - opened < cooldown {
                let remaining = (cooldown - (now - opened)).num_seconds();
                return (
                    false,
                    Some(format!(
                        "{} breaker open ({}, {}s cooldown remaining)",
                        self.label(),
                        self.open_reason.as_deref().unwrap_or("tripped"),
                        remaining
                    )),
                );
            }
            info!(breaker = %self.label(), "cooldown elapsed — breaker closed");
            self.state = BreakerState::Closed;
            self.opened_at = None;
            self.open_reason = None;
        }

        // Win-rate pause (mode scope).
        if let Some(until) = self.paused_until {
            if now < until {
                return (
                    false,
                    Some(
                        self.pause_reason
                            .clone()
                            .unwrap_or_else(|| "win-rate pause active".to_string()),
                    ),
                );
            }
            info!(breaker = %self.label(), "win-rate pause expired");
            self.paused_until = None;
            self.pause_reason = None;
        }

        // Live rate caps.
        let minute = self.entries_within(now, Duration::minutes(1));
        if minute >= self.cfg.max_trades_per_minute {
            return (
                false,
                Some(format!(
                    "{} trades this minute (limit {})",
                    minute, self.cfg.max_trades_per_minute
                )),
            );
        }
        let day = self.entries_within(now, Duration::days(1));
        if day >= self.cfg.max_trades_per_day {
            return (
                false,
                Some(format!(
                    "{} trades today (limit {})",
                    day, self.cfg.max_trades_per_day
                )),
            );
        }

        (true, None)
    }

    // -------------------------------------------------------------------------
    // Evaluation
    // -------------------------------------------------------------------------

    fn evaluate(&mut self, now: DateTime<Utc>) {
        if self.state == BreakerState::Open {
            return;
        }

        let hourly = self.loss_within(now, Duration::hours(1));
        let daily = self.loss_within(now, Duration::days(1));

        let reason = if hourly >= self.cfg.max_loss_per_hour {
            Some(format!(
                "hourly loss {:.2}% >= limit {:.2}%",
                hourly, self.cfg.max_loss_per_hour
            ))
        } else if daily >= self.cfg.max_daily_loss {
            Some(format!(
                "daily loss {:.2}% >= limit {:.2}%",
                daily, self.cfg.max_daily_loss
            ))
        } else if self.consecutive_losses >= self.cfg.max_consecutive_losses {
            Some(format!(
                "{} consecutive losses (limit {})",
                self.consecutive_losses, self.cfg.max_consecutive_losses
            ))
        } else {
            None
        };

        if let Some(reason) = reason {
            warn!(breaker = %self.label(), reason = %reason, "circuit breaker OPENED");
            self.state = BreakerState::Open;
            self.opened_at = Some(now);
            self.open_reason = Some(reason);
            return;
        }

        // Win-rate floor applies to mode-scoped breakers only.
        if matches!(self.scope, Scope::Mode(_))
            && self.total_trades >= self.cfg.win_rate_check_after
            && self.paused_until.is_none()
        {
            let win_rate = self.total_wins as f64 / self.total_trades as f64;
            if win_rate < self.cfg.min_win_rate {
                let reason = format!(
                    "win rate {:.0}% below floor {:.0}% after {} trades",
                    win_rate * 100.0,
                    self.cfg.min_win_rate * 100.0,
                    self.total_trades
                );
                warn!(breaker = %self.label(), reason = %reason, "mode paused");
                self.paused_until =
                    Some(now + Duration::minutes(self.cfg.cooldown_minutes as i64));
                self.pause_reason = Some(reason);
            }
        }
    }

    // -------------------------------------------------------------------------
    // Maintenance
    // -------------------------------------------------------------------------

    /// Manual reset — clears the gate and all rolling state.
    pub fn reset(&mut self) {
        info!(breaker = %self.label(), "circuit breaker manually reset");
        self.state = BreakerState::Closed;
        self.opened_at = None;
        self.open_reason = None;
        self.pnl_events.clear();
        self.entry_times.clear();
        self.consecutive_losses = 0;
        self.paused_until = None;
        self.pause_reason = None;
    }

    /// Clear the counters for one rolling period. Day reset also clears the
    /// consecutive-loss count.
    pub fn reset_stats(&mut self, period: ResetPeriod, now: DateTime<Utc>) {
        let window = match period {
            ResetPeriod::Minute => Duration::minutes(1),
            ResetPeriod::Hour => Duration::hours(1),
            ResetPeriod::Day => Duration::days(1),
        };
        let cutoff = now - window;
        self.entry_times.retain(|t| *t < cutoff);
        self.pnl_events.retain(|(t, _)| *t < cutoff);

        if period == ResetPeriod::Day {
            self.consecutive_losses = 0;
        }
    }

    /// Replace the configuration in place.
    pub fn update_config(&mut self, cfg: CircuitBreakerConfig) {
        self.cfg = cfg;
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> BreakerSnapshot {
        let cooldown_remaining = match (self.state, self.opened_at) {
            (BreakerState::Open, Some(opened)) => {
                let cooldown = Duration::minutes(self.cfg.cooldown_minutes as i64);
                (cooldown - (now - opened)).num_seconds().max(0)
            }
            _ => 0,
        };

        BreakerSnapshot {
            state: self.state,
            hourly_loss: self.loss_within(now, Duration::hours(1)),
            daily_loss: self.loss_within(now, Duration::days(1)),
            consecutive_losses: self.consecutive_losses,
            trades_this_minute: self.entries_within(now, Duration::minutes(1)),
            trades_this_hour: self.entries_within(now, Duration::hours(1)),
            trades_this_day: self.entries_within(now, Duration::days(1)),
            total_wins: self.total_wins,
            total_trades: self.total_trades,
            is_paused: self.paused_until.map(|u| now < u).unwrap_or(false),
            pause_reason: self.pause_reason.clone(),
            cooldown_remaining_secs: cooldown_remaining,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    /// Net loss (positive number) over the trailing window.
    fn loss_within(&self, now: DateTime<Utc>, window: Duration) -> f64 {
        let cutoff = now - window;
        let net: f64 = self
            .pnl_events
            .iter()
            .filter(|(t, _)| *t >= cutoff)
            .map(|(_, p)| *p)
            .sum();
        (-net).max(0.0)
    }

    fn entries_within(&self, now: DateTime<Utc>, window: Duration) -> u32 {
        let cutoff = now - window;
        self.entry_times.iter().filter(|t| **t >= cutoff).count() as u32
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - Duration::days(1);
        while matches!(self.pnl_events.front(), Some((t, _)) if *t < cutoff) {
            self.pnl_events.pop_front();
        }
        while matches!(self.entry_times.front(), Some(t) if *t < cutoff) {
            self.entry_times.pop_front();
        }
    }
}
