// =============================================================================
// Journal — trade results, signal logs, SL-update logs (bounded ring buffers)
// =============================================================================
//
// Observability for "why did the engine (not) act". Signal rejections and
// advisor-SL rejections are ring-buffered so diagnostics can answer the two
// questions operators actually ask: why was a signal skipped, and why was an
// SL suggestion rejected.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Side, TradeMode};

/// Capacity of the signal ring buffer.
pub const SIGNAL_LOG_CAPACITY: usize = 500;
/// Capacity of the SL-update ring buffer.
pub const SL_UPDATE_LOG_CAPACITY: usize = 200;
/// Capacity of the in-memory trade-result buffer.
pub const TRADE_RESULT_CAPACITY: usize = 500;

// ---------------------------------------------------------------------------
// Ring buffer
// ---------------------------------------------------------------------------

/// Fixed-capacity append-only log; oldest entries are evicted.
#[derive(Debug, Clone)]
pub struct RingLog<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T: Clone> RingLog<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity.min(64)),
            capacity,
        }
    }

    pub fn push(&mut self, item: T) {
        if self.items.len() == self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    /// Most recent `count` items, newest first.
    pub fn recent(&self, count: usize) -> Vec<T> {
        self.items.iter().rev().take(count).cloned().collect()
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Result of one closed (or partially closed) trade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeResult {
    pub time: DateTime<Utc>,
    pub symbol: String,
    pub side: Side,
    pub mode: TradeMode,
    pub entry_price: f64,
    pub exit_price: f64,
    pub quantity: f64,
    pub realized_pnl: f64,
    /// Leveraged ROI percent.
    pub pnl_percent: f64,
    /// "take_profit", "stop_loss", "trailing_stop", "funding_rate_exit",
    /// "early_profit", "full_close", "emergency_close", ...
    pub reason: String,
    pub futures_trade_id: String,
    /// False for partial closes.
    pub full_close: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalStatus {
    Executed,
    Rejected,
}

/// One scanner decision outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalLog {
    pub time: DateTime<Utc>,
    pub symbol: String,
    pub mode: TradeMode,
    pub status: SignalStatus,
    pub reason: String,
    /// Filter-specific detail for rejected signals.
    pub rejection_details: Option<String>,
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlUpdateStatus {
    Applied,
    Rejected,
}

/// One advisor SL-update attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlUpdateRecord {
    pub time: DateTime<Utc>,
    pub symbol: String,
    pub status: SlUpdateStatus,
    /// Which validation rule rejected the update.
    pub rejection_rule: Option<String>,
    pub old_sl: f64,
    pub new_sl: f64,
    /// "advisor", "breakeven", "trailing".
    pub source: String,
}

/// Record of an advisor kill-switch flip for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSwitch {
    pub time: DateTime<Utc>,
    pub symbol: String,
    pub disabled: bool,
    pub reason: String,
}

// ---------------------------------------------------------------------------
// Hourly signal statistics (diagnostics)
// ---------------------------------------------------------------------------

/// Aggregate over the last hour of signal logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalStats {
    pub total_1h: usize,
    pub executed_1h: usize,
    pub rejected_1h: usize,
    /// executed / total, 0–1.
    pub execution_rate_1h: f64,
    /// (reason, count), most common first, top 5.
    pub top_rejection_reasons: Vec<(String, usize)>,
}

/// Compute hourly signal statistics from the ring buffer.
pub fn signal_stats(logs: &RingLog<SignalLog>, now: DateTime<Utc>) -> SignalStats {
    let cutoff = now - Duration::hours(1);
    let mut total = 0usize;
    let mut executed = 0usize;
    let mut reasons: HashMap<String, usize> = HashMap::new();

    for log in logs.iter().filter(|l| l.time >= cutoff) {
        total += 1;
        match log.status {
            SignalStatus::Executed => executed += 1,
            SignalStatus::Rejected => {
                *reasons.entry(log.reason.clone()).or_insert(0) += 1;
            }
        }
    }

    let mut top: Vec<(String, usize)> = reasons.into_iter().collect();
    top.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    top.truncate(5);

    SignalStats {
        total_1h: total,
        executed_1h: executed,
        rejected_1h: total - executed,
        execution_rate_1h: if total > 0 {
            executed as f64 / total as f64
        } else {
            0.0
        },
        top_rejection_reasons: top,
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_evicts_oldest() {
        let mut ring: RingLog<u32> = RingLog::new(3);
        for i in 0..5 {
            ring.push(i);
        }
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.recent(3), vec![4, 3, 2]);
    }

    #[test]
    fn recent_is_newest_first() {
        let mut ring: RingLog<u32> = RingLog::new(10);
        ring.push(1);
        ring.push(2);
        assert_eq!(ring.recent(1), vec![2]);
    }

    fn signal(status: SignalStatus, reason: &str, age_mins: i64) -> SignalLog {
        SignalLog {
            time: Utc::now() - Duration::minutes(age_mins),
            symbol: "BTCUSDT".into(),
            mode: TradeMode::Scalp,
            status,
            reason: reason.into(),
            rejection_details: None,
            confidence: 60.0,
        }
    }

    #[test]
    fn stats_cover_one_hour_only() {
        let mut logs = RingLog::new(SIGNAL_LOG_CAPACITY);
        logs.push(signal(SignalStatus::Executed, "executed", 5));
        logs.push(signal(SignalStatus::Rejected, "confidence_below_threshold", 10));
        logs.push(signal(SignalStatus::Rejected, "confidence_below_threshold", 20));
        logs.push(signal(SignalStatus::Rejected, "coin_blocked: DOGEUSDT", 30));
        // Outside the window:
        logs.push(signal(SignalStatus::Rejected, "stale", 90));

        let stats = signal_stats(&logs, Utc::now());
        assert_eq!(stats.total_1h, 4);
        assert_eq!(stats.executed_1h, 1);
        assert_eq!(stats.rejected_1h, 3);
        assert!((stats.execution_rate_1h - 0.25).abs() < 1e-9);
        assert_eq!(
            stats.top_rejection_reasons[0],
            ("confidence_below_threshold".to_string(), 2)
        );
    }

    #[test]
    fn stats_empty_window() {
        let logs: RingLog<SignalLog> = RingLog::new(10);
        let stats = signal_stats(&logs, Utc::now());
        assert_eq!(stats.total_1h, 0);
        assert_eq!(stats.execution_rate_1h, 0.0);
    }
}
