// =============================================================================
// Blocked-Coin Registry — per-coin loss tracking with escalating blocks
// =============================================================================
//
// A coin is blocked after a single big loss or after enough consecutive
// losses. The first offence auto-expires after two hours; every subsequent
// offence requires a manual unblock.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// ROI percentage at or below which a single loss blocks the coin.
pub const BIG_LOSS_ROI_PERCENT: f64 = -50.0;
/// Consecutive losses on one coin before it is blocked.
pub const MAX_COIN_CONSECUTIVE_LOSSES: u32 = 3;
/// Auto-unblock delay for a first offence.
const AUTO_UNBLOCK_HOURS: i64 = 2;

/// One blocked-coin record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockedCoin {
    pub symbol: String,
    pub block_reason: String,
    pub block_time: DateTime<Utc>,
    pub loss_amount: f64,
    pub loss_roi: f64,
    pub consecutive_losses: u32,
    /// None when only a manual unblock can clear the coin.
    pub auto_unblock_time: Option<DateTime<Utc>>,
    /// How many times this coin has been blocked.
    pub block_count: u32,
    pub manual_only: bool,
}

/// Registry of blocked coins plus per-coin loss streaks.
#[derive(Debug, Clone, Default)]
pub struct BlockedCoinRegistry {
    blocked: HashMap<String, BlockedCoin>,
    loss_streak: HashMap<String, u32>,
    /// Lifetime block counts (survive unblocks, drive escalation).
    block_counts: HashMap<String, u32>,
}

impl BlockedCoinRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a closed trade for `symbol`. Losses build the streak; wins
    /// clear it. Returns the new block record if this result blocked the
    /// coin.
    pub fn record_result(
        &mut self,
        symbol: &str,
        pnl_usd: f64,
        roi_percent: f64,
        now: DateTime<Utc>,
    ) -> Option<BlockedCoin> {
        if roi_percent >= 0.0 {
            self.loss_streak.remove(symbol);
            return None;
        }

        let streak = self.loss_streak.entry(symbol.to_string()).or_insert(0);
        *streak += 1;
        let streak = *streak;

        let reason = if roi_percent <= BIG_LOSS_ROI_PERCENT {
            Some(format!("big loss {roi_percent:.1}% ROI"))
        } else if streak >= MAX_COIN_CONSECUTIVE_LOSSES {
            Some(format!("{streak} consecutive losses"))
        } else {
            None
        };

        let reason = reason?;
        Some(self.block(symbol, reason, pnl_usd, roi_percent, streak, now))
    }

    fn block(
        &mut self,
        symbol: &str,
        reason: String,
        loss_amount: f64,
        loss_roi: f64,
        consecutive_losses: u32,
        now: DateTime<Utc>,
    ) -> BlockedCoin {
        let count = self.block_counts.entry(symbol.to_string()).or_insert(0);
        *count += 1;
        let count = *count;

        // First offence auto-expires; repeat offenders need a human.
        let manual_only = count > 1;
        let auto_unblock_time =
            (!manual_only).then(|| now + Duration::hours(AUTO_UNBLOCK_HOURS));

        let record = BlockedCoin {
            symbol: symbol.to_string(),
            block_reason: reason.clone(),
            block_time: now,
            loss_amount,
            loss_roi,
            consecutive_losses,
            auto_unblock_time,
            block_count: count,
            manual_only,
        };

        warn!(
            symbol,
            reason = %reason,
            block_count = count,
            manual_only,
            "coin blocked"
        );

        self.blocked.insert(symbol.to_string(), record.clone());
        record
    }

    /// Whether `symbol` is currently blocked; expired auto-blocks are
    /// cleared as a side effect. Returns the block reason when blocked.
    pub fn is_blocked(&mut self, symbol: &str, now: DateTime<Utc>) -> Option<String> {
        let expired = match self.blocked.get(symbol) {
            Some(b) => match b.auto_unblock_time {
                Some(t) if now >= t => true,
                _ => return Some(b.block_reason.clone()),
            },
            None => return None,
        };

        if expired {
            info!(symbol, "coin auto-unblocked after cooldown");
            self.blocked.remove(symbol);
            self.loss_streak.remove(symbol);
        }
        None
    }

    /// Manual unblock (operator action). Clears the loss streak too.
    pub fn unblock(&mut self, symbol: &str) -> bool {
        self.loss_streak.remove(symbol);
        if self.blocked.remove(symbol).is_some() {
            info!(symbol, "coin manually unblocked");
            true
        } else {
            false
        }
    }

    /// Currently blocked coins (expired auto-blocks pruned).
    pub fn list(&mut self, now: DateTime<Utc>) -> Vec<BlockedCoin> {
        let expired: Vec<String> = self
            .blocked
            .values()
            .filter(|b| matches!(b.auto_unblock_time, Some(t) if now >= t))
            .map(|b| b.symbol.clone())
            .collect();
        for s in expired {
            self.blocked.remove(&s);
            self.loss_streak.remove(&s);
        }
        let mut list: Vec<BlockedCoin> = self.blocked.values().cloned().collect();
        list.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        list
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn big_loss_blocks_with_auto_unblock() {
        let mut reg = BlockedCoinRegistry::new();
        let now = Utc::now();

        let block = reg.record_result("DOGEUSDT", -27.5, -55.0, now);
        let block = block.expect("big loss must block");
        assert!(!block.manual_only);
        assert_eq!(
            block.auto_unblock_time.unwrap(),
            now + Duration::hours(2)
        );

        assert!(reg.is_blocked("DOGEUSDT", now).is_some());
        // Still blocked just before expiry.
        assert!(reg
            .is_blocked("DOGEUSDT", now + Duration::minutes(119))
            .is_some());
        // Auto-expires at the two-hour mark.
        assert!(reg
            .is_blocked("DOGEUSDT", now + Duration::hours(2))
            .is_none());
    }

    #[test]
    fn second_block_is_manual_only() {
        let mut reg = BlockedCoinRegistry::new();
        let now = Utc::now();

        reg.record_result("DOGEUSDT", -27.5, -55.0, now);
        // Auto-expires...
        assert!(reg
            .is_blocked("DOGEUSDT", now + Duration::hours(3))
            .is_none());

        // ...second big loss escalates.
        let block = reg
            .record_result("DOGEUSDT", -30.0, -60.0, now + Duration::hours(4))
            .unwrap();
        assert!(block.manual_only);
        assert!(block.auto_unblock_time.is_none());
        assert_eq!(block.block_count, 2);

        // Never auto-expires.
        assert!(reg
            .is_blocked("DOGEUSDT", now + Duration::days(30))
            .is_some());

        assert!(reg.unblock("DOGEUSDT"));
        assert!(reg.is_blocked("DOGEUSDT", now).is_none());
    }

    #[test]
    fn consecutive_small_losses_block() {
        let mut reg = BlockedCoinRegistry::new();
        let now = Utc::now();

        assert!(reg.record_result("XRPUSDT", -1.0, -5.0, now).is_none());
        assert!(reg.record_result("XRPUSDT", -1.0, -5.0, now).is_none());
        let block = reg.record_result("XRPUSDT", -1.0, -5.0, now).unwrap();
        assert!(block.block_reason.contains("consecutive"));
    }

    #[test]
    fn win_resets_streak() {
        let mut reg = BlockedCoinRegistry::new();
        let now = Utc::now();

        reg.record_result("XRPUSDT", -1.0, -5.0, now);
        reg.record_result("XRPUSDT", -1.0, -5.0, now);
        reg.record_result("XRPUSDT", 2.0, 10.0, now);
        assert!(reg.record_result("XRPUSDT", -1.0, -5.0, now).is_none());
        assert!(reg.record_result("XRPUSDT", -1.0, -5.0, now).is_none());
    }

    #[test]
    fn list_prunes_expired() {
        let mut reg = BlockedCoinRegistry::new();
        let now = Utc::now();
        reg.record_result("A1USDT", -20.0, -60.0, now);
        reg.record_result("B2USDT", -20.0, -60.0, now);

        assert_eq!(reg.list(now).len(), 2);
        assert_eq!(reg.list(now + Duration::hours(3)).len(), 0);
    }
}
