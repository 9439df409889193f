// =============================================================================
// Capital Allocator — splits available margin across trading modes
// =============================================================================
//
// Each mode receives `available_balance × mode_percent` of capital. Before an
// entry the allocator checks, in order:
//   1. the mode's position-count limit,
//   2. cumulative used USD for the mode against its allocation,
//   3. the requested size against the per-position cap.
//
// `allocate` / `release` are called by the entry and exit paths. Lives inside
// the engine state lock; no interior mutability.
// =============================================================================

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::settings::Settings;
use crate::types::TradeMode;

/// Per-mode allocation snapshot for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeAllocationStatus {
    pub mode: TradeMode,
    pub allocated_percent: f64,
    pub allocated_usd: f64,
    pub used_usd: f64,
    pub available_usd: f64,
    pub current_positions: u32,
    pub max_positions: u32,
    /// used / allocated, 0–1.
    pub capital_utilization: f64,
    /// current / max positions, 0–1.
    pub position_utilization: f64,
}

#[derive(Debug, Clone, Default)]
struct ModeUsage {
    used_usd: f64,
    positions: u32,
}

/// Tracks capital usage per mode against the configured split.
#[derive(Debug, Clone, Default)]
pub struct CapitalAllocator {
    /// Last known available margin on the exchange.
    available_balance: f64,
    usage: HashMap<TradeMode, ModeUsage>,
}

impl CapitalAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update the cached account balance (fetched by the scan loop).
    pub fn update_balance(&mut self, available: f64) {
        self.available_balance = available;
    }

    pub fn available_balance(&self) -> f64 {
        self.available_balance
    }

    /// USD allocated to `mode` under the current balance and split.
    pub fn allocated_usd(&self, mode: TradeMode, settings: &Settings) -> f64 {
        let percent = settings.allocation_percent.get(&mode).copied().unwrap_or(0.0);
        self.available_balance * percent / 100.0
    }

    /// Whether `requested_usd` can be committed to `mode`.
    pub fn can_allocate(
        &self,
        mode: TradeMode,
        requested_usd: f64,
        settings: &Settings,
    ) -> (bool, Option<String>) {
        let cfg = settings.mode(mode);
        let usage = self.usage.get(&mode).cloned().unwrap_or_default();

        if usage.positions >= cfg.size.max_positions {
            return (
                false,
                Some(format!(
                    "{mode}: position limit reached ({}/{})",
                    usage.positions, cfg.size.max_positions
                )),
            );
        }

        let allocated = self.allocated_usd(mode, settings);
        if usage.used_usd + requested_usd > allocated {
            return (
                false,
                Some(format!(
                    "{mode}: {requested_usd:.2} USD would exceed allocation ({:.2}/{allocated:.2} used)",
                    usage.used_usd
                )),
            );
        }

        if requested_usd > cfg.size.max_position_usd {
            return (
                false,
                Some(format!(
                    "{mode}: {requested_usd:.2} USD above per-position cap {:.2}",
                    cfg.size.max_position_usd
                )),
            );
        }

        (true, None)
    }

    /// Commit capital to a new position in `mode`.
    pub fn allocate(&mut self, mode: TradeMode, usd: f64) {
        let usage = self.usage.entry(mode).or_default();
        usage.used_usd += usd;
        usage.positions += 1;
        debug!(%mode, usd, used = usage.used_usd, positions = usage.positions, "capital allocated");
    }

    /// Release capital when a position closes (or partially closes).
    /// `closes_position` drops the position count as well.
    pub fn release(&mut self, mode: TradeMode, usd: f64, closes_position: bool) {
        let usage = self.usage.entry(mode).or_default();
        usage.used_usd = (usage.used_usd - usd).max(0.0);
        if closes_position {
            usage.positions = usage.positions.saturating_sub(1);
        }
        debug!(%mode, usd, used = usage.used_usd, positions = usage.positions, "capital released");
    }

    pub fn positions_in(&self, mode: TradeMode) -> u32 {
        self.usage.get(&mode).map(|u| u.positions).unwrap_or(0)
    }

    /// Build the per-mode status table for diagnostics.
    pub fn status(&self, settings: &Settings) -> Vec<ModeAllocationStatus> {
        TradeMode::ALL
            .iter()
            .map(|mode| {
                let cfg = settings.mode(*mode);
                let usage = self.usage.get(mode).cloned().unwrap_or_default();
                let percent = settings
                    .allocation_percent
                    .get(mode)
                    .copied()
                    .unwrap_or(0.0);
                let allocated = self.available_balance * percent / 100.0;

                ModeAllocationStatus {
                    mode: *mode,
                    allocated_percent: percent,
                    allocated_usd: allocated,
                    used_usd: usage.used_usd,
                    available_usd: (allocated - usage.used_usd).max(0.0),
                    current_positions: usage.positions,
                    max_positions: cfg.size.max_positions,
                    capital_utilization: if allocated > 0.0 {
                        (usage.used_usd / allocated).min(1.0)
                    } else {
                        0.0
                    },
                    position_utilization: if cfg.size.max_positions > 0 {
                        usage.positions as f64 / cfg.size.max_positions as f64
                    } else {
                        0.0
                    },
                }
            })
            .collect()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> Settings {
        // Defaults: Scalp gets 30%, max 3 positions, 500 USD position cap.
        Settings::default()
    }

    #[test]
    fn allocation_follows_balance_and_percent() {
        let mut a = CapitalAllocator::new();
        a.update_balance(1000.0);
        let s = settings();
        assert!((a.allocated_usd(TradeMode::Scalp, &s) - 300.0).abs() < 1e-9);
        assert!((a.allocated_usd(TradeMode::Swing, &s) - 400.0).abs() < 1e-9);
    }

    #[test]
    fn position_limit_checked_first() {
        let mut a = CapitalAllocator::new();
        a.update_balance(10_000.0);
        let s = settings();

        for _ in 0..3 {
            a.allocate(TradeMode::Scalp, 100.0);
        }
        let (ok, reason) = a.can_allocate(TradeMode::Scalp, 50.0, &s);
        assert!(!ok);
        assert!(reason.unwrap().contains("position limit"));
    }

    #[test]
    fn used_capital_limits_further_entries() {
        let mut a = CapitalAllocator::new();
        a.update_balance(1000.0);
        let s = settings();

        // Scalp allocation = 300 USD.
        a.allocate(TradeMode::Scalp, 250.0);
        let (ok, reason) = a.can_allocate(TradeMode::Scalp, 100.0, &s);
        assert!(!ok);
        assert!(reason.unwrap().contains("allocation"));

        let (ok, _) = a.can_allocate(TradeMode::Scalp, 50.0, &s);
        assert!(ok);
    }

    #[test]
    fn per_position_cap_enforced() {
        let mut a = CapitalAllocator::new();
        a.update_balance(100_000.0);
        let s = settings();

        // Well inside the allocation but above the 500 USD position cap.
        let (ok, reason) = a.can_allocate(TradeMode::Scalp, 600.0, &s);
        assert!(!ok);
        assert!(reason.unwrap().contains("per-position cap"));
    }

    #[test]
    fn release_returns_capital() {
        let mut a = CapitalAllocator::new();
        a.update_balance(1000.0);
        let s = settings();

        a.allocate(TradeMode::Swing, 300.0);
        assert_eq!(a.positions_in(TradeMode::Swing), 1);

        // Partial close releases capital but keeps the slot.
        a.release(TradeMode::Swing, 150.0, false);
        assert_eq!(a.positions_in(TradeMode::Swing), 1);

        a.release(TradeMode::Swing, 150.0, true);
        assert_eq!(a.positions_in(TradeMode::Swing), 0);

        let (ok, _) = a.can_allocate(TradeMode::Swing, 300.0, &s);
        assert!(ok);
    }

    #[test]
    fn status_reports_utilization() {
        let mut a = CapitalAllocator::new();
        a.update_balance(1000.0);
        let s = settings();
        a.allocate(TradeMode::Scalp, 150.0);

        let status = a.status(&s);
        let scalp = status
            .iter()
            .find(|m| m.mode == TradeMode::Scalp)
            .unwrap();
        assert!((scalp.capital_utilization - 0.5).abs() < 1e-9);
        assert!((scalp.available_usd - 150.0).abs() < 1e-9);
        assert_eq!(scalp.current_positions, 1);
    }
}
