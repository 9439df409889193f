// =============================================================================
// Position model — TP ladder, stop plan, protection state, PnL accounting
// =============================================================================
//
// Positions live in the engine's symbol-keyed map and are mutated only under
// the per-Autopilot lock. Every field here is plain data; all exchange
// interaction happens in the placer/guardian/monitor tasks.
//
// Protection life-cycle:
//   Opening -> PlacingSl -> SlVerified -> PlacingTp -> Protected
// with recovery edges
//   Protected | SlVerified -> Unprotected -> Healing -> SlVerified |
//   Protected | Emergency
// `Emergency` is terminal — the position will be market-closed.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::analyzer::{Decision, UltraFastSignal};
use crate::settings::SltpConfig;
use crate::types::{Side, SignalSource, TradeMode};

/// Tolerance for trigger comparisons, as a fraction of price (0.01 %).
pub const TRIGGER_TOLERANCE: f64 = 0.0001;

// ---------------------------------------------------------------------------
// Take-profit plan
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TpStatus {
    Pending,
    Hit,
}

/// One level of the take-profit ladder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TpLevel {
    /// 1-based level index.
    pub level: usize,
    pub trigger_price: f64,
    /// Share of `original_qty` closed at this level.
    pub allocation_percent: f64,
    /// Distance from entry, percent.
    pub gain_percent: f64,
    pub status: TpStatus,
}

/// Normalise a TP allocation vector: anything that does not sum to 100 ± 1
/// is replaced by the even 25/25/25/25 split.
pub fn normalize_allocations(allocations: &[f64]) -> Vec<f64> {
    let sum: f64 = allocations.iter().sum();
    if allocations.is_empty() || (sum - 100.0).abs() > 1.0 {
        vec![25.0, 25.0, 25.0, 25.0]
    } else {
        allocations.to_vec()
    }
}

/// Build a TP ladder from gain percentages. Longs ladder above entry,
/// shorts below.
pub fn build_tp_levels(
    entry_price: f64,
    side: Side,
    gains: &[f64],
    allocations: &[f64],
) -> Vec<TpLevel> {
    let allocations = normalize_allocations(allocations);
    let count = gains.len().min(allocations.len());

    (0..count)
        .map(|i| {
            let gain = gains[i];
            let trigger_price = match side {
                Side::Long => entry_price * (1.0 + gain / 100.0),
                Side::Short => entry_price * (1.0 - gain / 100.0),
            };
            TpLevel {
                level: i + 1,
                trigger_price,
                allocation_percent: allocations[i],
                gain_percent: gain,
                status: TpStatus::Pending,
            }
        })
        .collect()
}

/// Single-TP plan: one level that closes everything.
pub fn single_tp_level(entry_price: f64, side: Side, gain_percent: f64) -> Vec<TpLevel> {
    let trigger_price = match side {
        Side::Long => entry_price * (1.0 + gain_percent / 100.0),
        Side::Short => entry_price * (1.0 - gain_percent / 100.0),
    };
    vec![TpLevel {
        level: 1,
        trigger_price,
        allocation_percent: 100.0,
        gain_percent,
        status: TpStatus::Pending,
    }]
}

/// Build the TP plan for a mode config: ladder by default, single level when
/// configured.
pub fn tp_plan_for(entry_price: f64, side: Side, sltp: &SltpConfig) -> Vec<TpLevel> {
    if sltp.use_single_tp {
        let gain = if sltp.single_tp_percent > 0.0 {
            sltp.single_tp_percent
        } else {
            sltp.take_profit_percent
        };
        single_tp_level(entry_price, side, gain)
    } else {
        build_tp_levels(entry_price, side, &sltp.tp_gain_levels, &sltp.tp_allocation)
    }
}

/// Default SL percent: ATR-scaled distance blended with an advisor
/// suggestion and clamped to the mode bounds.
pub fn blend_sl_percent(
    advisor_sl_percent: Option<f64>,
    atr_percent: Option<f64>,
    sltp: &SltpConfig,
) -> f64 {
    let atr_based = atr_percent
        .map(|a| a * sltp.atr_sl_multiplier)
        .unwrap_or(sltp.stop_loss_percent);

    let blended = match advisor_sl_percent {
        Some(llm) => sltp.llm_weight * llm + sltp.atr_weight * atr_based,
        None => atr_based,
    };

    blended.clamp(sltp.atr_sl_min, sltp.atr_sl_max)
}

/// SL price at `sl_percent` distance from entry, on the losing side.
pub fn stop_loss_price(entry_price: f64, side: Side, sl_percent: f64) -> f64 {
    match side {
        Side::Long => entry_price * (1.0 - sl_percent / 100.0),
        Side::Short => entry_price * (1.0 + sl_percent / 100.0),
    }
}

// ---------------------------------------------------------------------------
// Trigger comparisons (tolerance-based)
// ---------------------------------------------------------------------------

/// Whether `price` has crossed the stop-loss for a position on `side`.
pub fn sl_hit(price: f64, stop_loss: f64, side: Side) -> bool {
    if stop_loss <= 0.0 {
        return false;
    }
    let tol = price * TRIGGER_TOLERANCE;
    match side {
        Side::Long => price <= stop_loss + tol,
        Side::Short => price >= stop_loss - tol,
    }
}

/// Whether `price` has crossed a TP trigger for a position on `side`.
pub fn tp_hit(price: f64, trigger: f64, side: Side) -> bool {
    let tol = price * TRIGGER_TOLERANCE;
    match side {
        Side::Long => price >= trigger - tol,
        Side::Short => price <= trigger + tol,
    }
}

// ---------------------------------------------------------------------------
// Protection state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtectionState {
    Opening,
    PlacingSl,
    SlVerified,
    PlacingTp,
    Protected,
    Unprotected,
    Healing,
    Emergency,
}

impl std::fmt::Display for ProtectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Opening => "OPENING",
            Self::PlacingSl => "PLACING_SL",
            Self::SlVerified => "SL_VERIFIED",
            Self::PlacingTp => "PLACING_TP",
            Self::Protected => "PROTECTED",
            Self::Unprotected => "UNPROTECTED",
            Self::Healing => "HEALING",
            Self::Emergency => "EMERGENCY",
        };
        write!(f, "{s}")
    }
}

/// Guardian bookkeeping for one position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectionStatus {
    pub state: ProtectionState,
    pub sl_verified: bool,
    pub sl_verified_at: Option<DateTime<Utc>>,
    pub tp_verified: bool,
    pub tp_verified_at: Option<DateTime<Utc>>,
    pub failure_count: u32,
    pub heal_attempts: u32,
    pub last_failure: Option<String>,
    pub last_state_change: DateTime<Utc>,
    /// When the guardian first saw the position unprotected (escalation timer).
    pub unprotected_since: Option<DateTime<Utc>>,
    /// When the guardian first saw the TP missing while the SL was fine
    /// (partial-heal timer).
    pub tp_missing_since: Option<DateTime<Utc>>,
}

impl ProtectionStatus {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            state: ProtectionState::Opening,
            sl_verified: false,
            sl_verified_at: None,
            tp_verified: false,
            tp_verified_at: None,
            failure_count: 0,
            heal_attempts: 0,
            last_failure: None,
            last_state_change: now,
            unprotected_since: None,
            tp_missing_since: None,
        }
    }

    pub fn set_state(&mut self, state: ProtectionState, now: DateTime<Utc>) {
        if self.state != state {
            self.state = state;
            self.last_state_change = now;
        }
        match state {
            ProtectionState::Unprotected => {
                if self.unprotected_since.is_none() {
                    self.unprotected_since = Some(now);
                }
            }
            ProtectionState::Protected | ProtectionState::SlVerified => {
                self.unprotected_since = None;
            }
            _ => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Position
// ---------------------------------------------------------------------------

/// One open position, keyed by symbol within an Autopilot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    // Identity
    pub symbol: String,
    pub side: Side,
    pub mode: TradeMode,

    // Execution facts
    pub entry_price: f64,
    pub original_qty: f64,
    pub remaining_qty: f64,
    pub leverage: u32,
    pub entry_time: DateTime<Utc>,
    /// Link to the persisted trade record.
    pub futures_trade_id: String,

    // Take-profit plan
    pub tp_levels: Vec<TpLevel>,

    // Stop plan
    pub stop_loss: f64,
    pub original_sl: f64,
    pub moved_to_breakeven: bool,
    pub trailing_active: bool,
    pub highest_price: f64,
    pub lowest_price: f64,
    pub trailing_percent: f64,
    pub trailing_activation_percent: f64,

    // Exchange linkage
    pub stop_loss_algo_id: Option<u64>,
    /// First element is always the currently-active TP order.
    pub take_profit_algo_ids: Vec<u64>,

    // Protection
    pub protection: ProtectionStatus,

    // Accounting
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    pub custom_roi_percent: Option<f64>,

    // UltraFast extras
    pub ultra_fast_signal: Option<UltraFastSignal>,
    pub ultra_fast_target_percent: Option<f64>,
    /// Seconds; 0 means no hold-time limit.
    pub max_hold_time_secs: u64,

    // Provenance
    pub source: SignalSource,
    pub strategy_id: Option<String>,
    pub strategy_name: Option<String>,
    pub decision: Option<Decision>,

    /// Last advisor consultation (adaptive updater cadence).
    pub last_advisor_update: Option<DateTime<Utc>>,
}

impl Position {
    /// Number of TP levels already hit. Level numbering is 1-based, so this
    /// doubles as "current TP level" (0 = none hit yet).
    pub fn current_tp_level(&self) -> usize {
        self.tp_levels
            .iter()
            .filter(|t| t.status == TpStatus::Hit)
            .count()
    }

    /// The next pending TP level, if any.
    pub fn next_pending_tp(&self) -> Option<&TpLevel> {
        self.tp_levels.iter().find(|t| t.status == TpStatus::Pending)
    }

    pub fn next_pending_tp_mut(&mut self) -> Option<&mut TpLevel> {
        self.tp_levels
            .iter_mut()
            .find(|t| t.status == TpStatus::Pending)
    }

    /// Whether the next pending TP is the final level of the ladder.
    pub fn next_tp_is_final(&self) -> bool {
        self.tp_levels
            .iter()
            .filter(|t| t.status == TpStatus::Pending)
            .count()
            == 1
    }

    /// Unrealized PnL in USD and unleveraged percent at `price`.
    pub fn pnl_at(&self, price: f64) -> (f64, f64) {
        let direction = self.side.direction();
        let pnl = direction * (price - self.entry_price) * self.remaining_qty;
        let pct = if self.entry_price > 0.0 {
            direction * (price - self.entry_price) / self.entry_price * 100.0
        } else {
            0.0
        };
        (pnl, pct)
    }

    /// Leveraged ROI after taker fees, percent of margin.
    pub fn roi_after_fees(&self, price: f64, taker_fee_percent: f64) -> f64 {
        if self.entry_price <= 0.0 || self.remaining_qty <= 0.0 {
            return 0.0;
        }
        let gross = self.side.direction() * (price - self.entry_price) * self.remaining_qty;
        let entry_fee = taker_fee_percent / 100.0 * self.entry_price * self.remaining_qty;
        let exit_fee = taker_fee_percent / 100.0 * price * self.remaining_qty;
        let notional = self.entry_price * self.remaining_qty;
        (gross - entry_fee - exit_fee) * self.leverage as f64 / notional * 100.0
    }

    /// Update high/low water marks with a fresh price.
    pub fn update_water_marks(&mut self, price: f64) {
        if price > self.highest_price {
            self.highest_price = price;
        }
        if self.lowest_price == 0.0 || price < self.lowest_price {
            self.lowest_price = price;
        }
    }

    /// Breakeven SL: entry shifted by the buffer in the position's favour.
    pub fn breakeven_sl(&self, buffer_percent: f64) -> f64 {
        match self.side {
            Side::Long => self.entry_price * (1.0 + buffer_percent / 100.0),
            Side::Short => self.entry_price * (1.0 - buffer_percent / 100.0),
        }
    }

    /// Trailing SL candidate from the current water mark.
    pub fn trailing_candidate(&self) -> f64 {
        match self.side {
            Side::Long => self.highest_price * (1.0 - self.trailing_percent / 100.0),
            Side::Short => self.lowest_price * (1.0 + self.trailing_percent / 100.0),
        }
    }

    /// Whether `candidate` improves the SL in the profitable direction, by at
    /// least `min_improvement_percent` of entry (the push debounce).
    pub fn improves_sl(&self, candidate: f64, min_improvement_percent: f64) -> bool {
        let delta = match self.side {
            Side::Long => candidate - self.stop_loss,
            Side::Short => self.stop_loss - candidate,
        };
        if delta <= 0.0 {
            return false;
        }
        delta / self.entry_price * 100.0 >= min_improvement_percent
    }

    /// Pullback from the favourable water mark, percent (trailing exit).
    pub fn pullback_percent(&self, price: f64) -> f64 {
        match self.side {
            Side::Long => {
                if self.highest_price <= 0.0 {
                    0.0
                } else {
                    (self.highest_price - price) / self.highest_price * 100.0
                }
            }
            Side::Short => {
                if self.lowest_price <= 0.0 {
                    0.0
                } else {
                    (price - self.lowest_price) / self.lowest_price * 100.0
                }
            }
        }
    }

    /// Seconds the position has been open.
    pub fn hold_duration_secs(&self, now: DateTime<Utc>) -> u64 {
        (now - self.entry_time).num_seconds().max(0) as u64
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn position(side: Side) -> Position {
        let entry = 2000.0;
        Position {
            symbol: "ETHUSDT".into(),
            side,
            mode: TradeMode::Swing,
            entry_price: entry,
            original_qty: 0.5,
            remaining_qty: 0.5,
            leverage: 5,
            entry_time: Utc::now(),
            futures_trade_id: "t1".into(),
            tp_levels: build_tp_levels(entry, side, &[1.0, 2.0, 3.0, 4.0], &[25.0; 4]),
            stop_loss: stop_loss_price(entry, side, 2.0),
            original_sl: stop_loss_price(entry, side, 2.0),
            moved_to_breakeven: false,
            trailing_active: false,
            highest_price: entry,
            lowest_price: entry,
            trailing_percent: 1.0,
            trailing_activation_percent: 1.5,
            stop_loss_algo_id: None,
            take_profit_algo_ids: Vec::new(),
            protection: ProtectionStatus::new(Utc::now()),
            realized_pnl: 0.0,
            unrealized_pnl: 0.0,
            custom_roi_percent: None,
            ultra_fast_signal: None,
            ultra_fast_target_percent: None,
            max_hold_time_secs: 0,
            source: SignalSource::Ai,
            strategy_id: None,
            strategy_name: None,
            decision: None,
            last_advisor_update: None,
        }
    }

    #[test]
    fn tp_levels_sit_on_the_profitable_side() {
        let long = build_tp_levels(2000.0, Side::Long, &[1.0, 2.0], &[50.0, 50.0]);
        assert!(long.iter().all(|t| t.trigger_price > 2000.0));

        let short = build_tp_levels(2000.0, Side::Short, &[1.0, 2.0], &[50.0, 50.0]);
        assert!(short.iter().all(|t| t.trigger_price < 2000.0));
    }

    #[test]
    fn allocations_always_sum_to_100() {
        assert_eq!(normalize_allocations(&[25.0, 25.0, 25.0, 25.0]).len(), 4);
        // 100 ± 1 tolerance accepted.
        let ok = normalize_allocations(&[25.5, 25.0, 25.0, 25.0]);
        assert!((ok.iter().sum::<f64>() - 100.5).abs() < 1e-9);
        // Out of tolerance replaced with the even split.
        let fixed = normalize_allocations(&[40.0, 40.0, 40.0]);
        assert_eq!(fixed, vec![25.0, 25.0, 25.0, 25.0]);
        assert_eq!(normalize_allocations(&[]), vec![25.0, 25.0, 25.0, 25.0]);
    }

    #[test]
    fn single_tp_closes_everything() {
        let levels = single_tp_level(100.0, Side::Long, 0.6);
        assert_eq!(levels.len(), 1);
        assert_eq!(levels[0].allocation_percent, 100.0);
        assert!((levels[0].trigger_price - 100.6).abs() < 1e-9);
    }

    #[test]
    fn sl_price_sits_on_the_losing_side() {
        assert!((stop_loss_price(2000.0, Side::Long, 2.0) - 1960.0).abs() < 1e-9);
        assert!((stop_loss_price(2000.0, Side::Short, 2.0) - 2040.0).abs() < 1e-9);
    }

    #[test]
    fn blended_sl_mixes_llm_and_atr() {
        let sltp = SltpConfig::default();
        // advisor 2.0%, ATR 1.0% × 1.5 mult = 1.5% -> 0.7*2.0 + 0.3*1.5 = 1.85
        let blended = blend_sl_percent(Some(2.0), Some(1.0), &sltp);
        assert!((blended - 1.85).abs() < 1e-9);

        // Clamped to atr_sl_max.
        let clamped = blend_sl_percent(Some(50.0), Some(1.0), &sltp);
        assert!((clamped - sltp.atr_sl_max).abs() < 1e-9);
    }

    #[test]
    fn trigger_tolerance_is_a_hundredth_of_a_percent() {
        // Long SL at 1960: price 1960.19 is within tolerance (0.01% ≈ 0.196).
        assert!(sl_hit(1960.1, 1960.0, Side::Long));
        assert!(!sl_hit(1960.5, 1960.0, Side::Long));
        // Short SL at 2040.
        assert!(sl_hit(2039.9, 2040.0, Side::Short));
        assert!(!sl_hit(2039.5, 2040.0, Side::Short));
        // TP for a long at 2020.
        assert!(tp_hit(2019.9, 2020.0, Side::Long));
        assert!(!tp_hit(2019.0, 2020.0, Side::Long));
    }

    #[test]
    fn zero_stop_loss_never_hits() {
        assert!(!sl_hit(1.0, 0.0, Side::Long));
    }

    #[test]
    fn pnl_and_water_marks() {
        let mut p = position(Side::Long);
        p.update_water_marks(2050.0);
        p.update_water_marks(1990.0);
        assert_eq!(p.highest_price, 2050.0);
        assert_eq!(p.lowest_price, 1990.0);

        let (pnl, pct) = p.pnl_at(2020.0);
        assert!((pnl - 10.0).abs() < 1e-9); // (2020-2000)*0.5
        assert!((pct - 1.0).abs() < 1e-9);

        let short = position(Side::Short);
        let (pnl, pct) = short.pnl_at(1980.0);
        assert!((pnl - 10.0).abs() < 1e-9);
        assert!((pct - 1.0).abs() < 1e-9);
    }

    #[test]
    fn roi_after_fees_is_leveraged_and_fee_adjusted() {
        let p = position(Side::Long);
        // +1% move, 5x leverage, 0.05% fee each way ≈ 5% - ~0.5% = ~4.5%
        let roi = p.roi_after_fees(2020.0, 0.05);
        assert!(roi > 4.0 && roi < 5.0, "roi = {roi}");

        // Without fees, exactly 5%.
        let roi_no_fee = p.roi_after_fees(2020.0, 0.0);
        assert!((roi_no_fee - 5.0).abs() < 1e-9);
    }

    #[test]
    fn tp_progress_tracking() {
        let mut p = position(Side::Long);
        assert_eq!(p.current_tp_level(), 0);
        assert_eq!(p.next_pending_tp().unwrap().level, 1);
        assert!(!p.next_tp_is_final());

        for _ in 0..3 {
            p.next_pending_tp_mut().unwrap().status = TpStatus::Hit;
        }
        assert_eq!(p.current_tp_level(), 3);
        assert!(p.next_tp_is_final());
    }

    #[test]
    fn breakeven_and_trailing_geometry() {
        let mut p = position(Side::Long);
        assert!((p.breakeven_sl(0.1) - 2002.0).abs() < 1e-9);

        p.update_water_marks(2100.0);
        // candidate = 2100 * (1 - 1%) = 2079
        assert!((p.trailing_candidate() - 2079.0).abs() < 1e-9);

        // Improvement from 1960 to 2079 = 119/2000 = 5.95% >= 0.05% debounce.
        assert!(p.improves_sl(2079.0, 0.05));
        // A worse candidate never improves.
        assert!(!p.improves_sl(1900.0, 0.05));

        // Pullback from the high.
        assert!((p.pullback_percent(2079.0) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn short_trailing_geometry() {
        let mut p = position(Side::Short);
        p.update_water_marks(1900.0);
        // candidate = 1900 * 1.01 = 1919
        assert!((p.trailing_candidate() - 1919.0).abs() < 1e-9);
        assert!(p.improves_sl(1919.0, 0.05));
        assert!((p.pullback_percent(1919.0) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn protection_state_tracks_unprotected_since() {
        let now = Utc::now();
        let mut ps = ProtectionStatus::new(now);
        assert_eq!(ps.state, ProtectionState::Opening);

        ps.set_state(ProtectionState::Unprotected, now);
        assert!(ps.unprotected_since.is_some());

        // Re-entering unprotected keeps the original timestamp.
        let later = now + chrono::Duration::seconds(10);
        ps.set_state(ProtectionState::Unprotected, later);
        assert_eq!(ps.unprotected_since, Some(now));

        ps.set_state(ProtectionState::Protected, later);
        assert!(ps.unprotected_since.is_none());
    }
}
