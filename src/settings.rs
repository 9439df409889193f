// =============================================================================
// Settings — per-mode configuration composed from small per-concern records
// =============================================================================
//
// Every tunable lives here so the engine can be reconfigured without a
// rebuild. Persistence uses an atomic tmp + rename pattern, and all fields
// carry serde defaults so older JSON files keep loading as fields are added.
//
// Fallback chain for thresholds consumed elsewhere:
//   per-position override > per-user-symbol > per-symbol > mode default >
//   hard default.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::TradeMode;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_safety_margin() -> f64 {
    0.90
}

fn default_confidence_base() -> f64 {
    0.8
}

fn default_confidence_scale() -> f64 {
    0.4
}

fn default_tp_allocation() -> Vec<f64> {
    vec![25.0, 25.0, 25.0, 25.0]
}

fn default_llm_weight() -> f64 {
    0.7
}

fn default_atr_weight() -> f64 {
    0.3
}

fn default_cooldown_minutes() -> u64 {
    30
}

fn default_min_win_rate() -> f64 {
    0.30
}

fn default_win_rate_check_after() -> u32 {
    10
}

fn default_profit_window_minutes() -> u64 {
    60
}

fn default_pause_cooldown_minutes() -> u64 {
    30
}

fn default_win_rate_sample_size() -> usize {
    10
}

fn default_max_funding_rate() -> f64 {
    0.0003
}

fn default_funding_block_minutes() -> i64 {
    30
}

fn default_funding_exit_minutes() -> i64 {
    10
}

fn default_funding_fee_threshold_pct() -> f64 {
    30.0
}

fn default_extreme_funding_rate() -> f64 {
    0.004
}

fn default_ultra_fast_tick_ms() -> u64 {
    200
}

fn default_ultra_fast_monitor_secs() -> u64 {
    2
}

fn default_proactive_breakeven_pct() -> f64 {
    0.5
}

fn default_breakeven_buffer_pct() -> f64 {
    0.1
}

fn default_trailing_update_threshold() -> f64 {
    0.05
}

fn default_early_roi_floor() -> f64 {
    0.1
}

fn default_taker_fee_pct() -> f64 {
    0.05
}

// =============================================================================
// Per-concern config records
// =============================================================================

/// Position-sizing parameters for one mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizeConfig {
    /// Fraction of the available balance the sizer is allowed to touch.
    #[serde(default = "default_safety_margin")]
    pub safety_margin: f64,

    /// Confidence multiplier: `conf_m = base + (confidence/100) * scale`.
    #[serde(default = "default_confidence_base")]
    pub confidence_base: f64,
    #[serde(default = "default_confidence_scale")]
    pub confidence_scale: f64,

    /// Reject entries whose computed size falls below this.
    pub min_position_usd: f64,
    /// Cap any single entry at this size.
    pub max_position_usd: f64,
    /// Per-symbol ceiling (applied before the mode cap).
    pub per_symbol_cap_usd: f64,
    /// Maximum concurrent positions in this mode.
    pub max_positions: u32,
}

impl Default for SizeConfig {
    fn default() -> Self {
        Self {
            safety_margin: default_safety_margin(),
            confidence_base: default_confidence_base(),
            confidence_scale: default_confidence_scale(),
            min_position_usd: 10.0,
            max_position_usd: 500.0,
            per_symbol_cap_usd: 250.0,
            max_positions: 3,
        }
    }
}

/// Stop-loss / take-profit parameters for one mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SltpConfig {
    /// Default stop-loss distance as a percentage of entry.
    pub stop_loss_percent: f64,
    /// Default take-profit distance (single-TP mode and early booking).
    pub take_profit_percent: f64,

    /// Collapse the TP ladder into a single 100 % level.
    #[serde(default)]
    pub use_single_tp: bool,
    /// Gain percentage for the single TP level.
    #[serde(default)]
    pub single_tp_percent: f64,

    /// Gain percentages for the multi-TP ladder, ordered.
    pub tp_gain_levels: Vec<f64>,
    /// Allocation percentages for the ladder; must sum to 100 ± 1 or the
    /// engine falls back to 25/25/25/25.
    #[serde(default = "default_tp_allocation")]
    pub tp_allocation: Vec<f64>,

    #[serde(default = "default_true")]
    pub trailing_stop_enabled: bool,
    /// Trailing distance as a percentage of the water mark.
    pub trailing_stop_percent: f64,
    /// Profit percentage at which trailing arms.
    pub trailing_stop_activation: f64,

    /// ATR blending for default SL/TP generation.
    pub atr_sl_multiplier: f64,
    pub atr_tp_multiplier: f64,
    pub atr_sl_min: f64,
    pub atr_sl_max: f64,
    pub atr_tp_min: f64,
    pub atr_tp_max: f64,

    /// Blend weights between advisor-suggested and ATR-derived SL.
    #[serde(default = "default_llm_weight")]
    pub llm_weight: f64,
    #[serde(default = "default_atr_weight")]
    pub atr_weight: f64,
}

impl SltpConfig {
    fn for_mode(mode: TradeMode) -> Self {
        let (sl, tp, gains, trail_pct, trail_act) = match mode {
            TradeMode::UltraFast => (0.5, 0.3, vec![0.15, 0.3, 0.5, 0.8], 0.3, 0.4),
            TradeMode::Scalp => (1.0, 0.6, vec![0.3, 0.6, 1.0, 1.5], 0.5, 0.8),
            TradeMode::Swing => (2.0, 1.5, vec![1.0, 2.0, 3.0, 4.0], 1.0, 1.5),
            TradeMode::Position => (3.0, 3.0, vec![2.0, 4.0, 6.0, 8.0], 1.5, 2.5),
        };
        Self {
            stop_loss_percent: sl,
            take_profit_percent: tp,
            use_single_tp: false,
            single_tp_percent: tp,
            tp_gain_levels: gains,
            tp_allocation: default_tp_allocation(),
            trailing_stop_enabled: true,
            trailing_stop_percent: trail_pct,
            trailing_stop_activation: trail_act,
            atr_sl_multiplier: 1.5,
            atr_tp_multiplier: 2.5,
            atr_sl_min: 0.3,
            atr_sl_max: 5.0,
            atr_tp_min: 0.2,
            atr_tp_max: 10.0,
            llm_weight: default_llm_weight(),
            atr_weight: default_atr_weight(),
        }
    }
}

impl Default for SltpConfig {
    fn default() -> Self {
        Self::for_mode(TradeMode::Scalp)
    }
}

/// Circuit-breaker limits (used for the global breaker and per-mode breakers).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Maximum cumulative realized loss per rolling hour (PnL percentage).
    pub max_loss_per_hour: f64,
    /// Maximum cumulative realized loss per rolling day (PnL percentage).
    pub max_daily_loss: f64,
    pub max_consecutive_losses: u32,
    pub max_trades_per_minute: u32,
    pub max_trades_per_day: u32,
    #[serde(default = "default_cooldown_minutes")]
    pub cooldown_minutes: u64,

    /// Win-rate floor (per-mode breakers only).
    #[serde(default = "default_min_win_rate")]
    pub min_win_rate: f64,
    /// Number of trades before the win-rate floor is enforced.
    #[serde(default = "default_win_rate_check_after")]
    pub win_rate_check_after: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_loss_per_hour: 15.0,
            max_daily_loss: 40.0,
            max_consecutive_losses: 5,
            max_trades_per_minute: 3,
            max_trades_per_day: 60,
            cooldown_minutes: default_cooldown_minutes(),
            min_win_rate: default_min_win_rate(),
            win_rate_check_after: default_win_rate_check_after(),
        }
    }
}

/// Per-mode safety gates beyond the circuit breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    pub max_trades_per_minute: u32,
    pub max_trades_per_hour: u32,
    pub max_trades_per_day: u32,

    /// Rolling window over which PnL percentages are summed.
    #[serde(default = "default_profit_window_minutes")]
    pub profit_window_minutes: u64,
    /// Pause the mode when the window sum drops below this (negative value).
    pub max_loss_percent_in_window: f64,
    #[serde(default = "default_pause_cooldown_minutes")]
    pub pause_cooldown_minutes: u64,

    /// Win-rate check over the most recent N trades.
    #[serde(default = "default_win_rate_sample_size")]
    pub win_rate_sample_size: usize,
    #[serde(default = "default_min_win_rate")]
    pub min_recent_win_rate: f64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            max_trades_per_minute: 2,
            max_trades_per_hour: 20,
            max_trades_per_day: 60,
            profit_window_minutes: default_profit_window_minutes(),
            max_loss_percent_in_window: -20.0,
            pause_cooldown_minutes: default_pause_cooldown_minutes(),
            win_rate_sample_size: default_win_rate_sample_size(),
            min_recent_win_rate: default_min_win_rate(),
        }
    }
}

/// Funding-rate awareness knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingConfig {
    /// Directional rate above which entries are blocked near funding.
    #[serde(default = "default_max_funding_rate")]
    pub max_funding_rate: f64,
    /// Entry block applies when funding is this close (minutes).
    #[serde(default = "default_funding_block_minutes")]
    pub block_time_minutes: i64,
    /// Pre-funding exit window (minutes).
    #[serde(default = "default_funding_exit_minutes")]
    pub exit_time_minutes: i64,
    /// Exit when the funding fee would eat more than this share of profit.
    #[serde(default = "default_funding_fee_threshold_pct")]
    pub fee_threshold_percent: f64,
    /// Rates beyond this are "extreme" — exit profitable positions outright.
    #[serde(default = "default_extreme_funding_rate")]
    pub extreme_rate: f64,
}

impl Default for FundingConfig {
    fn default() -> Self {
        Self {
            max_funding_rate: default_max_funding_rate(),
            block_time_minutes: default_funding_block_minutes(),
            exit_time_minutes: default_funding_exit_minutes(),
            fee_threshold_percent: default_funding_fee_threshold_pct(),
            extreme_rate: default_extreme_funding_rate(),
        }
    }
}

// =============================================================================
// ModeConfig
// =============================================================================

/// Complete configuration for one trading mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Scan cadence for this mode (UltraFast uses `ultra_fast_tick_ms`).
    pub scan_interval_secs: u64,
    /// Minimum analyzer confidence to act (0–100).
    pub confidence_threshold: f64,
    /// Leverage applied to entries in this mode.
    pub leverage: u32,
    /// Cadence at which the advisor is consulted for open positions.
    pub advisor_interval_secs: u64,
    /// Positions older than this are eligible for time-based exit (0 = off).
    #[serde(default)]
    pub max_hold_time_secs: u64,

    #[serde(default)]
    pub size: SizeConfig,
    pub sltp: SltpConfig,
    #[serde(default)]
    pub breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
}

impl ModeConfig {
    pub fn for_mode(mode: TradeMode) -> Self {
        let (interval, confidence, leverage, advisor, hold) = match mode {
            TradeMode::UltraFast => (30, 70.0, 10, 60, 1_800),
            TradeMode::Scalp => (60, 65.0, 10, 60, 14_400),
            TradeMode::Swing => (300, 60.0, 5, 300, 0),
            TradeMode::Position => (900, 60.0, 3, 900, 0),
        };
        Self {
            enabled: mode == TradeMode::Scalp || mode == TradeMode::Swing,
            scan_interval_secs: interval,
            confidence_threshold: confidence,
            leverage,
            advisor_interval_secs: advisor,
            max_hold_time_secs: hold,
            size: SizeConfig::default(),
            sltp: SltpConfig::for_mode(mode),
            breaker: CircuitBreakerConfig::default(),
            safety: SafetyConfig::default(),
        }
    }
}

// =============================================================================
// Settings
// =============================================================================

/// Top-level engine settings for one user.
///
/// Every field has a serde default so that older JSON files missing new
/// fields still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Per-mode configuration, keyed by mode.
    #[serde(default = "Settings::default_modes")]
    pub modes: HashMap<TradeMode, ModeConfig>,

    /// Global circuit-breaker limits (mode breakers have their own copies).
    #[serde(default)]
    pub global_breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub funding: FundingConfig,

    /// Capital split across modes, percentages summing to ≤ 100.
    #[serde(default = "Settings::default_allocation")]
    pub allocation_percent: HashMap<TradeMode, f64>,

    /// UltraFast scan ticker (milliseconds).
    #[serde(default = "default_ultra_fast_tick_ms")]
    pub ultra_fast_tick_ms: u64,
    /// UltraFast position-monitor cadence (seconds).
    #[serde(default = "default_ultra_fast_monitor_secs")]
    pub ultra_fast_monitor_secs: u64,

    /// Move SL to breakeven once unleveraged profit reaches this percent.
    #[serde(default = "default_proactive_breakeven_pct")]
    pub proactive_breakeven_percent: f64,
    /// Breakeven SL is `entry × (1 ± buffer)`.
    #[serde(default = "default_breakeven_buffer_pct")]
    pub breakeven_buffer_percent: f64,
    /// Minimum SL improvement (percent of entry) before a trailing update is
    /// pushed to the exchange.
    #[serde(default = "default_trailing_update_threshold")]
    pub trailing_sl_update_threshold: f64,
    /// Hard floor for the early profit-booking ROI threshold.
    #[serde(default = "default_early_roi_floor")]
    pub early_roi_floor_percent: f64,
    /// Taker fee per fill, percent of notional (used for ROI after fees).
    #[serde(default = "default_taker_fee_pct")]
    pub taker_fee_percent: f64,

    /// Per-symbol-category additive confidence boost (e.g. "majors" → 5).
    #[serde(default)]
    pub category_boost: HashMap<String, f64>,
    /// Symbol → category assignments for the boost table.
    #[serde(default)]
    pub symbol_category: HashMap<String, String>,

    /// Symbols the scanner must never act on (user disables).
    #[serde(default)]
    pub disabled_symbols: Vec<String>,

    /// Per-symbol early-booking ROI overrides (percent).
    #[serde(default)]
    pub symbol_roi_override: HashMap<String, f64>,
}

impl Settings {
    fn default_modes() -> HashMap<TradeMode, ModeConfig> {
        TradeMode::ALL
            .iter()
            .map(|m| (*m, ModeConfig::for_mode(*m)))
            .collect()
    }

    fn default_allocation() -> HashMap<TradeMode, f64> {
        HashMap::from([
            (TradeMode::UltraFast, 10.0),
            (TradeMode::Scalp, 30.0),
            (TradeMode::Swing, 40.0),
            (TradeMode::Position, 20.0),
        ])
    }

    /// Config for one mode; falls back to the mode's built-in defaults when
    /// the map is missing an entry (older settings files).
    pub fn mode(&self, mode: TradeMode) -> ModeConfig {
        self.modes
            .get(&mode)
            .cloned()
            .unwrap_or_else(|| ModeConfig::for_mode(mode))
    }

    /// Enabled modes in scan-priority order.
    pub fn enabled_modes(&self) -> Vec<TradeMode> {
        TradeMode::ALL
            .iter()
            .copied()
            .filter(|m| self.mode(*m).enabled)
            .collect()
    }

    /// Effective confidence threshold = mode base + per-symbol category boost.
    pub fn effective_confidence_threshold(&self, mode: TradeMode, symbol: &str) -> f64 {
        let base = self.mode(mode).confidence_threshold;
        let boost = self
            .symbol_category
            .get(symbol)
            .and_then(|cat| self.category_boost.get(cat))
            .copied()
            .unwrap_or(0.0);
        base + boost
    }

    /// Load settings from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read settings from {}", path.display()))?;

        let settings: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse settings from {}", path.display()))?;

        info!(path = %path.display(), "settings loaded");
        Ok(settings)
    }

    /// Persist to `path` using an atomic write (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise settings to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp settings to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp settings to {}", path.display()))?;

        info!(path = %path.display(), "settings saved (atomic)");
        Ok(())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            modes: Self::default_modes(),
            global_breaker: CircuitBreakerConfig::default(),
            funding: FundingConfig::default(),
            allocation_percent: Self::default_allocation(),
            ultra_fast_tick_ms: default_ultra_fast_tick_ms(),
            ultra_fast_monitor_secs: default_ultra_fast_monitor_secs(),
            proactive_breakeven_percent: default_proactive_breakeven_pct(),
            breakeven_buffer_percent: default_breakeven_buffer_pct(),
            trailing_sl_update_threshold: default_trailing_update_threshold(),
            early_roi_floor_percent: default_early_roi_floor(),
            taker_fee_percent: default_taker_fee_pct(),
            category_boost: HashMap::new(),
            symbol_category: HashMap::new(),
            disabled_symbols: Vec::new(),
            symbol_roi_override: HashMap::new(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_cover_all_modes() {
        let s = Settings::default();
        for mode in TradeMode::ALL {
            let cfg = s.mode(mode);
            assert_eq!(cfg.sltp.tp_gain_levels.len(), 4, "{mode} gains");
            assert!(cfg.sltp.stop_loss_percent > 0.0);
        }
        assert_eq!(s.mode(TradeMode::UltraFast).sltp.tp_gain_levels[0], 0.15);
        assert_eq!(s.mode(TradeMode::Position).sltp.tp_gain_levels[3], 8.0);
    }

    #[test]
    fn allocation_defaults_sum_to_100() {
        let s = Settings::default();
        let sum: f64 = s.allocation_percent.values().sum();
        assert!((sum - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let s: Settings = serde_json::from_str("{}").unwrap();
        assert_eq!(s.ultra_fast_tick_ms, 200);
        assert_eq!(s.modes.len(), 4);
        assert!((s.proactive_breakeven_percent - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn category_boost_applies_per_symbol() {
        let mut s = Settings::default();
        s.symbol_category
            .insert("BTCUSDT".to_string(), "majors".to_string());
        s.category_boost.insert("majors".to_string(), 5.0);

        let base = s.mode(TradeMode::Scalp).confidence_threshold;
        assert_eq!(
            s.effective_confidence_threshold(TradeMode::Scalp, "BTCUSDT"),
            base + 5.0
        );
        assert_eq!(
            s.effective_confidence_threshold(TradeMode::Scalp, "ETHUSDT"),
            base
        );
    }

    #[test]
    fn roundtrip_serialisation() {
        let s = Settings::default();
        let json = serde_json::to_string(&s).unwrap();
        let s2: Settings = serde_json::from_str(&json).unwrap();
        assert_eq!(s.modes.len(), s2.modes.len());
        assert_eq!(s.ultra_fast_tick_ms, s2.ultra_fast_tick_ms);
    }

    #[test]
    fn enabled_modes_respect_flags() {
        let mut s = Settings::default();
        for cfg in s.modes.values_mut() {
            cfg.enabled = false;
        }
        assert!(s.enabled_modes().is_empty());

        s.modes.get_mut(&TradeMode::Swing).unwrap().enabled = true;
        assert_eq!(s.enabled_modes(), vec![TradeMode::Swing]);
    }
}
