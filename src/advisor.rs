// =============================================================================
// Advisor interface — LLM-backed SL/TP review for open positions
// =============================================================================
//
// The advisor is consulted by the adaptive SL/TP updater on a mode-dependent
// cadence. Its recommendations are untrusted: every suggested SL passes the
// never-widen / ATR-distance / bounded-move validation before touching the
// exchange, and three consecutive rejections disable the advisor for that
// symbol until a manual reset.
// =============================================================================

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{Kline, Side, TradeMode};

/// Action verb returned by the advisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdvisorAction {
    Hold,
    TightenSl,
    MoveTp,
    CloseNow,
}

/// Snapshot of an open position handed to the advisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionInfo {
    pub symbol: String,
    pub side: Side,
    pub mode: TradeMode,
    pub entry_price: f64,
    pub current_price: f64,
    pub quantity: f64,
    pub unrealized_pnl: f64,
    pub pnl_percent: f64,
    pub current_sl: f64,
    /// Trigger price of the currently-active TP level.
    pub current_tp: f64,
    /// Seconds the position has been open.
    pub hold_duration_secs: u64,
}

/// The advisor's verdict for one position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvisorVerdict {
    pub action: AdvisorAction,
    /// 0.0–1.0. Verdicts below 0.5 are ignored.
    pub confidence: f64,
    pub recommended_sl: f64,
    pub recommended_tp: f64,
    pub urgency: String,
    pub sl_reasoning: String,
}

/// LLM-like advisor consulted for SL/TP adjustments and coin selection.
/// All methods are RPCs and must be called outside the engine lock.
#[async_trait]
pub trait Advisor: Send + Sync {
    /// Review an open position given recent klines.
    async fn review_position(
        &self,
        info: &PositionInfo,
        klines: &[Kline],
    ) -> anyhow::Result<AdvisorVerdict>;

    /// Symbols the advisor currently favours (watchlist source). Default: none.
    async fn select_coins(&self, _limit: usize) -> anyhow::Result<Vec<String>> {
        Ok(Vec::new())
    }

    /// Whether the advisor backend is reachable/configured.
    fn is_connected(&self) -> bool;

    /// Provider label for diagnostics.
    fn provider(&self) -> &str;
}

/// Advisor used when no AI key is configured: always holds, never connected.
pub struct NullAdvisor;

#[async_trait]
impl Advisor for NullAdvisor {
    async fn review_position(
        &self,
        info: &PositionInfo,
        _klines: &[Kline],
    ) -> anyhow::Result<AdvisorVerdict> {
        Ok(AdvisorVerdict {
            action: AdvisorAction::Hold,
            confidence: 0.0,
            recommended_sl: info.current_sl,
            recommended_tp: info.current_tp,
            urgency: "none".to_string(),
            sl_reasoning: "advisor disabled".to_string(),
        })
    }

    fn is_connected(&self) -> bool {
        false
    }

    fn provider(&self) -> &str {
        "none"
    }
}

/// Scripted advisor for tests: pops pre-loaded verdicts in order.
pub struct ScriptedAdvisor {
    verdicts: parking_lot::Mutex<std::collections::VecDeque<AdvisorVerdict>>,
}

impl ScriptedAdvisor {
    pub fn new(verdicts: Vec<AdvisorVerdict>) -> Self {
        Self {
            verdicts: parking_lot::Mutex::new(verdicts.into()),
        }
    }
}

#[async_trait]
impl Advisor for ScriptedAdvisor {
    async fn review_position(
        &self,
        info: &PositionInfo,
        _klines: &[Kline],
    ) -> anyhow::Result<AdvisorVerdict> {
        Ok(self.verdicts.lock().pop_front().unwrap_or(AdvisorVerdict {
            action: AdvisorAction::Hold,
            confidence: 0.0,
            recommended_sl: info.current_sl,
            recommended_tp: info.current_tp,
            urgency: "none".to_string(),
            sl_reasoning: "script exhausted".to_string(),
        }))
    }

    fn is_connected(&self) -> bool {
        true
    }

    fn provider(&self) -> &str {
        "scripted"
    }
}
