// =============================================================================
// Signal Analyzer interface — composite decisions and UltraFast signals
// =============================================================================
//
// The analyzer is an external collaborator. The engine only depends on this
// trait; production wires a real analyzer, tests wire `FixedAnalyzer`.
// =============================================================================

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::TradeMode;

/// What the analyzer recommends doing with a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Recommendation {
    Execute,
    Monitor,
    Skip,
}

/// Proposed action for a symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecisionAction {
    Long,
    Short,
    Hold,
}

impl std::fmt::Display for DecisionAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
            Self::Hold => write!(f, "HOLD"),
        }
    }
}

/// One weighted component of a composite decision (for the audit trail).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalComponent {
    pub name: String,
    pub score: f64,
    pub weight: f64,
}

/// Composite decision for one (symbol, mode) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub symbol: String,
    pub mode: TradeMode,
    pub action: DecisionAction,
    pub recommendation: Recommendation,
    /// 0–100.
    pub confidence: f64,
    pub entry_price: f64,
    /// Proposed SL distance, percent of entry.
    pub suggested_sl_percent: Option<f64>,
    /// Proposed TP distance, percent of entry.
    pub suggested_tp_percent: Option<f64>,
    pub signals: Vec<SignalComponent>,
    pub summary: String,
}

/// Directional bias of the UltraFast 4-layer signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrendBias {
    Bullish,
    Bearish,
    Neutral,
}

/// Volatility regime classification for UltraFast entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolatilityRegime {
    Low,
    Normal,
    High,
    Extreme,
}

/// The UltraFast signal shape — distinct from the composite `Decision`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UltraFastSignal {
    pub symbol: String,
    pub trend_bias: TrendBias,
    /// 0–100.
    pub entry_confidence: f64,
    pub volatility_regime: VolatilityRegime,
    /// Fee-aware minimum profit target, percent of entry.
    pub min_profit_target: f64,
}

/// Produces entry decisions. All methods are RPC-shaped and must be called
/// outside the engine lock.
#[async_trait]
pub trait SignalAnalyzer: Send + Sync {
    /// Composite decision for `symbol` scoped to `mode`.
    async fn analyze(&self, symbol: &str, mode: TradeMode) -> anyhow::Result<Decision>;

    /// 4-layer UltraFast signal for `symbol`.
    async fn ultra_fast_signal(&self, symbol: &str) -> anyhow::Result<UltraFastSignal>;
}

/// Analyzer returning canned responses — used by tests and dry runs.
pub struct FixedAnalyzer {
    pub decision: parking_lot::RwLock<Option<Decision>>,
    pub ultra_fast: parking_lot::RwLock<Option<UltraFastSignal>>,
}

impl FixedAnalyzer {
    pub fn new() -> Self {
        Self {
            decision: parking_lot::RwLock::new(None),
            ultra_fast: parking_lot::RwLock::new(None),
        }
    }

    pub fn set_decision(&self, decision: Decision) {
        *self.decision.write() = Some(decision);
    }
}

impl Default for FixedAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SignalAnalyzer for FixedAnalyzer {
    async fn analyze(&self, symbol: &str, mode: TradeMode) -> anyhow::Result<Decision> {
        match self.decision.read().clone() {
            Some(mut d) => {
                d.symbol = symbol.to_string();
                d.mode = mode;
                Ok(d)
            }
            None => Ok(Decision {
                symbol: symbol.to_string(),
                mode,
                action: DecisionAction::Hold,
                recommendation: Recommendation::Skip,
                confidence: 0.0,
                entry_price: 0.0,
                suggested_sl_percent: None,
                suggested_tp_percent: None,
                signals: Vec::new(),
                summary: "no signal".to_string(),
            }),
        }
    }

    async fn ultra_fast_signal(&self, symbol: &str) -> anyhow::Result<UltraFastSignal> {
        match self.ultra_fast.read().clone() {
            Some(mut s) => {
                s.symbol = symbol.to_string();
                Ok(s)
            }
            None => Ok(UltraFastSignal {
                symbol: symbol.to_string(),
                trend_bias: TrendBias::Neutral,
                entry_confidence: 0.0,
                volatility_regime: VolatilityRegime::Normal,
                min_profit_target: 0.15,
            }),
        }
    }
}
