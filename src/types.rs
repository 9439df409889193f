// =============================================================================
// Shared types used across the Aurora Perp Autopilot
// =============================================================================

use serde::{Deserialize, Serialize};

/// Direction of a perpetual-futures position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// +1.0 for longs, -1.0 for shorts. Multiplying a raw price move by this
    /// factor yields the signed PnL direction.
    pub fn direction(&self) -> f64 {
        match self {
            Self::Long => 1.0,
            Self::Short => -1.0,
        }
    }

    /// The order side that opens a position in this direction.
    pub fn entry_order_side(&self) -> &'static str {
        match self {
            Self::Long => "BUY",
            Self::Short => "SELL",
        }
    }

    /// The order side that closes (or reduces) a position in this direction.
    pub fn exit_order_side(&self) -> &'static str {
        match self {
            Self::Long => "SELL",
            Self::Short => "BUY",
        }
    }

    /// Exchange `positionSide` value in hedge mode.
    pub fn position_side(&self) -> &'static str {
        match self {
            Self::Long => "LONG",
            Self::Short => "SHORT",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

impl std::str::FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "LONG" | "BUY" => Ok(Self::Long),
            "SHORT" | "SELL" => Ok(Self::Short),
            other => Err(format!("unknown side: {other}")),
        }
    }
}

/// The four trading modes the Autopilot can run concurrently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TradeMode {
    UltraFast,
    Scalp,
    Swing,
    Position,
}

impl TradeMode {
    /// All modes in scan-priority order (shortest horizon first).
    pub const ALL: [TradeMode; 4] = [
        TradeMode::UltraFast,
        TradeMode::Scalp,
        TradeMode::Swing,
        TradeMode::Position,
    ];

    /// Kline timeframe used when analysing this mode.
    pub fn timeframe(&self) -> &'static str {
        match self {
            Self::UltraFast => "1m",
            Self::Scalp => "5m",
            Self::Swing => "1h",
            Self::Position => "4h",
        }
    }
}

impl std::fmt::Display for TradeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UltraFast => write!(f, "UltraFast"),
            Self::Scalp => write!(f, "Scalp"),
            Self::Swing => write!(f, "Swing"),
            Self::Position => write!(f, "Position"),
        }
    }
}

/// Operator-selected appetite for position sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskLevel {
    Conservative,
    Moderate,
    Aggressive,
}

impl RiskLevel {
    /// Sizing multiplier applied on top of the per-slot base size.
    pub fn multiplier(&self) -> f64 {
        match self {
            Self::Conservative => 0.6,
            Self::Moderate => 0.8,
            Self::Aggressive => 1.0,
        }
    }
}

impl Default for RiskLevel {
    fn default() -> Self {
        Self::Moderate
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Conservative => write!(f, "conservative"),
            Self::Moderate => write!(f, "moderate"),
            Self::Aggressive => write!(f, "aggressive"),
        }
    }
}

/// Where an entry signal originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalSource {
    Ai,
    Strategy,
}

impl std::fmt::Display for SignalSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ai => write!(f, "ai"),
            Self::Strategy => write!(f, "strategy"),
        }
    }
}

/// A single OHLCV kline as returned by the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Kline {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub close_time: i64,
}

impl Kline {
    pub fn new(
        open_time: i64,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
        close_time: i64,
    ) -> Self {
        Self {
            open_time,
            open,
            high,
            low,
            close,
            volume,
            close_time,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_direction_and_order_sides() {
        assert_eq!(Side::Long.direction(), 1.0);
        assert_eq!(Side::Short.direction(), -1.0);
        assert_eq!(Side::Long.entry_order_side(), "BUY");
        assert_eq!(Side::Long.exit_order_side(), "SELL");
        assert_eq!(Side::Short.entry_order_side(), "SELL");
        assert_eq!(Side::Short.exit_order_side(), "BUY");
    }

    #[test]
    fn side_parses_from_order_strings() {
        assert_eq!("LONG".parse::<Side>().unwrap(), Side::Long);
        assert_eq!("sell".parse::<Side>().unwrap(), Side::Short);
        assert!("HOLD".parse::<Side>().is_err());
    }

    #[test]
    fn risk_multipliers() {
        assert_eq!(RiskLevel::Conservative.multiplier(), 0.6);
        assert_eq!(RiskLevel::Moderate.multiplier(), 0.8);
        assert_eq!(RiskLevel::Aggressive.multiplier(), 1.0);
    }
}
