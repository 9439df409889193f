// =============================================================================
// Error taxonomy for the Autopilot engine
// =============================================================================
//
// Transient exchange failures are recovered at the owning task's boundary and
// retried on the next tick; they never tear down a loop. Entry-path errors
// abort the current symbol only. Configuration errors are the only class that
// surfaces out of `Autopilot::start`.
// =============================================================================

use thiserror::Error;

use crate::types::TradeMode;

/// Result alias used throughout the engine core.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Main error type for the Autopilot engine.
#[derive(Error, Debug)]
pub enum EngineError {
    // Pre-placement validation
    #[error("validation failed for {symbol}: {reason}")]
    Validation { symbol: String, reason: String },

    // Entry path
    #[error("order rejected by exchange: {0}")]
    OrderRejected(String),

    #[error("market order {order_id} on {symbol} not filled within {waited_secs}s")]
    OrderNotFilled {
        symbol: String,
        order_id: u64,
        waited_secs: u64,
    },

    #[error("stop-loss {stop_loss} would trigger immediately at price {price}")]
    ImmediateStopLoss { stop_loss: f64, price: f64 },

    #[error("coin blocked: {0}")]
    CoinBlocked(String),

    #[error("circuit breaker open: {0}")]
    CircuitOpen(String),

    #[error("mode {mode} paused: {reason}")]
    ModePaused { mode: TradeMode, reason: String },

    #[error("computed position size {size_usd:.2} USD below mode minimum {min_usd:.2} USD")]
    SizingTooSmall { size_usd: f64, min_usd: f64 },

    #[error("capital allocation denied for {mode}: {reason}")]
    AllocationDenied { mode: TradeMode, reason: String },

    #[error("adverse funding rate: {0}")]
    FundingAdverse(String),

    // Protection
    #[error("protection failure on {symbol}: {reason}")]
    ProtectionFailure { symbol: String, reason: String },

    // Advisor
    #[error("advisor recommendation rejected: {0}")]
    AdvisorInvalid(String),

    // Startup
    #[error("configuration error: {0}")]
    Configuration(String),

    // Exchange transport / 5xx / rate-limit — recovered at task boundaries.
    #[error(transparent)]
    Exchange(#[from] anyhow::Error),
}

impl EngineError {
    /// Transient errors are retried on the next tick of the owning task.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Exchange(_))
    }

    /// Errors that only skip the current symbol for this scan cycle.
    pub fn skips_symbol(&self) -> bool {
        matches!(
            self,
            Self::Validation { .. }
                | Self::CoinBlocked(_)
                | Self::FundingAdverse(_)
                | Self::SizingTooSmall { .. }
                | Self::AllocationDenied { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        let e = EngineError::Exchange(anyhow::anyhow!("503 from exchange"));
        assert!(e.is_transient());
        assert!(!EngineError::OrderRejected("bad".into()).is_transient());
    }

    #[test]
    fn skip_classification() {
        let e = EngineError::CoinBlocked("DOGEUSDT".into());
        assert!(e.skips_symbol());
        assert!(!EngineError::Configuration("no keys".into()).skips_symbol());
    }
}
