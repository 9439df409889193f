// =============================================================================
// Exchange integration — signed REST client, typed models, rate-limit tracker
// =============================================================================

pub mod client;
pub mod models;
pub mod rate_limit;

pub use client::ExchangeClient;
pub use models::{
    AccountTrade, AlgoOrder, AlgoOrderRequest, ExchangePosition, FundingInfo, OrderAck, OrderInfo,
    PremiumIndex, SymbolRules, TickerStats,
};
pub use rate_limit::RateLimitTracker;
