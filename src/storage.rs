// =============================================================================
// Persistence interfaces — durable trades, metrics, preferences, event log
// =============================================================================
//
// The engine never talks to a database directly; it consumes these traits.
// `MemoryStore` is the reference implementation used by tests and dry runs.
// =============================================================================

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::exchange::models::SymbolRules;
use crate::types::{Side, TradeMode};

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Durable record of one futures trade, minted when a position opens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FuturesTrade {
    pub id: String,
    pub user_id: String,
    pub symbol: String,
    pub side: Side,
    pub mode: TradeMode,
    pub entry_price: f64,
    #[serde(default)]
    pub exit_price: Option<f64>,
    pub quantity: f64,
    pub leverage: u32,
    #[serde(default)]
    pub realized_pnl: f64,
    /// "OPEN" or "CLOSED".
    pub status: String,
    /// "autopilot", "strategy", or "sync" for adopted positions.
    pub trade_source: String,
    pub open_time: DateTime<Utc>,
    #[serde(default)]
    pub close_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub close_reason: Option<String>,
}

impl FuturesTrade {
    pub fn is_open(&self) -> bool {
        self.status == "OPEN"
    }
}

/// Aggregate per-user trading metrics read back from storage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TradingMetrics {
    pub total_trades: u64,
    pub winning_trades: u64,
    pub total_pnl: f64,
    pub win_rate: f64,
}

/// Which sources feed the user's watchlist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanSourceSettings {
    pub use_saved_coins: bool,
    pub saved_coins: Vec<String>,
    pub use_ai_selected: bool,
    pub use_gainers: bool,
    pub use_losers: bool,
    pub use_volume: bool,
    pub use_volatility: bool,
    /// Cap on the assembled watchlist size.
    pub max_symbols: usize,
}

impl Default for ScanSourceSettings {
    fn default() -> Self {
        Self {
            use_saved_coins: true,
            saved_coins: vec!["BTCUSDT".into(), "ETHUSDT".into(), "SOLUSDT".into()],
            use_ai_selected: false,
            use_gainers: true,
            use_losers: false,
            use_volume: true,
            use_volatility: false,
            max_symbols: 20,
        }
    }
}

/// Exchange + AI credentials for one user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiCredentials {
    pub api_key: String,
    pub api_secret: String,
    #[serde(default)]
    pub ai_api_key: Option<String>,
}

/// A persisted user strategy: a simple momentum trigger evaluated against
/// klines (no DSL). Fires when the close moves `trigger_change_percent` over
/// the last `lookback_bars` bars in the strategy's direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserStrategy {
    pub id: String,
    pub name: String,
    pub symbol: String,
    pub side: Side,
    pub mode: TradeMode,
    pub lookback_bars: usize,
    pub trigger_change_percent: f64,
    pub enabled: bool,
}

/// Lifecycle events appended to the durable event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TradeEvent {
    PositionOpened {
        symbol: String,
        side: Side,
        mode: TradeMode,
        entry_price: f64,
        quantity: f64,
        leverage: u32,
    },
    PositionClosed {
        symbol: String,
        reason: String,
        exit_price: f64,
        realized_pnl: f64,
    },
    TpHit {
        symbol: String,
        level: usize,
        trigger_price: f64,
        closed_qty: f64,
    },
    SlTpPlaced {
        symbol: String,
        stop_loss: f64,
        take_profit: Option<f64>,
    },
    SlRevised {
        symbol: String,
        old_sl: f64,
        new_sl: f64,
        source: String,
    },
    MovedToBreakeven {
        symbol: String,
        new_sl: f64,
    },
    TrailingActivated {
        symbol: String,
    },
    TrailingUpdated {
        symbol: String,
        new_sl: f64,
    },
    ExternalClose {
        symbol: String,
        realized_pnl: f64,
    },
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Durable trade + preference storage consumed by the engine.
#[async_trait]
pub trait TradeStore: Send + Sync {
    /// Persist a new trade and return its id.
    async fn create_trade(&self, trade: FuturesTrade) -> anyhow::Result<String>;

    /// Overwrite an existing trade record.
    async fn update_trade(&self, trade: &FuturesTrade) -> anyhow::Result<()>;

    /// The OPEN trade for `(user, symbol)`, if any.
    async fn open_trade_for(
        &self,
        user_id: &str,
        symbol: &str,
    ) -> anyhow::Result<Option<FuturesTrade>>;

    /// Sum of realized PnL for trades closed today (UTC).
    async fn daily_pnl(&self, user_id: &str) -> anyhow::Result<f64>;

    /// Aggregate metrics for `user_id`.
    async fn trading_metrics(&self, user_id: &str) -> anyhow::Result<TradingMetrics>;

    /// The user's watchlist source preferences.
    async fn scan_sources(&self, user_id: &str) -> anyhow::Result<ScanSourceSettings>;

    /// Per-user per-symbol early-booking ROI override, percent.
    async fn symbol_roi(&self, user_id: &str, symbol: &str) -> anyhow::Result<Option<f64>>;

    /// Exchange/AI credentials for `user_id`.
    async fn api_keys(&self, user_id: &str) -> anyhow::Result<Option<ApiCredentials>>;

    /// Cached symbol rules persisted from the last exchange sync.
    async fn saved_symbol_rules(&self) -> anyhow::Result<Vec<SymbolRules>>;

    /// Replace the persisted symbol-rules cache.
    async fn save_symbol_rules(&self, rules: &[SymbolRules]) -> anyhow::Result<()>;

    /// The user's persisted strategies.
    async fn strategies(&self, user_id: &str) -> anyhow::Result<Vec<UserStrategy>>;

    /// User whose Autopilot should start automatically on boot, if any.
    async fn auto_start_user(&self) -> anyhow::Result<Option<String>>;

    /// Per-user engine settings, if the user has saved any.
    async fn trading_config(&self, user_id: &str) -> anyhow::Result<Option<crate::settings::Settings>>;
}

/// Append-only lifecycle event log.
pub trait EventLogger: Send + Sync {
    fn log_event(&self, user_id: &str, event: TradeEvent);
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

/// In-memory implementation of `TradeStore` + `EventLogger`.
#[derive(Default)]
pub struct MemoryStore {
    trades: RwLock<HashMap<String, FuturesTrade>>,
    scan_sources: RwLock<HashMap<String, ScanSourceSettings>>,
    symbol_roi: RwLock<HashMap<(String, String), f64>>,
    credentials: RwLock<HashMap<String, ApiCredentials>>,
    symbol_rules: RwLock<Vec<SymbolRules>>,
    strategies: RwLock<HashMap<String, Vec<UserStrategy>>>,
    auto_start: RwLock<Option<String>>,
    trading_configs: RwLock<HashMap<String, crate::settings::Settings>>,
    events: RwLock<Vec<(String, TradeEvent)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_credentials(&self, user_id: &str, creds: ApiCredentials) {
        self.credentials.write().insert(user_id.to_string(), creds);
    }

    pub fn set_scan_sources(&self, user_id: &str, sources: ScanSourceSettings) {
        self.scan_sources.write().insert(user_id.to_string(), sources);
    }

    pub fn set_symbol_roi(&self, user_id: &str, symbol: &str, roi: f64) {
        self.symbol_roi
            .write()
            .insert((user_id.to_string(), symbol.to_string()), roi);
    }

    pub fn set_strategies(&self, user_id: &str, strategies: Vec<UserStrategy>) {
        self.strategies
            .write()
            .insert(user_id.to_string(), strategies);
    }

    pub fn set_auto_start(&self, user_id: Option<String>) {
        *self.auto_start.write() = user_id;
    }

    pub fn set_trading_config(&self, user_id: &str, settings: crate::settings::Settings) {
        self.trading_configs
            .write()
            .insert(user_id.to_string(), settings);
    }

    /// All recorded events (test helper).
    pub fn events(&self) -> Vec<(String, TradeEvent)> {
        self.events.read().clone()
    }

    /// All trades for a user, newest first (test helper / trade history).
    pub fn trades_for(&self, user_id: &str) -> Vec<FuturesTrade> {
        let mut trades: Vec<FuturesTrade> = self
            .trades
            .read()
            .values()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect();
        trades.sort_by(|a, b| b.open_time.cmp(&a.open_time));
        trades
    }
}

#[async_trait]
impl TradeStore for MemoryStore {
    async fn create_trade(&self, mut trade: FuturesTrade) -> anyhow::Result<String> {
        if trade.id.is_empty() {
            trade.id = Uuid::new_v4().to_string();
        }
        let id = trade.id.clone();
        self.trades.write().insert(id.clone(), trade);
        Ok(id)
    }

    async fn update_trade(&self, trade: &FuturesTrade) -> anyhow::Result<()> {
        self.trades
            .write()
            .insert(trade.id.clone(), trade.clone());
        Ok(())
    }

    async fn open_trade_for(
        &self,
        user_id: &str,
        symbol: &str,
    ) -> anyhow::Result<Option<FuturesTrade>> {
        Ok(self
            .trades
            .read()
            .values()
            .find(|t| t.user_id == user_id && t.symbol == symbol && t.is_open())
            .cloned())
    }

    async fn daily_pnl(&self, user_id: &str) -> anyhow::Result<f64> {
        let today = Utc::now().date_naive();
        Ok(self
            .trades
            .read()
            .values()
            .filter(|t| {
                t.user_id == user_id
                    && t.close_time
                        .map(|c| c.date_naive() == today)
                        .unwrap_or(false)
            })
            .map(|t| t.realized_pnl)
            .sum())
    }

    async fn trading_metrics(&self, user_id: &str) -> anyhow::Result<TradingMetrics> {
        let trades = self.trades.read();
        let closed: Vec<&FuturesTrade> = trades
            .values()
            .filter(|t| t.user_id == user_id && !t.is_open())
            .collect();

        let total = closed.len() as u64;
        let wins = closed.iter().filter(|t| t.realized_pnl > 0.0).count() as u64;
        let total_pnl: f64 = closed.iter().map(|t| t.realized_pnl).sum();

        Ok(TradingMetrics {
            total_trades: total,
            winning_trades: wins,
            total_pnl,
            win_rate: if total > 0 {
                wins as f64 / total as f64
            } else {
                0.0
            },
        })
    }

    async fn scan_sources(&self, user_id: &str) -> anyhow::Result<ScanSourceSettings> {
        Ok(self
            .scan_sources
            .read()
            .get(user_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn symbol_roi(&self, user_id: &str, symbol: &str) -> anyhow::Result<Option<f64>> {
        Ok(self
            .symbol_roi
            .read()
            .get(&(user_id.to_string(), symbol.to_string()))
            .copied())
    }

    async fn api_keys(&self, user_id: &str) -> anyhow::Result<Option<ApiCredentials>> {
        Ok(self.credentials.read().get(user_id).cloned())
    }

    async fn saved_symbol_rules(&self) -> anyhow::Result<Vec<SymbolRules>> {
        Ok(self.symbol_rules.read().clone())
    }

    async fn save_symbol_rules(&self, rules: &[SymbolRules]) -> anyhow::Result<()> {
        *self.symbol_rules.write() = rules.to_vec();
        Ok(())
    }

    async fn strategies(&self, user_id: &str) -> anyhow::Result<Vec<UserStrategy>> {
        Ok(self
            .strategies
            .read()
            .get(user_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn auto_start_user(&self) -> anyhow::Result<Option<String>> {
        Ok(self.auto_start.read().clone())
    }

    async fn trading_config(
        &self,
        user_id: &str,
    ) -> anyhow::Result<Option<crate::settings::Settings>> {
        Ok(self.trading_configs.read().get(user_id).cloned())
    }
}

impl EventLogger for MemoryStore {
    fn log_event(&self, user_id: &str, event: TradeEvent) {
        info!(user_id, event = ?event, "trade event");
        self.events.write().push((user_id.to_string(), event));
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn trade(user: &str, symbol: &str, pnl: f64, open: bool) -> FuturesTrade {
        FuturesTrade {
            id: String::new(),
            user_id: user.into(),
            symbol: symbol.into(),
            side: Side::Long,
            mode: TradeMode::Scalp,
            entry_price: 100.0,
            exit_price: (!open).then_some(101.0),
            quantity: 1.0,
            leverage: 5,
            realized_pnl: pnl,
            status: if open { "OPEN" } else { "CLOSED" }.into(),
            trade_source: "autopilot".into(),
            open_time: Utc::now(),
            close_time: (!open).then(Utc::now),
            close_reason: (!open).then(|| "take_profit".into()),
        }
    }

    #[tokio::test]
    async fn create_and_find_open_trade() {
        let store = MemoryStore::new();
        let id = store
            .create_trade(trade("u1", "BTCUSDT", 0.0, true))
            .await
            .unwrap();
        assert!(!id.is_empty());

        let found = store.open_trade_for("u1", "BTCUSDT").await.unwrap();
        assert!(found.is_some());
        assert!(store.open_trade_for("u2", "BTCUSDT").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn metrics_aggregate_closed_trades_only() {
        let store = MemoryStore::new();
        store.create_trade(trade("u1", "A", 5.0, false)).await.unwrap();
        store.create_trade(trade("u1", "B", -2.0, false)).await.unwrap();
        store.create_trade(trade("u1", "C", 0.0, true)).await.unwrap();

        let m = store.trading_metrics("u1").await.unwrap();
        assert_eq!(m.total_trades, 2);
        assert_eq!(m.winning_trades, 1);
        assert!((m.total_pnl - 3.0).abs() < 1e-9);
        assert!((m.win_rate - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn metrics_are_isolated_per_user() {
        let store = MemoryStore::new();
        store.create_trade(trade("u1", "A", 5.0, false)).await.unwrap();
        store.create_trade(trade("u2", "A", -5.0, false)).await.unwrap();

        let m1 = store.trading_metrics("u1").await.unwrap();
        let m2 = store.trading_metrics("u2").await.unwrap();
        assert!(m1.total_pnl > 0.0);
        assert!(m2.total_pnl < 0.0);
    }

    #[test]
    fn event_log_appends() {
        let store = MemoryStore::new();
        store.log_event(
            "u1",
            TradeEvent::TrailingActivated {
                symbol: "ETHUSDT".into(),
            },
        );
        assert_eq!(store.events().len(), 1);
    }
}
