// =============================================================================
// Multi-User Manager — one isolated Autopilot per user
// =============================================================================
//
// Instances are created lazily from the user's persisted API keys, touched
// on every access, and evicted after 30 minutes of idleness while stopped.
// No user ever sees another user's positions or counters; PnL aggregation
// goes through the trade store scoped by user id.
//
// The analyzer and advisor are built through injected factories so the host
// process decides the concrete backends.
// =============================================================================

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::advisor::Advisor;
use crate::analyzer::SignalAnalyzer;
use crate::autopilot::{Autopilot, EngineStats};
use crate::error::{EngineError, EngineResult};
use crate::exchange::ExchangeClient;
use crate::journal::TradeResult;
use crate::position::Position;
use crate::settings::Settings;
use crate::storage::{ApiCredentials, EventLogger, TradeStore};

/// Idle instances (not running) are evicted after this long.
const IDLE_EVICTION: Duration = Duration::from_secs(30 * 60);
/// Cleanup sweep cadence.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);

pub type AnalyzerFactory = Arc<dyn Fn(&ApiCredentials) -> Arc<dyn SignalAnalyzer> + Send + Sync>;
pub type AdvisorFactory = Arc<dyn Fn(&ApiCredentials) -> Arc<dyn Advisor> + Send + Sync>;

struct ManagedInstance {
    autopilot: Arc<Autopilot>,
    last_active: RwLock<Instant>,
}

impl ManagedInstance {
    fn touch(&self) {
        *self.last_active.write() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_active.read().elapsed()
    }
}

/// Owns every per-user Autopilot in the process.
pub struct UserManager {
    instances: DashMap<String, Arc<ManagedInstance>>,
    store: Arc<dyn TradeStore>,
    events: Arc<dyn EventLogger>,
    analyzer_factory: AnalyzerFactory,
    advisor_factory: AdvisorFactory,
}

impl UserManager {
    pub fn new(
        store: Arc<dyn TradeStore>,
        events: Arc<dyn EventLogger>,
        analyzer_factory: AnalyzerFactory,
        advisor_factory: AdvisorFactory,
    ) -> Arc<Self> {
        Arc::new(Self {
            instances: DashMap::new(),
            store,
            events,
            analyzer_factory,
            advisor_factory,
        })
    }

    /// How many instances currently exist.
    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    /// The user's Autopilot, building it from persisted credentials when it
    /// does not exist yet. Touches `last_active` either way.
    pub async fn get_or_create(&self, user_id: &str) -> EngineResult<Arc<Autopilot>> {
        if let Some(existing) = self.instances.get(user_id) {
            existing.touch();
            return Ok(existing.autopilot.clone());
        }

        let creds = self
            .store
            .api_keys(user_id)
            .await
            .map_err(EngineError::Exchange)?
            .ok_or_else(|| {
                EngineError::Configuration(format!("no API keys stored for user {user_id}"))
            })?;
        if creds.api_key.is_empty() || creds.api_secret.is_empty() {
            return Err(EngineError::Configuration(format!(
                "empty API credentials for user {user_id}"
            )));
        }

        let settings = self
            .store
            .trading_config(user_id)
            .await
            .map_err(EngineError::Exchange)?
            .unwrap_or_else(Settings::default);

        let client = Arc::new(ExchangeClient::new(
            creds.api_key.clone(),
            creds.api_secret.clone(),
        ));
        let analyzer = (self.analyzer_factory)(&creds);
        let advisor = (self.advisor_factory)(&creds);

        let autopilot = Autopilot::new(
            user_id,
            client,
            analyzer,
            advisor,
            self.store.clone(),
            self.events.clone(),
            settings,
        );

        let instance = Arc::new(ManagedInstance {
            autopilot: autopilot.clone(),
            last_active: RwLock::new(Instant::now()),
        });

        // A concurrent creator may have won the race; keep whichever landed.
        let entry = self
            .instances
            .entry(user_id.to_string())
            .or_insert(instance);
        info!(user = user_id, "autopilot instance ready");
        Ok(entry.autopilot.clone())
    }

    // -------------------------------------------------------------------------
    // Per-user operations
    // -------------------------------------------------------------------------

    pub async fn start(&self, user_id: &str) -> EngineResult<()> {
        let ap = self.get_or_create(user_id).await?;
        ap.start().await
    }

    pub fn stop(&self, user_id: &str) -> bool {
        match self.instances.get(user_id) {
            Some(instance) => {
                instance.touch();
                instance.autopilot.stop();
                true
            }
            None => false,
        }
    }

    pub fn status(&self, user_id: &str) -> Option<EngineStats> {
        self.instances.get(user_id).map(|i| {
            i.touch();
            i.autopilot.get_stats()
        })
    }

    pub fn positions(&self, user_id: &str) -> Vec<Position> {
        self.instances
            .get(user_id)
            .map(|i| {
                i.touch();
                i.autopilot.get_positions()
            })
            .unwrap_or_default()
    }

    pub fn trade_history(&self, user_id: &str, count: usize) -> Vec<TradeResult> {
        self.instances
            .get(user_id)
            .map(|i| {
                i.touch();
                i.autopilot.get_trade_history(count)
            })
            .unwrap_or_default()
    }

    /// API-key rotation: swap the client in place; a running instance is
    /// stopped, refreshed, and restarted.
    pub async fn refresh_keys(&self, user_id: &str) -> EngineResult<()> {
        let Some(instance) = self.instances.get(user_id).map(|i| Arc::clone(i.value())) else {
            return Ok(());
        };

        let creds = self
            .store
            .api_keys(user_id)
            .await
            .map_err(EngineError::Exchange)?
            .ok_or_else(|| {
                EngineError::Configuration(format!("no API keys stored for user {user_id}"))
            })?;

        let client = Arc::new(ExchangeClient::new(creds.api_key, creds.api_secret));
        let was_running = instance.autopilot.is_running();

        if was_running {
            instance.autopilot.stop();
        }
        instance.autopilot.refresh_client(client);
        if was_running {
            instance.autopilot.start().await?;
        }

        info!(user = user_id, was_running, "API keys rotated");
        Ok(())
    }

    /// Start the persisted auto-start user, if any.
    pub async fn auto_start(&self) {
        match self.store.auto_start_user().await {
            Ok(Some(user_id)) => {
                info!(user = %user_id, "auto-start user found");
                if let Err(e) = self.start(&user_id).await {
                    warn!(user = %user_id, error = %e, "auto-start failed");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "auto-start lookup failed"),
        }
    }

    // -------------------------------------------------------------------------
    // Idle cleanup
    // -------------------------------------------------------------------------

    /// Evict stopped instances idle for longer than the eviction window.
    /// Returns how many were removed.
    pub fn evict_idle(&self) -> usize {
        let before = self.instances.len();
        self.instances.retain(|user_id, instance| {
            let keep =
                instance.autopilot.is_running() || instance.idle_for() < IDLE_EVICTION;
            if !keep {
                info!(user = %user_id, "evicting idle autopilot instance");
            }
            keep
        });
        before - self.instances.len()
    }

    /// Background cleanup loop; spawn once per process.
    pub async fn run_cleanup(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
        loop {
            ticker.tick().await;
            let evicted = self.evict_idle();
            if evicted > 0 {
                info!(evicted, remaining = self.instances.len(), "idle instances evicted");
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::advisor::NullAdvisor;
    use crate::analyzer::FixedAnalyzer;
    use crate::storage::MemoryStore;

    fn manager_with_store() -> (Arc<UserManager>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let manager = UserManager::new(
            store.clone(),
            store.clone(),
            Arc::new(|_creds: &ApiCredentials| {
                Arc::new(FixedAnalyzer::new()) as Arc<dyn SignalAnalyzer>
            }),
            Arc::new(|_creds: &ApiCredentials| Arc::new(NullAdvisor) as Arc<dyn Advisor>),
        );
        (manager, store)
    }

    fn creds() -> ApiCredentials {
        ApiCredentials {
            api_key: "key".into(),
            api_secret: "secret".into(),
            ai_api_key: None,
        }
    }

    #[tokio::test]
    async fn create_requires_stored_keys() {
        let (manager, store) = manager_with_store();

        let err = manager.get_or_create("u1").await.unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));

        store.set_credentials("u1", creds());
        let ap = manager.get_or_create("u1").await.unwrap();
        assert_eq!(ap.user_id, "u1");
        assert_eq!(manager.instance_count(), 1);
    }

    #[tokio::test]
    async fn get_or_create_is_lazy_and_cached() {
        let (manager, store) = manager_with_store();
        store.set_credentials("u1", creds());

        let a = manager.get_or_create("u1").await.unwrap();
        let b = manager.get_or_create("u1").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(manager.instance_count(), 1);
    }

    #[tokio::test]
    async fn users_are_isolated() {
        let (manager, store) = manager_with_store();
        store.set_credentials("u1", creds());
        store.set_credentials("u2", creds());

        let a = manager.get_or_create("u1").await.unwrap();
        let b = manager.get_or_create("u2").await.unwrap();
        assert!(!Arc::ptr_eq(&a, &b));

        // u1's positions never leak into u2's view.
        a.insert_position(crate::position::Position {
            symbol: "ETHUSDT".into(),
            side: crate::types::Side::Long,
            mode: crate::types::TradeMode::Swing,
            entry_price: 2000.0,
            original_qty: 1.0,
            remaining_qty: 1.0,
            leverage: 5,
            entry_time: chrono::Utc::now(),
            futures_trade_id: "t".into(),
            tp_levels: vec![],
            stop_loss: 1960.0,
            original_sl: 1960.0,
            moved_to_breakeven: false,
            trailing_active: false,
            highest_price: 2000.0,
            lowest_price: 2000.0,
            trailing_percent: 1.0,
            trailing_activation_percent: 1.5,
            stop_loss_algo_id: None,
            take_profit_algo_ids: vec![],
            protection: crate::position::ProtectionStatus::new(chrono::Utc::now()),
            realized_pnl: 0.0,
            unrealized_pnl: 0.0,
            custom_roi_percent: None,
            ultra_fast_signal: None,
            ultra_fast_target_percent: None,
            max_hold_time_secs: 0,
            source: crate::types::SignalSource::Ai,
            strategy_id: None,
            strategy_name: None,
            decision: None,
            last_advisor_update: None,
        });

        assert_eq!(manager.positions("u1").len(), 1);
        assert!(manager.positions("u2").is_empty());
    }

    #[tokio::test]
    async fn stopped_idle_instances_evictable() {
        let (manager, store) = manager_with_store();
        store.set_credentials("u1", creds());
        manager.get_or_create("u1").await.unwrap();

        // Fresh instance: not evicted (idle < window).
        assert_eq!(manager.evict_idle(), 0);
        assert_eq!(manager.instance_count(), 1);
    }

    #[tokio::test]
    async fn stop_unknown_user_is_noop() {
        let (manager, _store) = manager_with_store();
        assert!(!manager.stop("ghost"));
        assert!(manager.status("ghost").is_none());
        assert!(manager.positions("ghost").is_empty());
    }
}
