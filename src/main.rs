// =============================================================================
// Aurora Perp Autopilot — Main Entry Point
// =============================================================================
//
// Wires the multi-user manager with the in-memory store and env-provided
// credentials, auto-starts the persisted user (if any), and runs until
// Ctrl+C. Host processes embed the engine through `UserManager`/`Autopilot`
// instead of this binary.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod adaptive;
mod advisor;
mod allocation;
mod analyzer;
mod autopilot;
mod blocklist;
mod breaker;
mod entry;
mod error;
mod exchange;
mod indicators;
mod journal;
mod manager;
mod monitor;
mod position;
mod protection;
mod reconcile;
mod safety;
mod scanner;
mod settings;
mod storage;
mod strategy;
mod symbol_rules;
mod types;

use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::advisor::{Advisor, NullAdvisor};
use crate::analyzer::{FixedAnalyzer, SignalAnalyzer};
use crate::manager::UserManager;
use crate::settings::Settings;
use crate::storage::{ApiCredentials, MemoryStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & logging ─────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Aurora Perp Autopilot — Starting Up              ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    // ── 2. Storage & credentials ─────────────────────────────────────────
    let store = Arc::new(MemoryStore::new());

    let user_id = std::env::var("AURORA_USER").unwrap_or_else(|_| "default".to_string());
    let api_key = std::env::var("BINANCE_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("BINANCE_API_SECRET").unwrap_or_default();

    if api_key.is_empty() || api_secret.is_empty() {
        warn!("BINANCE_API_KEY / BINANCE_API_SECRET not set — the engine cannot start a user");
    } else {
        store.set_credentials(
            &user_id,
            ApiCredentials {
                api_key,
                api_secret,
                ai_api_key: std::env::var("AURORA_AI_KEY").ok(),
            },
        );
    }

    // Optional settings file (serde defaults fill anything missing).
    let settings_path =
        std::env::var("AURORA_SETTINGS").unwrap_or_else(|_| "autopilot_settings.json".to_string());
    match Settings::load(&settings_path) {
        Ok(settings) => store.set_trading_config(&user_id, settings),
        Err(e) => warn!(error = %e, "no settings file — using defaults"),
    }

    // Auto-start the configured user when requested.
    if std::env::var("AURORA_AUTO_START").map(|v| v == "1" || v == "true") == Ok(true) {
        store.set_auto_start(Some(user_id.clone()));
    }

    // ── 3. Multi-user manager ────────────────────────────────────────────
    let manager = UserManager::new(
        store.clone(),
        store.clone(),
        Arc::new(|_creds: &ApiCredentials| {
            Arc::new(FixedAnalyzer::new()) as Arc<dyn SignalAnalyzer>
        }),
        Arc::new(|_creds: &ApiCredentials| Arc::new(NullAdvisor) as Arc<dyn Advisor>),
    );

    tokio::spawn(manager.clone().run_cleanup());

    // ── 4. Auto-start from persisted preference ──────────────────────────
    manager.auto_start().await;

    info!("Engine running. Press Ctrl+C to stop.");

    // ── 5. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping all autopilots");

    manager.stop(&user_id);

    info!("Aurora Perp Autopilot shut down complete.");
    Ok(())
}
