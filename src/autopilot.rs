// =============================================================================
// Autopilot — per-user orchestrator owning all engine state and tasks
// =============================================================================
//
// The Autopilot is the single owner of mutable state (positions, breakers,
// counters, logs) behind one RwLock. Subsystems — scanner, monitor, guardian,
// adaptive updater, reconciler — are background tasks that take the Autopilot
// and acquire its lock for every commit.
//
// Locking discipline: no exchange or advisor RPC while holding the lock.
// The standard pattern is copy-under-lock, release, RPC, re-acquire,
// re-check existence, commit. The reconciler may delete any position between
// two acquisitions.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Timelike, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::advisor::Advisor;
use crate::allocation::{CapitalAllocator, ModeAllocationStatus};
use crate::analyzer::SignalAnalyzer;
use crate::blocklist::{BlockedCoin, BlockedCoinRegistry};
use crate::breaker::{BreakerSnapshot, CircuitBreaker, ResetPeriod};
use crate::error::{EngineError, EngineResult};
use crate::exchange::ExchangeClient;
use crate::journal::{
    signal_stats, LlmSwitch, RingLog, SignalLog, SignalStats, SlUpdateRecord, TradeResult,
    SIGNAL_LOG_CAPACITY, SL_UPDATE_LOG_CAPACITY, TRADE_RESULT_CAPACITY,
};
use crate::position::{Position, ProtectionState};
use crate::safety::ModeSafety;
use crate::settings::{CircuitBreakerConfig, Settings};
use crate::storage::{EventLogger, TradeEvent, TradeStore};
use crate::symbol_rules::SymbolValidator;
use crate::types::{RiskLevel, Side, TradeMode};

/// Restart delay after a task panic.
const TASK_RESTART_DELAY_SECS: u64 = 5;

// ---------------------------------------------------------------------------
// Scan status
// ---------------------------------------------------------------------------

/// Where the scan loop currently is, for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanStatus {
    pub phase: String,
    pub last_scan_time: Option<DateTime<Utc>>,
    pub scanned_this_cycle: usize,
    pub total_symbols: usize,
    pub last_scan_duration_ms: u64,
    pub next_scan_time: Option<DateTime<Utc>>,
}

impl Default for ScanStatus {
    fn default() -> Self {
        Self {
            phase: "idle".to_string(),
            last_scan_time: None,
            scanned_this_cycle: 0,
            total_symbols: 0,
            last_scan_duration_ms: 0,
            next_scan_time: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Engine state (everything behind the one lock)
// ---------------------------------------------------------------------------

pub struct EngineState {
    pub positions: HashMap<String, Position>,
    pub blocked: BlockedCoinRegistry,
    pub global_breaker: CircuitBreaker,
    pub mode_breakers: HashMap<TradeMode, CircuitBreaker>,
    pub mode_safety: HashMap<TradeMode, ModeSafety>,
    pub allocator: CapitalAllocator,

    pub signal_logs: RingLog<SignalLog>,
    pub sl_update_log: RingLog<SlUpdateRecord>,
    pub trade_results: RingLog<TradeResult>,
    pub llm_switches: RingLog<LlmSwitch>,

    /// Consecutive rejected advisor calls per symbol.
    pub bad_llm_calls: HashMap<String, u32>,
    /// Symbols whose advisor SL updates are disabled (kill switch).
    pub llm_sl_disabled: HashSet<String>,

    pub watchlist: Vec<String>,
    pub scan_status: ScanStatus,

    pub risk_level: RiskLevel,
    /// Whether the exchange account runs in hedge mode.
    pub hedge_mode: bool,

    // Counters (reset at UTC midnight).
    pub daily_trades: u32,
    pub daily_pnl: f64,
    pub total_pnl: f64,
    pub winning_trades: u32,
    pub total_trades: u32,

    // Profit-booking activity timestamps (1 h diagnostics windows).
    pub tp_hit_times: Vec<DateTime<Utc>>,
    pub partial_close_times: Vec<DateTime<Utc>>,
    pub failed_close_times: Vec<DateTime<Utc>>,
}

impl EngineState {
    fn new(settings: &Settings) -> Self {
        let mode_breakers = TradeMode::ALL
            .iter()
            .map(|m| (*m, CircuitBreaker::for_mode(*m, settings.mode(*m).breaker)))
            .collect();
        let mode_safety = TradeMode::ALL
            .iter()
            .map(|m| (*m, ModeSafety::new(*m)))
            .collect();

        Self {
            positions: HashMap::new(),
            blocked: BlockedCoinRegistry::new(),
            global_breaker: CircuitBreaker::global(settings.global_breaker.clone()),
            mode_breakers,
            mode_safety,
            allocator: CapitalAllocator::new(),
            signal_logs: RingLog::new(SIGNAL_LOG_CAPACITY),
            sl_update_log: RingLog::new(SL_UPDATE_LOG_CAPACITY),
            trade_results: RingLog::new(TRADE_RESULT_CAPACITY),
            llm_switches: RingLog::new(100),
            bad_llm_calls: HashMap::new(),
            llm_sl_disabled: HashSet::new(),
            watchlist: Vec::new(),
            scan_status: ScanStatus::default(),
            risk_level: RiskLevel::default(),
            hedge_mode: false,
            daily_trades: 0,
            daily_pnl: 0.0,
            total_pnl: 0.0,
            winning_trades: 0,
            total_trades: 0,
            tp_hit_times: Vec::new(),
            partial_close_times: Vec::new(),
            failed_close_times: Vec::new(),
        }
    }

    /// The `positionSide` value to send with orders for `side`.
    pub fn position_side_for(&self, side: Side) -> &'static str {
        if self.hedge_mode {
            side.position_side()
        } else {
            "BOTH"
        }
    }
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

/// Aggregate stats exposed to the host process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStats {
    pub running: bool,
    pub daily_trades: u32,
    pub daily_pnl: f64,
    pub total_pnl: f64,
    pub total_trades: u32,
    pub winning_trades: u32,
    pub win_rate: f64,
    pub open_positions: usize,
    pub watchlist_size: usize,
}

/// Full diagnostics payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostics {
    pub autopilot_running: bool,
    pub can_trade: bool,
    pub can_trade_reason: Option<String>,
    pub circuit_breaker: BreakerSnapshot,
    pub positions: DiagnosticsPositions,
    pub scanning: ScanStatus,
    pub signals: SignalStats,
    pub profit_booking: ProfitBookingStats,
    pub blocked_coins: Vec<BlockedCoin>,
    pub llm_status: LlmStatus,
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticsPositions {
    pub open: usize,
    pub max: u32,
    pub unrealized_pnl: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfitBookingStats {
    pub positions_with_pending_tp: usize,
    pub tp_hits_last_hour: usize,
    pub partial_closes_last_hour: usize,
    pub failed_closes_last_hour: usize,
    pub trailing_active_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmStatus {
    pub connected: bool,
    pub provider: String,
    pub disabled_symbols: Vec<String>,
}

/// Protection summary for one position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectionSummary {
    pub symbol: String,
    pub state: ProtectionState,
    pub sl_verified: bool,
    pub tp_verified: bool,
    pub heal_attempts: u32,
    pub stop_loss: f64,
}

// ---------------------------------------------------------------------------
// Autopilot
// ---------------------------------------------------------------------------

pub struct Autopilot {
    pub user_id: String,
    client: RwLock<Arc<ExchangeClient>>,
    pub analyzer: Arc<dyn SignalAnalyzer>,
    pub advisor: Arc<dyn Advisor>,
    pub store: Arc<dyn TradeStore>,
    pub events: Arc<dyn EventLogger>,
    pub validator: Arc<SymbolValidator>,
    pub settings: RwLock<Settings>,
    pub state: RwLock<EngineState>,
    running: AtomicBool,
    stop_tx: Mutex<Option<watch::Sender<bool>>>,
}

impl std::fmt::Debug for Autopilot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Autopilot")
            .field("user_id", &self.user_id)
            .finish_non_exhaustive()
    }
}

impl Autopilot {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        user_id: impl Into<String>,
        client: Arc<ExchangeClient>,
        analyzer: Arc<dyn SignalAnalyzer>,
        advisor: Arc<dyn Advisor>,
        store: Arc<dyn TradeStore>,
        events: Arc<dyn EventLogger>,
        settings: Settings,
    ) -> Arc<Self> {
        let validator = Arc::new(SymbolValidator::new(client.clone(), store.clone()));
        let state = EngineState::new(&settings);

        Arc::new(Self {
            user_id: user_id.into(),
            client: RwLock::new(client),
            analyzer,
            advisor,
            store,
            events,
            validator,
            settings: RwLock::new(settings),
            state: RwLock::new(state),
            running: AtomicBool::new(false),
            stop_tx: Mutex::new(None),
        })
    }

    /// Current exchange client (may be swapped on key rotation).
    pub fn client(&self) -> Arc<ExchangeClient> {
        self.client.read().clone()
    }

    /// Swap the exchange client in place (API-key rotation).
    pub fn refresh_client(&self, client: Arc<ExchangeClient>) {
        *self.client.write() = client;
        info!(user = %self.user_id, "exchange client refreshed");
    }

    // -------------------------------------------------------------------------
    // Start / stop
    // -------------------------------------------------------------------------

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start all background tasks. Fails only on configuration errors;
    /// transient exchange failures are absorbed by the tasks themselves.
    pub async fn start(self: &Arc<Self>) -> EngineResult<()> {
        if self.is_running() {
            return Ok(());
        }

        let enabled = self.settings.read().enabled_modes();
        if enabled.is_empty() {
            return Err(EngineError::Configuration(
                "no trading modes enabled".to_string(),
            ));
        }

        // Best-effort warm-up: symbol rules and account position mode.
        if let Err(e) = self.validator.load_persisted().await {
            warn!(user = %self.user_id, error = %e, "failed to load persisted symbol rules");
        }
        match self.client().get_position_mode().await {
            Ok(hedge) => self.state.write().hedge_mode = hedge,
            Err(e) => warn!(user = %self.user_id, error = %e, "position-mode query failed — assuming one-way"),
        }

        let (tx, rx) = watch::channel(false);
        *self.stop_tx.lock() = Some(tx);
        self.running.store(true, Ordering::SeqCst);

        info!(user = %self.user_id, modes = ?enabled, "autopilot starting");

        self.spawn_supervised("scan_loop", rx.clone(), |ap, stop| {
            Box::pin(crate::scanner::run_scan_loop(ap, stop))
        });
        self.spawn_supervised("ultra_fast_scan", rx.clone(), |ap, stop| {
            Box::pin(crate::scanner::run_ultra_fast_loop(ap, stop))
        });
        self.spawn_supervised("position_monitor", rx.clone(), |ap, stop| {
            Box::pin(crate::monitor::run_position_monitor(ap, stop))
        });
        self.spawn_supervised("ultra_fast_monitor", rx.clone(), |ap, stop| {
            Box::pin(crate::monitor::run_ultra_fast_monitor(ap, stop))
        });
        self.spawn_supervised("protection_guardian", rx.clone(), |ap, stop| {
            Box::pin(crate::protection::guardian::run_guardian(ap, stop))
        });
        self.spawn_supervised("adaptive_sltp", rx.clone(), |ap, stop| {
            Box::pin(crate::adaptive::run_adaptive_updater(ap, stop))
        });
        self.spawn_supervised("orphan_cleanup", rx.clone(), |ap, stop| {
            Box::pin(crate::reconcile::run_orphan_cleanup(ap, stop))
        });
        self.spawn_supervised("symbol_rules_refresh", rx.clone(), |ap, stop| {
            Box::pin(crate::symbol_rules::run_rules_refresh(ap, stop))
        });
        self.spawn_supervised("counter_resets", rx, |ap, stop| {
            Box::pin(run_counter_resets(ap, stop))
        });

        Ok(())
    }

    /// Signal all tasks to stop. Does not wait for them to drain.
    pub fn stop(&self) {
        if !self.is_running() {
            return;
        }
        self.running.store(false, Ordering::SeqCst);
        if let Some(tx) = self.stop_tx.lock().take() {
            let _ = tx.send(true);
        }
        info!(user = %self.user_id, "autopilot stop signalled");
    }

    /// Spawn a task that restarts after panics (5 s back-off) and exits when
    /// the stop channel fires.
    fn spawn_supervised<F>(self: &Arc<Self>, name: &'static str, stop: watch::Receiver<bool>, f: F)
    where
        F: Fn(
                Arc<Autopilot>,
                watch::Receiver<bool>,
            ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>
            + Send
            + Sync
            + 'static,
    {
        let ap = self.clone();
        tokio::spawn(async move {
            loop {
                let inner = tokio::spawn(f(ap.clone(), stop.clone()));
                match inner.await {
                    Ok(()) => {
                        info!(task = name, user = %ap.user_id, "task finished");
                        break;
                    }
                    Err(e) if e.is_panic() => {
                        error!(task = name, user = %ap.user_id, "task panicked — restarting in {TASK_RESTART_DELAY_SECS}s");
                        tokio::time::sleep(std::time::Duration::from_secs(TASK_RESTART_DELAY_SECS))
                            .await;
                        if *stop.borrow() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });
    }

    // -------------------------------------------------------------------------
    // Gate
    // -------------------------------------------------------------------------

    /// Global can-trade check (breaker + rate limiter circuit).
    pub fn can_trade(&self) -> (bool, Option<String>) {
        if self.client().limiter().circuit_open() {
            return (false, Some("exchange rate-limit circuit open".to_string()));
        }
        self.state.write().global_breaker.can_trade(Utc::now())
    }

    // -------------------------------------------------------------------------
    // Close paths (shared by monitor / guardian / adaptive / panic button)
    // -------------------------------------------------------------------------

    /// Market-close the full remaining quantity of `symbol` and record the
    /// result. Silently succeeds when the position no longer exists.
    pub async fn execute_market_close(&self, symbol: &str, reason: &str) -> anyhow::Result<()> {
        // Copy what we need, then release the lock before any RPC.
        let (side, qty, position_side) = {
            let state = self.state.read();
            match state.positions.get(symbol) {
                Some(p) => (p.side, p.remaining_qty, state.position_side_for(p.side)),
                None => return Ok(()),
            }
        };

        let client = self.client();
        if let Err(e) = client.cancel_all_orders(symbol).await {
            warn!(symbol, error = %e, "cancel-all before close failed");
        }

        let ack = match client
            .place_market_order(symbol, side.exit_order_side(), position_side, qty)
            .await
        {
            Ok(ack) => ack,
            Err(e) => {
                self.state.write().failed_close_times.push(Utc::now());
                return Err(e.context(format!("market close of {symbol} failed")));
            }
        };

        let exit_price = if ack.avg_price > 0.0 {
            ack.avg_price
        } else {
            client.get_mark_price(symbol).await.unwrap_or(0.0)
        };

        self.finalize_close(symbol, exit_price, reason).await;
        Ok(())
    }

    /// Remove the position, record the trade result, and update every
    /// safety subsystem. Called after the exchange confirmed the close (or
    /// after the reconciler discovered an external close).
    pub async fn finalize_close(&self, symbol: &str, exit_price: f64, reason: &str) {
        let now = Utc::now();

        // Fixed lock order everywhere: settings before state.
        let (mode, entry_price) = match self.state.read().positions.get(symbol) {
            Some(p) => (p.mode, p.entry_price),
            None => return,
        };
        // A zero exit price means no fill/mark price was available; settle
        // at entry so a missing quote cannot fake a huge loss.
        let exit_price = if exit_price > 0.0 { exit_price } else { entry_price };
        let safety_cfg = self.settings.read().mode(mode).safety.clone();

        let (position, result, pnl_percent) = {
            let mut state = self.state.write();
            let Some(position) = state.positions.remove(symbol) else {
                return;
            };

            let direction = position.side.direction();
            let qty = position.remaining_qty;
            let final_pnl = direction * (exit_price - position.entry_price) * qty;
            let total_pnl = position.realized_pnl + final_pnl;
            let pnl_percent = if position.entry_price > 0.0 {
                direction * (exit_price - position.entry_price) / position.entry_price
                    * 100.0
                    * position.leverage as f64
            } else {
                0.0
            };

            let result = TradeResult {
                time: now,
                symbol: symbol.to_string(),
                side: position.side,
                mode: position.mode,
                entry_price: position.entry_price,
                exit_price,
                quantity: qty,
                realized_pnl: total_pnl,
                pnl_percent,
                reason: reason.to_string(),
                futures_trade_id: position.futures_trade_id.clone(),
                full_close: true,
            };

            // Counters.
            state.daily_pnl += total_pnl;
            state.total_pnl += total_pnl;
            state.total_trades += 1;
            if total_pnl > 0.0 {
                state.winning_trades += 1;
            }

            // Breakers and safety gates.
            state.global_breaker.record_trade(pnl_percent, now);
            if let Some(cb) = state.mode_breakers.get_mut(&position.mode) {
                cb.record_trade(pnl_percent, now);
            }
            if let Some(safety) = state.mode_safety.get_mut(&position.mode) {
                safety.record_result(pnl_percent, now, &safety_cfg);
            }

            // Blocked-coin escalation.
            state
                .blocked
                .record_result(symbol, total_pnl, pnl_percent, now);

            // Release remaining margin and the position slot.
            let margin =
                position.entry_price * position.remaining_qty / position.leverage.max(1) as f64;
            state.allocator.release(position.mode, margin, true);

            state.trade_results.push(result.clone());

            (position, result, pnl_percent)
        };

        info!(
            user = %self.user_id,
            symbol,
            reason,
            exit_price,
            realized_pnl = result.realized_pnl,
            pnl_percent,
            "position closed"
        );

        self.events.log_event(
            &self.user_id,
            TradeEvent::PositionClosed {
                symbol: symbol.to_string(),
                reason: reason.to_string(),
                exit_price,
                realized_pnl: result.realized_pnl,
            },
        );

        // Persist outside the lock.
        if let Ok(Some(mut trade)) = self.store.open_trade_for(&self.user_id, symbol).await {
            trade.exit_price = Some(exit_price);
            trade.realized_pnl = result.realized_pnl;
            trade.status = "CLOSED".to_string();
            trade.close_time = Some(now);
            trade.close_reason = Some(reason.to_string());
            if let Err(e) = self.store.update_trade(&trade).await {
                warn!(symbol, error = %e, "failed to persist close");
            }
        } else if !position.futures_trade_id.is_empty() {
            warn!(symbol, trade_id = %position.futures_trade_id, "no OPEN trade record found at close");
        }
    }

    /// Close discovered by the reconciler: the exchange already flattened the
    /// position, and the realized PnL comes from trade history rather than
    /// our own price math.
    pub async fn finalize_external_close(
        &self,
        symbol: &str,
        exit_price: f64,
        realized_pnl: f64,
        reason: &str,
    ) {
        {
            let mut state = self.state.write();
            let Some(p) = state.positions.get_mut(symbol) else {
                return;
            };
            // Pre-adjust the accumulated PnL so the close records the
            // exchange's number, not our estimate.
            let final_pnl = p.side.direction() * (exit_price - p.entry_price) * p.remaining_qty;
            p.realized_pnl = realized_pnl - final_pnl;
        }

        self.finalize_close(symbol, exit_price, reason).await;

        self.events.log_event(
            &self.user_id,
            TradeEvent::ExternalClose {
                symbol: symbol.to_string(),
                realized_pnl,
            },
        );
    }

    /// Record a partial close (TP slice or early booking slice) against the
    /// position. The caller has already executed the exchange order.
    pub async fn finalize_partial_close(
        &self,
        symbol: &str,
        closed_qty: f64,
        exit_price: f64,
        reason: &str,
    ) {
        let now = Utc::now();

        let persisted = {
            let mut state = self.state.write();
            let Some(position) = state.positions.get_mut(symbol) else {
                return;
            };

            let direction = position.side.direction();
            let pnl = direction * (exit_price - position.entry_price) * closed_qty;
            position.remaining_qty = (position.remaining_qty - closed_qty).max(0.0);
            position.realized_pnl += pnl;

            let result = TradeResult {
                time: now,
                symbol: symbol.to_string(),
                side: position.side,
                mode: position.mode,
                entry_price: position.entry_price,
                exit_price,
                quantity: closed_qty,
                realized_pnl: pnl,
                pnl_percent: if position.entry_price > 0.0 {
                    direction * (exit_price - position.entry_price) / position.entry_price
                        * 100.0
                        * position.leverage as f64
                } else {
                    0.0
                },
                reason: reason.to_string(),
                futures_trade_id: position.futures_trade_id.clone(),
                full_close: false,
            };

            let margin = position.entry_price * closed_qty / position.leverage.max(1) as f64;
            let mode = position.mode;

            state.daily_pnl += pnl;
            state.total_pnl += pnl;
            state.partial_close_times.push(now);
            state.allocator.release(mode, margin, false);
            state.trade_results.push(result);

            pnl
        };

        info!(
            user = %self.user_id,
            symbol,
            closed_qty,
            exit_price,
            pnl = persisted,
            reason,
            "partial close recorded"
        );
    }

    /// Panic button: close everything at market.
    pub async fn close_all_positions(&self, reason: &str) -> Vec<(String, anyhow::Result<()>)> {
        let symbols: Vec<String> = self.state.read().positions.keys().cloned().collect();
        let mut results = Vec::with_capacity(symbols.len());
        for symbol in symbols {
            let res = self.execute_market_close(&symbol, reason).await;
            if let Err(ref e) = res {
                error!(symbol = %symbol, error = %e, "panic close failed");
            }
            results.push((symbol, res));
        }
        results
    }

    // -------------------------------------------------------------------------
    // Sync / adaptive entry points (exposed)
    // -------------------------------------------------------------------------

    /// One reconciliation pass against the exchange.
    pub async fn sync_with_exchange(self: &Arc<Self>) -> anyhow::Result<crate::reconcile::ReconcileReport> {
        crate::reconcile::reconcile_once(self.clone()).await
    }

    /// Alias kept for operator tooling: a forced, immediate sync.
    pub async fn force_sync_with_exchange(
        self: &Arc<Self>,
    ) -> anyhow::Result<crate::reconcile::ReconcileReport> {
        self.sync_with_exchange().await
    }

    /// Re-run the advisor over every open position immediately.
    pub async fn recalculate_adaptive_sltp(self: &Arc<Self>) -> usize {
        crate::adaptive::refresh_all_positions(self.clone(), true).await
    }

    /// Fire-and-forget variant.
    pub fn recalculate_adaptive_sltp_async(self: &Arc<Self>) {
        let ap = self.clone();
        tokio::spawn(async move {
            let touched = crate::adaptive::refresh_all_positions(ap, true).await;
            info!(touched, "async adaptive SL/TP recalculation complete");
        });
    }

    // -------------------------------------------------------------------------
    // Observability (exposed)
    // -------------------------------------------------------------------------

    pub fn get_stats(&self) -> EngineStats {
        let state = self.state.read();
        EngineStats {
            running: self.is_running(),
            daily_trades: state.daily_trades,
            daily_pnl: state.daily_pnl,
            total_pnl: state.total_pnl,
            total_trades: state.total_trades,
            winning_trades: state.winning_trades,
            win_rate: if state.total_trades > 0 {
                state.winning_trades as f64 / state.total_trades as f64
            } else {
                0.0
            },
            open_positions: state.positions.len(),
            watchlist_size: state.watchlist.len(),
        }
    }

    pub fn get_positions(&self) -> Vec<Position> {
        let mut positions: Vec<Position> = self.state.read().positions.values().cloned().collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        positions
    }

    pub fn get_trade_history(&self, count: usize) -> Vec<TradeResult> {
        self.state.read().trade_results.recent(count)
    }

    pub fn get_signal_logs(&self, count: usize) -> Vec<SignalLog> {
        self.state.read().signal_logs.recent(count)
    }

    pub fn get_sl_update_history(&self, count: usize) -> Vec<SlUpdateRecord> {
        self.state.read().sl_update_log.recent(count)
    }

    pub fn get_blocked_coins(&self) -> Vec<BlockedCoin> {
        self.state.write().blocked.list(Utc::now())
    }

    pub fn unblock_coin(&self, symbol: &str) -> bool {
        self.state.write().blocked.unblock(symbol)
    }

    pub fn set_risk_level(&self, level: RiskLevel) {
        self.state.write().risk_level = level;
        info!(user = %self.user_id, %level, "risk level updated");
    }

    pub fn update_circuit_breaker_config(&self, cfg: CircuitBreakerConfig) {
        self.settings.write().global_breaker = cfg.clone();
        self.state.write().global_breaker.update_config(cfg);
    }

    pub fn reset_circuit_breaker(&self) {
        self.state.write().global_breaker.reset();
    }

    pub fn get_mode_allocation_status(&self) -> Vec<ModeAllocationStatus> {
        let settings = self.settings.read().clone();
        self.state.read().allocator.status(&settings)
    }

    pub fn get_position_protection_status(&self) -> Vec<ProtectionSummary> {
        self.state
            .read()
            .positions
            .values()
            .map(|p| ProtectionSummary {
                symbol: p.symbol.clone(),
                state: p.protection.state,
                sl_verified: p.protection.sl_verified,
                tp_verified: p.protection.tp_verified,
                heal_attempts: p.protection.heal_attempts,
                stop_loss: p.stop_loss,
            })
            .collect()
    }

    pub fn get_scan_status(&self) -> ScanStatus {
        self.state.read().scan_status.clone()
    }

    /// Clear the advisor kill switch for `symbol`.
    pub fn reset_llm_sl_for_symbol(&self, symbol: &str) -> bool {
        let mut state = self.state.write();
        state.bad_llm_calls.remove(symbol);
        let was_disabled = state.llm_sl_disabled.remove(symbol);
        if was_disabled {
            state.llm_switches.push(LlmSwitch {
                time: Utc::now(),
                symbol: symbol.to_string(),
                disabled: false,
                reason: "manual reset".to_string(),
            });
            info!(user = %self.user_id, symbol, "advisor SL kill switch cleared");
        }
        was_disabled
    }

    pub fn get_diagnostics(&self) -> Diagnostics {
        let now = Utc::now();
        let (can_trade, can_trade_reason) = self.can_trade();
        let settings = self.settings.read().clone();

        let mut state = self.state.write();
        let blocked = state.blocked.list(now);

        let hour_ago = now - chrono::Duration::hours(1);
        state.tp_hit_times.retain(|t| *t >= hour_ago);
        state.partial_close_times.retain(|t| *t >= hour_ago);
        state.failed_close_times.retain(|t| *t >= hour_ago);

        let unrealized: f64 = state.positions.values().map(|p| p.unrealized_pnl).sum();
        let max_positions: u32 = settings
            .enabled_modes()
            .iter()
            .map(|m| settings.mode(*m).size.max_positions)
            .sum();

        let mut issues = Vec::new();
        for p in state.positions.values() {
            if p.protection.state == ProtectionState::Unprotected {
                issues.push(format!("{} has no stop-loss on the exchange", p.symbol));
            }
            if p.protection.heal_attempts > 0 {
                issues.push(format!(
                    "{}: {} protection heal attempts",
                    p.symbol, p.protection.heal_attempts
                ));
            }
        }
        if self.client().limiter().circuit_open() {
            issues.push("exchange rate-limit circuit open".to_string());
        }

        Diagnostics {
            autopilot_running: self.is_running(),
            can_trade,
            can_trade_reason,
            circuit_breaker: state.global_breaker.snapshot(now),
            positions: DiagnosticsPositions {
                open: state.positions.len(),
                max: max_positions,
                unrealized_pnl: unrealized,
            },
            scanning: state.scan_status.clone(),
            signals: signal_stats(&state.signal_logs, now),
            profit_booking: ProfitBookingStats {
                positions_with_pending_tp: state
                    .positions
                    .values()
                    .filter(|p| p.next_pending_tp().is_some())
                    .count(),
                tp_hits_last_hour: state.tp_hit_times.len(),
                partial_closes_last_hour: state.partial_close_times.len(),
                failed_closes_last_hour: state.failed_close_times.len(),
                trailing_active_count: state
                    .positions
                    .values()
                    .filter(|p| p.trailing_active)
                    .count(),
            },
            blocked_coins: blocked,
            llm_status: LlmStatus {
                connected: self.advisor.is_connected(),
                provider: self.advisor.provider().to_string(),
                disabled_symbols: state.llm_sl_disabled.iter().cloned().collect(),
            },
            issues,
        }
    }

    /// Test/bootstrap helper: install a position directly.
    pub fn insert_position(&self, position: Position) {
        self.state
            .write()
            .positions
            .insert(position.symbol.clone(), position);
    }
}

// ---------------------------------------------------------------------------
// Counter-reset task (UTC midnight + top of hour)
// ---------------------------------------------------------------------------

/// Sleeps until the next UTC midnight / top-of-hour and resets the rolling
/// counters, per the breaker reset contract.
pub async fn run_counter_resets(ap: Arc<Autopilot>, mut stop: watch::Receiver<bool>) {
    loop {
        let now = Utc::now();
        let next_hour = (now + chrono::Duration::hours(1))
            .with_minute(0)
            .and_then(|t| t.with_second(0))
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(now + chrono::Duration::hours(1));
        let next_midnight = (now + chrono::Duration::days(1))
            .with_hour(0)
            .and_then(|t| t.with_minute(0))
            .and_then(|t| t.with_second(0))
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(now + chrono::Duration::days(1));

        let is_midnight = next_midnight <= next_hour;
        let wake = if is_midnight { next_midnight } else { next_hour };
        let sleep_secs = (wake - now).num_seconds().max(1) as u64;

        tokio::select! {
            _ = tokio::time::sleep(std::time::Duration::from_secs(sleep_secs)) => {}
            _ = stop.changed() => return,
        }

        let now = Utc::now();
        let mut state = ap.state.write();
        if is_midnight {
            info!(user = %ap.user_id, "UTC midnight — resetting daily counters");
            state.daily_trades = 0;
            state.daily_pnl = 0.0;
            state.global_breaker.reset_stats(ResetPeriod::Day, now);
            for cb in state.mode_breakers.values_mut() {
                cb.reset_stats(ResetPeriod::Day, now);
            }
        } else {
            state.global_breaker.reset_stats(ResetPeriod::Hour, now);
            for cb in state.mode_breakers.values_mut() {
                cb.reset_stats(ResetPeriod::Hour, now);
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
    use crate::position::{build_tp_levels, stop_loss_price, ProtectionStatus};
    use crate::storage::MemoryStore;
    use crate::types::SignalSource;

    fn test_autopilot() -> Arc<Autopilot> {
        let store = Arc::new(MemoryStore::new());
        Autopilot::new(
            "u1",
            Arc::new(ExchangeClient::new("k", "s")),
            Arc::new(FixedAnalyzer::new()),
            Arc::new(NullAdvisor),
            store.clone(),
            store,
            Settings::default(),
        )
    }

    fn test_position(symbol: &str) -> Position {
        let entry = 2000.0;
        Position {
            symbol: symbol.into(),
            side: Side::Long,
            mode: TradeMode::Swing,
            entry_price: entry,
            original_qty: 0.5,
            remaining_qty: 0.5,
            leverage: 5,
            entry_time: Utc::now(),
            futures_trade_id: "t1".into(),
            tp_levels: build_tp_levels(entry, Side::Long, &[1.0, 2.0, 3.0, 4.0], &[25.0; 4]),
            stop_loss: stop_loss_price(entry, Side::Long, 2.0),
            original_sl: stop_loss_price(entry, Side::Long, 2.0),
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

    #[tokio::test]
    async fn finalize_close_updates_counters_and_removes_position() {
        let ap = test_autopilot();
        ap.insert_position(test_position("ETHUSDT"));

        ap.finalize_close("ETHUSDT", 2020.0, "take_profit").await;

        assert!(ap.state.read().positions.is_empty());
        let stats = ap.get_stats();
        assert_eq!(stats.total_trades, 1);
        assert_eq!(stats.winning_trades, 1);
        // (2020-2000)*0.5 = 10 USD
        assert!((stats.total_pnl - 10.0).abs() < 1e-9);

        let history = ap.get_trade_history(10);
        assert_eq!(history.len(), 1);
        assert!(history[0].full_close);
        // Leveraged: 1% * 5 = 5%.
        assert!((history[0].pnl_percent - 5.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn finalize_close_is_idempotent_for_missing_positions() {
        let ap = test_autopilot();
        ap.finalize_close("NOPE", 1.0, "whatever").await;
        assert_eq!(ap.get_stats().total_trades, 0);
    }

    #[tokio::test]
    async fn big_loss_close_blocks_the_coin() {
        let ap = test_autopilot();
        let mut p = test_position("DOGEUSDT");
        p.leverage = 20; // -2.75% raw * 20 = -55% ROI
        ap.insert_position(p);

        ap.finalize_close("DOGEUSDT", 1945.0, "stop_loss").await;

        let blocked = ap.get_blocked_coins();
        assert_eq!(blocked.len(), 1);
        assert_eq!(blocked[0].symbol, "DOGEUSDT");
        assert!(!blocked[0].manual_only);

        assert!(ap.unblock_coin("DOGEUSDT"));
        assert!(ap.get_blocked_coins().is_empty());
    }

    #[tokio::test]
    async fn partial_close_keeps_position_and_books_pnl() {
        let ap = test_autopilot();
        ap.insert_position(test_position("ETHUSDT"));

        ap.finalize_partial_close("ETHUSDT", 0.125, 2020.0, "take_profit_1")
            .await;

        let state = ap.state.read();
        let p = state.positions.get("ETHUSDT").unwrap();
        assert!((p.remaining_qty - 0.375).abs() < 1e-9);
        assert!((p.realized_pnl - 2.5).abs() < 1e-9); // (2020-2000)*0.125
        drop(state);

        let history = ap.get_trade_history(10);
        assert_eq!(history.len(), 1);
        assert!(!history[0].full_close);
    }

    #[test]
    fn llm_kill_switch_reset() {
        let ap = test_autopilot();
        {
            let mut state = ap.state.write();
            state.bad_llm_calls.insert("BTCUSDT".into(), 3);
            state.llm_sl_disabled.insert("BTCUSDT".into());
        }
        assert!(ap.reset_llm_sl_for_symbol("BTCUSDT"));
        assert!(!ap.reset_llm_sl_for_symbol("BTCUSDT"));
        assert!(!ap.state.read().llm_sl_disabled.contains("BTCUSDT"));
    }

    #[test]
    fn diagnostics_reflect_engine_state() {
        let ap = test_autopilot();
        ap.insert_position(test_position("ETHUSDT"));

        let diag = ap.get_diagnostics();
        assert!(!diag.autopilot_running);
        assert!(diag.can_trade);
        assert_eq!(diag.positions.open, 1);
        assert_eq!(diag.profit_booking.positions_with_pending_tp, 1);
        assert_eq!(diag.llm_status.provider, "none");
    }

    #[test]
    fn position_side_respects_account_mode() {
        let ap = test_autopilot();
        {
            let state = ap.state.read();
            assert_eq!(state.position_side_for(Side::Long), "BOTH");
        }
        ap.state.write().hedge_mode = true;
        let state = ap.state.read();
        assert_eq!(state.position_side_for(Side::Long), "LONG");
        assert_eq!(state.position_side_for(Side::Short), "SHORT");
    }

    #[tokio::test]
    async fn start_requires_enabled_modes() {
        let store = Arc::new(MemoryStore::new());
        let mut settings = Settings::default();
        for cfg in settings.modes.values_mut() {
            cfg.enabled = false;
        }
        let ap = Autopilot::new(
            "u1",
            Arc::new(ExchangeClient::new("k", "s")),
            Arc::new(FixedAnalyzer::new()),
            Arc::new(NullAdvisor),
            store.clone(),
            store,
            settings,
        );
        let err = ap.start().await.unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
        assert!(!ap.is_running());
    }
}
