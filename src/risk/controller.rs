//! Position risk controller
//!
//! Gates new positions against concurrency and daily limits, owns the open
//! set, and force-expires positions that outlive `max_position_age`.
//!
//! All state sits behind one mutex that is never held across an await; exit
//! pricing runs outside it, with the position marked in flight so a second
//! close of the same id is refused meanwhile. Changes are snapshotted under
//! that mutex and written to the store after it is released.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use super::exit::{ExitPricer, ExitQuote, PlaceholderExit};
use super::position::{LegPrices, NewPosition, Position, PositionStatus};
use super::store::{PersistedState, PositionStore};
use crate::bus::{EventBus, EventPayload, RiskNotice};
use crate::common::errors::{EngineError, Result};
use crate::config::RiskConfig;

const EVENT_SOURCE: &str = "risk_controller";
const AUTO_CLOSE_REASON: &str = "Auto-close due to timeout";
const MONITOR_STOP_GRACE: Duration = Duration::from_secs(2);
const EXIT_QUOTE_TIMEOUT: Duration = Duration::from_secs(5);

/// Limits enforced by the controller
#[derive(Debug, Clone, PartialEq)]
pub struct RiskLimits {
    pub max_position_age: Duration,
    pub max_concurrent_positions: usize,
    pub max_daily_trades: u32,
    /// Fraction of `drawdown_base_capital`
    pub max_daily_drawdown: Decimal,
    pub drawdown_base_capital: Decimal,
    pub sweep_interval: Duration,
    pub closed_history_limit: usize,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self::from(&RiskConfig::default())
    }
}

impl From<&RiskConfig> for RiskLimits {
    fn from(config: &RiskConfig) -> Self {
        Self {
            max_position_age: Duration::from_secs(config.max_position_age_seconds),
            max_concurrent_positions: config.max_concurrent_positions,
            max_daily_trades: config.max_daily_trades,
            max_daily_drawdown: config.max_daily_drawdown,
            drawdown_base_capital: config.drawdown_base_capital,
            sweep_interval: Duration::from_secs(config.sweep_interval_secs),
            closed_history_limit: config.closed_history_limit,
        }
    }
}

impl RiskLimits {
    /// Absolute daily loss that closes the gate
    pub fn drawdown_limit(&self) -> Decimal {
        self.max_daily_drawdown * self.drawdown_base_capital
    }
}

/// Snapshot for dashboards and logs
#[derive(Debug, Clone, Serialize)]
pub struct PositionSummary {
    pub open_positions: usize,
    pub max_concurrent_positions: usize,
    pub daily_trades_count: u32,
    pub max_daily_trades: u32,
    pub daily_pnl: Decimal,
    pub drawdown_limit: Decimal,
    pub average_position_age: Duration,
    /// Share of positions closed in the last 24h with positive P&L
    pub recent_win_rate: f64,
    pub recent_pnl: Decimal,
    /// Open positions already past `max_position_age`
    pub positions_past_max_age: usize,
    pub can_open_new: bool,
    pub gate_reason: String,
    pub timestamp: DateTime<Utc>,
}

struct RiskState {
    /// Every position still live on a venue: Open, Closing or Expired
    open: BTreeMap<String, Position>,
    closed: VecDeque<Position>,
    daily_trades_count: u32,
    daily_pnl: Decimal,
    last_reset_date: NaiveDate,
    /// Ids with an exit in progress
    in_flight: HashSet<String>,
    /// Changed since the last snapshot was taken for the store
    dirty: bool,
    revision: u64,
}

struct Monitor {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Position risk controller
pub struct RiskController {
    limits: RiskLimits,
    store: Option<PositionStore>,
    exit: Arc<dyn ExitPricer>,
    emergency_exit: Arc<dyn ExitPricer>,
    bus: Option<Arc<EventBus>>,
    state: Mutex<RiskState>,
    /// Revision of the last snapshot handed to the store; serialises writes
    written: Mutex<u64>,
    monitor: Mutex<Option<Monitor>>,
}

impl RiskController {
    pub fn new(limits: RiskLimits, store: Option<PositionStore>, exit: Arc<dyn ExitPricer>) -> Self {
        Self {
            limits,
            store,
            emergency_exit: exit.clone(),
            exit,
            bus: None,
            state: Mutex::new(RiskState {
                open: BTreeMap::new(),
                closed: VecDeque::new(),
                daily_trades_count: 0,
                daily_pnl: Decimal::ZERO,
                last_reset_date: today(),
                in_flight: HashSet::new(),
                dirty: false,
                revision: 0,
            }),
            written: Mutex::new(0),
            monitor: Mutex::new(None),
        }
    }

    /// Controller with the placeholder exits and the configured store
    pub fn from_config(config: &RiskConfig) -> Self {
        Self::new(
            RiskLimits::from(config),
            config.positions_file.clone().map(PositionStore::new),
            Arc::new(PlaceholderExit::new(config.timeout_exit_loss)),
        )
        .with_emergency_exit(Arc::new(PlaceholderExit::new(config.emergency_exit_loss)))
    }

    /// Price [`force_close_all`](Self::force_close_all) exits with `exit`
    /// instead of the expiry pricer
    pub fn with_emergency_exit(mut self, exit: Arc<dyn ExitPricer>) -> Self {
        self.emergency_exit = exit;
        self
    }

    /// Publish risk alerts on `bus`
    pub fn with_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn limits(&self) -> &RiskLimits {
        &self.limits
    }

    /// Restore state from the store. Returns the number of open positions
    /// resumed; expired ones are picked up by the next sweep.
    pub fn load(&self) -> Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let Some(saved) = store.load()? else {
            info!(path = %store.path().display(), "No saved positions");
            return Ok(0);
        };

        let count = self.restore(saved);
        self.flush();
        Ok(count)
    }

    fn restore(&self, saved: PersistedState) -> usize {
        let mut state = self.state.lock();
        state.open = saved
            .open_positions
            .into_iter()
            .map(|p| (p.id.clone(), p))
            .collect();
        let skip = saved
            .closed_positions
            .len()
            .saturating_sub(self.limits.closed_history_limit);
        state.closed = saved.closed_positions.into_iter().skip(skip).collect();
        state.daily_trades_count = saved.daily_trades_count;
        state.daily_pnl = saved.daily_pnl;
        state.last_reset_date = saved.last_reset_date.unwrap_or_else(today);
        state.in_flight.clear();

        // A close that was in progress when the process died can't be resumed
        let stranded: Vec<String> = state
            .open
            .values()
            .filter(|p| p.status == PositionStatus::Closing)
            .map(|p| p.id.clone())
            .collect();
        for id in &stranded {
            warn!(position_id = %id, "Position was mid-close at shutdown, needs manual reconciliation");
        }

        self.reset_if_needed(&mut state, today());
        let count = state.open.len();
        info!(
            open = count,
            closed = state.closed.len(),
            daily_trades = state.daily_trades_count,
            daily_pnl = %state.daily_pnl,
            "Loaded positions"
        );
        count
    }

    /// Whether a new position may be opened, and why not
    pub fn can_open_new_position(&self) -> (bool, String) {
        let verdict = {
            let mut state = self.state.lock();
            self.reset_if_needed(&mut state, today());
            self.gate(&state)
        };
        self.flush();
        verdict
    }

    /// Open a position. The gate is re-checked atomically with the insert, so
    /// two racing callers can't both take the last slot.
    #[instrument(skip_all, fields(pair = %new.pair))]
    pub fn create_position(&self, new: NewPosition) -> Result<Position> {
        let mut state = self.state.lock();
        self.reset_if_needed(&mut state, today());

        let (allowed, reason) = self.gate(&state);
        if !allowed {
            drop(state);
            self.flush();
            warn!(%reason, "Position refused");
            self.publish_breach(&reason);
            return Err(EngineError::RiskLimit(reason));
        }

        let created_at = Utc::now();
        let id = unique_id(&state, &new.pair, created_at);
        let position = Position {
            id: id.clone(),
            pair: new.pair,
            created_at,
            trade_size: new.trade_size,
            entry_spread: new.entry_spread,
            venue_refs: new.venue_refs,
            status: PositionStatus::Open,
            entry_prices: new.entry_prices,
            exit_prices: None,
            closed_at: None,
            realized_pnl: None,
            close_reason: None,
            auto_close_triggered: false,
        };
        state.open.insert(id.clone(), position.clone());
        state.daily_trades_count += 1;
        state.dirty = true;

        info!(
            position_id = %id,
            trade_size = %position.trade_size,
            entry_spread = %position.entry_spread,
            open = state.open.len(),
            daily_trades = state.daily_trades_count,
            "Position opened"
        );
        drop(state);
        self.flush();
        Ok(position)
    }

    /// Close an open position in one step (Open → Closing → Closed)
    pub fn close_position(
        &self,
        id: &str,
        exit_prices: Option<LegPrices>,
        realized_pnl: Decimal,
        reason: &str,
    ) -> Result<Position> {
        let closed = {
            let mut state = self.state.lock();
            let mut position = take_open(&mut state, id)?;
            position.transition(PositionStatus::Closing)?;
            position.transition(PositionStatus::Closed)?;
            self.settle(&mut state, position, exit_prices, Some(realized_pnl), reason)
        };
        self.flush();
        Ok(closed)
    }

    /// Mark a position Closing while the caller unwinds it on the venues
    pub fn begin_close(&self, id: &str) -> Result<Position> {
        let closing = {
            let mut state = self.state.lock();
            let state = &mut *state;
            let position = state
                .open
                .get_mut(id)
                .ok_or_else(|| EngineError::PositionNotFound(id.to_string()))?;
            if position.status != PositionStatus::Open {
                return Err(EngineError::CloseInFlight(id.to_string()));
            }
            position.transition(PositionStatus::Closing)?;
            let closing = position.clone();
            state.in_flight.insert(id.to_string());
            state.dirty = true;
            closing
        };
        self.flush();
        debug!(position_id = %id, "Close started");
        Ok(closing)
    }

    /// Finish a close started with [`begin_close`](Self::begin_close)
    pub fn complete_close(
        &self,
        id: &str,
        exit_prices: Option<LegPrices>,
        realized_pnl: Decimal,
        reason: &str,
    ) -> Result<Position> {
        let closed = {
            let mut state = self.state.lock();
            let mut position = take_closing(&mut state, id)?;
            if let Err(e) = position.transition(PositionStatus::Closed) {
                state.open.insert(position.id.clone(), position);
                return Err(e);
            }
            self.settle(&mut state, position, exit_prices, Some(realized_pnl), reason)
        };
        self.flush();
        Ok(closed)
    }

    /// Give up on a close started with [`begin_close`](Self::begin_close).
    /// The position leaves the open set but its legs may still be live.
    pub fn fail_close(&self, id: &str, reason: &str) -> Result<Position> {
        let failed = {
            let mut state = self.state.lock();
            let mut position = take_closing(&mut state, id)?;
            if let Err(e) = position.transition(PositionStatus::Failed) {
                state.open.insert(position.id.clone(), position);
                return Err(e);
            }
            error!(
                position_id = %id,
                %reason,
                legs = %format!("{}, {}", position.venue_refs[0], position.venue_refs[1]),
                "Position close failed, manual reconciliation required"
            );
            self.settle(&mut state, position, None, None, reason)
        };
        self.flush();
        Ok(failed)
    }

    /// Open positions older than `max_position_age`
    pub fn get_expired_positions(&self) -> Vec<Position> {
        let now = Utc::now();
        self.state
            .lock()
            .open
            .values()
            .filter(|p| {
                p.status == PositionStatus::Open && p.is_expired_at(self.limits.max_position_age, now)
            })
            .cloned()
            .collect()
    }

    /// Expire and close every position past its maximum age. Returns the
    /// number of positions settled.
    ///
    /// Cancel-safe: positions claimed but not yet settled when the future is
    /// dropped are released and picked up again by the next sweep.
    pub async fn sweep_expired(&self) -> usize {
        let candidates = self.mark_expired();
        self.flush();
        let mut claims = SweepClaims {
            controller: self,
            ids: candidates.iter().map(|p| p.id.clone()).collect(),
        };
        let mut settled = 0;

        for position in candidates {
            let (prices, pnl, reason) = match self.quote(self.exit.as_ref(), &position).await {
                Ok(quote) => (quote.prices, Some(quote.realized_pnl), AUTO_CLOSE_REASON.to_string()),
                Err(e) => {
                    error!(position_id = %position.id, error = %e, "Exit pricing failed for expired position");
                    (None, None, format!("{} (exit unavailable: {})", AUTO_CLOSE_REASON, e))
                }
            };

            {
                let mut state = self.state.lock();
                if let Some(expired) = state.open.remove(&position.id) {
                    self.settle(&mut state, expired, prices, pnl, &reason);
                    settled += 1;
                }
            }
            claims.ids.remove(&position.id);
            self.flush();
        }
        settled
    }

    /// Spawn the periodic expiry sweep. The task holds only a weak reference
    /// and ends on its own once the controller is dropped.
    pub fn start_monitoring(self: &Arc<Self>) {
        let mut monitor = self.monitor.lock();
        if monitor.as_ref().map_or(false, |m| !m.handle.is_finished()) {
            debug!("Position monitoring already running");
            return;
        }

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let controller = Arc::downgrade(self);
        let period = self.limits.sweep_interval.max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown_rx.changed() => break,
                }
                let Some(controller) = controller.upgrade() else {
                    break;
                };
                tokio::select! {
                    settled = controller.sweep_expired() => {
                        if settled > 0 {
                            info!(settled, "Expired positions closed");
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
            debug!("Position monitoring loop exited");
        });

        *monitor = Some(Monitor { shutdown, handle });
        info!(interval_ms = period.as_millis() as u64, "Position monitoring started");
    }

    pub async fn stop_monitoring(&self) {
        let Some(mut monitor) = self.monitor.lock().take() else {
            return;
        };
        let _ = monitor.shutdown.send(true);
        if timeout(MONITOR_STOP_GRACE, &mut monitor.handle).await.is_err() {
            warn!("Position monitoring did not stop in time, aborting");
            monitor.handle.abort();
        }
        info!("Position monitoring stopped");
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor
            .lock()
            .as_ref()
            .map_or(false, |m| !m.handle.is_finished())
    }

    /// Close every Open position through the emergency exit pricer. Positions
    /// already being closed are left to their owner. A position whose exit
    /// can't be priced ends Failed.
    #[instrument(skip(self))]
    pub async fn force_close_all(&self, reason: &str) -> Vec<Position> {
        let targets: Vec<Position> = {
            let mut state = self.state.lock();
            let state = &mut *state;
            let mut targets = Vec::new();
            for position in state.open.values_mut() {
                if position.status != PositionStatus::Open {
                    continue;
                }
                if position.transition(PositionStatus::Closing).is_ok() {
                    state.in_flight.insert(position.id.clone());
                    targets.push(position.clone());
                }
            }
            if !targets.is_empty() {
                state.dirty = true;
            }
            targets
        };
        self.flush();
        warn!(count = targets.len(), "Force closing all positions");

        let mut closed = Vec::with_capacity(targets.len());
        for position in targets {
            let quote = self.quote(self.emergency_exit.as_ref(), &position).await;
            let settled = self.settle_forced(&position.id, quote, reason);
            self.flush();
            closed.extend(settled);
        }
        closed
    }

    fn settle_forced(&self, id: &str, quote: Result<ExitQuote>, reason: &str) -> Option<Position> {
        let mut state = self.state.lock();
        let mut live = state.open.remove(id)?;
        match quote {
            Ok(quote) if live.transition(PositionStatus::Closed).is_ok() => {
                Some(self.settle(&mut state, live, quote.prices, Some(quote.realized_pnl), reason))
            }
            Ok(_) => {
                state.open.insert(live.id.clone(), live);
                None
            }
            Err(e) => {
                error!(position_id = %id, error = %e, "Force close could not price exit");
                let detail = format!("{} (exit unavailable: {})", reason, e);
                match live.transition(PositionStatus::Failed) {
                    Ok(()) => Some(self.settle(&mut state, live, None, None, &detail)),
                    Err(_) => {
                        state.open.insert(live.id.clone(), live);
                        None
                    }
                }
            }
        }
    }

    /// Reset daily counters when the UTC date has moved on
    pub fn reset_daily_stats_if_needed(&self) -> bool {
        self.reset_daily_stats_if_needed_at(today())
    }

    /// Reset daily counters if `today` is after the last reset date. Calling
    /// it again on the same day is a no-op.
    pub fn reset_daily_stats_if_needed_at(&self, today: NaiveDate) -> bool {
        let reset = self.reset_if_needed(&mut self.state.lock(), today);
        self.flush();
        reset
    }

    pub fn position_summary(&self) -> PositionSummary {
        let summary = self.summarize(Utc::now());
        self.flush();
        summary
    }

    fn summarize(&self, now: DateTime<Utc>) -> PositionSummary {
        let mut state = self.state.lock();
        self.reset_if_needed(&mut state, today());
        let (can_open_new, gate_reason) = self.gate(&state);

        let ages: Vec<Duration> = state.open.values().map(|p| p.age_at(now)).collect();
        let average_position_age = if ages.is_empty() {
            Duration::ZERO
        } else {
            ages.iter().sum::<Duration>() / ages.len() as u32
        };

        let day_ago = now - chrono::Duration::hours(24);
        let recent: Vec<&Position> = state
            .closed
            .iter()
            .filter(|p| p.closed_at.map_or(false, |t| t > day_ago))
            .collect();
        let wins = recent
            .iter()
            .filter(|p| p.realized_pnl.map_or(false, |pnl| pnl > Decimal::ZERO))
            .count();
        let recent_win_rate = if recent.is_empty() {
            0.0
        } else {
            wins as f64 / recent.len() as f64
        };
        let recent_pnl: Decimal = recent.iter().filter_map(|p| p.realized_pnl).sum();

        PositionSummary {
            open_positions: state.open.len(),
            max_concurrent_positions: self.limits.max_concurrent_positions,
            daily_trades_count: state.daily_trades_count,
            max_daily_trades: self.limits.max_daily_trades,
            daily_pnl: state.daily_pnl,
            drawdown_limit: self.limits.drawdown_limit(),
            average_position_age,
            recent_win_rate,
            recent_pnl,
            positions_past_max_age: state
                .open
                .values()
                .filter(|p| p.is_expired_at(self.limits.max_position_age, now))
                .count(),
            can_open_new,
            gate_reason,
            timestamp: now,
        }
    }

    /// Positions still live on a venue, oldest id first
    pub fn open_positions(&self) -> Vec<Position> {
        self.state.lock().open.values().cloned().collect()
    }

    pub fn get_position(&self, id: &str) -> Option<Position> {
        self.state.lock().open.get(id).cloned()
    }

    /// Closed history, oldest first
    pub fn closed_positions(&self) -> Vec<Position> {
        self.state.lock().closed.iter().cloned().collect()
    }

    pub fn daily_trades_count(&self) -> u32 {
        self.state.lock().daily_trades_count
    }

    pub fn daily_pnl(&self) -> Decimal {
        self.state.lock().daily_pnl
    }

    fn gate(&self, state: &RiskState) -> (bool, String) {
        let limits = &self.limits;
        if state.open.len() >= limits.max_concurrent_positions {
            return (
                false,
                format!(
                    "Maximum concurrent positions reached: {}/{}",
                    state.open.len(),
                    limits.max_concurrent_positions
                ),
            );
        }
        if state.daily_trades_count >= limits.max_daily_trades {
            return (
                false,
                format!(
                    "Daily trade limit reached: {}/{}",
                    state.daily_trades_count, limits.max_daily_trades
                ),
            );
        }
        if state.daily_pnl < Decimal::ZERO && state.daily_pnl.abs() > limits.drawdown_limit() {
            return (
                false,
                format!("Daily drawdown limit exceeded: ${:.2}", state.daily_pnl),
            );
        }
        (true, "Position can be opened".to_string())
    }

    fn reset_if_needed(&self, state: &mut RiskState, today: NaiveDate) -> bool {
        if today <= state.last_reset_date {
            return false;
        }
        info!(
            previous = %state.last_reset_date,
            trades = state.daily_trades_count,
            pnl = %state.daily_pnl,
            "Resetting daily stats"
        );
        state.daily_trades_count = 0;
        state.daily_pnl = Decimal::ZERO;
        state.last_reset_date = today;
        state.dirty = true;
        true
    }

    /// Move Open positions past their age to Expired and claim them for the
    /// caller. Expired positions left unclaimed by a reload are claimed too.
    fn mark_expired(&self) -> Vec<Position> {
        let now = Utc::now();
        let mut state = self.state.lock();
        let state = &mut *state;
        let mut claimed = Vec::new();

        for position in state.open.values_mut() {
            let expired = match position.status {
                PositionStatus::Open => position.is_expired_at(self.limits.max_position_age, now),
                PositionStatus::Expired => !state.in_flight.contains(&position.id),
                _ => false,
            };
            if !expired {
                continue;
            }
            if position.status == PositionStatus::Open {
                if let Err(e) = position.transition(PositionStatus::Expired) {
                    warn!(position_id = %position.id, error = %e, "Could not expire position");
                    continue;
                }
                position.auto_close_triggered = true;
                warn!(
                    position_id = %position.id,
                    age_secs = position.age_at(now).as_secs_f64(),
                    "Position exceeded max age, auto-closing"
                );
            }
            state.in_flight.insert(position.id.clone());
            claimed.push(position.clone());
        }

        if !claimed.is_empty() {
            state.dirty = true;
        }
        claimed
    }

    /// Stamp exit details, book P&L and move to history
    fn settle(
        &self,
        state: &mut RiskState,
        mut position: Position,
        exit_prices: Option<LegPrices>,
        realized_pnl: Option<Decimal>,
        reason: &str,
    ) -> Position {
        position.closed_at = Some(Utc::now());
        position.exit_prices = exit_prices;
        position.realized_pnl = realized_pnl;
        position.close_reason = Some(reason.to_string());
        if let Some(pnl) = realized_pnl {
            state.daily_pnl += pnl;
        }
        state.in_flight.remove(&position.id);

        info!(
            position_id = %position.id,
            status = %position.status,
            pnl = ?realized_pnl,
            %reason,
            daily_pnl = %state.daily_pnl,
            "Position closed"
        );

        state.closed.push_back(position.clone());
        while state.closed.len() > self.limits.closed_history_limit {
            state.closed.pop_front();
        }
        state.dirty = true;
        position
    }

    /// Price an exit, giving up after [`EXIT_QUOTE_TIMEOUT`]
    async fn quote(&self, pricer: &dyn ExitPricer, position: &Position) -> Result<ExitQuote> {
        match timeout(EXIT_QUOTE_TIMEOUT, pricer.exit(position)).await {
            Ok(quote) => quote,
            Err(_) => Err(EngineError::Timeout(format!(
                "exit quote for {} after {:?}",
                position.id, EXIT_QUOTE_TIMEOUT
            ))),
        }
    }

    /// Write the latest state to the store if it changed. Must be called
    /// without the state lock held.
    ///
    /// The snapshot is taken under the state lock; the write happens under
    /// `written` only, and a snapshot older than one already written is
    /// skipped.
    fn flush(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let (revision, snapshot) = {
            let mut state = self.state.lock();
            if !state.dirty {
                return;
            }
            state.dirty = false;
            state.revision += 1;
            let snapshot = PersistedState {
                open_positions: state.open.values().cloned().collect(),
                closed_positions: state.closed.iter().cloned().collect(),
                daily_trades_count: state.daily_trades_count,
                daily_pnl: state.daily_pnl,
                last_reset_date: Some(state.last_reset_date),
                last_updated: Some(Utc::now()),
            };
            (state.revision, snapshot)
        };

        let mut written = self.written.lock();
        if *written >= revision {
            return;
        }
        *written = revision;
        if let Err(e) = store.save(&snapshot) {
            warn!(path = %store.path().display(), error = %e, "Failed to persist positions");
            // retried with the next change
            self.state.lock().dirty = true;
        }
    }

    fn publish_breach(&self, reason: &str) {
        if let Some(bus) = &self.bus {
            bus.publish_payload(
                EVENT_SOURCE,
                EventPayload::RiskLimitBreached(RiskNotice {
                    reason: reason.to_string(),
                }),
            );
        }
    }
}

/// Expiry claims held by a running sweep; whatever is left unsettled when the
/// sweep ends (or is dropped mid-await) goes back to the next sweep
struct SweepClaims<'a> {
    controller: &'a RiskController,
    ids: HashSet<String>,
}

impl Drop for SweepClaims<'_> {
    fn drop(&mut self) {
        if self.ids.is_empty() {
            return;
        }
        let mut state = self.controller.state.lock();
        for id in &self.ids {
            state.in_flight.remove(id);
        }
        debug!(released = self.ids.len(), "Released unsettled expiry claims");
    }
}

fn today() -> NaiveDate {
    Utc::now().date_naive()
}

fn unique_id(state: &RiskState, pair: &str, at: DateTime<Utc>) -> String {
    let base = format!("{}_{}", pair, at.format("%Y%m%d_%H%M%S_%6f"));
    let taken = |id: &str| state.open.contains_key(id) || state.closed.iter().any(|p| p.id == id);
    if !taken(base.as_str()) {
        return base;
    }
    let mut n = 1;
    loop {
        let candidate = format!("{}_{}", base, n);
        if !taken(candidate.as_str()) {
            return candidate;
        }
        n += 1;
    }
}

/// Remove an Open position from the open set
fn take_open(state: &mut RiskState, id: &str) -> Result<Position> {
    match state.open.get(id).map(|p| p.status) {
        None => Err(EngineError::PositionNotFound(id.to_string())),
        Some(PositionStatus::Open) => state
            .open
            .remove(id)
            .ok_or_else(|| EngineError::PositionNotFound(id.to_string())),
        Some(_) => Err(EngineError::CloseInFlight(id.to_string())),
    }
}

/// Remove a Closing position from the open set
fn take_closing(state: &mut RiskState, id: &str) -> Result<Position> {
    match state.open.get(id).map(|p| p.status) {
        None => Err(EngineError::PositionNotFound(id.to_string())),
        Some(PositionStatus::Closing) => state
            .open
            .remove(id)
            .ok_or_else(|| EngineError::PositionNotFound(id.to_string())),
        Some(status) => Err(EngineError::InvalidTransition {
            id: id.to_string(),
            from: status.to_string(),
            to: PositionStatus::Closed.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::types::OrderRef;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn limits() -> RiskLimits {
        RiskLimits {
            max_position_age: Duration::from_secs(180),
            max_concurrent_positions: 3,
            max_daily_trades: 50,
            max_daily_drawdown: dec!(0.05),
            drawdown_base_capital: dec!(1000),
            sweep_interval: Duration::from_secs(10),
            closed_history_limit: 100,
        }
    }

    fn controller(limits: RiskLimits) -> RiskController {
        RiskController::new(limits, None, Arc::new(PlaceholderExit::new(dec!(2))))
    }

    fn new_position(pair: &str) -> NewPosition {
        NewPosition {
            pair: pair.to_string(),
            trade_size: dec!(100),
            entry_spread: dec!(0.004),
            venue_refs: [
                OrderRef {
                    venue: "binance".to_string(),
                    order_id: "a-1".to_string(),
                    symbol: "SOLUSDT".to_string(),
                },
                OrderRef {
                    venue: "drift".to_string(),
                    order_id: "b-1".to_string(),
                    symbol: "SOL-PERP".to_string(),
                },
            ],
            entry_prices: Some(LegPrices {
                leg_a: dec!(100),
                leg_b: dec!(100.5),
            }),
        }
    }

    struct UnavailableExit;

    #[async_trait]
    impl ExitPricer for UnavailableExit {
        async fn exit(&self, _position: &Position) -> Result<ExitQuote> {
            Err(EngineError::transient("drift", "no quote"))
        }
    }

    #[test]
    fn test_concurrency_cap_blocks_creation() {
        let risk = controller(RiskLimits {
            max_concurrent_positions: 1,
            ..limits()
        });

        risk.create_position(new_position("SOL/USDC")).unwrap();
        assert_eq!(
            risk.can_open_new_position(),
            (false, "Maximum concurrent positions reached: 1/1".to_string())
        );

        let err = risk.create_position(new_position("ETH/USDC")).unwrap_err();
        assert!(matches!(err, EngineError::RiskLimit(_)));
        assert_eq!(risk.open_positions().len(), 1);
        assert_eq!(risk.daily_trades_count(), 1);
    }

    #[test]
    fn test_daily_trade_limit() {
        let risk = controller(RiskLimits {
            max_daily_trades: 2,
            ..limits()
        });
        for _ in 0..2 {
            let p = risk.create_position(new_position("SOL/USDC")).unwrap();
            risk.close_position(&p.id, None, dec!(1), "take profit").unwrap();
        }
        assert_eq!(
            risk.can_open_new_position(),
            (false, "Daily trade limit reached: 2/2".to_string())
        );
    }

    #[test]
    fn test_drawdown_gate() {
        let risk = controller(limits());
        let p = risk.create_position(new_position("SOL/USDC")).unwrap();
        risk.close_position(&p.id, None, dec!(-50), "stop").unwrap();
        // exactly at the limit still passes
        assert!(risk.can_open_new_position().0);

        let p = risk.create_position(new_position("SOL/USDC")).unwrap();
        risk.close_position(&p.id, None, dec!(-10), "stop").unwrap();
        assert_eq!(
            risk.can_open_new_position(),
            (false, "Daily drawdown limit exceeded: $-60.00".to_string())
        );
    }

    #[tokio::test]
    async fn test_refusal_publishes_breach() {
        let bus = Arc::new(EventBus::with_capacity(16));
        let risk = controller(RiskLimits {
            max_concurrent_positions: 0,
            ..limits()
        })
        .with_bus(bus.clone());

        assert!(risk.create_position(new_position("SOL/USDC")).is_err());
        assert_eq!(bus.queue_depth(), 1);
    }

    #[test]
    fn test_ids_are_unique() {
        let risk = controller(RiskLimits {
            max_concurrent_positions: 10,
            ..limits()
        });
        let ids: HashSet<String> = (0..5)
            .map(|_| risk.create_position(new_position("SOL/USDC")).unwrap().id)
            .collect();
        assert_eq!(ids.len(), 5);
        assert!(ids.iter().all(|id| id.starts_with("SOL/USDC_")));
    }

    #[test]
    fn test_close_moves_to_history_and_books_pnl() {
        let risk = controller(limits());
        let p = risk.create_position(new_position("SOL/USDC")).unwrap();
        let exit = LegPrices {
            leg_a: dec!(101),
            leg_b: dec!(101.2),
        };

        let closed = risk.close_position(&p.id, Some(exit), dec!(3.5), "target").unwrap();

        assert_eq!(closed.status, PositionStatus::Closed);
        assert_eq!(closed.exit_prices, Some(exit));
        assert_eq!(closed.close_reason.as_deref(), Some("target"));
        assert!(risk.get_position(&p.id).is_none());
        assert_eq!(risk.closed_positions().len(), 1);
        assert_eq!(risk.daily_pnl(), dec!(3.5));

        let err = risk.close_position(&p.id, None, dec!(0), "again").unwrap_err();
        assert!(matches!(err, EngineError::PositionNotFound(_)));
    }

    #[test]
    fn test_two_phase_close() {
        let risk = controller(limits());
        let p = risk.create_position(new_position("SOL/USDC")).unwrap();

        let closing = risk.begin_close(&p.id).unwrap();
        assert_eq!(closing.status, PositionStatus::Closing);
        assert!(matches!(
            risk.close_position(&p.id, None, dec!(0), "manual"),
            Err(EngineError::CloseInFlight(_))
        ));
        assert!(matches!(risk.begin_close(&p.id), Err(EngineError::CloseInFlight(_))));

        let closed = risk.complete_close(&p.id, None, dec!(-1), "manual").unwrap();
        assert_eq!(closed.status, PositionStatus::Closed);
        assert_eq!(risk.daily_pnl(), dec!(-1));
    }

    #[test]
    fn test_failed_close_leaves_pnl_untouched() {
        let risk = controller(limits());
        let p = risk.create_position(new_position("SOL/USDC")).unwrap();

        // complete/fail require a close in progress
        assert!(matches!(
            risk.fail_close(&p.id, "venue down"),
            Err(EngineError::InvalidTransition { .. })
        ));

        risk.begin_close(&p.id).unwrap();
        let failed = risk.fail_close(&p.id, "venue down").unwrap();

        assert_eq!(failed.status, PositionStatus::Failed);
        assert!(risk.open_positions().is_empty());
        assert_eq!(risk.daily_pnl(), Decimal::ZERO);
        assert_eq!(risk.closed_positions()[0].status, PositionStatus::Failed);
    }

    #[test]
    fn test_closed_history_is_bounded() {
        let risk = controller(RiskLimits {
            closed_history_limit: 2,
            ..limits()
        });
        let mut ids = Vec::new();
        for _ in 0..3 {
            let p = risk.create_position(new_position("SOL/USDC")).unwrap();
            risk.close_position(&p.id, None, dec!(1), "done").unwrap();
            ids.push(p.id);
        }
        let kept: Vec<String> = risk.closed_positions().into_iter().map(|p| p.id).collect();
        assert_eq!(kept, ids[1..].to_vec());
    }

    #[test]
    fn test_daily_reset_is_idempotent() {
        let risk = controller(limits());
        let p = risk.create_position(new_position("SOL/USDC")).unwrap();
        risk.close_position(&p.id, None, dec!(-5), "stop").unwrap();

        let today = today();
        assert!(!risk.reset_daily_stats_if_needed_at(today));
        assert_eq!(risk.daily_trades_count(), 1);

        let tomorrow = today.succ_opt().unwrap();
        assert!(risk.reset_daily_stats_if_needed_at(tomorrow));
        assert_eq!(risk.daily_trades_count(), 0);
        assert_eq!(risk.daily_pnl(), Decimal::ZERO);

        risk.create_position(new_position("SOL/USDC")).unwrap();
        for _ in 0..3 {
            assert!(!risk.reset_daily_stats_if_needed_at(tomorrow));
        }
        assert_eq!(risk.daily_trades_count(), 1);
    }

    #[tokio::test]
    async fn test_sweep_closes_expired_with_placeholder_exit() {
        let risk = controller(RiskLimits {
            max_position_age: Duration::from_millis(50),
            ..limits()
        });
        let p = risk.create_position(new_position("SOL/USDC")).unwrap();
        assert!(risk.get_expired_positions().is_empty());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(risk.get_expired_positions().len(), 1);

        assert_eq!(risk.sweep_expired().await, 1);
        assert!(risk.open_positions().is_empty());

        let closed = &risk.closed_positions()[0];
        assert_eq!(closed.id, p.id);
        assert_eq!(closed.status, PositionStatus::Expired);
        assert!(closed.auto_close_triggered);
        assert_eq!(closed.realized_pnl, Some(dec!(-2)));
        assert_eq!(closed.close_reason.as_deref(), Some(AUTO_CLOSE_REASON));
        assert_eq!(
            closed.exit_prices,
            Some(LegPrices {
                leg_a: dec!(99.9),
                leg_b: dec!(100.6005),
            })
        );
        assert_eq!(risk.daily_pnl(), dec!(-2));
    }

    #[tokio::test]
    async fn test_sweep_settles_even_without_exit_price() {
        let risk = RiskController::new(
            RiskLimits {
                max_position_age: Duration::from_millis(20),
                ..limits()
            },
            None,
            Arc::new(UnavailableExit),
        );
        risk.create_position(new_position("SOL/USDC")).unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert_eq!(risk.sweep_expired().await, 1);
        let closed = &risk.closed_positions()[0];
        assert_eq!(closed.status, PositionStatus::Expired);
        assert_eq!(closed.realized_pnl, None);
        assert!(closed
            .close_reason
            .as_deref()
            .unwrap()
            .contains("exit unavailable"));
        assert_eq!(risk.daily_pnl(), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_monitoring_expires_within_age_plus_interval() {
        let risk = Arc::new(controller(RiskLimits {
            max_position_age: Duration::from_millis(200),
            sweep_interval: Duration::from_millis(100),
            ..limits()
        }));
        let p = risk.create_position(new_position("SOL/USDC")).unwrap();

        risk.start_monitoring();
        assert!(risk.is_monitoring());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(risk.get_position(&p.id).is_some());

        // age + interval, plus scheduling slack
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(risk.get_position(&p.id).is_none());
        assert_eq!(risk.closed_positions()[0].status, PositionStatus::Expired);

        risk.stop_monitoring().await;
        assert!(!risk.is_monitoring());
    }

    /// Hangs on the first quote, answers the rest at once
    #[derive(Default)]
    struct StallFirstExit {
        calls: AtomicUsize,
    }

    impl StallFirstExit {
        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ExitPricer for StallFirstExit {
        async fn exit(&self, _position: &Position) -> Result<ExitQuote> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            Ok(ExitQuote {
                prices: None,
                realized_pnl: dec!(-2),
            })
        }
    }

    #[tokio::test]
    async fn test_stopping_mid_sweep_leaves_position_for_next_sweep() {
        let exit = Arc::new(StallFirstExit::default());
        let risk = Arc::new(RiskController::new(
            RiskLimits {
                max_position_age: Duration::from_millis(20),
                sweep_interval: Duration::from_millis(30),
                ..limits()
            },
            None,
            exit.clone(),
        ));
        let p = risk.create_position(new_position("SOL/USDC")).unwrap();
        risk.start_monitoring();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while exit.calls() == 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(exit.calls(), 1);

        // the stop must not wait on the stalled quote
        timeout(Duration::from_secs(1), risk.stop_monitoring())
            .await
            .unwrap();
        assert_eq!(risk.get_position(&p.id).unwrap().status, PositionStatus::Expired);

        risk.start_monitoring();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while risk.get_position(&p.id).is_some() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        risk.stop_monitoring().await;

        assert!(risk.open_positions().is_empty());
        let closed = &risk.closed_positions()[0];
        assert_eq!(closed.id, p.id);
        assert_eq!(closed.status, PositionStatus::Expired);
        assert_eq!(closed.realized_pnl, Some(dec!(-2)));
        assert!(risk.can_open_new_position().0);
    }

    struct HungExit;

    #[async_trait]
    impl ExitPricer for HungExit {
        async fn exit(&self, _position: &Position) -> Result<ExitQuote> {
            std::future::pending::<Result<ExitQuote>>().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_exit_quote_times_out() {
        let risk = RiskController::new(
            RiskLimits {
                max_position_age: Duration::from_millis(1),
                ..limits()
            },
            None,
            Arc::new(HungExit),
        );
        risk.create_position(new_position("SOL/USDC")).unwrap();
        // ages are wall-clock
        std::thread::sleep(Duration::from_millis(5));

        let started = tokio::time::Instant::now();
        assert_eq!(risk.sweep_expired().await, 1);
        assert!(started.elapsed() >= EXIT_QUOTE_TIMEOUT);
        assert!(started.elapsed() < EXIT_QUOTE_TIMEOUT + Duration::from_secs(1));

        let closed = &risk.closed_positions()[0];
        assert_eq!(closed.realized_pnl, None);
        assert!(closed
            .close_reason
            .as_deref()
            .unwrap()
            .contains("exit unavailable"));
    }

    #[tokio::test]
    async fn test_force_close_books_emergency_loss() {
        let config = RiskConfig {
            positions_file: None,
            ..RiskConfig::default()
        };
        let risk = RiskController::from_config(&config);
        risk.create_position(new_position("SOL/USDC")).unwrap();

        let closed = risk.force_close_all("Emergency close").await;

        assert_eq!(closed[0].realized_pnl, Some(-config.emergency_exit_loss));
        assert_eq!(risk.daily_pnl(), dec!(-1));
    }

    #[tokio::test]
    async fn test_force_close_all_skips_in_flight() {
        let risk = controller(limits());
        let a = risk.create_position(new_position("SOL/USDC")).unwrap();
        let b = risk.create_position(new_position("ETH/USDC")).unwrap();
        risk.begin_close(&b.id).unwrap();

        let closed = risk.force_close_all("Emergency close").await;

        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].id, a.id);
        assert_eq!(closed[0].status, PositionStatus::Closed);
        assert_eq!(closed[0].close_reason.as_deref(), Some("Emergency close"));
        let still_open: Vec<String> = risk.open_positions().into_iter().map(|p| p.id).collect();
        assert_eq!(still_open, vec![b.id]);
    }

    #[tokio::test]
    async fn test_force_close_without_exit_price_fails_position() {
        let risk = RiskController::new(limits(), None, Arc::new(UnavailableExit));
        risk.create_position(new_position("SOL/USDC")).unwrap();

        let closed = risk.force_close_all("shutdown").await;
        assert_eq!(closed[0].status, PositionStatus::Failed);
        assert!(risk.open_positions().is_empty());
    }

    #[test]
    fn test_state_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("positions.json");
        let exit: Arc<dyn ExitPricer> = Arc::new(PlaceholderExit::new(dec!(2)));

        let first = RiskController::new(limits(), Some(PositionStore::new(&path)), exit.clone());
        let kept = first.create_position(new_position("SOL/USDC")).unwrap();
        let done = first.create_position(new_position("ETH/USDC")).unwrap();
        first.close_position(&done.id, None, dec!(4), "target").unwrap();

        let second = RiskController::new(limits(), Some(PositionStore::new(&path)), exit);
        assert_eq!(second.load().unwrap(), 1);
        assert_eq!(second.get_position(&kept.id), Some(kept));
        assert_eq!(second.closed_positions().len(), 1);
        assert_eq!(second.daily_trades_count(), 2);
        assert_eq!(second.daily_pnl(), dec!(4));
    }

    #[test]
    fn test_concurrent_changes_leave_latest_state_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("positions.json");
        let risk = RiskController::new(
            RiskLimits {
                max_concurrent_positions: 100,
                ..limits()
            },
            Some(PositionStore::new(&path)),
            Arc::new(PlaceholderExit::new(dec!(2))),
        );

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..5 {
                        risk.create_position(new_position("SOL/USDC")).unwrap();
                    }
                });
            }
        });

        let saved = PositionStore::new(&path).load().unwrap().unwrap();
        assert_eq!(saved.open_positions.len(), 20);
        assert_eq!(saved.daily_trades_count, 20);
    }

    #[test]
    fn test_unwritable_store_does_not_block() {
        let dir = tempfile::tempdir().unwrap();
        // a directory where the file should be makes every save fail
        let path = dir.path().join("positions.json");
        std::fs::create_dir(&path).unwrap();

        let risk = RiskController::new(
            limits(),
            Some(PositionStore::new(&path)),
            Arc::new(PlaceholderExit::new(dec!(2))),
        );
        let p = risk.create_position(new_position("SOL/USDC")).unwrap();
        assert!(risk.get_position(&p.id).is_some());
    }

    #[test]
    fn test_summary() {
        let risk = controller(limits());
        let a = risk.create_position(new_position("SOL/USDC")).unwrap();
        let b = risk.create_position(new_position("ETH/USDC")).unwrap();
        risk.close_position(&a.id, None, dec!(3), "win").unwrap();
        risk.close_position(&b.id, None, dec!(-1), "loss").unwrap();
        risk.create_position(new_position("BTC/USDC")).unwrap();

        let summary = risk.position_summary();
        assert_eq!(summary.open_positions, 1);
        assert_eq!(summary.daily_trades_count, 3);
        assert_eq!(summary.daily_pnl, dec!(2));
        assert_eq!(summary.drawdown_limit, dec!(50));
        assert_eq!(summary.recent_win_rate, 0.5);
        assert_eq!(summary.recent_pnl, dec!(2));
        assert_eq!(summary.positions_past_max_age, 0);
        assert!(summary.can_open_new);
    }
}
