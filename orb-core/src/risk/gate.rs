//! Portfolio-wide entry gate
//!
//! All risk state (daily P&L, loss streak, cooldown, hourly trade count,
//! cash book and the set of symbols holding a PENDING/OPEN position) sits
//! behind one mutex. Admission is a single read-check-write transaction, so
//! two symbols evaluated concurrently cannot both slip past a limit.

use super::sizing::{CashSnapshot, SizingDecision};
use crate::config::RiskConfig;
use crate::errors::EngineResult;
use crate::market::Symbol;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{info, warn};

/// Why an entry was blocked, in check order
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockReason {
    DailyLossLimit,
    PositionExists,
    Cooldown,
    HourlyLimit,
    MaxOpenPositions,
}

impl BlockReason {
    pub fn code(&self) -> &'static str {
        match self {
            BlockReason::DailyLossLimit => "DAILY_LOSS_LIMIT",
            BlockReason::PositionExists => "POSITION_EXISTS",
            BlockReason::Cooldown => "COOLDOWN",
            BlockReason::HourlyLimit => "HOURLY_LIMIT",
            BlockReason::MaxOpenPositions => "MAX_OPEN_POSITIONS",
        }
    }
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Trading-day risk counters
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RiskState {
    pub day: Option<NaiveDate>,
    pub daily_pnl: f64,
    pub consecutive_losses: u32,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub hourly_trade_count: u32,
    /// Set by the first timestamp the gate sees
    pub hour_window_start: Option<DateTime<Utc>>,
    pub day_start_equity: f64,
    pub kill_switch_engaged: bool,
}

impl RiskState {
    fn new(equity: f64) -> Self {
        Self {
            day: None,
            daily_pnl: 0.0,
            consecutive_losses: 0,
            cooldown_until: None,
            hourly_trade_count: 0,
            hour_window_start: None,
            day_start_equity: equity,
            kill_switch_engaged: false,
        }
    }

    pub fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.map_or(false, |until| now < until)
    }
}

#[derive(Clone, Debug)]
struct CashBook {
    equity: f64,
    reserved: f64,
}

#[derive(Debug)]
struct GateState {
    risk: RiskState,
    cash: CashBook,
    active: HashSet<Symbol>,
}

/// What a confirmed close did to the risk state
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CloseOutcome {
    pub daily_pnl: f64,
    pub consecutive_losses: u32,
    pub cooldown_started: Option<DateTime<Utc>>,
    pub kill_switch_engaged: bool,
}

/// Gate statistics
#[derive(Default, Clone, Debug)]
pub struct RiskStatistics {
    pub checks: u64,
    pub admitted: u64,
    pub blocked: Vec<(BlockReason, u64)>,
}

/// Risk gate
pub struct RiskGate {
    config: RiskConfig,
    max_open_positions: usize,
    state: Mutex<GateState>,
    checks: AtomicU64,
    admitted: AtomicU64,
    blocked: DashMap<BlockReason, u64>,
}

impl RiskGate {
    pub fn new(config: RiskConfig, max_open_positions: usize) -> Self {
        let equity = config.starting_cash;
        Self {
            config,
            max_open_positions,
            state: Mutex::new(GateState {
                risk: RiskState::new(equity),
                cash: CashBook {
                    equity,
                    reserved: 0.0,
                },
                active: HashSet::new(),
            }),
            checks: AtomicU64::new(0),
            admitted: AtomicU64::new(0),
            blocked: DashMap::new(),
        }
    }

    /// Check whether `symbol` may enter at `now`. Read-only apart from
    /// day/hour rollover.
    pub fn can_enter(&self, symbol: &Symbol, now: DateTime<Utc>) -> Result<(), BlockReason> {
        let mut state = self.state.lock();
        self.roll_windows(&mut state, now);
        self.checks.fetch_add(1, Ordering::Relaxed);
        let result = self.check(&mut state, symbol, now);
        if let Err(reason) = result {
            *self.blocked.entry(reason).or_insert(0) += 1;
        }
        result
    }

    /// Check, size and reserve in one critical section. On success the symbol
    /// counts as holding a position until `release` or `record_close`.
    pub fn try_admit<F>(&self, symbol: &Symbol, now: DateTime<Utc>, size: F) -> Result<EngineResult<SizingDecision>, BlockReason>
    where
        F: FnOnce(&CashSnapshot) -> EngineResult<SizingDecision>,
    {
        let mut state = self.state.lock();
        self.roll_windows(&mut state, now);
        self.checks.fetch_add(1, Ordering::Relaxed);

        if let Err(reason) = self.check(&mut state, symbol, now) {
            *self.blocked.entry(reason).or_insert(0) += 1;
            return Err(reason);
        }

        let snapshot = Self::cash_of(&state);
        let decision = match size(&snapshot) {
            Ok(decision) => decision,
            Err(e) => return Ok(Err(e)),
        };

        state.cash.reserved += decision.reserved_cash;
        state.active.insert(symbol.clone());
        self.admitted.fetch_add(1, Ordering::Relaxed);
        Ok(Ok(decision))
    }

    /// Undo an admission whose entry never filled. Counters are untouched.
    pub fn release(&self, symbol: &Symbol, reserved_cash: f64) {
        let mut state = self.state.lock();
        if state.active.remove(symbol) {
            state.cash.reserved = (state.cash.reserved - reserved_cash).max(0.0);
        }
    }

    /// Book a confirmed close: P&L, loss streak, cooldown, hourly count, kill switch
    pub fn record_close(&self, symbol: &Symbol, reserved_cash: f64, pnl: f64, now: DateTime<Utc>) -> CloseOutcome {
        let mut state = self.state.lock();
        self.roll_windows(&mut state, now);

        if state.active.remove(symbol) {
            state.cash.reserved = (state.cash.reserved - reserved_cash).max(0.0);
        }
        state.cash.equity += pnl;

        let mut outcome = CloseOutcome::default();
        let risk = &mut state.risk;
        risk.daily_pnl += pnl;
        risk.hourly_trade_count += 1;

        if pnl < 0.0 {
            risk.consecutive_losses += 1;
            if risk.consecutive_losses >= self.config.cooldown_after_losses {
                let until = now + self.config.cooldown();
                risk.cooldown_until = Some(until);
                outcome.cooldown_started = Some(until);
                warn!(
                    "⏸️ Cooldown until {} after {} consecutive losses",
                    until, risk.consecutive_losses
                );
            }
        } else {
            risk.consecutive_losses = 0;
        }

        if !risk.kill_switch_engaged && risk.daily_pnl <= self.loss_threshold(risk.day_start_equity) {
            risk.kill_switch_engaged = true;
            warn!(
                "🛑 Daily loss limit hit: P&L {:.2} on start equity {:.2}",
                risk.daily_pnl, risk.day_start_equity
            );
        }

        outcome.daily_pnl = risk.daily_pnl;
        outcome.consecutive_losses = risk.consecutive_losses;
        outcome.kill_switch_engaged = risk.kill_switch_engaged;
        outcome
    }

    pub fn snapshot(&self) -> RiskState {
        self.state.lock().risk.clone()
    }

    pub fn cash(&self) -> CashSnapshot {
        Self::cash_of(&self.state.lock())
    }

    pub fn is_active(&self, symbol: &Symbol) -> bool {
        self.state.lock().active.contains(symbol)
    }

    pub fn active_count(&self) -> usize {
        self.state.lock().active.len()
    }

    pub fn get_statistics(&self) -> RiskStatistics {
        let mut blocked: Vec<(BlockReason, u64)> = self.blocked.iter().map(|e| (*e.key(), *e.value())).collect();
        blocked.sort_by_key(|(reason, _)| *reason);
        RiskStatistics {
            checks: self.checks.load(Ordering::Relaxed),
            admitted: self.admitted.load(Ordering::Relaxed),
            blocked,
        }
    }

    fn loss_threshold(&self, day_start_equity: f64) -> f64 {
        self.config.daily_loss_limit_pct * day_start_equity
    }

    fn cash_of(state: &GateState) -> CashSnapshot {
        CashSnapshot {
            equity: state.cash.equity,
            available_cash: (state.cash.equity - state.cash.reserved).max(0.0),
            reserved_cash: state.cash.reserved,
            open_positions: state.active.len(),
        }
    }

    /// Limits in block-reason order. `hourly_trade_count` counts closed
    /// trades only, so entries admitted while earlier ones are still open can
    /// push the hour past `max_trades_per_hour`; `max_open_positions` bounds
    /// that overshoot.
    fn check(&self, state: &mut GateState, symbol: &Symbol, now: DateTime<Utc>) -> Result<(), BlockReason> {
        let threshold = self.loss_threshold(state.risk.day_start_equity);
        let risk = &mut state.risk;

        if risk.kill_switch_engaged || risk.daily_pnl <= threshold {
            risk.kill_switch_engaged = true;
            return Err(BlockReason::DailyLossLimit);
        }
        if state.active.contains(symbol) {
            return Err(BlockReason::PositionExists);
        }
        if risk.in_cooldown(now) {
            return Err(BlockReason::Cooldown);
        }
        if risk.hourly_trade_count >= self.config.max_trades_per_hour {
            return Err(BlockReason::HourlyLimit);
        }
        if state.active.len() >= self.max_open_positions {
            return Err(BlockReason::MaxOpenPositions);
        }
        Ok(())
    }

    /// Advance the trading day and the hour window to contain `now`
    fn roll_windows(&self, state: &mut GateState, now: DateTime<Utc>) {
        let today = now.date_naive();
        match state.risk.day {
            None => state.risk.day = Some(today),
            Some(day) if today > day => {
                info!(
                    "📅 New trading day {}: resetting daily P&L {:.2}",
                    today, state.risk.daily_pnl
                );
                state.risk.day = Some(today);
                state.risk.daily_pnl = 0.0;
                state.risk.consecutive_losses = 0;
                state.risk.kill_switch_engaged = false;
                state.risk.day_start_equity = state.cash.equity;
            }
            _ => {}
        }

        let hour = Duration::hours(1);
        match state.risk.hour_window_start {
            None => state.risk.hour_window_start = Some(now),
            Some(start) if now >= start + hour => {
                let elapsed_hours = (now - start).num_seconds() / 3600;
                state.risk.hour_window_start = Some(start + Duration::hours(elapsed_hours));
                state.risk.hourly_trade_count = 0;
            }
            _ => {}
        }
    }
}
