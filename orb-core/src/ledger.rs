//! Position lifecycle ledger
//!
//! ```text
//! PENDING --fill--> OPEN --exit fill--> CLOSED
//!    |                |
//!    +--reject/timeout+--(exit attempts exhausted)--> ERROR
//! ```
//!
//! A failed exit leaves the position OPEN so a later tick can retry it; only
//! once `max_exit_attempts` have failed does it move to ERROR. CLOSED and ERROR
//! records are terminal and move to the audit history.

use crate::errors::{EngineError, EngineResult};
use crate::market::{Direction, Symbol};
use crate::risk::{CloseOutcome, RiskGate};
use crate::strategy::{realized_pnl, ExitReason, ExitSignal, OpeningRange, OpeningRangeTracker};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Position identity: symbol plus the time the entry was decided
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PositionId {
    pub symbol: Symbol,
    pub opened_at: DateTime<Utc>,
}

impl PositionId {
    pub fn new(symbol: Symbol, opened_at: DateTime<Utc>) -> Self {
        Self { symbol, opened_at }
    }
}

impl fmt::Display for PositionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.symbol, self.opened_at.timestamp_millis())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingPosition {
    pub id: PositionId,
    pub direction: Direction,
    pub quantity: f64,
    pub requested_price: f64,
    pub reserved_cash: f64,
    pub entry_range: OpeningRange,
    pub client_order_id: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OpenPosition {
    pub id: PositionId,
    pub direction: Direction,
    pub quantity: f64,
    pub entry_price: f64,
    pub entry_time: DateTime<Utc>,
    /// Locked range the entry was taken against
    pub entry_range: OpeningRange,
    pub reserved_cash: f64,
    pub broker_order_id: Option<String>,
    pub last_price: f64,
    /// Consecutive ticks without favourable movement
    pub stall_ticks: u32,
    pub exit_attempts: u32,
    pub exit_in_flight: Option<ExitSignal>,
    pub last_exit_error: Option<String>,
}

impl OpenPosition {
    pub fn unrealized_pnl(&self, price: f64) -> f64 {
        realized_pnl(self.direction, self.entry_price, price, self.quantity).0
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClosedPosition {
    pub id: PositionId,
    pub direction: Direction,
    pub quantity: f64,
    pub entry_price: f64,
    pub entry_time: DateTime<Utc>,
    pub exit_price: f64,
    pub exit_time: DateTime<Utc>,
    pub exit_reason: ExitReason,
    pub pnl: f64,
    pub pnl_pct: f64,
    pub broker_order_id: Option<String>,
    pub exit_order_id: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FailedStage {
    Entry,
    Exit,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErroredPosition {
    pub id: PositionId,
    pub direction: Direction,
    pub quantity: f64,
    /// Known only if the entry filled
    pub entry_price: Option<f64>,
    pub stage: FailedStage,
    pub failed_at: DateTime<Utc>,
    pub error_message: String,
    pub broker_order_id: Option<String>,
}

/// A position, tagged by status
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "UPPERCASE")]
pub enum Position {
    Pending(PendingPosition),
    Open(OpenPosition),
    Closed(ClosedPosition),
    Error(ErroredPosition),
}

impl Position {
    pub fn id(&self) -> &PositionId {
        match self {
            Position::Pending(p) => &p.id,
            Position::Open(p) => &p.id,
            Position::Closed(p) => &p.id,
            Position::Error(p) => &p.id,
        }
    }

    pub fn status(&self) -> &'static str {
        match self {
            Position::Pending(_) => "PENDING",
            Position::Open(_) => "OPEN",
            Position::Closed(_) => "CLOSED",
            Position::Error(_) => "ERROR",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Position::Pending(_) | Position::Open(_))
    }
}

/// Result of a failed exit
#[derive(Clone, Debug, PartialEq)]
pub enum ExitFailure {
    /// Still OPEN, retried on a later tick
    Retry(OpenPosition),
    /// Attempts exhausted, moved to ERROR
    Abandoned(ErroredPosition),
}

/// Position statistics
#[derive(Default, Clone, Debug, Serialize, Deserialize)]
pub struct PositionStatistics {
    pub total_opened: u64,
    pub total_closed: u64,
    pub total_errors: u64,
    pub winning_positions: u64,
    pub losing_positions: u64,
    pub win_rate: f64,
    pub realized_pnl: f64,
    pub largest_win: f64,
    pub largest_loss: f64,
}

/// Position ledger
pub struct PositionLedger {
    active: DashMap<Symbol, Position>,
    history: RwLock<Vec<Position>>,
    gate: Arc<RiskGate>,
    tracker: Arc<OpeningRangeTracker>,
    max_exit_attempts: u32,
    statistics: RwLock<PositionStatistics>,
}

impl PositionLedger {
    pub fn new(gate: Arc<RiskGate>, tracker: Arc<OpeningRangeTracker>, max_exit_attempts: u32) -> Self {
        Self {
            active: DashMap::new(),
            history: RwLock::new(Vec::new()),
            gate,
            tracker,
            max_exit_attempts: max_exit_attempts.max(1),
            statistics: RwLock::new(PositionStatistics::default()),
        }
    }

    /// Record an admitted entry as PENDING
    pub fn open_pending(&self, pending: PendingPosition) -> EngineResult<()> {
        match self.active.entry(pending.id.symbol.clone()) {
            Entry::Occupied(existing) => Err(EngineError::InvariantViolation(format!(
                "{} already has a {} position",
                existing.key(),
                existing.get().status()
            ))),
            Entry::Vacant(slot) => {
                slot.insert(Position::Pending(pending));
                self.statistics.write().total_opened += 1;
                Ok(())
            }
        }
    }

    /// PENDING -> OPEN
    pub fn confirm_entry(
        &self,
        symbol: &Symbol,
        fill_price: f64,
        fill_quantity: f64,
        fill_time: DateTime<Utc>,
        broker_order_id: Option<String>,
    ) -> EngineResult<OpenPosition> {
        let mut slot = self
            .active
            .get_mut(symbol)
            .ok_or_else(|| EngineError::UnknownPosition(symbol.to_string()))?;

        let pending = match slot.value() {
            Position::Pending(p) => p.clone(),
            other => {
                return Err(EngineError::InvalidTransition {
                    symbol: symbol.clone(),
                    from: other.status(),
                    to: "OPEN",
                })
            }
        };

        let quantity = if fill_quantity > 0.0 { fill_quantity } else { pending.quantity };
        let open = OpenPosition {
            id: pending.id,
            direction: pending.direction,
            quantity,
            entry_price: fill_price,
            entry_time: fill_time,
            entry_range: pending.entry_range,
            reserved_cash: pending.reserved_cash,
            broker_order_id,
            last_price: fill_price,
            stall_ticks: 0,
            exit_attempts: 0,
            exit_in_flight: None,
            last_exit_error: None,
        };
        *slot.value_mut() = Position::Open(open.clone());
        Ok(open)
    }

    /// PENDING -> ERROR. Releases the gate reservation without touching counters.
    pub fn fail_entry(&self, symbol: &Symbol, message: impl Into<String>, now: DateTime<Utc>) -> EngineResult<ErroredPosition> {
        let pending = match self.active.remove(symbol) {
            Some((_, Position::Pending(p))) => p,
            Some((key, other)) => {
                let from = other.status();
                self.active.insert(key, other);
                return Err(EngineError::InvalidTransition {
                    symbol: symbol.clone(),
                    from,
                    to: "ERROR",
                });
            }
            None => return Err(EngineError::UnknownPosition(symbol.to_string())),
        };

        self.gate.release(symbol, pending.reserved_cash);

        let errored = ErroredPosition {
            id: pending.id,
            direction: pending.direction,
            quantity: pending.quantity,
            entry_price: None,
            stage: FailedStage::Entry,
            failed_at: now,
            error_message: message.into(),
            broker_order_id: None,
        };
        self.archive(Position::Error(errored.clone()));
        Ok(errored)
    }

    /// Mark an exit as dispatched. Fails if one is already in flight.
    pub fn begin_exit(&self, symbol: &Symbol, signal: ExitSignal) -> EngineResult<OpenPosition> {
        let mut slot = self
            .active
            .get_mut(symbol)
            .ok_or_else(|| EngineError::UnknownPosition(symbol.to_string()))?;
        match slot.value_mut() {
            Position::Open(open) if open.exit_in_flight.is_none() => {
                open.exit_in_flight = Some(signal);
                open.exit_attempts += 1;
                Ok(open.clone())
            }
            Position::Open(_) => Err(EngineError::InvalidTransition {
                symbol: symbol.clone(),
                from: "EXITING",
                to: "EXITING",
            }),
            other => Err(EngineError::InvalidTransition {
                symbol: symbol.clone(),
                from: other.status(),
                to: "EXITING",
            }),
        }
    }

    /// OPEN -> CLOSED. Books P&L with the gate and resets the symbol's range.
    pub fn confirm_exit(
        &self,
        symbol: &Symbol,
        fill_price: f64,
        fill_time: DateTime<Utc>,
        exit_order_id: Option<String>,
    ) -> EngineResult<(ClosedPosition, CloseOutcome)> {
        let open = self.take_open_for_exit(symbol, "CLOSED")?;
        let reason = open
            .exit_in_flight
            .as_ref()
            .map(|s| s.reason)
            .ok_or_else(|| EngineError::InvariantViolation(format!("{} closed without an exit in flight", symbol)))?;

        let (pnl, pnl_pct) = realized_pnl(open.direction, open.entry_price, fill_price, open.quantity);
        let closed = ClosedPosition {
            id: open.id,
            direction: open.direction,
            quantity: open.quantity,
            entry_price: open.entry_price,
            entry_time: open.entry_time,
            exit_price: fill_price,
            exit_time: fill_time,
            exit_reason: reason,
            pnl,
            pnl_pct,
            broker_order_id: open.broker_order_id,
            exit_order_id,
        };

        let outcome = self.gate.record_close(symbol, open.reserved_cash, pnl, fill_time);
        self.tracker.on_position_closed(symbol, fill_price);

        {
            let mut stats = self.statistics.write();
            stats.total_closed += 1;
            stats.realized_pnl += pnl;
            if pnl > 0.0 {
                stats.winning_positions += 1;
                stats.largest_win = stats.largest_win.max(pnl);
            } else if pnl < 0.0 {
                stats.losing_positions += 1;
                stats.largest_loss = stats.largest_loss.min(pnl);
            }
            stats.win_rate = stats.winning_positions as f64 / stats.total_closed as f64 * 100.0;
        }

        self.archive(Position::Closed(closed.clone()));
        Ok((closed, outcome))
    }

    /// Exit rejected or timed out: back to plain OPEN, or ERROR once attempts run out
    pub fn fail_exit(&self, symbol: &Symbol, message: impl Into<String>, now: DateTime<Utc>) -> EngineResult<ExitFailure> {
        let message = message.into();
        {
            let mut slot = self
                .active
                .get_mut(symbol)
                .ok_or_else(|| EngineError::UnknownPosition(symbol.to_string()))?;
            match slot.value_mut() {
                Position::Open(open) if open.exit_in_flight.is_some() => {
                    if open.exit_attempts < self.max_exit_attempts {
                        open.exit_in_flight = None;
                        open.last_exit_error = Some(message);
                        return Ok(ExitFailure::Retry(open.clone()));
                    }
                }
                other => {
                    return Err(EngineError::InvalidTransition {
                        symbol: symbol.clone(),
                        from: other.status(),
                        to: "OPEN",
                    })
                }
            }
        }

        let open = self.take_open_for_exit(symbol, "ERROR")?;
        self.gate.release(symbol, open.reserved_cash);
        let errored = ErroredPosition {
            id: open.id,
            direction: open.direction,
            quantity: open.quantity,
            entry_price: Some(open.entry_price),
            stage: FailedStage::Exit,
            failed_at: now,
            error_message: message,
            broker_order_id: open.broker_order_id,
        };
        self.archive(Position::Error(errored.clone()));
        Ok(ExitFailure::Abandoned(errored))
    }

    /// Track the latest price for an OPEN position. Returns the updated view.
    pub fn observe_tick(&self, symbol: &Symbol, price: f64) -> Option<OpenPosition> {
        let mut slot = self.active.get_mut(symbol)?;
        match slot.value_mut() {
            Position::Open(open) => {
                let favourable = (price - open.last_price) * open.direction.multiplier();
                if favourable > 0.0 {
                    open.stall_ticks = 0;
                } else {
                    open.stall_ticks += 1;
                }
                open.last_price = price;
                Some(open.clone())
            }
            _ => None,
        }
    }

    pub fn get(&self, symbol: &Symbol) -> Option<Position> {
        self.active.get(symbol).map(|p| p.clone())
    }

    pub fn has_active(&self, symbol: &Symbol) -> bool {
        self.active.contains_key(symbol)
    }

    pub fn active_positions(&self) -> Vec<Position> {
        self.active.iter().map(|p| p.clone()).collect()
    }

    pub fn open_positions(&self) -> Vec<OpenPosition> {
        self.active
            .iter()
            .filter_map(|p| match p.value() {
                Position::Open(open) => Some(open.clone()),
                _ => None,
            })
            .collect()
    }

    /// Terminal positions in the order they finished
    pub fn history(&self) -> Vec<Position> {
        self.history.read().clone()
    }

    pub fn get_statistics(&self) -> PositionStatistics {
        self.statistics.read().clone()
    }

    fn take_open_for_exit(&self, symbol: &Symbol, to: &'static str) -> EngineResult<OpenPosition> {
        match self.active.remove(symbol) {
            Some((_, Position::Open(open))) if open.exit_in_flight.is_some() => Ok(open),
            Some((key, other)) => {
                let from = match &other {
                    Position::Open(_) => "OPEN",
                    p => p.status(),
                };
                self.active.insert(key, other);
                Err(EngineError::InvalidTransition {
                    symbol: symbol.clone(),
                    from,
                    to,
                })
            }
            None => Err(EngineError::UnknownPosition(symbol.to_string())),
        }
    }

    fn archive(&self, position: Position) {
        if matches!(position, Position::Error(_)) {
            self.statistics.write().total_errors += 1;
        }
        self.history.write().push(position);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RangeConfig, RiskConfig, SizingPolicy};
    use crate::risk::PositionSizer;
    use crate::strategy::{RangePhase, RangeUpdate};
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 14, 30, 0).unwrap()
    }

    struct Fixture {
        gate: Arc<RiskGate>,
        tracker: Arc<OpeningRangeTracker>,
        ledger: PositionLedger,
    }

    fn fixture(max_exit_attempts: u32) -> Fixture {
        let gate = Arc::new(RiskGate::new(RiskConfig::default(), 3));
        let tracker = Arc::new(OpeningRangeTracker::new(RangeConfig { lock_ticks: 2, validity_secs: 900 }));
        let ledger = PositionLedger::new(gate.clone(), tracker.clone(), max_exit_attempts);
        Fixture { gate, tracker, ledger }
    }

    fn admit_pending(f: &Fixture, symbol: &str, direction: Direction, price: f64) {
        let sym = Symbol::new(symbol);
        f.tracker.on_tick(&sym, price, t0()).unwrap();
        let range = match f.tracker.on_tick(&sym, price + 10.0, t0()).unwrap() {
            RangeUpdate::Locked(r) => r,
            other => panic!("range not locked: {:?}", other),
        };
        let sizer = PositionSizer::new(SizingPolicy::default());
        let decision = f
            .gate
            .try_admit(&sym, t0(), |cash| sizer.size(cash, price, None))
            .unwrap()
            .unwrap();
        f.ledger
            .open_pending(PendingPosition {
                id: PositionId::new(sym, t0()),
                direction,
                quantity: decision.quantity,
                requested_price: price,
                reserved_cash: decision.reserved_cash,
                entry_range: range,
                client_order_id: "ORD_1".into(),
            })
            .unwrap();
    }

    fn exit_signal(reason: ExitReason, price: f64) -> ExitSignal {
        ExitSignal { reason, price, timestamp: t0(), move_pct: 0.0 }
    }

    #[test]
    fn test_full_lifecycle_resets_range() {
        let f = fixture(3);
        let sym = Symbol::new("AAPL");
        admit_pending(&f, "AAPL", Direction::Long, 100.0);
        assert_eq!(f.ledger.get(&sym).unwrap().status(), "PENDING");

        let open = f.ledger.confirm_entry(&sym, 100.0, 10.0, t0(), Some("B1".into())).unwrap();
        assert_eq!(open.quantity, 10.0);
        assert_eq!(f.ledger.get(&sym).unwrap().status(), "OPEN");

        f.ledger.begin_exit(&sym, exit_signal(ExitReason::ProfitTarget, 102.0)).unwrap();
        let exit_time = t0() + Duration::seconds(30);
        let (closed, outcome) = f.ledger.confirm_exit(&sym, 102.0, exit_time, None).unwrap();
        assert_eq!(closed.pnl, 20.0);
        assert!((closed.pnl_pct - 0.02).abs() < 1e-12);
        assert_eq!(closed.exit_reason, ExitReason::ProfitTarget);
        assert_eq!(outcome.daily_pnl, 20.0);

        assert!(!f.ledger.has_active(&sym));
        assert!(!f.gate.is_active(&sym));
        assert_eq!(f.gate.snapshot().hourly_trade_count, 1);

        let range = f.tracker.get(&sym).unwrap();
        assert_eq!(range.phase, RangePhase::Building);
        assert_eq!(range.tick_count, 1);
        assert_eq!(range.high, 102.0);
        assert_eq!(range.low, 102.0);

        let stats = f.ledger.get_statistics();
        assert_eq!(stats.total_closed, 1);
        assert_eq!(stats.winning_positions, 1);
        assert_eq!(f.ledger.history().len(), 1);
    }

    #[test]
    fn test_failed_entry_touches_no_counters() {
        let f = fixture(3);
        let sym = Symbol::new("AAPL");
        admit_pending(&f, "AAPL", Direction::Long, 100.0);
        let errored = f.ledger.fail_entry(&sym, "timeout", t0()).unwrap();
        assert_eq!(errored.stage, FailedStage::Entry);

        let risk = f.gate.snapshot();
        assert_eq!(risk.hourly_trade_count, 0);
        assert_eq!(risk.daily_pnl, 0.0);
        assert!(!f.gate.is_active(&sym));
        assert_eq!(f.gate.cash().reserved_cash, 0.0);
        // ERROR does not count as an existing position
        assert!(f.gate.can_enter(&sym, t0()).is_ok());
        assert!(matches!(f.ledger.history()[0], Position::Error(_)));
    }

    #[test]
    fn test_failed_exit_retries_then_errors() {
        let f = fixture(2);
        let sym = Symbol::new("AAPL");
        admit_pending(&f, "AAPL", Direction::Short, 50.0);
        f.ledger.confirm_entry(&sym, 50.0, 0.0, t0(), None).unwrap();

        f.ledger.begin_exit(&sym, exit_signal(ExitReason::StopLoss, 51.0)).unwrap();
        // A second dispatch while one is in flight is refused
        assert!(f.ledger.begin_exit(&sym, exit_signal(ExitReason::StopLoss, 51.0)).is_err());

        match f.ledger.fail_exit(&sym, "rejected", t0()).unwrap() {
            ExitFailure::Retry(open) => {
                assert!(open.exit_in_flight.is_none());
                assert_eq!(open.last_exit_error.as_deref(), Some("rejected"));
            }
            other => panic!("expected retry, got {:?}", other),
        }
        assert_eq!(f.ledger.get(&sym).unwrap().status(), "OPEN");
        assert_eq!(f.gate.snapshot().hourly_trade_count, 0);

        f.ledger.begin_exit(&sym, exit_signal(ExitReason::StopLoss, 51.0)).unwrap();
        match f.ledger.fail_exit(&sym, "rejected again", t0()).unwrap() {
            ExitFailure::Abandoned(errored) => {
                assert_eq!(errored.stage, FailedStage::Exit);
                assert_eq!(errored.entry_price, Some(50.0));
            }
            other => panic!("expected abandon, got {:?}", other),
        }
        assert!(!f.ledger.has_active(&sym));
        assert!(!f.gate.is_active(&sym));
    }

    #[test]
    fn test_invalid_transitions() {
        let f = fixture(3);
        let sym = Symbol::new("AAPL");
        assert!(matches!(
            f.ledger.confirm_entry(&sym, 1.0, 1.0, t0(), None),
            Err(EngineError::UnknownPosition(_))
        ));

        admit_pending(&f, "AAPL", Direction::Long, 100.0);
        assert!(matches!(
            f.ledger.confirm_exit(&sym, 100.0, t0(), None),
            Err(EngineError::InvalidTransition { .. })
        ));
        // Pending position still there after the refused transition
        assert_eq!(f.ledger.get(&sym).unwrap().status(), "PENDING");

        f.ledger.confirm_entry(&sym, 100.0, 1.0, t0(), None).unwrap();
        assert!(f.ledger.fail_entry(&sym, "late", t0()).is_err());
        assert_eq!(f.ledger.get(&sym).unwrap().status(), "OPEN");
    }

    #[test]
    fn test_round_trip_at_same_price_is_flat() {
        let f = fixture(3);
        let sym = Symbol::new("AAPL");
        admit_pending(&f, "AAPL", Direction::Long, 100.0);
        f.ledger.confirm_entry(&sym, 100.0, 5.0, t0(), None).unwrap();
        f.ledger.begin_exit(&sym, exit_signal(ExitReason::TimeStop, 100.0)).unwrap();
        let (closed, _) = f.ledger.confirm_exit(&sym, 100.0, t0(), None).unwrap();
        assert_eq!(closed.pnl, 0.0);
        assert_eq!(closed.pnl_pct, 0.0);
    }

    #[test]
    fn test_observe_tick_counts_stalls() {
        let f = fixture(3);
        let sym = Symbol::new("AAPL");
        admit_pending(&f, "AAPL", Direction::Long, 100.0);
        f.ledger.confirm_entry(&sym, 100.0, 1.0, t0(), None).unwrap();

        assert_eq!(f.ledger.observe_tick(&sym, 100.0).unwrap().stall_ticks, 1);
        assert_eq!(f.ledger.observe_tick(&sym, 99.9).unwrap().stall_ticks, 2);
        assert_eq!(f.ledger.observe_tick(&sym, 100.1).unwrap().stall_ticks, 0);
        assert!(f.ledger.observe_tick(&Symbol::new("NONE"), 1.0).is_none());
    }

    #[test]
    fn test_position_serializes_with_status_tag() {
        let f = fixture(3);
        admit_pending(&f, "AAPL", Direction::Long, 100.0);
        let json = serde_json::to_value(f.ledger.get(&Symbol::new("AAPL")).unwrap()).unwrap();
        assert_eq!(json["status"], "PENDING");
        assert_eq!(json["direction"], "LONG");
    }
}
