//! Entry and exit signal evaluation
//!
//! The evaluator is stateless: it reads the symbol's opening range, its tick
//! history and (for exits) the open position, and returns a decision. All
//! per-symbol state lives with the caller.

use super::opening_range::OpeningRange;
use super::tick_history::TickHistory;
use crate::config::{EntryConfig, ExitConfig};
use crate::ledger::OpenPosition;
use crate::market::{Direction, Tick};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why an entry was not taken
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryRejection {
    RangeNotLocked,
    RangeExpired,
    PositionActive,
    InsufficientHistory,
    LowVolatility,
    WeakDirection,
    NoVolumeSpike,
    OutsideEntryZone,
    SpreadTooWide,
    ShortsDisabled,
}

impl EntryRejection {
    pub fn code(&self) -> &'static str {
        match self {
            EntryRejection::RangeNotLocked => "RANGE_NOT_LOCKED",
            EntryRejection::RangeExpired => "RANGE_EXPIRED",
            EntryRejection::PositionActive => "POSITION_ACTIVE",
            EntryRejection::InsufficientHistory => "INSUFFICIENT_HISTORY",
            EntryRejection::LowVolatility => "LOW_VOLATILITY",
            EntryRejection::WeakDirection => "WEAK_DIRECTION",
            EntryRejection::NoVolumeSpike => "NO_VOLUME_SPIKE",
            EntryRejection::OutsideEntryZone => "OUTSIDE_ENTRY_ZONE",
            EntryRejection::SpreadTooWide => "SPREAD_TOO_WIDE",
            EntryRejection::ShortsDisabled => "SHORTS_DISABLED",
        }
    }
}

impl fmt::Display for EntryRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// A satisfied entry, with the measurements that satisfied it
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntrySignal {
    pub direction: Direction,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
    pub range: OpeningRange,
    pub volatility_pct: f64,
    pub net_move_pct: f64,
    pub streak: u32,
    pub volume_ratio: f64,
    pub zone_ratio: f64,
    pub spread_pct: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub enum EntryDecision {
    Enter(EntrySignal),
    Rejected(EntryRejection),
}

/// Why a position was closed
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitReason {
    StopLoss,
    ProfitTarget,
    RangeBreakout,
    RangeExitZone,
    TimeStop,
    MomentumFailure,
}

impl ExitReason {
    pub fn code(&self) -> &'static str {
        match self {
            ExitReason::StopLoss => "STOP_LOSS",
            ExitReason::ProfitTarget => "PROFIT_TARGET",
            ExitReason::RangeBreakout => "RANGE_BREAKOUT",
            ExitReason::RangeExitZone => "RANGE_EXIT_ZONE",
            ExitReason::TimeStop => "TIME_STOP",
            ExitReason::MomentumFailure => "MOMENTUM_FAILURE",
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExitSignal {
    pub reason: ExitReason,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
    /// Signed move in favour of the position at the trigger price
    pub move_pct: f64,
}

/// Realized P&L for a fill pair
pub fn realized_pnl(direction: Direction, entry_price: f64, exit_price: f64, quantity: f64) -> (f64, f64) {
    let signed_qty = quantity.abs() * direction.multiplier();
    let pnl = (exit_price - entry_price) * signed_qty;
    let basis = entry_price * quantity.abs();
    let pnl_pct = if basis > 0.0 { pnl / basis } else { 0.0 };
    (pnl, pnl_pct)
}

/// Signal evaluator
#[derive(Clone, Debug)]
pub struct SignalEvaluator {
    entry: EntryConfig,
    exit: ExitConfig,
}

impl SignalEvaluator {
    pub fn new(entry: EntryConfig, exit: ExitConfig) -> Self {
        Self { entry, exit }
    }

    /// Ticks needed in history before every entry filter can be measured
    pub fn required_history(&self) -> usize {
        self.entry
            .volatility_window
            .max(self.entry.direction_window + 1)
    }

    /// Check the entry filters in order; the first failing one is reported.
    /// `tick` must already be the latest sample in `history`.
    pub fn evaluate_entry(
        &self,
        tick: &Tick,
        range: Option<&OpeningRange>,
        history: &TickHistory,
        position_active: bool,
    ) -> EntryDecision {
        use EntryDecision::Rejected;

        let range = match range {
            Some(r) if r.is_locked() => r,
            _ => return Rejected(EntryRejection::RangeNotLocked),
        };
        if !range.is_tradeable(tick.timestamp) {
            return Rejected(EntryRejection::RangeExpired);
        }
        if position_active {
            return Rejected(EntryRejection::PositionActive);
        }
        if history.len() < self.required_history() {
            return Rejected(EntryRejection::InsufficientHistory);
        }

        // Volatility
        let volatility_pct = match history.volatility_pct(self.entry.volatility_window) {
            Some(v) if v >= self.entry.min_volatility_pct => v,
            Some(_) => return Rejected(EntryRejection::LowVolatility),
            None => return Rejected(EntryRejection::InsufficientHistory),
        };

        // Direction
        let window = self.entry.direction_window;
        let net_move_pct = match history.net_move_pct(window) {
            Some(m) => m,
            None => return Rejected(EntryRejection::InsufficientHistory),
        };
        let streak = history.direction_streak(window);
        let direction = if net_move_pct > 0.0 {
            Direction::Long
        } else {
            Direction::Short
        };
        let streak_agrees = (streak > 0 && net_move_pct > 0.0) || (streak < 0 && net_move_pct < 0.0);
        if net_move_pct.abs() < self.entry.min_net_move_pct
            || net_move_pct == 0.0
            || !streak_agrees
            || (streak.unsigned_abs() as usize) < self.entry.min_direction_streak
        {
            return Rejected(EntryRejection::WeakDirection);
        }

        // Volume
        let avg_volume = match history.avg_prior_volume(window) {
            Some(v) => v,
            None => return Rejected(EntryRejection::InsufficientHistory),
        };
        let current_volume = tick.volume as f64;
        // Reported against at least one unit so an idle window stays finite
        let volume_ratio = current_volume / avg_volume.max(1.0);
        let spiked = if avg_volume > 0.0 {
            current_volume > avg_volume * self.entry.volume_spike_multiplier
        } else {
            current_volume > 0.0
        };
        if !spiked {
            return Rejected(EntryRejection::NoVolumeSpike);
        }

        // Entry zone, measured from the side the trade is entered against
        let zone_ratio = match direction {
            Direction::Long => range.position_from_low(tick.price),
            Direction::Short => range.position_from_high(tick.price),
        };
        if zone_ratio > self.entry.entry_zone_pct {
            return Rejected(EntryRejection::OutsideEntryZone);
        }

        // Spread
        let spread_pct = tick
            .quoted_spread_pct()
            .or_else(|| history.last_gap_pct())
            .unwrap_or(0.0);
        if spread_pct > self.exit.profit_target_pct * self.entry.max_spread_vs_target {
            return Rejected(EntryRejection::SpreadTooWide);
        }

        if direction == Direction::Short && !self.entry.allow_short {
            return Rejected(EntryRejection::ShortsDisabled);
        }

        EntryDecision::Enter(EntrySignal {
            direction,
            price: tick.price,
            timestamp: tick.timestamp,
            range: range.clone(),
            volatility_pct,
            net_move_pct,
            streak: streak.unsigned_abs(),
            volume_ratio,
            zone_ratio,
            spread_pct,
        })
    }

    /// Check exit triggers in priority order; first match wins.
    /// `last_move` is the price change on the current tick.
    pub fn evaluate_exit(&self, position: &OpenPosition, tick: &Tick, last_move: Option<f64>) -> Option<ExitSignal> {
        let price = tick.price;
        let now = tick.timestamp;
        let direction = position.direction;
        let move_pct = (price - position.entry_price) / position.entry_price * direction.multiplier();

        let signal = |reason| ExitSignal {
            reason,
            price,
            timestamp: now,
            move_pct,
        };

        if move_pct <= -self.exit.stop_loss_pct {
            return Some(signal(ExitReason::StopLoss));
        }
        if move_pct >= self.exit.profit_target_pct {
            return Some(signal(ExitReason::ProfitTarget));
        }

        let range = &position.entry_range;
        let broke_out = match direction {
            Direction::Long => price > range.high,
            Direction::Short => price < range.low,
        };
        if broke_out {
            return Some(signal(ExitReason::RangeBreakout));
        }

        let (zone_ratio, moving_against) = match direction {
            Direction::Long => (range.position_from_low(price), last_move.map_or(false, |m| m < 0.0)),
            Direction::Short => (range.position_from_high(price), last_move.map_or(false, |m| m > 0.0)),
        };
        if zone_ratio >= self.exit.exit_zone_pct && moving_against {
            return Some(signal(ExitReason::RangeExitZone));
        }

        let age = now - position.entry_time;
        if age >= self.exit.max_hold() {
            return Some(signal(ExitReason::TimeStop));
        }
        if age >= self.exit.breakeven_deadline() && move_pct <= 0.0 {
            return Some(signal(ExitReason::TimeStop));
        }

        if position.stall_ticks >= self.exit.flat_ticks_threshold && move_pct <= 0.0 {
            return Some(signal(ExitReason::MomentumFailure));
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::PositionId;
    use crate::market::Symbol;
    use crate::strategy::opening_range::RangePhase;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 14, 30, 0).unwrap()
    }

    fn locked_range(low: f64, high: f64) -> OpeningRange {
        OpeningRange {
            phase: RangePhase::Locked,
            tick_count: 60,
            high,
            low,
            locked_at: Some(t0()),
            valid_until: Some(t0() + Duration::minutes(15)),
        }
    }

    fn entry_config() -> EntryConfig {
        EntryConfig {
            history_capacity: 32,
            volatility_window: 6,
            min_volatility_pct: 0.001,
            direction_window: 4,
            min_direction_streak: 3,
            min_net_move_pct: 0.0005,
            volume_spike_multiplier: 1.5,
            entry_zone_pct: 0.25,
            max_spread_vs_target: 0.5,
            allow_short: true,
        }
    }

    fn exit_config() -> ExitConfig {
        ExitConfig {
            stop_loss_pct: 0.01,
            profit_target_pct: 0.02,
            exit_zone_pct: 0.9,
            max_hold_secs: 300,
            breakeven_deadline_secs: 120,
            flat_ticks_threshold: 3,
        }
    }

    fn feed(prices: &[(f64, u64)]) -> (TickHistory, Tick) {
        let mut history = TickHistory::new(32);
        let mut last = None;
        for (i, (p, v)) in prices.iter().enumerate() {
            let tick = Tick::new("X", *p, *v, t0() + Duration::seconds(i as i64));
            history.push(&tick);
            last = Some(tick);
        }
        (history, last.unwrap())
    }

    fn open_position(direction: Direction, entry: f64, range: OpeningRange) -> OpenPosition {
        OpenPosition {
            id: PositionId::new(Symbol::new("X"), t0()),
            direction,
            quantity: 10.0,
            entry_price: entry,
            entry_time: t0(),
            entry_range: range,
            reserved_cash: 0.0,
            broker_order_id: None,
            last_price: entry,
            stall_ticks: 0,
            exit_attempts: 0,
            exit_in_flight: None,
            last_exit_error: None,
        }
    }

    // Dips to the low of [100, 102] then turns up on rising volume
    fn long_setup() -> Vec<(f64, u64)> {
        vec![
            (101.0, 100),
            (100.6, 100),
            (100.3, 100),
            (100.05, 100),
            (100.1, 100),
            (100.15, 100),
            (100.2, 100),
            (100.25, 400),
        ]
    }

    #[test]
    fn test_enter_long_on_confirmed_pullback() {
        let evaluator = SignalEvaluator::new(entry_config(), exit_config());
        let (history, tick) = feed(&long_setup());
        let range = locked_range(100.0, 102.0);
        match evaluator.evaluate_entry(&tick, Some(&range), &history, false) {
            EntryDecision::Enter(signal) => {
                assert_eq!(signal.direction, Direction::Long);
                assert_eq!(signal.price, 100.25);
                assert!(signal.zone_ratio <= 0.25);
                assert!(signal.streak >= 3);
            }
            other => panic!("expected entry, got {:?}", other),
        }
    }

    #[test]
    fn test_entry_rejections_in_order() {
        let evaluator = SignalEvaluator::new(entry_config(), exit_config());
        let (history, tick) = feed(&long_setup());
        let range = locked_range(100.0, 102.0);

        let mut building = range.clone();
        building.phase = RangePhase::Building;
        assert_eq!(
            evaluator.evaluate_entry(&tick, Some(&building), &history, false),
            EntryDecision::Rejected(EntryRejection::RangeNotLocked)
        );
        assert_eq!(
            evaluator.evaluate_entry(&tick, None, &history, false),
            EntryDecision::Rejected(EntryRejection::RangeNotLocked)
        );

        let mut expired = range.clone();
        expired.valid_until = Some(t0());
        assert_eq!(
            evaluator.evaluate_entry(&tick, Some(&expired), &history, false),
            EntryDecision::Rejected(EntryRejection::RangeExpired)
        );

        assert_eq!(
            evaluator.evaluate_entry(&tick, Some(&range), &history, true),
            EntryDecision::Rejected(EntryRejection::PositionActive)
        );

        let (short_history, short_tick) = feed(&long_setup()[..3]);
        assert_eq!(
            evaluator.evaluate_entry(&short_tick, Some(&range), &short_history, false),
            EntryDecision::Rejected(EntryRejection::InsufficientHistory)
        );
    }

    #[test]
    fn test_flat_market_rejected() {
        let evaluator = SignalEvaluator::new(entry_config(), exit_config());
        let flat: Vec<(f64, u64)> = (0..8).map(|_| (100.0, 100)).collect();
        let (history, tick) = feed(&flat);
        assert_eq!(
            evaluator.evaluate_entry(&tick, Some(&locked_range(100.0, 102.0)), &history, false),
            EntryDecision::Rejected(EntryRejection::LowVolatility)
        );
    }

    #[test]
    fn test_no_volume_spike_rejected() {
        let evaluator = SignalEvaluator::new(entry_config(), exit_config());
        let mut prices = long_setup();
        prices.last_mut().unwrap().1 = 120;
        let (history, tick) = feed(&prices);
        assert_eq!(
            evaluator.evaluate_entry(&tick, Some(&locked_range(100.0, 102.0)), &history, false),
            EntryDecision::Rejected(EntryRejection::NoVolumeSpike)
        );
    }

    #[test]
    fn test_volume_must_exceed_threshold() {
        let evaluator = SignalEvaluator::new(entry_config(), exit_config());
        let range = locked_range(100.0, 102.0);
        let mut prices = long_setup();

        // Prior average 100 x 1.5
        prices.last_mut().unwrap().1 = 150;
        let (history, tick) = feed(&prices);
        assert_eq!(
            evaluator.evaluate_entry(&tick, Some(&range), &history, false),
            EntryDecision::Rejected(EntryRejection::NoVolumeSpike)
        );

        prices.last_mut().unwrap().1 = 151;
        let (history, tick) = feed(&prices);
        assert!(matches!(
            evaluator.evaluate_entry(&tick, Some(&range), &history, false),
            EntryDecision::Enter(_)
        ));
    }

    #[test]
    fn test_streak_counts_moves_inside_window() {
        let evaluator = SignalEvaluator::new(entry_config(), exit_config());
        let range = locked_range(100.0, 102.0);
        let (history, tick) = feed(&long_setup());
        // Four prices in the window give three moves
        assert_eq!(history.direction_streak(4), 3);

        let strict = SignalEvaluator::new(
            EntryConfig {
                min_direction_streak: 4,
                ..entry_config()
            },
            exit_config(),
        );
        assert!(matches!(
            evaluator.evaluate_entry(&tick, Some(&range), &history, false),
            EntryDecision::Enter(_)
        ));
        assert_eq!(
            strict.evaluate_entry(&tick, Some(&range), &history, false),
            EntryDecision::Rejected(EntryRejection::WeakDirection)
        );
    }

    #[test]
    fn test_chasing_the_high_rejected() {
        let evaluator = SignalEvaluator::new(entry_config(), exit_config());
        let (history, tick) = feed(&long_setup());
        // Same move, but sitting in the upper half of a tighter range
        assert_eq!(
            evaluator.evaluate_entry(&tick, Some(&locked_range(99.5, 100.5)), &history, false),
            EntryDecision::Rejected(EntryRejection::OutsideEntryZone)
        );
    }

    #[test]
    fn test_wide_spread_rejected() {
        let evaluator = SignalEvaluator::new(entry_config(), exit_config());
        let (history, tick) = feed(&long_setup());
        let tick = tick.with_quote(99.0, 101.5);
        assert_eq!(
            evaluator.evaluate_entry(&tick, Some(&locked_range(100.0, 102.0)), &history, false),
            EntryDecision::Rejected(EntryRejection::SpreadTooWide)
        );
    }

    #[test]
    fn test_short_entry_respects_switch() {
        let mut config = entry_config();
        let down: Vec<(f64, u64)> = long_setup()
            .into_iter()
            .map(|(p, v)| (202.0 - p, v))
            .collect();
        let (history, tick) = feed(&down);
        let range = locked_range(100.0, 102.0);

        let evaluator = SignalEvaluator::new(config.clone(), exit_config());
        match evaluator.evaluate_entry(&tick, Some(&range), &history, false) {
            EntryDecision::Enter(signal) => assert_eq!(signal.direction, Direction::Short),
            other => panic!("expected short entry, got {:?}", other),
        }

        config.allow_short = false;
        let evaluator = SignalEvaluator::new(config, exit_config());
        assert_eq!(
            evaluator.evaluate_entry(&tick, Some(&range), &history, false),
            EntryDecision::Rejected(EntryRejection::ShortsDisabled)
        );
    }

    #[test]
    fn test_exit_priority_stop_before_breakout() {
        let evaluator = SignalEvaluator::new(entry_config(), exit_config());
        let position = open_position(Direction::Short, 100.0, locked_range(99.0, 101.0));
        // Above the range high: adverse for a short, so the stop wins
        let tick = Tick::new("X", 102.0, 1, t0() + Duration::seconds(1));
        let exit = evaluator.evaluate_exit(&position, &tick, Some(2.0)).unwrap();
        assert_eq!(exit.reason, ExitReason::StopLoss);
    }

    #[test]
    fn test_breakout_beyond_range_high() {
        let mut exit = exit_config();
        exit.profit_target_pct = 0.15;
        let evaluator = SignalEvaluator::new(entry_config(), exit);
        let position = open_position(Direction::Long, 184.0, locked_range(184.0, 198.0));
        // Still rising, so the zone check alone would never fire
        let tick = Tick::new("X", 202.0, 1, t0() + Duration::seconds(1));
        let signal = evaluator.evaluate_exit(&position, &tick, Some(1.0)).unwrap();
        assert_eq!(signal.reason, ExitReason::RangeBreakout);
    }

    #[test]
    fn test_exit_zone_needs_reversal() {
        let mut exit = exit_config();
        exit.profit_target_pct = 0.15;
        let evaluator = SignalEvaluator::new(entry_config(), exit);
        let position = open_position(Direction::Long, 184.0, locked_range(184.0, 198.0));
        let tick = Tick::new("X", 197.0, 1, t0() + Duration::seconds(1));
        assert!(evaluator.evaluate_exit(&position, &tick, Some(0.5)).is_none());
        let signal = evaluator.evaluate_exit(&position, &tick, Some(-0.5)).unwrap();
        assert_eq!(signal.reason, ExitReason::RangeExitZone);
    }

    #[test]
    fn test_time_stops() {
        let evaluator = SignalEvaluator::new(entry_config(), exit_config());
        let position = open_position(Direction::Long, 100.0, locked_range(99.0, 101.0));

        let early_loser = Tick::new("X", 99.99, 1, t0() + Duration::seconds(120));
        assert_eq!(
            evaluator.evaluate_exit(&position, &early_loser, Some(0.0)).unwrap().reason,
            ExitReason::TimeStop
        );

        let early_winner = Tick::new("X", 100.01, 1, t0() + Duration::seconds(120));
        assert!(evaluator.evaluate_exit(&position, &early_winner, Some(0.01)).is_none());

        let too_old = Tick::new("X", 100.01, 1, t0() + Duration::seconds(300));
        assert_eq!(
            evaluator.evaluate_exit(&position, &too_old, Some(0.01)).unwrap().reason,
            ExitReason::TimeStop
        );
    }

    #[test]
    fn test_momentum_failure() {
        let evaluator = SignalEvaluator::new(entry_config(), exit_config());
        let mut position = open_position(Direction::Long, 100.0, locked_range(99.0, 101.0));
        position.stall_ticks = 3;
        let tick = Tick::new("X", 100.0, 1, t0() + Duration::seconds(5));
        assert_eq!(
            evaluator.evaluate_exit(&position, &tick, Some(0.0)).unwrap().reason,
            ExitReason::MomentumFailure
        );

        // Progress toward target suppresses it
        let tick = Tick::new("X", 100.05, 1, t0() + Duration::seconds(5));
        assert!(evaluator.evaluate_exit(&position, &tick, Some(0.0)).is_none());
    }

    #[test]
    fn test_realized_pnl() {
        assert_eq!(realized_pnl(Direction::Long, 100.0, 100.0, 10.0), (0.0, 0.0));
        let (pnl, pct) = realized_pnl(Direction::Short, 100.0, 98.0, 10.0);
        assert_eq!(pnl, 20.0);
        assert!((pct - 0.02).abs() < 1e-12);
        let (pnl, _) = realized_pnl(Direction::Long, 100.0, 98.0, 10.0);
        assert_eq!(pnl, -20.0);
    }
}
