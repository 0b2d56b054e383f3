//! Per-symbol opening range state machine
//!
//! A range starts BUILDING on the first tick for a symbol, widens its high/low
//! as ticks arrive, and LOCKS once it has seen `lock_ticks` ticks. A locked
//! range stays in place until a position on that symbol closes, at which point
//! it restarts from the exit price.

use crate::config::RangeConfig;
use crate::errors::{EngineError, EngineResult};
use crate::market::Symbol;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RangePhase {
    Building,
    Locked,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OpeningRange {
    pub phase: RangePhase,
    pub tick_count: u32,
    pub high: f64,
    pub low: f64,
    pub locked_at: Option<DateTime<Utc>>,
    pub valid_until: Option<DateTime<Utc>>,
}

impl OpeningRange {
    fn seeded(price: f64) -> Self {
        Self {
            phase: RangePhase::Building,
            tick_count: 1,
            high: price,
            low: price,
            locked_at: None,
            valid_until: None,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.phase == RangePhase::Locked
    }

    /// Locked and not yet past its validity window
    pub fn is_tradeable(&self, now: DateTime<Utc>) -> bool {
        match (self.phase, self.valid_until) {
            (RangePhase::Locked, Some(until)) => now <= until,
            _ => false,
        }
    }

    pub fn width(&self) -> f64 {
        self.high - self.low
    }

    pub fn midpoint(&self) -> f64 {
        (self.high + self.low) / 2.0
    }

    /// Position of `price` inside the range measured from the low, clamped to [0, 1].
    /// A zero-width range reports 0.
    pub fn position_from_low(&self, price: f64) -> f64 {
        let width = self.width();
        if width <= 0.0 {
            return 0.0;
        }
        ((price - self.low) / width).clamp(0.0, 1.0)
    }

    /// Position of `price` measured down from the high, clamped to [0, 1]
    pub fn position_from_high(&self, price: f64) -> f64 {
        let width = self.width();
        if width <= 0.0 {
            return 0.0;
        }
        ((self.high - price) / width).clamp(0.0, 1.0)
    }

    fn check_invariant(&self, symbol: &Symbol) -> EngineResult<()> {
        debug_assert!(
            self.high >= self.low,
            "range for {} has high {} below low {}",
            symbol,
            self.high,
            self.low
        );
        if self.high >= self.low {
            Ok(())
        } else {
            Err(EngineError::InvariantViolation(format!(
                "range for {} has high {} below low {}",
                symbol, self.high, self.low
            )))
        }
    }
}

/// What a tick did to a range
#[derive(Clone, Debug, PartialEq)]
pub enum RangeUpdate {
    Started(OpeningRange),
    Extended(OpeningRange),
    Locked(OpeningRange),
    Unchanged(OpeningRange),
}

impl RangeUpdate {
    pub fn range(&self) -> &OpeningRange {
        match self {
            RangeUpdate::Started(r)
            | RangeUpdate::Extended(r)
            | RangeUpdate::Locked(r)
            | RangeUpdate::Unchanged(r) => r,
        }
    }
}

/// Opening range tracker
pub struct OpeningRangeTracker {
    config: RangeConfig,
    ranges: DashMap<Symbol, OpeningRange>,
}

impl OpeningRangeTracker {
    pub fn new(config: RangeConfig) -> Self {
        Self {
            config,
            ranges: DashMap::new(),
        }
    }

    /// Feed a tick into the symbol's range
    pub fn on_tick(&self, symbol: &Symbol, price: f64, now: DateTime<Utc>) -> EngineResult<RangeUpdate> {
        let mut entry = match self.ranges.entry(symbol.clone()) {
            Entry::Occupied(entry) => entry,
            Entry::Vacant(vacant) => {
                let mut range = OpeningRange::seeded(price);
                if self.config.lock_ticks <= 1 {
                    self.lock(&mut range, now);
                    vacant.insert(range.clone());
                    return Ok(RangeUpdate::Locked(range));
                }
                vacant.insert(range.clone());
                return Ok(RangeUpdate::Started(range));
            }
        };

        let range = entry.get_mut();
        if range.phase == RangePhase::Locked {
            return Ok(RangeUpdate::Unchanged(range.clone()));
        }

        range.tick_count += 1;
        range.high = range.high.max(price);
        range.low = range.low.min(price);
        range.check_invariant(symbol)?;

        if range.tick_count >= self.config.lock_ticks {
            self.lock(range, now);
            return Ok(RangeUpdate::Locked(range.clone()));
        }

        Ok(RangeUpdate::Extended(range.clone()))
    }

    fn lock(&self, range: &mut OpeningRange, now: DateTime<Utc>) {
        range.phase = RangePhase::Locked;
        range.locked_at = Some(now);
        range.valid_until = Some(now + self.config.validity_window());
    }

    /// Restart the symbol's range from the exit price of a closed position
    pub fn on_position_closed(&self, symbol: &Symbol, exit_price: f64) {
        self.ranges.insert(symbol.clone(), OpeningRange::seeded(exit_price));
    }

    /// Drop a symbol's range entirely; the next tick starts a fresh one
    pub fn reset(&self, symbol: &Symbol) {
        self.ranges.remove(symbol);
    }

    pub fn get(&self, symbol: &Symbol) -> Option<OpeningRange> {
        self.ranges.get(symbol).map(|r| r.clone())
    }

    pub fn locked_count(&self) -> usize {
        self.ranges.iter().filter(|r| r.is_locked()).count()
    }
}
