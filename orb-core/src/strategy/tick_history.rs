//! Bounded per-symbol tick history

use crate::market::Tick;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;

#[derive(Clone, Debug, PartialEq)]
struct Sample {
    price: f64,
    volume: u64,
    timestamp: DateTime<Utc>,
}

/// Ring buffer of the most recent ticks for one symbol
#[derive(Clone, Debug)]
pub struct TickHistory {
    samples: VecDeque<Sample>,
    capacity: usize,
}

impl TickHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, tick: &Tick) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(Sample {
            price: tick.price,
            volume: tick.volume,
            timestamp: tick.timestamp,
        });
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn last_price(&self) -> Option<f64> {
        self.samples.back().map(|s| s.price)
    }

    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.samples.back().map(|s| s.timestamp)
    }

    fn recent(&self, n: usize) -> Option<impl Iterator<Item = &Sample> + '_> {
        if n == 0 || self.samples.len() < n {
            return None;
        }
        Some(self.samples.iter().skip(self.samples.len() - n))
    }

    /// (max - min) / midpoint over the last `window` prices
    pub fn volatility_pct(&self, window: usize) -> Option<f64> {
        let mut max = f64::MIN;
        let mut min = f64::MAX;
        for s in self.recent(window)? {
            max = max.max(s.price);
            min = min.min(s.price);
        }
        let mid = (max + min) / 2.0;
        if mid <= 0.0 {
            return None;
        }
        Some((max - min) / mid)
    }

    /// Relative move from the first to the last of the last `window` prices
    pub fn net_move_pct(&self, window: usize) -> Option<f64> {
        let mut iter = self.recent(window)?;
        let first = iter.next()?.price;
        let last = self.last_price()?;
        if first <= 0.0 {
            return None;
        }
        Some((last - first) / first)
    }

    /// Consecutive same-sign moves ending at the latest tick, signed by their
    /// direction (+ up, - down), bounded by the `window` ticks. Flat moves break
    /// the streak.
    pub fn direction_streak(&self, window: usize) -> i32 {
        let prices: Vec<f64> = match self.recent(window.min(self.samples.len())) {
            Some(iter) => iter.map(|s| s.price).collect(),
            None => return 0,
        };

        let mut streak = 0i32;
        let mut sign = 0i32;
        for pair in prices.windows(2).rev() {
            let step = pair[1] - pair[0];
            let step_sign = if step > 0.0 {
                1
            } else if step < 0.0 {
                -1
            } else {
                0
            };
            if step_sign == 0 || (sign != 0 && step_sign != sign) {
                break;
            }
            sign = step_sign;
            streak += 1;
        }
        streak * sign
    }

    /// Average volume of the `window` ticks before the latest one
    pub fn avg_prior_volume(&self, window: usize) -> Option<f64> {
        if window == 0 || self.samples.len() < window + 1 {
            return None;
        }
        let end = self.samples.len() - 1;
        let total: u64 = self
            .samples
            .range(end - window..end)
            .map(|s| s.volume)
            .sum();
        Some(total as f64 / window as f64)
    }

    pub fn last_volume(&self) -> Option<u64> {
        self.samples.back().map(|s| s.volume)
    }

    /// Price change on the latest tick
    pub fn last_move(&self) -> Option<f64> {
        let n = self.samples.len();
        if n < 2 {
            return None;
        }
        Some(self.samples[n - 1].price - self.samples[n - 2].price)
    }

    /// Absolute trade-to-trade gap on the latest tick, relative to the prior price
    pub fn last_gap_pct(&self) -> Option<f64> {
        let n = self.samples.len();
        if n < 2 {
            return None;
        }
        let prev = self.samples[n - 2].price;
        if prev <= 0.0 {
            return None;
        }
        Some((self.samples[n - 1].price - prev).abs() / prev)
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn history_of(prices: &[(f64, u64)]) -> TickHistory {
        let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 14, 30, 0).unwrap();
        let mut history = TickHistory::new(16);
        for (i, (p, v)) in prices.iter().enumerate() {
            history.push(&Tick::new("X", *p, *v, t0 + Duration::seconds(i as i64)));
        }
        history
    }

    #[test]
    fn test_evicts_oldest() {
        let mut history = TickHistory::new(3);
        let t0 = Utc::now();
        for p in [1.0, 2.0, 3.0, 4.0] {
            history.push(&Tick::new("X", p, 1, t0));
        }
        assert_eq!(history.len(), 3);
        assert_eq!(history.net_move_pct(3), Some(1.0));
    }

    #[test]
    fn test_volatility() {
        let history = history_of(&[(100.0, 1), (102.0, 1), (98.0, 1)]);
        assert!((history.volatility_pct(3).unwrap() - 0.04).abs() < 1e-12);
        assert_eq!(history.volatility_pct(2).map(|v| v > 0.0), Some(true));
        assert!(history.volatility_pct(4).is_none());
    }

    #[test]
    fn test_direction_streak() {
        let history = history_of(&[(100.0, 1), (99.0, 1), (99.5, 1), (99.8, 1), (100.1, 1)]);
        assert_eq!(history.direction_streak(5), 3);
        assert_eq!(history.direction_streak(3), 2);

        let history = history_of(&[(100.0, 1), (99.0, 1), (98.0, 1)]);
        assert_eq!(history.direction_streak(3), -2);

        let history = history_of(&[(100.0, 1), (101.0, 1), (101.0, 1)]);
        assert_eq!(history.direction_streak(3), 0);
    }

    #[test]
    fn test_streak_is_bounded_by_window_moves() {
        let rising: Vec<(f64, u64)> = (0..20).map(|i| (100.0 + i as f64, 1)).collect();
        let history = history_of(&rising);
        for window in 2..=10 {
            assert_eq!(history.direction_streak(window), window as i32 - 1);
        }
    }

    #[test]
    fn test_avg_prior_volume_excludes_latest() {
        let history = history_of(&[(1.0, 100), (1.0, 200), (1.0, 300), (1.0, 1000)]);
        assert_eq!(history.avg_prior_volume(3), Some(200.0));
        assert_eq!(history.last_volume(), Some(1000));
        assert!(history.avg_prior_volume(4).is_none());
    }

    #[test]
    fn test_last_move_and_gap() {
        let history = history_of(&[(100.0, 1), (99.0, 1)]);
        assert_eq!(history.last_move(), Some(-1.0));
        assert!((history.last_gap_pct().unwrap() - 0.01).abs() < 1e-12);
    }
}
