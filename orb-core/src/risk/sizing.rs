//! Position sizing against reserved cash

use crate::config::SizingPolicy;
use crate::errors::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Cash view handed to the sizer. Always taken fresh from the gate.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CashSnapshot {
    /// Starting cash plus realized P&L
    pub equity: f64,
    /// Equity not reserved by active positions
    pub available_cash: f64,
    pub reserved_cash: f64,
    pub open_positions: usize,
}

/// Which cap decided the final quantity
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BindingConstraint {
    Risk,
    FixedBase,
    CashReserve,
    NotionalCap,
    MinSize,
}

impl fmt::Display for BindingConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BindingConstraint::Risk => "RISK",
            BindingConstraint::FixedBase => "FIXED_BASE",
            BindingConstraint::CashReserve => "CASH_RESERVE",
            BindingConstraint::NotionalCap => "NOTIONAL_CAP",
            BindingConstraint::MinSize => "MIN_SIZE",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SizingDecision {
    pub quantity: f64,
    /// Cash set aside for this position while it is active
    pub reserved_cash: f64,
    pub binding: BindingConstraint,
    pub risk_shares: f64,
    pub cash_shares: f64,
    pub notional_shares: f64,
}

/// Position sizer
#[derive(Clone, Debug)]
pub struct PositionSizer {
    policy: SizingPolicy,
}

impl PositionSizer {
    pub fn new(policy: SizingPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &SizingPolicy {
        &self.policy
    }

    /// Cash one new position may reserve, given what is available right now
    pub fn reserved_cash_per_position(&self, available_cash: f64) -> f64 {
        let available = available_cash.max(0.0);
        available / self.policy.max_open_positions as f64 * self.policy.reserve_pct()
    }

    /// Size an entry at `entry_price`. `stop_price` switches on risk-based sizing.
    pub fn size(&self, cash: &CashSnapshot, entry_price: f64, stop_price: Option<f64>) -> EngineResult<SizingDecision> {
        if !(entry_price.is_finite() && entry_price > 0.0) {
            return Err(EngineError::InvariantViolation(format!(
                "cannot size at entry price {}",
                entry_price
            )));
        }

        let reserved_cash = self.reserved_cash_per_position(cash.available_cash);

        let (risk_shares, risk_binding) = match stop_price {
            Some(stop) if (entry_price - stop).abs() > f64::EPSILON => {
                let risk_budget = cash.equity.max(0.0) * self.policy.per_trade_risk_pct;
                ((risk_budget / (entry_price - stop).abs()).floor(), BindingConstraint::Risk)
            }
            _ => (self.policy.base_size, BindingConstraint::FixedBase),
        };
        let cash_shares = (reserved_cash / entry_price).floor();
        let notional_shares = (self.policy.max_position_notional / entry_price).floor();

        // Ties go to the earlier constraint
        let mut quantity = risk_shares;
        let mut binding = risk_binding;
        if cash_shares < quantity {
            quantity = cash_shares;
            binding = BindingConstraint::CashReserve;
        }
        if notional_shares < quantity {
            quantity = notional_shares;
            binding = BindingConstraint::NotionalCap;
        }
        if quantity < self.policy.min_size {
            quantity = self.policy.min_size;
            binding = BindingConstraint::MinSize;
        }

        Ok(SizingDecision {
            quantity,
            reserved_cash,
            binding,
            risk_shares,
            cash_shares,
            notional_shares,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SizingPreset;

    fn cash(available: f64) -> CashSnapshot {
        CashSnapshot {
            equity: available,
            available_cash: available,
            reserved_cash: 0.0,
            open_positions: 0,
        }
    }

    #[test]
    fn test_cash_reserve_binds() {
        let sizer = PositionSizer::new(SizingPolicy::default());
        let decision = sizer.size(&cash(5000.0), 184.0, Some(184.0 * (1.0 - 0.0004))).unwrap();
        // 5000 / 3 = 1666.67 -> 9 shares at 184
        assert_eq!(decision.quantity, 9.0);
        assert_eq!(decision.binding, BindingConstraint::CashReserve);
        assert!((decision.reserved_cash - 5000.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_risk_binds_with_wide_stop() {
        let sizer = PositionSizer::new(SizingPolicy::default());
        // 5000 * 0.005 = 25 at risk, 5 per share -> 5 shares
        let decision = sizer.size(&cash(5000.0), 50.0, Some(45.0)).unwrap();
        assert_eq!(decision.quantity, 5.0);
        assert_eq!(decision.binding, BindingConstraint::Risk);
    }

    #[test]
    fn test_fixed_base_without_stop() {
        let policy = SizingPolicy {
            base_size: 4.0,
            ..SizingPolicy::default()
        };
        let decision = PositionSizer::new(policy).size(&cash(5000.0), 10.0, None).unwrap();
        assert_eq!(decision.quantity, 4.0);
        assert_eq!(decision.binding, BindingConstraint::FixedBase);
    }

    #[test]
    fn test_notional_cap_binds() {
        let policy = SizingPolicy {
            max_position_notional: 100.0,
            ..SizingPolicy::default()
        };
        let decision = PositionSizer::new(policy).size(&cash(100_000.0), 30.0, None).unwrap();
        assert_eq!(decision.quantity, 3.0);
        assert_eq!(decision.binding, BindingConstraint::NotionalCap);
    }

    #[test]
    fn test_min_size_floor() {
        let sizer = PositionSizer::new(SizingPolicy::default());
        let decision = sizer.size(&cash(100.0), 500.0, None).unwrap();
        assert_eq!(decision.quantity, 1.0);
        assert_eq!(decision.binding, BindingConstraint::MinSize);
    }

    #[test]
    fn test_presets_scale_reservation() {
        let moderate = PositionSizer::new(SizingPolicy {
            preset: Some(SizingPreset::Moderate),
            ..SizingPolicy::default()
        });
        let conservative = PositionSizer::new(SizingPolicy::default());
        assert_eq!(
            moderate.reserved_cash_per_position(3000.0) * 2.0,
            conservative.reserved_cash_per_position(3000.0)
        );
    }

    #[test]
    fn test_sequential_reservations_never_exceed_cash() {
        let sizer = PositionSizer::new(SizingPolicy::default());
        let mut available = 5000.0;
        let mut total = 0.0;
        for _ in 0..3 {
            let reserved = sizer.reserved_cash_per_position(available);
            total += reserved;
            available -= reserved;
        }
        assert!(total <= 5000.0);
    }

    #[test]
    fn test_bad_price_is_invariant_violation() {
        let sizer = PositionSizer::new(SizingPolicy::default());
        assert!(matches!(
            sizer.size(&cash(100.0), 0.0, None),
            Err(EngineError::InvariantViolation(_))
        ));
    }
}
