//! Portfolio risk gate and position sizing

pub mod gate;
pub mod sizing;

pub use gate::{BlockReason, CloseOutcome, RiskGate, RiskState, RiskStatistics};
pub use sizing::{BindingConstraint, CashSnapshot, PositionSizer, SizingDecision};
