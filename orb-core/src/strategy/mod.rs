//! Opening-range strategy: range tracking, tick history and signal evaluation

pub mod opening_range;
pub mod signals;
pub mod tick_history;

pub use opening_range::{OpeningRange, OpeningRangeTracker, RangePhase, RangeUpdate};
pub use signals::{
    realized_pnl, EntryDecision, EntryRejection, EntrySignal, ExitReason, ExitSignal, SignalEvaluator,
};
pub use tick_history::TickHistory;
