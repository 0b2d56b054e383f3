//! Opening-Range Tick Engine
//!
//! A tick-driven strategy and risk engine. Each symbol builds an opening
//! range over its first ticks, then trades breakouts of momentum inside it
//! under a portfolio-wide risk gate and cash-allocation sizing policy.
//! Brokers and tick transports plug in through [`execution::ExecutionAdapter`]
//! and a plain `tokio::sync::mpsc` channel of [`market::Tick`]s.

pub mod config;
pub mod engine;
pub mod errors;
pub mod events;
pub mod execution;
pub mod ledger;
pub mod market;
pub mod risk;
pub mod session;
pub mod strategy;

// Re-export main types for easy access
pub use config::EngineConfig;
pub use engine::{StrategyEngine, TradingStatistics};
pub use errors::{EngineError, EngineResult, ErrorKind};
pub use events::{EngineEvent, EventBus, EventSink, JsonlJournal, MemorySink, TracingSink};
pub use execution::{
    ExecutionAdapter, ExecutionDispatcher, ExecutionOutcome, ExecutionReport, IntentKind, OrderIntent,
    PaperExecutionAdapter, PaperExecutionConfig,
};
pub use ledger::{Position, PositionLedger};
pub use market::{Direction, Symbol, Tick};
pub use risk::{BlockReason, RiskGate};
pub use session::TradingSession;
pub use strategy::{ExitReason, OpeningRangeTracker};
