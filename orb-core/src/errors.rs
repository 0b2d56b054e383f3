//! Engine error types

use crate::market::Symbol;
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Execution rejected for {symbol}: {message}")]
    ExecutionRejected { symbol: Symbol, message: String },

    #[error("Execution timed out for {symbol} after {millis}ms")]
    ExecutionTimeout { symbol: Symbol, millis: u64 },

    #[error("Out-of-order tick for {symbol}: last {last}, got {got}")]
    DataOrdering {
        symbol: Symbol,
        last: DateTime<Utc>,
        got: DateTime<Utc>,
    },

    #[error("Invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Unknown position: {0}")]
    UnknownPosition(String),

    #[error("Invalid transition for {symbol}: {from} -> {to}")]
    InvalidTransition {
        symbol: Symbol,
        from: &'static str,
        to: &'static str,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Refuse to start or continue the session
    Fatal,
    /// Logged, the session keeps running
    Recoverable,
    /// Input dropped, nothing else changes
    Dropped,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) | Self::InvariantViolation(_) => ErrorKind::Fatal,
            Self::DataOrdering { .. } => ErrorKind::Dropped,
            _ => ErrorKind::Recoverable,
        }
    }

    pub fn is_execution(&self) -> bool {
        matches!(
            self,
            Self::ExecutionRejected { .. } | Self::ExecutionTimeout { .. }
        )
    }
}

impl From<toml::de::Error> for EngineError {
    fn from(err: toml::de::Error) -> Self {
        Self::Configuration(err.to_string())
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        Self::Configuration(err.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
