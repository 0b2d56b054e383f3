//! Feed and broker error types

use orb_core::{EngineError, Symbol};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FeedError {
    #[error("Invalid feed URL: {0}")]
    InvalidUrl(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Parsing error: {0}")]
    Parse(String),

    #[error("No message within {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Gave up after {attempts} reconnect attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("Tick receiver dropped")]
    ReceiverClosed,

    #[error("I/O error: {0}")]
    Io(String),
}

impl FeedError {
    /// Whether the reconnect loop should try again
    pub fn should_retry(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::WebSocket(_) | Self::Timeout { .. }
        )
    }
}

impl From<serde_json::Error> for FeedError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for FeedError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(err.to_string())
    }
}

impl From<url::ParseError> for FeedError {
    fn from(err: url::ParseError) -> Self {
        Self::InvalidUrl(err.to_string())
    }
}

impl From<std::io::Error> for FeedError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

pub type FeedResult<T> = Result<T, FeedError>;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Network timeout")]
    Timeout,

    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Parsing error: {0}")]
    Parse(String),

    #[error("Invalid broker URL: {0}")]
    InvalidUrl(String),
}

impl BrokerError {
    /// Map onto the engine's execution failure for `symbol`
    pub fn into_engine(self, symbol: &Symbol) -> EngineError {
        EngineError::ExecutionRejected {
            symbol: symbol.clone(),
            message: self.to_string(),
        }
    }
}

impl From<reqwest::Error> for BrokerError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_decode() {
            Self::Parse(err.to_string())
        } else {
            Self::Connection(err.to_string())
        }
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

impl From<url::ParseError> for BrokerError {
    fn from(err: url::ParseError) -> Self {
        Self::InvalidUrl(err.to_string())
    }
}

pub type BrokerResult<T> = Result<T, BrokerError>;
