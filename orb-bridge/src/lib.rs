//! External collaborators for the opening-range engine
//!
//! Tick sources push into a `tokio::sync::mpsc::Sender<Tick>`; brokers
//! implement [`orb_core::ExecutionAdapter`].

pub mod errors;
pub mod feed;
pub mod http_broker;
pub mod replay;

pub use errors::{BrokerError, BrokerResult, FeedError, FeedResult};
pub use feed::{parse_message, ConnectionStatus, FeedConfig, FeedMetrics, WebSocketTickFeed};
pub use http_broker::{BrokerEnvironment, HttpBrokerConfig, HttpExecutionAdapter};
pub use replay::{ReplayFeed, ReplayStatistics};
