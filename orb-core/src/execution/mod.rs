//! Order execution: intents out, reports back
//!
//! The engine never waits on a broker. It hands [`OrderIntent`]s to the
//! [`ExecutionDispatcher`], which runs each one on its own task under a
//! timeout and reports an [`ExecutionOutcome`] on a channel.

pub mod dispatcher;
pub mod paper;

pub use dispatcher::{DispatcherStatistics, ExecutionDispatcher};
pub use paper::{PaperExecutionAdapter, PaperExecutionConfig, SlippageModel};

use crate::errors::{EngineError, EngineResult};
use crate::market::{Direction, Symbol};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IntentKind {
    Enter,
    Exit,
}

impl fmt::Display for IntentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntentKind::Enter => f.write_str("ENTER"),
            IntentKind::Exit => f.write_str("EXIT"),
        }
    }
}

/// Order intent sent to the broker. `direction` is the position's direction
/// for both entries and exits.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderIntent {
    pub intent: IntentKind,
    pub symbol: Symbol,
    pub direction: Direction,
    pub quantity: f64,
    pub price: f64,
    pub client_order_id: String,
    /// Tick time the decision was made at
    pub timestamp: DateTime<Utc>,
}

impl OrderIntent {
    pub fn new(
        intent: IntentKind,
        symbol: Symbol,
        direction: Direction,
        quantity: f64,
        price: f64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let prefix = match intent {
            IntentKind::Enter => "ENT",
            IntentKind::Exit => "EXT",
        };
        Self {
            intent,
            symbol,
            direction,
            quantity,
            price,
            client_order_id: format!("{}_{}_{}", prefix, timestamp.timestamp_millis(), nanoid::nanoid!(8)),
            timestamp,
        }
    }

    /// True when the order buys: long entries and short exits
    pub fn is_buy(&self) -> bool {
        matches!(
            (self.intent, self.direction),
            (IntentKind::Enter, Direction::Long) | (IntentKind::Exit, Direction::Short)
        )
    }
}

/// Broker response
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionReport {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filled_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filled_quantity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ExecutionReport {
    pub fn filled(price: f64, quantity: f64, order_id: impl Into<String>) -> Self {
        Self {
            success: true,
            filled_price: Some(price),
            filled_quantity: Some(quantity),
            order_id: Some(order_id.into()),
            error_message: None,
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            success: false,
            filled_price: None,
            filled_quantity: None,
            order_id: None,
            error_message: Some(message.into()),
        }
    }
}

/// A broker the engine can send intents to
#[async_trait]
pub trait ExecutionAdapter: Send + Sync {
    /// Submit an intent and wait for its fill or rejection. Transport errors
    /// are returned as `Err`; broker rejections as an unsuccessful report.
    async fn submit(&self, intent: &OrderIntent) -> EngineResult<ExecutionReport>;

    fn name(&self) -> &str;
}

/// Terminal result of one dispatched intent
#[derive(Clone, Debug, PartialEq)]
pub enum ExecutionOutcome {
    Filled {
        intent: OrderIntent,
        price: f64,
        quantity: f64,
        order_id: Option<String>,
    },
    Failed {
        intent: OrderIntent,
        error: EngineError,
    },
}

impl ExecutionOutcome {
    pub fn intent(&self) -> &OrderIntent {
        match self {
            ExecutionOutcome::Filled { intent, .. } | ExecutionOutcome::Failed { intent, .. } => intent,
        }
    }

    /// Turn a broker report into an outcome
    pub fn from_report(intent: OrderIntent, report: ExecutionReport) -> Self {
        match (report.success, report.filled_price) {
            (true, Some(price)) => ExecutionOutcome::Filled {
                quantity: report.filled_quantity.unwrap_or(intent.quantity),
                price,
                order_id: report.order_id,
                intent,
            },
            (true, None) => ExecutionOutcome::Failed {
                error: EngineError::ExecutionRejected {
                    symbol: intent.symbol.clone(),
                    message: "fill reported without a price".to_string(),
                },
                intent,
            },
            (false, _) => ExecutionOutcome::Failed {
                error: EngineError::ExecutionRejected {
                    symbol: intent.symbol.clone(),
                    message: report
                        .error_message
                        .unwrap_or_else(|| "rejected without a message".to_string()),
                },
                intent,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn intent(kind: IntentKind, direction: Direction) -> OrderIntent {
        OrderIntent::new(kind, Symbol::new("AAPL"), direction, 10.0, 184.0, Utc::now())
    }

    #[test]
    fn test_intent_wire_shape() {
        let json = serde_json::to_value(intent(IntentKind::Enter, Direction::Long)).unwrap();
        assert_eq!(json["intent"], "ENTER");
        assert_eq!(json["symbol"], "AAPL");
        assert_eq!(json["direction"], "LONG");
        assert_eq!(json["quantity"], 10.0);
        assert!(json["clientOrderId"].as_str().unwrap().starts_with("ENT_"));
    }

    #[test]
    fn test_report_wire_shape() {
        let ok: ExecutionReport =
            serde_json::from_str(r#"{"success":true,"filledPrice":184.02,"filledQuantity":10,"orderId":"B-1"}"#).unwrap();
        assert_eq!(ok, ExecutionReport::filled(184.02, 10.0, "B-1"));

        let err: ExecutionReport = serde_json::from_str(r#"{"success":false,"errorMessage":"market closed"}"#).unwrap();
        assert_eq!(err.error_message.as_deref(), Some("market closed"));
    }

    #[test]
    fn test_buy_side() {
        assert!(intent(IntentKind::Enter, Direction::Long).is_buy());
        assert!(!intent(IntentKind::Exit, Direction::Long).is_buy());
        assert!(intent(IntentKind::Exit, Direction::Short).is_buy());
    }

    #[test]
    fn test_outcome_from_report() {
        let i = intent(IntentKind::Enter, Direction::Long);
        match ExecutionOutcome::from_report(i.clone(), ExecutionReport::filled(184.1, 0.0, "X")) {
            ExecutionOutcome::Filled { price, .. } => assert_eq!(price, 184.1),
            other => panic!("unexpected {:?}", other),
        }
        let outcome = ExecutionOutcome::from_report(i, ExecutionReport::rejected("no shares"));
        assert!(matches!(
            outcome,
            ExecutionOutcome::Failed { error: EngineError::ExecutionRejected { .. }, .. }
        ));
    }
}
