//! Simulated broker for paper trading

use super::{ExecutionAdapter, ExecutionReport, IntentKind, OrderIntent};
use crate::config::ExecutionConfig;
use crate::errors::EngineResult;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

/// Slippage model for simulated fills
#[derive(Clone, Debug, PartialEq)]
pub enum SlippageModel {
    None,
    Fixed(f64),
    /// Percent of price, e.g. 0.01 = 0.01%
    Percentage(f64),
    Dynamic { base: f64, impact: f64 },
}

#[derive(Clone, Debug)]
pub struct PaperExecutionConfig {
    pub latency: Duration,
    pub slippage: SlippageModel,
    /// Percent of notional
    pub commission_rate: f64,
}

impl Default for PaperExecutionConfig {
    fn default() -> Self {
        Self {
            latency: Duration::from_millis(50),
            slippage: SlippageModel::None,
            commission_rate: 0.0,
        }
    }
}

impl From<&ExecutionConfig> for PaperExecutionConfig {
    fn from(config: &ExecutionConfig) -> Self {
        let slippage = if config.paper_slippage_pct > 0.0 {
            SlippageModel::Percentage(config.paper_slippage_pct)
        } else {
            SlippageModel::None
        };
        Self {
            latency: Duration::from_millis(config.paper_latency_ms),
            slippage,
            commission_rate: 0.0,
        }
    }
}

/// Paper statistics
#[derive(Default, Clone, Debug)]
pub struct PaperStatistics {
    pub orders: u64,
    pub fills: u64,
    pub rejections: u64,
    pub commission_paid: f64,
    pub slippage_paid: f64,
}

/// Fills every intent at the requested price plus slippage after a fixed latency
pub struct PaperExecutionAdapter {
    config: PaperExecutionConfig,
    rejecting: AtomicBool,
    reject_reason: RwLock<String>,
    order_counter: AtomicU64,
    fills: AtomicU64,
    rejections: AtomicU64,
    costs: RwLock<(f64, f64)>,
}

impl PaperExecutionAdapter {
    pub fn new(config: PaperExecutionConfig) -> Self {
        Self {
            config,
            rejecting: AtomicBool::new(false),
            reject_reason: RwLock::new(String::new()),
            order_counter: AtomicU64::new(0),
            fills: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
            costs: RwLock::new((0.0, 0.0)),
        }
    }

    /// Reject every subsequent order with `reason` until cleared
    pub fn reject_all(&self, reason: impl Into<String>) {
        *self.reject_reason.write() = reason.into();
        self.rejecting.store(true, Ordering::SeqCst);
    }

    pub fn accept_all(&self) {
        self.rejecting.store(false, Ordering::SeqCst);
    }

    pub fn calculate_execution_price(&self, intent: &OrderIntent) -> (f64, f64) {
        let market_price = intent.price;
        let slippage = match &self.config.slippage {
            SlippageModel::None => 0.0,
            SlippageModel::Fixed(amount) => *amount,
            SlippageModel::Percentage(pct) => market_price * pct / 100.0,
            SlippageModel::Dynamic { base, impact } => base + (impact * intent.quantity.abs().sqrt()),
        };

        let exec_price = if intent.is_buy() {
            market_price + slippage
        } else {
            market_price - slippage
        };

        (exec_price, slippage)
    }

    fn calculate_commission(&self, quantity: f64, price: f64) -> f64 {
        quantity.abs() * price * self.config.commission_rate / 100.0
    }

    pub fn get_statistics(&self) -> PaperStatistics {
        let (commission_paid, slippage_paid) = *self.costs.read();
        PaperStatistics {
            orders: self.order_counter.load(Ordering::Relaxed),
            fills: self.fills.load(Ordering::Relaxed),
            rejections: self.rejections.load(Ordering::Relaxed),
            commission_paid,
            slippage_paid,
        }
    }
}

#[async_trait]
impl ExecutionAdapter for PaperExecutionAdapter {
    async fn submit(&self, intent: &OrderIntent) -> EngineResult<ExecutionReport> {
        let seq = self.order_counter.fetch_add(1, Ordering::Relaxed) + 1;

        if !self.config.latency.is_zero() {
            tokio::time::sleep(self.config.latency).await;
        }

        if self.rejecting.load(Ordering::SeqCst) {
            self.rejections.fetch_add(1, Ordering::Relaxed);
            return Ok(ExecutionReport::rejected(self.reject_reason.read().clone()));
        }

        let (price, slippage) = self.calculate_execution_price(intent);
        let commission = self.calculate_commission(intent.quantity, price);
        {
            let mut costs = self.costs.write();
            costs.0 += commission;
            costs.1 += slippage * intent.quantity.abs();
        }
        self.fills.fetch_add(1, Ordering::Relaxed);

        let order_id = format!("PAPER_{}_{}", seq, nanoid::nanoid!(8));
        let action = match intent.intent {
            IntentKind::Enter => "open",
            IntentKind::Exit => "close",
        };
        debug!(
            "📝 Paper {} {} {} x{} @ {:.4} ({})",
            action, intent.direction, intent.symbol, intent.quantity, price, order_id
        );
        Ok(ExecutionReport::filled(price, intent.quantity, order_id))
    }

    fn name(&self) -> &str {
        "paper"
    }
}
