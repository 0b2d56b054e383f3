//! Fire-and-confirm dispatch of order intents

use super::{ExecutionAdapter, ExecutionOutcome, OrderIntent};
use crate::errors::EngineError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, warn};

/// Dispatcher statistics
#[derive(Default, Clone, Debug)]
pub struct DispatcherStatistics {
    pub dispatched: u64,
    pub filled: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub in_flight: u64,
}

#[derive(Default)]
struct Counters {
    dispatched: AtomicU64,
    filled: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    in_flight: AtomicU64,
}

/// Runs each intent on its own task under a timeout budget
pub struct ExecutionDispatcher {
    adapter: Arc<dyn ExecutionAdapter>,
    timeout: Duration,
    outcome_sender: mpsc::UnboundedSender<ExecutionOutcome>,
    outcome_receiver: Option<mpsc::UnboundedReceiver<ExecutionOutcome>>,
    counters: Arc<Counters>,
}

impl ExecutionDispatcher {
    pub fn new(adapter: Arc<dyn ExecutionAdapter>, timeout: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            adapter,
            timeout,
            outcome_sender: tx,
            outcome_receiver: Some(rx),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Outcome stream; can be taken once
    pub fn take_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<ExecutionOutcome>> {
        self.outcome_receiver.take()
    }

    pub fn adapter_name(&self) -> &str {
        self.adapter.name()
    }

    pub fn in_flight(&self) -> u64 {
        self.counters.in_flight.load(Ordering::SeqCst)
    }

    /// Hand an intent to the adapter without waiting for it.
    ///
    /// The adapter call runs on a detached task. If it outlives the budget the
    /// outcome is reported as a timeout and the late result is only logged.
    pub fn dispatch(&self, intent: OrderIntent) -> JoinHandle<()> {
        let adapter = self.adapter.clone();
        let budget = self.timeout;
        let sender = self.outcome_sender.clone();
        let counters = self.counters.clone();

        counters.dispatched.fetch_add(1, Ordering::Relaxed);
        counters.in_flight.fetch_add(1, Ordering::SeqCst);

        tokio::spawn(async move {
            let submitted = intent.clone();
            let mut call = tokio::spawn(async move { adapter.submit(&submitted).await });

            let result = tokio::time::timeout(budget, &mut call).await;
            let outcome = match result {
                Ok(Ok(Ok(report))) => ExecutionOutcome::from_report(intent, report),
                Ok(Ok(Err(e))) => ExecutionOutcome::Failed { intent, error: e },
                Ok(Err(join_error)) => ExecutionOutcome::Failed {
                    error: EngineError::ExecutionRejected {
                        symbol: intent.symbol.clone(),
                        message: format!("adapter task failed: {}", join_error),
                    },
                    intent,
                },
                Err(_) => {
                    counters.timed_out.fetch_add(1, Ordering::Relaxed);
                    let symbol = intent.symbol.clone();
                    let order = intent.client_order_id.clone();
                    tokio::spawn(async move {
                        if let Ok(Ok(report)) = call.await {
                            warn!(
                                "⚠️ Late broker response for {} {} after timeout: success={}",
                                symbol, order, report.success
                            );
                        }
                    });
                    ExecutionOutcome::Failed {
                        error: EngineError::ExecutionTimeout {
                            symbol: intent.symbol.clone(),
                            millis: budget.as_millis() as u64,
                        },
                        intent,
                    }
                }
            };

            match &outcome {
                ExecutionOutcome::Filled { .. } => counters.filled.fetch_add(1, Ordering::Relaxed),
                ExecutionOutcome::Failed { .. } => counters.failed.fetch_add(1, Ordering::Relaxed),
            };

            if sender.send(outcome).is_err() {
                error!("Execution outcome receiver dropped");
            }
            counters.in_flight.fetch_sub(1, Ordering::SeqCst);
        })
    }

    pub fn get_statistics(&self) -> DispatcherStatistics {
        DispatcherStatistics {
            dispatched: self.counters.dispatched.load(Ordering::Relaxed),
            filled: self.counters.filled.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            timed_out: self.counters.timed_out.load(Ordering::Relaxed),
            in_flight: self.counters.in_flight.load(Ordering::SeqCst),
        }
    }
}
