//! Trading session: the event loop around the engine
//!
//! Selects over shutdown, execution outcomes and incoming ticks (in that
//! order of priority). Intents produced by a tick go straight to the
//! dispatcher; the loop never waits on a fill.

use crate::engine::{StrategyEngine, TradingStatistics};
use crate::errors::{EngineError, ErrorKind};
use crate::execution::{ExecutionAdapter, ExecutionDispatcher, ExecutionOutcome};
use crate::market::{Symbol, Tick};
use anyhow::{anyhow, Result};
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub struct TradingSession {
    engine: Arc<StrategyEngine>,
    dispatcher: ExecutionDispatcher,
    outcomes: Option<mpsc::UnboundedReceiver<ExecutionOutcome>>,
    symbols: HashSet<Symbol>,
    running: Arc<AtomicBool>,
    drain_timeout: Duration,
}

impl TradingSession {
    pub fn new(engine: Arc<StrategyEngine>, adapter: Arc<dyn ExecutionAdapter>) -> Self {
        let timeout = engine.config().execution.timeout();
        let mut dispatcher = ExecutionDispatcher::new(adapter, timeout);
        let outcomes = dispatcher.take_receiver();
        let symbols = engine
            .config()
            .session
            .symbols
            .iter()
            .map(|s| Symbol::new(s.as_str()))
            .collect();

        Self {
            engine,
            dispatcher,
            outcomes,
            symbols,
            running: Arc::new(AtomicBool::new(false)),
            drain_timeout: timeout + Duration::from_millis(500),
        }
    }

    pub fn engine(&self) -> &Arc<StrategyEngine> {
        &self.engine
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run until the tick stream ends, `shutdown` resolves or a fatal error.
    /// In-flight executions are reconciled before returning.
    pub async fn run<F>(&mut self, mut ticks: mpsc::Receiver<Tick>, shutdown: F) -> Result<TradingStatistics>
    where
        F: Future<Output = ()>,
    {
        let mut outcomes = self
            .outcomes
            .take()
            .ok_or_else(|| anyhow!("Trading session already ran"))?;

        self.running.store(true, Ordering::SeqCst);
        info!(
            "🚀 Session started: adapter={}, symbols={}",
            self.dispatcher.adapter_name(),
            if self.symbols.is_empty() {
                "*".to_string()
            } else {
                self.engine.config().session.symbols.join(",")
            }
        );

        tokio::pin!(shutdown);
        let result = loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("🛑 Shutdown signal received");
                    break Ok(());
                }
                Some(outcome) = outcomes.recv() => {
                    if let Err(e) = self.handle_outcome(outcome) {
                        break Err(e);
                    }
                }
                maybe_tick = ticks.recv() => match maybe_tick {
                    Some(tick) => {
                        if let Err(e) = self.handle_tick(&tick) {
                            break Err(e);
                        }
                    }
                    None => {
                        info!("Tick stream closed");
                        break Ok(());
                    }
                },
            }
        };

        let drained = self.drain(&mut outcomes).await;
        self.running.store(false, Ordering::SeqCst);
        self.engine.events().flush();

        result?;
        drained?;

        let stats = self.engine.get_statistics();
        info!(
            "📊 Session finished: {} ticks, {} entries, {} exits, P&L {:.2}",
            stats.ticks_processed, stats.entries_signalled, stats.exits_signalled, stats.positions.realized_pnl
        );
        Ok(stats)
    }

    fn handle_tick(&self, tick: &Tick) -> Result<()> {
        if !self.symbols.is_empty() && !self.symbols.contains(&tick.symbol) {
            debug!("Ignoring tick for unsubscribed {}", tick.symbol);
            return Ok(());
        }
        match self.engine.on_tick(tick) {
            Ok(Some(intent)) => {
                self.dispatcher.dispatch(intent);
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => Self::triage(e),
        }
    }

    fn handle_outcome(&self, outcome: ExecutionOutcome) -> Result<()> {
        if let ExecutionOutcome::Failed { intent, error } = &outcome {
            warn!("⚠️ {} {} failed: {}", intent.intent, intent.symbol, error);
        }
        match self.engine.on_execution(outcome) {
            Ok(()) => Ok(()),
            Err(e) => Self::triage(e),
        }
    }

    fn triage(e: EngineError) -> Result<()> {
        match e.kind() {
            ErrorKind::Fatal => {
                error!("❌ Fatal engine error: {}", e);
                Err(e.into())
            }
            ErrorKind::Dropped => {
                debug!("{}", e);
                Ok(())
            }
            ErrorKind::Recoverable => {
                warn!("{}", e);
                Ok(())
            }
        }
    }

    async fn drain(&self, outcomes: &mut mpsc::UnboundedReceiver<ExecutionOutcome>) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.drain_timeout;
        while self.dispatcher.in_flight() > 0 && tokio::time::Instant::now() < deadline {
            match tokio::time::timeout(Duration::from_millis(10), outcomes.recv()).await {
                Ok(Some(outcome)) => self.handle_outcome(outcome)?,
                Ok(None) => break,
                Err(_) => continue,
            }
        }
        while let Ok(outcome) = outcomes.try_recv() {
            self.handle_outcome(outcome)?;
        }
        let left = self.dispatcher.in_flight();
        if left > 0 {
            warn!("⚠️ {} executions still in flight at shutdown", left);
        }
        Ok(())
    }
}
