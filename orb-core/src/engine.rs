//! Tick-driven strategy engine
//!
//! ```text
//! tick -> range tracker -> signal evaluator -> risk gate -> sizer -> ledger -> OrderIntent
//! ExecutionOutcome -> ledger (finalize) -> risk gate / range tracker
//! ```
//!
//! `on_tick` never waits on a broker. It returns at most one intent per tick,
//! which the session hands to the dispatcher; fills come back through
//! `on_execution`.

use crate::config::EngineConfig;
use crate::errors::{EngineError, EngineResult};
use crate::events::{EngineEvent, EventBus};
use crate::execution::{ExecutionOutcome, IntentKind, OrderIntent};
use crate::ledger::{ExitFailure, OpenPosition, PendingPosition, Position, PositionId, PositionLedger, PositionStatistics};
use crate::market::{Symbol, Tick};
use crate::risk::{BlockReason, PositionSizer, RiskGate};
use crate::strategy::{
    EntryDecision, EntryRejection, ExitReason, OpeningRangeTracker, RangeUpdate, SignalEvaluator, TickHistory,
};
use dashmap::DashMap;
use serde::Serialize;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Engine statistics
#[derive(Default, Clone, Debug, Serialize)]
pub struct TradingStatistics {
    pub ticks_processed: u64,
    pub ticks_dropped: u64,
    pub entries_signalled: u64,
    pub exits_signalled: u64,
    pub entries_rejected: u64,
    pub entries_blocked: u64,
    pub rejections_by_reason: Vec<(EntryRejection, u64)>,
    pub blocks_by_reason: Vec<(BlockReason, u64)>,
    pub exits_by_reason: Vec<(ExitReason, u64)>,
    pub equity: f64,
    pub available_cash: f64,
    pub daily_pnl: f64,
    pub consecutive_losses: u32,
    pub kill_switch_engaged: bool,
    pub open_positions: usize,
    pub positions: PositionStatistics,
}

#[derive(Default)]
struct Counters {
    ticks_processed: AtomicU64,
    ticks_dropped: AtomicU64,
    entries_signalled: AtomicU64,
    exits_signalled: AtomicU64,
    rejections: DashMap<EntryRejection, u64>,
    blocks: DashMap<BlockReason, u64>,
    exits: DashMap<ExitReason, u64>,
}

fn bump<K: Eq + Hash>(map: &DashMap<K, u64>, key: K) {
    *map.entry(key).or_insert(0) += 1;
}

fn tally<K: Copy + Eq + Hash + Ord>(map: &DashMap<K, u64>) -> Vec<(K, u64)> {
    let mut out: Vec<(K, u64)> = map.iter().map(|e| (*e.key(), *e.value())).collect();
    out.sort_by_key(|(k, _)| *k);
    out
}

/// Strategy engine
pub struct StrategyEngine {
    config: EngineConfig,
    tracker: Arc<OpeningRangeTracker>,
    evaluator: SignalEvaluator,
    gate: Arc<RiskGate>,
    sizer: PositionSizer,
    ledger: Arc<PositionLedger>,
    histories: DashMap<Symbol, TickHistory>,
    events: EventBus,
    counters: Counters,
}

impl StrategyEngine {
    pub fn new(config: EngineConfig) -> EngineResult<Self> {
        config.validate()?;

        let tracker = Arc::new(OpeningRangeTracker::new(config.range.clone()));
        let gate = Arc::new(RiskGate::new(config.risk.clone(), config.sizing.max_open_positions));
        let ledger = Arc::new(PositionLedger::new(
            gate.clone(),
            tracker.clone(),
            config.execution.max_exit_attempts,
        ));

        Ok(Self {
            evaluator: SignalEvaluator::new(config.entry.clone(), config.exit.clone()),
            sizer: PositionSizer::new(config.sizing.clone()),
            tracker,
            gate,
            ledger,
            histories: DashMap::new(),
            events: EventBus::new(),
            counters: Counters::default(),
            config,
        })
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn tracker(&self) -> &Arc<OpeningRangeTracker> {
        &self.tracker
    }

    pub fn gate(&self) -> &Arc<RiskGate> {
        &self.gate
    }

    pub fn ledger(&self) -> &Arc<PositionLedger> {
        &self.ledger
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Process one tick. Returns the order intent it produced, if any.
    ///
    /// Ticks older than the symbol's last one are dropped with
    /// `EngineError::DataOrdering`; nothing else changes.
    pub fn on_tick(&self, tick: &Tick) -> EngineResult<Option<OrderIntent>> {
        if !tick.is_valid() {
            self.counters.ticks_dropped.fetch_add(1, Ordering::Relaxed);
            warn!("Dropping malformed tick {} @ {}", tick.symbol, tick.price);
            return Ok(None);
        }

        let symbol = &tick.symbol;
        let capacity = self.config.entry.history_capacity;
        // Held for the whole tick so one symbol's ticks are processed in order
        let mut history = self
            .histories
            .entry(symbol.clone())
            .or_insert_with(|| TickHistory::new(capacity));

        if let Some(last) = history.last_timestamp() {
            if tick.timestamp < last {
                self.counters.ticks_dropped.fetch_add(1, Ordering::Relaxed);
                self.events.publish(EngineEvent::TickDropped {
                    symbol: symbol.clone(),
                    last,
                    got: tick.timestamp,
                });
                return Err(EngineError::DataOrdering {
                    symbol: symbol.clone(),
                    last,
                    got: tick.timestamp,
                });
            }
        }

        history.push(tick);
        self.counters.ticks_processed.fetch_add(1, Ordering::Relaxed);

        let update = self.tracker.on_tick(symbol, tick.price, tick.timestamp)?;
        self.publish_range_update(symbol, &update, tick);

        match self.ledger.get(symbol) {
            Some(Position::Open(_)) => {
                let open = match self.ledger.observe_tick(symbol, tick.price) {
                    Some(open) => open,
                    None => return Ok(None),
                };
                self.evaluate_exit(&open, tick, &history)
            }
            Some(_) => Ok(None),
            None => self.evaluate_entry(&update, tick, &history),
        }
    }

    fn publish_range_update(&self, symbol: &Symbol, update: &RangeUpdate, tick: &Tick) {
        match update {
            RangeUpdate::Started(_) => self.events.publish(EngineEvent::RangeStarted {
                symbol: symbol.clone(),
                price: tick.price,
                timestamp: tick.timestamp,
            }),
            RangeUpdate::Locked(range) => {
                if let (Some(locked_at), Some(valid_until)) = (range.locked_at, range.valid_until) {
                    self.events.publish(EngineEvent::RangeLocked {
                        symbol: symbol.clone(),
                        high: range.high,
                        low: range.low,
                        tick_count: range.tick_count,
                        locked_at,
                        valid_until,
                    });
                }
            }
            RangeUpdate::Extended(_) | RangeUpdate::Unchanged(_) => {}
        }
    }

    fn evaluate_exit(&self, open: &OpenPosition, tick: &Tick, history: &TickHistory) -> EngineResult<Option<OrderIntent>> {
        if open.exit_in_flight.is_some() {
            return Ok(None);
        }
        let signal = match self.evaluator.evaluate_exit(open, tick, history.last_move()) {
            Some(signal) => signal,
            None => return Ok(None),
        };

        let symbol = &tick.symbol;
        let reason = signal.reason;
        let position = self.ledger.begin_exit(symbol, signal)?;

        self.counters.exits_signalled.fetch_add(1, Ordering::Relaxed);
        bump(&self.counters.exits, reason);
        self.events.publish(EngineEvent::ExitSignalled {
            symbol: symbol.clone(),
            reason,
            price: tick.price,
            attempt: position.exit_attempts,
            timestamp: tick.timestamp,
        });

        Ok(Some(OrderIntent::new(
            IntentKind::Exit,
            symbol.clone(),
            position.direction,
            position.quantity,
            tick.price,
            tick.timestamp,
        )))
    }

    fn evaluate_entry(&self, update: &RangeUpdate, tick: &Tick, history: &TickHistory) -> EngineResult<Option<OrderIntent>> {
        let symbol = &tick.symbol;
        let range = update.range();

        let signal = match self.evaluator.evaluate_entry(tick, Some(range), history, false) {
            EntryDecision::Enter(signal) => signal,
            EntryDecision::Rejected(reason) => {
                bump(&self.counters.rejections, reason);
                if range.is_tradeable(tick.timestamp) {
                    self.events.publish(EngineEvent::EntryRejected {
                        symbol: symbol.clone(),
                        reason,
                        price: tick.price,
                        timestamp: tick.timestamp,
                    });
                }
                return Ok(None);
            }
        };

        let stop_price = signal.price * (1.0 - signal.direction.multiplier() * self.config.exit.stop_loss_pct);
        let admitted = self
            .gate
            .try_admit(symbol, tick.timestamp, |cash| self.sizer.size(cash, signal.price, Some(stop_price)));

        let decision = match admitted {
            Ok(Ok(decision)) => decision,
            Ok(Err(e)) => return Err(e),
            Err(reason) => {
                bump(&self.counters.blocks, reason);
                self.events.publish(EngineEvent::EntryBlocked {
                    symbol: symbol.clone(),
                    reason,
                    price: tick.price,
                    timestamp: tick.timestamp,
                });
                return Ok(None);
            }
        };

        let intent = OrderIntent::new(
            IntentKind::Enter,
            symbol.clone(),
            signal.direction,
            decision.quantity,
            signal.price,
            tick.timestamp,
        );

        let pending = PendingPosition {
            id: PositionId::new(symbol.clone(), tick.timestamp),
            direction: signal.direction,
            quantity: decision.quantity,
            requested_price: signal.price,
            reserved_cash: decision.reserved_cash,
            entry_range: signal.range.clone(),
            client_order_id: intent.client_order_id.clone(),
        };
        if let Err(e) = self.ledger.open_pending(pending) {
            self.gate.release(symbol, decision.reserved_cash);
            return Err(e);
        }

        self.counters.entries_signalled.fetch_add(1, Ordering::Relaxed);
        self.events.publish(EngineEvent::EntrySignalled {
            symbol: symbol.clone(),
            direction: signal.direction,
            price: signal.price,
            quantity: decision.quantity,
            reserved_cash: decision.reserved_cash,
            binding: decision.binding,
            client_order_id: intent.client_order_id.clone(),
            timestamp: tick.timestamp,
        });
        debug!(
            %symbol,
            volatility = signal.volatility_pct,
            net_move = signal.net_move_pct,
            volume_ratio = signal.volume_ratio,
            zone = signal.zone_ratio,
            "entry filters passed"
        );

        Ok(Some(intent))
    }

    /// Reconcile a broker outcome into the ledger
    pub fn on_execution(&self, outcome: ExecutionOutcome) -> EngineResult<()> {
        let kind = outcome.intent().intent;
        match (kind, outcome) {
            (IntentKind::Enter, ExecutionOutcome::Filled { intent, price, quantity, order_id }) => {
                let open = self
                    .ledger
                    .confirm_entry(&intent.symbol, price, quantity, intent.timestamp, order_id.clone())?;
                self.events.publish(EngineEvent::PositionOpened {
                    symbol: intent.symbol,
                    direction: open.direction,
                    entry_price: open.entry_price,
                    quantity: open.quantity,
                    order_id,
                    timestamp: open.entry_time,
                });
            }
            (IntentKind::Enter, ExecutionOutcome::Failed { intent, error }) => {
                let errored = self.ledger.fail_entry(&intent.symbol, error.to_string(), intent.timestamp)?;
                self.events.publish(EngineEvent::PositionErrored { position: errored });
            }
            (IntentKind::Exit, ExecutionOutcome::Filled { intent, price, order_id, .. }) => {
                let (closed, outcome) = self
                    .ledger
                    .confirm_exit(&intent.symbol, price, intent.timestamp, order_id)?;
                self.events.publish(EngineEvent::PositionClosed {
                    position: closed,
                    daily_pnl: outcome.daily_pnl,
                    cooldown_until: self.gate.snapshot().cooldown_until,
                    kill_switch_engaged: outcome.kill_switch_engaged,
                });
            }
            (IntentKind::Exit, ExecutionOutcome::Failed { intent, error }) => {
                match self.ledger.fail_exit(&intent.symbol, error.to_string(), intent.timestamp)? {
                    ExitFailure::Retry(open) => self.events.publish(EngineEvent::ExitRetry {
                        symbol: intent.symbol,
                        error: error.to_string(),
                        attempt: open.exit_attempts,
                    }),
                    ExitFailure::Abandoned(errored) => {
                        self.events.publish(EngineEvent::PositionErrored { position: errored })
                    }
                }
            }
        }
        Ok(())
    }

    pub fn get_statistics(&self) -> TradingStatistics {
        let cash = self.gate.cash();
        let risk = self.gate.snapshot();
        let rejections_by_reason = tally(&self.counters.rejections);
        let blocks_by_reason = tally(&self.counters.blocks);

        TradingStatistics {
            ticks_processed: self.counters.ticks_processed.load(Ordering::Relaxed),
            ticks_dropped: self.counters.ticks_dropped.load(Ordering::Relaxed),
            entries_signalled: self.counters.entries_signalled.load(Ordering::Relaxed),
            exits_signalled: self.counters.exits_signalled.load(Ordering::Relaxed),
            entries_rejected: rejections_by_reason.iter().map(|(_, n)| n).sum(),
            entries_blocked: blocks_by_reason.iter().map(|(_, n)| n).sum(),
            rejections_by_reason,
            blocks_by_reason,
            exits_by_reason: tally(&self.counters.exits),
            equity: cash.equity,
            available_cash: cash.available_cash,
            daily_pnl: risk.daily_pnl,
            consecutive_losses: risk.consecutive_losses,
            kill_switch_engaged: risk.kill_switch_engaged,
            open_positions: self.gate.active_count(),
            positions: self.ledger.get_statistics(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EntryConfig, ExitConfig, RangeConfig};
    use crate::events::MemorySink;
    use crate::market::Direction;
    use crate::strategy::RangePhase;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 14, 30, 0).unwrap() + Duration::seconds(secs)
    }

    fn config() -> EngineConfig {
        EngineConfig {
            range: RangeConfig { lock_ticks: 5, validity_secs: 900 },
            entry: EntryConfig {
                history_capacity: 32,
                volatility_window: 5,
                min_volatility_pct: 0.002,
                direction_window: 3,
                min_direction_streak: 2,
                min_net_move_pct: 0.0008,
                volume_spike_multiplier: 1.3,
                entry_zone_pct: 0.5,
                max_spread_vs_target: 0.5,
                allow_short: true,
            },
            exit: ExitConfig {
                stop_loss_pct: 0.01,
                profit_target_pct: 0.02,
                exit_zone_pct: 0.9,
                max_hold_secs: 60,
                breakeven_deadline_secs: 30,
                flat_ticks_threshold: 3,
            },
            ..EngineConfig::default()
        }
    }

    fn engine() -> (StrategyEngine, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let engine = StrategyEngine::new(config())
            .unwrap()
            .with_events(EventBus::new().with_sink(sink.clone()));
        (engine, sink)
    }

    /// Range [100, 102] locked on the 5th tick, then a rising leg with a
    /// volume spike that satisfies every entry filter at 100.6.
    fn feed_to_entry(engine: &StrategyEngine) -> OrderIntent {
        let prices = [
            (100.0, 100),
            (102.0, 100),
            (100.5, 100),
            (101.0, 100),
            (100.0, 100),
            (100.2, 100),
            (100.4, 100),
        ];
        for (i, (price, volume)) in prices.iter().enumerate() {
            let out = engine.on_tick(&Tick::new("AAPL", *price, *volume, t(i as i64))).unwrap();
            assert!(out.is_none(), "unexpected intent on tick {}", i);
        }
        engine
            .on_tick(&Tick::new("AAPL", 100.6, 500, t(7)))
            .unwrap()
            .expect("entry intent")
    }

    fn fill(intent: &OrderIntent, price: f64) -> ExecutionOutcome {
        ExecutionOutcome::Filled {
            intent: intent.clone(),
            price,
            quantity: intent.quantity,
            order_id: Some("B-1".into()),
        }
    }

    #[test]
    fn test_rejects_invalid_config() {
        let mut bad = config();
        bad.exit.stop_loss_pct = 0.0;
        assert!(matches!(StrategyEngine::new(bad), Err(EngineError::Configuration(_))));
    }

    #[test]
    fn test_entry_then_breakout_round_trip() {
        let (engine, sink) = engine();
        let sym = Symbol::new("AAPL");

        let entry = feed_to_entry(&engine);
        assert_eq!(entry.intent, IntentKind::Enter);
        assert_eq!(entry.direction, Direction::Long);
        // 5000 / 3 reserved at 100.6
        assert_eq!(entry.quantity, 16.0);
        assert_eq!(engine.ledger().get(&sym).unwrap().status(), "PENDING");

        // Nothing happens while the entry is in flight
        assert!(engine.on_tick(&Tick::new("AAPL", 100.65, 100, t(8))).unwrap().is_none());

        engine.on_execution(fill(&entry, 100.6)).unwrap();
        assert_eq!(engine.ledger().get(&sym).unwrap().status(), "OPEN");

        assert!(engine.on_tick(&Tick::new("AAPL", 100.7, 100, t(9))).unwrap().is_none());

        let exit = engine
            .on_tick(&Tick::new("AAPL", 102.5, 100, t(10)))
            .unwrap()
            .expect("exit intent");
        assert_eq!(exit.intent, IntentKind::Exit);
        assert_eq!(exit.quantity, 16.0);

        // Exit in flight: no second exit
        assert!(engine.on_tick(&Tick::new("AAPL", 102.6, 100, t(11))).unwrap().is_none());

        engine.on_execution(fill(&exit, 102.5)).unwrap();
        assert!(!engine.ledger().has_active(&sym));

        let range = engine.tracker().get(&sym).unwrap();
        assert_eq!(range.phase, RangePhase::Building);
        assert_eq!(range.tick_count, 1);
        assert_eq!(range.high, 102.5);

        let stats = engine.get_statistics();
        assert_eq!(stats.entries_signalled, 1);
        assert_eq!(stats.exits_by_reason, vec![(ExitReason::RangeBreakout, 1)]);
        assert!((stats.daily_pnl - 30.4).abs() < 1e-9);
        assert_eq!(stats.positions.total_closed, 1);

        assert_eq!(sink.count("range_locked"), 1);
        assert_eq!(sink.count("position_opened"), 1);
        assert_eq!(sink.count("position_closed"), 1);
    }

    #[test]
    fn test_out_of_order_tick_dropped() {
        let (engine, sink) = engine();
        engine.on_tick(&Tick::new("AAPL", 100.0, 1, t(5))).unwrap();
        let err = engine.on_tick(&Tick::new("AAPL", 101.0, 1, t(4))).unwrap_err();
        assert!(matches!(err, EngineError::DataOrdering { .. }));
        assert_eq!(engine.tracker().get(&Symbol::new("AAPL")).unwrap().tick_count, 1);
        assert_eq!(sink.count("tick_dropped"), 1);

        // Equal timestamps are in order
        engine.on_tick(&Tick::new("AAPL", 101.0, 1, t(5))).unwrap();
        let stats = engine.get_statistics();
        assert_eq!(stats.ticks_processed, 2);
        assert_eq!(stats.ticks_dropped, 1);
    }

    #[test]
    fn test_failed_entry_frees_symbol() {
        let (engine, sink) = engine();
        let entry = feed_to_entry(&engine);
        engine
            .on_execution(ExecutionOutcome::Failed {
                error: EngineError::ExecutionTimeout {
                    symbol: entry.symbol.clone(),
                    millis: 5000,
                },
                intent: entry,
            })
            .unwrap();

        let sym = Symbol::new("AAPL");
        assert!(!engine.ledger().has_active(&sym));
        assert!(!engine.gate().is_active(&sym));
        assert_eq!(engine.gate().snapshot().hourly_trade_count, 0);
        assert_eq!(sink.count("position_errored"), 1);
    }

    #[test]
    fn test_failed_exit_is_retried() {
        let (engine, sink) = engine();
        let entry = feed_to_entry(&engine);
        engine.on_execution(fill(&entry, 100.6)).unwrap();

        let exit = engine.on_tick(&Tick::new("AAPL", 102.5, 100, t(9))).unwrap().unwrap();
        engine
            .on_execution(ExecutionOutcome::Failed {
                error: EngineError::ExecutionRejected {
                    symbol: exit.symbol.clone(),
                    message: "halted".into(),
                },
                intent: exit,
            })
            .unwrap();
        assert_eq!(sink.count("exit_retry"), 1);
        assert_eq!(engine.ledger().get(&Symbol::new("AAPL")).unwrap().status(), "OPEN");

        let retry = engine.on_tick(&Tick::new("AAPL", 102.6, 100, t(10))).unwrap();
        assert_eq!(retry.map(|i| i.intent), Some(IntentKind::Exit));
    }

    #[test]
    fn test_blocked_entry_reported() {
        let mut cfg = config();
        cfg.risk.max_trades_per_hour = 1;
        let sink = Arc::new(MemorySink::new());
        let engine = StrategyEngine::new(cfg)
            .unwrap()
            .with_events(EventBus::new().with_sink(sink.clone()));
        // Another symbol already used this hour's only trade
        engine.gate().record_close(&Symbol::new("MSFT"), 0.0, 1.0, t(0));

        let prices = [100.0, 102.0, 100.5, 101.0, 100.0, 100.2, 100.4];
        for (i, price) in prices.iter().enumerate() {
            engine.on_tick(&Tick::new("AAPL", *price, 100, t(i as i64))).unwrap();
        }
        assert!(engine.on_tick(&Tick::new("AAPL", 100.6, 500, t(7))).unwrap().is_none());
        assert_eq!(sink.count("entry_blocked"), 1);
        assert_eq!(engine.get_statistics().blocks_by_reason, vec![(BlockReason::HourlyLimit, 1)]);
    }
}
