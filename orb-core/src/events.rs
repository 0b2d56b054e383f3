//! Structured engine events and their sinks
//!
//! Every decision the engine makes is published as an [`EngineEvent`]. Sinks
//! mirror them to tracing, to an append-only JSONL journal, or keep them in
//! memory for inspection.

use crate::errors::{EngineError, EngineResult};
use crate::ledger::{ClosedPosition, ErroredPosition};
use crate::market::{Direction, Symbol};
use crate::risk::{BindingConstraint, BlockReason};
use crate::strategy::{EntryRejection, ExitReason};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    RangeStarted {
        symbol: Symbol,
        price: f64,
        timestamp: DateTime<Utc>,
    },
    RangeLocked {
        symbol: Symbol,
        high: f64,
        low: f64,
        tick_count: u32,
        locked_at: DateTime<Utc>,
        valid_until: DateTime<Utc>,
    },
    EntryRejected {
        symbol: Symbol,
        reason: EntryRejection,
        price: f64,
        timestamp: DateTime<Utc>,
    },
    EntryBlocked {
        symbol: Symbol,
        reason: BlockReason,
        price: f64,
        timestamp: DateTime<Utc>,
    },
    EntrySignalled {
        symbol: Symbol,
        direction: Direction,
        price: f64,
        quantity: f64,
        reserved_cash: f64,
        binding: BindingConstraint,
        client_order_id: String,
        timestamp: DateTime<Utc>,
    },
    PositionOpened {
        symbol: Symbol,
        direction: Direction,
        entry_price: f64,
        quantity: f64,
        order_id: Option<String>,
        timestamp: DateTime<Utc>,
    },
    ExitSignalled {
        symbol: Symbol,
        reason: ExitReason,
        price: f64,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },
    ExitRetry {
        symbol: Symbol,
        error: String,
        attempt: u32,
    },
    PositionClosed {
        position: ClosedPosition,
        daily_pnl: f64,
        cooldown_until: Option<DateTime<Utc>>,
        kill_switch_engaged: bool,
    },
    PositionErrored {
        position: ErroredPosition,
    },
    TickDropped {
        symbol: Symbol,
        last: DateTime<Utc>,
        got: DateTime<Utc>,
    },
}

impl EngineEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            EngineEvent::RangeStarted { .. } => "range_started",
            EngineEvent::RangeLocked { .. } => "range_locked",
            EngineEvent::EntryRejected { .. } => "entry_rejected",
            EngineEvent::EntryBlocked { .. } => "entry_blocked",
            EngineEvent::EntrySignalled { .. } => "entry_signalled",
            EngineEvent::PositionOpened { .. } => "position_opened",
            EngineEvent::ExitSignalled { .. } => "exit_signalled",
            EngineEvent::ExitRetry { .. } => "exit_retry",
            EngineEvent::PositionClosed { .. } => "position_closed",
            EngineEvent::PositionErrored { .. } => "position_errored",
            EngineEvent::TickDropped { .. } => "tick_dropped",
        }
    }
}

pub trait EventSink: Send + Sync {
    fn publish(&self, event: &EngineEvent);

    fn flush(&self) {}
}

/// Mirrors events to tracing
pub struct TracingSink;

impl EventSink for TracingSink {
    fn publish(&self, event: &EngineEvent) {
        match event {
            EngineEvent::RangeStarted { symbol, price, .. } => {
                debug!(%symbol, price, "range building");
            }
            EngineEvent::RangeLocked { symbol, high, low, tick_count, valid_until, .. } => {
                info!("🔒 {} range locked [{:.4}, {:.4}] after {} ticks, valid until {}", symbol, low, high, tick_count, valid_until);
            }
            EngineEvent::EntryRejected { symbol, reason, price, .. } => {
                debug!(%symbol, %reason, price, "entry rejected");
            }
            EngineEvent::EntryBlocked { symbol, reason, .. } => {
                info!("🚫 {} entry blocked: {}", symbol, reason);
            }
            EngineEvent::EntrySignalled { symbol, direction, price, quantity, binding, .. } => {
                info!("📈 {} ENTER {} x{} @ {:.4} (sized by {})", symbol, direction, quantity, price, binding);
            }
            EngineEvent::PositionOpened { symbol, direction, entry_price, quantity, .. } => {
                info!("✅ {} {} open x{} @ {:.4}", symbol, direction, quantity, entry_price);
            }
            EngineEvent::ExitSignalled { symbol, reason, price, attempt, .. } => {
                info!("📉 {} EXIT {} @ {:.4} (attempt {})", symbol, reason, price, attempt);
            }
            EngineEvent::ExitRetry { symbol, error, attempt } => {
                warn!("🔁 {} exit attempt {} failed: {}", symbol, attempt, error);
            }
            EngineEvent::PositionClosed { position, daily_pnl, .. } => {
                info!(
                    "💰 {} closed {} @ {:.4} ({}) | P&L {:.2} ({:.3}%) | day {:.2}",
                    position.id.symbol,
                    position.direction,
                    position.exit_price,
                    position.exit_reason,
                    position.pnl,
                    position.pnl_pct * 100.0,
                    daily_pnl
                );
            }
            EngineEvent::PositionErrored { position } => {
                warn!("❌ {} position error: {}", position.id.symbol, position.error_message);
            }
            EngineEvent::TickDropped { symbol, last, got } => {
                warn!("⏪ {} out-of-order tick dropped: {} after {}", symbol, got, last);
            }
        }
    }
}

/// Append-only JSON-lines journal
pub struct JsonlJournal {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
    include_rejections: bool,
}

impl JsonlJournal {
    pub fn open(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
            include_rejections: false,
        })
    }

    /// Also journal per-tick entry rejections
    pub fn with_rejections(mut self) -> Self {
        self.include_rejections = true;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read a journal back
    pub fn read_all(path: impl AsRef<Path>) -> EngineResult<Vec<EngineEvent>> {
        let raw = std::fs::read_to_string(path)?;
        raw.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| {
                serde_json::from_str(l)
                    .map_err(|e| EngineError::Configuration(format!("bad journal line: {}", e)))
            })
            .collect()
    }
}

impl EventSink for JsonlJournal {
    fn publish(&self, event: &EngineEvent) {
        if !self.include_rejections && matches!(event, EngineEvent::EntryRejected { .. }) {
            return;
        }
        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(e) => {
                warn!("Failed to serialize {} event: {}", event.kind(), e);
                return;
            }
        };
        let mut writer = self.writer.lock();
        if let Err(e) = writeln!(writer, "{}", line).and_then(|_| writer.flush()) {
            warn!("Failed to write journal {}: {}", self.path.display(), e);
        }
    }

    fn flush(&self) {
        if let Err(e) = self.writer.lock().flush() {
            warn!("Failed to flush journal {}: {}", self.path.display(), e);
        }
    }
}

/// Keeps every event in memory
#[derive(Default)]
pub struct MemorySink {
    events: RwLock<Vec<EngineEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.read().clone()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.events.read().iter().filter(|e| e.kind() == kind).count()
    }
}

impl EventSink for MemorySink {
    fn publish(&self, event: &EngineEvent) {
        self.events.write().push(event.clone());
    }
}

/// Fans events out to every registered sink
#[derive(Default, Clone)]
pub struct EventBus {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn add_sink(&mut self, sink: Arc<dyn EventSink>) {
        self.sinks.push(sink);
    }

    pub fn publish(&self, event: EngineEvent) {
        for sink in &self.sinks {
            sink.publish(&event);
        }
    }

    pub fn flush(&self) {
        for sink in &self.sinks {
            sink.flush();
        }
    }
}
