//! Engine configuration
//!
//! Every threshold the engine uses lives here. The whole tree deserializes from
//! TOML with per-field defaults, so a config file only needs the keys it changes.
//! Configuration is read once at session start and never mutated afterwards.

use crate::errors::{EngineError, EngineResult};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Upper bound for every duration setting (one week)
pub const MAX_DURATION_SECS: u64 = 7 * 24 * 60 * 60;

fn secs(value: u64) -> Duration {
    Duration::seconds(value.min(MAX_DURATION_SECS) as i64)
}

/// Opening range construction
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RangeConfig {
    /// Ticks needed before the range locks
    pub lock_ticks: u32,
    /// How long a locked range keeps producing entries
    pub validity_secs: u64,
}

impl Default for RangeConfig {
    fn default() -> Self {
        Self {
            lock_ticks: 60,
            validity_secs: 15 * 60,
        }
    }
}

impl RangeConfig {
    pub fn validity_window(&self) -> Duration {
        secs(self.validity_secs)
    }
}

/// Entry filters
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EntryConfig {
    pub history_capacity: usize,
    pub volatility_window: usize,
    pub min_volatility_pct: f64,
    pub direction_window: usize,
    pub min_direction_streak: usize,
    pub min_net_move_pct: f64,
    pub volume_spike_multiplier: f64,
    pub entry_zone_pct: f64,
    /// Spread may use at most this fraction of the profit target
    pub max_spread_vs_target: f64,
    pub allow_short: bool,
}

impl Default for EntryConfig {
    fn default() -> Self {
        Self {
            history_capacity: 120,
            volatility_window: 20,
            min_volatility_pct: 0.002,
            direction_window: 5,
            min_direction_streak: 3,
            min_net_move_pct: 0.0008,
            volume_spike_multiplier: 1.3,
            entry_zone_pct: 0.10,
            max_spread_vs_target: 0.5,
            allow_short: true,
        }
    }
}

/// Exit triggers
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExitConfig {
    pub stop_loss_pct: f64,
    pub profit_target_pct: f64,
    pub exit_zone_pct: f64,
    pub max_hold_secs: u64,
    pub breakeven_deadline_secs: u64,
    pub flat_ticks_threshold: u32,
}

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            stop_loss_pct: 0.0004,
            profit_target_pct: 0.0008,
            exit_zone_pct: 0.90,
            max_hold_secs: 10,
            breakeven_deadline_secs: 8,
            flat_ticks_threshold: 2,
        }
    }
}

impl ExitConfig {
    pub fn max_hold(&self) -> Duration {
        secs(self.max_hold_secs)
    }

    pub fn breakeven_deadline(&self) -> Duration {
        secs(self.breakeven_deadline_secs)
    }
}

/// Portfolio-wide risk limits
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RiskConfig {
    /// Negative fraction of start-of-day equity, e.g. -0.05
    pub daily_loss_limit_pct: f64,
    pub max_trades_per_hour: u32,
    pub cooldown_secs: u64,
    pub cooldown_after_losses: u32,
    pub starting_cash: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            daily_loss_limit_pct: -0.05,
            max_trades_per_hour: 15,
            cooldown_secs: 90,
            cooldown_after_losses: 2,
            starting_cash: 5000.0,
        }
    }
}

impl RiskConfig {
    pub fn cooldown(&self) -> Duration {
        secs(self.cooldown_secs)
    }
}

/// Named sizing presets. Each is the same reservation formula with a
/// different per-position reserve fraction.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SizingPreset {
    Conservative,
    Moderate,
    Aggressive,
}

impl SizingPreset {
    pub fn reserve_pct(&self) -> f64 {
        match self {
            SizingPreset::Conservative => 1.0,
            SizingPreset::Moderate => 0.5,
            SizingPreset::Aggressive => 0.33,
        }
    }
}

impl std::str::FromStr for SizingPreset {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "conservative" => Ok(SizingPreset::Conservative),
            "moderate" => Ok(SizingPreset::Moderate),
            "aggressive" => Ok(SizingPreset::Aggressive),
            other => Err(EngineError::Configuration(format!(
                "unknown sizing preset '{}'",
                other
            ))),
        }
    }
}

/// Position sizing policy
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SizingPolicy {
    /// Overrides `cash_reserve_per_position_pct` when set
    pub preset: Option<SizingPreset>,
    pub max_open_positions: usize,
    pub cash_reserve_per_position_pct: f64,
    pub per_trade_risk_pct: f64,
    /// Quantity used when no stop price is known
    pub base_size: f64,
    pub min_size: f64,
    pub max_position_notional: f64,
}

impl Default for SizingPolicy {
    fn default() -> Self {
        Self {
            preset: None,
            max_open_positions: 3,
            cash_reserve_per_position_pct: 1.0,
            per_trade_risk_pct: 0.005,
            base_size: 75.0,
            min_size: 1.0,
            max_position_notional: 5000.0,
        }
    }
}

impl SizingPolicy {
    pub fn reserve_pct(&self) -> f64 {
        self.preset
            .map(|p| p.reserve_pct())
            .unwrap_or(self.cash_reserve_per_position_pct)
    }
}

/// Execution dispatch
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExecutionConfig {
    pub timeout_ms: u64,
    /// Failed exits are retried on later ticks until this many attempts
    pub max_exit_attempts: u32,
    pub paper_latency_ms: u64,
    /// Percentage slippage applied by the paper adapter
    pub paper_slippage_pct: f64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            max_exit_attempts: 3,
            paper_latency_ms: 50,
            paper_slippage_pct: 0.0,
        }
    }
}

impl ExecutionConfig {
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.timeout_ms)
    }
}

/// Session wiring
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    pub symbols: Vec<String>,
    pub journal_path: Option<PathBuf>,
}

/// Complete engine configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub range: RangeConfig,
    pub entry: EntryConfig,
    pub exit: ExitConfig,
    pub risk: RiskConfig,
    pub sizing: SizingPolicy,
    pub execution: ExecutionConfig,
    pub session: SessionConfig,
}

impl EngineConfig {
    /// Read, parse and validate a TOML config file
    pub fn load(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> EngineResult<Self> {
        let config: EngineConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> EngineResult<String> {
        toml::to_string_pretty(self).map_err(|e| EngineError::Configuration(e.to_string()))
    }

    /// Reject thresholds the engine cannot run with
    pub fn validate(&self) -> EngineResult<()> {
        let e = &self.entry;
        let x = &self.exit;
        let r = &self.risk;
        let s = &self.sizing;

        ensure(self.range.lock_ticks >= 1, "range.lock_ticks must be at least 1")?;
        ensure(self.range.validity_secs > 0, "range.validity_secs must be positive")?;
        ensure(
            self.range.validity_secs <= MAX_DURATION_SECS,
            "range.validity_secs must not exceed one week",
        )?;

        ensure(e.history_capacity >= 2, "entry.history_capacity must be at least 2")?;
        ensure(
            e.volatility_window >= 2 && e.volatility_window <= e.history_capacity,
            "entry.volatility_window must be in [2, history_capacity]",
        )?;
        ensure(
            e.direction_window >= 2 && e.direction_window < e.history_capacity,
            "entry.direction_window must be in [2, history_capacity)",
        )?;
        ensure(
            e.min_direction_streak >= 1 && e.min_direction_streak < e.direction_window,
            "entry.min_direction_streak must be in [1, direction_window)",
        )?;
        ensure(e.min_volatility_pct >= 0.0, "entry.min_volatility_pct must be non-negative")?;
        ensure(e.min_net_move_pct >= 0.0, "entry.min_net_move_pct must be non-negative")?;
        ensure(
            e.volume_spike_multiplier >= 0.0,
            "entry.volume_spike_multiplier must be non-negative",
        )?;
        ensure(
            e.entry_zone_pct > 0.0 && e.entry_zone_pct <= 1.0,
            "entry.entry_zone_pct must be in (0, 1]",
        )?;
        ensure(e.max_spread_vs_target > 0.0, "entry.max_spread_vs_target must be positive")?;

        ensure(x.stop_loss_pct > 0.0, "exit.stop_loss_pct must be positive")?;
        ensure(x.profit_target_pct > 0.0, "exit.profit_target_pct must be positive")?;
        ensure(
            x.exit_zone_pct > 0.0 && x.exit_zone_pct <= 1.0,
            "exit.exit_zone_pct must be in (0, 1]",
        )?;
        ensure(
            e.entry_zone_pct < x.exit_zone_pct,
            "entry.entry_zone_pct must be below exit.exit_zone_pct",
        )?;
        ensure(x.max_hold_secs > 0, "exit.max_hold_secs must be positive")?;
        ensure(
            x.max_hold_secs <= MAX_DURATION_SECS,
            "exit.max_hold_secs must not exceed one week",
        )?;
        ensure(
            x.breakeven_deadline_secs <= x.max_hold_secs,
            "exit.breakeven_deadline_secs must not exceed exit.max_hold_secs",
        )?;
        ensure(x.flat_ticks_threshold >= 1, "exit.flat_ticks_threshold must be at least 1")?;

        ensure(
            r.daily_loss_limit_pct < 0.0 && r.daily_loss_limit_pct > -1.0,
            "risk.daily_loss_limit_pct must be in (-1, 0)",
        )?;
        ensure(r.max_trades_per_hour >= 1, "risk.max_trades_per_hour must be at least 1")?;
        ensure(r.cooldown_after_losses >= 1, "risk.cooldown_after_losses must be at least 1")?;
        ensure(
            r.cooldown_secs <= MAX_DURATION_SECS,
            "risk.cooldown_secs must not exceed one week",
        )?;
        ensure(r.starting_cash > 0.0, "risk.starting_cash must be positive")?;

        ensure(s.max_open_positions >= 1, "sizing.max_open_positions must be at least 1")?;
        let reserve = s.reserve_pct();
        ensure(
            reserve > 0.0 && reserve <= 1.0,
            "sizing.cash_reserve_per_position_pct must be in (0, 1]",
        )?;
        ensure(
            s.per_trade_risk_pct > 0.0 && s.per_trade_risk_pct < 1.0,
            "sizing.per_trade_risk_pct must be in (0, 1)",
        )?;
        ensure(s.base_size >= s.min_size, "sizing.base_size must be at least min_size")?;
        ensure(s.min_size >= 0.0, "sizing.min_size must be non-negative")?;
        ensure(
            s.max_position_notional > 0.0,
            "sizing.max_position_notional must be positive",
        )?;

        ensure(self.execution.timeout_ms > 0, "execution.timeout_ms must be positive")?;
        ensure(
            self.execution.max_exit_attempts >= 1,
            "execution.max_exit_attempts must be at least 1",
        )?;

        for symbol in &self.session.symbols {
            ensure(
                crate::market::Symbol::new(symbol.as_str()).validate(),
                &format!("session.symbols contains invalid symbol '{}'", symbol),
            )?;
        }

        Ok(())
    }
}

fn ensure(condition: bool, message: &str) -> EngineResult<()> {
    if condition {
        Ok(())
    } else {
        Err(EngineError::Configuration(message.to_string()))
    }
}
