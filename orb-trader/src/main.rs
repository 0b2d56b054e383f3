//! Opening-Range Tick Trader
//!
//! Wires a tick source (WebSocket feed or JSONL replay) and a broker (paper
//! or HTTP) around the strategy engine and runs one trading session.
//!
//! Commands:
//! - `run`: trade a session until the feed ends or Ctrl+C
//! - `check-config`: load and validate a TOML config, print the effective values

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use orb_bridge::{FeedConfig, HttpBrokerConfig, HttpExecutionAdapter, ReplayFeed, WebSocketTickFeed};
use orb_core::config::SizingPreset;
use orb_core::{
    EngineConfig, EventBus, ExecutionAdapter, JsonlJournal, PaperExecutionAdapter, PaperExecutionConfig,
    StrategyEngine, Tick, TracingSink, TradingSession, TradingStatistics,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const TICK_BUFFER: usize = 1024;
const API_KEY_ENV: &str = "BROKER_API_KEY";
const API_SECRET_ENV: &str = "BROKER_API_SECRET";

#[derive(Parser)]
#[command(name = "orb-trader", about = "Opening-range breakout tick trader")]
struct Cli {
    /// Log filter (e.g. info, debug, orb_core=trace). Overrides RUST_LOG.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Trade one session until the tick source ends or Ctrl+C.
    Run {
        /// Path to a TOML config file. Defaults apply to every missing key.
        #[arg(long)]
        config: Option<PathBuf>,

        /// WebSocket market data URL.
        #[arg(long, conflicts_with = "replay")]
        feed: Option<String>,

        /// Replay ticks from a JSONL file instead of a live feed.
        #[arg(long)]
        replay: Option<PathBuf>,

        /// Replay pacing multiplier (1.0 = recorded speed). Unpaced if omitted.
        #[arg(long, requires = "replay")]
        speed: Option<f64>,

        /// Symbols to trade. Replaces session.symbols from the config.
        #[arg(long = "symbol")]
        symbols: Vec<String>,

        /// Execution venue.
        #[arg(long, value_enum, default_value_t = BrokerKind::Paper)]
        broker: BrokerKind,

        /// Override the HTTP broker base URL.
        #[arg(long)]
        broker_url: Option<String>,

        /// HTTP broker API key. Falls back to BROKER_API_KEY.
        #[arg(long)]
        api_key: Option<String>,

        /// Use the live HTTP environment instead of demo.
        #[arg(long, default_value_t = false)]
        live: bool,

        /// Sizing preset: conservative, moderate, aggressive.
        #[arg(long)]
        preset: Option<String>,

        /// Starting cash for the session.
        #[arg(long)]
        starting_cash: Option<f64>,

        /// Append engine events to this JSONL file.
        #[arg(long)]
        journal: Option<PathBuf>,

        /// Also journal rejected entry signals.
        #[arg(long, default_value_t = false)]
        journal_rejections: bool,

        /// Write final statistics as JSON to this file.
        #[arg(long)]
        stats_out: Option<PathBuf>,
    },
    /// Load and validate a config file, then print the effective config.
    CheckConfig {
        /// Path to a TOML config file.
        #[arg(long)]
        config: PathBuf,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum BrokerKind {
    Paper,
    Http,
}

/// CLI values layered over the config file
#[derive(Default, Debug)]
struct Overrides {
    symbols: Vec<String>,
    preset: Option<String>,
    starting_cash: Option<f64>,
    journal: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref());

    match cli.command {
        Commands::CheckConfig { config } => check_config(&config),
        Commands::Run {
            config,
            feed,
            replay,
            speed,
            symbols,
            broker,
            broker_url,
            api_key,
            live,
            preset,
            starting_cash,
            journal,
            journal_rejections,
            stats_out,
        } => {
            let overrides = Overrides {
                symbols,
                preset,
                starting_cash,
                journal,
            };
            let config = load_config(config.as_deref(), &overrides)?;

            let source = match (feed, replay) {
                (Some(url), None) => TickSource::WebSocket(url),
                (None, Some(path)) => TickSource::Replay { path, speed },
                (None, None) => bail!("either --feed or --replay is required"),
                (Some(_), Some(_)) => bail!("--feed and --replay are mutually exclusive"),
            };
            let adapter = build_adapter(&config, broker, broker_url, api_key, live)?;
            let events = build_events(&config, journal_rejections)?;

            let shutdown = async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("Failed to listen for Ctrl+C: {}", e);
                    std::future::pending::<()>().await;
                }
            };
            let stats = run_session(config, source, adapter, events, shutdown).await?;
            report(&stats, stats_out.as_deref())
        }
    }
}

fn init_logging(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn check_config(path: &Path) -> Result<()> {
    let config = EngineConfig::load(path).with_context(|| format!("invalid config {}", path.display()))?;
    info!("✅ {} is valid", path.display());
    println!("{}", config.to_toml_string()?);
    Ok(())
}

/// Read the config file (or defaults), apply CLI overrides, validate
fn load_config(path: Option<&Path>, overrides: &Overrides) -> Result<EngineConfig> {
    let mut config = match path {
        Some(path) => EngineConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => EngineConfig::default(),
    };

    if !overrides.symbols.is_empty() {
        config.session.symbols = overrides.symbols.iter().map(|s| s.to_uppercase()).collect();
    }
    if let Some(preset) = &overrides.preset {
        config.sizing.preset = Some(preset.parse::<SizingPreset>()?);
    }
    if let Some(cash) = overrides.starting_cash {
        config.risk.starting_cash = cash;
    }
    if let Some(journal) = &overrides.journal {
        config.session.journal_path = Some(journal.clone());
    }

    config.validate()?;
    Ok(config)
}

fn build_adapter(
    config: &EngineConfig,
    broker: BrokerKind,
    broker_url: Option<String>,
    api_key: Option<String>,
    live: bool,
) -> Result<Arc<dyn ExecutionAdapter>> {
    match broker {
        BrokerKind::Paper => {
            info!("📝 Paper execution");
            Ok(Arc::new(PaperExecutionAdapter::new(PaperExecutionConfig::from(
                &config.execution,
            ))))
        }
        BrokerKind::Http => {
            let api_key = api_key
                .or_else(|| std::env::var(API_KEY_ENV).ok())
                .ok_or_else(|| anyhow!("--api-key or {} is required for the HTTP broker", API_KEY_ENV))?;
            let mut broker_config = if live {
                warn!("🔴 LIVE broker environment");
                HttpBrokerConfig::live(api_key)
            } else {
                HttpBrokerConfig::demo(api_key)
            };
            if let Some(url) = broker_url {
                broker_config = broker_config.with_base_url(url);
            }
            if let Ok(secret) = std::env::var(API_SECRET_ENV) {
                broker_config = broker_config.with_secret(secret);
            }
            Ok(Arc::new(HttpExecutionAdapter::new(broker_config)?))
        }
    }
}

fn build_events(config: &EngineConfig, journal_rejections: bool) -> Result<EventBus> {
    let mut events = EventBus::new().with_sink(Arc::new(TracingSink));
    if let Some(path) = &config.session.journal_path {
        let mut journal = JsonlJournal::open(path)?;
        if journal_rejections {
            journal = journal.with_rejections();
        }
        info!("📓 Journaling events to {}", path.display());
        events.add_sink(Arc::new(journal));
    }
    Ok(events)
}

enum TickSource {
    WebSocket(String),
    Replay { path: PathBuf, speed: Option<f64> },
}

impl TickSource {
    fn spawn(self, symbols: Vec<String>, sender: mpsc::Sender<Tick>) -> JoinHandle<Result<()>> {
        match self {
            TickSource::WebSocket(url) => {
                let feed = Arc::new(WebSocketTickFeed::new(FeedConfig::new(url, symbols)));
                let handle = feed.spawn(sender);
                tokio::spawn(async move { Ok(handle.await??) })
            }
            TickSource::Replay { path, speed } => {
                let mut replay = ReplayFeed::new(path);
                if let Some(speed) = speed {
                    replay = replay.paced(speed);
                }
                let handle = replay.spawn(sender);
                tokio::spawn(async move {
                    handle.await??;
                    Ok(())
                })
            }
        }
    }
}

async fn run_session<F>(
    config: EngineConfig,
    source: TickSource,
    adapter: Arc<dyn ExecutionAdapter>,
    events: EventBus,
    shutdown: F,
) -> Result<TradingStatistics>
where
    F: std::future::Future<Output = ()>,
{
    info!(
        "🚀 Starting opening-range session {} (lock {} ticks, {} max positions)",
        chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC"),
        config.range.lock_ticks,
        config.sizing.max_open_positions
    );

    let symbols = config.session.symbols.clone();
    let engine = Arc::new(StrategyEngine::new(config)?.with_events(events));
    let mut session = TradingSession::new(engine, adapter);

    let (tx, rx) = mpsc::channel(TICK_BUFFER);
    let feed = source.spawn(symbols, tx);

    let stats = session.run(rx, shutdown).await;

    // The session dropped its receiver, so the feed winds down on its own
    match tokio::time::timeout(Duration::from_secs(5), feed).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => warn!("⚠️ Tick source ended with error: {}", e),
        Ok(Err(e)) => warn!("⚠️ Tick source task failed: {}", e),
        Err(_) => warn!("⚠️ Tick source did not stop in time"),
    }

    stats
}

fn report(stats: &TradingStatistics, stats_out: Option<&Path>) -> Result<()> {
    let p = &stats.positions;
    info!("📊 Final statistics:");
    info!("  Ticks: {} processed, {} dropped", stats.ticks_processed, stats.ticks_dropped);
    info!(
        "  Signals: {} entries, {} exits, {} rejected, {} blocked",
        stats.entries_signalled, stats.exits_signalled, stats.entries_rejected, stats.entries_blocked
    );
    for (reason, count) in &stats.blocks_by_reason {
        info!("    blocked {:?}: {}", reason, count);
    }
    for (reason, count) in &stats.exits_by_reason {
        info!("    exit {:?}: {}", reason, count);
    }
    info!(
        "  Positions: {} closed, {} errors, win rate {:.1}%",
        p.total_closed,
        p.total_errors,
        p.win_rate
    );
    info!(
        "  P&L: realized {:.2}, daily {:.2}, equity {:.2}{}",
        p.realized_pnl,
        stats.daily_pnl,
        stats.equity,
        if stats.kill_switch_engaged { " (kill switch engaged)" } else { "" }
    );
    if stats.open_positions > 0 {
        warn!("⚠️ {} positions still open at shutdown", stats.open_positions);
    }

    if let Some(path) = stats_out {
        std::fs::write(path, serde_json::to_string_pretty(stats)?)
            .with_context(|| format!("writing {}", path.display()))?;
        info!("💾 Statistics written to {}", path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        std::fs::write(&path, "[session]\nsymbols = [\"MSFT\"]\n[risk]\nstarting_cash = 2000.0\n").unwrap();

        let overrides = Overrides {
            symbols: vec!["aapl".into(), "tsla".into()],
            preset: Some("aggressive".into()),
            ..Overrides::default()
        };
        let config = load_config(Some(&path), &overrides).unwrap();
        assert_eq!(config.session.symbols, vec!["AAPL", "TSLA"]);
        assert_eq!(config.sizing.reserve_pct(), 0.33);
        assert_eq!(config.risk.starting_cash, 2000.0);

        let bad = Overrides {
            starting_cash: Some(-1.0),
            ..Overrides::default()
        };
        assert!(load_config(None, &bad).is_err());
    }

    #[test]
    fn test_http_broker_requires_key() {
        std::env::remove_var(API_KEY_ENV);
        let config = EngineConfig::default();
        assert!(build_adapter(&config, BrokerKind::Http, None, None, false).is_err());

        let adapter = build_adapter(&config, BrokerKind::Http, None, Some("k".into()), true).unwrap();
        assert_eq!(adapter.name(), "http-live");
        assert_eq!(build_adapter(&config, BrokerKind::Paper, None, None, false).unwrap().name(), "paper");
    }

    #[test]
    fn test_replay_session_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let ticks = dir.path().join("ticks.jsonl");
        let lines: Vec<String> = (0..12)
            .map(|i| {
                format!(
                    r#"{{"symbol":"AAPL","price":{},"volume":100,"timestamp":"2024-03-01T14:30:{:02}Z"}}"#,
                    100.0 + f64::from(i % 3) / 10.0,
                    i
                )
            })
            .collect();
        std::fs::write(&ticks, lines.join("\n")).unwrap();

        let overrides = Overrides {
            symbols: vec!["AAPL".into()],
            journal: Some(dir.path().join("events.jsonl")),
            ..Overrides::default()
        };
        let mut config = load_config(None, &overrides).unwrap();
        config.range.lock_ticks = 5;
        config.execution.paper_latency_ms = 0;

        let adapter = build_adapter(&config, BrokerKind::Paper, None, None, false).unwrap();
        let events = build_events(&config, false).unwrap();
        let source = TickSource::Replay { path: ticks, speed: None };

        let stats = tokio_test::block_on(run_session(config, source, adapter, events, std::future::pending()))
            .unwrap();
        assert_eq!(stats.ticks_processed, 12);
        assert_eq!(stats.ticks_dropped, 0);

        let journal = JsonlJournal::read_all(dir.path().join("events.jsonl")).unwrap();
        assert!(journal.iter().any(|e| e.kind() == "range_locked"));

        let out = dir.path().join("stats.json");
        report(&stats, Some(&out)).unwrap();
        let written: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(out).unwrap()).unwrap();
        assert_eq!(written["ticks_processed"], 12);
    }
}
