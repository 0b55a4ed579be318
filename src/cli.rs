// ============================================================================
// CLI & COMMAND LINE INTERFACE
// ============================================================================
// Command-line front end for the console core:
// - `run` monitors a backend and prints periodic summaries
// - `replay` pushes recorded frames through the stores offline
// - Configuration validation / generation and version information
// ============================================================================

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use quanta::Clock;
use tracing::{info, warn};

use crate::channel::ConnectionStatus;
use crate::config::ConsoleConfig;
use crate::console::{Console, ConsoleState, DashboardSnapshot};
use crate::error::{ConsoleError, ConsoleResult};
use crate::types::Timestamp;
use crate::{CONSOLE_FULL_NAME, CONSOLE_VERSION};

// ----------------------------------------------------------------------------
// 1. CLI Argument Parser
// ----------------------------------------------------------------------------

/// Cerebro Console CLI
#[derive(Parser, Debug)]
#[command(
    name = "cerebro-console",
    author = "AIOps Team",
    version,
    about = "Telemetry ingestion and coherence core for the Cerebro operations console",
    long_about = "Keeps a live push channel to the Cerebro backend, polls the REST \
                  endpoints the channel does not cover, and reconciles metrics, \
                  alerts and workflow progress into one dashboard snapshot."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "cerebro-console.toml", env = "CEREBRO_CONSOLE_CONFIG")]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "CEREBRO_CONSOLE_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Connect to the backend and monitor until interrupted
    Run {
        /// Push channel URL (overrides `channel.url`)
        #[arg(long)]
        url: Option<String>,

        /// How often to print a summary
        #[arg(short, long, default_value = "10s", value_parser = humantime::parse_duration)]
        interval: Duration,
    },

    /// Feed newline-delimited JSON frames through the stores and print the
    /// resulting snapshot
    Replay {
        /// File with one frame per line
        file: PathBuf,

        /// Compact JSON output
        #[arg(long)]
        compact: bool,
    },

    /// Validate configuration file
    Validate {
        /// Show full parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate default configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show version and build info
    Version,
}

/// Load the config file when present, defaults otherwise
pub fn load_config(path: &Path) -> ConsoleResult<ConsoleConfig> {
    if path.exists() {
        Ok(ConsoleConfig::load(path)?)
    } else {
        warn!(target: "cerebro::init", path = %path.display(), "Config file not found, using defaults");
        Ok(ConsoleConfig::default())
    }
}

// ----------------------------------------------------------------------------
// 2. CLI Handler Functions
// ----------------------------------------------------------------------------

pub fn handle_validate(config_path: &Path, verbose: bool) -> ConsoleResult<()> {
    println!("Validating configuration file: {}", config_path.display());

    match ConsoleConfig::load(config_path) {
        Ok(config) => {
            println!("✅ Configuration is valid!");

            if verbose {
                println!("\n📋 Parsed configuration:");
                println!("{}", "=".repeat(60));
                match toml::to_string_pretty(&config) {
                    Ok(s) => println!("{s}"),
                    Err(e) => println!("Failed to serialize: {e}"),
                }
            }

            println!("\n📊 Configuration Summary:");
            println!("  • Instance name: {}", config.console.instance_name);
            if config.channel.enabled {
                println!("  • Push channel: {}", config.channel.url);
                println!("  • Subscriptions: {}", config.channel.subscriptions.join(", "));
            } else {
                println!("  • Push channel: disabled");
            }
            println!("  • Window: {} points per metric", config.metrics.max_data_points);
            println!("  • Alerts kept per source: {}", config.alerts.max_per_source);
            println!("  • Cache TTL: {}", humantime::format_duration(config.staleness.default_ttl));
            if config.polling.enabled {
                println!("  • Polled resources:");
                for spec in &config.polling.resources {
                    println!("    - {} every {}", spec.resource, humantime::format_duration(spec.interval));
                }
            } else {
                println!("  • Polling: disabled");
            }
            Ok(())
        }
        Err(e) => {
            println!("❌ Configuration validation failed!");
            println!("Error: {e}");
            Err(ConsoleError::Config(e))
        }
    }
}

pub fn handle_generate_config(output: Option<&Path>) -> ConsoleResult<()> {
    let config_str = ConsoleConfig::generate_default_config();

    match output {
        Some(path) => {
            fs::write(path, &config_str)?;
            println!("✅ Default configuration written to: {}", path.display());
        }
        None => println!("{config_str}"),
    }
    Ok(())
}

pub fn handle_version() {
    println!("📡 {CONSOLE_FULL_NAME} v{CONSOLE_VERSION}");
    println!();
    println!("Build Information:");
    println!("  • Target: {}", std::env::consts::ARCH);
    println!("  • OS: {}", std::env::consts::OS);
    println!("  • WebSocket transport: {}", cfg!(feature = "websocket"));
    println!();
    println!("License: MIT");
}

/// Replay recorded frames offline. Returns the resulting snapshot.
pub fn replay_frames(config: &ConsoleConfig, input: &str) -> DashboardSnapshot {
    let mut state = ConsoleState::new(config, Clock::new());
    let mut applied = 0usize;
    for line in input.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if state.apply_frame(line, Timestamp::now()).is_some() {
            applied += 1;
        }
    }
    info!(target: "cerebro::console", applied, dropped = state.normalizer_stats().dropped(), "Replay finished");
    state.snapshot(ConnectionStatus::disconnected(), Vec::new())
}

pub fn handle_replay(config: &ConsoleConfig, file: &Path, compact: bool) -> ConsoleResult<()> {
    let input = fs::read_to_string(file)?;
    let snapshot = replay_frames(config, &input);
    let rendered = if compact {
        serde_json::to_string(&snapshot)
    } else {
        serde_json::to_string_pretty(&snapshot)
    }
    .map_err(|e| ConsoleError::Internal(e.to_string()))?;
    println!("{rendered}");
    Ok(())
}

pub async fn handle_run(mut config: ConsoleConfig, url: Option<String>, interval: Duration) -> ConsoleResult<()> {
    if let Some(url) = url {
        config.channel.url = url;
    }
    let handle = Console::builder(config).start()?;
    let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!(target: "cerebro::console", "Interrupt received, shutting down");
                break;
            }
            _ = ticker.tick() => print_summary(&handle.snapshot()),
        }
    }

    handle.close().await
}

pub fn print_summary(snapshot: &DashboardSnapshot) {
    let connection = &snapshot.connection;
    println!(
        "━━ {} @ {} ━━ channel: {} (attempt {})",
        snapshot.instance,
        snapshot.generated_at,
        connection.indicator(),
        connection.attempt
    );
    for series in &snapshot.series {
        let summary = series.summary();
        match (summary.latest, summary.min, summary.max) {
            (Some(latest), Some(min), Some(max)) => println!(
                "  {:<28} latest {:>10.2}  min {:>10.2}  max {:>10.2}  ({} pts)",
                summary.name, latest.value, min, max, summary.count
            ),
            _ => println!("  {:<28} (no data)", summary.name),
        }
    }
    println!("  alerts: {} total, {} unread", snapshot.alerts.len(), snapshot.unread_alerts);
    for alert in snapshot.alerts.iter().take(5) {
        let ack = if alert.acknowledged { "ack" } else { "new" };
        println!("    [{:<9}] {:<11} {} {} ({ack})", alert.severity, alert.source, alert.id, alert.message);
    }
    for (key, freshness) in &snapshot.freshness {
        println!("  {key:<28} {freshness:?}");
    }
    if let Some(notification) = snapshot.notifications.last() {
        println!("  last notification: {}", notification.message());
    }
}
