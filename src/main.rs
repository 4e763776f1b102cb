//! rosmq - In-memory MQTT-class message broker core
//!
//! Usage:
//!   rosmq [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>     Configuration file path
//!   --max-inflight <N>      Inflight window per client
//!   --max-queued <N>        Offline queue capacity per client
//!   --max-qos <N>           Highest granted QoS (0, 1, or 2)
//!   -l, --log-level         Log level (error, warn, info, debug, trace)
//!   -h, --help              Print help

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use rosmq::broker::Broker;
use rosmq::config::Config;
use rosmq::hooks::DefaultHooks;
use rosmq::protocol::QoS;

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    #[default]
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

/// rosmq - in-memory message broker core
#[derive(Parser, Debug)]
#[command(name = "rosmq")]
#[command(version = "0.1.0")]
#[command(about = "In-memory MQTT-class message broker core")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Inflight window per client (QoS 1/2)
    #[arg(long)]
    max_inflight: Option<usize>,

    /// Offline queue capacity per client
    #[arg(long)]
    max_queued: Option<usize>,

    /// Highest granted QoS (0, 1, or 2)
    #[arg(long)]
    max_qos: Option<u8>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let file_config = if let Some(config_path) = &args.config {
        match Config::load(config_path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Error loading config file: {}", e);
                std::process::exit(1);
            }
        }
    } else {
        Config::from_env().unwrap_or_default()
    };

    // CLI overrides config, config overrides default
    let log_level = args.log_level.unwrap_or_else(|| {
        match file_config.log.level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "info" => LogLevel::Info,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    });

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    let mut options = file_config.broker_options();
    if let Some(max_inflight) = args.max_inflight {
        options.limits.max_inflight = max_inflight;
    }
    if let Some(max_queued) = args.max_queued {
        options.limits.max_queued = max_queued;
    }
    if let Some(max_qos) = args.max_qos {
        options.max_qos = match QoS::from_u8(max_qos) {
            Some(level) => level,
            None => {
                eprintln!("Invalid max-qos value: {}. Must be 0, 1, or 2.", max_qos);
                std::process::exit(1);
            }
        };
    }

    info!("Starting rosmq broker core");
    info!("  Max inflight: {}", options.limits.max_inflight);
    info!("  Max queued: {}", options.limits.max_queued);
    info!("  Max QoS: {:?}", options.max_qos);

    let broker = Arc::new(Broker::new(options, Arc::new(DefaultHooks)));

    let maintenance = tokio::spawn(broker.clone().run_maintenance());

    // Periodic stats log line, JSON-encoded for downstream scrapers
    let stats_broker = broker.clone();
    let stats_interval = file_config.log.stats_interval;
    let stats_task = (stats_interval > 0).then(|| {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(stats_interval));
            tick.tick().await; // skip the immediate first tick
            loop {
                tick.tick().await;
                let snapshot = stats_broker.stats_snapshot();
                match serde_json::to_string(&snapshot) {
                    Ok(json) => info!(stats = %json, "broker stats"),
                    Err(e) => tracing::warn!(%e, "stats serialization failed"),
                }
            }
        })
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    broker.shutdown();
    if let Some(task) = stats_task {
        task.abort();
    }
    maintenance.await?;

    info!("Broker stopped");
    Ok(())
}
