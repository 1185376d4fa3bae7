//! epochctl - inspect and drive epochguard coordination state
//!
//! Operates directly on the shared files and locks, so it sees exactly
//! what the processes of a deployment see.
//!
//! # Examples
//!
//! ```bash
//! # Current epoch of an instance
//! epochctl --base-path /var/lib/epochguard epoch get instance1
//!
//! # Force every process to re-validate instance1
//! epochctl epoch bump instance1
//!
//! # Bump the host-wide epoch
//! epochctl global bump
//!
//! # Try for an election slot and hold it for a minute
//! epochctl slot --hold-secs 60
//!
//! # Effective configuration as JSON
//! epochctl config --json
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use epochguard::config::CoordinationConfig;
use epochguard::epoch::{GlobalEpoch, InstanceEpochStore, MmapGlobalEpoch};
use epochguard::metrics::{export_metrics, register_metrics};
use epochguard::SlotAllocator;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Cross-process epoch and slot coordination tool
#[derive(Parser, Debug)]
#[command(name = "epochctl")]
#[command(version = epochguard::VERSION)]
#[command(about = "Inspect and drive epochguard coordination state", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML or JSON)
    #[arg(short, long, global = true, env = "EPOCHGUARD_CONFIG")]
    config: Option<PathBuf>,

    /// Override the configured base path
    #[arg(long, global = true)]
    base_path: Option<PathBuf>,

    /// Write logs to daily rolling files in this directory as well
    #[arg(long, global = true, env = "EPOCHGUARD_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Per-instance epochs
    Epoch {
        #[command(subcommand)]
        command: EpochCommands,
    },

    /// Host-wide epoch
    Global {
        #[command(subcommand)]
        command: GlobalCommands,
    },

    /// Take part in slot election
    Slot {
        /// Keep the slot for this many seconds before releasing it
        #[arg(long, default_value = "0")]
        hold_secs: u64,
    },

    /// Print the effective configuration
    Config {
        /// Render as JSON instead of TOML
        #[arg(long)]
        json: bool,
    },

    /// Print metrics in the Prometheus text format
    Metrics,
}

#[derive(Subcommand, Debug)]
enum EpochCommands {
    /// Print the epoch of an instance
    Get { instance: String },
    /// Increment the epoch of an instance
    Bump { instance: String },
}

#[derive(Subcommand, Debug)]
enum GlobalCommands {
    /// Print the global epoch
    Get,
    /// Increment the global epoch
    Bump,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _guard = setup_logging(&cli)?;
    register_metrics();

    let mut config = CoordinationConfig::load(cli.config.as_deref())
        .context("failed to load configuration")?;
    if let Some(base_path) = cli.base_path.clone() {
        config.base_path = base_path;
    }

    match cli.command {
        Commands::Epoch { command } => epoch_command(&config, command),
        Commands::Global { command } => global_command(&config, command),
        Commands::Slot { hold_secs } => slot_command(&config, hold_secs),
        Commands::Config { json } => {
            if json {
                println!("{}", serde_json::to_string_pretty(&config)?);
            } else {
                print!("{}", config.to_toml()?);
            }
            Ok(())
        }
        Commands::Metrics => {
            print!("{}", export_metrics());
            Ok(())
        }
    }
}

/// Console logging on stderr, plus a rolling file when a log dir is given
fn setup_logging(cli: &Cli) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let log_level = cli
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::WARN);
    let filter = EnvFilter::from_default_env().add_directive(log_level.into());

    let (file_layer, guard) = match &cli.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create log dir {}", dir.display()))?;
            let appender = RollingFileAppender::new(Rotation::DAILY, dir, "epochctl.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    let registry = tracing_subscriber::registry().with(filter).with(file_layer);
    match cli.log_format {
        LogFormat::Text => registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
    }

    Ok(guard)
}

fn epoch_command(config: &CoordinationConfig, command: EpochCommands) -> anyhow::Result<()> {
    let store = InstanceEpochStore::new(config)?;
    match command {
        EpochCommands::Get { instance } => {
            println!("{}", store.get_epoch(&instance));
        }
        EpochCommands::Bump { instance } => {
            let epoch = store
                .increment_epoch(&instance)
                .with_context(|| format!("failed to bump epoch of {}", instance))?;
            info!(instance = %instance, epoch, "Instance epoch bumped");
            println!("{}", epoch);
        }
    }
    Ok(())
}

fn global_command(config: &CoordinationConfig, command: GlobalCommands) -> anyhow::Result<()> {
    let global = MmapGlobalEpoch::open(config)?;
    match command {
        GlobalCommands::Get => println!("{}", global.current()),
        GlobalCommands::Bump => {
            let epoch = global.increment()?;
            info!(epoch, "Global epoch bumped");
            println!("{}", epoch);
        }
    }
    Ok(())
}

fn slot_command(config: &CoordinationConfig, hold_secs: u64) -> anyhow::Result<()> {
    let slot = SlotAllocator::new(config);
    if slot.has_slot() {
        println!(
            "slot {}{}",
            slot.slot_id(),
            if slot.is_leader() { " (leader)" } else { "" }
        );
    } else {
        warn!("All slots taken, running passive");
        println!("passive");
    }

    if hold_secs > 0 && slot.has_slot() {
        std::thread::sleep(Duration::from_secs(hold_secs));
    }
    slot.release();
    Ok(())
}
