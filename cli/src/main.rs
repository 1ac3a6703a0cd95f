// nearlink-cli: configuration and loopback demo driver
//
// Manages the coordinator configuration file and runs an in-process
// responder/initiator session over the loopback radio.

mod config;
mod demo;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use nearlink_core::RestorationSnapshot;
use std::path::PathBuf;
use std::time::Duration;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "nearlink-cli")]
#[command(about = "Nearlink: wireless peer discovery and exchange", long_about = None)]
#[command(version)]
struct Cli {
    /// Also write logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Run a responder and an initiator against each other in-process
    Demo {
        /// Request text the responder publishes
        #[arg(short, long)]
        text: String,
        /// Forced link drops after the first delivery
        #[arg(short, long, default_value = "0")]
        repeat: u32,
        #[arg(short, long = "config")]
        config_path: Option<PathBuf>,
        /// Seconds to wait for each discovery to settle
        #[arg(long, default_value = "5")]
        wait: u64,
        /// Relaunch snapshot (JSON) to adopt before starting
        #[arg(long)]
        restore: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write the default configuration
    Init {
        path: PathBuf,
        #[arg(long)]
        force: bool,
    },
    /// Validate and print a configuration
    Show { path: PathBuf },
    /// Change one dotted key, e.g. `initiator.auto_connect false`
    Set {
        path: PathBuf,
        key: String,
        value: String,
    },
}

fn init_tracing(log_file: Option<&PathBuf>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let Some(path) = log_file else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        return Ok(None);
    };

    let directory = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    let file_name = path
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("Log file path has no file name: {}", path.display()))?;
    let appender = tracing_appender::rolling::never(directory, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(writer)
        .init();
    Ok(Some(guard))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = init_tracing(cli.log_file.as_ref())?;

    match cli.command {
        Commands::Config { action } => cmd_config(action),
        Commands::Demo {
            text,
            repeat,
            config_path,
            wait,
            restore,
        } => cmd_demo(text, repeat, config_path, wait, restore).await,
    }
}

fn cmd_config(action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Init { path, force } => {
            config::init(&path, force)?;
            println!("{} Wrote default configuration to {}", "✓".green(), path.display());
        }

        ConfigAction::Show { path } => {
            let loaded = config::load(&path)?;
            println!("{} ({})", "Configuration".bold(), path.display());
            println!();
            for (key, value) in config::list(&loaded)? {
                println!("  {:<40} {}", key.bright_cyan(), value);
            }
        }

        ConfigAction::Set { path, key, value } => {
            let current = config::load(&path)?;
            let updated = config::set(&current, &key, &value)?;
            updated.save(&path)?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }
    }
    Ok(())
}

async fn cmd_demo(
    text: String,
    repeat: u32,
    config_path: Option<PathBuf>,
    wait: u64,
    restore: Option<PathBuf>,
) -> Result<()> {
    let config = config::load_or_default(config_path.as_deref())?;
    let restore = restore
        .map(|path| {
            RestorationSnapshot::load(&path)
                .with_context(|| format!("Failed to load snapshot {}", path.display()))
        })
        .transpose()?;
    if restore.is_some() {
        println!("{} Adopting relaunch snapshot", "✓".green());
    }

    println!("{}", "Starting loopback session...".bold());
    let report = demo::run(demo::DemoOptions {
        text,
        repeat,
        config,
        wait: Duration::from_secs(wait),
        restore,
    })
    .await?;

    println!("  {} Connected to {}", "✓".green(), report.peer.to_string().bright_cyan());
    for request in &report.delivered {
        println!("  {} {}", "•".bright_green(), request.text.bright_yellow());
    }
    if report.reconnects > 0 {
        let suppressed = (report.reconnects as usize + 1).saturating_sub(report.delivered.len());
        println!(
            "  {} {} reconnects, {} repeated requests suppressed",
            "✓".green(),
            report.reconnects,
            suppressed
        );
    }
    Ok(())
}
