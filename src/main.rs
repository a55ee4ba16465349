//! Drive the flash filesystem object registry under concurrent load.
use std::path::PathBuf;
use std::sync::OnceLock;

use clap::{Parser, Subcommand};
use flash_registry::Registry;
use tracing::{debug, error, info};

mod app_config;
mod churn;
mod trc;

use crate::app_config::Config;
use crate::churn::InodeInfo;
use crate::trc::Trc;

static REGISTRY: OnceLock<Registry<InodeInfo>> = OnceLock::new();

#[derive(Parser)]
#[command(version, about = "Object registry for flash filesystem nodes.")]
struct Args {
    #[arg(
        short,
        long,
        value_parser,
        help = "Optional path to a flash-registry config TOML."
    )]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the concurrent churn workload against a fresh registry.
    Churn {
        /// Number of worker threads.
        #[arg(short, long)]
        threads: Option<usize>,

        /// Rounds performed by each worker.
        #[arg(short, long)]
        iterations: Option<usize>,
    },

    /// Print the effective configuration.
    ShowConfig,
}

/// Main entry point for the application.
fn main() {
    let args = Args::parse();

    // Errors use eprintln since tracing isn't initialized yet.
    let mut config = Config::load_or_default(args.config_path.as_deref()).unwrap_or_else(|e| {
        eprintln!("Failed to load configuration: {e}");
        std::process::exit(1);
    });

    let command = args.command.unwrap_or(Command::Churn {
        threads: None,
        iterations: None,
    });
    if let Command::Churn {
        threads,
        iterations,
    } = &command
    {
        if let Some(threads) = threads {
            config.churn.threads = *threads;
        }
        if let Some(iterations) = iterations {
            config.churn.iterations = *iterations;
        }
    }

    if let Err(error_messages) = config.validate() {
        eprintln!("Configuration is invalid.");
        for msg in &error_messages {
            eprintln!(" - {msg}");
        }
        std::process::exit(1);
    }

    if let Err(e) = Trc::default().init() {
        eprintln!(
            "Failed to initialize logging. Without logging, we can't provide any useful error \
             messages, so we have to exit: {e}"
        );
        std::process::exit(1);
    }

    match command {
        Command::Churn { .. } => {
            debug!(config = ?config, "Starting churn with configuration...");
            let registry = match Registry::init(&REGISTRY, config.registry.clone()) {
                Ok(registry) => registry,
                Err(e) => {
                    error!("Failed to initialize the registry: {e}");
                    std::process::exit(1);
                }
            };

            let report = match churn::run(registry, &config.churn) {
                Ok(report) => report,
                Err(e) => {
                    error!("Churn failed: {e}");
                    std::process::exit(1);
                }
            };
            info!(
                created = report.created,
                destroyed = report.destroyed,
                "churn finished"
            );

            match toml::to_string_pretty(&report) {
                Ok(rendered) => print!("{rendered}"),
                Err(e) => {
                    error!("Failed to render churn report: {e}");
                    std::process::exit(1);
                }
            }
        }
        Command::ShowConfig => match config.to_toml() {
            Ok(rendered) => print!("{rendered}"),
            Err(e) => {
                error!("Failed to render configuration: {e}");
                std::process::exit(1);
            }
        },
    }
}
