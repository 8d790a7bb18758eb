//! kosmosctl - Kosmos instrument control CLI
//!
//! Validates instrument configurations, dumps Device Trees, queries a live
//! sequencer and plays demo scenarios on the simulated FPGA.

mod commands;
mod completion;
mod error;
mod output;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::commands::{ConfigCommands, DemoCommands};
use crate::error::CliError;

#[derive(Parser)]
#[command(name = "kosmosctl")]
#[command(about = "Kosmos instrument control CLI - configurations, device trees and demo runs")]
#[command(version)]
#[command(long_about = "
kosmosctl drives the Kosmos FPGA hardware-in-the-loop instrument.
It validates instrument configurations, prints the Device Tree built from
them, queries the sequencer of a live instrument and plays demo scenarios
on the simulated FPGA.

Use --json for machine-readable output suitable for scripting.
")]
struct Cli {
    /// Output in JSON format for machine parsing
    #[arg(long, global = true)]
    json: bool,

    /// Verbose logging
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Instrument configuration (reference instrument when absent)
    #[arg(short, long, global = true, env = "KOSMOS_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Configuration commands
    #[command(subcommand)]
    Config(ConfigCommands),

    /// Print the Device Tree: modules, message ids and event allocation
    Tree,

    /// Query the sequencer status of a live instrument
    Status {
        /// Soft-CPU link address
        #[arg(long, value_name = "HOST:PORT")]
        connect: String,
    },

    /// Play a demo scenario on the simulated FPGA
    #[command(subcommand)]
    Demo(DemoCommands),

    /// Generate shell completion scripts
    Completion {
        /// Shell to generate completion for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("kosmosctl={log_level},kosmos_core={log_level}").into()
            }),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    match execute_command(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if cli.json {
                output::print_error_json(&e);
            } else {
                output::print_error_human(&e);
            }
            let code = e.downcast_ref::<CliError>().map_or(1, CliError::exit_code);
            ExitCode::from(code)
        }
    }
}

fn execute_command(cli: &Cli) -> Result<()> {
    let config = cli.config.as_deref();
    match &cli.command {
        Commands::Config(cmd) => commands::config::execute(cmd, cli.json, config),
        Commands::Tree => commands::tree::execute(config, cli.json),
        Commands::Status { connect } => commands::status::execute(connect, config, cli.json),
        Commands::Demo(cmd) => commands::demo::execute(cmd, cli.json, config),
        Commands::Completion { shell } => {
            completion::generate_completion(*shell);
            Ok(())
        }
    }
}
