//! Command implementations for kosmosctl

pub mod config;
pub mod demo;
pub mod status;
pub mod tree;

use std::path::Path;

use clap::Subcommand;
use kosmos_core::config::ResolvedModule;
use kosmos_core::{KosmosConfig, ModuleConfig};
use tracing::debug;

use crate::error::CliError;

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Load and validate a configuration file
    Validate {
        /// YAML or JSON configuration file
        path: std::path::PathBuf,
    },

    /// Print the effective configuration as YAML
    Show,
}

#[derive(Subcommand)]
pub enum DemoCommands {
    /// Press and release one key on the keyboard matrix
    Keystroke {
        /// Key name from the keyboard layout
        #[arg(short, long, default_value = "A")]
        key: String,
        /// Time between press and release
        #[arg(long, default_value_t = 50)]
        hold_ms: u64,
        /// Extra runs of the same program
        #[arg(short, long, default_value_t = 0)]
        repeat: u32,
        /// Print the PES program before playing it
        #[arg(long)]
        listing: bool,
    },

    /// Move the first optical sensor
    Sensor {
        #[arg(long, default_value_t = 1, allow_hyphen_values = true)]
        dx: i16,
        #[arg(long, default_value_t = 1, allow_hyphen_values = true)]
        dy: i16,
        /// Idle frames before the motion
        #[arg(long, default_value_t = 0)]
        skip: u16,
        /// Extra frames repeating the motion
        #[arg(long, default_value_t = 0)]
        frames: u16,
        /// Send raw register writes instead of compressed entries
        #[arg(long)]
        raw: bool,
    },

    /// Capture a scripted LED pattern with the first LED spy
    Leds {
        /// Capture window
        #[arg(long, default_value_t = 10)]
        window_ms: u64,
    },
}

/// Load `path`, or fall back to the reference instrument.
pub fn load_config(path: Option<&Path>) -> Result<KosmosConfig, CliError> {
    match path {
        Some(path) => {
            debug!(path = %path.display(), "loading configuration");
            Ok(KosmosConfig::from_path(path)?)
        }
        None => Ok(KosmosConfig::reference()),
    }
}

/// First fitted module matching `kind`.
pub fn first_module(
    config: &KosmosConfig,
    kind: fn(&ModuleConfig) -> bool,
    base: &str,
) -> Result<ResolvedModule, CliError> {
    config
        .tree
        .resolve()?
        .into_iter()
        .find(|m| kind(&m.config))
        .ok_or_else(|| CliError::ModuleNotFitted(base.to_string()))
}
