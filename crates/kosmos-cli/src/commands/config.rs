//! Configuration commands

use std::path::Path;

use anyhow::{Context, Result};

use super::{ConfigCommands, load_config};
use crate::output;

pub fn execute(cmd: &ConfigCommands, json: bool, config: Option<&Path>) -> Result<()> {
    match cmd {
        ConfigCommands::Validate { path } => validate(path, json),
        ConfigCommands::Show => show(config, json),
    }
}

fn validate(path: &Path, json: bool) -> Result<()> {
    let config = load_config(Some(path))?;
    let modules = config.tree.resolve().map_err(crate::error::CliError::from)?;
    output::print_modules(&modules, json);
    Ok(())
}

fn show(path: Option<&Path>, json: bool) -> Result<()> {
    let config = load_config(path)?;
    if json {
        let value = serde_json::to_string_pretty(&config).context("serialising configuration")?;
        println!("{value}");
    } else {
        let yaml = config.to_yaml().map_err(crate::error::CliError::from)?;
        print!("{yaml}");
    }
    Ok(())
}
