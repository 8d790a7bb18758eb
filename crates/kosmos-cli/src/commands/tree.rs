//! Device Tree dump

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use kosmos_core::{DeviceTree, SimulatedFpga};

use super::load_config;
use crate::error::CliError;
use crate::output;

/// Build the tree against the simulator and print it.
pub fn execute(config: Option<&Path>, json: bool) -> Result<()> {
    let config = load_config(config)?;
    let modules = config.tree.resolve().map_err(CliError::from)?;
    let sim = Arc::new(SimulatedFpga::new(&config).map_err(CliError::from)?);
    let tree = DeviceTree::build(&config, sim).map_err(CliError::from)?;
    output::print_tree(&tree.describe(), &modules, json);
    Ok(())
}
