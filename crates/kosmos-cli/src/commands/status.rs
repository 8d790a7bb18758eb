//! Sequencer status of a live instrument

use std::net::TcpStream;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use kosmos_core::sequencer::module_statuses;
use kosmos_core::{Kosmos, StreamTransport};
use tracing::info;

use super::load_config;
use crate::error::CliError;
use crate::output;

/// Query the sequencer over a TCP link to the soft-CPU.
pub fn execute(address: &str, config: Option<&Path>, json: bool) -> Result<()> {
    let config = load_config(config)?;
    let unreachable = |e: std::io::Error| CliError::Unreachable {
        address: address.to_string(),
        message: e.to_string(),
    };
    let stream = TcpStream::connect(address).map_err(unreachable)?;
    stream
        .set_read_timeout(Some(config.fpga.transport_timeout()))
        .map_err(unreachable)?;
    info!(address, "connected");

    let kosmos =
        Kosmos::new(config, Arc::new(StreamTransport::new(stream))).map_err(CliError::from)?;
    let status = kosmos.status().map_err(CliError::from)?;
    let modules = module_statuses(kosmos.tree().message_table(), &status);
    output::print_status(status.state, &modules, json);
    Ok(())
}
