//! Output formatting for CLI responses

use anyhow::Error;
use colored::Colorize;
use kosmos_core::config::ResolvedModule;
use kosmos_core::{KeyboardReport, MouseReport, SpiTransfer};
use kosmos_protocol::{LedEvent, ModuleStatus, SequencerState};
use serde_json::{Value, json};

use crate::error::CliError;

fn print_json(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(s) => println!("{s}"),
        Err(e) => eprintln!("Failed to format output as JSON: {e}"),
    }
}

fn error_type_name(error: &Error) -> &'static str {
    match error.downcast_ref::<CliError>() {
        Some(CliError::InvalidConfiguration(_)) => "invalid_configuration",
        Some(CliError::Unreachable { .. }) => "unreachable",
        Some(CliError::ModuleNotFitted(_)) => "module_not_fitted",
        Some(CliError::RunFailed(e)) if e.is_timeout() => "timeout",
        Some(CliError::RunFailed(_)) => "run_failed",
        None => "error",
    }
}

/// Print error in JSON format
pub fn print_error_json(error: &Error) {
    print_json(&json!({
        "success": false,
        "error": {
            "message": error.to_string(),
            "type": error_type_name(error)
        }
    }));
}

/// Print error in human-readable format
pub fn print_error_human(error: &Error) {
    eprintln!("{} {}", "Error:".red().bold(), error);

    let mut source = error.source();
    while let Some(err) = source {
        eprintln!("  {} {}", "Caused by:".yellow(), err);
        source = err.source();
    }
}

fn module_json(module: &ResolvedModule) -> Value {
    json!({
        "name": module.name,
        "kind": module.config.base_name(),
        "msg_id": module.msg_id,
        "buffer_size": module.config.common().buffer_size,
        "fifo_size": module.config.common().fifo_size,
    })
}

/// Print the optional modules of a validated configuration.
pub fn print_modules(modules: &[ResolvedModule], json: bool) {
    if json {
        let modules: Vec<Value> = modules.iter().map(module_json).collect();
        print_json(&json!({ "success": true, "modules": modules }));
        return;
    }

    println!("{}", "Configuration OK".green().bold());
    if modules.is_empty() {
        println!("  {}", "No optional modules".yellow());
        return;
    }
    for module in modules {
        println!(
            "  {} {:<12} {}",
            format!("{:#04x}", module.msg_id).dimmed(),
            module.name.bold(),
            module.config.base_name()
        );
    }
}

/// Print a Device Tree dump.
pub fn print_tree(description: &str, modules: &[ResolvedModule], json: bool) {
    if json {
        let modules: Vec<Value> = modules.iter().map(module_json).collect();
        let lines: Vec<&str> = description.lines().collect();
        print_json(&json!({ "success": true, "modules": modules, "tree": lines }));
    } else {
        print!("{description}");
    }
}

/// Print the aggregated sequencer status.
pub fn print_status(state: SequencerState, modules: &[(String, ModuleStatus)], json: bool) {
    if json {
        let modules: Vec<Value> = modules
            .iter()
            .map(|(name, status)| {
                json!({
                    "name": name,
                    "fifo_count": status.fifo_count(),
                    "buffer_count": status.buffer_count(),
                    "overrun": status.overrun(),
                    "clean": status.is_clean(),
                })
            })
            .collect();
        print_json(&json!({
            "success": true,
            "state": state.name(),
            "modules": modules,
        }));
        return;
    }

    let state_name = match state {
        SequencerState::Error => state.name().red(),
        SequencerState::Running => state.name().yellow(),
        _ => state.name().green(),
    };
    println!("{} {}", "Sequencer:".bold(), state_name);
    for (name, status) in modules {
        let marker = if status.is_clean() {
            "●".green()
        } else {
            "●".red()
        };
        println!("  {marker} {name:<20} {status}");
    }
}

/// Print keyboard reports seen by the host side of the matrix.
pub fn print_keyboard_reports(reports: &[KeyboardReport], json: bool) {
    if json {
        let reports: Vec<Value> = reports
            .iter()
            .map(|r| {
                json!({
                    "run": r.run,
                    "tick": r.tick,
                    "modifiers": r.modifiers,
                    "keys": r.keys,
                })
            })
            .collect();
        print_json(&json!({ "success": true, "reports": reports }));
        return;
    }

    if reports.is_empty() {
        println!("{}", "No keyboard reports".yellow());
        return;
    }
    println!("{}", "Keyboard reports:".bold());
    for report in reports {
        let keys = if report.keys.is_empty() {
            "-".dimmed().to_string()
        } else {
            report.keys.join("+")
        };
        println!(
            "  run {} tick {:>10} modifiers {:#04x} keys {}",
            report.run, report.tick, report.modifiers, keys
        );
    }
}

/// Print mouse reports and the sensor register trace behind them.
pub fn print_sensor_output(reports: &[MouseReport], trace: &[SpiTransfer], json: bool) {
    if json {
        let reports: Vec<Value> = reports
            .iter()
            .map(|r| json!({ "run": r.run, "tick": r.tick, "dx": r.dx, "dy": r.dy }))
            .collect();
        let trace: Vec<Value> = trace
            .iter()
            .map(|t| json!({ "tick": t.tick, "register": t.register, "value": t.value }))
            .collect();
        print_json(&json!({ "success": true, "reports": reports, "spi": trace }));
        return;
    }

    println!("{}", "Mouse reports:".bold());
    if reports.is_empty() {
        println!("  {}", "none".yellow());
    }
    for report in reports {
        println!("  tick {:>10} dx {:>5} dy {:>5}", report.tick, report.dx, report.dy);
    }
    println!("{} {} register reads", "SPI:".bold(), trace.len());
}

/// Print LED spy events.
pub fn print_led_events(spy: &str, events: &[(u64, LedEvent)], json: bool) {
    if json {
        let events: Vec<Value> = events
            .iter()
            .map(|(ts, e)| json!({ "timestamp": ts, "channel": e.channel, "active": e.active }))
            .collect();
        print_json(&json!({ "success": true, "spy": spy, "events": events }));
        return;
    }

    println!("{} {}", spy.bold(), format!("({} events)", events.len()).dimmed());
    for (timestamp, event) in events {
        let level = if event.active {
            "on".green()
        } else {
            "off".dimmed()
        };
        println!("  {timestamp:>8} ch{:<2} {level}", event.channel);
    }
}
