//! # kosmos-core
//!
//! Host-side orchestration of a Kosmos FPGA hardware-in-the-loop instrument.
//!
//! The instrument stimulates a device under test (keyboard matrix, buttons
//! and analog axes, optical motion sensor) and captures what it does (LED activity, I²C traffic)
//! with tick-exact timing. Stimuli are not sent one by one: a scenario is
//! compiled into per-module instruction buffers plus a Programmable Event
//! Sequencer (PES) program, uploaded, and then played by the FPGA.
//!
//! ## Layout
//!
//! - [`config`]: instrument configuration (YAML/JSON, `serde`)
//! - [`transport`]: the [`Transport`] seam to the FPGA link
//! - [`module`]: host proxies of the hardware modules
//! - [`tree`]: the [`DeviceTree`] that owns every module
//! - [`sequencer`]: the `IDLE → RESET_DONE → INIT_DONE → RUNNING` state machine
//! - [`scenario`]: the [`Kosmos`] facade and the [`Scenario`] builder
//! - [`sim`]: an in-process [`SimulatedFpga`] for tests and demos
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//! use kosmos_core::{Kosmos, KosmosConfig, SimulatedFpga};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = KosmosConfig::builder()
//!     .poll_interval_ms(1)
//!     .module(kosmos_core::config::ModuleConfig::kbd_matrix())
//!     .build()?;
//! let sim = Arc::new(SimulatedFpga::new(&config)?);
//! let mut kosmos = Kosmos::new(config, sim.clone())?;
//!
//! kosmos.scenario().keystroke("A", Duration::from_millis(50))?;
//! kosmos.play()?;
//!
//! assert_eq!(sim.keyboard_reports().len(), 2);
//! # Ok(())
//! # }
//! ```

#![deny(
    unsafe_op_in_unsafe_fn,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic
)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod error_line;
pub mod events;
pub mod module;
pub mod scenario;
pub mod sequencer;
pub mod sim;
pub mod transport;
pub mod tree;

pub use config::{KosmosConfig, ModuleConfig};
pub use error_line::{ErrorLine, ErrorLineGuard, NullErrorLine};
pub use events::EventMap;
pub use module::{HardwareModule, Module, ModuleHandle, TimerOp};
pub use scenario::{Kosmos, Scenario};
pub use sequencer::{PlayOptions, Sequencer, build_status_report};
pub use sim::{
    ButtonAxisReport, KeyboardReport, MouseReport, SimErrorLine, SimulatedFpga, SpiTransfer,
};
pub use transport::{StreamTransport, Transport};
pub use tree::{DeviceTree, Slot};

pub use kosmos_errors::{KosmosError, KosmosResult};
