//! Kosmos FPGA link protocol.
//!
//! This crate is intentionally I/O-free. It provides the frame codec, the
//! message dispatch table, status records and the instruction codecs of
//! every module, as pure functions and types that can be tested without
//! hardware.
//!
//! # Key Features
//! - Framed, CRC-32 checked control and bulk messages
//! - Reply classes keyed on (message id, command id), frozen after tree construction
//! - Status records decoded into a sum type with per-shape capabilities
//! - PES, KBD matrix, button/axis and optical emulator instruction codecs
//! - PES delay encoder (DELAY / SUBDELAY / EXECUTE split)
//! - LED spy, I²C spy and timer capture parsing

#![deny(static_mut_refs)]

pub mod bas;
pub mod capture;
pub mod error;
pub mod frame;
pub mod ids;
pub mod kbd;
pub mod optemu;
pub mod pes;
pub mod reply;
pub mod status;
pub mod table;

pub use bas::{BasCommand, BasInstruction};
pub use capture::{
    I2cEvent, I2cEventKind, I2cFrame, I2cSpyEntry, LedEvent, LedSpyEntry, TimerId,
    group_i2c_frames, parse_i2c_entries, parse_led_entries,
};
pub use error::{ProtocolError, ProtocolResult};
pub use frame::{Frame, FrameDecoder};
pub use ids::{ReturnCode, cmd, msg_id, timer_cmd};
pub use kbd::{KbdCommand, KbdInstruction, MatrixCoord, MatrixGeometry};
pub use optemu::{OptEmuInstruction, opt_cmd};
pub use pes::{
    MarkerOps, PesInstruction, encode_delay, encode_delay_within, execution_duration_ticks,
};
pub use reply::{Reply, ReturnCodeReply};
pub use status::{
    Capabilities, CaptureState, ConsumerStatus, ModuleStatus, PesStatus, ProducerStatus,
    SequencerState, SequencerStatus, StatusEntry, StatusFlags, StatusRecord, StatusShape,
    TimerStatus,
};
pub use table::{Endpoint, EndpointRole, MessageTable, MessageTableBuilder, ReplyKind};
