//! Message dispatch table.
//!
//! The reply class of a control message is fixed per (message id, command
//! id). The table starts with the core modules, is extended with the
//! optional modules while the Device Tree is built, and is then frozen
//! into an immutable [`MessageTable`] shared with the transport.

use std::collections::BTreeMap;

use crate::error::{ProtocolError, ProtocolResult};
use crate::ids::{cmd, msg_id, timer_cmd};
use crate::status::StatusShape;

/// Bytes per PES, KBD or optical-emulator instruction.
pub const INSTRUCTION_WIDTH: usize = 4;

/// Bytes per timer entry.
pub const TIMER_ENTRY_WIDTH: usize = 8;

/// What kind of endpoint sits behind a message id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointRole {
    Sequencer,
    Timers,
    Module(StatusShape),
}

/// One registered message id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub name: String,
    pub role: EndpointRole,
    /// Bulk instruction width in bytes, 0 when the module accepts no bulk.
    pub inst_width: usize,
    /// Read entry width in bytes, 0 when the module produces nothing.
    pub entry_width: usize,
}

/// Reply class of a control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    SequencerStatus,
    ModuleStatus(StatusShape),
    TimerStatus,
    Entries { width: usize },
}

/// Builder for [`MessageTable`], pre-loaded with the core modules.
#[derive(Debug, Clone)]
pub struct MessageTableBuilder {
    endpoints: BTreeMap<u8, Endpoint>,
}

impl Default for MessageTableBuilder {
    fn default() -> Self {
        let mut endpoints = BTreeMap::new();
        endpoints.insert(
            msg_id::SEQUENCER,
            Endpoint {
                name: "SEQUENCER".to_string(),
                role: EndpointRole::Sequencer,
                inst_width: 0,
                entry_width: 0,
            },
        );
        endpoints.insert(
            msg_id::PES,
            Endpoint {
                name: "PES".to_string(),
                role: EndpointRole::Module(StatusShape::Pes),
                inst_width: INSTRUCTION_WIDTH,
                entry_width: 0,
            },
        );
        endpoints.insert(
            msg_id::PES_TIMER,
            Endpoint {
                name: "TIMERS".to_string(),
                role: EndpointRole::Timers,
                inst_width: 0,
                entry_width: TIMER_ENTRY_WIDTH,
            },
        );
        Self { endpoints }
    }
}

impl MessageTableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an optional module in the dynamic range.
    pub fn register(&mut self, id: u8, endpoint: Endpoint) -> ProtocolResult<&mut Self> {
        if !msg_id::is_dynamic(id) {
            return Err(ProtocolError::out_of_range(
                "msg_id",
                id,
                msg_id::DYN_BASE,
                msg_id::DYN_END,
            ));
        }
        if self.endpoints.contains_key(&id) {
            return Err(ProtocolError::InvalidValue {
                what: "duplicate message id",
                value: u32::from(id),
            });
        }
        self.endpoints.insert(id, endpoint);
        Ok(self)
    }

    pub fn freeze(self) -> MessageTable {
        MessageTable {
            endpoints: self.endpoints,
        }
    }
}

/// Frozen message table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageTable {
    endpoints: BTreeMap<u8, Endpoint>,
}

impl Default for MessageTable {
    fn default() -> Self {
        MessageTableBuilder::default().freeze()
    }
}

impl MessageTable {
    pub fn builder() -> MessageTableBuilder {
        MessageTableBuilder::default()
    }

    pub fn endpoint(&self, id: u8) -> Option<&Endpoint> {
        self.endpoints.get(&id)
    }

    pub fn endpoints(&self) -> impl Iterator<Item = (u8, &Endpoint)> {
        self.endpoints.iter().map(|(id, e)| (*id, e))
    }

    /// Bulk instruction width of `id`, if it accepts bulk uploads.
    pub fn inst_width(&self, id: u8) -> Option<usize> {
        self.endpoints
            .get(&id)
            .map(|e| e.inst_width)
            .filter(|w| *w > 0)
    }

    /// Reply class of the request (`id`, `cmd_id`).
    pub fn reply_kind(&self, id: u8, cmd_id: u8) -> ProtocolResult<ReplyKind> {
        let unknown = ProtocolError::UnknownMessage {
            msg_id: id,
            cmd_id,
        };
        let endpoint = self.endpoints.get(&id).ok_or(unknown.clone())?;
        let kind = match (endpoint.role, cmd_id) {
            (EndpointRole::Sequencer, cmd::STATUS | cmd::RESET | cmd::INIT | cmd::START) => {
                ReplyKind::SequencerStatus
            }
            (EndpointRole::Timers, cmd::STATUS | cmd::RESET) => ReplyKind::TimerStatus,
            (EndpointRole::Timers, c)
                if (timer_cmd::GLOBAL_READ_1..timer_cmd::STOPWATCH_2_READ_1 + timer_cmd::READ_BLOCK)
                    .contains(&c) =>
            {
                ReplyKind::Entries {
                    width: endpoint.entry_width,
                }
            }
            (EndpointRole::Module(shape), cmd::STATUS | cmd::RESET) => {
                ReplyKind::ModuleStatus(shape)
            }
            (
                EndpointRole::Module(shape @ (StatusShape::Consumer | StatusShape::Producer)),
                cmd::START | cmd::STOP,
            ) => ReplyKind::ModuleStatus(shape),
            (EndpointRole::Module(StatusShape::Consumer), cmd::UPDATE) => {
                ReplyKind::ModuleStatus(StatusShape::Consumer)
            }
            (EndpointRole::Module(StatusShape::Producer), c)
                if (cmd::READ_1..=cmd::READ_MAX).contains(&c) =>
            {
                ReplyKind::Entries {
                    width: endpoint.entry_width,
                }
            }
            _ => return Err(unknown),
        };
        Ok(kind)
    }
}
