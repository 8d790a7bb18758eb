//! Host-side proxies of the FPGA hardware blocks.
//!
//! Every module owns a [`ModuleBase`]: immutable [`ModuleSettings`] plus the
//! local instruction buffer uploaded by [`ModuleBase::send`]. Module kinds
//! add their own operations on top and plug into the sequencer through the
//! [`HardwareModule`] trait.
//!
//! Status validation returns lists of error strings so that a parent can
//! concatenate the lists of its children; an empty list means valid.

pub mod bas;
pub mod capture;
pub mod kbd;
pub mod optemu;
pub mod pes;
pub mod timers;

use kosmos_errors::{
    BufferError, KosmosResult, ModuleCounters, SequencerError, SequencerErrorKind, StatusReport,
    TransportError,
};
use kosmos_protocol::table::INSTRUCTION_WIDTH;
use kosmos_protocol::{
    Endpoint, EndpointRole, ModuleStatus, Reply, StatusShape, cmd, msg_id,
};
use tracing::{debug, error};

use crate::config::{KosmosConfig, ModuleConfig, ResolvedModule, canonical_name};
use crate::transport::Transport;

pub use bas::ButtonAxis;
pub use capture::{I2cSpy, LedSpy};
pub use kbd::{KbdMatrix, KeyLayout};
pub use optemu::OptEmu;
pub use pes::Pes;
pub use timers::{PesTimers, TimerOp};

/// Immutable identity and sizing of one module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleSettings {
    /// Class name, shared by every instance.
    pub name: String,
    pub instance_id: Option<u8>,
    /// Optional modules live in the dynamic message id range.
    pub optional: bool,
    pub msg_id: u8,
    pub shape: StatusShape,
    /// Remote buffer size in entries.
    pub buffer_size: usize,
    /// Remote FIFO size in entries.
    pub fifo_size: usize,
    /// Largest bulk frame, in instructions.
    pub max_bulk_entries: usize,
    pub cmd_status: u8,
    pub cmd_reset: u8,
    /// Fetch the module status on its own at end of run.
    pub separate_status: bool,
    /// Bulk instruction width in bytes, 0 when nothing is uploaded.
    pub inst_width: usize,
    /// Read entry width in bytes, 0 when nothing is captured.
    pub entry_width: usize,
}

impl ModuleSettings {
    pub fn pes(config: &KosmosConfig) -> Self {
        Self {
            name: "PES".to_string(),
            instance_id: None,
            optional: false,
            msg_id: msg_id::PES,
            shape: StatusShape::Pes,
            buffer_size: config.pes.buffer_size,
            fifo_size: config.pes.fifo_size,
            max_bulk_entries: config.fpga.max_bulk_entries,
            cmd_status: cmd::STATUS,
            cmd_reset: cmd::RESET,
            separate_status: false,
            inst_width: INSTRUCTION_WIDTH,
            entry_width: 0,
        }
    }

    pub fn from_resolved(module: &ResolvedModule, config: &KosmosConfig) -> Self {
        let common = module.config.common();
        let (shape, inst_width, entry_width) = match module.config {
            ModuleConfig::KbdMatrix(_) | ModuleConfig::ButtonAxis(_) | ModuleConfig::OptEmu(_) => {
                (StatusShape::Consumer, INSTRUCTION_WIDTH, 0)
            }
            ModuleConfig::LedSpy(_) | ModuleConfig::I2cSpy(_) => {
                (StatusShape::Producer, 0, INSTRUCTION_WIDTH)
            }
        };
        Self {
            name: module.config.base_name().to_string(),
            instance_id: common.instance_id,
            optional: true,
            msg_id: module.msg_id,
            shape,
            buffer_size: common.buffer_size,
            fifo_size: common.fifo_size,
            max_bulk_entries: config.fpga.max_bulk_entries,
            cmd_status: cmd::STATUS,
            cmd_reset: cmd::RESET,
            separate_status: common.separate_status,
            inst_width,
            entry_width,
        }
    }

    /// Identifier-safe name derived from the class name and instance id.
    pub fn canonical_name(&self) -> String {
        canonical_name(&self.name, self.instance_id)
    }

    /// Message table entry of this module.
    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            name: self.canonical_name(),
            role: EndpointRole::Module(self.shape),
            inst_width: self.inst_width,
            entry_width: self.entry_width,
        }
    }
}

/// Settings plus the local instruction buffer.
#[derive(Debug, Clone)]
pub struct ModuleBase {
    settings: ModuleSettings,
    canonical: String,
    buffer: Vec<u32>,
}

impl ModuleBase {
    pub fn new(settings: ModuleSettings) -> Self {
        let canonical = settings.canonical_name();
        Self {
            settings,
            canonical,
            buffer: Vec::new(),
        }
    }

    pub fn settings(&self) -> &ModuleSettings {
        &self.settings
    }

    pub fn name(&self) -> &str {
        &self.canonical
    }

    fn check_capacity(&self, extra: usize) -> Result<(), BufferError> {
        let requested = self.buffer.len().saturating_add(extra);
        // The remote buffer must never fill up completely.
        if requested >= self.settings.buffer_size {
            return Err(BufferError::overflow(
                self.canonical.clone(),
                self.settings.buffer_size,
                requested,
            ));
        }
        Ok(())
    }

    /// Append one encoded instruction.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::Overflow`] when the buffer would reach the
    /// remote buffer size.
    pub fn append(&mut self, word: u32) -> KosmosResult<()> {
        self.check_capacity(1)?;
        self.buffer.push(word);
        Ok(())
    }

    /// Append several instructions, all or none.
    pub fn extend(&mut self, words: &[u32]) -> KosmosResult<()> {
        self.check_capacity(words.len())?;
        self.buffer.extend_from_slice(words);
        Ok(())
    }

    /// Insert an instruction ahead of everything buffered.
    pub fn insert_front(&mut self, word: u32) -> KosmosResult<()> {
        self.check_capacity(1)?;
        self.buffer.insert(0, word);
        Ok(())
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Drop every instruction buffered after the first `len`.
    pub fn truncate(&mut self, len: usize) {
        self.buffer.truncate(len);
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn words(&self) -> &[u32] {
        &self.buffer
    }

    /// Upload the local buffer. The buffer is left intact.
    pub fn send(&self, transport: &dyn Transport) -> KosmosResult<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let chunk_size = self.settings.max_bulk_entries.max(1);
        debug!(
            module = %self.canonical,
            count = self.buffer.len(),
            frames = self.buffer.len().div_ceil(chunk_size),
            "uploading instructions"
        );
        for chunk in self.buffer.chunks(chunk_size) {
            transport.send_bulk(self.settings.msg_id, chunk)?;
        }
        Ok(())
    }

    fn expect_status(&self, command: u8, reply: Reply) -> KosmosResult<ModuleStatus> {
        match reply {
            Reply::Module(status) if status.shape() == self.settings.shape => Ok(status),
            other => Err(TransportError::framing(format!(
                "{} command {command:#04x}: unexpected reply {other:?}",
                self.canonical
            ))
            .into()),
        }
    }

    /// Fetch the raw module status, without validation.
    pub fn fetch_status(&self, transport: &dyn Transport) -> KosmosResult<ModuleStatus> {
        self.control(transport, self.settings.cmd_status)
    }

    /// Send the reset command and return the status it replies with.
    pub fn reset(&self, transport: &dyn Transport) -> KosmosResult<ModuleStatus> {
        self.control(transport, self.settings.cmd_reset)
    }

    /// Send a control command whose reply is a status record.
    pub fn control(&self, transport: &dyn Transport, command: u8) -> KosmosResult<ModuleStatus> {
        let reply = transport.send_control(self.settings.msg_id, command, &[])?;
        self.expect_status(command, reply)
    }
}

/// FIFO and buffer occupancy within the remote sizes.
pub fn status_bounds_errors(settings: &ModuleSettings, status: &ModuleStatus) -> Vec<String> {
    let name = settings.canonical_name();
    let mut errors = Vec::new();
    if usize::from(status.fifo_count()) > settings.fifo_size {
        errors.push(format!(
            "[{name}] FIFO count {} exceeds FIFO size {}.",
            status.fifo_count(),
            settings.fifo_size
        ));
    }
    if usize::from(status.buffer_count()) > settings.buffer_size {
        errors.push(format!(
            "[{name}] Buffer count {} exceeds buffer size {}.",
            status.buffer_count(),
            settings.buffer_size
        ));
    }
    errors
}

/// Counts and overrun after a reset.
pub fn reset_errors(name: &str, status: &ModuleStatus) -> Vec<String> {
    let mut errors = Vec::new();
    if status.fifo_count() != 0 {
        errors.push(format!(
            "[{name}] FIFO is not empty: got {} items.",
            status.fifo_count()
        ));
    }
    if status.buffer_count() != 0 {
        errors.push(format!(
            "[{name}] Buffer is not empty: got {} items.",
            status.buffer_count()
        ));
    }
    if status.overrun() {
        errors.push(format!("[{name}] Overrun flag is set."));
    }
    errors
}

/// Everything consumed, nothing lost.
pub fn end_of_run_errors(name: &str, status: &ModuleStatus) -> Vec<String> {
    let mut errors = reset_errors(name, status);
    if status.underrun() {
        errors.push(format!("[{name}] Underrun flag is set."));
    }
    errors
}

pub(crate) fn counters(name: &str, status: &ModuleStatus) -> ModuleCounters {
    ModuleCounters {
        name: name.to_string(),
        fifo_count: status.fifo_count(),
        buffer_count: status.buffer_count(),
        overrun: status.overrun(),
        underrun: status.underrun(),
    }
}

pub(crate) fn invalid_status(
    name: &str,
    status: &ModuleStatus,
    errors: Vec<String>,
) -> SequencerError {
    error!(module = %name, count = errors.len(), "invalid module status");
    SequencerError::new(
        SequencerErrorKind::InvalidStatus { errors },
        StatusReport::new("N/A").with_modules(vec![counters(name, status)]),
    )
}

/// Read `count` entries with `READ_n` requests of at most `max_per_msg` entries.
///
/// The read command of a message carrying `n` entries is `read_cmd_base + n - 1`.
///
/// # Errors
///
/// Returns [`BufferError::DownloadMismatch`] when a reply carries a
/// different number of entries than requested.
pub fn download_entries(
    transport: &dyn Transport,
    module_id: u8,
    read_cmd_base: u8,
    max_per_msg: usize,
    count: usize,
    name: &str,
) -> KosmosResult<Vec<u64>> {
    let max_per_msg = max_per_msg.max(1);
    let mut entries = Vec::with_capacity(count);
    let mut remaining = count;
    while remaining > 0 {
        let batch = remaining.min(max_per_msg);
        let command = batch
            .checked_sub(1)
            .and_then(|offset| u8::try_from(offset).ok())
            .and_then(|offset| read_cmd_base.checked_add(offset))
            .ok_or_else(|| TransportError::framing(format!("{name}: read of {batch} entries")))?;
        match transport.send_control(module_id, command, &[])? {
            Reply::Entries(values) => {
                if values.len() != batch {
                    return Err(
                        BufferError::download_mismatch(name, batch, values.len()).into()
                    );
                }
                entries.extend(values);
            }
            other => {
                return Err(TransportError::framing(format!(
                    "{name} read {command:#04x}: unexpected reply {other:?}"
                ))
                .into());
            }
        }
        remaining -= batch;
    }
    if entries.len() != count {
        return Err(BufferError::download_mismatch(name, count, entries.len()).into());
    }
    debug!(module = %name, count, "downloaded entries");
    Ok(entries)
}

/// Common behaviour of every buffered module.
pub trait HardwareModule: Send {
    fn base(&self) -> &ModuleBase;

    fn base_mut(&mut self) -> &mut ModuleBase;

    fn settings(&self) -> &ModuleSettings {
        self.base().settings()
    }

    fn name(&self) -> &str {
        self.base().name()
    }

    /// Validation applied to every status fetch.
    fn status_errors(&self, status: &ModuleStatus) -> Vec<String> {
        status_bounds_errors(self.settings(), status)
    }

    /// Validation applied to the reply of a module reset.
    fn reset_errors(&self, status: &ModuleStatus) -> Vec<String> {
        let mut errors = self.status_errors(status);
        errors.extend(reset_errors(self.name(), status));
        errors
    }

    /// Called after a successful [`HardwareModule::reset_module`].
    fn on_reset(&mut self) {}

    /// Drop the local buffer.
    fn clear(&mut self) {
        self.base_mut().clear();
    }

    /// Number of buffered instructions a send action can consume.
    fn commits(&self) -> usize {
        0
    }

    /// Fetch and validate the module status.
    ///
    /// # Errors
    ///
    /// Returns a [`SequencerError`] of kind `InvalidStatus` when validation fails.
    fn status(&self, transport: &dyn Transport) -> KosmosResult<ModuleStatus> {
        let status = self.base().fetch_status(transport)?;
        let errors = self.status_errors(&status);
        if !errors.is_empty() {
            return Err(invalid_status(self.name(), &status, errors).into());
        }
        Ok(status)
    }

    /// Reset the remote FIFO and counters.
    ///
    /// # Errors
    ///
    /// Returns a [`SequencerError`] of kind `InvalidStatus` when the
    /// module is not empty after the reset.
    fn reset_module(&mut self, transport: &dyn Transport) -> KosmosResult<ModuleStatus> {
        let status = self.base().reset(transport)?;
        let errors = self.reset_errors(&status);
        if !errors.is_empty() {
            return Err(invalid_status(self.name(), &status, errors).into());
        }
        debug!(module = %self.name(), "module reset");
        self.on_reset();
        Ok(status)
    }
}

/// Local state a composite stimulus can roll back to.
///
/// A stimulus that touches several modules takes a checkpoint of each one
/// first and restores all of them when any step fails, so that neither
/// the buffers nor the caches keep a half-applied stimulus.
pub trait Checkpoint {
    type Saved;

    fn checkpoint(&self) -> Self::Saved;

    fn restore(&mut self, saved: Self::Saved);
}

/// Arena slot of a module in the device tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleHandle(pub(crate) usize);

impl ModuleHandle {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Every optional module kind the device tree can hold.
#[derive(Debug)]
pub enum Module {
    KbdMatrix(KbdMatrix),
    ButtonAxis(ButtonAxis),
    OptEmu(OptEmu),
    LedSpy(LedSpy),
    I2cSpy(I2cSpy),
}

impl Module {
    pub fn as_hw(&self) -> &dyn HardwareModule {
        match self {
            Module::KbdMatrix(m) => m,
            Module::ButtonAxis(m) => m,
            Module::OptEmu(m) => m,
            Module::LedSpy(m) => m,
            Module::I2cSpy(m) => m,
        }
    }

    pub fn as_hw_mut(&mut self) -> &mut dyn HardwareModule {
        match self {
            Module::KbdMatrix(m) => m,
            Module::ButtonAxis(m) => m,
            Module::OptEmu(m) => m,
            Module::LedSpy(m) => m,
            Module::I2cSpy(m) => m,
        }
    }

    pub fn name(&self) -> &str {
        self.as_hw().name()
    }

    /// PES action that makes this module consume instructions.
    pub fn send_action(&self) -> Option<u16> {
        match self {
            Module::KbdMatrix(m) => Some(m.send_action()),
            Module::ButtonAxis(m) => Some(m.fire_action()),
            Module::OptEmu(m) => Some(m.send_action()),
            _ => None,
        }
    }

    pub fn commits(&self) -> usize {
        self.as_hw().commits()
    }
}
