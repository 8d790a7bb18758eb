//! Programmable Event Sequencer.
//!
//! The PES program is the only place where events of different modules are
//! ordered. Suspension happens only at `DELAY`/`SUBDELAY` and `WAIT`; every
//! other instruction takes one tick.
//!
//! The FIFO of the PES is refilled by the soft-CPU while the program runs.
//! Tight sequences of one-tick instructions can drain it faster than it is
//! refilled, so helpers that emit such sequences separate them with the
//! configurable refill interval ([`PesConfig::refill_interval_ns`]).
//!
//! [`PesConfig::refill_interval_ns`]: crate::config::PesConfig::refill_interval_ns

use std::time::Duration;

use kosmos_errors::{BufferError, DomainError, KosmosResult};
use kosmos_protocol::pes::{self, ns_to_ticks};
use kosmos_protocol::{
    MarkerOps, ModuleStatus, PesInstruction, ProtocolError, TimerId, encode_delay_within,
};
use tracing::{debug, warn};

use super::timers::TimerOp;
use super::{
    Checkpoint, HardwareModule, ModuleBase, ModuleSettings, reset_errors, status_bounds_errors,
};
use crate::config::KosmosConfig;

/// Delay that lets the soft-CPU service a timer interrupt.
pub const TIMER_INTERRUPT_DELAY: Duration = Duration::from_micros(10);

#[derive(Debug)]
pub struct Pes {
    base: ModuleBase,
    clock_period_ns: u64,
    refill_interval: Duration,
    go_event: u16,
    kbd_ready_event: Option<u16>,
    kbd_wait_inserted: bool,
}

impl Pes {
    pub fn new(config: &KosmosConfig, go_event: u16, kbd_ready_event: Option<u16>) -> Self {
        Self {
            base: ModuleBase::new(ModuleSettings::pes(config)),
            clock_period_ns: config.fpga.clock_period_ns,
            refill_interval: config.pes.refill_interval(),
            go_event,
            kbd_ready_event,
            kbd_wait_inserted: false,
        }
    }

    pub fn clock_period_ns(&self) -> u64 {
        self.clock_period_ns
    }

    pub fn refill_interval(&self) -> Duration {
        self.refill_interval
    }

    pub fn append_instruction(&mut self, instruction: PesInstruction) -> KosmosResult<()> {
        let word = instruction.encode()?;
        self.base.append(word)
    }

    /// Append a sequence of instructions, all or none.
    pub fn append_all(&mut self, instructions: &[PesInstruction]) -> KosmosResult<()> {
        let words = pes::encode_program(instructions)?;
        self.base.extend(&words)
    }

    /// Suspend for `duration` of FPGA time, raising `actions` when it ends.
    ///
    /// The duration is floored to the clock period.
    ///
    /// # Errors
    ///
    /// Returns a [`DomainError`] when the duration is shorter than one
    /// clock period.
    pub fn delay(&mut self, duration: Duration, actions: u16) -> KosmosResult<()> {
        let ns = u64::try_from(duration.as_nanos()).map_err(|e| {
            DomainError::invalid_argument(format!("delay of {duration:?} is too long: {e}"))
        })?;
        let (ticks, remainder_ns) = ns_to_ticks(ns, self.clock_period_ns);
        if ticks == 0 {
            return Err(DomainError::invalid_argument(format!(
                "delay of {ns} ns is shorter than the {} ns clock period",
                self.clock_period_ns
            ))
            .into());
        }
        if remainder_ns != 0 {
            warn!(
                requested_ns = ns,
                truncated_ns = remainder_ns,
                "delay truncated to the FPGA clock"
            );
        }
        self.delay_ticks(ticks, actions)
    }

    /// Suspend for `ticks`, raising `actions` when it ends.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::Overflow`] as soon as the delay is known not
    /// to fit the remaining room, before it is fully encoded.
    pub fn delay_ticks(&mut self, ticks: u64, actions: u16) -> KosmosResult<()> {
        let settings = self.base.settings();
        let room = settings
            .buffer_size
            .saturating_sub(self.base.len())
            .saturating_sub(1);
        let instructions = match encode_delay_within(ticks, actions, room) {
            Ok(instructions) => instructions,
            Err(ProtocolError::ProgramTooLong { limit }) => {
                return Err(BufferError::overflow(
                    self.name(),
                    settings.buffer_size,
                    self.base.len().saturating_add(limit).saturating_add(1),
                )
                .into());
            }
            Err(e) => return Err(e.into()),
        };
        self.append_all(&instructions)
    }

    /// Raise `actions` and continue.
    pub fn execute(&mut self, actions: u16) -> KosmosResult<()> {
        if actions == 0 {
            return Err(DomainError::invalid_argument("EXECUTE without any action").into());
        }
        self.append_instruction(PesInstruction::Execute { actions })
    }

    /// Suspend until any of `events` is asserted.
    pub fn wait(&mut self, events: u16) -> KosmosResult<()> {
        if events == 0 {
            return Err(DomainError::invalid_argument("WAIT without any event").into());
        }
        self.append_instruction(PesInstruction::Wait { events })
    }

    /// Suspend until the keyboard matrix has consumed its last instruction.
    pub fn wait_kbd(&mut self) -> KosmosResult<()> {
        let event = self
            .kbd_ready_event
            .ok_or_else(|| DomainError::MissingModule("KBD_MATRIX".to_string()))?;
        self.wait(event)
    }

    /// Suspend until the external go signal.
    pub fn wait_go_signal(&mut self) -> KosmosResult<()> {
        self.wait(self.go_event)
    }

    pub fn marker(&mut self, ops: MarkerOps) -> KosmosResult<()> {
        if ops.is_empty() {
            return Err(DomainError::invalid_argument("MARKER without any operation").into());
        }
        self.append_instruction(PesInstruction::Marker { ops })
    }

    /// Apply `op` to `timers` with one marker.
    pub fn timers(&mut self, op: TimerOp, timers: &[TimerId]) -> KosmosResult<()> {
        let ops = op.marker_ops(timers)?;
        self.marker(ops)
    }

    /// One refill interval, raising `actions` at its end.
    pub fn refill_delay(&mut self, actions: u16) -> KosmosResult<()> {
        self.delay(self.refill_interval, actions)
    }

    pub fn pes_delay_for_timer_interrupt(&mut self) -> KosmosResult<()> {
        self.delay(TIMER_INTERRUPT_DELAY, 0)
    }

    /// Put a `WAIT` on the keyboard ready event ahead of the program.
    ///
    /// Done at most once per program, and only when `kbd_pending` says the
    /// keyboard has instructions to consume. Returns whether it was inserted.
    pub fn insert_wait_kbd_workaround(&mut self, kbd_pending: bool) -> KosmosResult<bool> {
        if !kbd_pending || self.kbd_wait_inserted {
            return Ok(false);
        }
        let Some(events) = self.kbd_ready_event else {
            return Ok(false);
        };
        let word = PesInstruction::Wait { events }.encode()?;
        self.base.insert_front(word)?;
        self.kbd_wait_inserted = true;
        debug!("inserted WAIT on KBD_MATRIX.READY at program start");
        Ok(true)
    }

    pub fn instructions(&self) -> Vec<PesInstruction> {
        self.base
            .words()
            .iter()
            .filter_map(|w| PesInstruction::decode(*w).ok())
            .collect()
    }

    /// Execution time of the buffered program, not counting WAIT suspension.
    pub fn duration(&self) -> Duration {
        Duration::from_nanos(pes::execution_duration_ns(
            &self.instructions(),
            self.clock_period_ns,
        ))
    }

    pub fn disassemble(&self) -> String {
        pes::disassemble(self.base.words())
    }

    /// Number of buffered instructions raising any action of `mask`.
    pub fn count_actions(&self, mask: u16) -> usize {
        self.instructions()
            .iter()
            .filter(|i| i.actions() & mask != 0)
            .count()
    }
}

impl HardwareModule for Pes {
    fn base(&self) -> &ModuleBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ModuleBase {
        &mut self.base
    }

    fn status_errors(&self, status: &ModuleStatus) -> Vec<String> {
        let mut errors = status_bounds_errors(self.settings(), status);
        if let ModuleStatus::Pes(s) = status
            && s.bad_opcode
        {
            errors.push(format!("[{}] Bad opcode flag is set.", self.name()));
        }
        errors
    }

    fn reset_errors(&self, status: &ModuleStatus) -> Vec<String> {
        let mut errors = self.status_errors(status);
        errors.extend(reset_errors(self.name(), status));
        if let ModuleStatus::Pes(s) = status
            && !s.soft_reset
        {
            errors.push(format!("[{}] Soft reset flag is not set.", self.name()));
        }
        errors
    }

    fn clear(&mut self) {
        self.base.clear();
        self.kbd_wait_inserted = false;
    }
}

impl Checkpoint for Pes {
    type Saved = (usize, bool);

    fn checkpoint(&self) -> Self::Saved {
        (self.base.len(), self.kbd_wait_inserted)
    }

    fn restore(&mut self, (len, kbd_wait_inserted): Self::Saved) {
        self.base.truncate(len);
        self.kbd_wait_inserted = kbd_wait_inserted;
    }
}
