//! Simulated instrument.
//!
//! [`SimulatedFpga`] answers the link protocol like the soft-CPU does and
//! runs the uploaded PES program on a tick clock when the sequencer is
//! started. The outputs a DUT would see are recorded: keyboard reports,
//! button/axis reports, mouse reports and the optical sensor SPI register
//! reads.
//!
//! The program is executed at `START`; the sequencer then stays RUNNING for
//! the program duration scaled by [`SimulatedFpga::with_time_scale_percent`]
//! of wall-clock time, 0 % meaning it ends at the next status poll.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use kosmos_errors::{DomainError, KosmosResult, TransportError};
use kosmos_protocol::ids::ReturnCode;
use kosmos_protocol::status::TIMER_COUNT;
use kosmos_protocol::{
    BasCommand, BasInstruction, CaptureState, ConsumerStatus, Frame, KbdCommand, KbdInstruction, MarkerOps, MatrixCoord,
    MatrixGeometry, MessageTable, ModuleStatus, OptEmuInstruction, PesInstruction, PesStatus,
    ProducerStatus, Reply, ReturnCodeReply, SequencerState, SequencerStatus, StatusEntry,
    StatusShape, TimerId, TimerStatus, cmd, msg_id, opt_cmd, timer_cmd,
};
use kosmos_protocol::kbd::KBD_LANE_BITS;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace, warn};

use crate::config::{ButtonAxisConfig, KosmosConfig, ModuleConfig};
use crate::error_line::ErrorLine;
use crate::events::{EventMap, GO_SIGNAL, ModuleEvents};
use crate::module::kbd::modifier_bit;
use crate::module::{KeyLayout, ModuleSettings};
use crate::transport::{Transport, check_bulk_ack, decode_control_reply};
use crate::tree::build_message_table;

/// Ticks the keyboard matrix needs to apply a latch.
pub const KBD_LATCH_TICKS: u64 = 100;

/// Ticks between two optical sensor frames (1 ms at 100 MHz).
pub const OPT_FRAME_TICKS: u64 = 100_000;

/// Optical sensor registers read by the DUT over SPI.
pub mod spi_reg {
    pub const MOTION: u8 = 0x02;
    pub const DELTA_X: u8 = 0x03;
    pub const DELTA_Y: u8 = 0x04;
    /// `MOTION` value when a displacement is pending.
    pub const MOTION_FLAG: u8 = 0x80;
}

/// Keyboard state seen by the DUT after a latch that changed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyboardReport {
    /// 1-based run index.
    pub run: u32,
    pub tick: u64,
    pub modifiers: u8,
    /// Pressed non-modifier keys, sorted.
    pub keys: Vec<String>,
}

/// Button and axis levels seen by the DUT after a latch that changed them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ButtonAxisReport {
    pub run: u32,
    pub tick: u64,
    /// Pressed buttons, ascending.
    pub pressed: Vec<u8>,
    pub axes: Vec<u16>,
}

/// Displacement of one optical sensor motion frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MouseReport {
    pub run: u32,
    pub tick: u64,
    pub dx: i16,
    pub dy: i16,
}

/// One sensor register read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpiTransfer {
    pub run: u32,
    pub tick: u64,
    pub register: u8,
    pub value: u8,
}

/// Global-error line of the simulator, raised by tests.
#[derive(Debug, Default)]
pub struct SimErrorLine {
    high: AtomicBool,
    flag: Mutex<Option<Arc<AtomicBool>>>,
}

impl SimErrorLine {
    pub fn raise(&self) {
        self.high.store(true, Ordering::Release);
        if let Some(flag) = self.flag.lock().as_ref() {
            flag.store(true, Ordering::Release);
        }
    }

    pub fn lower(&self) {
        self.high.store(false, Ordering::Release);
    }
}

impl ErrorLine for SimErrorLine {
    fn is_high(&self) -> bool {
        self.high.load(Ordering::Acquire)
    }

    fn subscribe(&self, flag: Arc<AtomicBool>) {
        *self.flag.lock() = Some(flag);
    }

    fn unsubscribe(&self) {
        *self.flag.lock() = None;
    }
}

#[derive(Debug, Default)]
struct Outputs {
    keyboard: Vec<KeyboardReport>,
    button_axis: Vec<ButtonAxisReport>,
    mouse: Vec<MouseReport>,
    spi: Vec<SpiTransfer>,
}

#[derive(Debug)]
struct SimKbd {
    geometry: MatrixGeometry,
    layout: KeyLayout,
    pending: BTreeMap<(u8, u8), u8>,
    latched: BTreeMap<(u8, u8), u8>,
    last_modifiers: u8,
    last_keys: Vec<String>,
    busy_until: u64,
}

impl SimKbd {
    fn new(geometry: MatrixGeometry, layout: KeyLayout) -> Self {
        Self {
            geometry,
            layout,
            pending: BTreeMap::new(),
            latched: BTreeMap::new(),
            last_modifiers: 0,
            last_keys: Vec::new(),
            busy_until: 0,
        }
    }

    fn pressed(&self) -> (u8, Vec<String>) {
        let mut modifiers = 0u8;
        let mut keys = Vec::new();
        for (&(bank, addr), &lane) in &self.latched {
            for lane_bit in (0..KBD_LANE_BITS).filter(|b| lane & (1 << b) != 0) {
                let coord = MatrixCoord {
                    bank,
                    addr,
                    lane_bit,
                };
                let Some(name) = self
                    .geometry
                    .key_at(coord)
                    .ok()
                    .and_then(|(row, col)| self.layout.name_at(row, col))
                else {
                    continue;
                };
                match modifier_bit(name) {
                    Some(bit) => modifiers |= 1 << bit,
                    None => keys.push(name.to_string()),
                }
            }
        }
        keys.sort();
        (modifiers, keys)
    }

    fn latch(&mut self, tick: u64, run: u32, outputs: &mut Outputs) {
        self.latched = self.pending.clone();
        self.busy_until = self.busy_until.max(tick).saturating_add(KBD_LATCH_TICKS);
        let (modifiers, keys) = self.pressed();
        if modifiers == self.last_modifiers && keys == self.last_keys {
            trace!(tick, "latch without visible change");
            return;
        }
        self.last_modifiers = modifiers;
        self.last_keys = keys.clone();
        outputs.keyboard.push(KeyboardReport {
            run,
            tick: self.busy_until,
            modifiers,
            keys,
        });
    }

    /// Consume up to the first latching instruction.
    fn send(&mut self, words: &[u32], tick: u64, run: u32, outputs: &mut Outputs) -> usize {
        for (i, word) in words.iter().enumerate() {
            let Ok(instruction) = KbdInstruction::decode(*word) else {
                warn!(word = %format!("{word:#010x}"), "undecodable KBD instruction skipped");
                continue;
            };
            match instruction.command {
                KbdCommand::Reset => self.pending.clear(),
                KbdCommand::Update | KbdCommand::UpdateSend => {
                    self.pending
                        .insert((instruction.bank, instruction.addr), instruction.lane);
                }
                KbdCommand::Send => {}
            }
            if instruction.command.latches() {
                self.latch(tick, run, outputs);
                return i.saturating_add(1);
            }
        }
        words.len()
    }

    fn clear(&mut self) {
        self.pending.clear();
        self.latched.clear();
        self.last_modifiers = 0;
        self.last_keys.clear();
    }
}

#[derive(Debug)]
struct SimButtonAxis {
    buttons: usize,
    rest: Vec<u16>,
    pending: Vec<u16>,
    latched: Vec<u16>,
}

impl SimButtonAxis {
    fn new(config: &ButtonAxisConfig) -> Self {
        let rest: Vec<u16> = std::iter::repeat_n(0, usize::from(config.buttons))
            .chain(std::iter::repeat_n(config.axis_rest, usize::from(config.axes)))
            .collect();
        Self {
            buttons: usize::from(config.buttons),
            pending: rest.clone(),
            latched: rest.clone(),
            rest,
        }
    }

    fn latch(&mut self, tick: u64, run: u32, outputs: &mut Outputs) {
        if self.pending == self.latched {
            trace!(tick, "latch without visible change");
            return;
        }
        self.latched = self.pending.clone();
        let (buttons, axes) = self.latched.split_at(self.buttons.min(self.latched.len()));
        let pressed = buttons
            .iter()
            .enumerate()
            .filter(|(_, level)| **level != 0)
            .filter_map(|(button, _)| u8::try_from(button).ok())
            .collect();
        outputs.button_axis.push(ButtonAxisReport {
            run,
            tick,
            pressed,
            axes: axes.to_vec(),
        });
    }

    /// Consume up to the first latching instruction.
    fn send(&mut self, words: &[u32], tick: u64, run: u32, outputs: &mut Outputs) -> usize {
        for (i, word) in words.iter().enumerate() {
            let Ok(instruction) = BasInstruction::decode(*word) else {
                warn!(word = %format!("{word:#010x}"), "undecodable BAS instruction skipped");
                continue;
            };
            match instruction.command {
                BasCommand::Reset => self.pending.clone_from(&self.rest),
                BasCommand::Update | BasCommand::UpdateSend => {
                    match self.pending.get_mut(usize::from(instruction.channel)) {
                        Some(level) => *level = instruction.level,
                        None => warn!(channel = instruction.channel, "BAS channel out of range"),
                    }
                }
                BasCommand::Send => {}
            }
            if instruction.command.latches() {
                self.latch(tick, run, outputs);
                return i.saturating_add(1);
            }
        }
        words.len()
    }

    fn clear(&mut self) {
        self.pending.clone_from(&self.rest);
        self.latched.clone_from(&self.rest);
    }
}

#[derive(Debug, Default)]
struct SimOptEmu {
    registers: BTreeMap<u8, u16>,
}

impl SimOptEmu {
    fn register(&self, idx: u8) -> u16 {
        self.registers.get(&idx).copied().unwrap_or_default()
    }

    fn commit(&mut self, tick: u64, run: u32, outputs: &mut Outputs) {
        let dx = self.register(opt_cmd::DX).cast_signed();
        let dy = self.register(opt_cmd::DY).cast_signed();
        let lifted = self.register(opt_cmd::LIFT) != 0;
        let skip = u64::from(self.register(opt_cmd::SKIP));
        let frames = skip
            .saturating_add(1)
            .saturating_add(u64::from(self.register(opt_cmd::REPEAT)));
        for frame in 0..frames {
            let tick = tick.saturating_add(frame.saturating_mul(OPT_FRAME_TICKS));
            let moving = frame >= skip && !lifted && (dx != 0 || dy != 0);
            if !moving {
                outputs.spi.push(SpiTransfer {
                    run,
                    tick,
                    register: spi_reg::MOTION,
                    value: 0,
                });
                continue;
            }
            let [dx_low, _] = dx.to_le_bytes();
            let [dy_low, _] = dy.to_le_bytes();
            for (register, value) in [
                (spi_reg::MOTION, spi_reg::MOTION_FLAG),
                (spi_reg::DELTA_X, dx_low),
                (spi_reg::DELTA_Y, dy_low),
            ] {
                outputs.spi.push(SpiTransfer {
                    run,
                    tick,
                    register,
                    value,
                });
            }
            outputs.mouse.push(MouseReport { run, tick, dx, dy });
        }
        self.registers.remove(&opt_cmd::SKIP);
        self.registers.remove(&opt_cmd::REPEAT);
    }

    /// Consume up to the first committing instruction.
    fn send(&mut self, words: &[u32], tick: u64, run: u32, outputs: &mut Outputs) -> usize {
        for (i, word) in words.iter().enumerate() {
            let instruction = OptEmuInstruction::decode(*word);
            match instruction {
                OptEmuInstruction::Raw {
                    cmd_idx, cmd_val, ..
                } => {
                    self.registers.insert(cmd_idx, cmd_val);
                }
                OptEmuInstruction::Compressed {
                    dx,
                    dy,
                    lift,
                    skip,
                    repeat,
                } => {
                    self.registers
                        .insert(opt_cmd::DX, i16::from(dx).cast_unsigned());
                    self.registers
                        .insert(opt_cmd::DY, i16::from(dy).cast_unsigned());
                    self.registers.insert(opt_cmd::LIFT, u16::from(lift));
                    self.registers.insert(opt_cmd::SKIP, u16::from(skip));
                    self.registers.insert(opt_cmd::REPEAT, u16::from(repeat));
                }
            }
            if instruction.commits() {
                self.commit(tick, run, outputs);
                return i.saturating_add(1);
            }
        }
        words.len()
    }
}

#[derive(Debug)]
enum Behaviour {
    Pes,
    Kbd(SimKbd),
    ButtonAxis(SimButtonAxis),
    OptEmu(SimOptEmu),
    Spy,
}

#[derive(Debug)]
struct SimModule {
    name: String,
    shape: StatusShape,
    buffer_size: usize,
    fifo_size: usize,
    events: ModuleEvents,
    behaviour: Behaviour,
    uploaded: Vec<u32>,
    /// Consumption tick of `uploaded[i]`.
    consumed_at: Vec<u64>,
    captured: VecDeque<u64>,
    script: Vec<u32>,
    capture_state: CaptureState,
    enabled: bool,
    overrun: bool,
    underrun: bool,
    soft_reset: bool,
    bad_opcode: bool,
    inject_overrun: bool,
}

fn count_u16(count: usize) -> u16 {
    u16::try_from(count).unwrap_or(u16::MAX)
}

impl SimModule {
    fn new(settings: &ModuleSettings, events: ModuleEvents, behaviour: Behaviour) -> Self {
        Self {
            name: settings.canonical_name(),
            shape: settings.shape,
            buffer_size: settings.buffer_size,
            fifo_size: settings.fifo_size,
            events,
            behaviour,
            uploaded: Vec::new(),
            consumed_at: Vec::new(),
            captured: VecDeque::new(),
            script: Vec::new(),
            capture_state: CaptureState::ResetOrStopped,
            enabled: false,
            overrun: false,
            underrun: false,
            soft_reset: false,
            bad_opcode: false,
            inject_overrun: false,
        }
    }

    fn remaining(&self, now: u64) -> usize {
        let consumed = self.consumed_at.iter().filter(|t| **t <= now).count();
        self.uploaded.len().saturating_sub(consumed)
    }

    fn status(&self, now: u64) -> ModuleStatus {
        let remaining = self.remaining(now);
        let fifo = remaining.min(self.fifo_size);
        let fifo_count = count_u16(fifo);
        let buffer_count = count_u16(remaining.saturating_sub(fifo));
        match self.shape {
            StatusShape::Pes => ModuleStatus::Pes(PesStatus {
                fifo_count,
                buffer_count,
                overrun: self.overrun,
                underrun: self.underrun && remaining == 0,
                soft_reset: self.soft_reset,
                bad_opcode: self.bad_opcode,
            }),
            StatusShape::Consumer => ModuleStatus::Consumer(ConsumerStatus {
                fifo_count,
                buffer_count,
                overrun: self.overrun,
                underrun: self.underrun,
                enabled: self.enabled,
            }),
            StatusShape::Producer => ModuleStatus::Producer(ProducerStatus {
                fifo_count: 0,
                buffer_count: count_u16(self.captured.len()),
                overrun: self.overrun,
                capture_state: self.capture_state,
            }),
            StatusShape::Timer => ModuleStatus::Timer(TimerStatus {
                buffer_count: 0,
                overrun: self.overrun,
            }),
        }
    }

    /// Sequencer or module reset. Stimulus state survives a sequencer reset.
    fn clear(&mut self) {
        self.uploaded.clear();
        self.consumed_at.clear();
        self.captured.clear();
        self.capture_state = CaptureState::ResetOrStopped;
        self.overrun = false;
        self.underrun = false;
        self.bad_opcode = false;
    }

    fn start_capture(&mut self) {
        self.capture_state = CaptureState::Started;
        self.captured
            .extend(self.script.iter().map(|w| u64::from(*w)));
        if self.captured.len() > self.buffer_size {
            warn!(module = %self.name, "capture buffer overrun");
            self.overrun = true;
            self.captured.truncate(self.buffer_size);
        }
    }

    fn stop_capture(&mut self) {
        self.capture_state = CaptureState::ResetOrStopped;
    }

    fn on_send(&mut self, tick: u64, run: u32, outputs: &mut Outputs) {
        let start = self.consumed_at.len();
        let words = self.uploaded.get(start..).unwrap_or_default();
        if words.is_empty() {
            warn!(module = %self.name, tick, "send with an empty FIFO");
            self.underrun = true;
            return;
        }
        let consumed = match &mut self.behaviour {
            Behaviour::Kbd(kbd) => kbd.send(words, tick, run, outputs),
            Behaviour::ButtonAxis(bas) => bas.send(words, tick, run, outputs),
            Behaviour::OptEmu(emu) => emu.send(words, tick, run, outputs),
            Behaviour::Pes | Behaviour::Spy => 0,
        };
        self.consumed_at
            .extend(std::iter::repeat_n(tick, consumed));
    }

    fn drain(&mut self, count: usize) -> Vec<u64> {
        let count = count.min(self.captured.len());
        self.captured.drain(..count).collect()
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Stopwatch {
    accumulated: u64,
    since: Option<u64>,
}

impl Stopwatch {
    fn value(&self, tick: u64) -> u64 {
        let running = self.since.map_or(0, |since| tick.saturating_sub(since));
        self.accumulated.saturating_add(running)
    }

    fn reset(&mut self, tick: u64) {
        self.accumulated = 0;
        if self.since.is_some() {
            self.since = Some(tick);
        }
    }

    fn go(&mut self, tick: u64) {
        if self.since.is_none() {
            self.since = Some(tick);
        }
    }

    fn stop(&mut self, tick: u64) {
        self.accumulated = self.value(tick);
        self.since = None;
    }
}

#[derive(Debug, Default)]
struct SimTimers {
    buffers: [VecDeque<u64>; TIMER_COUNT],
    overrun: [bool; TIMER_COUNT],
    local_base: u64,
    stopwatch_1: Stopwatch,
    stopwatch_2: Stopwatch,
}

impl SimTimers {
    fn save(&mut self, timer: TimerId, value: u64, capacity: usize) {
        let index = timer.index();
        let Some(buffer) = self.buffers.get_mut(index) else {
            return;
        };
        if buffer.len() >= capacity {
            if let Some(overrun) = self.overrun.get_mut(index) {
                *overrun = true;
            }
            return;
        }
        buffer.push_back(value.saturating_add(timer.offset_ticks()));
    }

    fn marker(&mut self, ops: MarkerOps, tick: u64, capacity: usize) {
        let values = [
            (MarkerOps::SAVE_GLOBAL, TimerId::Global, tick),
            (
                MarkerOps::SAVE_LOCAL,
                TimerId::Local,
                tick.saturating_sub(self.local_base),
            ),
            (
                MarkerOps::SAVE_STOPWATCH_1,
                TimerId::Stopwatch1,
                self.stopwatch_1.value(tick),
            ),
            (
                MarkerOps::SAVE_STOPWATCH_2,
                TimerId::Stopwatch2,
                self.stopwatch_2.value(tick),
            ),
        ];
        for (op, timer, value) in values {
            if ops.contains(op) {
                self.save(timer, value, capacity);
            }
        }
        if ops.contains(MarkerOps::RESET_LOCAL) {
            self.local_base = tick;
        }
        if ops.contains(MarkerOps::RESET_STOPWATCH_1) {
            self.stopwatch_1.reset(tick);
        }
        if ops.contains(MarkerOps::RESET_STOPWATCH_2) {
            self.stopwatch_2.reset(tick);
        }
        if ops.contains(MarkerOps::STOPWATCH_1_GO) {
            self.stopwatch_1.go(tick);
        }
        if ops.contains(MarkerOps::STOPWATCH_2_GO) {
            self.stopwatch_2.go(tick);
        }
        if ops.contains(MarkerOps::STOPWATCH_1_STOP) {
            self.stopwatch_1.stop(tick);
        }
        if ops.contains(MarkerOps::STOPWATCH_2_STOP) {
            self.stopwatch_2.stop(tick);
        }
    }

    fn statuses(&self) -> [ModuleStatus; TIMER_COUNT] {
        TimerId::ALL.map(|timer| {
            ModuleStatus::Timer(TimerStatus {
                buffer_count: count_u16(
                    self.buffers.get(timer.index()).map_or(0, VecDeque::len),
                ),
                overrun: self.overrun.get(timer.index()).copied().unwrap_or_default(),
            })
        })
    }

    /// Drop the saved values; the counters restart with the next run.
    fn clear(&mut self) {
        *self = Self::default();
    }

    fn drain(&mut self, timer: TimerId, count: usize) -> Vec<u64> {
        self.buffers
            .get_mut(timer.index())
            .map(|buffer| {
                let count = count.min(buffer.len());
                buffer.drain(..count).collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Debug)]
struct SimState {
    table: MessageTable,
    clock_period_ns: u64,
    time_scale_percent: u64,
    state: SequencerState,
    pes: SimModule,
    modules: BTreeMap<u8, SimModule>,
    timers: SimTimers,
    timer_buffer_size: usize,
    go_after: Option<u64>,
    started: Option<Instant>,
    end_tick: Option<u64>,
    run: u32,
    fault_on_start: bool,
    error_on_start: bool,
    outputs: Outputs,
    commands: BTreeMap<(u8, u8), usize>,
}

impl SimState {
    fn elapsed_ticks(&self) -> u64 {
        let Some(started) = self.started else {
            return u64::MAX;
        };
        if self.time_scale_percent == 0 {
            return u64::MAX;
        }
        let fpga_ns = started
            .elapsed()
            .as_nanos()
            .saturating_mul(100)
            .checked_div(u128::from(self.time_scale_percent))
            .unwrap_or(u128::MAX);
        let ticks = fpga_ns
            .checked_div(u128::from(self.clock_period_ns))
            .unwrap_or(u128::MAX);
        u64::try_from(ticks).unwrap_or(u64::MAX)
    }

    fn refresh(&mut self) {
        if self.state == SequencerState::Running
            && let Some(end) = self.end_tick
            && self.elapsed_ticks() >= end
        {
            self.state = SequencerState::Idle;
            info!(run = self.run, ticks = end, "simulated sequence finished");
        }
    }

    /// Current tick of the running program; past the end otherwise.
    fn now(&self) -> u64 {
        match self.state {
            SequencerState::Running => self.elapsed_ticks(),
            _ => u64::MAX,
        }
    }

    fn sequencer_status(&self) -> SequencerStatus {
        let now = self.now();
        let mut entries = vec![StatusEntry {
            msg_id: msg_id::PES,
            sub: 0,
            record: self.pes.status(now).to_record(),
        }];
        for (sub, status) in (0u8..).zip(self.timers.statuses()) {
            entries.push(StatusEntry {
                msg_id: msg_id::PES_TIMER,
                sub,
                record: status.to_record(),
            });
        }
        for (id, module) in &self.modules {
            entries.push(StatusEntry {
                msg_id: *id,
                sub: 0,
                record: module.status(now).to_record(),
            });
        }
        SequencerStatus {
            state: self.state,
            entries,
        }
    }

    fn reset(&mut self) {
        self.pes.clear();
        self.pes.soft_reset = true;
        for module in self.modules.values_mut() {
            module.clear();
            if let Behaviour::Kbd(kbd) = &mut module.behaviour {
                kbd.busy_until = 0;
            }
        }
        self.timers.clear();
        self.started = None;
        self.end_tick = None;
        self.state = SequencerState::ResetDone;
    }

    fn resume_tick(&self, events: u16, now: u64) -> Option<u64> {
        let mut candidates = Vec::new();
        if events & GO_SIGNAL != 0
            && let Some(go) = self.go_after
        {
            candidates.push(go.max(now));
        }
        for module in self.modules.values() {
            if let Behaviour::Kbd(kbd) = &module.behaviour
                && module.events.ready.is_some_and(|bit| events & bit != 0)
            {
                candidates.push(kbd.busy_until.max(now));
            }
        }
        candidates.into_iter().min()
    }

    fn raise_actions(&mut self, actions: u16, tick: u64) {
        if actions == 0 {
            return;
        }
        let run = self.run;
        for module in self.modules.values_mut() {
            let events = module.events;
            let sends = [events.send, events.fire];
            if sends.iter().flatten().any(|bit| actions & bit != 0) {
                module.on_send(tick, run, &mut self.outputs);
            }
            if events.start.is_some_and(|bit| actions & bit != 0) {
                module.start_capture();
            }
            if events.stop.is_some_and(|bit| actions & bit != 0) {
                module.stop_capture();
            }
        }
    }

    fn execute(&mut self) {
        let program: Vec<Option<PesInstruction>> = self
            .pes
            .uploaded
            .iter()
            .map(|w| PesInstruction::decode(*w).ok())
            .collect();
        let capacity = self.timer_buffer_size;
        let mut tick = 0u64;
        let mut consumed = Vec::with_capacity(program.len());
        for instruction in program {
            consumed.push(tick);
            let Some(instruction) = instruction else {
                self.pes.bad_opcode = true;
                tick = tick.saturating_add(1);
                continue;
            };
            match instruction {
                PesInstruction::Wait { events } => match self.resume_tick(events, tick) {
                    Some(resume) => tick = resume.saturating_add(1),
                    None => {
                        debug!(tick, events, "PES waits for an event that never comes");
                        self.pes.consumed_at = consumed;
                        self.end_tick = None;
                        return;
                    }
                },
                PesInstruction::Marker { ops } => {
                    tick = tick.saturating_add(1);
                    self.timers.marker(ops, tick, capacity);
                }
                other => {
                    tick = tick.saturating_add(other.duration_ticks());
                    self.raise_actions(other.actions(), tick);
                }
            }
        }
        self.pes.consumed_at = consumed;
        self.pes.underrun = true;
        self.end_tick = Some(tick);
    }

    /// Returns whether the error line must rise.
    fn start(&mut self) -> bool {
        if self.state != SequencerState::InitDone {
            return false;
        }
        self.run = self.run.saturating_add(1);
        if self.fault_on_start {
            warn!(run = self.run, "injected sequencer fault");
            self.state = SequencerState::Error;
            return false;
        }
        for module in std::iter::once(&mut self.pes).chain(self.modules.values_mut()) {
            if module.inject_overrun {
                module.overrun = true;
            }
        }
        self.pes.soft_reset = false;
        self.execute();
        self.started = Some(Instant::now());
        self.state = SequencerState::Running;
        info!(run = self.run, end_tick = ?self.end_tick, "simulated sequence started");
        self.error_on_start
    }

    fn sequencer_command(&mut self, command: u8) -> (Reply, bool) {
        let mut raise = false;
        match command {
            cmd::RESET => self.reset(),
            cmd::INIT if self.state == SequencerState::ResetDone => {
                self.pes.soft_reset = true;
                self.state = SequencerState::InitDone;
            }
            cmd::START => {
                raise = self.start();
                self.refresh();
            }
            _ => {}
        }
        (Reply::Sequencer(self.sequencer_status()), raise)
    }

    fn timers_command(&mut self, command: u8) -> Reply {
        match command {
            cmd::STATUS => Reply::Timers(self.timers.statuses()),
            cmd::RESET => {
                self.timers.clear();
                Reply::Timers(self.timers.statuses())
            }
            read => {
                let offset = read.saturating_sub(timer_cmd::GLOBAL_READ_1);
                let timer = TimerId::from_index(usize::from(offset / timer_cmd::READ_BLOCK));
                let count = usize::from(offset % timer_cmd::READ_BLOCK).saturating_add(1);
                Reply::Entries(
                    timer
                        .map(|t| self.timers.drain(t, count))
                        .unwrap_or_default(),
                )
            }
        }
    }

    fn module_command(&mut self, id: u8, command: u8) -> Reply {
        let now = self.now();
        let module = if id == msg_id::PES {
            &mut self.pes
        } else {
            match self.modules.get_mut(&id) {
                Some(module) => module,
                None => return Reply::Entries(Vec::new()),
            }
        };
        match command {
            cmd::RESET => {
                module.clear();
                match &mut module.behaviour {
                    Behaviour::Kbd(kbd) => kbd.clear(),
                    Behaviour::ButtonAxis(bas) => bas.clear(),
                    Behaviour::Pes | Behaviour::OptEmu(_) | Behaviour::Spy => {}
                }
                if module.shape == StatusShape::Pes {
                    module.soft_reset = true;
                }
            }
            cmd::START if module.shape == StatusShape::Producer => module.start_capture(),
            cmd::STOP if module.shape == StatusShape::Producer => module.stop_capture(),
            cmd::START => module.enabled = true,
            cmd::STOP => module.enabled = false,
            read if (cmd::READ_1..=cmd::READ_MAX).contains(&read) => {
                let count = usize::from(read.saturating_sub(cmd::READ_1)).saturating_add(1);
                return Reply::Entries(module.drain(count));
            }
            _ => {}
        }
        Reply::Module(module.status(now))
    }

    fn reply_frame(&self, id: u8, command: u8, reply: &Reply) -> Frame {
        let frame = self
            .table
            .reply_kind(id, command)
            .and_then(|kind| reply.encode(kind))
            .and_then(|payload| Frame::control(id, command | cmd::REPLY_FLAG, &payload));
        match frame {
            Ok(frame) => frame,
            Err(e) => {
                warn!(msg_id = id, cmd_id = command, error = %e, "reply does not encode");
                return_code_frame(id, command, ReturnCode::BadLength)
            }
        }
    }

    fn control(&mut self, id: u8, command: u8) -> (Frame, bool) {
        let count = self.commands.entry((id, command)).or_default();
        *count = count.saturating_add(1);
        if self.table.endpoint(id).is_none() {
            return (return_code_frame(id, command, ReturnCode::UnknownMsgId), false);
        }
        if self.table.reply_kind(id, command).is_err() {
            return (return_code_frame(id, command, ReturnCode::UnknownMsgCmd), false);
        }
        self.refresh();
        let (reply, raise) = match id {
            msg_id::SEQUENCER => self.sequencer_command(command),
            msg_id::PES_TIMER => (self.timers_command(command), false),
            other => (self.module_command(other, command), false),
        };
        trace!(msg_id = id, cmd_id = command, "simulated reply");
        (self.reply_frame(id, command, &reply), raise)
    }

    fn bulk(&mut self, id: u8, data: &[u8]) -> Frame {
        let words: Vec<u32> = data
            .chunks_exact(4)
            .filter_map(|c| <[u8; 4]>::try_from(c).ok())
            .map(u32::from_le_bytes)
            .collect();
        let ready = self.state == SequencerState::ResetDone;
        let module = if id == msg_id::PES {
            Some(&mut self.pes)
        } else {
            self.modules.get_mut(&id)
        };
        let code = match module {
            None => ReturnCode::UnknownMsgId,
            Some(_) if !ready => ReturnCode::FlowControl,
            Some(module) if module.uploaded.len().saturating_add(words.len()) > module.buffer_size => {
                warn!(module = %module.name, "bulk upload exceeds the remote buffer");
                ReturnCode::FlowControl
            }
            Some(module) => {
                module.uploaded.extend(words);
                ReturnCode::Success
            }
        };
        Frame::BulkAck {
            msg_id: id,
            code: code.to_u8(),
        }
    }
}

fn return_code_frame(id: u8, command: u8, code: ReturnCode) -> Frame {
    Frame::Control {
        msg_id: msg_id::STATUS,
        cmd_id: command | cmd::REPLY_FLAG,
        payload: ReturnCodeReply::new(id, command, code).encode().to_vec(),
    }
}

/// In-process instrument answering the link protocol.
pub struct SimulatedFpga {
    state: Mutex<SimState>,
    installed: RwLock<Arc<MessageTable>>,
    error_line: Arc<SimErrorLine>,
}

impl std::fmt::Debug for SimulatedFpga {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SimulatedFpga")
            .field("state", &state.state)
            .field("run", &state.run)
            .field("modules", &state.modules.len())
            .finish_non_exhaustive()
    }
}

impl SimulatedFpga {
    /// Build the instrument described by `config`.
    pub fn new(config: &KosmosConfig) -> KosmosResult<Self> {
        config.validate()?;
        let resolved = config.tree.resolve()?;
        let events = EventMap::from_resolved(&resolved)?;
        let table = build_message_table(&resolved, config)?;

        let mut modules = BTreeMap::new();
        for module in &resolved {
            let settings = ModuleSettings::from_resolved(module, config);
            let behaviour = match &module.config {
                ModuleConfig::KbdMatrix(c) => {
                    let geometry = MatrixGeometry::new(c.rows, c.cols)?;
                    Behaviour::Kbd(SimKbd::new(geometry, KeyLayout::from_config(c, geometry)))
                }
                ModuleConfig::ButtonAxis(c) => Behaviour::ButtonAxis(SimButtonAxis::new(c)),
                ModuleConfig::OptEmu(_) => Behaviour::OptEmu(SimOptEmu::default()),
                ModuleConfig::LedSpy(_) | ModuleConfig::I2cSpy(_) => Behaviour::Spy,
            };
            let module_events = events.module(&module.name).copied().unwrap_or_default();
            modules.insert(
                module.msg_id,
                SimModule::new(&settings, module_events, behaviour),
            );
        }
        let pes = SimModule::new(
            &ModuleSettings::pes(config),
            ModuleEvents::default(),
            Behaviour::Pes,
        );
        debug!(modules = modules.len(), "simulated instrument built");
        Ok(Self {
            state: Mutex::new(SimState {
                table: table.clone(),
                clock_period_ns: config.fpga.clock_period_ns.max(1),
                time_scale_percent: 0,
                state: SequencerState::Idle,
                pes,
                modules,
                timers: SimTimers::default(),
                timer_buffer_size: config.pes.timer_buffer_size,
                go_after: None,
                started: None,
                end_tick: None,
                run: 0,
                fault_on_start: false,
                error_on_start: false,
                outputs: Outputs::default(),
                commands: BTreeMap::new(),
            }),
            installed: RwLock::new(Arc::new(table)),
            error_line: Arc::new(SimErrorLine::default()),
        })
    }

    /// Run for `percent` % of the program duration in wall-clock time.
    #[must_use]
    pub fn with_time_scale_percent(self, percent: u64) -> Self {
        self.state.lock().time_scale_percent = percent;
        self
    }

    pub fn error_line(&self) -> Arc<SimErrorLine> {
        Arc::clone(&self.error_line)
    }

    /// Assert the GO signal `ticks` after `START`.
    pub fn set_go_signal_after(&self, ticks: Option<u64>) {
        self.state.lock().go_after = ticks;
    }

    /// Entries a spy captures each time its capture starts.
    ///
    /// # Errors
    ///
    /// Returns [`DomainError::MissingModule`] when no spy is called `name`.
    pub fn script_capture(&self, name: &str, words: Vec<u32>) -> KosmosResult<()> {
        let mut state = self.state.lock();
        let module = state
            .modules
            .values_mut()
            .find(|m| m.name == name && m.shape == StatusShape::Producer)
            .ok_or_else(|| DomainError::MissingModule(name.to_string()))?;
        module.script = words;
        Ok(())
    }

    /// Go to ERROR on the next `START`.
    pub fn inject_fault_on_start(&self, fault: bool) {
        self.state.lock().fault_on_start = fault;
    }

    /// Flag an overrun on `name` (`PES` or an optional module) at every `START`.
    pub fn inject_overrun(&self, name: &str, overrun: bool) -> KosmosResult<()> {
        let mut state = self.state.lock();
        let state = &mut *state;
        let module = std::iter::once(&mut state.pes)
            .chain(state.modules.values_mut())
            .find(|m| m.name == name)
            .ok_or_else(|| DomainError::MissingModule(name.to_string()))?;
        module.inject_overrun = overrun;
        Ok(())
    }

    /// Raise the global-error line when the sequencer starts.
    pub fn raise_error_line_on_start(&self, raise: bool) {
        self.state.lock().error_on_start = raise;
    }

    pub fn keyboard_reports(&self) -> Vec<KeyboardReport> {
        self.state.lock().outputs.keyboard.clone()
    }

    pub fn button_axis_reports(&self) -> Vec<ButtonAxisReport> {
        self.state.lock().outputs.button_axis.clone()
    }

    pub fn mouse_reports(&self) -> Vec<MouseReport> {
        self.state.lock().outputs.mouse.clone()
    }

    pub fn spi_trace(&self) -> Vec<SpiTransfer> {
        self.state.lock().outputs.spi.clone()
    }

    pub fn clear_outputs(&self) {
        self.state.lock().outputs = Outputs::default();
    }

    /// Number of control requests received for (`msg_id`, `cmd_id`).
    pub fn command_count(&self, id: u8, command: u8) -> usize {
        self.state
            .lock()
            .commands
            .get(&(id, command))
            .copied()
            .unwrap_or_default()
    }

    pub fn state(&self) -> SequencerState {
        let mut state = self.state.lock();
        state.refresh();
        state.state
    }

    /// Answer one request frame.
    pub fn handle_frame(&self, frame: Frame) -> Vec<Frame> {
        let (reply, raise) = {
            let mut state = self.state.lock();
            match frame {
                Frame::Control { msg_id, cmd_id, .. } => state.control(msg_id, cmd_id),
                Frame::Bulk { msg_id, data, .. } => (state.bulk(msg_id, &data), false),
                Frame::BulkAck { msg_id, .. } => (
                    return_code_frame(msg_id, 0, ReturnCode::UnknownMsgCmd),
                    false,
                ),
            }
        };
        if raise {
            warn!("simulated global error line raised");
            self.error_line.raise();
        }
        vec![reply]
    }

    fn single_reply(&self, frame: Frame) -> KosmosResult<Frame> {
        self.handle_frame(frame)
            .into_iter()
            .next()
            .ok_or_else(|| TransportError::Closed.into())
    }
}

impl Transport for SimulatedFpga {
    fn send_control(&self, msg_id: u8, cmd_id: u8, payload: &[u8]) -> KosmosResult<Reply> {
        let reply = self.single_reply(Frame::control(msg_id, cmd_id, payload)?)?;
        let table = Arc::clone(&self.installed.read());
        decode_control_reply(&table, msg_id, cmd_id, reply)
    }

    fn send_bulk(&self, msg_id: u8, words: &[u32]) -> KosmosResult<()> {
        let reply = self.single_reply(Frame::bulk_words(msg_id, words)?)?;
        check_bulk_ack(msg_id, &reply)
    }

    fn install_table(&self, table: Arc<MessageTable>) {
        *self.installed.write() = table;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kosmos_errors::KosmosError;

    fn sim() -> Result<SimulatedFpga, Box<dyn std::error::Error>> {
        Ok(SimulatedFpga::new(&KosmosConfig::reference())?)
    }

    #[test]
    fn test_unknown_message_gets_return_code() -> Result<(), Box<dyn std::error::Error>> {
        let sim = sim()?;
        let result = sim.send_control(0x3E, cmd::STATUS, &[]);
        assert!(matches!(
            result,
            Err(KosmosError::Transport(TransportError::ReturnCode { code: 1, .. }))
        ));
        let result = sim.send_control(msg_id::PES, cmd::READ_1, &[]);
        assert!(matches!(
            result,
            Err(KosmosError::Transport(TransportError::ReturnCode { code: 2, .. }))
        ));
        Ok(())
    }

    #[test]
    fn test_bulk_requires_reset_done() -> Result<(), Box<dyn std::error::Error>> {
        let sim = sim()?;
        let result = sim.send_bulk(msg_id::PES, &[0]);
        assert!(matches!(
            result,
            Err(KosmosError::Transport(TransportError::FlowControl { code: 5, .. }))
        ));
        sim.send_control(msg_id::SEQUENCER, cmd::RESET, &[])?;
        sim.send_bulk(msg_id::PES, &[0, 0])?;
        let Reply::Module(status) = sim.send_control(msg_id::PES, cmd::STATUS, &[])? else {
            return Err("PES status expected".into());
        };
        assert_eq!(status.fifo_count() + status.buffer_count(), 2);
        Ok(())
    }

    #[test]
    fn test_button_axis_latches_pending_levels() {
        let config = ButtonAxisConfig::default();
        let mut bas = SimButtonAxis::new(&config);
        let mut outputs = Outputs::default();
        let words = [
            BasInstruction::new(BasCommand::Update, 1, 1).encode(),
            BasInstruction::new(BasCommand::UpdateSend, 8, 0x0100).encode(),
            BasInstruction::send().encode(),
        ];
        assert_eq!(bas.send(&words, 40, 1, &mut outputs), 2);
        assert_eq!(
            outputs.button_axis,
            vec![ButtonAxisReport {
                run: 1,
                tick: 40,
                pressed: vec![1],
                axes: vec![0x0100, 0x0800],
            }]
        );
        assert_eq!(bas.send(words.get(2..).unwrap_or_default(), 50, 1, &mut outputs), 1);
        assert_eq!(outputs.button_axis.len(), 1);
    }

    #[test]
    fn test_stopwatch_accumulates() {
        let mut sw = Stopwatch::default();
        sw.go(10);
        sw.stop(30);
        sw.go(100);
        assert_eq!(sw.value(105), 25);
        sw.reset(110);
        assert_eq!(sw.value(120), 10);
    }

    #[test]
    fn test_error_line_reaches_subscriber() {
        let line = SimErrorLine::default();
        let flag = Arc::new(AtomicBool::new(false));
        line.subscribe(Arc::clone(&flag));
        line.raise();
        assert!(flag.load(Ordering::Acquire));
        assert!(line.is_high());
        line.lower();
        assert!(!line.is_high());
    }
}
