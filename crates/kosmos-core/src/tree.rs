//! Device Tree: every module instance of the instrument.
//!
//! The tree owns the modules in an arena; callers refer to them through a
//! [`ModuleHandle`] or by canonical name. It is built once from a
//! [`KosmosConfig`] and its shape never changes afterwards. Building the
//! tree also freezes the message table and installs it in the transport.

use std::collections::BTreeMap;
use std::iter;
use std::sync::Arc;

use kosmos_errors::{ConfigError, DomainError, KosmosError, KosmosResult};
use kosmos_protocol::{MatrixGeometry, MessageTable, ProtocolResult, SequencerStatus};
use tracing::{debug, info};

use crate::config::{KosmosConfig, ModuleConfig, ResolvedModule};
use crate::events::EventMap;
use crate::module::{
    ButtonAxis, HardwareModule, I2cSpy, KbdMatrix, KeyLayout, LedSpy, Module, ModuleHandle, ModuleSettings,
    OptEmu, Pes, PesTimers,
};
use crate::transport::Transport;

/// Message table of the core modules plus every resolved optional module.
pub(crate) fn build_message_table(
    resolved: &[ResolvedModule],
    config: &KosmosConfig,
) -> ProtocolResult<MessageTable> {
    let mut builder = MessageTable::builder();
    for module in resolved {
        let settings = ModuleSettings::from_resolved(module, config);
        builder.register(module.msg_id, settings.endpoint())?;
    }
    Ok(builder.freeze())
}

fn event_bit(bit: Option<u16>, module: &str, event: &str) -> Result<u16, ConfigError> {
    bit.ok_or_else(|| ConfigError::invalid(module, format!("no {event} event allocated")))
}

/// Well-known slots of the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Slot {
    KbdMatrix,
    ButtonAxis,
    OptEmu,
    LedSpy,
    I2cSpy,
}

impl Slot {
    pub fn name(self) -> &'static str {
        match self {
            Slot::KbdMatrix => "KBD_MATRIX",
            Slot::ButtonAxis => "BAS",
            Slot::OptEmu => "OPTEMU",
            Slot::LedSpy => "LED_SPY",
            Slot::I2cSpy => "I2C_SPY",
        }
    }

    fn of(module: &Module) -> Self {
        match module {
            Module::KbdMatrix(_) => Slot::KbdMatrix,
            Module::ButtonAxis(_) => Slot::ButtonAxis,
            Module::OptEmu(_) => Slot::OptEmu,
            Module::LedSpy(_) => Slot::LedSpy,
            Module::I2cSpy(_) => Slot::I2cSpy,
        }
    }
}

pub struct DeviceTree {
    pes: Pes,
    timers: PesTimers,
    modules: Vec<Module>,
    slots: BTreeMap<Slot, Vec<ModuleHandle>>,
    flat: BTreeMap<String, ModuleHandle>,
    events: EventMap,
    table: Arc<MessageTable>,
    transport: Arc<dyn Transport>,
}

impl std::fmt::Debug for DeviceTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceTree")
            .field("pes", &self.pes)
            .field("modules", &self.modules)
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

impl DeviceTree {
    /// Build the tree described by `config` and install its message table
    /// in `transport`.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when the configuration is invalid: duplicate
    /// canonical names, message ids outside the dynamic range, a missing
    /// required module, more than one keyboard matrix or an exhausted event
    /// space.
    pub fn build(config: &KosmosConfig, transport: Arc<dyn Transport>) -> KosmosResult<Self> {
        config.validate()?;
        let resolved = config.tree.resolve()?;
        let keyboards = resolved
            .iter()
            .filter(|m| matches!(m.config, ModuleConfig::KbdMatrix(_)))
            .count();
        if keyboards > 1 {
            return Err(ConfigError::invalid(
                "tree.modules",
                format!("{keyboards} KBD_MATRIX modules, at most one is supported"),
            )
            .into());
        }

        let events = EventMap::from_resolved(&resolved)?;
        let kbd_ready = resolved
            .iter()
            .find(|m| matches!(m.config, ModuleConfig::KbdMatrix(_)))
            .and_then(|m| events.module(&m.name))
            .and_then(|e| e.ready);
        let pes = Pes::new(config, events.go_signal(), kbd_ready);

        let mut modules = Vec::with_capacity(resolved.len());
        let mut slots: BTreeMap<Slot, Vec<ModuleHandle>> = BTreeMap::new();
        let mut flat = BTreeMap::new();
        for module in &resolved {
            let settings = ModuleSettings::from_resolved(module, config);
            let ev = events.module(&module.name).copied().unwrap_or_default();
            let name = module.name.as_str();
            let built = match &module.config {
                ModuleConfig::KbdMatrix(c) => {
                    let geometry = MatrixGeometry::new(c.rows, c.cols)?;
                    Module::KbdMatrix(KbdMatrix::new(
                        settings,
                        geometry,
                        KeyLayout::from_config(c, geometry),
                        event_bit(ev.send, name, "send")?,
                        event_bit(ev.ready, name, "ready")?,
                    ))
                }
                ModuleConfig::ButtonAxis(c) => Module::ButtonAxis(ButtonAxis::new(
                    settings,
                    c,
                    event_bit(ev.fire, name, "fire")?,
                )),
                ModuleConfig::OptEmu(c) => {
                    Module::OptEmu(OptEmu::new(settings, c, event_bit(ev.send, name, "send")?))
                }
                ModuleConfig::LedSpy(c) => Module::LedSpy(LedSpy::new(
                    settings,
                    c.channels,
                    event_bit(ev.start, name, "start")?,
                    event_bit(ev.stop, name, "stop")?,
                )),
                ModuleConfig::I2cSpy(_) => Module::I2cSpy(I2cSpy::new(
                    settings,
                    event_bit(ev.start, name, "start")?,
                    event_bit(ev.stop, name, "stop")?,
                )),
            };
            let handle = ModuleHandle(modules.len());
            slots.entry(Slot::of(&built)).or_default().push(handle);
            flat.insert(module.name.clone(), handle);
            debug!(module = %module.name, msg_id = module.msg_id, "module added");
            modules.push(built);
        }

        let table = Arc::new(build_message_table(&resolved, config)?);
        transport.install_table(Arc::clone(&table));
        info!(modules = modules.len(), "device tree built");
        Ok(Self {
            pes,
            timers: PesTimers::new(config.pes.timer_buffer_size),
            modules,
            slots,
            flat,
            events,
            table,
            transport,
        })
    }

    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    pub fn message_table(&self) -> &MessageTable {
        &self.table
    }

    pub fn events(&self) -> &EventMap {
        &self.events
    }

    pub fn pes(&self) -> &Pes {
        &self.pes
    }

    pub fn pes_mut(&mut self) -> &mut Pes {
        &mut self.pes
    }

    pub fn timers(&self) -> &PesTimers {
        &self.timers
    }

    /// Handles of every instance in a well-known slot, in declaration order.
    pub fn by_slot(&self, slot: Slot) -> &[ModuleHandle] {
        self.slots.get(&slot).map(Vec::as_slice).unwrap_or_default()
    }

    /// Canonical name to handle, for every optional module.
    pub fn flat(&self) -> &BTreeMap<String, ModuleHandle> {
        &self.flat
    }

    pub fn module(&self, handle: ModuleHandle) -> Option<&Module> {
        self.modules.get(handle.index())
    }

    pub fn module_mut(&mut self, handle: ModuleHandle) -> Option<&mut Module> {
        self.modules.get_mut(handle.index())
    }

    pub fn get(&self, name: &str) -> Option<&Module> {
        self.flat.get(name).and_then(|h| self.module(*h))
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Module> {
        let handle = *self.flat.get(name)?;
        self.module_mut(handle)
    }

    /// PES first, then every optional module in declaration order.
    pub fn hardware_modules(&self) -> impl Iterator<Item = &dyn HardwareModule> {
        iter::once(&self.pes as &dyn HardwareModule).chain(self.modules.iter().map(Module::as_hw))
    }

    fn missing(name: &str) -> KosmosError {
        DomainError::MissingModule(name.to_string()).into()
    }

    pub fn kbd(&self) -> KosmosResult<&KbdMatrix> {
        match self.by_slot(Slot::KbdMatrix).first().and_then(|h| self.module(*h)) {
            Some(Module::KbdMatrix(kbd)) => Ok(kbd),
            _ => Err(Self::missing(Slot::KbdMatrix.name())),
        }
    }

    pub fn kbd_mut(&mut self) -> KosmosResult<&mut KbdMatrix> {
        Ok(self.pes_and_kbd_mut()?.1)
    }

    /// The PES and the keyboard matrix, borrowed together.
    pub fn pes_and_kbd_mut(&mut self) -> KosmosResult<(&mut Pes, &mut KbdMatrix)> {
        let handle = self.by_slot(Slot::KbdMatrix).first().copied();
        match handle.and_then(|h| self.modules.get_mut(h.index())) {
            Some(Module::KbdMatrix(kbd)) => Ok((&mut self.pes, kbd)),
            _ => Err(Self::missing(Slot::KbdMatrix.name())),
        }
    }

    /// The PES and optical emulator number `index`, borrowed together.
    pub fn pes_and_opt_emu_mut(&mut self, index: usize) -> KosmosResult<(&mut Pes, &mut OptEmu)> {
        let handle = self.by_slot(Slot::OptEmu).get(index).copied();
        match handle.and_then(|h| self.modules.get_mut(h.index())) {
            Some(Module::OptEmu(emu)) => Ok((&mut self.pes, emu)),
            _ => Err(Self::missing(&format!("{}[{index}]", Slot::OptEmu.name()))),
        }
    }

    /// The PES and button/axis stimulus number `index`, borrowed together.
    pub fn pes_and_button_axis_mut(
        &mut self,
        index: usize,
    ) -> KosmosResult<(&mut Pes, &mut ButtonAxis)> {
        let handle = self.by_slot(Slot::ButtonAxis).get(index).copied();
        match handle.and_then(|h| self.modules.get_mut(h.index())) {
            Some(Module::ButtonAxis(bas)) => Ok((&mut self.pes, bas)),
            _ => Err(Self::missing(&format!("{}[{index}]", Slot::ButtonAxis.name()))),
        }
    }

    pub fn button_axis(&self, index: usize) -> KosmosResult<&ButtonAxis> {
        match self.by_slot(Slot::ButtonAxis).get(index).and_then(|h| self.module(*h)) {
            Some(Module::ButtonAxis(bas)) => Ok(bas),
            _ => Err(Self::missing(&format!("{}[{index}]", Slot::ButtonAxis.name()))),
        }
    }

    pub fn opt_emu(&self, index: usize) -> KosmosResult<&OptEmu> {
        match self.by_slot(Slot::OptEmu).get(index).and_then(|h| self.module(*h)) {
            Some(Module::OptEmu(emu)) => Ok(emu),
            _ => Err(Self::missing(&format!("{}[{index}]", Slot::OptEmu.name()))),
        }
    }

    pub fn led_spy(&self, name: &str) -> KosmosResult<&LedSpy> {
        match self.get(name) {
            Some(Module::LedSpy(spy)) => Ok(spy),
            _ => Err(Self::missing(name)),
        }
    }

    pub fn i2c_spy(&self, name: &str) -> KosmosResult<&I2cSpy> {
        match self.get(name) {
            Some(Module::I2cSpy(spy)) => Ok(spy),
            _ => Err(Self::missing(name)),
        }
    }

    /// Start and stop actions of the spy `name`.
    pub fn capture_actions(&self, name: &str) -> KosmosResult<(u16, u16)> {
        match self.get(name) {
            Some(Module::LedSpy(spy)) => Ok((spy.start_action(), spy.stop_action())),
            Some(Module::I2cSpy(spy)) => Ok((spy.start_action(), spy.stop_action())),
            _ => Err(Self::missing(name)),
        }
    }

    /// Whether any local buffer holds instructions.
    pub fn has_pending(&self) -> bool {
        self.hardware_modules().any(|m| !m.base().is_empty())
    }

    /// Upload every non-empty local buffer.
    pub fn send_all(&self) -> KosmosResult<()> {
        for module in self.hardware_modules() {
            module.base().send(self.transport())?;
        }
        Ok(())
    }

    /// Drop every local buffer.
    pub fn clear_all(&mut self) {
        self.pes.clear();
        for module in &mut self.modules {
            module.as_hw_mut().clear();
        }
        debug!("local buffers cleared");
    }

    /// Check that every module triggered by the PES program has enough
    /// commit instructions buffered.
    ///
    /// # Errors
    ///
    /// Returns [`DomainError::ProgramOrder`] naming the first module that
    /// would be triggered more often than it can consume.
    pub fn check_program_order(&self) -> Result<(), DomainError> {
        for module in &self.modules {
            let Some(action) = module.send_action() else {
                continue;
            };
            let executes = self.pes.count_actions(action);
            let commits = module.commits();
            if executes > commits {
                return Err(DomainError::ProgramOrder {
                    module: module.name().to_string(),
                    executes,
                    commits,
                });
            }
        }
        Ok(())
    }

    /// Put a WAIT on the keyboard ready event at the head of the PES
    /// program when the keyboard has buffered instructions.
    pub fn insert_wait_kbd_workaround(&mut self) -> KosmosResult<bool> {
        let kbd_pending = self.kbd().is_ok_and(|kbd| !kbd.base().is_empty());
        self.pes.insert_wait_kbd_workaround(kbd_pending)
    }

    /// Download what the spies and timers captured during the run, using
    /// the buffer counts of the end-of-run status.
    pub fn download_captures(&mut self, status: &SequencerStatus) -> KosmosResult<()> {
        let transport = Arc::clone(&self.transport);
        for module in &mut self.modules {
            let msg_id = module.as_hw().settings().msg_id;
            let count = status
                .entry(msg_id, 0)
                .map(|r| usize::from(r.buffer_count))
                .unwrap_or_default();
            if count == 0 {
                continue;
            }
            match module {
                Module::LedSpy(spy) => {
                    spy.download(transport.as_ref(), count)?;
                }
                Module::I2cSpy(spy) => {
                    spy.download(transport.as_ref(), count)?;
                }
                _ => {}
            }
        }
        let counts = PesTimers::pending_counts(status);
        self.timers.download(transport.as_ref(), counts)
    }

    /// Spy entries downloaded from now on belong to a new run.
    pub fn begin_capture_run(&mut self) {
        for module in &mut self.modules {
            match module {
                Module::LedSpy(spy) => spy.begin_run(),
                Module::I2cSpy(spy) => spy.begin_run(),
                _ => {}
            }
        }
    }

    /// Drop the captures of every spy and timer.
    pub fn clear_captures(&mut self) {
        for module in &mut self.modules {
            match module {
                Module::LedSpy(spy) => spy.clear_captures(),
                Module::I2cSpy(spy) => spy.clear_captures(),
                _ => {}
            }
        }
        self.timers.clear_captures();
    }

    /// Human-readable dump of the modules and event allocation.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        for module in self.hardware_modules() {
            let settings = module.settings();
            out.push_str(&format!(
                "{:#04x} {:<12} {:?} buffer={} fifo={} pending={}\n",
                settings.msg_id,
                module.name(),
                settings.shape,
                settings.buffer_size,
                settings.fifo_size,
                module.base().len()
            ));
        }
        for (bit, name) in self.events.actions() {
            out.push_str(&format!("action {bit:#05x} {name}\n"));
        }
        for (bit, name) in self.events.resumes() {
            out.push_str(&format!("resume {bit:#05x} {name}\n"));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::StreamTransport;
    use crate::transport::mock::MockStream;
    use kosmos_protocol::{ReplyKind, StatusShape, cmd, msg_id};

    fn tree(config: &KosmosConfig) -> KosmosResult<DeviceTree> {
        DeviceTree::build(config, Arc::new(StreamTransport::new(MockStream::new())))
    }

    #[test]
    fn test_reference_tree() -> Result<(), Box<dyn std::error::Error>> {
        let tree = tree(&KosmosConfig::reference())?;
        assert_eq!(
            tree.flat().keys().map(String::as_str).collect::<Vec<_>>(),
            vec!["I2C_SPY", "KBD_MATRIX", "LED_SPY", "OPTEMU"]
        );
        assert_eq!(tree.by_slot(Slot::LedSpy).len(), 1);
        assert_eq!(tree.hardware_modules().count(), 5);
        assert_eq!(
            tree.message_table().reply_kind(0x12, cmd::READ_1)?,
            ReplyKind::Entries { width: 4 }
        );
        assert_eq!(
            tree.message_table().reply_kind(msg_id::PES, cmd::STATUS)?,
            ReplyKind::ModuleStatus(StatusShape::Pes)
        );
        tree.kbd()?;
        Ok(())
    }

    #[test]
    fn test_second_keyboard_rejected() {
        let config = KosmosConfig {
            tree: crate::config::TreeConfig {
                modules: vec![
                    ModuleConfig::kbd_matrix(),
                    ModuleConfig::kbd_matrix().with_instance(2),
                ],
                require: Vec::new(),
            },
            ..KosmosConfig::default()
        };
        assert!(matches!(
            tree(&config),
            Err(KosmosError::Config(ConfigError::Invalid { .. }))
        ));
    }

    #[test]
    fn test_missing_keyboard() -> Result<(), Box<dyn std::error::Error>> {
        let config = KosmosConfig::builder()
            .module(ModuleConfig::led_spy())
            .build()?;
        let mut tree = tree(&config)?;
        assert!(matches!(
            tree.pes_and_kbd_mut(),
            Err(KosmosError::Domain(DomainError::MissingModule(_)))
        ));
        assert!(!tree.insert_wait_kbd_workaround()?);
        Ok(())
    }

    #[test]
    fn test_program_order() -> Result<(), Box<dyn std::error::Error>> {
        let mut tree = tree(&KosmosConfig::reference())?;
        let (pes, kbd) = tree.pes_and_kbd_mut()?;
        let send = kbd.send_action();
        pes.execute(send)?;
        assert!(matches!(
            tree.check_program_order(),
            Err(DomainError::ProgramOrder {
                executes: 1,
                commits: 0,
                ..
            })
        ));

        tree.kbd_mut()?.press("A")?;
        tree.check_program_order()?;
        assert!(tree.has_pending());
        tree.clear_all();
        assert!(!tree.has_pending());
        Ok(())
    }
}
