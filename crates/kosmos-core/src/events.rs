//! PES action and resume event allocation.
//!
//! An EXECUTE or DELAY instruction raises a 12-bit action mask; a WAIT
//! instruction suspends on a 12-bit resume mask. Bits are handed out in
//! module declaration order, so the host and the FPGA bitstream (or the
//! simulator) derive the same map from the same configuration.

use std::collections::BTreeMap;

use kosmos_errors::ConfigError;
use kosmos_protocol::pes::EVENT_BITS;

use crate::config::{ModuleConfig, ResolvedModule};

/// Resume bit of the external go signal.
pub const GO_SIGNAL: u16 = 1 << 0;

/// Events owned by one module. Each mask has a single bit set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModuleEvents {
    /// Consume the next buffered instruction(s) up to a commit.
    pub send: Option<u16>,
    /// Latch the pending button and axis levels.
    pub fire: Option<u16>,
    /// Resume event raised once the module has consumed its last command.
    pub ready: Option<u16>,
    /// Start capturing.
    pub start: Option<u16>,
    /// Stop capturing.
    pub stop: Option<u16>,
}

#[derive(Debug, Clone, Copy)]
struct BitAllocator {
    next: u32,
    kind: &'static str,
}

impl BitAllocator {
    fn new(first: u32, kind: &'static str) -> Self {
        Self { next: first, kind }
    }

    fn take(&mut self) -> Result<u16, ConfigError> {
        if self.next >= EVENT_BITS {
            return Err(ConfigError::EventSpaceExhausted {
                kind: self.kind.to_string(),
                capacity: EVENT_BITS,
            });
        }
        let bit = 1u16 << self.next;
        self.next += 1;
        Ok(bit)
    }
}

/// Action and resume bits of every module in the tree.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EventMap {
    modules: BTreeMap<String, ModuleEvents>,
    order: Vec<String>,
}

impl EventMap {
    pub fn from_resolved(modules: &[ResolvedModule]) -> Result<Self, ConfigError> {
        let mut actions = BitAllocator::new(0, "action");
        let mut resumes = BitAllocator::new(1, "resume");
        let mut map = Self::default();
        for module in modules {
            let events = match &module.config {
                ModuleConfig::KbdMatrix(_) => ModuleEvents {
                    send: Some(actions.take()?),
                    ready: Some(resumes.take()?),
                    ..ModuleEvents::default()
                },
                ModuleConfig::ButtonAxis(_) => ModuleEvents {
                    fire: Some(actions.take()?),
                    ..ModuleEvents::default()
                },
                ModuleConfig::OptEmu(_) => ModuleEvents {
                    send: Some(actions.take()?),
                    ..ModuleEvents::default()
                },
                ModuleConfig::LedSpy(_) | ModuleConfig::I2cSpy(_) => ModuleEvents {
                    start: Some(actions.take()?),
                    stop: Some(actions.take()?),
                    ..ModuleEvents::default()
                },
            };
            map.modules.insert(module.name.clone(), events);
            map.order.push(module.name.clone());
        }
        Ok(map)
    }

    pub fn module(&self, name: &str) -> Option<&ModuleEvents> {
        self.modules.get(name)
    }

    pub fn go_signal(&self) -> u16 {
        GO_SIGNAL
    }

    /// Named action bits, e.g. `KBD_MATRIX.SEND`, in bit order.
    pub fn actions(&self) -> Vec<(u16, String)> {
        let mut named = Vec::new();
        for name in &self.order {
            if let Some(events) = self.modules.get(name) {
                let named_bits = [
                    ("SEND", events.send),
                    ("FIRE", events.fire),
                    ("START", events.start),
                    ("STOP", events.stop),
                ];
                for (suffix, bit) in named_bits {
                    if let Some(bit) = bit {
                        named.push((bit, format!("{name}.{suffix}")));
                    }
                }
            }
        }
        named.sort_by_key(|(bit, _)| *bit);
        named
    }

    /// Named resume bits, `GO_RPI` first.
    pub fn resumes(&self) -> Vec<(u16, String)> {
        let mut named = vec![(GO_SIGNAL, "GO_RPI".to_string())];
        for name in &self.order {
            if let Some(bit) = self.modules.get(name).and_then(|e| e.ready) {
                named.push((bit, format!("{name}.READY")));
            }
        }
        named
    }

    /// Names of the actions set in `mask`.
    pub fn describe_actions(&self, mask: u16) -> Vec<String> {
        self.actions()
            .into_iter()
            .filter(|(bit, _)| mask & bit != 0)
            .map(|(_, name)| name)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TreeConfig;

    fn resolve(modules: Vec<ModuleConfig>) -> Result<Vec<ResolvedModule>, ConfigError> {
        TreeConfig {
            modules,
            require: Vec::new(),
        }
        .resolve()
    }

    #[test]
    fn test_allocation_follows_declaration_order() -> Result<(), Box<dyn std::error::Error>> {
        let resolved = resolve(vec![
            ModuleConfig::kbd_matrix(),
            ModuleConfig::led_spy(),
            ModuleConfig::opt_emu(),
        ])?;
        let map = EventMap::from_resolved(&resolved)?;

        let kbd = map.module("KBD_MATRIX").ok_or("kbd events")?;
        assert_eq!(kbd.send, Some(0x001));
        assert_eq!(kbd.ready, Some(0x002));
        let spy = map.module("LED_SPY").ok_or("spy events")?;
        assert_eq!((spy.start, spy.stop), (Some(0x002), Some(0x004)));
        assert_eq!(map.module("OPTEMU").and_then(|e| e.send), Some(0x008));

        assert_eq!(map.describe_actions(0x009), vec!["KBD_MATRIX.SEND", "OPTEMU.SEND"]);
        assert_eq!(
            map.resumes(),
            vec![(0x001, "GO_RPI".to_string()), (0x002, "KBD_MATRIX.READY".to_string())]
        );
        Ok(())
    }

    #[test]
    fn test_button_axis_fires() -> Result<(), Box<dyn std::error::Error>> {
        let resolved = resolve(vec![ModuleConfig::button_axis(), ModuleConfig::kbd_matrix()])?;
        let map = EventMap::from_resolved(&resolved)?;
        let bas = map.module("BAS").ok_or("bas events")?;
        assert_eq!((bas.fire, bas.send, bas.ready), (Some(0x001), None, None));
        assert_eq!(map.describe_actions(0x003), vec!["BAS.FIRE", "KBD_MATRIX.SEND"]);
        Ok(())
    }

    #[test]
    fn test_action_space_exhausted() -> Result<(), Box<dyn std::error::Error>> {
        let spies: Vec<ModuleConfig> = (0..7).map(|i| ModuleConfig::led_spy().with_instance(i)).collect();
        let resolved = resolve(spies)?;
        assert!(matches!(
            EventMap::from_resolved(&resolved),
            Err(ConfigError::EventSpaceExhausted { capacity: 12, .. })
        ));
        Ok(())
    }
}
