//! Instrument configuration.
//!
//! A [`KosmosConfig`] describes the FPGA clock, the PES tunables and the
//! optional modules fitted to the instrument. It is loaded from YAML or JSON
//! and consumed by [`DeviceTree::build`](crate::tree::DeviceTree::build).
//!
//! ```yaml
//! fpga:
//!   clock_period_ns: 10
//! pes:
//!   refill_interval_ns: 4000
//! tree:
//!   modules:
//!     - kind: kbd_matrix
//!       rows: 16
//!       cols: 8
//!     - kind: led_spy
//!       msg_id: 0x14
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;

use kosmos_errors::ConfigError;
use kosmos_protocol::bas::{BAS_CHANNELS, BAS_LEVEL_MAX};
use kosmos_protocol::frame::MAX_BULK_COUNT;
use kosmos_protocol::{MatrixGeometry, msg_id};
use serde::{Deserialize, Serialize};

/// Names of the modules every tree carries.
pub const CORE_MODULE_NAMES: [&str; 3] = ["SEQUENCER", "PES", "TIMERS"];

/// Complete instrument configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KosmosConfig {
    pub fpga: FpgaConfig,
    pub pes: PesConfig,
    pub tree: TreeConfig,
}

/// FPGA link and sequencer timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FpgaConfig {
    /// FPGA clock period. One PES tick lasts one period.
    pub clock_period_ns: u64,
    /// Sequencer status poll interval while RUNNING.
    pub poll_interval_ms: u64,
    /// Default `play_sequence` timeout.
    pub default_timeout_s: u64,
    /// Reply timeout of a single control message.
    pub transport_timeout_ms: u64,
    /// Largest number of instructions in one bulk frame.
    pub max_bulk_entries: usize,
}

impl Default for FpgaConfig {
    fn default() -> Self {
        Self {
            clock_period_ns: 10,
            poll_interval_ms: 10,
            default_timeout_s: 60,
            transport_timeout_ms: 1000,
            max_bulk_entries: 256,
        }
    }
}

impl FpgaConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_s)
    }

    pub fn transport_timeout(&self) -> Duration {
        Duration::from_millis(self.transport_timeout_ms)
    }
}

/// Programmable Event Sequencer settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PesConfig {
    /// PES refill interval.
    ///
    /// The FPGA consumes the PES FIFO no faster than the link refills it.
    /// Scenario helpers separate back-to-back instructions by this delay so
    /// that tight loops do not underrun the FIFO.
    pub refill_interval_ns: u64,
    pub buffer_size: usize,
    pub fifo_size: usize,
    /// Entries per timer buffer.
    pub timer_buffer_size: usize,
}

impl Default for PesConfig {
    fn default() -> Self {
        Self {
            refill_interval_ns: 4000,
            buffer_size: 4096,
            fifo_size: 64,
            timer_buffer_size: 64,
        }
    }
}

impl PesConfig {
    pub fn refill_interval(&self) -> Duration {
        Duration::from_nanos(self.refill_interval_ns)
    }
}

/// Optional modules fitted to the instrument.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TreeConfig {
    pub modules: Vec<ModuleConfig>,
    /// Canonical names that must be present once the tree is built.
    pub require: Vec<String>,
}

/// Settings shared by every optional module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleCommon {
    /// Instance number, for modules fitted more than once.
    pub instance_id: Option<u8>,
    /// Message id; allocated from the dynamic range when absent.
    pub msg_id: Option<u8>,
    pub buffer_size: usize,
    pub fifo_size: usize,
    /// Fetch this module's own status at end of run, on top of the
    /// aggregated sequencer status.
    pub separate_status: bool,
}

impl Default for ModuleCommon {
    fn default() -> Self {
        Self {
            instance_id: None,
            msg_id: None,
            buffer_size: 1024,
            fifo_size: 16,
            separate_status: false,
        }
    }
}

/// Row and column of a key in the matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPosition {
    pub row: u8,
    pub col: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KbdMatrixConfig {
    #[serde(flatten)]
    pub common: ModuleCommon,
    pub rows: u8,
    pub cols: u8,
    /// Key name to matrix position. Empty selects the reference layout.
    pub layout: BTreeMap<String, KeyPosition>,
}

impl Default for KbdMatrixConfig {
    fn default() -> Self {
        Self {
            common: ModuleCommon::default(),
            rows: 16,
            cols: 8,
            layout: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptEmuConfig {
    #[serde(flatten)]
    pub common: ModuleCommon,
    /// Replace raw instructions by a compressed entry whenever possible.
    pub compression: bool,
    /// Smallest displacement the emulated sensor reports.
    pub delta_min: i16,
    /// Largest displacement the emulated sensor reports.
    pub delta_max: i16,
}

impl Default for OptEmuConfig {
    fn default() -> Self {
        Self {
            common: ModuleCommon::default(),
            compression: true,
            delta_min: -2048,
            delta_max: 2047,
        }
    }
}

/// Button/axis stimulus: `buttons` button channels, then `axes` axis
/// channels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ButtonAxisConfig {
    #[serde(flatten)]
    pub common: ModuleCommon,
    pub buttons: u8,
    pub axes: u8,
    /// Level of an axis at rest, and after a reset.
    pub axis_rest: u16,
}

impl Default for ButtonAxisConfig {
    fn default() -> Self {
        Self {
            common: ModuleCommon::default(),
            buttons: 8,
            axes: 2,
            axis_rest: 0x0800,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedSpyConfig {
    #[serde(flatten)]
    pub common: ModuleCommon,
    pub channels: u8,
}

impl Default for LedSpyConfig {
    fn default() -> Self {
        Self {
            common: ModuleCommon::default(),
            channels: 16,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct I2cSpyConfig {
    #[serde(flatten)]
    pub common: ModuleCommon,
}

/// One optional module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModuleConfig {
    KbdMatrix(KbdMatrixConfig),
    ButtonAxis(ButtonAxisConfig),
    OptEmu(OptEmuConfig),
    LedSpy(LedSpyConfig),
    I2cSpy(I2cSpyConfig),
}

impl ModuleConfig {
    pub fn kbd_matrix() -> Self {
        ModuleConfig::KbdMatrix(KbdMatrixConfig::default())
    }

    pub fn button_axis() -> Self {
        ModuleConfig::ButtonAxis(ButtonAxisConfig::default())
    }

    pub fn opt_emu() -> Self {
        ModuleConfig::OptEmu(OptEmuConfig::default())
    }

    pub fn led_spy() -> Self {
        ModuleConfig::LedSpy(LedSpyConfig::default())
    }

    pub fn i2c_spy() -> Self {
        ModuleConfig::I2cSpy(I2cSpyConfig::default())
    }

    #[must_use]
    pub fn with_instance(mut self, instance_id: u8) -> Self {
        self.common_mut().instance_id = Some(instance_id);
        self
    }

    #[must_use]
    pub fn with_msg_id(mut self, id: u8) -> Self {
        self.common_mut().msg_id = Some(id);
        self
    }

    #[must_use]
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.common_mut().buffer_size = buffer_size;
        self
    }

    pub fn common(&self) -> &ModuleCommon {
        match self {
            ModuleConfig::KbdMatrix(c) => &c.common,
            ModuleConfig::ButtonAxis(c) => &c.common,
            ModuleConfig::OptEmu(c) => &c.common,
            ModuleConfig::LedSpy(c) => &c.common,
            ModuleConfig::I2cSpy(c) => &c.common,
        }
    }

    pub fn common_mut(&mut self) -> &mut ModuleCommon {
        match self {
            ModuleConfig::KbdMatrix(c) => &mut c.common,
            ModuleConfig::ButtonAxis(c) => &mut c.common,
            ModuleConfig::OptEmu(c) => &mut c.common,
            ModuleConfig::LedSpy(c) => &mut c.common,
            ModuleConfig::I2cSpy(c) => &mut c.common,
        }
    }

    /// Module class name, shared by every instance.
    pub fn base_name(&self) -> &'static str {
        match self {
            ModuleConfig::KbdMatrix(_) => "KBD_MATRIX",
            ModuleConfig::ButtonAxis(_) => "BAS",
            ModuleConfig::OptEmu(_) => "OPTEMU",
            ModuleConfig::LedSpy(_) => "LED_SPY",
            ModuleConfig::I2cSpy(_) => "I2C_SPY",
        }
    }

    /// Identifier-safe name, unique across the tree.
    pub fn canonical_name(&self) -> String {
        canonical_name(self.base_name(), self.common().instance_id)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let name = self.canonical_name();
        let common = self.common();
        if common.buffer_size < 2 {
            return Err(ConfigError::invalid(
                format!("{name}.buffer_size"),
                "must hold at least one entry",
            ));
        }
        if common.fifo_size == 0 {
            return Err(ConfigError::invalid(
                format!("{name}.fifo_size"),
                "must be at least 1",
            ));
        }
        match self {
            ModuleConfig::KbdMatrix(c) => {
                let geometry = MatrixGeometry::new(c.rows, c.cols)
                    .map_err(|e| ConfigError::invalid(format!("{name}.geometry"), e.to_string()))?;
                for (key, pos) in &c.layout {
                    geometry.locate(pos.row, pos.col).map_err(|e| {
                        ConfigError::invalid(format!("{name}.layout.{key}"), e.to_string())
                    })?;
                }
            }
            ModuleConfig::ButtonAxis(c) => {
                let channels = u16::from(c.buttons).saturating_add(u16::from(c.axes));
                if channels == 0 || channels > BAS_CHANNELS {
                    return Err(ConfigError::invalid(
                        format!("{name}.buttons"),
                        format!("buttons plus axes must be between 1 and {BAS_CHANNELS}"),
                    ));
                }
                if c.axis_rest > BAS_LEVEL_MAX {
                    return Err(ConfigError::invalid(
                        format!("{name}.axis_rest"),
                        format!("must not exceed {BAS_LEVEL_MAX:#06x}"),
                    ));
                }
            }
            ModuleConfig::OptEmu(c) => {
                if c.delta_min >= 0 || c.delta_max <= 0 {
                    return Err(ConfigError::invalid(
                        format!("{name}.delta_min"),
                        "displacement range must contain zero",
                    ));
                }
            }
            ModuleConfig::LedSpy(c) => {
                let max = kosmos_protocol::capture::LED_CHANNEL_MAX;
                if c.channels == 0 || c.channels > max + 1 {
                    return Err(ConfigError::invalid(
                        format!("{name}.channels"),
                        format!("must be between 1 and {}", u16::from(max) + 1),
                    ));
                }
            }
            ModuleConfig::I2cSpy(_) => {}
        }
        Ok(())
    }
}

/// Identifier-safe name of a module instance.
pub fn canonical_name(base: &str, instance_id: Option<u8>) -> String {
    let base: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    match instance_id {
        Some(id) => format!("{base}_{id}"),
        None => base,
    }
}

/// A module with its final name and message id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedModule {
    pub name: String,
    pub msg_id: u8,
    pub config: ModuleConfig,
}

impl TreeConfig {
    /// Assign message ids and canonical names, checking uniqueness.
    ///
    /// Explicit ids are kept; the others are allocated in declaration
    /// order from the lowest free id of the dynamic range.
    pub fn resolve(&self) -> Result<Vec<ResolvedModule>, ConfigError> {
        let mut used = BTreeSet::new();
        for module in &self.modules {
            if let Some(id) = module.common().msg_id {
                if !msg_id::is_dynamic(id) {
                    return Err(ConfigError::MsgIdOutOfRange {
                        module: module.canonical_name(),
                        msg_id: id,
                        min: msg_id::DYN_BASE,
                        max: msg_id::DYN_END,
                    });
                }
                if !used.insert(id) {
                    return Err(ConfigError::invalid(
                        format!("{}.msg_id", module.canonical_name()),
                        format!("message id {id:#04x} is used twice"),
                    ));
                }
            }
        }

        let mut names: BTreeSet<String> =
            CORE_MODULE_NAMES.iter().map(|n| (*n).to_string()).collect();
        let mut resolved = Vec::with_capacity(self.modules.len());
        for module in &self.modules {
            let name = module.canonical_name();
            if !names.insert(name.clone()) {
                return Err(ConfigError::DuplicateName(name));
            }
            let id = match module.common().msg_id {
                Some(id) => id,
                None => {
                    let id = (msg_id::DYN_BASE..=msg_id::DYN_END)
                        .find(|id| !used.contains(id))
                        .ok_or_else(|| {
                            ConfigError::invalid(
                                format!("{name}.msg_id"),
                                "dynamic message id range exhausted",
                            )
                        })?;
                    used.insert(id);
                    id
                }
            };
            resolved.push(ResolvedModule {
                name,
                msg_id: id,
                config: module.clone(),
            });
        }

        for required in &self.require {
            if !names.contains(required) {
                return Err(ConfigError::MissingModule(required.clone()));
            }
        }
        Ok(resolved)
    }
}

impl KosmosConfig {
    /// Reference instrument: one module of every kind.
    pub fn reference() -> Self {
        Self {
            tree: TreeConfig {
                modules: vec![
                    ModuleConfig::kbd_matrix(),
                    ModuleConfig::opt_emu(),
                    ModuleConfig::led_spy(),
                    ModuleConfig::i2c_spy(),
                ],
                require: Vec::new(),
            },
            ..Self::default()
        }
    }

    #[must_use]
    pub fn builder() -> KosmosConfigBuilder {
        KosmosConfigBuilder::default()
    }

    /// Load and validate a configuration file. The format follows the
    /// extension: `.yaml`/`.yml` or `.json`.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let display = path.display().to_string();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: display.clone(),
            message: e.to_string(),
        })?;
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        let config = match extension.as_deref() {
            Some("yaml" | "yml") => Self::parse_yaml(&content, &display)?,
            Some("json") => Self::parse_json(&content, &display)?,
            _ => {
                return Err(ConfigError::invalid(
                    "path",
                    format!("{display}: expected a .yaml, .yml or .json file"),
                ));
            }
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let config = Self::parse_yaml(content, "<yaml>")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        let config = Self::parse_json(content, "<json>")?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        serde_yaml::to_string(self).map_err(|e| ConfigError::Parse {
            path: "<yaml>".to_string(),
            message: e.to_string(),
        })
    }

    fn parse_yaml(content: &str, path: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(|e| ConfigError::Parse {
            path: path.to_string(),
            message: e.to_string(),
        })
    }

    fn parse_json(content: &str, path: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(content).map_err(|e| ConfigError::Parse {
            path: path.to_string(),
            message: e.to_string(),
        })
    }

    /// Validate every section.
    ///
    /// # Errors
    ///
    /// Returns the first invalid field found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fpga = &self.fpga;
        if fpga.clock_period_ns == 0 {
            return Err(ConfigError::invalid("fpga.clock_period_ns", "must be non-zero"));
        }
        if !(1..=1000).contains(&fpga.poll_interval_ms) {
            return Err(ConfigError::invalid(
                "fpga.poll_interval_ms",
                "must be between 1 and 1000",
            ));
        }
        if fpga.default_timeout_s == 0 {
            return Err(ConfigError::invalid("fpga.default_timeout_s", "must be non-zero"));
        }
        if !(1..=MAX_BULK_COUNT).contains(&fpga.max_bulk_entries) {
            return Err(ConfigError::invalid(
                "fpga.max_bulk_entries",
                format!("must be between 1 and {MAX_BULK_COUNT}"),
            ));
        }

        let pes = &self.pes;
        if pes.refill_interval_ns < fpga.clock_period_ns {
            return Err(ConfigError::invalid(
                "pes.refill_interval_ns",
                "must be at least one clock period",
            ));
        }
        if pes.buffer_size < 2 {
            return Err(ConfigError::invalid("pes.buffer_size", "must hold at least one entry"));
        }
        if pes.fifo_size == 0 || pes.timer_buffer_size == 0 {
            return Err(ConfigError::invalid("pes", "FIFO and timer buffers must be non-empty"));
        }

        for module in &self.tree.modules {
            module.validate()?;
        }
        self.tree.resolve().map(|_| ())
    }
}

/// Builder for [`KosmosConfig`].
#[derive(Debug, Default)]
pub struct KosmosConfigBuilder {
    config: KosmosConfig,
}

impl KosmosConfigBuilder {
    #[must_use]
    pub fn clock_period_ns(mut self, ns: u64) -> Self {
        self.config.fpga.clock_period_ns = ns;
        self
    }

    #[must_use]
    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.fpga.poll_interval_ms = ms;
        self
    }

    #[must_use]
    pub fn default_timeout_s(mut self, seconds: u64) -> Self {
        self.config.fpga.default_timeout_s = seconds;
        self
    }

    #[must_use]
    pub fn max_bulk_entries(mut self, entries: usize) -> Self {
        self.config.fpga.max_bulk_entries = entries;
        self
    }

    #[must_use]
    pub fn refill_interval_ns(mut self, ns: u64) -> Self {
        self.config.pes.refill_interval_ns = ns;
        self
    }

    #[must_use]
    pub fn pes_buffer_size(mut self, entries: usize) -> Self {
        self.config.pes.buffer_size = entries;
        self
    }

    #[must_use]
    pub fn module(mut self, module: ModuleConfig) -> Self {
        self.config.tree.modules.push(module);
        self
    }

    #[must_use]
    pub fn require(mut self, name: impl Into<String>) -> Self {
        self.config.tree.require.push(name.into());
        self
    }

    /// Validate and return the configuration.
    pub fn build(self) -> Result<KosmosConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
