//! Capture modules: LED spy and I²C spy.
//!
//! Spies start and stop capturing on PES actions (or on a direct control
//! command) and fill their remote buffer with 32-bit entries. Entries are
//! downloaded after the run and parsed on demand.
//!
//! Entry timestamps count from the first entry of a run, so the entries of
//! every run of a repeated play are kept apart and parsed on their own.

use kosmos_errors::{
    KosmosError, KosmosResult, SequencerError, SequencerErrorKind, StatusReport, TransportError,
};
use kosmos_protocol::ids::PRODUCER_READ_MAX_ENTRIES;
use kosmos_protocol::{
    CaptureState, I2cEvent, I2cFrame, LedEvent, ModuleStatus, cmd, group_i2c_frames,
    parse_i2c_entries, parse_led_entries,
};
use tracing::{debug, error};

use super::{HardwareModule, ModuleBase, ModuleSettings, counters, download_entries};
use crate::transport::Transport;

/// State shared by every spy.
#[derive(Debug)]
struct Producer {
    base: ModuleBase,
    start_action: u16,
    stop_action: u16,
    captured: Vec<u32>,
    /// Offset in `captured` of the first entry of each run.
    run_starts: Vec<usize>,
}

impl Producer {
    fn new(settings: ModuleSettings, start_action: u16, stop_action: u16) -> Self {
        Self {
            base: ModuleBase::new(settings),
            start_action,
            stop_action,
            captured: Vec::new(),
            run_starts: Vec::new(),
        }
    }

    fn begin_run(&mut self) {
        self.run_starts.push(self.captured.len());
    }

    /// Captured entries split by run. Entries downloaded before any run
    /// began form a run of their own.
    fn runs(&self) -> Vec<&[u32]> {
        let mut starts = self.run_starts.clone();
        if starts.first() != Some(&0) {
            starts.insert(0, 0);
        }
        starts
            .iter()
            .enumerate()
            .map(|(i, &start)| {
                let end = starts
                    .get(i.saturating_add(1))
                    .copied()
                    .unwrap_or(self.captured.len());
                self.captured.get(start..end).unwrap_or_default()
            })
            .collect()
    }

    fn clear(&mut self) {
        self.captured.clear();
        self.run_starts.clear();
    }

    fn capture_command(
        &self,
        transport: &dyn Transport,
        command: u8,
        expected: CaptureState,
    ) -> KosmosResult<ModuleStatus> {
        let status = self.base.control(transport, command)?;
        let actual = match status {
            ModuleStatus::Producer(s) => s.capture_state,
            _ => CaptureState::default(),
        };
        if actual != expected {
            error!(module = %self.base.name(), ?expected, ?actual, "capture state mismatch");
            return Err(SequencerError::new(
                SequencerErrorKind::InvalidStatus {
                    errors: vec![format!(
                        "[{}] Capture state is {actual:?}, expected {expected:?}.",
                        self.base.name()
                    )],
                },
                StatusReport::new("N/A")
                    .with_modules(vec![counters(self.base.name(), &status)]),
            )
            .into());
        }
        Ok(status)
    }

    fn download(&mut self, transport: &dyn Transport, count: usize) -> KosmosResult<usize> {
        let settings = self.base.settings();
        let entries = download_entries(
            transport,
            settings.msg_id,
            cmd::READ_1,
            PRODUCER_READ_MAX_ENTRIES,
            count,
            self.base.name(),
        )?;
        let words = entries
            .into_iter()
            .map(|e| {
                u32::try_from(e).map_err(|err| {
                    KosmosError::from(TransportError::framing(format!(
                        "{} entry {e:#x} is wider than 32 bits: {err}",
                        self.base.name()
                    )))
                })
            })
            .collect::<KosmosResult<Vec<u32>>>()?;
        let received = words.len();
        self.captured.extend(words);
        debug!(module = %self.base.name(), count = received, total = self.captured.len(), "capture downloaded");
        Ok(received)
    }
}

macro_rules! spy_common {
    ($spy:ty) => {
        impl $spy {
            /// Start capturing now, outside of a sequence.
            pub fn start_capture(&self, transport: &dyn Transport) -> KosmosResult<ModuleStatus> {
                self.producer
                    .capture_command(transport, cmd::START, CaptureState::Started)
            }

            pub fn stop_capture(&self, transport: &dyn Transport) -> KosmosResult<ModuleStatus> {
                self.producer
                    .capture_command(transport, cmd::STOP, CaptureState::ResetOrStopped)
            }

            /// PES action starting the capture.
            pub fn start_action(&self) -> u16 {
                self.producer.start_action
            }

            /// PES action stopping the capture.
            pub fn stop_action(&self) -> u16 {
                self.producer.stop_action
            }

            /// Read `count` entries from the remote buffer and keep them.
            pub fn download(&mut self, transport: &dyn Transport, count: usize) -> KosmosResult<usize> {
                self.producer.download(transport, count)
            }

            /// Raw entries downloaded so far, every run included.
            pub fn captured(&self) -> &[u32] {
                &self.producer.captured
            }

            /// Entries downloaded from now on belong to a new run.
            pub fn begin_run(&mut self) {
                self.producer.begin_run();
            }

            pub fn clear_captures(&mut self) {
                self.producer.clear();
            }
        }

        impl HardwareModule for $spy {
            fn base(&self) -> &ModuleBase {
                &self.producer.base
            }

            fn base_mut(&mut self) -> &mut ModuleBase {
                &mut self.producer.base
            }
        }
    };
}

/// LED spy: activity edges of up to 128 LED channels.
#[derive(Debug)]
pub struct LedSpy {
    producer: Producer,
    channels: u8,
}

impl LedSpy {
    pub fn new(settings: ModuleSettings, channels: u8, start_action: u16, stop_action: u16) -> Self {
        Self {
            producer: Producer::new(settings, start_action, stop_action),
            channels,
        }
    }

    pub fn channels(&self) -> u8 {
        self.channels
    }

    /// Captured edges as `(timestamp, event)`, timestamps in FPGA ticks
    /// from the start of their run.
    pub fn read_events(&self) -> Vec<(u64, LedEvent)> {
        self.read_events_by_run().into_iter().flatten().collect()
    }

    /// Captured edges of each run.
    pub fn read_events_by_run(&self) -> Vec<Vec<(u64, LedEvent)>> {
        self.producer
            .runs()
            .into_iter()
            .map(parse_led_entries)
            .collect()
    }
}

spy_common!(LedSpy);

/// I²C spy: bus conditions and bytes seen on one I²C bus.
#[derive(Debug)]
pub struct I2cSpy {
    producer: Producer,
}

impl I2cSpy {
    pub fn new(settings: ModuleSettings, start_action: u16, stop_action: u16) -> Self {
        Self {
            producer: Producer::new(settings, start_action, stop_action),
        }
    }

    fn events_by_run(&self) -> KosmosResult<Vec<Vec<(u64, I2cEvent)>>> {
        self.producer
            .runs()
            .into_iter()
            .map(|run| Ok(parse_i2c_entries(run)?))
            .collect()
    }

    /// Captured bus events as `(timestamp, event)`, timestamps from the
    /// start of their run.
    pub fn read_events(&self) -> KosmosResult<Vec<(u64, I2cEvent)>> {
        Ok(self.events_by_run()?.into_iter().flatten().collect())
    }

    /// Captured transfers, one per START..STOP. A transfer never spans
    /// two runs.
    pub fn read_frames(&self) -> KosmosResult<Vec<I2cFrame>> {
        Ok(self
            .events_by_run()?
            .iter()
            .flat_map(|events| group_i2c_frames(events))
            .collect())
    }
}

spy_common!(I2cSpy);
