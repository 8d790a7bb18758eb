//! PES timers: the global timestamp, the local timestamp and two stopwatches.
//!
//! Timer values are saved by PES `MARKER` instructions into one buffer per
//! timer and read back after the run. Timestamps include the two ticks of
//! the marker pipeline; [`PesTimers::values`] removes them.

use kosmos_errors::{DomainError, KosmosResult, TransportError};
use kosmos_protocol::ids::TIMER_READ_MAX_ENTRIES;
use kosmos_protocol::status::TIMER_COUNT;
use kosmos_protocol::{MarkerOps, ModuleStatus, Reply, SequencerStatus, TimerId, cmd, msg_id};
use tracing::debug;

use super::{download_entries, invalid_status, reset_errors};
use crate::transport::Transport;

/// Timer operation carried by a marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerOp {
    Save,
    Reset,
    Start,
    Stop,
    /// Reset then start; a reset only for the local timer.
    Restart,
}

impl TimerOp {
    pub fn name(self) -> &'static str {
        match self {
            TimerOp::Save => "save",
            TimerOp::Reset => "reset",
            TimerOp::Start => "start",
            TimerOp::Stop => "stop",
            TimerOp::Restart => "restart",
        }
    }

    fn ops_for(self, timer: TimerId) -> Option<MarkerOps> {
        use TimerId::{Global, Local, Stopwatch1, Stopwatch2};
        let ops = match (self, timer) {
            (TimerOp::Save, Global) => MarkerOps::SAVE_GLOBAL,
            (TimerOp::Save, Local) => MarkerOps::SAVE_LOCAL,
            (TimerOp::Save, Stopwatch1) => MarkerOps::SAVE_STOPWATCH_1,
            (TimerOp::Save, Stopwatch2) => MarkerOps::SAVE_STOPWATCH_2,
            (TimerOp::Reset | TimerOp::Restart, Local) => MarkerOps::RESET_LOCAL,
            (TimerOp::Reset, Stopwatch1) => MarkerOps::RESET_STOPWATCH_1,
            (TimerOp::Reset, Stopwatch2) => MarkerOps::RESET_STOPWATCH_2,
            (TimerOp::Start, Stopwatch1) => MarkerOps::STOPWATCH_1_GO,
            (TimerOp::Start, Stopwatch2) => MarkerOps::STOPWATCH_2_GO,
            (TimerOp::Stop, Stopwatch1) => MarkerOps::STOPWATCH_1_STOP,
            (TimerOp::Stop, Stopwatch2) => MarkerOps::STOPWATCH_2_STOP,
            (TimerOp::Restart, Stopwatch1) => {
                MarkerOps::RESET_STOPWATCH_1 | MarkerOps::STOPWATCH_1_GO
            }
            (TimerOp::Restart, Stopwatch2) => {
                MarkerOps::RESET_STOPWATCH_2 | MarkerOps::STOPWATCH_2_GO
            }
            _ => return None,
        };
        Some(ops)
    }

    /// Marker operations applying `self` to every timer of `timers`.
    ///
    /// # Errors
    ///
    /// Returns [`DomainError::UnsupportedAction`] when a timer does not
    /// support the operation, e.g. resetting the global timer.
    pub fn marker_ops(self, timers: &[TimerId]) -> Result<MarkerOps, DomainError> {
        if timers.is_empty() {
            return Err(DomainError::invalid_argument(format!(
                "timer {} needs at least one timer",
                self.name()
            )));
        }
        timers.iter().try_fold(MarkerOps::empty(), |acc, timer| {
            self.ops_for(*timer)
                .map(|ops| acc | ops)
                .ok_or_else(|| {
                    DomainError::unsupported_action(format!("TIMERS.{}", timer.name()), self.name())
                })
        })
    }
}

/// The four timers, which share one message id and one reset command.
#[derive(Debug, Clone)]
pub struct PesTimers {
    buffer_size: usize,
    captured: [Vec<u64>; TIMER_COUNT],
}

impl PesTimers {
    pub const NAME: &'static str = "TIMERS";

    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size,
            captured: Default::default(),
        }
    }

    fn timer_name(timer: TimerId) -> String {
        format!("{}.{}", Self::NAME, timer.name())
    }

    fn control(&self, transport: &dyn Transport, command: u8) -> KosmosResult<[ModuleStatus; TIMER_COUNT]> {
        match transport.send_control(msg_id::PES_TIMER, command, &[])? {
            Reply::Timers(statuses) => Ok(statuses),
            other => Err(TransportError::framing(format!(
                "{} command {command:#04x}: unexpected reply {other:?}",
                Self::NAME
            ))
            .into()),
        }
    }

    pub fn status_errors(&self, statuses: &[ModuleStatus; TIMER_COUNT]) -> Vec<String> {
        TimerId::ALL
            .iter()
            .zip(statuses)
            .filter(|(_, status)| usize::from(status.buffer_count()) > self.buffer_size)
            .map(|(timer, status)| {
                format!(
                    "[{}] Buffer count {} exceeds buffer size {}.",
                    Self::timer_name(*timer),
                    status.buffer_count(),
                    self.buffer_size
                )
            })
            .collect()
    }

    /// Reset every timer buffer.
    ///
    /// # Errors
    ///
    /// Returns a [`SequencerError`](kosmos_errors::SequencerError) of kind
    /// `InvalidStatus` when a timer still holds values or lost some.
    pub fn reset(&self, transport: &dyn Transport) -> KosmosResult<[ModuleStatus; TIMER_COUNT]> {
        let statuses = self.control(transport, cmd::RESET)?;
        let mut errors = self.status_errors(&statuses);
        for (timer, status) in TimerId::ALL.iter().zip(&statuses) {
            errors.extend(reset_errors(&Self::timer_name(*timer), status));
        }
        if !errors.is_empty() {
            let [global, ..] = &statuses;
            return Err(invalid_status(Self::NAME, global, errors).into());
        }
        Ok(statuses)
    }

    /// Buffered entry count of each timer in an aggregated status.
    pub fn pending_counts(status: &SequencerStatus) -> [u16; TIMER_COUNT] {
        let mut counts = [0u16; TIMER_COUNT];
        for (count, timer) in counts.iter_mut().zip(TimerId::ALL) {
            let sub = u8::try_from(timer.index()).unwrap_or_default();
            if let Some(record) = status.entry(msg_id::PES_TIMER, sub) {
                *count = record.buffer_count;
            }
        }
        counts
    }

    /// Read `counts[i]` saved values of timer `i`.
    pub fn download(
        &mut self,
        transport: &dyn Transport,
        counts: [u16; TIMER_COUNT],
    ) -> KosmosResult<()> {
        for (timer, count) in TimerId::ALL.into_iter().zip(counts) {
            if count == 0 {
                continue;
            }
            let values = download_entries(
                transport,
                msg_id::PES_TIMER,
                timer.read_cmd_base(),
                TIMER_READ_MAX_ENTRIES,
                usize::from(count),
                &Self::timer_name(timer),
            )?;
            if let Some(captured) = self.captured.get_mut(timer.index()) {
                captured.extend(values);
            }
        }
        debug!(counts = ?counts, "timer values downloaded");
        Ok(())
    }

    /// Saved values as read from the hardware.
    pub fn raw_values(&self, timer: TimerId) -> &[u64] {
        self.captured
            .get(timer.index())
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Saved values with the pipeline offset removed.
    pub fn values(&self, timer: TimerId) -> Vec<u64> {
        self.raw_values(timer)
            .iter()
            .map(|v| v.saturating_sub(timer.offset_ticks()))
            .collect()
    }

    /// Every saved value as `(timestamp, timer)`, ordered by timestamp.
    pub fn read_events(&self) -> Vec<(u64, TimerId)> {
        let mut events: Vec<(u64, TimerId)> = TimerId::ALL
            .into_iter()
            .flat_map(|timer| self.values(timer).into_iter().map(move |v| (v, timer)))
            .collect();
        events.sort_by_key(|(ts, timer)| (*ts, *timer));
        events
    }

    pub fn clear_captures(&mut self) {
        for captured in &mut self.captured {
            captured.clear();
        }
    }
}
