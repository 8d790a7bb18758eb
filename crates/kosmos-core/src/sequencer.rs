//! Sequencer state machine.
//!
//! ```text
//!         reset                 init               start
//! IDLE ──────────► RESET_DONE ──────► INIT_DONE ──────► RUNNING
//!  ▲                                                       │
//!  │                   end of program                      │ fault
//!  └───────────────────────────────────────────────────────┤
//!                                                          ▼
//!                                                        ERROR
//! ```
//!
//! [`Sequencer::play_sequence`] drives one or more runs of the scenario held
//! in the Device Tree buffers: clean check, `RESET`, upload, `INIT`,
//! `START`, then polls the aggregated status until the program ends and
//! verifies that every module consumed everything without overrun.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use kosmos_errors::{
    KosmosError, KosmosResult, SequencerError, SequencerErrorKind, StatusReport,
};
use kosmos_protocol::{
    EndpointRole, MessageTable, ModuleStatus, Reply, SequencerState, SequencerStatus, StatusShape,
    TimerId, cmd, msg_id,
};
use tracing::{debug, error, info, warn};

use crate::config::FpgaConfig;
use crate::error_line::{ErrorLine, ErrorLineGuard, NullErrorLine};
use crate::module::{HardwareModule, counters, end_of_run_errors, reset_errors};
use crate::tree::DeviceTree;

/// Parameters of [`Sequencer::play_sequence`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayOptions {
    /// Extra runs after the first one. Requires `block`.
    pub repetitions: u32,
    pub timeout: Duration,
    /// Wait for the end of the program before returning.
    pub block: bool,
}

impl Default for PlayOptions {
    fn default() -> Self {
        Self {
            repetitions: 0,
            timeout: Duration::from_secs(60),
            block: true,
        }
    }
}

impl PlayOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn repetitions(mut self, repetitions: u32) -> Self {
        self.repetitions = repetitions;
        self
    }

    #[must_use]
    pub fn block(mut self, block: bool) -> Self {
        self.block = block;
        self
    }
}

/// Status of every module in an aggregated sequencer status, by name.
///
/// Timers are named `TIMERS.<TIMER>`. Entries of unknown message ids are
/// skipped.
pub fn module_statuses(table: &MessageTable, status: &SequencerStatus) -> Vec<(String, ModuleStatus)> {
    status
        .entries
        .iter()
        .filter_map(|entry| {
            let endpoint = table.endpoint(entry.msg_id)?;
            match endpoint.role {
                EndpointRole::Sequencer => None,
                EndpointRole::Timers => {
                    let timer = TimerId::from_index(usize::from(entry.sub))?;
                    Some((
                        format!("{}.{}", endpoint.name, timer.name()),
                        ModuleStatus::from_record(StatusShape::Timer, &entry.record),
                    ))
                }
                EndpointRole::Module(shape) => Some((
                    endpoint.name.clone(),
                    ModuleStatus::from_record(shape, &entry.record),
                )),
            }
        })
        .collect()
}

/// Report of an aggregated status: state, every module that is not clean,
/// raw payload.
pub fn build_status_report(table: &MessageTable, status: &SequencerStatus) -> StatusReport {
    let modules = module_statuses(table, status)
        .iter()
        .filter(|(_, s)| !s.is_clean() || s.underrun())
        .map(|(name, s)| counters(name, s))
        .collect();
    StatusReport::new(status.state.name())
        .with_modules(modules)
        .with_raw(status.encode().unwrap_or_default())
}

pub struct Sequencer {
    offline_mode: bool,
    poll_interval: Duration,
    default_timeout: Duration,
    error_line: Arc<dyn ErrorLine>,
}

impl std::fmt::Debug for Sequencer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sequencer")
            .field("offline_mode", &self.offline_mode)
            .field("poll_interval", &self.poll_interval)
            .field("default_timeout", &self.default_timeout)
            .finish_non_exhaustive()
    }
}

impl Sequencer {
    pub fn new(config: &FpgaConfig) -> Self {
        Self {
            offline_mode: false,
            poll_interval: config.poll_interval(),
            default_timeout: config.default_timeout(),
            error_line: Arc::new(NullErrorLine),
        }
    }

    #[must_use]
    pub fn with_error_line(mut self, line: Arc<dyn ErrorLine>) -> Self {
        self.error_line = line;
        self
    }

    pub fn offline_mode(&self) -> bool {
        self.offline_mode
    }

    /// While set, [`Sequencer::play_sequence`] leaves the scenario in the
    /// local buffers so that later calls extend it.
    pub fn set_offline_mode(&mut self, offline: bool) {
        if offline != self.offline_mode {
            info!(offline, "sequencer offline mode changed");
        }
        self.offline_mode = offline;
    }

    /// Play options with the configured default timeout.
    pub fn default_options(&self) -> PlayOptions {
        PlayOptions::with_timeout(self.default_timeout)
    }

    fn command(&self, tree: &DeviceTree, command: u8) -> KosmosResult<SequencerStatus> {
        match tree.transport().send_control(msg_id::SEQUENCER, command, &[])? {
            Reply::Sequencer(status) => {
                debug!(command, state = %status.state, "sequencer reply");
                self.validate(tree, &status)?;
                Ok(status)
            }
            other => Err(kosmos_errors::TransportError::framing(format!(
                "SEQUENCER command {command:#04x}: unexpected reply {other:?}"
            ))
            .into()),
        }
    }

    /// Every tree module must appear in the status, within its sizes.
    fn validate(&self, tree: &DeviceTree, status: &SequencerStatus) -> KosmosResult<()> {
        let mut errors = Vec::new();
        for entry in &status.entries {
            if tree.message_table().endpoint(entry.msg_id).is_none() {
                errors.push(format!("[{:#04x}] Unknown module in sequencer status.", entry.msg_id));
            }
        }
        for module in tree.hardware_modules() {
            let settings = module.settings();
            match status.entry(settings.msg_id, 0) {
                Some(record) => {
                    errors.extend(
                        module.status_errors(&ModuleStatus::from_record(settings.shape, record)),
                    );
                }
                None => errors.push(format!("[{}] Missing from sequencer status.", module.name())),
            }
        }
        if errors.is_empty() {
            return Ok(());
        }
        Err(self.failure(tree, SequencerErrorKind::InvalidStatus { errors }, status))
    }

    fn failure(
        &self,
        tree: &DeviceTree,
        kind: SequencerErrorKind,
        status: &SequencerStatus,
    ) -> KosmosError {
        error!(state = %status.state, error = %kind, "sequencer failure");
        SequencerError::new(kind, build_status_report(tree.message_table(), status)).into()
    }

    fn expect_state(
        &self,
        tree: &DeviceTree,
        step: &str,
        status: &SequencerStatus,
        expected: &[SequencerState],
    ) -> KosmosResult<()> {
        if expected.contains(&status.state) {
            return Ok(());
        }
        if status.state == SequencerState::Error {
            return Err(self.failure(tree, SequencerErrorKind::HardwareFault, status));
        }
        let expected = expected
            .iter()
            .map(|s| s.name())
            .collect::<Vec<_>>()
            .join(" or ");
        Err(self.failure(
            tree,
            SequencerErrorKind::UnexpectedState {
                step: step.to_string(),
                expected,
                actual: status.state.name().to_string(),
            },
            status,
        ))
    }

    fn collect_errors(
        tree: &DeviceTree,
        status: &SequencerStatus,
        check: fn(&str, &ModuleStatus) -> Vec<String>,
    ) -> Vec<String> {
        module_statuses(tree.message_table(), status)
            .iter()
            .flat_map(|(name, s)| check(name, s))
            .collect()
    }

    /// Fetch the aggregated status.
    pub fn status(&self, tree: &DeviceTree) -> KosmosResult<SequencerStatus> {
        self.command(tree, cmd::STATUS)
    }

    /// Require IDLE or RESET_DONE with every module empty.
    pub fn check_clean_state(&self, tree: &DeviceTree) -> KosmosResult<SequencerStatus> {
        let status = self.status(tree)?;
        let mut errors = Self::collect_errors(tree, &status, reset_errors);
        if !matches!(status.state, SequencerState::Idle | SequencerState::ResetDone) {
            errors.insert(0, format!("[SEQUENCER] State is {}.", status.state));
        }
        if !errors.is_empty() {
            for message in &errors {
                error!("{message}");
            }
            return Err(self.failure(tree, SequencerErrorKind::NotClean, &status));
        }
        Ok(status)
    }

    /// Bring the sequencer to RESET_DONE with every module empty.
    ///
    /// Does nothing when it is already there.
    pub fn reset_sequence(&self, tree: &DeviceTree) -> KosmosResult<SequencerStatus> {
        let status = self.status(tree)?;
        if status.state == SequencerState::ResetDone
            && Self::collect_errors(tree, &status, reset_errors).is_empty()
        {
            debug!("sequencer already reset");
            return Ok(status);
        }
        let status = self.command(tree, cmd::RESET)?;
        self.expect_state(tree, "reset", &status, &[SequencerState::ResetDone])?;
        let errors = Self::collect_errors(tree, &status, reset_errors);
        if !errors.is_empty() {
            return Err(self.failure(tree, SequencerErrorKind::InvalidStatus { errors }, &status));
        }
        // The timer buffers have their own reset message.
        tree.timers().reset(tree.transport())?;
        info!(state = %status.state, "sequencer reset");
        Ok(status)
    }

    /// Load the uploaded buffers into the module FIFOs.
    pub fn init_sequence(&self, tree: &DeviceTree) -> KosmosResult<SequencerStatus> {
        let status = self.command(tree, cmd::INIT)?;
        self.expect_state(tree, "init", &status, &[SequencerState::InitDone])?;
        let pes_id = tree.pes().settings().msg_id;
        let soft_reset = status
            .entry(pes_id, 0)
            .map(|r| ModuleStatus::from_record(StatusShape::Pes, r))
            .is_some_and(|s| matches!(s, ModuleStatus::Pes(p) if p.soft_reset));
        if !soft_reset {
            return Err(self.failure(
                tree,
                SequencerErrorKind::InvalidStatus {
                    errors: vec!["[PES] Soft reset flag is not set.".to_string()],
                },
                &status,
            ));
        }
        info!(state = %status.state, "sequencer initialised");
        Ok(status)
    }

    pub fn start_sequence(&self, tree: &DeviceTree) -> KosmosResult<SequencerStatus> {
        let status = self.command(tree, cmd::START)?;
        // An empty program is over before the reply.
        self.expect_state(
            tree,
            "start",
            &status,
            &[SequencerState::Running, SequencerState::Idle],
        )?;
        info!(state = %status.state, "sequencer started");
        Ok(status)
    }

    fn wait_with_guard(
        &self,
        tree: &mut DeviceTree,
        guard: &ErrorLineGuard<'_>,
        timeout: Duration,
    ) -> KosmosResult<()> {
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        let deadline = Instant::now().checked_add(timeout);
        loop {
            guard.check()?;
            let status = self.status(tree)?;
            match status.state {
                SequencerState::Running => {}
                SequencerState::Idle => return self.end_of_run(tree, &status),
                _ => {
                    self.expect_state(
                        tree,
                        "wait end of sequence",
                        &status,
                        &[SequencerState::Running, SequencerState::Idle],
                    )?;
                }
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                warn!(timeout_ms, "sequence did not finish in time");
                return Err(self.failure(tree, SequencerErrorKind::Timeout { timeout_ms }, &status));
            }
            thread::sleep(self.poll_interval);
        }
    }

    /// Poll until the program ends, then collect the captures and check
    /// the end-of-run invariants.
    ///
    /// # Errors
    ///
    /// Returns a timeout [`SequencerError`] when the sequencer is still
    /// RUNNING after `timeout`.
    pub fn wait_end_of_sequence(&self, tree: &mut DeviceTree, timeout: Duration) -> KosmosResult<()> {
        let line = Arc::clone(&self.error_line);
        let guard = ErrorLineGuard::install(line.as_ref())?;
        self.wait_with_guard(tree, &guard, timeout)
    }

    fn end_of_run(&self, tree: &mut DeviceTree, status: &SequencerStatus) -> KosmosResult<()> {
        tree.download_captures(status)?;
        let status = self.status(tree)?;
        let mut errors = Self::collect_errors(tree, &status, end_of_run_errors);
        for module in tree.hardware_modules() {
            if module.settings().separate_status {
                let own = module.status(tree.transport())?;
                errors.extend(end_of_run_errors(module.name(), &own));
            }
        }
        if !errors.is_empty() {
            for message in &errors {
                error!("{message}");
            }
            return Err(self.failure(tree, SequencerErrorKind::EndOfSequence, &status));
        }
        info!("end of sequence");
        Ok(())
    }

    fn run_once(
        &self,
        tree: &mut DeviceTree,
        guard: &ErrorLineGuard<'_>,
        options: &PlayOptions,
    ) -> KosmosResult<()> {
        self.check_clean_state(tree)?;
        self.reset_sequence(tree)?;
        tree.begin_capture_run();
        tree.send_all()?;
        guard.check()?;
        self.init_sequence(tree)?;
        self.start_sequence(tree)?;
        if options.block {
            self.wait_with_guard(tree, guard, options.timeout)?;
        }
        Ok(())
    }

    /// Play the scenario held in the tree buffers `1 + repetitions` times.
    ///
    /// In offline mode this returns at once and the buffers keep growing.
    /// The local buffers are cleared after a successful run and kept when
    /// it fails.
    ///
    /// # Errors
    ///
    /// - [`SequencerErrorKind::InvalidArguments`] for repetitions without `block`
    /// - [`DomainError::ProgramOrder`](kosmos_errors::DomainError::ProgramOrder)
    ///   when the PES triggers a module more often than it has commits
    /// - [`FatalHardwareError`](kosmos_errors::FatalHardwareError) when the
    ///   global-error line is or goes high
    /// - a [`SequencerError`] for every state-machine violation
    pub fn play_sequence(&self, tree: &mut DeviceTree, options: &PlayOptions) -> KosmosResult<()> {
        if options.repetitions > 0 && !options.block {
            return Err(SequencerError::new(
                SequencerErrorKind::InvalidArguments(
                    "repetitions require a blocking play".to_string(),
                ),
                StatusReport::new("N/A"),
            )
            .into());
        }
        if self.offline_mode {
            info!(
                pes = tree.pes().base().len(),
                "offline mode, scenario kept in local buffers"
            );
            return Ok(());
        }
        tree.check_program_order()?;
        tree.insert_wait_kbd_workaround()?;

        let line = Arc::clone(&self.error_line);
        let guard = ErrorLineGuard::install(line.as_ref())?;
        tree.clear_captures();
        for run in 0..=options.repetitions {
            info!(
                run,
                repetitions = options.repetitions,
                duration = ?tree.pes().duration(),
                "playing sequence"
            );
            self.run_once(tree, &guard, options)?;
        }
        drop(guard);
        tree.clear_all();
        Ok(())
    }
}
