//! Multi-step, trigger-gated sequencing.
//!
//! A run moves one [`Axis`] through an ordered list of [`SequenceStep`]s. For each
//! step the worker moves (direct write or rate-limited ramp), waits for the readback
//! to arrive within the move timeout, then dwells on the step's trigger:
//!
//! ```text
//! Idle -> Moving(0) -> Dwelling(0) -> Moving(1) -> ... -> Dwelling(n-1) -> Complete
//!              \              \
//!               `-> Aborted    `-> Aborted
//! ```
//!
//! The step list is copied into the worker when the run starts. The worker owns the
//! channel lease for the whole run, so manual writes are rejected until it ends.
//!
//! Status `(state, step, detail)` is sent on an ordered stream after every transition
//! and at every dwell poll. Nobody has to listen; a dropped receiver is ignored.
//!
//! Stopping is cooperative. The flag is observed at the next poll or tick boundary,
//! then the axis stop commands are written before the worker ends. Stop commands are
//! also written when a step fails.

use crate::cancel::CancelToken;
use crate::error::{ControlError, ControlResult};
use crate::failsafe::{FailsafeStore, MemoryFailsafeStore};
use crate::hardware::{ChannelArbiter, ChannelLease};
use crate::ramp::{BoundedRamp, RampOutcome};
use crate::trigger::{GateOutcome, TriggerGate, TriggerSpec};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

pub mod axis;
pub mod positions;

pub use axis::{Axis, Command};

/// How a step reaches its target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Motion {
    /// One bounded write, followed by the axis move commands
    #[default]
    Direct,
    /// Rate-limited ramp from the current readback
    Ramp {
        /// Ramp rate in units per second
        max_rate_per_second: f64,
    },
}

/// One step of a run. Immutable once the run starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceStep {
    /// Shown in status and abort reasons
    pub label: String,
    /// Target value or position
    pub target: f64,
    /// Direct move or ramp
    #[serde(default)]
    pub motion: Motion,
    /// What ends the dwell
    pub trigger: TriggerSpec,
}

/// Run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SequenceState {
    /// Not started
    Idle,
    /// Moving to the active step's target
    Moving,
    /// Holding at the active step
    Dwelling,
    /// Last step's dwell finished
    Complete,
    /// Stopped or failed
    Aborted,
}

impl fmt::Display for SequenceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One status report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SequenceStatus {
    /// State at the time of the report
    pub state: SequenceState,
    /// Active step, `None` before the first and after completion
    pub step_index: Option<usize>,
    /// Human-readable detail
    pub detail: String,
    /// Last setpoint this run confirmed written, `None` before the first write
    pub applied_value: Option<f64>,
}

impl SequenceStatus {
    /// Status before any run has started.
    pub fn idle() -> Self {
        Self {
            state: SequenceState::Idle,
            step_index: None,
            detail: "Idle".to_string(),
            applied_value: None,
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum SequenceOutcome {
    /// Every step finished
    Complete,
    /// Stopped by the operator or failed
    Aborted {
        /// Step in progress
        step: usize,
        /// Its label
        label: String,
        /// What ended the run; `Cancelled` for an operator stop
        error: ControlError,
    },
}

/// Sequencer timing.
#[derive(Debug, Clone, Copy)]
pub struct SequencerTiming {
    /// Readback poll cadence while moving
    pub poll_interval: Duration,
    /// Limit on a single move
    pub move_timeout: Duration,
    /// Tick interval of ramped moves
    pub tick_interval: Duration,
}

impl Default for SequencerTiming {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            move_timeout: Duration::from_secs(20),
            tick_interval: Duration::from_millis(100),
        }
    }
}

/// Starts runs of one axis against one channel.
#[derive(Clone)]
pub struct StepSequencer {
    arbiter: ChannelArbiter,
    axis: Axis,
    gate: TriggerGate,
    timing: SequencerTiming,
    failsafe: Arc<dyn FailsafeStore>,
}

impl StepSequencer {
    /// Sequencer with default timing. Confirmed setpoint writes persist into a
    /// volatile store unless [`with_failsafe`](Self::with_failsafe) is used.
    pub fn new(arbiter: ChannelArbiter, axis: Axis, gate: TriggerGate) -> Self {
        Self {
            arbiter,
            axis,
            gate,
            timing: SequencerTiming::default(),
            failsafe: Arc::new(MemoryFailsafeStore::new()),
        }
    }

    /// Override timing.
    pub fn with_timing(mut self, timing: SequencerTiming) -> Self {
        self.timing = timing;
        self
    }

    /// Persist every confirmed setpoint write into `store`.
    pub fn with_failsafe(mut self, store: Arc<dyn FailsafeStore>) -> Self {
        self.failsafe = store;
        self
    }

    /// Axis being sequenced.
    pub fn axis(&self) -> &Axis {
        &self.axis
    }

    /// Run the steps once.
    ///
    /// # Errors
    /// Rejected before any hardware interaction with `Configuration` for an empty
    /// list, an out-of-bounds target, a bad ramp rate (including one above the
    /// axis ceiling), an event-count step on a gate without a counter or a zero
    /// poll or tick interval. `ChannelBusy` if the channel is already leased.
    pub fn run(&self, steps: &[SequenceStep]) -> ControlResult<SequenceHandle> {
        self.spawn(steps, false)
    }

    /// Repeat the steps until stopped. Never reaches `Complete`.
    pub fn run_cyclic(&self, steps: &[SequenceStep]) -> ControlResult<SequenceHandle> {
        self.spawn(steps, true)
    }

    fn validate(&self, steps: &[SequenceStep]) -> ControlResult<()> {
        if steps.is_empty() {
            return Err(ControlError::Configuration(
                "sequence has no steps".to_string(),
            ));
        }
        if self.gate.poll_interval().is_zero()
            || self.timing.poll_interval.is_zero()
            || self.timing.tick_interval.is_zero()
        {
            return Err(ControlError::Configuration(
                "sequencer poll and tick intervals must be greater than zero".to_string(),
            ));
        }
        for (index, step) in steps.iter().enumerate() {
            if !self.axis.limits.contains(step.target) || !step.target.is_finite() {
                return Err(ControlError::Configuration(format!(
                    "step {index} ('{}'): target {} outside [{}, {}] {}",
                    step.label,
                    step.target,
                    self.axis.limits.min,
                    self.axis.limits.max,
                    self.axis.limits.unit
                )));
            }
            if let Motion::Ramp {
                max_rate_per_second,
            } = step.motion
            {
                if !max_rate_per_second.is_finite() || max_rate_per_second <= 0.0 {
                    return Err(ControlError::Configuration(format!(
                        "step {index} ('{}'): ramp rate must be positive",
                        step.label
                    )));
                }
                if let Some(ceiling) = self.axis.limits.max_rate_per_second {
                    if max_rate_per_second > ceiling {
                        return Err(ControlError::Configuration(format!(
                            "step {index} ('{}'): ramp rate {max_rate_per_second} {u}/s exceeds ceiling {ceiling} {u}/s",
                            step.label,
                            u = self.axis.limits.unit
                        )));
                    }
                }
            }
            if matches!(step.trigger, TriggerSpec::EventCount(_)) && !self.gate.has_counter() {
                return Err(ControlError::Configuration(format!(
                    "step {index} ('{}'): event-count trigger but no event counter is configured",
                    step.label
                )));
            }
        }
        Ok(())
    }

    fn spawn(&self, steps: &[SequenceStep], cyclic: bool) -> ControlResult<SequenceHandle> {
        self.validate(steps)?;

        let id = Uuid::new_v4();
        let lease = self.arbiter.lease(&format!("sequence-{id}"))?;
        let cancel = CancelToken::new();
        let (status_tx, status_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(SequenceStatus::idle());

        let run = SequenceRun {
            steps: steps.to_vec(),
            active_index: 0,
            cyclic,
            lease,
            axis: self.axis.clone(),
            gate: self.gate.clone(),
            timing: self.timing,
            failsafe: self.failsafe.clone(),
            applied: None,
            cancel: cancel.clone(),
            status_tx,
            snapshot_tx,
        };

        info!(%id, steps = steps.len(), cyclic, axis = %self.axis.name, "Sequence started");
        let span = info_span!("sequence", run_id = %id);
        let join = tokio::spawn(run.execute().instrument(span));

        Ok(SequenceHandle {
            id,
            cancel,
            status: Some(status_rx),
            snapshot: snapshot_rx,
            join,
        })
    }
}

/// Control side of a running sequence.
pub struct SequenceHandle {
    id: Uuid,
    cancel: CancelToken,
    status: Option<mpsc::UnboundedReceiver<SequenceStatus>>,
    snapshot: watch::Receiver<SequenceStatus>,
    join: JoinHandle<SequenceOutcome>,
}

impl SequenceHandle {
    /// Run id, also recorded on the worker's tracing span.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Request a cooperative stop.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Token that stops this run, for handing to another task.
    pub fn stopper(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// The ordered status stream. Can be taken once.
    pub fn take_status_stream(&mut self) -> Option<mpsc::UnboundedReceiver<SequenceStatus>> {
        self.status.take()
    }

    /// Latest status only.
    pub fn subscribe(&self) -> watch::Receiver<SequenceStatus> {
        self.snapshot.clone()
    }

    /// True once the worker has ended.
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the run to end.
    pub async fn wait(self) -> ControlResult<SequenceOutcome> {
        self.join
            .await
            .map_err(|e| ControlError::hardware(format!("sequence worker failed: {e}")))
    }
}

/// State owned by the worker task.
struct SequenceRun {
    steps: Vec<SequenceStep>,
    active_index: usize,
    cyclic: bool,
    lease: ChannelLease,
    axis: Axis,
    gate: TriggerGate,
    timing: SequencerTiming,
    failsafe: Arc<dyn FailsafeStore>,
    applied: Option<f64>,
    cancel: CancelToken,
    status_tx: mpsc::UnboundedSender<SequenceStatus>,
    snapshot_tx: watch::Sender<SequenceStatus>,
}

impl SequenceRun {
    fn emit(&self, state: SequenceState, step_index: Option<usize>, detail: String) {
        let status = SequenceStatus {
            state,
            step_index,
            detail,
            applied_value: self.applied,
        };
        self.snapshot_tx.send_replace(status.clone());
        let _ = self.status_tx.send(status);
    }

    fn check_cancel(&self) -> ControlResult<()> {
        if self.cancel.is_cancelled() {
            Err(ControlError::Cancelled)
        } else {
            Ok(())
        }
    }

    async fn execute(mut self) -> SequenceOutcome {
        match self.drive().await {
            Ok(()) => {
                info!("Sequence complete");
                self.emit(SequenceState::Complete, None, "Sequence complete".to_string());
                SequenceOutcome::Complete
            }
            Err(error) => {
                let step = self.active_index;
                let label = self.steps[step].label.clone();
                self.halt().await;

                let detail = if error == ControlError::Cancelled {
                    info!(step, %label, "Sequence stopped by operator");
                    format!("Stopped by operator at step {step} ('{label}')")
                } else {
                    error!(step, %label, %error, "Sequence aborted");
                    format!("Aborted at step {step} ('{label}'): {error}")
                };
                self.emit(SequenceState::Aborted, Some(step), detail);
                SequenceOutcome::Aborted {
                    step,
                    label,
                    error: error.at_step(step, &self.steps[step].label),
                }
            }
        }
    }

    async fn drive(&mut self) -> ControlResult<()> {
        let mut cycle = 0u32;
        loop {
            for index in 0..self.steps.len() {
                self.active_index = index;
                self.move_to(index).await?;
                self.dwell(index, cycle).await?;
            }
            if !self.cyclic {
                return Ok(());
            }
            cycle += 1;
        }
    }

    async fn move_to(&mut self, index: usize) -> ControlResult<()> {
        let step = &self.steps[index];
        let (target, motion) = (step.target, step.motion);
        self.emit(
            SequenceState::Moving,
            Some(index),
            format!(
                "Moving to {} {} ({})",
                target, self.axis.limits.unit, step.label
            ),
        );
        self.check_cancel()?;

        match motion {
            Motion::Direct => self.write_direct(target).await?,
            Motion::Ramp {
                max_rate_per_second,
            } => self.ramp_to(target, max_rate_per_second).await?,
        }

        self.await_arrival(target).await
    }

    /// Target, then move commands, then persist, all under one I/O lock.
    async fn write_direct(&mut self, target: f64) -> ControlResult<()> {
        let tx = self.lease.transaction().await;
        tx.write_value(&self.axis.setpoint_id, target).await?;
        for command in &self.axis.move_commands {
            tx.write_value(&command.id, command.value).await?;
        }
        self.failsafe.save(target).await?;
        drop(tx);
        self.applied = Some(target);
        Ok(())
    }

    async fn ramp_to(&mut self, target: f64, max_rate_per_second: f64) -> ControlResult<()> {
        let ramp = BoundedRamp::new(
            self.axis.setpoint_id.clone(),
            self.axis.limits.clone(),
            self.failsafe.clone(),
        )
        .with_follow_up(self.axis.move_commands.clone());
        let handle = ramp
            .start_from_hardware(
                self.lease.clone(),
                &self.axis.readback_id,
                target,
                max_rate_per_second,
                self.timing.tick_interval,
            )
            .await?;

        let forward = {
            let cancel = self.cancel.clone();
            let handle = handle.clone();
            tokio::spawn(async move {
                cancel.cancelled().await;
                handle.cancel();
            })
        };
        let mut last = None;
        let outcome = handle.run(|tick| last = Some(tick.applied_value)).await;
        forward.abort();
        if last.is_some() {
            self.applied = last;
        }

        match outcome {
            RampOutcome::Completed { .. } => Ok(()),
            RampOutcome::Cancelled { .. } | RampOutcome::Forced { .. } => {
                Err(ControlError::Cancelled)
            }
            RampOutcome::Failed(e) => Err(e),
        }
    }

    async fn await_arrival(&self, target: f64) -> ControlResult<()> {
        let deadline = Instant::now() + self.timing.move_timeout;
        loop {
            self.check_cancel()?;
            let position = self.lease.read_value(&self.axis.readback_id).await?;
            if self.axis.at_target(position, target) {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ControlError::hardware(format!(
                    "{} at {position}, did not reach {target} within {:?}",
                    self.axis.name, self.timing.move_timeout
                )));
            }
            let wait = self.timing.poll_interval.min(deadline - now);
            tokio::select! {
                _ = sleep(wait) => {}
                _ = self.cancel.cancelled() => {}
            }
        }
    }

    async fn dwell(&self, index: usize, cycle: u32) -> ControlResult<()> {
        let step = &self.steps[index];
        let next = match self.steps.get(index + 1) {
            Some(next) => next.label.clone(),
            None if self.cyclic => self.steps[0].label.clone(),
            None => "none".to_string(),
        };
        let prefix = if self.cyclic {
            format!("[cycle {}] ", cycle + 1)
        } else {
            String::new()
        };

        self.emit(
            SequenceState::Dwelling,
            Some(index),
            format!("{prefix}Dwelling at {} for {}, next: {next}", step.label, step.trigger),
        );
        let outcome = self
            .gate
            .wait(&step.trigger, &self.cancel, |progress| {
                self.emit(
                    SequenceState::Dwelling,
                    Some(index),
                    format!("{prefix}{progress}, next: {next}"),
                )
            })
            .await?;

        match outcome {
            GateOutcome::Completed => Ok(()),
            GateOutcome::Cancelled => Err(ControlError::Cancelled),
        }
    }

    async fn halt(&mut self) {
        for command in &self.axis.stop_commands {
            let tx = self.lease.transaction().await;
            if let Err(e) = tx.write_value(&command.id, command.value).await {
                error!(id = %command.id, error = %e, "Stop command failed");
                continue;
            }
            info!(id = %command.id, value = command.value, "Stop command sent");
            if command.id == self.axis.setpoint_id {
                if let Err(e) = self.failsafe.save(command.value).await {
                    error!(error = %e, value = command.value, "Failsafe persistence failed");
                }
                self.applied = Some(command.value);
            }
        }
    }
}
