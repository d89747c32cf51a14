//! Actor-based control state management
//!
//! One task owns the arbiter, the ramp, the sequencer and the operator
//! confirmation source, and processes [`ControlCommand`]s in order. Ramps and
//! sequences run on their own tasks; the actor keeps their handles and publishes a
//! [`ControlSnapshot`] on a watch channel. Sequence status reports are forwarded in
//! order on an unbounded stream.

use crate::error::{ControlError, ControlResult};
use crate::failsafe::FailsafeStore;
use crate::hardware::ChannelArbiter;
use crate::messages::{ControlCommand, ControlSnapshot};
use crate::ramp::{BoundedRamp, Indicator, RampHandle, RampOutcome};
use crate::safety::{BoundPolicy, Confirmer, GuardedAction, SafetyPolicy};
use crate::sequencer::{SequenceHandle, SequenceStatus, SequenceStep, StepSequencer};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

const COMMAND_QUEUE: usize = 32;

struct RampTask {
    handle: RampHandle,
    join: JoinHandle<RampOutcome>,
}

struct SequenceTask {
    handle: SequenceHandle,
    forwarder: JoinHandle<()>,
}

/// Actor that owns all control state for one channel
pub struct ControlActor {
    arbiter: ChannelArbiter,
    ramp: BoundedRamp,
    readback_id: String,
    tick_interval: Duration,
    default_rate_per_second: f64,
    sequencer: Option<StepSequencer>,
    sequence_drives_output: bool,
    failsafe: Arc<dyn FailsafeStore>,
    confirmer: Arc<dyn Confirmer>,
    policy: SafetyPolicy,
    active_ramp: Option<RampTask>,
    active_sequence: Option<SequenceTask>,
    snapshot: Arc<watch::Sender<ControlSnapshot>>,
    status_tx: mpsc::UnboundedSender<SequenceStatus>,
    status_rx: Option<mpsc::UnboundedReceiver<SequenceStatus>>,
}

impl ControlActor {
    /// Creates a new ControlActor for the ramped setpoint `ramp`, reading its
    /// actual value from `readback_id`.
    pub fn new(
        arbiter: ChannelArbiter,
        ramp: BoundedRamp,
        readback_id: impl Into<String>,
        failsafe: Arc<dyn FailsafeStore>,
        confirmer: Arc<dyn Confirmer>,
    ) -> Self {
        let default_rate_per_second = ramp
            .limits()
            .max_rate_per_second
            .unwrap_or_else(|| crate::ramp::per_minute(1.0));
        let (snapshot, _) = watch::channel(ControlSnapshot::default());
        let (status_tx, status_rx) = mpsc::unbounded_channel();

        Self {
            arbiter,
            ramp,
            readback_id: readback_id.into(),
            tick_interval: Duration::from_millis(100),
            default_rate_per_second,
            sequencer: None,
            sequence_drives_output: false,
            failsafe,
            confirmer,
            policy: SafetyPolicy::new(),
            active_ramp: None,
            active_sequence: None,
            snapshot: Arc::new(snapshot),
            status_tx,
            status_rx: Some(status_rx),
        }
    }

    /// Ramp tick interval and the rate used when a command does not name one.
    pub fn with_ramp_timing(mut self, tick_interval: Duration, default_rate_per_second: f64) -> Self {
        self.tick_interval = tick_interval;
        self.default_rate_per_second = default_rate_per_second;
        self
    }

    /// Enable `RunSequence` on this sequencer.
    ///
    /// When the sequenced axis is the ramped output, its writes persist into the
    /// actor's failsafe store and move the published setpoint.
    pub fn with_sequencer(mut self, sequencer: StepSequencer) -> Self {
        self.sequence_drives_output = sequencer.axis().setpoint_id == self.ramp.output_id();
        let sequencer = if self.sequence_drives_output {
            sequencer.with_failsafe(self.failsafe.clone())
        } else {
            sequencer
        };
        self.sequencer = Some(sequencer);
        self
    }

    /// Spawn the actor. Returns the command handle, the ordered sequence status
    /// stream and the actor task.
    pub fn spawn(
        mut self,
    ) -> (
        ControlHandle,
        mpsc::UnboundedReceiver<SequenceStatus>,
        JoinHandle<()>,
    ) {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        let handle = ControlHandle {
            tx,
            snapshot: self.snapshot.subscribe(),
        };
        let status_rx = match self.status_rx.take() {
            Some(rx) => rx,
            None => mpsc::unbounded_channel().1,
        };
        let task = tokio::spawn(self.run(rx));
        (handle, status_rx, task)
    }

    /// Runs the actor event loop, processing commands until shutdown
    pub async fn run(mut self, mut command_rx: mpsc::Receiver<ControlCommand>) {
        info!(output = %self.ramp.output_id(), "ControlActor started");

        while let Some(command) = command_rx.recv().await {
            self.reap_finished().await;
            match command {
                ControlCommand::StartRamp {
                    target,
                    rate_per_second,
                    response,
                } => {
                    let result = self.start_ramp(target, rate_per_second).await;
                    reply(response, result);
                }

                ControlCommand::StopRamp { response } => {
                    let result = self.stop_ramp().await;
                    reply(response, result);
                }

                ControlCommand::EmergencyStop { response } => {
                    let result = self.emergency_stop().await;
                    reply(response, result);
                }

                ControlCommand::ManualWrite {
                    value,
                    policy,
                    response,
                } => {
                    let result = self.manual_write(value, policy).await;
                    reply(response, result);
                }

                ControlCommand::GuardedWrite {
                    action,
                    id,
                    value,
                    response,
                } => {
                    let result = self
                        .policy
                        .guarded_bool_write(action, self.confirmer.as_ref(), &self.arbiter, &id, value)
                        .await;
                    reply(response, result);
                }

                ControlCommand::RunSequence {
                    steps,
                    cyclic,
                    response,
                } => {
                    let result = self.run_sequence(&steps, cyclic);
                    reply(response, result);
                }

                ControlCommand::StopSequence { response } => {
                    let result = self.stop_sequence().await;
                    reply(response, result);
                }

                ControlCommand::Snapshot { response } => {
                    self.refresh_owner();
                    let _ = response.send(self.snapshot.borrow().clone());
                }

                ControlCommand::Shutdown { response } => {
                    info!("Shutdown command received");
                    self.shutdown().await;
                    let _ = response.send(());
                    return;
                }
            }
        }

        // Every handle dropped without an explicit shutdown.
        self.shutdown().await;
    }

    fn publish(&self, modify: impl FnOnce(&mut ControlSnapshot)) {
        let owner = self.arbiter.current_owner();
        self.snapshot.send_modify(|snapshot| {
            modify(snapshot);
            snapshot.channel_owner = owner;
        });
    }

    fn refresh_owner(&self) {
        self.publish(|_| {});
    }

    async fn reap_finished(&mut self) {
        if self
            .active_ramp
            .as_ref()
            .is_some_and(|task| task.join.is_finished())
        {
            if let Some(task) = self.active_ramp.take() {
                let _ = task.join.await;
            }
        }
        if self
            .active_sequence
            .as_ref()
            .is_some_and(|task| task.handle.is_finished())
        {
            if let Some(task) = self.active_sequence.take() {
                let _ = task.forwarder.await;
                let _ = task.handle.wait().await;
            }
        }
    }

    async fn start_ramp(&mut self, target: f64, rate_per_second: Option<f64>) -> ControlResult<()> {
        let rate = rate_per_second.unwrap_or(self.default_rate_per_second);
        let lease = self.arbiter.lease("ramp")?;
        let handle = self
            .ramp
            .start_from_hardware(lease, &self.readback_id, target, rate, self.tick_interval)
            .await?;

        let initial = handle.last_applied();
        self.publish(|s| {
            s.indicator = handle.indicator();
            s.setpoint = Some(initial);
            s.ramp_target = Some(target);
        });
        info!(from = initial, to = target, rate, "Ramp started");

        let runner = handle.clone();
        let snapshot = self.snapshot.clone();
        let arbiter = self.arbiter.clone();
        let join = tokio::spawn(async move {
            let outcome = runner
                .run(|tick| {
                    snapshot.send_modify(|s| s.setpoint = Some(tick.applied_value));
                })
                .await;
            let owner = arbiter.current_owner();
            snapshot.send_modify(|s| {
                s.indicator = runner.indicator();
                s.setpoint = Some(runner.last_applied());
                s.ramp_target = None;
                s.channel_owner = owner;
            });
            if let RampOutcome::Failed(e) = &outcome {
                error!(error = %e, "Ramp failed");
            }
            outcome
        });

        self.active_ramp = Some(RampTask { handle, join });
        Ok(())
    }

    async fn stop_ramp(&mut self) -> ControlResult<Option<f64>> {
        let Some(task) = self.active_ramp.take() else {
            return Ok(None);
        };
        task.handle.cancel();
        let outcome = task
            .join
            .await
            .map_err(|e| ControlError::hardware(format!("ramp task failed: {e}")))?;
        match outcome {
            RampOutcome::Failed(e) => Err(e),
            RampOutcome::Completed { value, .. }
            | RampOutcome::Cancelled { value }
            | RampOutcome::Forced { value } => Ok(Some(value)),
        }
    }

    async fn emergency_stop(&mut self) -> ControlResult<f64> {
        let limits = self.ramp.limits();
        let value = 0.0_f64.clamp(limits.min, limits.max);
        let detail = format!("{} -> {value} {}", self.ramp.output_id(), limits.unit);
        self.policy
            .confirm(GuardedAction::EmergencyStop, self.confirmer.as_ref(), &detail)
            .await?;

        if let Some(task) = &self.active_sequence {
            task.handle.stop();
        }

        let forced = match &self.active_ramp {
            Some(task) if task.handle.is_running() => task.handle.force_to(value).await,
            _ => self.ramp.force_to(&self.arbiter, value).await,
        };
        let forced = forced.map_err(|e| {
            error!(error = %e, "Emergency stop failed");
            e
        })?;

        if let Some(task) = self.active_ramp.take() {
            let _ = task.join.await;
        }
        // The sequence's last status must not overwrite the forced setpoint.
        if let Some(task) = self.active_sequence.take() {
            let _ = task.handle.wait().await;
            let _ = task.forwarder.await;
        }
        self.publish(|s| {
            s.indicator = Indicator::Stopped;
            s.setpoint = Some(forced);
            s.ramp_target = None;
        });
        info!(value = forced, "Emergency stop applied");
        Ok(forced)
    }

    async fn manual_write(&mut self, value: f64, policy: BoundPolicy) -> ControlResult<f64> {
        let value = self.policy.bound(self.ramp.limits(), value, policy)?;
        self.arbiter
            .manual_write_value("operator", self.ramp.output_id(), value)
            .await?;
        self.failsafe.save(value).await?;
        self.publish(|s| s.setpoint = Some(value));
        info!(value, "Manual setpoint applied");
        Ok(value)
    }

    fn run_sequence(&mut self, steps: &[SequenceStep], cyclic: bool) -> ControlResult<Uuid> {
        let sequencer = self.sequencer.as_ref().ok_or_else(|| {
            ControlError::Configuration("no sequencer configured".to_string())
        })?;
        let mut handle = if cyclic {
            sequencer.run_cyclic(steps)?
        } else {
            sequencer.run(steps)?
        };
        let id = handle.id();

        let mut stream = handle
            .take_status_stream()
            .ok_or_else(|| ControlError::hardware("sequence status stream already taken"))?;
        let snapshot = self.snapshot.clone();
        let status_tx = self.status_tx.clone();
        let drives_output = self.sequence_drives_output;
        let forwarder = tokio::spawn(async move {
            while let Some(status) = stream.recv().await {
                snapshot.send_modify(|s| {
                    if let Some(value) = status.applied_value.filter(|_| drives_output) {
                        s.setpoint = Some(value);
                    }
                    s.sequence = status.clone();
                });
                // A dropped receiver only means nobody is watching.
                let _ = status_tx.send(status);
            }
        });

        self.refresh_owner();
        self.active_sequence = Some(SequenceTask { handle, forwarder });
        Ok(id)
    }

    async fn stop_sequence(&mut self) -> ControlResult<()> {
        let Some(task) = self.active_sequence.take() else {
            return Ok(());
        };
        task.handle.stop();
        let outcome = task.handle.wait().await;
        let _ = task.forwarder.await;
        self.refresh_owner();
        outcome.map(|_| ())
    }

    async fn shutdown(&mut self) {
        if let Err(e) = self.stop_sequence().await {
            warn!(error = %e, "Sequence did not stop cleanly");
        }
        match self.stop_ramp().await {
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Ramp did not stop cleanly"),
        }

        let last = self.snapshot.borrow().setpoint;
        if let Some(value) = last {
            match self.failsafe.save(value).await {
                Ok(_) => info!(value, "Failsafe value persisted on shutdown"),
                Err(e) => error!(error = %e, value, "Failed to persist failsafe on shutdown"),
            }
        }
        info!("ControlActor shutting down");
    }
}

fn reply<T>(response: oneshot::Sender<T>, value: T) {
    // The caller may have given up waiting.
    let _ = response.send(value);
}

/// Cloneable command sender with typed helpers.
#[derive(Clone)]
pub struct ControlHandle {
    tx: mpsc::Sender<ControlCommand>,
    snapshot: watch::Receiver<ControlSnapshot>,
}

impl ControlHandle {
    async fn request<T>(&self, (command, rx): (ControlCommand, oneshot::Receiver<T>)) -> ControlResult<T> {
        self.tx
            .send(command)
            .await
            .map_err(|_| ControlError::hardware("control loop is not running"))?;
        rx.await
            .map_err(|_| ControlError::hardware("control loop dropped the request"))
    }

    /// Ramp to `target`; returns once the ramp has started.
    pub async fn start_ramp(&self, target: f64, rate_per_second: Option<f64>) -> ControlResult<()> {
        self.request(ControlCommand::start_ramp(target, rate_per_second))
            .await?
    }

    /// Stop the ramp; the value it stopped at, `None` if nothing was running.
    pub async fn stop_ramp(&self) -> ControlResult<Option<f64>> {
        self.request(ControlCommand::stop_ramp()).await?
    }

    /// Confirmed emergency stop; the forced value.
    pub async fn emergency_stop(&self) -> ControlResult<f64> {
        self.request(ControlCommand::emergency_stop()).await?
    }

    /// Bounded single write; the value actually written.
    pub async fn manual_write(&self, value: f64, policy: BoundPolicy) -> ControlResult<f64> {
        self.request(ControlCommand::manual_write(value, policy))
            .await?
    }

    /// Confirmed discrete write.
    pub async fn guarded_write(
        &self,
        action: GuardedAction,
        id: impl Into<String>,
        value: bool,
    ) -> ControlResult<()> {
        self.request(ControlCommand::guarded_write(action, id, value))
            .await?
    }

    /// Start a sequence; its run id.
    pub async fn run_sequence(&self, steps: Vec<SequenceStep>, cyclic: bool) -> ControlResult<Uuid> {
        self.request(ControlCommand::run_sequence(steps, cyclic))
            .await?
    }

    /// Stop the sequence and wait for it to end.
    pub async fn stop_sequence(&self) -> ControlResult<()> {
        self.request(ControlCommand::stop_sequence()).await?
    }

    /// Fresh snapshot from the actor.
    pub async fn snapshot(&self) -> ControlResult<ControlSnapshot> {
        self.request(ControlCommand::snapshot()).await
    }

    /// Watch the published snapshot without going through the actor.
    pub fn watch(&self) -> watch::Receiver<ControlSnapshot> {
        self.snapshot.clone()
    }

    /// Wait until no ramp is running. Returns the final snapshot.
    pub async fn wait_ramp_idle(&self) -> ControlResult<ControlSnapshot> {
        let mut rx = self.snapshot.clone();
        let snapshot = rx
            .wait_for(|s| s.indicator != Indicator::Ramping)
            .await
            .map_err(|_| ControlError::hardware("control loop is not running"))?;
        Ok(snapshot.clone())
    }

    /// Stop everything and end the actor.
    pub async fn shutdown(&self) -> ControlResult<()> {
        self.request(ControlCommand::shutdown()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::ManualCounter;
    use crate::failsafe::MemoryFailsafeStore;
    use crate::hardware::MockChannel;
    use crate::safety::{AlwaysConfirm, AlwaysDecline, SetpointLimits};
    use crate::sequencer::{Axis, Motion, SequenceState};
    use crate::trigger::{TriggerGate, TriggerSpec};

    const OUT: &str = "out";
    const READ: &str = "in";

    struct Fixture {
        mock: Arc<MockChannel>,
        store: Arc<MemoryFailsafeStore>,
        handle: ControlHandle,
        status: mpsc::UnboundedReceiver<SequenceStatus>,
    }

    fn fixture(confirmer: Arc<dyn Confirmer>) -> Fixture {
        let mock = Arc::new(MockChannel::new().with_actuator(OUT, READ, f64::INFINITY));
        let arbiter = ChannelArbiter::new(mock.clone());
        let store = Arc::new(MemoryFailsafeStore::new());
        let limits = SetpointLimits::new(0.0, 23.0, "A");
        let ramp = BoundedRamp::new(OUT, limits.clone(), store.clone());
        let axis = Axis {
            name: "test".to_string(),
            setpoint_id: OUT.to_string(),
            move_commands: Vec::new(),
            readback_id: READ.to_string(),
            tolerance: 0.01,
            stop_commands: Vec::new(),
            limits,
        };
        let gate = TriggerGate::new(Duration::from_millis(100))
            .with_counter(Arc::new(ManualCounter::new(0)));
        let sequencer = StepSequencer::new(arbiter.clone(), axis, gate);

        let actor = ControlActor::new(arbiter, ramp, READ, store.clone(), confirmer)
            .with_ramp_timing(Duration::from_millis(100), 1.0)
            .with_sequencer(sequencer);
        let (handle, status, _task) = actor.spawn();

        Fixture {
            mock,
            store,
            handle,
            status,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ramp_reports_progress_and_completes() {
        let fx = fixture(Arc::new(AlwaysConfirm));

        fx.handle.start_ramp(1.0, Some(1.0)).await.unwrap();
        let running = fx.handle.snapshot().await.unwrap();
        assert_eq!(running.indicator, Indicator::Ramping);
        assert_eq!(running.ramp_target, Some(1.0));
        assert_eq!(running.channel_owner.as_deref(), Some("ramp"));

        let done = fx.handle.wait_ramp_idle().await.unwrap();
        assert_eq!(done.indicator, Indicator::Ok);
        assert_eq!(done.setpoint, Some(1.0));
        assert_eq!(fx.mock.written_values(OUT).len(), 10);
        assert_eq!(fx.store.value(), Some(1.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_write_rejected_while_ramping() {
        let fx = fixture(Arc::new(AlwaysConfirm));

        fx.handle.start_ramp(5.0, Some(1.0)).await.unwrap();
        let err = fx
            .handle
            .manual_write(3.0, BoundPolicy::Reject)
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::ChannelBusy { .. }));

        let stopped_at = fx.handle.stop_ramp().await.unwrap();
        assert!(stopped_at.is_some());
        assert_eq!(
            fx.handle.manual_write(30.0, BoundPolicy::Clamp).await.unwrap(),
            23.0
        );
        assert_eq!(fx.store.value(), Some(23.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_emergency_stop_forces_zero_mid_ramp() {
        let fx = fixture(Arc::new(AlwaysConfirm));

        fx.handle.start_ramp(10.0, Some(1.0)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(4350)).await;

        assert_eq!(fx.handle.emergency_stop().await.unwrap(), 0.0);
        let writes = fx.mock.written_values(OUT);
        assert_eq!(writes.last().copied(), Some(0.0));
        assert_eq!(fx.store.value(), Some(0.0));

        let snapshot = fx.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.indicator, Indicator::Stopped);
        assert_eq!(snapshot.channel_owner, None);

        // Nothing else is written once forced.
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fx.mock.written_values(OUT).len(), writes.len());
    }

    #[tokio::test(start_paused = true)]
    async fn test_declined_emergency_stop_changes_nothing() {
        let fx = fixture(Arc::new(AlwaysDecline));

        fx.handle.start_ramp(1.0, Some(1.0)).await.unwrap();
        let err = fx.handle.emergency_stop().await.unwrap_err();
        assert_eq!(
            err,
            ControlError::ConfirmationDeclined(GuardedAction::EmergencyStop)
        );
        let done = fx.handle.wait_ramp_idle().await.unwrap();
        assert_eq!(done.indicator, Indicator::Ok);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequence_status_forwarded_in_order() {
        let mut fx = fixture(Arc::new(AlwaysConfirm));
        let steps = vec![
            SequenceStep {
                label: "low".to_string(),
                target: 2.0,
                motion: Motion::Direct,
                trigger: TriggerSpec::Time(Duration::from_secs(1)),
            },
            SequenceStep {
                label: "high".to_string(),
                target: 4.0,
                motion: Motion::Direct,
                trigger: TriggerSpec::Time(Duration::from_secs(1)),
            },
        ];

        fx.handle.run_sequence(steps, false).await.unwrap();
        let err = fx.handle.start_ramp(1.0, None).await.unwrap_err();
        assert!(matches!(err, ControlError::ChannelBusy { .. }));

        let mut states = Vec::new();
        while let Some(status) = fx.status.recv().await {
            if states.last() != Some(&(status.state, status.step_index)) {
                states.push((status.state, status.step_index));
            }
            if status.state == SequenceState::Complete {
                break;
            }
        }
        assert_eq!(
            states,
            vec![
                (SequenceState::Moving, Some(0)),
                (SequenceState::Dwelling, Some(0)),
                (SequenceState::Moving, Some(1)),
                (SequenceState::Dwelling, Some(1)),
                (SequenceState::Complete, None),
            ]
        );
        assert_eq!(fx.mock.written_values(OUT), vec![2.0, 4.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_emergency_stop_aborts_running_sequence() {
        let mut fx = fixture(Arc::new(AlwaysConfirm));
        let steps = vec![SequenceStep {
            label: "hold".to_string(),
            target: 5.0,
            motion: Motion::Direct,
            trigger: TriggerSpec::Time(Duration::from_secs(60)),
        }];

        fx.handle.run_sequence(steps, false).await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fx.handle.watch().borrow().sequence.state, SequenceState::Dwelling);
        assert_eq!(fx.store.value(), Some(5.0));

        assert_eq!(fx.handle.emergency_stop().await.unwrap(), 0.0);
        assert_eq!(fx.mock.written_values(OUT), vec![5.0, 0.0]);
        assert_eq!(fx.store.value(), Some(0.0));

        let snapshot = fx.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.indicator, Indicator::Stopped);
        assert_eq!(snapshot.setpoint, Some(0.0));
        assert_eq!(snapshot.sequence.state, SequenceState::Aborted);
        assert_eq!(snapshot.channel_owner, None);

        let mut last = None;
        while let Ok(status) = fx.status.try_recv() {
            last = Some(status);
        }
        assert_eq!(last.unwrap().state, SequenceState::Aborted);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(fx.mock.written_values(OUT), vec![5.0, 0.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_persists_last_setpoint() {
        let fx = fixture(Arc::new(AlwaysConfirm));

        fx.handle.start_ramp(10.0, Some(1.0)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2050)).await;
        fx.handle.shutdown().await.unwrap();

        let saved = fx.store.value().unwrap();
        assert!((saved - 2.0).abs() < 1e-9, "saved {saved}");
        assert!(fx.handle.snapshot().await.is_err());
    }
}
