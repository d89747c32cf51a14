//! Rate-limited setpoint ramps.
//!
//! A ramp drives one scalar output from a freshly read value to a target in
//! fixed-interval steps of `rate * tick` units. The final step snaps exactly onto
//! the target. Every step is bound-checked, written under the channel lease
//! together with any follow-up commands the output needs, and persisted to the
//! failsafe record once the device acknowledged it. Only then does the ramp
//! advance. A failed write aborts the ramp; nothing is retried or guessed.
//!
//! [`RampHandle::force_to`] is the emergency path. It cancels the ramp, waits for at
//! most the one write already in flight, then writes the forced value through the
//! arbiter's emergency path. No further tick can write after it returns.

use crate::cancel::CancelToken;
use crate::error::{ControlError, ControlResult};
use crate::failsafe::FailsafeStore;
use crate::hardware::{ChannelArbiter, ChannelLease, Command};
use crate::safety::{SafetyPolicy, SetpointLimits};
use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{error, info, warn};

/// Convert a per-minute rate, as operators state it, to per-second.
pub fn per_minute(rate: f64) -> f64 {
    rate / 60.0
}

/// Discretized state of a running ramp.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RampState {
    /// Value the ramp started from
    pub initial: f64,
    /// Last value confirmed written to hardware
    pub current: f64,
    /// Requested end value
    pub target: f64,
    /// Signed increment per tick
    pub step_size: f64,
    /// Tick interval in milliseconds
    pub step_interval_ms: u32,
    /// Ticks still to apply
    pub remaining_steps: u32,
    /// Ticks in the whole ramp
    pub total_steps: u32,
}

impl RampState {
    /// Compute step size and count.
    ///
    /// # Errors
    /// `Configuration` for a non-positive rate or tick interval.
    pub fn plan(
        initial: f64,
        target: f64,
        max_rate_per_second: f64,
        step_interval_ms: u32,
    ) -> ControlResult<Self> {
        if !max_rate_per_second.is_finite() || max_rate_per_second <= 0.0 {
            return Err(ControlError::Configuration(format!(
                "ramp rate must be positive, got {max_rate_per_second}"
            )));
        }
        if step_interval_ms == 0 {
            return Err(ControlError::Configuration(
                "ramp tick interval must be greater than zero".to_string(),
            ));
        }

        let magnitude = max_rate_per_second * f64::from(step_interval_ms) / 1000.0;
        let distance = target - initial;
        let total_steps = step_count(distance.abs(), magnitude)?;

        Ok(Self {
            initial,
            current: initial,
            target,
            step_size: magnitude.copysign(distance),
            step_interval_ms,
            remaining_steps: total_steps,
            total_steps,
        })
    }

    /// Value the next tick will write. The last tick is exactly `target`.
    pub fn next_value(&self) -> f64 {
        if self.remaining_steps <= 1 {
            return self.target;
        }
        let applied = self.total_steps - self.remaining_steps + 1;
        let candidate = self.initial + self.step_size * f64::from(applied);
        if self.step_size > 0.0 {
            candidate.min(self.target)
        } else {
            candidate.max(self.target)
        }
    }
}

/// `ceil(distance / step)`, tolerant of representation error in the quotient
/// (10 / (1/600) must be 6000 and not 6001).
///
/// A ramp needing more ticks than fit in `u32` is refused rather than shortened,
/// since a shortened ramp would overshoot the rate on its final snap.
fn step_count(distance: f64, step: f64) -> ControlResult<u32> {
    if distance == 0.0 {
        return Ok(0);
    }
    let raw = distance / step;
    let nearest = raw.round();
    let steps = if (raw - nearest).abs() <= 1e-9 * nearest.max(1.0) {
        nearest
    } else {
        raw.ceil()
    };
    if !steps.is_finite() || steps > f64::from(u32::MAX) {
        return Err(ControlError::Configuration(format!(
            "ramp over {distance} at {step} per tick needs {raw:.0} ticks, more than {}",
            u32::MAX
        )));
    }
    Ok(steps.max(1.0) as u32)
}

/// Result of a single tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickOutcome {
    /// More ticks follow
    pub continues: bool,
    /// Last value confirmed written
    pub applied_value: f64,
}

/// How a ramp ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RampOutcome {
    /// Target reached
    Completed {
        /// Final value, equal to the target
        value: f64,
        /// Ticks applied
        ticks: u32,
    },
    /// Cooperatively cancelled
    Cancelled {
        /// Last value confirmed written
        value: f64,
    },
    /// Overridden by `force_to`
    Forced {
        /// Forced value
        value: f64,
    },
    /// Aborted on a write, bound or persistence failure
    Failed(ControlError),
}

/// Status lamp shown next to a ramped setpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Indicator {
    /// No ramp has run
    Idle,
    /// Ramp in progress
    Ramping,
    /// Last ramp reached its target
    Ok,
    /// Last ramp was cancelled, forced or failed
    Stopped,
}

#[derive(Debug, Clone, PartialEq)]
enum Phase {
    Running,
    Completed,
    Cancelled,
    Forced(f64),
    Failed(ControlError),
}

/// One rate-limited output: where to write, its bounds, where to persist.
#[derive(Clone)]
pub struct BoundedRamp {
    output_id: String,
    limits: SetpointLimits,
    policy: SafetyPolicy,
    failsafe: Arc<dyn FailsafeStore>,
    follow_up: Vec<Command>,
}

impl BoundedRamp {
    /// Ramp writing to `output_id`.
    pub fn new(
        output_id: impl Into<String>,
        limits: SetpointLimits,
        failsafe: Arc<dyn FailsafeStore>,
    ) -> Self {
        Self {
            output_id: output_id.into(),
            limits,
            policy: SafetyPolicy::new(),
            failsafe,
            follow_up: Vec::new(),
        }
    }

    /// Commands written after every step in the same transaction, such as the
    /// supply's voltage limit.
    pub fn with_follow_up(mut self, commands: Vec<Command>) -> Self {
        self.follow_up = commands;
        self
    }

    /// Bounds of the output.
    pub fn limits(&self) -> &SetpointLimits {
        &self.limits
    }

    /// Output register.
    pub fn output_id(&self) -> &str {
        &self.output_id
    }

    /// Start a ramp from `initial`, which must be a fresh hardware reading.
    ///
    /// Nothing is written here; the returned handle is driven by `tick` or `run`.
    ///
    /// # Errors
    /// - `Configuration` for a bad rate or interval, a rate above the setpoint's
    ///   ceiling, or a target outside the bounds.
    /// - `RangeViolation` if `initial` itself is out of bounds.
    pub fn start(
        &self,
        lease: ChannelLease,
        initial: f64,
        target: f64,
        max_rate_per_second: f64,
        tick_interval: Duration,
    ) -> ControlResult<RampHandle> {
        let tick_ms = u32::try_from(tick_interval.as_millis()).map_err(|_| {
            ControlError::Configuration(format!("tick interval {tick_interval:?} too long"))
        })?;
        let state = RampState::plan(initial, target, max_rate_per_second, tick_ms)?;

        self.policy
            .validate(&self.limits, target)
            .map_err(|e| ControlError::Configuration(format!("ramp target rejected: {e}")))?;
        if let Some(ceiling) = self.limits.max_rate_per_second {
            if max_rate_per_second > ceiling {
                return Err(ControlError::Configuration(format!(
                    "ramp rate {max_rate_per_second} {u}/s exceeds ceiling {ceiling} {u}/s",
                    u = self.limits.unit
                )));
            }
        }
        self.policy.validate(&self.limits, initial)?;

        let arbiter = lease.arbiter().clone();
        let (active, phase) = if state.total_steps == 0 {
            info!(value = target, "Already at target");
            (None, Phase::Completed)
        } else {
            info!(
                initial,
                target,
                steps = state.total_steps,
                step = state.step_size,
                "Ramp started"
            );
            (Some(ActiveRamp { state, lease }), Phase::Running)
        };

        Ok(RampHandle {
            inner: Arc::new(RampInner {
                ramp: self.clone(),
                arbiter,
                active: Mutex::new(active),
                cancel: CancelToken::new(),
                tick_interval,
                last_applied: StdMutex::new(initial),
                applied_ticks: AtomicU32::new(0),
                phase: StdMutex::new(phase),
            }),
        })
    }

    /// Write one already-bounded value and its follow-up commands, then persist
    /// it. The I/O lock is held until the value is saved, so an emergency write
    /// and its save always land after this one.
    pub async fn apply(&self, lease: &ChannelLease, value: f64) -> ControlResult<()> {
        let tx = lease.transaction().await;
        tx.write_value(&self.output_id, value).await?;
        for command in &self.follow_up {
            tx.write_value(&command.id, command.value).await?;
        }
        if let Err(e) = self.failsafe.save(value).await {
            error!(error = %e, value, "Failsafe persistence failed");
            return Err(e);
        }
        Ok(())
    }

    /// Read the output's current value through the lease, then start.
    pub async fn start_from_hardware(
        &self,
        lease: ChannelLease,
        readback_id: &str,
        target: f64,
        max_rate_per_second: f64,
        tick_interval: Duration,
    ) -> ControlResult<RampHandle> {
        let initial = lease.read_value(readback_id).await?;
        self.start(lease, initial, target, max_rate_per_second, tick_interval)
    }

    /// Immediate bounded write with no rate limit, then persist.
    ///
    /// Use this when no ramp is running; with a ramp, go through
    /// [`RampHandle::force_to`] so the ramp is cancelled first.
    pub async fn force_to(&self, arbiter: &ChannelArbiter, value: f64) -> ControlResult<f64> {
        let value = self.policy.validate(&self.limits, value)?;
        arbiter.emergency_write_value(&self.output_id, value).await?;
        self.failsafe.save(value).await?;
        info!(value, output = %self.output_id, "Setpoint forced");
        Ok(value)
    }
}

struct ActiveRamp {
    state: RampState,
    lease: ChannelLease,
}

struct RampInner {
    ramp: BoundedRamp,
    arbiter: ChannelArbiter,
    active: Mutex<Option<ActiveRamp>>,
    cancel: CancelToken,
    tick_interval: Duration,
    last_applied: StdMutex<f64>,
    applied_ticks: AtomicU32,
    phase: StdMutex<Phase>,
}

/// Handle to a started ramp. Clones share the same ramp.
///
/// The channel lease is released as soon as the ramp completes, fails, is
/// cancelled or is forced.
#[derive(Clone)]
pub struct RampHandle {
    inner: Arc<RampInner>,
}

impl RampHandle {
    fn phase(&self) -> Phase {
        self.inner
            .phase
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn set_phase(&self, phase: Phase) {
        *self.inner.phase.lock().unwrap_or_else(|p| p.into_inner()) = phase;
    }

    fn set_phase_if_running(&self, phase: Phase) {
        let mut current = self.inner.phase.lock().unwrap_or_else(|p| p.into_inner());
        if *current == Phase::Running {
            *current = phase;
        }
    }

    /// Last value confirmed written (or the initial value before the first tick).
    pub fn last_applied(&self) -> f64 {
        *self
            .inner
            .last_applied
            .lock()
            .unwrap_or_else(|p| p.into_inner())
    }

    fn record_applied(&self, value: f64) {
        *self
            .inner
            .last_applied
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = value;
    }

    /// Snapshot of the live state, `None` once the ramp has ended.
    pub async fn state(&self) -> Option<RampState> {
        self.inner.active.lock().await.as_ref().map(|a| a.state)
    }

    /// Ticks applied so far.
    pub fn applied_ticks(&self) -> u32 {
        self.inner.applied_ticks.load(Ordering::SeqCst)
    }

    /// True while ticks remain and nothing has stopped the ramp.
    pub fn is_running(&self) -> bool {
        self.phase() == Phase::Running
    }

    /// Lamp state for the operator display.
    pub fn indicator(&self) -> Indicator {
        match self.phase() {
            Phase::Running => Indicator::Ramping,
            Phase::Completed => Indicator::Ok,
            Phase::Cancelled | Phase::Forced(_) | Phase::Failed(_) => Indicator::Stopped,
        }
    }

    /// Apply one step.
    ///
    /// # Errors
    /// `Cancelled` if the ramp was cancelled; the write, bound or persistence error
    /// that aborted the ramp otherwise. After completion, returns the final value
    /// with `continues == false`.
    pub async fn tick(&self) -> ControlResult<TickOutcome> {
        let mut active = self.inner.active.lock().await;
        let finished = TickOutcome {
            continues: false,
            applied_value: self.last_applied(),
        };
        if self.inner.cancel.is_cancelled() {
            *active = None;
            self.set_phase_if_running(Phase::Cancelled);
            return Err(ControlError::Cancelled);
        }
        let Some(run) = active.as_mut() else {
            return Ok(finished);
        };

        let ramp = &self.inner.ramp;
        let candidate = run.state.next_value();
        let checked = ramp.policy.validate(&ramp.limits, candidate);
        let written = match checked {
            Ok(value) => ramp.apply(&run.lease, value).await.map(|_| value),
            Err(e) => Err(e),
        };
        let value = match written {
            Ok(value) => value,
            Err(e) => {
                error!(error = %e, at = run.state.current, "Ramp aborted");
                *active = None;
                self.set_phase(Phase::Failed(e.clone()));
                return Err(e);
            }
        };

        run.state.current = value;
        run.state.remaining_steps -= 1;
        let continues = run.state.remaining_steps > 0;
        self.record_applied(value);
        self.inner.applied_ticks.fetch_add(1, Ordering::SeqCst);

        if !continues {
            *active = None;
            self.set_phase(Phase::Completed);
            info!(value, ticks = self.applied_ticks(), "Ramp complete");
        }
        Ok(TickOutcome {
            continues,
            applied_value: value,
        })
    }

    /// Request cooperative cancellation. No-op once the ramp has ended.
    pub fn cancel(&self) {
        if !self.is_running() {
            return;
        }
        self.inner.cancel.cancel();
        info!(at = self.last_applied(), "Ramp cancel requested");
    }

    /// Emergency override: cancel, then write `value` immediately and persist it.
    ///
    /// Waits only for a write already in flight. Usable whether or not the ramp is
    /// still running.
    pub async fn force_to(&self, value: f64) -> ControlResult<f64> {
        self.inner.cancel.cancel();
        let mut active = self.inner.active.lock().await;
        info!(
            from = self.last_applied(),
            to = value,
            "Emergency override of running ramp"
        );
        let result = self.inner.ramp.force_to(&self.inner.arbiter, value).await;
        *active = None;
        match &result {
            Ok(v) => {
                self.record_applied(*v);
                self.set_phase(Phase::Forced(*v));
            }
            Err(e) => {
                warn!(error = %e, "Forced write failed");
                self.set_phase_if_running(Phase::Cancelled);
            }
        }
        result
    }

    /// Drive the ramp at its tick interval until it ends.
    ///
    /// `on_tick` sees every applied step.
    pub async fn run<F>(&self, mut on_tick: F) -> RampOutcome
    where
        F: FnMut(TickOutcome),
    {
        let period = self.inner.tick_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while self.is_running() {
            tokio::select! {
                biased;
                _ = self.inner.cancel.cancelled() => {}
                _ = ticker.tick() => {}
            }
            match self.tick().await {
                Ok(outcome) => {
                    on_tick(outcome);
                    if !outcome.continues {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
        self.outcome()
    }

    /// Outcome so far; `Cancelled` with the last value while still running.
    pub fn outcome(&self) -> RampOutcome {
        match self.phase() {
            Phase::Completed => RampOutcome::Completed {
                value: self.last_applied(),
                ticks: self.applied_ticks(),
            },
            Phase::Forced(value) => RampOutcome::Forced { value },
            Phase::Failed(e) => RampOutcome::Failed(e),
            Phase::Running | Phase::Cancelled => RampOutcome::Cancelled {
                value: self.last_applied(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failsafe::MemoryFailsafeStore;
    use crate::hardware::mock::MockChannel;

    const OUT: &str = "out";

    fn fixture(limits: SetpointLimits) -> (Arc<MockChannel>, ChannelArbiter, Arc<MemoryFailsafeStore>, BoundedRamp) {
        let mock = Arc::new(MockChannel::new());
        let arbiter = ChannelArbiter::new(mock.clone());
        let store = Arc::new(MemoryFailsafeStore::new());
        let ramp = BoundedRamp::new(OUT, limits, store.clone());
        (mock, arbiter, store, ramp)
    }

    #[test]
    fn test_plan_step_count_is_exact() {
        let state = RampState::plan(0.0, 10.0, per_minute(1.0), 100).unwrap();
        assert_eq!(state.total_steps, 6000);
        assert!(state.step_size > 0.0);

        let down = RampState::plan(5.0, 2.0, 1.0, 1000).unwrap();
        assert_eq!(down.total_steps, 3);
        assert_eq!(down.step_size, -1.0);

        let partial = RampState::plan(0.0, 2.5, 1.0, 1000).unwrap();
        assert_eq!(partial.total_steps, 3);
    }

    #[test]
    fn test_plan_refuses_ramp_too_long_to_count() {
        // 1e9 units at 1e-3 units/s in 1 ms ticks is 1e15 ticks.
        let err = RampState::plan(0.0, 1e9, 1e-3, 1).unwrap_err();
        assert!(matches!(err, ControlError::Configuration(_)));

        let longest = RampState::plan(0.0, f64::from(u32::MAX), 1000.0, 1).unwrap();
        assert_eq!(longest.total_steps, u32::MAX);
    }

    #[test]
    fn test_plan_rejects_bad_rate() {
        for rate in [0.0, -1.0, f64::NAN] {
            assert!(matches!(
                RampState::plan(0.0, 1.0, rate, 100),
                Err(ControlError::Configuration(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_steps_stay_between_endpoints_and_snap() {
        let (mock, arbiter, store, ramp) = fixture(SetpointLimits::new(0.0, 23.0, "A"));
        let handle = ramp
            .start(arbiter.lease("ramp").unwrap(), 1.0, 3.5, 1.0, Duration::from_millis(1000))
            .unwrap();

        let mut applied = Vec::new();
        loop {
            let outcome = handle.tick().await.unwrap();
            applied.push(outcome.applied_value);
            if !outcome.continues {
                break;
            }
        }

        assert_eq!(applied, vec![2.0, 3.0, 3.5]);
        assert_eq!(mock.written_values(OUT), applied);
        assert_eq!(store.value(), Some(3.5));
        assert_eq!(store.save_count(), 3);
        assert!(arbiter.is_available());
        assert_eq!(handle.indicator(), Indicator::Ok);
    }

    #[tokio::test]
    async fn test_follow_up_written_after_every_step() {
        let (mock, arbiter, _store, ramp) = fixture(SetpointLimits::new(0.0, 120.0, "A"));
        let ramp = ramp.with_follow_up(vec![Command::new("sour:volt", 60.0)]);
        let handle = ramp
            .start(arbiter.lease("ramp").unwrap(), 0.0, 2.0, 1.0, Duration::from_millis(1000))
            .unwrap();
        while handle.tick().await.unwrap().continues {}

        let ids: Vec<String> = mock.writes().into_iter().map(|w| w.id).collect();
        assert_eq!(ids, vec![OUT, "sour:volt", OUT, "sour:volt"]);
        assert_eq!(mock.written_values("sour:volt"), vec![60.0, 60.0]);
    }

    #[tokio::test]
    async fn test_already_at_target() {
        let (mock, arbiter, store, ramp) = fixture(SetpointLimits::new(0.0, 23.0, "A"));
        let handle = ramp
            .start(arbiter.lease("ramp").unwrap(), 5.0, 5.0, 1.0, Duration::from_millis(100))
            .unwrap();

        assert_eq!(
            handle.run(|_| {}).await,
            RampOutcome::Completed { value: 5.0, ticks: 0 }
        );
        assert!(mock.writes().is_empty());
        assert_eq!(store.save_count(), 0);
    }

    #[tokio::test]
    async fn test_target_out_of_bounds_is_configuration_error() {
        let (mock, arbiter, _store, ramp) = fixture(SetpointLimits::new(0.0, 23.0, "A"));
        let err = ramp
            .start(arbiter.lease("ramp").unwrap(), 0.0, 30.0, 1.0, Duration::from_millis(100))
            .err()
            .unwrap();
        assert!(matches!(err, ControlError::Configuration(_)));
        assert!(mock.writes().is_empty());
        assert!(arbiter.is_available(), "lease released on rejection");
    }

    #[tokio::test]
    async fn test_rate_above_ceiling_is_rejected() {
        let (_mock, arbiter, _store, ramp) = fixture(
            SetpointLimits::new(0.0, 23.0, "A").with_max_rate_per_second(per_minute(1.0)),
        );
        let err = ramp
            .start(arbiter.lease("ramp").unwrap(), 0.0, 5.0, 1.0, Duration::from_millis(100))
            .err()
            .unwrap();
        assert!(err.to_string().contains("exceeds ceiling"));
    }

    #[tokio::test]
    async fn test_write_failure_aborts_without_advancing() {
        let (mock, arbiter, store, ramp) = fixture(SetpointLimits::new(0.0, 23.0, "A"));
        let handle = ramp
            .start(arbiter.lease("ramp").unwrap(), 0.0, 3.0, 1.0, Duration::from_millis(1000))
            .unwrap();

        handle.tick().await.unwrap();
        mock.inject_next_write_failure();
        let err = handle.tick().await.unwrap_err();

        assert!(matches!(err, ControlError::HardwareIo { .. }));
        assert_eq!(handle.last_applied(), 1.0);
        assert_eq!(store.value(), Some(1.0));
        assert!(matches!(handle.outcome(), RampOutcome::Failed(_)));
        assert!(handle.state().await.is_none());
        assert!(arbiter.is_available());

        // No silent retry on the next tick.
        let after = handle.tick().await.unwrap();
        assert!(!after.continues);
        assert_eq!(mock.written_values(OUT), vec![1.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_after_completion_is_noop() {
        let (_mock, arbiter, store, ramp) = fixture(SetpointLimits::new(0.0, 23.0, "A"));
        let handle = ramp
            .start(arbiter.lease("ramp").unwrap(), 0.0, 1.0, 1.0, Duration::from_millis(500))
            .unwrap();

        let outcome = handle.run(|_| {}).await;
        assert_eq!(outcome, RampOutcome::Completed { value: 1.0, ticks: 2 });
        let saves = store.save_count();

        handle.cancel();
        assert_eq!(handle.outcome(), outcome);
        assert_eq!(store.save_count(), saves);
        assert_eq!(store.value(), Some(1.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_within_one_tick() {
        let (mock, arbiter, _store, ramp) = fixture(SetpointLimits::new(0.0, 23.0, "A"));
        let handle = ramp
            .start(arbiter.lease("ramp").unwrap(), 0.0, 10.0, 1.0, Duration::from_millis(100))
            .unwrap();

        let runner = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.run(|_| {}).await })
        };
        tokio::time::sleep(Duration::from_millis(450)).await;
        handle.cancel();
        let outcome = runner.await.unwrap();

        assert!(matches!(outcome, RampOutcome::Cancelled { .. }));
        assert_eq!(mock.written_values(OUT).len(), 4);
        assert_eq!(handle.indicator(), Indicator::Stopped);
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_forced_stop_logged_as_normal_event() {
        let (_mock, arbiter, _store, ramp) = fixture(SetpointLimits::new(0.0, 23.0, "A"));
        let handle = ramp
            .start(arbiter.lease("ramp").unwrap(), 4.0, 10.0, 1.0, Duration::from_millis(100))
            .unwrap();
        handle.tick().await.unwrap();

        handle.force_to(0.0).await.unwrap();

        assert!(logs_contain("Emergency override of running ramp"));
        assert!(logs_contain("Setpoint forced"));
        logs_assert(|lines: &[&str]| {
            match lines
                .iter()
                .find(|line| line.contains("ERROR") || line.contains("WARN"))
            {
                Some(line) => Err(format!("unexpected fault-level log: {line}")),
                None => Ok(()),
            }
        });
    }
}
