//! Mock hardware channel
//!
//! In-memory register map for testing without a PLC or controller attached.
//! All waits use `tokio::time`, so tests running with `start_paused = true` see
//! simulated motion and latency without wall-clock delay.
//!
//! # Features
//!
//! - Analog and discrete registers, readable and writable by id
//! - Simulated actuators: a readback register that follows a setpoint at a fixed
//!   speed, optionally only after a start command (stepper style)
//! - Failure injection for the next write, every write, or every read
//! - Ordered log of successful writes

use crate::error::{ControlError, ControlResult};
use crate::hardware::HardwareChannel;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::time::{sleep, Duration, Instant};

/// One write that reached the mock device.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRecord {
    /// Register id
    pub id: String,
    /// Written value, discrete writes as 0.0 / 1.0
    pub value: f64,
}

#[derive(Debug, Clone)]
struct Motion {
    from: f64,
    to: f64,
    started: Instant,
}

/// Readback register that chases a setpoint.
#[derive(Debug, Clone)]
struct Actuator {
    setpoint_id: String,
    readback_id: String,
    units_per_second: f64,
    start_command: Option<(String, f64)>,
    stop_command: Option<(String, f64)>,
    pending_target: Option<f64>,
    resting: f64,
    motion: Option<Motion>,
}

impl Actuator {
    fn position(&self, now: Instant) -> f64 {
        match &self.motion {
            None => self.resting,
            Some(m) => {
                let span = m.to - m.from;
                let travelled = self.units_per_second * (now - m.started).as_secs_f64();
                if !self.units_per_second.is_finite() || travelled >= span.abs() {
                    m.to
                } else {
                    m.from + span.signum() * travelled
                }
            }
        }
    }

    fn begin(&mut self, target: f64, now: Instant) {
        let from = self.position(now);
        self.motion = Some(Motion {
            from,
            to: target,
            started: now,
        });
    }

    fn halt(&mut self, now: Instant) {
        self.resting = self.position(now);
        self.motion = None;
    }
}

#[derive(Default)]
struct State {
    values: HashMap<String, f64>,
    bools: HashMap<String, bool>,
    actuators: Vec<Actuator>,
    writes: Vec<WriteRecord>,
}

/// Simulated hardware channel.
///
/// # Example
///
/// ```rust,ignore
/// let mock = MockChannel::new().with_actuator("r0xca", "r0x30", 500.0);
/// mock.write_value("r0xca", 1000.0).await?;
/// sleep(Duration::from_secs(2)).await;
/// assert_eq!(mock.read_value("r0x30").await?, 1000.0);
/// ```
pub struct MockChannel {
    state: Mutex<State>,
    latency: Duration,
    fail_next_write: AtomicBool,
    fail_all_writes: AtomicBool,
    fail_reads: AtomicBool,
}

impl Default for MockChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl MockChannel {
    /// Empty device with instant round trips.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            latency: Duration::ZERO,
            fail_next_write: AtomicBool::new(false),
            fail_all_writes: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
        }
    }

    /// Simulated round-trip latency applied to every call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Preset an analog register.
    pub fn with_value(self, id: &str, value: f64) -> Self {
        self.lock().values.insert(id.to_string(), value);
        self
    }

    /// Readback `readback_id` follows writes to `setpoint_id` at the given speed.
    /// `f64::INFINITY` makes the move instantaneous.
    pub fn with_actuator(self, setpoint_id: &str, readback_id: &str, units_per_second: f64) -> Self {
        self.lock().actuators.push(Actuator {
            setpoint_id: setpoint_id.to_string(),
            readback_id: readback_id.to_string(),
            units_per_second,
            start_command: None,
            stop_command: None,
            pending_target: None,
            resting: 0.0,
            motion: None,
        });
        self
    }

    /// Stepper-style actuator: the setpoint write only arms the target, motion begins
    /// on `start` and freezes on `stop`.
    pub fn with_commanded_actuator(
        self,
        setpoint_id: &str,
        readback_id: &str,
        units_per_second: f64,
        start: (&str, f64),
        stop: (&str, f64),
    ) -> Self {
        self.lock().actuators.push(Actuator {
            setpoint_id: setpoint_id.to_string(),
            readback_id: readback_id.to_string(),
            units_per_second,
            start_command: Some((start.0.to_string(), start.1)),
            stop_command: Some((stop.0.to_string(), stop.1)),
            pending_target: None,
            resting: 0.0,
            motion: None,
        });
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Fail exactly the next write.
    pub fn inject_next_write_failure(&self) {
        self.fail_next_write.store(true, Ordering::SeqCst);
    }

    /// Fail every write until reset.
    pub fn set_fail_all_writes(&self, fail: bool) {
        self.fail_all_writes.store(fail, Ordering::SeqCst);
    }

    /// Fail every read until reset.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Every successful write, in order.
    pub fn writes(&self) -> Vec<WriteRecord> {
        self.lock().writes.clone()
    }

    /// Successful analog writes to one register, in order.
    pub fn written_values(&self, id: &str) -> Vec<f64> {
        self.lock()
            .writes
            .iter()
            .filter(|w| w.id == id)
            .map(|w| w.value)
            .collect()
    }

    /// Current discrete register content without a simulated round trip.
    pub fn read_bool_register(&self, id: &str) -> Option<bool> {
        self.lock().bools.get(id).copied()
    }

    async fn round_trip(&self) {
        if !self.latency.is_zero() {
            sleep(self.latency).await;
        }
    }

    fn check_write(&self, id: &str) -> ControlResult<()> {
        if self.fail_all_writes.load(Ordering::SeqCst)
            || self.fail_next_write.swap(false, Ordering::SeqCst)
        {
            return Err(ControlError::hardware(format!("mock write to '{id}' failed")));
        }
        Ok(())
    }
}

#[async_trait]
impl HardwareChannel for MockChannel {
    async fn read_value(&self, id: &str) -> ControlResult<f64> {
        self.round_trip().await;
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(ControlError::hardware(format!("mock read of '{id}' failed")));
        }
        let now = Instant::now();
        let state = self.lock();
        if let Some(actuator) = state.actuators.iter().find(|a| a.readback_id == id) {
            return Ok(actuator.position(now));
        }
        Ok(state.values.get(id).copied().unwrap_or(0.0))
    }

    async fn write_value(&self, id: &str, value: f64) -> ControlResult<()> {
        self.round_trip().await;
        self.check_write(id)?;

        let now = Instant::now();
        let mut state = self.lock();
        state.values.insert(id.to_string(), value);
        for actuator in state.actuators.iter_mut() {
            if actuator.setpoint_id == id {
                match actuator.start_command {
                    None => actuator.begin(value, now),
                    Some(_) => actuator.pending_target = Some(value),
                }
            }
            if let Some((start_id, start_value)) = actuator.start_command.clone() {
                if start_id == id && start_value == value {
                    if let Some(target) = actuator.pending_target {
                        actuator.begin(target, now);
                    }
                }
            }
            if let Some((stop_id, stop_value)) = actuator.stop_command.clone() {
                if stop_id == id && stop_value == value {
                    actuator.halt(now);
                }
            }
        }
        state.writes.push(WriteRecord {
            id: id.to_string(),
            value,
        });
        Ok(())
    }

    async fn read_bool(&self, id: &str) -> ControlResult<bool> {
        self.round_trip().await;
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(ControlError::hardware(format!("mock read of '{id}' failed")));
        }
        Ok(self.lock().bools.get(id).copied().unwrap_or(false))
    }

    async fn write_bool(&self, id: &str, value: bool) -> ControlResult<()> {
        self.round_trip().await;
        self.check_write(id)?;
        let mut state = self.lock();
        state.bools.insert(id.to_string(), value);
        state.writes.push(WriteRecord {
            id: id.to_string(),
            value: if value { 1.0 } else { 0.0 },
        });
        Ok(())
    }
}
