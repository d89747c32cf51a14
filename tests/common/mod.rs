//! Common test utilities for beamline_ctl integration tests
//!
//! This module provides reusable test helpers for:
//! - Timing assertions on tokio's paused clock
//! - Simulated ionizer, stepper and magnet rigs
//! - Step and status helpers for sequencer scenarios

#![allow(dead_code)] // Not every scenario file uses every helper

use beamline_ctl::failsafe::MemoryFailsafeStore;
use beamline_ctl::hardware::{nodes, ChannelArbiter, MockChannel};
use beamline_ctl::sequencer::Motion;
use beamline_ctl::{
    BoundedRamp, SequenceState, SequenceStatus, SequenceStep, SetpointLimits, TriggerSpec,
};
use std::sync::Arc;
use std::time::Duration;

/// Tolerance levels for timing assertions.
#[derive(Debug, Clone, Copy)]
pub enum TimingTolerance {
    /// Exact match - for simulated time with `start_paused = true`
    Exact,
    /// 5% tolerance - for waits that include a poll-interval rounding
    Tight,
    /// 20% tolerance - for loosely bounded waits
    Normal,
}

impl TimingTolerance {
    /// Get the tolerance factor as a fraction (0.0 to 1.0)
    pub fn factor(&self) -> f64 {
        match self {
            TimingTolerance::Exact => 0.0,
            TimingTolerance::Tight => 0.05,
            TimingTolerance::Normal => 0.20,
        }
    }
}

/// Assert that a duration is within tolerance of an expected value.
///
/// # Panics
/// Panics if the actual duration is outside the tolerance range.
pub fn assert_duration_near(
    actual: Duration,
    expected: Duration,
    tolerance: TimingTolerance,
    context: &str,
) {
    let factor = tolerance.factor();
    let min = expected.mul_f64(1.0 - factor);
    let max = expected.mul_f64(1.0 + factor);

    assert!(
        actual >= min && actual <= max,
        "{}: expected {:?} ±{:.0}%, got {:?} (acceptable range: {:?} to {:?})",
        context,
        expected,
        factor * 100.0,
        actual,
        min,
        max
    );
}

/// Simulated ionizer: the readback follows the setpoint instantly.
pub struct IonizerRig {
    pub mock: Arc<MockChannel>,
    pub arbiter: ChannelArbiter,
    pub store: Arc<MemoryFailsafeStore>,
    pub ramp: BoundedRamp,
}

/// Ionizer limits used throughout the scenarios: 0 to 23 A.
pub fn ionizer_limits() -> SetpointLimits {
    SetpointLimits::new(0.0, 23.0, "A")
}

pub fn ionizer_rig() -> IonizerRig {
    let mock = Arc::new(MockChannel::new().with_actuator(
        nodes::IONIZER_CURRENT_WRITE,
        nodes::IONIZER_CURRENT_READ,
        f64::INFINITY,
    ));
    let arbiter = ChannelArbiter::new(mock.clone());
    let store = Arc::new(MemoryFailsafeStore::new());
    let ramp = BoundedRamp::new(nodes::IONIZER_CURRENT_WRITE, ionizer_limits(), store.clone());
    IonizerRig {
        mock,
        arbiter,
        store,
        ramp,
    }
}

/// Simulated Copley stepper moving at `counts_per_second` once started.
pub fn stepper_mock(counts_per_second: f64) -> Arc<MockChannel> {
    Arc::new(MockChannel::new().with_commanded_actuator(
        "r0xca",
        "r0x30",
        counts_per_second,
        ("t", 1.0),
        ("t", 0.0),
    ))
}

/// Simulated magnet supply whose measured current follows instantly.
pub fn magnet_mock() -> Arc<MockChannel> {
    Arc::new(MockChannel::new().with_actuator("sour:curr", "meas:curr", f64::INFINITY))
}

pub fn step(label: &str, target: f64, trigger: TriggerSpec) -> SequenceStep {
    SequenceStep {
        label: label.to_string(),
        target,
        motion: Motion::Direct,
        trigger,
    }
}

pub fn secs(n: u64) -> TriggerSpec {
    TriggerSpec::Time(Duration::from_secs(n))
}

/// Collapse consecutive reports of the same state and step, which differ only
/// in progress detail.
pub fn transitions(statuses: &[SequenceStatus]) -> Vec<(SequenceState, Option<usize>)> {
    let mut out: Vec<(SequenceState, Option<usize>)> = Vec::new();
    for status in statuses {
        let key = (status.state, status.step_index);
        if out.last() != Some(&key) {
            out.push(key);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timing_tolerance_factors() {
        assert_eq!(TimingTolerance::Exact.factor(), 0.0);
        assert_eq!(TimingTolerance::Tight.factor(), 0.05);
        assert_eq!(TimingTolerance::Normal.factor(), 0.20);
    }

    #[test]
    #[should_panic(expected = "outside tolerance")]
    fn test_assert_duration_near_fails() {
        assert_duration_near(
            Duration::from_millis(130),
            Duration::from_millis(100),
            TimingTolerance::Normal,
            "outside tolerance",
        );
    }
}
