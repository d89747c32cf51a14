//! Magnet mass scan: a fixed-increment sweep between two currents.
//!
//! The scan writes the start value, then steps by `increment` once per `interval`
//! until it lands exactly on the stop value. That is a bounded ramp whose rate is
//! `|increment| / interval` and whose tick is `interval`, so the ramp engine does
//! the stepping, bounding and persistence.

use crate::error::{ControlError, ControlResult};
use crate::hardware::ChannelLease;
use crate::ramp::{BoundedRamp, RampHandle, RampOutcome};
use crate::safety::SafetyPolicy;
use std::time::Duration;
use tracing::info;

/// Validated scan parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScanPlan {
    start: f64,
    stop: f64,
    increment: f64,
    interval: Duration,
}

impl ScanPlan {
    /// Check and build a plan. `increment` is signed and must point from start
    /// toward stop.
    ///
    /// # Errors
    /// `Configuration` for `start == stop`, a zero increment, a zero interval, or an
    /// increment whose sign disagrees with the scan direction.
    pub fn new(start: f64, stop: f64, increment: f64, interval: Duration) -> ControlResult<Self> {
        if start == stop {
            return Err(ControlError::Configuration(
                "scan start and stop must differ".to_string(),
            ));
        }
        if increment == 0.0 || !increment.is_finite() {
            return Err(ControlError::Configuration(
                "scan increment must be non-zero".to_string(),
            ));
        }
        if interval.is_zero() {
            return Err(ControlError::Configuration(
                "scan interval must be greater than zero".to_string(),
            ));
        }
        if (stop - start).signum() != increment.signum() {
            return Err(ControlError::Configuration(format!(
                "increment {increment} does not lead from {start} to {stop}"
            )));
        }
        Ok(Self {
            start,
            stop,
            increment,
            interval,
        })
    }

    /// Equivalent ramp rate.
    pub fn rate_per_second(&self) -> f64 {
        self.increment.abs() / self.interval.as_secs_f64()
    }

    /// Share of the sweep covered at `current`, 0 to 100.
    pub fn progress_percent(&self, current: f64) -> f64 {
        let covered = (current - self.start) / (self.stop - self.start);
        (covered * 100.0).clamp(0.0, 100.0)
    }

    /// Write the start value, then start the ramp toward stop.
    pub async fn begin(&self, ramp: &BoundedRamp, lease: ChannelLease) -> ControlResult<RampHandle> {
        let start = SafetyPolicy::new().validate(ramp.limits(), self.start)?;
        ramp.apply(&lease, start).await?;
        info!(
            start = self.start,
            stop = self.stop,
            increment = self.increment,
            "Mass scan started"
        );
        ramp.start(lease, start, self.stop, self.rate_per_second(), self.interval)
    }

    /// Run the whole scan, reporting `(current, percent)` after every step.
    pub async fn run<F>(
        &self,
        ramp: &BoundedRamp,
        lease: ChannelLease,
        mut on_progress: F,
    ) -> ControlResult<RampOutcome>
    where
        F: FnMut(f64, f64),
    {
        let handle = self.begin(ramp, lease).await?;
        on_progress(self.start, 0.0);
        Ok(handle
            .run(|tick| on_progress(tick.applied_value, self.progress_percent(tick.applied_value)))
            .await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failsafe::MemoryFailsafeStore;
    use crate::hardware::{mock::MockChannel, ChannelArbiter, Command};
    use crate::safety::SetpointLimits;
    use std::sync::Arc;

    #[test]
    fn test_rejects_degenerate_scans() {
        let second = Duration::from_secs(1);
        assert!(ScanPlan::new(5.0, 5.0, 0.1, second).is_err());
        assert!(ScanPlan::new(0.0, 5.0, 0.0, second).is_err());
        assert!(ScanPlan::new(0.0, 5.0, -0.1, second).is_err());
        assert!(ScanPlan::new(5.0, 0.0, 0.1, second).is_err());
        assert!(ScanPlan::new(5.0, 0.0, -0.1, second).is_ok());
    }

    #[test]
    fn test_progress_percent() {
        let plan = ScanPlan::new(10.0, 0.0, -1.0, Duration::from_secs(1)).unwrap();
        assert_eq!(plan.progress_percent(10.0), 0.0);
        assert_eq!(plan.progress_percent(7.5), 25.0);
        assert_eq!(plan.progress_percent(0.0), 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_restores_voltage_limit_at_every_step() {
        let mock = Arc::new(MockChannel::new());
        let arbiter = ChannelArbiter::new(mock.clone());
        let ramp = BoundedRamp::new(
            "sour:curr",
            SetpointLimits::new(0.0, 120.0, "A"),
            Arc::new(MemoryFailsafeStore::new()),
        )
        .with_follow_up(vec![Command::new("sour:volt", 45.0)]);
        let plan = ScanPlan::new(2.0, 1.0, -0.5, Duration::from_secs(1)).unwrap();

        plan.run(&ramp, arbiter.lease("scan").unwrap(), |_, _| {})
            .await
            .unwrap();

        let ids: Vec<String> = mock.writes().into_iter().map(|w| w.id).collect();
        assert_eq!(
            ids,
            vec!["sour:curr", "sour:volt", "sour:curr", "sour:volt", "sour:curr", "sour:volt"]
        );
        assert_eq!(mock.written_values("sour:curr"), vec![2.0, 1.5, 1.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_steps_once_per_interval() {
        let mock = Arc::new(MockChannel::new());
        let arbiter = ChannelArbiter::new(mock.clone());
        let ramp = BoundedRamp::new(
            "sour:curr",
            SetpointLimits::new(0.0, 120.0, "A"),
            Arc::new(MemoryFailsafeStore::new()),
        );
        let plan = ScanPlan::new(1.0, 2.0, 0.25, Duration::from_secs(1)).unwrap();

        let started = tokio::time::Instant::now();
        let mut percents = Vec::new();
        let outcome = plan
            .run(&ramp, arbiter.lease("scan").unwrap(), |_, pct| percents.push(pct))
            .await
            .unwrap();

        assert_eq!(outcome, RampOutcome::Completed { value: 2.0, ticks: 4 });
        assert_eq!(started.elapsed(), Duration::from_secs(4));
        assert_eq!(mock.written_values("sour:curr"), vec![1.0, 1.25, 1.5, 1.75, 2.0]);
        assert_eq!(percents, vec![0.0, 25.0, 50.0, 75.0, 100.0]);
    }
}
