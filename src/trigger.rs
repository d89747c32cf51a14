//! Trigger gate: the dwell primitive between sequence moves.
//!
//! A gate completes either after a fixed duration or once an external event
//! counter has advanced by a required amount since the gate was entered. It is
//! polled at a fixed cadence and reports progress at every poll so the operator
//! can see "3/10 files" or "12s remaining".
//!
//! Cancellation is checked before any completion test at each poll boundary, so
//! a cancelled gate never reports `Completed`. The wait between polls also wakes
//! on cancellation, which keeps the latency below one poll interval.

use crate::cancel::CancelToken;
use crate::counter::EventCounter;
use crate::error::{ControlError, ControlResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::debug;

/// How a dwell ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSpec {
    /// Hold for a fixed time
    Time(#[serde(with = "humantime_serde")] Duration),
    /// Hold until this many new events have been counted
    EventCount(u32),
}

impl fmt::Display for TriggerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerSpec::Time(d) => write!(f, "{}s", d.as_secs_f64()),
            TriggerSpec::EventCount(n) => write!(f, "{n} files"),
        }
    }
}

impl FromStr for TriggerSpec {
    type Err = ControlError;

    /// `5files` / `5 files` for an event count, anything humantime accepts
    /// (`30s`, `2m 30s`) for a time.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim();
        let count = text
            .strip_suffix("files")
            .or_else(|| text.strip_suffix("file"));
        if let Some(count) = count {
            return count.trim().parse::<u32>().map(TriggerSpec::EventCount).map_err(|e| {
                ControlError::Configuration(format!("bad event count '{text}': {e}"))
            });
        }
        humantime_serde::re::humantime::parse_duration(text)
            .map(TriggerSpec::Time)
            .map_err(|e| ControlError::Configuration(format!("bad trigger '{text}': {e}")))
    }
}

/// Baseline and latest reading of an event-count dwell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerObservation {
    /// Count read once on entry
    pub baseline_count: u32,
    /// Count read at the latest poll
    pub current_count: u32,
}

impl TriggerObservation {
    /// Events since entry. A count that went down reads as zero.
    pub fn delta(&self) -> u32 {
        self.current_count.saturating_sub(self.baseline_count)
    }
}

/// Progress report emitted at every poll.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GateProgress {
    /// Time left on a timed dwell
    Remaining(Duration),
    /// Events seen against the required number
    Events {
        /// Counter readings
        observation: TriggerObservation,
        /// Threshold
        required: u32,
    },
}

impl fmt::Display for GateProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateProgress::Remaining(left) => {
                write!(f, "Measuring... {}s remaining", left.as_secs_f64().ceil() as u64)
            }
            GateProgress::Events {
                observation,
                required,
            } => write!(
                f,
                "Waiting for {required} files... ({}/{required})",
                observation.delta().min(*required)
            ),
        }
    }
}

/// Result of a gate wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    /// Duration elapsed or threshold reached
    Completed,
    /// Cancelled before completion
    Cancelled,
}

/// Polled, cancellable dwell.
#[derive(Clone)]
pub struct TriggerGate {
    poll_interval: Duration,
    counter: Option<Arc<dyn EventCounter>>,
}

impl TriggerGate {
    /// Gate polling at `poll_interval`, with no counter attached.
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            poll_interval,
            counter: None,
        }
    }

    /// Attach the event counter used by `EventCount` dwells.
    pub fn with_counter(mut self, counter: Arc<dyn EventCounter>) -> Self {
        self.counter = Some(counter);
        self
    }

    /// Poll cadence.
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// True when `EventCount` dwells can be served.
    pub fn has_counter(&self) -> bool {
        self.counter.is_some()
    }

    /// Wait for the trigger, reporting progress at every poll.
    ///
    /// # Errors
    /// `Configuration` for a zero poll interval or a count trigger with no counter.
    /// Counter read failures propagate unchanged.
    pub async fn wait<F>(
        &self,
        spec: &TriggerSpec,
        cancel: &CancelToken,
        mut on_progress: F,
    ) -> ControlResult<GateOutcome>
    where
        F: FnMut(GateProgress),
    {
        if self.poll_interval.is_zero() {
            return Err(ControlError::Configuration(
                "trigger poll interval must be greater than zero".to_string(),
            ));
        }
        match spec {
            TriggerSpec::Time(duration) => self.wait_time(*duration, cancel, &mut on_progress).await,
            TriggerSpec::EventCount(required) => {
                let counter = self.counter.as_ref().ok_or_else(|| {
                    ControlError::Configuration("event-count trigger needs a counter".to_string())
                })?;
                self.wait_count(counter.as_ref(), *required, cancel, &mut on_progress)
                    .await
            }
        }
    }

    async fn wait_time<F: FnMut(GateProgress)>(
        &self,
        duration: Duration,
        cancel: &CancelToken,
        on_progress: &mut F,
    ) -> ControlResult<GateOutcome> {
        let deadline = Instant::now() + duration;
        loop {
            if cancel.is_cancelled() {
                return Ok(GateOutcome::Cancelled);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(GateOutcome::Completed);
            }
            on_progress(GateProgress::Remaining(remaining));
            self.pause(remaining.min(self.poll_interval), cancel).await;
        }
    }

    async fn wait_count<F: FnMut(GateProgress)>(
        &self,
        counter: &dyn EventCounter,
        required: u32,
        cancel: &CancelToken,
        on_progress: &mut F,
    ) -> ControlResult<GateOutcome> {
        let baseline_count = counter.count().await?;
        debug!(baseline_count, required, "Event-count dwell started");
        loop {
            if cancel.is_cancelled() {
                return Ok(GateOutcome::Cancelled);
            }
            let observation = TriggerObservation {
                baseline_count,
                current_count: counter.count().await?,
            };
            on_progress(GateProgress::Events {
                observation,
                required,
            });
            if observation.delta() >= required {
                return Ok(GateOutcome::Completed);
            }
            self.pause(self.poll_interval, cancel).await;
        }
    }

    async fn pause(&self, wait: Duration, cancel: &CancelToken) {
        tokio::select! {
            _ = sleep(wait) => {}
            _ = cancel.cancelled() => {}
        }
    }
}
