//! Message types for actor-based communication
//!
//! This module defines the commands sent from an operator surface (CLI, UI) to the
//! [`ControlActor`](crate::control_actor::ControlActor). Each command carries a
//! oneshot sender for its reply, so callers never share mutable state with the
//! control loop.

use crate::error::ControlResult;
use crate::ramp::Indicator;
use crate::safety::{BoundPolicy, GuardedAction};
use crate::sequencer::{SequenceStatus, SequenceStep};
use serde::Serialize;
use tokio::sync::oneshot;
use uuid::Uuid;

/// Read-only view published by the control actor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControlSnapshot {
    /// Lamp of the ramped setpoint
    pub indicator: Indicator,
    /// Last value confirmed written to the ramped setpoint, if known
    pub setpoint: Option<f64>,
    /// Target of the running ramp
    pub ramp_target: Option<f64>,
    /// Latest sequence status
    pub sequence: SequenceStatus,
    /// Current holder of the write token
    pub channel_owner: Option<String>,
}

impl Default for ControlSnapshot {
    fn default() -> Self {
        Self {
            indicator: Indicator::Idle,
            setpoint: None,
            ramp_target: None,
            sequence: SequenceStatus::idle(),
            channel_owner: None,
        }
    }
}

/// Commands that can be sent to the ControlActor
#[derive(Debug)]
pub enum ControlCommand {
    /// Ramp the setpoint from its current readback to `target`
    StartRamp {
        target: f64,
        /// Overrides the configured rate
        rate_per_second: Option<f64>,
        response: oneshot::Sender<ControlResult<()>>,
    },

    /// Cooperatively stop the running ramp; replies with the value it stopped at
    StopRamp {
        response: oneshot::Sender<ControlResult<Option<f64>>>,
    },

    /// Confirm, then force the setpoint to zero and stop any sequence
    EmergencyStop {
        response: oneshot::Sender<ControlResult<f64>>,
    },

    /// One bounded write to the setpoint, outside any ramp
    ManualWrite {
        value: f64,
        policy: BoundPolicy,
        response: oneshot::Sender<ControlResult<f64>>,
    },

    /// Confirm, then write a discrete actuator
    GuardedWrite {
        action: GuardedAction,
        id: String,
        value: bool,
        response: oneshot::Sender<ControlResult<()>>,
    },

    /// Start a sequence on the configured axis
    RunSequence {
        steps: Vec<SequenceStep>,
        cyclic: bool,
        response: oneshot::Sender<ControlResult<Uuid>>,
    },

    /// Stop the running sequence and wait for it to end
    StopSequence {
        response: oneshot::Sender<ControlResult<()>>,
    },

    /// Current snapshot
    Snapshot {
        response: oneshot::Sender<ControlSnapshot>,
    },

    /// Stop everything, persist the failsafe and exit the loop
    Shutdown {
        response: oneshot::Sender<()>,
    },
}

impl ControlCommand {
    /// Helper to create a StartRamp command
    pub fn start_ramp(
        target: f64,
        rate_per_second: Option<f64>,
    ) -> (Self, oneshot::Receiver<ControlResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::StartRamp {
                target,
                rate_per_second,
                response: tx,
            },
            rx,
        )
    }

    /// Helper to create a StopRamp command
    pub fn stop_ramp() -> (Self, oneshot::Receiver<ControlResult<Option<f64>>>) {
        let (tx, rx) = oneshot::channel();
        (Self::StopRamp { response: tx }, rx)
    }

    /// Helper to create an EmergencyStop command
    pub fn emergency_stop() -> (Self, oneshot::Receiver<ControlResult<f64>>) {
        let (tx, rx) = oneshot::channel();
        (Self::EmergencyStop { response: tx }, rx)
    }

    /// Helper to create a ManualWrite command
    pub fn manual_write(
        value: f64,
        policy: BoundPolicy,
    ) -> (Self, oneshot::Receiver<ControlResult<f64>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::ManualWrite {
                value,
                policy,
                response: tx,
            },
            rx,
        )
    }

    /// Helper to create a GuardedWrite command
    pub fn guarded_write(
        action: GuardedAction,
        id: impl Into<String>,
        value: bool,
    ) -> (Self, oneshot::Receiver<ControlResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::GuardedWrite {
                action,
                id: id.into(),
                value,
                response: tx,
            },
            rx,
        )
    }

    /// Helper to create a RunSequence command
    pub fn run_sequence(
        steps: Vec<SequenceStep>,
        cyclic: bool,
    ) -> (Self, oneshot::Receiver<ControlResult<Uuid>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::RunSequence {
                steps,
                cyclic,
                response: tx,
            },
            rx,
        )
    }

    /// Helper to create a StopSequence command
    pub fn stop_sequence() -> (Self, oneshot::Receiver<ControlResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::StopSequence { response: tx }, rx)
    }

    /// Helper to create a Snapshot command
    pub fn snapshot() -> (Self, oneshot::Receiver<ControlSnapshot>) {
        let (tx, rx) = oneshot::channel();
        (Self::Snapshot { response: tx }, rx)
    }

    /// Helper to create a Shutdown command
    pub fn shutdown() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::Shutdown { response: tx }, rx)
    }
}
