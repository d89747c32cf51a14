//! Core library for the beamline_ctl operator tool.
//!
//! Safety-bounded control of slow laboratory actuators: a rate-limited ramp for a
//! bounded setpoint with crash-safe persistence, and a step sequencer that moves an
//! axis through a list of targets and dwells at each one until a time or
//! event-count trigger fires. Every write goes through a [`ChannelArbiter`], which
//! keeps a ramp, a sequence and manual control from writing the same channel at
//! the same time.
//!
//! The [`ControlActor`] ties these together behind a command channel; the
//! `beamline-ctl` binary is a thin CLI on top of it.

pub mod cancel;
pub mod config;
pub mod control_actor;
pub mod counter;
pub mod error;
pub mod failsafe;
pub mod hardware;
pub mod logging;
pub mod messages;
pub mod ramp;
pub mod safety;
pub mod scan;
pub mod sequencer;
pub mod trigger;

pub use cancel::CancelToken;
pub use config::Settings;
pub use control_actor::{ControlActor, ControlHandle};
pub use error::{ControlError, ControlResult};
pub use hardware::{ChannelArbiter, ChannelLease, HardwareChannel};
pub use messages::{ControlCommand, ControlSnapshot};
pub use ramp::{BoundedRamp, Indicator, RampHandle, RampOutcome, RampState};
pub use safety::{BoundPolicy, Confirmer, GuardedAction, SafetyPolicy, SetpointLimits};
pub use sequencer::{
    SequenceHandle, SequenceOutcome, SequenceState, SequenceStatus, SequenceStep, StepSequencer,
};
pub use trigger::{TriggerGate, TriggerSpec};
