//! Custom error types for the control core.
//!
//! This module defines `ControlError`, the single error type shared by the ramp engine,
//! the trigger gate, the step sequencer and the safety policy. It is built with
//! `thiserror` so every layer can propagate failures with `?`.
//!
//! ## Error Taxonomy
//!
//! - **`Configuration`**: invalid bounds, non-positive rates, empty sequences. Raised
//!   synchronously, before any hardware interaction takes place.
//! - **`HardwareIo`**: a read, write or timeout failure on a hardware channel. Carries the
//!   index and label of the sequence step in progress when there is one. Never retried.
//! - **`ConfirmationDeclined`**: the operator rejected a guarded action. This is a normal
//!   operational outcome and leaves state unchanged.
//! - **`RangeViolation`**: a target or live value outside its setpoint bounds.
//! - **`ChannelBusy`**: a write was attempted while another holder owns the write token.
//! - **`Cancelled`**: cooperative cancellation or an emergency override ended the operation.
//! - **`Persistence`**: the failsafe store could not be read or written.
//!
//! Use [`ControlError::is_operational`] to tell normal outcomes apart from faults when
//! choosing a log level.

use crate::safety::GuardedAction;
use thiserror::Error;

/// Convenience alias for results using the control error type.
pub type ControlResult<T> = std::result::Result<T, ControlError>;

#[allow(missing_docs)]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ControlError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Hardware I/O error{}: {reason}", step_suffix(.step, .label))]
    HardwareIo {
        step: Option<usize>,
        label: Option<String>,
        reason: String,
    },

    #[error("Operator declined: {0}")]
    ConfirmationDeclined(GuardedAction),

    #[error("Value {value} {unit} outside [{min}, {max}]")]
    RangeViolation {
        value: f64,
        min: f64,
        max: f64,
        unit: String,
    },

    #[error("Channel is already in use by '{owner}', requested by '{requested_by}'")]
    ChannelBusy { owner: String, requested_by: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Failsafe persistence error: {0}")]
    Persistence(String),
}

fn step_suffix(step: &Option<usize>, label: &Option<String>) -> String {
    match (step, label) {
        (Some(index), Some(label)) => format!(" at step {index} ('{label}')"),
        (Some(index), None) => format!(" at step {index}"),
        _ => String::new(),
    }
}

impl ControlError {
    /// Hardware failure not tied to a sequence step.
    pub fn hardware(reason: impl Into<String>) -> Self {
        Self::HardwareIo {
            step: None,
            label: None,
            reason: reason.into(),
        }
    }

    /// Attach the failing step to a hardware error. Other variants pass through.
    pub fn at_step(self, index: usize, step_label: &str) -> Self {
        match self {
            Self::HardwareIo { reason, .. } => Self::HardwareIo {
                step: Some(index),
                label: Some(step_label.to_string()),
                reason,
            },
            other => other,
        }
    }

    /// True for outcomes that are part of normal operation rather than faults.
    pub fn is_operational(&self) -> bool {
        matches!(self, Self::ConfirmationDeclined(_) | Self::Cancelled)
    }
}

impl From<std::io::Error> for ControlError {
    fn from(err: std::io::Error) -> Self {
        Self::hardware(err.to_string())
    }
}

impl From<crate::config::ConfigError> for ControlError {
    fn from(err: crate::config::ConfigError) -> Self {
        Self::Configuration(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ControlError::Configuration("rate must be positive".to_string());
        assert_eq!(err.to_string(), "Configuration error: rate must be positive");
    }

    #[test]
    fn test_hardware_error_carries_step() {
        let err = ControlError::hardware("no ack").at_step(2, "Target B");
        assert_eq!(
            err.to_string(),
            "Hardware I/O error at step 2 ('Target B'): no ack"
        );
        assert!(!err.is_operational());
    }

    #[test]
    fn test_at_step_leaves_other_variants() {
        let err = ControlError::Cancelled.at_step(1, "x");
        assert_eq!(err, ControlError::Cancelled);
        assert!(err.is_operational());
    }

    #[test]
    fn test_declined_is_operational() {
        let err = ControlError::ConfirmationDeclined(GuardedAction::StartVenting);
        assert!(err.is_operational());
        assert!(err.to_string().contains("venting"));
    }
}
