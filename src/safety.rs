//! Setpoint bounds and operator confirmation for destructive actions.
//!
//! `SafetyPolicy` sits in front of every outbound setpoint write. It has two jobs:
//!
//! - **Bound validation**: a value outside `[min, max]` is either rejected with
//!   `ControlError::RangeViolation` or clamped, depending on the [`BoundPolicy`]
//!   declared by the call site. Ramp targets reject; slider drags clamp.
//! - **Guarded actions**: emergency stop, venting, pump-valve opening and failsafe
//!   restore must be acknowledged by the operator through a [`Confirmer`] before
//!   the underlying write is issued.
//!
//! The policy is stateless per call. A confirmation is never remembered and reused.
//!
//! Rate limits live on [`SetpointLimits`] but are only consumed when a ramp is
//! configured; the policy itself does no rate math.

use crate::error::{ControlError, ControlResult};
use crate::hardware::ChannelArbiter;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{info, warn};

/// Bounds of one physical setpoint (current, voltage, position).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetpointLimits {
    /// Lowest permitted value
    pub min: f64,
    /// Highest permitted value
    pub max: f64,
    /// Ramp rate ceiling, only meaningful for ramped setpoints
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_rate_per_second: Option<f64>,
    /// Display unit
    #[serde(default)]
    pub unit: String,
}

impl SetpointLimits {
    /// Bounds without a rate ceiling.
    pub fn new(min: f64, max: f64, unit: impl Into<String>) -> Self {
        Self {
            min,
            max,
            max_rate_per_second: None,
            unit: unit.into(),
        }
    }

    /// Attach a ramp rate ceiling.
    pub fn with_max_rate_per_second(mut self, rate: f64) -> Self {
        self.max_rate_per_second = Some(rate);
        self
    }

    /// Reject bounds that cannot hold any value.
    pub fn check(&self) -> ControlResult<()> {
        if !self.min.is_finite() || !self.max.is_finite() || self.min > self.max {
            return Err(ControlError::Configuration(format!(
                "invalid bounds [{}, {}]",
                self.min, self.max
            )));
        }
        if let Some(rate) = self.max_rate_per_second {
            if !rate.is_finite() || rate <= 0.0 {
                return Err(ControlError::Configuration(format!(
                    "max_rate_per_second must be positive, got {rate}"
                )));
            }
        }
        Ok(())
    }

    /// True when `value` lies inside the closed interval.
    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }

    fn violation(&self, value: f64) -> ControlError {
        ControlError::RangeViolation {
            value,
            min: self.min,
            max: self.max,
            unit: self.unit.clone(),
        }
    }
}

/// What to do with an out-of-range value at a given call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundPolicy {
    /// Fail with `RangeViolation`
    Reject,
    /// Pull the value onto the nearest bound
    Clamp,
}

/// Actions that need an explicit operator acknowledgement before the write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GuardedAction {
    /// Force the ramped setpoint to zero, bypassing the rate limit
    EmergencyStop,
    /// Open the vent valve on the source chamber
    StartVenting,
    /// Open the valve between pump and source
    OpenPumpValve,
    /// Re-apply the persisted failsafe value at startup
    RestoreFailsafe,
}

impl GuardedAction {
    /// Every action in the registry.
    pub const ALL: [GuardedAction; 4] = [
        GuardedAction::EmergencyStop,
        GuardedAction::StartVenting,
        GuardedAction::OpenPumpValve,
        GuardedAction::RestoreFailsafe,
    ];

    /// Question shown to the operator.
    pub fn prompt(&self) -> &'static str {
        match self {
            GuardedAction::EmergencyStop => {
                "Emergency stop: force the setpoint to 0 immediately?"
            }
            GuardedAction::StartVenting => {
                "Start venting? Make sure the source valve is closed and the pump is off."
            }
            GuardedAction::OpenPumpValve => {
                "Open the pump valve? Only do this once the pump has reached speed."
            }
            GuardedAction::RestoreFailsafe => "Restore the last saved setpoint?",
        }
    }
}

impl fmt::Display for GuardedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GuardedAction::EmergencyStop => "emergency stop",
            GuardedAction::StartVenting => "start venting",
            GuardedAction::OpenPumpValve => "open pump valve",
            GuardedAction::RestoreFailsafe => "restore failsafe",
        };
        f.write_str(name)
    }
}

/// Source of operator acknowledgements.
#[async_trait]
pub trait Confirmer: Send + Sync {
    /// Ask once. `detail` carries call-specific context such as the value to apply.
    async fn confirm(&self, action: GuardedAction, detail: &str) -> bool;
}

/// Accepts every prompt. For scripted operation and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysConfirm;

#[async_trait]
impl Confirmer for AlwaysConfirm {
    async fn confirm(&self, _action: GuardedAction, _detail: &str) -> bool {
        true
    }
}

/// Declines every prompt.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysDecline;

#[async_trait]
impl Confirmer for AlwaysDecline {
    async fn confirm(&self, _action: GuardedAction, _detail: &str) -> bool {
        false
    }
}

/// Bound validation and the confirm-before-write registry.
#[derive(Debug, Clone, Copy, Default)]
pub struct SafetyPolicy;

impl SafetyPolicy {
    /// Create the policy.
    pub fn new() -> Self {
        Self
    }

    /// Validate a value, rejecting anything out of bounds.
    pub fn validate(&self, limits: &SetpointLimits, value: f64) -> ControlResult<f64> {
        self.bound(limits, value, BoundPolicy::Reject)
    }

    /// Pull a value into bounds. Never fails for finite input.
    pub fn clamp(&self, limits: &SetpointLimits, value: f64) -> ControlResult<f64> {
        self.bound(limits, value, BoundPolicy::Clamp)
    }

    /// Apply the call site's bound policy.
    pub fn bound(
        &self,
        limits: &SetpointLimits,
        value: f64,
        policy: BoundPolicy,
    ) -> ControlResult<f64> {
        if !value.is_finite() {
            return Err(limits.violation(value));
        }
        if limits.contains(value) {
            return Ok(value);
        }
        match policy {
            BoundPolicy::Reject => Err(limits.violation(value)),
            BoundPolicy::Clamp => {
                let clamped = value.clamp(limits.min, limits.max);
                warn!(value, clamped, unit = %limits.unit, "Setpoint clamped to bounds");
                Ok(clamped)
            }
        }
    }

    /// True for actions in the confirm-before-write registry.
    pub fn requires_confirmation(&self, action: GuardedAction) -> bool {
        GuardedAction::ALL.contains(&action)
    }

    /// Ask the operator. A decline is logged as a normal event and returned as
    /// `ConfirmationDeclined`.
    pub async fn confirm(
        &self,
        action: GuardedAction,
        confirmer: &dyn Confirmer,
        detail: &str,
    ) -> ControlResult<()> {
        if !self.requires_confirmation(action) {
            return Ok(());
        }
        if confirmer.confirm(action, detail).await {
            info!(%action, detail, "Operator confirmed");
            Ok(())
        } else {
            info!(%action, detail, "Operator declined, state unchanged");
            Err(ControlError::ConfirmationDeclined(action))
        }
    }

    /// Confirm, then issue a discrete write through the manual write path.
    pub async fn guarded_bool_write(
        &self,
        action: GuardedAction,
        confirmer: &dyn Confirmer,
        arbiter: &ChannelArbiter,
        id: &str,
        value: bool,
    ) -> ControlResult<()> {
        self.confirm(action, confirmer, id).await?;
        arbiter.manual_write_bool("operator", id, value).await?;
        info!(%action, id, value, "Guarded write applied");
        Ok(())
    }
}
