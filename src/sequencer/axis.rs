//! How the sequencer moves one actuator.

pub use crate::hardware::Command;
use crate::hardware::nodes;
use crate::safety::SetpointLimits;
use serde::{Deserialize, Serialize};

/// Register map and stop behavior of a sequenced actuator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Axis {
    /// Display name
    pub name: String,
    /// Register receiving the target
    pub setpoint_id: String,
    /// Written in order right after every target write, in the same transaction
    pub move_commands: Vec<Command>,
    /// Register reporting the actual position or value
    pub readback_id: String,
    /// How close the readback must get to count as arrived
    pub tolerance: f64,
    /// Written in order when a run stops or aborts
    pub stop_commands: Vec<Command>,
    /// Bounds of the target
    pub limits: SetpointLimits,
}

impl Axis {
    /// Copley stepper drive: `s r0xca <pos>`, `t 1` to move, `g r0x30` to read,
    /// `t 0` to stop.
    pub fn copley_stepper(limits: SetpointLimits) -> Self {
        Self {
            name: "stepper".to_string(),
            setpoint_id: "r0xca".to_string(),
            move_commands: vec![Command::new("t", 1.0)],
            readback_id: "r0x30".to_string(),
            tolerance: 0.5,
            stop_commands: vec![Command::new("t", 0.0)],
            limits,
        }
    }

    /// Magnet supply current. Every current write is followed by the voltage
    /// limit `sour:volt <voltage_limit>`; stopping zeroes current and voltage.
    pub fn magnet_current(limits: SetpointLimits, voltage_limit: f64) -> Self {
        Self {
            name: "magnet".to_string(),
            setpoint_id: "sour:curr".to_string(),
            move_commands: vec![Command::new("sour:volt", voltage_limit)],
            readback_id: "meas:curr".to_string(),
            tolerance: 0.01,
            stop_commands: vec![Command::new("sour:curr", 0.0), Command::new("sour:volt", 0.0)],
            limits,
        }
    }

    /// Ionizer current on the PLC. Stopping leaves the current where it is.
    pub fn ionizer_current(limits: SetpointLimits) -> Self {
        Self {
            name: "ionizer".to_string(),
            setpoint_id: nodes::IONIZER_CURRENT_WRITE.to_string(),
            move_commands: Vec::new(),
            readback_id: nodes::IONIZER_CURRENT_READ.to_string(),
            tolerance: 0.05,
            stop_commands: Vec::new(),
            limits,
        }
    }

    /// True once `position` is within tolerance of `target`.
    pub fn at_target(&self, position: f64, target: f64) -> bool {
        (position - target).abs() <= self.tolerance
    }
}
