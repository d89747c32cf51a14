//! Hardware channel abstraction.
//!
//! A [`HardwareChannel`] is a single logical read/write endpoint: OPC UA nodes on the
//! PLC, or commands on a raw ASCII socket. The control core never talks to a channel
//! directly for writes; it goes through a [`ChannelArbiter`], which owns the write
//! token.
//!
//! Errors from a channel are opaque. Any failure is reported as
//! `ControlError::HardwareIo` and treated as "the round trip failed".

use crate::error::ControlResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod arbiter;
pub mod ascii_socket;
pub mod mock;

pub use arbiter::{ChannelArbiter, ChannelLease, ChannelTransaction};
pub use ascii_socket::{AsciiDialect, AsciiSocketChannel};
pub use mock::MockChannel;

/// Read/write endpoint for analog and discrete values.
///
/// Every call is one synchronous round trip bounded by the backend's timeout.
#[async_trait]
pub trait HardwareChannel: Send + Sync {
    /// Read an analog value.
    async fn read_value(&self, id: &str) -> ControlResult<f64>;

    /// Write an analog value. `Ok` means the device acknowledged the write.
    async fn write_value(&self, id: &str, value: f64) -> ControlResult<()>;

    /// Read a discrete actuator.
    async fn read_bool(&self, id: &str) -> ControlResult<bool>;

    /// Write a discrete actuator.
    async fn write_bool(&self, id: &str, value: bool) -> ControlResult<()>;
}

/// A single analog write used as a command (`t 1`, `sour:volt 60`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Register or command id
    pub id: String,
    /// Value written
    pub value: f64,
}

impl Command {
    /// Command writing `value` to `id`.
    pub fn new(id: impl Into<String>, value: f64) -> Self {
        Self {
            id: id.into(),
            value,
        }
    }
}

/// PLC node identifiers used by the ionizer and maintenance panels.
pub mod nodes {
    /// Ionizer current readback
    pub const IONIZER_CURRENT_READ: &str = "ns=3;s=OPC_1.PLC_HV/Analog_In/In_Cal_Ionisierer";
    /// Ionizer current setpoint
    pub const IONIZER_CURRENT_WRITE: &str = "ns=3;s=OPC_1.PLC_HV/Analog_Out/Out_Cal_Ionisierer";
    /// Vent valve
    pub const VENT: &str = "ns=3;s=OPC_1.PLC_HV/Digital_Out/Vent";
    /// Valve between pump and source
    pub const PUMP_VALVE: &str = "ns=3;s=OPC_1.PLC_HV/Digital_Out/Valve_Pump";
}
