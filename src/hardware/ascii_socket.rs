//! Line-oriented ASCII controllers over TCP.
//!
//! Two dialects are spoken on the beamline:
//!
//! - **Copley stepper** (`192.168.0.6:102`): every command is acknowledged.
//!   `s r0xca <pos>` sets the target and `t <n>` triggers a move (1 = start,
//!   0 = stop, 2 = home); both must be answered with `ok`. `g r0x30` reads the
//!   position, answered with `v <pos>`.
//! - **SCPI supply** (`192.168.0.5:8462`): `sour:curr <A>` and `sour:volt <V>`
//!   are fire-and-forget; queries end in `?` and return a bare number.
//!
//! Commands are terminated with `\n`. Each round trip runs under the configured
//! timeout; on any failure the connection is dropped and re-established on the
//! next call.

use crate::error::{ControlError, ControlResult};
use crate::hardware::HardwareChannel;
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Command dialect spoken by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsciiDialect {
    /// Copley-style stepper drive
    CopleyStepper,
    /// SCPI power supply
    ScpiSupply,
}

/// A command encoded for the wire, plus what to expect back.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Encoded {
    pub(crate) line: String,
    pub(crate) expects_reply: bool,
}

impl AsciiDialect {
    pub(crate) fn encode_write(&self, id: &str, value: f64) -> Encoded {
        match self {
            AsciiDialect::CopleyStepper => {
                let line = if id.starts_with("r0x") {
                    format!("s {id} {}", value.round() as i64)
                } else {
                    format!("{id} {}", value.round() as i64)
                };
                Encoded {
                    line,
                    expects_reply: true,
                }
            }
            AsciiDialect::ScpiSupply => {
                let line = if id.ends_with("curr") {
                    format!("{id} {value:.4}")
                } else {
                    format!("{id} {value:.3}")
                };
                Encoded {
                    line,
                    expects_reply: false,
                }
            }
        }
    }

    pub(crate) fn encode_read(&self, id: &str) -> Encoded {
        let line = match self {
            AsciiDialect::CopleyStepper => format!("g {id}"),
            AsciiDialect::ScpiSupply if id.ends_with('?') => id.to_string(),
            AsciiDialect::ScpiSupply => format!("{id}?"),
        };
        Encoded {
            line,
            expects_reply: true,
        }
    }

    pub(crate) fn check_ack(&self, command: &str, reply: Option<&str>) -> ControlResult<()> {
        match (self, reply) {
            (AsciiDialect::ScpiSupply, _) => Ok(()),
            (AsciiDialect::CopleyStepper, Some("ok")) => Ok(()),
            (AsciiDialect::CopleyStepper, other) => Err(ControlError::hardware(format!(
                "'{command}' not acknowledged: {other:?}"
            ))),
        }
    }

    pub(crate) fn parse_value(&self, command: &str, reply: &str) -> ControlResult<f64> {
        let number = match self {
            AsciiDialect::CopleyStepper => reply.strip_prefix("v ").ok_or_else(|| {
                ControlError::hardware(format!("'{command}' returned '{reply}'"))
            })?,
            AsciiDialect::ScpiSupply => reply,
        };
        number.trim().parse::<f64>().map_err(|e| {
            ControlError::hardware(format!("'{command}' returned '{reply}': {e}"))
        })
    }
}

/// TCP client for one ASCII controller.
pub struct AsciiSocketChannel {
    address: String,
    timeout: Duration,
    dialect: AsciiDialect,
    stream: Mutex<Option<BufReader<TcpStream>>>,
}

impl AsciiSocketChannel {
    /// Create a client. The connection is opened on first use.
    pub fn new(address: impl Into<String>, timeout: Duration, dialect: AsciiDialect) -> Self {
        Self {
            address: address.into(),
            timeout,
            dialect,
            stream: Mutex::new(None),
        }
    }

    /// Open the connection now instead of on first use.
    pub async fn connect(&self) -> ControlResult<()> {
        let mut stream = self.stream.lock().await;
        if stream.is_none() {
            *stream = Some(self.open().await?);
        }
        Ok(())
    }

    async fn open(&self) -> ControlResult<BufReader<TcpStream>> {
        let socket = timeout(self.timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| {
                ControlError::hardware(format!("connect to {} timed out", self.address))
            })??;
        debug!(address = %self.address, "Connected");
        Ok(BufReader::new(socket))
    }

    async fn round_trip(&self, encoded: &Encoded) -> ControlResult<Option<String>> {
        let mut slot = self.stream.lock().await;
        if slot.is_none() {
            *slot = Some(self.open().await?);
        }
        let Some(stream) = slot.as_mut() else {
            return Err(ControlError::hardware("connection unavailable"));
        };

        let result = timeout(self.timeout, async {
            stream
                .get_mut()
                .write_all(format!("{}\n", encoded.line).as_bytes())
                .await?;
            if !encoded.expects_reply {
                return Ok::<_, std::io::Error>(None);
            }
            let mut reply = String::new();
            let n = stream.read_line(&mut reply).await?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed by controller",
                ));
            }
            Ok(Some(reply.trim().to_string()))
        })
        .await;

        match result {
            Ok(Ok(reply)) => {
                debug!(command = %encoded.line, ?reply, "Round trip");
                Ok(reply)
            }
            Ok(Err(e)) => {
                *slot = None;
                warn!(command = %encoded.line, error = %e, "Round trip failed, dropping connection");
                Err(ControlError::hardware(format!("'{}': {e}", encoded.line)))
            }
            Err(_) => {
                *slot = None;
                Err(ControlError::hardware(format!(
                    "'{}' timed out after {:?}",
                    encoded.line, self.timeout
                )))
            }
        }
    }
}

#[async_trait]
impl HardwareChannel for AsciiSocketChannel {
    async fn read_value(&self, id: &str) -> ControlResult<f64> {
        let encoded = self.dialect.encode_read(id);
        let reply = self.round_trip(&encoded).await?.unwrap_or_default();
        self.dialect.parse_value(&encoded.line, &reply)
    }

    async fn write_value(&self, id: &str, value: f64) -> ControlResult<()> {
        let encoded = self.dialect.encode_write(id, value);
        let reply = self.round_trip(&encoded).await?;
        self.dialect.check_ack(&encoded.line, reply.as_deref())
    }

    async fn read_bool(&self, id: &str) -> ControlResult<bool> {
        Err(ControlError::hardware(format!(
            "{:?} has no discrete channel '{id}'",
            self.dialect
        )))
    }

    async fn write_bool(&self, id: &str, _value: bool) -> ControlResult<()> {
        Err(ControlError::hardware(format!(
            "{:?} has no discrete channel '{id}'",
            self.dialect
        )))
    }
}
