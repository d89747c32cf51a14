//! Write token for exclusive channel access
//!
//! A channel is owned by at most one of {manual control, ramp, sequencer} at a time.
//! Ownership is tracked by holder name and released by an RAII [`ChannelLease`].
//! Independently of ownership, every individual operation holds an I/O mutex, so a
//! multi-write transaction (set position, then start move) cannot interleave with
//! anything else, including an emergency write.
//!
//! Manual writes are rejected with `ChannelBusy` while a lease is held. Emergency
//! writes ignore ownership and only wait for the single in-flight operation.

use crate::error::{ControlError, ControlResult};
use crate::hardware::HardwareChannel;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

/// Shared handle to a channel plus its write token.
#[derive(Clone)]
pub struct ChannelArbiter {
    channel: Arc<dyn HardwareChannel>,
    io: Arc<Mutex<()>>,
    owner: Arc<StdMutex<Option<String>>>,
}

impl ChannelArbiter {
    /// Wrap a channel. Nobody owns it initially.
    pub fn new(channel: Arc<dyn HardwareChannel>) -> Self {
        Self {
            channel,
            io: Arc::new(Mutex::new(())),
            owner: Arc::new(StdMutex::new(None)),
        }
    }

    fn owner_slot(&self) -> StdMutexGuard<'_, Option<String>> {
        self.owner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take exclusive write ownership.
    ///
    /// # Errors
    /// `ChannelBusy` if another holder owns the channel.
    pub fn lease(&self, holder: &str) -> ControlResult<ChannelLease> {
        let mut owner = self.owner_slot();
        if let Some(current) = owner.as_ref() {
            return Err(ControlError::ChannelBusy {
                owner: current.clone(),
                requested_by: holder.to_string(),
            });
        }
        *owner = Some(holder.to_string());
        debug!(holder, "Channel lease acquired");

        Ok(ChannelLease {
            inner: Arc::new(LeaseInner {
                arbiter: self.clone(),
                holder: holder.to_string(),
            }),
        })
    }

    /// True when no lease is held.
    pub fn is_available(&self) -> bool {
        self.owner_slot().is_none()
    }

    /// Current lease holder, if any.
    pub fn current_owner(&self) -> Option<String> {
        self.owner_slot().clone()
    }

    /// Reads are allowed for everyone but still serialize with writes.
    pub async fn read_value(&self, id: &str) -> ControlResult<f64> {
        let _io = self.io.lock().await;
        self.channel.read_value(id).await
    }

    /// Discrete read.
    pub async fn read_bool(&self, id: &str) -> ControlResult<bool> {
        let _io = self.io.lock().await;
        self.channel.read_bool(id).await
    }

    fn ensure_unleased(&self, requested_by: &str) -> ControlResult<()> {
        match self.owner_slot().as_ref() {
            Some(owner) => Err(ControlError::ChannelBusy {
                owner: owner.clone(),
                requested_by: requested_by.to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Single analog write from manual control. Rejected while leased.
    pub async fn manual_write_value(
        &self,
        requested_by: &str,
        id: &str,
        value: f64,
    ) -> ControlResult<()> {
        let _io = self.io.lock().await;
        // Checked under the I/O lock so a lease taken while we waited is honored.
        self.ensure_unleased(requested_by)?;
        self.channel.write_value(id, value).await
    }

    /// Single discrete write from manual control. Rejected while leased.
    pub async fn manual_write_bool(
        &self,
        requested_by: &str,
        id: &str,
        value: bool,
    ) -> ControlResult<()> {
        let _io = self.io.lock().await;
        self.ensure_unleased(requested_by)?;
        self.channel.write_bool(id, value).await
    }

    /// Write that ignores ownership. Waits only for the operation in flight.
    pub async fn emergency_write_value(&self, id: &str, value: f64) -> ControlResult<()> {
        let _io = self.io.lock().await;
        info!(id, value, owner = ?self.current_owner(), "Emergency write");
        self.channel.write_value(id, value).await
    }
}

/// Exclusive write ownership.
///
/// Clones share the same ownership; it is released when the last clone drops.
#[derive(Clone)]
pub struct ChannelLease {
    inner: Arc<LeaseInner>,
}

struct LeaseInner {
    arbiter: ChannelArbiter,
    holder: String,
}

impl ChannelLease {
    /// Name this lease was taken under.
    pub fn holder(&self) -> &str {
        &self.inner.holder
    }

    /// The arbiter this lease belongs to.
    pub fn arbiter(&self) -> &ChannelArbiter {
        &self.inner.arbiter
    }

    /// One analog write under the token.
    pub async fn write_value(&self, id: &str, value: f64) -> ControlResult<()> {
        let arbiter = self.arbiter();
        let _io = arbiter.io.lock().await;
        arbiter.channel.write_value(id, value).await
    }

    /// One discrete write under the token.
    pub async fn write_bool(&self, id: &str, value: bool) -> ControlResult<()> {
        let arbiter = self.arbiter();
        let _io = arbiter.io.lock().await;
        arbiter.channel.write_bool(id, value).await
    }

    /// Analog read.
    pub async fn read_value(&self, id: &str) -> ControlResult<f64> {
        self.arbiter().read_value(id).await
    }

    /// Hold the I/O mutex across several operations.
    pub async fn transaction(&self) -> ChannelTransaction<'_> {
        let arbiter = self.arbiter();
        ChannelTransaction {
            channel: arbiter.channel.as_ref(),
            _io: arbiter.io.lock().await,
        }
    }
}

impl Drop for LeaseInner {
    fn drop(&mut self) {
        let mut owner = self.arbiter.owner_slot();
        if owner.as_deref() == Some(self.holder.as_str()) {
            *owner = None;
            debug!(holder = %self.holder, "Channel lease released");
        }
    }
}

/// Several operations that must not be interleaved with anyone else's.
pub struct ChannelTransaction<'a> {
    channel: &'a dyn HardwareChannel,
    _io: MutexGuard<'a, ()>,
}

impl ChannelTransaction<'_> {
    /// Analog write inside the transaction.
    pub async fn write_value(&self, id: &str, value: f64) -> ControlResult<()> {
        self.channel.write_value(id, value).await
    }

    /// Analog read inside the transaction.
    pub async fn read_value(&self, id: &str) -> ControlResult<f64> {
        self.channel.read_value(id).await
    }
}
