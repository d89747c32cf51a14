//! Crash-safe persistence of the last confirmed setpoint.
//!
//! A single record `{value, written_at}` is overwritten after every successfully
//! applied ramp step and on clean shutdown. At startup the record is read once and
//! re-applied only after the operator confirms.
//!
//! The file format is JSON. Older installs wrote a bare number with three decimals;
//! that format is still accepted on load, with the file's modification time used as
//! the timestamp.

use crate::error::{ControlError, ControlResult};
use crate::hardware::ChannelArbiter;
use crate::safety::{Confirmer, GuardedAction, SafetyPolicy, SetpointLimits};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};

/// Last successfully applied setpoint.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FailsafeRecord {
    /// Applied value
    pub value: f64,
    /// When it was applied
    pub written_at: DateTime<Utc>,
}

impl FailsafeRecord {
    /// Record stamped with the current time.
    pub fn now(value: f64) -> Self {
        Self {
            value,
            written_at: Utc::now(),
        }
    }
}

/// Durable single-value store.
#[async_trait]
pub trait FailsafeStore: Send + Sync {
    /// Read the record, `None` if nothing was ever persisted.
    async fn load(&self) -> ControlResult<Option<FailsafeRecord>>;

    /// Overwrite the record.
    async fn save(&self, value: f64) -> ControlResult<FailsafeRecord>;

    /// Read the record, creating a `0.0` record if none exists.
    async fn load_or_init(&self) -> ControlResult<FailsafeRecord> {
        match self.load().await? {
            Some(record) => Ok(record),
            None => {
                info!("No failsafe record found, creating default 0.0");
                self.save(0.0).await
            }
        }
    }
}

/// JSON file store with atomic replace.
#[derive(Debug, Clone)]
pub struct FileFailsafeStore {
    path: PathBuf,
}

impl FileFailsafeStore {
    /// Store at `path`. Nothing is touched until the first load or save.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the record.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persistence(&self, what: &str, err: impl std::fmt::Display) -> ControlError {
        ControlError::Persistence(format!("{what} {}: {err}", self.path.display()))
    }

    async fn parse(&self, text: &str) -> ControlResult<FailsafeRecord> {
        if let Ok(record) = serde_json::from_str::<FailsafeRecord>(text) {
            return Ok(record);
        }
        let value: f64 = text
            .trim()
            .parse()
            .map_err(|e| self.persistence("cannot parse", e))?;
        let written_at = tokio::fs::metadata(&self.path)
            .await
            .and_then(|m| m.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        Ok(FailsafeRecord { value, written_at })
    }
}

#[async_trait]
impl FailsafeStore for FileFailsafeStore {
    async fn load(&self) -> ControlResult<Option<FailsafeRecord>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => Ok(Some(self.parse(&text).await?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(self.persistence("cannot read", e)),
        }
    }

    async fn save(&self, value: f64) -> ControlResult<FailsafeRecord> {
        let record = FailsafeRecord::now(value);
        let json = serde_json::to_string_pretty(&record)
            .map_err(|e| self.persistence("cannot encode", e))?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.persistence("cannot create directory for", e))?;
        }
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| self.persistence("cannot write", e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| self.persistence("cannot replace", e))?;
        Ok(record)
    }
}

/// Volatile store for tests and simulation.
#[derive(Debug, Default)]
pub struct MemoryFailsafeStore {
    record: Mutex<Option<FailsafeRecord>>,
    saves: Mutex<usize>,
}

impl MemoryFailsafeStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-loaded with `value`.
    pub fn with_value(value: f64) -> Self {
        Self {
            record: Mutex::new(Some(FailsafeRecord::now(value))),
            saves: Mutex::new(0),
        }
    }

    /// Last persisted value.
    pub fn value(&self) -> Option<f64> {
        let record = *self.record.lock().unwrap_or_else(|p| p.into_inner());
        record.map(|r| r.value)
    }

    /// Number of saves so far.
    pub fn save_count(&self) -> usize {
        *self.saves.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl FailsafeStore for MemoryFailsafeStore {
    async fn load(&self) -> ControlResult<Option<FailsafeRecord>> {
        Ok(*self.record.lock().unwrap_or_else(|p| p.into_inner()))
    }

    async fn save(&self, value: f64) -> ControlResult<FailsafeRecord> {
        let record = FailsafeRecord::now(value);
        *self.record.lock().unwrap_or_else(|p| p.into_inner()) = Some(record);
        *self.saves.lock().unwrap_or_else(|p| p.into_inner()) += 1;
        Ok(record)
    }
}

/// Re-apply the persisted value at startup.
///
/// The value is range-checked first, then the operator must confirm. Declining
/// leaves the hardware untouched and returns `ConfirmationDeclined`.
pub async fn restore_failsafe(
    store: &dyn FailsafeStore,
    policy: &SafetyPolicy,
    limits: &SetpointLimits,
    confirmer: &dyn Confirmer,
    arbiter: &ChannelArbiter,
    output_id: &str,
) -> ControlResult<f64> {
    let record = store.load_or_init().await?;
    let value = policy.validate(limits, record.value).map_err(|e| {
        warn!(value = record.value, "Stored failsafe value out of bounds, not restoring");
        e
    })?;

    let detail = format!(
        "{value:.3} {} (saved {})",
        limits.unit,
        record.written_at.format("%Y-%m-%d %H:%M:%S")
    );
    policy
        .confirm(GuardedAction::RestoreFailsafe, confirmer, &detail)
        .await?;

    arbiter
        .manual_write_value("failsafe-restore", output_id, value)
        .await?;
    info!(value, "Failsafe value restored");
    Ok(value)
}
