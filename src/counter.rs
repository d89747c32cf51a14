//! External event counters for count-gated dwells.
//!
//! The trigger gate only sees a number that grows over time. Where that number
//! comes from is up to the [`EventCounter`] implementation. On the beamline it is
//! the count of measurement files the acquisition PC drops into a shared directory.

use crate::error::{ControlError, ControlResult};
use async_trait::async_trait;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Monotonic non-decreasing event count within a run.
#[async_trait]
pub trait EventCounter: Send + Sync {
    /// Current total.
    async fn count(&self) -> ControlResult<u32>;
}

/// Counts files in a directory whose names match a glob-style pattern.
///
/// Only `*` and `?` wildcards in the file-name part are supported, e.g.
/// `/mnt/current analysis/*.blk`.
#[derive(Debug, Clone)]
pub struct ArtifactCounter {
    dir: PathBuf,
    name: Regex,
}

impl ArtifactCounter {
    /// Build from a pattern such as `/data/run/*.blk`.
    pub fn from_pattern(pattern: &str) -> ControlResult<Self> {
        let path = Path::new(pattern);
        let file_pattern = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                ControlError::Configuration(format!("artifact pattern '{pattern}' has no file name"))
            })?;
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();

        Ok(Self {
            dir,
            name: glob_to_regex(file_pattern)?,
        })
    }

    /// Directory being watched.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn count_blocking(dir: &Path, name: &Regex) -> ControlResult<u32> {
        let entries = std::fs::read_dir(dir).map_err(|e| {
            ControlError::hardware(format!("cannot list {}: {e}", dir.display()))
        })?;
        let mut total = 0u32;
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if name.is_match(&entry.file_name().to_string_lossy()) {
                total = total.saturating_add(1);
            }
        }
        Ok(total)
    }
}

fn glob_to_regex(pattern: &str) -> ControlResult<Regex> {
    let mut expr = String::from("^");
    for c in pattern.chars() {
        match c {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            other => expr.push_str(&regex::escape(&other.to_string())),
        }
    }
    expr.push('$');
    Regex::new(&expr)
        .map_err(|e| ControlError::Configuration(format!("bad artifact pattern '{pattern}': {e}")))
}

#[async_trait]
impl EventCounter for ArtifactCounter {
    async fn count(&self) -> ControlResult<u32> {
        let dir = self.dir.clone();
        let name = self.name.clone();
        tokio::task::spawn_blocking(move || Self::count_blocking(&dir, &name))
            .await
            .map_err(|e| ControlError::hardware(format!("artifact count task failed: {e}")))?
    }
}

/// In-process counter driven by code. Clones share the same total.
#[derive(Debug, Clone, Default)]
pub struct ManualCounter {
    value: Arc<AtomicU32>,
}

impl ManualCounter {
    /// Counter starting at `initial`.
    pub fn new(initial: u32) -> Self {
        Self {
            value: Arc::new(AtomicU32::new(initial)),
        }
    }

    /// Add `n` events.
    pub fn advance(&self, n: u32) {
        self.value.fetch_add(n, Ordering::SeqCst);
    }

    /// Current total without going through the trait.
    pub fn get(&self) -> u32 {
        self.value.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventCounter for ManualCounter {
    async fn count(&self) -> ControlResult<u32> {
        Ok(self.get())
    }
}
