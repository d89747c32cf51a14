//! Named positions file.
//!
//! One position per line: a name (which may contain spaces) followed by the value as
//! the last whitespace-separated token. `#` starts a comment; blank lines are skipped.
//!
//! ```text
//! # sample wheel
//! Target A   12000
//! Blank      -3500   # empty holder
//! ```

use crate::error::{ControlError, ControlResult};
use crate::sequencer::{Motion, SequenceStep};
use crate::trigger::TriggerSpec;
use std::path::Path;
use std::str::FromStr;

/// A named base position.
#[derive(Debug, Clone, PartialEq)]
pub struct NamedPosition {
    /// Name as written in the file
    pub name: String,
    /// Base position
    pub position: f64,
}

/// Parse the file contents.
///
/// # Errors
/// `Configuration` naming the line for a missing or non-numeric value.
pub fn parse_positions(text: &str) -> ControlResult<Vec<NamedPosition>> {
    let mut positions = Vec::new();
    for (number, raw) in text.lines().enumerate() {
        let line = raw.split('#').next().unwrap_or_default().trim();
        if line.is_empty() {
            continue;
        }
        let (name, value) = line.rsplit_once(char::is_whitespace).ok_or_else(|| {
            ControlError::Configuration(format!("line {}: expected '<name> <value>'", number + 1))
        })?;
        let position = value.parse::<f64>().map_err(|e| {
            ControlError::Configuration(format!("line {}: bad value '{value}': {e}", number + 1))
        })?;
        positions.push(NamedPosition {
            name: name.trim().to_string(),
            position,
        });
    }
    Ok(positions)
}

/// Read and parse a positions file.
pub fn load_positions(path: &Path) -> ControlResult<Vec<NamedPosition>> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        ControlError::Configuration(format!("cannot read {}: {e}", path.display()))
    })?;
    parse_positions(&text)
}

/// One entry of an operator-assembled run: which position, how far off it, how long.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    /// Name from the positions file
    pub name: String,
    /// Manual offset added to the base position
    pub offset: f64,
    /// Dwell trigger
    pub trigger: TriggerSpec,
}

impl FromStr for Selection {
    type Err = ControlError;

    /// `name:offset:trigger`, e.g. `Target A:250:5files`. The name may itself
    /// contain colons; the last two fields are split off.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut fields = s.rsplitn(3, ':');
        let (Some(trigger), Some(offset), Some(name)) = (fields.next(), fields.next(), fields.next())
        else {
            return Err(ControlError::Configuration(format!(
                "expected 'name:offset:trigger', got '{s}'"
            )));
        };
        let offset = offset.trim().parse::<f64>().map_err(|e| {
            ControlError::Configuration(format!("bad offset '{offset}' in '{s}': {e}"))
        })?;
        Ok(Self {
            name: name.trim().to_string(),
            offset,
            trigger: trigger.parse()?,
        })
    }
}

/// Turn selections into direct-move sequence steps.
///
/// # Errors
/// `Configuration` for a name not present in `positions`.
pub fn build_steps(
    positions: &[NamedPosition],
    selections: &[Selection],
) -> ControlResult<Vec<SequenceStep>> {
    selections
        .iter()
        .map(|selection| {
            let base = positions
                .iter()
                .find(|p| p.name == selection.name)
                .ok_or_else(|| {
                    ControlError::Configuration(format!("unknown position '{}'", selection.name))
                })?;
            Ok(SequenceStep {
                label: selection.name.clone(),
                target: base.position + selection.offset,
                motion: Motion::Direct,
                trigger: selection.trigger,
            })
        })
        .collect()
}
