//! Configuration System using Figment
//!
//! Configuration is loaded from:
//! 1. `config/beamline.toml` (base configuration)
//! 2. Environment variables (prefixed with `BEAMLINE_`)
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated by a double underscore:
//!
//! ```text
//! BEAMLINE_APPLICATION__LOG_LEVEL=debug
//! BEAMLINE_STEPPER__HOST=192.168.0.16
//! BEAMLINE_HARDWARE__BACKEND=mock
//! ```
//!
//! Every field has a default, so an empty or missing file yields a usable
//! configuration pointing at the lab's usual endpoints.

use crate::safety::SetpointLimits;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File or environment could not be parsed into the configuration tree
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    /// Values parsed but are logically invalid
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Ramp engine defaults
    #[serde(default)]
    pub ramp: RampConfig,
    /// Step sequencer timing
    #[serde(default)]
    pub sequencer: SequencerConfig,
    /// Artifact counter used by event-count dwells
    #[serde(default)]
    pub trigger: TriggerConfig,
    /// Failsafe persistence
    #[serde(default)]
    pub failsafe: FailsafeConfig,
    /// Bounded setpoints by name
    #[serde(default = "default_setpoints")]
    pub setpoints: BTreeMap<String, SetpointLimits>,
    /// Hardware backend selection
    #[serde(default)]
    pub hardware: HardwareConfig,
    /// Stepper motor controller endpoint
    #[serde(default = "default_stepper")]
    pub stepper: SocketEndpoint,
    /// Magnet power supply endpoint
    #[serde(default = "default_magnet")]
    pub magnet: SocketEndpoint,
    /// Magnet supply output settings
    #[serde(default)]
    pub supply: SupplyConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format
    #[serde(default)]
    pub log_format: LogFormat,
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable, colored
    #[default]
    Pretty,
    /// One JSON object per event
    Json,
}

/// Ramp engine defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RampConfig {
    /// Interval between ramp ticks
    #[serde(default = "default_tick_interval", with = "humantime_serde")]
    pub tick_interval: Duration,
    /// Default ramp rate in setpoint units per minute
    #[serde(default = "default_rate_per_minute")]
    pub max_rate_per_minute: f64,
}

/// Step sequencer timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequencerConfig {
    /// Position poll cadence while moving
    #[serde(default = "default_move_poll", with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Hard limit on how long a single move may take
    #[serde(default = "default_move_timeout", with = "humantime_serde")]
    pub move_timeout: Duration,
    /// Stepper arrival tolerance in counts
    #[serde(default = "default_position_tolerance")]
    pub position_tolerance: f64,
}

/// Event-count trigger source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerConfig {
    /// Glob-style pattern of artifact files, e.g. `/data/current analysis/*.blk`
    #[serde(default = "default_artifact_pattern")]
    pub artifact_pattern: String,
    /// Dwell poll cadence
    #[serde(default = "default_dwell_poll", with = "humantime_serde")]
    pub poll_interval: Duration,
}

/// Failsafe persistence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailsafeConfig {
    /// File holding the last confirmed setpoint
    #[serde(default = "default_failsafe_path")]
    pub path: PathBuf,
}

/// Magnet supply output settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupplyConfig {
    /// Voltage limit written after every current write, in V. Checked against
    /// the `magnet_voltage` setpoint.
    #[serde(default = "default_voltage_limit")]
    pub voltage_limit: f64,
}

/// Which `HardwareChannel` implementation backs the CLI
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// In-memory simulated actuators
    #[default]
    Mock,
    /// TCP ASCII controllers
    Socket,
}

/// Hardware backend selection
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HardwareConfig {
    /// Backend used by the CLI
    #[serde(default)]
    pub backend: Backend,
}

/// TCP endpoint of an ASCII controller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketEndpoint {
    /// Host name or IP address
    pub host: String,
    /// TCP port
    pub port: u16,
    /// Per-command round-trip timeout
    #[serde(default = "default_socket_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl SocketEndpoint {
    /// `host:port` form for connecting
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_app_name() -> String {
    "Beamline Control".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_tick_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_rate_per_minute() -> f64 {
    1.0
}

fn default_move_poll() -> Duration {
    Duration::from_secs(1)
}

fn default_move_timeout() -> Duration {
    Duration::from_secs(20)
}

fn default_position_tolerance() -> f64 {
    0.5
}

fn default_artifact_pattern() -> String {
    "/mnt/current analysis/*.blk".to_string()
}

fn default_dwell_poll() -> Duration {
    Duration::from_secs(1)
}

fn default_failsafe_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ionizer_current_failsafe.json")
}

fn default_socket_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_stepper() -> SocketEndpoint {
    SocketEndpoint {
        host: "192.168.0.6".to_string(),
        port: 102,
        timeout: default_socket_timeout(),
    }
}

fn default_magnet() -> SocketEndpoint {
    SocketEndpoint {
        host: "192.168.0.5".to_string(),
        port: 8462,
        timeout: default_socket_timeout(),
    }
}

fn default_voltage_limit() -> f64 {
    60.0
}

fn default_setpoints() -> BTreeMap<String, SetpointLimits> {
    let mut map = BTreeMap::new();
    map.insert(
        "ionizer_current".to_string(),
        SetpointLimits::new(0.0, 23.0, "A").with_max_rate_per_second(1.0 / 60.0),
    );
    map.insert(
        "magnet_current".to_string(),
        SetpointLimits::new(0.0, 120.0, "A"),
    );
    map.insert(
        "magnet_voltage".to_string(),
        SetpointLimits::new(0.0, 100.0, "V"),
    );
    map.insert(
        "stepper_position".to_string(),
        SetpointLimits::new(-2_000_000.0, 2_000_000.0, "counts"),
    );
    map
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            application: ApplicationConfig::default(),
            ramp: RampConfig::default(),
            sequencer: SequencerConfig::default(),
            trigger: TriggerConfig::default(),
            failsafe: FailsafeConfig::default(),
            setpoints: default_setpoints(),
            hardware: HardwareConfig::default(),
            stepper: default_stepper(),
            magnet: default_magnet(),
            supply: SupplyConfig::default(),
        }
    }
}

impl Default for SupplyConfig {
    fn default() -> Self {
        Self {
            voltage_limit: default_voltage_limit(),
        }
    }
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

impl Default for RampConfig {
    fn default() -> Self {
        Self {
            tick_interval: default_tick_interval(),
            max_rate_per_minute: default_rate_per_minute(),
        }
    }
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_move_poll(),
            move_timeout: default_move_timeout(),
            position_tolerance: default_position_tolerance(),
        }
    }
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            artifact_pattern: default_artifact_pattern(),
            poll_interval: default_dwell_poll(),
        }
    }
}

impl Default for FailsafeConfig {
    fn default() -> Self {
        Self {
            path: default_failsafe_path(),
        }
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl Settings {
    /// Load `config/beamline.toml` overlaid with `BEAMLINE_` environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config/beamline.toml")
    }

    /// Load configuration from a specific file path.
    ///
    /// A missing file is not an error; defaults and environment overrides still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("BEAMLINE_").split("__"))
            .extract()
            .map_err(ConfigError::LoadError)?;

        config.validate()?;
        Ok(config)
    }

    /// Look up a named setpoint.
    pub fn setpoint(&self, name: &str) -> Result<&SetpointLimits, ConfigError> {
        self.setpoints
            .get(name)
            .ok_or_else(|| ConfigError::ValidationError(format!("Unknown setpoint '{name}'")))
    }

    /// Check values that parse but make no physical sense.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.ramp.tick_interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "ramp.tick_interval must be greater than zero".to_string(),
            ));
        }
        let rate = self.ramp.max_rate_per_minute;
        if !rate.is_finite() || rate <= 0.0 {
            return Err(ConfigError::ValidationError(format!(
                "ramp.max_rate_per_minute must be positive, got {}",
                self.ramp.max_rate_per_minute
            )));
        }
        if self.sequencer.poll_interval.is_zero() || self.trigger.poll_interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "poll intervals must be greater than zero".to_string(),
            ));
        }
        if self.sequencer.move_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "sequencer.move_timeout must be greater than zero".to_string(),
            ));
        }
        let tolerance = self.sequencer.position_tolerance;
        if !tolerance.is_finite() || tolerance < 0.0 {
            return Err(ConfigError::ValidationError(format!(
                "sequencer.position_tolerance must be non-negative, got {tolerance}"
            )));
        }

        for (name, limits) in &self.setpoints {
            limits.check().map_err(|e| {
                ConfigError::ValidationError(format!("setpoint '{name}': {e}"))
            })?;
        }
        let voltage = self.supply.voltage_limit;
        let in_range = match self.setpoints.get("magnet_voltage") {
            Some(limits) => limits.contains(voltage),
            None => voltage.is_finite() && voltage >= 0.0,
        };
        if !in_range {
            return Err(ConfigError::ValidationError(format!(
                "supply.voltage_limit {voltage} V is outside the magnet_voltage setpoint"
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.stepper.address(), "192.168.0.6:102");
        assert_eq!(settings.ramp.tick_interval, Duration::from_millis(100));
        assert_eq!(settings.setpoint("ionizer_current").map(|s| s.max).ok(), Some(23.0));
    }

    #[test]
    #[serial]
    fn test_load_from_file_with_humantime() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[ramp]
tick_interval = "250ms"
max_rate_per_minute = 2.0

[sequencer]
move_timeout = "30s"

[setpoints.ionizer_current]
min = 0.0
max = 20.0
unit = "A"
"#
        )
        .unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.ramp.tick_interval, Duration::from_millis(250));
        assert_eq!(settings.sequencer.move_timeout, Duration::from_secs(30));
        assert_eq!(settings.setpoint("ionizer_current").unwrap().max, 20.0);
    }

    #[test]
    #[serial]
    fn test_env_override() {
        std::env::set_var("BEAMLINE_APPLICATION__LOG_LEVEL", "debug");
        let settings = Settings::load_from("does/not/exist.toml");
        std::env::remove_var("BEAMLINE_APPLICATION__LOG_LEVEL");
        assert_eq!(settings.unwrap().application.log_level, "debug");
    }

    #[test]
    fn test_rejects_bad_log_level() {
        let mut settings = Settings::default();
        settings.application.log_level = "verbose".to_string();
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_rejects_inverted_bounds() {
        let mut settings = Settings::default();
        settings
            .setpoints
            .insert("bad".to_string(), SetpointLimits::new(5.0, 1.0, "V"));
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("bad"));
    }

    #[test]
    fn test_voltage_limit_checked_against_setpoint() {
        let mut settings = Settings::default();
        assert_eq!(settings.supply.voltage_limit, 60.0);
        settings.supply.voltage_limit = 150.0;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("voltage_limit"));
    }

    #[test]
    fn test_rejects_zero_rate() {
        let mut settings = Settings::default();
        settings.ramp.max_rate_per_minute = 0.0;
        assert!(settings.validate().is_err());
    }
}
