//! Tracing subscriber setup.

use crate::config::{ApplicationConfig, LogFormat};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Filter used when `RUST_LOG` is unset: the configured level for this crate,
/// warnings from everything else.
pub fn default_filter(level: &str) -> String {
    format!("warn,beamline_ctl={level}")
}

/// Install the global subscriber. `RUST_LOG` takes precedence over
/// `application.log_level`; `format` overrides `application.log_format`.
///
/// Calling this twice is harmless; the second call leaves the first subscriber in
/// place.
pub fn init(app: &ApplicationConfig, format: Option<LogFormat>) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(&app.log_level)));

    let registry = tracing_subscriber::registry().with(filter);
    let result = match format.unwrap_or(app.log_format) {
        LogFormat::Pretty => registry.with(fmt::layer().with_target(false)).try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(true))
            .try_init(),
    };
    if result.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_parses() {
        let directive = default_filter("debug");
        assert_eq!(directive, "warn,beamline_ctl=debug");
        assert!(EnvFilter::try_new(directive).is_ok());
    }
}
