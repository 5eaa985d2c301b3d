//! Tracing setup for processes embedding the engine
//!
//! The filter gives the engine its own level, separate from the rest of the
//! process, and can raise the level inside the `race` and `ringback` spans
//! alone. That traces a single originate attempt without turning up every
//! other channel on the switch. A non-empty `RUST_LOG` replaces the computed
//! filter.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, EnvFilter};

use crate::errors::{OriginateError, Result};

/// Target of every event this crate emits.
pub const ENGINE_TARGET: &str = "softswitch_originate_core";
/// Span wrapping one race attempt.
pub const RACE_SPAN: &str = "race";
/// Span wrapping one ringback player.
pub const RINGBACK_SPAN: &str = "ringback";

/// Logging section of the engine configuration (`[logging]` in TOML).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Engine events outside the race and ringback spans.
    pub level: String,
    /// Everything else in the process.
    pub others: String,
    pub race: Option<String>,
    pub ringback: Option<String>,
    pub json: bool,
    /// Log open/close of race and ringback spans.
    pub span_events: bool,
    /// Extra `EnvFilter` directives, applied last.
    pub directives: Vec<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            others: "warn".to_string(),
            race: None,
            ringback: None,
            json: false,
            span_events: false,
            directives: Vec::new(),
        }
    }
}

impl LoggingConfig {
    pub fn with_level(mut self, level: LevelFilter) -> Self {
        self.level = level.to_string();
        self
    }

    /// Raise or lower logging inside race attempts only.
    pub fn trace_races(mut self, level: LevelFilter) -> Self {
        self.race = Some(level.to_string());
        self
    }

    pub fn trace_ringback(mut self, level: LevelFilter) -> Self {
        self.ringback = Some(level.to_string());
        self
    }

    pub fn with_json(mut self) -> Self {
        self.json = true;
        self
    }

    pub fn with_span_events(mut self) -> Self {
        self.span_events = true;
        self
    }

    pub fn with_directive(mut self, directive: impl Into<String>) -> Self {
        self.directives.push(directive.into());
        self
    }

    /// Filter directives in application order. Rejects unknown level names.
    pub fn filter_directives(&self) -> Result<Vec<String>> {
        let mut out = vec![
            parse_log_level(&self.others)?.to_string(),
            format!("{}={}", ENGINE_TARGET, parse_log_level(&self.level)?),
        ];
        for (span, level) in [(RACE_SPAN, &self.race), (RINGBACK_SPAN, &self.ringback)] {
            if let Some(level) = level {
                out.push(format!("{}[{}]={}", ENGINE_TARGET, span, parse_log_level(level)?));
            }
        }
        out.extend(self.directives.iter().cloned());
        Ok(out)
    }

    /// Build the filter, preferring `env` (the `RUST_LOG` value) when set.
    pub fn env_filter(&self, env: Option<&str>) -> Result<EnvFilter> {
        let spec = match env.map(str::trim).filter(|v| !v.is_empty()) {
            Some(env) => env.to_string(),
            None => self.filter_directives()?.join(","),
        };
        EnvFilter::try_new(&spec).map_err(|e| OriginateError::config(format!("Invalid log filter '{}': {}", spec, e)))
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn setup_logging(config: &LoggingConfig) -> Result<()> {
    let env = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let filter = config.env_filter(env.as_deref())?;

    let span_events = if config.span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };
    let builder = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_span_events(span_events);

    let installed = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| OriginateError::config(format!("logging already initialised: {}", e)))?;

    info!(
        "Originate engine v{} logging at {} (race: {}, ringback: {})",
        env!("CARGO_PKG_VERSION"),
        config.level,
        config.race.as_deref().unwrap_or("-"),
        config.ringback.as_deref().unwrap_or("-"),
    );
    Ok(())
}

/// Parse a level name; `off` is accepted.
pub fn parse_log_level(level: &str) -> Result<LevelFilter> {
    LevelFilter::from_str(level.trim()).map_err(|_| OriginateError::config(format!("Invalid log level: {}", level)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("debug").unwrap(), LevelFilter::DEBUG);
        assert_eq!(parse_log_level(" WARN").unwrap(), LevelFilter::WARN);
        assert_eq!(parse_log_level("off").unwrap(), LevelFilter::OFF);
        assert!(parse_log_level("chatty").is_err());
    }

    #[test]
    fn test_default_directives() {
        let directives = LoggingConfig::default().filter_directives().unwrap();
        assert_eq!(directives, vec!["warn".to_string(), format!("{}=info", ENGINE_TARGET)]);
    }

    #[test]
    fn test_span_directives() {
        let config = LoggingConfig::default()
            .with_level(LevelFilter::WARN)
            .trace_races(LevelFilter::DEBUG)
            .trace_ringback(LevelFilter::TRACE)
            .with_directive("hyper=off");
        let directives = config.filter_directives().unwrap();
        assert_eq!(
            directives,
            vec![
                "warn".to_string(),
                format!("{}=warn", ENGINE_TARGET),
                format!("{}[race]=debug", ENGINE_TARGET),
                format!("{}[ringback]=trace", ENGINE_TARGET),
                "hyper=off".to_string(),
            ]
        );
        assert!(config.env_filter(None).is_ok());
    }

    #[test]
    fn test_bad_levels_and_env_override() {
        let config = LoggingConfig {
            race: Some("loud".to_string()),
            ..Default::default()
        };
        assert!(config.filter_directives().is_err());
        assert!(config.env_filter(None).is_err());
        // RUST_LOG replaces the configured directives entirely
        assert!(config.env_filter(Some("debug")).is_ok());
        assert!(config.env_filter(Some("  ")).is_err());
    }

    #[test]
    fn test_logging_section_from_toml() {
        let config: LoggingConfig = toml::from_str(
            r#"
            level = "debug"
            race = "trace"
            json = true
            directives = ["tokio=warn"]
            "#,
        )
        .unwrap();
        assert_eq!(config.level, "debug");
        assert_eq!(config.race.as_deref(), Some("trace"));
        assert_eq!(config.others, "warn");
        assert!(config.json);
        assert!(!config.span_events);
        assert_eq!(config.filter_directives().unwrap().len(), 4);
    }
}
