//! Engine configuration and per-dial tuning
//!
//! [`EngineConfig`] holds engine-wide defaults and can be loaded from TOML.
//! [`DialTuning`] is resolved once per originate call from the merged variable
//! store. Out-of-range numeric tuning never fails a dial: the value is ignored
//! with a warning and the default is kept.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::Result;
use crate::logging::LoggingConfig;
use crate::types::CauseCode;
use crate::variables::{is_true, names, non_empty, parse_int, split_list, var_true, Variables};

/// Valid range for `originate_retries`.
pub const RETRIES_RANGE: std::ops::RangeInclusive<i64> = 1..=100;
/// Valid range for `originate_retry_sleep_ms`.
pub const RETRY_SLEEP_RANGE: std::ops::RangeInclusive<i64> = 500..=60000;

/// Engine-wide defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Race evaluation tick and notification coalescing window.
    pub tick_ms: u64,
    pub default_timeout_secs: u64,
    pub default_retries: u32,
    pub default_retry_sleep_ms: u64,
    pub max_peers: usize,
    pub confirm_read_timeout_ms: u64,
    /// Grace period for supervised tasks after a race ends.
    pub collector_shutdown_ms: u64,
    /// Default comfort noise level for `silence` ringback.
    pub silence_level: u32,
    pub logging: LoggingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_ms: 10,
            default_timeout_secs: 60,
            default_retries: 1,
            default_retry_sleep_ms: 1000,
            max_peers: crate::dialplan::MAX_PEERS,
            confirm_read_timeout_ms: 5000,
            collector_shutdown_ms: 1000,
            silence_level: 400,
            logging: LoggingConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        Ok(toml::from_str(input)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }
}

/// Group confirmation settings (`group_confirm_*`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmSpec {
    /// Digits to press, or `exec` to run the application named by `file`.
    pub key: String,
    pub file: Option<String>,
    pub error_file: Option<String>,
    pub read_timeout: Duration,
}

impl ConfirmSpec {
    pub fn is_exec(&self) -> bool {
        self.key.eq_ignore_ascii_case("exec")
    }
}

/// `fail_on_single_reject` policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectPolicy {
    /// Wait for every leg.
    Never,
    /// Any hung-up leg ends the group.
    Any,
    /// Only legs hung up with one of these causes end the group.
    Causes(Vec<CauseCode>),
}

impl RejectPolicy {
    pub fn parse(value: Option<&str>) -> Self {
        let Some(value) = value.map(str::trim).filter(|v| !v.is_empty()) else {
            return RejectPolicy::Never;
        };
        if is_true(value) {
            return RejectPolicy::Any;
        }
        let causes: Vec<CauseCode> = split_list(value)
            .filter_map(|name| name.trim_start_matches('!').parse().ok())
            .collect();
        if causes.is_empty() {
            RejectPolicy::Never
        } else {
            RejectPolicy::Causes(causes)
        }
    }

    pub fn rejects(&self, cause: CauseCode) -> bool {
        match self {
            RejectPolicy::Never => false,
            RejectPolicy::Any => true,
            RejectPolicy::Causes(list) => list.contains(&cause),
        }
    }
}

/// Typed view of every tuning variable for one originate call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialTuning {
    pub timeout: Duration,
    pub progress_timeout: Duration,
    pub retries: u32,
    pub retry_sleep: Duration,
    /// Early media counts as a winning condition.
    pub early_ok: bool,
    /// Early media is reported to the originator as ringing.
    pub early_as_ring: bool,
    pub ignore_ring_ready: bool,
    pub return_ring_ready: bool,
    pub instant_ringback: bool,
    pub forked_dial: bool,
    pub confirm: Option<ConfirmSpec>,
    pub reject_policy: RejectPolicy,
}

impl DialTuning {
    /// Resolve tuning from the merged variables.
    ///
    /// `requested_secs` is the caller's timeout (0 for default), `call_timeout`
    /// the originator's `call_timeout` variable if any.
    pub fn resolve(
        vars: &Variables,
        requested_secs: u32,
        call_timeout: Option<&str>,
        config: &EngineConfig,
    ) -> Self {
        let mut timeout_secs = if requested_secs > 0 {
            requested_secs as u64
        } else {
            config.default_timeout_secs
        };
        if let Some(n) = call_timeout.and_then(parse_int).filter(|n| *n > 0) {
            timeout_secs = n as u64;
        }
        if let Some(n) = vars
            .get(names::ORIGINATE_TIMEOUT)
            .and_then(|v| parse_int(v))
            .filter(|n| *n > 0)
        {
            timeout_secs = n as u64;
        }

        let progress_secs = vars
            .get(names::PROGRESS_TIMEOUT)
            .and_then(|v| parse_int(v))
            .filter(|n| *n > 0)
            .map(|n| n as u64)
            .unwrap_or(timeout_secs);

        let retries = match vars.get(names::ORIGINATE_RETRIES) {
            Some(v) => match parse_int(v) {
                Some(n) if RETRIES_RANGE.contains(&n) => n as u32,
                _ => {
                    warn!(
                        "Invalid originate_retries setting of {} ignored, value must be between {} and {}",
                        v,
                        RETRIES_RANGE.start(),
                        RETRIES_RANGE.end()
                    );
                    config.default_retries
                }
            },
            None => config.default_retries,
        };

        let retry_sleep_ms = match vars.get(names::ORIGINATE_RETRY_SLEEP_MS) {
            Some(v) => match parse_int(v) {
                Some(n) if RETRY_SLEEP_RANGE.contains(&n) => n as u64,
                _ => {
                    warn!(
                        "Invalid originate_retry_sleep_ms setting of {} ignored, value must be between {} and {}",
                        v,
                        RETRY_SLEEP_RANGE.start(),
                        RETRY_SLEEP_RANGE.end()
                    );
                    config.default_retry_sleep_ms
                }
            },
            None => config.default_retry_sleep_ms,
        };

        let (early_ok, early_as_ring) = match vars.get(names::IGNORE_EARLY_MEDIA) {
            Some(v) if v.eq_ignore_ascii_case("ring_ready") => (false, true),
            Some(v) if is_true(v) => (false, false),
            _ => (true, false),
        };

        let confirm = non_empty(vars, names::GROUP_CONFIRM_KEY).map(|key| {
            let read_timeout_ms = vars
                .get(names::GROUP_CONFIRM_READ_TIMEOUT)
                .and_then(|v| parse_int(v))
                .filter(|n| *n > 0)
                .map(|n| n as u64)
                .unwrap_or(config.confirm_read_timeout_ms);
            ConfirmSpec {
                key: key.to_string(),
                file: non_empty(vars, names::GROUP_CONFIRM_FILE).map(str::to_string),
                error_file: non_empty(vars, names::GROUP_CONFIRM_ERROR_FILE).map(str::to_string),
                read_timeout: Duration::from_millis(read_timeout_ms),
            }
        });

        Self {
            timeout: Duration::from_secs(timeout_secs),
            progress_timeout: Duration::from_secs(progress_secs),
            retries,
            retry_sleep: Duration::from_millis(retry_sleep_ms),
            early_ok,
            early_as_ring,
            ignore_ring_ready: var_true(vars, names::IGNORE_RING_READY),
            return_ring_ready: var_true(vars, names::RETURN_RING_READY),
            instant_ringback: var_true(vars, names::INSTANT_RINGBACK),
            forked_dial: var_true(vars, names::FORKED_DIAL),
            confirm,
            reject_policy: RejectPolicy::parse(
                vars.get(names::FAIL_ON_SINGLE_REJECT).map(String::as_str),
            ),
        }
    }
}
