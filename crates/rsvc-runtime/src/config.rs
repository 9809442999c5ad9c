#![forbid(unsafe_code)]

//! Scheduler configuration.
//!
//! [`SchedulerConfig`] picks the flush mode and a name used in log spans.
//! It can be built in code, detected from the environment
//! ([`from_env`](SchedulerConfig::from_env)), or, with the `config-file`
//! feature, parsed from TOML.
//!
//! | Variable | Values | Default |
//! |----------|--------|---------|
//! | `RSVC_FLUSH_MODE` | `deferred`, `async`, `microtask`, `sync`, `synchronous`, `inline` | `deferred` |
//! | `RSVC_SCHEDULER_NAME` | any non-empty string | `default` |

use std::env;

#[cfg(feature = "config-file")]
use crate::error::SchedulerError;

/// Environment variable selecting the flush mode.
pub const FLUSH_MODE_ENV: &str = "RSVC_FLUSH_MODE";
/// Environment variable naming the scheduler.
pub const SCHEDULER_NAME_ENV: &str = "RSVC_SCHEDULER_NAME";

const DEFAULT_NAME: &str = "default";

/// When a scheduled flush runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "config-file", derive(serde::Deserialize))]
#[cfg_attr(feature = "config-file", serde(rename_all = "snake_case"))]
pub enum FlushMode {
    /// On a later turn of the microtask queue.
    #[default]
    Deferred,
    /// Inline, inside the enqueue call.
    Synchronous,
}

impl FlushMode {
    /// Parse a mode name. Case-insensitive; surrounding whitespace is ignored.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        match raw.to_ascii_lowercase().as_str() {
            "deferred" | "async" | "microtask" => Some(Self::Deferred),
            "sync" | "synchronous" | "inline" => Some(Self::Synchronous),
            _ => None,
        }
    }
}

/// Scheduler settings.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "config-file", derive(serde::Deserialize))]
#[cfg_attr(feature = "config-file", serde(default))]
pub struct SchedulerConfig {
    /// Flush timing.
    pub mode: FlushMode,
    /// Name attached to log spans.
    pub name: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            mode: FlushMode::Deferred,
            name: DEFAULT_NAME.to_string(),
        }
    }
}

impl SchedulerConfig {
    /// Deferred mode, default name.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Detect settings from `RSVC_FLUSH_MODE` and `RSVC_SCHEDULER_NAME`.
    ///
    /// Unset or unrecognized values fall back to the defaults.
    #[must_use]
    pub fn from_env() -> Self {
        let mode = env::var(FLUSH_MODE_ENV).ok();
        let name = env::var(SCHEDULER_NAME_ENV).ok();
        Self::from_env_values(mode.as_deref(), name.as_deref())
    }

    fn from_env_values(mode: Option<&str>, name: Option<&str>) -> Self {
        let mode = mode.and_then(FlushMode::parse).unwrap_or_default();
        let name = name
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or(DEFAULT_NAME)
            .to_string();
        Self { mode, name }
    }

    /// Parse a TOML document such as `mode = "synchronous"`.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::InvalidConfig`] if the document does not parse.
    #[cfg(feature = "config-file")]
    pub fn from_toml_str(raw: &str) -> Result<Self, SchedulerError> {
        toml::from_str(raw).map_err(|e| SchedulerError::InvalidConfig(e.to_string()))
    }

    /// Switch to synchronous flushing.
    #[must_use]
    pub fn synchronous(self) -> Self {
        self.with_mode(FlushMode::Synchronous)
    }

    /// Switch to deferred flushing.
    #[must_use]
    pub fn deferred(self) -> Self {
        self.with_mode(FlushMode::Deferred)
    }

    #[must_use]
    pub fn with_mode(mut self, mode: FlushMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the span name.
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}
