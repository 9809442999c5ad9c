#![forbid(unsafe_code)]

//! Errors surfaced by services and scheduler configuration.
//!
//! Updater, handler, and `after` panics are not errors in this sense: they
//! unwind out of the flush that ran them.

/// Error type for scheduler operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// A service requested a change without a live scheduler (never attached,
    /// or every scheduler handle was dropped). This is a wiring bug.
    Detached {
        /// Type name of the service state.
        service: &'static str,
    },
    /// A configuration document could not be parsed.
    InvalidConfig(String),
}

impl std::fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Detached { service } => {
                write!(f, "service `{service}` has no update scheduler attached")
            }
            Self::InvalidConfig(msg) => write!(f, "invalid scheduler config: {msg}"),
        }
    }
}

impl std::error::Error for SchedulerError {}
