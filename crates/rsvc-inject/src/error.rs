#![forbid(unsafe_code)]

//! Resolution errors.
//!
//! Every variant is a configuration error: it is returned at the point of
//! use (resolution, render) and never deferred.

use rsvc_runtime::SchedulerError;

use crate::container::ServiceId;

/// Error type for container resolution and observer binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// No container was given to the observer and none is provided by the
    /// context.
    NoContainer,
    /// Nothing is bound to the identifier.
    NotBound(ServiceId),
    /// The scope has no scheduler binding and the caller requires one.
    SchedulerNotBound,
    /// A second update scheduler would be bound in this scope.
    SchedulerConflict,
    /// Resolution re-entered an identifier already being resolved. The path
    /// ends with the repeated identifier.
    Cycle(Vec<ServiceId>),
    /// The bound instance is not of the requested type.
    TypeMismatch(ServiceId),
    /// An injected-services lookup used a key that was never requested.
    MissingKey(&'static str),
    /// A scheduler operation failed while building a service.
    Scheduler(SchedulerError),
    /// A factory rejected the construction.
    Factory {
        /// Identifier being constructed.
        id: ServiceId,
        /// Factory-provided reason.
        message: String,
    },
}

impl ResolveError {
    /// Build a [`ResolveError::Factory`] for type `T`.
    #[must_use]
    pub fn factory<T: 'static>(message: impl Into<String>) -> Self {
        Self::Factory {
            id: ServiceId::of::<T>(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ResolveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoContainer => write!(
                f,
                "no container was provided, either set a default one or provide one in context"
            ),
            Self::NotBound(id) => write!(f, "no binding found for {id}"),
            Self::SchedulerNotBound => write!(f, "no update scheduler is bound in this scope"),
            Self::SchedulerConflict => {
                write!(f, "this scope already has an update scheduler")
            }
            Self::Cycle(path) => {
                write!(f, "circular dependency: ")?;
                for (i, id) in path.iter().enumerate() {
                    if i > 0 {
                        write!(f, " -> ")?;
                    }
                    write!(f, "{id}")?;
                }
                Ok(())
            }
            Self::TypeMismatch(id) => write!(f, "bound instance for {id} has a different type"),
            Self::MissingKey(key) => write!(f, "no injected service under key '{key}'"),
            Self::Scheduler(err) => write!(f, "{err}"),
            Self::Factory { id, message } => write!(f, "factory for {id} failed: {message}"),
        }
    }
}

impl std::error::Error for ResolveError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Scheduler(err) => Some(err),
            _ => None,
        }
    }
}

impl From<SchedulerError> for ResolveError {
    fn from(err: SchedulerError) -> Self {
        Self::Scheduler(err)
    }
}
