#![forbid(unsafe_code)]

//! Batched state updates for long-lived services.
//!
//! Services keep their state in a [`StatefulService`] and request changes
//! instead of mutating it. All services of a scope share one
//! [`UpdateScheduler`], which queues the requests, applies them in one flush,
//! and then notifies every subscribed [`Handler`] once.
//!
//! - [`microtask`]: the deferral primitive (one turn = one queued task).
//! - [`state`]: [`State`], [`Patch`], [`Updater`], and [`reactive_state!`].
//! - [`service`]: the per-service state holder.
//! - [`handler`]: identity-compared notification callbacks.
//! - [`scheduler`]: the queue, flush loop, and fan-out.
//! - [`config`]: flush mode and naming, from code, env, or TOML.

pub mod config;
pub mod error;
pub mod handler;
pub mod microtask;
pub mod scheduler;
pub mod service;
pub mod state;

pub use config::{FlushMode, SchedulerConfig};
pub use error::SchedulerError;
pub use handler::{Handler, HandlerSet};
pub use microtask::{MicrotaskQueue, Task};
pub use scheduler::{
    AfterFn, ChangeRequest, FlushPhase, SchedulerStats, UpdateScheduler, WeakScheduler,
};
pub use service::StatefulService;
pub use state::{Patch, State, Updater};
