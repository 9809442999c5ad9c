#![forbid(unsafe_code)]

//! Stateful services with batched, coalesced updates.
//!
//! Re-exports [`rsvc_runtime`] (scheduler, services, state) and, with the
//! `inject` feature, [`rsvc_inject`] (containers, context, observers).
//!
//! ```
//! use rsvc::prelude::*;
//!
//! reactive_state! {
//!     #[derive(Debug, Clone, PartialEq)]
//!     pub struct Todo => TodoPatch {
//!         pub title: String,
//!         pub done: bool,
//!     }
//! }
//!
//! let scheduler = UpdateScheduler::with_config(SchedulerConfig::new().synchronous());
//! let todo = StatefulService::new(Todo { title: "write docs".into(), done: false }, &scheduler);
//! todo.set_state(TodoPatch::default().done(true)).unwrap();
//! assert!(todo.state().done);
//! ```

pub use rsvc_runtime::{
    AfterFn, ChangeRequest, FlushMode, FlushPhase, Handler, HandlerSet, MicrotaskQueue, Patch,
    SchedulerConfig, SchedulerError, SchedulerStats, State, StatefulService, Task, UpdateScheduler,
    Updater, WeakScheduler, reactive_state,
};
pub use rsvc_runtime::{config, handler, microtask, scheduler, service, state};

#[cfg(feature = "inject")]
pub use rsvc_inject::{
    BindingBuilder, Container, ContainerOptions, Injection, InjectionContext, Lifetime,
    ObserverBinding, ProvideGuard, ResolveError, ServiceId, Services,
};
#[cfg(feature = "inject")]
pub use rsvc_inject::{container, context, observer};

pub mod prelude {
    //! Common imports.

    pub use rsvc_runtime::{
        FlushMode, Handler, MicrotaskQueue, Patch, SchedulerConfig, SchedulerError, State,
        StatefulService, UpdateScheduler, Updater, reactive_state,
    };

    #[cfg(feature = "inject")]
    pub use rsvc_inject::{
        Container, ContainerOptions, Injection, InjectionContext, Lifetime, ObserverBinding,
        ResolveError, ServiceId,
    };
}
