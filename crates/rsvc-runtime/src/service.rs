#![forbid(unsafe_code)]

//! Stateful service holder.
//!
//! A service embeds a [`StatefulService<S>`] next to its other fields and
//! routes every mutation through it:
//!
//! ```
//! use rsvc_runtime::{reactive_state, FlushMode, SchedulerConfig, StatefulService, UpdateScheduler};
//!
//! reactive_state! {
//!     #[derive(Debug, Clone, PartialEq)]
//!     pub struct CounterState => CounterPatch {
//!         pub count: i64,
//!     }
//! }
//!
//! struct Counter {
//!     state: StatefulService<CounterState>,
//! }
//!
//! impl Counter {
//!     fn increment(&self) {
//!         self.state
//!             .update(|s| Some(CounterPatch::default().count(s.count + 1)))
//!             .expect("counter is attached");
//!     }
//! }
//!
//! let scheduler = UpdateScheduler::with_config(SchedulerConfig::new().with_mode(FlushMode::Synchronous));
//! let counter = Counter { state: StatefulService::new(CounterState { count: 0 }, &scheduler) };
//! counter.increment();
//! assert_eq!(counter.state.state().count, 1);
//! ```
//!
//! The holder never writes its own state: requests are queued on the
//! scheduler, which merges them during a flush. The scheduler reference is
//! weak, so a service never keeps its scope's scheduler alive.

use std::any::type_name;
use std::cell::RefCell;
use std::rc::Rc;

use crate::error::SchedulerError;
use crate::scheduler::{AfterFn, ChangeRequest, UpdateScheduler, WeakScheduler};
use crate::state::{State, Updater};

struct ServiceInner<S> {
    state: RefCell<S>,
    scheduler: RefCell<WeakScheduler>,
}

/// Shared handle to one state value and its scheduler association.
///
/// Cloning yields another handle to the **same** state.
pub struct StatefulService<S: State> {
    inner: Rc<ServiceInner<S>>,
}

impl<S: State> Clone for StatefulService<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<S: State + std::fmt::Debug> std::fmt::Debug for StatefulService<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatefulService")
            .field("state", &*self.inner.state.borrow())
            .field("attached", &self.scheduler().is_some())
            .finish()
    }
}

impl<S: State> StatefulService<S> {
    /// Create a holder attached to `scheduler`.
    #[must_use]
    pub fn new(initial: S, scheduler: &UpdateScheduler) -> Self {
        Self {
            inner: Rc::new(ServiceInner {
                state: RefCell::new(initial),
                scheduler: RefCell::new(scheduler.downgrade()),
            }),
        }
    }

    /// Create a holder with no scheduler. Requests fail with
    /// [`SchedulerError::Detached`] until [`attach`](Self::attach) is called.
    #[must_use]
    pub fn detached(initial: S) -> Self {
        Self {
            inner: Rc::new(ServiceInner {
                state: RefCell::new(initial),
                scheduler: RefCell::new(WeakScheduler::new()),
            }),
        }
    }

    /// Associate (or re-associate) this holder with `scheduler`.
    pub fn attach(&self, scheduler: &UpdateScheduler) {
        *self.inner.scheduler.borrow_mut() = scheduler.downgrade();
    }

    /// The associated scheduler, if it is still alive.
    #[must_use]
    pub fn scheduler(&self) -> Option<UpdateScheduler> {
        self.inner.scheduler.borrow().upgrade()
    }

    /// Clone of the current state.
    #[must_use]
    pub fn state(&self) -> S {
        self.inner.state.borrow().clone()
    }

    /// Read the current state by reference.
    pub fn with<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        f(&self.inner.state.borrow())
    }

    /// Enqueue one change request on the associated scheduler.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::Detached`] if no live scheduler is associated.
    pub fn request_change(
        &self,
        updater: Updater<S>,
        after: Option<AfterFn<S>>,
    ) -> Result<(), SchedulerError> {
        let Some(scheduler) = self.scheduler() else {
            let service = type_name::<S>();
            tracing::warn!(service, "change requested on a detached service");
            return Err(SchedulerError::Detached { service });
        };
        let mut request = ChangeRequest::new(self.clone(), updater);
        if let Some(after) = after {
            request = request.with_after(after);
        }
        scheduler.enqueue_update(request);
        Ok(())
    }

    /// Request a patch.
    ///
    /// # Errors
    ///
    /// See [`request_change`](Self::request_change).
    pub fn set_state(&self, patch: S::Patch) -> Result<(), SchedulerError> {
        self.request_change(Updater::patch(patch), None)
    }

    /// Request a patch and run `after` with the final state once applied.
    ///
    /// # Errors
    ///
    /// See [`request_change`](Self::request_change).
    pub fn set_state_then(
        &self,
        patch: S::Patch,
        after: impl FnOnce(&S) + 'static,
    ) -> Result<(), SchedulerError> {
        self.request_change(Updater::patch(patch), Some(Box::new(after)))
    }

    /// Request a patch computed from the state at application time.
    ///
    /// # Errors
    ///
    /// See [`request_change`](Self::request_change).
    pub fn update(
        &self,
        f: impl FnOnce(&S) -> Option<S::Patch> + 'static,
    ) -> Result<(), SchedulerError> {
        self.request_change(Updater::compute(f), None)
    }

    /// Like [`update`](Self::update), with a completion callback.
    ///
    /// # Errors
    ///
    /// See [`request_change`](Self::request_change).
    pub fn update_then(
        &self,
        f: impl FnOnce(&S) -> Option<S::Patch> + 'static,
        after: impl FnOnce(&S) + 'static,
    ) -> Result<(), SchedulerError> {
        self.request_change(Updater::compute(f), Some(Box::new(after)))
    }

    /// Whether two handles share the same state.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn merge(&self, patch: S::Patch) {
        self.inner.state.borrow_mut().merge(patch);
    }
}
