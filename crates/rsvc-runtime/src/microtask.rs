#![forbid(unsafe_code)]

//! Single-threaded microtask queue used to defer scheduler flushes.
//!
//! A [`MicrotaskQueue`] is a FIFO of boxed `FnOnce()` tasks. Posting never
//! runs anything; the host drives the queue by calling
//! [`run_next()`](MicrotaskQueue::run_next) (one turn) or
//! [`run_until_idle()`](MicrotaskQueue::run_until_idle) (every turn, including
//! tasks posted by earlier tasks) from its event loop.
//!
//! # Invariants
//!
//! 1. Tasks run in post order.
//! 2. No internal borrow is held while a task runs, so tasks may post more
//!    tasks onto the same queue.
//! 3. Cloning a queue yields a handle to the **same** FIFO.
//!
//! # Failure Modes
//!
//! - A panicking task propagates out of `run_next()`. The task has already
//!   been popped, so the queue remains usable afterwards.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// A unit of deferred work.
pub type Task = Box<dyn FnOnce()>;

thread_local! {
    static CURRENT_QUEUE: MicrotaskQueue = MicrotaskQueue::new();
}

/// Shared FIFO of deferred tasks.
#[derive(Clone, Default)]
pub struct MicrotaskQueue {
    tasks: Rc<RefCell<VecDeque<Task>>>,
}

impl MicrotaskQueue {
    /// Create an empty, independent queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle to the thread-local default queue.
    #[must_use]
    pub fn current() -> Self {
        CURRENT_QUEUE.with(Clone::clone)
    }

    /// Append a task. It runs on a later turn, never inside this call.
    pub fn post(&self, task: impl FnOnce() + 'static) {
        self.tasks.borrow_mut().push_back(Box::new(task));
    }

    /// Run exactly one task. Returns `false` if the queue was empty.
    pub fn run_next(&self) -> bool {
        let task = self.tasks.borrow_mut().pop_front();
        match task {
            Some(task) => {
                task();
                true
            }
            None => false,
        }
    }

    /// Run turns until the queue is empty. Returns the number of turns.
    ///
    /// Tasks posted while draining are also run, so a task that always
    /// re-posts itself keeps this call from returning.
    pub fn run_until_idle(&self) -> usize {
        let mut turns = 0;
        while self.run_next() {
            turns += 1;
        }
        turns
    }

    /// Number of queued tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.borrow().len()
    }

    /// Whether no task is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.borrow().is_empty()
    }

    /// Whether two handles share the same FIFO.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.tasks, &other.tasks)
    }
}

impl std::fmt::Debug for MicrotaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MicrotaskQueue")
            .field("len", &self.len())
            .finish()
    }
}
