#![forbid(unsafe_code)]

//! Notification handlers with identity semantics.
//!
//! A [`Handler`] is a zero-argument callback. Two handlers are equal only if
//! they are clones of the same allocation, which makes subscription
//! idempotent: inserting the same handler twice keeps one entry.
//!
//! [`HandlerSet`] keeps handlers in insertion order. The scheduler iterates a
//! [`snapshot`](HandlerSet::snapshot) and re-checks
//! [`contains`](HandlerSet::contains) before each call, so handlers may
//! subscribe or unsubscribe others while a fan-out is running.

use std::hash::{Hash, Hasher};
use std::rc::Rc;

/// A notification callback compared by identity.
#[derive(Clone)]
pub struct Handler {
    callback: Rc<dyn Fn()>,
}

impl Handler {
    /// Wrap a callback.
    pub fn new(callback: impl Fn() + 'static) -> Self {
        Self {
            callback: Rc::new(callback),
        }
    }

    /// Invoke the callback.
    pub fn call(&self) {
        (self.callback)();
    }

    fn addr(&self) -> *const () {
        Rc::as_ptr(&self.callback).cast::<()>()
    }
}

impl PartialEq for Handler {
    fn eq(&self, other: &Self) -> bool {
        self.addr() == other.addr()
    }
}

impl Eq for Handler {}

impl Hash for Handler {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Handler").field(&self.addr()).finish()
    }
}

/// Insertion-ordered set of handlers, unique by identity.
#[derive(Clone, Default)]
pub struct HandlerSet {
    handlers: Vec<Handler>,
}

impl HandlerSet {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `handler`. Returns `false` if it was already present.
    pub fn insert(&mut self, handler: Handler) -> bool {
        if self.contains(&handler) {
            return false;
        }
        self.handlers.push(handler);
        true
    }

    /// Remove `handler`. Returns `false` if it was absent.
    pub fn remove(&mut self, handler: &Handler) -> bool {
        let before = self.handlers.len();
        self.handlers.retain(|h| h != handler);
        self.handlers.len() != before
    }

    /// Whether `handler` is currently present.
    #[must_use]
    pub fn contains(&self, handler: &Handler) -> bool {
        self.handlers.iter().any(|h| h == handler)
    }

    /// Copy of the current members, in insertion order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Handler> {
        self.handlers.clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerSet")
            .field("len", &self.handlers.len())
            .finish()
    }
}
