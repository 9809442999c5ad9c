#![forbid(unsafe_code)]

//! Container propagation.
//!
//! An [`InjectionContext`] carries the container that observers resolve from.
//! It has an optional default container plus a stack of scoped overrides;
//! [`provide`](InjectionContext::provide) pushes one and the returned guard
//! pops it, so nested subtrees see the innermost container.

use std::cell::RefCell;
use std::rc::Rc;

use crate::container::Container;

thread_local! {
    static GLOBAL_CONTEXT: InjectionContext = InjectionContext::new();
}

/// Ambient container source with scoped overrides.
#[derive(Clone, Default)]
pub struct InjectionContext {
    default: Rc<RefCell<Option<Container>>>,
    overrides: Rc<RefCell<Vec<Container>>>,
}

impl InjectionContext {
    /// A context with no default container.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_default(container: Container) -> Self {
        let ctx = Self::new();
        ctx.set_default(Some(container));
        ctx
    }

    /// Access the global context (thread-local).
    #[must_use]
    pub fn global() -> Self {
        GLOBAL_CONTEXT.with(Clone::clone)
    }

    /// The innermost provided container, else the default.
    #[must_use]
    pub fn current(&self) -> Option<Container> {
        if let Some(container) = self.overrides.borrow().last() {
            return Some(container.clone());
        }
        self.default.borrow().clone()
    }

    /// Replace the default container.
    pub fn set_default(&self, container: Option<Container>) {
        if let Some(container) = &container {
            container.ensure_scheduler();
        }
        *self.default.borrow_mut() = container;
    }

    /// Make `container` current until the guard drops. The container's
    /// scheduler is bound on entry if it has none.
    #[must_use = "dropping this guard ends the provided scope"]
    pub fn provide(&self, container: Container) -> ProvideGuard {
        container.ensure_scheduler();
        tracing::trace!(depth = self.depth() + 1, "container provided");
        self.overrides.borrow_mut().push(container.clone());
        ProvideGuard {
            stack: Rc::clone(&self.overrides),
            container,
        }
    }

    /// Number of active provided scopes.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.overrides.borrow().len()
    }
}

impl std::fmt::Debug for InjectionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InjectionContext")
            .field("has_default", &self.default.borrow().is_some())
            .field("depth", &self.depth())
            .finish()
    }
}

/// RAII guard for a provided container.
#[must_use = "dropping this guard ends the provided scope"]
pub struct ProvideGuard {
    stack: Rc<RefCell<Vec<Container>>>,
    container: Container,
}

impl ProvideGuard {
    #[must_use]
    pub fn container(&self) -> &Container {
        &self.container
    }
}

/// Removes this guard's own entry, the innermost one for its container, so
/// guards dropped out of order leave the other scopes in place.
impl Drop for ProvideGuard {
    fn drop(&mut self) {
        let mut stack = self.stack.borrow_mut();
        if let Some(pos) = stack.iter().rposition(|c| c.ptr_eq(&self.container)) {
            stack.remove(pos);
        }
    }
}
