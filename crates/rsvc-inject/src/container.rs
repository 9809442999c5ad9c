#![forbid(unsafe_code)]

//! Resolution scope.
//!
//! A [`Container`] maps [`ServiceId`]s to factories or ready-made values and
//! owns exactly one [`UpdateScheduler`] for everything resolved from it.
//!
//! # Scheduler binding
//!
//! - [`scheduler()`](Container::scheduler) (and any resolution of the
//!   scheduler's id) binds a default singleton scheduler on first use, so a
//!   scope used only in tests needs no wiring.
//! - [`bound_scheduler()`](Container::bound_scheduler) is the strict form used
//!   by observers: an unbound scheduler is a [`ResolveError::SchedulerNotBound`].
//! - A scheduler binding is always a singleton; a transient request is
//!   coerced and logged.
//! - Once a scope has a scheduler it keeps it: binding a different one
//!   through any path, or binding one under a name, is
//!   [`ResolveError::SchedulerConflict`], and the scheduler binding cannot be
//!   removed with [`unbind`](Container::unbind).
//!
//! # Lifetimes
//!
//! | Lifetime | Behavior |
//! |----------|----------|
//! | [`Lifetime::Singleton`] | Factory runs once per container; instance cached. |
//! | [`Lifetime::Transient`] | Factory runs on every resolution. |
//!
//! # Failure Modes
//!
//! - Unbound id → [`ResolveError::NotBound`].
//! - A factory resolving its own id (directly or transitively) →
//!   [`ResolveError::Cycle`] with the resolution path.

use std::any::{Any, TypeId, type_name};
use std::cell::RefCell;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::rc::Rc;

use ahash::AHashMap;
use rsvc_runtime::{MicrotaskQueue, SchedulerConfig, State, StatefulService, UpdateScheduler};

use crate::error::ResolveError;

type Instance = Rc<dyn Any>;
type Factory = Rc<dyn Fn(&Container) -> Result<Instance, ResolveError>>;

/// Symbolic identifier of a binding: a type plus an optional name.
#[derive(Clone, Copy)]
pub struct ServiceId {
    type_id: TypeId,
    type_name: &'static str,
    name: Option<&'static str>,
}

impl ServiceId {
    /// Identifier for the unnamed binding of `T`.
    #[must_use]
    pub fn of<T: 'static>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: type_name::<T>(),
            name: None,
        }
    }

    /// Identifier for a named binding of `T`, such as `"sample-service"`.
    #[must_use]
    pub fn named<T: 'static>(name: &'static str) -> Self {
        Self {
            name: Some(name),
            ..Self::of::<T>()
        }
    }

    #[must_use]
    pub fn name(&self) -> Option<&'static str> {
        self.name
    }

    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    fn is<T: 'static>(&self) -> bool {
        self.type_id == TypeId::of::<T>()
    }
}

impl PartialEq for ServiceId {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id && self.name == other.name
    }
}

impl Eq for ServiceId {}

impl Hash for ServiceId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_id.hash(state);
        self.name.hash(state);
    }
}

impl std::fmt::Debug for ServiceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("ServiceId");
        s.field("type", &self.type_name);
        if let Some(name) = self.name {
            s.field("name", &name);
        }
        s.finish()
    }
}

impl std::fmt::Display for ServiceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.name {
            Some(name) => write!(f, "'{name}' ({})", self.type_name),
            None => write!(f, "{}", self.type_name),
        }
    }
}

fn scheduler_id() -> ServiceId {
    ServiceId::of::<UpdateScheduler>()
}

/// Instance caching policy for a binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Lifetime {
    /// One instance per container.
    Singleton,
    /// A new instance per resolution.
    #[default]
    Transient,
}

/// Container-wide settings.
#[derive(Debug, Clone, Default)]
pub struct ContainerOptions {
    /// Lifetime used when a binding does not choose one.
    pub default_lifetime: Lifetime,
    /// Configuration of the auto-bound scheduler.
    pub scheduler: SchedulerConfig,
    /// Queue for the auto-bound scheduler; the thread-local queue if `None`.
    pub queue: Option<MicrotaskQueue>,
}

impl ContainerOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn default_lifetime(mut self, lifetime: Lifetime) -> Self {
        self.default_lifetime = lifetime;
        self
    }

    #[must_use]
    pub fn scheduler(mut self, config: SchedulerConfig) -> Self {
        self.scheduler = config;
        self
    }

    #[must_use]
    pub fn queue(mut self, queue: MicrotaskQueue) -> Self {
        self.queue = Some(queue);
        self
    }
}

enum Source {
    Factory(Factory),
    Value(Instance),
}

struct Binding {
    lifetime: Lifetime,
    source: Source,
    cached: RefCell<Option<Instance>>,
}

struct ContainerInner {
    options: ContainerOptions,
    bindings: RefCell<AHashMap<ServiceId, Rc<Binding>>>,
    resolving: RefCell<Vec<ServiceId>>,
}

/// A resolution scope. Cloning yields another handle to the **same** scope.
#[derive(Clone)]
pub struct Container {
    inner: Rc<ContainerInner>,
}

impl Default for Container {
    fn default() -> Self {
        Self::new()
    }
}

/// Pops the resolution stack when a resolution finishes or unwinds.
struct ResolvingGuard<'a> {
    stack: &'a RefCell<Vec<ServiceId>>,
}

impl Drop for ResolvingGuard<'_> {
    fn drop(&mut self) {
        self.stack.borrow_mut().pop();
    }
}

impl Container {
    /// Empty scope with default options.
    #[must_use]
    pub fn new() -> Self {
        Self::with_options(ContainerOptions::default())
    }

    #[must_use]
    pub fn with_options(options: ContainerOptions) -> Self {
        Self {
            inner: Rc::new(ContainerInner {
                options,
                bindings: RefCell::new(AHashMap::new()),
                resolving: RefCell::new(Vec::new()),
            }),
        }
    }

    #[must_use]
    pub fn options(&self) -> &ContainerOptions {
        &self.inner.options
    }

    /// Start a binding for `T`.
    pub fn bind<T: 'static>(&self) -> BindingBuilder<'_, T> {
        BindingBuilder {
            container: self,
            id: ServiceId::of::<T>(),
            lifetime: self.inner.options.default_lifetime,
            _marker: PhantomData,
        }
    }

    /// Remove the binding for `id`. Returns `false` if nothing was bound.
    ///
    /// The scope's scheduler is never removed (services built in this scope
    /// hold on to it); unbinding it returns `false`.
    pub fn unbind(&self, id: ServiceId) -> bool {
        if id == scheduler_id() {
            tracing::warn!(%id, "the scope scheduler cannot be unbound");
            return false;
        }
        self.inner.bindings.borrow_mut().remove(&id).is_some()
    }

    #[must_use]
    pub fn is_bound(&self, id: ServiceId) -> bool {
        self.inner.bindings.borrow().contains_key(&id)
    }

    /// Number of bindings in this scope.
    #[must_use]
    pub fn binding_count(&self) -> usize {
        self.inner.bindings.borrow().len()
    }

    fn insert(
        &self,
        id: ServiceId,
        lifetime: Lifetime,
        source: Source,
    ) -> Result<(), ResolveError> {
        if id.is::<UpdateScheduler>() && id != scheduler_id() {
            tracing::warn!(%id, "update schedulers can only be bound unnamed");
            return Err(ResolveError::SchedulerConflict);
        }
        if id == scheduler_id() && self.is_bound(id) {
            let Source::Value(value) = &source else {
                return Err(ResolveError::SchedulerConflict);
            };
            let existing = self.scheduler()?;
            return match value.downcast_ref::<UpdateScheduler>() {
                Some(scheduler) if scheduler.ptr_eq(&existing) => Ok(()),
                _ => Err(ResolveError::SchedulerConflict),
            };
        }
        self.insert_unchecked(id, lifetime, source);
        Ok(())
    }

    fn insert_unchecked(&self, id: ServiceId, lifetime: Lifetime, source: Source) {
        let replaced = self.inner.bindings.borrow_mut().insert(
            id,
            Rc::new(Binding {
                lifetime,
                source,
                cached: RefCell::new(None),
            }),
        );
        tracing::trace!(%id, ?lifetime, rebound = replaced.is_some(), "binding registered");
    }

    fn enter(&self, id: ServiceId) -> Result<ResolvingGuard<'_>, ResolveError> {
        let mut stack = self.inner.resolving.borrow_mut();
        if stack.contains(&id) {
            let mut path = stack.clone();
            path.push(id);
            return Err(ResolveError::Cycle(path));
        }
        stack.push(id);
        Ok(ResolvingGuard {
            stack: &self.inner.resolving,
        })
    }

    /// Resolve `id` to its type-erased instance.
    ///
    /// # Errors
    ///
    /// [`ResolveError::NotBound`], [`ResolveError::Cycle`], or whatever the
    /// factory returns.
    pub fn resolve(&self, id: ServiceId) -> Result<Rc<dyn Any>, ResolveError> {
        if id == scheduler_id() {
            self.ensure_scheduler();
        }
        let binding = self.inner.bindings.borrow().get(&id).cloned();
        let Some(binding) = binding else {
            return Err(ResolveError::NotBound(id));
        };
        let factory = match &binding.source {
            Source::Value(value) => return Ok(Rc::clone(value)),
            Source::Factory(factory) => Rc::clone(factory),
        };
        if let Some(cached) = binding.cached.borrow().as_ref() {
            return Ok(Rc::clone(cached));
        }

        let _guard = self.enter(id)?;
        let instance = factory(self)?;
        if binding.lifetime == Lifetime::Singleton {
            *binding.cached.borrow_mut() = Some(Rc::clone(&instance));
        }
        Ok(instance)
    }

    fn resolve_typed<T: 'static>(&self, id: ServiceId) -> Result<Rc<T>, ResolveError> {
        self.resolve(id)?
            .downcast::<T>()
            .map_err(|_| ResolveError::TypeMismatch(id))
    }

    /// Resolve the unnamed binding of `T`.
    ///
    /// # Errors
    ///
    /// See [`resolve`](Self::resolve).
    pub fn get<T: 'static>(&self) -> Result<Rc<T>, ResolveError> {
        self.resolve_typed(ServiceId::of::<T>())
    }

    /// Resolve the binding of `T` registered under `name`.
    ///
    /// # Errors
    ///
    /// See [`resolve`](Self::resolve).
    pub fn get_named<T: 'static>(&self, name: &'static str) -> Result<Rc<T>, ResolveError> {
        self.resolve_typed(ServiceId::named::<T>(name))
    }

    /// Bind the default scheduler if no scheduler is bound yet.
    pub fn ensure_scheduler(&self) {
        let id = scheduler_id();
        if self.is_bound(id) {
            return;
        }
        let options = &self.inner.options;
        let queue = options.queue.clone().unwrap_or_else(MicrotaskQueue::current);
        let scheduler = UpdateScheduler::with_queue(options.scheduler.clone(), queue);
        tracing::debug!(scheduler = scheduler.name(), "bound default update scheduler");
        self.insert_unchecked(id, Lifetime::Singleton, Source::Value(Rc::new(scheduler)));
    }

    /// The scope's scheduler, binding a default one on first use.
    ///
    /// # Errors
    ///
    /// Only if a user-supplied scheduler factory fails.
    pub fn scheduler(&self) -> Result<UpdateScheduler, ResolveError> {
        self.get::<UpdateScheduler>().map(|s| (*s).clone())
    }

    /// The scope's scheduler, without auto-binding.
    ///
    /// # Errors
    ///
    /// [`ResolveError::SchedulerNotBound`] if the scope has no scheduler.
    pub fn bound_scheduler(&self) -> Result<UpdateScheduler, ResolveError> {
        if !self.is_bound(scheduler_id()) {
            return Err(ResolveError::SchedulerNotBound);
        }
        self.scheduler()
    }

    /// Bind `scheduler` as this scope's scheduler.
    ///
    /// # Errors
    ///
    /// [`ResolveError::SchedulerConflict`] if a different scheduler is
    /// already bound.
    pub fn bind_scheduler(&self, scheduler: UpdateScheduler) -> Result<(), ResolveError> {
        self.insert(
            scheduler_id(),
            Lifetime::Singleton,
            Source::Value(Rc::new(scheduler)),
        )
    }

    /// A state holder attached to this scope's scheduler.
    ///
    /// # Errors
    ///
    /// See [`scheduler`](Self::scheduler).
    pub fn service<S: State>(&self, initial: S) -> Result<StatefulService<S>, ResolveError> {
        Ok(StatefulService::new(initial, &self.scheduler()?))
    }

    /// Whether two handles refer to the same scope.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("bindings", &self.binding_count())
            .field("default_lifetime", &self.inner.options.default_lifetime)
            .finish()
    }
}

/// Builder returned by [`Container::bind`].
#[must_use = "a binding is only registered by `to_factory` or `to_value`"]
pub struct BindingBuilder<'a, T> {
    container: &'a Container,
    id: ServiceId,
    lifetime: Lifetime,
    _marker: PhantomData<fn() -> T>,
}

impl<T: 'static> BindingBuilder<'_, T> {
    /// Register under `name` instead of the unnamed slot.
    pub fn named(mut self, name: &'static str) -> Self {
        self.id = ServiceId::named::<T>(name);
        self
    }

    pub fn in_lifetime(mut self, lifetime: Lifetime) -> Self {
        self.lifetime = lifetime;
        self
    }

    pub fn in_singleton_scope(self) -> Self {
        self.in_lifetime(Lifetime::Singleton)
    }

    pub fn in_transient_scope(self) -> Self {
        self.in_lifetime(Lifetime::Transient)
    }

    /// Register a factory. It receives the container to resolve its own
    /// dependencies, including the scope's scheduler.
    ///
    /// # Errors
    ///
    /// [`ResolveError::SchedulerConflict`] when binding a scheduler factory
    /// in a scope that already has a scheduler, or under a name.
    pub fn to_factory(
        self,
        factory: impl Fn(&Container) -> Result<T, ResolveError> + 'static,
    ) -> Result<ServiceId, ResolveError> {
        let mut lifetime = self.lifetime;
        if self.id.is::<UpdateScheduler>() && lifetime != Lifetime::Singleton {
            tracing::warn!(id = %self.id, "scheduler bindings are always singletons");
            lifetime = Lifetime::Singleton;
        }
        let factory: Factory = Rc::new(move |c: &Container| {
            factory(c).map(|value| Rc::new(value) as Instance)
        });
        self.container.insert(self.id, lifetime, Source::Factory(factory))?;
        Ok(self.id)
    }

    /// Register a ready-made instance, shared by every resolution.
    ///
    /// # Errors
    ///
    /// [`ResolveError::SchedulerConflict`] when binding a scheduler other
    /// than the one the scope already has, or under a name.
    pub fn to_value(self, value: T) -> Result<ServiceId, ResolveError> {
        self.container
            .insert(self.id, Lifetime::Singleton, Source::Value(Rc::new(value)))?;
        Ok(self.id)
    }
}
