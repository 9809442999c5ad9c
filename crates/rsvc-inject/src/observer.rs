#![forbid(unsafe_code)]

//! Subscription lifecycle for view-like observers.
//!
//! An [`ObserverBinding`] resolves a set of services from a container and
//! keeps one [`Handler`] subscribed to that container's scheduler while the
//! observer is mounted:
//!
//! ```text
//! render ─► unsubscribe, resolve services
//! mount / updated ─► subscribe
//! unmount / drop ─► unsubscribe
//! ```
//!
//! Unsubscribing before every render and resubscribing after it means the
//! handler is never registered on a scheduler from a previous container, and
//! a failed render leaves the observer unsubscribed. A failed render keeps
//! the services of the last successful one.
//!
//! [`render_mapped`](ObserverBinding::render_mapped) derives a value from the
//! services on every render, cached or not, for observers that display
//! service state rather than hold the services themselves.

use std::any::Any;
use std::rc::Rc;

use rsvc_runtime::{Handler, UpdateScheduler};

use crate::container::{Container, ServiceId};
use crate::context::InjectionContext;
use crate::error::ResolveError;

/// Services an observer asks for, keyed by a local name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Injection {
    entries: Vec<(&'static str, ServiceId)>,
}

impl Injection {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request the unnamed binding of `T` under `key`.
    #[must_use]
    pub fn with<T: 'static>(self, key: &'static str) -> Self {
        self.with_id(key, ServiceId::of::<T>())
    }

    /// Request the binding of `T` registered as `name` under `key`.
    #[must_use]
    pub fn with_named<T: 'static>(self, key: &'static str, name: &'static str) -> Self {
        self.with_id(key, ServiceId::named::<T>(name))
    }

    /// Request `id` under `key`, replacing an earlier request for the key.
    #[must_use]
    pub fn with_id(mut self, key: &'static str, id: ServiceId) -> Self {
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = id,
            None => self.entries.push((key, id)),
        }
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, ServiceId)> + '_ {
        self.entries.iter().copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Resolved instances for an [`Injection`].
pub struct Services {
    entries: Vec<(&'static str, ServiceId, Rc<dyn Any>)>,
}

impl Services {
    /// Resolve every entry of `injection` from `container`.
    ///
    /// # Errors
    ///
    /// The first resolution failure.
    pub fn resolve(container: &Container, injection: &Injection) -> Result<Self, ResolveError> {
        let entries = injection
            .iter()
            .map(|(key, id)| Ok((key, id, container.resolve(id)?)))
            .collect::<Result<Vec<_>, ResolveError>>()?;
        Ok(Self { entries })
    }

    /// The instance injected under `key`.
    ///
    /// # Errors
    ///
    /// [`ResolveError::MissingKey`] for an unknown key,
    /// [`ResolveError::TypeMismatch`] if the instance is not a `T`.
    pub fn get<T: 'static>(&self, key: &'static str) -> Result<Rc<T>, ResolveError> {
        let (_, id, instance) = self
            .entries
            .iter()
            .find(|(k, _, _)| *k == key)
            .ok_or(ResolveError::MissingKey(key))?;
        Rc::clone(instance)
            .downcast::<T>()
            .map_err(|_| ResolveError::TypeMismatch(*id))
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _, _)| *k == key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|(k, id, _)| (k, id)))
            .finish()
    }
}

struct Resolved {
    container: Container,
    injection: Injection,
    services: Services,
}

/// Keeps an observer's update handler subscribed to the scheduler of the
/// container it resolved from.
pub struct ObserverBinding {
    handler: Handler,
    container: Option<Container>,
    scheduler: Option<UpdateScheduler>,
    resolved: Option<Resolved>,
}

impl ObserverBinding {
    /// A binding that calls `on_update` after every flush while mounted.
    #[must_use]
    pub fn new(on_update: impl Fn() + 'static) -> Self {
        Self {
            handler: Handler::new(on_update),
            container: None,
            scheduler: None,
            resolved: None,
        }
    }

    /// Resolve from `container` instead of the context.
    #[must_use]
    pub fn with_container(mut self, container: Container) -> Self {
        self.container = Some(container);
        self
    }

    /// Unsubscribe, then resolve `injection`.
    ///
    /// Services are re-resolved only when the injection or the container
    /// differs from the previous render.
    ///
    /// # Errors
    ///
    /// - [`ResolveError::NoContainer`] if neither an explicit container nor
    ///   a context container is available.
    /// - [`ResolveError::SchedulerNotBound`] if the container has no
    ///   scheduler.
    /// - Any resolution error of the injected services.
    pub fn render(
        &mut self,
        context: &InjectionContext,
        injection: &Injection,
    ) -> Result<&Services, ResolveError> {
        self.unbind();
        self.scheduler = None;

        let container = self
            .container
            .clone()
            .or_else(|| context.current())
            .ok_or(ResolveError::NoContainer)?;
        let scheduler = container.bound_scheduler()?;

        let resolved = match self.resolved.take() {
            Some(prev) if prev.container.ptr_eq(&container) && prev.injection == *injection => {
                prev
            }
            prev => {
                tracing::trace!(services = injection.len(), "resolving injected services");
                match Services::resolve(&container, injection) {
                    Ok(services) => Resolved {
                        services,
                        container,
                        injection: injection.clone(),
                    },
                    Err(err) => {
                        self.resolved = prev;
                        return Err(err);
                    }
                }
            }
        };
        self.scheduler = Some(scheduler);
        Ok(&self.resolved.insert(resolved).services)
    }

    /// [`render`](Self::render), then pass the services to `mapper` and
    /// return what it derives. The mapper runs on every render, including
    /// ones that reuse the cached services.
    ///
    /// # Errors
    ///
    /// Any error of [`render`](Self::render), or the mapper's own error.
    pub fn render_mapped<M>(
        &mut self,
        context: &InjectionContext,
        injection: &Injection,
        mapper: impl FnOnce(&Services) -> Result<M, ResolveError>,
    ) -> Result<M, ResolveError> {
        let services = self.render(context, injection)?;
        mapper(services)
    }

    /// Subscribe after the first render.
    pub fn mount(&mut self) {
        self.bind();
    }

    /// Subscribe after a re-render.
    pub fn updated(&mut self) {
        self.bind();
    }

    /// Unsubscribe; the observer is going away.
    pub fn unmount(&mut self) {
        self.unbind();
    }

    fn bind(&self) {
        if let Some(scheduler) = &self.scheduler {
            scheduler.subscribe(&self.handler);
        }
    }

    fn unbind(&self) {
        if let Some(scheduler) = &self.scheduler {
            scheduler.unsubscribe(&self.handler);
        }
    }

    #[must_use]
    pub fn is_subscribed(&self) -> bool {
        self.scheduler
            .as_ref()
            .is_some_and(|s| s.is_subscribed(&self.handler))
    }

    /// Services from the last successful render. A failed render does not
    /// clear them.
    #[must_use]
    pub fn services(&self) -> Option<&Services> {
        self.resolved.as_ref().map(|r| &r.services)
    }

    /// Scheduler of the last successful render.
    #[must_use]
    pub fn scheduler(&self) -> Option<&UpdateScheduler> {
        self.scheduler.as_ref()
    }

    #[must_use]
    pub fn handler(&self) -> &Handler {
        &self.handler
    }
}

impl Drop for ObserverBinding {
    fn drop(&mut self) {
        self.unbind();
    }
}

impl std::fmt::Debug for ObserverBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverBinding")
            .field("subscribed", &self.is_subscribed())
            .field("services", &self.services())
            .finish()
    }
}
