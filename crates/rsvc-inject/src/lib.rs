#![forbid(unsafe_code)]

//! Scopes, propagation, and observer wiring for `rsvc` services.
//!
//! - [`container`]: [`Container`] bindings, lifetimes, and the per-scope
//!   [`UpdateScheduler`](rsvc_runtime::UpdateScheduler).
//! - [`context`]: [`InjectionContext`], the ambient container stack.
//! - [`observer`]: [`ObserverBinding`], which resolves services and keeps a
//!   handler subscribed while mounted.

pub mod container;
pub mod context;
pub mod error;
pub mod observer;

pub use container::{BindingBuilder, Container, ContainerOptions, Lifetime, ServiceId};
pub use context::{InjectionContext, ProvideGuard};
pub use error::ResolveError;
pub use observer::{Injection, ObserverBinding, Services};
