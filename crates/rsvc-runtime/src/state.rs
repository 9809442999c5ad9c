#![forbid(unsafe_code)]

//! State values, partial patches, and shallow merge.
//!
//! A service state is a plain value type implementing [`State`]. Changes are
//! expressed as a [`Patch`]: a partial value that names only the fields to
//! overwrite. [`State::merge`] applies a patch in place, so fields absent
//! from the patch keep both their value and any heap allocation they own.
//!
//! The [`reactive_state!`](crate::reactive_state) macro declares a state
//! struct together with its patch struct. `BTreeMap<K, V>` is provided as a
//! record-shaped state whose patch is another map.
//!
//! # Invariants
//!
//! 1. `merge` touches exactly the fields present in the patch.
//! 2. An empty patch (`is_empty() == true`) is a no-op and is never merged
//!    by the scheduler.

use std::collections::BTreeMap;

/// A partial state value.
pub trait Patch: 'static {
    /// Whether the patch overwrites nothing.
    fn is_empty(&self) -> bool;
}

/// A service-owned state value that accepts shallow patches.
pub trait State: Clone + 'static {
    /// Partial form of this state.
    type Patch: Patch;

    /// Overwrite the fields present in `patch`, leaving the rest untouched.
    fn merge(&mut self, patch: Self::Patch);
}

impl<K: Ord + Clone + 'static, V: Clone + 'static> Patch for BTreeMap<K, V> {
    fn is_empty(&self) -> bool {
        BTreeMap::is_empty(self)
    }
}

impl<K: Ord + Clone + 'static, V: Clone + 'static> State for BTreeMap<K, V> {
    type Patch = BTreeMap<K, V>;

    fn merge(&mut self, patch: Self::Patch) {
        self.extend(patch);
    }
}

/// Function form of an updater: previous state in, optional patch out.
pub type ComputeFn<S> = Box<dyn FnOnce(&S) -> Option<<S as State>::Patch>>;

/// How a change request derives its patch.
pub enum Updater<S: State> {
    /// A ready-made patch.
    Patch(S::Patch),
    /// Computed from the state current at application time. Returning
    /// `None` means "decided not to change anything".
    Compute(ComputeFn<S>),
    /// No patch at all.
    Nothing,
}

impl<S: State> Updater<S> {
    /// Wrap a ready-made patch.
    #[must_use]
    pub fn patch(patch: S::Patch) -> Self {
        Self::Patch(patch)
    }

    /// Wrap a function of the previous state.
    #[must_use]
    pub fn compute(f: impl FnOnce(&S) -> Option<S::Patch> + 'static) -> Self {
        Self::Compute(Box::new(f))
    }

    /// The absent updater.
    #[must_use]
    pub fn nothing() -> Self {
        Self::Nothing
    }

    /// Resolve the candidate patch against `current`.
    ///
    /// Returns `None` when the request is a no-op: no patch, or an empty one.
    pub(crate) fn resolve(self, current: &S) -> Option<S::Patch> {
        let patch = match self {
            Self::Patch(patch) => Some(patch),
            Self::Compute(f) => f(current),
            Self::Nothing => None,
        };
        patch.filter(|p| !p.is_empty())
    }
}

impl<S: State> std::fmt::Debug for Updater<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Self::Patch(_) => "Patch",
            Self::Compute(_) => "Compute",
            Self::Nothing => "Nothing",
        };
        f.debug_tuple("Updater").field(&kind).finish()
    }
}

/// Declare a state struct and its patch struct, implementing [`State`] and
/// [`Patch`].
///
/// The patch struct holds an `Option` per field, derives `Default` and
/// `Clone`, and has one builder setter per field.
///
/// ```
/// use rsvc_runtime::reactive_state;
/// use rsvc_runtime::state::{Patch, State};
///
/// reactive_state! {
///     #[derive(Debug, Clone, PartialEq)]
///     pub struct Counter => CounterPatch {
///         pub count: i64,
///         pub label: String,
///     }
/// }
///
/// let mut state = Counter { count: 1, label: "clicks".into() };
/// let patch = CounterPatch::default().count(2);
/// assert!(!patch.is_empty());
/// state.merge(patch);
/// assert_eq!(state, Counter { count: 2, label: "clicks".into() });
/// ```
#[macro_export]
macro_rules! reactive_state {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident => $patch:ident {
            $(
                $(#[$fmeta:meta])*
                $fvis:vis $field:ident : $ty:ty
            ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        $vis struct $name {
            $(
                $(#[$fmeta])*
                $fvis $field: $ty,
            )*
        }

        #[doc = concat!("Partial [`", stringify!($name), "`].")]
        #[derive(Clone, Debug, Default)]
        $vis struct $patch {
            $(
                $fvis $field: ::core::option::Option<$ty>,
            )*
        }

        #[allow(dead_code)]
        impl $patch {
            $(
                #[must_use]
                $fvis fn $field(mut self, value: $ty) -> Self {
                    self.$field = ::core::option::Option::Some(value);
                    self
                }
            )*
        }

        impl $crate::state::Patch for $patch {
            fn is_empty(&self) -> bool {
                true $(&& self.$field.is_none())*
            }
        }

        impl $crate::state::State for $name {
            type Patch = $patch;

            fn merge(&mut self, patch: $patch) {
                $(
                    if let ::core::option::Option::Some(value) = patch.$field {
                        self.$field = value;
                    }
                )*
            }
        }
    };
}
