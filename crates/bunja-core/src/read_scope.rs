#![forbid(unsafe_code)]

//! Sources of scope values for a resolution.
//!
//! The store asks a [`ReadScope`] for the current value of every scope a
//! bunja depends on. Hosts implement it however their context plumbing
//! works; the crate ships three readers:
//!
//! - any `Fn(&AnyScope) -> Option<ScopeValue>` closure,
//! - [`ScopeValues`], a table of literal bindings,
//! - [`ScopeOverlay`], a table layered over another reader.

use std::fmt;

use ahash::AHashMap;

use crate::error::{BunjaError, Result};
use crate::scope::{AnyScope, Scope, ScopeBinding, ScopeId, ScopeValue, scope_value};

/// Supplies the current value of a scope.
pub trait ReadScope {
    /// Read the value of `scope`, or fail with
    /// [`BunjaError::ScopeUnavailable`].
    fn read(&self, scope: &AnyScope) -> Result<ScopeValue>;
}

impl<F> ReadScope for F
where
    F: Fn(&AnyScope) -> Option<ScopeValue>,
{
    fn read(&self, scope: &AnyScope) -> Result<ScopeValue> {
        self(scope).ok_or_else(|| unavailable(scope))
    }
}

pub(crate) fn unavailable(scope: &AnyScope) -> BunjaError {
    BunjaError::ScopeUnavailable {
        scope: scope.to_string(),
    }
}

/// Literal scope values keyed by scope.
///
/// ```
/// use bunja_core::read_scope::{ReadScope, ScopeValues};
/// use bunja_core::scope::Scope;
///
/// let tenant = Scope::<String>::new();
/// let values = ScopeValues::new().with(&tenant, "acme".to_owned());
/// let read = values.read(tenant.erased()).unwrap();
/// assert_eq!(read.downcast_ref::<String>().map(String::as_str), Some("acme"));
/// ```
#[derive(Clone, Default)]
pub struct ScopeValues {
    values: AHashMap<ScopeId, ScopeValue>,
}

impl ScopeValues {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `scope` to `value`, replacing any earlier binding.
    #[must_use]
    pub fn with<T: 'static>(mut self, scope: &Scope<T>, value: T) -> Self {
        self.values.insert(scope.id(), scope_value(value));
        self
    }

    pub fn insert(&mut self, binding: ScopeBinding) {
        self.values.insert(binding.scope.id(), binding.value);
    }

    #[must_use]
    pub fn get(&self, scope: &AnyScope) -> Option<&ScopeValue> {
        self.values.get(&scope.id())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Layer these bindings over `fallback`.
    #[must_use]
    pub fn over<'a>(&'a self, fallback: &'a dyn ReadScope) -> ScopeOverlay<'a> {
        ScopeOverlay {
            overrides: self,
            fallback,
        }
    }
}

impl FromIterator<ScopeBinding> for ScopeValues {
    fn from_iter<I: IntoIterator<Item = ScopeBinding>>(iter: I) -> Self {
        let mut values = Self::new();
        for binding in iter {
            values.insert(binding);
        }
        values
    }
}

impl Extend<ScopeBinding> for ScopeValues {
    fn extend<I: IntoIterator<Item = ScopeBinding>>(&mut self, iter: I) {
        for binding in iter {
            self.insert(binding);
        }
    }
}

impl ReadScope for ScopeValues {
    fn read(&self, scope: &AnyScope) -> Result<ScopeValue> {
        self.get(scope).cloned().ok_or_else(|| unavailable(scope))
    }
}

impl fmt::Debug for ScopeValues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<_> = self.values.keys().copied().collect();
        ids.sort_unstable();
        f.debug_struct("ScopeValues").field("scopes", &ids).finish()
    }
}

/// Overrides first, then a fallback reader.
pub struct ScopeOverlay<'a> {
    overrides: &'a ScopeValues,
    fallback: &'a dyn ReadScope,
}

impl ReadScope for ScopeOverlay<'_> {
    fn read(&self, scope: &AnyScope) -> Result<ScopeValue> {
        match self.overrides.get(scope) {
            Some(value) => Ok(value.clone()),
            None => self.fallback.read(scope),
        }
    }
}

impl fmt::Debug for ScopeOverlay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeOverlay")
            .field("overrides", self.overrides)
            .finish_non_exhaustive()
    }
}
