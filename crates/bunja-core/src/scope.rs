#![forbid(unsafe_code)]

//! Scopes: typed identity tokens for externally supplied partition keys.
//!
//! A [`Scope<T>`] names a kind of value the host provides at resolution time
//! (a route id, a tenant id, ...). The store never compares raw values: it
//! derives a [`ScopeKey`] through the scope's hash function and deduplicates
//! scope instances by that key.
//!
//! # Invariants
//!
//! 1. Scope ids are process-unique and never reused.
//! 2. Two values map to the same scope instance iff their derived keys are
//!    equal (same key type and `Eq`).
//! 3. A scope is immutable after construction except for its debug label.

use std::any::{Any, type_name};
use std::cell::RefCell;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{BunjaError, Result};

static NEXT_SCOPE_ID: AtomicU64 = AtomicU64::new(0);

/// Process-unique identifier of a [`Scope`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ScopeId(u64);

impl ScopeId {
    fn next() -> Self {
        Self(NEXT_SCOPE_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw id value.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A type-erased scope value as handed to the store by a [`ReadScope`].
///
/// [`ReadScope`]: crate::read_scope::ReadScope
pub type ScopeValue = Rc<dyn Any>;

/// Erase a concrete value into a [`ScopeValue`].
#[must_use]
pub fn scope_value<T: 'static>(value: T) -> ScopeValue {
    Rc::new(value)
}

// ─── Keys ────────────────────────────────────────────────────────────────────

trait DynKey {
    fn as_any(&self) -> &dyn Any;
    fn eq_dyn(&self, other: &dyn DynKey) -> bool;
    fn hash_dyn(&self, state: &mut dyn Hasher);
}

impl<K: Hash + Eq + 'static> DynKey for K {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn eq_dyn(&self, other: &dyn DynKey) -> bool {
        other
            .as_any()
            .downcast_ref::<K>()
            .is_some_and(|other| other == self)
    }

    fn hash_dyn(&self, mut state: &mut dyn Hasher) {
        self.hash(&mut state);
    }
}

/// Deduplication key derived from a scope value by the scope's hash function.
///
/// Keys of different underlying types never compare equal.
#[derive(Clone)]
pub struct ScopeKey(Rc<dyn DynKey>);

impl ScopeKey {
    /// Wrap any hashable value as a key.
    #[must_use]
    pub fn new<K: Hash + Eq + 'static>(key: K) -> Self {
        Self(Rc::new(key))
    }
}

impl PartialEq for ScopeKey {
    fn eq(&self, other: &Self) -> bool {
        (*self.0).eq_dyn(&*other.0)
    }
}

impl Eq for ScopeKey {}

impl Hash for ScopeKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (*self.0).hash_dyn(state);
    }
}

impl fmt::Debug for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ScopeKey(..)")
    }
}

// ─── Erased scope ────────────────────────────────────────────────────────────

struct ScopeNode {
    id: ScopeId,
    debug_label: RefCell<String>,
    value_type: &'static str,
    key_of: Box<dyn Fn(&dyn Any) -> Option<ScopeKey>>,
}

/// A scope with its value type erased, as stored in dependency graphs.
///
/// Equality and hashing go by [`ScopeId`].
#[derive(Clone)]
pub struct AnyScope {
    node: Rc<ScopeNode>,
}

impl AnyScope {
    #[must_use]
    pub fn id(&self) -> ScopeId {
        self.node.id
    }

    #[must_use]
    pub fn debug_label(&self) -> String {
        self.node.debug_label.borrow().clone()
    }

    pub fn set_debug_label(&self, label: impl Into<String>) {
        *self.node.debug_label.borrow_mut() = label.into();
    }

    /// Name of the value type this scope expects.
    #[must_use]
    pub fn value_type(&self) -> &'static str {
        self.node.value_type
    }

    /// Derive the deduplication key of `value`.
    ///
    /// Fails if `value` is not of the scope's value type.
    pub fn key_of(&self, value: &ScopeValue) -> Result<ScopeKey> {
        (self.node.key_of)(&**value).ok_or_else(|| BunjaError::ScopeValueType {
            scope: self.to_string(),
            expected: self.node.value_type,
        })
    }
}

impl PartialEq for AnyScope {
    fn eq(&self, other: &Self) -> bool {
        self.node.id == other.node.id
    }
}

impl Eq for AnyScope {}

impl Hash for AnyScope {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.node.id.hash(state);
    }
}

impl fmt::Display for AnyScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = self.node.debug_label.borrow();
        if label.is_empty() {
            write!(f, "[Scope:{}]", self.node.id)
        } else {
            write!(f, "[Scope:{} - {}]", self.node.id, label)
        }
    }
}

impl fmt::Debug for AnyScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnyScope")
            .field("id", &self.node.id)
            .field("debug_label", &self.node.debug_label.borrow())
            .field("value_type", &self.node.value_type)
            .finish()
    }
}

// ─── Typed scope ─────────────────────────────────────────────────────────────

/// A typed external partition key.
///
/// Cloning a `Scope` yields another handle to the **same** scope.
pub struct Scope<T> {
    erased: AnyScope,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Scope<T> {
    fn clone(&self) -> Self {
        Self {
            erased: self.erased.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: Hash + Eq + Clone + 'static> Scope<T> {
    /// Create a scope whose instances are deduplicated by value equality.
    #[must_use]
    pub fn new() -> Self {
        Self::with_hash(T::clone)
    }
}

impl<T: Hash + Eq + Clone + 'static> Default for Scope<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> Scope<T> {
    /// Create a scope whose instances are deduplicated by `hash(value)`.
    ///
    /// Values with equal derived keys share one scope instance, and the
    /// first value seen for a key is the one every consumer reads.
    #[must_use]
    pub fn with_hash<K, F>(hash: F) -> Self
    where
        K: Hash + Eq + 'static,
        F: Fn(&T) -> K + 'static,
    {
        let key_of = move |value: &dyn Any| value.downcast_ref::<T>().map(|v| ScopeKey::new(hash(v)));
        Self {
            erased: AnyScope {
                node: Rc::new(ScopeNode {
                    id: ScopeId::next(),
                    debug_label: RefCell::new(String::new()),
                    value_type: type_name::<T>(),
                    key_of: Box::new(key_of),
                }),
            },
            _marker: PhantomData,
        }
    }

    /// Set the debug label.
    #[must_use]
    pub fn with_label(self, label: impl Into<String>) -> Self {
        self.erased.set_debug_label(label);
        self
    }

    #[must_use]
    pub fn id(&self) -> ScopeId {
        self.erased.id()
    }

    /// The type-erased handle of this scope.
    #[must_use]
    pub fn erased(&self) -> &AnyScope {
        &self.erased
    }

    /// Pair this scope with a literal value, for overrides and forks.
    #[must_use]
    pub fn bind(&self, value: T) -> ScopeBinding {
        ScopeBinding {
            scope: self.erased.clone(),
            value: scope_value(value),
        }
    }
}

impl<T> fmt::Display for Scope<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.erased, f)
    }
}

impl<T> fmt::Debug for Scope<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.erased, f)
    }
}

/// A scope paired with a literal value.
#[derive(Clone)]
pub struct ScopeBinding {
    pub scope: AnyScope,
    pub value: ScopeValue,
}

impl fmt::Debug for ScopeBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeBinding")
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}
