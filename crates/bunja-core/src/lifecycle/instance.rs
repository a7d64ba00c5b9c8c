#![forbid(unsafe_code)]

use std::any::{Any, type_name};
use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use tracing::debug;

use super::ref_counter::{RefCounted, RefCounter};
use crate::error::{BunjaError, Result};
use crate::graph::AnyBunja;
use crate::scope::{AnyScope, ScopeKey, ScopeValue};

/// Store-local identifier of a scope instance, assigned at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ScopeInstanceId(u64);

impl ScopeInstanceId {
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ScopeInstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Composite identity of a bunja instance:
/// `"<bunja-id>:<comma-joined scope instance ids>"`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstanceId(Rc<str>);

impl InstanceId {
    #[must_use]
    pub fn new(id: impl Into<Rc<str>>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::borrow::Borrow<str> for InstanceId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Undo step returned by an effect; runs when the instance is disposed.
pub type Cleanup = Box<dyn FnOnce()>;

/// Host-supplied release hook handed to [`WrapInstance`]; runs once, after
/// the instance's cleanups.
///
/// [`WrapInstance`]: crate::store::WrapInstance
pub type Teardown = Box<dyn FnOnce()>;

pub(crate) type EffectFn = Box<dyn FnOnce() -> Cleanup>;

/// Back-reference from an instance to the map that caches it.
pub(crate) trait InstanceOwner {
    fn release_bunja(&self, instance: &BunjaInstance);
    fn release_scope(&self, instance: &ScopeInstance);
}

// ─── Scope instances ─────────────────────────────────────────────────────────

pub(crate) struct ScopeInstance {
    id: ScopeInstanceId,
    scope: AnyScope,
    key: ScopeKey,
    value: ScopeValue,
    counter: RefCounter,
    owner: Weak<dyn InstanceOwner>,
}

impl ScopeInstance {
    pub(crate) fn new(
        id: ScopeInstanceId,
        scope: AnyScope,
        key: ScopeKey,
        value: ScopeValue,
        owner: Weak<dyn InstanceOwner>,
    ) -> Self {
        Self {
            id,
            scope,
            key,
            value,
            counter: RefCounter::new(),
            owner,
        }
    }

    pub(crate) fn id(&self) -> ScopeInstanceId {
        self.id
    }

    pub(crate) fn scope(&self) -> &AnyScope {
        &self.scope
    }

    pub(crate) fn key(&self) -> &ScopeKey {
        &self.key
    }

    pub(crate) fn value(&self) -> &ScopeValue {
        &self.value
    }

    pub(crate) fn value_as<T: 'static>(&self) -> Result<Rc<T>> {
        Rc::clone(&self.value)
            .downcast::<T>()
            .map_err(|_| BunjaError::ScopeValueType {
                scope: self.scope.to_string(),
                expected: type_name::<T>(),
            })
    }

    #[cfg(test)]
    pub(crate) fn ref_count(&self) -> i64 {
        self.counter.count()
    }
}

impl RefCounted for ScopeInstance {
    fn counter(&self) -> &RefCounter {
        &self.counter
    }

    fn on_dispose(&self) {
        debug!(scope = %self.scope, instance = %self.id, "scope instance disposed");
        if let Some(owner) = self.owner.upgrade() {
            owner.release_scope(self);
        }
    }
}

impl fmt::Display for ScopeInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.scope, self.id)
    }
}

// ─── Bunja instances ─────────────────────────────────────────────────────────

pub(crate) struct BunjaInstance {
    id: InstanceId,
    bunja: AnyBunja,
    value: Rc<dyn Any>,
    seq: u64,
    counter: RefCounter,
    effects: RefCell<Option<Vec<EffectFn>>>,
    cleanups: RefCell<Vec<Cleanup>>,
    teardown: RefCell<Option<Teardown>>,
    owner: Weak<dyn InstanceOwner>,
}

impl BunjaInstance {
    pub(crate) fn new(
        id: InstanceId,
        bunja: AnyBunja,
        value: Rc<dyn Any>,
        seq: u64,
        effects: Vec<EffectFn>,
        teardown: Teardown,
        owner: Weak<dyn InstanceOwner>,
    ) -> Self {
        Self {
            id,
            bunja,
            value,
            seq,
            counter: RefCounter::new(),
            effects: RefCell::new(Some(effects)),
            cleanups: RefCell::new(Vec::new()),
            teardown: RefCell::new(Some(teardown)),
            owner,
        }
    }

    pub(crate) fn id(&self) -> &InstanceId {
        &self.id
    }

    /// Creation order within the owning store.
    pub(crate) fn seq(&self) -> u64 {
        self.seq
    }

    pub(crate) fn value_as<T: 'static>(&self) -> Result<Rc<T>> {
        Rc::clone(&self.value)
            .downcast::<T>()
            .map_err(|_| BunjaError::ValueType {
                bunja: self.bunja.to_string(),
                expected: type_name::<T>(),
            })
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.counter.is_disposed()
    }

    #[cfg(test)]
    pub(crate) fn ref_count(&self) -> i64 {
        self.counter.count()
    }
}

impl RefCounted for BunjaInstance {
    fn counter(&self) -> &RefCounter {
        &self.counter
    }

    fn on_add(&self) {
        // Effects may activate other instances; no borrow is held while
        // they run.
        let Some(effects) = self.effects.borrow_mut().take() else {
            return;
        };
        for effect in effects {
            let cleanup = effect();
            self.cleanups.borrow_mut().push(cleanup);
        }
    }

    fn on_dispose(&self) {
        self.effects.borrow_mut().take();
        let cleanups = std::mem::take(&mut *self.cleanups.borrow_mut());
        for cleanup in cleanups {
            cleanup();
        }
        let teardown = self.teardown.borrow_mut().take();
        if let Some(teardown) = teardown {
            teardown();
        }
        debug!(instance = %self.id, bunja = %self.bunja, "bunja instance disposed");
        if let Some(owner) = self.owner.upgrade() {
            owner.release_bunja(self);
        }
    }
}

impl fmt::Display for BunjaInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.bunja, self.id)
    }
}
