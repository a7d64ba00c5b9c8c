#![forbid(unsafe_code)]

//! The resolver and cache of bunja and scope instances.
//!
//! A [`BunjaStore`] owns two maps: bunja instances by [`InstanceId`] and
//! scope instances by `(scope, derived key)`. [`BunjaStore::get`] resolves a
//! bunja's dependency closure against a [`ReadScope`], creating whatever is
//! missing, and returns the value with a [`Mount`] handle. Nothing runs user
//! effects until that handle is mounted.
//!
//! # Invariants
//!
//! 1. At most one live bunja instance per identity, and one live scope
//!    instance per `(scope, key)`, exists in a store.
//! 2. An initializer runs once per created instance, never on a cache hit.
//! 3. `deps` and the mount order derive from the bunja's baked related sets,
//!    so they are identical on the first resolution and every later one.
//! 4. Instances hold only a weak handle to the store; dropping the store
//!    handle does not keep instances alive and never runs disposal.
//!
//! # Failure Modes
//!
//! - A failing initializer or scope read aborts the `get` with the error.
//!   Instances created earlier in the same pass stay cached with a zero
//!   count until they are mounted and released, or the store is disposed.
//! - A cyclic dependency graph recurses without bound.

mod config;
mod context;
mod mount;

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::cmp::Reverse;
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use ahash::AHashMap;
use tracing::debug;

pub use config::{InstanceFactory, Instantiated, PassThrough, StoreConfig, WrapInstance};
pub use context::{Dependency, InitCx};
pub use mount::{Mount, MountGuard, Resolved};

use self::context::Pass;
use crate::error::Result;
use crate::graph::{AnyBunja, Bunja};
use crate::lifecycle::{
    BunjaInstance, Deferral, EffectFn, InstanceId, InstanceOwner, RefCounted, ScopeInstance,
    ScopeInstanceId, Teardown,
};
use crate::read_scope::ReadScope;
use crate::schedule::Scheduler;
use crate::scope::{AnyScope, ScopeId, ScopeKey, ScopeValue};

static NEXT_STORE_ID: AtomicU64 = AtomicU64::new(0);

/// Process-unique identifier of a [`BunjaStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StoreId(u64);

impl StoreId {
    fn next() -> Self {
        Self(NEXT_STORE_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Live instance counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub bunja_instances: usize,
    pub scope_instances: usize,
}

type ScopeInstances = AHashMap<ScopeId, AHashMap<ScopeKey, Rc<ScopeInstance>>>;

pub(crate) struct StoreInner {
    id: StoreId,
    bunjas: RefCell<AHashMap<InstanceId, Rc<BunjaInstance>>>,
    scopes: RefCell<ScopeInstances>,
    next_scope_instance: Cell<u64>,
    next_bunja_seq: Cell<u64>,
    deferral: Deferral,
    wrap_instance: Rc<dyn WrapInstance>,
}

impl StoreInner {
    fn cached(&self, id: &InstanceId) -> Option<Rc<BunjaInstance>> {
        self.bunjas.borrow().get(id).cloned()
    }
}

impl InstanceOwner for StoreInner {
    fn release_bunja(&self, instance: &BunjaInstance) {
        let removed = {
            let mut bunjas = self.bunjas.borrow_mut();
            let current = bunjas
                .get(instance.id())
                .is_some_and(|entry| std::ptr::eq(Rc::as_ptr(entry), instance));
            if current { bunjas.remove(instance.id()) } else { None }
        };
        drop(removed);
    }

    fn release_scope(&self, instance: &ScopeInstance) {
        let removed = {
            let mut scopes = self.scopes.borrow_mut();
            let scope_id = instance.scope().id();
            let Some(by_key) = scopes.get_mut(&scope_id) else {
                return;
            };
            let current = by_key
                .get(instance.key())
                .is_some_and(|entry| std::ptr::eq(Rc::as_ptr(entry), instance));
            let removed = if current { by_key.remove(instance.key()) } else { None };
            if by_key.is_empty() {
                scopes.remove(&scope_id);
            }
            removed
        };
        drop(removed);
    }
}

/// Find or create the scope instance for `value` under `scope`.
fn scope_instance(
    store: &Rc<StoreInner>,
    scope: &AnyScope,
    value: ScopeValue,
) -> Result<Rc<ScopeInstance>> {
    let key = scope.key_of(&value)?;
    if let Some(instance) = store
        .scopes
        .borrow()
        .get(&scope.id())
        .and_then(|by_key| by_key.get(&key))
    {
        return Ok(Rc::clone(instance));
    }

    let id = ScopeInstanceId::new(store.next_scope_instance.get());
    store.next_scope_instance.set(id.raw() + 1);
    let owner: Weak<StoreInner> = Rc::downgrade(store);
    let instance = Rc::new(ScopeInstance::new(id, scope.clone(), key.clone(), value, owner));
    store
        .scopes
        .borrow_mut()
        .entry(scope.id())
        .or_default()
        .insert(key, Rc::clone(&instance));
    debug!(store = %store.id, scope = %scope, instance = %id, "scope instance created");
    Ok(instance)
}

fn insert_bunja(
    store: &Rc<StoreInner>,
    id: InstanceId,
    bunja: &AnyBunja,
    value: Rc<dyn Any>,
    effects: Vec<EffectFn>,
    teardown: Teardown,
) -> Rc<BunjaInstance> {
    let seq = store.next_bunja_seq.get();
    store.next_bunja_seq.set(seq + 1);
    let owner: Weak<StoreInner> = Rc::downgrade(store);
    let effect_count = effects.len();
    let instance = Rc::new(BunjaInstance::new(
        id.clone(),
        bunja.clone(),
        value,
        seq,
        effects,
        teardown,
        owner,
    ));
    store.bunjas.borrow_mut().insert(id, Rc::clone(&instance));
    debug!(
        store = %store.id,
        instance = %instance.id(),
        bunja = %bunja,
        effects = effect_count,
        "bunja instance created"
    );
    instance
}

/// Resolve `bunja` in `store`; shared by [`BunjaStore::get`] and forks.
fn resolve<T: 'static>(
    store: &Rc<StoreInner>,
    bunja: &Bunja<T>,
    read_scope: &dyn ReadScope,
) -> Result<Resolved<T>> {
    let pass = Pass::new(store, read_scope);
    let erased = bunja.erased();
    let instance = pass.bunja_instance(erased)?;
    let value = instance.value_as::<T>()?;

    let scopes = erased
        .related_scopes()?
        .iter()
        .map(|scope| pass.scope_instance(scope))
        .collect::<Result<Vec<_>>>()?;
    let dependencies = erased
        .related_bunjas()?
        .iter()
        .map(|related| pass.bunja_instance(related))
        .collect::<Result<Vec<_>>>()?;
    let deps = scopes
        .iter()
        .map(|scope| Rc::clone(scope.value()))
        .collect();

    Ok(Resolved {
        value,
        mount: Mount::new(instance, dependencies, scopes, store.deferral.clone()),
        deps,
    })
}

// ─── Public handle ───────────────────────────────────────────────────────────

/// Resolver and cache for bunja instances.
///
/// ```
/// use bunja_core::graph::Bunja;
/// use bunja_core::read_scope::ScopeValues;
/// use bunja_core::store::BunjaStore;
///
/// let store = BunjaStore::new();
/// let greeting = Bunja::new(|_| Ok(String::from("hello")));
/// let first = store.get(&greeting, &ScopeValues::new()).unwrap();
/// let second = store.get(&greeting, &ScopeValues::new()).unwrap();
/// assert!(std::rc::Rc::ptr_eq(&first.value, &second.value));
/// ```
pub struct BunjaStore {
    inner: Rc<StoreInner>,
}

impl BunjaStore {
    /// A store on a real-clock [`DeferredQueue`](crate::schedule::DeferredQueue)
    /// with no grace window.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(StoreConfig::default())
    }

    #[must_use]
    pub fn with_config(config: StoreConfig) -> Self {
        let StoreConfig {
            grace,
            scheduler,
            wrap_instance,
        } = config;
        let inner = Rc::new(StoreInner {
            id: StoreId::next(),
            bunjas: RefCell::new(AHashMap::new()),
            scopes: RefCell::new(AHashMap::new()),
            next_scope_instance: Cell::new(0),
            next_bunja_seq: Cell::new(0),
            deferral: Deferral { scheduler, grace },
            wrap_instance,
        });
        debug!(store = %inner.id, ?grace, "store created");
        Self { inner }
    }

    #[must_use]
    pub fn id(&self) -> StoreId {
        self.inner.id
    }

    /// Resolve `bunja` with scope values from `read_scope`.
    ///
    /// Creates missing instances (running initializers, baking unbaked
    /// bunjas) but runs no effects. Mount the returned handle to activate.
    ///
    /// Instances are only released through a mount, so an instance that is
    /// resolved but never mounted stays cached until [`BunjaStore::dispose`].
    /// The same holds for instances created by a pass that then failed.
    pub fn get<T: 'static>(
        &self,
        bunja: &Bunja<T>,
        read_scope: &dyn ReadScope,
    ) -> Result<Resolved<T>> {
        resolve(&self.inner, bunja, read_scope)
    }

    /// Dispose every instance regardless of reference counts: bunja
    /// instances newest first, then scope instances. The store stays usable.
    pub fn dispose(&self) {
        let bunjas = std::mem::take(&mut *self.inner.bunjas.borrow_mut());
        let scopes = std::mem::take(&mut *self.inner.scopes.borrow_mut());

        let mut bunjas: Vec<_> = bunjas.into_values().collect();
        bunjas.sort_by_key(|instance| Reverse(instance.seq()));
        let mut scopes: Vec<_> = scopes.into_values().flat_map(|m| m.into_values()).collect();
        scopes.sort_by_key(|instance| Reverse(instance.id()));

        debug!(
            store = %self.inner.id,
            bunja_instances = bunjas.len(),
            scope_instances = scopes.len(),
            "store disposed"
        );
        for instance in bunjas {
            instance.dispose();
        }
        for instance in scopes {
            instance.dispose();
        }
    }

    #[must_use]
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            bunja_instances: self.inner.bunjas.borrow().len(),
            scope_instances: self.inner.scopes.borrow().values().map(|m| m.len()).sum(),
        }
    }

    /// Whether an instance with this identity is cached.
    #[must_use]
    pub fn contains(&self, instance_id: &str) -> bool {
        self.inner.bunjas.borrow().contains_key(instance_id)
    }

    /// The queue running this store's disposal checks.
    #[must_use]
    pub fn scheduler(&self) -> Rc<dyn Scheduler> {
        Rc::clone(&self.inner.deferral.scheduler)
    }

    /// Run disposal checks that are due. Shorthand for
    /// `store.scheduler().run_due()`.
    pub fn run_deferred(&self) -> usize {
        self.inner.deferral.scheduler.run_due()
    }
}

impl Default for BunjaStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for BunjaStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BunjaStore")
            .field("id", &self.inner.id)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::read_scope::ScopeValues;
    use crate::schedule::{DeferredQueue, LabClock};
    use crate::scope::Scope;

    fn lab_store() -> (BunjaStore, DeferredQueue) {
        let queue = DeferredQueue::lab(&LabClock::new());
        let store = BunjaStore::with_config(StoreConfig::default().with_scheduler(queue.clone()));
        (store, queue)
    }

    fn instance(store: &BunjaStore, id: &InstanceId) -> Rc<BunjaInstance> {
        store.inner.cached(id).expect("instance is cached")
    }

    #[test]
    fn get_creates_without_activating() {
        let (store, queue) = lab_store();
        let runs = Rc::new(Cell::new(0));
        let effects = Rc::new(Cell::new(0));
        let bunja = {
            let runs = Rc::clone(&runs);
            let effects = Rc::clone(&effects);
            Bunja::new(move |cx| {
                runs.set(runs.get() + 1);
                let effects = Rc::clone(&effects);
                cx.effect(move || {
                    effects.set(effects.get() + 1);
                    || {}
                });
                Ok(())
            })
        };

        let first = store.get(&bunja, &ScopeValues::new()).unwrap();
        let second = store.get(&bunja, &ScopeValues::new()).unwrap();
        assert_eq!(runs.get(), 1);
        assert_eq!(effects.get(), 0);
        assert_eq!(first.instance_id(), second.instance_id());
        assert_eq!(instance(&store, first.instance_id()).ref_count(), 0);
        assert!(queue.is_idle());
    }

    #[test]
    fn mount_counts_the_whole_closure() {
        let (store, queue) = lab_store();
        let tenant = Scope::<u32>::new();
        let base = {
            let tenant = tenant.clone();
            Bunja::new(move |cx| Ok(*cx.use_scope(&tenant)?))
        };
        let top = {
            let base = base.clone();
            Bunja::new(move |cx| Ok(*cx.use_bunja(&base)? + 1))
        };

        let values = ScopeValues::new().with(&tenant, 7);
        let resolved = store.get(&top, &values).unwrap();
        assert_eq!(*resolved.value, 8);

        let guard = resolved.mount.mount();
        let second = resolved.mount.mount();
        let base_id = base
            .erased()
            .instance_id(|_| Some(ScopeInstanceId::new(0)))
            .unwrap();
        assert_eq!(instance(&store, resolved.instance_id()).ref_count(), 2);
        assert_eq!(instance(&store, &base_id).ref_count(), 2);
        let scope = store.inner.scopes.borrow()[&tenant.id()]
            .values()
            .next()
            .cloned()
            .unwrap();
        assert_eq!(scope.ref_count(), 2);

        guard.unmount();
        drop(second);
        assert_eq!(scope.ref_count(), 0);
        assert_eq!(store.stats().bunja_instances, 2);
        queue.tick();
        assert_eq!(
            store.stats(),
            StoreStats {
                bunja_instances: 0,
                scope_instances: 0
            }
        );
    }

    #[test]
    fn release_leaves_replaced_entries_alone() {
        let (store, _queue) = lab_store();
        let bunja = Bunja::new(|_| Ok(1u8));
        let resolved = store.get(&bunja, &ScopeValues::new()).unwrap();
        let id = resolved.instance_id().clone();

        let stale = BunjaInstance::new(
            id.clone(),
            bunja.erased().clone(),
            Rc::new(1u8),
            99,
            Vec::new(),
            Box::new(|| {}),
            Weak::<StoreInner>::new(),
        );
        store.inner.release_bunja(&stale);
        assert!(store.contains(id.as_str()));
    }

    #[test]
    fn dispose_runs_newest_instance_first() {
        let (store, queue) = lab_store();
        let log = Rc::new(RefCell::new(Vec::new()));
        let make = |name: &'static str, parent: Option<Bunja<()>>| {
            let log = Rc::clone(&log);
            Bunja::new(move |cx| {
                if let Some(parent) = &parent {
                    cx.use_bunja(parent)?;
                }
                let log = Rc::clone(&log);
                cx.effect(move || move || log.borrow_mut().push(name));
                Ok(())
            })
        };
        let a = make("a", None);
        let b = make("b", Some(a.clone()));
        let c = make("c", Some(b.clone()));

        let guard = store.get(&c, &ScopeValues::new()).unwrap().mount.mount();
        store.dispose();
        assert_eq!(*log.borrow(), vec!["c", "b", "a"]);
        assert_eq!(store.stats(), StoreStats::default());

        drop(guard);
        queue.run_until_idle();
        assert_eq!(log.borrow().len(), 3);
    }

    #[test]
    fn store_ids_are_unique() {
        assert_ne!(BunjaStore::new().id(), BunjaStore::new().id());
    }

    #[test]
    fn scope_instance_ids_are_store_local() {
        let scope = Scope::<u8>::new();
        let bunja = {
            let scope = scope.clone();
            Bunja::new(move |cx| Ok(*cx.use_scope(&scope)?))
        };
        for _ in 0..2 {
            let (store, _queue) = lab_store();
            let resolved = store
                .get(&bunja, &ScopeValues::new().with(&scope, 3))
                .unwrap();
            assert_eq!(resolved.instance_id().as_str(), format!("{}:0", bunja.id()));
        }
    }
}
