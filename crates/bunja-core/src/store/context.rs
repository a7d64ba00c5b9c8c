#![forbid(unsafe_code)]

//! One resolution pass and the context handed to initializers.
//!
//! A [`Pass`] memoizes the scope and bunja instances resolved during a
//! single `get`, so repeated uses of one dependency inside a pass return the
//! same instance. Resolution is lazy: an unbaked bunja's dependencies are
//! discovered by running its initializer, while a baked bunja has its
//! related scopes and bunjas resolved up front so its identity can be
//! computed before deciding whether the initializer runs at all.
//!
//! [`InitCx`] is the only way initializer code reaches dependencies. Each
//! initializer run gets its own context naming the bunja being initialized,
//! so nested resolutions never observe each other's discovery state.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use ahash::AHashMap;

use super::config::InstanceFactory;
use super::{StoreInner, resolve};
use crate::error::{BunjaError, Result};
use crate::graph::{AnyBunja, Bunja, BunjaId};
use crate::lifecycle::{
    BunjaInstance, Cleanup, EffectFn, InstanceId, ScopeInstance, ScopeInstanceId,
};
use crate::read_scope::{ReadScope, ScopeValues};
use crate::scope::{AnyScope, Scope, ScopeBinding, ScopeId, ScopeValue};

pub(crate) struct Pass<'s> {
    store: &'s Rc<StoreInner>,
    read_scope: &'s dyn ReadScope,
    scopes: RefCell<AHashMap<ScopeId, Rc<ScopeInstance>>>,
    bunjas: RefCell<AHashMap<BunjaId, Rc<BunjaInstance>>>,
}

impl<'s> Pass<'s> {
    pub(crate) fn new(store: &'s Rc<StoreInner>, read_scope: &'s dyn ReadScope) -> Self {
        Self {
            store,
            read_scope,
            scopes: RefCell::new(AHashMap::new()),
            bunjas: RefCell::new(AHashMap::new()),
        }
    }

    pub(crate) fn scope_instance(&self, scope: &AnyScope) -> Result<Rc<ScopeInstance>> {
        if let Some(instance) = self.scopes.borrow().get(&scope.id()) {
            return Ok(Rc::clone(instance));
        }
        let value = self.read_scope.read(scope)?;
        let instance = super::scope_instance(self.store, scope, value)?;
        self.scopes
            .borrow_mut()
            .insert(scope.id(), Rc::clone(&instance));
        Ok(instance)
    }

    pub(crate) fn bunja_instance(&self, bunja: &AnyBunja) -> Result<Rc<BunjaInstance>> {
        if let Some(instance) = self.bunjas.borrow().get(&bunja.id()) {
            return Ok(Rc::clone(instance));
        }
        let instance = if bunja.is_baked() {
            for scope in bunja.related_scopes()?.iter() {
                self.scope_instance(scope)?;
            }
            for related in bunja.related_bunjas()?.iter() {
                self.bunja_instance(related)?;
            }
            let id = bunja.instance_id(|scope| self.scope_instance_id(scope))?;
            match self.store.cached(&id) {
                Some(instance) => instance,
                None => self.create(bunja, Some(id))?,
            }
        } else {
            self.create(bunja, None)?
        };
        self.bunjas
            .borrow_mut()
            .insert(bunja.id(), Rc::clone(&instance));
        Ok(instance)
    }

    fn scope_instance_id(&self, scope: &AnyScope) -> Option<ScopeInstanceId> {
        self.scopes.borrow().get(&scope.id()).map(|instance| instance.id())
    }

    /// Run the initializer through the store's wrap hook. An unbaked bunja
    /// is baked once its initializer returns, and only then identified.
    fn create(&self, bunja: &AnyBunja, id: Option<InstanceId>) -> Result<Rc<BunjaInstance>> {
        let wrap = Rc::clone(&self.store.wrap_instance);
        let factory = InstanceFactory::new(move |teardown| {
            let cx = InitCx::new(self, bunja.clone());
            let value = bunja.run_init(&cx)?;
            let effects = cx.into_effects();
            let id = match id {
                Some(id) => id,
                None => {
                    bunja.bake()?;
                    bunja.instance_id(|scope| self.scope_instance_id(scope))?
                }
            };
            Ok(super::insert_bunja(
                self.store, id, bunja, value, effects, teardown,
            ))
        });
        wrap.wrap(factory).into_result()
    }
}

// ─── Initializer context ─────────────────────────────────────────────────────

/// Capabilities available to a bunja initializer.
///
/// Every dependency read goes through this context. On a bunja's first
/// initialization the reads are recorded as its dependencies; once the bunja
/// is baked, reading anything outside that recorded set fails with
/// [`BunjaError::UndeclaredDependency`].
pub struct InitCx<'p> {
    pass: &'p Pass<'p>,
    bunja: AnyBunja,
    effects: RefCell<Vec<EffectFn>>,
}

impl<'p> InitCx<'p> {
    fn new(pass: &'p Pass<'p>, bunja: AnyBunja) -> Self {
        Self {
            pass,
            bunja,
            effects: RefCell::new(Vec::new()),
        }
    }

    /// The bunja being initialized.
    #[must_use]
    pub fn bunja(&self) -> &AnyBunja {
        &self.bunja
    }

    /// Read the instance value of another bunja.
    pub fn use_bunja<T: 'static>(&self, bunja: &Bunja<T>) -> Result<Rc<T>> {
        let dependency = bunja.erased();
        if self.bunja.is_baked() {
            if !self.bunja.related_bunjas()?.contains(dependency) {
                return Err(self.undeclared(dependency.to_string()));
            }
        } else {
            self.bunja.add_parent(dependency);
        }
        self.pass.bunja_instance(dependency)?.value_as::<T>()
    }

    /// Read the current value of a scope.
    pub fn use_scope<T: 'static>(&self, scope: &Scope<T>) -> Result<Rc<T>> {
        self.scope_instance(scope.erased())?.value_as::<T>()
    }

    /// Read a bunja or a scope.
    pub fn use_dep<D: Dependency>(&self, dependency: &D) -> Result<Rc<D::Value>> {
        dependency.read(self)
    }

    /// Register an effect. Effects run in registration order the first time
    /// the instance is mounted; each returns a cleanup that runs when the
    /// instance is disposed.
    pub fn effect<F, C>(&self, effect: F)
    where
        F: FnOnce() -> C + 'static,
        C: FnOnce() + 'static,
    {
        self.effects
            .borrow_mut()
            .push(Box::new(move || -> Cleanup { Box::new(effect()) }));
    }

    /// Resolve a separate instance of `bunja` with some scopes bound to
    /// literal values.
    ///
    /// Scopes without a binding are read through this context, so they
    /// become dependencies of the forking bunja. The forked instance is
    /// mounted while the forking instance is active and released when it is
    /// disposed.
    pub fn fork<U: 'static>(
        &self,
        bunja: &Bunja<U>,
        bindings: impl IntoIterator<Item = ScopeBinding>,
    ) -> Result<Rc<U>> {
        let overrides: ScopeValues = bindings.into_iter().collect();
        let fallback = ThroughContext { cx: self };
        let read_scope = overrides.over(&fallback);
        let resolved = resolve(self.pass.store, bunja, &read_scope)?;
        let mount = resolved.mount;
        self.effect(move || {
            let guard = mount.mount();
            move || guard.unmount()
        });
        Ok(resolved.value)
    }

    fn scope_instance(&self, scope: &AnyScope) -> Result<Rc<ScopeInstance>> {
        if self.bunja.is_baked() {
            if !self.bunja.related_scopes()?.contains(scope) {
                return Err(self.undeclared(scope.to_string()));
            }
        } else {
            self.bunja.add_scope(scope);
        }
        self.pass.scope_instance(scope)
    }

    fn undeclared(&self, dependency: String) -> BunjaError {
        BunjaError::UndeclaredDependency {
            bunja: self.bunja.to_string(),
            dependency,
        }
    }

    fn into_effects(self) -> Vec<EffectFn> {
        self.effects.into_inner()
    }
}

impl fmt::Debug for InitCx<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InitCx")
            .field("bunja", &self.bunja)
            .field("effects", &self.effects.borrow().len())
            .finish_non_exhaustive()
    }
}

/// Fork fallback: scope reads recorded against the forking bunja.
struct ThroughContext<'c, 'p> {
    cx: &'c InitCx<'p>,
}

impl ReadScope for ThroughContext<'_, '_> {
    fn read(&self, scope: &AnyScope) -> Result<ScopeValue> {
        Ok(Rc::clone(self.cx.scope_instance(scope)?.value()))
    }
}

// ─── Dependencies ────────────────────────────────────────────────────────────

mod sealed {
    pub trait Sealed {}

    impl<T> Sealed for crate::graph::Bunja<T> {}
    impl<T> Sealed for crate::scope::Scope<T> {}
}

/// Something an initializer can read: a [`Bunja`] or a [`Scope`].
pub trait Dependency: sealed::Sealed {
    type Value: 'static;

    #[doc(hidden)]
    fn read(&self, cx: &InitCx<'_>) -> Result<Rc<Self::Value>>;
}

impl<T: 'static> Dependency for Bunja<T> {
    type Value = T;

    fn read(&self, cx: &InitCx<'_>) -> Result<Rc<T>> {
        cx.use_bunja(self)
    }
}

impl<T: 'static> Dependency for Scope<T> {
    type Value = T;

    fn read(&self, cx: &InitCx<'_>) -> Result<Rc<T>> {
        cx.use_scope(self)
    }
}
