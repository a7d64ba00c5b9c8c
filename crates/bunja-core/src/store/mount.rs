#![forbid(unsafe_code)]

//! Activation handles returned by `get`.

use std::fmt;
use std::rc::Rc;

use web_time::Duration;

use crate::lifecycle::{BunjaInstance, Deferral, InstanceId, RefCounted, ScopeInstance};
use crate::schedule::Scheduler;
use crate::scope::ScopeValue;

/// Result of resolving a bunja against a store.
pub struct Resolved<T> {
    /// The instance value, shared by every consumer of the instance.
    pub value: Rc<T>,
    /// Activation handle for the instance and everything it depends on.
    pub mount: Mount,
    /// Values of the bunja's related scopes, in baked order. Equal `deps`
    /// mean the same instance would be resolved again.
    pub deps: Vec<ScopeValue>,
}

impl<T> Resolved<T> {
    #[must_use]
    pub fn instance_id(&self) -> &InstanceId {
        self.mount.instance_id()
    }
}

impl<T: fmt::Debug> fmt::Debug for Resolved<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolved")
            .field("value", &self.value)
            .field("mount", &self.mount)
            .field("deps", &self.deps.len())
            .finish()
    }
}

/// Activates an instance together with its dependency closure.
///
/// Each call to [`mount`](Self::mount) increments the related bunja
/// instances in dependency order, then the instance, then its scope
/// instances. The returned guard releases them in reverse.
#[derive(Clone)]
pub struct Mount {
    instance: Rc<BunjaInstance>,
    dependencies: Rc<[Rc<BunjaInstance>]>,
    scopes: Rc<[Rc<ScopeInstance>]>,
    deferral: Deferral,
}

impl Mount {
    pub(crate) fn new(
        instance: Rc<BunjaInstance>,
        dependencies: Vec<Rc<BunjaInstance>>,
        scopes: Vec<Rc<ScopeInstance>>,
        deferral: Deferral,
    ) -> Self {
        Self {
            instance,
            dependencies: dependencies.into(),
            scopes: scopes.into(),
            deferral,
        }
    }

    #[must_use]
    pub fn instance_id(&self) -> &InstanceId {
        self.instance.id()
    }

    /// Whether the instance behind this handle has been disposed. Mounting a
    /// disposed instance has no effect; resolve it again instead.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.instance.is_disposed()
    }

    pub fn mount(&self) -> MountGuard {
        for dependency in self.dependencies.iter() {
            dependency.add();
        }
        self.instance.add();
        for scope in self.scopes.iter() {
            scope.add();
        }
        MountGuard {
            mount: Some(self.clone()),
        }
    }

    fn release(&self) {
        for scope in self.scopes.iter().rev() {
            self.deferral.sub(scope);
        }
        self.deferral.sub(&self.instance);
        for dependency in self.dependencies.iter().rev() {
            self.deferral.sub(dependency);
        }
    }
}

impl fmt::Debug for Mount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mount")
            .field("instance", &self.instance.id())
            .field("dependencies", &self.dependencies.len())
            .field("scopes", &self.scopes.len())
            .finish()
    }
}

/// One activation of a [`Mount`]. Released exactly once: by
/// [`unmount`](Self::unmount), [`unmount_after`](Self::unmount_after), or
/// drop.
#[must_use = "dropping a MountGuard unmounts immediately"]
pub struct MountGuard {
    mount: Option<Mount>,
}

impl MountGuard {
    pub fn unmount(mut self) {
        self.release();
    }

    /// Hand the release to `scheduler`, to run after `delay`. A remount
    /// before then keeps the instances alive without a teardown cycle.
    pub fn unmount_after(mut self, scheduler: &dyn Scheduler, delay: Duration) {
        if let Some(mount) = self.mount.take() {
            scheduler.schedule(delay, Box::new(move || mount.release()));
        }
    }

    #[must_use]
    pub fn instance_id(&self) -> Option<&InstanceId> {
        self.mount.as_ref().map(Mount::instance_id)
    }

    fn release(&mut self) {
        if let Some(mount) = self.mount.take() {
            mount.release();
        }
    }
}

impl Drop for MountGuard {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for MountGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MountGuard")
            .field("instance", &self.instance_id())
            .finish()
    }
}
