#![forbid(unsafe_code)]

//! Store construction options.

use std::fmt;
use std::rc::Rc;

use web_time::Duration;

use crate::error::Result;
use crate::lifecycle::{BunjaInstance, Teardown};
use crate::schedule::{DeferredQueue, Scheduler};

/// Configuration for [`BunjaStore::with_config`](super::BunjaStore::with_config).
///
/// ```
/// use bunja_core::schedule::{DeferredQueue, LabClock};
/// use bunja_core::store::{BunjaStore, StoreConfig};
/// use web_time::Duration;
///
/// let queue = DeferredQueue::lab(&LabClock::new());
/// let store = BunjaStore::with_config(
///     StoreConfig::default()
///         .with_grace(Duration::from_millis(50))
///         .with_scheduler(queue.clone()),
/// );
/// assert_eq!(store.stats().bunja_instances, 0);
/// ```
#[derive(Clone)]
pub struct StoreConfig {
    /// Delay between a count reaching zero and the disposal check.
    pub grace: Duration,
    /// Queue that runs disposal checks.
    pub scheduler: Rc<dyn Scheduler>,
    /// Hook around every bunja instance creation.
    pub wrap_instance: Rc<dyn WrapInstance>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            grace: Duration::ZERO,
            scheduler: Rc::new(DeferredQueue::new()),
            wrap_instance: Rc::new(PassThrough),
        }
    }
}

impl StoreConfig {
    #[must_use]
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    #[must_use]
    pub fn with_scheduler(mut self, scheduler: impl Scheduler + 'static) -> Self {
        self.scheduler = Rc::new(scheduler);
        self
    }

    #[must_use]
    pub fn with_wrap_instance(mut self, wrap: impl WrapInstance + 'static) -> Self {
        self.wrap_instance = Rc::new(wrap);
        self
    }
}

impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("grace", &self.grace)
            .finish_non_exhaustive()
    }
}

// ─── Instance wrapping ───────────────────────────────────────────────────────

/// Host hook around bunja instance creation.
///
/// The hook must call [`InstanceFactory::create`] exactly once (it is the
/// only way to obtain an [`Instantiated`]) and may pass a [`Teardown`] that
/// runs when the instance is disposed. Hosts use this to run initializers
/// inside their own resource scope, such as a reactive root.
pub trait WrapInstance {
    fn wrap(&self, factory: InstanceFactory<'_>) -> Instantiated;
}

impl<F> WrapInstance for F
where
    F: Fn(InstanceFactory<'_>) -> Instantiated,
{
    fn wrap(&self, factory: InstanceFactory<'_>) -> Instantiated {
        self(factory)
    }
}

/// The default hook: create with a no-op teardown.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThrough;

impl WrapInstance for PassThrough {
    fn wrap(&self, factory: InstanceFactory<'_>) -> Instantiated {
        factory.create(Box::new(|| {}))
    }
}

type CreateFn<'a> = Box<dyn FnOnce(Teardown) -> Result<Rc<BunjaInstance>> + 'a>;

/// Runs a bunja initializer and registers the resulting instance.
pub struct InstanceFactory<'a> {
    create: CreateFn<'a>,
}

impl<'a> InstanceFactory<'a> {
    pub(crate) fn new(create: impl FnOnce(Teardown) -> Result<Rc<BunjaInstance>> + 'a) -> Self {
        Self {
            create: Box::new(create),
        }
    }

    /// Run the initializer. `teardown` runs once when the instance is
    /// disposed, after its effect cleanups. If initialization fails,
    /// `teardown` is dropped without running.
    pub fn create(self, teardown: Teardown) -> Instantiated {
        Instantiated((self.create)(teardown))
    }
}

impl fmt::Debug for InstanceFactory<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceFactory").finish_non_exhaustive()
    }
}

/// Outcome of [`InstanceFactory::create`], returned through the hook.
#[must_use]
pub struct Instantiated(Result<Rc<BunjaInstance>>);

impl Instantiated {
    /// Whether the initializer succeeded.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.0.is_ok()
    }

    pub(crate) fn into_result(self) -> Result<Rc<BunjaInstance>> {
        self.0
    }
}

impl fmt::Debug for Instantiated {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Ok(instance) => f.debug_tuple("Instantiated").field(&instance.id()).finish(),
            Err(err) => f.debug_tuple("Instantiated").field(err).finish(),
        }
    }
}
