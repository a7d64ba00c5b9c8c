#![forbid(unsafe_code)]

//! Counting protocol with deferred, coalescing disposal.
//!
//! ```text
//!   add ──► Active(count > 0) ──sub──► PendingZero ──check──► Disposed
//!               ▲                          │
//!               └────────── add ───────────┘ (check finds count > 0)
//! ```
//!
//! Every activation bumps a generation. A check only disposes if no
//! activation happened since the release that scheduled it, so each zero
//! crossing gets a full grace window of its own.

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

use tracing::{trace, warn};
use web_time::Duration;

use crate::schedule::Scheduler;

/// Reference count, activation generation and the once-only disposal flag.
#[derive(Debug, Default)]
pub(crate) struct RefCounter {
    count: Cell<i64>,
    generation: Cell<u64>,
    disposed: Cell<bool>,
}

impl RefCounter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn count(&self) -> i64 {
        self.count.get()
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.get()
    }
}

/// An object whose lifetime follows a [`RefCounter`].
pub(crate) trait RefCounted: fmt::Display + 'static {
    fn counter(&self) -> &RefCounter;

    /// Called before the count is incremented on every live activation.
    fn on_add(&self) {}

    /// Called exactly once, when the instance is disposed.
    fn on_dispose(&self);

    fn add(&self) {
        let counter = self.counter();
        if counter.is_disposed() {
            warn!(instance = %self, "activation of a disposed instance ignored");
            return;
        }
        self.on_add();
        counter.generation.set(counter.generation.get().wrapping_add(1));
        counter.count.set(counter.count.get() + 1);
        trace!(instance = %self, count = counter.count.get(), "ref added");
    }

    /// Dispose now regardless of the count. Returns `false` if the instance
    /// was already disposed.
    fn dispose(&self) -> bool {
        if self.counter().disposed.replace(true) {
            return false;
        }
        self.on_dispose();
        true
    }
}

/// Where and when the zero-count check runs.
#[derive(Clone)]
pub(crate) struct Deferral {
    pub(crate) scheduler: Rc<dyn Scheduler>,
    pub(crate) grace: Duration,
}

impl Deferral {
    /// Decrement `instance` and, on reaching zero, schedule the disposal
    /// check after the grace window.
    pub(crate) fn sub<I: RefCounted>(&self, instance: &Rc<I>) {
        let counter = instance.counter();
        if counter.is_disposed() {
            return;
        }
        let count = counter.count.get() - 1;
        counter.count.set(count);
        trace!(instance = %instance, count, "ref released");
        if count < 1 {
            let pending = Rc::clone(instance);
            let generation = counter.generation.get();
            self.scheduler.schedule(
                self.grace,
                Box::new(move || settle(&*pending, generation)),
            );
        }
    }
}

/// Dispose `instance` unless it was activated after the release that
/// scheduled this check.
fn settle<I: RefCounted>(instance: &I, generation: u64) {
    let counter = instance.counter();
    if counter.is_disposed() {
        return;
    }
    if counter.count() < 1 && counter.generation.get() == generation {
        instance.dispose();
    } else {
        trace!(instance = %instance, count = counter.count(), "disposal coalesced");
    }
}

impl fmt::Debug for Deferral {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferral").field("grace", &self.grace).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::{DeferredQueue, LabClock};

    struct Probe {
        counter: RefCounter,
        adds: Cell<u32>,
        disposals: Cell<u32>,
    }

    impl Probe {
        fn new() -> Rc<Self> {
            Rc::new(Self {
                counter: RefCounter::new(),
                adds: Cell::new(0),
                disposals: Cell::new(0),
            })
        }
    }

    impl fmt::Display for Probe {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("probe")
        }
    }

    impl RefCounted for Probe {
        fn counter(&self) -> &RefCounter {
            &self.counter
        }

        fn on_add(&self) {
            self.adds.set(self.adds.get() + 1);
        }

        fn on_dispose(&self) {
            self.disposals.set(self.disposals.get() + 1);
        }
    }

    fn deferral(grace_ms: u64) -> (DeferredQueue, Deferral) {
        let queue = DeferredQueue::lab(&LabClock::new());
        let deferral = Deferral {
            scheduler: Rc::new(queue.clone()),
            grace: Duration::from_millis(grace_ms),
        };
        (queue, deferral)
    }

    #[test]
    fn release_to_zero_disposes_on_a_later_turn() {
        let (queue, deferral) = deferral(0);
        let probe = Probe::new();
        probe.add();
        deferral.sub(&probe);
        assert_eq!(probe.disposals.get(), 0);
        assert_eq!(queue.pending(), 1);
        queue.tick();
        assert_eq!(probe.disposals.get(), 1);
        assert!(probe.counter.is_disposed());
    }

    #[test]
    fn reacquire_within_grace_coalesces() {
        let (queue, deferral) = deferral(10);
        let probe = Probe::new();
        probe.add();
        deferral.sub(&probe);
        queue.advance(Duration::from_millis(5));
        probe.add();
        queue.advance(Duration::from_millis(10));
        assert_eq!(probe.disposals.get(), 0);
        assert_eq!(probe.counter.count(), 1);
    }

    #[test]
    fn each_release_gets_a_full_grace_window() {
        let (queue, deferral) = deferral(100);
        let probe = Probe::new();
        probe.add();
        deferral.sub(&probe);
        queue.advance(Duration::from_millis(60));
        probe.add();
        queue.advance(Duration::from_millis(30));
        deferral.sub(&probe);
        // The first check comes due 10ms after the second release.
        queue.advance(Duration::from_millis(15));
        assert_eq!(probe.disposals.get(), 0);
        assert_eq!(queue.pending(), 1);
        queue.advance(Duration::from_millis(85));
        assert_eq!(probe.disposals.get(), 1);
    }

    #[test]
    fn disposal_happens_once() {
        let (queue, deferral) = deferral(0);
        let probe = Probe::new();
        probe.add();
        probe.add();
        deferral.sub(&probe);
        deferral.sub(&probe);
        deferral.sub(&probe);
        queue.run_until_idle();
        assert_eq!(probe.disposals.get(), 1);
        assert!(!probe.dispose());
        assert_eq!(probe.disposals.get(), 1);
    }

    #[test]
    fn disposed_instances_ignore_activation_and_release() {
        let (queue, deferral) = deferral(0);
        let probe = Probe::new();
        assert!(probe.dispose());
        probe.add();
        deferral.sub(&probe);
        assert_eq!(probe.adds.get(), 0);
        assert_eq!(probe.counter.count(), 0);
        assert!(queue.is_idle());
    }
}
