#![forbid(unsafe_code)]

//! Deferred task scheduling for grace-window disposal checks.
//!
//! The store never disposes an instance synchronously inside an unmount: it
//! hands a check to a [`Scheduler`] and the host runs it on a later turn.
//! This is what lets a same-turn unmount/remount pair coalesce.
//!
//! [`DeferredQueue`] is the bundled scheduler. It keeps tasks in a min-heap
//! ordered by `(deadline, sequence)` and reads time from either the real
//! clock or a [`LabClock`], so tests can step the grace window exactly.
//!
//! # Invariants
//!
//! 1. `schedule` never runs the task synchronously.
//! 2. Tasks run in deadline order; ties run in scheduling order.
//! 3. A task scheduled by a running task runs in the same drain if it is
//!    already due.
//!
//! # Example
//!
//! ```
//! use bunja_core::schedule::{DeferredQueue, LabClock, Scheduler};
//! use std::cell::Cell;
//! use std::rc::Rc;
//! use web_time::Duration;
//!
//! let clock = LabClock::new();
//! let queue = DeferredQueue::lab(&clock);
//! let hits = Rc::new(Cell::new(0));
//! let h = Rc::clone(&hits);
//! queue.schedule(Duration::from_millis(10), Box::new(move || h.set(h.get() + 1)));
//!
//! assert_eq!(queue.tick(), 0);
//! queue.advance(Duration::from_millis(10));
//! assert_eq!(hits.get(), 1);
//! ```

use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::rc::Rc;

use web_time::{Duration, Instant};

/// A unit of deferred work.
pub type DeferredTask = Box<dyn FnOnce()>;

/// Task queue abstraction injected into a store.
pub trait Scheduler {
    /// Enqueue `task` to run no earlier than `delay` from now, on a later
    /// turn. Must not run `task` before returning.
    fn schedule(&self, delay: Duration, task: DeferredTask);

    /// Run every task whose delay has elapsed and return how many ran.
    ///
    /// Schedulers driven by their own host loop may leave this a no-op.
    fn run_due(&self) -> usize {
        0
    }
}

// ─── Time source ─────────────────────────────────────────────────────────────

/// A manually-advanceable clock for deterministic tests.
///
/// All queues sharing the same `LabClock` see the same time.
#[derive(Debug, Clone)]
pub struct LabClock {
    epoch: Instant,
    offset_us: Rc<Cell<u64>>,
}

impl LabClock {
    /// Create a new lab clock starting at `Instant::now()`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            offset_us: Rc::new(Cell::new(0)),
        }
    }

    /// Advance the lab clock by `delta`.
    pub fn advance(&self, delta: Duration) {
        let us = delta.as_micros().min(u64::MAX as u128) as u64;
        self.offset_us.set(self.offset_us.get().saturating_add(us));
    }

    /// Current lab time.
    #[must_use]
    pub fn now(&self) -> Instant {
        self.epoch + Duration::from_micros(self.offset_us.get())
    }

    fn advance_to(&self, target: Instant) {
        let now = self.now();
        if target > now {
            self.advance(target - now);
        }
    }
}

impl Default for LabClock {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
enum TimeSource {
    Real,
    Lab(LabClock),
}

impl TimeSource {
    fn now(&self) -> Instant {
        match self {
            Self::Real => Instant::now(),
            Self::Lab(clock) => clock.now(),
        }
    }
}

// ─── Queue ───────────────────────────────────────────────────────────────────

struct Entry {
    deadline: Instant,
    seq: u64,
    task: DeferredTask,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Min-heap: earliest deadline, then lowest sequence, first.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct QueueInner {
    time: TimeSource,
    heap: RefCell<BinaryHeap<Entry>>,
    next_seq: Cell<u64>,
}

/// Deadline-ordered task queue on a real or lab clock.
///
/// Cloning yields another handle to the **same** queue, so a test can keep
/// one handle while the store owns another.
#[derive(Clone)]
pub struct DeferredQueue {
    inner: Rc<QueueInner>,
}

impl DeferredQueue {
    /// A queue on the real clock. The host calls [`run_due`](Scheduler::run_due)
    /// once per turn of its own loop.
    #[must_use]
    pub fn new() -> Self {
        Self::with_time(TimeSource::Real)
    }

    /// A queue on a lab clock; time only moves through [`advance`](Self::advance)
    /// or the clock handle.
    #[must_use]
    pub fn lab(clock: &LabClock) -> Self {
        Self::with_time(TimeSource::Lab(clock.clone()))
    }

    fn with_time(time: TimeSource) -> Self {
        Self {
            inner: Rc::new(QueueInner {
                time,
                heap: RefCell::new(BinaryHeap::new()),
                next_seq: Cell::new(0),
            }),
        }
    }

    #[must_use]
    pub fn now(&self) -> Instant {
        self.inner.time.now()
    }

    /// Number of tasks not yet run.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.heap.borrow().len()
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.pending() == 0
    }

    /// Run every task already due without moving time.
    pub fn tick(&self) -> usize {
        self.drain_until(self.now())
    }

    /// Move lab time forward by `delta`, running tasks as their deadlines
    /// pass. On the real clock this only runs what is already due.
    pub fn advance(&self, delta: Duration) -> usize {
        match &self.inner.time {
            TimeSource::Lab(clock) => {
                let target = clock.now() + delta;
                let mut ran = 0;
                while let Some(deadline) = self.next_deadline().filter(|d| *d <= target) {
                    clock.advance_to(deadline);
                    ran += self.drain_until(deadline);
                }
                clock.advance_to(target);
                ran
            }
            TimeSource::Real => self.tick(),
        }
    }

    /// Run tasks until the queue is empty, moving lab time to each deadline.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        while let Some(deadline) = self.next_deadline() {
            if let TimeSource::Lab(clock) = &self.inner.time {
                clock.advance_to(deadline);
            }
            ran += self.drain_until(deadline.max(self.now()));
        }
        ran
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.inner.heap.borrow().peek().map(|entry| entry.deadline)
    }

    fn pop_due(&self, now: Instant) -> Option<DeferredTask> {
        let mut heap = self.inner.heap.borrow_mut();
        if heap.peek().is_some_and(|entry| entry.deadline <= now) {
            heap.pop().map(|entry| entry.task)
        } else {
            None
        }
    }

    fn drain_until(&self, now: Instant) -> usize {
        let mut ran = 0;
        // The heap borrow is released before each task runs, so tasks may
        // schedule more work.
        while let Some(task) = self.pop_due(now) {
            task();
            ran += 1;
        }
        ran
    }
}

impl Default for DeferredQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for DeferredQueue {
    fn schedule(&self, delay: Duration, task: DeferredTask) {
        let seq = self.inner.next_seq.get();
        self.inner.next_seq.set(seq + 1);
        let deadline = self.now() + delay;
        self.inner.heap.borrow_mut().push(Entry {
            deadline,
            seq,
            task,
        });
    }

    fn run_due(&self) -> usize {
        self.tick()
    }
}

impl fmt::Debug for DeferredQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredQueue")
            .field("time", &self.inner.time)
            .field("pending", &self.pending())
            .finish()
    }
}
