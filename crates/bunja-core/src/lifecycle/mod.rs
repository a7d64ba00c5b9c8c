#![forbid(unsafe_code)]

//! Materialized instances and their reference-counted lifetimes.
//!
//! A store creates one [`ScopeInstance`] per `(scope, derived key)` pair and
//! one [`BunjaInstance`] per instance identity. Both share the counting
//! protocol in [`ref_counter`]: increments are synchronous, and a decrement
//! to zero only schedules a check that disposes the instance if nothing
//! re-acquired it during the grace window.
//!
//! # Invariants
//!
//! 1. An instance is disposed at most once; later activations and
//!    decrements are no-ops.
//! 2. A bunja instance runs its effects at most once, on its first
//!    activation, and runs their cleanups exactly once on disposal.
//! 3. Disposal removes the instance from its owner only if the owner still
//!    maps its key to that same instance.
//!
//! # Failure Modes
//!
//! - Panics from user effects or cleanups propagate to whoever triggered
//!   activation or disposal; the instance stays marked as disposed.

mod instance;
pub(crate) mod ref_counter;

pub use instance::{Cleanup, InstanceId, ScopeInstanceId, Teardown};
pub(crate) use instance::{BunjaInstance, EffectFn, InstanceOwner, ScopeInstance};
pub(crate) use ref_counter::{Deferral, RefCounted};
