#![forbid(unsafe_code)]

//! Declarative dependency graph: bunja definitions and their ordering.
//!
//! - [`Bunja`]: a lazily-initialized shared value whose dependencies are
//!   discovered the first time its initializer runs, then frozen ("baked").
//! - [`toposort`]: parents-before-children ordering used when baking.
//!
//! # Invariants
//!
//! 1. Baking is a one-way transition; a baked bunja's parents, related
//!    bunjas, and related scopes never change.
//! 2. `related_scopes` of a baked bunja is the first-seen-ordered union of
//!    every related bunja's related scopes followed by its own scopes.
//! 3. `related_bunjas` lists each transitive parent exactly once, parents
//!    before children, and never the bunja itself.

pub mod bunja;
pub mod toposort;

pub use bunja::{AnyBunja, Bunja, BunjaId};
pub use toposort::{HasParents, toposort};
