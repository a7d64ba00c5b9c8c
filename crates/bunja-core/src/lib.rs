#![forbid(unsafe_code)]

//! Core: scopes, bunja graphs, instance lifetimes, and the store.

pub mod error;
pub mod graph;
pub mod lifecycle;
pub mod read_scope;
pub mod schedule;
pub mod scope;
pub mod store;

pub use error::{BunjaError, Result};
