#![forbid(unsafe_code)]

//! Error type shared by the graph, the store, and initializer code.
//!
//! Every variant is a contract violation rather than a data error: nothing
//! here is retried, and the store never swallows one. Errors surface at the
//! `get` call site with the offending bunja or scope rendered through its
//! `Display` form (`[Bunja:3 - label]`).

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BunjaError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BunjaError {
    #[error("{bunja} is not baked yet")]
    NotBaked { bunja: String },

    #[error("{bunja} is already baked")]
    AlreadyBaked { bunja: String },

    #[error("{bunja} used {dependency}, which was not discovered on its first initialization")]
    UndeclaredDependency { bunja: String, dependency: String },

    #[error(
        "unable to read {scope}: inject the value explicitly or provide it from the host"
    )]
    ScopeUnavailable { scope: String },

    #[error("value supplied for {scope} is not a `{expected}`")]
    ScopeValueType { scope: String, expected: &'static str },

    #[error("instance value of {bunja} is not a `{expected}`")]
    ValueType { bunja: String, expected: &'static str },

    #[error("no instance of {scope} was resolved while identifying {bunja}")]
    MissingScopeInstance { bunja: String, scope: String },
}

impl BunjaError {
    /// Whether the error comes from reading graph data in the wrong phase.
    #[must_use]
    pub fn is_phase_error(&self) -> bool {
        matches!(self, Self::NotBaked { .. } | Self::AlreadyBaked { .. })
    }
}
