#![forbid(unsafe_code)]

//! Depth-first topological ordering over a "has parents" relation.
//!
//! Each node is emitted after all of its parents, and at most once. The walk
//! visits roots in the given order and parents in the order each node lists
//! them, so the result is a deterministic function of the input.
//!
//! Cycles are not reported: a node already on the visited set is skipped,
//! which cuts any cycle at the point of re-entry.

use std::hash::Hash;

use ahash::AHashSet;

/// A node that can enumerate its direct parents.
pub trait HasParents: Clone {
    type Key: Eq + Hash;

    fn key(&self) -> Self::Key;

    fn parents(&self) -> Vec<Self>;
}

/// Order `nodes` and everything reachable through their parents so that
/// parents precede children.
#[must_use]
pub fn toposort<N: HasParents>(nodes: &[N]) -> Vec<N> {
    let mut visited = AHashSet::new();
    let mut result = Vec::new();
    for node in nodes {
        visit(node, &mut visited, &mut result);
    }
    result
}

fn visit<N: HasParents>(current: &N, visited: &mut AHashSet<N::Key>, result: &mut Vec<N>) {
    if !visited.insert(current.key()) {
        return;
    }
    for parent in current.parents() {
        visit(&parent, visited, result);
    }
    result.push(current.clone());
}
