#![forbid(unsafe_code)]

//! Bunja definitions and the bake transition.

use std::any::{Any, type_name};
use std::cell::RefCell;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use super::toposort::{HasParents, toposort};
use crate::error::{BunjaError, Result};
use crate::lifecycle::{InstanceId, ScopeInstanceId};
use crate::scope::AnyScope;
use crate::store::InitCx;

static NEXT_BUNJA_ID: AtomicU64 = AtomicU64::new(0);

/// Process-unique identifier of a [`Bunja`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BunjaId(u64);

impl BunjaId {
    fn next() -> Self {
        Self(NEXT_BUNJA_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw id value.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for BunjaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

type InitFn = dyn Fn(&InitCx<'_>) -> Result<Rc<dyn Any>>;

enum BunjaPhase {
    Unbaked {
        parents: Vec<AnyBunja>,
        scopes: Vec<AnyScope>,
    },
    Baked {
        parents: Rc<[AnyBunja]>,
        related_bunjas: Rc<[AnyBunja]>,
        related_scopes: Rc<[AnyScope]>,
    },
}

struct BunjaNode {
    id: BunjaId,
    debug_label: RefCell<String>,
    value_type: &'static str,
    init: Box<InitFn>,
    phase: RefCell<BunjaPhase>,
}

/// A bunja with its value type erased, as stored in dependency graphs.
///
/// Equality and hashing go by [`BunjaId`].
#[derive(Clone)]
pub struct AnyBunja {
    node: Rc<BunjaNode>,
}

impl AnyBunja {
    #[must_use]
    pub fn id(&self) -> BunjaId {
        self.node.id
    }

    #[must_use]
    pub fn debug_label(&self) -> String {
        self.node.debug_label.borrow().clone()
    }

    pub fn set_debug_label(&self, label: impl Into<String>) {
        *self.node.debug_label.borrow_mut() = label.into();
    }

    /// Name of the value type the initializer produces.
    #[must_use]
    pub fn value_type(&self) -> &'static str {
        self.node.value_type
    }

    #[must_use]
    pub fn is_baked(&self) -> bool {
        matches!(*self.node.phase.borrow(), BunjaPhase::Baked { .. })
    }

    /// Direct parents: the frozen list once baked, otherwise a snapshot of
    /// the parents discovered so far, in discovery order.
    #[must_use]
    pub fn parents(&self) -> Vec<AnyBunja> {
        match &*self.node.phase.borrow() {
            BunjaPhase::Unbaked { parents, .. } => parents.clone(),
            BunjaPhase::Baked { parents, .. } => parents.to_vec(),
        }
    }

    /// Transitive parents in dependency order, excluding `self`.
    pub fn related_bunjas(&self) -> Result<Rc<[AnyBunja]>> {
        match &*self.node.phase.borrow() {
            BunjaPhase::Baked { related_bunjas, .. } => Ok(Rc::clone(related_bunjas)),
            BunjaPhase::Unbaked { .. } => Err(self.not_baked()),
        }
    }

    /// Every scope this bunja depends on, directly or through its parents.
    pub fn related_scopes(&self) -> Result<Rc<[AnyScope]>> {
        match &*self.node.phase.borrow() {
            BunjaPhase::Baked { related_scopes, .. } => Ok(Rc::clone(related_scopes)),
            BunjaPhase::Unbaked { .. } => Err(self.not_baked()),
        }
    }

    /// Record a parent discovered during the first initialization.
    /// No-op once baked.
    pub fn add_parent(&self, parent: &AnyBunja) {
        if let BunjaPhase::Unbaked { parents, .. } = &mut *self.node.phase.borrow_mut()
            && !parents.contains(parent)
        {
            parents.push(parent.clone());
        }
    }

    /// Record a scope discovered during the first initialization.
    /// No-op once baked.
    pub fn add_scope(&self, scope: &AnyScope) {
        if let BunjaPhase::Unbaked { scopes, .. } = &mut *self.node.phase.borrow_mut()
            && !scopes.contains(scope)
        {
            scopes.push(scope.clone());
        }
    }

    /// Freeze the discovered graph.
    ///
    /// Every parent must already be baked, which the store guarantees by
    /// resolving parents before their children finish initializing.
    pub fn bake(&self) -> Result<()> {
        let (parents, own_scopes) = match &*self.node.phase.borrow() {
            BunjaPhase::Unbaked { parents, scopes } => (parents.clone(), scopes.clone()),
            BunjaPhase::Baked { .. } => {
                return Err(BunjaError::AlreadyBaked {
                    bunja: self.to_string(),
                });
            }
        };

        let related_bunjas = toposort(&parents);
        let mut related_scopes: Vec<AnyScope> = Vec::new();
        for related in &related_bunjas {
            for scope in related.related_scopes()?.iter() {
                if !related_scopes.contains(scope) {
                    related_scopes.push(scope.clone());
                }
            }
        }
        for scope in own_scopes {
            if !related_scopes.contains(&scope) {
                related_scopes.push(scope);
            }
        }

        debug!(
            bunja = %self,
            parents = parents.len(),
            related_bunjas = related_bunjas.len(),
            related_scopes = related_scopes.len(),
            "bunja baked"
        );
        *self.node.phase.borrow_mut() = BunjaPhase::Baked {
            parents: parents.into(),
            related_bunjas: related_bunjas.into(),
            related_scopes: related_scopes.into(),
        };
        Ok(())
    }

    /// Compute the instance identity for the given scope instances:
    /// `"<bunja-id>:<scope-instance-ids of related_scopes, comma-joined>"`.
    pub fn instance_id(
        &self,
        scope_instance: impl Fn(&AnyScope) -> Option<ScopeInstanceId>,
    ) -> Result<InstanceId> {
        let related_scopes = self.related_scopes()?;
        let mut ids = Vec::with_capacity(related_scopes.len());
        for scope in related_scopes.iter() {
            let id = scope_instance(scope).ok_or_else(|| BunjaError::MissingScopeInstance {
                bunja: self.to_string(),
                scope: scope.to_string(),
            })?;
            ids.push(id.to_string());
        }
        Ok(InstanceId::new(format!("{}:{}", self.node.id, ids.join(","))))
    }

    pub(crate) fn run_init(&self, cx: &InitCx<'_>) -> Result<Rc<dyn Any>> {
        (self.node.init)(cx)
    }

    fn not_baked(&self) -> BunjaError {
        BunjaError::NotBaked {
            bunja: self.to_string(),
        }
    }
}

impl HasParents for AnyBunja {
    type Key = BunjaId;

    fn key(&self) -> BunjaId {
        self.node.id
    }

    fn parents(&self) -> Vec<Self> {
        AnyBunja::parents(self)
    }
}

impl PartialEq for AnyBunja {
    fn eq(&self, other: &Self) -> bool {
        self.node.id == other.node.id
    }
}

impl Eq for AnyBunja {}

impl Hash for AnyBunja {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.node.id.hash(state);
    }
}

impl fmt::Display for AnyBunja {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = self.node.debug_label.borrow();
        if label.is_empty() {
            write!(f, "[Bunja:{}]", self.node.id)
        } else {
            write!(f, "[Bunja:{} - {}]", self.node.id, label)
        }
    }
}

impl fmt::Debug for AnyBunja {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnyBunja")
            .field("id", &self.node.id)
            .field("debug_label", &self.node.debug_label.borrow())
            .field("baked", &self.is_baked())
            .finish()
    }
}

/// A declarative unit of lazily-initialized shared state.
///
/// The initializer receives an [`InitCx`] through which it reads other
/// bunjas and scopes, registers effects, and forks. Whatever it reads on its
/// first run becomes the bunja's permanent dependency set.
///
/// Cloning a `Bunja` yields another handle to the **same** definition.
pub struct Bunja<T> {
    erased: AnyBunja,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Bunja<T> {
    fn clone(&self) -> Self {
        Self {
            erased: self.erased.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: 'static> Bunja<T> {
    #[must_use]
    pub fn new<F>(init: F) -> Self
    where
        F: Fn(&InitCx<'_>) -> Result<T> + 'static,
    {
        let init: Box<InitFn> = Box::new(move |cx| {
            let value: Rc<dyn Any> = Rc::new(init(cx)?);
            Ok(value)
        });
        Self {
            erased: AnyBunja {
                node: Rc::new(BunjaNode {
                    id: BunjaId::next(),
                    debug_label: RefCell::new(String::new()),
                    value_type: type_name::<T>(),
                    init,
                    phase: RefCell::new(BunjaPhase::Unbaked {
                        parents: Vec::new(),
                        scopes: Vec::new(),
                    }),
                }),
            },
            _marker: PhantomData,
        }
    }

    /// Set the debug label.
    #[must_use]
    pub fn with_label(self, label: impl Into<String>) -> Self {
        self.erased.set_debug_label(label);
        self
    }

    #[must_use]
    pub fn id(&self) -> BunjaId {
        self.erased.id()
    }

    #[must_use]
    pub fn is_baked(&self) -> bool {
        self.erased.is_baked()
    }

    /// The type-erased handle of this bunja.
    #[must_use]
    pub fn erased(&self) -> &AnyBunja {
        &self.erased
    }
}

impl<T> fmt::Display for Bunja<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.erased, f)
    }
}

impl<T> fmt::Debug for Bunja<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.erased, f)
    }
}
