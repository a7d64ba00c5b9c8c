#![forbid(unsafe_code)]

//! Instance identity, deduplication, and dependency discovery.
//!
//! Covers:
//! 1. Scope hash functions decide which values share an instance.
//! 2. `deps` follows the baked related-scope order on every call.
//! 3. Diamond graphs resolve each dependency once per pass.
//! 4. Contract violations surface as typed errors.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use bunja_core::BunjaError;
use bunja_core::graph::Bunja;
use bunja_core::read_scope::ScopeValues;
use bunja_core::scope::{AnyScope, Scope, ScopeValue, scope_value};
use bunja_core::store::BunjaStore;

// ============================================================================
// Helpers
// ============================================================================

fn strs(deps: &[ScopeValue]) -> Vec<&'static str> {
    deps.iter()
        .map(|value| *value.downcast_ref::<&'static str>().expect("str scope"))
        .collect()
}

fn echo(scope: &Scope<&'static str>) -> Bunja<&'static str> {
    let scope = scope.clone();
    Bunja::new(move |cx| Ok(*cx.use_scope(&scope)?))
}

// ============================================================================
// 1. Hash-based deduplication
// ============================================================================

#[test]
fn length_hash_collapses_equal_lengths() {
    let store = BunjaStore::new();
    let scope = Scope::<&'static str>::with_hash(|value: &&'static str| value.len());
    let bunja = echo(&scope);

    let get = |value: &'static str| {
        store
            .get(&bunja, &ScopeValues::new().with(&scope, value))
            .unwrap()
    };
    let foo = get("foo");
    let bar = get("bar");
    let baaz = get("baaz");

    assert!(Rc::ptr_eq(&foo.value, &bar.value));
    assert_eq!(*bar.value, "foo");
    assert_eq!(foo.instance_id(), bar.instance_id());
    assert!(!Rc::ptr_eq(&foo.value, &baaz.value));
    assert_eq!(*baaz.value, "baaz");
    assert_eq!(store.stats().bunja_instances, 2);
    assert_eq!(store.stats().scope_instances, 2);
}

#[test]
fn equal_values_resolve_to_the_same_instance() {
    let scope = Scope::<u32>::new();
    let bunja = {
        let scope = scope.clone();
        Bunja::new(move |cx| Ok(*cx.use_scope(&scope)? * 10))
    };
    let ids = |order: &[u32]| {
        let store = BunjaStore::new();
        order
            .iter()
            .map(|value| {
                let resolved = store
                    .get(&bunja, &ScopeValues::new().with(&scope, *value))
                    .unwrap();
                (*value, resolved.instance_id().to_string(), *resolved.value)
            })
            .collect::<Vec<_>>()
    };

    let resolved = ids(&[1, 2, 1, 2]);
    assert_eq!(resolved[0], resolved[2]);
    assert_eq!(resolved[1], resolved[3]);
    assert_ne!(resolved[0].1, resolved[1].1);
    assert_eq!(resolved[1].2, 20);
}

#[test]
fn stores_share_definitions_but_not_instances() {
    let runs = Rc::new(Cell::new(0));
    let bunja = {
        let runs = Rc::clone(&runs);
        Bunja::new(move |_| {
            runs.set(runs.get() + 1);
            Ok(Cell::new(0))
        })
    };
    let one = BunjaStore::new();
    let two = BunjaStore::new();
    let a = one.get(&bunja, &ScopeValues::new()).unwrap();
    let b = two.get(&bunja, &ScopeValues::new()).unwrap();
    a.value.set(5);
    assert_eq!(b.value.get(), 0);
    assert_eq!(runs.get(), 2);
    assert_eq!(a.instance_id(), b.instance_id());
}

// ============================================================================
// 2. deps ordering
// ============================================================================

#[test]
fn deps_follow_related_scope_order() {
    let route = Scope::<&'static str>::new().with_label("route");
    let user = Scope::<&'static str>::new().with_label("user");
    let theme = Scope::<&'static str>::new().with_label("theme");

    let session = {
        let user = user.clone();
        Bunja::new(move |cx| Ok(format!("session:{}", cx.use_scope(&user)?)))
    };
    let page = {
        let (route, theme, session) = (route.clone(), theme.clone(), session.clone());
        Bunja::new(move |cx| {
            let theme = cx.use_scope(&theme)?;
            let route = cx.use_scope(&route)?;
            let session = cx.use_bunja(&session)?;
            Ok(format!("{route}/{theme}/{session}"))
        })
    };

    let values = ScopeValues::new()
        .with(&route, "home")
        .with(&user, "ada")
        .with(&theme, "dark");
    let store = BunjaStore::new();
    let first = store.get(&page, &values).unwrap();
    assert_eq!(first.value.as_str(), "home/dark/session:ada");
    assert_eq!(strs(&first.deps), ["ada", "dark", "home"]);

    let second = store.get(&page, &values).unwrap();
    assert_eq!(strs(&second.deps), strs(&first.deps));
    assert!(Rc::ptr_eq(&first.value, &second.value));

    let session_only = store.get(&session, &values).unwrap();
    assert_eq!(strs(&session_only.deps), ["ada"]);
}

#[test]
fn cached_parent_still_joins_the_mount_closure() {
    let store = BunjaStore::new();
    let base = Bunja::new(|_| Ok(1u8));
    let mid = {
        let base = base.clone();
        Bunja::new(move |cx| Ok(*cx.use_bunja(&base)? + 1))
    };
    let top = {
        let mid = mid.clone();
        Bunja::new(move |cx| Ok(*cx.use_bunja(&mid)? + 1))
    };

    store.get(&mid, &ScopeValues::new()).unwrap();
    let resolved = store.get(&top, &ScopeValues::new()).unwrap();
    assert_eq!(*resolved.value, 3);
    let related: Vec<_> = top
        .erased()
        .related_bunjas()
        .unwrap()
        .iter()
        .map(|bunja| bunja.id())
        .collect();
    assert_eq!(related, [base.id(), mid.id()]);
    assert!(format!("{:?}", resolved.mount).contains("dependencies: 2"));
}

// ============================================================================
// 3. Diamond graphs
// ============================================================================

#[test]
fn diamond_initializes_shared_root_once() {
    let runs = Rc::new(Cell::new(0));
    let root = {
        let runs = Rc::clone(&runs);
        Bunja::new(move |_| {
            runs.set(runs.get() + 1);
            Ok(Cell::new(0u32))
        })
    };
    let left = {
        let root = root.clone();
        Bunja::new(move |cx| cx.use_bunja(&root))
    };
    let right = {
        let root = root.clone();
        Bunja::new(move |cx| cx.use_bunja(&root))
    };
    let join = {
        let (left, right) = (left.clone(), right.clone());
        Bunja::new(move |cx| Ok((cx.use_dep(&left)?, cx.use_dep(&right)?)))
    };

    let store = BunjaStore::new();
    let resolved = store.get(&join, &ScopeValues::new()).unwrap();
    let (l, r) = &*resolved.value;
    l.set(9);
    assert_eq!(r.get(), 9);
    assert_eq!(runs.get(), 1);
    assert_eq!(store.stats().bunja_instances, 4);
}

#[test]
fn initializer_sees_the_bunja_it_builds() {
    let seen = Rc::new(RefCell::new(None));
    let bunja = {
        let seen = Rc::clone(&seen);
        Bunja::new(move |cx| {
            let me = cx.bunja();
            *seen.borrow_mut() = Some((me.id(), me.debug_label(), me.value_type()));
            Ok(5u32)
        })
        .with_label("five")
    };

    let store = BunjaStore::new();
    let resolved = store.get(&bunja, &ScopeValues::new()).unwrap();
    assert_eq!(*resolved.value, 5);
    let (id, label, value_type) = seen.borrow().clone().expect("initializer ran");
    assert_eq!(id, bunja.id());
    assert_eq!(label, "five");
    assert_eq!(value_type, "u32");
}

// ============================================================================
// 4. Errors
// ============================================================================

#[test]
fn baked_initializer_cannot_reach_new_dependencies() {
    let flag = Rc::new(Cell::new(false));
    let extra = Scope::<u8>::new().with_label("extra");
    let bunja = {
        let (flag, extra) = (Rc::clone(&flag), extra.clone());
        Bunja::new(move |cx| {
            if flag.get() {
                cx.use_scope(&extra)?;
            }
            Ok(())
        })
        .with_label("conditional")
    };

    let store = BunjaStore::new();
    store.get(&bunja, &ScopeValues::new()).unwrap();
    store.dispose();
    flag.set(true);

    let err = store
        .get(&bunja, &ScopeValues::new().with(&extra, 1))
        .unwrap_err();
    match err {
        BunjaError::UndeclaredDependency { bunja, dependency } => {
            assert!(bunja.ends_with("- conditional]"));
            assert!(dependency.ends_with("- extra]"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn baked_initializer_cannot_reach_new_bunjas() {
    let flag = Rc::new(Cell::new(false));
    let extra = Bunja::new(|_| Ok(1u8)).with_label("extra");
    let bunja = {
        let (flag, extra) = (Rc::clone(&flag), extra.clone());
        Bunja::new(move |cx| {
            if flag.get() {
                cx.use_bunja(&extra)?;
            }
            Ok(())
        })
        .with_label("conditional")
    };

    let store = BunjaStore::new();
    store.get(&bunja, &ScopeValues::new()).unwrap();
    store.dispose();
    flag.set(true);

    let err = store.get(&bunja, &ScopeValues::new()).unwrap_err();
    match err {
        BunjaError::UndeclaredDependency { bunja, dependency } => {
            assert!(bunja.ends_with("- conditional]"));
            assert!(dependency.ends_with("- extra]"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!store.contains(&format!("{}:", extra.id())));
}

#[test]
fn missing_scope_value_is_unavailable() {
    let scope = Scope::<&'static str>::new().with_label("tenant");
    let store = BunjaStore::new();
    let err = store.get(&echo(&scope), &ScopeValues::new()).unwrap_err();
    assert_eq!(
        err,
        BunjaError::ScopeUnavailable {
            scope: scope.to_string()
        }
    );
}

#[test]
fn mistyped_scope_value_is_rejected() {
    let scope = Scope::<&'static str>::new();
    let store = BunjaStore::new();
    let wrong = |_: &AnyScope| Some(scope_value(7u64));
    let err = store.get(&echo(&scope), &wrong).unwrap_err();
    assert!(matches!(err, BunjaError::ScopeValueType { expected, .. } if expected.contains("str")));
}

#[test]
fn closure_reader_supplies_values() {
    let scope = Scope::<&'static str>::new();
    let store = BunjaStore::new();
    let reader = |s: &AnyScope| (s == scope.erased()).then(|| scope_value("from-closure"));
    let resolved = store.get(&echo(&scope), &reader).unwrap();
    assert_eq!(*resolved.value, "from-closure");
}
