#![no_main]

use std::cell::Cell;
use std::rc::Rc;

use arbitrary::Arbitrary;
use bunja_core::graph::Bunja;
use bunja_core::read_scope::ScopeValues;
use bunja_core::schedule::{DeferredQueue, LabClock};
use bunja_core::scope::Scope;
use bunja_core::store::{BunjaStore, InitCx, MountGuard, StoreConfig};
use libfuzzer_sys::fuzz_target;
use web_time::Duration;

#[derive(Arbitrary, Debug)]
enum FuzzOp {
    Mount { bunja: u8, tenant: u8 },
    Unmount { slot: u8 },
    UnmountAfter { slot: u8, ms: u8 },
    Tick,
    Advance { ms: u8 },
    DisposeStore,
}

#[derive(Arbitrary, Debug)]
struct FuzzInput {
    grace_ms: u8,
    ops: Vec<FuzzOp>,
}

fuzz_target!(|input: FuzzInput| {
    let live = Rc::new(Cell::new(0i64));
    let track = {
        let live = Rc::clone(&live);
        move |cx: &InitCx<'_>| {
            let live = Rc::clone(&live);
            cx.effect(move || {
                live.set(live.get() + 1);
                move || live.set(live.get() - 1)
            });
        }
    };

    let tenant = Scope::<u8>::with_hash(|v: &u8| v % 4);
    let base = {
        let (tenant, track) = (tenant.clone(), track.clone());
        Bunja::new(move |cx| {
            track(cx);
            Ok(*cx.use_scope(&tenant)?)
        })
    };
    let mid = {
        let (base, track) = (base.clone(), track.clone());
        Bunja::new(move |cx| {
            track(cx);
            Ok(cx.use_bunja(&base)?.wrapping_add(1))
        })
    };
    let forking = {
        let (mid, tenant, track) = (mid.clone(), tenant.clone(), track.clone());
        Bunja::new(move |cx| {
            track(cx);
            let left = cx.fork(&mid, [tenant.bind(1)])?;
            let right = cx.fork(&mid, [tenant.bind(2)])?;
            Ok(left.wrapping_add(*right))
        })
    };
    let bunjas = [base, mid, forking];

    let queue = DeferredQueue::lab(&LabClock::new());
    let store = BunjaStore::with_config(
        StoreConfig::default()
            .with_grace(Duration::from_millis(u64::from(input.grace_ms)))
            .with_scheduler(queue.clone()),
    );
    let mut guards: Vec<MountGuard> = Vec::new();

    for op in input.ops.into_iter().take(256) {
        match op {
            FuzzOp::Mount { bunja, tenant: value } => {
                let values = ScopeValues::new().with(&tenant, value);
                let bunja = &bunjas[usize::from(bunja) % bunjas.len()];
                if let Ok(resolved) = store.get(bunja, &values) {
                    guards.push(resolved.mount.mount());
                }
            }
            FuzzOp::Unmount { slot } => {
                if !guards.is_empty() {
                    let slot = usize::from(slot) % guards.len();
                    guards.swap_remove(slot).unmount();
                }
            }
            FuzzOp::UnmountAfter { slot, ms } => {
                if !guards.is_empty() {
                    let slot = usize::from(slot) % guards.len();
                    guards
                        .swap_remove(slot)
                        .unmount_after(&queue, Duration::from_millis(u64::from(ms)));
                }
            }
            FuzzOp::Tick => {
                queue.tick();
            }
            FuzzOp::Advance { ms } => {
                queue.advance(Duration::from_millis(u64::from(ms)));
            }
            FuzzOp::DisposeStore => store.dispose(),
        }
        assert!(live.get() >= 0, "more cleanups than setups");
    }

    drop(guards);
    queue.run_until_idle();
    assert_eq!(live.get(), 0, "setups left without cleanup");
    assert_eq!(store.stats().bunja_instances, 0);
    assert_eq!(store.stats().scope_instances, 0);
});
