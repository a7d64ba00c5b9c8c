#![forbid(unsafe_code)]

//! bunja public facade crate.
//!
//! Scoped singletons whose dependencies are discovered on first use and
//! whose lifetimes follow mount/unmount reference counts.
//!
//! ```
//! use bunja::prelude::*;
//!
//! let tenant = Scope::<String>::new().with_label("tenant");
//! let settings = Bunja::new({
//!     let tenant = tenant.clone();
//!     move |cx: &InitCx<'_>| Ok(format!("settings for {}", cx.use_scope(&tenant)?))
//! });
//!
//! let store = BunjaStore::new();
//! let values = ScopeValues::new().with(&tenant, "acme".to_owned());
//! let resolved = store.get(&settings, &values).unwrap();
//! assert_eq!(resolved.value.as_str(), "settings for acme");
//!
//! let guard = resolved.mount.mount();
//! guard.unmount();
//! ```

pub use bunja_core as core;

pub mod prelude {
    pub use bunja_core::error::{BunjaError, Result};
    pub use bunja_core::graph::Bunja;
    pub use bunja_core::read_scope::{ReadScope, ScopeValues};
    pub use bunja_core::schedule::{DeferredQueue, LabClock, Scheduler};
    pub use bunja_core::scope::{Scope, ScopeBinding};
    pub use bunja_core::store::{
        BunjaStore, Dependency, InitCx, Mount, MountGuard, Resolved, StoreConfig, WrapInstance,
    };
}
