//! Operator runtime for Kubernetes style APIs
//!
//! This crate is a facade over the kopr crates:
//! - [`core`]: client-less types such as [`ObjectRef`](core::ObjectRef), the lock record and
//!   the [`ListWatch`](core::ListWatch) / [`LockClient`](core::LockClient) traits an API client implements
//! - [`runtime`]: the watcher, cache, work queue, [`Controller`](runtime::Controller) and leader election
//!
//! ```no_run
//! use kopr::{core::DynamicObject, prelude::*, runtime::{watcher, Action, Controller}};
//! use std::sync::Arc;
//!
//! async fn reconcile(key: kopr::core::ObjectRef, lister: kopr::runtime::Lister<DynamicObject>, _ctx: Arc<()>)
//!     -> Result<Action, std::io::Error>
//! {
//!     if let Some(obj) = lister.get_ref(&key) {
//!         println!("saw {} at {:?}", obj.name_any(), obj.resource_version());
//!     }
//!     Ok(Action::await_change())
//! }
//!
//! # async fn wrapper(api: impl kopr::core::ListWatch<DynamicObject> + 'static) -> Result<(), Box<dyn std::error::Error>> {
//! Controller::new(api, watcher::Config::default())
//!     .shutdown_on_signal()
//!     .run(reconcile, Arc::new(()))
//!     .await?;
//! # Ok(())
//! # }
//! ```
#![cfg_attr(docsrs, feature(doc_cfg))]

#[doc(inline)]
pub use kopr_core as core;

#[cfg(feature = "runtime")]
#[cfg_attr(docsrs, doc(cfg(feature = "runtime")))]
#[doc(inline)]
pub use kopr_runtime as runtime;

pub use crate::core::{Resource, ResourceExt};

/// Traits and types most operators import
pub mod prelude {
    pub use crate::core::{Resource, ResourceExt};
    #[cfg(feature = "runtime")]
    pub use crate::runtime::WatchStreamExt;
}

#[cfg(all(test, feature = "runtime"))]
mod test {
    use crate::{
        core::{dynamic::ApiResource, DynamicObject, ObjectRef},
        runtime::{informer::NamespaceScope, watcher, Dispatcher, Informer},
    };
    use kopr_test::MemoryCluster;

    #[tokio::test]
    async fn facade_exposes_a_working_runtime() {
        let cluster = MemoryCluster::new();
        cluster.apply(DynamicObject::new("a", &ApiResource::new("v1", "ConfigMap")).within("apps"));
        let informer = Informer::spawn(
            cluster,
            &watcher::Config::default(),
            &NamespaceScope::All,
            &Dispatcher::without_queue(),
        );
        informer.wait_until_ready().await.unwrap();
        assert!(informer.lister().get_ref(&ObjectRef::new("a").within("apps")).is_some());
    }
}
