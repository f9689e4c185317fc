use super::{store::WriterDropped, Store};
use ahash::AHashMap;
use kopr_core::{ObjectRef, Resource, ResourceExt};
use std::{collections::BTreeMap, sync::Arc};

/// Namespace-partitioned view over the [`Store`]s of one resource type
///
/// Each watched namespace has its own store, and the store keyed by `None` covers every
/// namespace (or a cluster-scoped type). Lookups are routed to the owning store and lists
/// are merged. The stores are filled by their own reflectors; the indexer only reads them.
#[derive(Debug)]
pub struct Indexer<K> {
    stores: Arc<AHashMap<Option<String>, Store<K>>>,
}

impl<K> Clone for Indexer<K> {
    fn clone(&self) -> Self {
        Self {
            stores: self.stores.clone(),
        }
    }
}

impl<K> FromIterator<(Option<String>, Store<K>)> for Indexer<K> {
    fn from_iter<T: IntoIterator<Item = (Option<String>, Store<K>)>>(iter: T) -> Self {
        Self {
            stores: Arc::new(iter.into_iter().collect()),
        }
    }
}

impl<K: Resource + Clone> Indexer<K> {
    /// Look `key` up in the store owning its namespace, falling back to the all-namespaces store
    #[must_use]
    pub fn get(&self, key: &ObjectRef) -> Option<Arc<K>> {
        let owner = self.stores.get(&key.namespace);
        let everything = self.stores.get(&None::<String>);
        owner
            .and_then(|store| store.get(key))
            .or_else(|| everything.and_then(|store| store.get(key)))
    }

    /// Every cached object in `namespace`, or in all namespaces for `None`, ordered by key
    #[must_use]
    pub fn list(&self, namespace: Option<&str>) -> Vec<Arc<K>> {
        let mut merged = BTreeMap::new();
        for (store_namespace, store) in self.stores.iter() {
            match (namespace, store_namespace.as_deref()) {
                (Some(ns), Some(store_ns)) if ns != store_ns => continue,
                _ => {}
            }
            for obj in store.state() {
                if namespace.is_none() || obj.meta().namespace.as_deref() == namespace {
                    merged.insert(obj.object_ref(), obj);
                }
            }
        }
        merged.into_values().collect()
    }

    /// The namespaces with a dedicated store, `None` standing for the all-namespaces store
    pub fn namespaces(&self) -> impl Iterator<Item = Option<&str>> {
        self.stores.keys().map(Option::as_deref)
    }

    /// Wait until every store has applied its first list
    pub async fn wait_until_ready(&self) -> Result<(), WriterDropped> {
        for store in self.stores.values() {
            store.wait_until_ready().await?;
        }
        Ok(())
    }

    /// Whether every store has applied its first list
    pub fn is_ready(&self) -> bool {
        self.stores.values().all(Store::is_ready)
    }

    /// A read-only [`Lister`] over this indexer
    #[must_use]
    pub fn lister(&self) -> Lister<K> {
        Lister { indexer: self.clone() }
    }
}

/// Read-only access to cached objects for reconcilers
///
/// Reads never block on the cluster. An object that was deleted, or has not been observed yet,
/// is simply absent.
#[derive(Debug)]
pub struct Lister<K> {
    indexer: Indexer<K>,
}

impl<K> Clone for Lister<K> {
    fn clone(&self) -> Self {
        Self {
            indexer: self.indexer.clone(),
        }
    }
}

impl<K: Resource + Clone> Lister<K> {
    /// Get an object by namespace (`None` when cluster-scoped) and name
    #[must_use]
    pub fn get(&self, namespace: Option<&str>, name: &str) -> Option<Arc<K>> {
        let key = ObjectRef {
            namespace: namespace.map(String::from),
            name: name.to_string(),
        };
        self.indexer.get(&key)
    }

    /// Get an object by key
    #[must_use]
    pub fn get_ref(&self, key: &ObjectRef) -> Option<Arc<K>> {
        self.indexer.get(key)
    }

    /// List cached objects in `namespace`, or everywhere for `None`
    #[must_use]
    pub fn list(&self, namespace: Option<&str>) -> Vec<Arc<K>> {
        self.indexer.list(namespace)
    }
}

#[cfg(test)]
mod tests {
    use super::Indexer;
    use crate::{reflector::store, watcher::Event};
    use kopr_core::{dynamic::ApiResource, DynamicObject, ObjectRef, ResourceExt};

    fn cm(ns: &str, name: &str) -> DynamicObject {
        let mut obj = DynamicObject::new(name, &ApiResource::new("v1", "ConfigMap")).within(ns);
        obj.metadata.resource_version = Some("1".into());
        obj
    }

    fn names(objs: &[std::sync::Arc<DynamicObject>]) -> Vec<String> {
        objs.iter().map(|o| o.object_ref().to_string()).collect()
    }

    #[test]
    fn routes_and_merges_across_namespace_stores() {
        let (apps, mut apps_w) = store();
        let (infra, mut infra_w) = store();
        apps_w.replay(&Event::Restarted(vec![cm("apps", "a"), cm("apps", "b")]));
        infra_w.replay(&Event::Restarted(vec![cm("infra", "c")]));
        let indexer: Indexer<DynamicObject> =
            [(Some("apps".to_string()), apps), (Some("infra".to_string()), infra)]
                .into_iter()
                .collect();

        assert_eq!(names(&indexer.list(None)), ["a.apps", "b.apps", "c.infra"]);
        assert_eq!(names(&indexer.list(Some("infra"))), ["c.infra"]);
        assert!(indexer.list(Some("other")).is_empty());
        assert!(indexer.get(&ObjectRef::new("c").within("infra")).is_some());
        assert!(indexer.get(&ObjectRef::new("c").within("apps")).is_none());
        assert!(indexer.is_ready());
    }

    #[test]
    fn all_namespaces_store_serves_every_namespace() {
        let (all, mut all_w) = store();
        all_w.replay(&Event::Restarted(vec![cm("apps", "a"), cm("infra", "c")]));
        let indexer: Indexer<DynamicObject> = [(None, all)].into_iter().collect();
        let lister = indexer.lister();
        assert_eq!(lister.get(Some("apps"), "a").unwrap().name_any(), "a");
        assert!(lister.get(Some("infra"), "a").is_none());
        assert_eq!(names(&lister.list(Some("infra"))), ["c.infra"]);
        assert_eq!(lister.list(None).len(), 2);
    }

    #[tokio::test]
    async fn ready_once_every_store_listed() {
        let (apps, mut apps_w) = store::<DynamicObject>();
        let (infra, mut infra_w) = store();
        let indexer: Indexer<DynamicObject> =
            [(Some("apps".to_string()), apps), (Some("infra".to_string()), infra)]
                .into_iter()
                .collect();
        apps_w.replay(&Event::Restarted(vec![]));
        assert!(!indexer.is_ready());
        infra_w.replay(&Event::Restarted(vec![]));
        indexer.wait_until_ready().await.unwrap();
    }
}
