use crate::watcher;
use ahash::AHashMap;
use kopr_core::{resource_version, ObjectRef, Resource, ResourceExt};
use parking_lot::RwLock;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

type Cache<K> = Arc<RwLock<AHashMap<ObjectRef, Arc<K>>>>;

/// A change to the store, as handed to event handlers
#[derive(Debug, PartialEq)]
pub enum Delta<K> {
    /// The object was not cached before
    Added(Arc<K>),
    /// The object replaced an older cached version
    ///
    /// `old` and `new` are the same object when a resync touched an unchanged object.
    Modified { old: Option<Arc<K>>, new: Arc<K> },
    /// The object left the store
    Deleted {
        obj: Arc<K>,
        /// The delete was inferred from a relist, so `obj` is the last state this store saw
        /// rather than the final state of the object
        tombstone_uncertain: bool,
    },
}

impl<K> Clone for Delta<K> {
    fn clone(&self) -> Self {
        match self {
            Delta::Added(obj) => Delta::Added(obj.clone()),
            Delta::Modified { old, new } => Delta::Modified {
                old: old.clone(),
                new: new.clone(),
            },
            Delta::Deleted {
                obj,
                tombstone_uncertain,
            } => Delta::Deleted {
                obj: obj.clone(),
                tombstone_uncertain: *tombstone_uncertain,
            },
        }
    }
}

impl<K: Resource> Delta<K> {
    /// The latest known state of the object
    pub fn object(&self) -> &Arc<K> {
        match self {
            Delta::Added(obj) | Delta::Modified { new: obj, .. } | Delta::Deleted { obj, .. } => obj,
        }
    }

    /// The key of the changed object
    pub fn object_ref(&self) -> ObjectRef {
        self.object().object_ref()
    }
}

/// A writable Store handle
///
/// This is exclusive since it's not safe to share a single `Store` between multiple reflectors.
/// In particular, `Restarted` events will clobber the state of other connected reflectors.
#[derive(Debug)]
pub struct Writer<K> {
    store: Cache<K>,
    ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
}

impl<K> Default for Writer<K> {
    fn default() -> Self {
        let (ready_tx, ready_rx) = watch::channel(false);
        Self {
            store: Arc::default(),
            ready_tx,
            ready_rx,
        }
    }
}

impl<K: Resource + Clone> Writer<K> {
    /// Return a read handle to the store
    ///
    /// Multiple read handles may be obtained, by either calling `as_reader` multiple times,
    /// or by calling `Store::clone()` afterwards.
    #[must_use]
    pub fn as_reader(&self) -> Store<K> {
        Store {
            store: self.store.clone(),
            ready_rx: self.ready_rx.clone(),
        }
    }

    /// Applies a single watcher event to the store, returning what effectively changed
    ///
    /// Replaying an event whose resource version is not newer than the cached one changes nothing,
    /// so duplicated deliveries are harmless.
    pub fn replay(&mut self, event: &watcher::Event<K>) -> Vec<Delta<K>> {
        let deltas = match event {
            watcher::Event::Applied(obj) => self.apply(obj).into_iter().collect(),
            watcher::Event::Deleted(obj) => {
                let removed = self.store.write().remove(&obj.object_ref());
                removed
                    .map(|_| Delta::Deleted {
                        obj: Arc::new(obj.clone()),
                        tombstone_uncertain: false,
                    })
                    .into_iter()
                    .collect()
            }
            watcher::Event::Restarted(objs) => self.relist(objs, false),
            watcher::Event::Resynced(objs) => self.relist(objs, true),
        };
        if matches!(event, watcher::Event::Restarted(_) | watcher::Event::Resynced(_)) {
            self.ready_tx.send_replace(true);
        }
        deltas
    }

    fn apply(&mut self, obj: &K) -> Option<Delta<K>> {
        let key = obj.object_ref();
        let mut store = self.store.write();
        let newer = store.get(&key).map(|cached| {
            resource_version::is_newer(
                obj.meta().resource_version.as_deref(),
                cached.meta().resource_version.as_deref(),
            )
        });
        match newer {
            None => {
                let obj = Arc::new(obj.clone());
                store.insert(key, obj.clone());
                Some(Delta::Added(obj))
            }
            Some(true) => {
                let new = Arc::new(obj.clone());
                let old = store.insert(key, new.clone());
                Some(Delta::Modified { old, new })
            }
            Some(false) => {
                tracing::trace!(object = %key, "ignoring stale or duplicate event");
                None
            }
        }
    }

    /// Replace the whole store with a fresh list
    ///
    /// The list is authoritative: afterwards the store holds exactly its items.
    fn relist(&mut self, objs: &[K], resync: bool) -> Vec<Delta<K>> {
        let mut store = self.store.write();
        let mut previous = std::mem::take(&mut *store);
        let mut deltas = Vec::with_capacity(objs.len());
        for obj in objs {
            let key = obj.object_ref();
            match previous.remove(&key) {
                None => {
                    let obj = Arc::new(obj.clone());
                    store.insert(key, obj.clone());
                    deltas.push(Delta::Added(obj));
                }
                Some(cached) if cached.meta().resource_version == obj.meta().resource_version => {
                    store.insert(key, cached.clone());
                    if resync {
                        deltas.push(Delta::Modified {
                            old: Some(cached.clone()),
                            new: cached,
                        });
                    }
                }
                Some(cached) => {
                    let new = Arc::new(obj.clone());
                    store.insert(key, new.clone());
                    deltas.push(Delta::Modified {
                        old: Some(cached),
                        new,
                    });
                }
            }
        }
        let mut missing: Vec<_> = previous.into_iter().collect();
        missing.sort_by(|(a, _), (b, _)| a.cmp(b));
        deltas.extend(missing.into_iter().map(|(_, obj)| Delta::Deleted {
            obj,
            tombstone_uncertain: true,
        }));
        deltas
    }
}

/// The [`Writer`] was dropped before the store ever became ready
#[derive(Debug, Error)]
#[error("writer dropped before the store was ready")]
pub struct WriterDropped(());

/// A readable cache of objects of kind `K`
///
/// Cloning will produce a new reference to the same backing store.
///
/// Cannot be constructed directly since one writer handle is required,
/// use `Writer::as_reader()` instead.
#[derive(Debug)]
pub struct Store<K> {
    store: Cache<K>,
    ready_rx: watch::Receiver<bool>,
}

impl<K> Clone for Store<K> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            ready_rx: self.ready_rx.clone(),
        }
    }
}

impl<K: Resource + Clone> Store<K> {
    /// Wait for the store to be populated by the first list
    ///
    /// Resolves immediately once a `Restarted` event has been applied.
    pub async fn wait_until_ready(&self) -> Result<(), WriterDropped> {
        let mut ready_rx = self.ready_rx.clone();
        ready_rx.wait_for(|ready| *ready).await.map_err(|_| WriterDropped(()))?;
        Ok(())
    }

    /// Whether the first list has been applied
    pub fn is_ready(&self) -> bool {
        *self.ready_rx.borrow()
    }

    /// Retrieve the entry referred to by `key`, if it is in the cache.
    ///
    /// `key.namespace` is ignored for cluster-scoped resources.
    ///
    /// Note that this is a cache and may be stale. Deleted objects may still exist in the cache
    /// despite having been deleted in the cluster, and new objects may not yet exist in the cache.
    /// If any of these are a problem for you then you should abort your reconciler and retry later.
    #[must_use]
    pub fn get(&self, key: &ObjectRef) -> Option<Arc<K>> {
        let store = self.store.read();
        store
            .get(key)
            // Try to erase the namespace and try again, in case the object is cluster-scoped
            .or_else(|| {
                key.namespace.as_ref()?;
                store.get(&ObjectRef::new(&key.name))
            })
            .cloned()
    }

    /// Return a full snapshot of the current values
    #[must_use]
    pub fn state(&self) -> Vec<Arc<K>> {
        self.store.read().values().cloned().collect()
    }

    /// Retrieve a value from the store whose `predicate` returns true
    #[must_use]
    pub fn find<P>(&self, predicate: P) -> Option<Arc<K>>
    where
        P: Fn(&K) -> bool,
    {
        self.store.read().values().find(|k| predicate(k.as_ref())).cloned()
    }

    /// Return the number of elements in the store
    #[must_use]
    pub fn len(&self) -> usize {
        self.store.read().len()
    }

    /// Return whether the store is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.store.read().is_empty()
    }
}

/// Create a (Reader, Writer) for a `Store<K>` for a typed resource `K`
///
/// The `Writer` should be passed to a [`reflector`](crate::reflector()),
/// and the [`Store`] is a read-only handle.
#[must_use]
pub fn store<K: Resource + Clone>() -> (Store<K>, Writer<K>) {
    let w = Writer::default();
    let r = w.as_reader();
    (r, w)
}
