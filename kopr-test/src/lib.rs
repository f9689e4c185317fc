//! Test helper for kopr.
//!
//! [`MemoryCluster`] is an in-memory stand-in for the cluster API. It assigns resource versions,
//! keeps a bounded watch history (so resuming from a compacted version yields `410 Gone`),
//! filters by scope and label selector, and guards lock records with optimistic concurrency.
//! Faults can be injected to exercise the runtime's recovery paths.
use async_trait::async_trait;
use futures::{channel::mpsc, stream, StreamExt};
use kopr_core::{
    client::WatchStream,
    labels::Selector,
    metadata::ListMeta,
    watch::WatchEvent,
    Error, ErrorResponse, LeaseRecord, ListParams, ListWatch, LockClient, LockRef, ObjectList, ObjectRef,
    Resource, ResourceExt, Scope, WatchParams, WriteOutcome,
};
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

const DEFAULT_HISTORY: usize = 1024;

#[derive(Clone, Debug)]
enum Change<K> {
    Upsert { old: Option<K>, new: K },
    Delete(K),
}

type Sender<K> = mpsc::UnboundedSender<Result<WatchEvent<K>, Error>>;

struct Watch<K> {
    params: WatchParams,
    selector: Selector,
    tx: Sender<K>,
}

struct State<K> {
    version: u64,
    objects: BTreeMap<ObjectRef, K>,
    history: VecDeque<(u64, Change<K>)>,
    history_limit: usize,
    /// Oldest version a watch can still resume from
    floor: u64,
    watches: Vec<Watch<K>>,
    locks: HashMap<LockRef, LeaseRecord>,
    failing_lists: usize,
    failing_lock_writes: usize,
}

/// An in-memory cluster API for one resource type and any number of lock records
///
/// Cloning produces another handle to the same cluster.
pub struct MemoryCluster<K> {
    state: Arc<Mutex<State<K>>>,
    list_calls: Arc<AtomicUsize>,
    watch_calls: Arc<AtomicUsize>,
}

impl<K> Clone for MemoryCluster<K> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            list_calls: self.list_calls.clone(),
            watch_calls: self.watch_calls.clone(),
        }
    }
}

impl<K> Default for MemoryCluster<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> MemoryCluster<K> {
    /// Create an empty cluster
    #[must_use]
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY)
    }

    /// Create an empty cluster that retains at most `limit` changes for resuming watches
    #[must_use]
    pub fn with_history_limit(limit: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                version: 0,
                objects: BTreeMap::new(),
                history: VecDeque::new(),
                history_limit: limit,
                floor: 0,
                watches: Vec::new(),
                locks: HashMap::new(),
                failing_lists: 0,
                failing_lock_writes: 0,
            })),
            list_calls: Arc::new(AtomicUsize::new(0)),
            watch_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of list calls served so far
    #[must_use]
    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    /// Number of watch calls served so far
    #[must_use]
    pub fn watch_calls(&self) -> usize {
        self.watch_calls.load(Ordering::SeqCst)
    }

    /// Make the next `n` list calls fail with a service error
    pub fn fail_next_lists(&self, n: usize) {
        self.state.lock().failing_lists = n;
    }

    /// Make the next `n` lock writes fail with a service error
    pub fn fail_next_lock_writes(&self, n: usize) {
        self.state.lock().failing_lock_writes = n;
    }

    /// Forget all retained history, so every open resume token becomes too old
    pub fn compact(&self) {
        let mut state = self.state.lock();
        state.history.clear();
        state.floor = state.version;
    }

    /// Close every open watch stream, as a network reset would
    pub fn disconnect_watches(&self) {
        self.state.lock().watches.clear();
    }

    /// Number of currently open watch streams
    #[must_use]
    pub fn open_watches(&self) -> usize {
        let mut state = self.state.lock();
        state.watches.retain(|w| !w.tx.is_closed());
        state.watches.len()
    }

    /// Read a lock record directly
    #[must_use]
    pub fn lock_record(&self, lock: &LockRef) -> Option<LeaseRecord> {
        self.state.lock().locks.get(lock).cloned()
    }

    /// Overwrite a lock record, bypassing concurrency control
    pub fn force_lock_record(&self, lock: &LockRef, mut record: LeaseRecord) -> LeaseRecord {
        let mut state = self.state.lock();
        state.version += 1;
        record.resource_version = Some(state.version.to_string());
        state.locks.insert(lock.clone(), record.clone());
        record
    }
}

fn in_scope<K: Resource>(scope: &Scope, obj: &K) -> bool {
    match scope.namespace() {
        None => true,
        Some(ns) => obj.meta().namespace.as_deref() == Some(ns),
    }
}

fn parse_selector(raw: Option<&str>) -> Result<Selector, Error> {
    raw.unwrap_or_default().parse().map_err(|err| {
        Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: format!("{err}"),
            reason: "BadRequest".into(),
            code: 400,
        })
    })
}

fn service_error(what: &str) -> Error {
    Error::Service(format!("injected {what} failure"))
}

impl<K: Resource + Clone> Watch<K> {
    fn selects(&self, obj: &K) -> bool {
        in_scope(&self.params.scope, obj) && self.selector.matches(obj.labels())
    }

    /// Translate a change into what this watch should see, if anything
    fn event_for(&self, change: &Change<K>) -> Option<WatchEvent<K>> {
        match change {
            Change::Upsert { old, new } => {
                let was = old.as_ref().is_some_and(|o| self.selects(o));
                match (was, self.selects(new)) {
                    (true, true) => Some(WatchEvent::Modified(new.clone())),
                    (false, true) => Some(WatchEvent::Added(new.clone())),
                    (true, false) => Some(WatchEvent::Deleted(new.clone())),
                    (false, false) => None,
                }
            }
            Change::Delete(obj) => self.selects(obj).then(|| WatchEvent::Deleted(obj.clone())),
        }
    }
}

impl<K: Resource + Clone> State<K> {
    fn record(&mut self, change: Change<K>) {
        let version = self.version;
        self.watches.retain(|watch| match watch.event_for(&change) {
            Some(event) => watch.tx.unbounded_send(Ok(event)).is_ok(),
            None => !watch.tx.is_closed(),
        });
        self.history.push_back((version, change));
        while self.history.len() > self.history_limit {
            if let Some((dropped, _)) = self.history.pop_front() {
                self.floor = dropped;
            }
        }
    }
}

impl<K: Resource + Clone> MemoryCluster<K> {
    /// Create or update an object, assigning it a new resource version
    pub fn apply(&self, mut obj: K) -> K {
        let mut state = self.state.lock();
        state.version += 1;
        obj.meta_mut().resource_version = Some(state.version.to_string());
        let old = state.objects.insert(obj.object_ref(), obj.clone());
        tracing::trace!(object = %obj.object_ref(), version = state.version, "applied");
        state.record(Change::Upsert {
            old,
            new: obj.clone(),
        });
        obj
    }

    /// Delete an object, returning its final state
    pub fn delete(&self, key: &ObjectRef) -> Option<K> {
        let mut state = self.state.lock();
        let mut obj = state.objects.remove(key)?;
        state.version += 1;
        obj.meta_mut().resource_version = Some(state.version.to_string());
        state.record(Change::Delete(obj.clone()));
        Some(obj)
    }

    /// Read an object directly
    #[must_use]
    pub fn get(&self, key: &ObjectRef) -> Option<K> {
        self.state.lock().objects.get(key).cloned()
    }
}

#[async_trait]
impl<K> ListWatch<K> for MemoryCluster<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    async fn list(&self, params: &ListParams) -> Result<ObjectList<K>, Error> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let selector = parse_selector(params.label_selector.as_deref())?;
        let mut state = self.state.lock();
        if state.failing_lists > 0 {
            state.failing_lists -= 1;
            return Err(service_error("list"));
        }
        let items = state
            .objects
            .values()
            .filter(|obj| in_scope(&params.scope, *obj) && selector.matches(obj.labels()))
            .cloned()
            .collect();
        Ok(ObjectList {
            metadata: ListMeta {
                resource_version: Some(state.version.to_string()),
            },
            items,
        })
    }

    async fn watch(&self, params: &WatchParams, version: &str) -> Result<WatchStream<K>, Error> {
        self.watch_calls.fetch_add(1, Ordering::SeqCst);
        let selector = parse_selector(params.label_selector.as_deref())?;
        let from: u64 = version.parse().map_err(|_| {
            Error::Api(ErrorResponse {
                status: "Failure".into(),
                message: format!("invalid resource version {version:?}"),
                reason: "BadRequest".into(),
                code: 400,
            })
        })?;
        let mut state = self.state.lock();
        if from < state.floor {
            let gone = ErrorResponse::gone(format!("too old resource version: {from} ({})", state.floor));
            return Ok(stream::iter([Ok(WatchEvent::Error(gone))]).boxed());
        }
        let (tx, rx) = mpsc::unbounded();
        let watch = Watch {
            params: params.clone(),
            selector,
            tx,
        };
        for (_, change) in state.history.iter().filter(|(v, _)| *v > from) {
            if let Some(event) = watch.event_for(change) {
                let _ = watch.tx.unbounded_send(Ok(event));
            }
        }
        state.watches.push(watch);
        Ok(rx.boxed())
    }
}

#[async_trait]
impl<K> LockClient for MemoryCluster<K>
where
    K: Send + 'static,
{
    async fn get(&self, lock: &LockRef) -> Result<Option<LeaseRecord>, Error> {
        Ok(self.state.lock().locks.get(lock).cloned())
    }

    async fn create(&self, lock: &LockRef, record: &LeaseRecord) -> Result<WriteOutcome, Error> {
        let mut state = self.state.lock();
        if state.failing_lock_writes > 0 {
            state.failing_lock_writes -= 1;
            return Err(service_error("lock write"));
        }
        if state.locks.contains_key(lock) {
            return Ok(WriteOutcome::Conflict);
        }
        state.version += 1;
        let mut stored = record.clone();
        stored.resource_version = Some(state.version.to_string());
        state.locks.insert(lock.clone(), stored.clone());
        Ok(WriteOutcome::Written(stored))
    }

    async fn conditional_write(
        &self,
        lock: &LockRef,
        expected_version: &str,
        record: &LeaseRecord,
    ) -> Result<WriteOutcome, Error> {
        let mut state = self.state.lock();
        if state.failing_lock_writes > 0 {
            state.failing_lock_writes -= 1;
            return Err(service_error("lock write"));
        }
        let next_version = state.version + 1;
        let Some(current) = state.locks.get_mut(lock) else {
            return Ok(WriteOutcome::NotFound);
        };
        if current.resource_version.as_deref() != Some(expected_version) {
            return Ok(WriteOutcome::Conflict);
        }
        let mut stored = record.clone();
        stored.resource_version = Some(next_version.to_string());
        *current = stored.clone();
        state.version = next_version;
        Ok(WriteOutcome::Written(stored))
    }
}
