//! Watch tasks feeding a namespace-partitioned cache and a [`Dispatcher`]

use crate::{
    dispatcher::Dispatcher,
    reflector::{self, store::WriterDropped, Indexer, Lister},
    utils::{CancelableJoinHandle, WatchStreamExt},
    watcher,
};
use futures::StreamExt;
use kopr_core::{ListWatch, Resource, Scope};
use std::collections::BTreeSet;
use tokio::runtime::Handle;

/// The namespaces an informer covers
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum NamespaceScope {
    /// Every namespace through a single watch (or a cluster-scoped type)
    #[default]
    All,
    /// A single namespace
    One(String),
    /// An explicit set of namespaces, each with its own watch
    Set(BTreeSet<String>),
}

impl NamespaceScope {
    /// A scope over `namespaces`
    pub fn set<I, S>(namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Set(namespaces.into_iter().map(Into::into).collect())
    }

    /// The store keys, one per watch: `None` for the all-namespaces watch
    fn partitions(&self) -> Vec<Option<String>> {
        match self {
            Self::All => vec![None],
            Self::One(ns) => vec![Some(ns.clone())],
            Self::Set(namespaces) => namespaces.iter().cloned().map(Some).collect(),
        }
    }
}

/// Runs one watch task per namespace
///
/// Each task drives `watcher` → [`default_backoff`](WatchStreamExt::default_backoff) →
/// [`reflector`](reflector::reflector) and hands every resulting delta to the shared
/// [`Dispatcher`], so handlers and the queue only see a change once the cache holds it.
///
/// The tasks are aborted on [`shutdown`](Self::shutdown), or when the informer is dropped.
pub struct Informer<K> {
    indexer: Indexer<K>,
    tasks: Vec<CancelableJoinHandle<()>>,
}

impl<K> Informer<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    /// Start watching `namespaces` with `config` (whose scope is replaced per namespace)
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<W>(api: W, config: &watcher::Config, namespaces: &NamespaceScope, dispatcher: &Dispatcher<K>) -> Self
    where
        W: ListWatch<K> + Clone + 'static,
    {
        let runtime = Handle::current();
        let mut stores = Vec::new();
        let mut tasks = Vec::new();
        for namespace in namespaces.partitions() {
            let (reader, writer) = reflector::store();
            let scope = namespace.clone().map_or(Scope::All, Scope::Namespace);
            let stream = reflector::reflector(
                writer,
                watcher::watcher(api.clone(), config.clone().scope(scope)).default_backoff(),
            );
            let dispatcher = dispatcher.clone();
            let task_namespace = namespace.clone();
            let task = async move {
                let mut deltas = std::pin::pin!(stream);
                while let Some(delta) = deltas.next().await {
                    match delta {
                        Ok(delta) => dispatcher.dispatch(&delta),
                        Err(err) => tracing::warn!(namespace = ?task_namespace, error = %err, "watch failed"),
                    }
                }
            };
            tasks.push(CancelableJoinHandle::spawn(task, &runtime));
            stores.push((namespace, reader));
        }
        Self {
            indexer: stores.into_iter().collect(),
            tasks,
        }
    }

    /// The cache across every watched namespace
    pub fn indexer(&self) -> Indexer<K> {
        self.indexer.clone()
    }

    pub fn lister(&self) -> Lister<K> {
        self.indexer.lister()
    }

    /// Wait until every namespace has completed its first list
    pub async fn wait_until_ready(&self) -> Result<(), WriterDropped> {
        self.indexer.wait_until_ready().await
    }

    /// Abort every watch task
    ///
    /// The cache keeps its last contents, but no longer changes.
    pub fn shutdown(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }

    /// Whether every watch task has stopped
    pub fn is_finished(&self) -> bool {
        self.tasks.iter().all(CancelableJoinHandle::is_finished)
    }
}
