//! Watches a resource collection for changes, with error recovery
//!
//! See [`watcher`] for the primary entry point.

use crate::utils::{ResetTimerBackoff, ResettableBackoff, ResettableBackoffWrapper};
use backon::ExponentialBuilder;
use futures::{Stream, StreamExt};
use kopr_core::{
    client::WatchStream, labels::Selector, ErrorResponse, ListParams, ListWatch, Resource, ResourceExt, Scope,
    WatchEvent, WatchParams,
};
use std::{fmt, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::time::Instant;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to perform initial object list: {0}")]
    InitialListFailed(#[source] kopr_core::Error),
    #[error("initial object list returned no resource version")]
    NoResourceVersion,
    #[error("failed to start watching object: {0}")]
    WatchStartFailed(#[source] kopr_core::Error),
    #[error("resume token is too old, relisting: {0}")]
    WatchTokenTooOld(#[source] ErrorResponse),
    #[error("error returned by apiserver during watch: {0}")]
    WatchError(#[source] ErrorResponse),
    #[error("watch stream failed: {0}")]
    WatchFailed(#[source] kopr_core::Error),
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq)]
/// Watch events returned from the [`watcher`]
pub enum Event<K> {
    /// An object was added or modified
    Applied(K),
    /// An object was deleted
    ///
    /// NOTE: events may be lost while the watcher is unavailable; a later
    /// [`Restarted`](Event::Restarted) is the only notice of such deletes.
    Deleted(K),
    /// The watch stream was restarted from a fresh list, so `Deleted` events may have been missed
    ///
    /// Should be used as a signal to replace the store contents atomically.
    ///
    /// Any objects that were previously [`Applied`](Event::Applied) but are not listed in this event
    /// should be assumed to have been [`Deleted`](Event::Deleted).
    Restarted(Vec<K>),
    /// A periodic resync relisted the collection
    ///
    /// Carries the same guarantees as [`Restarted`](Event::Restarted), but consumers should
    /// also treat unchanged objects as touched.
    Resynced(Vec<K>),
}

impl<K> Event<K> {
    /// Flattens out all objects that were added or modified in the event.
    ///
    /// `Deleted` objects are ignored, all objects mentioned by `Restarted` and `Resynced`
    /// events are emitted individually.
    pub fn into_iter_applied(self) -> impl Iterator<Item = K> {
        match self {
            Event::Applied(obj) => vec![obj],
            Event::Deleted(_) => Vec::new(),
            Event::Restarted(objs) | Event::Resynced(objs) => objs,
        }
        .into_iter()
    }

    /// Flattens out all objects that were added, modified, or deleted in the event.
    pub fn into_iter_touched(self) -> impl Iterator<Item = K> {
        match self {
            Event::Applied(obj) | Event::Deleted(obj) => vec![obj],
            Event::Restarted(objs) | Event::Resynced(objs) => objs,
        }
        .into_iter()
    }
}

/// Label selector applied to every list and watch
#[derive(Clone)]
pub enum LabelSelector {
    /// A fixed selector string, e.g. `app=web,tier!=db`
    Static(String),
    /// A selector computed again before every (re)list
    ///
    /// Returning `None` selects everything.
    Dynamic(Arc<dyn Fn() -> Option<String> + Send + Sync>),
}

impl LabelSelector {
    fn evaluate(&self) -> Option<String> {
        match self {
            LabelSelector::Static(selector) => Some(selector.clone()),
            LabelSelector::Dynamic(f) => f(),
        }
    }
}

impl fmt::Debug for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LabelSelector::Static(selector) => f.debug_tuple("Static").field(selector).finish(),
            LabelSelector::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

/// The configuration of a [`watcher`]
#[derive(Clone, Debug, Default)]
pub struct Config {
    /// The part of the collection to watch
    pub scope: Scope,

    /// A selector to restrict the list of returned objects by their labels.
    ///
    /// Defaults to everything if `None`.
    pub label_selector: Option<LabelSelector>,

    /// Request bookmarks so the resume token advances on quiet watches.
    pub bookmarks: bool,

    /// Maximum number of objects requested per list page.
    pub page_size: Option<u32>,

    /// Relist the whole collection this often, even when no watch error occurred.
    pub resync_period: Option<Duration>,
}

impl Config {
    /// Restrict the watcher to a single namespace
    #[must_use]
    pub fn namespace(mut self, namespace: &str) -> Self {
        self.scope = Scope::Namespace(namespace.to_string());
        self
    }

    /// Configure the scope of the watcher
    #[must_use]
    pub fn scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    /// Configure the selector to restrict the list of returned objects by their labels.
    #[must_use]
    pub fn labels(mut self, label_selector: &str) -> Self {
        self.label_selector = Some(LabelSelector::Static(label_selector.to_string()));
        self
    }

    /// Configure typed label selectors
    #[must_use]
    pub fn labels_from(mut self, selector: &Selector) -> Self {
        self.label_selector = Some(LabelSelector::Static(selector.to_selector_string()));
        self
    }

    /// Compute the label selector again before every list
    #[must_use]
    pub fn dynamic_labels(mut self, f: impl Fn() -> Option<String> + Send + Sync + 'static) -> Self {
        self.label_selector = Some(LabelSelector::Dynamic(Arc::new(f)));
        self
    }

    /// Enables watch bookmarks from the api server if supported
    #[must_use]
    pub fn bookmarks(mut self, bookmarks: bool) -> Self {
        self.bookmarks = bookmarks;
        self
    }

    /// Sets list page size
    #[must_use]
    pub fn page_size(mut self, page_size: u32) -> Self {
        self.page_size = Some(page_size);
        self
    }

    /// Relist the collection every `period`
    #[must_use]
    pub fn resync(mut self, period: Duration) -> Self {
        self.resync_period = Some(period);
        self
    }

    fn to_list_params(&self, label_selector: Option<String>) -> ListParams {
        ListParams {
            scope: self.scope.clone(),
            label_selector,
            limit: self.page_size,
        }
    }

    fn to_watch_params(&self, label_selector: Option<String>) -> WatchParams {
        WatchParams {
            scope: self.scope.clone(),
            label_selector,
            bookmarks: self.bookmarks,
        }
    }
}

/// The internal finite state machine driving the [`watcher`]
enum State<K> {
    /// The Watcher is empty, and the next poll will start the initial LIST to get all existing objects
    Empty,
    /// The initial LIST was successful, so we should move on to starting the actual watch.
    InitListed { resource_version: String },
    /// The watch is in progress, from this point we just return events from the server.
    ///
    /// If the connection is disrupted then we propagate the error but try to restart the watch stream by
    /// returning to the `InitListed` state.
    /// If we fall out of the watch window then we propagate the error and fall back doing a re-list
    /// with `Empty`.
    Watching {
        resource_version: String,
        stream: WatchStream<K>,
    },
}

/// Everything that survives across states
struct Context<W> {
    api: W,
    config: Config,
    /// The selector evaluated for the last successful list, reused by the watches that follow it
    label_selector: Option<String>,
    resync_at: Option<Instant>,
    resync_pending: bool,
}

/// Progresses the watcher a single step, returning (event, state)
///
/// This function should be trampolined: if event == `None`
/// then the function should be called again until it returns a Some.
async fn step_trampolined<K, W>(ctx: &mut Context<W>, state: State<K>) -> (Option<Result<Event<K>>>, State<K>)
where
    K: Resource + Clone + Send + 'static,
    W: ListWatch<K>,
{
    match state {
        State::Empty => {
            let label_selector = ctx.config.label_selector.as_ref().and_then(LabelSelector::evaluate);
            let list_params = ctx.config.to_list_params(label_selector.clone());
            match ctx.api.list(&list_params).await {
                Ok(list) => {
                    let Some(resource_version) = list.metadata.resource_version else {
                        return (Some(Err(Error::NoResourceVersion)), State::Empty);
                    };
                    ctx.label_selector = label_selector;
                    ctx.resync_at = ctx.config.resync_period.map(|period| Instant::now() + period);
                    let event = if std::mem::take(&mut ctx.resync_pending) {
                        Event::Resynced(list.items)
                    } else {
                        Event::Restarted(list.items)
                    };
                    (Some(Ok(event)), State::InitListed { resource_version })
                }
                Err(err) => {
                    tracing::warn!("watcher list failed: {err}");
                    (Some(Err(Error::InitialListFailed(err))), State::Empty)
                }
            }
        }
        State::InitListed { resource_version } => {
            let watch_params = ctx.config.to_watch_params(ctx.label_selector.clone());
            match ctx.api.watch(&watch_params, &resource_version).await {
                Ok(stream) => (None, State::Watching {
                    resource_version,
                    stream,
                }),
                Err(kopr_core::Error::Api(resp)) if resp.is_token_too_old() => {
                    tracing::debug!("watch rejected a stale resume token, relisting");
                    (Some(Err(Error::WatchTokenTooOld(resp))), State::Empty)
                }
                Err(err) => {
                    tracing::warn!("watch initialization failed: {err}");
                    (Some(Err(Error::WatchStartFailed(err))), State::InitListed {
                        resource_version,
                    })
                }
            }
        }
        State::Watching {
            resource_version,
            mut stream,
        } => {
            let next = match ctx.resync_at {
                Some(deadline) => tokio::select! {
                    next = stream.next() => Some(next),
                    () = tokio::time::sleep_until(deadline) => None,
                },
                None => Some(stream.next().await),
            };
            let Some(next) = next else {
                tracing::debug!("resync period elapsed, relisting");
                ctx.resync_pending = true;
                return (None, State::Empty);
            };
            match next {
                Some(Ok(WatchEvent::Added(obj) | WatchEvent::Modified(obj))) => {
                    let resource_version = obj.resource_version().unwrap_or(resource_version);
                    (Some(Ok(Event::Applied(obj))), State::Watching {
                        resource_version,
                        stream,
                    })
                }
                Some(Ok(WatchEvent::Deleted(obj))) => {
                    let resource_version = obj.resource_version().unwrap_or(resource_version);
                    (Some(Ok(Event::Deleted(obj))), State::Watching {
                        resource_version,
                        stream,
                    })
                }
                Some(Ok(WatchEvent::Bookmark(bm))) => (None, State::Watching {
                    resource_version: bm.resource_version,
                    stream,
                }),
                Some(Ok(WatchEvent::Error(err))) => {
                    // HTTP GONE, means we have desynced and need to start over and re-list :(
                    if err.is_token_too_old() {
                        tracing::debug!("watch resume token expired: {err}");
                        (Some(Err(Error::WatchTokenTooOld(err))), State::Empty)
                    } else {
                        tracing::warn!("error watch event: {err}");
                        (Some(Err(Error::WatchError(err))), State::Watching {
                            resource_version,
                            stream,
                        })
                    }
                }
                Some(Err(err)) => {
                    tracing::warn!("watcher error: {err}");
                    (Some(Err(Error::WatchFailed(err))), State::Watching {
                        resource_version,
                        stream,
                    })
                }
                None => (None, State::InitListed { resource_version }),
            }
        }
    }
}

/// Trampoline helper for `step_trampolined`
async fn step<K, W>(ctx: &mut Context<W>, mut state: State<K>) -> (Result<Event<K>>, State<K>)
where
    K: Resource + Clone + Send + 'static,
    W: ListWatch<K>,
{
    loop {
        match step_trampolined(ctx, state).await {
            (Some(result), new_state) => return (result, new_state),
            (None, new_state) => state = new_state,
        }
    }
}

/// Watches a resource collection for changes continuously
///
/// Compared to [`ListWatch::watch`], this automatically tries to recover the stream upon errors.
///
/// Errors from the underlying watch are propagated, after which the stream will go into recovery mode on the next poll.
/// You can apply your own backoff by not polling the stream for a duration after errors, or use
/// [`WatchStreamExt::default_backoff`](crate::WatchStreamExt::default_backoff).
/// Keep in mind that some [`TryStream`](futures::TryStream) combinators (such as
/// [`try_for_each`](futures::TryStreamExt::try_for_each)) will terminate eagerly as soon as they receive an [`Err`].
///
/// This is intended to provide a safe and atomic input interface for a state store like a
/// [`reflector`](crate::reflector::reflector).
///
/// # Recovery
///
/// (The details of recovery are considered an implementation detail and should not be relied on to be stable, but are
/// documented here for posterity.)
///
/// If the watch connection is interrupted then we attempt to restart the watch using the last
/// resource version that we have seen on the stream. If this is successful then the stream is simply resumed
/// from where it left off. If this fails because the resource version is no longer valid then we start over
/// with a new list, starting with an [`Event::Restarted`].
///
/// With a [`Config::resync`] period, the watch is also dropped and the collection relisted each time the
/// period elapses, yielding an [`Event::Resynced`].
pub fn watcher<K, W>(api: W, config: Config) -> impl Stream<Item = Result<Event<K>>> + Send
where
    K: Resource + Clone + Send + 'static,
    W: ListWatch<K> + 'static,
{
    let ctx = Context {
        api,
        config,
        label_selector: None,
        resync_at: None,
        resync_pending: false,
    };
    futures::stream::unfold((ctx, State::Empty), |(mut ctx, state)| async move {
        let (event, state) = step(&mut ctx, state).await;
        Some((event, (ctx, state)))
    })
}

/// Default watcher backoff inspired by Kubernetes' client-go.
///
/// The parameters currently optimize for being kind to struggling apiservers.
/// The exact parameters are taken from
/// [client-go's reflector source](https://github.com/kubernetes/client-go/blob/980663e185ab6fc79163b1c2565034f6d58368db/tools/cache/reflector.go#L177-L181)
/// and should not be considered stable.
///
/// This struct implements [`ResettableBackoff`] and is the default strategy used
/// when calling [`WatchStreamExt::default_backoff`](crate::WatchStreamExt::default_backoff).
pub struct DefaultBackoff(Strategy);
type Strategy = ResetTimerBackoff<ResettableBackoffWrapper<ExponentialBuilder>>;

impl Default for DefaultBackoff {
    fn default() -> Self {
        Self(ResetTimerBackoff::new(
            ResettableBackoffWrapper::new(
                ExponentialBuilder::default()
                    .with_min_delay(Duration::from_millis(800))
                    .with_max_delay(Duration::from_secs(30))
                    .with_factor(2.0)
                    .with_jitter()
                    .with_max_times(usize::MAX),
            ),
            Duration::from_secs(120),
        ))
    }
}

impl Iterator for DefaultBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        self.0.next()
    }
}

impl ResettableBackoff for DefaultBackoff {
    fn reset(&mut self) {
        self.0.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::{watcher, Config, DefaultBackoff, Error, Event};
    use futures::{pin_mut, poll, StreamExt};
    use kopr_core::{
        client::WatchStream, dynamic::ApiResource, DynamicObject, ErrorResponse, ListParams, ListWatch, ObjectList,
        ObjectRef, ResourceExt, WatchParams,
    };
    use kopr_test::MemoryCluster;
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        task::Poll,
        time::Duration,
    };

    fn cm(name: &str) -> DynamicObject {
        DynamicObject::new(name, &ApiResource::new("v1", "ConfigMap")).within("default")
    }

    fn names(objs: &[DynamicObject]) -> Vec<String> {
        objs.iter().map(ResourceExt::name_any).collect()
    }

    #[tokio::test]
    async fn lists_then_streams_changes() {
        let cluster = MemoryCluster::new();
        cluster.apply(cm("a"));
        let stream = watcher(cluster.clone(), Config::default());
        pin_mut!(stream);

        match stream.next().await {
            Some(Ok(Event::Restarted(objs))) => assert_eq!(names(&objs), ["a"]),
            other => panic!("unexpected {other:?}"),
        }
        cluster.apply(cm("b"));
        cluster.delete(&ObjectRef::new("a").within("default"));
        match stream.next().await {
            Some(Ok(Event::Applied(obj))) => assert_eq!(obj.name_any(), "b"),
            other => panic!("unexpected {other:?}"),
        }
        match stream.next().await {
            Some(Ok(Event::Deleted(obj))) => assert_eq!(obj.name_any(), "a"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn resumes_after_disconnect_without_relisting() {
        let cluster = MemoryCluster::new();
        let stream = watcher(cluster.clone(), Config::default());
        pin_mut!(stream);
        assert!(matches!(stream.next().await, Some(Ok(Event::Restarted(_)))));
        assert!(matches!(poll!(stream.next()), Poll::Pending));

        cluster.disconnect_watches();
        cluster.apply(cm("missed"));
        match stream.next().await {
            Some(Ok(Event::Applied(obj))) => assert_eq!(obj.name_any(), "missed"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(cluster.list_calls(), 1);
        assert_eq!(cluster.watch_calls(), 2);
    }

    #[tokio::test]
    async fn relists_when_token_is_too_old() {
        let cluster = MemoryCluster::new();
        cluster.apply(cm("a"));
        let stream = watcher(cluster.clone(), Config::default());
        pin_mut!(stream);
        assert!(matches!(stream.next().await, Some(Ok(Event::Restarted(_)))));
        assert!(matches!(poll!(stream.next()), Poll::Pending));

        cluster.disconnect_watches();
        cluster.delete(&ObjectRef::new("a").within("default"));
        cluster.apply(cm("b"));
        cluster.compact();

        assert!(matches!(stream.next().await, Some(Err(Error::WatchTokenTooOld(_)))));
        match stream.next().await {
            Some(Ok(Event::Restarted(objs))) => assert_eq!(names(&objs), ["b"]),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(cluster.list_calls(), 2);
    }

    #[tokio::test]
    async fn list_failures_are_surfaced_and_retried() {
        let cluster = MemoryCluster::<DynamicObject>::new();
        cluster.fail_next_lists(1);
        let stream = watcher(cluster.clone(), Config::default());
        pin_mut!(stream);
        assert!(matches!(stream.next().await, Some(Err(Error::InitialListFailed(_)))));
        assert!(matches!(stream.next().await, Some(Ok(Event::Restarted(_)))));
    }

    #[tokio::test]
    async fn resync_relists_periodically() {
        tokio::time::pause();
        let cluster = MemoryCluster::new();
        cluster.apply(cm("a"));
        let stream = watcher(cluster.clone(), Config::default().resync(Duration::from_secs(10)));
        pin_mut!(stream);
        assert!(matches!(stream.next().await, Some(Ok(Event::Restarted(_)))));
        assert!(matches!(poll!(stream.next()), Poll::Pending));

        tokio::time::advance(Duration::from_secs(11)).await;
        match stream.next().await {
            Some(Ok(Event::Resynced(objs))) => assert_eq!(names(&objs), ["a"]),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(cluster.list_calls(), 2);
    }

    #[tokio::test]
    async fn dynamic_selector_is_evaluated_per_list() {
        let cluster = MemoryCluster::new();
        cluster.apply(cm("a").label("shard", "0"));
        cluster.apply(cm("b").label("shard", "1"));
        let lists = Arc::new(AtomicUsize::new(0));
        let config = Config::default().dynamic_labels({
            let lists = lists.clone();
            move || Some(format!("shard={}", lists.fetch_add(1, Ordering::SeqCst)))
        });
        let stream = watcher(cluster.clone(), config);
        pin_mut!(stream);
        match stream.next().await {
            Some(Ok(Event::Restarted(objs))) => assert_eq!(names(&objs), ["a"]),
            other => panic!("unexpected {other:?}"),
        }
        // changes outside the selector of the current list stay invisible
        cluster.apply(cm("c").label("shard", "1"));
        cluster.apply(cm("d").label("shard", "0"));
        match stream.next().await {
            Some(Ok(Event::Applied(obj))) => assert_eq!(obj.name_any(), "d"),
            other => panic!("unexpected {other:?}"),
        }
    }

    /// Rejects the first `rejections` watch requests outright with `410 Gone`
    #[derive(Clone)]
    struct RejectsStaleWatch {
        cluster: MemoryCluster<DynamicObject>,
        rejections: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl ListWatch<DynamicObject> for RejectsStaleWatch {
        async fn list(&self, params: &ListParams) -> Result<ObjectList<DynamicObject>, kopr_core::Error> {
            self.cluster.list(params).await
        }

        async fn watch(
            &self,
            params: &WatchParams,
            version: &str,
        ) -> Result<WatchStream<DynamicObject>, kopr_core::Error> {
            let rejected = self
                .rejections
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if rejected {
                return Err(kopr_core::Error::Api(ErrorResponse::gone("too old resource version")));
            }
            self.cluster.watch(params, version).await
        }
    }

    #[tokio::test]
    async fn relists_when_watch_start_is_gone() {
        let cluster = MemoryCluster::new();
        cluster.apply(cm("a"));
        let api = RejectsStaleWatch {
            cluster: cluster.clone(),
            rejections: Arc::new(AtomicUsize::new(1)),
        };
        let stream = watcher(api, Config::default());
        pin_mut!(stream);
        assert!(matches!(stream.next().await, Some(Ok(Event::Restarted(_)))));
        assert!(matches!(stream.next().await, Some(Err(Error::WatchTokenTooOld(_)))));
        match stream.next().await {
            Some(Ok(Event::Restarted(objs))) => assert_eq!(names(&objs), ["a"]),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(cluster.list_calls(), 2);

        cluster.apply(cm("b"));
        match stream.next().await {
            Some(Ok(Event::Applied(obj))) => assert_eq!(obj.name_any(), "b"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn default_backoff_grows_and_is_capped() {
        let delays: Vec<Duration> = DefaultBackoff::default().take(12).collect();
        assert_eq!(delays.len(), 12);
        assert!(delays[0] >= Duration::from_millis(800));
        assert!(delays.iter().all(|d| *d <= Duration::from_secs(60)));
    }
}
