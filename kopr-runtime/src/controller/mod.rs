//! Runs a user-supplied reconciler function on objects when they (or related objects) are updated

use self::runner::Worker;
use crate::{
    coordination::{self, LeaderElectorHandle, LeaderEvent},
    dispatcher::{Dispatcher, Predicates, ResourceEventHandler},
    informer::{Informer, NamespaceScope},
    queue::{ExponentialRateLimiter, WorkQueue},
    reflector::Lister,
    watcher,
};
use futures::{
    future::{self, BoxFuture},
    FutureExt,
};
use kopr_core::{ListWatch, ObjectRef, Resource, Scope};
use std::{future::Future, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

mod runner;

#[derive(Debug, Error)]
pub enum Error {
    #[error("leader election failed: {0}")]
    Coordination(#[source] coordination::Error),
    #[error("invalid controller config: {0}")]
    Config(String),
}

/// Results of the reconciliation attempt
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Action {
    /// Retry with the per-object rate-limited backoff
    pub requeue: bool,
    /// Whether (and when) to next trigger the reconciliation if no external watch triggers hit
    ///
    /// For example, use this to query external systems for updates, or expire time-limited resources.
    /// Takes precedence over `requeue` and resets the backoff of the object.
    pub requeue_after: Option<Duration>,
}

impl Action {
    /// Reconcile again after `duration`, even if no watch event arrives
    ///
    /// This is the best-practice action that ensures eventual consistency of your controller
    /// even in the case of missed changes (which can happen).
    #[must_use]
    pub fn requeue(duration: Duration) -> Self {
        Self {
            requeue: false,
            requeue_after: Some(duration),
        }
    }

    /// Retry after the backoff the queue assigns to one more failure of the object
    #[must_use]
    pub fn requeue_rate_limited() -> Self {
        Self {
            requeue: true,
            requeue_after: None,
        }
    }

    /// Do nothing until a change is detected
    ///
    /// This stops the controller periodically reconciling this object until a relevant watch event
    /// was **detected**.
    #[must_use]
    pub fn await_change() -> Self {
        Self::default()
    }
}

/// Per-object retry backoff of the work queue
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Backoff {
    /// Delay after the first failure, doubled on every further one
    pub base: Duration,
    /// Ceiling for the delay
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(5),
            max: Duration::from_secs(1000),
        }
    }
}

/// Accumulates all options that can be used on a [`Controller`] invocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Config {
    /// The number of concurrent reconciliations allowed
    ///
    /// Each object is still reconciled by at most one worker at a time.
    pub concurrency: usize,
    pub backoff: Backoff,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            concurrency: 1,
            backoff: Backoff::default(),
        }
    }
}

impl Config {
    /// The number of reconciliations allowed to run at any given moment
    #[must_use]
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Backoff of failing objects, doubling from `base` up to `max`
    #[must_use]
    pub fn backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff = Backoff { base, max };
        self
    }
}

/// Controller for a Resource `K`
///
/// A controller is made up of:
/// - one watch task per namespace, each feeding its own cache store and the work queue
/// - an optional leader elector gating the reconcile workers
/// - user defined event handlers and enqueue predicates
/// - a user defined `reconcile` callback run by `concurrency` workers
///
/// Followers keep their caches warm but do not reconcile.
///
/// ```no_run
/// use kopr_core::{DynamicObject, ObjectRef};
/// use kopr_runtime::{reflector::Lister, watcher, Action, Controller};
/// use std::{sync::Arc, time::Duration};
///
/// #[derive(Debug, thiserror::Error)]
/// #[error("reconcile failed")]
/// struct Error;
///
/// async fn reconcile(key: ObjectRef, lister: Lister<DynamicObject>, _ctx: Arc<()>) -> Result<Action, Error> {
///     match lister.get_ref(&key) {
///         Some(_obj) => Ok(Action::requeue(Duration::from_secs(300))),
///         // deleted
///         None => Ok(Action::await_change()),
///     }
/// }
///
/// # async fn wrapper(api: impl kopr_core::ListWatch<DynamicObject> + 'static) -> Result<(), kopr_runtime::controller::Error> {
/// Controller::new(api, watcher::Config::default().namespace("apps"))
///     .shutdown_on_signal()
///     .run(reconcile, Arc::new(()))
///     .await
/// # }
/// ```
pub struct Controller<K> {
    api: Arc<dyn ListWatch<K>>,
    watcher_config: watcher::Config,
    namespaces: NamespaceScope,
    predicates: Predicates<K>,
    handlers: Vec<Arc<dyn ResourceEventHandler<K>>>,
    config: Config,
    elector: Option<LeaderElectorHandle>,
    graceful_shutdown_selector: Vec<BoxFuture<'static, ()>>,
}

impl<K> Controller<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    /// Create a Controller for a resource `K`
    ///
    /// The scope of `watcher_config` selects the namespace to watch, unless
    /// [`namespaces`](Self::namespaces) overrides it.
    pub fn new(api: impl ListWatch<K> + 'static, watcher_config: watcher::Config) -> Self {
        let namespaces = match &watcher_config.scope {
            Scope::All => NamespaceScope::All,
            Scope::Namespace(ns) => NamespaceScope::One(ns.clone()),
        };
        Self {
            api: Arc::new(api),
            watcher_config,
            namespaces,
            predicates: Predicates::default(),
            handlers: Vec::new(),
            config: Config::default(),
            elector: None,
            graceful_shutdown_selector: Vec::new(),
        }
    }

    /// Watch these namespaces, each through its own watch
    #[must_use]
    pub fn namespaces(mut self, namespaces: NamespaceScope) -> Self {
        self.namespaces = namespaces;
        self
    }

    /// Only enqueue the changes `predicates` admit
    ///
    /// Handlers still see every change.
    #[must_use]
    pub fn predicates(mut self, predicates: Predicates<K>) -> Self {
        self.predicates = predicates;
        self
    }

    /// Register a handler for cache and leadership changes
    #[must_use]
    pub fn handler(mut self, handler: impl ResourceEventHandler<K> + 'static) -> Self {
        self.handlers.push(Arc::new(handler));
        self
    }

    /// Specify the configuration for the controller's behavior.
    #[must_use]
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Only reconcile while `elector` holds the lock
    ///
    /// The elector is shut down (releasing the lock if configured to) once the controller stops.
    #[must_use]
    pub fn leader_election(mut self, elector: LeaderElectorHandle) -> Self {
        self.elector = Some(elector);
        self
    }

    /// Start a graceful shutdown when `trigger` resolves
    ///
    /// Watches stop immediately, in-flight reconciliations run to completion, and no new ones
    /// are started. If called multiple times, the first trigger to resolve wins.
    #[must_use]
    pub fn graceful_shutdown_on(mut self, trigger: impl Future<Output = ()> + Send + 'static) -> Self {
        self.graceful_shutdown_selector.push(trigger.boxed());
        self
    }

    /// Start a graceful shutdown on `SIGINT` (Ctrl+C), or `SIGTERM` on Unix
    #[must_use]
    pub fn shutdown_on_signal(self) -> Self {
        self.graceful_shutdown_on(async {
            #[cfg(unix)]
            let terminate = async {
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(mut sigterm) => {
                        sigterm.recv().await;
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "unable to listen for SIGTERM");
                        future::pending::<()>().await;
                    }
                }
            };
            #[cfg(not(unix))]
            let terminate = future::pending::<()>();
            tokio::select! {
                res = tokio::signal::ctrl_c() => {
                    if let Err(err) = res {
                        tracing::warn!(error = %err, "unable to listen for SIGINT");
                        future::pending::<()>().await;
                    }
                    tracing::info!("received SIGINT, shutting down");
                }
                () = terminate => tracing::info!("received SIGTERM, shutting down"),
            }
        })
    }

    /// Consume all the parameters of the Controller and start the applier stream
    ///
    /// Resolves once a shutdown trigger fired and every watch, worker and the elector have
    /// stopped. Without a trigger it runs forever.
    pub async fn run<ReconcilerFut, Ctx, E>(
        self,
        reconcile: impl Fn(ObjectRef, Lister<K>, Arc<Ctx>) -> ReconcilerFut + Send + Sync + 'static,
        ctx: Arc<Ctx>,
    ) -> Result<(), Error>
    where
        ReconcilerFut: Future<Output = Result<Action, E>> + Send + 'static,
        E: std::error::Error + Send + 'static,
        Ctx: Send + Sync + 'static,
    {
        if self.config.concurrency == 0 {
            return Err(Error::Config("concurrency must be at least 1".into()));
        }
        if self.config.backoff.base.is_zero() || self.config.backoff.base > self.config.backoff.max {
            return Err(Error::Config(
                "backoff base must be positive and no greater than its max".into(),
            ));
        }

        let queue = WorkQueue::with_rate_limiter(ExponentialRateLimiter::new(
            self.config.backoff.base,
            self.config.backoff.max,
        ));
        let dispatcher = self
            .handlers
            .into_iter()
            .fold(Dispatcher::new(queue.clone()), Dispatcher::with_shared_handler)
            .with_predicates(self.predicates);

        // workers only dequeue while this is set
        let (leading_tx, leading_rx) = watch::channel(self.elector.is_none());
        let (elector, leadership, _always_leading) = match self.elector {
            Some(elector) => {
                let task = tokio::spawn(forward_leadership(elector.state(), leading_tx, dispatcher.clone()));
                (Some(elector), Some(task), None)
            }
            None => (None, None, Some(leading_tx)),
        };

        let mut informer = Informer::spawn(self.api, &self.watcher_config, &self.namespaces, &dispatcher);
        let stop = CancellationToken::new();
        let reconcile = Arc::new(reconcile);
        let workers: Vec<_> = (0..self.config.concurrency)
            .map(|_| {
                tokio::spawn(
                    Worker {
                        queue: queue.clone(),
                        lister: informer.lister(),
                        leading: leading_rx.clone(),
                        stop: stop.clone(),
                        reconcile: reconcile.clone(),
                        ctx: ctx.clone(),
                    }
                    .run(),
                )
            })
            .collect();
        drop(leading_rx);

        if self.graceful_shutdown_selector.is_empty() {
            future::pending::<()>().await;
        } else {
            future::select_all(self.graceful_shutdown_selector).await;
        }
        tracing::info!("controller shutting down");

        informer.shutdown();
        queue.shutdown_with_drain().await;
        stop.cancel();
        for worker in future::join_all(workers).await {
            if let Err(err) = worker {
                tracing::warn!(error = %err, "reconcile worker failed");
            }
        }
        if let Some(elector) = elector {
            elector.shutdown().await.map_err(Error::Coordination)?;
        }
        if let Some(leadership) = leadership {
            if let Err(err) = leadership.await {
                tracing::warn!(error = %err, "leadership forwarder failed");
            }
        }
        tracing::info!("controller stopped");
        Ok(())
    }
}

/// Mirror the elector's state into `leading`, firing the lifecycle hooks on every change
///
/// `BecameLeader` is delivered before workers may dequeue, and workers stop dequeueing before
/// `LostLeadership` is delivered.
async fn forward_leadership<K: Resource + 'static>(
    mut state: watch::Receiver<coordination::LeaderState>,
    leading: watch::Sender<bool>,
    dispatcher: Dispatcher<K>,
) {
    loop {
        let leader = state.borrow_and_update().is_leader();
        if leader != *leading.borrow() {
            if leader {
                dispatcher.notify_leadership(LeaderEvent::BecameLeader);
                leading.send_replace(true);
            } else {
                leading.send_replace(false);
                dispatcher.notify_leadership(LeaderEvent::LostLeadership);
            }
        }
        if state.changed().await.is_err() {
            break;
        }
    }
    // the elector stopped
    if leading.send_replace(false) {
        dispatcher.notify_leadership(LeaderEvent::LostLeadership);
    }
}
