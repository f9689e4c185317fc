//! Full operator flows against an in-memory cluster

use futures::{stream, StreamExt};
use chrono::Utc;
use kopr_core::{dynamic::ApiResource, DynamicObject, LeaseRecord, LockRef, ObjectRef, ResourceExt};
use kopr_runtime::{
    controller::{self, Action, Controller},
    coordination::{ConfigBuilder, LeaderElector},
    dispatcher::{BoxError, Dispatcher, ResourceEventHandler},
    informer::{Informer, NamespaceScope},
    reflector, watcher, WorkQueue,
};
use kopr_test::MemoryCluster;
use parking_lot::Mutex;
use std::{
    collections::HashSet,
    io,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, oneshot, Notify},
    task::JoinHandle,
    time::{sleep, timeout, Instant},
};

type Cluster = MemoryCluster<DynamicObject>;

fn cm(ns: &str, name: &str) -> DynamicObject {
    DynamicObject::new(name, &ApiResource::new("v1", "ConfigMap")).within(ns)
}

fn lock() -> LockRef {
    LockRef::lease("kube-system", "operator-lock")
}

fn secs(elapsed: Duration) -> u64 {
    elapsed.as_secs_f64().round() as u64
}

/// Runs `controller` until the returned sender fires
fn start(
    controller: Controller<DynamicObject>,
    reconcile: impl Fn(ObjectRef) -> Result<Action, io::Error> + Send + Sync + 'static,
) -> (oneshot::Sender<()>, JoinHandle<Result<(), controller::Error>>) {
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let reconcile = Arc::new(reconcile);
    let task = tokio::spawn(
        controller
            .graceful_shutdown_on(async move {
                let _ = stop_rx.await;
            })
            .run(
                move |key, _lister, _ctx: Arc<()>| {
                    let result = reconcile(key);
                    async move { result }
                },
                Arc::new(()),
            ),
    );
    (stop_tx, task)
}

#[derive(Default)]
struct Recorder(Mutex<Vec<String>>);

impl ResourceEventHandler<DynamicObject> for Recorder {
    fn on_add(&self, obj: &Arc<DynamicObject>) -> Result<(), BoxError> {
        self.0.lock().push(format!("add {}", obj.object_ref()));
        Ok(())
    }

    fn on_update(&self, _old: Option<&Arc<DynamicObject>>, new: &Arc<DynamicObject>) -> Result<(), BoxError> {
        self.0.lock().push(format!("update {}", new.object_ref()));
        Ok(())
    }

    fn on_delete(&self, obj: &Arc<DynamicObject>, tombstone_uncertain: bool) -> Result<(), BoxError> {
        self.0.lock().push(format!("delete {} {tombstone_uncertain}", obj.object_ref()));
        Ok(())
    }
}

#[tokio::test]
async fn duplicate_events_are_cached_and_enqueued_once() {
    let mut obj = cm("apps", "a");
    obj.metadata.resource_version = Some("5".into());
    let mut stale = obj.clone();
    stale.metadata.resource_version = Some("4".into());

    let queue = WorkQueue::new();
    let recorder = Arc::new(Recorder::default());
    let dispatcher = Dispatcher::new(queue.clone()).with_shared_handler(recorder.clone());
    let (reader, writer) = reflector::store();
    let events = stream::iter(vec![
        Ok(watcher::Event::Restarted(vec![])),
        Ok(watcher::Event::Applied(obj.clone())),
        Ok(watcher::Event::Applied(obj.clone())),
        Ok(watcher::Event::Applied(stale)),
    ]);
    reflector::reflector(writer, events)
        .for_each(|delta| {
            dispatcher.dispatch(&delta.unwrap());
            futures::future::ready(())
        })
        .await;

    assert_eq!(reader.len(), 1);
    assert_eq!(reader.get(&obj.object_ref()).unwrap().resource_version().as_deref(), Some("5"));
    assert_eq!(queue.len(), 1);
    assert_eq!(*recorder.0.lock(), ["add a.apps"]);
}

#[tokio::test(start_paused = true)]
async fn requeue_after_reschedules_without_a_change() {
    let cluster = Cluster::new();
    cluster.apply(cm("apps", "a"));
    let (calls_tx, mut calls) = mpsc::unbounded_channel();
    let (stop, task) = start(
        Controller::new(cluster.clone(), watcher::Config::default().namespace("apps")),
        move |key| {
            let _ = calls_tx.send((key, Instant::now()));
            Ok(Action::requeue(Duration::from_secs(2)))
        },
    );

    let (key, first) = calls.recv().await.unwrap();
    assert_eq!(key, ObjectRef::new("a").within("apps"));
    let (_, second) = calls.recv().await.unwrap();
    let (_, third) = calls.recv().await.unwrap();
    assert_eq!(secs(second - first), 2);
    assert_eq!(secs(third - second), 2);

    stop.send(()).unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn failures_back_off_and_success_resets() {
    let cluster = Cluster::new();
    cluster.apply(cm("apps", "a"));
    let attempts = Arc::new(AtomicUsize::new(0));
    let (calls_tx, mut calls) = mpsc::unbounded_channel();
    let (stop, task) = start(
        Controller::new(cluster.clone(), watcher::Config::default())
            .with_config(controller::Config::default().backoff(Duration::from_secs(1), Duration::from_secs(60))),
        {
            let attempts = attempts.clone();
            move |_key| {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                let _ = calls_tx.send(Instant::now());
                match attempt {
                    1..=3 | 5 => Err(io::Error::other("transient")),
                    _ => Ok(Action::await_change()),
                }
            }
        },
    );

    let mut at = Vec::new();
    for _ in 0..4 {
        at.push(calls.recv().await.unwrap());
    }
    let waits: Vec<_> = at.windows(2).map(|w| secs(w[1] - w[0])).collect();
    assert_eq!(waits, [1, 2, 4]);

    // a success forgets the failures, the next failure starts from the base delay again
    cluster.apply(cm("apps", "a"));
    let failed = calls.recv().await.unwrap();
    let retried = calls.recv().await.unwrap();
    assert_eq!(secs(retried - failed), 1);
    assert_eq!(attempts.load(Ordering::SeqCst), 6);

    stop.send(()).unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn changes_during_a_reconcile_coalesce_into_one_rerun() {
    let cluster = Cluster::new();
    cluster.apply(cm("apps", "a"));
    cluster.apply(cm("apps", "b"));

    struct Ctx {
        in_flight: Mutex<HashSet<ObjectRef>>,
        overlaps: AtomicUsize,
        max_parallel: AtomicUsize,
        calls: Mutex<Vec<ObjectRef>>,
        started: mpsc::UnboundedSender<ObjectRef>,
    }
    let (started, mut started_rx) = mpsc::unbounded_channel();
    let ctx = Arc::new(Ctx {
        in_flight: Mutex::default(),
        overlaps: AtomicUsize::new(0),
        max_parallel: AtomicUsize::new(0),
        calls: Mutex::default(),
        started,
    });
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(
        Controller::new(cluster.clone(), watcher::Config::default())
            .with_config(controller::Config::default().concurrency(4))
            .graceful_shutdown_on(async move {
                let _ = stop_rx.await;
            })
            .run(
                |key: ObjectRef, _lister, ctx: Arc<Ctx>| async move {
                    {
                        let mut in_flight = ctx.in_flight.lock();
                        if !in_flight.insert(key.clone()) {
                            ctx.overlaps.fetch_add(1, Ordering::SeqCst);
                        }
                        ctx.max_parallel.fetch_max(in_flight.len(), Ordering::SeqCst);
                        ctx.calls.lock().push(key.clone());
                    }
                    let _ = ctx.started.send(key.clone());
                    sleep(Duration::from_secs(1)).await;
                    ctx.in_flight.lock().remove(&key);
                    Ok::<_, io::Error>(Action::await_change())
                },
                ctx.clone(),
            ),
    );

    loop {
        if started_rx.recv().await.unwrap() == ObjectRef::new("a").within("apps") {
            break;
        }
    }
    for _ in 0..5 {
        cluster.apply(cm("apps", "a").label("rev", "next"));
    }
    sleep(Duration::from_secs(10)).await;

    let calls = ctx.calls.lock().clone();
    let a = calls.iter().filter(|key| key.name == "a").count();
    let b = calls.iter().filter(|key| key.name == "b").count();
    assert_eq!((a, b), (2, 1));
    assert_eq!(ctx.overlaps.load(Ordering::SeqCst), 0);
    assert_eq!(ctx.max_parallel.load(Ordering::SeqCst), 2);

    stop_tx.send(()).unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn leadership_hands_over_on_release() {
    let cluster = Cluster::new();
    cluster.apply(cm("apps", "a"));
    let (calls_tx, mut calls) = mpsc::unbounded_channel::<&'static str>();

    let replica = |identity: &'static str| {
        let elector = LeaderElector::spawn(ConfigBuilder::new(lock(), identity).finish().unwrap(), cluster.clone());
        let calls_tx = calls_tx.clone();
        start(
            Controller::new(cluster.clone(), watcher::Config::default()).leader_election(elector),
            move |_key| {
                let _ = calls_tx.send(identity);
                Ok(Action::requeue(Duration::from_secs(1)))
            },
        )
    };

    let (stop_1, task_1) = replica("replica-1");
    assert_eq!(calls.recv().await.unwrap(), "replica-1");
    let (stop_2, task_2) = replica("replica-2");

    // the follower keeps its cache warm but never reconciles
    sleep(Duration::from_secs(10)).await;
    while let Ok(identity) = calls.try_recv() {
        assert_eq!(identity, "replica-1");
    }

    stop_1.send(()).unwrap();
    task_1.await.unwrap().unwrap();
    while let Ok(identity) = calls.try_recv() {
        assert_eq!(identity, "replica-1");
    }
    let next = timeout(Duration::from_secs(5), calls.recv()).await.unwrap().unwrap();
    assert_eq!(next, "replica-2");
    assert!(cluster.lock_record(&lock()).unwrap().is_held_by("replica-2"));

    stop_2.send(()).unwrap();
    task_2.await.unwrap().unwrap();
    assert_eq!(cluster.lock_record(&lock()).unwrap().holder_identity, None);
}

/// Records leadership hooks into a log shared with the reconciler
struct LeadershipLog {
    log: Arc<Mutex<Vec<String>>>,
    stopped: mpsc::UnboundedSender<()>,
}

impl ResourceEventHandler<DynamicObject> for LeadershipLog {
    fn on_started_leading(&self) -> Result<(), BoxError> {
        self.log.lock().push("started leading".into());
        Ok(())
    }

    fn on_stopped_leading(&self) -> Result<(), BoxError> {
        self.log.lock().push("stopped leading".into());
        let _ = self.stopped.send(());
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn lock_takeover_finishes_the_running_reconcile_and_stops_dequeueing() {
    let cluster = Cluster::new();
    cluster.apply(cm("apps", "a"));

    struct Ctx {
        log: Arc<Mutex<Vec<String>>>,
        calls: AtomicUsize,
        release: Notify,
        started: mpsc::UnboundedSender<()>,
    }
    let log = Arc::new(Mutex::new(Vec::new()));
    let (started, mut started_rx) = mpsc::unbounded_channel();
    let (stopped, mut stopped_rx) = mpsc::unbounded_channel();
    let ctx = Arc::new(Ctx {
        log: log.clone(),
        calls: AtomicUsize::new(0),
        release: Notify::new(),
        started,
    });

    let elector = LeaderElector::spawn(ConfigBuilder::new(lock(), "replica-1").finish().unwrap(), cluster.clone());
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(
        Controller::new(cluster.clone(), watcher::Config::default())
            .leader_election(elector)
            .handler(LeadershipLog { log, stopped })
            .graceful_shutdown_on(async move {
                let _ = stop_rx.await;
            })
            .run(
                |key: ObjectRef, _lister, ctx: Arc<Ctx>| async move {
                    ctx.calls.fetch_add(1, Ordering::SeqCst);
                    ctx.log.lock().push(format!("reconciling {key}"));
                    let _ = ctx.started.send(());
                    ctx.release.notified().await;
                    ctx.log.lock().push(format!("reconciled {key}"));
                    Ok::<_, io::Error>(Action::requeue(Duration::from_secs(1)))
                },
                ctx.clone(),
            ),
    );

    started_rx.recv().await.unwrap();
    // another replica overwrites the lock while the reconcile is blocked
    cluster.force_lock_record(&lock(), LeaseRecord {
        holder_identity: Some("intruder".into()),
        lease_duration_seconds: Some(3600),
        acquire_time: Some(Utc::now()),
        renew_time: Some(Utc::now()),
        ..LeaseRecord::default()
    });
    timeout(Duration::from_secs(10), stopped_rx.recv()).await.unwrap().unwrap();

    ctx.release.notify_one();
    cluster.apply(cm("apps", "a").label("rev", "next"));
    cluster.apply(cm("apps", "b"));
    sleep(Duration::from_secs(30)).await;

    assert_eq!(ctx.calls.load(Ordering::SeqCst), 1);
    assert_eq!(*ctx.log.lock(), [
        "started leading",
        "reconciling a.apps",
        "stopped leading",
        "reconciled a.apps",
    ]);
    assert!(cluster.lock_record(&lock()).unwrap().is_held_by("intruder"));

    stop_tx.send(()).unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn cache_converges_after_missing_changes() {
    let cluster = Cluster::new();
    cluster.apply(cm("apps", "a"));
    cluster.apply(cm("apps", "b"));
    let recorder = Arc::new(Recorder::default());
    let dispatcher = Dispatcher::without_queue().with_shared_handler(recorder.clone());
    let informer = Informer::spawn(
        cluster.clone(),
        &watcher::Config::default(),
        &NamespaceScope::All,
        &dispatcher,
    );
    informer.wait_until_ready().await.unwrap();

    // changes while disconnected, after which the resume token is gone
    cluster.disconnect_watches();
    cluster.delete(&ObjectRef::new("a").within("apps"));
    cluster.apply(cm("apps", "c"));
    cluster.compact();

    let lister = informer.lister();
    timeout(Duration::from_secs(60), async {
        loop {
            let names: Vec<_> = lister.list(None).iter().map(|o| o.name_any()).collect();
            if names == ["b", "c"] {
                break;
            }
            sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(cluster.list_calls(), 2);
    let seen = recorder.0.lock().clone();
    assert!(seen.contains(&"delete a.apps true".to_string()), "{seen:?}");
    assert!(seen.contains(&"add c.apps".to_string()), "{seen:?}");
}
