use kopr::{
    core::{dynamic::ApiResource, DynamicObject, ObjectRef},
    prelude::*,
    runtime::{
        dispatcher::{BoxError, Predicates, ResourceEventHandler},
        watcher, Action, Controller, Lister,
    },
};
use kopr_test::MemoryCluster;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tracing::*;

#[derive(Debug, Error)]
enum Error {
    #[error("object {0} has no data.replicas")]
    MissingReplicas(ObjectRef),
}

struct Data {
    cluster: MemoryCluster<DynamicObject>,
}

/// Logs what the cache sees, independent of reconciliation
struct AuditLog;

impl ResourceEventHandler<DynamicObject> for AuditLog {
    fn on_add(&self, obj: &Arc<DynamicObject>) -> Result<(), BoxError> {
        info!(object = %obj.object_ref(), "added");
        Ok(())
    }

    fn on_delete(&self, obj: &Arc<DynamicObject>, tombstone_uncertain: bool) -> Result<(), BoxError> {
        info!(object = %obj.object_ref(), tombstone_uncertain, "deleted");
        Ok(())
    }
}

async fn reconcile(key: ObjectRef, lister: Lister<DynamicObject>, ctx: Arc<Data>) -> Result<Action, Error> {
    let Some(obj) = lister.get_ref(&key) else {
        info!(%key, "gone, nothing to clean up");
        return Ok(Action::await_change());
    };
    let replicas = obj
        .data
        .get("replicas")
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| Error::MissingReplicas(key.clone()))?;
    info!(%key, replicas, rv = ?obj.resource_version(), "reconciled");
    if ctx.cluster.get(&key).is_none() {
        warn!(%key, "cache is behind the cluster");
    }
    Ok(Action::requeue(Duration::from_secs(30)))
}

fn configmap(ns: &str, name: &str, replicas: Option<u64>) -> DynamicObject {
    let obj = DynamicObject::new(name, &ApiResource::new("v1", "ConfigMap"))
        .within(ns)
        .label("app", "web");
    match replicas {
        Some(replicas) => obj.data(serde_json::json!({ "replicas": replicas })),
        None => obj,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,kopr_runtime=debug".into()),
        )
        .init();

    let cluster = MemoryCluster::new();
    cluster.apply(configmap("apps", "web", Some(3)));
    cluster.apply(configmap("apps", "broken", None));

    // keep changing the cluster so there is something to reconcile
    let changes = tokio::spawn({
        let cluster = cluster.clone();
        async move {
            for replicas in 4.. {
                tokio::time::sleep(Duration::from_secs(5)).await;
                cluster.apply(configmap("apps", "web", Some(replicas)));
                if replicas % 3 == 0 {
                    cluster.delete(&ObjectRef::new("broken").within("apps"));
                } else {
                    cluster.apply(configmap("apps", "broken", None));
                }
            }
        }
    });

    info!("running, press <ctrl+c> to stop");
    Controller::new(cluster.clone(), watcher::Config::default().labels("app=web"))
        .predicates(Predicates::default().generation_changed())
        .handler(AuditLog)
        .shutdown_on_signal()
        .run(reconcile, Arc::new(Data { cluster }))
        .await?;
    changes.abort();
    Ok(())
}
