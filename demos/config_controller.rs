use kopr::{
    core::{DynamicObject, ObjectRef},
    prelude::*,
    runtime::{coordination::LeaderElector, Action, Controller, Lister, OperatorConfig},
};
use kopr_test::MemoryCluster;
use std::{convert::Infallible, sync::Arc};
use tracing::*;

const DEFAULT_CONFIG: &str = "
resource:
  apiVersion: example.com/v1
  kind: Widget
namespaces: [apps, infra]
resyncPeriodSeconds: 20
leaderElection:
  lockName: widget-operator
  lockNamespace: kube-system
  identity: demo
workers: 2
";

async fn reconcile(key: ObjectRef, lister: Lister<DynamicObject>, _ctx: Arc<()>) -> Result<Action, Infallible> {
    match lister.get_ref(&key) {
        Some(obj) => info!(%key, rv = ?obj.resource_version(), "widget present"),
        None => info!(%key, "widget deleted"),
    }
    Ok(Action::await_change())
}

/// Usage: `config_controller [path/to/operator.yaml]`
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => OperatorConfig::from_path(path)?,
        None => OperatorConfig::from_yaml(DEFAULT_CONFIG)?,
    };
    let resource = config.api_resource();
    info!(kind = %resource.kind, plural = %resource.plural, scope = ?config.namespace_scope(), "loaded config");

    let cluster = MemoryCluster::new();
    for ns in ["apps", "infra", "other"] {
        cluster.apply(DynamicObject::new("sample", &resource).within(ns));
    }

    let mut controller = Controller::new(cluster.clone(), config.watcher_config())
        .namespaces(config.namespace_scope())
        .with_config(config.controller_config())
        .shutdown_on_signal();
    if let Some(election) = config.election_config()? {
        controller = controller.leader_election(LeaderElector::spawn(election.finish()?, cluster.clone()));
    }
    info!("running, press <ctrl+c> to stop");
    controller.run(reconcile, Arc::new(())).await?;
    Ok(())
}
