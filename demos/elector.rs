use kopr::{
    core::{DynamicObject, LockRef},
    runtime::{
        coordination::{ConfigBuilder, LeaderElector, LeaderEvent},
        LeaderElectorHandle,
    },
};
use kopr_test::MemoryCluster;
use std::time::Duration;
use tracing::*;

fn replica(cluster: &MemoryCluster<DynamicObject>, lock: &LockRef, identity: &str) -> anyhow::Result<LeaderElectorHandle> {
    let mut config = ConfigBuilder::new(lock.clone(), identity);
    config.lease_duration = Duration::from_secs(6);
    config.renew_deadline = Duration::from_secs(4);
    config.retry_period = Duration::from_secs(1);
    let elector = LeaderElector::spawn(config.finish()?, cluster.clone());

    let mut events = elector.events();
    let identity = identity.to_string();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                LeaderEvent::BecameLeader => info!(%identity, "started leading"),
                LeaderEvent::LostLeadership => info!(%identity, "stopped leading"),
            }
        }
    });
    Ok(elector)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,kopr_runtime::coordination=debug".into()),
        )
        .init();

    let cluster = MemoryCluster::<DynamicObject>::new();
    let lock = LockRef::lease("kube-system", "demo-lock");
    let mut replicas = vec![
        replica(&cluster, &lock, "replica-a")?,
        replica(&cluster, &lock, "replica-b")?,
        replica(&cluster, &lock, "replica-c")?,
    ];

    // every few seconds the current leader steps down and releases the lock
    info!("electing, press <ctrl+c> to stop");
    loop {
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                res?;
                break;
            }
            () = tokio::time::sleep(Duration::from_secs(8)) => {
                if let Some(pos) = replicas.iter().position(LeaderElectorHandle::is_leader) {
                    let leader = replicas.remove(pos);
                    leader.shutdown().await?;
                    info!(holder = ?cluster.lock_record(&lock).and_then(|r| r.holder_identity), "leader stepped down");
                }
                if replicas.is_empty() {
                    break;
                }
            }
        }
    }

    for elector in replicas {
        elector.shutdown().await?;
    }
    info!(record = ?cluster.lock_record(&lock), "all replicas stopped");
    Ok(())
}
