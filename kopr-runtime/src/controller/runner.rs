use super::Action;
use crate::{queue::WorkQueue, reflector::Lister};
use futures::FutureExt;
use kopr_core::ObjectRef;
use std::{future::Future, panic::AssertUnwindSafe, sync::Arc};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// One reconcile worker
///
/// Only dequeues while `leading` is set. A reconcile that is already running when leadership
/// is lost runs to completion.
pub(super) struct Worker<K, F, Ctx> {
    pub(super) queue: WorkQueue<ObjectRef>,
    pub(super) lister: Lister<K>,
    pub(super) leading: watch::Receiver<bool>,
    pub(super) stop: CancellationToken,
    pub(super) reconcile: Arc<F>,
    pub(super) ctx: Arc<Ctx>,
}

impl<K, F, Fut, Ctx, E> Worker<K, F, Ctx>
where
    K: Send + Sync + 'static,
    F: Fn(ObjectRef, Lister<K>, Arc<Ctx>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Action, E>> + Send + 'static,
    E: std::error::Error + Send + 'static,
    Ctx: Send + Sync + 'static,
{
    pub(super) async fn run(mut self) {
        loop {
            let leading = tokio::select! {
                leading = self.leading.wait_for(|leading| *leading) => leading.is_ok(),
                () = self.stop.cancelled() => false,
            };
            if !leading {
                break;
            }
            let key = tokio::select! {
                key = self.queue.get() => key,
                lost = self.leading.wait_for(|leading| !*leading) => {
                    if lost.is_err() {
                        break;
                    }
                    continue;
                }
            };
            let Some(key) = key else { break };
            if !*self.leading.borrow() {
                // lost leadership while dequeueing
                self.queue.done(&key);
                self.queue.add(key);
                continue;
            }
            self.reconcile(key).await;
        }
        tracing::debug!("reconcile worker stopped");
    }

    async fn reconcile(&self, key: ObjectRef) {
        let span = tracing::info_span!(
            "reconciling object",
            "object.ref" = %key,
            "object.requeues" = self.queue.num_requeues(&key),
        );
        let result = AssertUnwindSafe(async {
            (self.reconcile)(key.clone(), self.lister.clone(), self.ctx.clone()).await
        })
        .catch_unwind()
        .instrument(span.clone())
        .await;
        span.in_scope(|| match result {
            Ok(Ok(Action {
                requeue_after: Some(delay),
                ..
            })) if !delay.is_zero() => {
                tracing::debug!(?delay, "requeue requested");
                self.queue.forget(&key);
                self.queue.add_after(key.clone(), delay);
            }
            Ok(Ok(Action { requeue: true, .. })) => self.queue.add_rate_limited(key.clone()),
            Ok(Ok(_)) => self.queue.forget(&key),
            Ok(Err(error)) => {
                tracing::error!(%error, "reconcile failed");
                self.queue.add_rate_limited(key.clone());
            }
            Err(_) => {
                tracing::error!("reconcile panicked");
                self.queue.add_rate_limited(key.clone());
            }
        });
        self.queue.done(&key);
    }
}
