//! Fans cache changes out to event handlers and the work queue
//!
//! For every [`Delta`] a reflector yields, the [`Dispatcher`] first calls each registered
//! [`ResourceEventHandler`] in registration order, then enqueues the object's key. Handler
//! failures (errors or panics) are logged and skipped, so one broken handler cannot hold up the
//! others or the reconciler.

use crate::{coordination::LeaderEvent, queue::WorkQueue, reflector::Delta};
use kopr_core::{ObjectRef, Resource};
use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};

/// Error type returned by event handlers
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Callbacks for cache changes and leadership changes
///
/// Every method defaults to doing nothing, so implementors only override what they observe.
/// Handlers run inline on the watch task and should return quickly.
pub trait ResourceEventHandler<K>: Send + Sync {
    /// An object appeared in the cache
    fn on_add(&self, _obj: &Arc<K>) -> Result<(), BoxError> {
        Ok(())
    }

    /// A cached object changed, or was touched by a resync (`old` and `new` then point to the same object)
    fn on_update(&self, _old: Option<&Arc<K>>, _new: &Arc<K>) -> Result<(), BoxError> {
        Ok(())
    }

    /// An object left the cache
    ///
    /// `tombstone_uncertain` is set when the delete was inferred from a relist, in which case
    /// `obj` is the last state the cache saw. Either way the object is gone.
    fn on_delete(&self, _obj: &Arc<K>, _tombstone_uncertain: bool) -> Result<(), BoxError> {
        Ok(())
    }

    /// This replica became the leader
    fn on_started_leading(&self) -> Result<(), BoxError> {
        Ok(())
    }

    /// This replica stopped being the leader
    fn on_stopped_leading(&self) -> Result<(), BoxError> {
        Ok(())
    }
}

type AddFilter<K> = Arc<dyn Fn(&K) -> bool + Send + Sync>;
type UpdateFilter<K> = Arc<dyn Fn(Option<&K>, &K) -> bool + Send + Sync>;
type DeleteFilter<K> = Arc<dyn Fn(&K, bool) -> bool + Send + Sync>;

/// Filters deciding which changes are enqueued for reconciliation
///
/// A rejected change is still delivered to the handlers; it only skips the queue.
pub struct Predicates<K> {
    add: Option<AddFilter<K>>,
    update: Option<UpdateFilter<K>>,
    delete: Option<DeleteFilter<K>>,
}

impl<K> Default for Predicates<K> {
    fn default() -> Self {
        Self {
            add: None,
            update: None,
            delete: None,
        }
    }
}

impl<K> Clone for Predicates<K> {
    fn clone(&self) -> Self {
        Self {
            add: self.add.clone(),
            update: self.update.clone(),
            delete: self.delete.clone(),
        }
    }
}

impl<K: Resource> Predicates<K> {
    /// Only enqueue added objects for which `f` returns true
    #[must_use]
    pub fn add(mut self, f: impl Fn(&K) -> bool + Send + Sync + 'static) -> Self {
        self.add = Some(Arc::new(f));
        self
    }

    /// Only enqueue updates for which `f(old, new)` returns true
    #[must_use]
    pub fn update(mut self, f: impl Fn(Option<&K>, &K) -> bool + Send + Sync + 'static) -> Self {
        self.update = Some(Arc::new(f));
        self
    }

    /// Only enqueue deletes for which `f(obj, tombstone_uncertain)` returns true
    #[must_use]
    pub fn delete(mut self, f: impl Fn(&K, bool) -> bool + Send + Sync + 'static) -> Self {
        self.delete = Some(Arc::new(f));
        self
    }

    /// Only enqueue updates that changed `metadata.generation`
    ///
    /// Objects without a generation are always enqueued.
    #[must_use]
    pub fn generation_changed(self) -> Self {
        self.update(|old, new| {
            let old_generation = old.and_then(|o| o.meta().generation);
            match (old_generation, new.meta().generation) {
                (Some(old), Some(new)) => old != new,
                _ => true,
            }
        })
    }

    fn admits(&self, delta: &Delta<K>) -> bool {
        match delta {
            Delta::Added(obj) => self.add.as_ref().map_or(true, |f| f(obj.as_ref())),
            Delta::Modified { old, new } => self.update.as_ref().map_or(true, |f| f(old.as_deref(), new.as_ref())),
            Delta::Deleted {
                obj,
                tombstone_uncertain,
            } => self.delete.as_ref().map_or(true, |f| f(obj.as_ref(), *tombstone_uncertain)),
        }
    }
}

/// Delivers cache changes to handlers, then to the work queue
///
/// Cloning is cheap and every clone delivers to the same handlers and queue.
pub struct Dispatcher<K> {
    handlers: Vec<Arc<dyn ResourceEventHandler<K>>>,
    predicates: Predicates<K>,
    queue: Option<WorkQueue<ObjectRef>>,
}

impl<K> Clone for Dispatcher<K> {
    fn clone(&self) -> Self {
        Self {
            handlers: self.handlers.clone(),
            predicates: self.predicates.clone(),
            queue: self.queue.clone(),
        }
    }
}

impl<K: Resource + 'static> Dispatcher<K> {
    /// A dispatcher enqueueing into `queue`
    pub fn new(queue: WorkQueue<ObjectRef>) -> Self {
        Self {
            handlers: Vec::new(),
            predicates: Predicates::default(),
            queue: Some(queue),
        }
    }

    /// A dispatcher that only notifies handlers
    pub fn without_queue() -> Self {
        Self {
            handlers: Vec::new(),
            predicates: Predicates::default(),
            queue: None,
        }
    }

    /// Register a handler, called after every handler registered before it
    #[must_use]
    pub fn with_handler(mut self, handler: impl ResourceEventHandler<K> + 'static) -> Self {
        self.handlers.push(Arc::new(handler));
        self
    }

    /// Register an already shared handler
    #[must_use]
    pub fn with_shared_handler(mut self, handler: Arc<dyn ResourceEventHandler<K>>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Filter what gets enqueued
    #[must_use]
    pub fn with_predicates(mut self, predicates: Predicates<K>) -> Self {
        self.predicates = predicates;
        self
    }

    /// Deliver one change
    ///
    /// Must be called after the change is visible in the cache.
    pub fn dispatch(&self, delta: &Delta<K>) {
        let key = delta.object_ref();
        for (index, handler) in self.handlers.iter().enumerate() {
            let outcome = catch_unwind(AssertUnwindSafe(|| match delta {
                Delta::Added(obj) => handler.on_add(obj),
                Delta::Modified { old, new } => handler.on_update(old.as_ref(), new),
                Delta::Deleted {
                    obj,
                    tombstone_uncertain,
                } => handler.on_delete(obj, *tombstone_uncertain),
            }));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(error)) => tracing::warn!(object.ref = %key, handler = index, %error, "event handler failed"),
                Err(_) => tracing::warn!(object.ref = %key, handler = index, "event handler panicked"),
            }
        }
        let Some(queue) = &self.queue else { return };
        if self.predicates.admits(delta) {
            queue.add(key);
        } else {
            tracing::trace!(object.ref = %key, "change filtered out by predicate");
        }
    }

    /// Deliver a leadership change to the lifecycle hooks of every handler
    pub fn notify_leadership(&self, event: LeaderEvent) {
        for (index, handler) in self.handlers.iter().enumerate() {
            let outcome = catch_unwind(AssertUnwindSafe(|| match event {
                LeaderEvent::BecameLeader => handler.on_started_leading(),
                LeaderEvent::LostLeadership => handler.on_stopped_leading(),
            }));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(error)) => tracing::warn!(?event, handler = index, %error, "leadership handler failed"),
                Err(_) => tracing::warn!(?event, handler = index, "leadership handler panicked"),
            }
        }
    }
}
