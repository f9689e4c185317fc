//! A deduplicating, rate-limited work queue
//!
//! Items are handed to at most one worker at a time. Adding an item that is already
//! waiting is a no-op, and adding an item that is being processed marks it dirty so it is
//! queued exactly once more when the worker calls [`WorkQueue::done`].

mod delay;
mod rate_limiter;
pub use rate_limiter::{ExponentialRateLimiter, RateLimiter};

use self::delay::{DelayedAdd, DelayedAdds};
use ahash::AHashSet;
use futures::{channel::mpsc, StreamExt};
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    hash::Hash,
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::{
    sync::Notify,
    task::JoinHandle,
    time::Instant,
};

struct State<T> {
    /// Items ready to be handed out, in order
    queue: VecDeque<T>,
    /// Items that need processing, whether queued or waiting for an in-flight run to finish
    dirty: AHashSet<T>,
    /// Items currently held by a worker
    processing: AHashSet<T>,
    shutting_down: bool,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    rate_limiter: Mutex<Box<dyn RateLimiter<T>>>,
    /// Woken when an item becomes ready, or on shutdown
    ready: Notify,
    /// Woken whenever an item leaves the processing set
    finished: Notify,
    delayed: mpsc::UnboundedSender<DelayedAdd<T>>,
    delay_task: JoinHandle<()>,
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        self.delay_task.abort();
    }
}

/// Deduplicating work queue with delayed and rate-limited adds
///
/// Cloning is cheap and every clone refers to the same queue.
/// The queue must be created from within a tokio runtime, since delayed items are
/// released by a background task.
pub struct WorkQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> WorkQueue<T>
where
    T: Eq + Hash + Clone + Send + Sync + 'static,
{
    /// A queue retrying with the default [`ExponentialRateLimiter`]
    pub fn new() -> Self {
        Self::with_rate_limiter(ExponentialRateLimiter::default())
    }

    /// A queue using `rate_limiter` for [`add_rate_limited`](Self::add_rate_limited)
    pub fn with_rate_limiter(rate_limiter: impl RateLimiter<T> + 'static) -> Self {
        let (delayed, requests) = mpsc::unbounded();
        let inner = Arc::new_cyclic(|weak: &Weak<Inner<T>>| {
            let weak = weak.clone();
            let delay_task = tokio::spawn(async move {
                let mut matured = DelayedAdds::new(requests);
                while let Some(item) = matured.next().await {
                    let Some(inner) = weak.upgrade() else { break };
                    WorkQueue { inner }.add(item);
                }
            });
            Inner {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: AHashSet::new(),
                    processing: AHashSet::new(),
                    shutting_down: false,
                }),
                rate_limiter: Mutex::new(Box::new(rate_limiter)),
                ready: Notify::new(),
                finished: Notify::new(),
                delayed,
                delay_task,
            }
        });
        Self { inner }
    }

    /// Mark `item` as needing processing
    pub fn add(&self, item: T) {
        let mut state = self.inner.state.lock();
        if state.shutting_down || state.dirty.contains(&item) {
            return;
        }
        state.dirty.insert(item.clone());
        if state.processing.contains(&item) {
            // queued again by `done`
            return;
        }
        state.queue.push_back(item);
        drop(state);
        self.inner.ready.notify_one();
    }

    /// Wait for the next item, or `None` once the queue is shut down
    ///
    /// The caller owns the item until it calls [`done`](Self::done).
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.inner.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.inner.state.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    return Some(item);
                }
            }
            notified.await;
        }
    }

    /// Release `item` after processing, queueing it again if it was re-added meanwhile
    pub fn done(&self, item: &T) {
        let mut state = self.inner.state.lock();
        state.processing.remove(item);
        let requeued = !state.shutting_down && state.dirty.contains(item);
        if requeued {
            state.queue.push_back(item.clone());
        }
        drop(state);
        if requeued {
            self.inner.ready.notify_one();
        }
        self.inner.finished.notify_waiters();
    }

    /// Add `item` once `delay` has passed
    ///
    /// A pending delayed add of the same item is replaced if this one would fire sooner.
    pub fn add_after(&self, item: T, delay: Duration) {
        if self.shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(item);
            return;
        }
        let request = DelayedAdd {
            item,
            ready_at: Instant::now() + delay,
        };
        if self.inner.delayed.unbounded_send(request).is_err() {
            tracing::debug!("delayed add dropped, delay timers have stopped");
        }
    }

    /// Add `item` after the delay its rate limiter assigns to one more failure
    pub fn add_rate_limited(&self, item: T) {
        let delay = self.inner.rate_limiter.lock().when(&item);
        tracing::debug!(?delay, "requeueing with backoff");
        self.add_after(item, delay);
    }

    /// Reset the backoff of `item`
    pub fn forget(&self, item: &T) {
        self.inner.rate_limiter.lock().forget(item);
    }

    /// Failures recorded for `item` since it was last forgotten
    pub fn num_requeues(&self, item: &T) -> u32 {
        self.inner.rate_limiter.lock().num_requeues(item)
    }

    /// Number of items ready to be handed out
    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Whether no item is ready to be handed out
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of items currently held by workers
    pub fn in_flight(&self) -> usize {
        self.inner.state.lock().processing.len()
    }

    /// Stop handing out items
    ///
    /// Blocked and future [`get`](Self::get) calls return `None`. Items that were waiting are
    /// dropped, and later adds are ignored.
    pub fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock();
            state.shutting_down = true;
            state.queue.clear();
            state.dirty.clear();
        }
        self.inner.delay_task.abort();
        self.inner.ready.notify_waiters();
    }

    /// [`shutdown`](Self::shutdown), then wait until every in-flight item is [`done`](Self::done)
    pub async fn shutdown_with_drain(&self) {
        self.shutdown();
        loop {
            let notified = self.inner.finished.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.state.lock().processing.is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Whether [`shutdown`](Self::shutdown) was called
    pub fn shutting_down(&self) -> bool {
        self.inner.state.lock().shutting_down
    }
}

impl<T> Default for WorkQueue<T>
where
    T: Eq + Hash + Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::{ExponentialRateLimiter, WorkQueue};
    use futures::{poll, FutureExt};
    use std::{task::Poll, time::Duration};
    use tokio::time::{pause, timeout, Instant};

    #[tokio::test]
    async fn add_deduplicates_waiting_items() {
        let queue = WorkQueue::new();
        queue.add("a");
        queue.add("b");
        queue.add("a");
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.get().await, Some("a"));
        assert_eq!(queue.get().await, Some("b"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn adds_while_processing_coalesce_into_one_rerun() {
        let queue = WorkQueue::new();
        queue.add("a");
        let item = queue.get().await.unwrap();
        for _ in 0..5 {
            queue.add("a");
        }
        // not handed out again while in flight
        assert!(queue.is_empty());
        assert!(queue.get().now_or_never().is_none());
        queue.done(&item);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await, Some("a"));
        queue.done(&"a");
        assert!(queue.is_empty());
        assert_eq!(queue.in_flight(), 0);
    }

    #[tokio::test]
    async fn get_waits_for_add() {
        let queue = WorkQueue::new();
        let get = queue.get();
        tokio::pin!(get);
        assert_eq!(poll!(get.as_mut()), Poll::Pending);
        queue.add(1);
        assert_eq!(get.await, Some(1));
    }

    #[tokio::test]
    async fn shutdown_wakes_blocked_getters() {
        let queue = WorkQueue::<u32>::new();
        let waiter = tokio::spawn({
            let queue = queue.clone();
            async move { queue.get().await }
        });
        tokio::task::yield_now().await;
        queue.shutdown();
        assert_eq!(waiter.await.unwrap(), None);
        queue.add(1);
        assert!(queue.is_empty());
        assert!(queue.shutting_down());
    }

    #[tokio::test]
    async fn add_after_releases_no_earlier_than_the_delay() {
        pause();
        let queue = WorkQueue::new();
        let start = Instant::now();
        queue.add_after("a", Duration::from_secs(2));
        assert!(timeout(Duration::from_millis(1900), queue.get()).await.is_err());
        assert_eq!(queue.get().await, Some("a"));
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn add_after_keeps_the_earliest_schedule() {
        pause();
        let queue = WorkQueue::new();
        let start = Instant::now();
        queue.add_after("a", Duration::from_secs(10));
        queue.add_after("a", Duration::from_secs(1));
        assert_eq!(queue.get().await, Some("a"));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn rate_limited_adds_back_off_until_forgotten() {
        pause();
        let queue = WorkQueue::with_rate_limiter(ExponentialRateLimiter::new(
            Duration::from_secs(1),
            Duration::from_secs(4),
        ));
        let mut waited = Vec::new();
        for _ in 0..4 {
            let start = Instant::now();
            queue.add_rate_limited("a");
            let item = queue.get().await.unwrap();
            waited.push(start.elapsed().as_secs());
            queue.done(&item);
        }
        assert_eq!(waited, [1, 2, 4, 4]);
        assert_eq!(queue.num_requeues(&"a"), 4);
        queue.forget(&"a");
        assert_eq!(queue.num_requeues(&"a"), 0);
    }

    #[tokio::test]
    async fn shutdown_with_drain_waits_for_in_flight_items() {
        let queue = WorkQueue::new();
        queue.add("a");
        let item = queue.get().await.unwrap();
        let drain = queue.shutdown_with_drain();
        tokio::pin!(drain);
        assert_eq!(poll!(drain.as_mut()), Poll::Pending);
        queue.done(&item);
        drain.await;
        assert_eq!(queue.in_flight(), 0);
    }
}
