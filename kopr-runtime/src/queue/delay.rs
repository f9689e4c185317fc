//! Timers for delayed adds

use ahash::AHashMap;
use futures::{
    stream::{Fuse, FusedStream},
    Stream, StreamExt,
};
use pin_project::pin_project;
use std::{
    hash::Hash,
    pin::Pin,
    task::{ready, Context, Poll},
};
use tokio::time::Instant;
use tokio_util::time::delay_queue::{self, DelayQueue};

/// Add `item` to the queue at `ready_at`
#[derive(Debug)]
pub(crate) struct DelayedAdd<T> {
    pub(crate) item: T,
    pub(crate) ready_at: Instant,
}

/// Yields each requested item once its time has come
///
/// An item has at most one pending timer. Requesting it again keeps whichever
/// deadline is earlier. Ends once the request stream has ended and every timer fired.
#[pin_project]
pub(crate) struct DelayedAdds<T, R> {
    timers: DelayQueue<T>,
    waiting: AHashMap<T, (Instant, delay_queue::Key)>,
    #[pin]
    requests: Fuse<R>,
}

impl<T, R> DelayedAdds<T, R>
where
    T: Eq + Hash + Clone,
    R: Stream<Item = DelayedAdd<T>>,
{
    pub(crate) fn new(requests: R) -> Self {
        Self {
            timers: DelayQueue::new(),
            waiting: AHashMap::new(),
            requests: requests.fuse(),
        }
    }

    /// Items with a pending timer
    #[cfg(test)]
    fn len(&self) -> usize {
        self.waiting.len()
    }
}

fn arm<T: Eq + Hash + Clone>(
    timers: &mut DelayQueue<T>,
    waiting: &mut AHashMap<T, (Instant, delay_queue::Key)>,
    add: DelayedAdd<T>,
) {
    if let Some((ready_at, key)) = waiting.get_mut(&add.item) {
        if add.ready_at < *ready_at {
            timers.reset_at(key, add.ready_at);
            *ready_at = add.ready_at;
        }
        return;
    }
    let key = timers.insert_at(add.item.clone(), add.ready_at);
    waiting.insert(add.item, (add.ready_at, key));
}

impl<T, R> Stream for DelayedAdds<T, R>
where
    T: Eq + Hash + Clone,
    R: Stream<Item = DelayedAdd<T>>,
{
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        let mut this = self.project();
        while let Poll::Ready(Some(add)) = this.requests.as_mut().poll_next(cx) {
            arm(this.timers, this.waiting, add);
        }
        match ready!(this.timers.poll_expired(cx)) {
            Some(expired) => {
                let item = expired.into_inner();
                this.waiting.remove(&item);
                Poll::Ready(Some(item))
            }
            // no timers left, the request stream wakes us for new ones
            None if !this.requests.is_terminated() => Poll::Pending,
            None => Poll::Ready(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{DelayedAdd, DelayedAdds};
    use futures::{channel::mpsc, poll, stream, FutureExt, StreamExt};
    use tokio::time::{advance, Duration, Instant};

    fn add<T>(item: T, secs: u64) -> DelayedAdd<T> {
        DelayedAdd {
            item,
            ready_at: Instant::now() + Duration::from_secs(secs),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn items_fire_in_deadline_order() {
        let mut adds = DelayedAdds::new(stream::iter([add("late", 3), add("early", 1)]));
        assert!(poll!(adds.next()).is_pending());
        advance(Duration::from_secs(2)).await;
        assert_eq!(adds.next().now_or_never().unwrap(), Some("early"));
        assert!(poll!(adds.next()).is_pending());
        advance(Duration::from_secs(2)).await;
        assert_eq!(adds.next().now_or_never().unwrap(), Some("late"));
        assert!(adds.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn earliest_deadline_wins() {
        for requests in [[add("a", 1), add("a", 5)], [add("a", 5), add("a", 1)]] {
            let mut adds = DelayedAdds::new(stream::iter(requests));
            assert!(poll!(adds.next()).is_pending());
            assert_eq!(adds.len(), 1);
            advance(Duration::from_secs(2)).await;
            assert_eq!(adds.next().now_or_never().unwrap(), Some("a"));
            assert!(adds.next().await.is_none());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fired_items_can_be_delayed_again() {
        let (tx, rx) = mpsc::unbounded();
        let mut adds = DelayedAdds::new(rx);
        tx.unbounded_send(add(7, 1)).unwrap();
        assert!(poll!(adds.next()).is_pending());
        advance(Duration::from_secs(1)).await;
        assert_eq!(adds.next().now_or_never().unwrap(), Some(7));

        tx.unbounded_send(add(7, 1)).unwrap();
        assert!(poll!(adds.next()).is_pending());
        advance(Duration::from_secs(1)).await;
        assert_eq!(adds.next().now_or_never().unwrap(), Some(7));
        drop(tx);
        assert!(adds.next().await.is_none());
    }
}
