use std::{
    pin::Pin,
    task::{ready, Context, Poll},
};

use futures::{Future, Stream, TryStream};
use pin_project::pin_project;
use tokio::time::{sleep_until, Instant, Sleep};

use super::ResettableBackoff;

/// Pauses a [`TryStream`] after every error, following a [`ResettableBackoff`] policy
///
/// The error itself is passed through immediately, the next item is only polled once the
/// delay has elapsed. Healthy items [`reset`](ResettableBackoff::reset) the policy.
/// A policy that runs out of delays ends the stream.
#[pin_project]
pub struct StreamBackoff<S, B> {
    #[pin]
    stream: S,
    backoff: B,
    /// Set while backing off
    #[pin]
    pause: Option<Sleep>,
    exhausted: bool,
}

impl<S: TryStream, B: ResettableBackoff> StreamBackoff<S, B> {
    pub fn new(stream: S, backoff: B) -> Self {
        Self {
            stream,
            backoff,
            pause: None,
            exhausted: false,
        }
    }
}

impl<S: TryStream, B: ResettableBackoff> Stream for StreamBackoff<S, B> {
    type Item = Result<S::Ok, S::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        if *this.exhausted {
            return Poll::Ready(None);
        }
        if let Some(pause) = this.pause.as_mut().as_pin_mut() {
            ready!(pause.poll(cx));
            tracing::trace!("backoff elapsed, polling the stream again");
            this.pause.set(None);
        }

        let item = ready!(this.stream.try_poll_next(cx));
        match &item {
            Some(Err(_)) => match this.backoff.next() {
                Some(delay) => {
                    tracing::debug!(?delay, "stream failed, backing off");
                    this.pause.set(Some(sleep_until(Instant::now() + delay)));
                }
                None => {
                    tracing::debug!("stream failed and the backoff is exhausted, closing it");
                    *this.exhausted = true;
                }
            },
            Some(Ok(_)) => this.backoff.reset(),
            None => {}
        }
        Poll::Ready(item)
    }
}
