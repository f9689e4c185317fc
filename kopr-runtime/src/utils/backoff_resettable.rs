use std::time::Duration;

use backon::{Backoff, BackoffBuilder};

/// A [`Backoff`] that can be restarted from its first delay.
///
/// [`StreamBackoff`](super::StreamBackoff) resets its policy whenever the stream yields a healthy item.
pub trait ResettableBackoff: Backoff {
    fn reset(&mut self);
}

impl<B: ResettableBackoff + ?Sized> ResettableBackoff for Box<B>
where
    Box<B>: Backoff,
{
    fn reset(&mut self) {
        (**self).reset();
    }
}

/// Implements [`ResettableBackoff`] by building a fresh [`Backoff`] from `B` after every reset.
#[derive(Debug, Clone)]
pub struct ResettableBackoffWrapper<B: BackoffBuilder> {
    builder: B,
    current: Option<B::Backoff>,
}

impl<B: BackoffBuilder> ResettableBackoffWrapper<B> {
    pub fn new(builder: B) -> Self {
        Self { builder, current: None }
    }
}

impl<B: BackoffBuilder + Default> Default for ResettableBackoffWrapper<B> {
    fn default() -> Self {
        Self::new(B::default())
    }
}

impl<B: BackoffBuilder + Clone> Iterator for ResettableBackoffWrapper<B> {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let builder = &self.builder;
        self.current.get_or_insert_with(|| builder.clone().build()).next()
    }
}

impl<B: BackoffBuilder + Clone> ResettableBackoff for ResettableBackoffWrapper<B>
where
    Self: Backoff,
{
    fn reset(&mut self) {
        self.current = None;
    }
}
