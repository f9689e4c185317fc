use crate::{
    utils::{stream_backoff::StreamBackoff, ResettableBackoff},
    watcher::DefaultBackoff,
};

use futures::{Stream, TryStream};

/// Extension trait for streams returned by [`watcher`](crate::watcher()) or [`reflector`](crate::reflector::reflector)
pub trait WatchStreamExt: Stream {
    /// Apply the [`DefaultBackoff`] watcher backoff policy
    ///
    /// This is recommended for controllers that want to add minimal backoff to the watcher
    /// while a watch is failing to reconnect.
    fn default_backoff(self) -> StreamBackoff<Self, DefaultBackoff>
    where
        Self: TryStream + Sized,
    {
        StreamBackoff::new(self, DefaultBackoff::default())
    }

    /// Apply a specific [`ResettableBackoff`] policy to a [`Stream`] using [`StreamBackoff`]
    fn backoff<B>(self, b: B) -> StreamBackoff<Self, B>
    where
        B: ResettableBackoff,
        Self: TryStream + Sized,
    {
        StreamBackoff::new(self, b)
    }
}
impl<St: ?Sized> WatchStreamExt for St where St: Stream {}
