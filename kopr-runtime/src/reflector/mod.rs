//! Caches objects in memory

mod indexer;
pub mod store;

pub use self::{
    indexer::{Indexer, Lister},
    store::{store, Delta, Store},
};
use crate::watcher;
use async_stream::stream;
use futures::{Stream, StreamExt};
use kopr_core::Resource;

/// Cache objects from a [`watcher()`](crate::watcher()) stream into a local [`Store`]
///
/// Observes the raw `Stream` of [`watcher::Event`] objects, replays each into the cache, and yields
/// the [`Delta`]s the event caused. A delta is only yielded once the store reflects it, so anything
/// reacting to a delta reads a cache at least as fresh as the event.
///
/// Watcher errors are passed through unmodified.
///
/// ## Usage
/// Create a [`Store`] through [`store::store()`]. The `writer` part is not-clonable,
/// and must be moved into the reflector. The `reader` part is the [`Store`] interface
/// that you can send to other parts of your program as state.
///
/// ```no_run
/// use futures::StreamExt;
/// use kopr_core::DynamicObject;
/// use kopr_runtime::{reflector, watcher, WatchStreamExt};
/// # async fn wrapper(api: impl kopr_core::ListWatch<DynamicObject> + 'static) {
/// let (reader, writer) = reflector::store::<DynamicObject>();
/// let rf = reflector(writer, watcher(api, watcher::Config::default().namespace("apps")));
/// rf.default_backoff()
///     .for_each(|delta| async move { println!("{delta:?}") })
///     .await;
/// # }
/// ```
pub fn reflector<K, W>(
    mut writer: store::Writer<K>,
    stream: W,
) -> impl Stream<Item = watcher::Result<Delta<K>>>
where
    K: Resource + Clone,
    W: Stream<Item = watcher::Result<watcher::Event<K>>>,
{
    let mut stream = Box::pin(stream);
    stream! {
        while let Some(event) = stream.next().await {
            match event {
                Ok(ev) => {
                    for delta in writer.replay(&ev) {
                        yield Ok(delta);
                    }
                },
                Err(err) => yield Err(err)
            }
        }
    }
}
