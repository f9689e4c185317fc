//! The cluster API surface consumed by the runtime
//!
//! Transports, credentials and per-kind REST clients live outside this crate.
//! Anything that can list and watch a collection, and conditionally write a lock record,
//! can drive the runtime.
use crate::{
    error::Error,
    lease::{LeaseRecord, LockRef},
    metadata::ListMeta,
    params::{ListParams, WatchParams},
    watch::WatchEvent,
};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;

/// A snapshot of a collection, and the version a watch may resume from
#[derive(Clone, Debug, PartialEq)]
pub struct ObjectList<K> {
    /// List metadata, carrying the resume token
    pub metadata: ListMeta,
    /// The objects in the collection
    pub items: Vec<K>,
}

impl<K> ObjectList<K> {
    /// The resume token for a watch following this list
    #[must_use]
    pub fn resource_version(&self) -> Option<&str> {
        self.metadata.resource_version.as_deref()
    }
}

/// A boxed stream of raw watch events
pub type WatchStream<K> = BoxStream<'static, Result<WatchEvent<K>, Error>>;

/// List and watch access to one resource collection
#[async_trait]
pub trait ListWatch<K>: Send + Sync {
    /// Get a snapshot of the collection
    async fn list(&self, params: &ListParams) -> Result<ObjectList<K>, Error>;

    /// Stream changes following `version`
    ///
    /// If `version` is no longer retained the stream must yield a
    /// [`WatchEvent::Error`] with code `410` rather than silently skip changes.
    async fn watch(&self, params: &WatchParams, version: &str) -> Result<WatchStream<K>, Error>;
}

#[async_trait]
impl<K, T> ListWatch<K> for Arc<T>
where
    T: ListWatch<K> + ?Sized,
{
    async fn list(&self, params: &ListParams) -> Result<ObjectList<K>, Error> {
        (**self).list(params).await
    }

    async fn watch(&self, params: &WatchParams, version: &str) -> Result<WatchStream<K>, Error> {
        (**self).watch(params, version).await
    }
}

/// Outcome of a conditional lock write
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The write was accepted; the record as stored, with its new version
    Written(LeaseRecord),
    /// Another writer got there first (or the record already exists on create)
    Conflict,
    /// The record does not exist
    NotFound,
}

/// Access to the single record used for leader election
#[async_trait]
pub trait LockClient: Send + Sync {
    /// Read the current record, `None` if it does not exist
    async fn get(&self, lock: &LockRef) -> Result<Option<LeaseRecord>, Error>;

    /// Create the record, failing with [`WriteOutcome::Conflict`] if it already exists
    async fn create(&self, lock: &LockRef, record: &LeaseRecord) -> Result<WriteOutcome, Error>;

    /// Replace the record, only if it is still at `expected_version`
    async fn conditional_write(
        &self,
        lock: &LockRef,
        expected_version: &str,
        record: &LeaseRecord,
    ) -> Result<WriteOutcome, Error>;
}

#[async_trait]
impl<T> LockClient for Arc<T>
where
    T: LockClient + ?Sized,
{
    async fn get(&self, lock: &LockRef) -> Result<Option<LeaseRecord>, Error> {
        (**self).get(lock).await
    }

    async fn create(&self, lock: &LockRef, record: &LeaseRecord) -> Result<WriteOutcome, Error> {
        (**self).create(lock, record).await
    }

    async fn conditional_write(
        &self,
        lock: &LockRef,
        expected_version: &str,
        record: &LeaseRecord,
    ) -> Result<WriteOutcome, Error> {
        (**self).conditional_write(lock, expected_version, record).await
    }
}
