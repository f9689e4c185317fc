//! Crate with types and traits necessary for driving an operator against a cluster API
//!
//! This crate holds no client. The cluster API is consumed through the [`ListWatch`]
//! and [`LockClient`] traits, which a transport (or the in-memory `kopr-test` cluster)
//! implements. The same information here is re-exported from `kopr` under `kopr::core`.
#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs)]
#![deny(unsafe_code)]

pub mod client;
pub use client::{ListWatch, LockClient, ObjectList, WriteOutcome};

pub mod dynamic;
pub use dynamic::DynamicObject;

pub mod labels;

pub mod lease;
pub use lease::{LeaseRecord, LockKind, LockRef};

pub mod metadata;
pub use metadata::{ObjectMeta, TypeMeta};

mod object_ref;
pub use object_ref::ObjectRef;

pub mod params;
pub use params::{ListParams, Scope, WatchParams};

mod resource;
pub use resource::{Resource, ResourceExt};

pub mod resource_version;

pub mod watch;
pub use watch::WatchEvent;

mod error;
pub use error::{Error, ErrorResponse};

/// Convenient alias for `Result<T, Error>`
pub type Result<T, E = Error> = std::result::Result<T, E>;
