//! Crate with the operator runtime components
//!
//! This crate contains the core building blocks to build operators that need to
//! synchronize/reconcile cluster state: a [`watcher`] that survives disconnects,
//! a [`reflector`] cache with an [`Indexer`](reflector::Indexer) across namespaces,
//! a [`Dispatcher`](dispatcher::Dispatcher) for handlers, a rate-limited [`WorkQueue`],
//! and [`coordination`] for leader election.
//!
//! Newcomers should generally get started with the [`Controller`] builder, which manages
//! all state internals for you.

#![deny(unsafe_code)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc, clippy::must_use_candidate)]

pub mod config;
pub mod controller;
pub mod coordination;
pub mod dispatcher;
pub mod informer;
pub mod queue;
pub mod reflector;
pub mod utils;
pub mod watcher;

pub use config::OperatorConfig;
pub use controller::{Action, Controller};
pub use coordination::{LeaderElector, LeaderElectorHandle, LeaderEvent, LeaderState};
pub use dispatcher::{Dispatcher, ResourceEventHandler};
pub use informer::{Informer, NamespaceScope};
pub use queue::WorkQueue;
pub use reflector::{reflector, Indexer, Lister, Store};
pub use utils::WatchStreamExt;
pub use watcher::watcher;
