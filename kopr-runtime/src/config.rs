//! File-based operator configuration
//!
//! ```yaml
//! resource:
//!   apiVersion: example.com/v1
//!   kind: Widget
//! namespaces: [apps, infra]
//! labelSelector: app=web
//! resyncPeriodSeconds: 300
//! leaderElection:
//!   lockKind: Lease
//!   lockName: widget-operator
//!   lockNamespace: kube-system
//! backoff:
//!   baseMillis: 5
//!   maxSeconds: 1000
//! workers: 2
//! ```

use crate::{
    controller,
    coordination::{self, identity::default_identity},
    informer::NamespaceScope,
    watcher,
};
use kopr_core::{dynamic::ApiResource, labels::Selector, LockKind, LockRef};
use serde::Deserialize;
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;

/// Errors loading an [`OperatorConfig`]
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read {1:?}: {0}")]
    ReadConfig(#[source] std::io::Error, PathBuf),

    #[error("failed to parse operator config: {0}")]
    Parse(#[source] serde_yaml::Error),

    #[error("invalid operator config: {0}")]
    Invalid(String),

    #[error("failed to resolve the leader election identity: {0}")]
    Identity(#[source] coordination::Error),
}

/// The resource type an operator watches
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceConfig {
    pub api_version: String,
    pub kind: String,
    /// Overrides the plural derived from `kind`
    pub plural: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderElectionConfig {
    #[serde(default)]
    pub lock_kind: LockKind,
    pub lock_name: String,
    pub lock_namespace: String,
    /// Defaults to [`default_identity`]
    pub identity: Option<String>,
    #[serde(default = "default_lease_duration")]
    pub lease_duration_seconds: u64,
    #[serde(default = "default_renew_deadline")]
    pub renew_deadline_seconds: u64,
    #[serde(default = "default_retry_period")]
    pub retry_period_seconds: u64,
    #[serde(default = "default_true")]
    pub release_on_cancel: bool,
}

/// Per-object retry backoff
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackoffConfig {
    pub base_millis: u64,
    pub max_seconds: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_millis: 5,
            max_seconds: 1000,
        }
    }
}

/// Everything needed to assemble a [`Controller`](crate::Controller) from a file
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorConfig {
    pub resource: ResourceConfig,
    /// Namespaces to watch, each through its own watch; empty for all namespaces
    #[serde(default)]
    pub namespaces: Vec<String>,
    pub label_selector: Option<String>,
    pub resync_period_seconds: Option<u64>,
    pub leader_election: Option<LeaderElectionConfig>,
    #[serde(default)]
    pub backoff: BackoffConfig,
    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_lease_duration() -> u64 {
    15
}

fn default_renew_deadline() -> u64 {
    10
}

fn default_retry_period() -> u64 {
    2
}

fn default_true() -> bool {
    true
}

fn default_workers() -> usize {
    1
}

impl OperatorConfig {
    /// Parse and validate a config
    pub fn from_yaml(text: &str) -> Result<Self, Error> {
        let config: Self = serde_yaml::from_str(text).map_err(Error::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a config file
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let text =
            fs::read_to_string(&path).map_err(|source| Error::ReadConfig(source, path.as_ref().into()))?;
        Self::from_yaml(&text)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.resource.kind.is_empty() || self.resource.api_version.is_empty() {
            return Err(Error::Invalid("resource needs an apiVersion and a kind".into()));
        }
        if self.namespaces.iter().any(String::is_empty) {
            return Err(Error::Invalid("namespaces may not be empty strings".into()));
        }
        if let Some(selector) = &self.label_selector {
            selector
                .parse::<Selector>()
                .map_err(|err| Error::Invalid(err.to_string()))?;
        }
        if self.resync_period_seconds == Some(0) {
            return Err(Error::Invalid("resyncPeriodSeconds must be positive".into()));
        }
        if self.workers == 0 {
            return Err(Error::Invalid("workers must be at least 1".into()));
        }
        if self.backoff.base_millis == 0 || self.backoff.base() > self.backoff.max() {
            return Err(Error::Invalid(
                "backoff baseMillis must be positive and no greater than maxSeconds".into(),
            ));
        }
        if let Some(election) = &self.leader_election {
            if election.lock_name.is_empty() || election.lock_namespace.is_empty() {
                return Err(Error::Invalid(
                    "leaderElection needs a lockName and a lockNamespace".into(),
                ));
            }
        }
        Ok(())
    }

    /// The watched resource type
    pub fn api_resource(&self) -> ApiResource {
        let resource = ApiResource::new(&self.resource.api_version, &self.resource.kind);
        match &self.resource.plural {
            Some(plural) => resource.plural(plural),
            None => resource,
        }
    }

    pub fn namespace_scope(&self) -> NamespaceScope {
        match self.namespaces.as_slice() {
            [] => NamespaceScope::All,
            [namespace] => NamespaceScope::One(namespace.clone()),
            namespaces => NamespaceScope::set(namespaces.iter().cloned()),
        }
    }

    /// Watcher settings shared by every namespace
    pub fn watcher_config(&self) -> watcher::Config {
        let mut config = watcher::Config::default();
        if let Some(selector) = &self.label_selector {
            config = config.labels(selector);
        }
        if let Some(period) = self.resync_period_seconds {
            config = config.resync(Duration::from_secs(period));
        }
        config
    }

    pub fn controller_config(&self) -> controller::Config {
        controller::Config::default()
            .concurrency(self.workers)
            .backoff(self.backoff.base(), self.backoff.max())
    }

    /// Leader election settings, if enabled, with the identity resolved
    ///
    /// The result still has to be validated with [`coordination::ConfigBuilder::finish`].
    pub fn election_config(&self) -> Result<Option<coordination::ConfigBuilder>, Error> {
        let Some(election) = &self.leader_election else {
            return Ok(None);
        };
        let identity = match &election.identity {
            Some(identity) => identity.clone(),
            None => default_identity().map_err(Error::Identity)?,
        };
        let lock = LockRef {
            kind: election.lock_kind,
            namespace: election.lock_namespace.clone(),
            name: election.lock_name.clone(),
        };
        let mut builder = coordination::ConfigBuilder::new(lock, identity);
        builder.lease_duration = Duration::from_secs(election.lease_duration_seconds);
        builder.renew_deadline = Duration::from_secs(election.renew_deadline_seconds);
        builder.retry_period = Duration::from_secs(election.retry_period_seconds);
        builder.release_on_cancel = election.release_on_cancel;
        Ok(Some(builder))
    }
}

impl BackoffConfig {
    fn base(&self) -> Duration {
        Duration::from_millis(self.base_millis)
    }

    fn max(&self) -> Duration {
        Duration::from_secs(self.max_seconds)
    }
}
