//! Leader election over a single cluster-visible lock record
//!
//! Every replica runs a [`LeaderElector`] against the same [`LockRef`]. The lock changes hands
//! only through conditional writes through a [`LockClient`], so the elector holds no authority
//! beyond what the last accepted write granted.
//!
//! Applications use the handle returned from [`LeaderElector::spawn`] to observe the state and
//! govern their behaviour by it:
//!
//! ```no_run
//! use kopr_core::{LockClient, LockRef};
//! use kopr_runtime::coordination::{identity::default_identity, ConfigBuilder, LeaderElector};
//! # async fn wrapper(client: impl LockClient + 'static) -> Result<(), Box<dyn std::error::Error>> {
//! let config = ConfigBuilder::new(LockRef::lease("kube-system", "my-operator"), default_identity()?).finish()?;
//! let handle = LeaderElector::spawn(config, client);
//! let mut state = handle.state();
//! state.wait_for(|state| state.is_leader()).await?;
//! // leader-only work
//! handle.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! This implementation does not guarantee that only one client is acting as a leader (a.k.a. fencing).
//! A leader that cannot renew keeps believing it leads for up to `renew_deadline`, which is shorter
//! than the lease duration other candidates wait out, so overlap needs a clock running faster than
//! that margin.

pub mod editor;
pub mod identity;

use self::editor::LeaseEditor;
use chrono::{DateTime, Utc};
use futures::prelude::*;
use kopr_core::{LeaseRecord, LockClient, LockRef, WriteOutcome};
use rand::Rng;
use std::time::Duration;
use thiserror::Error;
use tokio::{
    sync::{broadcast, oneshot, watch},
    task::JoinHandle,
    time::Instant,
};

/// The jitter factor applied to the retry period of candidates.
pub const JITTER_FACTOR: f64 = 1.2;

/// Coordination error variants.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid leader election config: {0}")]
    Config(String),
    #[error("client error from lock api call: {0}")]
    Client(#[source] kopr_core::Error),
    #[error("unable to resolve an identity: {0}")]
    Identity(String),
    #[error("error from the leader elector task: {0}")]
    TaskError(String),
}

/// Coordination result type.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Fully validated configuration for use by a `LeaderElector` instance.
///
/// Construct an instance via `ConfigBuilder::finish()`.
#[derive(Clone, Debug)]
pub struct Config(ConfigBuilder);

impl Config {
    #[must_use]
    pub fn lock(&self) -> &LockRef {
        &self.0.lock
    }

    #[must_use]
    pub fn identity(&self) -> &str {
        &self.0.identity
    }
}

/// Configuration for leader election.
#[derive(Clone, Debug)]
pub struct ConfigBuilder {
    /// The record competed for.
    pub lock: LockRef,
    /// The identity to use when the lock is acquired.
    ///
    /// Typically this value will directly correspond to the name of the pod running this process.
    pub identity: String,
    /// How long a holder's claim stays valid without renewal.
    ///
    /// A new set of candidates started against a record held by a stale identity must wait
    /// this long before taking over, so keep it as short as clock skew allows.
    ///
    /// Defaults to 15 seconds.
    pub lease_duration: Duration,
    /// How long the leader keeps retrying failed renewals before stepping down.
    ///
    /// Defaults to 10 seconds.
    pub renew_deadline: Duration,
    /// The duration which leader elector clients should wait between tries of actions.
    ///
    /// Defaults to 2 seconds.
    pub retry_period: Duration,
    /// Clear the holder on shutdown so a successor can acquire without waiting out the lease.
    pub release_on_cancel: bool,
}

impl ConfigBuilder {
    /// Builder with the core client defaults for `lock` and `identity`
    #[must_use]
    pub fn new(lock: LockRef, identity: impl Into<String>) -> Self {
        Self {
            lock,
            identity: identity.into(),
            lease_duration: Duration::from_secs(15),
            renew_deadline: Duration::from_secs(10),
            retry_period: Duration::from_secs(2),
            release_on_cancel: true,
        }
    }

    /// Finish building leader elector config by validating this config builder.
    ///
    /// # Errors
    /// Will return `Error::Config` if this member's fields are invalid according to the
    /// following constraints:
    /// - `identity` and the lock name must not be empty strings;
    /// - `lease_duration` must be greater than `renew_deadline`;
    /// - `renew_deadline` must be greater than `JITTER_FACTOR * retry_period`;
    /// - every duration must be >= 1 second.
    pub fn finish(self) -> Result<Config> {
        if self.identity.trim().is_empty() {
            return Err(Error::Config("identity may not be empty".into()));
        }
        if self.lock.name.is_empty() {
            return Err(Error::Config("lock name may not be empty".into()));
        }
        if self.lease_duration <= self.renew_deadline {
            return Err(Error::Config(
                "lease_duration must be greater than renew_deadline".into(),
            ));
        }
        if self.renew_deadline <= self.retry_period.mul_f64(JITTER_FACTOR) {
            return Err(Error::Config(format!(
                "renew_deadline must be greater than retry_period*{JITTER_FACTOR}"
            )));
        }
        for (name, duration) in [
            ("lease_duration", self.lease_duration),
            ("renew_deadline", self.renew_deadline),
            ("retry_period", self.retry_period),
        ] {
            if duration.as_secs() < 1 {
                return Err(Error::Config(format!("{name} must be at least 1 second")));
            }
        }
        Ok(Config(self))
    }
}

/// Different states which a leader elector may be in.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum LeaderState {
    /// Another candidate holds the lock, or it was never observed.
    #[default]
    Follower,
    /// An acquisition attempt is in flight.
    Candidate,
    /// This client instance is the leader.
    Leader,
}

impl LeaderState {
    /// Check if currently in `Leader` state.
    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leader)
    }
}

/// Leadership lifecycle notifications
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LeaderEvent {
    /// This replica acquired the lock
    BecameLeader,
    /// This replica no longer holds the lock, whether released, taken over or not renewed in time
    LostLeadership,
}

/// Acquires and maintains a lock record to establish leadership.
pub struct LeaderElector<C> {
    client: C,
    config: ConfigBuilder,
    editor: LeaseEditor,
    /// The record as last written by us, only trusted while leading.
    observed: Option<LeaseRecord>,
    /// When a renewal last succeeded.
    last_renewed: Option<Instant>,
    state_tx: watch::Sender<LeaderState>,
    events_tx: broadcast::Sender<LeaderEvent>,
}

impl<C: LockClient> LeaderElector<C> {
    /// An elector that has not yet made any attempt
    pub fn new(config: Config, client: C) -> Self {
        let config = config.0;
        let editor = LeaseEditor {
            identity: config.identity.clone(),
            lease_duration_seconds: i32::try_from(config.lease_duration.as_secs()).unwrap_or(i32::MAX),
        };
        let (state_tx, _) = watch::channel(LeaderState::Follower);
        let (events_tx, _) = broadcast::channel(16);
        Self {
            client,
            config,
            editor,
            observed: None,
            last_renewed: None,
            state_tx,
            events_tx,
        }
    }

    /// The current state
    pub fn state(&self) -> LeaderState {
        *self.state_tx.borrow()
    }

    /// Attempt to acquire, or renew, the lock at `now`
    ///
    /// Returns whether this identity holds the lock after the attempt. Losing the race to
    /// another candidate is not an error.
    #[tracing::instrument(level = "debug", skip(self), fields(lock = %self.config.lock, identity = %self.config.identity))]
    pub async fn try_acquire_or_renew(&mut self, now: DateTime<Utc>) -> Result<bool> {
        let current = match &self.observed {
            Some(record) if self.state().is_leader() => Some(record.clone()),
            _ => self.client.get(&self.config.lock).await.map_err(Error::Client)?,
        };
        let Some(next) = self.editor.acquire(current.clone(), now) else {
            self.observed = current;
            return Ok(false);
        };
        let outcome = match current.as_ref().and_then(|record| record.resource_version.as_deref()) {
            Some(version) => self.client.conditional_write(&self.config.lock, version, &next).await,
            None => self.client.create(&self.config.lock, &next).await,
        }
        .map_err(Error::Client)?;
        match outcome {
            WriteOutcome::Written(record) => {
                self.observed = Some(record);
                Ok(true)
            }
            outcome @ (WriteOutcome::Conflict | WriteOutcome::NotFound) => {
                tracing::debug!(?outcome, "lost the race for the lock");
                self.observed = None;
                Ok(false)
            }
        }
    }

    /// Voluntarily clear the holder, if this identity holds the lock
    ///
    /// Returns whether the record was released.
    #[tracing::instrument(level = "debug", skip(self), fields(lock = %self.config.lock, identity = %self.config.identity))]
    pub async fn release(&mut self) -> Result<bool> {
        let current = match self.observed.take() {
            Some(record) => Some(record),
            None => self.client.get(&self.config.lock).await.map_err(Error::Client)?,
        };
        let version = current.as_ref().and_then(|record| record.resource_version.clone());
        let (Some(released), Some(version)) = (self.editor.release(current), version) else {
            return Ok(false);
        };
        let outcome = self
            .client
            .conditional_write(&self.config.lock, &version, &released)
            .await
            .map_err(Error::Client)?;
        self.set_state(LeaderState::Follower);
        Ok(matches!(outcome, WriteOutcome::Written(_)))
    }

    /// Create a new `LeaderElector` instance & spawn it onto the runtime for execution.
    #[must_use = "handle must be used for observing state changes and graceful shutdown"]
    pub fn spawn(config: Config, client: C) -> LeaderElectorHandle
    where
        C: 'static,
    {
        let this = Self::new(config, client);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let state = this.state_tx.subscribe();
        let events = this.events_tx.clone();
        let handle = tokio::spawn(this.run(shutdown_rx));
        LeaderElectorHandle {
            shutdown: shutdown_tx,
            state,
            events,
            handle,
        }
    }

    async fn run(mut self, mut shutdown: oneshot::Receiver<()>) {
        tracing::info!(lock = %self.config.lock, identity = %self.config.identity, "leader elector task started");
        let mut delay = Duration::ZERO;
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                () = tokio::time::sleep(delay) => {}
            }
            self.attempt().await;
            delay = self.next_attempt_in();
        }

        if self.state().is_leader() {
            if self.config.release_on_cancel {
                match self.release().await {
                    Ok(released) => tracing::info!(released, "released lock on shutdown"),
                    Err(err) => tracing::warn!(error = %err, "failed to release lock on shutdown"),
                }
            }
            self.set_state(LeaderState::Follower);
        }
        tracing::info!("leader elector task terminated");
    }

    /// One pass of the acquire/renew loop, driving the state transitions
    async fn attempt(&mut self) {
        let was_leader = self.state().is_leader();
        if !was_leader {
            self.set_state(LeaderState::Candidate);
        }
        match self.try_acquire_or_renew(Utc::now()).await {
            Ok(true) => {
                self.last_renewed = Some(Instant::now());
                self.set_state(LeaderState::Leader);
            }
            Ok(false) => self.set_state(LeaderState::Follower),
            Err(err) => {
                let within_deadline = self
                    .last_renewed
                    .is_some_and(|at| at.elapsed() < self.config.renew_deadline);
                if was_leader && within_deadline {
                    tracing::warn!(error = %err, "failed to renew lock, retrying");
                } else {
                    tracing::warn!(error = %err, "failed to acquire lock");
                    self.observed = None;
                    self.set_state(LeaderState::Follower);
                }
            }
        }
    }

    /// Get the duration to delay before attempting the next lease update.
    fn next_attempt_in(&self) -> Duration {
        if self.state().is_leader() {
            self.config.retry_period
        } else {
            // jitter to mitigate contention
            let rand_val: f64 = rand::rng().random_range(1.0..JITTER_FACTOR);
            self.config.retry_period.mul_f64(rand_val)
        }
    }

    /// Publish `state`, emitting a [`LeaderEvent`] when leadership changes
    fn set_state(&mut self, state: LeaderState) {
        let previous = self.state_tx.send_replace(state);
        let event = match (previous.is_leader(), state.is_leader()) {
            (false, true) => LeaderEvent::BecameLeader,
            (true, false) => LeaderEvent::LostLeadership,
            _ => return,
        };
        if event == LeaderEvent::LostLeadership {
            self.last_renewed = None;
        }
        tracing::info!(?event, lock = %self.config.lock, identity = %self.config.identity, "leadership changed");
        let _res = self.events_tx.send(event);
    }
}

/// A handle to a leader elector task.
pub struct LeaderElectorHandle {
    /// Shutdown channel.
    shutdown: oneshot::Sender<()>,
    /// A watch signal over the observed leader state.
    state: watch::Receiver<LeaderState>,
    events: broadcast::Sender<LeaderEvent>,
    /// A join handle to the spawned leader elector task.
    handle: JoinHandle<()>,
}

impl LeaderElectorHandle {
    /// Get a handle to the state signal of this leader elector task.
    ///
    /// This signal receiver may be embedded in other parts of a program and used to govern actions
    /// taken by the app in accordance with leader election state.
    pub fn state(&self) -> watch::Receiver<LeaderState> {
        self.state.clone()
    }

    /// Subscribe to leadership changes from now on
    pub fn events(&self) -> broadcast::Receiver<LeaderEvent> {
        self.events.subscribe()
    }

    pub fn is_leader(&self) -> bool {
        self.state.borrow().is_leader()
    }

    /// Shutdown this leader elector task, releasing the lock if configured to.
    pub fn shutdown(self) -> impl Future<Output = Result<()>> {
        let _res = self.shutdown.send(());
        self.handle.map_err(|res| Error::TaskError(res.to_string()))
    }
}
