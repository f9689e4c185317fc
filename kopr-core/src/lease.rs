//! The lock record used for leader election
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of object that stores a lock record
///
/// A `Lease` stores the record in its spec; the other kinds store it serialized
/// in a well-known annotation, the way older clients did before leases existed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockKind {
    /// `coordination.k8s.io/v1` Lease
    #[default]
    Lease,
    /// `v1` ConfigMap carrying the record in an annotation
    ConfigMap,
}

impl fmt::Display for LockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockKind::Lease => f.write_str("Lease"),
            LockKind::ConfigMap => f.write_str("ConfigMap"),
        }
    }
}

/// Reference to the single cluster-visible object holding a lock record
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockRef {
    /// Kind of the backing object
    pub kind: LockKind,
    /// Namespace of the backing object
    pub namespace: String,
    /// Name of the backing object
    pub name: String,
}

impl LockRef {
    /// Reference a `Lease` lock
    #[must_use]
    pub fn lease(namespace: &str, name: &str) -> Self {
        Self {
            kind: LockKind::Lease,
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for LockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// The leader election record
///
/// `resource_version` is the optimistic concurrency token: a write is only accepted
/// when it carries the version that is currently stored.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseRecord {
    /// Identity of the current holder, `None` when released
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub holder_identity: Option<String>,
    /// How long a holder may go without renewing before the lock can be taken over
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_duration_seconds: Option<i32>,
    /// When the current holder acquired the lock
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acquire_time: Option<DateTime<Utc>>,
    /// When the current holder last renewed the lock
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renew_time: Option<DateTime<Utc>>,
    /// Number of holder changes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_transitions: Option<i32>,
    /// Version token assigned by the server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
}

impl LeaseRecord {
    /// The moment the current holder's claim lapses, if anyone holds the lock
    #[must_use]
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.holder_identity.as_ref()?;
        let last_renewed_at = self.renew_time.or(self.acquire_time)?;
        Some(last_renewed_at + Duration::seconds(self.lease_duration_seconds.unwrap_or(0).into()))
    }

    /// Whether the record carries no valid claim at `now`
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().map_or(true, |expires_at| expires_at < now)
    }

    /// Whether `identity` is the recorded holder
    #[must_use]
    pub fn is_held_by(&self, identity: &str) -> bool {
        self.holder_identity.as_deref() == Some(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::{LeaseRecord, LockRef};
    use chrono::{Duration, TimeZone, Utc};

    #[test]
    fn unheld_record_is_expired() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert!(LeaseRecord::default().is_expired(now));
    }

    #[test]
    fn record_expires_after_lease_duration() {
        let renewed = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let record = LeaseRecord {
            holder_identity: Some("replica-1".into()),
            lease_duration_seconds: Some(15),
            renew_time: Some(renewed),
            ..LeaseRecord::default()
        };
        assert!(!record.is_expired(renewed + Duration::seconds(10)));
        assert!(!record.is_expired(renewed + Duration::seconds(15)));
        assert!(record.is_expired(renewed + Duration::seconds(16)));
        assert!(record.is_held_by("replica-1"));
    }

    #[test]
    fn lock_ref_display() {
        assert_eq!(LockRef::lease("kube-system", "op").to_string(), "Lease/kube-system/op");
    }
}
