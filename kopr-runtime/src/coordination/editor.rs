//! Pure edits of a lock record

use chrono::{DateTime, Utc};
use kopr_core::LeaseRecord;

/// Computes the record a candidate wants to write, without talking to the cluster.
///
/// It always assumes that it is given the latest record. If that assumption turns out wrong,
/// the conditional write of the result simply conflicts.
#[derive(Clone, Debug)]
pub struct LeaseEditor {
    /// Identity is a string which uniquely determines a candidate among all others using the same lock.
    /// If two candidates share an identity, both will believe they hold the lock.
    pub identity: String,
    pub lease_duration_seconds: i32,
}

impl LeaseEditor {
    /// Whether `record` may be taken (or renewed) by this identity at `now`
    pub fn is_eligible(&self, record: Option<&LeaseRecord>, now: DateTime<Utc>) -> bool {
        let Some(record) = record else {
            // no record -> no holder -> can acquire
            return true;
        };
        match record.holder_identity.as_deref() {
            None | Some("") => true,
            // held by us -> can acquire (aka renew)
            Some(holder) if holder == self.identity => true,
            Some(_) => record.is_expired(now),
        }
    }

    /// The record claiming the lock for this identity, or `None` if another holder's claim is still valid
    pub fn acquire(&self, record: Option<LeaseRecord>, now: DateTime<Utc>) -> Option<LeaseRecord> {
        if !self.is_eligible(record.as_ref(), now) {
            tracing::debug!("lock is held by another candidate and did not expire yet");
            return None;
        }
        let mut record = record.unwrap_or_default();
        record.renew_time = Some(now);
        let prev_holder = record.holder_identity.replace(self.identity.clone());
        if prev_holder.as_deref() != Some(self.identity.as_str()) {
            record.acquire_time = Some(now);
            record.lease_transitions = Some(record.lease_transitions.map_or(0, |cnt| cnt.saturating_add(1)));
        }
        record.lease_duration_seconds = Some(self.lease_duration_seconds);
        Some(record)
    }

    /// The record with this identity's claim cleared, or `None` if this identity does not hold it
    pub fn release(&self, record: Option<LeaseRecord>) -> Option<LeaseRecord> {
        let mut record = record?;
        if !record.is_held_by(&self.identity) {
            return None;
        }
        record.holder_identity = None;
        record.acquire_time = None;
        record.renew_time = None;
        record.lease_duration_seconds = None;
        Some(record)
    }
}
