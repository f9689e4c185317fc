//! Resolving the identity a replica competes under

use super::{Error, Result};

/// Variables consulted, in order, for [`default_identity`]
pub const IDENTITY_ENV_VARS: [&str; 2] = ["POD_NAME", "HOSTNAME"];

/// The identity of this replica: the pod name, else the host name
///
/// Fails when neither is set, since candidates sharing an identity would all believe they lead.
pub fn default_identity() -> Result<String> {
    identity_from(|var| std::env::var(var).ok())
}

fn identity_from(lookup: impl Fn(&str) -> Option<String>) -> Result<String> {
    IDENTITY_ENV_VARS
        .iter()
        .find_map(|var| lookup(var).filter(|value| !value.trim().is_empty()))
        .ok_or_else(|| Error::Identity(format!("none of {IDENTITY_ENV_VARS:?} is set")))
}
