//! Ordering of opaque resource versions.
//!
//! Resource versions are opaque tokens. The only guarantee the runtime relies on is that a
//! server issues increasing integers per collection. When both tokens are integers they are
//! compared numerically, otherwise any change of token is treated as a newer revision.

/// Whether `candidate` is a strictly newer revision than `current`
///
/// ```
/// use kopr_core::resource_version::is_newer;
/// assert!(is_newer(Some("10"), Some("9")));
/// assert!(!is_newer(Some("9"), Some("9")));
/// assert!(!is_newer(Some("8"), Some("9")));
/// assert!(is_newer(Some("abc"), Some("abd")));
/// assert!(is_newer(Some("1"), None));
/// ```
#[must_use]
pub fn is_newer(candidate: Option<&str>, current: Option<&str>) -> bool {
    match (candidate, current) {
        (_, None) => true,
        (None, Some(_)) => false,
        (Some(candidate), Some(current)) => match (candidate.parse::<u64>(), current.parse::<u64>()) {
            (Ok(candidate), Ok(current)) => candidate > current,
            _ => candidate != current,
        },
    }
}
