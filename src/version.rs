// src/version.rs

//! Version comparison
//!
//! The database does not define its own version ordering; it only needs a
//! total order for display sorting and for the replace policy. Versions
//! that parse as semver compare semantically; anything else falls back to
//! byte-wise ordering so the order stays total.

use semver::Version;
use std::cmp::Ordering;

/// Compare two version strings with the external total order.
pub fn compare(a: &str, b: &str) -> Ordering {
    match (Version::parse(a), Version::parse(b)) {
        (Ok(va), Ok(vb)) => va.cmp(&vb),
        _ => a.cmp(b),
    }
}

/// Does `version` satisfy the constraint `op` against `want`?
///
/// `op` is the operator text from a dependency specification, one of
/// `=`, `<`, `>`, `<=`, `>=`.
pub fn satisfies(version: &str, op: &str, want: &str) -> bool {
    let ord = compare(version, want);
    match op {
        "=" => ord == Ordering::Equal,
        "<" => ord == Ordering::Less,
        ">" => ord == Ordering::Greater,
        "<=" => ord != Ordering::Greater,
        ">=" => ord != Ordering::Less,
        _ => false,
    }
}
