//! Dedupe fingerprints.
//!
//! Two saves with the same normalized summary and the same path set
//! describe the same memory, whatever their text, tags or importance.

use ctxvault_core::text::normalize_summary;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

/// Hex SHA-256 of the normalized summary followed by the sorted paths.
///
/// `paths` must already be normalized; a `BTreeSet` keeps them sorted.
pub fn fingerprint(summary: &str, paths: &BTreeSet<String>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_summary(summary).as_bytes());
    for path in paths {
        hasher.update(b"\n");
        hasher.update(path.as_bytes());
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctxvault_core::text::normalize_paths;

    #[test]
    fn punctuation_and_case_do_not_matter() {
        let paths = normalize_paths(["src/auth.ts"]);
        assert_eq!(
            fingerprint("JWT auth flow", &paths),
            fingerprint("jwt, auth   flow!", &paths)
        );
    }

    #[test]
    fn path_order_does_not_matter() {
        let a = normalize_paths(["src/a.rs", "src/b.rs"]);
        let b = normalize_paths(["./src/b.rs", "src/a.rs"]);
        assert_eq!(fingerprint("same", &a), fingerprint("same", &b));
    }

    #[test]
    fn different_paths_differ() {
        let a = normalize_paths(["src/a.rs"]);
        let b = normalize_paths(["src/b.rs"]);
        assert_ne!(fingerprint("same", &a), fingerprint("same", &b));
        assert_ne!(fingerprint("same", &a), fingerprint("same", &BTreeSet::new()));
    }

    #[test]
    fn is_lowercase_hex() {
        let fp = fingerprint("x", &BTreeSet::new());
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }
}
