//! Path prefixes derived from open files, and path affinity.

use ctxvault_core::text::{normalize_path, path_components, strip_glob};
use std::collections::BTreeSet;

/// Every ancestor directory of each open file, the file itself, and a
/// `dir/**` glob for every directory.
///
/// `src/middleware/auth.ts` yields `src`, `src/**`, `src/middleware`,
/// `src/middleware/**` and `src/middleware/auth.ts`.
pub fn derive_path_prefixes<S: AsRef<str>>(open_files: &[S]) -> BTreeSet<String> {
    let mut prefixes = BTreeSet::new();
    for file in open_files {
        let normalized = normalize_path(file.as_ref());
        let components = path_components(&normalized);
        for depth in 1..=components.len() {
            let prefix = components[..depth].join("/");
            if depth < components.len() {
                prefixes.insert(format!("{prefix}/**"));
            }
            prefixes.insert(prefix);
        }
    }
    prefixes
}

/// How closely a record's stored paths sit to the open files, in `[0, 1]`.
///
/// For each stored path, the deepest prefix that equals it or is one of
/// its ancestors scores `depth(prefix) / depth(path)`. The best stored
/// path wins.
pub fn path_affinity(stored: &BTreeSet<String>, prefixes: &BTreeSet<String>) -> f64 {
    let prefix_parts: Vec<Vec<&str>> = prefixes
        .iter()
        .filter(|p| !p.ends_with('*'))
        .map(|p| path_components(p))
        .collect();

    stored
        .iter()
        .filter_map(|path| {
            let parts = path_components(strip_glob(path));
            if parts.is_empty() {
                return None;
            }
            prefix_parts
                .iter()
                .filter(|prefix| prefix.len() <= parts.len() && parts.starts_with(prefix))
                .map(|prefix| prefix.len())
                .max()
                .map(|depth| depth as f64 / parts.len() as f64)
        })
        .fold(0.0, f64::max)
}
