//! Global concept graph for ctxvault.
//!
//! Concepts are reusable notes shared by every project. The graph stores
//! them in SQLite with an FTS5 index, infers `related` edges from tag
//! overlap, ranks by relevance, importance and usage, and keeps a
//! per-project allowlist that restrictive retrieval honours.

pub mod allowlist;
pub mod discovery;
pub mod ranking;
pub mod relations;
pub mod sqlite;

pub use sqlite::SqliteConceptGraph;
