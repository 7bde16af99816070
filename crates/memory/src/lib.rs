//! Storage engine for ctxvault.
//!
//! Each project owns one SQLite database with an FTS5 index. Searches walk
//! a fallback cascade (see [`cascade`]) so noisy free-text queries still
//! return something; saves are deduplicated by fingerprint; records with a
//! TTL disappear from reads once expired and are purged by a sweeper.

pub mod cascade;
pub mod fingerprint;
pub mod registry;
pub mod sqlite;
pub mod sweeper;

pub use registry::{ProjectRegistry, validate_project_id};
pub use sqlite::SqliteMemoryStore;
pub use sweeper::ExpirySweeper;
