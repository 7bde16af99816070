//! Error types for the ctxvault domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.
//!
//! Absence is never an error here: lookups return `Option`, and `forget`
//! reports a structured outcome. Degraded cascade stages are traced, not
//! raised.

use thiserror::Error;

/// The top-level error type for all ctxvault operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Storage engine errors ---
    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),

    // --- Concept graph errors ---
    #[error("Concept error: {0}")]
    Concept(#[from] ConceptError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Ranking rules ---
    #[error("Invalid ranking rules: {0}")]
    InvalidRules(String),

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// The store for this project was never opened, or has been shut down.
    #[error("Memory store unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid project id: {0}")]
    InvalidProject(String),

    /// An update would make two records share one dedupe fingerprint.
    #[error("Update collides with existing memory {0}")]
    DuplicateFingerprint(String),
}

#[derive(Debug, Error)]
pub enum ConceptError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("Concept store unavailable: {0}")]
    Unavailable(String),
}
