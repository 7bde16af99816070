//! # ctxvault Core
//!
//! Domain types, traits, and error definitions for the ctxvault retrieval
//! engine. This crate has **no storage dependency**: it defines the model
//! that the storage, concept, and context crates implement against.
//!
//! ## Design Philosophy
//!
//! Each store is defined as a trait here. Implementations live in their
//! respective crates. This enables:
//! - Assembling context against any store implementation
//! - Easy testing with stub implementations
//! - Clean dependency graph (all crates depend inward on core)

pub mod concept;
pub mod context;
pub mod error;
pub mod memory;
pub mod text;

// Re-export key types at crate root for ergonomics
pub use concept::{
    AllowlistEntry, AllowlistOutcome, AllowlistUpdate, Concept, ConceptHit, ConceptQuery,
    ConceptSearch, ConceptStore, NewConcept, Provenance, Relation, RelationKind,
};
pub use context::ContextMode;
pub use error::{ConceptError, Error, MemoryError, Result};
pub use memory::{
    CascadeStage, ForgetOutcome, MemoryPatch, MemoryRecord, MemoryStore, NewMemory,
    RecentRequest, SearchDebug, SearchHit, SearchRequest, StageFailure,
};
