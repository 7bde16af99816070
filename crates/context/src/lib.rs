//! Context assembly for ctxvault.
//!
//! Merges project memories and global concepts into one ranked list and
//! selects what fits a caller's byte budget. `Engine` ties the stores and
//! the assembler together for a whole process.

pub mod assembler;
pub mod engine;
pub mod paths;
pub mod scoring;
pub mod selection;
pub mod terms;

pub use assembler::{ContextAssembler, PreviewRequest, PreviewResponse, PreviewStats, Scope};
pub use engine::Engine;
pub use selection::{Injection, InjectionKind};
