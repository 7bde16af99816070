//! Query fallback cascade.
//!
//! Free text from an assistant rarely parses as a clean FTS5 expression.
//! Instead of failing, a search walks an ordered list of increasingly
//! permissive reformulations and stops at the first one that matches:
//!
//! | Stage | Query |
//! |-------|-------|
//! | `literal` | the query as given |
//! | `sanitized` | non-alphanumerics replaced by spaces |
//! | `any_term` | terms of 3+ chars, lowercased, joined with `OR` |
//! | `first_term` | the first such term |
//!
//! Stages whose query is empty, or identical to one already planned, are
//! left out so a store never runs the same statement twice.

use ctxvault_core::CascadeStage;

/// Shortest term kept by the `any_term` and `first_term` stages.
pub const MIN_TERM_CHARS: usize = 3;

/// One stage of a planned cascade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedStage {
    pub stage: CascadeStage,
    pub query: String,
}

/// Plan the stages for a raw query, in execution order.
pub fn plan(raw: &str) -> Vec<PlannedStage> {
    let literal = raw.trim().to_string();
    let sanitized = sanitize(raw);
    let terms = terms(&sanitized);

    let candidates = [
        (CascadeStage::Literal, literal),
        (CascadeStage::Sanitized, sanitized),
        (CascadeStage::AnyTerm, terms.join(" OR ")),
        (
            CascadeStage::FirstTerm,
            terms.first().cloned().unwrap_or_default(),
        ),
    ];

    let mut planned: Vec<PlannedStage> = Vec::with_capacity(candidates.len());
    for (stage, query) in candidates {
        if query.is_empty() || planned.iter().any(|p| p.query == query) {
            continue;
        }
        planned.push(PlannedStage { stage, query });
    }
    planned
}

/// Replace every non-alphanumeric character with a space and collapse runs.
pub fn sanitize(raw: &str) -> String {
    let replaced: String = raw
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    replaced.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Whitespace-delimited terms of at least `MIN_TERM_CHARS` characters.
///
/// Lowercased so FTS5 never reads a term as an `AND`/`OR`/`NOT` operator.
pub fn terms(sanitized: &str) -> Vec<String> {
    sanitized
        .split_whitespace()
        .filter(|t| t.chars().count() >= MIN_TERM_CHARS)
        .map(str::to_lowercase)
        .collect()
}
