//! Greedy budget-bounded selection.
//!
//! Candidates arrive sorted best-first. Each is accepted only if the
//! result still fits `top_k`, the byte budget, and the duplicate rule; a
//! rejected candidate is skipped and the pass continues.

use ctxvault_core::text::{jaccard, normalize_summary};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InjectionKind {
    Memory,
    Concept,
}

/// One piece of context handed to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Injection {
    pub id: String,
    pub kind: InjectionKind,
    /// Memory summary or concept title
    pub title: String,
    /// `title + "\n" + text`
    pub content: String,
    pub snippet: String,
    pub score: f64,
    /// UTF-8 length of `content`
    pub byte_size: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub paths: Vec<String>,
    /// Concept this one was reached from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub via: Option<String>,
}

impl Injection {
    pub fn new(id: String, kind: InjectionKind, title: String, body: &str) -> Self {
        let content = format!("{title}\n{body}");
        Self {
            id,
            kind,
            byte_size: content.len(),
            content,
            title,
            snippet: String::new(),
            score: 0.0,
            tags: Vec::new(),
            paths: Vec::new(),
            via: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct Selection {
    pub selected: Vec<Injection>,
    pub budget_used: usize,
    pub skipped_budget: usize,
    pub skipped_duplicate: usize,
}

/// Duplicate detection over normalized titles.
struct SeenTitles {
    threshold: f64,
    exact: BTreeSet<String>,
    token_sets: Vec<BTreeSet<String>>,
}

impl SeenTitles {
    fn new(threshold: f64) -> Self {
        Self {
            threshold,
            exact: BTreeSet::new(),
            token_sets: Vec::new(),
        }
    }

    fn is_duplicate(&self, normalized: &str, tokens: &BTreeSet<String>) -> bool {
        if self.exact.contains(normalized) {
            return true;
        }
        self.threshold < 1.0
            && !tokens.is_empty()
            && self
                .token_sets
                .iter()
                .any(|seen| jaccard(seen, tokens) >= self.threshold)
    }

    fn insert(&mut self, normalized: String, tokens: BTreeSet<String>) {
        self.exact.insert(normalized);
        self.token_sets.push(tokens);
    }
}

pub fn select(
    candidates: Vec<Injection>,
    top_k: usize,
    budget_bytes: usize,
    dedupe_threshold: f64,
) -> Selection {
    let mut selection = Selection::default();
    let mut seen = SeenTitles::new(dedupe_threshold);

    for candidate in candidates {
        if selection.selected.len() >= top_k {
            break;
        }
        let normalized = normalize_summary(&candidate.title);
        let tokens: BTreeSet<String> = normalized.split_whitespace().map(String::from).collect();
        if seen.is_duplicate(&normalized, &tokens) {
            selection.skipped_duplicate += 1;
            continue;
        }
        if selection.budget_used + candidate.byte_size > budget_bytes {
            selection.skipped_budget += 1;
            continue;
        }
        seen.insert(normalized, tokens);
        selection.budget_used += candidate.byte_size;
        selection.selected.push(candidate);
    }
    selection
}
