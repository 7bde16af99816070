//! Concept auto-discovery from free text.
//!
//! Markdown-ish text is split at heading lines. Every heading followed by
//! a non-empty body becomes a candidate concept, tagged with the most
//! frequent meaningful terms of its section.

use crate::sqlite::{SqliteConceptGraph, column};
use ctxvault_core::concept::{Concept, ConceptStore, NewConcept, Provenance};
use ctxvault_core::error::ConceptError;
use ctxvault_core::text::{is_stop_word, tokenize};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

/// Tags derived per discovered section.
pub const DISCOVERED_TAGS: usize = 5;

/// Shortest term considered for a discovered tag.
pub const MIN_TAG_CHARS: usize = 4;

#[derive(Debug, Clone, PartialEq)]
pub struct Section {
    pub title: String,
    pub body: String,
}

/// Split text into `(heading, body)` sections. Text before the first
/// heading, and headings without a body, are ignored.
pub fn sections(text: &str) -> Vec<Section> {
    fn flush(current: Option<(String, Vec<&str>)>, found: &mut Vec<Section>) {
        if let Some((title, lines)) = current {
            let body = lines.join("\n").trim().to_string();
            if !title.is_empty() && !body.is_empty() {
                found.push(Section { title, body });
            }
        }
    }

    let mut found = Vec::new();
    let mut current: Option<(String, Vec<&str>)> = None;

    for line in text.lines() {
        match heading(line) {
            Some(title) => {
                flush(current.take(), &mut found);
                current = Some((title.to_string(), Vec::new()));
            }
            None => {
                if let Some((_, lines)) = current.as_mut() {
                    lines.push(line);
                }
            }
        }
    }
    flush(current, &mut found);
    found
}

/// Heading text of a `#`-prefixed line.
fn heading(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    let rest = trimmed.trim_start_matches('#');
    if rest.len() == trimmed.len() {
        return None;
    }
    // `#tag` without a space is not a heading
    if !rest.is_empty() && !rest.starts_with(char::is_whitespace) {
        return None;
    }
    Some(rest.trim().trim_end_matches('#').trim())
}

/// The `n` most frequent non-stop-word terms of at least
/// `MIN_TAG_CHARS` characters. Ties keep first-seen order.
pub fn top_terms(text: &str, n: usize) -> Vec<String> {
    let mut counts: HashMap<String, (usize, usize)> = HashMap::new();
    for (position, term) in tokenize(text).into_iter().enumerate() {
        if term.chars().count() < MIN_TAG_CHARS
            || is_stop_word(&term)
            || term.chars().all(|c| c.is_ascii_digit())
        {
            continue;
        }
        counts.entry(term).or_insert((0, position)).0 += 1;
    }

    let mut ranked: Vec<(String, (usize, usize))> = counts.into_iter().collect();
    ranked.sort_by(|(_, (count_a, first_a)), (_, (count_b, first_b))| {
        count_b.cmp(count_a).then(first_a.cmp(first_b))
    });
    ranked.into_iter().take(n).map(|(term, _)| term).collect()
}

impl SqliteConceptGraph {
    /// Save a concept for every new section of `text`.
    ///
    /// Sections whose title already exists (case-insensitively) are
    /// skipped. With `project_id`, the new concepts are suggested to that
    /// project's allowlist.
    pub async fn discover(
        &self,
        text: &str,
        project_id: Option<&str>,
    ) -> Result<Vec<Concept>, ConceptError> {
        self.ensure_open()?;

        let rows = sqlx::query("SELECT title FROM concepts")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| ConceptError::QueryFailed(format!("Title scan: {e}")))?;
        let mut known: HashSet<String> = HashSet::with_capacity(rows.len());
        for row in &rows {
            known.insert(column::<String>(row, "title")?.trim().to_lowercase());
        }

        let mut saved = Vec::new();
        for section in sections(text) {
            if !known.insert(section.title.to_lowercase()) {
                debug!(title = %section.title, "Discovery skipped existing title");
                continue;
            }
            let tags = top_terms(&format!("{}\n{}", section.title, section.body), DISCOVERED_TAGS);
            let concept = self
                .save(NewConcept {
                    title: section.title,
                    body: section.body,
                    tags,
                    provenance: Some(Provenance::Discovered),
                    ..NewConcept::default()
                })
                .await?;
            saved.push(concept);
        }

        if let Some(project_id) = project_id {
            let ids: Vec<String> = saved.iter().map(|c| c.id.clone()).collect();
            self.suggest_for_project(project_id, &ids).await?;
        }

        info!(discovered = saved.len(), "Concept discovery complete");
        Ok(saved)
    }
}
