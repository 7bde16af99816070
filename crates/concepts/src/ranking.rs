//! Concept ranking formulas.
//!
//! Wildcard ranking (no query) orders purely by importance and usage.
//! Query ranking puts FTS relevance first and uses importance and usage as
//! tie-breakers.

use chrono::{DateTime, Duration, Utc};
use ctxvault_core::Concept;
use ctxvault_core::text::tokenize;
use std::cmp::Ordering;

pub const WILDCARD_RECENT_BONUS: f64 = 2.0;

pub const QUERY_RELEVANCE_WEIGHT: f64 = 3.0;
pub const QUERY_IMPORTANCE_WEIGHT: f64 = 0.2;
pub const QUERY_USAGE_WEIGHT: f64 = 0.1;
pub const QUERY_RECENT_BONUS: f64 = 0.3;

/// Excerpt length for hits that have no FTS snippet.
pub const EXCERPT_CHARS: usize = 160;

/// Whether `last_used` falls within the last `days` days.
pub fn used_recently(last_used: Option<DateTime<Utc>>, now: DateTime<Utc>, days: i64) -> bool {
    let Some(window) = Duration::try_days(days) else {
        return false;
    };
    last_used.is_some_and(|at| now.signed_duration_since(at) <= window)
}

/// `importance + ln(1 + usage) + 2.0 if used recently`
pub fn wildcard_score(concept: &Concept, now: DateTime<Utc>, recent_days: i64) -> f64 {
    let mut score = f64::from(concept.importance) + (concept.usage_count as f64).ln_1p();
    if used_recently(concept.last_used, now, recent_days) {
        score += WILDCARD_RECENT_BONUS;
    }
    score
}

/// `3.0 × relevance + 0.2 × importance + 0.1 × ln(1 + usage) + 0.3 if used recently`
pub fn query_score(
    relevance: f64,
    concept: &Concept,
    now: DateTime<Utc>,
    recent_days: i64,
) -> f64 {
    let mut score = QUERY_RELEVANCE_WEIGHT * relevance
        + QUERY_IMPORTANCE_WEIGHT * f64::from(concept.importance)
        + QUERY_USAGE_WEIGHT * (concept.usage_count as f64).ln_1p();
    if used_recently(concept.last_used, now, recent_days) {
        score += QUERY_RECENT_BONUS;
    }
    score
}

/// FTS5 expression for free text: each token quoted and prefix-matched,
/// OR-joined. `None` when the text has no tokens.
pub fn fts_query(raw: &str) -> Option<String> {
    let tokens: Vec<String> = tokenize(raw)
        .into_iter()
        .map(|t| format!("\"{t}\"*"))
        .collect();
    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(" OR "))
    }
}

/// First `max_chars` characters of `body`, cut at a word boundary.
pub fn excerpt(body: &str, max_chars: usize) -> String {
    let body = body.trim();
    if body.chars().count() <= max_chars {
        return body.to_string();
    }
    let cut: String = body.chars().take(max_chars).collect();
    let trimmed = match cut.rfind(char::is_whitespace) {
        Some(i) if i > 0 => &cut[..i],
        _ => cut.as_str(),
    };
    format!("{}…", trimmed.trim_end())
}

/// Score descending, then id ascending.
pub fn by_score_then_id(a: (f64, &str), b: (f64, &str)) -> Ordering {
    b.0.total_cmp(&a.0).then_with(|| a.1.cmp(b.1))
}
