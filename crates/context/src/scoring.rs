//! Candidate scoring.
//!
//! Memories and concepts are scored on one additive scale so they can be
//! merged into a single ranking. Every weight comes from `ScoreWeights`;
//! `RankingRules::path_boost` sets the baseline path multiplier.

use crate::paths::path_affinity;
use chrono::{DateTime, Duration, Utc};
use ctxvault_config::{RankingRules, ScoreWeights};
use ctxvault_core::text::tokenize;
use ctxvault_core::{ConceptHit, SearchHit};
use std::collections::{BTreeSet, HashSet};

/// Everything a score depends on besides the candidate itself.
pub struct ScoringContext<'a> {
    pub project_id: &'a str,
    pub prefixes: &'a BTreeSet<String>,
    pub terms: &'a [String],
    pub weights: &'a ScoreWeights,
    pub rules: &'a RankingRules,
    pub now: DateTime<Utc>,
}

/// A scored memory and its path affinity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryScore {
    pub score: f64,
    pub affinity: f64,
    pub project_match: bool,
}

/// Path multiplier for a query of `term_count` terms.
///
/// `path_boost + (single_term - path_boost) / n²`: a single-term query gets
/// `single_term`, longer queries approach `path_boost`.
pub fn path_multiplier(path_boost: f64, single_term: f64, term_count: usize) -> f64 {
    if term_count == 0 {
        return path_boost;
    }
    let n = term_count as f64;
    path_boost + (single_term - path_boost) / (n * n)
}

/// 1.0 within a day, 0.7 within a week, 0.4 within a month, 0.1 beyond.
pub fn recency_factor(created_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let age = now.signed_duration_since(created_at);
    if age < Duration::hours(24) {
        1.0
    } else if age < Duration::days(7) {
        0.7
    } else if age < Duration::days(30) {
        0.4
    } else {
        0.1
    }
}

/// Fraction of `terms` found among the tokens of `tags`.
pub fn tag_overlap<'t>(terms: &[String], tags: impl IntoIterator<Item = &'t String>) -> f64 {
    if terms.is_empty() {
        return 0.0;
    }
    let tokens: HashSet<String> = tags.into_iter().flat_map(|t| tokenize(t)).collect();
    let found = terms.iter().filter(|t| tokens.contains(*t)).count();
    found as f64 / terms.len() as f64
}

fn importance_part(importance: u8, weight: f64) -> f64 {
    f64::from(importance) / 5.0 * weight
}

fn relevance_part(relevance: f64, weights: &ScoreWeights) -> f64 {
    relevance.min(weights.relevance_cap) * weights.relevance
}

pub fn score_memory(hit: &SearchHit, ctx: &ScoringContext<'_>) -> MemoryScore {
    let w = ctx.weights;
    let record = &hit.record;

    let project_match = record.project_id == ctx.project_id;
    let mut score = if project_match {
        w.project_match
    } else {
        -w.foreign_project_penalty
    };

    let affinity = path_affinity(&record.paths, ctx.prefixes);
    if affinity > 0.0 {
        let multiplier = path_multiplier(
            ctx.rules.path_boost,
            w.single_term_path_multiplier,
            ctx.terms.len(),
        );
        score += affinity * w.path_affinity * multiplier;
        if affinity >= w.high_affinity_threshold {
            score += w.high_affinity_bonus;
        }
    }

    score += tag_overlap(ctx.terms, &record.tags) * w.tag_overlap;
    score += recency_factor(record.created_at, ctx.now) * w.recency;
    score += importance_part(record.importance, w.importance);
    score += relevance_part(hit.relevance, w);

    MemoryScore {
        score,
        affinity,
        project_match,
    }
}

/// Concepts carry no recency and no path component.
pub fn score_concept(hit: &ConceptHit, ctx: &ScoringContext<'_>) -> f64 {
    let w = ctx.weights;
    w.concept_base
        + tag_overlap(ctx.terms, &hit.concept.tags) * w.tag_overlap
        + importance_part(hit.concept.importance, w.importance)
        + relevance_part(hit.relevance, w)
}

/// Whether a memory passes the age and importance rules.
pub fn memory_allowed(hit: &SearchHit, rules: &RankingRules, now: DateTime<Utc>) -> bool {
    if hit.record.importance < rules.min_importance {
        return false;
    }
    match rules.max_age_days.and_then(|days| Duration::try_days(i64::from(days))) {
        Some(max_age) => now.signed_duration_since(hit.record.created_at) <= max_age,
        None => true,
    }
}

pub fn concept_allowed(hit: &ConceptHit, rules: &RankingRules) -> bool {
    hit.concept.importance >= rules.concept_importance_threshold
}
