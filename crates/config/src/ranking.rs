//! Ranking rules and scoring weights for context assembly.
//!
//! `ScoreWeights` is fixed for the life of the process (it comes from the
//! config file). `RankingRules` can be read and replaced at runtime; a
//! change only affects subsequent previews.

use serde::{Deserialize, Serialize};

/// Runtime-mutable ranking rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankingRules {
    /// Memories older than this many days are not considered. `None` = no limit.
    #[serde(default = "default_max_age_days")]
    pub max_age_days: Option<u32>,

    /// Memories below this importance are not considered.
    #[serde(default = "default_min_importance")]
    pub min_importance: u8,

    /// Baseline multiplier applied to path affinity.
    #[serde(default = "default_path_boost")]
    pub path_boost: f64,

    /// Concepts below this importance are not considered.
    #[serde(default = "default_concept_importance_threshold")]
    pub concept_importance_threshold: u8,

    /// Token Jaccard at or above which two summaries count as duplicates.
    /// 1.0 means only identical normalized summaries collide.
    #[serde(default = "default_dedupe_threshold")]
    pub dedupe_threshold: f64,
}

fn default_max_age_days() -> Option<u32> {
    Some(365)
}
fn default_min_importance() -> u8 {
    1
}
fn default_path_boost() -> f64 {
    1.5
}
fn default_concept_importance_threshold() -> u8 {
    1
}
fn default_dedupe_threshold() -> f64 {
    1.0
}

impl Default for RankingRules {
    fn default() -> Self {
        Self {
            max_age_days: default_max_age_days(),
            min_importance: default_min_importance(),
            path_boost: default_path_boost(),
            concept_importance_threshold: default_concept_importance_threshold(),
            dedupe_threshold: default_dedupe_threshold(),
        }
    }
}

impl RankingRules {
    pub fn validate(&self) -> Result<(), String> {
        if !(1..=5).contains(&self.min_importance) {
            return Err("min_importance must be between 1 and 5".into());
        }
        if !(1..=5).contains(&self.concept_importance_threshold) {
            return Err("concept_importance_threshold must be between 1 and 5".into());
        }
        if !self.path_boost.is_finite() || self.path_boost <= 0.0 {
            return Err("path_boost must be > 0".into());
        }
        if !(0.0..=1.0).contains(&self.dedupe_threshold) || self.dedupe_threshold == 0.0 {
            return Err("dedupe_threshold must be in (0.0, 1.0]".into());
        }
        Ok(())
    }

    /// Apply a partial update, returning the resulting rules.
    pub fn patched(&self, patch: &RulesPatch) -> Self {
        let mut next = self.clone();
        if let Some(max_age) = patch.max_age_days {
            next.max_age_days = max_age;
        }
        if let Some(v) = patch.min_importance {
            next.min_importance = v;
        }
        if let Some(v) = patch.path_boost {
            next.path_boost = v;
        }
        if let Some(v) = patch.concept_importance_threshold {
            next.concept_importance_threshold = v;
        }
        if let Some(v) = patch.dedupe_threshold {
            next.dedupe_threshold = v;
        }
        next
    }
}

/// Partial update for `RankingRules`. `None` fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RulesPatch {
    /// `Some(None)` removes the age limit; JSON `null` maps to it.
    #[serde(
        default,
        with = "::serde_with::rust::double_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_age_days: Option<Option<u32>>,
    #[serde(default)]
    pub min_importance: Option<u8>,
    #[serde(default)]
    pub path_boost: Option<f64>,
    #[serde(default)]
    pub concept_importance_threshold: Option<u8>,
    #[serde(default)]
    pub dedupe_threshold: Option<f64>,
}

/// Named weights of the additive scoring formula.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    /// Bonus for a memory owned by the calling project
    pub project_match: f64,
    /// Penalty for a memory owned by another project
    pub foreign_project_penalty: f64,
    /// Weight of path affinity (0–1) before the query-specificity multiplier
    pub path_affinity: f64,
    /// Multiplier reached when the task reduces to a single term
    pub single_term_path_multiplier: f64,
    /// Affinity at or above which `high_affinity_bonus` applies
    pub high_affinity_threshold: f64,
    pub high_affinity_bonus: f64,
    /// Weight of the tag/task overlap fraction
    pub tag_overlap: f64,
    /// Weight of the recency factor (1.0 / 0.7 / 0.4 / 0.1)
    pub recency: f64,
    /// Weight of importance / 5
    pub importance: f64,
    /// Weight of the capped full-text relevance
    pub relevance: f64,
    pub relevance_cap: f64,
    /// Flat bonus for every concept candidate
    pub concept_base: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            project_match: 1.0,
            foreign_project_penalty: 1.0,
            path_affinity: 1.0,
            single_term_path_multiplier: 4.0,
            high_affinity_threshold: 0.8,
            high_affinity_bonus: 0.5,
            tag_overlap: 1.0,
            recency: 0.5,
            importance: 1.0,
            relevance: 0.5,
            relevance_cap: 1.0,
            concept_base: 0.5,
        }
    }
}

impl ScoreWeights {
    pub fn validate(&self) -> Result<(), String> {
        let all = [
            ("project_match", self.project_match),
            ("foreign_project_penalty", self.foreign_project_penalty),
            ("path_affinity", self.path_affinity),
            ("single_term_path_multiplier", self.single_term_path_multiplier),
            ("high_affinity_threshold", self.high_affinity_threshold),
            ("high_affinity_bonus", self.high_affinity_bonus),
            ("tag_overlap", self.tag_overlap),
            ("recency", self.recency),
            ("importance", self.importance),
            ("relevance", self.relevance),
            ("relevance_cap", self.relevance_cap),
            ("concept_base", self.concept_base),
        ];
        for (name, value) in all {
            if !value.is_finite() || value < 0.0 {
                return Err(format!("weights.{name} must be a finite value >= 0"));
            }
        }
        if self.high_affinity_threshold > 1.0 {
            return Err("weights.high_affinity_threshold must be <= 1.0".into());
        }
        Ok(())
    }
}
