//! Context assembly pipeline.
//!
//! Turns a task description and the caller's open files into a ranked,
//! budget-bounded set of injections:
//!
//! 1. **Paths**: ancestor prefixes of every open file
//! 2. **Terms**: the task reduced to at most `max_terms` search terms
//! 3. **Memories**: project store search through the fallback cascade
//! 4. **Concepts**: by mode, allowlisted (`smart`), thresholded (`soft`)
//!    or none (`hard`), then enriched with related concepts
//! 5. **Scoring**: one additive scale for both kinds
//! 6. **Selection**: greedy pass under `top_k`, the byte budget and the
//!    duplicate rule
//!
//! Ranking rules can be replaced at runtime; a preview reads them once
//! at the start, so a concurrent `set_rules` only affects later calls.

use crate::paths::derive_path_prefixes;
use crate::scoring::{
    ScoringContext, concept_allowed, memory_allowed, score_concept, score_memory,
};
use crate::selection::{Injection, InjectionKind, select};
use crate::terms::{build_query, extract_terms};
use chrono::Utc;
use ctxvault_config::{ContextConfig, RankingRules, RulesPatch, ScoreWeights};
use ctxvault_core::concept::{AllowlistUpdate, ConceptHit, ConceptQuery, ConceptStore};
use ctxvault_core::memory::{MemoryStore, SearchHit, SearchRequest};
use ctxvault_core::{ContextMode, Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::{PoisonError, RwLock};
use tracing::{debug, warn};

// ── Types ─────────────────────────────────────────────────────────────────

/// The stores one preview runs against.
pub struct Scope<'a> {
    pub project_id: &'a str,
    pub memory: &'a dyn MemoryStore,
    /// `None` when the concept graph is disabled.
    pub concepts: Option<&'a dyn ConceptStore>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PreviewRequest {
    /// What the caller is about to do
    pub task: String,
    #[serde(default)]
    pub open_files: Vec<String>,
    #[serde(default)]
    pub budget_bytes: Option<usize>,
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub mode: Option<ContextMode>,
}

impl PreviewRequest {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            ..Self::default()
        }
    }

    pub fn with_open_files<I, S>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.open_files = files.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_budget(mut self, budget_bytes: usize) -> Self {
        self.budget_bytes = Some(budget_bytes);
        self
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = Some(top_k);
        self
    }

    pub fn with_mode(mut self, mode: ContextMode) -> Self {
        self.mode = Some(mode);
        self
    }
}

/// Counters describing one preview.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviewStats {
    /// Memory candidates owned by the calling project
    pub project_matches: usize,
    /// Memory candidates with non-zero path affinity
    pub path_matches: usize,
    pub concept_matches: usize,
    /// Candidates that survived the rule filters
    pub total_candidates: usize,
    pub selected: usize,
    pub skipped_budget: usize,
    pub skipped_duplicate: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviewResponse {
    pub injections: Vec<Injection>,
    pub budget_used: usize,
    pub budget_limit: usize,
    pub top_k: usize,
    pub mode: ContextMode,
    /// The memory query derived from the task
    pub query: String,
    pub stats: PreviewStats,
}

// ── Assembler ─────────────────────────────────────────────────────────────

pub struct ContextAssembler {
    config: ContextConfig,
    weights: ScoreWeights,
    rules: RwLock<RankingRules>,
}

impl ContextAssembler {
    pub fn new(config: ContextConfig, weights: ScoreWeights, rules: RankingRules) -> Self {
        Self {
            config,
            weights,
            rules: RwLock::new(rules),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(
            ContextConfig::default(),
            ScoreWeights::default(),
            RankingRules::default(),
        )
    }

    /// A copy of the current rules.
    pub fn get_rules(&self) -> RankingRules {
        self.rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Validate and apply a partial update. Later previews see the result.
    pub fn set_rules(&self, patch: &RulesPatch) -> Result<RankingRules> {
        let mut rules = self.rules.write().unwrap_or_else(PoisonError::into_inner);
        let next = rules.patched(patch);
        next.validate().map_err(Error::InvalidRules)?;
        *rules = next.clone();
        debug!(?next, "Ranking rules updated");
        Ok(next)
    }

    pub async fn preview(
        &self,
        scope: Scope<'_>,
        request: &PreviewRequest,
    ) -> Result<PreviewResponse> {
        let rules = self.get_rules();
        let top_k = request.top_k.unwrap_or(self.config.default_top_k);
        let budget_limit = request
            .budget_bytes
            .unwrap_or(self.config.default_budget_bytes);
        let mode = request.mode.unwrap_or(self.config.default_mode);
        let now = Utc::now();

        let prefixes = derive_path_prefixes(request.open_files.as_slice());
        let terms = extract_terms(&request.task, self.config.max_terms);
        let query = build_query(&terms, &request.task);
        let pool = self.config.pool_size(top_k);

        let memories = self.search_memories(scope.memory, &query, pool).await?;
        let concepts = match scope.concepts {
            Some(store) => self.search_concepts(store, scope.project_id, mode, &query, pool).await,
            None => {
                if mode != ContextMode::Hard {
                    warn!(mode = %mode, "Concept graph unavailable, using memories only");
                }
                Vec::new()
            }
        };

        let ctx = ScoringContext {
            project_id: scope.project_id,
            prefixes: &prefixes,
            terms: &terms,
            weights: &self.weights,
            rules: &rules,
            now,
        };

        let mut stats = PreviewStats::default();
        let mut candidates: Vec<Injection> = Vec::with_capacity(memories.len() + concepts.len());

        for hit in memories.into_iter().filter(|h| memory_allowed(h, &rules, now)) {
            let scored = score_memory(&hit, &ctx);
            if scored.project_match {
                stats.project_matches += 1;
            }
            if scored.affinity > 0.0 {
                stats.path_matches += 1;
            }
            candidates.push(memory_injection(hit, scored.score));
        }

        for hit in concepts.into_iter().filter(|h| concept_allowed(h, &rules)) {
            stats.concept_matches += 1;
            let score = score_concept(&hit, &ctx);
            candidates.push(concept_injection(hit, score));
        }

        stats.total_candidates = candidates.len();
        candidates.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));

        let selection = select(candidates, top_k, budget_limit, rules.dedupe_threshold);
        stats.selected = selection.selected.len();
        stats.skipped_budget = selection.skipped_budget;
        stats.skipped_duplicate = selection.skipped_duplicate;

        debug!(
            project = %scope.project_id,
            mode = %mode,
            query = %query,
            candidates = stats.total_candidates,
            selected = stats.selected,
            budget_used = selection.budget_used,
            "Preview assembled"
        );

        Ok(PreviewResponse {
            injections: selection.selected,
            budget_used: selection.budget_used,
            budget_limit,
            top_k,
            mode,
            query,
            stats,
        })
    }

    async fn search_memories(
        &self,
        store: &dyn MemoryStore,
        query: &str,
        pool: usize,
    ) -> Result<Vec<SearchHit>> {
        if query.is_empty() {
            return Ok(Vec::new());
        }
        let hits = store.search(SearchRequest::new(query).limit(pool)).await?;
        if !hits.is_empty() {
            return Ok(hits);
        }
        match query.strip_suffix('*') {
            Some(bare) if !bare.is_empty() => {
                debug!(query = %bare, "Prefix query empty, retrying bare term");
                Ok(store.search(SearchRequest::new(bare).limit(pool)).await?)
            }
            _ => Ok(hits),
        }
    }

    /// Concept candidates for a mode. Failures degrade to no concepts.
    async fn search_concepts(
        &self,
        store: &dyn ConceptStore,
        project_id: &str,
        mode: ContextMode,
        query: &str,
        pool: usize,
    ) -> Vec<ConceptHit> {
        let result = match mode {
            ContextMode::Hard => return Vec::new(),
            ContextMode::Smart => self.allowlisted_concepts(store, project_id, query, pool).await,
            ContextMode::Soft => self.thresholded_concepts(store, query, pool).await,
        };
        result.unwrap_or_else(|e| {
            warn!(project = %project_id, mode = %mode, error = %e, "Concept retrieval failed, using memories only");
            Vec::new()
        })
    }

    async fn allowlisted_concepts(
        &self,
        store: &dyn ConceptStore,
        project_id: &str,
        query: &str,
        pool: usize,
    ) -> Result<Vec<ConceptHit>> {
        let search = store
            .search(ConceptQuery {
                query: query.to_string(),
                limit: Some(pool),
                project_id: Some(project_id.to_string()),
                ..ConceptQuery::default()
            })
            .await?;
        if search.hits.is_empty() {
            return Ok(Vec::new());
        }

        let enriched = store.enrich_with_related(search.hits).await?;
        // Edges may lead outside the allowlist.
        let listed = store
            .update_allowlist(
                project_id,
                AllowlistUpdate {
                    list: true,
                    ..AllowlistUpdate::default()
                },
            )
            .await?;
        let accepted: BTreeSet<String> = listed
            .allowlist
            .unwrap_or_default()
            .into_iter()
            .filter(|entry| entry.accepted)
            .map(|entry| entry.concept_id)
            .collect();
        Ok(enriched
            .into_iter()
            .filter(|hit| accepted.contains(&hit.concept.id))
            .collect())
    }

    async fn thresholded_concepts(
        &self,
        store: &dyn ConceptStore,
        query: &str,
        pool: usize,
    ) -> Result<Vec<ConceptHit>> {
        let min_relevance = self.config.soft_min_relevance;
        let search = store
            .search(ConceptQuery {
                query: query.to_string(),
                limit: Some(pool),
                matches_only: true,
                ..ConceptQuery::default()
            })
            .await?;
        let relevant: Vec<ConceptHit> = search
            .hits
            .into_iter()
            .filter(|hit| hit.relevance > min_relevance)
            .collect();
        if relevant.is_empty() {
            return Ok(relevant);
        }
        Ok(store
            .enrich_with_related(relevant)
            .await?
            .into_iter()
            .filter(|hit| hit.relevance > min_relevance)
            .collect())
    }
}

fn memory_injection(hit: SearchHit, score: f64) -> Injection {
    let record = hit.record;
    let mut injection = Injection::new(record.id, InjectionKind::Memory, record.summary, &record.text);
    injection.snippet = hit.snippet;
    injection.score = score;
    injection.tags = record.tags.into_iter().collect();
    injection.paths = record.paths.into_iter().collect();
    injection
}

fn concept_injection(hit: ConceptHit, score: f64) -> Injection {
    let concept = hit.concept;
    let mut injection = Injection::new(concept.id, InjectionKind::Concept, concept.title, &concept.body);
    injection.snippet = hit.snippet;
    injection.score = score;
    injection.tags = concept.tags.into_iter().collect();
    injection.via = hit.via;
    injection
}
