//! Concept store trait: reusable knowledge shared across projects.
//!
//! Concepts live in one global store. Each carries usage statistics and
//! weighted edges to other concepts. A project only sees the concepts on
//! its allowlist when retrieval runs in a restrictive mode.

use crate::error::ConceptError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Where a concept came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    #[default]
    Manual,
    Discovered,
    Imported,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Discovered => "discovered",
            Self::Imported => "imported",
        }
    }

    /// Parse a stored value. Unknown values fall back to `Manual`.
    pub fn parse(value: &str) -> Self {
        match value {
            "discovered" => Self::Discovered,
            "imported" => Self::Imported,
            _ => Self::Manual,
        }
    }
}

/// The kind of an edge between two concepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    Related,
    Prerequisite,
    Extends,
    Conflicts,
}

impl RelationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Related => "related",
            Self::Prerequisite => "prerequisite",
            Self::Extends => "extends",
            Self::Conflicts => "conflicts",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "related" => Some(Self::Related),
            "prerequisite" => Some(Self::Prerequisite),
            "extends" => Some(Self::Extends),
            "conflicts" => Some(Self::Conflicts),
            _ => None,
        }
    }
}

/// An outgoing edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    pub target_id: String,
    pub kind: RelationKind,
    /// 0.0–1.0
    pub strength: f64,
}

/// A stored concept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Concept {
    pub id: String,
    pub title: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: BTreeSet<String>,
    pub importance: u8,
    pub usage_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used: Option<DateTime<Utc>>,
    pub provenance: Provenance,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Outgoing edges, strongest first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub relations: Vec<Relation>,
}

/// Input for `ConceptStore::save`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewConcept {
    /// Replace this concept when set; otherwise an id is generated
    #[serde(default)]
    pub id: Option<String>,
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub importance: Option<u8>,
    #[serde(default)]
    pub provenance: Option<Provenance>,
    /// Explicit edges; strength is taken as given
    #[serde(default)]
    pub relations: Vec<Relation>,
}

impl NewConcept {
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            ..Self::default()
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_importance(mut self, importance: u8) -> Self {
        self.importance = Some(importance);
        self
    }
}

/// A concept search.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConceptQuery {
    /// Free text; empty or `*` ranks every concept
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub limit: Option<usize>,
    /// Restrict to these concept ids
    #[serde(default)]
    pub allowlist: Option<Vec<String>>,
    /// Restrict to this project's accepted allowlist
    #[serde(default)]
    pub project_id: Option<String>,
    /// Return nothing instead of ranking every concept when no concept
    /// matches the query
    #[serde(default)]
    pub matches_only: bool,
}

impl ConceptQuery {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }

    /// Whether the query asks for every concept.
    pub fn is_wildcard(&self) -> bool {
        let q = self.query.trim();
        q.is_empty() || q == "*"
    }
}

/// One ranked concept.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConceptHit {
    pub concept: Concept,
    pub score: f64,
    /// Full-text relevance in [0, 1]; 0 for wildcard rankings
    pub relevance: f64,
    pub snippet: String,
    /// Set when the hit was reached through an edge from another hit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub via: Option<String>,
}

/// Concept search results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConceptSearch {
    pub hits: Vec<ConceptHit>,
    /// True when a query matched nothing and every concept was ranked instead
    pub showing_all: bool,
}

/// One allowlist row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllowlistEntry {
    pub concept_id: String,
    pub added_at: DateTime<Utc>,
    pub auto_suggested: bool,
    pub accepted: bool,
}

/// Allowlist mutation and listing in one call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AllowlistUpdate {
    #[serde(default)]
    pub add: Vec<String>,
    #[serde(default)]
    pub remove: Vec<String>,
    #[serde(default)]
    pub list: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AllowlistOutcome {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub added: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub removed: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowlist: Option<Vec<AllowlistEntry>>,
}

/// The global concept graph contract.
#[async_trait]
pub trait ConceptStore: Send + Sync {
    /// Insert or replace a concept, then recompute its inferred edges.
    async fn save(&self, concept: NewConcept) -> Result<Concept, ConceptError>;

    /// Ranked search. Never returns an empty list for a non-empty store
    /// unless a restriction excludes everything.
    async fn search(&self, query: ConceptQuery) -> Result<ConceptSearch, ConceptError>;

    async fn get(&self, id: &str) -> Result<Option<Concept>, ConceptError>;

    async fn update_allowlist(
        &self,
        project_id: &str,
        update: AllowlistUpdate,
    ) -> Result<AllowlistOutcome, ConceptError>;

    /// Mark concepts as suggested (not yet accepted) for a project.
    async fn suggest_for_project(
        &self,
        project_id: &str,
        ids: &[String],
    ) -> Result<Vec<String>, ConceptError>;

    /// Append concepts reachable through edges from the top hits.
    async fn enrich_with_related(
        &self,
        hits: Vec<ConceptHit>,
    ) -> Result<Vec<ConceptHit>, ConceptError>;

    async fn count(&self) -> Result<usize, ConceptError>;
}
