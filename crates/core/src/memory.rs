//! Memory store trait: project-scoped notes with a resilient full-text path.
//!
//! A memory is a short note an assistant wants to recall later in the same
//! project. Each project owns exactly one store. Searches run through a
//! fixed fallback cascade so free-text task descriptions (punctuation,
//! single tokens, stray operators) still find something useful:
//! - literal query
//! - sanitized query (non-alphanumerics replaced by spaces)
//! - any term of three or more characters (OR)
//! - first such term only

use crate::error::MemoryError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Importance assigned when the caller does not provide one.
pub const DEFAULT_IMPORTANCE: u8 = 3;

/// Result count used when a search or listing omits `limit`.
pub const DEFAULT_LIMIT: usize = 10;

/// A single stored memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// Unique ID for this memory
    pub id: String,

    /// The project whose store owns this record
    pub project_id: String,

    /// Short one-line summary
    pub summary: String,

    /// Full text of the memory
    pub text: String,

    /// Lowercased tags
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: BTreeSet<String>,

    /// Path prefixes or globs this memory applies to
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub paths: BTreeSet<String>,

    /// 1 (trivia) to 5 (critical)
    pub importance: u8,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Time-to-live in seconds, counted from the last update
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_secs: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,

    /// Hash of normalized summary + sorted paths
    pub fingerprint: String,
}

impl MemoryRecord {
    /// Whether the record's TTL has run out at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Input for `MemoryStore::save`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewMemory {
    pub summary: String,
    pub text: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub importance: Option<u8>,
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

impl NewMemory {
    pub fn new(summary: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            text: text.into(),
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

    pub fn with_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.paths = paths.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_importance(mut self, importance: u8) -> Self {
        self.importance = Some(importance);
        self
    }

    pub fn with_ttl_secs(mut self, ttl_secs: u64) -> Self {
        self.ttl_secs = Some(ttl_secs);
        self
    }
}

/// Explicit field update. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryPatch {
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub paths: Option<Vec<String>>,
    #[serde(default)]
    pub importance: Option<u8>,
    /// `Some(None)` clears the TTL.
    #[serde(default)]
    pub ttl_secs: Option<Option<u64>>,
}

/// A search against one project's store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    /// Free text, passed through the fallback cascade
    pub query: String,

    /// Maximum number of results
    #[serde(default = "default_limit")]
    pub limit: usize,

    /// Restrict to records whose paths match path-like tokens in `query`
    #[serde(default)]
    pub path_filter: bool,

    /// Restrict to records sharing at least one of these tags
    #[serde(default)]
    pub tags: Vec<String>,

    /// Include records whose TTL has run out
    #[serde(default)]
    pub include_expired: bool,
}

fn default_limit() -> usize {
    DEFAULT_LIMIT
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            limit: DEFAULT_LIMIT,
            path_filter: false,
            tags: Vec::new(),
            include_expired: false,
        }
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}

/// One ranked search result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub record: MemoryRecord,

    /// BM25 relevance normalized to (0, 1] against the best hit of the stage
    pub relevance: f64,

    /// Highlighted excerpt around the match
    pub snippet: String,
}

/// The cascade stage that produced a result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CascadeStage {
    /// The query exactly as given
    Literal,
    /// Non-alphanumeric characters replaced by spaces
    Sanitized,
    /// Terms of three or more characters joined with OR
    AnyTerm,
    /// Only the first such term
    FirstTerm,
}

impl CascadeStage {
    pub const ALL: [CascadeStage; 4] = [
        CascadeStage::Literal,
        CascadeStage::Sanitized,
        CascadeStage::AnyTerm,
        CascadeStage::FirstTerm,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Literal => "literal",
            Self::Sanitized => "sanitized",
            Self::AnyTerm => "any_term",
            Self::FirstTerm => "first_term",
        }
    }
}

impl std::fmt::Display for CascadeStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A cascade stage whose query failed to execute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageFailure {
    pub stage: CascadeStage,
    pub query: String,
    pub reason: String,
}

/// Search results plus the relaxation trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchDebug {
    pub results: Vec<SearchHit>,
    /// Queries actually executed, in order
    pub queries_tried: Vec<String>,
    /// Stage that produced `results`, if any
    pub stage_used: Option<CascadeStage>,
    pub elapsed_ms: u64,
    /// Rows returned by full-text queries across all attempted stages
    pub total_scanned: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub degraded: Vec<StageFailure>,
}

/// Listing of the most recent records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecentRequest {
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub path_prefix: Option<String>,
    #[serde(default)]
    pub include_expired: bool,
}

impl Default for RecentRequest {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIMIT,
            path_prefix: None,
            include_expired: false,
        }
    }
}

/// Outcome of `forget`. Absent ids are reported, not raised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForgetOutcome {
    pub ok: bool,
    pub message: String,
}

/// The storage engine contract for one project.
///
/// Implementations: SQLite with FTS5.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// The project this store belongs to.
    fn project_id(&self) -> &str;

    /// Insert a memory, or update the record sharing its fingerprint.
    async fn save(&self, memory: NewMemory) -> Result<MemoryRecord, MemoryError>;

    /// Apply an explicit field update. `None` if the id is unknown.
    async fn update(
        &self,
        id: &str,
        patch: MemoryPatch,
    ) -> Result<Option<MemoryRecord>, MemoryError>;

    /// Ranked search through the fallback cascade.
    async fn search(&self, request: SearchRequest) -> Result<Vec<SearchHit>, MemoryError> {
        Ok(self.search_with_debug(request).await?.results)
    }

    /// Ranked search, reporting which stages ran and which one answered.
    async fn search_with_debug(&self, request: SearchRequest)
    -> Result<SearchDebug, MemoryError>;

    /// Most recent records, newest first.
    async fn get_recent(&self, request: RecentRequest) -> Result<Vec<MemoryRecord>, MemoryError>;

    /// Get a memory by ID.
    async fn get(&self, id: &str) -> Result<Option<MemoryRecord>, MemoryError>;

    /// Get several memories; every requested id gets an entry.
    async fn get_multiple(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, Option<MemoryRecord>>, MemoryError> {
        let mut found = HashMap::with_capacity(ids.len());
        for id in ids {
            found.insert(id.clone(), self.get(id).await?);
        }
        Ok(found)
    }

    /// Delete a memory. Idempotent.
    async fn forget(&self, id: &str) -> Result<ForgetOutcome, MemoryError>;

    /// Delete every record whose TTL has run out. Returns the count.
    async fn purge_expired(&self) -> Result<usize, MemoryError>;

    /// Total record count, expired included.
    async fn count(&self) -> Result<usize, MemoryError>;
}
