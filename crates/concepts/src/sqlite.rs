//! SQLite concept graph with FTS5 search.
//!
//! One database shared by every project:
//! - `concepts` + `concept_tags`: the concepts and their tag sets
//! - `concept_edges`: weighted, typed edges (explicit or inferred)
//! - `project_concepts`: per-project allowlists
//! - `concepts_fts`: external-content FTS5 index over title, body and tags

use crate::ranking::{
    EXCERPT_CHARS, by_score_then_id, excerpt, fts_query, query_score, wildcard_score,
};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use ctxvault_config::ConceptConfig;
use ctxvault_core::concept::{
    AllowlistOutcome, AllowlistUpdate, Concept, ConceptHit, ConceptQuery, ConceptSearch,
    ConceptStore, NewConcept, Provenance, Relation, RelationKind,
};
use ctxvault_core::error::ConceptError;
use ctxvault_core::memory::DEFAULT_LIMIT;
use ctxvault_core::text::{normalize_tags, slugify};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Column weights for bm25(): title, body, tag_text.
const BM25_WEIGHTS: &str = "3.0, 1.0, 2.0";

/// Rows fetched from FTS before re-ranking by the composite score.
const MIN_FTS_POOL: usize = 50;

const DEFAULT_CONCEPT_IMPORTANCE: u8 = 3;

const CONCEPT_COLUMNS: &str = "c.iid, c.id, c.title, c.body, c.importance, c.usage_count, \
     c.last_used, c.provenance, c.created_at, c.updated_at";

/// The global concept store backed by SQLite + FTS5.
pub struct SqliteConceptGraph {
    pub(crate) pool: SqlitePool,
    pub(crate) config: ConceptConfig,
}

impl SqliteConceptGraph {
    /// Open (or create) the concept database at `path`.
    pub async fn open(path: &Path, config: ConceptConfig) -> Result<Self, ConceptError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let graph = Self::connect(options, config).await?;
        info!(path = %path.display(), "SQLite concept graph opened");
        Ok(graph)
    }

    /// An ephemeral in-process graph. Used by tests.
    pub async fn in_memory(config: ConceptConfig) -> Result<Self, ConceptError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| ConceptError::Storage(format!("Invalid SQLite path: {e}")))?;
        Self::connect(options, config).await
    }

    async fn connect(
        options: SqliteConnectOptions,
        config: ConceptConfig,
    ) -> Result<Self, ConceptError> {
        let options = options
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .pragma("foreign_keys", "ON");

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| ConceptError::Storage(format!("Failed to open SQLite: {e}")))?;

        let graph = Self { pool, config };
        graph.run_migrations().await?;
        Ok(graph)
    }

    pub async fn close(&self) {
        self.pool.close().await;
        debug!("SQLite concept graph closed");
    }

    pub(crate) fn ensure_open(&self) -> Result<(), ConceptError> {
        if self.pool.is_closed() {
            return Err(ConceptError::Unavailable("concept graph is closed".into()));
        }
        Ok(())
    }

    async fn run_migrations(&self) -> Result<(), ConceptError> {
        let statements: [(&str, &str); 11] = [
            (
                "concepts table",
                r#"
                CREATE TABLE IF NOT EXISTS concepts (
                    iid          INTEGER PRIMARY KEY AUTOINCREMENT,
                    id           TEXT UNIQUE NOT NULL,
                    title        TEXT NOT NULL,
                    body         TEXT NOT NULL,
                    tag_text     TEXT NOT NULL DEFAULT '',
                    importance   INTEGER NOT NULL DEFAULT 3,
                    usage_count  INTEGER NOT NULL DEFAULT 0,
                    last_used    TEXT,
                    provenance   TEXT NOT NULL DEFAULT 'manual',
                    created_at   TEXT NOT NULL,
                    updated_at   TEXT NOT NULL
                )
                "#,
            ),
            (
                "concept_tags table",
                r#"
                CREATE TABLE IF NOT EXISTS concept_tags (
                    concept_id  TEXT NOT NULL REFERENCES concepts(id) ON DELETE CASCADE,
                    tag         TEXT NOT NULL,
                    PRIMARY KEY (concept_id, tag)
                )
                "#,
            ),
            (
                "concept_edges table",
                r#"
                CREATE TABLE IF NOT EXISTS concept_edges (
                    source_id  TEXT NOT NULL REFERENCES concepts(id) ON DELETE CASCADE,
                    target_id  TEXT NOT NULL REFERENCES concepts(id) ON DELETE CASCADE,
                    kind       TEXT NOT NULL,
                    strength   REAL NOT NULL,
                    inferred   INTEGER NOT NULL DEFAULT 0,
                    PRIMARY KEY (source_id, target_id, kind)
                )
                "#,
            ),
            (
                "project_concepts table",
                r#"
                CREATE TABLE IF NOT EXISTS project_concepts (
                    project_id      TEXT NOT NULL,
                    concept_id      TEXT NOT NULL REFERENCES concepts(id) ON DELETE CASCADE,
                    added_at        TEXT NOT NULL,
                    auto_suggested  INTEGER NOT NULL DEFAULT 0,
                    accepted        INTEGER NOT NULL DEFAULT 1,
                    PRIMARY KEY (project_id, concept_id)
                )
                "#,
            ),
            (
                "FTS5 table",
                r#"
                CREATE VIRTUAL TABLE IF NOT EXISTS concepts_fts USING fts5(
                    title,
                    body,
                    tag_text,
                    content='concepts',
                    content_rowid='iid',
                    tokenize='porter unicode61'
                )
                "#,
            ),
            (
                "insert trigger",
                r#"
                CREATE TRIGGER IF NOT EXISTS concepts_ai AFTER INSERT ON concepts BEGIN
                    INSERT INTO concepts_fts(rowid, title, body, tag_text)
                    VALUES (new.iid, new.title, new.body, new.tag_text);
                END
                "#,
            ),
            (
                "delete trigger",
                r#"
                CREATE TRIGGER IF NOT EXISTS concepts_ad AFTER DELETE ON concepts BEGIN
                    INSERT INTO concepts_fts(concepts_fts, rowid, title, body, tag_text)
                    VALUES ('delete', old.iid, old.title, old.body, old.tag_text);
                END
                "#,
            ),
            (
                "update trigger",
                r#"
                CREATE TRIGGER IF NOT EXISTS concepts_au
                AFTER UPDATE OF title, body, tag_text ON concepts BEGIN
                    INSERT INTO concepts_fts(concepts_fts, rowid, title, body, tag_text)
                    VALUES ('delete', old.iid, old.title, old.body, old.tag_text);
                    INSERT INTO concepts_fts(rowid, title, body, tag_text)
                    VALUES (new.iid, new.title, new.body, new.tag_text);
                END
                "#,
            ),
            (
                "tag index",
                "CREATE INDEX IF NOT EXISTS idx_concept_tags_tag ON concept_tags(tag)",
            ),
            (
                "edge target index",
                "CREATE INDEX IF NOT EXISTS idx_concept_edges_target ON concept_edges(target_id)",
            ),
            (
                "allowlist index",
                "CREATE INDEX IF NOT EXISTS idx_project_concepts_concept ON project_concepts(concept_id)",
            ),
        ];

        for (what, sql) in statements {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(|e| ConceptError::MigrationFailed(format!("{what}: {e}")))?;
        }

        debug!("Concept graph migrations complete");
        Ok(())
    }

    /// Parse a concept (without tags or relations) from a row.
    fn row_to_concept(row: &SqliteRow) -> Result<Concept, ConceptError> {
        let importance: i64 = column(row, "importance")?;
        let usage_count: i64 = column(row, "usage_count")?;
        let last_used: Option<String> = column(row, "last_used")?;
        let provenance: String = column(row, "provenance")?;

        Ok(Concept {
            id: column(row, "id")?,
            title: column(row, "title")?,
            body: column(row, "body")?,
            tags: BTreeSet::new(),
            importance: clamp_importance(importance),
            usage_count: usage_count.max(0) as u64,
            last_used: last_used.as_deref().map(parse_ts).transpose()?,
            provenance: Provenance::parse(&provenance),
            created_at: parse_ts(&column::<String>(row, "created_at")?)?,
            updated_at: parse_ts(&column::<String>(row, "updated_at")?)?,
            relations: Vec::new(),
        })
    }

    /// Load tags and outgoing relations for a batch of concepts.
    async fn load_details(&self, concepts: &mut [Concept]) -> Result<(), ConceptError> {
        if concepts.is_empty() {
            return Ok(());
        }
        let index: HashMap<String, usize> = concepts
            .iter()
            .enumerate()
            .map(|(i, c)| (c.id.clone(), i))
            .collect();
        let marks = placeholders(concepts.len());

        let sql = format!("SELECT concept_id, tag FROM concept_tags WHERE concept_id IN ({marks})");
        let mut query = sqlx::query(&sql);
        for concept in concepts.iter() {
            query = query.bind(&concept.id);
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| ConceptError::QueryFailed(format!("Tag lookup: {e}")))?;
        for row in &rows {
            let id: String = column(row, "concept_id")?;
            if let Some(&i) = index.get(&id) {
                concepts[i].tags.insert(column(row, "tag")?);
            }
        }

        let sql = format!(
            "SELECT source_id, target_id, kind, strength FROM concept_edges \
             WHERE source_id IN ({marks}) ORDER BY strength DESC, target_id ASC"
        );
        let mut query = sqlx::query(&sql);
        for concept in concepts.iter() {
            query = query.bind(&concept.id);
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| ConceptError::QueryFailed(format!("Edge lookup: {e}")))?;
        for row in &rows {
            let source: String = column(row, "source_id")?;
            let kind: String = column(row, "kind")?;
            let Some(kind) = RelationKind::parse(&kind) else {
                warn!(source = %source, kind = %kind, "Skipping edge of unknown kind");
                continue;
            };
            if let Some(&i) = index.get(&source) {
                concepts[i].relations.push(Relation {
                    target_id: column(row, "target_id")?,
                    kind,
                    strength: column(row, "strength")?,
                });
            }
        }
        Ok(())
    }

    pub(crate) async fn exists(&self, id: &str) -> Result<bool, ConceptError> {
        let row = sqlx::query("SELECT 1 AS present FROM concepts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| ConceptError::QueryFailed(format!("Existence check: {e}")))?;
        Ok(row.is_some())
    }

    /// A concept with tags and relations loaded.
    pub(crate) async fn fetch(&self, id: &str) -> Result<Option<Concept>, ConceptError> {
        let sql = format!("SELECT {CONCEPT_COLUMNS} FROM concepts c WHERE c.id = ?");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| ConceptError::QueryFailed(format!("Lookup by id: {e}")))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut concepts = [Self::row_to_concept(&row)?];
        self.load_details(&mut concepts).await?;
        let [concept] = concepts;
        Ok(Some(concept))
    }

    /// Rank every concept in the restriction without a query.
    async fn rank_all(
        &self,
        restriction: Option<&BTreeSet<String>>,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<ConceptHit>, ConceptError> {
        let filter = restriction
            .map(|ids| format!("WHERE c.id IN ({})", placeholders(ids.len())))
            .unwrap_or_default();
        let sql = format!("SELECT {CONCEPT_COLUMNS} FROM concepts c {filter}");
        let mut query = sqlx::query(&sql);
        for id in restriction.into_iter().flatten() {
            query = query.bind(id);
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| ConceptError::QueryFailed(format!("Concept scan: {e}")))?;

        let mut scored = rows
            .iter()
            .map(|row| {
                let concept = Self::row_to_concept(row)?;
                let score = wildcard_score(&concept, now, self.config.recent_use_days);
                Ok((score, concept))
            })
            .collect::<Result<Vec<_>, ConceptError>>()?;
        scored.sort_by(|a, b| by_score_then_id((a.0, &a.1.id), (b.0, &b.1.id)));
        scored.truncate(limit);

        self.attach_details(
            scored
                .into_iter()
                .map(|(score, concept)| {
                    let snippet = excerpt(&concept.body, EXCERPT_CHARS);
                    (score, 0.0, snippet, concept)
                })
                .collect(),
        )
        .await
    }

    /// Rank FTS matches of `fts` within the restriction.
    async fn rank_matches(
        &self,
        fts: &str,
        restriction: Option<&BTreeSet<String>>,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<ConceptHit>, ConceptError> {
        let filter = restriction
            .map(|ids| format!("AND c.id IN ({})", placeholders(ids.len())))
            .unwrap_or_default();
        let sql = format!(
            r#"
            SELECT {CONCEPT_COLUMNS},
                   bm25(concepts_fts, {BM25_WEIGHTS}) AS fts_rank,
                   snippet(concepts_fts, -1, '[', ']', '…', 16) AS snippet
            FROM concepts_fts
            JOIN concepts c ON c.iid = concepts_fts.rowid
            WHERE concepts_fts MATCH ?
              {filter}
            ORDER BY bm25(concepts_fts, {BM25_WEIGHTS}) ASC, c.id ASC
            LIMIT ?
            "#
        );
        let mut query = sqlx::query(&sql).bind(fts);
        for id in restriction.into_iter().flatten() {
            query = query.bind(id);
        }
        let rows = query
            .bind(limit.saturating_mul(4).max(MIN_FTS_POOL) as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| ConceptError::QueryFailed(format!("FTS5 search: {e}")))?;

        let mut matched = Vec::with_capacity(rows.len());
        for row in &rows {
            let rank: f64 = column(row, "fts_rank")?;
            let snippet: String = column(row, "snippet")?;
            // bm25() is negative, lower = better
            matched.push((-rank, snippet, Self::row_to_concept(row)?));
        }

        let best = matched.iter().map(|(raw, _, _)| *raw).fold(0.0_f64, f64::max);
        let mut scored: Vec<(f64, f64, String, Concept)> = matched
            .into_iter()
            .map(|(raw, snippet, concept)| {
                let relevance = if best > 0.0 { (raw / best).clamp(0.0, 1.0) } else { 1.0 };
                let score = query_score(relevance, &concept, now, self.config.recent_use_days);
                (score, relevance, snippet, concept)
            })
            .collect();
        scored.sort_by(|a, b| by_score_then_id((a.0, &a.3.id), (b.0, &b.3.id)));
        scored.truncate(limit);

        self.attach_details(scored).await
    }

    async fn attach_details(
        &self,
        scored: Vec<(f64, f64, String, Concept)>,
    ) -> Result<Vec<ConceptHit>, ConceptError> {
        let (meta, mut concepts): (Vec<(f64, f64, String)>, Vec<Concept>) = scored
            .into_iter()
            .map(|(score, relevance, snippet, concept)| ((score, relevance, snippet), concept))
            .unzip();
        self.load_details(&mut concepts).await?;

        Ok(meta
            .into_iter()
            .zip(concepts)
            .map(|((score, relevance, snippet), concept)| ConceptHit {
                concept,
                score,
                relevance,
                snippet,
                via: None,
            })
            .collect())
    }

    /// Ids a query may see: its explicit allowlist, the project's accepted
    /// allowlist, or their intersection. `None` means unrestricted.
    async fn restriction(
        &self,
        query: &ConceptQuery,
    ) -> Result<Option<BTreeSet<String>>, ConceptError> {
        let mut allowed: Option<BTreeSet<String>> =
            query.allowlist.as_ref().map(|ids| ids.iter().cloned().collect());
        if let Some(project_id) = &query.project_id {
            let accepted = self.accepted_ids(project_id).await?;
            allowed = Some(match allowed {
                Some(ids) => ids.intersection(&accepted).cloned().collect(),
                None => accepted,
            });
        }
        Ok(allowed)
    }

    async fn record_use(&self, id: &str, now: DateTime<Utc>) -> Result<(), ConceptError> {
        sqlx::query("UPDATE concepts SET usage_count = usage_count + 1, last_used = ? WHERE id = ?")
            .bind(format_ts(&now))
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| ConceptError::Storage(format!("Usage update: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl ConceptStore for SqliteConceptGraph {
    async fn save(&self, input: NewConcept) -> Result<Concept, ConceptError> {
        self.ensure_open()?;

        let title = input.title.trim().to_string();
        let body_chars = input.body.chars().count();
        if body_chars < self.config.body_min_chars || body_chars > self.config.body_max_chars {
            warn!(
                title = %title,
                chars = body_chars,
                min = self.config.body_min_chars,
                max = self.config.body_max_chars,
                "Concept body outside recommended length"
            );
        }

        let id = input
            .id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| generate_id(&title));
        let tags = normalize_tags(&input.tags);
        let tag_text = tags.iter().cloned().collect::<Vec<_>>().join(" ");
        let importance = clamp_importance(
            input
                .importance
                .map_or(i64::from(DEFAULT_CONCEPT_IMPORTANCE), i64::from),
        );
        let provenance = input.provenance.unwrap_or_default();
        let now = format_ts(&Utc::now());

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| ConceptError::Storage(format!("Begin transaction: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO concepts (
                id, title, body, tag_text, importance, usage_count, last_used,
                provenance, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, 0, NULL, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                body = excluded.body,
                tag_text = excluded.tag_text,
                importance = excluded.importance,
                provenance = excluded.provenance,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&id)
        .bind(&title)
        .bind(&input.body)
        .bind(&tag_text)
        .bind(i64::from(importance))
        .bind(provenance.as_str())
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await
        .map_err(|e| ConceptError::Storage(format!("UPSERT failed: {e}")))?;

        sqlx::query("DELETE FROM concept_tags WHERE concept_id = ?")
            .bind(&id)
            .execute(&mut *tx)
            .await
            .map_err(|e| ConceptError::Storage(format!("concept_tags clear: {e}")))?;
        for tag in &tags {
            sqlx::query("INSERT INTO concept_tags (concept_id, tag) VALUES (?, ?)")
                .bind(&id)
                .bind(tag)
                .execute(&mut *tx)
                .await
                .map_err(|e| ConceptError::Storage(format!("concept_tags insert: {e}")))?;
        }

        // Explicit edges are replaced wholesale by a save.
        sqlx::query("DELETE FROM concept_edges WHERE source_id = ? AND inferred = 0")
            .bind(&id)
            .execute(&mut *tx)
            .await
            .map_err(|e| ConceptError::Storage(format!("Edge clear: {e}")))?;
        for relation in &input.relations {
            if relation.target_id == id {
                continue;
            }
            let target = sqlx::query("SELECT 1 AS present FROM concepts WHERE id = ?")
                .bind(&relation.target_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| ConceptError::QueryFailed(format!("Edge target lookup: {e}")))?;
            if target.is_none() {
                warn!(concept = %id, target = %relation.target_id, "Skipping relation to unknown concept");
                continue;
            }
            sqlx::query(
                r#"
                INSERT INTO concept_edges (source_id, target_id, kind, strength, inferred)
                VALUES (?, ?, ?, ?, 0)
                ON CONFLICT(source_id, target_id, kind) DO UPDATE SET
                    strength = excluded.strength,
                    inferred = 0
                "#,
            )
            .bind(&id)
            .bind(&relation.target_id)
            .bind(relation.kind.as_str())
            .bind(relation.strength.clamp(0.0, 1.0))
            .execute(&mut *tx)
            .await
            .map_err(|e| ConceptError::Storage(format!("Edge insert: {e}")))?;
        }

        self.refresh_inferred_edges(&mut *tx, &id, &tags).await?;

        tx.commit()
            .await
            .map_err(|e| ConceptError::Storage(format!("Commit failed: {e}")))?;
        debug!(concept = %id, provenance = provenance.as_str(), "Saved concept");

        self.fetch(&id)
            .await?
            .ok_or_else(|| ConceptError::Storage(format!("concept {id} vanished after save")))
    }

    async fn search(&self, query: ConceptQuery) -> Result<ConceptSearch, ConceptError> {
        self.ensure_open()?;
        let limit = query.limit.unwrap_or(DEFAULT_LIMIT);
        let restriction = self.restriction(&query).await?;
        if limit == 0 || restriction.as_ref().is_some_and(BTreeSet::is_empty) {
            return Ok(ConceptSearch {
                hits: Vec::new(),
                showing_all: false,
            });
        }

        let now = Utc::now();
        let (mut hits, showing_all) = if query.is_wildcard() {
            if query.matches_only {
                (Vec::new(), false)
            } else {
                (self.rank_all(restriction.as_ref(), limit, now).await?, false)
            }
        } else {
            let matched = match fts_query(&query.query) {
                Some(fts) => match self.rank_matches(&fts, restriction.as_ref(), limit, now).await {
                    Ok(hits) => hits,
                    Err(e) => {
                        warn!(query = %query.query, error = %e, "Concept FTS query failed");
                        Vec::new()
                    }
                },
                None => Vec::new(),
            };
            if matched.is_empty() && query.matches_only {
                debug!(query = %query.query, "No concept matched");
                (Vec::new(), false)
            } else if matched.is_empty() {
                debug!(query = %query.query, "No concept matched, ranking all");
                (self.rank_all(restriction.as_ref(), limit, now).await?, true)
            } else {
                (matched, false)
            }
        };

        if let Some(top) = hits.first_mut() {
            match self.record_use(&top.concept.id, now).await {
                Ok(()) => {
                    top.concept.usage_count += 1;
                    top.concept.last_used = Some(now);
                }
                Err(e) => warn!(concept = %top.concept.id, error = %e, "Usage tracking failed"),
            }
        }

        Ok(ConceptSearch { hits, showing_all })
    }

    async fn get(&self, id: &str) -> Result<Option<Concept>, ConceptError> {
        self.ensure_open()?;
        self.fetch(id).await
    }

    async fn update_allowlist(
        &self,
        project_id: &str,
        update: AllowlistUpdate,
    ) -> Result<AllowlistOutcome, ConceptError> {
        self.ensure_open()?;
        self.apply_allowlist_update(project_id, update).await
    }

    async fn suggest_for_project(
        &self,
        project_id: &str,
        ids: &[String],
    ) -> Result<Vec<String>, ConceptError> {
        self.ensure_open()?;
        self.insert_suggestions(project_id, ids).await
    }

    async fn enrich_with_related(
        &self,
        hits: Vec<ConceptHit>,
    ) -> Result<Vec<ConceptHit>, ConceptError> {
        self.ensure_open()?;
        self.enrich(hits).await
    }

    async fn count(&self) -> Result<usize, ConceptError> {
        self.ensure_open()?;
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM concepts")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| ConceptError::QueryFailed(format!("COUNT failed: {e}")))?;
        let count: i64 = column(&row, "cnt")?;
        Ok(count as usize)
    }
}

/// `slug(title)-xxxxxxxx`
fn generate_id(title: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", slugify(title), &suffix[..8])
}

pub(crate) fn column<'r, T>(row: &'r SqliteRow, name: &str) -> Result<T, ConceptError>
where
    T: sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
{
    row.try_get(name)
        .map_err(|e| ConceptError::QueryFailed(format!("{name} column: {e}")))
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn clamp_importance(value: i64) -> u8 {
    value.clamp(1, 5) as u8
}

pub(crate) fn format_ts(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(value: &str) -> Result<DateTime<Utc>, ConceptError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| ConceptError::QueryFailed(format!("bad timestamp '{value}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_graph() -> SqliteConceptGraph {
        SqliteConceptGraph::in_memory(ConceptConfig::default())
            .await
            .expect("in-memory graph")
    }

    fn body(topic: &str) -> String {
        format!("{topic}: a reusable note long enough to sit inside the recommended window.")
    }

    #[tokio::test]
    async fn save_generates_slug_id() {
        let graph = test_graph().await;
        let c = graph
            .save(NewConcept::new("Error Handling", body("errors")).with_tags(["Rust", "errors"]))
            .await
            .unwrap();

        assert!(c.id.starts_with("error-handling-"));
        assert_eq!(c.id.len(), "error-handling-".len() + 8);
        assert_eq!(c.importance, DEFAULT_CONCEPT_IMPORTANCE);
        assert_eq!(c.provenance, Provenance::Manual);
        assert!(c.tags.contains("rust"));
        assert_eq!(c.usage_count, 0);
    }

    #[tokio::test]
    async fn resave_keeps_created_at_and_usage() {
        let graph = test_graph().await;
        let first = graph
            .save(NewConcept {
                id: Some("pooling".into()),
                ..NewConcept::new("Pooling", body("pools"))
            })
            .await
            .unwrap();
        graph.search(ConceptQuery::new("pooling")).await.unwrap();

        let second = graph
            .save(NewConcept {
                id: Some("pooling".into()),
                importance: Some(5),
                ..NewConcept::new("Connection pooling", body("pools v2"))
            })
            .await
            .unwrap();

        assert_eq!(second.created_at, first.created_at);
        assert_eq!(second.usage_count, 1);
        assert_eq!(second.title, "Connection pooling");
        assert_eq!(second.importance, 5);
        assert_eq!(graph.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn inferred_edges_follow_tag_overlap() {
        let graph = test_graph().await;
        let a = graph
            .save(NewConcept::new("JWT", body("jwt")).with_tags(["auth", "jwt", "security"]))
            .await
            .unwrap();
        let b = graph
            .save(NewConcept::new("Sessions", body("sessions")).with_tags(["auth", "security", "cookies"]))
            .await
            .unwrap();

        // 2 shared of 4 = 0.5 > 0.3
        let a_now = graph.get(&a.id).await.unwrap().unwrap();
        assert_eq!(a_now.relations.len(), 1);
        assert_eq!(a_now.relations[0].target_id, b.id);
        assert_eq!(a_now.relations[0].kind, RelationKind::Related);
        assert!((a_now.relations[0].strength - 0.5).abs() < 1e-9);
        assert_eq!(b.relations.len(), 1);

        // retag b: overlap drops to 1/5 = 0.2, edges vanish both ways
        graph
            .save(NewConcept {
                id: Some(b.id.clone()),
                ..NewConcept::new("Sessions", body("sessions")).with_tags(["auth", "cookies", "csrf"])
            })
            .await
            .unwrap();
        assert!(graph.get(&a.id).await.unwrap().unwrap().relations.is_empty());
        assert!(graph.get(&b.id).await.unwrap().unwrap().relations.is_empty());
    }

    #[tokio::test]
    async fn explicit_relations_keep_kind_and_clamp_strength() {
        let graph = test_graph().await;
        let base = graph.save(NewConcept::new("Ownership", body("own"))).await.unwrap();
        let c = graph
            .save(NewConcept {
                relations: vec![
                    Relation {
                        target_id: base.id.clone(),
                        kind: RelationKind::Prerequisite,
                        strength: 1.7,
                    },
                    Relation {
                        target_id: "missing".into(),
                        kind: RelationKind::Extends,
                        strength: 0.5,
                    },
                ],
                ..NewConcept::new("Lifetimes", body("lifetimes"))
            })
            .await
            .unwrap();

        assert_eq!(c.relations.len(), 1);
        assert_eq!(c.relations[0].kind, RelationKind::Prerequisite);
        assert_eq!(c.relations[0].strength, 1.0);
    }

    #[tokio::test]
    async fn wildcard_search_ranks_everything() {
        let graph = test_graph().await;
        graph.save(NewConcept::new("Low", body("low")).with_importance(1)).await.unwrap();
        graph.save(NewConcept::new("High", body("high")).with_importance(5)).await.unwrap();
        graph.save(NewConcept::new("Mid", body("mid")).with_importance(3)).await.unwrap();

        let result = graph.search(ConceptQuery::new("")).await.unwrap();
        assert!(!result.showing_all);
        let titles: Vec<_> = result.hits.iter().map(|h| h.concept.title.as_str()).collect();
        assert_eq!(titles, vec!["High", "Mid", "Low"]);
        assert!(result.hits.iter().all(|h| h.relevance == 0.0));

        let star = graph.search(ConceptQuery::new("*")).await.unwrap();
        assert_eq!(star.hits.len(), 3);
    }

    #[tokio::test]
    async fn query_without_match_shows_all() {
        let graph = test_graph().await;
        graph.save(NewConcept::new("Caching", body("cache"))).await.unwrap();

        let result = graph.search(ConceptQuery::new("kubernetes")).await.unwrap();
        assert!(result.showing_all);
        assert_eq!(result.hits.len(), 1);
    }

    #[tokio::test]
    async fn matches_only_skips_fallback_and_usage() {
        let graph = test_graph().await;
        let styling = graph.save(NewConcept::new("Styling", body("css"))).await.unwrap();

        for text in ["kubernetes", "kubernetes", "*"] {
            let result = graph
                .search(ConceptQuery {
                    matches_only: true,
                    ..ConceptQuery::new(text)
                })
                .await
                .unwrap();
            assert!(result.hits.is_empty());
            assert!(!result.showing_all);
        }

        let stored = graph.get(&styling.id).await.unwrap().unwrap();
        assert_eq!(stored.usage_count, 0);
        assert!(stored.last_used.is_none());
    }

    #[tokio::test]
    async fn query_match_ranks_relevant_first_and_tracks_usage() {
        let graph = test_graph().await;
        graph
            .save(NewConcept::new("Caching", body("cache invalidation")).with_importance(5))
            .await
            .unwrap();
        let target = graph
            .save(NewConcept::new("Retry policy", body("exponential backoff retries")).with_tags(["retry"]))
            .await
            .unwrap();

        let result = graph.search(ConceptQuery::new("retry backoff")).await.unwrap();
        assert!(!result.showing_all);
        assert_eq!(result.hits[0].concept.id, target.id);
        assert_eq!(result.hits[0].concept.usage_count, 1);
        assert!(result.hits[0].concept.last_used.is_some());
        assert!((result.hits[0].relevance - 1.0).abs() < 1e-9);

        let stored = graph.get(&target.id).await.unwrap().unwrap();
        assert_eq!(stored.usage_count, 1);
    }

    #[tokio::test]
    async fn project_restriction_uses_accepted_allowlist() {
        let graph = test_graph().await;
        let allowed = graph.save(NewConcept::new("Allowed", body("allowed"))).await.unwrap();
        let suggested = graph.save(NewConcept::new("Suggested", body("suggested"))).await.unwrap();
        graph.save(NewConcept::new("Other", body("other"))).await.unwrap();

        graph
            .update_allowlist(
                "proj",
                AllowlistUpdate {
                    add: vec![allowed.id.clone()],
                    ..AllowlistUpdate::default()
                },
            )
            .await
            .unwrap();
        graph
            .suggest_for_project("proj", &[suggested.id.clone()])
            .await
            .unwrap();

        let mut query = ConceptQuery::new("*");
        query.project_id = Some("proj".into());
        let result = graph.search(query).await.unwrap();
        let ids: Vec<_> = result.hits.iter().map(|h| h.concept.id.as_str()).collect();
        assert_eq!(ids, vec![allowed.id.as_str()]);

        let mut query = ConceptQuery::new("*");
        query.project_id = Some("empty-project".into());
        assert!(graph.search(query).await.unwrap().hits.is_empty());
    }

    #[tokio::test]
    async fn explicit_allowlist_intersects_project() {
        let graph = test_graph().await;
        let a = graph.save(NewConcept::new("A", body("a"))).await.unwrap();
        let b = graph.save(NewConcept::new("B", body("b"))).await.unwrap();
        graph
            .update_allowlist(
                "proj",
                AllowlistUpdate {
                    add: vec![a.id.clone(), b.id.clone()],
                    ..AllowlistUpdate::default()
                },
            )
            .await
            .unwrap();

        let query = ConceptQuery {
            allowlist: Some(vec![b.id.clone(), "ghost".into()]),
            project_id: Some("proj".into()),
            ..ConceptQuery::new("")
        };
        let result = graph.search(query).await.unwrap();
        assert_eq!(result.hits.len(), 1);
        assert_eq!(result.hits[0].concept.id, b.id);
    }

    #[tokio::test]
    async fn allowlist_add_rejects_unknown_ids() {
        let graph = test_graph().await;
        let real = graph.save(NewConcept::new("Real", body("real"))).await.unwrap();

        let outcome = graph
            .update_allowlist(
                "proj",
                AllowlistUpdate {
                    add: vec![real.id.clone(), "ghost".into()],
                    remove: vec!["never-added".into()],
                    list: true,
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome.added, Some(vec![real.id.clone()]));
        assert_eq!(outcome.removed, Some(vec![]));
        let list = outcome.allowlist.unwrap();
        assert_eq!(list.len(), 1);
        assert!(list[0].accepted);
        assert!(!list[0].auto_suggested);
    }

    #[tokio::test]
    async fn manual_add_accepts_suggestion() {
        let graph = test_graph().await;
        let c = graph.save(NewConcept::new("Tip", body("tip"))).await.unwrap();

        let suggested = graph.suggest_for_project("proj", &[c.id.clone()]).await.unwrap();
        assert_eq!(suggested, vec![c.id.clone()]);
        assert!(graph.accepted_ids("proj").await.unwrap().is_empty());

        // suggesting again is a no-op
        assert!(graph.suggest_for_project("proj", &[c.id.clone()]).await.unwrap().is_empty());

        graph
            .update_allowlist(
                "proj",
                AllowlistUpdate {
                    add: vec![c.id.clone()],
                    ..AllowlistUpdate::default()
                },
            )
            .await
            .unwrap();
        let entries = graph.list_allowlist("proj").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].accepted);
        assert!(entries[0].auto_suggested);
    }

    #[tokio::test]
    async fn enrichment_appends_discounted_neighbours() {
        let graph = test_graph().await;
        let a = graph
            .save(NewConcept::new("Tokens", body("tokens")).with_tags(["auth", "jwt"]))
            .await
            .unwrap();
        let b = graph
            .save(NewConcept::new("Refresh", body("refresh")).with_tags(["auth", "jwt", "refresh"]))
            .await
            .unwrap();
        let conflicting = graph
            .save(NewConcept {
                relations: vec![Relation {
                    target_id: a.id.clone(),
                    kind: RelationKind::Conflicts,
                    strength: 1.0,
                }],
                ..NewConcept::new("Stateless", body("stateless"))
            })
            .await
            .unwrap();
        // edge only runs stateless -> tokens; add the reverse explicitly
        graph
            .save(NewConcept {
                id: Some(a.id.clone()),
                relations: vec![Relation {
                    target_id: conflicting.id.clone(),
                    kind: RelationKind::Conflicts,
                    strength: 1.0,
                }],
                ..NewConcept::new("Tokens", body("tokens")).with_tags(["auth", "jwt"])
            })
            .await
            .unwrap();

        let seed = ConceptHit {
            concept: graph.get(&a.id).await.unwrap().unwrap(),
            score: 4.0,
            relevance: 1.0,
            snippet: String::new(),
            via: None,
        };
        let enriched = graph.enrich_with_related(vec![seed]).await.unwrap();

        assert_eq!(enriched.len(), 2);
        let related = &enriched[1];
        assert_eq!(related.concept.id, b.id);
        assert_eq!(related.via.as_deref(), Some(a.id.as_str()));
        // jaccard 2/3, discount 0.5
        assert!((related.score - 4.0 * (2.0 / 3.0) * 0.5).abs() < 1e-9);
        assert!((related.relevance - (2.0 / 3.0) * 0.5).abs() < 1e-9);
        assert!(enriched.iter().all(|h| h.concept.id != conflicting.id));
    }

    #[tokio::test]
    async fn closed_graph_is_unavailable() {
        let graph = test_graph().await;
        graph.close().await;
        assert!(matches!(graph.count().await, Err(ConceptError::Unavailable(_))));
    }
}
