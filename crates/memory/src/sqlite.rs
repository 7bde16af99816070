//! SQLite memory store with FTS5 full-text search.
//!
//! One database file per project, holding:
//! - `memories`: the records, keyed by an integer rowid for FTS5 sync
//! - `memory_tags` / `memory_paths`: normalized tag and path sets
//! - `memories_fts`: external-content FTS5 index over summary, text and tags
//!
//! Triggers keep the FTS index in sync on insert/delete/update. Searches go
//! through the fallback cascade in [`crate::cascade`].

use crate::cascade;
use crate::fingerprint::fingerprint;
use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use ctxvault_core::error::MemoryError;
use ctxvault_core::memory::{
    DEFAULT_IMPORTANCE, ForgetOutcome, MemoryPatch, MemoryRecord, MemoryStore, NewMemory,
    RecentRequest, SearchDebug, SearchHit, SearchRequest, StageFailure,
};
use ctxvault_core::text::{
    normalize_path, normalize_paths, normalize_tags, path_like_tokens, strip_glob,
};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::str::FromStr;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Column weights for bm25(): summary, text, tag_text.
const BM25_WEIGHTS: &str = "2.0, 1.0, 1.5";

/// How much one importance point shifts the FTS ordering.
const IMPORTANCE_RANK_WEIGHT: f64 = 0.25;

/// Over-fetch factor when results are post-filtered by path.
const PATH_FILTER_OVERFETCH: usize = 5;

const RECORD_COLUMNS: &str = "m.iid, m.id, m.summary, m.text, m.importance, m.fingerprint, \
     m.created_at, m.updated_at, m.ttl_secs, m.expires_at";

/// A project's memory store backed by SQLite + FTS5.
#[derive(Debug)]
pub struct SqliteMemoryStore {
    pool: SqlitePool,
    project_id: String,
}

impl SqliteMemoryStore {
    /// Open (or create) the store file at `path` for `project_id`.
    pub async fn open(
        project_id: impl Into<String>,
        path: &Path,
        max_connections: u32,
    ) -> Result<Self, MemoryError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let store = Self::connect(project_id.into(), options, max_connections).await?;
        info!(
            project = %store.project_id,
            path = %path.display(),
            "SQLite memory store opened"
        );
        Ok(store)
    }

    /// An ephemeral in-process store. Used by tests.
    pub async fn in_memory(project_id: impl Into<String>) -> Result<Self, MemoryError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| MemoryError::Storage(format!("Invalid SQLite path: {e}")))?;
        Self::connect(project_id.into(), options, 4).await
    }

    async fn connect(
        project_id: String,
        options: SqliteConnectOptions,
        max_connections: u32,
    ) -> Result<Self, MemoryError> {
        let options = options
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .pragma("foreign_keys", "ON");

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await
            .map_err(|e| MemoryError::Storage(format!("Failed to open SQLite: {e}")))?;

        let store = Self { pool, project_id };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Close the pool. Further calls fail with `MemoryError::Unavailable`.
    pub async fn close(&self) {
        self.pool.close().await;
        debug!(project = %self.project_id, "SQLite memory store closed");
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    fn ensure_open(&self) -> Result<(), MemoryError> {
        if self.pool.is_closed() {
            return Err(MemoryError::Unavailable(format!(
                "store for project '{}' is closed",
                self.project_id
            )));
        }
        Ok(())
    }

    /// Create tables, the FTS5 index, its sync triggers, and indexes.
    async fn run_migrations(&self) -> Result<(), MemoryError> {
        let statements: [(&str, &str); 11] = [
            (
                "memories table",
                r#"
                CREATE TABLE IF NOT EXISTS memories (
                    iid          INTEGER PRIMARY KEY AUTOINCREMENT,
                    id           TEXT UNIQUE NOT NULL,
                    summary      TEXT NOT NULL,
                    text         TEXT NOT NULL,
                    tag_text     TEXT NOT NULL DEFAULT '',
                    importance   INTEGER NOT NULL DEFAULT 3,
                    fingerprint  TEXT UNIQUE NOT NULL,
                    created_at   TEXT NOT NULL,
                    updated_at   TEXT NOT NULL,
                    ttl_secs     INTEGER,
                    expires_at   TEXT
                )
                "#,
            ),
            (
                "memory_tags table",
                r#"
                CREATE TABLE IF NOT EXISTS memory_tags (
                    memory_iid  INTEGER NOT NULL REFERENCES memories(iid) ON DELETE CASCADE,
                    tag         TEXT NOT NULL,
                    PRIMARY KEY (memory_iid, tag)
                )
                "#,
            ),
            (
                "memory_paths table",
                r#"
                CREATE TABLE IF NOT EXISTS memory_paths (
                    memory_iid  INTEGER NOT NULL REFERENCES memories(iid) ON DELETE CASCADE,
                    path        TEXT NOT NULL,
                    PRIMARY KEY (memory_iid, path)
                )
                "#,
            ),
            // External-content FTS5 table; content_rowid maps to memories.iid
            (
                "FTS5 table",
                r#"
                CREATE VIRTUAL TABLE IF NOT EXISTS memories_fts USING fts5(
                    summary,
                    text,
                    tag_text,
                    content='memories',
                    content_rowid='iid',
                    tokenize='porter unicode61'
                )
                "#,
            ),
            (
                "insert trigger",
                r#"
                CREATE TRIGGER IF NOT EXISTS memories_ai AFTER INSERT ON memories BEGIN
                    INSERT INTO memories_fts(rowid, summary, text, tag_text)
                    VALUES (new.iid, new.summary, new.text, new.tag_text);
                END
                "#,
            ),
            (
                "delete trigger",
                r#"
                CREATE TRIGGER IF NOT EXISTS memories_ad AFTER DELETE ON memories BEGIN
                    INSERT INTO memories_fts(memories_fts, rowid, summary, text, tag_text)
                    VALUES ('delete', old.iid, old.summary, old.text, old.tag_text);
                END
                "#,
            ),
            (
                "update trigger",
                r#"
                CREATE TRIGGER IF NOT EXISTS memories_au
                AFTER UPDATE OF summary, text, tag_text ON memories BEGIN
                    INSERT INTO memories_fts(memories_fts, rowid, summary, text, tag_text)
                    VALUES ('delete', old.iid, old.summary, old.text, old.tag_text);
                    INSERT INTO memories_fts(rowid, summary, text, tag_text)
                    VALUES (new.iid, new.summary, new.text, new.tag_text);
                END
                "#,
            ),
            (
                "created_at index",
                "CREATE INDEX IF NOT EXISTS idx_memories_created_at ON memories(created_at DESC)",
            ),
            (
                "expires_at index",
                "CREATE INDEX IF NOT EXISTS idx_memories_expires_at ON memories(expires_at)",
            ),
            (
                "tag index",
                "CREATE INDEX IF NOT EXISTS idx_memory_tags_tag ON memory_tags(tag)",
            ),
            (
                "path index",
                "CREATE INDEX IF NOT EXISTS idx_memory_paths_path ON memory_paths(path)",
            ),
        ];

        for (what, sql) in statements {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(|e| MemoryError::MigrationFailed(format!("{what}: {e}")))?;
        }

        debug!(project = %self.project_id, "SQLite migrations complete");
        Ok(())
    }

    /// Parse a record (without tags/paths) and its rowid from a row.
    fn row_to_record(&self, row: &SqliteRow) -> Result<(i64, MemoryRecord), MemoryError> {
        let iid: i64 = column(row, "iid")?;
        let importance: i64 = column(row, "importance")?;
        let ttl_secs: Option<i64> = column(row, "ttl_secs")?;
        let expires_at: Option<String> = column(row, "expires_at")?;

        let record = MemoryRecord {
            id: column(row, "id")?,
            project_id: self.project_id.clone(),
            summary: column(row, "summary")?,
            text: column(row, "text")?,
            tags: BTreeSet::new(),
            paths: BTreeSet::new(),
            importance: clamp_importance(importance),
            created_at: parse_ts(&column::<String>(row, "created_at")?)?,
            updated_at: parse_ts(&column::<String>(row, "updated_at")?)?,
            ttl_secs: ttl_secs.map(|t| t.max(0) as u64),
            expires_at: expires_at.as_deref().map(parse_ts).transpose()?,
            fingerprint: column(row, "fingerprint")?,
        };
        Ok((iid, record))
    }

    /// Fill in tag and path sets for a batch of records.
    async fn load_sets(&self, records: &mut [(i64, MemoryRecord)]) -> Result<(), MemoryError> {
        if records.is_empty() {
            return Ok(());
        }
        let index: HashMap<i64, usize> = records
            .iter()
            .enumerate()
            .map(|(i, (iid, _))| (*iid, i))
            .collect();
        let marks = placeholders(records.len());

        for (table, column_name) in [("memory_tags", "tag"), ("memory_paths", "path")] {
            let sql = format!(
                "SELECT memory_iid, {column_name} AS value FROM {table} WHERE memory_iid IN ({marks})"
            );
            let mut query = sqlx::query(&sql);
            for (iid, _) in records.iter() {
                query = query.bind(*iid);
            }
            let rows = query
                .fetch_all(&self.pool)
                .await
                .map_err(|e| MemoryError::QueryFailed(format!("{table} lookup: {e}")))?;

            for row in &rows {
                let iid: i64 = column(row, "memory_iid")?;
                let value: String = column(row, "value")?;
                if let Some(&i) = index.get(&iid) {
                    let record = &mut records[i].1;
                    if column_name == "tag" {
                        record.tags.insert(value);
                    } else {
                        record.paths.insert(value);
                    }
                }
            }
        }
        Ok(())
    }

    /// Replace the tag and path rows of one record.
    async fn replace_sets(
        conn: &mut SqliteConnection,
        iid: i64,
        tags: &BTreeSet<String>,
        paths: &BTreeSet<String>,
    ) -> Result<(), MemoryError> {
        for table in ["memory_tags", "memory_paths"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE memory_iid = ?"))
                .bind(iid)
                .execute(&mut *conn)
                .await
                .map_err(|e| MemoryError::Storage(format!("{table} clear: {e}")))?;
        }
        for tag in tags {
            sqlx::query("INSERT INTO memory_tags (memory_iid, tag) VALUES (?, ?)")
                .bind(iid)
                .bind(tag)
                .execute(&mut *conn)
                .await
                .map_err(|e| MemoryError::Storage(format!("memory_tags insert: {e}")))?;
        }
        for path in paths {
            sqlx::query("INSERT INTO memory_paths (memory_iid, path) VALUES (?, ?)")
                .bind(iid)
                .bind(path)
                .execute(&mut *conn)
                .await
                .map_err(|e| MemoryError::Storage(format!("memory_paths insert: {e}")))?;
        }
        Ok(())
    }

    /// The error for an update whose fingerprint belongs to another record.
    async fn fingerprint_clash(&self, fingerprint: &str, id: &str) -> MemoryError {
        let other = sqlx::query("SELECT id FROM memories WHERE fingerprint = ? AND id != ?")
            .bind(fingerprint)
            .bind(id)
            .fetch_optional(&self.pool)
            .await;
        match other {
            Ok(Some(row)) => match column::<String>(&row, "id") {
                Ok(other) => MemoryError::DuplicateFingerprint(other),
                Err(e) => e,
            },
            Ok(None) => MemoryError::Storage(format!("fingerprint clash on update of {id}")),
            Err(e) => MemoryError::QueryFailed(format!("Fingerprint lookup: {e}")),
        }
    }

    /// Run one cascade stage. Returns `(raw relevance, snippet, record)`
    /// rows in rank order, tags and paths loaded.
    async fn run_stage(
        &self,
        fts_query: &str,
        tags: &[String],
        include_expired: bool,
        now: &str,
        limit: usize,
    ) -> Result<Vec<(f64, String, MemoryRecord)>, MemoryError> {
        let tag_clause = if tags.is_empty() {
            String::new()
        } else {
            format!(
                "AND m.iid IN (SELECT memory_iid FROM memory_tags WHERE tag IN ({}))",
                placeholders(tags.len())
            )
        };

        let sql = format!(
            r#"
            SELECT {RECORD_COLUMNS},
                   bm25(memories_fts, {BM25_WEIGHTS}) AS fts_rank,
                   snippet(memories_fts, -1, '[', ']', '…', 16) AS snippet
            FROM memories_fts
            JOIN memories m ON m.iid = memories_fts.rowid
            WHERE memories_fts MATCH ?
              AND (? OR m.expires_at IS NULL OR m.expires_at > ?)
              {tag_clause}
            ORDER BY bm25(memories_fts, {BM25_WEIGHTS}) - (m.importance * ?) ASC, m.iid DESC
            LIMIT ?
            "#
        );

        let mut query = sqlx::query(&sql)
            .bind(fts_query)
            .bind(include_expired)
            .bind(now);
        for tag in tags {
            query = query.bind(tag);
        }
        let rows = query
            .bind(IMPORTANCE_RANK_WEIGHT)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| MemoryError::QueryFailed(format!("FTS5 search: {e}")))?;

        let mut records = Vec::with_capacity(rows.len());
        let mut extras = Vec::with_capacity(rows.len());
        for row in &rows {
            let rank: f64 = column(row, "fts_rank")?;
            let snippet: String = column(row, "snippet")?;
            records.push(self.row_to_record(row)?);
            // bm25() is negative, lower = better
            extras.push((-rank, snippet));
        }
        self.load_sets(&mut records).await?;

        Ok(extras
            .into_iter()
            .zip(records)
            .map(|((raw, snippet), (_, record))| (raw, snippet, record))
            .collect())
    }

    async fn fetch_by_ids(&self, ids: &[String]) -> Result<Vec<MemoryRecord>, MemoryError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM memories m WHERE m.id IN ({})",
            placeholders(ids.len())
        );
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id);
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| MemoryError::QueryFailed(format!("Lookup by id: {e}")))?;

        let mut records = rows
            .iter()
            .map(|row| self.row_to_record(row))
            .collect::<Result<Vec<_>, _>>()?;
        self.load_sets(&mut records).await?;
        Ok(records.into_iter().map(|(_, r)| r).collect())
    }
}

#[async_trait]
impl MemoryStore for SqliteMemoryStore {
    fn project_id(&self) -> &str {
        &self.project_id
    }

    async fn save(&self, memory: NewMemory) -> Result<MemoryRecord, MemoryError> {
        self.ensure_open()?;

        let tags = normalize_tags(&memory.tags);
        let paths = normalize_paths(&memory.paths);
        let importance =
            clamp_importance(memory.importance.map_or(i64::from(DEFAULT_IMPORTANCE), i64::from));
        let fingerprint = fingerprint(&memory.summary, &paths);
        let tag_text = tags.iter().cloned().collect::<Vec<_>>().join(" ");
        let now = Utc::now();
        let now_ts = format_ts(&now);
        let expires_at = expiry(now, memory.ttl_secs).as_ref().map(format_ts);
        let ttl = memory.ttl_secs.map(|t| t.min(i64::MAX as u64) as i64);

        // Write first so the transaction takes the write lock up front and
        // concurrent saves wait on the busy timeout instead of failing.
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| MemoryError::Storage(format!("Begin transaction: {e}")))?;

        let new_id = Uuid::new_v4().to_string();
        let row = sqlx::query(
            r#"
            INSERT INTO memories (
                id, summary, text, tag_text, importance, fingerprint,
                created_at, updated_at, ttl_secs, expires_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(fingerprint) DO UPDATE SET
                summary = excluded.summary,
                text = excluded.text,
                tag_text = excluded.tag_text,
                importance = excluded.importance,
                updated_at = excluded.updated_at,
                ttl_secs = excluded.ttl_secs,
                expires_at = excluded.expires_at
            RETURNING iid, id
            "#,
        )
        .bind(&new_id)
        .bind(&memory.summary)
        .bind(&memory.text)
        .bind(&tag_text)
        .bind(i64::from(importance))
        .bind(&fingerprint)
        .bind(&now_ts)
        .bind(&now_ts)
        .bind(ttl)
        .bind(&expires_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| MemoryError::Storage(format!("UPSERT failed: {e}")))?;

        let iid: i64 = column(&row, "iid")?;
        let id: String = column(&row, "id")?;
        if id == new_id {
            debug!(project = %self.project_id, id = %id, "Stored memory");
        } else {
            debug!(project = %self.project_id, id = %id, "Save matched existing fingerprint");
        }

        Self::replace_sets(&mut *tx, iid, &tags, &paths).await?;
        tx.commit()
            .await
            .map_err(|e| MemoryError::Storage(format!("Commit failed: {e}")))?;

        self.get(&id)
            .await?
            .ok_or_else(|| MemoryError::Storage(format!("memory {id} vanished after save")))
    }

    async fn update(
        &self,
        id: &str,
        patch: MemoryPatch,
    ) -> Result<Option<MemoryRecord>, MemoryError> {
        self.ensure_open()?;
        let Some(current) = self.get(id).await? else {
            return Ok(None);
        };

        let summary = patch.summary.unwrap_or(current.summary);
        let text = patch.text.unwrap_or(current.text);
        let tags = patch.tags.map(normalize_tags).unwrap_or(current.tags);
        let paths = patch.paths.map(normalize_paths).unwrap_or(current.paths);
        let importance = patch
            .importance
            .map_or(current.importance, |i| clamp_importance(i64::from(i)));
        let ttl_secs = patch.ttl_secs.unwrap_or(current.ttl_secs);

        let fingerprint = fingerprint(&summary, &paths);
        let tag_text = tags.iter().cloned().collect::<Vec<_>>().join(" ");
        let now = Utc::now();
        let expires_at = expiry(now, ttl_secs).as_ref().map(format_ts);

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| MemoryError::Storage(format!("Begin transaction: {e}")))?;

        // The UNIQUE fingerprint column reports clashes, so the transaction
        // starts with its write.
        let row = match sqlx::query(
            r#"
            UPDATE memories SET
                summary = ?, text = ?, tag_text = ?, importance = ?, fingerprint = ?,
                updated_at = ?, ttl_secs = ?, expires_at = ?
            WHERE id = ?
            RETURNING iid
            "#,
        )
        .bind(&summary)
        .bind(&text)
        .bind(&tag_text)
        .bind(i64::from(importance))
        .bind(&fingerprint)
        .bind(format_ts(&now))
        .bind(ttl_secs.map(|t| t.min(i64::MAX as u64) as i64))
        .bind(&expires_at)
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        {
            Ok(row) => row,
            Err(e) if is_unique_violation(&e) => {
                drop(tx);
                return Err(self.fingerprint_clash(&fingerprint, id).await);
            }
            Err(e) => return Err(MemoryError::Storage(format!("UPDATE failed: {e}"))),
        };

        let Some(row) = row else {
            // Forgotten between the read and the write.
            return Ok(None);
        };
        let iid: i64 = column(&row, "iid")?;

        Self::replace_sets(&mut *tx, iid, &tags, &paths).await?;
        tx.commit()
            .await
            .map_err(|e| MemoryError::Storage(format!("Commit failed: {e}")))?;

        debug!(project = %self.project_id, id = %id, "Updated memory");
        self.get(id).await
    }

    async fn search_with_debug(
        &self,
        request: SearchRequest,
    ) -> Result<SearchDebug, MemoryError> {
        self.ensure_open()?;
        let started = Instant::now();
        let mut outcome = SearchDebug {
            results: Vec::new(),
            queries_tried: Vec::new(),
            stage_used: None,
            elapsed_ms: 0,
            total_scanned: 0,
            degraded: Vec::new(),
        };

        let path_tokens = if request.path_filter {
            let tokens = path_like_tokens(&request.query);
            if tokens.is_empty() {
                debug!(project = %self.project_id, "Path filter requested but query has no path tokens");
                outcome.elapsed_ms = started.elapsed().as_millis() as u64;
                return Ok(outcome);
            }
            Some(tokens)
        } else {
            None
        };

        if request.limit == 0 {
            outcome.elapsed_ms = started.elapsed().as_millis() as u64;
            return Ok(outcome);
        }

        let tags: Vec<String> = normalize_tags(&request.tags).into_iter().collect();
        let fetch_limit = if path_tokens.is_some() {
            request.limit.saturating_mul(PATH_FILTER_OVERFETCH)
        } else {
            request.limit
        };
        let now = format_ts(&Utc::now());

        for planned in cascade::plan(&request.query) {
            outcome.queries_tried.push(planned.query.clone());

            let rows = match self
                .run_stage(&planned.query, &tags, request.include_expired, &now, fetch_limit)
                .await
            {
                Ok(rows) => rows,
                Err(e) => {
                    warn!(
                        project = %self.project_id,
                        stage = %planned.stage,
                        query = %planned.query,
                        error = %e,
                        "Search stage failed, relaxing query"
                    );
                    outcome.degraded.push(StageFailure {
                        stage: planned.stage,
                        query: planned.query,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };
            outcome.total_scanned += rows.len();

            let mut kept: Vec<(f64, String, MemoryRecord)> = match &path_tokens {
                Some(tokens) => rows
                    .into_iter()
                    .filter(|(_, _, record)| paths_match(&record.paths, tokens))
                    .collect(),
                None => rows,
            };
            kept.truncate(request.limit);

            if kept.is_empty() {
                continue;
            }

            let best = kept.iter().map(|(raw, _, _)| *raw).fold(0.0_f64, f64::max);
            outcome.results = kept
                .into_iter()
                .map(|(raw, snippet, record)| SearchHit {
                    relevance: if best > 0.0 { (raw / best).clamp(0.0, 1.0) } else { 1.0 },
                    snippet,
                    record,
                })
                .collect();
            outcome.stage_used = Some(planned.stage);
            break;
        }

        outcome.elapsed_ms = started.elapsed().as_millis() as u64;
        debug!(
            project = %self.project_id,
            stage = ?outcome.stage_used,
            tried = outcome.queries_tried.len(),
            results = outcome.results.len(),
            "Search complete"
        );
        Ok(outcome)
    }

    async fn get_recent(&self, request: RecentRequest) -> Result<Vec<MemoryRecord>, MemoryError> {
        self.ensure_open()?;
        if request.limit == 0 {
            return Ok(Vec::new());
        }

        let prefix = request
            .path_prefix
            .as_deref()
            .map(|p| strip_glob(&normalize_path(p)).to_string())
            .filter(|p| !p.is_empty());

        let path_clause = if prefix.is_some() {
            "AND EXISTS (SELECT 1 FROM memory_paths p \
             WHERE p.memory_iid = m.iid AND p.path LIKE ? ESCAPE '\\')"
        } else {
            ""
        };
        let sql = format!(
            r#"
            SELECT {RECORD_COLUMNS} FROM memories m
            WHERE (? OR m.expires_at IS NULL OR m.expires_at > ?)
              {path_clause}
            ORDER BY m.created_at DESC, m.iid DESC
            LIMIT ?
            "#
        );

        let mut query = sqlx::query(&sql)
            .bind(request.include_expired)
            .bind(format_ts(&Utc::now()));
        if let Some(prefix) = &prefix {
            query = query.bind(format!("{}%", escape_like(prefix)));
        }
        let rows = query
            .bind(request.limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| MemoryError::QueryFailed(format!("Recent listing: {e}")))?;

        let mut records = rows
            .iter()
            .map(|row| self.row_to_record(row))
            .collect::<Result<Vec<_>, _>>()?;
        self.load_sets(&mut records).await?;
        Ok(records.into_iter().map(|(_, r)| r).collect())
    }

    async fn get(&self, id: &str) -> Result<Option<MemoryRecord>, MemoryError> {
        self.ensure_open()?;
        Ok(self.fetch_by_ids(&[id.to_string()]).await?.into_iter().next())
    }

    async fn get_multiple(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, Option<MemoryRecord>>, MemoryError> {
        self.ensure_open()?;
        let mut found: HashMap<String, Option<MemoryRecord>> =
            ids.iter().map(|id| (id.clone(), None)).collect();
        for record in self.fetch_by_ids(ids).await? {
            found.insert(record.id.clone(), Some(record));
        }
        Ok(found)
    }

    async fn forget(&self, id: &str) -> Result<ForgetOutcome, MemoryError> {
        self.ensure_open()?;
        let result = sqlx::query("DELETE FROM memories WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| MemoryError::Storage(format!("DELETE failed: {e}")))?;

        if result.rows_affected() > 0 {
            debug!(project = %self.project_id, id = %id, "Forgot memory");
            Ok(ForgetOutcome {
                ok: true,
                message: format!("Memory {id} forgotten"),
            })
        } else {
            Ok(ForgetOutcome {
                ok: false,
                message: format!("Memory {id} not found"),
            })
        }
    }

    async fn purge_expired(&self) -> Result<usize, MemoryError> {
        self.ensure_open()?;
        let result =
            sqlx::query("DELETE FROM memories WHERE expires_at IS NOT NULL AND expires_at <= ?")
                .bind(format_ts(&Utc::now()))
                .execute(&self.pool)
                .await
                .map_err(|e| MemoryError::Storage(format!("Expiry purge failed: {e}")))?;
        Ok(result.rows_affected() as usize)
    }

    async fn count(&self) -> Result<usize, MemoryError> {
        self.ensure_open()?;
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM memories")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| MemoryError::QueryFailed(format!("COUNT failed: {e}")))?;
        let count: i64 = column(&row, "cnt")?;
        Ok(count as usize)
    }
}

fn column<'r, T>(row: &'r SqliteRow, name: &str) -> Result<T, MemoryError>
where
    T: sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
{
    row.try_get(name)
        .map_err(|e| MemoryError::QueryFailed(format!("{name} column: {e}")))
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .is_some_and(|db| db.is_unique_violation())
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn clamp_importance(value: i64) -> u8 {
    value.clamp(1, 5) as u8
}

/// Fixed-width UTC timestamps so text comparison orders chronologically.
pub(crate) fn format_ts(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>, MemoryError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| MemoryError::QueryFailed(format!("bad timestamp '{value}': {e}")))
}

fn expiry(from: DateTime<Utc>, ttl_secs: Option<u64>) -> Option<DateTime<Utc>> {
    let secs = i64::try_from(ttl_secs?).ok()?;
    from.checked_add_signed(Duration::try_seconds(secs)?)
}

fn escape_like(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

/// A record matches when one of its paths (glob stripped) and one of the
/// query's path tokens contain each other.
fn paths_match(record_paths: &BTreeSet<String>, tokens: &[String]) -> bool {
    record_paths.iter().any(|path| {
        let prefix = strip_glob(path);
        !prefix.is_empty()
            && tokens
                .iter()
                .any(|t| t.contains(prefix) || prefix.contains(t.as_str()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctxvault_core::CascadeStage;

    async fn test_store() -> SqliteMemoryStore {
        SqliteMemoryStore::in_memory("test-project")
            .await
            .expect("in-memory store")
    }

    #[tokio::test]
    async fn save_and_get() {
        let store = test_store().await;
        let saved = store
            .save(
                NewMemory::new("JWT auth flow", "Tokens are verified in middleware")
                    .with_tags(["Auth", "security"])
                    .with_paths(["./src/middleware/auth.ts"]),
            )
            .await
            .unwrap();

        let got = store.get(&saved.id).await.unwrap().unwrap();
        assert_eq!(got.summary, "JWT auth flow");
        assert_eq!(got.project_id, "test-project");
        assert_eq!(got.importance, DEFAULT_IMPORTANCE);
        assert!(got.tags.contains("auth"));
        assert!(got.paths.contains("src/middleware/auth.ts"));
        assert_eq!(got.created_at, got.updated_at);
    }

    #[tokio::test]
    async fn duplicate_save_updates_in_place() {
        let store = test_store().await;
        let first = store
            .save(NewMemory::new("JWT auth flow", "v1").with_paths(["src/auth.ts"]))
            .await
            .unwrap();
        let second = store
            .save(
                NewMemory::new("jwt auth flow!", "v2")
                    .with_paths(["src/auth.ts"])
                    .with_importance(5),
            )
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.created_at, second.created_at);
        assert_eq!(second.text, "v2");
        assert_eq!(second.importance, 5);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn same_summary_different_paths_are_distinct() {
        let store = test_store().await;
        store
            .save(NewMemory::new("cache note", "a").with_paths(["src/a.rs"]))
            .await
            .unwrap();
        store
            .save(NewMemory::new("cache note", "b").with_paths(["src/b.rs"]))
            .await
            .unwrap();
        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn importance_is_clamped() {
        let store = test_store().await;
        let m = store
            .save(NewMemory::new("loud", "x").with_importance(9))
            .await
            .unwrap();
        assert_eq!(m.importance, 5);
        let m = store
            .save(NewMemory::new("quiet", "x").with_importance(0))
            .await
            .unwrap();
        assert_eq!(m.importance, 1);
    }

    #[tokio::test]
    async fn literal_search_hits_first_stage() {
        let store = test_store().await;
        store
            .save(NewMemory::new("Database pooling", "Use sqlx pools for SQLite connections"))
            .await
            .unwrap();

        let outcome = store
            .search_with_debug(SearchRequest::new("sqlite"))
            .await
            .unwrap();
        assert_eq!(outcome.stage_used, Some(CascadeStage::Literal));
        assert_eq!(outcome.queries_tried, vec!["sqlite"]);
        assert_eq!(outcome.results.len(), 1);
        assert!((outcome.results[0].relevance - 1.0).abs() < 1e-9);
        assert!(outcome.results[0].snippet.contains('['));
    }

    #[tokio::test]
    async fn punctuated_query_falls_back_to_sanitized() {
        let store = test_store().await;
        store
            .save(NewMemory::new("foo bar notes", "The foo module talks to bar"))
            .await
            .unwrap();

        let outcome = store
            .search_with_debug(SearchRequest::new("foo-bar!"))
            .await
            .unwrap();
        assert_eq!(outcome.stage_used, Some(CascadeStage::Sanitized));
        assert_eq!(outcome.queries_tried, vec!["foo-bar!", "foo bar"]);
        assert_eq!(outcome.results.len(), 1);
    }

    #[tokio::test]
    async fn syntax_error_stage_is_recorded_and_skipped() {
        let store = test_store().await;
        store
            .save(NewMemory::new("Auth token bug", "fix the auth token refresh bug"))
            .await
            .unwrap();

        // `fix:` reads as a column filter in FTS5
        let outcome = store
            .search_with_debug(SearchRequest::new("fix: auth-token bug!"))
            .await
            .unwrap();
        assert_eq!(outcome.degraded.len(), 1);
        assert_eq!(outcome.degraded[0].stage, CascadeStage::Literal);
        assert_eq!(outcome.degraded[0].query, "fix: auth-token bug!");
        assert!(!outcome.degraded[0].reason.is_empty());
        assert_eq!(outcome.stage_used, Some(CascadeStage::Sanitized));
        assert_eq!(outcome.results.len(), 1);
        assert!(outcome.total_scanned >= outcome.results.len());
    }

    #[tokio::test]
    async fn any_term_stage_rescues_partial_matches() {
        let store = test_store().await;
        store
            .save(NewMemory::new("Rate limiting", "Token bucket per client"))
            .await
            .unwrap();

        let outcome = store
            .search_with_debug(SearchRequest::new("bucket overflow handling"))
            .await
            .unwrap();
        assert_eq!(outcome.stage_used, Some(CascadeStage::AnyTerm));
        assert_eq!(outcome.results.len(), 1);
    }

    #[tokio::test]
    async fn no_match_reports_every_stage() {
        let store = test_store().await;
        store.save(NewMemory::new("unrelated", "nothing here")).await.unwrap();

        let outcome = store
            .search_with_debug(SearchRequest::new("kubernetes, helm!"))
            .await
            .unwrap();
        assert!(outcome.results.is_empty());
        assert_eq!(outcome.stage_used, None);
        assert_eq!(outcome.queries_tried.len(), 4);
    }

    #[tokio::test]
    async fn tag_filter_restricts_results() {
        let store = test_store().await;
        store
            .save(NewMemory::new("auth cache", "cache tokens").with_tags(["auth"]))
            .await
            .unwrap();
        store
            .save(NewMemory::new("page cache", "cache pages").with_tags(["frontend"]))
            .await
            .unwrap();

        let mut request = SearchRequest::new("cache");
        request.tags = vec!["AUTH".into()];
        let hits = store.search(request).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.summary, "auth cache");
    }

    #[tokio::test]
    async fn path_filter_without_path_tokens_is_empty() {
        let store = test_store().await;
        store
            .save(NewMemory::new("auth", "auth notes").with_paths(["src/auth.ts"]))
            .await
            .unwrap();

        let mut request = SearchRequest::new("auth");
        request.path_filter = true;
        let outcome = store.search_with_debug(request).await.unwrap();
        assert!(outcome.results.is_empty());
        assert!(outcome.queries_tried.is_empty());
    }

    #[tokio::test]
    async fn path_filter_keeps_matching_paths() {
        let store = test_store().await;
        store
            .save(NewMemory::new("middleware auth", "verify auth tokens").with_paths(["src/middleware/**"]))
            .await
            .unwrap();
        store
            .save(NewMemory::new("ui auth", "auth button").with_paths(["web/ui"]))
            .await
            .unwrap();

        let mut request = SearchRequest::new("auth src/middleware/auth.ts");
        request.path_filter = true;
        let hits = store.search(request).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.summary, "middleware auth");
    }

    #[tokio::test]
    async fn expired_records_hidden_but_gettable() {
        let store = test_store().await;
        let m = store
            .save(NewMemory::new("ephemeral note", "short lived").with_ttl_secs(0))
            .await
            .unwrap();

        assert!(store.search(SearchRequest::new("ephemeral")).await.unwrap().is_empty());
        assert!(store.get_recent(RecentRequest::default()).await.unwrap().is_empty());
        assert!(store.get(&m.id).await.unwrap().is_some());

        let mut request = SearchRequest::new("ephemeral");
        request.include_expired = true;
        assert_eq!(store.search(request).await.unwrap().len(), 1);

        assert_eq!(store.purge_expired().await.unwrap(), 1);
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn recent_is_newest_first_with_prefix() {
        let store = test_store().await;
        let a = store
            .save(NewMemory::new("first", "a").with_paths(["src/db/pool.rs"]))
            .await
            .unwrap();
        let b = store
            .save(NewMemory::new("second", "b").with_paths(["web/app.ts"]))
            .await
            .unwrap();
        let c = store
            .save(NewMemory::new("third", "c").with_paths(["src/db/**"]))
            .await
            .unwrap();

        let all = store.get_recent(RecentRequest::default()).await.unwrap();
        let ids: Vec<_> = all.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec![c.id.as_str(), b.id.as_str(), a.id.as_str()]);

        let filtered = store
            .get_recent(RecentRequest {
                path_prefix: Some("src/db".into()),
                ..RecentRequest::default()
            })
            .await
            .unwrap();
        assert_eq!(filtered.len(), 2);
        assert!(filtered.iter().all(|r| r.id != b.id));
    }

    #[tokio::test]
    async fn recent_prefix_escapes_like_wildcards() {
        let store = test_store().await;
        store
            .save(NewMemory::new("underscore", "a").with_paths(["src/my_mod.rs"]))
            .await
            .unwrap();
        store
            .save(NewMemory::new("lookalike", "b").with_paths(["src/myXmod.rs"]))
            .await
            .unwrap();

        let filtered = store
            .get_recent(RecentRequest {
                path_prefix: Some("src/my_".into()),
                ..RecentRequest::default()
            })
            .await
            .unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].summary, "underscore");
    }

    #[tokio::test]
    async fn update_changes_fields_and_refingerprints() {
        let store = test_store().await;
        let m = store.save(NewMemory::new("old summary", "text")).await.unwrap();

        let updated = store
            .update(
                &m.id,
                MemoryPatch {
                    summary: Some("new summary".into()),
                    tags: Some(vec!["Fresh".into()]),
                    ..MemoryPatch::default()
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.id, m.id);
        assert_eq!(updated.summary, "new summary");
        assert_eq!(updated.text, "text");
        assert!(updated.tags.contains("fresh"));
        assert_ne!(updated.fingerprint, m.fingerprint);

        let hits = store.search(SearchRequest::new("fresh")).await.unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn update_rejects_fingerprint_collision() {
        let store = test_store().await;
        store.save(NewMemory::new("taken", "a")).await.unwrap();
        let other = store.save(NewMemory::new("free", "b")).await.unwrap();

        let taken = store.search(SearchRequest::new("taken")).await.unwrap();
        let err = store
            .update(
                &other.id,
                MemoryPatch {
                    summary: Some("Taken!".into()),
                    text: Some("changed".into()),
                    ..MemoryPatch::default()
                },
            )
            .await
            .unwrap_err();
        match err {
            MemoryError::DuplicateFingerprint(id) => assert_eq!(id, taken[0].record.id),
            other => panic!("unexpected error: {other}"),
        }

        // rolled back
        let unchanged = store.get(&other.id).await.unwrap().unwrap();
        assert_eq!(unchanged.summary, "free");
        assert_eq!(unchanged.text, "b");
    }

    #[tokio::test]
    async fn update_unknown_id_is_none() {
        let store = test_store().await;
        let out = store.update("nope", MemoryPatch::default()).await.unwrap();
        assert!(out.is_none());
    }

    #[tokio::test]
    async fn forget_is_idempotent() {
        let store = test_store().await;
        let m = store
            .save(NewMemory::new("gone soon", "x").with_tags(["t"]).with_paths(["a/b"]))
            .await
            .unwrap();

        let first = store.forget(&m.id).await.unwrap();
        assert!(first.ok);
        let second = store.forget(&m.id).await.unwrap();
        assert!(!second.ok);
        assert!(second.message.contains("not found"));
        assert!(store.get(&m.id).await.unwrap().is_none());
        assert!(store.search(SearchRequest::new("gone")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn get_multiple_reports_missing_ids() {
        let store = test_store().await;
        let m = store.save(NewMemory::new("present", "x")).await.unwrap();

        let found = store
            .get_multiple(&[m.id.clone(), "missing".to_string()])
            .await
            .unwrap();
        assert_eq!(found.len(), 2);
        assert!(found[&m.id].is_some());
        assert!(found["missing"].is_none());
    }

    #[tokio::test]
    async fn closed_store_is_unavailable() {
        let store = test_store().await;
        store.close().await;
        let err = store.count().await.unwrap_err();
        assert!(matches!(err, MemoryError::Unavailable(_)));
    }

    #[tokio::test]
    async fn file_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.sqlite");

        let store = SqliteMemoryStore::open("p", &path, 2).await.unwrap();
        let m = store.save(NewMemory::new("persisted", "x")).await.unwrap();
        store.close().await;

        let reopened = SqliteMemoryStore::open("p", &path, 2).await.unwrap();
        assert!(reopened.get(&m.id).await.unwrap().is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_duplicate_saves_converge() {
        let dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(
            SqliteMemoryStore::open("p", &dir.path().join("memory.sqlite"), 4)
                .await
                .unwrap(),
        );

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                if i % 4 == 0 {
                    store.purge_expired().await.map(|_| None)
                } else {
                    store
                        .save(NewMemory::new("Same summary", "same body"))
                        .await
                        .map(Some)
                }
            }));
        }

        let mut ids = BTreeSet::new();
        for handle in handles {
            if let Some(record) = handle.await.unwrap().unwrap() {
                ids.insert(record.id);
            }
        }
        assert_eq!(ids.len(), 1);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[test]
    fn path_matching_is_bidirectional_containment() {
        let paths: BTreeSet<String> = ["src/middleware/**".to_string()].into();
        assert!(paths_match(&paths, &["src/middleware/auth.ts".into()]));
        assert!(paths_match(&paths, &["middleware".into()]));
        assert!(!paths_match(&paths, &["web/app.ts".into()]));
    }
}
