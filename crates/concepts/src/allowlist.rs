//! Per-project concept allowlists.
//!
//! Manual adds are accepted immediately. Suggestions (from discovery) sit
//! on the list unaccepted until a manual add confirms them; restrictive
//! retrieval only sees accepted entries.

use crate::sqlite::{SqliteConceptGraph, column, format_ts, parse_ts};
use chrono::Utc;
use ctxvault_core::concept::{AllowlistEntry, AllowlistOutcome, AllowlistUpdate};
use ctxvault_core::error::ConceptError;
use std::collections::{BTreeSet, HashSet};
use tracing::{debug, warn};

/// Keep the first occurrence of each non-empty id.
fn unique_ids(ids: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.iter()
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty() && seen.insert(id.clone()))
        .collect()
}

impl SqliteConceptGraph {
    pub(crate) async fn apply_allowlist_update(
        &self,
        project_id: &str,
        update: AllowlistUpdate,
    ) -> Result<AllowlistOutcome, ConceptError> {
        let mut outcome = AllowlistOutcome::default();

        if !update.add.is_empty() {
            let now = format_ts(&Utc::now());
            let mut added = Vec::new();
            for id in unique_ids(&update.add) {
                if !self.exists(&id).await? {
                    warn!(project = %project_id, concept = %id, "Allowlist add skipped: unknown concept");
                    continue;
                }
                sqlx::query(
                    r#"
                    INSERT INTO project_concepts (project_id, concept_id, added_at, auto_suggested, accepted)
                    VALUES (?, ?, ?, 0, 1)
                    ON CONFLICT(project_id, concept_id) DO UPDATE SET accepted = 1
                    "#,
                )
                .bind(project_id)
                .bind(&id)
                .bind(&now)
                .execute(&self.pool)
                .await
                .map_err(|e| ConceptError::Storage(format!("Allowlist insert: {e}")))?;
                added.push(id);
            }
            outcome.added = Some(added);
        }

        if !update.remove.is_empty() {
            let mut removed = Vec::new();
            for id in unique_ids(&update.remove) {
                let result = sqlx::query(
                    "DELETE FROM project_concepts WHERE project_id = ? AND concept_id = ?",
                )
                .bind(project_id)
                .bind(&id)
                .execute(&self.pool)
                .await
                .map_err(|e| ConceptError::Storage(format!("Allowlist delete: {e}")))?;
                if result.rows_affected() > 0 {
                    removed.push(id);
                }
            }
            outcome.removed = Some(removed);
        }

        if update.list {
            outcome.allowlist = Some(self.list_allowlist(project_id).await?);
        }

        debug!(
            project = %project_id,
            added = outcome.added.as_ref().map_or(0, Vec::len),
            removed = outcome.removed.as_ref().map_or(0, Vec::len),
            "Allowlist updated"
        );
        Ok(outcome)
    }

    /// Entries for a project, newest first.
    pub async fn list_allowlist(&self, project_id: &str) -> Result<Vec<AllowlistEntry>, ConceptError> {
        self.ensure_open()?;
        let rows = sqlx::query(
            r#"
            SELECT concept_id, added_at, auto_suggested, accepted
            FROM project_concepts
            WHERE project_id = ?
            ORDER BY added_at DESC, concept_id ASC
            "#,
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ConceptError::QueryFailed(format!("Allowlist listing: {e}")))?;

        rows.iter()
            .map(|row| {
                Ok(AllowlistEntry {
                    concept_id: column(row, "concept_id")?,
                    added_at: parse_ts(&column::<String>(row, "added_at")?)?,
                    auto_suggested: column(row, "auto_suggested")?,
                    accepted: column(row, "accepted")?,
                })
            })
            .collect()
    }

    /// Ids on the project's allowlist that have been accepted.
    pub async fn accepted_ids(&self, project_id: &str) -> Result<BTreeSet<String>, ConceptError> {
        self.ensure_open()?;
        let rows = sqlx::query(
            "SELECT concept_id FROM project_concepts WHERE project_id = ? AND accepted = 1",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ConceptError::QueryFailed(format!("Allowlist lookup: {e}")))?;

        rows.iter().map(|row| column(row, "concept_id")).collect()
    }

    pub(crate) async fn insert_suggestions(
        &self,
        project_id: &str,
        ids: &[String],
    ) -> Result<Vec<String>, ConceptError> {
        let now = format_ts(&Utc::now());
        let mut suggested = Vec::new();
        for id in unique_ids(ids) {
            if !self.exists(&id).await? {
                continue;
            }
            let result = sqlx::query(
                r#"
                INSERT INTO project_concepts (project_id, concept_id, added_at, auto_suggested, accepted)
                VALUES (?, ?, ?, 1, 0)
                ON CONFLICT(project_id, concept_id) DO NOTHING
                "#,
            )
            .bind(project_id)
            .bind(&id)
            .bind(&now)
            .execute(&self.pool)
            .await
            .map_err(|e| ConceptError::Storage(format!("Suggestion insert: {e}")))?;
            if result.rows_affected() > 0 {
                suggested.push(id);
            }
        }
        if !suggested.is_empty() {
            debug!(project = %project_id, count = suggested.len(), "Concepts suggested");
        }
        Ok(suggested)
    }
}
