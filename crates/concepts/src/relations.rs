//! Relationship inference and related-concept enrichment.
//!
//! `related` edges are derived from tag overlap whenever a concept is
//! saved. Edges are stored in both directions, so a later save of either
//! end can drop them when the overlap falls to or below the threshold.
//! Saving compares against every stored concept.

use crate::ranking::{EXCERPT_CHARS, by_score_then_id, excerpt};
use crate::sqlite::{SqliteConceptGraph, column};
use ctxvault_core::concept::{ConceptHit, RelationKind};
use ctxvault_core::error::ConceptError;
use ctxvault_core::text::jaccard;
use sqlx::SqliteConnection;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::debug;

/// Concepts whose tag overlap with `tags` is strictly above `threshold`,
/// paired with the overlap ratio.
pub fn infer_related(
    tags: &BTreeSet<String>,
    others: &BTreeMap<String, BTreeSet<String>>,
    threshold: f64,
) -> Vec<(String, f64)> {
    others
        .iter()
        .filter_map(|(id, other_tags)| {
            let ratio = jaccard(tags, other_tags);
            (ratio > threshold).then(|| (id.clone(), ratio))
        })
        .collect()
}

impl SqliteConceptGraph {
    /// Recompute the inferred `related` edges of one concept, both directions.
    pub(crate) async fn refresh_inferred_edges(
        &self,
        conn: &mut SqliteConnection,
        concept_id: &str,
        tags: &BTreeSet<String>,
    ) -> Result<usize, ConceptError> {
        let rows = sqlx::query("SELECT concept_id, tag FROM concept_tags WHERE concept_id != ?")
            .bind(concept_id)
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| ConceptError::QueryFailed(format!("Tag scan: {e}")))?;

        let mut others: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for row in &rows {
            let id: String = column(row, "concept_id")?;
            let tag: String = column(row, "tag")?;
            others.entry(id).or_default().insert(tag);
        }

        sqlx::query(
            "DELETE FROM concept_edges \
             WHERE kind = 'related' AND inferred = 1 AND (source_id = ? OR target_id = ?)",
        )
        .bind(concept_id)
        .bind(concept_id)
        .execute(&mut *conn)
        .await
        .map_err(|e| ConceptError::Storage(format!("Edge cleanup: {e}")))?;

        let related = infer_related(tags, &others, self.config.relation_threshold);
        for (other_id, ratio) in &related {
            for (source, target) in [(concept_id, other_id.as_str()), (other_id.as_str(), concept_id)] {
                // An explicit edge of the same kind wins over an inferred one.
                sqlx::query(
                    r#"
                    INSERT INTO concept_edges (source_id, target_id, kind, strength, inferred)
                    VALUES (?, ?, 'related', ?, 1)
                    ON CONFLICT(source_id, target_id, kind) DO NOTHING
                    "#,
                )
                .bind(source)
                .bind(target)
                .bind(*ratio)
                .execute(&mut *conn)
                .await
                .map_err(|e| ConceptError::Storage(format!("Edge insert: {e}")))?;
            }
        }

        debug!(concept = %concept_id, related = related.len(), "Inferred edges refreshed");
        Ok(related.len())
    }

    /// Append concepts reachable from the top hits, discounted by edge strength.
    pub(crate) async fn enrich(
        &self,
        mut hits: Vec<ConceptHit>,
    ) -> Result<Vec<ConceptHit>, ConceptError> {
        if hits.is_empty() {
            return Ok(hits);
        }

        let discount = self.config.related_discount;
        let mut present: HashSet<String> = hits.iter().map(|h| h.concept.id.clone()).collect();
        let mut extra: Vec<ConceptHit> = Vec::new();

        for source in hits.iter().take(self.config.related_sources) {
            let rows = sqlx::query(
                r#"
                SELECT target_id, kind, strength FROM concept_edges
                WHERE source_id = ? AND kind != ?
                ORDER BY strength DESC, target_id ASC
                "#,
            )
            .bind(&source.concept.id)
            .bind(RelationKind::Conflicts.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| ConceptError::QueryFailed(format!("Edge lookup: {e}")))?;

            let mut added = 0;
            for row in &rows {
                if added >= self.config.related_per_source {
                    break;
                }
                let target: String = column(row, "target_id")?;
                if present.contains(&target) {
                    continue;
                }
                let strength: f64 = column(row, "strength")?;
                let Some(concept) = self.fetch(&target).await? else {
                    continue;
                };

                present.insert(target);
                extra.push(ConceptHit {
                    score: source.score * strength * discount,
                    relevance: source.relevance * strength * discount,
                    snippet: excerpt(&concept.body, EXCERPT_CHARS),
                    via: Some(source.concept.id.clone()),
                    concept,
                });
                added += 1;
            }
        }

        if !extra.is_empty() {
            debug!(added = extra.len(), "Related concepts appended");
            hits.extend(extra);
            hits.sort_by(|a, b| {
                by_score_then_id((a.score, &a.concept.id), (b.score, &b.concept.id))
            });
        }
        Ok(hits)
    }
}
