//! End-to-end retrieval scenarios.
//!
//! Each test opens a full `Engine` on a temporary data directory and
//! drives it through the same operations the CLI exposes.

use std::time::Duration;

use ctxvault_config::AppConfig;
use ctxvault_context::{Engine, InjectionKind, PreviewRequest};
use ctxvault_core::concept::{AllowlistUpdate, ConceptQuery, ConceptStore, NewConcept};
use ctxvault_core::memory::{
    CascadeStage, MemoryStore, NewMemory, RecentRequest, SearchRequest,
};
use ctxvault_core::text::normalize_summary;
use ctxvault_core::{ContextMode, Error, MemoryError};
use tempfile::TempDir;

// ── Helpers ──────────────────────────────────────────────────────────────

async fn engine() -> (Engine, TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = AppConfig {
        data_dir: Some(dir.path().to_path_buf()),
        ..AppConfig::default()
    };
    config.memory.sweep_interval_secs = 0;
    let engine = Engine::open(config).await.expect("engine");
    (engine, dir)
}

fn jwt_memory() -> NewMemory {
    NewMemory::new("JWT auth flow", "See the auth module for token checks.")
        .with_tags(["auth", "security"])
        .with_paths(["src/middleware/auth.ts"])
        .with_importance(5)
}

// ── Storage engine ───────────────────────────────────────────────────────

#[tokio::test]
async fn identical_saves_leave_one_record() {
    let (engine, _dir) = engine().await;
    let store = engine.memory("web").await.unwrap();

    let first = store.save(jwt_memory()).await.unwrap();
    let second = store.save(jwt_memory()).await.unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(first.created_at, second.created_at);
    assert_eq!(store.count().await.unwrap(), 1);

    // punctuation and case do not change the fingerprint
    let third = store
        .save(
            NewMemory::new("jwt, AUTH flow!", "rewritten text")
                .with_paths(["src/middleware/auth.ts"]),
        )
        .await
        .unwrap();
    assert_eq!(third.id, first.id);
    assert_eq!(third.text, "rewritten text");
    assert_eq!(store.count().await.unwrap(), 1);
    engine.shutdown().await;
}

#[tokio::test]
async fn cascade_reports_sanitized_stage() {
    let (engine, _dir) = engine().await;
    let store = engine.memory("web").await.unwrap();
    store
        .save(NewMemory::new("Foo bar handling", "foo bar is parsed here"))
        .await
        .unwrap();

    let debug = store
        .search_with_debug(SearchRequest::new("foo-bar!"))
        .await
        .unwrap();

    assert_eq!(debug.stage_used, Some(CascadeStage::Sanitized));
    assert_eq!(debug.queries_tried, vec!["foo-bar!", "foo bar"]);
    assert_eq!(debug.results.len(), 1);
    engine.shutdown().await;
}

#[tokio::test]
async fn exhausted_cascade_is_empty_not_error() {
    let (engine, _dir) = engine().await;
    let store = engine.memory("web").await.unwrap();
    store.save(jwt_memory()).await.unwrap();

    let debug = store
        .search_with_debug(SearchRequest::new("\"((( zz qq"))
        .await
        .unwrap();
    assert!(debug.results.is_empty());
    assert_eq!(debug.stage_used, None);
    engine.shutdown().await;
}

#[tokio::test]
async fn importance_breaks_ties_for_equally_tagged_records() {
    let (engine, _dir) = engine().await;
    let store = engine.memory("web").await.unwrap();
    for summary in ["Auth cookie flags", "Auth error codes"] {
        store
            .save(
                NewMemory::new(summary, "See the auth module for token checks.")
                    .with_tags(["auth", "security"])
                    .with_importance(2),
            )
            .await
            .unwrap();
    }
    store.save(jwt_memory()).await.unwrap();

    let hits = store.search(SearchRequest::new("auth")).await.unwrap();
    assert_eq!(hits.len(), 3);
    assert_eq!(hits[0].record.summary, "JWT auth flow");
    assert!(hits.iter().all(|h| h.relevance > 0.0 && h.relevance <= 1.0));
    engine.shutdown().await;
}

#[tokio::test]
async fn ttl_expiry_hides_records_by_default() {
    let (engine, _dir) = engine().await;
    let store = engine.memory("web").await.unwrap();
    store
        .save(NewMemory::new("Temporary flag", "feature flag rollout notes").with_ttl_secs(1))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(1200)).await;

    assert!(store.search(SearchRequest::new("rollout")).await.unwrap().is_empty());
    let mut request = SearchRequest::new("rollout");
    request.include_expired = true;
    assert_eq!(store.search(request).await.unwrap().len(), 1);

    assert!(store.get_recent(RecentRequest::default()).await.unwrap().is_empty());
    let recent = store
        .get_recent(RecentRequest {
            include_expired: true,
            ..RecentRequest::default()
        })
        .await
        .unwrap();
    assert_eq!(recent.len(), 1);

    assert_eq!(store.purge_expired().await.unwrap(), 1);
    assert_eq!(store.count().await.unwrap(), 0);
    engine.shutdown().await;
}

#[tokio::test]
async fn forget_is_idempotent() {
    let (engine, _dir) = engine().await;
    let store = engine.memory("web").await.unwrap();
    let record = store.save(jwt_memory()).await.unwrap();

    let first = store.forget(&record.id).await.unwrap();
    let second = store.forget(&record.id).await.unwrap();
    assert!(first.ok);
    assert!(!second.ok);
    assert!(second.message.contains("not found"));
    engine.shutdown().await;
}

#[tokio::test]
async fn shutdown_makes_registry_unavailable() {
    let (engine, _dir) = engine().await;
    engine.memory("web").await.unwrap();
    engine.shutdown().await;

    assert!(engine.registry().is_shut_down());
    assert!(matches!(
        engine.memory("web").await,
        Err(Error::Memory(MemoryError::Unavailable(_)))
    ));
}

#[tokio::test]
async fn invalid_project_ids_are_rejected() {
    let (engine, _dir) = engine().await;
    for bad in ["", "../escape", "a/b", ".hidden"] {
        assert!(
            matches!(
                engine.memory(bad).await,
                Err(Error::Memory(MemoryError::InvalidProject(_)))
            ),
            "{bad:?} should be rejected"
        );
    }
    engine.shutdown().await;
}

// ── Context assembly ─────────────────────────────────────────────────────

#[tokio::test]
async fn preview_fits_a_small_budget() {
    let (engine, _dir) = engine().await;
    let store = engine.memory("web").await.unwrap();
    store.save(jwt_memory()).await.unwrap();
    store
        .save(NewMemory::new("CSS conventions", "Use BEM naming for all components.").with_tags(["css"]))
        .await
        .unwrap();

    let request = PreviewRequest::new("fix auth bug")
        .with_open_files(["src/middleware/auth.ts"])
        .with_budget(200);
    let response = engine.preview("web", &request).await.unwrap();

    assert!(!response.injections.is_empty());
    assert_eq!(response.injections[0].title, "JWT auth flow");
    assert!(response.injections.iter().all(|i| i.byte_size <= 200));
    let total: usize = response.injections.iter().map(|i| i.byte_size).sum();
    assert!(total <= 200);
    assert!(response.injections.len() <= response.top_k);
    engine.shutdown().await;
}

#[tokio::test]
async fn preview_respects_budget_and_top_k_under_pressure() {
    let (engine, _dir) = engine().await;
    let store = engine.memory("web").await.unwrap();
    for i in 0..30 {
        store
            .save(
                NewMemory::new(format!("Migration step {i}"), "migration ".repeat(i + 1))
                    .with_tags(["migration"]),
            )
            .await
            .unwrap();
    }

    for (budget, top_k) in [(100, 10), (500, 3), (2048, 10), (50_000, 25)] {
        let request = PreviewRequest::new("migration")
            .with_budget(budget)
            .with_top_k(top_k);
        let response = engine.preview("web", &request).await.unwrap();
        let total: usize = response.injections.iter().map(|i| i.byte_size).sum();
        assert!(total <= budget, "budget {budget}: used {total}");
        assert!(response.injections.len() <= top_k);
        assert_eq!(response.budget_used, total);
    }
    engine.shutdown().await;
}

#[tokio::test]
async fn preview_never_repeats_a_normalized_summary() {
    let (engine, _dir) = engine().await;
    let store = engine.memory("web").await.unwrap();
    // different paths, so different fingerprints
    store
        .save(NewMemory::new("Retry policy", "retry three times").with_paths(["src/http"]))
        .await
        .unwrap();
    store
        .save(NewMemory::new("retry policy!", "retry with backoff").with_paths(["src/jobs"]))
        .await
        .unwrap();
    assert_eq!(store.count().await.unwrap(), 2);

    let response = engine
        .preview("web", &PreviewRequest::new("retry").with_budget(10_000))
        .await
        .unwrap();
    let mut seen = std::collections::HashSet::new();
    for injection in &response.injections {
        assert!(seen.insert(normalize_summary(&injection.title)));
    }
    assert_eq!(response.injections.len(), 1);
    assert_eq!(response.stats.skipped_duplicate, 1);
    engine.shutdown().await;
}

#[tokio::test]
async fn path_match_dominates_single_term_task() {
    let (engine, _dir) = engine().await;
    let store = engine.memory("web").await.unwrap();
    store
        .save(
            NewMemory::new("Session store", "auth sessions are kept in redis")
                .with_tags(["auth"])
                .with_paths(["src/session/**"]),
        )
        .await
        .unwrap();
    store
        .save(NewMemory::new("Auth overview", "auth auth auth, the whole auth story").with_tags(["auth"]))
        .await
        .unwrap();

    let request = PreviewRequest::new("auth").with_open_files(["src/session/redis.rs"]);
    let response = engine.preview("web", &request).await.unwrap();
    assert_eq!(response.injections[0].title, "Session store");
    assert_eq!(response.stats.path_matches, 1);
    engine.shutdown().await;
}

// ── Concepts ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn empty_concept_query_ranks_everything() {
    let (engine, _dir) = engine().await;
    let graph = engine.concepts().unwrap();
    for (title, importance) in [("Logging", 2), ("Error handling", 5), ("Testing", 3)] {
        graph
            .save(
                NewConcept::new(title, format!("{title}: conventions that apply to every crate."))
                    .with_importance(importance),
            )
            .await
            .unwrap();
    }

    let result = graph.search(ConceptQuery::new("")).await.unwrap();
    let titles: Vec<_> = result.hits.iter().map(|h| h.concept.title.as_str()).collect();
    assert_eq!(titles, vec!["Error handling", "Testing", "Logging"]);

    // the top hit was used, so a second wildcard search still leads with it
    let again = graph.search(ConceptQuery::new("*")).await.unwrap();
    assert_eq!(again.hits[0].concept.title, "Error handling");
    assert_eq!(again.hits[0].concept.usage_count, 2);
    engine.shutdown().await;
}

#[tokio::test]
async fn discovered_concepts_need_acceptance_for_smart_previews() {
    let (engine, _dir) = engine().await;
    engine.memory("web").await.unwrap();
    let graph = engine.concepts().unwrap();

    let notes = "\
# Token rotation
Rotate refresh tokens on every use so a stolen token is short lived.

# Cookie flags
Session cookies are HttpOnly, Secure and SameSite strict.
";
    let discovered = graph.discover(notes, Some("web")).await.unwrap();
    assert_eq!(discovered.len(), 2);
    let rotation = discovered
        .iter()
        .find(|c| c.title == "Token rotation")
        .unwrap()
        .id
        .clone();

    let request = PreviewRequest::new("token rotation")
        .with_mode(ContextMode::Smart)
        .with_budget(10_000);
    let before = engine.preview("web", &request).await.unwrap();
    assert!(before.injections.iter().all(|i| i.kind != InjectionKind::Concept));

    graph
        .update_allowlist(
            "web",
            AllowlistUpdate {
                add: vec![rotation.clone()],
                ..AllowlistUpdate::default()
            },
        )
        .await
        .unwrap();

    let after = engine.preview("web", &request).await.unwrap();
    let concepts: Vec<_> = after
        .injections
        .iter()
        .filter(|i| i.kind == InjectionKind::Concept)
        .map(|i| i.id.as_str())
        .collect();
    assert_eq!(concepts, vec![rotation.as_str()]);

    // rediscovering the same notes creates nothing new
    assert!(graph.discover(notes, Some("web")).await.unwrap().is_empty());
    engine.shutdown().await;
}

#[tokio::test]
async fn concepts_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let config = AppConfig {
        data_dir: Some(dir.path().to_path_buf()),
        ..AppConfig::default()
    };

    let engine = Engine::open(config.clone()).await.unwrap();
    let saved = engine
        .concepts()
        .unwrap()
        .save(NewConcept::new("Feature flags", "Flags are removed within two releases of launch."))
        .await
        .unwrap();
    engine.shutdown().await;

    let reopened = Engine::open(config).await.unwrap();
    let graph = reopened.concepts().unwrap();
    assert_eq!(graph.count().await.unwrap(), 1);
    assert_eq!(graph.get(&saved.id).await.unwrap().unwrap().title, "Feature flags");
    reopened.shutdown().await;
}
