//! The top-level context object.
//!
//! `Engine` owns every long-lived resource: the configuration, the project
//! registry (one store and sweeper per open project), the shared concept
//! graph and the assembler with its runtime-mutable rules.

use crate::assembler::{ContextAssembler, PreviewRequest, PreviewResponse, Scope};
use ctxvault_concepts::SqliteConceptGraph;
use ctxvault_config::{AppConfig, RankingRules, RulesPatch};
use ctxvault_core::concept::ConceptStore;
use ctxvault_core::error::{ConceptError, MemoryError};
use ctxvault_core::{Error, Result};
use ctxvault_memory::{ProjectRegistry, SqliteMemoryStore};
use std::sync::Arc;
use tracing::info;

pub struct Engine {
    config: AppConfig,
    registry: ProjectRegistry,
    concepts: Option<Arc<SqliteConceptGraph>>,
    assembler: ContextAssembler,
}

impl Engine {
    /// Open the engine rooted at the configured data directory.
    pub async fn open(config: AppConfig) -> Result<Self> {
        config.validate()?;
        let data_dir = config.data_dir();
        std::fs::create_dir_all(&data_dir).map_err(|e| {
            Error::from(MemoryError::Storage(format!(
                "Failed to create {}: {e}",
                data_dir.display()
            )))
        })?;

        let registry = ProjectRegistry::new(config.projects_dir(), config.memory.clone());
        let concepts = if config.concepts.enabled {
            let graph =
                SqliteConceptGraph::open(&config.concepts_db_path(), config.concepts.clone())
                    .await?;
            Some(Arc::new(graph))
        } else {
            info!("Concept graph disabled");
            None
        };
        let assembler = ContextAssembler::new(
            config.context.clone(),
            config.weights.clone(),
            config.rules.clone(),
        );

        info!(data_dir = %data_dir.display(), concepts = concepts.is_some(), "Engine opened");
        Ok(Self {
            config,
            registry,
            concepts,
            assembler,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn registry(&self) -> &ProjectRegistry {
        &self.registry
    }

    /// The project's store, opened on first use.
    pub async fn memory(&self, project_id: &str) -> Result<Arc<SqliteMemoryStore>> {
        Ok(self.registry.open(project_id).await?)
    }

    /// The shared concept graph. `Unavailable` when disabled.
    pub fn concepts(&self) -> Result<Arc<SqliteConceptGraph>> {
        self.concepts.clone().ok_or_else(|| {
            Error::from(ConceptError::Unavailable(
                "concept graph is disabled in configuration".into(),
            ))
        })
    }

    pub async fn preview(
        &self,
        project_id: &str,
        request: &PreviewRequest,
    ) -> Result<PreviewResponse> {
        let store = self.memory(project_id).await?;
        let scope = Scope {
            project_id,
            memory: store.as_ref(),
            concepts: self.concepts.as_deref().map(|c| c as &dyn ConceptStore),
        };
        self.assembler.preview(scope, request).await
    }

    pub fn get_rules(&self) -> RankingRules {
        self.assembler.get_rules()
    }

    pub fn set_rules(&self, patch: &RulesPatch) -> Result<RankingRules> {
        self.assembler.set_rules(patch)
    }

    /// Cancel sweepers and close every pool. Later store access is `Unavailable`.
    pub async fn shutdown(&self) {
        self.registry.shutdown().await;
        if let Some(graph) = &self.concepts {
            graph.close().await;
        }
        info!("Engine shut down");
    }
}
