//! Project registry.
//!
//! Maps project ids to their open stores. A store is opened (and its
//! database file created) on first use, and each open store gets its own
//! expiry sweeper. After `shutdown` every operation fails with
//! `MemoryError::Unavailable`.

use crate::sqlite::SqliteMemoryStore;
use crate::sweeper::ExpirySweeper;
use ctxvault_config::MemoryConfig;
use ctxvault_core::error::MemoryError;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// File name of a project's store inside its directory.
pub const STORE_FILE: &str = "memory.sqlite";

const MAX_PROJECT_ID_LEN: usize = 128;

struct OpenProject {
    store: Arc<SqliteMemoryStore>,
    sweeper: Option<ExpirySweeper>,
}

pub struct ProjectRegistry {
    root: PathBuf,
    config: MemoryConfig,
    projects: Mutex<HashMap<String, OpenProject>>,
    closed: AtomicBool,
}

impl ProjectRegistry {
    /// A registry storing projects under `root/<project_id>/memory.sqlite`.
    pub fn new(root: impl Into<PathBuf>, config: MemoryConfig) -> Self {
        Self {
            root: root.into(),
            config,
            projects: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Store file location for a project.
    pub fn store_path(&self, project_id: &str) -> PathBuf {
        self.root.join(project_id).join(STORE_FILE)
    }

    /// The project's store, opening it on first use.
    pub async fn open(&self, project_id: &str) -> Result<Arc<SqliteMemoryStore>, MemoryError> {
        validate_project_id(project_id)?;
        self.ensure_running()?;

        let mut projects = self.projects.lock().await;
        // shutdown may have drained the map while we waited for the lock
        self.ensure_running()?;
        if let Some(open) = projects.get(project_id) {
            return Ok(open.store.clone());
        }

        let dir = self.root.join(project_id);
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            MemoryError::Storage(format!("Failed to create {}: {e}", dir.display()))
        })?;

        let store = Arc::new(
            SqliteMemoryStore::open(
                project_id,
                &dir.join(STORE_FILE),
                self.config.max_connections,
            )
            .await?,
        );

        let sweeper = match self.config.sweep_interval_secs {
            0 => None,
            secs => Some(ExpirySweeper::start(
                store.clone(),
                Duration::from_secs(secs),
            )),
        };

        info!(project = %project_id, sweeper = sweeper.is_some(), "Project opened");
        projects.insert(
            project_id.to_string(),
            OpenProject {
                store: store.clone(),
                sweeper,
            },
        );
        Ok(store)
    }

    /// An already-open project's store.
    pub async fn get(&self, project_id: &str) -> Result<Arc<SqliteMemoryStore>, MemoryError> {
        self.ensure_running()?;
        self.projects
            .lock()
            .await
            .get(project_id)
            .map(|open| open.store.clone())
            .ok_or_else(|| MemoryError::Unavailable(format!("project '{project_id}' is not open")))
    }

    /// Ids of the open projects, sorted.
    pub async fn open_projects(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.projects.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Close one project. Returns false if it was not open.
    pub async fn close(&self, project_id: &str) -> bool {
        let removed = self.projects.lock().await.remove(project_id);
        match removed {
            Some(open) => {
                Self::close_project(project_id, open).await;
                true
            }
            None => false,
        }
    }

    /// Stop every sweeper and close every store.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let drained: Vec<(String, OpenProject)> =
            self.projects.lock().await.drain().collect();
        let count = drained.len();
        for (id, open) in drained {
            Self::close_project(&id, open).await;
        }
        info!(projects = count, "Project registry shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close_project(project_id: &str, open: OpenProject) {
        if let Some(sweeper) = open.sweeper {
            sweeper.cancel().await;
        }
        open.store.close().await;
        debug!(project = %project_id, "Project closed");
    }

    fn ensure_running(&self) -> Result<(), MemoryError> {
        if self.is_shut_down() {
            return Err(MemoryError::Unavailable("registry is shut down".into()));
        }
        Ok(())
    }
}

/// Project ids become directory names, so they must be a single safe
/// path component.
pub fn validate_project_id(project_id: &str) -> Result<(), MemoryError> {
    let invalid = |reason: &str| {
        Err(MemoryError::InvalidProject(format!(
            "'{project_id}': {reason}"
        )))
    };

    if project_id.is_empty() {
        return invalid("must not be empty");
    }
    if project_id.len() > MAX_PROJECT_ID_LEN {
        return invalid("too long");
    }
    if project_id.starts_with('.') {
        return invalid("must not start with '.'");
    }
    if !project_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return invalid("only ASCII letters, digits, '-', '_' and '.' are allowed");
    }
    Ok(())
}
