//! `ctxvault save|update|search|recent|get|forget|sweep`: project memory commands.

use super::{CliResult, print_json, require_project};
use clap::Args;
use ctxvault_context::Engine;
use ctxvault_core::memory::{
    MemoryPatch, MemoryStore, NewMemory, RecentRequest, SearchRequest,
};
use serde_json::json;

#[derive(Args)]
pub struct SaveArgs {
    /// One-line summary (the dedupe key together with the paths)
    pub summary: String,

    /// Full text
    pub text: String,

    /// Tag (repeatable)
    #[arg(short, long = "tag")]
    pub tags: Vec<String>,

    /// Path prefix or glob this memory applies to (repeatable)
    #[arg(long = "path")]
    pub paths: Vec<String>,

    /// 1–5
    #[arg(short, long)]
    pub importance: Option<u8>,

    /// Expire this many seconds after the last update
    #[arg(long)]
    pub ttl: Option<u64>,
}

#[derive(Args)]
pub struct UpdateArgs {
    pub id: String,

    #[arg(long)]
    pub summary: Option<String>,

    #[arg(long)]
    pub text: Option<String>,

    /// Replace the tags (repeatable)
    #[arg(short, long = "tag")]
    pub tags: Option<Vec<String>>,

    /// Replace the paths (repeatable)
    #[arg(long = "path")]
    pub paths: Option<Vec<String>>,

    #[arg(short, long)]
    pub importance: Option<u8>,

    #[arg(long, conflicts_with = "no_ttl")]
    pub ttl: Option<u64>,

    /// Remove the expiry
    #[arg(long)]
    pub no_ttl: bool,
}

#[derive(Args)]
pub struct SearchArgs {
    pub query: String,

    #[arg(short, long, default_value_t = ctxvault_core::memory::DEFAULT_LIMIT)]
    pub limit: usize,

    /// Only records sharing one of these tags (repeatable)
    #[arg(short, long = "tag")]
    pub tags: Vec<String>,

    /// Only records whose paths match path-like tokens of the query
    #[arg(long)]
    pub path_filter: bool,

    #[arg(long)]
    pub include_expired: bool,

    /// Report the cascade stages tried
    #[arg(long)]
    pub debug: bool,
}

#[derive(Args)]
pub struct RecentArgs {
    #[arg(short, long, default_value_t = ctxvault_core::memory::DEFAULT_LIMIT)]
    pub limit: usize,

    /// Only records with a stored path starting with this prefix
    #[arg(long)]
    pub path_prefix: Option<String>,

    #[arg(long)]
    pub include_expired: bool,
}

pub async fn save(engine: &Engine, project: Option<&str>, args: SaveArgs) -> CliResult {
    let store = engine.memory(require_project(project)?).await?;
    let memory = NewMemory {
        summary: args.summary,
        text: args.text,
        tags: args.tags,
        paths: args.paths,
        importance: args.importance,
        ttl_secs: args.ttl,
    };
    print_json(&store.save(memory).await?)
}

pub async fn update(engine: &Engine, project: Option<&str>, args: UpdateArgs) -> CliResult {
    let store = engine.memory(require_project(project)?).await?;
    let ttl_secs = if args.no_ttl {
        Some(None)
    } else {
        args.ttl.map(Some)
    };
    let patch = MemoryPatch {
        summary: args.summary,
        text: args.text,
        tags: args.tags,
        paths: args.paths,
        importance: args.importance,
        ttl_secs,
    };
    match store.update(&args.id, patch).await? {
        Some(record) => print_json(&record),
        None => print_json(&json!({ "ok": false, "message": format!("Memory {} not found", args.id) })),
    }
}

pub async fn search(engine: &Engine, project: Option<&str>, args: SearchArgs) -> CliResult {
    let store = engine.memory(require_project(project)?).await?;
    let request = SearchRequest {
        query: args.query,
        limit: args.limit,
        path_filter: args.path_filter,
        tags: args.tags,
        include_expired: args.include_expired,
    };
    if args.debug {
        print_json(&store.search_with_debug(request).await?)
    } else {
        print_json(&store.search(request).await?)
    }
}

pub async fn recent(engine: &Engine, project: Option<&str>, args: RecentArgs) -> CliResult {
    let store = engine.memory(require_project(project)?).await?;
    let request = RecentRequest {
        limit: args.limit,
        path_prefix: args.path_prefix,
        include_expired: args.include_expired,
    };
    print_json(&store.get_recent(request).await?)
}

pub async fn get(engine: &Engine, project: Option<&str>, ids: Vec<String>) -> CliResult {
    let store = engine.memory(require_project(project)?).await?;
    if let [id] = ids.as_slice() {
        return print_json(&store.get(id).await?);
    }
    print_json(&store.get_multiple(&ids).await?)
}

pub async fn forget(engine: &Engine, project: Option<&str>, id: &str) -> CliResult {
    let store = engine.memory(require_project(project)?).await?;
    print_json(&store.forget(id).await?)
}

pub async fn sweep(engine: &Engine, project: Option<&str>) -> CliResult {
    let project = require_project(project)?;
    let store = engine.memory(project).await?;
    let purged = store.purge_expired().await?;
    print_json(&json!({ "project_id": project, "purged": purged }))
}
