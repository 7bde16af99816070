//! `ctxvault concept …`: global concept graph commands.

use super::{CliResult, print_json};
use clap::{Args, Subcommand};
use ctxvault_context::Engine;
use ctxvault_core::concept::{
    AllowlistUpdate, ConceptQuery, ConceptStore, NewConcept, Relation, RelationKind,
};
use std::io::Read;
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum ConceptCommand {
    /// Save a concept (replaces the concept with the same --id)
    Save(SaveArgs),

    /// Ranked concept search; an empty query or `*` ranks everything
    Search {
        #[arg(default_value = "")]
        query: String,

        #[arg(short, long)]
        limit: Option<usize>,

        /// Restrict to these ids (repeatable)
        #[arg(long = "only")]
        allowlist: Vec<String>,

        /// Restrict to the --project allowlist
        #[arg(long)]
        allowlisted: bool,

        /// Append related concepts reached through edges
        #[arg(long)]
        related: bool,
    },

    /// Fetch a concept with its relations
    Get { id: String },

    /// Edit or list the --project allowlist
    Allow {
        #[arg(long)]
        add: Vec<String>,

        #[arg(long)]
        remove: Vec<String>,

        #[arg(long)]
        list: bool,
    },

    /// Create concepts from the headings of a markdown file (`-` for stdin)
    Discover {
        file: PathBuf,

        /// Suggest the new concepts to the --project allowlist
        #[arg(long)]
        suggest: bool,
    },
}

#[derive(Args)]
pub struct SaveArgs {
    pub title: String,

    pub body: String,

    /// Replace this concept instead of creating a new one
    #[arg(long)]
    pub id: Option<String>,

    #[arg(short, long = "tag")]
    pub tags: Vec<String>,

    #[arg(short, long)]
    pub importance: Option<u8>,

    /// Explicit edge `kind:target[:strength]` (repeatable)
    #[arg(long = "relation", value_parser = parse_relation)]
    pub relations: Vec<Relation>,
}

/// Parse `kind:target[:strength]`. Strength defaults to 1.0.
fn parse_relation(raw: &str) -> Result<Relation, String> {
    let mut parts = raw.splitn(3, ':');
    let kind = parts.next().unwrap_or_default();
    let kind = RelationKind::parse(kind).ok_or_else(|| {
        format!("unknown relation kind '{kind}' (related, prerequisite, extends, conflicts)")
    })?;
    let target_id = parts
        .next()
        .filter(|t| !t.is_empty())
        .ok_or_else(|| format!("relation '{raw}' is missing a target id"))?
        .to_string();
    let strength = match parts.next() {
        Some(s) => s
            .parse::<f64>()
            .map_err(|e| format!("bad strength in '{raw}': {e}"))?,
        None => 1.0,
    };
    Ok(Relation {
        target_id,
        kind,
        strength,
    })
}

pub async fn run(engine: &Engine, project: Option<&str>, command: ConceptCommand) -> CliResult {
    let graph = engine.concepts()?;

    match command {
        ConceptCommand::Save(args) => {
            let concept = graph
                .save(NewConcept {
                    id: args.id,
                    title: args.title,
                    body: args.body,
                    tags: args.tags,
                    importance: args.importance,
                    provenance: None,
                    relations: args.relations,
                })
                .await?;
            print_json(&concept)
        }
        ConceptCommand::Search {
            query,
            limit,
            allowlist,
            allowlisted,
            related,
        } => {
            let project_id = if allowlisted {
                Some(super::require_project(project)?.to_string())
            } else {
                None
            };
            let mut result = graph
                .search(ConceptQuery {
                    query,
                    limit,
                    allowlist: (!allowlist.is_empty()).then_some(allowlist),
                    project_id,
                    matches_only: false,
                })
                .await?;
            if related {
                result.hits = graph.enrich_with_related(result.hits).await?;
            }
            print_json(&result)
        }
        ConceptCommand::Get { id } => print_json(&graph.get(&id).await?),
        ConceptCommand::Allow { add, remove, list } => {
            let project = super::require_project(project)?;
            let outcome = graph
                .update_allowlist(project, AllowlistUpdate { add, remove, list })
                .await?;
            print_json(&outcome)
        }
        ConceptCommand::Discover { file, suggest } => {
            let text = if file.as_os_str() == "-" {
                let mut buf = String::new();
                std::io::stdin().read_to_string(&mut buf)?;
                buf
            } else {
                std::fs::read_to_string(&file)
                    .map_err(|e| format!("Failed to read {}: {e}", file.display()))?
            };
            let project_id = if suggest {
                Some(super::require_project(project)?)
            } else {
                None
            };
            print_json(&graph.discover(&text, project_id).await?)
        }
    }
}
