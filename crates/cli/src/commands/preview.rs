//! `ctxvault preview`: assemble context for a task.

use super::{CliResult, print_json, require_project};
use clap::Args;
use ctxvault_context::{Engine, PreviewRequest};
use ctxvault_core::ContextMode;

#[derive(Args)]
pub struct PreviewArgs {
    /// What you are about to work on
    pub task: String,

    /// An open file (repeatable)
    #[arg(short, long = "file")]
    pub files: Vec<String>,

    /// Byte budget for all injections together
    #[arg(short, long)]
    pub budget: Option<usize>,

    #[arg(short = 'k', long)]
    pub top_k: Option<usize>,

    /// hard, smart or soft
    #[arg(short, long)]
    pub mode: Option<ContextMode>,
}

pub async fn run(engine: &Engine, project: Option<&str>, args: PreviewArgs) -> CliResult {
    let project = require_project(project)?;
    let request = PreviewRequest {
        task: args.task,
        open_files: args.files,
        budget_bytes: args.budget,
        top_k: args.top_k,
        mode: args.mode,
    };
    print_json(&engine.preview(project, &request).await?)
}
