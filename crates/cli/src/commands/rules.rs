//! `ctxvault rules`: show or adjust ranking rules.
//!
//! Rules live in memory only; changes made here apply to nothing but
//! this invocation. Persistent defaults belong in the `[rules]` section
//! of the config file.

use super::{CliResult, print_json};
use clap::Args;
use ctxvault_config::RulesPatch;
use ctxvault_context::Engine;

#[derive(Args)]
pub struct RulesArgs {
    #[arg(long, conflicts_with = "no_max_age")]
    pub max_age_days: Option<u32>,

    /// Remove the age limit
    #[arg(long)]
    pub no_max_age: bool,

    #[arg(long)]
    pub min_importance: Option<u8>,

    #[arg(long)]
    pub path_boost: Option<f64>,

    #[arg(long)]
    pub concept_importance_threshold: Option<u8>,

    #[arg(long)]
    pub dedupe_threshold: Option<f64>,
}

impl RulesArgs {
    fn patch(&self) -> Option<RulesPatch> {
        let max_age_days = if self.no_max_age {
            Some(None)
        } else {
            self.max_age_days.map(Some)
        };
        let patch = RulesPatch {
            max_age_days,
            min_importance: self.min_importance,
            path_boost: self.path_boost,
            concept_importance_threshold: self.concept_importance_threshold,
            dedupe_threshold: self.dedupe_threshold,
        };
        let empty = patch.max_age_days.is_none()
            && patch.min_importance.is_none()
            && patch.path_boost.is_none()
            && patch.concept_importance_threshold.is_none()
            && patch.dedupe_threshold.is_none();
        (!empty).then_some(patch)
    }
}

pub fn run(engine: &Engine, args: RulesArgs) -> CliResult {
    let rules = match args.patch() {
        Some(patch) => engine.set_rules(&patch)?,
        None => engine.get_rules(),
    };
    print_json(&rules)
}
