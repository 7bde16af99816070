//! Configuration loading, validation, and management for ctxvault.
//!
//! Loads configuration from `~/.ctxvault/config.toml` with environment
//! variable overrides. Validates all settings at startup.

pub mod ranking;

pub use ranking::{RankingRules, RulesPatch, ScoreWeights};

use ctxvault_core::ContextMode;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.ctxvault/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Where project stores and the concept graph live.
    /// Defaults to `~/.ctxvault/data`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,

    /// Storage engine configuration
    #[serde(default)]
    pub memory: MemoryConfig,

    /// Concept graph configuration
    #[serde(default)]
    pub concepts: ConceptConfig,

    /// Context assembly defaults
    #[serde(default)]
    pub context: ContextConfig,

    /// Initial ranking rules (mutable at runtime, never written back)
    #[serde(default)]
    pub rules: RankingRules,

    /// Scoring weights
    #[serde(default)]
    pub weights: ScoreWeights,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Seconds between expiry sweeps. 0 disables the sweeper.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Connections per project pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_sweep_interval_secs() -> u64 {
    300
}
fn default_max_connections() -> u32 {
    4
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval_secs(),
            max_connections: default_max_connections(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConceptConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Tag overlap ratio above which a `related` edge is inferred
    #[serde(default = "default_relation_threshold")]
    pub relation_threshold: f64,

    /// Recommended body length window (characters); outside it only warns
    #[serde(default = "default_body_min_chars")]
    pub body_min_chars: usize,

    #[serde(default = "default_body_max_chars")]
    pub body_max_chars: usize,

    /// A concept used within this many days gets the recency bonus
    #[serde(default = "default_recent_use_days")]
    pub recent_use_days: i64,

    /// How many top hits are expanded through their edges
    #[serde(default = "default_related_sources")]
    pub related_sources: usize,

    /// Related concepts appended per expanded hit
    #[serde(default = "default_related_per_source")]
    pub related_per_source: usize,

    /// Score discount applied to related concepts
    #[serde(default = "default_related_discount")]
    pub related_discount: f64,
}

fn default_relation_threshold() -> f64 {
    0.3
}
fn default_body_min_chars() -> usize {
    40
}
fn default_body_max_chars() -> usize {
    2000
}
fn default_recent_use_days() -> i64 {
    7
}
fn default_related_sources() -> usize {
    3
}
fn default_related_per_source() -> usize {
    2
}
fn default_related_discount() -> f64 {
    0.5
}
fn default_true() -> bool {
    true
}

impl Default for ConceptConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            relation_threshold: default_relation_threshold(),
            body_min_chars: default_body_min_chars(),
            body_max_chars: default_body_max_chars(),
            recent_use_days: default_recent_use_days(),
            related_sources: default_related_sources(),
            related_per_source: default_related_per_source(),
            related_discount: default_related_discount(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    #[serde(default = "default_top_k")]
    pub default_top_k: usize,

    #[serde(default = "default_budget_bytes")]
    pub default_budget_bytes: usize,

    #[serde(default)]
    pub default_mode: ContextMode,

    /// Search terms kept from a task description
    #[serde(default = "default_max_terms")]
    pub max_terms: usize,

    /// Candidate pool = max(top_k * factor, pool_min), capped at pool_max
    #[serde(default = "default_pool_factor")]
    pub pool_factor: usize,

    #[serde(default = "default_pool_min")]
    pub pool_min: usize,

    #[serde(default = "default_pool_max")]
    pub pool_max: usize,

    /// `soft` mode keeps concepts whose relevance is strictly above this
    #[serde(default)]
    pub soft_min_relevance: f64,
}

fn default_top_k() -> usize {
    10
}
fn default_budget_bytes() -> usize {
    2048
}
fn default_max_terms() -> usize {
    5
}
fn default_pool_factor() -> usize {
    4
}
fn default_pool_min() -> usize {
    20
}
fn default_pool_max() -> usize {
    100
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            default_top_k: default_top_k(),
            default_budget_bytes: default_budget_bytes(),
            default_mode: ContextMode::default(),
            max_terms: default_max_terms(),
            pool_factor: default_pool_factor(),
            pool_min: default_pool_min(),
            pool_max: default_pool_max(),
            soft_min_relevance: 0.0,
        }
    }
}

impl ContextConfig {
    /// Candidate pool size for a requested `top_k`.
    pub fn pool_size(&self, top_k: usize) -> usize {
        top_k
            .saturating_mul(self.pool_factor)
            .max(self.pool_min)
            .min(self.pool_max)
            .max(top_k)
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.ctxvault/config.toml).
    ///
    /// Environment overrides:
    /// - `CTXVAULT_DATA_DIR`: storage root
    /// - `CTXVAULT_MODE`: default context mode
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(dir) = std::env::var("CTXVAULT_DATA_DIR") {
            if !dir.trim().is_empty() {
                self.data_dir = Some(PathBuf::from(dir));
            }
        }

        if let Ok(mode) = std::env::var("CTXVAULT_MODE") {
            self.context.default_mode = mode
                .parse()
                .map_err(|e: String| ConfigError::ValidationError(format!("CTXVAULT_MODE: {e}")))?;
        }

        Ok(())
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".ctxvault")
    }

    /// The effective storage root.
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| Self::config_dir().join("data"))
    }

    /// Directory holding one sub-directory per project store.
    pub fn projects_dir(&self) -> PathBuf {
        self.data_dir().join("projects")
    }

    /// Path of the global concept graph database.
    pub fn concepts_db_path(&self) -> PathBuf {
        self.data_dir().join("concepts.sqlite")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.concepts;
        if !(0.0..1.0).contains(&c.relation_threshold) {
            return Err(ConfigError::ValidationError(
                "concepts.relation_threshold must be in [0.0, 1.0)".into(),
            ));
        }
        if c.body_min_chars > c.body_max_chars {
            return Err(ConfigError::ValidationError(
                "concepts.body_min_chars must not exceed body_max_chars".into(),
            ));
        }
        if !(0.0..=1.0).contains(&c.related_discount) {
            return Err(ConfigError::ValidationError(
                "concepts.related_discount must be in [0.0, 1.0]".into(),
            ));
        }

        let ctx = &self.context;
        if ctx.default_top_k == 0 || ctx.default_budget_bytes == 0 {
            return Err(ConfigError::ValidationError(
                "context.default_top_k and context.default_budget_bytes must be > 0".into(),
            ));
        }
        if ctx.max_terms == 0 {
            return Err(ConfigError::ValidationError(
                "context.max_terms must be > 0".into(),
            ));
        }
        if ctx.pool_min > ctx.pool_max {
            return Err(ConfigError::ValidationError(
                "context.pool_min must not exceed context.pool_max".into(),
            ));
        }

        if self.memory.max_connections == 0 {
            return Err(ConfigError::ValidationError(
                "memory.max_connections must be > 0".into(),
            ));
        }

        self.rules.validate().map_err(ConfigError::ValidationError)?;
        self.weights.validate().map_err(ConfigError::ValidationError)?;
        Ok(())
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            memory: MemoryConfig::default(),
            concepts: ConceptConfig::default(),
            context: ContextConfig::default(),
            rules: RankingRules::default(),
            weights: ScoreWeights::default(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

impl From<ConfigError> for ctxvault_core::Error {
    fn from(err: ConfigError) -> Self {
        ctxvault_core::Error::Config {
            message: err.to_string(),
        }
    }
}
