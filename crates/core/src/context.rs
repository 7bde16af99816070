//! Retrieval modes for context assembly.

use serde::{Deserialize, Serialize};

/// How much global knowledge a preview may pull in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextMode {
    /// Project memories only
    Hard,
    /// Project memories plus concepts on the project's allowlist
    #[default]
    Smart,
    /// Project memories plus any concept above the relevance threshold
    Soft,
}

impl ContextMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hard => "hard",
            Self::Smart => "smart",
            Self::Soft => "soft",
        }
    }
}

impl std::str::FromStr for ContextMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hard" => Ok(Self::Hard),
            "smart" => Ok(Self::Smart),
            "soft" => Ok(Self::Soft),
            other => Err(format!("unknown context mode '{other}' (expected hard, smart, soft)")),
        }
    }
}

impl std::fmt::Display for ContextMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
