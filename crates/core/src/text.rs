//! Text and path helpers shared by the stores and the assembler.

use std::collections::BTreeSet;

/// Words dropped when reducing a task description to search terms.
pub const STOP_WORDS: &[&str] = &[
    "a", "about", "after", "all", "also", "an", "and", "any", "are", "as", "at", "be", "been",
    "but", "by", "can", "could", "do", "does", "for", "from", "get", "had", "has", "have", "how",
    "i", "if", "in", "into", "is", "it", "its", "just", "let", "make", "me", "my", "need", "no",
    "not", "of", "on", "or", "our", "please", "should", "so", "some", "that", "the", "their",
    "then", "there", "these", "this", "to", "up", "us", "use", "was", "we", "were", "what",
    "when", "where", "which", "who", "why", "will", "with", "would", "you", "your",
];

pub fn is_stop_word(word: &str) -> bool {
    STOP_WORDS.binary_search(&word).is_ok()
}

/// Lowercase, split on anything that is not alphanumeric or `_`.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Lowercase, punctuation stripped, whitespace collapsed.
///
/// Used for dedupe fingerprints and for selection-time duplicate checks.
pub fn normalize_summary(summary: &str) -> String {
    let cleaned: String = summary
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect();
    cleaned
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Trimmed, lowercased, deduplicated tags. Empty tags are dropped.
pub fn normalize_tags<I, S>(tags: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    tags.into_iter()
        .map(|t| t.as_ref().trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Trimmed paths with `\` separators turned into `/` and leading `./` removed.
pub fn normalize_path(path: &str) -> String {
    let unified = path.trim().replace('\\', "/");
    let mut p = unified.as_str();
    while let Some(rest) = p.strip_prefix("./") {
        p = rest;
    }
    p.to_string()
}

pub fn normalize_paths<I, S>(paths: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    paths
        .into_iter()
        .map(|p| normalize_path(p.as_ref()))
        .filter(|p| !p.is_empty())
        .collect()
}

/// Remove a trailing glob (`/**`, `/*`, `*`) and trailing separators.
pub fn strip_glob(path: &str) -> &str {
    let mut p = path;
    loop {
        let trimmed = p.trim_end_matches('*').trim_end_matches('/');
        if trimmed == p {
            return p;
        }
        p = trimmed;
    }
}

/// Non-empty `/`-separated components of a path.
pub fn path_components(path: &str) -> Vec<&str> {
    path.split('/').filter(|c| !c.is_empty() && *c != ".").collect()
}

/// Tokens of free text that look like file paths.
///
/// A token qualifies when it contains a path separator, or when it is a
/// dotted file name with an alphabetic extension (`auth.ts`, `Cargo.toml`).
pub fn path_like_tokens(text: &str) -> Vec<String> {
    text.split(|c: char| c.is_whitespace() || matches!(c, ',' | ';' | '"' | '\'' | '(' | ')' | '`'))
        .map(|t| t.trim_end_matches(['.', ':', '!', '?']))
        .filter(|t| !t.is_empty())
        .filter(|t| {
            if t.contains('/') || t.contains('\\') {
                return true;
            }
            match t.rsplit_once('.') {
                Some((stem, ext)) => {
                    !stem.is_empty()
                        && !ext.is_empty()
                        && ext.len() <= 8
                        && ext.chars().all(|c| c.is_ascii_alphabetic())
                }
                None => false,
            }
        })
        .map(normalize_path)
        .collect()
}

/// Lowercase slug of a title: alphanumerics joined by single dashes.
pub fn slugify(title: &str) -> String {
    let slug = tokenize(title).join("-");
    if slug.is_empty() {
        "concept".to_string()
    } else {
        slug.chars().take(48).collect::<String>().trim_end_matches('-').to_string()
    }
}

/// Jaccard ratio of two sets: |A ∩ B| / |A ∪ B|. Zero when both are empty.
pub fn jaccard<T: Ord>(a: &BTreeSet<T>, b: &BTreeSet<T>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}
