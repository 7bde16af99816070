//! Reduce a task description to search terms and a query.

use ctxvault_core::text::{is_stop_word, tokenize};
use std::collections::HashSet;

/// Meaningful terms of `task`, in order of first appearance, at most `max_terms`.
///
/// Stop words and single-character tokens are dropped.
pub fn extract_terms(task: &str, max_terms: usize) -> Vec<String> {
    let mut seen = HashSet::new();
    tokenize(task)
        .into_iter()
        .filter(|t| t.chars().count() > 1 && !is_stop_word(t))
        .filter(|t| seen.insert(t.clone()))
        .take(max_terms)
        .collect()
}

/// The memory query for a set of terms.
///
/// One term becomes a prefix query (`term*`), several are space-joined,
/// none falls back to the trimmed task text.
pub fn build_query(terms: &[String], task: &str) -> String {
    match terms {
        [] => task.trim().to_string(),
        [single] => format!("{single}*"),
        many => many.join(" "),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drops_stop_words_and_short_tokens() {
        let terms = extract_terms("Fix the auth bug in a middleware", 5);
        assert_eq!(terms, vec!["fix", "auth", "bug", "middleware"]);
    }

    #[test]
    fn keeps_underscores_and_caps_count() {
        let terms = extract_terms("refresh_token rotation, expiry, storage, cookies, csrf, cors", 5);
        assert_eq!(
            terms,
            vec!["refresh_token", "rotation", "expiry", "storage", "cookies"]
        );
    }

    #[test]
    fn repeated_terms_count_once() {
        assert_eq!(extract_terms("auth AUTH Auth", 5), vec!["auth"]);
    }

    #[test]
    fn query_shapes() {
        assert_eq!(build_query(&["auth".into()], "auth"), "auth*");
        assert_eq!(
            build_query(&["fix".into(), "auth".into()], "fix auth"),
            "fix auth"
        );
        assert_eq!(build_query(&[], "  the  "), "the");
    }
}
