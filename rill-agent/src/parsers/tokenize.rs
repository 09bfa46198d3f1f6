//! Search token extraction for full-text lookups.

use lazy_static::lazy_static;
use regex::Regex;
use std::collections::BTreeSet;

const MIN_TOKEN_LEN: usize = 2;

const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "can", "for", "from", "have", "if", "in",
    "is", "it", "may", "not", "of", "on", "or", "tbd", "that", "the", "this", "to", "us", "we",
    "when", "will", "with", "yet", "you", "your",
];

lazy_static! {
    static ref TOKEN: Regex = Regex::new(r"\w+(?:\.?\w+)*").unwrap();
}

/// Lowercased, de-duplicated word tokens of `text` without English stop words.
pub fn keywords(text: &str) -> BTreeSet<String> {
    TOKEN
        .find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .filter(|token| token.chars().count() >= MIN_TOKEN_LEN)
        .filter(|token| !STOP_WORDS.contains(&token.as_str()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_lowercase_sorted_and_unique() {
        let tokens: Vec<String> = keywords("Socket connection made, socket CLOSED").into_iter().collect();
        assert_eq!(tokens, vec!["closed", "connection", "made", "socket"]);
    }

    #[test]
    fn stop_words_and_single_chars_are_dropped() {
        let tokens = keywords("the file is a b on disk");
        assert!(tokens.contains("file"));
        assert!(tokens.contains("disk"));
        assert!(!tokens.contains("the"));
        assert!(!tokens.contains("b"));
    }

    #[test]
    fn dotted_words_stay_together() {
        let tokens = keywords("DCClient.cpp:120 failed");
        assert!(tokens.contains("dcclient.cpp"));
        assert!(tokens.contains("120"));
    }
}
