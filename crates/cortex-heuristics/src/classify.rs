//! Cheap regex classifier and query-text signal extraction.
//!
//! These run on every query inside RESOLVE, so they stay allocation-light
//! and never touch I/O.

use once_cell::sync::Lazy;
use regex::Regex;

static TROUBLESHOOT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(error|not working|doesn't work|does not work|broken|fail(ed|ing|s)?|crash|stuck)\b")
        .unwrap()
});
static HOW_TO_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(how (do|to|can)|steps? to|guide|walk me through)\b").unwrap());
static POLICY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(policy|allowed|permitted|compliance|regulation|rule|gdpr)\b").unwrap()
});
static LOOKUP_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(where|what is|what are|who is|who do|when is|which)\b").unwrap());
static REQUEST_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(i need|i want|please|can you|could you|request)\b").unwrap());

static FRUSTRATION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(still (not|doesn)|again\b|!{2,}|not working|doesn't work|why won't|this is (ridiculous|useless)|frustrat)",
    )
    .unwrap()
});

const STOPWORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "for", "with", "how", "what", "where", "when", "who",
    "why", "which", "do", "does", "did", "is", "are", "was", "were", "can", "could", "should",
    "would", "i", "we", "my", "our", "you", "your", "to", "of", "in", "on", "at", "by", "from",
    "me", "it", "this", "that", "please",
];

/// Coarse query category for analytics. Precedence mirrors specificity:
/// troubleshooting beats how-to beats policy beats lookup beats request.
pub fn classify_category(text: &str) -> &'static str {
    if TROUBLESHOOT_RE.is_match(text) {
        "troubleshooting"
    } else if HOW_TO_RE.is_match(text) {
        "how_to"
    } else if POLICY_RE.is_match(text) {
        "policy"
    } else if LOOKUP_RE.is_match(text) {
        "lookup"
    } else if REQUEST_RE.is_match(text) {
        "request"
    } else {
        "general"
    }
}

/// Content keywords: lowercased tokens minus stopwords, deduplicated in
/// first-seen order, capped at `max`.
pub fn extract_keywords(text: &str, max: usize) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for token in text.split(|c: char| !c.is_alphanumeric()) {
        if token.len() < 3 {
            continue;
        }
        let lower = token.to_lowercase();
        if STOPWORDS.contains(&lower.as_str()) {
            continue;
        }
        if seen.insert(lower.clone()) {
            out.push(lower);
            if out.len() >= max {
                break;
            }
        }
    }
    out
}

/// Count frustration markers in the text.
pub fn frustration_signals(text: &str) -> u32 {
    FRUSTRATION_RE.find_iter(text).count() as u32
}

/// Normalize for repeat-query comparison: lowercase, collapse whitespace,
/// strip punctuation.
pub fn normalize_for_repeat(text: &str) -> String {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn troubleshooting_beats_how_to() {
        assert_eq!(
            classify_category("how do I fix this error in the portal"),
            "troubleshooting"
        );
        assert_eq!(classify_category("how do I reset my password"), "how_to");
    }

    #[test]
    fn categories_cover_the_obvious_cases() {
        assert_eq!(classify_category("what is the travel policy"), "policy");
        assert_eq!(classify_category("where is the vendor list"), "lookup");
        assert_eq!(classify_category("please send me the report"), "request");
        assert_eq!(classify_category("returns overview"), "general");
    }

    #[test]
    fn keywords_skip_stopwords_and_dedupe() {
        let kws = extract_keywords("How do I process the vendor returns, vendor terms?", 10);
        assert_eq!(kws, vec!["process", "vendor", "returns", "terms"]);
    }

    #[test]
    fn frustration_markers_counted() {
        assert_eq!(frustration_signals("it's still not working!!"), 2);
        assert_eq!(frustration_signals("thanks, that helped"), 0);
    }

    #[test]
    fn repeat_normalization_ignores_case_and_punctuation() {
        assert_eq!(
            normalize_for_repeat("How do I reset my password?"),
            normalize_for_repeat("how do i RESET my password")
        );
    }
}
