//! Complexity analyzer — a pure function from query text to
//! complexity/intent/specificity/urgency/multi-part tags.

use cortex_core::types::{QueryAnalysis, QueryIntent, Urgency};
use once_cell::sync::Lazy;
use regex::Regex;

static CODE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[A-Z]{2,}-?\d+").unwrap());
static NUMBER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d+(\.\d+)?\b").unwrap());
static LIST_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^\s*(\d+[.)]|[-*•])\s+").unwrap());
static PROPER_NOUN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b[A-Z][a-zA-Z]+\b").unwrap());

// Intent pattern tables. Precedence: VERIFY > DECISION > ACTION > INFO_SEEK,
// first match wins; no match defaults to INFO_SEEK.
const VERIFY_PATTERNS: &[&str] = &[
    "is it true",
    "is this correct",
    "is that correct",
    "verify",
    "confirm",
    "double check",
    "double-check",
    "did i do",
    "validate",
    "am i right",
];
const DECISION_PATTERNS: &[&str] = &[
    "should i",
    "should we",
    "which is better",
    "which one",
    "decide",
    "recommend",
    "pros and cons",
    " versus ",
    " vs ",
    "worth it",
    "or should",
];
const ACTION_PATTERNS: &[&str] = &[
    "how do i",
    "how do we",
    "how to",
    "how can i",
    "steps to",
    "walk me through",
    "set up",
    "setup",
    "configure",
    "install",
    "reset",
    "create a",
    "submit",
    "cancel my",
];

const URGENT_WORDS: &[&str] = &["asap", "urgent", "immediately", "right now", "emergency", "right away"];
const HIGH_WORDS: &[&str] = &["today", "quickly", "critical", "by end of day", "eod", "blocked"];
const MEDIUM_WORDS: &[&str] = &["soon", "this week", "when you can", "at some point this"];

const CONDITIONAL_MARKERS: &[&str] = &["if ", "when ", "unless", "in case", "depending on", "assuming"];
const MULTI_CRITERIA_MARKERS: &[&str] = &[" and ", " or ", "as well as", "both", "either"];
const MULTI_PART_CONNECTORS: &[&str] = &["and also", "additionally", "furthermore", "on top of that", "secondly"];

pub fn analyze(text: &str) -> QueryAnalysis {
    let lower = text.to_lowercase();

    let words = text.split_whitespace().count();
    let sentences = text
        .split(['.', '?', '!'])
        .filter(|s| !s.trim().is_empty())
        .count()
        .max(1);
    let conditionals = count_markers(&lower, CONDITIONAL_MARKERS);
    let multi_criteria = count_markers(&lower, MULTI_CRITERIA_MARKERS);

    // Bounded combination: word count dominates, sentence structure and
    // conditional/multi-criteria phrasing add on top. Always in [0, 1].
    let complexity_score = (0.08
        + 0.5 * (words.min(50) as f32 / 50.0)
        + 0.12 * conditionals.min(2) as f32
        + 0.10 * (multi_criteria > 0) as u8 as f32
        + 0.10 * (sentences.saturating_sub(1)).min(2) as f32)
        .clamp(0.0, 1.0);

    QueryAnalysis {
        complexity_score,
        intent: intent_of(&lower),
        specificity: specificity_of(text, &lower),
        urgency: urgency_of(&lower),
        multi_part: is_multi_part(text, &lower),
    }
}

fn count_markers(lower: &str, markers: &[&str]) -> usize {
    markers.iter().filter(|m| lower.contains(*m)).count()
}

fn intent_of(lower: &str) -> QueryIntent {
    if VERIFY_PATTERNS.iter().any(|p| lower.contains(p)) {
        return QueryIntent::Verify;
    }
    if DECISION_PATTERNS.iter().any(|p| lower.contains(p)) {
        return QueryIntent::Decision;
    }
    if ACTION_PATTERNS.iter().any(|p| lower.contains(p)) {
        return QueryIntent::Action;
    }
    QueryIntent::InfoSeek
}

/// Specificity grows with reference codes, numbers, and proper nouns.
fn specificity_of(text: &str, _lower: &str) -> f32 {
    let codes = CODE_RE.find_iter(text).count();
    let numbers = NUMBER_RE.find_iter(text).count();
    // Skip the sentence-leading word; it is capitalized by convention.
    let proper_nouns = PROPER_NOUN_RE
        .find_iter(text)
        .filter(|m| m.start() > 0)
        .count();

    (0.25 * codes.min(2) as f32
        + 0.15 * numbers.min(2) as f32
        + 0.10 * proper_nouns.min(3) as f32)
        .clamp(0.0, 1.0)
}

fn urgency_of(lower: &str) -> Urgency {
    if URGENT_WORDS.iter().any(|w| lower.contains(w)) {
        Urgency::Urgent
    } else if HIGH_WORDS.iter().any(|w| lower.contains(w)) {
        Urgency::High
    } else if MEDIUM_WORDS.iter().any(|w| lower.contains(w)) {
        Urgency::Medium
    } else {
        Urgency::Low
    }
}

fn is_multi_part(text: &str, lower: &str) -> bool {
    let question_marks = text.matches('?').count();
    question_marks >= 2
        || MULTI_PART_CONNECTORS.iter().any(|c| lower.contains(c))
        || LIST_RE.is_match(text)
}
