//! Mid-stream action tag scanner.
//!
//! The assistant can emit bracketed action tags (`[GREP term="..."]`,
//! `[VECTOR q="..."]`, `[SQUIRREL ...]`, `[EPISODIC ...]`) inside its
//! token stream. The scanner works incrementally across token boundaries:
//! it forwards plain text, holds back a suspected tag until it terminates,
//! and releases anything malformed or unterminated as literal text.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;

/// A suspected tag longer than this is released as plain text.
const MAX_TAG_LEN: usize = 256;

static ATTR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"([a-zA-Z_]\w*)="([^"]*)""#).unwrap());

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionTag {
    /// Keyword search over the caller's chunk scope.
    Grep { term: String },
    /// Vector search over the caller's chunk scope.
    Vector { q: String },
    /// Stash a note into the caller's memory scope.
    Squirrel { args: BTreeMap<String, String> },
    /// Search episodic memories in the caller's scope.
    Episodic { args: BTreeMap<String, String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOut {
    Text(String),
    Tag(ActionTag),
}

enum State {
    Text,
    /// Buffering from an opening '[' until ']' or overflow.
    Buffering(String),
}

pub struct TagScanner {
    state: State,
}

impl Default for TagScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl TagScanner {
    pub fn new() -> Self {
        Self { state: State::Text }
    }

    /// Feed one chunk of streamed text; returns the outputs released by it.
    pub fn push(&mut self, chunk: &str) -> Vec<ScanOut> {
        let mut out = Vec::new();
        let mut text_run = String::new();

        for ch in chunk.chars() {
            match &mut self.state {
                State::Text => {
                    if ch == '[' {
                        if !text_run.is_empty() {
                            out.push(ScanOut::Text(std::mem::take(&mut text_run)));
                        }
                        self.state = State::Buffering(String::from('['));
                    } else {
                        text_run.push(ch);
                    }
                }
                State::Buffering(buf) => {
                    // A tag name starts with an uppercase letter; anything
                    // else (e.g. "[1]" list markers) is ordinary text. A
                    // second '[' restarts the candidate.
                    if buf.len() == 1 && !ch.is_ascii_uppercase() {
                        text_run.push('[');
                        if ch != '[' {
                            text_run.push(ch);
                            self.state = State::Text;
                        }
                        continue;
                    }
                    buf.push(ch);
                    if ch == ']' {
                        let candidate = std::mem::take(buf);
                        self.state = State::Text;
                        match parse_tag(&candidate) {
                            Some(tag) => out.push(ScanOut::Tag(tag)),
                            None => text_run.push_str(&candidate),
                        }
                    } else if buf.len() > MAX_TAG_LEN {
                        text_run.push_str(buf);
                        self.state = State::Text;
                    }
                }
            }
        }

        if !text_run.is_empty() {
            out.push(ScanOut::Text(text_run));
        }
        out
    }

    /// End of a stream round: an unterminated tag passes through as plain
    /// text. The scanner resets and can be reused for the next round.
    pub fn finish(&mut self) -> Option<String> {
        match std::mem::replace(&mut self.state, State::Text) {
            State::Text => None,
            State::Buffering(buf) => Some(buf),
        }
    }
}

/// Parse a complete `[...]` candidate. Returns None for unknown names,
/// missing required attributes, or trailing junk — those stay literal.
fn parse_tag(candidate: &str) -> Option<ActionTag> {
    let inner = candidate.strip_prefix('[')?.strip_suffix(']')?;
    let (name, rest) = match inner.find(char::is_whitespace) {
        Some(idx) => (&inner[..idx], &inner[idx..]),
        None => (inner, ""),
    };

    // Reject if anything besides well-formed key="value" pairs remains.
    let mut args = BTreeMap::new();
    let mut consumed = String::from(rest);
    for cap in ATTR_RE.captures_iter(rest) {
        args.insert(cap[1].to_string(), cap[2].to_string());
        consumed = consumed.replacen(&cap[0], "", 1);
    }
    if !consumed.trim().is_empty() {
        return None;
    }

    match name {
        "GREP" => args.remove("term").map(|term| ActionTag::Grep { term }),
        "VECTOR" => args.remove("q").map(|q| ActionTag::Vector { q }),
        "SQUIRREL" => Some(ActionTag::Squirrel { args }),
        "EPISODIC" => Some(ActionTag::Episodic { args }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan_all(chunks: &[&str]) -> (Vec<ScanOut>, Option<String>) {
        let mut scanner = TagScanner::new();
        let mut out = Vec::new();
        for chunk in chunks {
            out.extend(scanner.push(chunk));
        }
        let rest = scanner.finish();
        (out, rest)
    }

    #[test]
    fn plain_text_passes_through() {
        let (out, rest) = scan_all(&["hello ", "world"]);
        assert_eq!(
            out,
            vec![
                ScanOut::Text("hello ".into()),
                ScanOut::Text("world".into())
            ]
        );
        assert!(rest.is_none());
    }

    #[test]
    fn complete_tag_is_detected_and_suppressed() {
        let (out, _) = scan_all(&["see [GREP term=\"vendor terms\"] for details"]);
        assert_eq!(
            out,
            vec![
                ScanOut::Text("see ".into()),
                ScanOut::Tag(ActionTag::Grep {
                    term: "vendor terms".into()
                }),
                ScanOut::Text(" for details".into()),
            ]
        );
    }

    #[test]
    fn tag_split_across_token_boundaries() {
        let (out, _) = scan_all(&["before [GR", "EP term=\"ven", "dor\"] after"]);
        assert_eq!(
            out,
            vec![
                ScanOut::Text("before ".into()),
                ScanOut::Tag(ActionTag::Grep {
                    term: "vendor".into()
                }),
                ScanOut::Text(" after".into()),
            ]
        );
    }

    #[test]
    fn vector_and_episodic_tags() {
        let (out, _) = scan_all(&["[VECTOR q=\"refund policy\"][EPISODIC topic=\"onboarding\"]"]);
        assert_eq!(
            out,
            vec![
                ScanOut::Tag(ActionTag::Vector {
                    q: "refund policy".into()
                }),
                ScanOut::Tag(ActionTag::Episodic {
                    args: BTreeMap::from([("topic".to_string(), "onboarding".to_string())])
                }),
            ]
        );
    }

    #[test]
    fn unknown_tag_name_is_literal_text() {
        let (out, _) = scan_all(&["[NOTE x=\"1\"]"]);
        assert_eq!(out, vec![ScanOut::Text("[NOTE x=\"1\"]".into())]);
    }

    #[test]
    fn malformed_attributes_are_literal_text() {
        let (out, _) = scan_all(&["[GREP term=unquoted]"]);
        assert_eq!(out, vec![ScanOut::Text("[GREP term=unquoted]".into())]);
    }

    #[test]
    fn missing_required_attribute_is_literal_text() {
        let (out, _) = scan_all(&["[GREP]"]);
        assert_eq!(out, vec![ScanOut::Text("[GREP]".into())]);
    }

    #[test]
    fn list_markers_do_not_stall_the_stream() {
        let (out, rest) = scan_all(&["[1] first item [2] second"]);
        assert_eq!(
            out,
            vec![ScanOut::Text("[1] first item [2] second".into())]
        );
        assert!(rest.is_none());
    }

    #[test]
    fn unterminated_tag_surfaces_at_finish() {
        let (out, rest) = scan_all(&["text [GREP term=\"never closed"]);
        assert_eq!(out, vec![ScanOut::Text("text ".into())]);
        assert_eq!(rest.unwrap(), "[GREP term=\"never closed");
    }

    #[test]
    fn oversized_candidate_is_released_as_text() {
        let big = format!("[GREP term=\"{}\"]", "x".repeat(400));
        let (out, _) = scan_all(&[big.as_str()]);
        // released as text once the cap is exceeded, nothing swallowed
        let joined: String = out
            .iter()
            .map(|o| match o {
                ScanOut::Text(t) => t.clone(),
                ScanOut::Tag(_) => panic!("oversized tag must not parse"),
            })
            .collect();
        assert_eq!(joined, big);
    }
}
