//! System prompt assembly.
//!
//! The prompt is built from the tenant persona, the ranked retrieval
//! passages under a token budget, and the action-tag grammar. Passages
//! are dropped lowest-ranked-first when the budget is exceeded.

use cortex_retrieval::{Passage, PassageKind};

const DEFAULT_PERSONA: &str = "You are a helpful assistant for this organization. \
Answer from the provided context when possible and say so when the context \
does not cover the question.";

const ACTION_GRAMMAR: &str = "\
When you need more context mid-answer you may emit exactly one action tag \
on its own, chosen from:\n\
[GREP term=\"...\"] — keyword search in the document base\n\
[VECTOR q=\"...\"] — semantic search in the document base\n\
[EPISODIC topic=\"...\"] — search earlier conversations\n\
[SQUIRREL key=\"...\" value=\"...\"] — store a fact for later\n\
The tag is replaced by results; never show tags to the user.";

/// Estimate tokens as len/4, matching the analytics approximation.
pub fn approx_tokens(text: &str) -> usize {
    text.len() / 4
}

pub struct PromptBuilder {
    passage_token_budget: usize,
}

impl PromptBuilder {
    pub fn new(passage_token_budget: usize) -> Self {
        Self {
            passage_token_budget,
        }
    }

    /// Build the system prompt. Returns the prompt text and the passages
    /// that actually made it in (for the citation frame).
    pub fn build<'a>(
        &self,
        persona: Option<&str>,
        passages: &'a [Passage],
        tools_enabled: bool,
    ) -> (String, Vec<&'a Passage>) {
        let mut prompt = String::new();
        prompt.push_str(persona.unwrap_or(DEFAULT_PERSONA));

        let kept = self.select_passages(passages);
        if !kept.is_empty() {
            prompt.push_str("\n\n## Context\n");
            for passage in &kept {
                match passage.kind {
                    PassageKind::Process => {
                        let title = passage.section_title.as_deref().unwrap_or("untitled");
                        let source = passage.source_file.as_deref().unwrap_or("unknown");
                        prompt.push_str(&format!("\n### {} ({})\n{}\n", title, source, passage.content));
                    }
                    PassageKind::Memory => {
                        prompt.push_str(&format!("\n### Earlier exchange\n{}\n", passage.content));
                    }
                    PassageKind::Episodic => {
                        prompt.push_str(&format!(
                            "\n### Conversation summary\n{}\n",
                            passage.content
                        ));
                    }
                }
            }
        }

        if tools_enabled {
            prompt.push_str("\n\n## Actions\n");
            prompt.push_str(ACTION_GRAMMAR);
        }

        (prompt, kept)
    }

    /// Keep passages in rank order until the token budget is exhausted.
    /// The input is already sorted best-first, so dropping the tail drops
    /// the lowest-ranked passages first.
    fn select_passages<'a>(&self, passages: &'a [Passage]) -> Vec<&'a Passage> {
        let mut used = 0usize;
        let mut kept = Vec::new();
        for passage in passages {
            let cost = (passage.token_count as usize).max(approx_tokens(&passage.content));
            if used + cost > self.passage_token_budget {
                break;
            }
            used += cost;
            kept.push(passage);
        }
        kept
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn passage(score: f32, tokens: u32, content: &str) -> Passage {
        Passage {
            id: Uuid::new_v4(),
            kind: PassageKind::Process,
            department: Some("it".into()),
            source_file: Some("kb.md".into()),
            section_title: Some("Resets".into()),
            content: content.to_string(),
            score,
            importance: 0.0,
            created_at: Utc::now(),
            token_count: tokens,
            prerequisites: vec![],
        }
    }

    #[test]
    fn budget_drops_lowest_ranked_first() {
        let passages = vec![
            passage(0.9, 100, "top"),
            passage(0.8, 100, "middle"),
            passage(0.7, 100, "bottom"),
        ];
        let builder = PromptBuilder::new(220);
        let (prompt, kept) = builder.build(None, &passages, false);
        assert_eq!(kept.len(), 2);
        assert!(prompt.contains("top"));
        assert!(prompt.contains("middle"));
        assert!(!prompt.contains("bottom"));
    }

    #[test]
    fn persona_override_is_used() {
        let builder = PromptBuilder::new(1000);
        let (prompt, _) = builder.build(Some("You are the Acme handbook bot."), &[], false);
        assert!(prompt.starts_with("You are the Acme handbook bot."));
    }

    #[test]
    fn empty_retrieval_still_produces_a_prompt() {
        let builder = PromptBuilder::new(1000);
        let (prompt, kept) = builder.build(None, &[], true);
        assert!(kept.is_empty());
        assert!(!prompt.contains("## Context"));
        assert!(prompt.contains("[GREP"));
    }
}
