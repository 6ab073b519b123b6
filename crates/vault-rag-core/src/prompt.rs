//! Prompt construction.
//!
//! The prompt is plain text in fixed sections so any completion-style model
//! can consume it:
//!
//! ```text
//! === SYSTEM ===
//! === RELEVANT KNOWLEDGE ===
//! === CONVERSATION HISTORY ===   (omitted when empty)
//! === CURRENT QUESTION ===
//! ```

use crate::models::{AssembledContext, Role, Turn};

/// Default persona. It states the citation format the extractor parses.
pub const DEFAULT_SYSTEM_PROMPT: &str = "\
You are a thoughtful guide who answers questions from a personal library of \
notes on spirituality, psychology, self-development and philosophy.

Guidelines:
1. Ground every answer in the knowledge provided below.
2. Cite each source you draw on inline as [Source: Title], using the title \
exactly as it appears in the knowledge headers.
3. Offer practical guidance alongside the ideas.
4. Say so plainly when the notes do not cover the question.
5. Be warm and concise; two or three paragraphs is usually enough.

You are not a therapist. For serious mental health concerns, suggest \
professional help.";

const NO_CONTEXT: &str = "(No relevant notes were found for this question.)";

const CLOSING_INSTRUCTION: &str = "Answer using the relevant knowledge above. \
Cite sources in [Source: Title] format.";

/// Builds prompts with a fixed persona and history window.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    system_prompt: String,
    history_turns: usize,
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_SYSTEM_PROMPT, 6)
    }
}

impl PromptBuilder {
    /// `history_turns` is the number of most recent messages kept.
    pub fn new(system_prompt: impl Into<String>, history_turns: usize) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            history_turns,
        }
    }

    pub fn build(&self, context: &AssembledContext, history: &[Turn], question: &str) -> String {
        let mut parts: Vec<String> = vec![
            "=== SYSTEM ===".into(),
            self.system_prompt.clone(),
            String::new(),
            "=== RELEVANT KNOWLEDGE ===".into(),
        ];
        if context.is_empty() {
            parts.push(NO_CONTEXT.into());
        } else {
            parts.push(context.text.clone());
        }
        parts.push(String::new());

        let recent = &history[history.len().saturating_sub(self.history_turns)..];
        if !recent.is_empty() {
            parts.push("=== CONVERSATION HISTORY ===".into());
            for turn in recent {
                let role = match turn.role {
                    Role::User => "User",
                    Role::Assistant => "Assistant",
                };
                parts.push(format!("{role}: {}", turn.content));
            }
            parts.push(String::new());
        }

        parts.extend([
            "=== CURRENT QUESTION ===".into(),
            format!("User: {}", question.trim()),
            String::new(),
            CLOSING_INSTRUCTION.into(),
            String::new(),
            "Assistant:".into(),
        ]);
        parts.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(role: Role, content: &str) -> Turn {
        Turn {
            role,
            content: content.into(),
        }
    }

    fn context(text: &str) -> AssembledContext {
        AssembledContext {
            chunks: Vec::new(),
            text: text.into(),
            token_count: 0,
        }
    }

    #[test]
    fn test_sections_in_order() {
        let prompt = PromptBuilder::default().build(
            &context("[Source: Presence]\nBe here."),
            &[turn(Role::User, "hi"), turn(Role::Assistant, "hello")],
            "What is presence?",
        );
        let system = prompt.find("=== SYSTEM ===").unwrap();
        let knowledge = prompt.find("=== RELEVANT KNOWLEDGE ===").unwrap();
        let history = prompt.find("=== CONVERSATION HISTORY ===").unwrap();
        let question = prompt.find("=== CURRENT QUESTION ===").unwrap();
        assert!(system < knowledge && knowledge < history && history < question);
        assert!(prompt.contains("User: What is presence?"));
        assert!(prompt.contains("Assistant: hello"));
        assert!(prompt.ends_with("Assistant:"));
    }

    #[test]
    fn test_history_window() {
        let history: Vec<Turn> = (0..10)
            .map(|i| turn(Role::User, &format!("message {i}")))
            .collect();
        let prompt = PromptBuilder::new("sys", 3).build(&context("ctx"), &history, "q");
        assert!(!prompt.contains("message 6"));
        assert!(prompt.contains("message 7"));
        assert!(prompt.contains("message 9"));
    }

    #[test]
    fn test_empty_history_and_context() {
        let prompt = PromptBuilder::default().build(&AssembledContext::default(), &[], "q");
        assert!(!prompt.contains("=== CONVERSATION HISTORY ==="));
        assert!(prompt.contains(NO_CONTEXT));
    }

    #[test]
    fn test_default_prompt_states_citation_format() {
        assert!(DEFAULT_SYSTEM_PROMPT.contains("[Source: Title]"));
    }
}
