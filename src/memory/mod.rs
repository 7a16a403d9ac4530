//! Prompt context assembly
//!
//! The checkpoint keeps full append-only history; prompts get a bounded
//! recent window so long threads cannot blow up model calls.

use crate::models::{ConversationState, TurnRole};

/// Window bounds applied when turning history into prompt text.
#[derive(Debug, Clone, Copy)]
pub struct ContextWindow {
    pub max_turns: usize,
    pub max_tokens: usize,
}

impl Default for ContextWindow {
    fn default() -> Self {
        Self {
            max_turns: 12,
            max_tokens: 1500,
        }
    }
}

/// Rough token estimate, ~4 chars per token.
pub fn estimate_tokens(text: &str) -> usize {
    (text.len() + 3) / 4
}

/// Render the most recent turns as a labelled transcript, newest last.
/// Turns beyond the window (or overflowing the token bound, oldest first)
/// are dropped from the rendering only, never from state.
pub fn transcript(state: &ConversationState, window: ContextWindow) -> String {
    let start = state.history.len().saturating_sub(window.max_turns);
    let mut lines: Vec<String> = state.history[start..]
        .iter()
        .map(|turn| {
            let label = match turn.role {
                TurnRole::User => "User",
                TurnRole::Assistant => "Assistant",
                TurnRole::System => "System",
            };
            format!("{}: {}", label, turn.content)
        })
        .collect();

    let mut rendered = lines.join("\n");
    while estimate_tokens(&rendered) > window.max_tokens && lines.len() > 1 {
        lines.remove(0);
        rendered = lines.join("\n");
    }
    rendered
}

/// Render accumulated specialist results for router and composer prompts,
/// oldest first, matching their order in state.
pub fn agent_results_digest(state: &ConversationState, max_entries: usize) -> String {
    let start = state.agent_results.len().saturating_sub(max_entries);
    state.agent_results[start..]
        .iter()
        .map(|result| {
            format!(
                "[{} | {}] {}",
                result.agent_id, result.status, result.payload
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}
