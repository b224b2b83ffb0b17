//! Window assembly: system prompt, stored summary, then live turns

use super::models::{ChatMessage, Turn};

/// Prefix wrapping a stored summary when it is replayed as a system turn
pub const SUMMARY_PREFIX: &str = "The following is a summary of earlier conversation:";

/// Assembles the ordered message list for a single model call.
///
/// Pure assembly; truncation is the compression engine's job.
pub fn build_window(
    turns: &[Turn],
    summary: Option<&str>,
    system_prompt: Option<&str>,
) -> Vec<ChatMessage> {
    let mut window = Vec::with_capacity(turns.len() + 2);

    if let Some(prompt) = system_prompt.filter(|p| !p.is_empty()) {
        window.push(ChatMessage::system(prompt));
    }

    if let Some(summary) = summary.filter(|s| !s.trim().is_empty()) {
        window.push(ChatMessage::system(format!("{}\n{}", SUMMARY_PREFIX, summary)));
    }

    window.extend(
        turns
            .iter()
            .map(|turn| ChatMessage::new(turn.role, turn.content.clone())),
    );

    window
}

/// Flat `role: content` transcript used as summarization input
pub fn render_transcript(turns: &[Turn]) -> String {
    turns
        .iter()
        .map(|t| format!("{}: {}", t.role, t.content))
        .collect::<Vec<_>>()
        .join("\n")
}
