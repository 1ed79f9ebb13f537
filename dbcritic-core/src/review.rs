//! Prompt construction for database-performance review.

use crate::diff::{estimate_tokens, DiffChunk};

/// Maximum tokens the model may generate for one chunk.
pub const MAX_COMPLETION_TOKENS: u32 = 2048;

/// Sampling temperature for review completions.
pub const COMPLETION_TEMPERATURE: f32 = 0.7;

/// Stop sequences that cut off chat-style runaway continuations.
pub const STOP_SEQUENCES: [&str; 2] = ["Human:", "Assistant:"];

/// Smallest diff budget we will ever hand the chunker, so that review still
/// proceeds hunk by hunk even on a tiny context window.
const MIN_CHUNK_TOKENS: usize = 64;

/// System prompt describing the reviewer persona and the output format.
pub fn get_system_prompt() -> String {
    include_str!("../prompt.txt").to_string()
}

/// Estimated-token budget for the diff portion of one prompt.
///
/// Half the context window is reserved for the model's response; the fixed
/// prompt text comes out of our half.
pub fn chunk_budget(context_size: u32) -> usize {
    let reserve = estimate_tokens(&get_system_prompt());
    ((context_size as usize) / 2)
        .saturating_sub(reserve)
        .max(MIN_CHUNK_TOKENS)
}

/// Create the per-chunk user prompt handed to the inference engine.
pub fn create_chunk_prompt(chunk: &DiffChunk, chunk_count: usize) -> String {
    let mut prompt = String::new();
    if chunk_count > 1 {
        prompt.push_str(&format!(
            "This is part {} of {} of the pull request diff.\n",
            chunk.index + 1,
            chunk_count
        ));
    }
    prompt.push_str("\nDIFF BEGINS:\n");
    prompt.push_str(&chunk.text);
    prompt.push_str("\nDIFF ENDS\n");
    prompt
}
