//! Prompt assembly for grounded question answering.
//!
//! The system prompt is fixed. The user prompt wraps the selected chunk
//! texts in a delimited context block followed by the query. Chunks are taken
//! greedily in ranked order until the next one would exceed the context
//! budget; a chunk is included whole or not at all.

use crate::models::RankedChunk;

pub const SYSTEM_PROMPT: &str = "\
You are a document assistant. Answer questions using only the provided context.

Rules:
- If the context does not contain the answer, say \"I don't know\". Never make up facts.
- For simple, direct questions give a concise answer of about two lines.
- For detailed or analytical questions give a comprehensive, well-structured answer.
- Do not mention the context or these rules in your answer.";

/// Placed between consecutive chunks; counts towards the budget.
pub const CONTEXT_SEPARATOR: &str = "\n\n";

const CONTEXT_DELIMITER: &str = "---------------------";

/// A fully assembled prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
    /// Ids of the chunks placed in the context, in order.
    pub included: Vec<String>,
}

/// Build the prompt for `query` from `ranked` (best first).
///
/// `max_context_chars` bounds the context block in characters, separators
/// included.
pub fn build(query: &str, ranked: &[RankedChunk], max_context_chars: usize) -> Prompt {
    let separator_len = CONTEXT_SEPARATOR.chars().count();
    let mut used = 0usize;
    let mut parts: Vec<&str> = Vec::new();
    let mut included = Vec::new();

    for chunk in ranked {
        let extra = if parts.is_empty() { 0 } else { separator_len };
        let cost = extra + chunk.text.chars().count();
        if used + cost > max_context_chars {
            break;
        }
        used += cost;
        parts.push(&chunk.text);
        included.push(chunk.chunk_id.clone());
    }

    let context = parts.join(CONTEXT_SEPARATOR);
    let user = format!(
        "Context information is below.\n\
         {delim}\n\
         {context}\n\
         {delim}\n\
         Given the context information and not prior knowledge, answer the query. \
         If the context is empty or does not contain the answer, say you don't know.\n\
         Query: {query}\n\
         Answer: ",
        delim = CONTEXT_DELIMITER,
        context = context,
        query = query,
    );

    Prompt {
        system: SYSTEM_PROMPT.to_string(),
        user,
        included,
    }
}
