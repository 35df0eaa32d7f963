//! Overlapping, boundary-aware text chunker.
//!
//! Splits extracted document text into [`Chunk`]s of at most `chunk_size`
//! characters. Consecutive chunks overlap by exactly `chunk_overlap`
//! characters. A chunk end snaps back to the nearest paragraph break,
//! sentence end or whitespace found within `boundary_lookback` characters of
//! the hard limit; when none exists the text is cut at the limit.
//!
//! Chunk ids are content-addressed: a SHA-256 over the session id, document
//! id, character offsets and text. Re-chunking the same document in the same
//! session always yields the same ids, which lets the indexer upsert instead
//! of appending duplicates.

use sha2::{Digest, Sha256};

use crate::config::ChunkingConfig;
use crate::models::{Chunk, Document, SessionId};

/// A `[start, end)` span in character offsets.
pub type Span = (usize, usize);

/// Split a document into chunks with contiguous indices starting at 0.
///
/// Whitespace-only spans are skipped. Empty text produces no chunks.
pub fn chunk_document(session: &SessionId, doc: &Document, config: &ChunkingConfig) -> Vec<Chunk> {
    let spans = split_spans(
        &doc.text,
        config.chunk_size,
        config.chunk_overlap,
        config.boundary_lookback,
    );
    let byte_offsets = char_byte_offsets(&doc.text);
    let session = session.to_string();

    let mut chunks = Vec::with_capacity(spans.len());
    for (start, end) in spans {
        let text = &doc.text[byte_offsets[start]..byte_offsets[end]];
        if text.trim().is_empty() {
            continue;
        }
        let index = chunks.len() as i64;
        chunks.push(make_chunk(&session, doc, index, start, end, text));
    }
    chunks
}

/// Compute chunk spans over `text` measured in characters.
///
/// Guarantees: the first span starts at 0, the last ends at the text length,
/// and each span starts exactly `overlap` characters before the previous end.
pub fn split_spans(text: &str, size: usize, overlap: usize, lookback: usize) -> Vec<Span> {
    let chars: Vec<char> = text.chars().collect();
    let n = chars.len();
    if n == 0 || size == 0 {
        return Vec::new();
    }
    let overlap = overlap.min(size - 1);

    let mut spans = Vec::new();
    let mut start = 0usize;
    loop {
        let hard_end = (start + size).min(n);
        if hard_end == n {
            spans.push((start, n));
            break;
        }
        // The end must leave room for progress after stepping back by `overlap`.
        let min_end = start + overlap + 1;
        let end = snap_end(&chars, min_end, hard_end, lookback);
        spans.push((start, end));
        start = end - overlap;
    }
    spans
}

/// Pick the best cut position in `[max(hard_end - lookback, min_end), hard_end]`.
fn snap_end(chars: &[char], min_end: usize, hard_end: usize, lookback: usize) -> usize {
    let floor = hard_end.saturating_sub(lookback).max(min_end).max(1);
    if floor > hard_end {
        return hard_end;
    }

    let is_paragraph = |e: usize| e >= 2 && chars[e - 1] == '\n' && chars[e - 2] == '\n';
    let is_sentence = |e: usize| {
        chars[e - 1] == '\n'
            || (e >= 2 && chars[e - 1].is_whitespace() && matches!(chars[e - 2], '.' | '!' | '?'))
    };
    let is_space = |e: usize| chars[e - 1].is_whitespace();

    let candidates: [&dyn Fn(usize) -> bool; 3] = [&is_paragraph, &is_sentence, &is_space];
    for accept in candidates {
        if let Some(e) = (floor..=hard_end).rev().find(|&e| accept(e)) {
            return e;
        }
    }
    hard_end
}

/// Byte offset of every char boundary, plus the text length at the end.
fn char_byte_offsets(text: &str) -> Vec<usize> {
    text.char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .collect()
}

fn make_chunk(
    session: &str,
    doc: &Document,
    index: i64,
    start: usize,
    end: usize,
    text: &str,
) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    Chunk {
        id: chunk_id(session, &doc.id, start, end, text),
        document_id: doc.id.clone(),
        source: doc.source.clone(),
        chunk_index: index,
        start,
        end,
        text: text.to_string(),
        hash,
    }
}

/// Content-addressed chunk id.
pub fn chunk_id(session: &str, document_id: &str, start: usize, end: usize, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(session.as_bytes());
    hasher.update([0u8]);
    hasher.update(document_id.as_bytes());
    hasher.update([0u8]);
    hasher.update((start as u64).to_le_bytes());
    hasher.update((end as u64).to_le_bytes());
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn doc(text: &str) -> Document {
        Document {
            id: "doc1".to_string(),
            path: PathBuf::from("notes.txt"),
            source: "notes.txt".to_string(),
            extension: "txt".to_string(),
            text: text.to_string(),
        }
    }

    fn three_paragraphs() -> String {
        let sentence = "Widgets are assembled from brass gears and tiny springs. ";
        let para = sentence.repeat(9);
        format!("{}\n\n{}\n\n{}", para.trim_end(), para.trim_end(), para.trim_end())
    }

    fn reconstruct(text: &str, chunks: &[Chunk]) -> String {
        let chars: Vec<char> = text.chars().collect();
        let mut out = String::new();
        let mut covered = 0usize;
        for c in chunks {
            assert!(c.start <= covered, "gap before chunk {}", c.chunk_index);
            out.extend(&chars[covered.max(c.start)..c.end]);
            covered = c.end;
        }
        out
    }

    #[test]
    fn test_small_text_single_chunk() {
        let chunks = chunk_document(&SessionId::new(), &doc("Hello, world!"), &ChunkingConfig::default());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_index, 0);
        assert_eq!(chunks[0].text, "Hello, world!");
        assert_eq!((chunks[0].start, chunks[0].end), (0, 13));
    }

    #[test]
    fn test_empty_text_no_chunks() {
        let chunks = chunk_document(&SessionId::new(), &doc(""), &ChunkingConfig::default());
        assert!(chunks.is_empty());
    }

    #[test]
    fn test_three_paragraph_document_chunk_count() {
        let text = three_paragraphs();
        let n = text.chars().count();
        assert!(n > 1436 && n <= 1706, "fixture length {} out of range", n);

        let chunks = chunk_document(&SessionId::new(), &doc(&text), &ChunkingConfig::default());
        // ceil((n - 50) / (512 - 50)) for n in this range
        assert_eq!(chunks.len(), 4);
    }

    #[test]
    fn test_overlap_and_coverage() {
        let text = three_paragraphs();
        let cfg = ChunkingConfig::default();
        let chunks = chunk_document(&SessionId::new(), &doc(&text), &cfg);

        assert_eq!(chunks[0].start, 0);
        assert_eq!(chunks.last().unwrap().end, text.chars().count());
        for pair in chunks.windows(2) {
            assert_eq!(pair[0].end - pair[1].start, cfg.chunk_overlap);
        }
        for c in &chunks {
            assert!(c.end - c.start <= cfg.chunk_size);
        }
        assert_eq!(reconstruct(&text, &chunks), text);
    }

    #[test]
    fn test_prefers_sentence_boundary() {
        let text = three_paragraphs();
        let chunks = chunk_document(&SessionId::new(), &doc(&text), &ChunkingConfig::default());
        // Every non-final chunk ends right after whitespace, never mid-word.
        for c in &chunks[..chunks.len() - 1] {
            let last = c.text.chars().last().unwrap();
            assert!(last.is_whitespace(), "chunk {} ends with {:?}", c.chunk_index, last);
        }
    }

    #[test]
    fn test_hard_cut_without_boundaries() {
        let text = "x".repeat(1200);
        let spans = split_spans(&text, 512, 50, 64);
        assert_eq!(spans, vec![(0, 512), (462, 974), (924, 1200)]);
    }

    #[test]
    fn test_deterministic_ids() {
        let text = three_paragraphs();
        let session = SessionId::new();
        let c1 = chunk_document(&session, &doc(&text), &ChunkingConfig::default());
        let c2 = chunk_document(&session, &doc(&text), &ChunkingConfig::default());
        assert_eq!(c1, c2);
    }

    #[test]
    fn test_ids_scoped_to_session() {
        let text = "A short note about widgets.";
        let a = chunk_document(&SessionId::new(), &doc(text), &ChunkingConfig::default());
        let b = chunk_document(&SessionId::new(), &doc(text), &ChunkingConfig::default());
        assert_ne!(a[0].id, b[0].id);
        assert_eq!(a[0].hash, b[0].hash);
    }

    #[test]
    fn test_multibyte_text() {
        let text = "Größe und Maß — ünïcödé. ".repeat(60);
        let chunks = chunk_document(&SessionId::new(), &doc(&text), &ChunkingConfig::default());
        assert!(chunks.len() > 1);
        assert_eq!(reconstruct(&text, &chunks), text);
    }

    #[test]
    fn test_chunk_indices_contiguous() {
        let text = (0..200)
            .map(|i| format!("Paragraph number {}.", i))
            .collect::<Vec<_>>()
            .join("\n\n");
        let chunks = chunk_document(&SessionId::new(), &doc(&text), &ChunkingConfig::default());
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_index, i as i64, "Index mismatch at position {}", i);
        }
    }
}
