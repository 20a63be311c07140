//! Text chunking strategies.
//!
//! Splits extracted document text into ordered passages under a
//! [`ChunkingPolicy`]. Sizes are measured in characters.
//!
//! # Strategies
//!
//! | Strategy | Behaviour |
//! |----------|-----------|
//! | `fixed` | Windows of `chunk_size` chars, advancing by `chunk_size - chunk_overlap`. Deterministic, ignores structure. |
//! | `recursive` | Splits at the coarsest boundary that fits (paragraph, line, sentence, word), then merges neighbours back up to the budget with overlap. |
//! | `semantic` | Embeds sentences and groups neighbours whose cosine similarity reaches `semantic_threshold`. |
//!
//! A run of text with no boundary at all (a long URL, a base64 blob) is kept
//! whole even when it exceeds the budget. Empty or whitespace-only input
//! yields zero chunks; the caller decides that this is a failure.
//!
//! # Example
//!
//! ```rust
//! use kb_engine_core::chunk::fixed_length_spans;
//!
//! let spans = fixed_length_spans("abcdefghij", 4, 1);
//! assert_eq!(spans, vec![(0, 4), (3, 7), (6, 10)]);
//! ```

use std::collections::VecDeque;

use uuid::Uuid;

use crate::embedding::{cosine_similarity, TextEmbedder};
use crate::error::{EngineError, Result};
use crate::models::{Chunk, ChunkStrategy, ChunkingPolicy, StructuralHints, TextSpan};
use crate::text::{char_len, content_hash, sentence_spans};

/// A chunk before it is bound to a document: text, byte span and metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkDraft {
    pub ordinal: u32,
    pub text: String,
    pub start: usize,
    pub end: usize,
    pub section_title: Option<String>,
    pub page_number: Option<u32>,
}

/// Split `text` according to `policy`.
///
/// `embedder` is only consulted by the semantic strategy.
pub async fn chunk_text(
    text: &str,
    hints: &StructuralHints,
    policy: &ChunkingPolicy,
    embedder: &dyn TextEmbedder,
) -> Result<Vec<ChunkDraft>> {
    policy.validate()?;
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }

    let spans = match policy.strategy {
        ChunkStrategy::Fixed => fixed_length_spans(text, policy.chunk_size, policy.chunk_overlap),
        ChunkStrategy::Recursive => recursive_spans(
            text,
            0,
            text.len(),
            policy.chunk_size,
            policy.chunk_overlap,
            &hints.tables,
        ),
        ChunkStrategy::Semantic => semantic_spans(text, hints, policy, embedder).await?,
    };

    Ok(to_drafts(text, hints, spans))
}

/// Bind drafts to a document, assigning ids and content hashes.
pub fn make_chunks(kb_id: &str, document_id: &str, drafts: Vec<ChunkDraft>) -> Vec<Chunk> {
    drafts
        .into_iter()
        .map(|d| Chunk {
            id: Uuid::new_v4().to_string(),
            kb_id: kb_id.to_string(),
            document_id: document_id.to_string(),
            ordinal: d.ordinal,
            content_hash: content_hash(&d.text),
            text: d.text,
            section_title: d.section_title,
            page_number: d.page_number,
        })
        .collect()
}

fn to_drafts(text: &str, hints: &StructuralHints, spans: Vec<(usize, usize)>) -> Vec<ChunkDraft> {
    spans
        .into_iter()
        .filter(|(s, e)| !text[*s..*e].trim().is_empty())
        .enumerate()
        .map(|(i, (start, end))| ChunkDraft {
            ordinal: i as u32,
            text: text[start..end].to_string(),
            start,
            end,
            section_title: hints.section_at(start).map(str::to_string),
            page_number: hints.page_at(start),
        })
        .collect()
}

// ============ Fixed-length ============

/// Byte spans of fixed character windows.
///
/// Windows start every `size - overlap` characters; the last one ends at
/// the end of the text. Callers must ensure `overlap < size`.
pub fn fixed_length_spans(text: &str, size: usize, overlap: usize) -> Vec<(usize, usize)> {
    let bounds: Vec<usize> = text
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .collect();
    let n = bounds.len() - 1;
    if n == 0 || size == 0 || overlap >= size {
        return Vec::new();
    }
    let step = size - overlap;

    let mut spans = Vec::new();
    let mut start = 0;
    loop {
        let end = (start + size).min(n);
        spans.push((bounds[start], bounds[end]));
        if end == n {
            break;
        }
        start += step;
    }
    spans
}

// ============ Recursive-character ============

#[derive(Debug, Clone, Copy)]
enum Boundary {
    Paragraph,
    Line,
    Sentence,
    Word,
}

const BOUNDARIES: [Boundary; 4] = [
    Boundary::Paragraph,
    Boundary::Line,
    Boundary::Sentence,
    Boundary::Word,
];

/// Recursive-character split of `text[start..end]`, trimmed spans.
pub fn recursive_spans(
    text: &str,
    start: usize,
    end: usize,
    size: usize,
    overlap: usize,
    tables: &[TextSpan],
) -> Vec<(usize, usize)> {
    // tables that fit the budget are never cut
    let protected: Vec<TextSpan> = tables
        .iter()
        .filter(|t| t.end <= text.len() && char_len(&text[t.start..t.end]) <= size)
        .copied()
        .collect();

    let pieces = split_range(text, start, end, &BOUNDARIES, size, &protected);
    merge_pieces(text, &pieces, size, overlap)
        .into_iter()
        .filter_map(|span| trim_span(text, span))
        .collect()
}

/// Split until every piece fits `size` or no finer boundary remains.
fn split_range(
    text: &str,
    start: usize,
    end: usize,
    boundaries: &[Boundary],
    size: usize,
    protected: &[TextSpan],
) -> Vec<(usize, usize)> {
    if char_len(&text[start..end]) <= size {
        return vec![(start, end)];
    }

    for (i, boundary) in boundaries.iter().enumerate() {
        let cuts: Vec<usize> = cut_points(text, start, end, *boundary)
            .into_iter()
            .filter(|c| !protected.iter().any(|t| t.contains(*c)))
            .collect();
        if cuts.is_empty() {
            continue;
        }

        let mut out = Vec::new();
        let mut piece_start = start;
        for cut in cuts.into_iter().chain(std::iter::once(end)) {
            if char_len(&text[piece_start..cut]) <= size {
                out.push((piece_start, cut));
            } else {
                out.extend(split_range(
                    text,
                    piece_start,
                    cut,
                    &boundaries[i + 1..],
                    size,
                    protected,
                ));
            }
            piece_start = cut;
        }
        return out;
    }

    vec![(start, end)]
}

/// Offsets strictly inside `(start, end)` where a piece may end. The
/// separator stays with the preceding piece.
fn cut_points(text: &str, start: usize, end: usize, boundary: Boundary) -> Vec<usize> {
    let slice = &text[start..end];
    let mut cuts = Vec::new();
    match boundary {
        Boundary::Paragraph => {
            let bytes = slice.as_bytes();
            let mut i = 0;
            while i + 1 < bytes.len() {
                if bytes[i] == b'\n' && bytes[i + 1] == b'\n' {
                    let mut j = i + 2;
                    while j < bytes.len() && bytes[j] == b'\n' {
                        j += 1;
                    }
                    cuts.push(start + j);
                    i = j;
                } else {
                    i += 1;
                }
            }
        }
        Boundary::Line => {
            for (i, c) in slice.char_indices() {
                if c == '\n' {
                    cuts.push(start + i + 1);
                }
            }
        }
        Boundary::Sentence => {
            cuts.extend(sentence_spans(slice).iter().skip(1).map(|(s, _)| start + s));
        }
        Boundary::Word => {
            let mut prev_ws = false;
            for (i, c) in slice.char_indices() {
                if prev_ws && !c.is_whitespace() {
                    cuts.push(start + i);
                }
                prev_ws = c.is_whitespace();
            }
        }
    }
    cuts.retain(|c| *c > start && *c < end);
    cuts
}

/// Merge adjacent pieces back into chunks of at most `size` chars, carrying
/// up to `overlap` chars of trailing pieces into the next chunk.
fn merge_pieces(
    text: &str,
    pieces: &[(usize, usize)],
    size: usize,
    overlap: usize,
) -> Vec<(usize, usize)> {
    let mut out = Vec::new();
    let mut window: VecDeque<((usize, usize), usize)> = VecDeque::new();
    let mut total = 0usize;

    for &piece in pieces {
        let len = char_len(&text[piece.0..piece.1]);
        if total + len > size && !window.is_empty() {
            if let (Some(first), Some(last)) = (window.front(), window.back()) {
                out.push((first.0 .0, last.0 .1));
            }
            while total > overlap || (total > 0 && total + len > size) {
                match window.pop_front() {
                    Some((_, l)) => total -= l,
                    None => break,
                }
            }
        }
        window.push_back((piece, len));
        total += len;
    }
    if let (Some(first), Some(last)) = (window.front(), window.back()) {
        out.push((first.0 .0, last.0 .1));
    }
    out
}

fn trim_span(text: &str, (start, end): (usize, usize)) -> Option<(usize, usize)> {
    let slice = &text[start..end];
    let trimmed = slice.trim();
    if trimmed.is_empty() {
        return None;
    }
    let lead = slice.len() - slice.trim_start().len();
    Some((start + lead, start + lead + trimmed.len()))
}

// ============ Semantic ============

async fn semantic_spans(
    text: &str,
    hints: &StructuralHints,
    policy: &ChunkingPolicy,
    embedder: &dyn TextEmbedder,
) -> Result<Vec<(usize, usize)>> {
    let sentences = sentence_spans(text);
    if sentences.is_empty() {
        return Ok(Vec::new());
    }

    let texts: Vec<String> = sentences
        .iter()
        .map(|(s, e)| text[*s..*e].to_string())
        .collect();
    let vectors = embedder.embed_texts(&texts).await?;
    if vectors.len() != texts.len() {
        return Err(EngineError::ProviderFatal(format!(
            "embedder returned {} vectors for {} sentences",
            vectors.len(),
            texts.len()
        )));
    }

    let mut groups = Vec::new();
    let (mut group_start, mut group_end) = sentences[0];
    for i in 1..sentences.len() {
        let similarity = cosine_similarity(&vectors[i - 1], &vectors[i]);
        let extended_len = char_len(&text[group_start..sentences[i].1]);
        if similarity >= policy.semantic_threshold && extended_len <= policy.chunk_size {
            group_end = sentences[i].1;
        } else {
            groups.push((group_start, group_end));
            (group_start, group_end) = sentences[i];
        }
    }
    groups.push((group_start, group_end));

    // a single sentence longer than the budget falls back to recursive splitting
    let mut spans = Vec::with_capacity(groups.len());
    for (s, e) in groups {
        if char_len(&text[s..e]) > policy.chunk_size {
            spans.extend(recursive_spans(
                text,
                s,
                e,
                policy.chunk_size,
                policy.chunk_overlap,
                &hints.tables,
            ));
        } else {
            spans.push((s, e));
        }
    }
    Ok(spans)
}
