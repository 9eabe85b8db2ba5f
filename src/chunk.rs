//! Token-budgeted paragraph chunker.
//!
//! Text is normalized, split into paragraphs on blank lines, and
//! paragraphs are accumulated into a chunk while the estimated token
//! count stays within `chunk_tokens`. When a paragraph does not fit, the
//! current chunk closes and the next one starts with the last
//! `overlap_words` words of the closed chunk.
//!
//! A paragraph that alone exceeds the budget is split on sentence
//! boundaries with the same accumulate/close logic but no overlap.
//!
//! Each chunk records how many leading words are overlap, plus a SHA-256
//! hash of its text used to detect stale embeddings.

use serde_json::json;
use sha2::{Digest, Sha256};

use crate::config::ChunkingConfig;
use crate::models::KnowledgeChunk;

/// A chunk before it is tied to a file.
#[derive(Debug, Clone, PartialEq)]
pub struct TextChunk {
    pub text: String,
    /// Leading words repeated from the previous chunk.
    pub overlap_words: usize,
}

/// `ceil(words * 1.3)`. Cheap and deterministic; not a vendor tokenizer.
pub fn estimate_tokens(text: &str) -> usize {
    tokens_for_words(text.split_whitespace().count())
}

fn tokens_for_words(words: usize) -> usize {
    (words as f64 * 1.3).ceil() as usize
}

/// Unify line endings and collapse runs of blank lines to one.
pub fn normalize(text: &str) -> String {
    let unified = text.replace("\r\n", "\n").replace('\r', "\n");
    let mut out = String::with_capacity(unified.len());
    let mut newlines = 0;
    for c in unified.chars() {
        if c == '\n' {
            newlines += 1;
            if newlines <= 2 {
                out.push(c);
            }
        } else {
            newlines = 0;
            out.push(c);
        }
    }
    out.trim().to_string()
}

fn paragraphs(text: &str) -> impl Iterator<Item = &str> {
    text.split("\n\n").map(str::trim).filter(|p| !p.is_empty())
}

/// Split after runs of `.`, `!`, or `?` that are followed by whitespace.
fn sentences(paragraph: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut after_terminal = false;
    for (i, c) in paragraph.char_indices() {
        if matches!(c, '.' | '!' | '?') {
            after_terminal = true;
        } else if c.is_whitespace() && after_terminal {
            let sentence = paragraph[start..i].trim();
            if !sentence.is_empty() {
                out.push(sentence);
            }
            start = i;
            after_terminal = false;
        } else {
            after_terminal = false;
        }
    }
    let rest = paragraph[start..].trim();
    if !rest.is_empty() {
        out.push(rest);
    }
    out
}

fn tail_words(text: &str, n: usize) -> Vec<&str> {
    let words: Vec<&str> = text.split_whitespace().collect();
    words[words.len().saturating_sub(n)..].to_vec()
}

fn split_sentences(paragraph: &str, budget: usize, out: &mut Vec<TextChunk>) {
    let mut current = String::new();
    for sentence in sentences(paragraph) {
        let combined = if current.is_empty() {
            sentence.to_string()
        } else {
            format!("{} {}", current, sentence)
        };
        if estimate_tokens(&combined) > budget && !current.is_empty() {
            out.push(TextChunk {
                text: std::mem::take(&mut current),
                overlap_words: 0,
            });
            current = sentence.to_string();
        } else {
            current = combined;
        }
    }
    if !current.is_empty() {
        out.push(TextChunk {
            text: current,
            overlap_words: 0,
        });
    }
}

/// Chunk already-normalized text.
pub fn split_text(text: &str, config: &ChunkingConfig) -> Vec<TextChunk> {
    let budget = config.chunk_tokens;
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_overlap = 0;

    for para in paragraphs(text) {
        if estimate_tokens(para) > budget {
            if !current.is_empty() {
                chunks.push(TextChunk {
                    text: std::mem::take(&mut current),
                    overlap_words: current_overlap,
                });
                current_overlap = 0;
            }
            split_sentences(para, budget, &mut chunks);
            continue;
        }

        if current.is_empty() {
            current.push_str(para);
            continue;
        }

        let combined_words =
            current.split_whitespace().count() + para.split_whitespace().count();
        if tokens_for_words(combined_words) > budget {
            let overlap = tail_words(&current, config.overlap_words);
            let next = if overlap.is_empty() {
                para.to_string()
            } else {
                format!("{}\n\n{}", overlap.join(" "), para)
            };
            let overlap_count = overlap.len();
            chunks.push(TextChunk {
                text: std::mem::replace(&mut current, next),
                overlap_words: current_overlap,
            });
            current_overlap = overlap_count;
        } else {
            current.push_str("\n\n");
            current.push_str(para);
        }
    }

    if !current.is_empty() {
        chunks.push(TextChunk {
            text: current,
            overlap_words: current_overlap,
        });
    }
    chunks
}

pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Normalize, chunk, and wrap as [`KnowledgeChunk`]s with contiguous
/// indices from 0.
pub fn chunk_file(
    file_id: &str,
    filename: &str,
    text: &str,
    config: &ChunkingConfig,
) -> Vec<KnowledgeChunk> {
    split_text(&normalize(text), config)
        .into_iter()
        .enumerate()
        .map(|(i, c)| {
            let hash = content_hash(&c.text);
            KnowledgeChunk::new(
                file_id,
                i as i64,
                c.text,
                json!({
                    "filename": filename,
                    "overlap_words": c.overlap_words,
                    "hash": hash,
                }),
            )
        })
        .collect()
}
