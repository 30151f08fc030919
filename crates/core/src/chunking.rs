use crate::error::IngestError;
use crate::extractor::PageText;
use crate::models::{ChunkRecord, IngestionOptions};
use std::collections::VecDeque;

/// Boundary preference, strongest first. Text containing none of them is
/// cut into single characters.
pub const DEFAULT_SEPARATORS: [&str; 4] = ["\n\n", "\n", ". ", " "];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl ChunkingConfig {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Result<Self, IngestError> {
        if chunk_size == 0 {
            return Err(IngestError::InvalidChunkConfig(
                "chunk_size must be greater than zero".to_string(),
            ));
        }
        if chunk_overlap >= chunk_size {
            return Err(IngestError::InvalidChunkConfig(format!(
                "chunk_overlap {chunk_overlap} must be smaller than chunk_size {chunk_size}"
            )));
        }
        Ok(Self {
            chunk_size,
            chunk_overlap,
        })
    }
}

impl TryFrom<&IngestionOptions> for ChunkingConfig {
    type Error = IngestError;

    fn try_from(value: &IngestionOptions) -> Result<Self, Self::Error> {
        Self::new(value.chunk_size, value.chunk_overlap)
    }
}

/// Splits every page independently and numbers the emitted chunks with a
/// single document-wide position counter.
pub fn chunk_pages(pages: &[PageText], config: ChunkingConfig) -> Vec<ChunkRecord> {
    let mut records = Vec::new();
    let mut position = 0u64;

    for page in pages {
        if page.text.trim().is_empty() {
            continue;
        }

        for text in split_text(&page.text, config) {
            records.push(ChunkRecord {
                text,
                page: page.number,
                position,
            });
            position += 1;
        }
    }

    records
}

/// Splits one string into trimmed, non-empty pieces of at most
/// `chunk_size` characters.
pub fn split_text(text: &str, config: ChunkingConfig) -> Vec<String> {
    split_recursive(text, &DEFAULT_SEPARATORS, config)
}

fn split_recursive(text: &str, separators: &[&str], config: ChunkingConfig) -> Vec<String> {
    let (pieces, remaining): (Vec<&str>, &[&str]) = match pick_separator(text, separators) {
        Some((separator, remaining)) => (split_keeping_separator(text, separator), remaining),
        None => (split_chars(text), &[]),
    };

    let mut chunks = Vec::new();
    let mut fitting: Vec<&str> = Vec::new();

    for piece in pieces {
        if char_len(piece) <= config.chunk_size {
            fitting.push(piece);
            continue;
        }

        if !fitting.is_empty() {
            chunks.extend(merge_pieces(&fitting, config));
            fitting.clear();
        }

        chunks.extend(split_recursive(piece, remaining, config));
    }

    if !fitting.is_empty() {
        chunks.extend(merge_pieces(&fitting, config));
    }

    chunks
}

fn pick_separator<'s>(
    text: &str,
    separators: &'s [&'s str],
) -> Option<(&'s str, &'s [&'s str])> {
    let index = separators
        .iter()
        .position(|separator| text.contains(separator))?;
    Some((separators[index], &separators[index + 1..]))
}

/// Keeps each separator attached to the end of the piece it terminates so
/// sentence punctuation stays with its sentence.
fn split_keeping_separator<'t>(text: &'t str, separator: &str) -> Vec<&'t str> {
    text.split_inclusive(separator)
        .filter(|piece| !piece.is_empty())
        .collect()
}

fn split_chars(text: &str) -> Vec<&str> {
    text.char_indices()
        .map(|(start, ch)| &text[start..start + ch.len_utf8()])
        .collect()
}

fn merge_pieces(pieces: &[&str], config: ChunkingConfig) -> Vec<String> {
    let mut merged = Vec::new();
    let mut window: VecDeque<&str> = VecDeque::new();
    let mut window_len = 0usize;

    for &piece in pieces {
        let piece_len = char_len(piece);

        if window_len + piece_len > config.chunk_size && !window.is_empty() {
            push_trimmed(&mut merged, &window);

            while window_len > config.chunk_overlap
                || (window_len + piece_len > config.chunk_size && window_len > 0)
            {
                let Some(dropped) = window.pop_front() else {
                    break;
                };
                window_len -= char_len(dropped);
            }
        }

        window.push_back(piece);
        window_len += piece_len;
    }

    push_trimmed(&mut merged, &window);
    merged
}

fn push_trimmed(target: &mut Vec<String>, window: &VecDeque<&str>) {
    let joined = window.iter().copied().collect::<String>();
    let trimmed = joined.trim();
    if !trimmed.is_empty() {
        target.push(trimmed.to_string());
    }
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}
