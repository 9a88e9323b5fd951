use chrono::Utc;
use sha2::{Digest, Sha256};

use crate::models::{Chunk, PipelineOptions};

#[derive(Debug, Clone, Copy)]
pub struct ChunkingConfig {
    pub size: usize,
    pub overlap: usize,
}

impl From<&PipelineOptions> for ChunkingConfig {
    fn from(value: &PipelineOptions) -> Self {
        Self {
            size: value.chunk_size,
            overlap: value.chunk_overlap,
        }
    }
}

/// Splits normalized text into overlapping windows. Window ends snap to a
/// sentence terminator inside the window, else the nearest preceding
/// whitespace, else a hard cut at `size`.
pub fn chunk_text(text: &str, config: ChunkingConfig) -> Vec<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() || config.size == 0 {
        return Vec::new();
    }

    let chars: Vec<char> = trimmed.chars().collect();
    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < chars.len() {
        let hard_end = (start + config.size).min(chars.len());
        let end = if hard_end < chars.len() {
            window_boundary(&chars, start, hard_end)
        } else {
            hard_end
        };

        chunks.push(chars[start..end].iter().collect::<String>());

        if end == chars.len() {
            break;
        }

        let step = end - start;
        start = end - config.overlap.min(step.saturating_sub(1));
    }

    chunks
}

fn window_boundary(chars: &[char], start: usize, hard_end: usize) -> usize {
    let mut index = hard_end;
    while index > start {
        let position = index - 1;
        if matches!(chars[position], '.' | '!' | '?') {
            let next_is_break = chars
                .get(index)
                .map(|next| next.is_whitespace())
                .unwrap_or(true);
            if next_is_break {
                return index;
            }
        }
        index -= 1;
    }

    let mut index = hard_end;
    while index > start + 1 {
        if chars[index - 1].is_whitespace() {
            return index;
        }
        index -= 1;
    }

    hard_end
}

pub fn build_chunks(document_id: &str, normalized: &str, config: ChunkingConfig) -> Vec<Chunk> {
    chunk_text(normalized, config)
        .into_iter()
        .enumerate()
        .map(|(index, content)| {
            let ordinal = index as u64;
            Chunk {
                chunk_id: make_chunk_id(document_id, ordinal, &content),
                document_id: document_id.to_string(),
                ordinal,
                content,
                embedding: None,
                tags: Vec::new(),
                created_at: Utc::now(),
            }
        })
        .collect()
}

fn make_chunk_id(document_id: &str, ordinal: u64, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document_id.as_bytes());
    hasher.update(ordinal.to_le_bytes());
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(size: usize, overlap: usize) -> ChunkingConfig {
        ChunkingConfig { size, overlap }
    }

    fn reassemble(chunks: &[String], overlap: usize) -> String {
        let mut result = String::new();
        for (index, chunk) in chunks.iter().enumerate() {
            if index == 0 {
                result.push_str(chunk);
                continue;
            }
            let previous_len = chunks[index - 1].chars().count();
            let skip = overlap.min(previous_len.saturating_sub(1));
            result.extend(chunk.chars().skip(skip));
        }
        result
    }

    #[test]
    fn chunking_is_deterministic() {
        let text = "The pump failed under load. Pressure exceeded the rated limit. \
                    Replace the seal and retest the assembly before returning to service.";
        let first = chunk_text(text, config(40, 8));
        let second = chunk_text(text, config(40, 8));
        assert_eq!(first, second);
    }

    #[test]
    fn empty_and_whitespace_input_yield_no_chunks() {
        assert!(chunk_text("", config(100, 10)).is_empty());
        assert!(chunk_text("   \t  \n ", config(100, 10)).is_empty());
    }

    #[test]
    fn chunks_respect_size_bound() {
        let text = "word ".repeat(200);
        for chunk in chunk_text(&text, config(50, 10)) {
            assert!(chunk.chars().count() <= 50);
        }
    }

    #[test]
    fn sentence_scenario_produces_boundary_aligned_chunks() {
        let chunks = chunk_text("Sentence one. Sentence two. Sentence three.", config(20, 5));

        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 20);
        }
        let boundary_aligned = chunks
            .iter()
            .filter(|chunk| {
                let last = chunk.trim_end().chars().last();
                matches!(last, Some('.') | Some('!') | Some('?'))
            })
            .count();
        assert!(boundary_aligned >= chunks.len() - 1);
    }

    #[test]
    fn deoverlapped_chunks_reproduce_the_source() {
        let text = "Inspect the housing for cracks. Torque the bolts to spec. \
                    Log the serial number, operating hours, and ambient temperature. \
                    A pump that fails the pressure hold test must be quarantined.";
        let overlap = 12;
        let chunks = chunk_text(text, config(48, overlap));
        assert_eq!(reassemble(&chunks, overlap), text.trim());
    }

    #[test]
    fn unbroken_token_is_hard_cut() {
        let text = "x".repeat(300);
        let chunks = chunk_text(&text, config(100, 0));
        assert_eq!(chunks.len(), 3);
        for chunk in &chunks {
            assert_eq!(chunk.chars().count(), 100);
        }
        assert_eq!(reassemble(&chunks, 0), text);
    }

    #[test]
    fn built_chunks_have_contiguous_ordinals_and_distinct_ids() {
        let text = "First sentence here. Second sentence follows. Third one closes.";
        let chunks = build_chunks("doc-1", text, config(30, 5));

        for (index, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.ordinal, index as u64);
            assert_eq!(chunk.document_id, "doc-1");
        }

        let mut ids: Vec<_> = chunks.iter().map(|chunk| chunk.chunk_id.clone()).collect();
        ids.dedup();
        assert_eq!(ids.len(), chunks.len());
    }
}
