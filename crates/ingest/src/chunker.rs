use std::ops::Range;

use unicode_segmentation::UnicodeSegmentation;

use crate::chunk::Chunk;
use crate::error::IngestError;

/// Sizes are measured in characters, not bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkerConfig {
    pub max_size: usize,
    pub overlap: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            max_size: 2000,
            overlap: 200,
        }
    }
}

impl ChunkerConfig {
    pub fn validate(&self) -> Result<(), IngestError> {
        if self.max_size == 0 || self.overlap >= self.max_size {
            return Err(IngestError::InvalidChunking {
                max_size: self.max_size,
                overlap: self.overlap,
            });
        }
        Ok(())
    }
}

pub struct Chunker {
    config: ChunkerConfig,
}

impl Chunker {
    pub fn new(config: ChunkerConfig) -> Result<Self, IngestError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> ChunkerConfig {
        self.config
    }

    /// Split `text` into ordered chunks of at most `max_size` characters.
    ///
    /// Units are paragraphs, then sentences for paragraphs that are too long,
    /// then hard character cuts for sentences that are still too long. Units
    /// are packed greedily and every chunk after the first starts with up to
    /// `overlap` characters from the end of the previous one. Chunks are
    /// contiguous slices of `text`, so every character lands in at least one.
    pub fn chunk_text(&self, doc_id: &str, text: &str) -> Vec<Chunk> {
        let max = self.config.max_size;
        let mut chunks = Vec::new();

        let mut start = 0;
        let mut end = 0;

        for unit in self.split_units(text) {
            let unit_chars = char_len(&text[unit.clone()]);

            // If adding this unit exceeds max, flush the buffer
            if end > start && char_len(&text[start..unit.end]) > max {
                chunks.push(Chunk::new(
                    chunks.len(),
                    doc_id.to_string(),
                    text[start..end].to_string(),
                    start,
                ));

                // Start the next chunk with overlap
                start = self.overlap_start(text, start..end, unit_chars);
            }

            end = unit.end;
        }

        if end > start {
            chunks.push(Chunk::new(
                chunks.len(),
                doc_id.to_string(),
                text[start..end].to_string(),
                start,
            ));
        }

        chunks
    }

    /// Byte ranges covering `text` end to end, none longer than `max_size` chars
    fn split_units(&self, text: &str) -> Vec<Range<usize>> {
        let max = self.config.max_size;
        let mut units = Vec::new();

        for para in split_by_paragraphs(text) {
            if char_len(&text[para.clone()]) <= max {
                units.push(para);
                continue;
            }

            for (idx, sentence) in text[para.clone()].split_sentence_bound_indices() {
                let sentence_start = para.start + idx;
                let sentence_range = sentence_start..sentence_start + sentence.len();

                if char_len(sentence) <= max {
                    units.push(sentence_range);
                } else {
                    units.extend(hard_cuts(text, sentence_range, max));
                }
            }
        }

        units
    }

    /// Where the chunk after `prev` begins. The overlap never swallows the
    /// whole previous chunk and leaves room for the next unit.
    fn overlap_start(&self, text: &str, prev: Range<usize>, next_unit_chars: usize) -> usize {
        let prev_text = &text[prev.clone()];
        let budget = self
            .config
            .overlap
            .min(self.config.max_size - next_unit_chars)
            .min(char_len(prev_text).saturating_sub(1));

        if budget == 0 {
            return prev.end;
        }

        prev_text
            .char_indices()
            .rev()
            .nth(budget - 1)
            .map(|(idx, _)| prev.start + idx)
            .unwrap_or(prev.end)
    }
}

/// Paragraphs keep their trailing blank-line run so ranges stay contiguous
fn split_by_paragraphs(text: &str) -> Vec<Range<usize>> {
    let mut ranges = Vec::new();
    let mut start = 0;
    let mut search = 0;

    while let Some(found) = text[search..].find("\n\n") {
        let mut end = search + found + 2;
        while text[end..].starts_with('\n') {
            end += 1;
        }
        ranges.push(start..end);
        start = end;
        search = end;
    }

    if start < text.len() {
        ranges.push(start..text.len());
    }

    ranges
}

fn hard_cuts(text: &str, range: Range<usize>, max: usize) -> Vec<Range<usize>> {
    let mut cuts = Vec::new();
    let mut cut_start = range.start;

    for (count, (idx, _)) in text[range.clone()].char_indices().enumerate() {
        if count > 0 && count % max == 0 {
            let at = range.start + idx;
            cuts.push(cut_start..at);
            cut_start = at;
        }
    }
    cuts.push(cut_start..range.end);

    cuts
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::stitch;

    fn chunker(max_size: usize, overlap: usize) -> Chunker {
        Chunker::new(ChunkerConfig { max_size, overlap }).unwrap()
    }

    #[test]
    fn test_basic_chunking() {
        let text = "This is a test paragraph.\n\nThis is another paragraph.";
        let chunks = chunker(2000, 200).chunk_text("test-doc", text);

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].doc_id, "test-doc");
        assert_eq!(chunks[0].text, text);
    }

    #[test]
    fn test_rejects_bad_config() {
        assert!(Chunker::new(ChunkerConfig { max_size: 0, overlap: 0 }).is_err());
        assert!(Chunker::new(ChunkerConfig { max_size: 10, overlap: 10 }).is_err());
        assert!(Chunker::new(ChunkerConfig { max_size: 10, overlap: 9 }).is_ok());
    }

    #[test]
    fn test_empty_text_has_no_chunks() {
        assert!(chunker(10, 2).chunk_text("d", "").is_empty());
    }

    #[test]
    fn test_splits_on_paragraphs_first() {
        let text = "First paragraph here.\n\nSecond paragraph here.";
        let chunks = chunker(25, 0).chunk_text("d", text);

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].text, "First paragraph here.\n\n");
        assert_eq!(chunks[1].text, "Second paragraph here.");
        assert_eq!(chunks[1].offset, 23);
    }

    #[test]
    fn test_falls_back_to_sentences() {
        let text = "One short sentence. Another short one. A third one here.";
        let chunks = chunker(25, 0).chunk_text("d", text);

        assert!(chunks.len() >= 3);
        assert!(chunks.iter().all(|c| c.char_len() <= 25));
        assert!(chunks[0].text.starts_with("One short sentence."));
    }

    #[test]
    fn test_hard_cuts_long_words() {
        let text = "a".repeat(95);
        let chunks = chunker(10, 0).chunk_text("d", &text);

        assert_eq!(chunks.len(), 10);
        assert!(chunks.iter().all(|c| c.char_len() <= 10));
        assert_eq!(stitch(&chunks), text);
    }

    #[test]
    fn test_overlap_repeats_tail() {
        let text = "alpha beta gamma.\n\ndelta epsilon zeta.";
        let chunks = chunker(24, 5).chunk_text("d", text);

        assert_eq!(chunks.len(), 2);
        let tail: String = chunks[0].text.chars().rev().take(5).collect::<Vec<_>>().into_iter().rev().collect();
        assert!(chunks[1].text.starts_with(&tail));
        assert!(chunks[1].offset < chunks[0].end());
    }

    #[test]
    fn test_stitch_reconstructs_text() {
        let text = "NVIDIA acquired Mellanox in 2020. The deal closed in April.\n\n\
                    Mellanox makes networking gear. Über-fast interconnects — naïve café.\n\n\n\
                    Genesis Bank was founded by Alex Thompson.";

        for (max, overlap) in [(8, 0), (8, 7), (16, 4), (40, 10), (500, 20)] {
            let chunks = chunker(max, overlap).chunk_text("d", text);
            assert!(chunks.iter().all(|c| c.char_len() <= max), "max {max}");
            assert_eq!(stitch(&chunks), text, "max {max} overlap {overlap}");

            for pair in chunks.windows(2) {
                assert!(pair[1].offset > pair[0].offset);
                assert!(pair[1].offset <= pair[0].end());
            }
        }
    }

    #[test]
    fn test_chunk_ids_follow_order() {
        let text = "a. b. c. d. e. f. g. h.";
        let chunks = chunker(6, 1).chunk_text("d", text);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.id, i);
        }
    }
}
