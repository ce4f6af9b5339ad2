use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Position of the chunk within its document, starting at 0
    pub id: usize,
    pub doc_id: String,
    pub text: String,
    /// Byte offset of `text` in the extracted document text
    pub offset: usize,
}

impl Chunk {
    pub fn new(id: usize, doc_id: String, text: String, offset: usize) -> Self {
        Self {
            id,
            doc_id,
            text,
            offset,
        }
    }

    /// Byte offset one past the last byte of the chunk
    pub fn end(&self) -> usize {
        self.offset + self.text.len()
    }

    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }

    /// Whitespace-only chunks carry nothing worth extracting
    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// Rebuild the source text from ordered chunks by dropping each chunk's
/// overlap with its predecessor.
pub fn stitch(chunks: &[Chunk]) -> String {
    let mut out = String::new();
    let mut covered = 0;

    for chunk in chunks {
        if chunk.end() <= covered {
            continue;
        }
        let skip = covered.saturating_sub(chunk.offset);
        out.push_str(&chunk.text[skip..]);
        covered = chunk.end();
    }

    out
}
