pub mod chunk;
pub mod chunker;
pub mod error;
pub mod reader;

pub use chunk::{Chunk, stitch};
pub use chunker::{Chunker, ChunkerConfig};
pub use error::IngestError;
pub use reader::{FileReader, FileType};

use sha2::{Digest, Sha256};

/// Generate a stable document ID from file content
pub fn generate_doc_id(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let result = hasher.finalize();
    hex::encode(&result[..16])
}

/// A document reduced to text and split into chunks, ready for extraction
#[derive(Debug, Clone)]
pub struct PreparedDocument {
    pub doc_id: String,
    pub file_type: FileType,
    pub chunks: Vec<Chunk>,
}

/// Main ingestion entry: bytes in, ordered chunks out
pub fn prepare_document(
    bytes: &[u8],
    file_type: &str,
    chunker: &Chunker,
) -> Result<PreparedDocument, IngestError> {
    let file_type: FileType = file_type.parse()?;
    let text = FileReader::extract_text(bytes, file_type)?;
    let doc_id = generate_doc_id(bytes);
    let chunks = chunker.chunk_text(&doc_id, &text);

    tracing::info!(
        doc_id = %doc_id,
        file_type = file_type.as_str(),
        chars = text.chars().count(),
        chunks = chunks.len(),
        "Document prepared"
    );

    Ok(PreparedDocument {
        doc_id,
        file_type,
        chunks,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doc_id_is_stable() {
        let a = generate_doc_id(b"NVIDIA acquired Mellanox in 2020.");
        let b = generate_doc_id(b"NVIDIA acquired Mellanox in 2020.");
        let c = generate_doc_id(b"Something else.");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn test_prepare_document() {
        let chunker = Chunker::new(ChunkerConfig::default()).unwrap();
        let doc = prepare_document(b"NVIDIA acquired Mellanox in 2020.", "txt", &chunker).unwrap();
        assert_eq!(doc.chunks.len(), 1);
        assert_eq!(doc.chunks[0].doc_id, doc.doc_id);
        assert_eq!(doc.file_type, FileType::Txt);
    }

    #[test]
    fn test_prepare_rejects_unknown_type() {
        let chunker = Chunker::new(ChunkerConfig::default()).unwrap();
        let err = prepare_document(b"x", "exe", &chunker).unwrap_err();
        assert!(matches!(err, IngestError::UnsupportedFormat(_)));
    }

    #[test]
    fn test_chunk_serializes() {
        let chunk = Chunk::new(0, "doc".into(), "text".into(), 0);
        let json = serde_json::to_value(&chunk).unwrap();
        assert_eq!(json["doc_id"], "doc");
    }
}
