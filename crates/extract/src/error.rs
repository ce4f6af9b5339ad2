use thiserror::Error;

use crate::schema::TypeKind;

/// Transport, status and decoding failures from the completion service
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ModelError {
    #[error("model request failed: {0}")]
    Request(String),

    #[error("model request timed out")]
    Timeout,

    #[error("model returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("could not decode model response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for ModelError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ModelError::Timeout
        } else if err.is_decode() {
            ModelError::Decode(err.to_string())
        } else {
            ModelError::Request(err.to_string())
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind} type '{type_name}' is not allowed by the schema")]
pub struct SchemaViolation {
    pub kind: TypeKind,
    pub type_name: String,
}

/// Chunk-level extraction failure; the pipeline skips the chunk
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("could not parse model output for chunk {chunk_id} of document {doc_id}: {reason}")]
    Parse {
        doc_id: String,
        chunk_id: usize,
        reason: String,
    },

    #[error("model call failed for chunk {chunk_id} of document {doc_id}: {source}")]
    Model {
        doc_id: String,
        chunk_id: usize,
        #[source]
        source: ModelError,
    },
}

impl ExtractError {
    pub fn chunk_id(&self) -> usize {
        match self {
            ExtractError::Parse { chunk_id, .. } | ExtractError::Model { chunk_id, .. } => *chunk_id,
        }
    }
}
