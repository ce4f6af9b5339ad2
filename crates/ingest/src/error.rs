use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("unsupported file format: {0}")]
    UnsupportedFormat(String),

    #[error("corrupt {file_type} file: {reason}")]
    CorruptFile { file_type: String, reason: String },

    #[error("invalid chunking: max_size {max_size} must be positive and overlap {overlap} smaller than it")]
    InvalidChunking { max_size: usize, overlap: usize },
}

impl IngestError {
    pub(crate) fn corrupt(file_type: &str, reason: impl ToString) -> Self {
        Self::CorruptFile {
            file_type: file_type.to_string(),
            reason: reason.to_string(),
        }
    }
}
