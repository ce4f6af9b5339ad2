use extract::ModelError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueryError {
    /// No usable read query could be produced for the question
    #[error("could not translate \"{question}\" into a graph query: {reason}")]
    Translation { question: String, reason: String },

    /// The store rejected the generated query, after the one correction attempt
    #[error("query for \"{question}\" failed: {message} (query: {query})")]
    Execution {
        question: String,
        query: String,
        message: String,
    },

    #[error("model call failed while answering \"{question}\": {source}")]
    Model {
        question: String,
        #[source]
        source: ModelError,
    },
}

impl QueryError {
    pub fn question(&self) -> &str {
        match self {
            QueryError::Translation { question, .. }
            | QueryError::Execution { question, .. }
            | QueryError::Model { question, .. } => question,
        }
    }
}
