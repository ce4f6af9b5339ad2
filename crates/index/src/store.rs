use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

/// One result row, keyed by the names in the RETURN clause
pub type Row = Map<String, Value>;

/// A parameterized query statement
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub text: String,
    pub params: Map<String, Value>,
}

impl Statement {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            params: Map::new(),
        }
    }

    pub fn param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    /// The statement was rejected before execution; fixable by rewriting it
    #[error("query rejected by the graph store: {0}")]
    Syntax(String),

    #[error("graph store did not answer within {0:?}")]
    Timeout(Duration),

    #[error("graph store connection failed: {0}")]
    Connection(String),

    #[error("graph store error: {0}")]
    Other(String),
}

impl StoreError {
    pub fn is_syntax(&self) -> bool {
        matches!(self, StoreError::Syntax(_))
    }

    /// The raw message as reported by the store
    pub fn message(&self) -> String {
        match self {
            StoreError::Syntax(m) | StoreError::Connection(m) | StoreError::Other(m) => m.clone(),
            StoreError::Timeout(d) => format!("timed out after {d:?}"),
        }
    }
}

/// Query protocol of the external property-graph store
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Run the statements as one transaction: all of them apply or none do
    async fn run_write(&self, batch: Vec<Statement>, timeout: Duration) -> Result<(), StoreError>;

    /// Run a read statement, returning at most `row_limit` rows
    async fn run_read(
        &self,
        statement: Statement,
        row_limit: usize,
        timeout: Duration,
    ) -> Result<Vec<Row>, StoreError>;

    fn name(&self) -> &str;
}
