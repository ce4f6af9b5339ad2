pub mod cypher;
pub mod mock;
pub mod neo4j_index;
pub mod pipeline;
pub mod store;
pub mod writer;

pub use mock::MemoryGraphStore;
pub use neo4j_index::Neo4jStore;
pub use pipeline::{
    GraphEdge, GraphExport, GraphNode, GraphStats, Pipeline, PipelineConfig, PipelineError,
    StagedDocument,
};
pub use store::{GraphStore, Row, Statement, StoreError};
pub use writer::{ChunkFailure, CommitError, CommitResult, GraphWriter};
