use std::sync::Arc;
use std::time::Duration;

use extract::{Entity, Relationship};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::OnceCell;

use crate::cypher;
use crate::store::{GraphStore, Statement, StoreError};

#[derive(Debug, Error)]
pub enum CommitError {
    #[error("commit of document {doc_id} failed and was rolled back: {reason}")]
    CommitFailed { doc_id: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkFailure {
    pub chunk_id: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitResult {
    pub document_id: String,
    pub entities_upserted: usize,
    pub relationships_upserted: usize,
    pub triples_dropped: usize,
    pub failed_chunks: Vec<ChunkFailure>,
}

/// Persists canonical entities and relationships, one transaction per document
pub struct GraphWriter {
    store: Arc<dyn GraphStore>,
    timeout: Duration,
    constraints: OnceCell<()>,
}

impl GraphWriter {
    pub fn new(store: Arc<dyn GraphStore>, timeout: Duration) -> Self {
        Self {
            store,
            timeout,
            constraints: OnceCell::new(),
        }
    }

    /// Upsert the batch in a single transaction. Safe to re-run: every node
    /// and edge is merged on its identity key.
    pub async fn commit(
        &self,
        doc_id: &str,
        entities: &[Entity],
        relationships: &[Relationship],
    ) -> Result<CommitResult, CommitError> {
        let failed = |err: StoreError| CommitError::CommitFailed {
            doc_id: doc_id.to_string(),
            reason: err.message(),
        };

        self.ensure_constraints().await.map_err(failed)?;

        // Nodes first so the edge MATCHes find them
        let batch: Vec<Statement> = entities
            .iter()
            .map(cypher::upsert_entity)
            .chain(relationships.iter().map(|r| cypher::upsert_relationship(doc_id, r)))
            .collect();

        if batch.is_empty() {
            tracing::info!(doc_id = %doc_id, "Nothing to commit");
            return Ok(CommitResult {
                document_id: doc_id.to_string(),
                ..Default::default()
            });
        }

        if let Err(err) = self.store.run_write(batch, self.timeout).await {
            tracing::warn!(doc_id = %doc_id, error = %err, "Commit rolled back");
            return Err(failed(err));
        }

        tracing::info!(
            doc_id = %doc_id,
            entities = entities.len(),
            relationships = relationships.len(),
            "Document committed"
        );

        Ok(CommitResult {
            document_id: doc_id.to_string(),
            entities_upserted: entities.len(),
            relationships_upserted: relationships.len(),
            triples_dropped: 0,
            failed_chunks: Vec::new(),
        })
    }

    /// Delete every node and edge
    pub async fn clear(&self) -> Result<(), StoreError> {
        self.store
            .run_write(vec![Statement::new(cypher::CLEAR_GRAPH)], self.timeout)
            .await?;
        tracing::info!("Graph cleared");
        Ok(())
    }

    // Schema changes cannot share a transaction with data writes
    async fn ensure_constraints(&self) -> Result<(), StoreError> {
        self.constraints
            .get_or_try_init(|| async {
                for text in cypher::CONSTRAINTS {
                    self.store
                        .run_write(vec![Statement::new(*text)], self.timeout)
                        .await?;
                }
                tracing::debug!("Graph constraints ensured");
                Ok::<(), StoreError>(())
            })
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MemoryGraphStore;
    use extract::EntityRef;
    use std::collections::{BTreeMap, BTreeSet};

    fn org(name: &str) -> Entity {
        Entity::new(name, "Organization")
    }

    fn acquired(chunk: usize) -> Relationship {
        Relationship {
            from: org("NVIDIA").reference(),
            to: EntityRef {
                key: "mellanox".to_string(),
                entity_type: "Organization".to_string(),
            },
            relation_type: "ACQUIRED".to_string(),
            evidence: BTreeSet::from([chunk]),
            properties: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_commit_is_idempotent() {
        let store = Arc::new(MemoryGraphStore::new());
        let writer = GraphWriter::new(store.clone(), Duration::from_secs(5));
        let entities = [org("NVIDIA"), org("Mellanox")];

        writer.commit("doc", &entities, &[acquired(0)]).await.unwrap();
        let result = writer.commit("doc", &entities, &[acquired(1)]).await.unwrap();

        assert_eq!(result.relationships_upserted, 1);
        assert_eq!(store.node_count(), 2);
        assert_eq!(store.relationship_count(), 1);
        assert_eq!(store.relationships()[0].evidence, vec!["doc#0", "doc#1"]);
        assert_eq!(store.constraint_runs(), cypher::CONSTRAINTS.len());
    }

    #[tokio::test]
    async fn test_failed_commit_leaves_graph_untouched() {
        let store = Arc::new(MemoryGraphStore::new());
        let writer = GraphWriter::new(store.clone(), Duration::from_secs(5));
        writer.commit("first", &[org("NVIDIA")], &[]).await.unwrap();

        store.fail_next_write("connection reset");
        let err = writer
            .commit("second", &[org("Mellanox")], &[])
            .await
            .unwrap_err();

        let CommitError::CommitFailed { doc_id, reason } = err;
        assert_eq!(doc_id, "second");
        assert!(reason.contains("connection reset"));
        assert_eq!(store.node_count(), 1);
    }
}
