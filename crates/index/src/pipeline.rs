use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use extract::{
    CompletionModel, EntityNormalizer, ExtractedChunk, Extractor, MergeConfig, RelationshipPattern,
    Schema, SchemaRegistry, Triple,
};
use ingest::{Chunker, ChunkerConfig, IngestError, PreparedDocument};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::cypher;
use crate::store::{GraphStore, Row, Statement, StoreError};
use crate::writer::{ChunkFailure, CommitError, CommitResult, GraphWriter};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("document rejected: {0}")]
    Input(#[from] IngestError),

    #[error("invalid chunking: overlap {overlap} must be smaller than max size {max_size}")]
    InvalidChunking { max_size: usize, overlap: usize },

    #[error("ingestion of document {doc_id} was cancelled; nothing was committed")]
    Cancelled { doc_id: String },

    #[error("no pending relationships for document {0}")]
    NoPendingRelationships(String),

    #[error("a pinned schema needs at least one relationship pattern")]
    EmptySchema,

    #[error(transparent)]
    Commit(#[from] CommitError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub max_concurrent_extractions: usize,
    pub write_timeout: Duration,
    pub read_timeout: Duration,
    /// Upper bound on rows returned by graph export
    pub export_limit: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_extractions: 4,
            write_timeout: Duration::from_secs(60),
            read_timeout: Duration::from_secs(30),
            export_limit: 10_000,
        }
    }
}

/// Extraction output held back for review before commit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagedDocument {
    pub doc_id: String,
    pub chunk_count: usize,
    pub triples: Vec<Triple>,
    pub triples_dropped: usize,
    pub failed_chunks: Vec<ChunkFailure>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    pub key: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    pub aliases: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphEdge {
    pub from_key: String,
    pub from_type: String,
    pub relation: String,
    pub to_key: String,
    pub to_type: String,
    pub evidence: Vec<String>,
    pub documents: Vec<String>,
}

/// Nodes and edges for visualization
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphExport {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphStats {
    pub entity_count: usize,
    pub relationship_count: usize,
    pub pending_documents: usize,
}

struct Extraction {
    triples: Vec<Triple>,
    dropped: usize,
    failed_chunks: Vec<ChunkFailure>,
}

/// Chunk, extract, merge and commit documents into the graph
pub struct Pipeline {
    chunker: Chunker,
    extractor: Arc<Extractor>,
    normalizer: EntityNormalizer,
    writer: GraphWriter,
    store: Arc<dyn GraphStore>,
    pending: DashMap<String, StagedDocument>,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn GraphStore>,
        model: Arc<dyn CompletionModel>,
        registry: Arc<SchemaRegistry>,
        merge: &MergeConfig,
        chunking: ChunkerConfig,
        config: PipelineConfig,
    ) -> Result<Self, PipelineError> {
        let chunker = Chunker::new(chunking).map_err(|_| PipelineError::InvalidChunking {
            max_size: chunking.max_size,
            overlap: chunking.overlap,
        })?;

        Ok(Self {
            chunker,
            extractor: Arc::new(Extractor::new(model, registry)),
            normalizer: EntityNormalizer::new(merge),
            writer: GraphWriter::new(Arc::clone(&store), config.write_timeout),
            store,
            pending: DashMap::new(),
            config,
        })
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        self.extractor.registry()
    }

    /// Extract a document and commit it in one go
    pub async fn ingest_document(
        &self,
        bytes: &[u8],
        file_type: &str,
        cancel: &CancellationToken,
    ) -> Result<CommitResult, PipelineError> {
        let document = ingest::prepare_document(bytes, file_type, &self.chunker)?;
        let extraction = self.extract_all(&document, cancel).await?;

        self.commit_triples(
            &document.doc_id,
            &extraction.triples,
            extraction.dropped,
            extraction.failed_chunks,
        )
        .await
    }

    /// Extract a document and hold the triples for review instead of committing
    pub async fn stage_document(
        &self,
        bytes: &[u8],
        file_type: &str,
        cancel: &CancellationToken,
    ) -> Result<StagedDocument, PipelineError> {
        let document = ingest::prepare_document(bytes, file_type, &self.chunker)?;
        let extraction = self.extract_all(&document, cancel).await?;

        let staged = StagedDocument {
            doc_id: document.doc_id.clone(),
            chunk_count: document.chunks.len(),
            triples: extraction.triples,
            triples_dropped: extraction.dropped,
            failed_chunks: extraction.failed_chunks,
        };

        tracing::info!(
            doc_id = %staged.doc_id,
            triples = staged.triples.len(),
            "Document staged for review"
        );

        self.pending.insert(staged.doc_id.clone(), staged.clone());
        Ok(staged)
    }

    pub fn list_pending_relationships(&self, doc_id: &str) -> Result<Vec<Triple>, PipelineError> {
        self.pending
            .get(doc_id)
            .map(|staged| staged.triples.clone())
            .ok_or_else(|| PipelineError::NoPendingRelationships(doc_id.to_string()))
    }

    /// Type-level view of the pending triples, for pinning a fixed schema
    pub fn relationship_patterns(&self, doc_id: &str) -> Result<Vec<RelationshipPattern>, PipelineError> {
        let triples = self.list_pending_relationships(doc_id)?;
        Ok(extract::patterns(&triples))
    }

    /// Drop a staged document without committing anything
    pub fn discard_pending(&self, doc_id: &str) -> Result<(), PipelineError> {
        self.pending
            .remove(doc_id)
            .map(|_| tracing::info!(doc_id = %doc_id, "Staged document discarded"))
            .ok_or_else(|| PipelineError::NoPendingRelationships(doc_id.to_string()))
    }

    /// Fix the schema to the types named by `patterns`. Later extractions
    /// drop anything outside it until the schema is reset.
    pub fn pin_schema(&self, patterns: &[RelationshipPattern]) -> Result<Schema, PipelineError> {
        let registry = self.registry();
        let schema = Schema::from_patterns(patterns, &registry.snapshot().irreflexive);
        if schema.relationship_types.is_empty() {
            return Err(PipelineError::EmptySchema);
        }

        registry.pin(schema);
        Ok(registry.snapshot())
    }

    /// Commit a reviewed (possibly edited) set of triples for a staged document
    pub async fn commit_edited(
        &self,
        doc_id: &str,
        triples: Vec<Triple>,
    ) -> Result<CommitResult, PipelineError> {
        let (staged_dropped, failed_chunks) = self
            .pending
            .get(doc_id)
            .map(|staged| (staged.triples_dropped, staged.failed_chunks.clone()))
            .ok_or_else(|| PipelineError::NoPendingRelationships(doc_id.to_string()))?;

        let registry = self.registry();
        let mut admitted = Vec::with_capacity(triples.len());
        let mut dropped = staged_dropped;

        for triple in triples {
            if triple.subject_name.trim().is_empty() || triple.object_name.trim().is_empty() {
                dropped += 1;
                continue;
            }
            match registry.admit(triple) {
                Ok(triple) => admitted.push(triple),
                Err(violation) => {
                    tracing::warn!(doc_id = %doc_id, %violation, "Dropping edited triple outside the schema");
                    dropped += 1;
                }
            }
        }

        let result = self
            .commit_triples(doc_id, &admitted, dropped, failed_chunks)
            .await?;
        self.pending.remove(doc_id);
        Ok(result)
    }

    /// Delete the whole graph and any staged documents. Learned schema types
    /// are forgotten too when `reset_schema` is set.
    pub async fn reset_graph(&self, reset_schema: bool) -> Result<(), PipelineError> {
        self.writer.clear().await?;
        self.pending.clear();
        if reset_schema {
            self.registry().reset();
        }
        Ok(())
    }

    pub async fn export_graph(&self) -> Result<GraphExport, PipelineError> {
        let nodes = self
            .read(cypher::EXPORT_NODES, self.config.export_limit)
            .await?
            .into_iter()
            .map(|row| GraphNode {
                id: text(&row, "id"),
                key: text(&row, "key"),
                entity_type: text(&row, "type"),
                aliases: texts(&row, "aliases"),
            })
            .collect();

        let edges = self
            .read(cypher::EXPORT_EDGES, self.config.export_limit)
            .await?
            .into_iter()
            .map(|row| GraphEdge {
                from_key: text(&row, "from_key"),
                from_type: text(&row, "from_type"),
                relation: text(&row, "relation"),
                to_key: text(&row, "to_key"),
                to_type: text(&row, "to_type"),
                evidence: texts(&row, "evidence"),
                documents: texts(&row, "documents"),
            })
            .collect();

        Ok(GraphExport { nodes, edges })
    }

    pub async fn stats(&self) -> Result<GraphStats, PipelineError> {
        Ok(GraphStats {
            entity_count: self.count(cypher::COUNT_ENTITIES).await?,
            relationship_count: self.count(cypher::COUNT_RELATIONSHIPS).await?,
            pending_documents: self.pending.len(),
        })
    }

    /// Registry types merged with the labels and relationship types the
    /// store actually holds
    pub async fn schema(&self) -> Result<Schema, PipelineError> {
        let mut schema = self.registry().snapshot();

        let labels: Vec<String> = self
            .read(cypher::LABELS, self.config.export_limit)
            .await?
            .iter()
            .map(|row| text(row, "label"))
            .filter(|label| label != cypher::ENTITY_LABEL)
            .collect();
        let relationship_types: Vec<String> = self
            .read(cypher::RELATIONSHIP_TYPES, self.config.export_limit)
            .await?
            .iter()
            .map(|row| text(row, "relationshipType"))
            .collect();

        schema.merge(&Schema::new(labels, relationship_types, Vec::<String>::new()));
        Ok(schema)
    }

    async fn extract_all(
        &self,
        document: &PreparedDocument,
        cancel: &CancellationToken,
    ) -> Result<Extraction, PipelineError> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_extractions.max(1)));
        let mut tasks = JoinSet::new();
        let mut outstanding = BTreeSet::new();

        for chunk in document.chunks.iter().filter(|c| !c.is_blank()).cloned() {
            let extractor = Arc::clone(&self.extractor);
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            outstanding.insert(chunk.id);

            tasks.spawn(async move {
                let _permit = tokio::select! {
                    _ = cancel.cancelled() => return (chunk.id, None),
                    permit = semaphore.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return (chunk.id, None),
                    },
                };
                if cancel.is_cancelled() {
                    return (chunk.id, None);
                }

                // Snapshot per chunk so types registered by earlier chunks show up
                let schema = extractor.registry().snapshot();
                (chunk.id, Some(extractor.extract(&chunk, &schema).await))
            });
        }

        let mut extracted: Vec<ExtractedChunk> = Vec::new();
        let mut failed_chunks = Vec::new();

        while let Some(joined) = tasks.join_next().await {
            let Ok((chunk_id, outcome)) = joined else {
                continue;
            };
            outstanding.remove(&chunk_id);

            match outcome {
                Some(Ok(chunk)) => extracted.push(chunk),
                Some(Err(err)) => {
                    tracing::warn!(doc_id = %document.doc_id, chunk_id, error = %err, "Skipping chunk");
                    failed_chunks.push(ChunkFailure {
                        chunk_id,
                        reason: err.to_string(),
                    });
                }
                None => {}
            }
        }

        if cancel.is_cancelled() {
            tracing::warn!(doc_id = %document.doc_id, "Ingestion cancelled");
            return Err(PipelineError::Cancelled {
                doc_id: document.doc_id.clone(),
            });
        }

        // Tasks that never reported back panicked
        failed_chunks.extend(outstanding.into_iter().map(|chunk_id| ChunkFailure {
            chunk_id,
            reason: "extraction task aborted".to_string(),
        }));

        extracted.sort_by_key(|c| c.chunk_id);
        failed_chunks.sort_by_key(|f| f.chunk_id);

        let dropped = extracted.iter().map(|c| c.dropped).sum();
        let triples = extracted.into_iter().flat_map(|c| c.triples).collect();

        Ok(Extraction {
            triples,
            dropped,
            failed_chunks,
        })
    }

    async fn commit_triples(
        &self,
        doc_id: &str,
        triples: &[Triple],
        dropped: usize,
        failed_chunks: Vec<ChunkFailure>,
    ) -> Result<CommitResult, PipelineError> {
        let schema = self.registry().snapshot();
        let merged = self.normalizer.merge(triples, &schema);

        let mut result = self
            .writer
            .commit(doc_id, &merged.entities, &merged.relationships)
            .await?;
        result.triples_dropped = dropped + merged.dropped_self_loops;
        result.failed_chunks = failed_chunks;
        Ok(result)
    }

    async fn read(&self, text: &str, limit: usize) -> Result<Vec<Row>, StoreError> {
        self.store
            .run_read(Statement::new(text), limit, self.config.read_timeout)
            .await
    }

    async fn count(&self, text: &str) -> Result<usize, StoreError> {
        let rows = self.read(text, 1).await?;
        Ok(rows
            .first()
            .and_then(|row| row.get("count"))
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize)
    }
}

fn text(row: &Row, key: &str) -> String {
    match row.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

fn texts(row: &Row, key: &str) -> Vec<String> {
    row.get(key)
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default()
}
