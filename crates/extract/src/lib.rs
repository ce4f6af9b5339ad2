pub mod error;
pub mod llm;
pub mod mock;
pub mod normalizer;
pub mod prompt;
pub mod registry;
pub mod schema;

pub use error::{ExtractError, ModelError, SchemaViolation};
pub use llm::{CompletionModel, OllamaClient, OpenAiClient, OutputFormat, strip_code_fences};
pub use normalizer::{EntityNormalizer, MergeConfig, Merged, SynonymPolicy};
pub use registry::{SchemaMode, SchemaRegistry};
pub use schema::{
    Entity, EntityRef, Relationship, RelationshipPattern, Schema, Triple, TypeKind, canonical_key,
    normalize_type, patterns,
};

use std::sync::Arc;

use ingest::Chunk;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Triples extracted from one chunk, already admitted by the schema registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedChunk {
    pub chunk_id: usize,
    pub doc_id: String,
    pub triples: Vec<Triple>,
    /// Triples discarded for blank names or schema violations
    pub dropped: usize,
}

pub struct Extractor {
    model: Arc<dyn CompletionModel>,
    registry: Arc<SchemaRegistry>,
}

impl Extractor {
    pub fn new(model: Arc<dyn CompletionModel>, registry: Arc<SchemaRegistry>) -> Self {
        Self { model, registry }
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    /// Extract candidate triples from a chunk.
    ///
    /// Unparseable output is retried once with a stricter prompt; model
    /// failures are returned as they are. Triples the schema does not allow
    /// are dropped and counted, never returned as errors.
    pub async fn extract(&self, chunk: &Chunk, schema: &Schema) -> Result<ExtractedChunk, ExtractError> {
        if chunk.is_blank() {
            return Ok(ExtractedChunk {
                chunk_id: chunk.id,
                doc_id: chunk.doc_id.clone(),
                triples: Vec::new(),
                dropped: 0,
            });
        }

        let prompt = prompt::build_extraction_prompt(&chunk.text, schema, self.registry.mode());
        tracing::debug!(doc_id = %chunk.doc_id, chunk_id = chunk.id, prompt = %prompt, "Extraction prompt");

        let raw = self.complete(chunk, &prompt).await?;
        let candidates = match parse_triples(&raw) {
            Ok(triples) => triples,
            Err(problem) => {
                tracing::warn!(
                    doc_id = %chunk.doc_id,
                    chunk_id = chunk.id,
                    problem = %problem,
                    "Model output unusable, retrying once"
                );
                let retry = prompt::build_retry_prompt(&chunk.text, &raw, &problem);
                let raw = self.complete(chunk, &retry).await?;
                parse_triples(&raw).map_err(|reason| ExtractError::Parse {
                    doc_id: chunk.doc_id.clone(),
                    chunk_id: chunk.id,
                    reason,
                })?
            }
        };

        let mut triples = Vec::with_capacity(candidates.len());
        let mut dropped = 0;

        for mut triple in candidates {
            triple.source_chunk_id = chunk.id;

            if triple.subject_name.trim().is_empty() || triple.object_name.trim().is_empty() {
                dropped += 1;
                continue;
            }

            match self.registry.admit(triple) {
                Ok(triple) => triples.push(triple),
                Err(violation) => {
                    tracing::warn!(
                        doc_id = %chunk.doc_id,
                        chunk_id = chunk.id,
                        %violation,
                        "Dropping triple outside the schema"
                    );
                    dropped += 1;
                }
            }
        }

        tracing::info!(
            doc_id = %chunk.doc_id,
            chunk_id = chunk.id,
            triples = triples.len(),
            dropped,
            "Chunk extracted"
        );

        Ok(ExtractedChunk {
            chunk_id: chunk.id,
            doc_id: chunk.doc_id.clone(),
            triples,
            dropped,
        })
    }

    async fn complete(&self, chunk: &Chunk, prompt: &str) -> Result<String, ExtractError> {
        self.model
            .complete(prompt, OutputFormat::Json)
            .await
            .map_err(|source| ExtractError::Model {
                doc_id: chunk.doc_id.clone(),
                chunk_id: chunk.id,
                source,
            })
    }
}

/// Parse model output into candidate triples.
///
/// Accepts a bare array, an object holding the array under `relationships` or
/// `triples`, or a single triple object, optionally wrapped in markdown fences.
/// Every item must carry the five fields; numbers and booleans are taken as
/// their text.
pub fn parse_triples(raw: &str) -> Result<Vec<Triple>, String> {
    let body = strip_code_fences(raw);
    if body.is_empty() {
        return Err("output is empty".to_string());
    }

    let value: Value = serde_json::from_str(body).map_err(|e| format!("output is not valid JSON: {e}"))?;

    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("relationships").or_else(|| map.remove("triples")) {
            Some(Value::Array(items)) => items,
            Some(other) => {
                return Err(format!("expected an array of relationships, found {}", json_kind(&other)));
            }
            None => vec![Value::Object(map)],
        },
        other => return Err(format!("expected an object or array, found {}", json_kind(&other))),
    };

    items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            let map = item
                .as_object()
                .ok_or_else(|| format!("item {i} is {}, not an object", json_kind(item)))?;
            Ok(Triple::new(
                field(map, i, "subject", "head")?,
                field(map, i, "subject_type", "head_type")?,
                field(map, i, "relation", "relation")?,
                field(map, i, "object", "tail")?,
                field(map, i, "object_type", "tail_type")?,
                0,
            ))
        })
        .collect()
}

fn field(map: &Map<String, Value>, index: usize, name: &str, alias: &str) -> Result<String, String> {
    match map.get(name).or_else(|| map.get(alias)) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(Value::Bool(b)) => Ok(b.to_string()),
        Some(other) => Err(format!("item {index} field '{name}' is {}", json_kind(other))),
        None => Err(format!("item {index} is missing '{name}'")),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::ScriptedModel;

    const ACQUISITION: &str = r#"{"relationships": [{"subject": "NVIDIA", "subject_type": "Organization",
        "relation": "ACQUIRED", "object": "Mellanox", "object_type": "Organization"}]}"#;

    fn chunk(text: &str) -> Chunk {
        Chunk::new(4, "doc-1".to_string(), text.to_string(), 0)
    }

    #[test]
    fn test_parse_accepted_shapes() {
        let fenced = "```json\n[{\"head\": \"Alex\", \"head_type\": \"Person\", \"relation\": \"FOUNDED\", \"tail\": \"Genesis Bank\", \"tail_type\": \"Organization\"}]\n```";
        assert_eq!(parse_triples(fenced).unwrap()[0].object_name, "Genesis Bank");

        assert_eq!(parse_triples(ACQUISITION).unwrap().len(), 1);
        assert!(parse_triples(r#"{"triples": []}"#).unwrap().is_empty());

        let single = r#"{"subject": "Revenue", "subject_type": "Metric", "relation": "WAS", "object": 2020, "object_type": "Year"}"#;
        assert_eq!(parse_triples(single).unwrap()[0].object_name, "2020");
    }

    #[test]
    fn test_parse_rejects_bad_shapes() {
        assert!(parse_triples("").is_err());
        assert!(parse_triples("I could not find anything").is_err());
        assert!(parse_triples(r#"{"relationships": "none"}"#).is_err());
        assert!(parse_triples(r#"[{"subject": "A", "relation": "KNOWS", "object": "B"}]"#).is_err());
        assert!(parse_triples("[1, 2]").is_err());
    }

    #[tokio::test]
    async fn test_extracts_acquisition() {
        let model = Arc::new(ScriptedModel::with_responses([ACQUISITION]));
        let extractor = Extractor::new(model.clone(), Arc::new(SchemaRegistry::open()));

        let out = extractor
            .extract(&chunk("NVIDIA acquired Mellanox in 2020."), &Schema::default())
            .await
            .unwrap();

        assert_eq!(out.triples.len(), 1);
        let triple = &out.triples[0];
        assert_eq!(triple.subject_name, "NVIDIA");
        assert_eq!(triple.relation, "ACQUIRED");
        assert_eq!(triple.object_type, "Organization");
        assert_eq!(triple.source_chunk_id, 4);
        assert_eq!(model.calls()[0].format, OutputFormat::Json);
        assert!(model.calls()[0].prompt.contains("NVIDIA acquired Mellanox"));
    }

    #[tokio::test]
    async fn test_retries_once_then_fails() {
        let model = Arc::new(ScriptedModel::with_responses(["not json", "still not json"]));
        let extractor = Extractor::new(model.clone(), Arc::new(SchemaRegistry::open()));

        let err = extractor
            .extract(&chunk("Some text."), &Schema::default())
            .await
            .unwrap_err();

        assert!(matches!(err, ExtractError::Parse { chunk_id: 4, .. }));
        assert_eq!(model.call_count(), 2);
        assert!(model.calls()[1].prompt.contains("not json"));
    }

    #[tokio::test]
    async fn test_retry_recovers() {
        let model = Arc::new(ScriptedModel::with_responses(["```\noops\n```", ACQUISITION]));
        let extractor = Extractor::new(model.clone(), Arc::new(SchemaRegistry::open()));

        let out = extractor
            .extract(&chunk("NVIDIA acquired Mellanox."), &Schema::default())
            .await
            .unwrap();
        assert_eq!(out.triples.len(), 1);
        assert_eq!(model.call_count(), 2);
    }

    #[tokio::test]
    async fn test_model_error_is_not_retried() {
        let model = Arc::new(ScriptedModel::new());
        model.push_error(ModelError::Timeout);
        let extractor = Extractor::new(model.clone(), Arc::new(SchemaRegistry::open()));

        let err = extractor
            .extract(&chunk("Some text."), &Schema::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::Model { source: ModelError::Timeout, .. }));
        assert_eq!(model.call_count(), 1);
    }

    #[tokio::test]
    async fn test_fixed_mode_drops_unknown_relation() {
        let schema = Schema::new(["Organization"], ["ACQUIRED"], Vec::<String>::new());
        let registry = Arc::new(SchemaRegistry::fixed(schema.clone()));
        let model = Arc::new(ScriptedModel::with_responses([r#"[
            {"subject": "NVIDIA", "subject_type": "Organization", "relation": "ACQUIRED", "object": "Mellanox", "object_type": "Organization"},
            {"subject": "NVIDIA", "subject_type": "Organization", "relation": "PARTNERED_WITH", "object": "Arm", "object_type": "Organization"},
            {"subject": " ", "subject_type": "Organization", "relation": "ACQUIRED", "object": "Arm", "object_type": "Organization"}
        ]"#]));
        let extractor = Extractor::new(model.clone(), registry.clone());

        let out = extractor.extract(&chunk("..."), &schema).await.unwrap();

        assert_eq!(out.triples.len(), 1);
        assert_eq!(out.dropped, 2);
        assert!(model.calls()[0].prompt.contains("MUST be one of"));
        assert_eq!(registry.snapshot(), schema);
    }

    #[tokio::test]
    async fn test_blank_chunk_skips_model() {
        let model = Arc::new(ScriptedModel::new());
        let extractor = Extractor::new(model.clone(), Arc::new(SchemaRegistry::open()));

        let out = extractor.extract(&chunk(" \n\n "), &Schema::default()).await.unwrap();
        assert!(out.triples.is_empty());
        assert_eq!(model.call_count(), 0);
    }
}
