//! In-memory graph store for tests
//!
//! Understands the statements the writer issues (constraint setup, entity and
//! relationship upserts, clearing) and the pipeline's export, stats and
//! introspection reads. Any other read is answered from a scripted queue.

use std::collections::{BTreeSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value, json};

use crate::cypher;
use crate::store::{GraphStore, Row, Statement, StoreError};

#[derive(Debug, Clone, PartialEq)]
pub struct StoredNode {
    pub id: String,
    pub key: String,
    pub entity_type: String,
    pub labels: BTreeSet<String>,
    pub aliases: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredEdge {
    pub from: (String, String),
    pub relation: String,
    pub to: (String, String),
    pub evidence: Vec<String>,
    pub documents: Vec<String>,
    pub properties: Map<String, Value>,
}

#[derive(Debug, Clone, Default)]
struct Graph {
    nodes: Vec<StoredNode>,
    edges: Vec<StoredEdge>,
}

#[derive(Default)]
pub struct MemoryGraphStore {
    graph: Mutex<Graph>,
    constraint_runs: Mutex<usize>,
    write_failures: Mutex<VecDeque<String>>,
    reads: Mutex<VecDeque<Result<Vec<Row>, StoreError>>>,
    read_log: Mutex<Vec<Statement>>,
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next write batch with a connection error
    pub fn fail_next_write(&self, reason: &str) {
        self.write_failures.lock().push_back(reason.to_string());
    }

    /// Queue the answer to the next read the store does not answer itself
    pub fn push_read(&self, result: Result<Vec<Row>, StoreError>) {
        self.reads.lock().push_back(result);
    }

    pub fn push_rows(&self, rows: Vec<Value>) {
        let rows = rows
            .into_iter()
            .filter_map(|row| match row {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .collect();
        self.push_read(Ok(rows));
    }

    /// Every read statement received, in order
    pub fn reads(&self) -> Vec<Statement> {
        self.read_log.lock().clone()
    }

    pub fn node_count(&self) -> usize {
        self.graph.lock().nodes.len()
    }

    pub fn relationship_count(&self) -> usize {
        self.graph.lock().edges.len()
    }

    pub fn nodes(&self) -> Vec<StoredNode> {
        self.graph.lock().nodes.clone()
    }

    pub fn relationships(&self) -> Vec<StoredEdge> {
        self.graph.lock().edges.clone()
    }

    pub fn constraint_runs(&self) -> usize {
        *self.constraint_runs.lock()
    }

    fn builtin_read(&self, text: &str) -> Option<Vec<Row>> {
        let graph = self.graph.lock();
        let rows: Vec<Value> = match text {
            cypher::COUNT_ENTITIES => vec![json!({"count": graph.nodes.len()})],
            cypher::COUNT_RELATIONSHIPS => vec![json!({"count": graph.edges.len()})],
            cypher::LABELS => {
                let labels: BTreeSet<&String> = graph.nodes.iter().flat_map(|n| &n.labels).collect();
                labels.into_iter().map(|l| json!({"label": l})).collect()
            }
            cypher::RELATIONSHIP_TYPES => {
                let types: BTreeSet<&String> = graph.edges.iter().map(|e| &e.relation).collect();
                types.into_iter().map(|t| json!({"relationshipType": t})).collect()
            }
            cypher::EXPORT_NODES => graph
                .nodes
                .iter()
                .map(|n| json!({"id": n.id, "key": n.key, "type": n.entity_type, "aliases": n.aliases}))
                .collect(),
            cypher::EXPORT_EDGES => graph
                .edges
                .iter()
                .map(|e| {
                    json!({
                        "from_key": e.from.0, "from_type": e.from.1, "relation": e.relation,
                        "to_key": e.to.0, "to_type": e.to.1,
                        "evidence": e.evidence, "documents": e.documents,
                    })
                })
                .collect(),
            _ => return None,
        };

        Some(
            rows.into_iter()
                .filter_map(|row| match row {
                    Value::Object(map) => Some(map),
                    _ => None,
                })
                .collect(),
        )
    }
}

fn text_param<'a>(statement: &'a Statement, key: &str) -> Result<&'a str, StoreError> {
    statement
        .params
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| StoreError::Syntax(format!("ParameterMissing: ${key}")))
}

fn list_param(statement: &Statement, key: &str) -> Vec<String> {
    statement
        .params
        .get(key)
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default()
}

/// Text between `start` and the next `end`
fn between<'a>(text: &'a str, start: &str, end: &str) -> Option<&'a str> {
    let from = text.find(start)? + start.len();
    let len = text[from..].find(end)?;
    Some(&text[from..from + len])
}

fn union_into(target: &mut Vec<String>, items: Vec<String>) {
    for item in items {
        if !target.contains(&item) {
            target.push(item);
        }
    }
}

impl Graph {
    fn apply(&mut self, statement: &Statement) -> Result<(), StoreError> {
        let text = statement.text.as_str();

        if text == cypher::CLEAR_GRAPH {
            self.nodes.clear();
            self.edges.clear();
        } else if text.starts_with("MERGE (e:Entity") {
            let key = text_param(statement, "key")?;
            let entity_type = text_param(statement, "type")?;
            let label = between(text, "SET e:`", "`")
                .ok_or_else(|| StoreError::Syntax(format!("SyntaxError: no label in {text}")))?;

            let index = match self
                .nodes
                .iter()
                .position(|n| n.key == key && n.entity_type == entity_type)
            {
                Some(index) => index,
                None => {
                    self.nodes.push(StoredNode {
                        id: text_param(statement, "name")?.to_string(),
                        key: key.to_string(),
                        entity_type: entity_type.to_string(),
                        labels: BTreeSet::from([cypher::ENTITY_LABEL.to_string()]),
                        aliases: Vec::new(),
                    });
                    self.nodes.len() - 1
                }
            };
            let node = &mut self.nodes[index];
            node.labels.insert(label.to_string());
            union_into(&mut node.aliases, list_param(statement, "aliases"));
        } else if text.contains("MERGE (a)-[r:`") {
            let relation = between(text, "[r:`", "`]")
                .ok_or_else(|| StoreError::Syntax(format!("SyntaxError: no type in {text}")))?;
            let from = (
                text_param(statement, "from_key")?.to_string(),
                text_param(statement, "from_type")?.to_string(),
            );
            let to = (
                text_param(statement, "to_key")?.to_string(),
                text_param(statement, "to_type")?.to_string(),
            );

            let exists = |end: &(String, String)| {
                self.nodes
                    .iter()
                    .any(|n| n.key == end.0 && n.entity_type == end.1)
            };
            if !exists(&from) || !exists(&to) {
                return Err(StoreError::Other(format!(
                    "relationship endpoint missing for {relation}"
                )));
            }

            let index = match self
                .edges
                .iter()
                .position(|e| e.from == from && e.relation == relation && e.to == to)
            {
                Some(index) => index,
                None => {
                    self.edges.push(StoredEdge {
                        from,
                        relation: relation.to_string(),
                        to,
                        evidence: Vec::new(),
                        documents: Vec::new(),
                        properties: Map::new(),
                    });
                    self.edges.len() - 1
                }
            };
            let edge = &mut self.edges[index];
            union_into(&mut edge.evidence, list_param(statement, "evidence"));
            union_into(&mut edge.documents, list_param(statement, "documents"));
            if let Some(Value::Object(properties)) = statement.params.get("properties") {
                edge.properties
                    .extend(properties.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
        } else {
            return Err(StoreError::Syntax(format!(
                "SyntaxError: unsupported statement: {text}"
            )));
        }

        Ok(())
    }
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    async fn run_write(&self, batch: Vec<Statement>, _timeout: Duration) -> Result<(), StoreError> {
        if let Some(reason) = self.write_failures.lock().pop_front() {
            return Err(StoreError::Connection(reason));
        }

        if batch.iter().all(|s| s.text.starts_with("CREATE ")) {
            *self.constraint_runs.lock() += batch.len();
            return Ok(());
        }

        // Apply to a copy so a failing statement rolls back the whole batch
        let mut graph = self.graph.lock();
        let mut staged = graph.clone();
        for statement in &batch {
            staged.apply(statement)?;
        }
        *graph = staged;
        Ok(())
    }

    async fn run_read(
        &self,
        statement: Statement,
        row_limit: usize,
        _timeout: Duration,
    ) -> Result<Vec<Row>, StoreError> {
        self.read_log.lock().push(statement.clone());

        let rows = match self.builtin_read(&statement.text) {
            Some(rows) => rows,
            None => match self.reads.lock().pop_front() {
                Some(result) => result?,
                None => Vec::new(),
            },
        };

        Ok(rows.into_iter().take(row_limit).collect())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_secs(1);

    #[tokio::test]
    async fn test_scripted_reads_and_row_cap() {
        let store = MemoryGraphStore::new();
        store.push_rows(vec![json!({"n": 1}), json!({"n": 2}), json!({"n": 3})]);
        store.push_read(Err(StoreError::Syntax("Invalid input 'RETRUN'".to_string())));

        let rows = store.run_read(Statement::new("MATCH (n) RETURN n"), 2, WAIT).await.unwrap();
        assert_eq!(rows.len(), 2);

        let err = store.run_read(Statement::new("MATCH (n) RETRUN n"), 10, WAIT).await.unwrap_err();
        assert!(err.is_syntax());
        assert_eq!(store.reads().len(), 2);
    }

    #[tokio::test]
    async fn test_bad_batch_rolls_back() {
        let store = MemoryGraphStore::new();
        let node = Statement::new("MERGE (e:Entity {key: $key, type: $type}) ON CREATE SET e.id = $name SET e:`Person`")
            .param("key", "alex")
            .param("type", "Person")
            .param("name", "Alex");
        let bogus = Statement::new("DROP EVERYTHING");

        assert!(store.run_write(vec![node, bogus], WAIT).await.is_err());
        assert_eq!(store.node_count(), 0);
    }
}
