//! Cypher statements issued by the writer and the pipeline.
//!
//! Labels and relationship types cannot be parameters in Cypher, so they are
//! formatted into the text. They only ever come from `normalize_type`, which
//! leaves nothing but alphanumerics and `_`, and are backtick-quoted anyway.

use std::collections::BTreeSet;

use extract::{Entity, Relationship};
use serde_json::{Map, Value};

use crate::store::Statement;

pub const ENTITY_LABEL: &str = "Entity";

pub const CONSTRAINTS: &[&str] = &[
    "CREATE CONSTRAINT entity_key IF NOT EXISTS FOR (e:Entity) REQUIRE (e.key, e.type) IS UNIQUE",
    "CREATE INDEX entity_id_index IF NOT EXISTS FOR (e:Entity) ON (e.id)",
];

pub const CLEAR_GRAPH: &str = "MATCH (n) DETACH DELETE n";

pub const COUNT_ENTITIES: &str = "MATCH (e:Entity) RETURN count(e) AS count";

pub const COUNT_RELATIONSHIPS: &str = "MATCH (:Entity)-[r]->(:Entity) RETURN count(r) AS count";

pub const EXPORT_NODES: &str = "MATCH (e:Entity) \
     RETURN e.id AS id, e.key AS key, e.type AS type, e.aliases AS aliases \
     ORDER BY type, key";

pub const EXPORT_EDGES: &str = "MATCH (a:Entity)-[r]->(b:Entity) \
     RETURN a.key AS from_key, a.type AS from_type, type(r) AS relation, \
     b.key AS to_key, b.type AS to_type, r.evidence AS evidence, r.documents AS documents \
     ORDER BY from_type, from_key, relation, to_type, to_key";

pub const LABELS: &str = "CALL db.labels() YIELD label RETURN label";

pub const RELATIONSHIP_TYPES: &str =
    "CALL db.relationshipTypes() YIELD relationshipType RETURN relationshipType";

/// Upsert keyed by (key, type); aliases only ever grow
pub fn upsert_entity(entity: &Entity) -> Statement {
    let text = format!(
        "MERGE (e:Entity {{key: $key, type: $type}}) \
         ON CREATE SET e.id = $name \
         SET e:`{label}`, \
         e.aliases = reduce(acc = coalesce(e.aliases, []), a IN $aliases | \
         CASE WHEN a IN acc THEN acc ELSE acc + a END)",
        label = entity.entity_type
    );

    Statement::new(text)
        .param("key", entity.key.clone())
        .param("type", entity.entity_type.clone())
        .param("name", entity.canonical_name.clone())
        .param("aliases", strings(entity.aliases.iter().cloned()))
}

/// Upsert keyed by (from, type, to); evidence, documents and properties
/// merge additively
pub fn upsert_relationship(doc_id: &str, relationship: &Relationship) -> Statement {
    let text = format!(
        "MATCH (a:Entity {{key: $from_key, type: $from_type}}) \
         MATCH (b:Entity {{key: $to_key, type: $to_type}}) \
         MERGE (a)-[r:`{rel}`]->(b) \
         SET r.evidence = reduce(acc = coalesce(r.evidence, []), x IN $evidence | \
         CASE WHEN x IN acc THEN acc ELSE acc + x END), \
         r.documents = reduce(acc = coalesce(r.documents, []), d IN $documents | \
         CASE WHEN d IN acc THEN acc ELSE acc + d END) \
         SET r += $properties",
        rel = relationship.relation_type
    );

    let evidence = relationship
        .evidence
        .iter()
        .map(|chunk_id| evidence_ref(doc_id, *chunk_id));

    let properties: Map<String, Value> = relationship
        .properties
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();

    Statement::new(text)
        .param("from_key", relationship.from.key.clone())
        .param("from_type", relationship.from.entity_type.clone())
        .param("to_key", relationship.to.key.clone())
        .param("to_type", relationship.to.entity_type.clone())
        .param("evidence", strings(evidence))
        .param("documents", strings([doc_id.to_string()]))
        .param("properties", properties)
}

/// Evidence is stored as "<doc_id>#<chunk_id>"
pub fn evidence_ref(doc_id: &str, chunk_id: usize) -> String {
    format!("{doc_id}#{chunk_id}")
}

fn strings(values: impl IntoIterator<Item = String>) -> Value {
    let unique: BTreeSet<String> = values.into_iter().collect();
    Value::Array(unique.into_iter().map(Value::String).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use extract::EntityRef;
    use std::collections::{BTreeMap, BTreeSet};

    #[test]
    fn test_entity_statement() {
        let mut entity = Entity::new("NVIDIA", "Organization");
        entity.aliases.insert("nvidia".to_string());
        let statement = upsert_entity(&entity);

        assert!(statement.text.contains("SET e:`Organization`"));
        assert_eq!(statement.params["key"], "nvidia");
        assert_eq!(statement.params["name"], "NVIDIA");
        assert_eq!(statement.params["aliases"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_relationship_statement() {
        let relationship = Relationship {
            from: EntityRef {
                key: "nvidia".to_string(),
                entity_type: "Organization".to_string(),
            },
            to: EntityRef {
                key: "mellanox".to_string(),
                entity_type: "Organization".to_string(),
            },
            relation_type: "ACQUIRED".to_string(),
            evidence: BTreeSet::from([0, 3]),
            properties: BTreeMap::new(),
        };
        let statement = upsert_relationship("doc", &relationship);

        assert!(statement.text.contains("MERGE (a)-[r:`ACQUIRED`]->(b)"));
        assert_eq!(statement.params["evidence"], serde_json::json!(["doc#0", "doc#3"]));
        assert_eq!(statement.params["documents"], serde_json::json!(["doc"]));
    }
}
