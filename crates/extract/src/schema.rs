use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// A candidate (subject, relation, object) fact produced by the extractor.
///
/// Model output may use the `head`/`tail` field names; both spellings are
/// accepted when deserializing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Triple {
    #[serde(rename = "subject", alias = "head")]
    pub subject_name: String,
    #[serde(alias = "head_type")]
    pub subject_type: String,
    pub relation: String,
    #[serde(rename = "object", alias = "tail")]
    pub object_name: String,
    #[serde(alias = "tail_type")]
    pub object_type: String,
    #[serde(default)]
    pub source_chunk_id: usize,
}

impl Triple {
    pub fn new(
        subject_name: impl Into<String>,
        subject_type: impl Into<String>,
        relation: impl Into<String>,
        object_name: impl Into<String>,
        object_type: impl Into<String>,
        source_chunk_id: usize,
    ) -> Self {
        Self {
            subject_name: subject_name.into(),
            subject_type: subject_type.into(),
            relation: relation.into(),
            object_name: object_name.into(),
            object_type: object_type.into(),
            source_chunk_id,
        }
    }

    pub fn pattern(&self) -> RelationshipPattern {
        RelationshipPattern {
            subject_type: self.subject_type.clone(),
            relation: self.relation.clone(),
            object_type: self.object_type.clone(),
        }
    }
}

/// Identity of a canonical entity in the graph
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityRef {
    pub key: String,
    #[serde(rename = "type")]
    pub entity_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    /// Graph identity together with the type; for declared synonyms this is
    /// the configured representative, not necessarily the display name's key
    pub key: String,
    /// Display name, the first-seen surface form
    pub canonical_name: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    pub aliases: BTreeSet<String>,
}

impl Entity {
    /// An entity keyed by its own name, with that name as the only alias
    pub fn new(name: &str, entity_type: &str) -> Self {
        let canonical_name = collapse_whitespace(name);
        Self {
            key: canonical_key(name),
            aliases: BTreeSet::from([canonical_name.clone()]),
            canonical_name,
            entity_type: entity_type.to_string(),
        }
    }

    pub fn reference(&self) -> EntityRef {
        EntityRef {
            key: self.key.clone(),
            entity_type: self.entity_type.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relationship {
    pub from: EntityRef,
    pub to: EntityRef,
    pub relation_type: String,
    /// Chunk ids the fact was extracted from
    pub evidence: BTreeSet<usize>,
    /// Extra edge properties; merged additively on upsert
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

/// Type-level view of a triple, used to review and pin a schema
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelationshipPattern {
    pub subject_type: String,
    pub relation: String,
    pub object_type: String,
}

/// Unique patterns in first-seen order
pub fn patterns(triples: &[Triple]) -> Vec<RelationshipPattern> {
    let mut seen = HashSet::new();
    triples
        .iter()
        .map(Triple::pattern)
        .filter(|p| seen.insert(p.clone()))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TypeKind {
    Entity,
    Relationship,
}

impl fmt::Display for TypeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeKind::Entity => write!(f, "entity"),
            TypeKind::Relationship => write!(f, "relationship"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub entity_types: BTreeSet<String>,
    pub relationship_types: BTreeSet<String>,
    /// Relationship types that never hold between an entity and itself
    #[serde(default)]
    pub irreflexive: BTreeSet<String>,
}

impl Schema {
    /// Builds a normalized schema, silently skipping names that normalize to nothing
    pub fn new<E, R, I>(entity_types: E, relationship_types: R, irreflexive: I) -> Self
    where
        E: IntoIterator,
        E::Item: AsRef<str>,
        R: IntoIterator,
        R::Item: AsRef<str>,
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        Self {
            entity_types: entity_types
                .into_iter()
                .filter_map(|n| normalize_type(TypeKind::Entity, n.as_ref()))
                .collect(),
            relationship_types: relationship_types
                .into_iter()
                .filter_map(|n| normalize_type(TypeKind::Relationship, n.as_ref()))
                .collect(),
            irreflexive: irreflexive
                .into_iter()
                .filter_map(|n| normalize_type(TypeKind::Relationship, n.as_ref()))
                .collect(),
        }
    }

    /// A fixed schema covering exactly the reviewed patterns
    pub fn from_patterns<I>(patterns: &[RelationshipPattern], irreflexive: I) -> Self
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let entity_types = patterns
            .iter()
            .flat_map(|p| [p.subject_type.as_str(), p.object_type.as_str()]);
        let relationship_types = patterns.iter().map(|p| p.relation.as_str());
        Self::new(entity_types, relationship_types, irreflexive)
    }

    pub fn is_empty(&self) -> bool {
        self.entity_types.is_empty() && self.relationship_types.is_empty()
    }

    pub fn types(&self, kind: TypeKind) -> &BTreeSet<String> {
        match kind {
            TypeKind::Entity => &self.entity_types,
            TypeKind::Relationship => &self.relationship_types,
        }
    }

    pub(crate) fn types_mut(&mut self, kind: TypeKind) -> &mut BTreeSet<String> {
        match kind {
            TypeKind::Entity => &mut self.entity_types,
            TypeKind::Relationship => &mut self.relationship_types,
        }
    }

    pub fn contains(&self, kind: TypeKind, name: &str) -> bool {
        self.types(kind).contains(name)
    }

    pub fn merge(&mut self, other: &Schema) {
        self.entity_types.extend(other.entity_types.iter().cloned());
        self.relationship_types
            .extend(other.relationship_types.iter().cloned());
        self.irreflexive.extend(other.irreflexive.iter().cloned());
    }

    /// Plain-text rendering used inside prompts
    pub fn describe(&self) -> String {
        let list = |set: &BTreeSet<String>| {
            if set.is_empty() {
                "(none yet)".to_string()
            } else {
                set.iter().cloned().collect::<Vec<_>>().join(", ")
            }
        };
        format!(
            "Node labels: {}\nRelationship types: {}",
            list(&self.entity_types),
            list(&self.relationship_types)
        )
    }
}

/// Lower-case, trim and collapse internal whitespace. Two names refer to the
/// same entity (of the same type) exactly when their keys are equal.
pub fn canonical_key(name: &str) -> String {
    collapse_whitespace(name).to_lowercase()
}

pub fn collapse_whitespace(name: &str) -> String {
    name.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Normalize a type name into something usable as a graph label.
///
/// Entity types become `Title_Case` words joined by `_`; relationship types
/// become `UPPER_SNAKE_CASE`. Returns `None` when nothing usable remains.
pub fn normalize_type(kind: TypeKind, raw: &str) -> Option<String> {
    let normalized = match kind {
        TypeKind::Entity => normalize_entity_type(raw),
        TypeKind::Relationship => normalize_relation_type(raw),
    };
    (!normalized.is_empty()).then_some(normalized)
}

fn normalize_entity_type(raw: &str) -> String {
    raw.split(|c: char| c.is_whitespace() || c == '_' || c == '-')
        .map(|word| word.chars().filter(|c| c.is_alphanumeric()).collect::<String>())
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join("_")
}

fn normalize_relation_type(raw: &str) -> String {
    let mut out = String::new();
    let mut pending_sep = false;

    for c in raw.chars() {
        if c.is_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.extend(c.to_uppercase());
        } else {
            pending_sep = true;
        }
    }

    out
}
