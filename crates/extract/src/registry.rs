use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::SchemaViolation;
use crate::schema::{Schema, Triple, TypeKind, normalize_type};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaMode {
    /// Unseen types are accepted and registered as they appear
    #[default]
    Open,
    /// Only the initial type set is allowed
    Fixed,
}

/// The allowed entity and relationship types, shared by concurrent extractions.
///
/// Mode and types live under one lock, so two chunks registering types at the
/// same time never lose an update and a pin is seen atomically.
pub struct SchemaRegistry {
    seed_mode: SchemaMode,
    seed: Schema,
    state: RwLock<State>,
}

struct State {
    mode: SchemaMode,
    schema: Schema,
}

impl SchemaRegistry {
    pub fn new(mode: SchemaMode, seed: Schema) -> Self {
        Self {
            seed_mode: mode,
            state: RwLock::new(State {
                mode,
                schema: seed.clone(),
            }),
            seed,
        }
    }

    pub fn open() -> Self {
        Self::new(SchemaMode::Open, Schema::default())
    }

    pub fn fixed(schema: Schema) -> Self {
        Self::new(SchemaMode::Fixed, schema)
    }

    pub fn mode(&self) -> SchemaMode {
        self.state.read().mode
    }

    pub fn validate(&self, kind: TypeKind, name: &str) -> bool {
        match normalize_type(kind, name) {
            None => false,
            Some(normalized) => {
                let state = self.state.read();
                match state.mode {
                    SchemaMode::Open => true,
                    SchemaMode::Fixed => state.schema.contains(kind, &normalized),
                }
            }
        }
    }

    /// Idempotent. Returns the normalized type name.
    pub fn register(&self, kind: TypeKind, name: &str) -> Result<String, SchemaViolation> {
        let normalized = normalize_type(kind, name).ok_or_else(|| violation(kind, name))?;

        if self.state.read().schema.contains(kind, &normalized) {
            return Ok(normalized);
        }

        let mut state = self.state.write();
        match state.mode {
            SchemaMode::Fixed => Err(violation(kind, name)),
            SchemaMode::Open => {
                if state.schema.types_mut(kind).insert(normalized.clone()) {
                    tracing::debug!(kind = %kind, type_name = %normalized, "Registered new type");
                }
                Ok(normalized)
            }
        }
    }

    /// Normalize the triple's three types and check them against the schema,
    /// registering them in open mode. Either all three are admitted or none.
    pub fn admit(&self, mut triple: Triple) -> Result<Triple, SchemaViolation> {
        let subject_type = normalize_type(TypeKind::Entity, &triple.subject_type)
            .ok_or_else(|| violation(TypeKind::Entity, &triple.subject_type))?;
        let relation = normalize_type(TypeKind::Relationship, &triple.relation)
            .ok_or_else(|| violation(TypeKind::Relationship, &triple.relation))?;
        let object_type = normalize_type(TypeKind::Entity, &triple.object_type)
            .ok_or_else(|| violation(TypeKind::Entity, &triple.object_type))?;

        let wanted = [
            (TypeKind::Entity, &subject_type),
            (TypeKind::Relationship, &relation),
            (TypeKind::Entity, &object_type),
        ];

        let mut state = self.state.write();
        match state.mode {
            SchemaMode::Fixed => {
                if let Some((kind, name)) = wanted.iter().find(|(k, n)| !state.schema.contains(*k, n)) {
                    return Err(violation(*kind, name));
                }
            }
            SchemaMode::Open => {
                for (kind, name) in wanted {
                    state.schema.types_mut(kind).insert(name.clone());
                }
            }
        }
        drop(state);

        triple.subject_type = subject_type;
        triple.relation = relation;
        triple.object_type = object_type;
        Ok(triple)
    }

    pub fn snapshot(&self) -> Schema {
        self.state.read().schema.clone()
    }

    /// Switch to fixed mode with exactly `schema`'s types. Configured
    /// irreflexive relations are kept.
    pub fn pin(&self, mut schema: Schema) {
        schema.irreflexive.extend(self.seed.irreflexive.iter().cloned());

        let mut state = self.state.write();
        state.mode = SchemaMode::Fixed;
        state.schema = schema;
        tracing::info!(
            entity_types = state.schema.entity_types.len(),
            relationship_types = state.schema.relationship_types.len(),
            "Schema pinned"
        );
    }

    /// Back to the configured mode and types, forgetting learned or pinned ones
    pub fn reset(&self) {
        let mut state = self.state.write();
        state.mode = self.seed_mode;
        state.schema = self.seed.clone();
    }
}

fn violation(kind: TypeKind, name: &str) -> SchemaViolation {
    SchemaViolation {
        kind,
        type_name: name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn fixed() -> SchemaRegistry {
        SchemaRegistry::fixed(Schema::new(
            ["Organization", "Person"],
            ["ACQUIRED", "FOUNDED"],
            Vec::<String>::new(),
        ))
    }

    #[test]
    fn test_fixed_mode_validates() {
        let registry = fixed();
        assert!(registry.validate(TypeKind::Entity, "organization"));
        assert!(registry.validate(TypeKind::Relationship, "acquired"));
        assert!(!registry.validate(TypeKind::Relationship, "PARTNERED_WITH"));
        assert!(!registry.validate(TypeKind::Entity, "Location"));
    }

    #[test]
    fn test_fixed_mode_register_fails_for_unlisted() {
        let registry = fixed();
        assert_eq!(registry.register(TypeKind::Entity, "person").unwrap(), "Person");
        let err = registry.register(TypeKind::Entity, "Location").unwrap_err();
        assert_eq!(err.kind, TypeKind::Entity);
        assert_eq!(registry.snapshot().entity_types.len(), 2);
    }

    #[test]
    fn test_open_mode_registers_idempotently() {
        let registry = SchemaRegistry::open();
        assert_eq!(registry.register(TypeKind::Relationship, "works at").unwrap(), "WORKS_AT");
        assert_eq!(registry.register(TypeKind::Relationship, "WORKS_AT").unwrap(), "WORKS_AT");
        assert_eq!(registry.snapshot().relationship_types.len(), 1);
        assert!(registry.register(TypeKind::Entity, "!!!").is_err());
    }

    #[test]
    fn test_admit_normalizes_triple() {
        let registry = SchemaRegistry::open();
        let triple = registry
            .admit(Triple::new("NVIDIA", "organization", "acquired", "Mellanox", "organization", 3))
            .unwrap();
        assert_eq!(triple.subject_type, "Organization");
        assert_eq!(triple.relation, "ACQUIRED");
        assert_eq!(triple.source_chunk_id, 3);

        let schema = registry.snapshot();
        assert!(schema.contains(TypeKind::Entity, "Organization"));
        assert!(schema.contains(TypeKind::Relationship, "ACQUIRED"));
    }

    #[test]
    fn test_admit_rejects_out_of_schema_relation() {
        let registry = fixed();
        let err = registry
            .admit(Triple::new("NVIDIA", "Organization", "partnered with", "Mellanox", "Organization", 0))
            .unwrap_err();
        assert_eq!(err.kind, TypeKind::Relationship);
    }

    #[test]
    fn test_reset_keeps_seed() {
        let registry = SchemaRegistry::new(
            SchemaMode::Open,
            Schema::new(["Person"], Vec::<String>::new(), Vec::<String>::new()),
        );
        registry.register(TypeKind::Entity, "Company").unwrap();
        registry.reset();
        let schema = registry.snapshot();
        assert!(schema.contains(TypeKind::Entity, "Person"));
        assert!(!schema.contains(TypeKind::Entity, "Company"));
    }

    #[test]
    fn test_pin_switches_to_fixed_until_reset() {
        let registry = SchemaRegistry::new(
            SchemaMode::Open,
            Schema::new(Vec::<String>::new(), Vec::<String>::new(), ["MET_WITH"]),
        );
        registry.register(TypeKind::Relationship, "partnered with").unwrap();

        registry.pin(Schema::new(["Organization"], ["ACQUIRED"], Vec::<String>::new()));
        assert_eq!(registry.mode(), SchemaMode::Fixed);
        assert!(registry.snapshot().irreflexive.contains("MET_WITH"));
        assert!(registry
            .admit(Triple::new("NVIDIA", "Organization", "PARTNERED_WITH", "Arm", "Organization", 0))
            .is_err());
        assert!(registry
            .admit(Triple::new("NVIDIA", "Organization", "acquired", "Mellanox", "Organization", 0))
            .is_ok());

        registry.reset();
        assert_eq!(registry.mode(), SchemaMode::Open);
        assert!(registry.validate(TypeKind::Relationship, "PARTNERED_WITH"));
    }

    #[test]
    fn test_concurrent_registration_loses_nothing() {
        let registry = Arc::new(SchemaRegistry::open());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        registry.register(TypeKind::Entity, &format!("Type{t}x{i}")).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.snapshot().entity_types.len(), 400);
    }
}
