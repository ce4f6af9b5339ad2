use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::schema::{
    Entity, EntityRef, Relationship, Schema, Triple, TypeKind, canonical_key, collapse_whitespace,
    normalize_type,
};

/// How aggressively names of the same type are merged
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SynonymPolicy {
    /// Only names equal after case and whitespace normalization
    #[default]
    Exact,
    /// Also names where one's words appear inside the other's, or that
    /// share more than 70% of their words
    Fuzzy,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MergeConfig {
    #[serde(default)]
    pub policy: SynonymPolicy,
    /// Name pairs declared to denote the same entity
    #[serde(default)]
    pub synonyms: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default)]
pub struct Merged {
    pub entities: Vec<Entity>,
    pub relationships: Vec<Relationship>,
    pub dropped_self_loops: usize,
}

/// Canonicalizes entity names and merges duplicate triples
pub struct EntityNormalizer {
    policy: SynonymPolicy,
    /// Maps normalized name -> representative of its synonym class
    aliases: HashMap<String, String>,
}

struct Node {
    key: String,
    entity_type: String,
    /// Surface form of the first mention
    first: String,
    surface: BTreeSet<String>,
}

impl EntityNormalizer {
    pub fn new(config: &MergeConfig) -> Self {
        let mut classes = UnionFind::default();
        let mut names: Vec<String> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();

        let mut id_of = |name: &str, names: &mut Vec<String>, classes: &mut UnionFind| {
            let key = canonical_key(name);
            *index.entry(key.clone()).or_insert_with(|| {
                names.push(key);
                classes.add()
            })
        };

        for (a, b) in &config.synonyms {
            if canonical_key(a).is_empty() || canonical_key(b).is_empty() {
                continue;
            }
            let ia = id_of(a, &mut names, &mut classes);
            let ib = id_of(b, &mut names, &mut classes);
            classes.union(ia, ib);
        }

        let aliases = names
            .iter()
            .enumerate()
            .map(|(i, key)| (key.clone(), names[classes.find(i)].clone()))
            .collect();

        Self {
            policy: config.policy,
            aliases,
        }
    }

    /// Merge candidate triples into canonical entities and relationships.
    ///
    /// Entities are identified by (normalized name, type). Names in the same
    /// declared synonym class share the class representative as their key, so
    /// they land on one graph node whichever member a document mentions.
    /// Relationships are identified by (from, relation type, to) and keep the
    /// union of their evidence. Self-loops on relation types the schema marks
    /// irreflexive are dropped.
    pub fn merge(&self, triples: &[Triple], schema: &Schema) -> Merged {
        let mut nodes: Vec<Node> = Vec::new();
        let mut node_index: HashMap<(String, String), usize> = HashMap::new();
        let mut class_index: HashMap<(String, String), usize> = HashMap::new();
        let mut classes = UnionFind::default();
        let mut edges: Vec<(usize, String, usize, usize)> = Vec::new();

        for triple in triples {
            let Some(relation) = normalize_type(TypeKind::Relationship, &triple.relation) else {
                tracing::warn!(relation = %triple.relation, "Dropping triple with unusable relation");
                continue;
            };

            let ends = [
                end(&triple.subject_name, &triple.subject_type),
                end(&triple.object_name, &triple.object_type),
            ];
            let [Some(subject), Some(object)] = ends else {
                tracing::warn!(
                    subject = %triple.subject_name,
                    object = %triple.object_name,
                    "Dropping triple with blank entity name or type"
                );
                continue;
            };

            let mut ids = [0usize; 2];
            for (slot, (key, entity_type, surface)) in [subject, object].into_iter().enumerate() {
                let id = *node_index
                    .entry((key.clone(), entity_type.clone()))
                    .or_insert_with(|| {
                        nodes.push(Node {
                            key: key.clone(),
                            entity_type: entity_type.clone(),
                            first: surface.clone(),
                            surface: BTreeSet::new(),
                        });
                        classes.add()
                    });
                nodes[id].surface.insert(surface);

                let class_key = self.aliases.get(&key).cloned().unwrap_or(key);
                let first = *class_index.entry((class_key, entity_type)).or_insert(id);
                classes.union(first, id);

                ids[slot] = id;
            }

            edges.push((ids[0], relation, ids[1], triple.source_chunk_id));
        }

        if self.policy == SynonymPolicy::Fuzzy {
            for a in 0..nodes.len() {
                for b in (a + 1)..nodes.len() {
                    if nodes[a].entity_type == nodes[b].entity_type
                        && are_similar(&nodes[a].key, &nodes[b].key)
                    {
                        classes.union(a, b);
                    }
                }
            }
        }

        // Graph key per class: the declared synonym representative when a
        // member has one, else the first-seen member's key
        let mut class_keys: HashMap<usize, String> = HashMap::new();
        for id in 0..nodes.len() {
            let root = classes.find(id);
            if let Some(representative) = self.aliases.get(&nodes[id].key) {
                class_keys.entry(root).or_insert_with(|| representative.clone());
            }
        }
        let key_of = |root: usize| {
            class_keys
                .get(&root)
                .cloned()
                .unwrap_or_else(|| nodes[root].key.clone())
        };

        // One entity per class, named after its first-seen member
        let mut entities: Vec<Entity> = Vec::new();
        let mut entity_of_root: HashMap<usize, usize> = HashMap::new();
        let mut roots: Vec<usize> = Vec::with_capacity(nodes.len());
        for id in 0..nodes.len() {
            let root = classes.find(id);
            roots.push(root);
            let slot = *entity_of_root.entry(root).or_insert_with(|| {
                entities.push(Entity {
                    key: key_of(root),
                    canonical_name: nodes[root].first.clone(),
                    entity_type: nodes[root].entity_type.clone(),
                    aliases: BTreeSet::new(),
                });
                entities.len() - 1
            });
            entities[slot].aliases.extend(nodes[id].surface.iter().cloned());
        }

        let reference = |id: usize| entities[entity_of_root[&roots[id]]].reference();

        let mut relationships: Vec<Relationship> = Vec::new();
        let mut edge_index: HashMap<(EntityRef, String, EntityRef), usize> = HashMap::new();
        let mut dropped_self_loops = 0;

        for (from, relation, to, chunk_id) in edges {
            let from = reference(from);
            let to = reference(to);

            if from == to && schema.irreflexive.contains(&relation) {
                tracing::warn!(
                    entity = %from.key,
                    relation = %relation,
                    "Dropping self-loop on irreflexive relation"
                );
                dropped_self_loops += 1;
                continue;
            }

            let slot = *edge_index
                .entry((from.clone(), relation.clone(), to.clone()))
                .or_insert_with(|| {
                    relationships.push(Relationship {
                        from,
                        to,
                        relation_type: relation,
                        evidence: BTreeSet::new(),
                        properties: BTreeMap::new(),
                    });
                    relationships.len() - 1
                });
            relationships[slot].evidence.insert(chunk_id);
        }

        Merged {
            entities,
            relationships,
            dropped_self_loops,
        }
    }
}

/// Normalized (key, type, surface form) of one end of a triple
fn end(name: &str, raw_type: &str) -> Option<(String, String, String)> {
    let key = canonical_key(name);
    if key.is_empty() {
        return None;
    }
    let entity_type = normalize_type(TypeKind::Entity, raw_type)?;
    Some((key, entity_type, collapse_whitespace(name)))
}

/// Word-level similarity between two normalized names
fn are_similar(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }

    let words_a: Vec<&str> = a.split_whitespace().collect();
    let words_b: Vec<&str> = b.split_whitespace().collect();

    // One is contained in the other (handles "nvidia" vs "nvidia corporation")
    let (short, long) = if words_a.len() <= words_b.len() {
        (&words_a, &words_b)
    } else {
        (&words_b, &words_a)
    };
    if !short.is_empty() && long.windows(short.len()).any(|w| w == short.as_slice()) {
        return true;
    }

    // Check if they share most words (for multi-word entities)
    if words_a.len() > 1 && words_b.len() > 1 {
        let common = words_a.iter().filter(|w| words_b.contains(w)).count();
        let total = words_a.len().max(words_b.len());
        return common as f64 / total as f64 > 0.7;
    }

    false
}

/// Union-find whose roots are always the smallest member, so the
/// representative of a class is its first-seen element.
#[derive(Default)]
struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn add(&mut self) -> usize {
        self.parent.push(self.parent.len());
        self.parent.len() - 1
    }

    fn find(&mut self, x: usize) -> usize {
        let mut root = x;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut cur = x;
        while self.parent[cur] != root {
            let next = self.parent[cur];
            self.parent[cur] = root;
            cur = next;
        }
        root
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra < rb {
            self.parent[rb] = ra;
        } else if rb < ra {
            self.parent[ra] = rb;
        }
    }
}
