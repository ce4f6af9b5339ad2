use crate::registry::SchemaMode;
use crate::schema::Schema;

const OUTPUT_SHAPE: &str = r#"{
  "relationships": [
    {"subject": "John Smith", "subject_type": "Person", "relation": "WORKS_AT", "object": "Acme Corporation", "object_type": "Organization"}
  ]
}"#;

pub fn build_extraction_prompt(chunk_text: &str, schema: &Schema, mode: SchemaMode) -> String {
    let type_rules = match mode {
        SchemaMode::Fixed => format!(
            "- subject_type and object_type MUST be one of: {}\n\
             - relation MUST be one of: {}\n\
             - Skip any fact that cannot be expressed with these types",
            join(&schema.entity_types),
            join(&schema.relationship_types)
        ),
        SchemaMode::Open if schema.is_empty() => {
            "- Choose short, general entity types (Person, Organization, Location, ...)\n\
             - Relations are short verbs in UPPER_SNAKE_CASE (FOUNDED, ACQUIRED, WORKS_AT)"
                .to_string()
        }
        SchemaMode::Open => format!(
            "- Prefer these entity types when they fit: {}\n\
             - Prefer these relations when they fit: {}\n\
             - Introduce a new type only when none of the above applies\n\
             - Relations are short verbs in UPPER_SNAKE_CASE",
            join(&schema.entity_types),
            join(&schema.relationship_types)
        ),
    };

    format!(
        r#"You are a top-tier algorithm designed for extracting information in structured formats to build a knowledge graph.
Identify the entities in the text and the relations between them.

OUTPUT FORMAT:
{OUTPUT_SHAPE}

RULES:
- "subject" and "object" are entity names exactly as they appear in the text
{type_rules}
- Use only facts stated in the text
- If the text holds no facts, return {{"relationships": []}}
- Output ONLY the JSON object, no markdown, no explanations

TEXT:
{chunk_text}

JSON OUTPUT:"#
    )
}

/// Second and last attempt after the first output failed to parse
pub fn build_retry_prompt(chunk_text: &str, invalid_output: &str, problem: &str) -> String {
    format!(
        r#"Your previous answer could not be used: {problem}

PREVIOUS ANSWER:
{invalid_output}

Extract the relationships from the text again. Respond with exactly one JSON object of this shape and nothing else:
{OUTPUT_SHAPE}

Every item must have the string fields "subject", "subject_type", "relation", "object" and "object_type".
No markdown formatting, no code blocks, no explanations. Just the raw JSON object.

TEXT:
{chunk_text}"#
    )
}

fn join(types: &std::collections::BTreeSet<String>) -> String {
    types.iter().cloned().collect::<Vec<_>>().join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_prompt_lists_types() {
        let schema = Schema::new(["Person"], ["FOUNDED"], Vec::<String>::new());
        let prompt = build_extraction_prompt("Alex founded a bank.", &schema, SchemaMode::Fixed);
        assert!(prompt.contains("MUST be one of: Person"));
        assert!(prompt.contains("MUST be one of: FOUNDED"));
        assert!(prompt.contains("Alex founded a bank."));
    }

    #[test]
    fn test_open_prompt_without_types() {
        let prompt = build_extraction_prompt("text", &Schema::default(), SchemaMode::Open);
        assert!(prompt.contains("UPPER_SNAKE_CASE"));
        assert!(!prompt.contains("MUST be one of"));
    }
}
