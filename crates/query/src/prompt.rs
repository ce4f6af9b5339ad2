use extract::Schema;
use index::Row;

use crate::history::QueryTurn;

/// Answer given when the query returns no rows
pub const NO_ANSWER: &str =
    "I could not find an answer to that question in the knowledge graph.";

const EXAMPLES: &str = r#"# Who founded Genesis Bank?
{"query": "MATCH (p:Person)-[:FOUNDED]->(o:Organization {id: \"Genesis Bank\"}) RETURN p.id"}
# What is the revenue of NVIDIA?
{"query": "MATCH (m:Financial_Metric {id: \"Revenue\"})-[:INCREASED]->(v:Financial_Value) RETURN m.id, v.id"}
# Whom did Alex Thompson meet with?
{"query": "MATCH (p:Person {id: \"Alex Thompson\"})-[:MET_WITH]-(m:Person) RETURN m.id"}
# How are Alex Thompson and Daniel Reed related?
{"query": "MATCH (a:Person {id: \"Alex Thompson\"})-[r]-(b:Person {id: \"Daniel Reed\"}) RETURN type(r) AS relationship"}"#;

pub fn build_cypher_prompt(question: &str, schema: &Schema, history: &[QueryTurn]) -> String {
    format!(
        r#"Task: Generate a read-only Cypher statement to query a graph database.

Instructions:
- Use only the node labels and relationship types in the schema below
- Every node has the label Entity plus its type label; its name is the `id` property
- Relationships that are naturally symmetric (meetings, partnerships) should be matched without direction: -[:MET_WITH]-
- All sub queries in a UNION must return the same column names
- Never write to the database: no CREATE, MERGE, DELETE, SET, REMOVE or DROP
- If the question cannot be answered from this schema, return {{"query": "", "refusal": "<why>"}}

Respond with a JSON object {{"query": "<cypher>"}} and nothing else.

Examples:
{EXAMPLES}

Schema:
{schema}
{history}
The question is:
{question}"#,
        schema = schema.describe(),
        history = render_history(history),
    )
}

/// Second and last translation attempt, after the store rejected the first
pub fn build_correction_prompt(
    question: &str,
    schema: &Schema,
    failed_query: &str,
    store_message: &str,
) -> String {
    format!(
        r#"The Cypher statement below was rejected by the database.

Question: {question}

Statement:
{failed_query}

Database error:
{store_message}

Schema:
{schema}

Fix the statement so it answers the question. It must stay read-only.
Respond with a JSON object {{"query": "<cypher>"}} and nothing else."#,
        schema = schema.describe(),
    )
}

pub fn build_answer_prompt(question: &str, rows: &[Row]) -> String {
    let results = serde_json::to_string_pretty(rows).unwrap_or_else(|_| format!("{rows:?}"));

    format!(
        r#"You are an AI assistant that turns database query results into a human-readable answer.

Question: {question}
Database Results:
{results}

INSTRUCTIONS:
- Use only the information in the results; add nothing that is not in them
- Include all of the information from the results in your answer
- If the results are empty or null, say so clearly
- Do not apologize or explain how the answer was produced

ANSWER:"#
    )
}

fn render_history(history: &[QueryTurn]) -> String {
    if history.is_empty() {
        return String::new();
    }

    let mut out = String::from("\nConversation so far:\n");
    for turn in history {
        out.push_str(&format!(
            "Q: {}\nCypher: {}\nA: {}\n",
            turn.question, turn.generated_query, turn.answer
        ));
    }
    out
}
