use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use extract::{CompletionModel, ModelError, OutputFormat, Schema, strip_code_fences};
use index::{GraphStore, Row, Statement, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::QueryError;
use crate::history::{QueryTurn, SessionStore};
use crate::prompt;

/// Clauses that would modify the graph
const WRITE_CLAUSES: &[&str] = &["CREATE", "MERGE", "DELETE", "DETACH", "SET", "REMOVE", "DROP"];

const READ_STARTS: &[&str] = &["MATCH", "OPTIONAL", "CALL", "WITH", "UNWIND", "RETURN"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryStage {
    Received,
    Translated,
    Executed,
    Answered,
    Failed,
}

impl fmt::Display for QueryStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QueryStage::Received => "received",
            QueryStage::Translated => "translated",
            QueryStage::Executed => "executed",
            QueryStage::Answered => "answered",
            QueryStage::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct TranslatorConfig {
    pub row_limit: usize,
    pub timeout: Duration,
    /// Past turns included in the translation prompt
    pub history_turns: usize,
}

impl Default for TranslatorConfig {
    fn default() -> Self {
        Self {
            row_limit: 100,
            timeout: Duration::from_secs(30),
            history_turns: 5,
        }
    }
}

/// Natural-language questions in, grounded answers out
pub struct QueryTranslator {
    model: Arc<dyn CompletionModel>,
    store: Arc<dyn GraphStore>,
    config: TranslatorConfig,
}

impl QueryTranslator {
    pub fn new(
        model: Arc<dyn CompletionModel>,
        store: Arc<dyn GraphStore>,
        config: TranslatorConfig,
    ) -> Self {
        Self {
            model,
            store,
            config,
        }
    }

    /// Answer a question within a session and record the turn.
    ///
    /// The session stays locked for the whole turn, so questions from the same
    /// session are answered one at a time. Failed questions are not recorded.
    pub async fn ask(
        &self,
        sessions: &SessionStore,
        session_id: &str,
        question: &str,
        schema: &Schema,
    ) -> Result<QueryTurn, QueryError> {
        let session = sessions.session(session_id);
        let mut history = session.lock().await;

        let turn = self
            .answer(question, schema, history.recent(self.config.history_turns))
            .await?;
        history.append(turn.clone());
        Ok(turn)
    }

    pub async fn answer(
        &self,
        question: &str,
        schema: &Schema,
        history: &[QueryTurn],
    ) -> Result<QueryTurn, QueryError> {
        log_stage(QueryStage::Received, question);

        let result = self.run(question, schema, history).await;
        match &result {
            Ok(_) => log_stage(QueryStage::Answered, question),
            Err(err) => {
                tracing::warn!(stage = %QueryStage::Failed, question = %question, error = %err, "Query failed");
            }
        }
        result
    }

    async fn run(
        &self,
        question: &str,
        schema: &Schema,
        history: &[QueryTurn],
    ) -> Result<QueryTurn, QueryError> {
        let prompt = prompt::build_cypher_prompt(question, schema, history);
        let raw = self.complete(question, &prompt, OutputFormat::Json).await?;
        let mut query = read_query(question, &raw)?;
        log_stage(QueryStage::Translated, question);
        tracing::debug!(query = %query, "Generated query");

        let mut corrected = false;
        let rows = loop {
            match self.execute(&query).await {
                Ok(rows) => break rows,
                Err(err) if err.is_syntax() && !corrected => {
                    corrected = true;
                    tracing::warn!(query = %query, error = %err, "Query rejected, asking for a correction");

                    let prompt = prompt::build_correction_prompt(question, schema, &query, &err.message());
                    let raw = self.complete(question, &prompt, OutputFormat::Json).await?;
                    query = read_query(question, &raw)?;
                    tracing::debug!(query = %query, "Corrected query");
                }
                Err(err) => {
                    return Err(QueryError::Execution {
                        question: question.to_string(),
                        query,
                        message: err.message(),
                    });
                }
            }
        };
        tracing::info!(stage = %QueryStage::Executed, rows = rows.len(), "Query executed");

        let answer = if rows.is_empty() {
            prompt::NO_ANSWER.to_string()
        } else {
            let prompt = prompt::build_answer_prompt(question, &rows);
            self.complete(question, &prompt, OutputFormat::Text)
                .await?
                .trim()
                .to_string()
        };

        Ok(QueryTurn {
            question: question.to_string(),
            generated_query: query,
            result_rows: rows,
            answer,
            timestamp: Utc::now(),
        })
    }

    async fn execute(&self, query: &str) -> Result<Vec<Row>, StoreError> {
        self.store
            .run_read(Statement::new(query), self.config.row_limit, self.config.timeout)
            .await
    }

    async fn complete(
        &self,
        question: &str,
        prompt: &str,
        format: OutputFormat,
    ) -> Result<String, QueryError> {
        self.model
            .complete(prompt, format)
            .await
            .map_err(|source: ModelError| QueryError::Model {
                question: question.to_string(),
                source,
            })
    }
}

fn log_stage(stage: QueryStage, question: &str) {
    tracing::info!(stage = %stage, question = %question, "Query stage");
}

/// Pull the query out of the model's reply and make sure it only reads
fn read_query(question: &str, raw: &str) -> Result<String, QueryError> {
    let fail = |reason: String| QueryError::Translation {
        question: question.to_string(),
        reason,
    };

    let body = strip_code_fences(raw);
    let query = match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(map)) => {
            let query = map.get("query").and_then(Value::as_str).unwrap_or("").trim();
            if query.is_empty() {
                let refusal = map
                    .get("refusal")
                    .or_else(|| map.get("error"))
                    .and_then(Value::as_str)
                    .unwrap_or("model returned no query");
                return Err(fail(refusal.to_string()));
            }
            query.to_string()
        }
        Ok(_) => return Err(fail("expected a JSON object with a query field".to_string())),
        // Bare Cypher is accepted as long as it reads like a query
        Err(_) if starts_like_query(body) => body.to_string(),
        Err(_) => return Err(fail(format!("model did not return a query: {}", truncate(body, 200)))),
    };

    if let Some(clause) = write_clause(&query) {
        return Err(fail(format!("generated query contains write clause {clause}")));
    }

    Ok(query)
}

fn starts_like_query(text: &str) -> bool {
    let first = text.split_whitespace().next().unwrap_or("").to_uppercase();
    READ_STARTS.contains(&first.as_str())
}

/// The first write clause found outside string literals, if any
pub fn write_clause(query: &str) -> Option<String> {
    let words: Vec<String> = strip_literals(query)
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|w| !w.is_empty())
        .map(str::to_uppercase)
        .collect();

    for (i, word) in words.iter().enumerate() {
        if WRITE_CLAUSES.contains(&word.as_str()) {
            return Some(word.clone());
        }
        if word == "LOAD" && words.get(i + 1).is_some_and(|next| next == "CSV") {
            return Some("LOAD CSV".to_string());
        }
    }
    None
}

/// Blank out quoted strings and backtick-quoted names
fn strip_literals(query: &str) -> String {
    let mut out = String::with_capacity(query.len());
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for c in query.chars() {
        match quote {
            Some(q) => {
                if escaped {
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == q {
                    quote = None;
                }
                out.push(' ');
            }
            None => {
                if c == '"' || c == '\'' || c == '`' {
                    quote = Some(c);
                    out.push(' ');
                } else {
                    out.push(c);
                }
            }
        }
    }
    out
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((i, _)) => format!("{}...", &text[..i]),
        None => text.to_string(),
    }
}
