use std::sync::Arc;
use std::time::Duration;

use extract::mock::ScriptedModel;
use extract::{ModelError, OutputFormat, Schema};
use index::{MemoryGraphStore, StoreError};
use query::{NO_ANSWER, QueryError, QueryTranslator, SessionStore, TranslatorConfig};
use serde_json::json;

const FOUNDER_QUERY: &str =
    r#"{"query": "MATCH (p:Person)-[:FOUNDED]->(o:Organization {id: \"Genesis Bank\"}) RETURN p.id"}"#;

fn schema() -> Schema {
    Schema::new(["Person", "Organization"], ["FOUNDED", "HIRED"], Vec::<String>::new())
}

fn translator(model: &Arc<ScriptedModel>, store: &Arc<MemoryGraphStore>) -> QueryTranslator {
    QueryTranslator::new(
        model.clone(),
        store.clone(),
        TranslatorConfig {
            row_limit: 10,
            timeout: Duration::from_secs(5),
            history_turns: 3,
        },
    )
}

#[tokio::test]
async fn founder_question_is_answered_from_rows() {
    let model = Arc::new(ScriptedModel::with_responses([
        FOUNDER_QUERY,
        "Genesis Bank was founded by Alex Thompson.",
    ]));
    let store = Arc::new(MemoryGraphStore::new());
    store.push_rows(vec![json!({"p.id": "Alex Thompson"})]);
    let sessions = SessionStore::new();

    let turn = translator(&model, &store)
        .ask(&sessions, "s1", "Who founded Genesis Bank?", &schema())
        .await
        .unwrap();

    assert!(turn.answer.contains("Alex Thompson"));
    assert!(turn.generated_query.contains("FOUNDED"));
    assert_eq!(turn.result_rows.len(), 1);

    let calls = model.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].format, OutputFormat::Json);
    assert!(calls[0].prompt.contains("Who founded Genesis Bank?"));
    assert_eq!(calls[1].format, OutputFormat::Text);
    assert!(calls[1].prompt.contains("Alex Thompson"));

    assert_eq!(store.reads().len(), 1);
    assert_eq!(sessions.history("s1").await.len(), 1);
}

#[tokio::test]
async fn empty_result_gives_no_answer_without_model_call() {
    let model = Arc::new(ScriptedModel::with_responses([FOUNDER_QUERY]));
    let store = Arc::new(MemoryGraphStore::new());
    let sessions = SessionStore::new();

    let turn = translator(&model, &store)
        .ask(&sessions, "s1", "Who founded Genesis Bank?", &schema())
        .await
        .unwrap();

    assert_eq!(turn.answer, NO_ANSWER);
    assert!(turn.result_rows.is_empty());
    assert_eq!(model.call_count(), 1);
}

#[tokio::test]
async fn syntax_error_is_corrected_once_then_fails() {
    let model = Arc::new(ScriptedModel::with_responses([
        r#"{"query": "MATCH (p:Person)-[:FOUNDED]->(o) RETRUN p.id"}"#,
        r#"{"query": "MATCH (p:Person)-[:FOUNDED]->(o) RETURN p.idd("}"#,
    ]));
    let store = Arc::new(MemoryGraphStore::new());
    store.push_read(Err(StoreError::Syntax("Invalid input 'RETRUN'".to_string())));
    store.push_read(Err(StoreError::Syntax("Invalid input '('".to_string())));
    let sessions = SessionStore::new();

    let err = translator(&model, &store)
        .ask(&sessions, "s1", "Who founded Genesis Bank?", &schema())
        .await
        .unwrap_err();

    match err {
        QueryError::Execution { query, message, .. } => {
            assert!(query.contains("p.idd("));
            assert_eq!(message, "Invalid input '('");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(store.reads().len(), 2);
    assert_eq!(model.call_count(), 2);
    assert!(model.calls()[1].prompt.contains("Invalid input 'RETRUN'"));
    assert!(sessions.history("s1").await.is_empty());
}

#[tokio::test]
async fn corrected_query_can_succeed() {
    let model = Arc::new(ScriptedModel::with_responses([
        r#"{"query": "MATCH (p:Person)-[:FOUNDED]->(o) RETRUN p.id"}"#,
        FOUNDER_QUERY,
        "Alex Thompson founded Genesis Bank.",
    ]));
    let store = Arc::new(MemoryGraphStore::new());
    store.push_read(Err(StoreError::Syntax("Invalid input 'RETRUN'".to_string())));
    store.push_rows(vec![json!({"p.id": "Alex Thompson"})]);

    let turn = translator(&model, &store)
        .answer("Who founded Genesis Bank?", &schema(), &[])
        .await
        .unwrap();

    assert!(turn.generated_query.contains("Genesis Bank"));
    assert_eq!(store.reads().len(), 2);
}

#[tokio::test]
async fn non_syntax_store_errors_are_not_retried() {
    let model = Arc::new(ScriptedModel::with_responses([FOUNDER_QUERY]));
    let store = Arc::new(MemoryGraphStore::new());
    store.push_read(Err(StoreError::Timeout(Duration::from_secs(5))));

    let err = translator(&model, &store)
        .answer("Who founded Genesis Bank?", &schema(), &[])
        .await
        .unwrap_err();

    assert!(matches!(err, QueryError::Execution { .. }));
    assert_eq!(model.call_count(), 1);
    assert_eq!(store.reads().len(), 1);
}

#[tokio::test]
async fn write_queries_and_refusals_never_reach_the_store() {
    let model = Arc::new(ScriptedModel::with_responses([
        r#"{"query": "MATCH (n) DETACH DELETE n"}"#,
        r#"{"query": "", "refusal": "The graph holds no weather data."}"#,
    ]));
    let store = Arc::new(MemoryGraphStore::new());
    let translator = translator(&model, &store);

    let err = translator
        .answer("Delete everything", &schema(), &[])
        .await
        .unwrap_err();
    assert!(matches!(err, QueryError::Translation { .. }));

    let err = translator
        .answer("What is the weather?", &schema(), &[])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("weather data"));
    assert_eq!(err.question(), "What is the weather?");

    assert!(store.reads().is_empty());
}

#[tokio::test]
async fn model_failure_is_surfaced() {
    let model = Arc::new(ScriptedModel::new());
    model.push_error(ModelError::Status {
        status: 503,
        body: "overloaded".to_string(),
    });
    let store = Arc::new(MemoryGraphStore::new());

    let err = translator(&model, &store)
        .answer("Who founded Genesis Bank?", &schema(), &[])
        .await
        .unwrap_err();
    assert!(matches!(err, QueryError::Model { .. }));
}

#[tokio::test]
async fn follow_up_questions_see_the_conversation() {
    let model = Arc::new(ScriptedModel::with_responses([
        FOUNDER_QUERY,
        "Alex Thompson founded Genesis Bank.",
        r#"{"query": "MATCH (p:Person {id: \"Alex Thompson\"})-[:HIRED]->(h:Person) RETURN h.id"}"#,
        "Alex Thompson hired Daniel Reed.",
    ]));
    let store = Arc::new(MemoryGraphStore::new());
    store.push_rows(vec![json!({"p.id": "Alex Thompson"})]);
    store.push_rows(vec![json!({"h.id": "Daniel Reed"})]);
    let sessions = SessionStore::new();
    let translator = translator(&model, &store);

    translator
        .ask(&sessions, "s1", "Who founded Genesis Bank?", &schema())
        .await
        .unwrap();
    translator
        .ask(&sessions, "s1", "Whom did he hire?", &schema())
        .await
        .unwrap();

    let follow_up = &model.calls()[2].prompt;
    assert!(follow_up.contains("Q: Who founded Genesis Bank?"));
    assert!(follow_up.contains("A: Alex Thompson founded Genesis Bank."));
    assert_eq!(sessions.history("s1").await.len(), 2);

    sessions.clear_session("s1");
    assert!(sessions.history("s1").await.is_empty());
}
