mod config;
mod metrics;
mod retry;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use extract::{
    CompletionModel, OllamaClient, OpenAiClient, RelationshipPattern, Schema, SchemaRegistry, Triple,
};
use index::{GraphStore, Neo4jStore, Pipeline, PipelineConfig, PipelineError, Statement};
use ingest::IngestError;
use query::{QueryError, QueryTranslator, QueryTurn, SessionStore, TranslatorConfig};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::EnvFilter;

use crate::config::{AppConfig, ModelConfig, ModelProvider};
use crate::metrics::{Metrics, MetricsSnapshot, TimedOperation};
use crate::retry::RetryPolicy;

const MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
struct AppState {
    pipeline: Arc<Pipeline>,
    translator: Arc<QueryTranslator>,
    sessions: Arc<SessionStore>,
    store: Arc<dyn GraphStore>,
    model_name: String,
    metrics: Arc<Metrics>,
    /// Parent of every request's cancellation token
    shutdown: CancellationToken,
}

impl AppState {
    fn new(
        config: &AppConfig,
        store: Arc<dyn GraphStore>,
        model: Arc<dyn CompletionModel>,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let registry = Arc::new(SchemaRegistry::new(config.schema.mode, config.schema.seed()));

        let pipeline = Pipeline::new(
            Arc::clone(&store),
            Arc::clone(&model),
            registry,
            &config.schema.merge_config(),
            config.chunking.chunker(),
            PipelineConfig {
                max_concurrent_extractions: config.concurrency.max_concurrent_extractions,
                write_timeout: Duration::from_secs(config.graph.write_timeout_secs),
                read_timeout: Duration::from_secs(config.query.timeout_secs),
                ..PipelineConfig::default()
            },
        )
        .context("Failed to build ingestion pipeline")?;

        let translator = QueryTranslator::new(
            Arc::clone(&model),
            Arc::clone(&store),
            TranslatorConfig {
                row_limit: config.query.row_limit,
                timeout: Duration::from_secs(config.query.timeout_secs),
                history_turns: config.query.history_turns,
            },
        );

        Ok(Self {
            pipeline: Arc::new(pipeline),
            translator: Arc::new(translator),
            sessions: Arc::new(SessionStore::with_capacity(config.query.max_sessions)),
            model_name: model.name().to_string(),
            store,
            metrics: Metrics::new(),
            shutdown,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = AppConfig::load().context("Failed to load configuration")?;
    tracing::info!(
        graph = %config.graph.url,
        provider = ?config.model.provider,
        model = config.model.model(),
        schema_mode = ?config.schema.mode,
        "Configuration loaded"
    );

    let model = build_model(&config.model)?;

    let retry = RetryPolicy::new(&config.retry);
    let store = retry
        .retry("neo4j connect", || {
            Neo4jStore::connect(&config.graph.url, &config.graph.username, &config.graph.password)
        })
        .await
        .with_context(|| format!("Failed to connect to Neo4j at {}", config.graph.url))?;

    let shutdown = CancellationToken::new();
    let state = AppState::new(&config, Arc::new(store), model, shutdown.clone())?;
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind))?;

    tracing::info!("Server listening on http://{}", config.server.bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await
        .context("Server error")?;

    tracing::info!("Server stopped");
    Ok(())
}

/// `RUST_LOG` filter (default `info`); JSON lines when `DOC2GRAPH_LOG_FORMAT=json`
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("DOC2GRAPH_LOG_FORMAT").is_ok_and(|format| format.eq_ignore_ascii_case("json"));

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

fn build_model(config: &ModelConfig) -> Result<Arc<dyn CompletionModel>> {
    let model: Arc<dyn CompletionModel> = match config.provider {
        ModelProvider::Ollama => Arc::new(OllamaClient::new(
            config.base_url().to_string(),
            config.model().to_string(),
            config.timeout(),
        )?),
        ModelProvider::Openai => {
            let api_key = config
                .api_key
                .clone()
                .context("OPENAI_API_KEY is required for the openai provider")?;
            Arc::new(OpenAiClient::new(
                config.base_url().to_string(),
                config.model().to_string(),
                api_key,
                config.temperature,
                config.timeout(),
            )?)
        }
    };
    Ok(model)
}

async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested, cancelling in-flight ingestion");
    shutdown.cancel();
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(get_metrics))
        .route("/documents", post(ingest_document))
        .route(
            "/documents/:doc_id/pending",
            get(list_pending).put(commit_pending).delete(discard_pending),
        )
        .route("/documents/:doc_id/patterns", get(list_patterns))
        .route("/query", post(ask_question))
        .route("/sessions/:session_id", delete(clear_session))
        .route("/graph", get(export_graph))
        .route("/graph/reset", post(reset_graph))
        .route("/stats", get(get_stats))
        .route("/schema", get(get_schema).put(pin_schema))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ----- errors -----

enum AppError {
    Pipeline(PipelineError),
    Query(QueryError),
    BadRequest(String),
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        AppError::Pipeline(err)
    }
}

impl From<QueryError> for AppError {
    fn from(err: QueryError) -> Self {
        AppError::Query(err)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    code: String,
    message: String,
}

impl AppError {
    fn status(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::Pipeline(err) => match err {
                PipelineError::Input(IngestError::UnsupportedFormat(_)) => {
                    (StatusCode::UNSUPPORTED_MEDIA_TYPE, "unsupported_format")
                }
                PipelineError::Input(IngestError::CorruptFile { .. }) => {
                    (StatusCode::UNPROCESSABLE_ENTITY, "corrupt_file")
                }
                PipelineError::Input(IngestError::InvalidChunking { .. })
                | PipelineError::InvalidChunking { .. } => (StatusCode::BAD_REQUEST, "invalid_chunking"),
                PipelineError::Cancelled { .. } => (StatusCode::SERVICE_UNAVAILABLE, "cancelled"),
                PipelineError::NoPendingRelationships(_) => (StatusCode::NOT_FOUND, "no_pending_relationships"),
                PipelineError::EmptySchema => (StatusCode::BAD_REQUEST, "empty_schema"),
                PipelineError::Commit(_) => (StatusCode::SERVICE_UNAVAILABLE, "commit_failed"),
                PipelineError::Store(_) => (StatusCode::BAD_GATEWAY, "graph_store_error"),
            },
            AppError::Query(err) => match err {
                QueryError::Translation { .. } => (StatusCode::UNPROCESSABLE_ENTITY, "translation_failed"),
                QueryError::Execution { .. } => (StatusCode::BAD_GATEWAY, "query_execution_failed"),
                QueryError::Model { .. } => (StatusCode::BAD_GATEWAY, "model_error"),
            },
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
        }
    }

    fn message(&self) -> String {
        match self {
            AppError::Pipeline(err) => err.to_string(),
            AppError::Query(err) => err.to_string(),
            AppError::BadRequest(message) => message.clone(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = self.status();
        let message = self.message();

        if status.is_server_error() {
            tracing::error!(code, %message, "Request failed");
        } else {
            tracing::warn!(code, %message, "Request rejected");
        }

        let body = ErrorBody {
            code: code.to_string(),
            message,
        };
        (status, Json(body)).into_response()
    }
}

// ----- documents -----

#[derive(Deserialize)]
struct IngestParams {
    file_type: String,
    #[serde(default)]
    stage: bool,
}

async fn ingest_document(
    State(state): State<AppState>,
    Query(params): Query<IngestParams>,
    body: Bytes,
) -> Result<Response, AppError> {
    let timer = TimedOperation::start();
    let cancel = state.shutdown.child_token();

    if params.stage {
        let staged = state
            .pipeline
            .stage_document(&body, &params.file_type, &cancel)
            .await
            .inspect_err(|_| state.metrics.record_document_failure())?;
        state.metrics.record_staged(staged.failed_chunks.len());
        return Ok(Json(staged).into_response());
    }

    let result = state
        .pipeline
        .ingest_document(&body, &params.file_type, &cancel)
        .await
        .inspect_err(|_| state.metrics.record_document_failure())?;
    state.metrics.record_commit(timer.elapsed(), &result);

    Ok((StatusCode::CREATED, Json(result)).into_response())
}

async fn list_pending(
    State(state): State<AppState>,
    Path(doc_id): Path<String>,
) -> Result<Json<Vec<Triple>>, AppError> {
    Ok(Json(state.pipeline.list_pending_relationships(&doc_id)?))
}

async fn list_patterns(
    State(state): State<AppState>,
    Path(doc_id): Path<String>,
) -> Result<Response, AppError> {
    Ok(Json(state.pipeline.relationship_patterns(&doc_id)?).into_response())
}

async fn commit_pending(
    State(state): State<AppState>,
    Path(doc_id): Path<String>,
    Json(triples): Json<Vec<Triple>>,
) -> Result<Response, AppError> {
    let timer = TimedOperation::start();
    let result = state.pipeline.commit_edited(&doc_id, triples).await?;
    state.metrics.record_commit(timer.elapsed(), &result);

    Ok((StatusCode::CREATED, Json(result)).into_response())
}

async fn discard_pending(
    State(state): State<AppState>,
    Path(doc_id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.pipeline.discard_pending(&doc_id)?;
    Ok(StatusCode::NO_CONTENT)
}

// ----- questions -----

#[derive(Deserialize)]
struct QueryRequest {
    question: String,
    session_id: Option<String>,
}

#[derive(Serialize)]
struct QueryResponse {
    session_id: String,
    #[serde(flatten)]
    turn: QueryTurn,
}

async fn ask_question(
    State(state): State<AppState>,
    Json(req): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, AppError> {
    let question = req.question.trim();
    if question.is_empty() {
        return Err(AppError::BadRequest("question must not be empty".to_string()));
    }
    let session_id = req
        .session_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let timer = TimedOperation::start();
    let schema = state.pipeline.schema().await?;
    let result = state
        .translator
        .ask(&state.sessions, &session_id, question, &schema)
        .await;
    state.metrics.record_query(timer.elapsed(), result.is_ok());

    Ok(Json(QueryResponse {
        session_id,
        turn: result?,
    }))
}

#[derive(Serialize)]
struct ClearSessionResponse {
    cleared: bool,
}

async fn clear_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Json<ClearSessionResponse> {
    Json(ClearSessionResponse {
        cleared: state.sessions.clear_session(&session_id),
    })
}

// ----- graph -----

#[derive(Deserialize)]
struct ResetParams {
    /// Also forget learned schema types
    #[serde(default)]
    schema: bool,
}

async fn reset_graph(
    State(state): State<AppState>,
    Query(params): Query<ResetParams>,
) -> Result<StatusCode, AppError> {
    state.pipeline.reset_graph(params.schema).await?;
    tracing::info!(reset_schema = params.schema, "Graph reset");
    Ok(StatusCode::NO_CONTENT)
}

async fn export_graph(State(state): State<AppState>) -> Result<Response, AppError> {
    Ok(Json(state.pipeline.export_graph().await?).into_response())
}

async fn get_stats(State(state): State<AppState>) -> Result<Response, AppError> {
    Ok(Json(state.pipeline.stats().await?).into_response())
}

async fn get_schema(State(state): State<AppState>) -> Result<Response, AppError> {
    Ok(Json(state.pipeline.schema().await?).into_response())
}

#[derive(Deserialize)]
struct PinSchemaRequest {
    patterns: Vec<RelationshipPattern>,
}

/// Switch to a fixed schema built from reviewed relationship patterns
async fn pin_schema(
    State(state): State<AppState>,
    Json(req): Json<PinSchemaRequest>,
) -> Result<Json<Schema>, AppError> {
    Ok(Json(state.pipeline.pin_schema(&req.patterns)?))
}

// ----- service -----

#[derive(Serialize)]
struct HealthResponse {
    graph_store: String,
    model: String,
}

async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let (status, graph_store) = match state
        .store
        .run_read(Statement::new("RETURN 1 AS ok"), 1, HEALTH_TIMEOUT)
        .await
    {
        Ok(_) => (StatusCode::OK, format!("{}: ok", state.store.name())),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            format!("{}: error: {}", state.store.name(), e),
        ),
    };

    (
        status,
        Json(HealthResponse {
            graph_store,
            model: state.model_name.clone(),
        }),
    )
}

async fn get_metrics(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.metrics.snapshot())
}
