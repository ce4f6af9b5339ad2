use std::time::Duration;

use anyhow::{Context, Result, ensure};
use extract::{MergeConfig, Schema, SchemaMode, SynonymPolicy};
use ingest::ChunkerConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub graph: GraphConfig,
    pub model: ModelConfig,
    pub chunking: ChunkingConfig,
    pub schema: SchemaConfig,
    pub concurrency: ConcurrencyConfig,
    pub query: QueryConfig,
    pub retry: RetryConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    pub url: String,
    pub username: String,
    pub password: String,
    pub write_timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ModelProvider {
    #[default]
    Ollama,
    Openai,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub provider: ModelProvider,
    /// Provider default when unset
    pub base_url: Option<String>,
    /// Provider default when unset
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub temperature: f32,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub max_size: usize,
    pub overlap: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaConfig {
    pub mode: SchemaMode,
    pub entity_types: Vec<String>,
    pub relationship_types: Vec<String>,
    pub irreflexive: Vec<String>,
    pub synonyms: Vec<(String, String)>,
    pub synonym_policy: SynonymPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    pub max_concurrent_extractions: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    pub row_limit: usize,
    pub timeout_secs: u64,
    pub history_turns: usize,
    /// Sessions kept before the least recently used is forgotten
    pub max_sessions: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            url: "bolt://localhost:7687".to_string(),
            username: "neo4j".to_string(),
            password: String::new(),
            write_timeout_secs: 60,
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: ModelProvider::Ollama,
            base_url: None,
            model: None,
            api_key: None,
            temperature: 0.0,
            timeout_secs: 120,
        }
    }
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        let defaults = ChunkerConfig::default();
        Self {
            max_size: defaults.max_size,
            overlap: defaults.overlap,
        }
    }
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_concurrent_extractions: 4,
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            row_limit: 100,
            timeout_secs: 30,
            history_turns: 5,
            max_sessions: 1000,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff_ms: 500,
            max_backoff_ms: 8000,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:3000".to_string(),
        }
    }
}

impl ModelConfig {
    pub fn base_url(&self) -> &str {
        match (&self.base_url, self.provider) {
            (Some(url), _) => url,
            (None, ModelProvider::Ollama) => "http://localhost:11434",
            (None, ModelProvider::Openai) => "https://api.openai.com/v1",
        }
    }

    pub fn model(&self) -> &str {
        match (&self.model, self.provider) {
            (Some(model), _) => model,
            (None, ModelProvider::Ollama) => "llama3",
            (None, ModelProvider::Openai) => "gpt-4o-mini",
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl SchemaConfig {
    pub fn seed(&self) -> Schema {
        Schema::new(&self.entity_types, &self.relationship_types, &self.irreflexive)
    }

    pub fn merge_config(&self) -> MergeConfig {
        MergeConfig {
            policy: self.synonym_policy,
            synonyms: self.synonyms.clone(),
        }
    }
}

impl ChunkingConfig {
    pub fn chunker(&self) -> ChunkerConfig {
        ChunkerConfig {
            max_size: self.max_size,
            overlap: self.overlap,
        }
    }
}

impl AppConfig {
    /// Load from the file named by `DOC2GRAPH_CONFIG` (if any), then apply
    /// environment overrides
    pub fn load() -> Result<Self> {
        Self::load_with(|key| std::env::var(key).ok())
    }

    pub fn load_with(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = match lookup("DOC2GRAPH_CONFIG") {
            Some(path) => {
                let content = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read config file {path}"))?;
                Self::from_toml(&content).with_context(|| format!("Invalid config file {path}"))?
            }
            None => Self::default(),
        };

        config.apply_env(lookup)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Environment variables:
    /// - NEO4J_URL, NEO4J_USERNAME, NEO4J_PASSWORD: graph store connection
    /// - OPENAI_API_KEY: API key for the openai provider
    /// - DOC2GRAPH_MODEL_PROVIDER: ollama | openai
    /// - DOC2GRAPH_MODEL, DOC2GRAPH_MODEL_URL: model name and endpoint
    /// - DOC2GRAPH_SCHEMA_MODE: open | fixed
    /// - DOC2GRAPH_MAX_CONCURRENT_EXTRACTIONS
    /// - DOC2GRAPH_BIND: listen address
    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(url) = lookup("NEO4J_URL") {
            self.graph.url = url;
        }
        if let Some(username) = lookup("NEO4J_USERNAME") {
            self.graph.username = username;
        }
        if let Some(password) = lookup("NEO4J_PASSWORD") {
            self.graph.password = password;
        }
        if let Some(key) = lookup("OPENAI_API_KEY") {
            self.model.api_key = Some(key);
        }
        if let Some(provider) = lookup("DOC2GRAPH_MODEL_PROVIDER") {
            self.model.provider = parse_enum(&provider).context("DOC2GRAPH_MODEL_PROVIDER")?;
        }
        if let Some(model) = lookup("DOC2GRAPH_MODEL") {
            self.model.model = Some(model);
        }
        if let Some(url) = lookup("DOC2GRAPH_MODEL_URL") {
            self.model.base_url = Some(url);
        }
        if let Some(mode) = lookup("DOC2GRAPH_SCHEMA_MODE") {
            self.schema.mode = parse_enum(&mode).context("DOC2GRAPH_SCHEMA_MODE")?;
        }
        if let Some(n) = lookup("DOC2GRAPH_MAX_CONCURRENT_EXTRACTIONS") {
            self.concurrency.max_concurrent_extractions =
                n.parse().context("DOC2GRAPH_MAX_CONCURRENT_EXTRACTIONS")?;
        }
        if let Some(bind) = lookup("DOC2GRAPH_BIND") {
            self.server.bind = bind;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.chunking.max_size > 0, "chunking.max_size must be positive");
        ensure!(
            self.chunking.overlap < self.chunking.max_size,
            "chunking.overlap ({}) must be smaller than chunking.max_size ({})",
            self.chunking.overlap,
            self.chunking.max_size
        );
        ensure!(
            self.concurrency.max_concurrent_extractions > 0,
            "concurrency.max_concurrent_extractions must be positive"
        );
        ensure!(self.query.row_limit > 0, "query.row_limit must be positive");
        ensure!(self.query.max_sessions > 0, "query.max_sessions must be positive");

        if self.schema.mode == SchemaMode::Fixed {
            let seed = self.schema.seed();
            ensure!(
                !seed.entity_types.is_empty() && !seed.relationship_types.is_empty(),
                "fixed schema mode needs at least one entity type and one relationship type"
            );
        }
        if self.model.provider == ModelProvider::Openai {
            ensure!(
                self.model.api_key.as_deref().is_some_and(|k| !k.is_empty()),
                "the openai provider needs an API key (OPENAI_API_KEY)"
            );
        }
        Ok(())
    }
}

/// Parse a lowercase enum name the same way the config file does
fn parse_enum<T: serde::de::DeserializeOwned>(value: &str) -> Result<T> {
    let value = value.trim().to_lowercase();
    serde_json::from_value(serde_json::Value::String(value.clone()))
        .with_context(|| format!("unknown value '{value}'"))
}
