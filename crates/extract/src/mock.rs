//! Scripted completion model for tests
//!
//! Lets extraction and query code run without a live model. Responses are
//! served from a queue first, then from an optional responder closure; every
//! call is recorded so tests can assert on the prompts that were sent.

use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::ModelError;
use crate::llm::{CompletionModel, OutputFormat};

type Responder = Box<dyn Fn(&str, OutputFormat) -> Result<String, ModelError> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub prompt: String,
    pub format: OutputFormat,
}

pub struct ScriptedModel {
    queue: Mutex<VecDeque<Result<String, ModelError>>>,
    responder: Option<Responder>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            responder: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Serve these responses in order
    pub fn with_responses<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let model = Self::new();
        for response in responses {
            model.push_response(response);
        }
        model
    }

    /// Answer every call that the queue does not cover
    pub fn from_fn<F>(responder: F) -> Self
    where
        F: Fn(&str, OutputFormat) -> Result<String, ModelError> + Send + Sync + 'static,
    {
        Self {
            responder: Some(Box::new(responder)),
            ..Self::new()
        }
    }

    pub fn push_response(&self, response: impl Into<String>) {
        self.queue.lock().push_back(Ok(response.into()));
    }

    pub fn push_error(&self, error: ModelError) {
        self.queue.lock().push_back(Err(error));
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

impl Default for ScriptedModel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CompletionModel for ScriptedModel {
    async fn complete(&self, prompt: &str, format: OutputFormat) -> Result<String, ModelError> {
        self.calls.lock().push(RecordedCall {
            prompt: prompt.to_string(),
            format,
        });

        if let Some(next) = self.queue.lock().pop_front() {
            return next;
        }

        match &self.responder {
            Some(responder) => responder(prompt, format),
            None => Err(ModelError::Request("no scripted response left".to_string())),
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_queue_then_responder() {
        let model = ScriptedModel::from_fn(|_, _| Ok("fallback".to_string()));
        model.push_response("first");

        assert_eq!(model.complete("a", OutputFormat::Text).await.unwrap(), "first");
        assert_eq!(model.complete("b", OutputFormat::Json).await.unwrap(), "fallback");
        assert_eq!(model.call_count(), 2);
        assert_eq!(model.calls()[1].format, OutputFormat::Json);
    }

    #[tokio::test]
    async fn test_exhausted_queue_errors() {
        let model = ScriptedModel::with_responses(["only"]);
        model.complete("a", OutputFormat::Text).await.unwrap();
        assert!(model.complete("b", OutputFormat::Text).await.is_err());
    }
}
