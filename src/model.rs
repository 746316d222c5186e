//! Structured-output language model collaborator.
//!
//! Steps describe what they want as a [`StructuredRequest`]; a
//! [`StructuredModel`] turns it into a JSON object. [`LangbasePipeModel`]
//! runs requests through one Langbase pipe per task.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Instant;
use tracing::{debug, warn};

use crate::config::PipeConfig;
use crate::error::{ModelError, ModelResult};
use crate::langbase::{LangbaseClient, Message, PipeRequest};

/// Which workflow step a model call serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelTask {
    GenerateQueries,
    SynthesizeNotes,
    ExtractSchema,
    Reflect,
}

impl ModelTask {
    /// Get the task name as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelTask::GenerateQueries => "generate_queries",
            ModelTask::SynthesizeNotes => "synthesize_notes",
            ModelTask::ExtractSchema => "extract_schema",
            ModelTask::Reflect => "reflect",
        }
    }
}

/// One structured-output call.
#[derive(Debug, Clone, PartialEq)]
pub struct StructuredRequest {
    pub task: ModelTask,
    pub system_prompt: String,
    pub user_prompt: String,
    /// JSON-schema-like description the output must satisfy.
    pub output_schema: Value,
    /// Session id, used to group provider-side threads.
    pub thread_id: Option<String>,
}

impl StructuredRequest {
    /// Create a request for a task
    pub fn new(
        task: ModelTask,
        system_prompt: impl Into<String>,
        user_prompt: impl Into<String>,
        output_schema: Value,
    ) -> Self {
        Self {
            task,
            system_prompt: system_prompt.into(),
            user_prompt: user_prompt.into(),
            output_schema,
            thread_id: None,
        }
    }

    /// Set the thread ID
    pub fn with_thread_id(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }
}

/// Black-box function from prompt text to a structured object.
///
/// Implementations fail with [`ModelError`] on transport failure or when the
/// output is not a JSON object.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StructuredModel: Send + Sync {
    async fn invoke_structured(&self, request: StructuredRequest) -> ModelResult<Value>;
}

/// [`StructuredModel`] backed by Langbase pipes running in JSON mode.
#[derive(Clone)]
pub struct LangbasePipeModel {
    client: LangbaseClient,
    pipes: PipeConfig,
}

impl LangbasePipeModel {
    /// Create a new model adapter
    pub fn new(client: LangbaseClient, pipes: PipeConfig) -> Self {
        Self { client, pipes }
    }

    fn pipe_for(&self, task: ModelTask) -> &str {
        match task {
            ModelTask::GenerateQueries => &self.pipes.queries,
            ModelTask::SynthesizeNotes => &self.pipes.notes,
            ModelTask::ExtractSchema => &self.pipes.extraction,
            ModelTask::Reflect => &self.pipes.reflection,
        }
    }

    fn build_messages(request: &StructuredRequest) -> Vec<Message> {
        let schema = serde_json::to_string_pretty(&request.output_schema)
            .unwrap_or_else(|_| request.output_schema.to_string());
        vec![
            Message::system(format!(
                "{}\n\nYour response MUST be a single valid JSON object matching this JSON schema:\n{}\n\nRespond with JSON only, no other text.",
                request.system_prompt, schema
            )),
            Message::user(request.user_prompt.clone()),
        ]
    }
}

#[async_trait]
impl StructuredModel for LangbasePipeModel {
    async fn invoke_structured(&self, request: StructuredRequest) -> ModelResult<Value> {
        let start = Instant::now();
        let pipe = self.pipe_for(request.task).to_string();

        let mut pipe_request = PipeRequest::new(&pipe, Self::build_messages(&request));
        if let Some(thread_id) = &request.thread_id {
            pipe_request = pipe_request.with_thread_id(thread_id);
        }

        let response = self.client.call_pipe(pipe_request).await?;
        let value = parse_structured_completion(&response.completion).map_err(|message| {
            warn!(
                pipe = %pipe,
                task = request.task.as_str(),
                error = %message,
                "Pipe returned unparseable output"
            );
            ModelError::Malformed { message }
        })?;

        debug!(
            pipe = %pipe,
            task = request.task.as_str(),
            latency_ms = start.elapsed().as_millis(),
            "Structured completion parsed"
        );

        Ok(value)
    }
}

/// Parse a completion into a JSON object, tolerating markdown fences.
pub fn parse_structured_completion(completion: &str) -> Result<Value, String> {
    let json = extract_json_from_completion(completion)?;
    let value: Value =
        serde_json::from_str(json).map_err(|e| format!("Invalid JSON in completion: {}", e))?;
    if !value.is_object() {
        return Err("Structured output must be a JSON object".to_string());
    }
    Ok(value)
}

/// Extract JSON from a completion string, handling markdown code blocks.
///
/// Attempts extraction in this order:
/// 1. Raw JSON (fast path)
/// 2. ```json ... ``` code blocks
/// 3. ``` ... ``` code blocks
pub(crate) fn extract_json_from_completion(completion: &str) -> Result<&str, String> {
    let trimmed = completion.trim();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return Ok(trimmed);
    }

    if completion.contains("```json") {
        return completion
            .split("```json")
            .nth(1)
            .and_then(|s| s.split("```").next())
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| "Found ```json block but content was empty or malformed".to_string());
    }

    if completion.contains("```") {
        return completion
            .split("```")
            .nth(1)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| "Found ``` block but content was empty or malformed".to_string());
    }

    Err(format!(
        "No JSON found in response. First 100 chars: '{}'",
        completion.chars().take(100).collect::<String>()
    ))
}
