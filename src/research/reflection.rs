//! Reflection gate: judges extracted info and decides whether to loop.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use super::schema::reflection_schema;
use super::types::{ResearchConfig, StateDelta, StepName, WorkflowState};
use crate::error::{ModelError, ModelResult};
use crate::model::{ModelTask, StructuredModel, StructuredRequest};
use crate::prompts::{render, REFLECTION_INSTRUCTION, REFLECTION_PROMPT};

/// Follow-up queries kept from one reflection.
pub const MAX_FOLLOW_UP_QUERIES: usize = 3;

/// The model's judgement of one extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReflectionVerdict {
    pub is_satisfactory: bool,
    #[serde(default)]
    pub missing_fields: Vec<String>,
    /// Follow-up queries, only meaningful when unsatisfactory.
    #[serde(default, rename = "searchQueries")]
    pub follow_up_queries: Vec<String>,
    #[serde(default)]
    pub reasoning: String,
}

impl ReflectionVerdict {
    /// State delta implied by this verdict.
    ///
    /// A satisfied verdict only records the flag. Otherwise the follow-up
    /// queries are appended and the counter moves to `prior + 1`.
    pub fn to_delta(&self, state: &WorkflowState) -> StateDelta {
        if self.is_satisfactory {
            return StateDelta {
                is_satisfactory: Some(true),
                ..Default::default()
            };
        }

        StateDelta {
            search_queries: self
                .follow_up_queries
                .iter()
                .take(MAX_FOLLOW_UP_QUERIES)
                .cloned()
                .collect(),
            is_satisfactory: Some(false),
            reflection_steps_taken: Some(state.reflection_steps_taken + 1),
            ..Default::default()
        }
    }

    /// Payload of the `reflection` progress event.
    pub fn event_data(&self, delta: &StateDelta) -> Value {
        let mut data = json!({
            "isSatisfactory": self.is_satisfactory,
            "missingFields": self.missing_fields,
            "reasoning": self.reasoning,
        });
        if !self.is_satisfactory {
            data["searchQueries"] = json!(delta.search_queries);
            data["reflectionStepsTaken"] = json!(delta.reflection_steps_taken);
        }
        data
    }
}

/// Stateless judge over extracted info. Counters live in the state.
pub struct ReflectionGate<'a> {
    model: &'a dyn StructuredModel,
}

impl<'a> ReflectionGate<'a> {
    pub fn new(model: &'a dyn StructuredModel) -> Self {
        Self { model }
    }

    /// Ask the model whether `extracted_info` satisfies `schema`.
    pub async fn evaluate(
        &self,
        session_id: &str,
        extracted_info: &Value,
        schema: &Value,
    ) -> ModelResult<ReflectionVerdict> {
        let schema_text = pretty(schema);
        let info_text = pretty(extracted_info);
        let system_prompt = render(
            REFLECTION_PROMPT,
            &[("schema", schema_text.as_str()), ("info", info_text.as_str())],
        );

        let request = StructuredRequest::new(
            ModelTask::Reflect,
            system_prompt,
            REFLECTION_INSTRUCTION,
            reflection_schema(),
        )
        .with_thread_id(session_id);

        let raw = self.model.invoke_structured(request).await?;
        let verdict: ReflectionVerdict =
            serde_json::from_value(raw).map_err(|e| ModelError::SchemaMismatch {
                message: format!("reflection output: {}", e),
            })?;

        debug!(
            session_id = %session_id,
            is_satisfactory = verdict.is_satisfactory,
            missing = verdict.missing_fields.len(),
            "Reflection verdict"
        );

        Ok(verdict)
    }
}

/// Where the engine goes after a reflection pass.
///
/// Satisfied always terminates. Otherwise the run loops while
/// `reflection_steps_taken <= max_reflection_steps`, so a budget of `N`
/// allows at most `N + 1` reflection passes.
pub fn route(state: &WorkflowState, config: &ResearchConfig) -> StepName {
    if state.is_satisfactory == Some(true) {
        return StepName::Terminal;
    }
    if state.reflection_steps_taken <= config.max_reflection_steps {
        StepName::GenerateQueries
    } else {
        StepName::Terminal
    }
}

pub(crate) fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}
