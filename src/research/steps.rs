//! The model- and search-backed workflow steps.
//!
//! Every step reads `&WorkflowState` and returns only the fields it owns as a
//! [`StateDelta`]. Merging is the engine's job.

use serde_json::{json, Value};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use super::format::{dedupe_sources, format_notes, format_sources};
use super::reflection::{pretty, ReflectionGate};
use super::runner::StepOutput;
use super::schema::{notes_schema, queries_schema, validate_against};
use super::types::{event_names, Session, StateDelta, StepName, WorkflowState};
use crate::error::{EngineError, EngineResult, ModelError, SearchError};
use crate::model::{ModelTask, StructuredModel, StructuredRequest};
use crate::prompts::{
    render, EXTRACTION_INSTRUCTION, EXTRACTION_PROMPT, NOTES_INSTRUCTION, NOTES_PROMPT,
    QUERY_WRITER_INSTRUCTION, QUERY_WRITER_PROMPT,
};
use crate::search::{SearchHit, SearchProvider};

/// Collaborators and settings shared by every step of one run.
pub struct StepContext<'a> {
    pub session: &'a Session,
    pub model: &'a dyn StructuredModel,
    pub search: Arc<dyn SearchProvider>,
    pub max_tokens_per_source: usize,
}

impl StepContext<'_> {
    /// Run the computation for `step`.
    pub async fn run(&self, step: StepName, state: &WorkflowState) -> EngineResult<StepOutput> {
        match step {
            StepName::GenerateQueries => generate_queries(self, state).await,
            StepName::ExecuteSearch => execute_search(self, state).await,
            StepName::Synthesize => synthesize(self, state).await,
            StepName::Extract => extract(self, state).await,
            StepName::Reflect => reflect(self, state).await,
            StepName::Terminal => Err(EngineError::ConcurrencyMisuse {
                session_id: self.session.session_id.clone(),
                reason: "terminal is not an executable step".to_string(),
            }),
        }
    }

    fn request(
        &self,
        task: ModelTask,
        system_prompt: String,
        instruction: &str,
        schema: Value,
    ) -> StructuredRequest {
        StructuredRequest::new(task, system_prompt, instruction, schema)
            .with_thread_id(&self.session.session_id)
    }
}

fn model_err(step: StepName) -> impl FnOnce(ModelError) -> EngineError {
    move |source| EngineError::Model {
        step: step.to_string(),
        source,
    }
}

fn search_err(source: SearchError) -> EngineError {
    EngineError::Search {
        step: StepName::ExecuteSearch.to_string(),
        source,
    }
}

/// Pull a `Vec<String>` field out of a structured response.
fn string_list(value: &Value, field: &str) -> Result<Vec<String>, ModelError> {
    let items = value
        .get(field)
        .and_then(Value::as_array)
        .ok_or_else(|| ModelError::SchemaMismatch {
            message: format!("missing array field '{}'", field),
        })?;

    items
        .iter()
        .map(|item| {
            item.as_str()
                .map(|s| s.trim().to_string())
                .ok_or_else(|| ModelError::SchemaMismatch {
                    message: format!("'{}' must contain only strings", field),
                })
        })
        .filter(|item| !matches!(item, Ok(s) if s.is_empty()))
        .collect()
}

/// Ask the model for search queries covering the extraction schema.
pub async fn generate_queries(
    ctx: &StepContext<'_>,
    _state: &WorkflowState,
) -> EngineResult<StepOutput> {
    let session = ctx.session;
    let max_queries = session.config.max_search_queries.to_string();
    let schema_text = pretty(&session.extraction_schema);
    let system_prompt = render(
        QUERY_WRITER_PROMPT,
        &[
            ("company", session.target.as_str()),
            ("max_search_queries", max_queries.as_str()),
            ("info", schema_text.as_str()),
            ("user_notes", session.user_notes.as_str()),
        ],
    );

    let raw = ctx
        .model
        .invoke_structured(ctx.request(
            ModelTask::GenerateQueries,
            system_prompt,
            QUERY_WRITER_INSTRUCTION,
            queries_schema(),
        ))
        .await
        .map_err(model_err(StepName::GenerateQueries))?;

    let mut queries = string_list(&raw, "queries").map_err(model_err(StepName::GenerateQueries))?;
    queries.truncate(session.config.max_search_queries as usize);
    if queries.is_empty() {
        return Err(model_err(StepName::GenerateQueries)(ModelError::Malformed {
            message: "model returned no search queries".to_string(),
        }));
    }

    debug!(session_id = %session.session_id, count = queries.len(), "Generated queries");

    Ok(StepOutput {
        event: event_names::GENERATED_QUERIES,
        event_data: json!({ "queries": queries }),
        delta: StateDelta {
            search_queries: queries,
            next_step: Some(StepName::ExecuteSearch),
            ..Default::default()
        },
    })
}

/// Run every pending query concurrently and format the deduplicated hits.
///
/// All searches must succeed. The first failure drops the join set, which
/// aborts the searches still in flight.
pub async fn execute_search(
    ctx: &StepContext<'_>,
    state: &WorkflowState,
) -> EngineResult<StepOutput> {
    let session = ctx.session;
    let queries = state.pending_queries().to_vec();
    let max_results = session.config.max_search_results;

    let mut tasks = JoinSet::new();
    for (idx, query) in queries.iter().cloned().enumerate() {
        let provider = Arc::clone(&ctx.search);
        tasks.spawn(async move {
            let result = provider.search(&query, max_results).await;
            (idx, result)
        });
    }

    let mut batches: Vec<Vec<SearchHit>> = vec![Vec::new(); queries.len()];
    while let Some(joined) = tasks.join_next().await {
        let (idx, result) = joined.map_err(|e| {
            search_err(SearchError::Task {
                message: e.to_string(),
            })
        })?;
        match result {
            Ok(hits) => batches[idx] = hits,
            Err(e) => {
                warn!(
                    session_id = %session.session_id,
                    query = %queries[idx],
                    error = %e,
                    "Search failed, aborting remaining queries"
                );
                return Err(search_err(e));
            }
        }
    }

    let sources = dedupe_sources(batches);
    let source_text = format_sources(&sources, true, ctx.max_tokens_per_source);

    debug!(
        session_id = %session.session_id,
        queries = queries.len(),
        sources = sources.len(),
        "Search fan-out joined"
    );

    let event_data = json!({
        "queries": queries,
        "results": sources.len(),
    });

    Ok(StepOutput {
        event: event_names::EXECUTED_QUERIES,
        event_data,
        delta: StateDelta {
            search_results: if session.config.include_search_results {
                sources
            } else {
                Vec::new()
            },
            queries_executed: Some(state.search_queries.len()),
            source_text: Some(source_text),
            next_step: Some(StepName::Synthesize),
            ..Default::default()
        },
    })
}

/// Turn the latest sources into research notes.
pub async fn synthesize(ctx: &StepContext<'_>, state: &WorkflowState) -> EngineResult<StepOutput> {
    let session = ctx.session;
    let schema_text = pretty(&session.extraction_schema);
    let content = state.source_text.as_deref().unwrap_or_default();
    let system_prompt = render(
        NOTES_PROMPT,
        &[
            ("company", session.target.as_str()),
            ("info", schema_text.as_str()),
            ("content", content),
            ("user_notes", session.user_notes.as_str()),
        ],
    );

    let raw = ctx
        .model
        .invoke_structured(ctx.request(
            ModelTask::SynthesizeNotes,
            system_prompt,
            NOTES_INSTRUCTION,
            notes_schema(),
        ))
        .await
        .map_err(model_err(StepName::Synthesize))?;

    let notes = string_list(&raw, "notes").map_err(model_err(StepName::Synthesize))?;

    Ok(StepOutput {
        event: event_names::GENERATED_NOTES,
        event_data: json!({ "notes": notes }),
        delta: StateDelta {
            completed_notes: notes,
            next_step: Some(StepName::Extract),
            ..Default::default()
        },
    })
}

/// Extract all notes gathered so far into the session's schema.
pub async fn extract(ctx: &StepContext<'_>, state: &WorkflowState) -> EngineResult<StepOutput> {
    let session = ctx.session;
    let schema = &session.extraction_schema;
    let schema_text = pretty(schema);
    let notes = format_notes(&state.completed_notes);
    let system_prompt = render(
        EXTRACTION_PROMPT,
        &[("info", schema_text.as_str()), ("notes", notes.as_str())],
    );

    let info = ctx
        .model
        .invoke_structured(ctx.request(
            ModelTask::ExtractSchema,
            system_prompt,
            EXTRACTION_INSTRUCTION,
            schema.clone(),
        ))
        .await
        .map_err(model_err(StepName::Extract))?;

    validate_against(schema, &info)
        .map_err(|message| model_err(StepName::Extract)(ModelError::SchemaMismatch { message }))?;

    Ok(StepOutput {
        event: event_names::NOTES_TO_SCHEMA,
        event_data: json!({}),
        delta: StateDelta {
            extracted_info: Some(info),
            next_step: Some(StepName::Reflect),
            ..Default::default()
        },
    })
}

/// Judge the extraction and record the verdict.
pub async fn reflect(ctx: &StepContext<'_>, state: &WorkflowState) -> EngineResult<StepOutput> {
    let session = ctx.session;
    let info = state.extracted_info.clone().unwrap_or(Value::Null);

    let verdict = ReflectionGate::new(ctx.model)
        .evaluate(&session.session_id, &info, &session.extraction_schema)
        .await
        .map_err(model_err(StepName::Reflect))?;

    let delta = verdict.to_delta(state);
    let event_data = verdict.event_data(&delta);

    Ok(StepOutput {
        event: event_names::REFLECTION,
        event_data,
        delta,
    })
}
