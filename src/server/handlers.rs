use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{Notifier, SharedState};
use crate::error::{EngineResult, McpError, McpResult};
use crate::research::{
    default_extraction_schema, EventStream, ResearchConfig, RunOutcome, Session,
};

/// Method name used to forward progress events to the client.
pub const RESEARCH_EVENT_NOTIFICATION: &str = "notifications/research_event";

/// Per-call context handed to tool handlers.
#[derive(Clone)]
pub struct ToolContext {
    /// Channel back to the client for progress notifications.
    pub notifier: Notifier,
    /// Cancelled when the client cancels the call or disconnects.
    pub cancel: CancellationToken,
}

/// Arguments of `research_start`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartParams {
    pub session_id: String,
    pub company: String,
    #[serde(default)]
    pub max_search_queries: Option<u32>,
    #[serde(default)]
    pub max_search_results: Option<u32>,
    #[serde(default)]
    pub max_reflection_steps: Option<u32>,
    #[serde(default)]
    pub include_search_results: Option<bool>,
    #[serde(default)]
    pub user_notes: Option<String>,
    #[serde(default)]
    pub extraction_schema: Option<Value>,
}

impl StartParams {
    /// Build the session, filling documented defaults.
    pub fn into_session(self) -> Session {
        let defaults = ResearchConfig::default();
        let config = ResearchConfig {
            max_search_queries: self
                .max_search_queries
                .unwrap_or(defaults.max_search_queries),
            max_search_results: self
                .max_search_results
                .unwrap_or(defaults.max_search_results),
            max_reflection_steps: self
                .max_reflection_steps
                .unwrap_or(defaults.max_reflection_steps),
            include_search_results: self
                .include_search_results
                .unwrap_or(defaults.include_search_results),
        };

        Session::new(self.session_id, self.company)
            .with_schema(self.extraction_schema.unwrap_or_else(default_extraction_schema))
            .with_user_notes(self.user_notes.unwrap_or_default())
            .with_config(config)
    }
}

/// Arguments of `research_resume`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeParams {
    pub session_id: String,
    #[serde(default)]
    pub resume_input: Value,
}

/// Arguments of `research_status`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusParams {
    pub session_id: String,
}

/// Route tool calls to appropriate handlers
pub async fn handle_tool_call(
    state: &SharedState,
    tool_name: &str,
    arguments: Option<Value>,
    ctx: ToolContext,
) -> McpResult<Value> {
    info!(tool = %tool_name, "Routing tool call");

    match tool_name {
        "research_start" => handle_start(state, arguments, ctx).await,
        "research_resume" => handle_resume(state, arguments, ctx).await,
        "research_status" => handle_status(state, arguments).await,
        _ => Err(McpError::UnknownTool {
            tool_name: tool_name.to_string(),
        }),
    }
}

/// Handle research_start: validate, run, forward events.
async fn handle_start(
    state: &SharedState,
    arguments: Option<Value>,
    ctx: ToolContext,
) -> McpResult<Value> {
    let params: StartParams = parse_arguments("research_start", arguments)?;
    let session = params.into_session();

    session
        .validate()
        .map_err(|e| McpError::InvalidParameters {
            tool_name: "research_start".to_string(),
            message: e.to_string(),
        })?;

    let session_id = session.session_id.clone();
    let (handle, events) = state.engine.start(session, ctx.cancel.clone());
    drive_to_outcome(&session_id, handle, events, &ctx.notifier).await
}

/// Handle research_resume: continue a suspended session.
async fn handle_resume(
    state: &SharedState,
    arguments: Option<Value>,
    ctx: ToolContext,
) -> McpResult<Value> {
    let params: ResumeParams = parse_arguments("research_resume", arguments)?;
    if params.session_id.trim().is_empty() {
        return Err(McpError::InvalidParameters {
            tool_name: "research_resume".to_string(),
            message: "sessionId is required".to_string(),
        });
    }

    let (handle, events) = state.engine.resume_streaming(
        params.session_id.clone(),
        params.resume_input,
        ctx.cancel.clone(),
    );
    drive_to_outcome(&params.session_id, handle, events, &ctx.notifier).await
}

/// Handle research_status: report the stored checkpoint, if any.
async fn handle_status(state: &SharedState, arguments: Option<Value>) -> McpResult<Value> {
    let params: StatusParams = parse_arguments("research_status", arguments)?;

    let record = state
        .engine
        .checkpointer()
        .load(&params.session_id)
        .await
        .map_err(|e| McpError::ExecutionFailed {
            message: e.to_string(),
        })?;

    Ok(match record {
        None => json!({
            "sessionId": params.session_id,
            "status": "not_found",
        }),
        Some(record) => json!({
            "sessionId": record.session_id,
            "status": if record.is_completed() { "completed" } else { "suspended" },
            "nextStep": record.next_step,
            "target": record.session.target,
            "state": record.state,
            "updatedAt": record.updated_at,
        }),
    })
}

/// Forward every event to the client, then collect the run's outcome.
async fn drive_to_outcome(
    session_id: &str,
    handle: JoinHandle<EngineResult<RunOutcome>>,
    mut events: EventStream,
    notifier: &Notifier,
) -> McpResult<Value> {
    while let Some(event) = events.next().await {
        debug!(session_id = %session_id, event = %event.name, "Forwarding progress event");
        notifier
            .notify(
                RESEARCH_EVENT_NOTIFICATION,
                json!({ "sessionId": session_id, "event": event }),
            )
            .await;
    }

    let outcome = handle.await.map_err(|e| McpError::ExecutionFailed {
        message: format!("Research task failed: {}", e),
    })??;

    Ok(outcome.to_json())
}

/// Parse tool arguments into a typed struct
fn parse_arguments<T: serde::de::DeserializeOwned>(
    tool_name: &str,
    arguments: Option<Value>,
) -> McpResult<T> {
    match arguments {
        Some(args) => serde_json::from_value(args).map_err(|e| McpError::InvalidParameters {
            tool_name: tool_name.to_string(),
            message: e.to_string(),
        }),
        None => Err(McpError::InvalidParameters {
            tool_name: tool_name.to_string(),
            message: "Missing arguments".to_string(),
        }),
    }
}
