//! Session, workflow state and progress event types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::schema::default_extraction_schema;
use crate::error::ValidationError;
use crate::search::SearchHit;

// ============================================================================
// Session
// ============================================================================

/// Per-run research limits. Immutable once the run starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResearchConfig {
    /// Max search queries per generation step.
    #[serde(default = "default_max_search_queries")]
    pub max_search_queries: u32,
    /// Max search results per query.
    #[serde(default = "default_max_search_results")]
    pub max_search_results: u32,
    /// Extra reflection passes allowed after the first.
    #[serde(default)]
    pub max_reflection_steps: u32,
    /// Whether raw search hits are accumulated and returned.
    #[serde(default)]
    pub include_search_results: bool,
}

fn default_max_search_queries() -> u32 {
    3
}

fn default_max_search_results() -> u32 {
    3
}

impl Default for ResearchConfig {
    fn default() -> Self {
        Self {
            max_search_queries: default_max_search_queries(),
            max_search_results: default_max_search_results(),
            max_reflection_steps: 0,
            include_search_results: false,
        }
    }
}

/// One research run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Caller supplied id, the checkpoint key.
    pub session_id: String,
    /// The company being researched.
    pub target: String,
    /// JSON-schema-like description of the fields to fill.
    pub extraction_schema: Value,
    /// Free-text hint from the caller.
    #[serde(default)]
    pub user_notes: String,
    #[serde(default)]
    pub config: ResearchConfig,
}

impl Session {
    /// Create a session with the default schema and limits
    pub fn new(session_id: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            target: target.into(),
            extraction_schema: default_extraction_schema(),
            user_notes: String::new(),
            config: ResearchConfig::default(),
        }
    }

    /// Set the extraction schema
    pub fn with_schema(mut self, schema: Value) -> Self {
        self.extraction_schema = schema;
        self
    }

    /// Set the user notes
    pub fn with_user_notes(mut self, notes: impl Into<String>) -> Self {
        self.user_notes = notes.into();
        self
    }

    /// Set the research limits
    pub fn with_config(mut self, config: ResearchConfig) -> Self {
        self.config = config;
        self
    }

    /// Reject malformed input before any step runs.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.session_id.trim().is_empty() {
            return Err(ValidationError::new("sessionId", "Session ID is required"));
        }
        if self.target.trim().is_empty() {
            return Err(ValidationError::new("company", "Company name is required"));
        }
        if !self.extraction_schema.is_object() {
            return Err(ValidationError::new(
                "extractionSchema",
                "must be a JSON object",
            ));
        }
        if self.config.max_search_queries == 0 {
            return Err(ValidationError::new(
                "maxSearchQueries",
                "must be at least 1",
            ));
        }
        if self.config.max_search_results == 0 {
            return Err(ValidationError::new(
                "maxSearchResults",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Steps
// ============================================================================

/// Workflow steps, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepName {
    GenerateQueries,
    ExecuteSearch,
    Synthesize,
    Extract,
    Reflect,
    Terminal,
}

impl StepName {
    /// Steps that may be followed by a suspension point.
    pub const SUSPENSION_POINTS: [StepName; 4] = [
        StepName::GenerateQueries,
        StepName::ExecuteSearch,
        StepName::Synthesize,
        StepName::Extract,
    ];

    /// Get the step name as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            StepName::GenerateQueries => "generate_queries",
            StepName::ExecuteSearch => "execute_search",
            StepName::Synthesize => "synthesize",
            StepName::Extract => "extract",
            StepName::Reflect => "reflect",
            StepName::Terminal => "terminal",
        }
    }

    /// The unconditional successor. `Reflect` routes dynamically.
    pub fn successor(&self) -> Option<StepName> {
        match self {
            StepName::GenerateQueries => Some(StepName::ExecuteSearch),
            StepName::ExecuteSearch => Some(StepName::Synthesize),
            StepName::Synthesize => Some(StepName::Extract),
            StepName::Extract => Some(StepName::Reflect),
            StepName::Reflect | StepName::Terminal => None,
        }
    }

    /// Whether a suspension point may follow this step.
    pub fn is_suspension_point(&self) -> bool {
        Self::SUSPENSION_POINTS.contains(self)
    }
}

impl std::fmt::Display for StepName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for StepName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "generate_queries" => Ok(StepName::GenerateQueries),
            "execute_search" => Ok(StepName::ExecuteSearch),
            "synthesize" => Ok(StepName::Synthesize),
            "extract" => Ok(StepName::Extract),
            "reflect" => Ok(StepName::Reflect),
            "terminal" => Ok(StepName::Terminal),
            _ => Err(format!("Unknown step: {}", s)),
        }
    }
}

// ============================================================================
// Workflow state
// ============================================================================

/// The accumulating record threaded through every step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowState {
    /// Append-only.
    pub search_queries: Vec<String>,
    /// Append-only; only filled when `include_search_results` is set.
    pub search_results: Vec<SearchHit>,
    /// Append-only, one batch per synthesis step.
    pub completed_notes: Vec<String>,
    /// Last-write-wins.
    pub extracted_info: Option<Value>,
    pub is_satisfactory: Option<bool>,
    /// Monotone across the run.
    pub reflection_steps_taken: u32,
    pub next_step: Option<StepName>,
    /// How many of `search_queries` have been executed.
    pub queries_executed: usize,
    /// Formatted sources from the latest search, input to synthesis.
    pub source_text: Option<String>,
}

/// The fields a single step produces. Vec fields are appended, the rest
/// replace the prior value when present.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateDelta {
    pub search_queries: Vec<String>,
    pub search_results: Vec<SearchHit>,
    pub completed_notes: Vec<String>,
    pub extracted_info: Option<Value>,
    pub is_satisfactory: Option<bool>,
    pub reflection_steps_taken: Option<u32>,
    pub next_step: Option<StepName>,
    pub queries_executed: Option<usize>,
    pub source_text: Option<String>,
}

impl WorkflowState {
    /// Merge a step's delta into the state.
    pub fn apply(&mut self, delta: StateDelta) {
        self.search_queries.extend(delta.search_queries);
        self.search_results.extend(delta.search_results);
        self.completed_notes.extend(delta.completed_notes);

        if let Some(info) = delta.extracted_info {
            self.extracted_info = Some(info);
        }
        if let Some(satisfied) = delta.is_satisfactory {
            self.is_satisfactory = Some(satisfied);
        }
        if let Some(taken) = delta.reflection_steps_taken {
            self.reflection_steps_taken = self.reflection_steps_taken.max(taken);
        }
        if let Some(step) = delta.next_step {
            self.next_step = Some(step);
        }
        if let Some(executed) = delta.queries_executed {
            self.queries_executed = executed.min(self.search_queries.len());
        }
        if let Some(text) = delta.source_text {
            self.source_text = Some(text);
        }
    }

    /// Queries appended since the last search step.
    pub fn pending_queries(&self) -> &[String] {
        let start = self.queries_executed.min(self.search_queries.len());
        &self.search_queries[start..]
    }
}

// ============================================================================
// Progress events
// ============================================================================

/// Wire names for progress events.
pub mod event_names {
    pub const GENERATED_QUERIES: &str = "generatedQueries";
    pub const EXECUTED_QUERIES: &str = "executedQueries";
    pub const GENERATED_NOTES: &str = "generatedNotes";
    pub const NOTES_TO_SCHEMA: &str = "notesToSchema";
    pub const REFLECTION: &str = "reflection";
    pub const REROUTE: &str = "reroute";
    pub const AWAITING: &str = "awaiting";
    pub const END: &str = "END";
}

/// A single step transition reported to the observer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub id: String,
    pub name: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    /// Create a new event stamped with the current time
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            data,
            timestamp: Utc::now(),
        }
    }

    /// Whether this event ends the stream successfully.
    pub fn is_terminal(&self) -> bool {
        self.name == event_names::END || self.name == event_names::AWAITING
    }
}

// ============================================================================
// Outcomes
// ============================================================================

/// The payload of a completed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResearchOutput {
    pub extracted_info: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search_results: Option<Vec<SearchHit>>,
    pub reflection_steps_taken: u32,
}

/// How a call to `run` or `resume` ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// The reflection gate routed to terminal.
    Completed(ResearchOutput),
    /// State was checkpointed; the run waits for `resume`.
    Suspended {
        session_id: String,
        awaiting: StepName,
    },
}

impl RunOutcome {
    /// JSON payload handed back to transports.
    pub fn to_json(&self) -> Value {
        match self {
            RunOutcome::Completed(output) => {
                serde_json::to_value(output).unwrap_or(Value::Null)
            }
            RunOutcome::Suspended {
                session_id,
                awaiting,
            } => serde_json::json!({
                "sessionId": session_id,
                "awaiting": awaiting,
            }),
        }
    }
}
