use thiserror::Error;

/// Application-level errors
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Langbase error: {0}")]
    Langbase(#[from] LangbaseError),

    #[error("Search error: {0}")]
    Search(#[from] SearchError),

    #[error("Workflow error: {0}")]
    Engine(#[from] EngineError),

    #[error("MCP protocol error: {0}")]
    Mcp(#[from] McpError),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Storage layer errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database connection failed: {message}")]
    Connection { message: String },

    #[error("Query failed: {message}")]
    Query { message: String },

    #[error("Corrupt checkpoint for session {session_id}: {message}")]
    Corrupt { session_id: String, message: String },

    #[error("Unsupported checkpoint schema version {found} (expected {expected})")]
    SchemaVersion { found: i64, expected: i64 },

    #[error("Migration failed: {message}")]
    Migration { message: String },

    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

/// Langbase API errors
#[derive(Debug, Error)]
pub enum LangbaseError {
    #[error("Langbase unavailable: {message} (retries: {retries})")]
    Unavailable { message: String, retries: u32 },

    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("Invalid response: {message}")]
    InvalidResponse { message: String },

    #[error("Request timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Search provider errors
#[derive(Debug, Error)]
pub enum SearchError {
    #[error("Search request failed for '{query}': {message}")]
    Request { query: String, message: String },

    #[error("Search API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("Invalid search response: {message}")]
    InvalidResponse { message: String },

    #[error("Search task failed: {message}")]
    Task { message: String },
}

/// Structured-model collaborator errors
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Model call failed: {0}")]
    Langbase(#[from] LangbaseError),

    #[error("Malformed structured output: {message}")]
    Malformed { message: String },

    #[error("Output does not match schema: {message}")]
    SchemaMismatch { message: String },
}

/// Input rejected before a workflow starts
#[derive(Debug, Error)]
#[error("Validation failed: {field} - {reason}")]
pub struct ValidationError {
    pub field: String,
    pub reason: String,
}

impl ValidationError {
    /// Create a validation error for a field
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Workflow engine errors. Every variant aborts the current run or resume
/// and closes the event stream without a terminal event.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Model error in {step}: {source}")]
    Model {
        step: String,
        #[source]
        source: ModelError,
    },

    #[error("Search error in {step}: {source}")]
    Search {
        step: String,
        #[source]
        source: SearchError,
    },

    #[error("Checkpoint persistence failed: {0}")]
    Persistence(#[from] StorageError),

    #[error("Concurrency misuse for session {session_id}: {reason}")]
    ConcurrencyMisuse { session_id: String, reason: String },

    #[error("Run cancelled for session {session_id}")]
    Cancelled { session_id: String },
}

/// MCP protocol errors
#[derive(Debug, Error)]
pub enum McpError {
    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Unknown tool: {tool_name}")]
    UnknownTool { tool_name: String },

    #[error("Invalid parameters for {tool_name}: {message}")]
    InvalidParameters { tool_name: String, message: String },

    #[error("Tool execution failed: {message}")]
    ExecutionFailed { message: String },

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<EngineError> for McpError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Validation(e) => McpError::InvalidParameters {
                tool_name: "research".to_string(),
                message: e.to_string(),
            },
            other => McpError::ExecutionFailed {
                message: other.to_string(),
            },
        }
    }
}

impl From<AppError> for McpError {
    fn from(err: AppError) -> Self {
        McpError::ExecutionFailed {
            message: err.to_string(),
        }
    }
}

/// Result type alias for application errors
pub type AppResult<T> = Result<T, AppError>;

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Result type alias for Langbase operations
pub type LangbaseResult<T> = Result<T, LangbaseError>;

/// Result type alias for search operations
pub type SearchResult<T> = Result<T, SearchError>;

/// Result type alias for structured-model calls
pub type ModelResult<T> = Result<T, ModelError>;

/// Result type alias for workflow engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Result type alias for MCP operations
pub type McpResult<T> = Result<T, McpError>;
