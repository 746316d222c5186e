use std::env;
use std::path::PathBuf;

use crate::error::AppError;
use crate::research::StepName;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub langbase: LangbaseConfig,
    pub search: SearchConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub request: RequestConfig,
    pub pipes: PipeConfig,
    pub engine: EngineConfig,
}

/// Langbase API configuration
#[derive(Debug, Clone)]
pub struct LangbaseConfig {
    pub api_key: String,
    pub base_url: String,
}

/// Web search provider configuration
#[derive(Debug, Clone)]
pub struct SearchConfig {
    pub api_key: String,
    pub base_url: String,
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub max_connections: u32,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Log output format
#[derive(Debug, Clone, PartialEq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// HTTP request configuration
#[derive(Debug, Clone)]
pub struct RequestConfig {
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

/// Langbase pipe name configuration, one pipe per model-backed step
#[derive(Debug, Clone)]
pub struct PipeConfig {
    pub queries: String,
    pub notes: String,
    pub extraction: String,
    pub reflection: String,
}

/// Workflow engine behaviour
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Steps after which the engine checkpoints and yields to the caller.
    pub suspend_after: Vec<StepName>,
    /// Capacity of the progress event channel.
    pub event_buffer: usize,
    /// Raw-content budget per search source, in approximate tokens.
    pub max_tokens_per_source: usize,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, AppError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let langbase = LangbaseConfig {
            api_key: env::var("LANGBASE_API_KEY").map_err(|_| AppError::Config {
                message: "LANGBASE_API_KEY is required".to_string(),
            })?,
            base_url: env::var("LANGBASE_BASE_URL")
                .unwrap_or_else(|_| "https://api.langbase.com".to_string()),
        };

        let search = SearchConfig {
            api_key: env::var("TAVILY_API_KEY").map_err(|_| AppError::Config {
                message: "TAVILY_API_KEY is required".to_string(),
            })?,
            base_url: env::var("TAVILY_BASE_URL")
                .unwrap_or_else(|_| "https://api.tavily.com".to_string()),
        };

        let database = DatabaseConfig {
            path: PathBuf::from(
                env::var("DATABASE_PATH").unwrap_or_else(|_| "./data/research.db".to_string()),
            ),
            max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(5),
        };

        let logging = LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            format: match env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "pretty".to_string())
                .to_lowercase()
                .as_str()
            {
                "json" => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
        };

        let request = RequestConfig {
            timeout_ms: env::var("REQUEST_TIMEOUT_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(30000),
            max_retries: env::var("MAX_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(3),
            retry_delay_ms: env::var("RETRY_DELAY_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(1000),
        };

        let defaults = PipeConfig::default();
        let pipes = PipeConfig {
            queries: env::var("PIPE_QUERIES").unwrap_or(defaults.queries),
            notes: env::var("PIPE_NOTES").unwrap_or(defaults.notes),
            extraction: env::var("PIPE_EXTRACTION").unwrap_or(defaults.extraction),
            reflection: env::var("PIPE_REFLECTION").unwrap_or(defaults.reflection),
        };

        let engine_defaults = EngineConfig::default();
        let engine = EngineConfig {
            suspend_after: match env::var("RESEARCH_SUSPEND_AFTER") {
                Ok(raw) => parse_suspend_after(&raw)?,
                Err(_) => engine_defaults.suspend_after,
            },
            event_buffer: env::var("RESEARCH_EVENT_BUFFER")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(engine_defaults.event_buffer),
            max_tokens_per_source: env::var("RESEARCH_MAX_TOKENS_PER_SOURCE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(engine_defaults.max_tokens_per_source),
        };

        Ok(Config {
            langbase,
            search,
            database,
            logging,
            request,
            pipes,
            engine,
        })
    }
}

/// Parse a comma separated list of suspension points. `none` (or an empty
/// value) disables suspension entirely.
pub fn parse_suspend_after(raw: &str) -> Result<Vec<StepName>, AppError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("none") {
        return Ok(Vec::new());
    }

    let mut steps = Vec::new();
    for part in trimmed.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let step: StepName = part.parse().map_err(|e| AppError::Config {
            message: format!("RESEARCH_SUSPEND_AFTER: {}", e),
        })?;
        if !step.is_suspension_point() {
            return Err(AppError::Config {
                message: format!("RESEARCH_SUSPEND_AFTER: '{}' is not a suspension point", part),
            });
        }
        if !steps.contains(&step) {
            steps.push(step);
        }
    }
    Ok(steps)
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30000,
            max_retries: 3,
            retry_delay_ms: 1000,
        }
    }
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self {
            queries: "research-queries-v1".to_string(),
            notes: "research-notes-v1".to_string(),
            extraction: "research-extraction-v1".to_string(),
            reflection: "research-reflection-v1".to_string(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            suspend_after: StepName::SUSPENSION_POINTS.to_vec(),
            event_buffer: 64,
            max_tokens_per_source: 1000,
        }
    }
}
