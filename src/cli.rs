//! Command-line interface.
//!
//! `serve` (the default) runs the MCP server over stdio. `run` drives one
//! research session to completion without suspending, printing each progress
//! event as a JSON line. `checkpoint` prints what is stored for a session.

use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use serde_json::Value;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{Config, EngineConfig};
use crate::research::Session;
use crate::server::{build_engine, StartParams};
use crate::storage::{Checkpointer, SqliteCheckpointer};

/// Company research workflow engine.
#[derive(Parser, Debug)]
#[command(name = "company-research", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Top-level subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Serve MCP requests on stdin/stdout (default)
    Serve,

    /// Research a company end to end, printing events as JSON lines
    Run(RunArgs),

    /// Print the stored checkpoint of a session
    Checkpoint {
        /// Session to look up
        session_id: String,
    },
}

/// Arguments of the `run` subcommand.
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Caller chosen id for this research run
    #[arg(long)]
    pub session_id: String,

    /// Name of the company to research
    #[arg(long)]
    pub company: String,

    #[arg(long)]
    pub max_search_queries: Option<u32>,

    #[arg(long)]
    pub max_search_results: Option<u32>,

    #[arg(long)]
    pub max_reflection_steps: Option<u32>,

    /// Include raw search results in the output
    #[arg(long)]
    pub include_search_results: bool,

    #[arg(long)]
    pub user_notes: Option<String>,

    /// Path to a JSON schema file replacing the default CompanyInfo schema
    #[arg(long)]
    pub schema: Option<PathBuf>,
}

impl RunArgs {
    /// Build the session, loading the extraction schema file if one was given.
    pub async fn into_session(self) -> Result<Session, String> {
        let extraction_schema = match &self.schema {
            Some(path) => {
                let raw = tokio::fs::read_to_string(path)
                    .await
                    .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
                let schema: Value = serde_json::from_str(&raw)
                    .map_err(|e| format!("Invalid schema in {}: {}", path.display(), e))?;
                Some(schema)
            }
            None => None,
        };

        let params = StartParams {
            session_id: self.session_id,
            company: self.company,
            max_search_queries: self.max_search_queries,
            max_search_results: self.max_search_results,
            max_reflection_steps: self.max_reflection_steps,
            include_search_results: Some(self.include_search_results),
            user_notes: self.user_notes,
            extraction_schema,
        };
        Ok(params.into_session())
    }
}

/// Result of CLI command execution.
pub struct CliResult {
    /// Exit code (0 = success)
    pub exit_code: i32,
    /// Output message
    pub message: String,
}

impl CliResult {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            exit_code: 1,
            message: message.into(),
        }
    }
}

/// Execute the `run` subcommand.
pub async fn execute_run(config: &Config, args: RunArgs) -> CliResult {
    let session = match args.into_session().await {
        Ok(s) => s,
        Err(e) => return CliResult::error(e),
    };
    if let Err(e) = session.validate() {
        return CliResult::error(e.to_string());
    }

    let engine_config = EngineConfig {
        suspend_after: Vec::new(),
        ..config.engine.clone()
    };
    let engine = match build_engine(config, engine_config).await {
        Ok(e) => e,
        Err(e) => return CliResult::error(e.to_string()),
    };

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling research run");
            ctrl_c.cancel();
        }
    });

    info!(session_id = %session.session_id, "Running research to completion");
    let (handle, mut events) = engine.start(session, cancel);

    while let Some(event) = events.next().await {
        match serde_json::to_string(&event) {
            Ok(line) => println!("{}", line),
            Err(e) => warn!(error = %e, "Failed to serialize event"),
        }
    }

    match handle.await {
        Ok(Ok(outcome)) => CliResult::success(pretty(&outcome.to_json())),
        Ok(Err(e)) => CliResult::error(e.to_string()),
        Err(e) => CliResult::error(format!("Research task failed: {}", e)),
    }
}

/// Execute the `checkpoint` subcommand.
pub async fn execute_checkpoint(config: &Config, session_id: &str) -> CliResult {
    let checkpointer = match SqliteCheckpointer::new(&config.database).await {
        Ok(c) => c,
        Err(e) => return CliResult::error(e.to_string()),
    };

    match checkpointer.load(session_id).await {
        Ok(Some(record)) => match serde_json::to_value(&record) {
            Ok(value) => CliResult::success(pretty(&value)),
            Err(e) => CliResult::error(e.to_string()),
        },
        Ok(None) => CliResult::error(format!("No checkpoint for session {}", session_id)),
        Err(e) => CliResult::error(e.to_string()),
    }
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}
