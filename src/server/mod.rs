//! Server module for MCP protocol handling.
//!
//! This module provides:
//! - MCP server implementation over stdio
//! - Tool call handlers for the research workflow
//! - Shared application state management

mod handlers;
mod mcp;

pub use handlers::*;
pub use mcp::*;

use std::sync::Arc;
use tracing::info;

use crate::config::{Config, EngineConfig};
use crate::error::AppResult;
use crate::langbase::LangbaseClient;
use crate::model::LangbasePipeModel;
use crate::research::WorkflowEngine;
use crate::search::TavilyClient;
use crate::storage::SqliteCheckpointer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Config,
    /// The research workflow engine.
    pub engine: WorkflowEngine,
}

impl AppState {
    /// Create new application state
    pub fn new(config: Config, engine: WorkflowEngine) -> Self {
        info!(
            queries_pipe = %config.pipes.queries,
            notes_pipe = %config.pipes.notes,
            extraction_pipe = %config.pipes.extraction,
            reflection_pipe = %config.pipes.reflection,
            suspend_after = ?config.engine.suspend_after,
            "AppState initializing"
        );
        Self { config, engine }
    }

    /// Build the production stack (SQLite checkpoints, Langbase model,
    /// Tavily search) from configuration.
    pub async fn initialize(config: Config) -> AppResult<Self> {
        let engine = build_engine(&config, config.engine.clone()).await?;
        Ok(Self::new(config, engine))
    }
}

/// Wire up a [`WorkflowEngine`] over the production collaborators.
pub async fn build_engine(
    config: &Config,
    engine_config: EngineConfig,
) -> AppResult<WorkflowEngine> {
    let checkpointer = SqliteCheckpointer::new(&config.database).await?;
    info!(path = %config.database.path.display(), "Checkpoint database initialized");

    let langbase = LangbaseClient::new(&config.langbase, config.request.clone())?;
    info!(base_url = %config.langbase.base_url, "Langbase client initialized");

    let search = TavilyClient::new(&config.search, &config.request)?;

    Ok(WorkflowEngine::new(
        Arc::new(LangbasePipeModel::new(langbase, config.pipes.clone())),
        Arc::new(search),
        Arc::new(checkpointer),
        engine_config,
    ))
}

/// Shared application state handle
pub type SharedState = Arc<AppState>;
