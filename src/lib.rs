//! # Company Research
//!
//! A resumable research workflow: given a company name and a JSON schema of
//! the fields wanted, it generates web search queries, runs them
//! concurrently, condenses the results into notes, extracts a schema-shaped
//! record and reflects on whether the record is complete enough. A bounded
//! number of follow-up passes is allowed.
//!
//! The run can suspend after any step. State is checkpointed to SQLite so a
//! later `resume` picks up exactly where the previous call stopped, even in
//! another process.
//!
//! ## Architecture
//!
//! ```text
//! MCP Client → MCP Server (Rust) → WorkflowEngine → Langbase Pipes (HTTP)
//!                                        ↓       ↘
//!                              SQLite (checkpoints)  Tavily search (HTTP)
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use company_research::{Config, AppState, McpServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let state = Arc::new(AppState::initialize(config).await?);
//!     let server = McpServer::new(state);
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

/// Command-line interface.
pub mod cli;
/// Configuration loaded from the environment.
pub mod config;
/// Error types and result aliases for the application.
pub mod error;
/// Langbase API client and types for pipe communication.
pub mod langbase;
/// Structured-output model seam and its Langbase implementation.
pub mod model;
/// System prompts for the research pipes.
pub mod prompts;
/// The research workflow engine.
pub mod research;
/// Web search providers.
pub mod search;
/// MCP server implementation and request handling.
pub mod server;
/// Checkpoint persistence.
pub mod storage;

pub use config::Config;
pub use error::{AppError, AppResult};
pub use research::WorkflowEngine;
pub use server::{AppState, McpServer, SharedState};
