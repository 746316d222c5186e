use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use company_research::{
    cli::{execute_checkpoint, execute_run, Cli, CliResult, Commands},
    config::{Config, LogFormat},
    langbase::LangbaseClient,
    server::{AppState, McpServer},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    // Initialize logging
    init_logging(&config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Company research starting..."
    );

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await,
        Commands::Run(args) => {
            ensure_pipes(&config).await?;
            exit_with(execute_run(&config, args).await)
        }
        Commands::Checkpoint { session_id } => {
            exit_with(execute_checkpoint(&config, &session_id).await)
        }
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    ensure_pipes(&config).await?;

    let state = match AppState::initialize(config).await {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!(error = %e, "Failed to initialize application state");
            return Err(e.into());
        }
    };

    let server = McpServer::new(state);

    info!("Server ready, waiting for requests on stdin...");

    if let Err(e) = server.run().await {
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Create the research pipes on Langbase if they do not exist yet.
async fn ensure_pipes(config: &Config) -> anyhow::Result<()> {
    let langbase = LangbaseClient::new(&config.langbase, config.request.clone())?;

    info!("Ensuring required Langbase pipes exist...");
    if let Err(e) = langbase.ensure_research_pipes(&config.pipes).await {
        error!(error = %e, "Failed to ensure research pipes exist");
        return Err(e.into());
    }
    Ok(())
}

fn exit_with(result: CliResult) -> anyhow::Result<()> {
    if result.exit_code == 0 {
        println!("{}", result.message);
        Ok(())
    } else {
        eprintln!("{}", result.message);
        std::process::exit(result.exit_code);
    }
}

/// Initialize tracing/logging. Logs go to stderr; stdout carries protocol
/// traffic or command output.
fn init_logging(config: &Config) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}
