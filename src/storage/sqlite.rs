use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use tracing::{debug, info};

use super::{CheckpointRecord, Checkpointer, CHECKPOINT_SCHEMA_VERSION};
use crate::config::DatabaseConfig;
use crate::error::{StorageError, StorageResult};

/// Static migrator that embeds migrations at compile time
static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// SQLite-backed checkpoint store
#[derive(Clone)]
pub struct SqliteCheckpointer {
    pool: SqlitePool,
}

impl SqliteCheckpointer {
    /// Open (creating if needed) the database file and run migrations
    pub async fn new(config: &DatabaseConfig) -> StorageResult<Self> {
        // Ensure parent directory exists
        if let Some(parent) = config.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Connection {
                message: format!("Failed to create database directory: {}", e),
            })?;
        }

        let database_url = format!("sqlite://{}?mode=rwc", config.path.display());

        let options = SqliteConnectOptions::from_str(&database_url)
            .map_err(|e| StorageError::Connection {
                message: format!("Invalid database URL: {}", e),
            })?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to connect to database: {}", e),
            })?;

        let storage = Self { pool };
        storage.run_migrations().await?;

        Ok(storage)
    }

    /// In-memory database. Single connection, since every SQLite memory
    /// connection is its own database.
    pub async fn new_in_memory() -> StorageResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:").map_err(|e| {
            StorageError::Connection {
                message: format!("Invalid database URL: {}", e),
            }
        })?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to open in-memory database: {}", e),
            })?;

        let storage = Self { pool };
        storage.run_migrations().await?;

        Ok(storage)
    }

    /// Run database migrations using embedded sqlx migrations
    async fn run_migrations(&self) -> StorageResult<()> {
        info!("Running database migrations...");

        MIGRATOR.run(&self.pool).await.map_err(|e| StorageError::Migration {
            message: format!("Failed to run migrations: {}", e),
        })?;

        info!("Database migrations completed successfully");
        Ok(())
    }

    /// Get the underlying pool for advanced queries
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl Checkpointer for SqliteCheckpointer {
    async fn save(&self, record: &CheckpointRecord) -> StorageResult<()> {
        let session = serde_json::to_string(&record.session).map_err(|e| StorageError::Query {
            message: format!("Failed to serialize session: {}", e),
        })?;
        let state = serde_json::to_string(&record.state).map_err(|e| StorageError::Query {
            message: format!("Failed to serialize workflow state: {}", e),
        })?;

        sqlx::query(
            r#"
            INSERT INTO checkpoints (session_id, session, state, next_step, schema_version, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(session_id) DO UPDATE SET
                session = excluded.session,
                state = excluded.state,
                next_step = excluded.next_step,
                schema_version = excluded.schema_version,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&record.session_id)
        .bind(&session)
        .bind(&state)
        .bind(record.next_step.as_str())
        .bind(record.schema_version)
        .bind(record.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        debug!(
            session_id = %record.session_id,
            next_step = %record.next_step,
            "Checkpoint saved"
        );

        Ok(())
    }

    async fn load(&self, session_id: &str) -> StorageResult<Option<CheckpointRecord>> {
        let row: Option<CheckpointRow> = sqlx::query_as(
            r#"
            SELECT session_id, session, state, next_step, schema_version, updated_at
            FROM checkpoints
            WHERE session_id = ?
            "#,
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(CheckpointRecord::try_from).transpose()
    }

    async fn delete(&self, session_id: &str) -> StorageResult<()> {
        sqlx::query("DELETE FROM checkpoints WHERE session_id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

// Internal row type for SQLx mapping
#[derive(sqlx::FromRow)]
struct CheckpointRow {
    session_id: String,
    session: String,
    state: String,
    next_step: String,
    schema_version: i64,
    updated_at: String,
}

impl TryFrom<CheckpointRow> for CheckpointRecord {
    type Error = StorageError;

    fn try_from(row: CheckpointRow) -> Result<Self, Self::Error> {
        if row.schema_version != CHECKPOINT_SCHEMA_VERSION {
            return Err(StorageError::SchemaVersion {
                found: row.schema_version,
                expected: CHECKPOINT_SCHEMA_VERSION,
            });
        }

        let corrupt = |message: String| StorageError::Corrupt {
            session_id: row.session_id.clone(),
            message,
        };

        let session = serde_json::from_str(&row.session)
            .map_err(|e| corrupt(format!("session: {}", e)))?;
        let state = serde_json::from_str(&row.state)
            .map_err(|e| corrupt(format!("state: {}", e)))?;
        let next_step = row.next_step.parse().map_err(corrupt)?;
        let updated_at = DateTime::parse_from_rfc3339(&row.updated_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| corrupt(format!("updated_at: {}", e)))?;

        Ok(Self {
            session_id: row.session_id.clone(),
            session,
            state,
            next_step,
            schema_version: row.schema_version,
            updated_at,
        })
    }
}
