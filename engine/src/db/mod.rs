/// Database module for SQLite persistence
///
/// This module stores task history, per-iteration records, metrics and the
/// learning store (failures and successful patterns). It uses sqlx with WAL
/// mode so that several orchestrator processes can share one database file;
/// each task row has a single writer.
use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::ConnectOptions;
use std::path::Path;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

pub mod learning;
pub mod tasks;

// Re-export commonly used types
pub use learning::{Failure, FailureInput, LearningRepository, PatternInput};
pub use tasks::{IterationRecord, IterationUpdate, Metric, Task, TaskRepository, TaskStatus, TaskUpdate};

/// Schema migrations, applied in order on every open
const MIGRATIONS: &[(&str, &str)] = &[
    ("001_initial", include_str!("../../migrations/001_initial.sql")),
    ("002_learning", include_str!("../../migrations/002_learning.sql")),
];

/// Pooled connection to the autocoder database
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) the database at `db_path` and migrate it
    ///
    /// SQLite replays an existing WAL automatically on open, so a database left
    /// behind by a crashed run needs no extra recovery step.
    pub async fn new(db_path: &Path) -> Result<Self> {
        info!(path = %db_path.display(), "Opening database");

        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create database directory")?;
        }

        let connection_string = format!("sqlite:{}", db_path.display());
        let options = SqliteConnectOptions::from_str(&connection_string)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(std::time::Duration::from_secs(5))
            .disable_statement_logging();

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Apply every embedded migration in order
    ///
    /// Every statement is `IF NOT EXISTS`, so migrations run on every open.
    async fn run_migrations(&self) -> Result<()> {
        for (name, sql) in MIGRATIONS {
            sqlx::raw_sql(sql)
                .execute(&self.pool)
                .await
                .with_context(|| format!("Failed to apply migration {}", name))?;
            debug!(migration = *name, "Migration applied");
        }

        info!(count = MIGRATIONS.len(), "Database schema ready");
        Ok(())
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Checkpoint the WAL into the main database file
    pub async fn flush_wal(&self) -> Result<()> {
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await
            .context("Failed to checkpoint WAL")?;

        debug!("WAL checkpointed");
        Ok(())
    }

    /// Checkpoint the WAL and close every pooled connection
    pub async fn close(self) -> Result<()> {
        self.flush_wal().await?;
        self.pool.close().await;

        debug!("Database closed");
        Ok(())
    }

    /// Tasks, iterations and metrics
    pub fn tasks(&self) -> TaskRepository {
        TaskRepository::new(self.pool.clone())
    }

    /// Failures and solution patterns
    pub fn learning(&self) -> LearningRepository {
        LearningRepository::new(self.pool.clone())
    }
}

/// Current UNIX time in seconds
pub(crate) fn unix_now() -> Result<i64> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("System clock is before the UNIX epoch")?
        .as_secs() as i64)
}
