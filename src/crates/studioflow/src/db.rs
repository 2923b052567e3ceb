//! SQLite pool and schema
//!
//! One pool serves the job, run, checkpoint, dead-letter and safety-audit tables.
//! Every worker process sharing a database file shares its schema through the
//! embedded migrations.

use crate::error::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// How long a connection waits on a locked database before failing
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Cheaply cloneable handle on the pool
#[derive(Clone, Debug)]
pub struct Database {
    pool: Arc<SqlitePool>,
}

impl Database {
    /// Connect to a SQLite database URL, creating the file if needed
    ///
    /// File databases run in WAL mode so readers do not block the single writer.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        debug!(url = %database_url, "Opening SQLite pool");

        if database_url.contains(":memory:") {
            return Self::in_memory().await;
        }

        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        info!(url = %database_url, max_connections, "SQLite pool ready");
        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Private in-memory database
    ///
    /// Every connection to `:memory:` is a separate database, so the pool is pinned
    /// to a single connection that is never recycled.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Run the embedded migrations
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(self.pool.as_ref()).await?;
        info!("Schema up to date");
        Ok(())
    }

    /// Round-trip a trivial query
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(self.pool.as_ref()).await?;
        Ok(())
    }

    /// Wait for checked-out connections to return, then close the pool
    pub async fn close(&self) {
        self.pool.close().await;
        debug!("SQLite pool closed");
    }

    /// Connect and migrate in one step
    pub async fn initialize(database_url: &str, max_connections: u32) -> Result<Self> {
        let db = Self::connect(database_url, max_connections).await?;
        db.run_migrations().await?;
        Ok(db)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_in_memory_health_check() {
        let db = Database::in_memory().await.unwrap();
        assert!(db.health_check().await.is_ok());
        db.close().await;
        assert!(db.health_check().await.is_err());
    }

    #[tokio::test]
    async fn test_initialize_file_database() {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite:{}", dir.path().join("studioflow.db").display());

        let db = Database::initialize(&url, 2).await.unwrap();
        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE '\\_%' ESCAPE '\\' ORDER BY name",
        )
        .fetch_all(db.pool())
        .await
        .unwrap();
        let names: Vec<&str> = tables.iter().map(|(n,)| n.as_str()).collect();

        for expected in ["checkpoints", "dead_letters", "jobs", "runs", "safety_audit"] {
            assert!(names.contains(&expected), "missing table {expected}: {names:?}");
        }
        db.close().await;
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let db = Database::in_memory().await.unwrap();
        db.run_migrations().await.unwrap();
        db.run_migrations().await.unwrap();
    }
}
