//! Run database connections.
//!
//! Checkpoints are written through one connection so SQLite never sees two
//! writers; status queries go through a separate read-only pool. WAL mode
//! lets the two proceed side by side.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use jobflow_types::config::StorageSettings;

/// File name of the run database inside the data directory.
const DATABASE_FILE: &str = "jobflow.db";

/// Read-only pool plus the single checkpoint writer.
#[derive(Clone)]
pub struct DatabasePool {
    pub reader: SqlitePool,
    pub writer: SqlitePool,
}

impl DatabasePool {
    /// Open (creating if needed) the run database in `data_dir`.
    pub async fn open(data_dir: &Path, settings: &StorageSettings) -> Result<Self, sqlx::Error> {
        Self::connect(&database_url(data_dir), settings).await
    }

    /// Connect to `url`, apply pending migrations, then open the readers.
    pub async fn connect(url: &str, settings: &StorageSettings) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(url)?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(settings.busy_timeout_secs))
            .create_if_missing(true);

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options.clone())
            .await?;

        // Readers open read-only, so the schema has to exist first.
        sqlx::migrate!("../../migrations").run(&writer).await?;

        let readers = settings.read_connections.max(1);
        let reader = SqlitePoolOptions::new()
            .max_connections(readers)
            .connect_with(options.read_only(true))
            .await?;

        tracing::debug!(url, readers, "run database opened");
        Ok(Self { reader, writer })
    }

    /// Wait for in-flight queries, then close both pools.
    pub async fn close(&self) {
        self.writer.close().await;
        self.reader.close().await;
    }
}

/// SQLite URL for the database file inside `data_dir`.
pub fn database_url(data_dir: &Path) -> String {
    format!("sqlite://{}/{DATABASE_FILE}", data_dir.display())
}
