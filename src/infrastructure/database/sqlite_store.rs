use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use tracing::info;

/// SQLite implementation of every entity repository.
///
/// One struct carries the pool; each entity's repository trait is implemented
/// in its own module (`git_repository_repo`, `deployment_repo`, ...).
#[derive(Clone)]
pub struct SqliteStore {
    pub(super) pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if missing) the database at `database_url` and run migrations.
    pub async fn connect(database_url: &str) -> Result<Self> {
        info!("Connecting to database: {}", database_url);

        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("Invalid database URL: {}", database_url))?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("Failed to open SQLite database")?;

        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("Failed to run migrations")?;

        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Fresh migrated database in a temp directory, one per test.
#[cfg(test)]
pub async fn test_store() -> SqliteStore {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("stackhook.db");
    // The directory must outlive every pooled connection of the test.
    std::mem::forget(dir);

    SqliteStore::connect(&format!("sqlite://{}", db_path.display()))
        .await
        .expect("test database")
}
