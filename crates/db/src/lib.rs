//! SQLite persistence for the Clipper job engine.
//!
//! [`SqliteJobStore`] implements [`clipper_core::job_store::JobStore`] on
//! top of the zero-sized [`repositories::JobRepo`].

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};

pub mod models;
pub mod repositories;

pub use repositories::{JobRepo, SqliteJobStore};

pub type DbPool = sqlx::SqlitePool;

/// Maximum pooled connections. SQLite serialises writers anyway.
const MAX_CONNECTIONS: u32 = 5;

/// Create a connection pool from a database URL such as
/// `sqlite://data/app.db`. The file is created if missing.
pub async fn create_pool(database_url: &str) -> Result<DbPool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);

    SqlitePoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .connect_with(options)
        .await
}

/// Open a private in-memory database.
///
/// Limited to one connection: every SQLite in-memory connection is its
/// own database.
pub async fn create_memory_pool() -> Result<DbPool, sqlx::Error> {
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
}

/// Verify the database answers a trivial query.
pub async fn health_check(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

/// Apply the embedded migrations in `migrations/`.
pub async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!().run(pool).await
}
