//! Persistence layer for SlotLock.
//!
//! Provides repository traits with PostgreSQL and in-memory implementations.

pub mod error;
pub mod repo;

pub use error::{DbError, DbResult};
pub use repo::*;
pub use sqlx::PgPool;

use sqlx::postgres::PgPoolOptions;

/// Create a new database connection pool.
pub async fn create_pool(database_url: &str, max_connections: u32) -> DbResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Schema migrations, embedded at compile time.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Run database migrations.
pub async fn run_migrations(pool: &PgPool) -> DbResult<()> {
    MIGRATOR.run(pool).await?;
    Ok(())
}
