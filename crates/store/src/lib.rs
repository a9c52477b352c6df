//! Durable records for bots: mirrored containers, committed snapshots,
//! numbered versions and the lifecycle audit trail.

pub mod error;
pub mod store;
pub mod store_memory;
pub mod store_sqlite;
pub mod types;

pub use {
    error::{Error, Result},
    store::BotStore,
    store_memory::InMemoryStore,
    store_sqlite::SqliteStore,
    types::*,
};

/// Run database migrations for the store.
///
/// Creates the `bots`, `containers`, `snapshots`, `versions`,
/// `version_counters` and `lifecycle_events` tables.
pub async fn run_migrations(pool: &sqlx::SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .set_ignore_missing(true)
        .run(pool)
        .await?;
    Ok(())
}
