use std::time::Duration;

use sqlx::sqlite::SqlitePoolOptions;

use countersign_core::config::DatabaseConfig;

pub type DbPool = sqlx::SqlitePool;

/// Opens the pool sized from configuration.
pub async fn connect(config: &DatabaseConfig) -> Result<DbPool, sqlx::Error> {
    connect_with_settings(&config.url, config.max_connections, config.timeout_secs).await
}

/// Every connection gets the pragmas the engine relies on: enforced foreign
/// keys (steps cascade with their workflow), WAL so approvers reading a chain
/// never block a writer, and a busy timeout sized from the acquire timeout so
/// a losing concurrent writer waits for the version check instead of failing
/// on a locked database.
pub async fn connect_with_settings(
    database_url: &str,
    max_connections: u32,
    timeout_secs: u64,
) -> Result<DbPool, sqlx::Error> {
    let busy_timeout_ms = timeout_secs.max(1).saturating_mul(1000).min(30_000);
    SqlitePoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(Duration::from_secs(timeout_secs.max(1)))
        .after_connect(move |conn, _meta| {
            Box::pin(async move {
                sqlx::query("PRAGMA foreign_keys = ON").execute(&mut *conn).await?;
                sqlx::query("PRAGMA journal_mode = WAL").execute(&mut *conn).await?;
                sqlx::query("PRAGMA synchronous = NORMAL").execute(&mut *conn).await?;
                sqlx::query(&format!("PRAGMA busy_timeout = {busy_timeout_ms}"))
                    .execute(&mut *conn)
                    .await?;
                Ok(())
            })
        })
        .connect(database_url)
        .await
}
