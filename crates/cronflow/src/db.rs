use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::str::FromStr;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub busy_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 4,
            busy_timeout: Duration::from_secs(10),
        }
    }
}

pub fn is_memory_url(database_url: &str) -> bool {
    database_url.contains(":memory:") || database_url.contains("mode=memory")
}

/// Open a pool against `database_url`.
///
/// In-memory databases live only as long as their connection, so they get a
/// single connection that is never recycled. File databases run in WAL mode
/// with a bounded pool.
pub async fn make_pool(database_url: &str, cfg: &PoolConfig) -> anyhow::Result<SqlitePool> {
    let memory = is_memory_url(database_url);

    let mut options = SqliteConnectOptions::from_str(database_url)?
        .foreign_keys(true)
        .busy_timeout(cfg.busy_timeout)
        .create_if_missing(true);

    if !memory {
        options = options
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);
    }

    let max_connections = if memory {
        1
    } else {
        cfg.max_connections.clamp(1, 32)
    };

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .min_connections(if memory { 1 } else { 0 })
        .idle_timeout(if memory { None } else { Some(Duration::from_secs(600)) })
        .max_lifetime(if memory { None } else { Some(Duration::from_secs(1800)) })
        .connect_with(options)
        .await?;

    tracing::debug!(max_connections, memory, "database pool created");
    Ok(pool)
}

pub async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
