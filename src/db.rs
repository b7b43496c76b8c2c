use std::str::FromStr;
use std::time::Duration;

use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{Pool, Postgres};

use crate::error::Result;

pub type DbPool = Pool<Postgres>;

/// Per-statement timeout, so a stalled store degrades ingestion instead of
/// wedging it.
const STATEMENT_TIMEOUT_MS: u64 = 5_000;
const ACQUIRE_TIMEOUT_SECS: u64 = 5;

pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<DbPool> {
    let options = PgConnectOptions::from_str(database_url)?
        .options([("statement_timeout", STATEMENT_TIMEOUT_MS)]);

    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(ACQUIRE_TIMEOUT_SECS))
        .connect_with(options)
        .await?;

    Ok(pool)
}
