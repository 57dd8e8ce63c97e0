//! TimescaleDB connection setup and schema bootstrap
//!
//! The schema is embedded and applied as one idempotent batch at startup;
//! only the retention policy is applied separately because its interval comes
//! from configuration.

use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};

use crate::config::TimescaleConfig;
use crate::error::Result;

/// Embedded schema (idempotent DDL batch)
const SCHEMA: &str = include_str!("schema.sql");

/// Open a connection pool against the configured TimescaleDB instance
pub async fn connect(config: &TimescaleConfig) -> Result<PgPool> {
    let options = PgConnectOptions::new()
        .host(&config.host)
        .port(config.port)
        .username(&config.user)
        .password(&config.password)
        .database(&config.dbname);

    tracing::info!(
        host = %config.host,
        port = config.port,
        dbname = %config.dbname,
        user = %config.user,
        "Connecting to TimescaleDB"
    );

    let pool = PgPoolOptions::new()
        .max_connections(config.pool_size)
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// Apply the embedded schema and the configured retention policy
pub async fn migrate(pool: &PgPool, data_retention_days: u32) -> Result<()> {
    sqlx::raw_sql(SCHEMA).execute(pool).await?;

    sqlx::query("SELECT add_retention_policy('point', $1::interval, if_not_exists => TRUE)")
        .bind(format!("{} days", data_retention_days))
        .execute(pool)
        .await?;

    tracing::info!(data_retention_days, "Schema bootstrap complete");
    Ok(())
}

/// Cheap liveness probe for the pool
pub async fn health_check(pool: &PgPool) -> Result<()> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}
