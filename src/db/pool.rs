//! Connection pool construction.
//!
//! The pool itself is sqlx's; this module only applies our configuration to
//! it. Everything above consumes the pool through transaction and connection
//! scopes rather than owning pooling logic.

use crate::config::DatabaseConfig;
use crate::error::Result;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;
use tracing::info;

/// Create a connection pool for the given configuration.
pub(crate) async fn create_pool(config: &DatabaseConfig) -> Result<PgPool> {
    config.validate()?;
    let pool = PgPoolOptions::new()
        .min_connections(config.min_connections)
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
        .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
        .connect(&config.url)
        .await?;
    info!(
        min_connections = config.min_connections,
        max_connections = config.max_connections,
        "created connection pool"
    );
    Ok(pool)
}
