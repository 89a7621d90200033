//! PostgreSQL pool setup for `PgStore`.

use crate::config::DatabaseConfig;
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

/// The credential listener pins one connection for the life of the process.
const LISTENER_CONNECTIONS: u32 = 1;

fn pool_options(config: &DatabaseConfig) -> PgPoolOptions {
    PgPoolOptions::new()
        .max_connections(config.max_connections.max(LISTENER_CONNECTIONS + 1))
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
}

/// Connects and applies `migrations/` before anything reads the schema.
pub async fn connect(config: &DatabaseConfig) -> Result<PgPool, AppError> {
    let pool = pool_options(config)
        .connect(&config.url)
        .await
        .map_err(|e| AppError::DatabaseError(e.into()))?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.into()))?;

    tracing::info!(
        max_connections = pool.options().get_max_connections(),
        "Connected to PostgreSQL and applied migrations"
    );
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_leaves_room_for_the_listener() {
        let config = DatabaseConfig {
            url: "postgres://localhost/control_plane_test".to_string(),
            max_connections: 1,
            min_connections: 0,
        };
        assert_eq!(pool_options(&config).get_max_connections(), 2);
    }

    #[tokio::test]
    #[ignore] // Requires running PostgreSQL
    async fn connects_and_migrates() {
        let config = DatabaseConfig {
            url: "postgres://localhost/control_plane_test".to_string(),
            max_connections: 5,
            min_connections: 1,
        };
        assert!(connect(&config).await.is_ok());
    }
}
