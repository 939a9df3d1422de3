// PostgreSQL connection pool used by the document store

use crate::config::DatabaseConfig;
use crate::errors::StoreError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{error, info, instrument};

/// Managed connection pool to PostgreSQL
#[derive(Debug, Clone)]
pub struct DbPool {
    pool: PgPool,
}

impl DbPool {
    /// Connect using the configured URL and pool bounds
    ///
    /// # Errors
    /// Returns `StoreError::Database` if no connection can be established
    #[instrument(skip(config), fields(max_connections = config.max_connections))]
    pub async fn new(config: &DatabaseConfig) -> Result<Self, StoreError> {
        info!("Initializing database connection pool");

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_seconds))
            .connect(&config.url)
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to create database pool");
                StoreError::Database(format!("Connection failed: {}", e))
            })?;

        info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Database connection pool initialized"
        );

        Ok(Self { pool })
    }

    /// Wrap an already connected pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled schema migrations
    #[instrument(skip(self))]
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| {
                error!(error = %e, "Database migration failed");
                StoreError::Database(format!("Migration failed: {}", e))
            })?;
        info!("Database schema is up to date");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!(error = %e, "Database health check failed");
                StoreError::Database(format!("Health check failed: {}", e))
            })?;
        Ok(())
    }

    /// Close the pool during graceful shutdown
    #[instrument(skip(self))]
    pub async fn close(&self) {
        info!("Closing database connection pool");
        self.pool.close().await;
    }
}
