use anyhow::{Context, Result};
use sqlx::{postgres::PgPoolOptions, PgPool};
use trade_engine_core::DatabaseConfig;

use crate::repositories::Repositories;

pub struct DatabaseClient {
    pool: PgPool,
}

impl DatabaseClient {
    /// Connects to `PostgreSQL` and applies pending migrations.
    ///
    /// # Errors
    /// Returns an error if the connection cannot be established or a migration fails.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await
            .with_context(|| "Failed to connect to database")?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("Failed to run migrations")?;

        tracing::info!(max_connections = config.max_connections, "Database ready");
        Ok(Self { pool })
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    #[must_use]
    pub fn repositories(&self) -> Repositories {
        Repositories::new(self.pool.clone())
    }
}
