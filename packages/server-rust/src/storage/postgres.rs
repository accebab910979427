//! `PostgreSQL` translation history via `sqlx`.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use parley_core::Translation;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{info, warn};

use crate::usecase::TranslationRepo;

const CREATE_HISTORY: &str = "CREATE TABLE IF NOT EXISTS history (
    id SERIAL PRIMARY KEY,
    source VARCHAR(255),
    destination VARCHAR(255),
    original VARCHAR(255),
    translation VARCHAR(255)
)";

/// Pool sizing and connection retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PostgresOptions {
    pub max_connections: u32,
    pub connect_attempts: u32,
    pub connect_wait: Duration,
}

impl Default for PostgresOptions {
    fn default() -> Self {
        Self {
            max_connections: 2,
            connect_attempts: 10,
            connect_wait: Duration::from_secs(1),
        }
    }
}

/// History stored in the `history` table.
#[derive(Debug, Clone)]
pub struct PostgresTranslationRepo {
    pool: PgPool,
}

impl PostgresTranslationRepo {
    /// Connects to `url`, retrying while the database comes up.
    ///
    /// # Errors
    ///
    /// Returns the last connection error once every attempt failed.
    pub async fn connect(url: &str, options: PostgresOptions) -> anyhow::Result<Self> {
        let attempts = options.connect_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let result = PgPoolOptions::new()
                .max_connections(options.max_connections)
                .connect(url)
                .await;

            match result {
                Ok(pool) => {
                    info!(attempt, max_connections = options.max_connections, "connected to postgres");
                    return Ok(Self { pool });
                }
                Err(e) if attempt >= attempts => {
                    return Err(e).context(format!("postgres unreachable after {attempts} attempts"));
                }
                Err(e) => {
                    warn!(attempt, attempts_left = attempts - attempt, error = %e, "postgres connect failed");
                    tokio::time::sleep(options.connect_wait).await;
                }
            }
        }
    }
}

#[async_trait]
impl TranslationRepo for PostgresTranslationRepo {
    async fn initialize(&self) -> anyhow::Result<()> {
        sqlx::query(CREATE_HISTORY)
            .execute(&self.pool)
            .await
            .context("create history table")?;
        Ok(())
    }

    async fn get_history(&self) -> anyhow::Result<Vec<Translation>> {
        let rows: Vec<(String, String, String, String)> = sqlx::query_as(
            "SELECT source, destination, original, translation FROM history ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .context("select history")?;

        Ok(rows
            .into_iter()
            .map(|(source, destination, original, translation)| Translation {
                source,
                destination,
                original,
                translation,
            })
            .collect())
    }

    async fn store(&self, translation: &Translation) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO history (source, destination, original, translation) VALUES ($1, $2, $3, $4)",
        )
        .bind(&translation.source)
        .bind(&translation.destination)
        .bind(&translation.original)
        .bind(&translation.translation)
        .execute(&self.pool)
        .await
        .context("insert history")?;
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.pool.close().await;
        Ok(())
    }
}
