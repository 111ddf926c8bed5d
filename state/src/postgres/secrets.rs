use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::Row;

use tally_core::secrets::SecretStore;

use super::bounded;

pub struct PgSecretStore {
    pool: PgPool,
    timeout: Duration,
}

impl PgSecretStore {
    pub fn new(pool: PgPool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }
}

#[async_trait]
impl SecretStore for PgSecretStore {
    async fn get(&self, name: &str) -> anyhow::Result<Option<String>> {
        let row = bounded(
            self.timeout,
            sqlx::query("SELECT value FROM secrets WHERE name = $1")
                .bind(name)
                .fetch_optional(&self.pool),
        )
        .await?;
        row.map(|row| Ok(row.try_get("value")?)).transpose()
    }

    async fn put(&self, name: &str, value: &str) -> anyhow::Result<()> {
        bounded(
            self.timeout,
            sqlx::query("INSERT INTO secrets (name, value) VALUES ($1, $2) ON CONFLICT (name) DO NOTHING")
                .bind(name)
                .bind(value)
                .execute(&self.pool),
        )
        .await?;
        Ok(())
    }
}
