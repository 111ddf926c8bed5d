use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::Row;
use uuid::Uuid;

use tally_core::account::UserStore;

use super::bounded;

pub struct PgUserStore {
    pool: PgPool,
    timeout: Duration,
}

impl PgUserStore {
    pub fn new(pool: PgPool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn add(&self, login: &str, password_hash: &str) -> anyhow::Result<Option<Uuid>> {
        let user_id = Uuid::new_v4();
        let inserted = tokio::time::timeout(
            self.timeout,
            sqlx::query("INSERT INTO users (id, login, password_hash) VALUES ($1, $2, $3)")
                .bind(user_id)
                .bind(login)
                .bind(password_hash)
                .execute(&self.pool),
        )
        .await?;

        match inserted {
            Ok(_) => Ok(Some(user_id)),
            Err(err) if is_unique_violation(&err) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn find(&self, login: &str) -> anyhow::Result<Option<(Uuid, String)>> {
        let row = bounded(
            self.timeout,
            sqlx::query("SELECT id, password_hash FROM users WHERE login = $1")
                .bind(login)
                .fetch_optional(&self.pool),
        )
        .await?;
        row.map(|row| Ok((row.try_get("id")?, row.try_get("password_hash")?)))
            .transpose()
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .is_some_and(|db| db.is_unique_violation())
}
