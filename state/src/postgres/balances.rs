use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::Row;
use uuid::Uuid;

use tally_core::ledger::BalanceStore;
use tally_core::txn::StoreTx;
use tally_protocol::Balance;

use super::bounded;
use super::pg_tx;

pub struct PgBalanceStore {
    pool: PgPool,
    timeout: Duration,
}

impl PgBalanceStore {
    pub fn new(pool: PgPool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }
}

#[async_trait]
impl BalanceStore for PgBalanceStore {
    async fn get(
        &self,
        user_id: Uuid,
        tx: Option<&mut dyn StoreTx>,
    ) -> anyhow::Result<Option<Balance>> {
        let row = match tx {
            // Inside a transaction the row is locked so concurrent
            // withdrawals serialize on it.
            Some(tx) => {
                let conn = pg_tx(tx)?.conn()?;
                bounded(
                    self.timeout,
                    sqlx::query(
                        "SELECT current, withdrawn FROM balances WHERE user_id = $1 FOR UPDATE",
                    )
                    .bind(user_id)
                    .fetch_optional(conn),
                )
                .await?
            }
            None => {
                bounded(
                    self.timeout,
                    sqlx::query("SELECT current, withdrawn FROM balances WHERE user_id = $1")
                        .bind(user_id)
                        .fetch_optional(&self.pool),
                )
                .await?
            }
        };

        row.map(|row| {
            Ok(Balance {
                current: row.try_get("current")?,
                withdrawn: row.try_get("withdrawn")?,
            })
        })
        .transpose()
    }

    async fn increase(&self, user_id: Uuid, amount: i64) -> anyhow::Result<()> {
        bounded(
            self.timeout,
            sqlx::query(
                r#"
INSERT INTO balances (user_id, current, withdrawn) VALUES ($1, $2, 0)
ON CONFLICT (user_id) DO UPDATE SET current = balances.current + EXCLUDED.current
                "#,
            )
            .bind(user_id)
            .bind(amount)
            .execute(&self.pool),
        )
        .await?;
        Ok(())
    }

    async fn withdraw(
        &self,
        user_id: Uuid,
        amount: i64,
        tx: &mut dyn StoreTx,
    ) -> anyhow::Result<()> {
        let conn = pg_tx(tx)?.conn()?;
        bounded(
            self.timeout,
            sqlx::query(
                r#"
UPDATE balances
SET current = current - $2, withdrawn = withdrawn + $2
WHERE user_id = $1
                "#,
            )
            .bind(user_id)
            .bind(amount)
            .execute(conn),
        )
        .await?;
        Ok(())
    }
}
