use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::Row;
use uuid::Uuid;

use tally_core::ledger::WithdrawalStore;
use tally_core::txn::StoreTx;
use tally_protocol::WithdrawalEntry;

use super::bounded;
use super::pg_tx;

pub struct PgWithdrawalStore {
    pool: PgPool,
    timeout: Duration,
}

impl PgWithdrawalStore {
    pub fn new(pool: PgPool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }
}

#[async_trait]
impl WithdrawalStore for PgWithdrawalStore {
    async fn add(
        &self,
        user_id: Uuid,
        order_number: &str,
        sum: i64,
        tx: &mut dyn StoreTx,
    ) -> anyhow::Result<()> {
        let conn = pg_tx(tx)?.conn()?;
        bounded(
            self.timeout,
            sqlx::query("INSERT INTO withdrawals (user_id, order_number, sum) VALUES ($1, $2, $3)")
                .bind(user_id)
                .bind(order_number)
                .bind(sum)
                .execute(conn),
        )
        .await?;
        Ok(())
    }

    async fn list(&self, user_id: Uuid) -> anyhow::Result<Vec<WithdrawalEntry>> {
        let rows = bounded(
            self.timeout,
            sqlx::query(
                r#"
SELECT order_number, sum, processed_at
FROM withdrawals
WHERE user_id = $1
ORDER BY processed_at DESC
                "#,
            )
            .bind(user_id)
            .fetch_all(&self.pool),
        )
        .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            entries.push(WithdrawalEntry {
                order_number: row.try_get("order_number")?,
                sum: row.try_get("sum")?,
                processed_at: row.try_get("processed_at")?,
            });
        }
        Ok(entries)
    }
}
