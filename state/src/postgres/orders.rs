use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::Row;
use uuid::Uuid;

use tally_core::orders::OrderStore;
use tally_protocol::Order;
use tally_protocol::OrderStatus;
use tally_protocol::PendingOrder;

use super::bounded;

pub struct PgOrderStore {
    pool: PgPool,
    timeout: Duration,
}

impl PgOrderStore {
    pub fn new(pool: PgPool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }
}

#[async_trait]
impl OrderStore for PgOrderStore {
    async fn add(&self, user_id: Uuid, number: &str, status: OrderStatus) -> anyhow::Result<()> {
        bounded(
            self.timeout,
            sqlx::query("INSERT INTO orders (number, user_id, status) VALUES ($1, $2, $3)")
                .bind(number)
                .bind(user_id)
                .bind(status.to_string())
                .execute(&self.pool),
        )
        .await?;
        Ok(())
    }

    async fn update(
        &self,
        number: &str,
        status: OrderStatus,
        accrual: Option<i64>,
    ) -> anyhow::Result<()> {
        // Final statuses are immutable; the predicate makes a late or
        // duplicate result a no-op instead of a regression.
        bounded(
            self.timeout,
            sqlx::query(
                r#"
UPDATE orders
SET status = $2, accrual = COALESCE($3, accrual), updated_at = now()
WHERE number = $1 AND status NOT IN ('INVALID', 'PROCESSED')
                "#,
            )
            .bind(number)
            .bind(status.to_string())
            .bind(accrual)
            .execute(&self.pool),
        )
        .await?;
        Ok(())
    }

    async fn owner(&self, number: &str) -> anyhow::Result<Option<Uuid>> {
        let row = bounded(
            self.timeout,
            sqlx::query("SELECT user_id FROM orders WHERE number = $1")
                .bind(number)
                .fetch_optional(&self.pool),
        )
        .await?;
        row.map(|row| Ok(row.try_get("user_id")?)).transpose()
    }

    async fn list(&self, user_id: Uuid) -> anyhow::Result<Vec<Order>> {
        let rows = bounded(
            self.timeout,
            sqlx::query(
                r#"
SELECT number, status, accrual, uploaded_at
FROM orders
WHERE user_id = $1
ORDER BY uploaded_at DESC
                "#,
            )
            .bind(user_id)
            .fetch_all(&self.pool),
        )
        .await?;

        let mut orders = Vec::with_capacity(rows.len());
        for row in rows {
            let status: String = row.try_get("status")?;
            orders.push(Order {
                number: row.try_get("number")?,
                status: OrderStatus::from_str(&status)?,
                accrual: row.try_get("accrual")?,
                uploaded_at: row.try_get("uploaded_at")?,
            });
        }
        Ok(orders)
    }

    async fn list_unprocessed(&self) -> anyhow::Result<Vec<PendingOrder>> {
        let rows = bounded(
            self.timeout,
            sqlx::query(
                "SELECT number, user_id, status FROM orders WHERE status IN ('NEW', 'PROCESSING')",
            )
            .fetch_all(&self.pool),
        )
        .await?;

        let mut pending = Vec::with_capacity(rows.len());
        for row in rows {
            let status: String = row.try_get("status")?;
            pending.push(PendingOrder {
                number: row.try_get("number")?,
                user_id: row.try_get("user_id")?,
                status: OrderStatus::from_str(&status)?,
            });
        }
        Ok(pending)
    }
}
