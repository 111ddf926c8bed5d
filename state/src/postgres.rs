//! Postgres-backed stores. One shared connection pool serves every store;
//! each call is bounded by a configured timeout.

use std::any::Any;
use std::time::Duration;

use anyhow::Context;
use anyhow::anyhow;
use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::Postgres;
use sqlx::Transaction;
use sqlx::migrate::Migrator;
use sqlx::postgres::PgConnection;
use sqlx::postgres::PgPoolOptions;

use tally_core::txn::StoreTx;
use tally_core::txn::TxProvider;

mod balances;
mod orders;
mod secrets;
mod users;
mod withdrawals;

pub use balances::PgBalanceStore;
pub use orders::PgOrderStore;
pub use secrets::PgSecretStore;
pub use users::PgUserStore;
pub use withdrawals::PgWithdrawalStore;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Open a pool against `dsn`, verify connectivity, and run migrations.
pub async fn connect(dsn: &str, timeout: Duration) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .acquire_timeout(timeout)
        .connect(dsn)
        .await
        .context("could not connect to database")?;
    MIGRATOR.run(&pool).await.context("migration failed")?;
    Ok(pool)
}

pub struct PgTxProvider {
    pool: PgPool,
}

impl PgTxProvider {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TxProvider for PgTxProvider {
    async fn begin(&self) -> anyhow::Result<Box<dyn StoreTx>> {
        let tx = self.pool.begin().await.context("could not begin tx")?;
        Ok(Box::new(PgTx { tx: Some(tx) }))
    }
}

pub struct PgTx {
    /// `None` once resolved; commit and rollback are then no-ops.
    tx: Option<Transaction<'static, Postgres>>,
}

impl PgTx {
    fn conn(&mut self) -> anyhow::Result<&mut PgConnection> {
        self.tx
            .as_deref_mut()
            .ok_or_else(|| anyhow!("transaction already resolved"))
    }
}

#[async_trait]
impl StoreTx for PgTx {
    async fn commit(&mut self) -> anyhow::Result<()> {
        match self.tx.take() {
            Some(tx) => Ok(tx.commit().await?),
            None => Ok(()),
        }
    }

    async fn rollback(&mut self) -> anyhow::Result<()> {
        match self.tx.take() {
            Some(tx) => Ok(tx.rollback().await?),
            None => Ok(()),
        }
    }

    fn as_any(&mut self) -> &mut dyn Any {
        self
    }
}

/// Recover the concrete transaction handed out by [`PgTxProvider`].
fn pg_tx(tx: &mut dyn StoreTx) -> anyhow::Result<&mut PgTx> {
    tx.as_any()
        .downcast_mut::<PgTx>()
        .ok_or_else(|| anyhow!("unexpected transaction type"))
}

/// Bound a storage future by the store's per-call timeout.
async fn bounded<T, F>(timeout: Duration, fut: F) -> anyhow::Result<T>
where
    F: Future<Output = Result<T, sqlx::Error>>,
{
    Ok(tokio::time::timeout(timeout, fut)
        .await
        .context("database call timed out")??)
}
