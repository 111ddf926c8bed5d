//! The balance ledger: credits from processed orders, explicit withdrawals,
//! and the withdrawal journal. Debits and their journal entries commit in
//! one storage transaction so `current + withdrawn` stays exact.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::error;
use uuid::Uuid;

use tally_engine::SubscriptionId;
use tally_protocol::Balance;
use tally_protocol::LedgerError;
use tally_protocol::WithdrawalEntry;
use tally_protocol::luhn;

use crate::events::LedgerBus;
use crate::events::ORDER_PROCESSED;
use crate::events::OrderProcessed;
use crate::txn::StoreTx;
use crate::txn::TxProvider;

#[async_trait]
pub trait BalanceStore: Send + Sync {
    /// `None` when the user has no balance row yet. When `tx` is given the
    /// row is read under the transaction with a row lock.
    async fn get(
        &self,
        user_id: Uuid,
        tx: Option<&mut dyn StoreTx>,
    ) -> anyhow::Result<Option<Balance>>;
    /// Credit `amount` hundredths, creating the row when absent.
    async fn increase(&self, user_id: Uuid, amount: i64) -> anyhow::Result<()>;
    /// Move `amount` hundredths from `current` to `withdrawn` inside `tx`.
    async fn withdraw(&self, user_id: Uuid, amount: i64, tx: &mut dyn StoreTx)
    -> anyhow::Result<()>;
}

#[async_trait]
pub trait WithdrawalStore: Send + Sync {
    async fn add(
        &self,
        user_id: Uuid,
        order_number: &str,
        sum: i64,
        tx: &mut dyn StoreTx,
    ) -> anyhow::Result<()>;
    async fn list(&self, user_id: Uuid) -> anyhow::Result<Vec<WithdrawalEntry>>;
}

pub struct LedgerService {
    balances: Arc<dyn BalanceStore>,
    withdrawals: Arc<dyn WithdrawalStore>,
    transactions: Arc<dyn TxProvider>,
    bus: LedgerBus,
    subscription: SubscriptionId,
}

impl LedgerService {
    /// Builds the ledger and subscribes it to order-processed events.
    pub fn new(
        balances: Arc<dyn BalanceStore>,
        withdrawals: Arc<dyn WithdrawalStore>,
        transactions: Arc<dyn TxProvider>,
        bus: LedgerBus,
    ) -> Self {
        let subscription = bus.subscribe(ORDER_PROCESSED, {
            let balances = Arc::clone(&balances);
            move |event: OrderProcessed| {
                let balances = Arc::clone(&balances);
                async move {
                    if let Err(err) = balances.increase(event.user_id, event.amount).await {
                        error!(user_id = %event.user_id, "failed to credit balance: {err:#}");
                    }
                }
            }
        });
        Self {
            balances,
            withdrawals,
            transactions,
            bus,
            subscription,
        }
    }

    /// A user without a balance row has the zero balance; never an error on
    /// missing.
    pub async fn get(&self, user_id: Uuid) -> Result<Balance, LedgerError> {
        match self.balances.get(user_id, None).await {
            Ok(balance) => Ok(balance.unwrap_or_default()),
            Err(err) => {
                error!(%user_id, "failed to read balance: {err:#}");
                Err(LedgerError::Internal)
            }
        }
    }

    pub async fn withdraw(
        &self,
        user_id: Uuid,
        order_number: &str,
        sum: i64,
    ) -> Result<(), LedgerError> {
        if !luhn::is_valid(order_number) {
            return Err(LedgerError::InvalidOrderNumber);
        }
        if sum <= 0 {
            return Err(LedgerError::InvalidWithdrawalSum);
        }

        let mut tx = self.transactions.begin().await.map_err(|err| {
            error!(%user_id, "failed to begin withdrawal transaction: {err:#}");
            LedgerError::Internal
        })?;

        let outcome = self
            .withdraw_in_tx(user_id, order_number, sum, tx.as_mut())
            .await;
        match outcome {
            Ok(()) => tx.commit().await.map_err(|err| {
                error!(%user_id, "failed to commit withdrawal: {err:#}");
                LedgerError::Internal
            }),
            Err(err) => {
                // Rollback is idempotent; a failure here cannot change the
                // outcome already decided.
                if let Err(rollback_err) = tx.rollback().await {
                    error!(%user_id, "failed to roll back withdrawal: {rollback_err:#}");
                }
                Err(err)
            }
        }
    }

    async fn withdraw_in_tx(
        &self,
        user_id: Uuid,
        order_number: &str,
        sum: i64,
        tx: &mut dyn StoreTx,
    ) -> Result<(), LedgerError> {
        let internal = |err: anyhow::Error| {
            error!(%user_id, "withdrawal storage failure: {err:#}");
            LedgerError::Internal
        };

        let balance = self
            .balances
            .get(user_id, Some(&mut *tx))
            .await
            .map_err(internal)?;
        let Some(balance) = balance else {
            return Err(LedgerError::NotEnoughBalance);
        };
        if sum > balance.current {
            return Err(LedgerError::NotEnoughBalance);
        }

        self.balances
            .withdraw(user_id, sum, &mut *tx)
            .await
            .map_err(internal)?;
        self.withdrawals
            .add(user_id, order_number, sum, &mut *tx)
            .await
            .map_err(internal)?;
        Ok(())
    }

    pub async fn history(&self, user_id: Uuid) -> Result<Vec<WithdrawalEntry>, LedgerError> {
        self.withdrawals.list(user_id).await.map_err(|err| {
            error!(%user_id, "failed to list withdrawals: {err:#}");
            LedgerError::Internal
        })
    }

    /// Detach from the event bus; part of the graceful shutdown sequence.
    pub fn close(&self) {
        self.bus.unsubscribe(ORDER_PROCESSED, self.subscription);
    }
}
