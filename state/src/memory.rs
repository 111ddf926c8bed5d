//! In-memory store implementations. They honor the same contracts as the
//! Postgres stores and back the unit and integration test suites.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use anyhow::bail;
use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use tally_core::account::UserStore;
use tally_core::ledger::BalanceStore;
use tally_core::ledger::WithdrawalStore;
use tally_core::orders::OrderStore;
use tally_core::secrets::SecretStore;
use tally_core::txn::StoreTx;
use tally_core::txn::TxProvider;
use tally_protocol::Balance;
use tally_protocol::Order;
use tally_protocol::OrderStatus;
use tally_protocol::PendingOrder;
use tally_protocol::WithdrawalEntry;

fn locked<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Serializes whole transactions behind one async mutex, which trivially
/// provides the isolation the ledger requires.
#[derive(Clone, Default)]
pub struct MemoryTxProvider {
    gate: Arc<tokio::sync::Mutex<()>>,
}

#[async_trait]
impl TxProvider for MemoryTxProvider {
    async fn begin(&self) -> anyhow::Result<Box<dyn StoreTx>> {
        let guard = Arc::clone(&self.gate).lock_owned().await;
        Ok(Box::new(MemoryTx {
            guard: Some(guard),
        }))
    }
}

pub struct MemoryTx {
    guard: Option<OwnedMutexGuard<()>>,
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn commit(&mut self) -> anyhow::Result<()> {
        self.guard.take();
        Ok(())
    }

    async fn rollback(&mut self) -> anyhow::Result<()> {
        self.guard.take();
        Ok(())
    }

    fn as_any(&mut self) -> &mut dyn Any {
        self
    }
}

#[derive(Default)]
pub struct MemoryOrderStore {
    orders: Mutex<HashMap<String, StoredOrder>>,
}

struct StoredOrder {
    user_id: Uuid,
    status: OrderStatus,
    accrual: Option<i64>,
    uploaded_at: DateTime<Utc>,
}

#[async_trait]
impl OrderStore for MemoryOrderStore {
    async fn add(&self, user_id: Uuid, number: &str, status: OrderStatus) -> anyhow::Result<()> {
        let mut orders = locked(&self.orders);
        if orders.contains_key(number) {
            bail!("order {number} already exists");
        }
        orders.insert(
            number.to_string(),
            StoredOrder {
                user_id,
                status,
                accrual: None,
                uploaded_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn update(
        &self,
        number: &str,
        status: OrderStatus,
        accrual: Option<i64>,
    ) -> anyhow::Result<()> {
        let mut orders = locked(&self.orders);
        let Some(order) = orders.get_mut(number) else {
            return Ok(());
        };
        // Final statuses are immutable.
        if order.status.is_final() {
            return Ok(());
        }
        order.status = status;
        if accrual.is_some() {
            order.accrual = accrual;
        }
        Ok(())
    }

    async fn owner(&self, number: &str) -> anyhow::Result<Option<Uuid>> {
        Ok(locked(&self.orders).get(number).map(|order| order.user_id))
    }

    async fn list(&self, user_id: Uuid) -> anyhow::Result<Vec<Order>> {
        let orders = locked(&self.orders);
        let mut listed: Vec<Order> = orders
            .iter()
            .filter(|(_, order)| order.user_id == user_id)
            .map(|(number, order)| Order {
                number: number.clone(),
                status: order.status,
                accrual: order.accrual,
                uploaded_at: order.uploaded_at,
            })
            .collect();
        listed.sort_by(|a, b| b.uploaded_at.cmp(&a.uploaded_at));
        Ok(listed)
    }

    async fn list_unprocessed(&self) -> anyhow::Result<Vec<PendingOrder>> {
        Ok(locked(&self.orders)
            .iter()
            .filter(|(_, order)| !order.status.is_final())
            .map(|(number, order)| PendingOrder {
                number: number.clone(),
                user_id: order.user_id,
                status: order.status,
            })
            .collect())
    }
}

#[derive(Default)]
pub struct MemoryBalanceStore {
    balances: Mutex<HashMap<Uuid, Balance>>,
}

#[async_trait]
impl BalanceStore for MemoryBalanceStore {
    async fn get(
        &self,
        user_id: Uuid,
        _tx: Option<&mut dyn StoreTx>,
    ) -> anyhow::Result<Option<Balance>> {
        Ok(locked(&self.balances).get(&user_id).copied())
    }

    async fn increase(&self, user_id: Uuid, amount: i64) -> anyhow::Result<()> {
        let mut balances = locked(&self.balances);
        let balance = balances.entry(user_id).or_default();
        balance.current += amount;
        Ok(())
    }

    async fn withdraw(
        &self,
        user_id: Uuid,
        amount: i64,
        _tx: &mut dyn StoreTx,
    ) -> anyhow::Result<()> {
        let mut balances = locked(&self.balances);
        let Some(balance) = balances.get_mut(&user_id) else {
            bail!("no balance row for {user_id}");
        };
        if amount > balance.current {
            bail!("balance of {user_id} would go negative");
        }
        balance.current -= amount;
        balance.withdrawn += amount;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryWithdrawalStore {
    entries: Mutex<HashMap<Uuid, Vec<WithdrawalEntry>>>,
}

#[async_trait]
impl WithdrawalStore for MemoryWithdrawalStore {
    async fn add(
        &self,
        user_id: Uuid,
        order_number: &str,
        sum: i64,
        _tx: &mut dyn StoreTx,
    ) -> anyhow::Result<()> {
        locked(&self.entries)
            .entry(user_id)
            .or_default()
            .push(WithdrawalEntry {
                order_number: order_number.to_string(),
                sum,
                processed_at: Utc::now(),
            });
        Ok(())
    }

    async fn list(&self, user_id: Uuid) -> anyhow::Result<Vec<WithdrawalEntry>> {
        let entries = locked(&self.entries);
        let mut listed = entries.get(&user_id).cloned().unwrap_or_default();
        listed.sort_by(|a, b| b.processed_at.cmp(&a.processed_at));
        Ok(listed)
    }
}

#[derive(Default)]
pub struct MemoryUserStore {
    users: Mutex<HashMap<String, (Uuid, String)>>,
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn add(&self, login: &str, password_hash: &str) -> anyhow::Result<Option<Uuid>> {
        let mut users = locked(&self.users);
        if users.contains_key(login) {
            return Ok(None);
        }
        let user_id = Uuid::new_v4();
        users.insert(login.to_string(), (user_id, password_hash.to_string()));
        Ok(Some(user_id))
    }

    async fn find(&self, login: &str) -> anyhow::Result<Option<(Uuid, String)>> {
        Ok(locked(&self.users).get(login).cloned())
    }
}

#[derive(Default)]
pub struct MemorySecretStore {
    secrets: Mutex<HashMap<String, String>>,
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get(&self, name: &str) -> anyhow::Result<Option<String>> {
        Ok(locked(&self.secrets).get(name).cloned())
    }

    async fn put(&self, name: &str, value: &str) -> anyhow::Result<()> {
        locked(&self.secrets)
            .entry(name.to_string())
            .or_insert_with(|| value.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn order_updates_stop_at_final_statuses() {
        let store = MemoryOrderStore::default();
        let user = Uuid::new_v4();
        store
            .add(user, "12345678903", OrderStatus::New)
            .await
            .expect("add");
        store
            .update("12345678903", OrderStatus::Processed, Some(500))
            .await
            .expect("update");
        store
            .update("12345678903", OrderStatus::Processing, None)
            .await
            .expect("late update");

        let orders = store.list(user).await.expect("list");
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].status, OrderStatus::Processed);
        assert_eq!(orders[0].accrual, Some(500));
    }

    #[tokio::test]
    async fn unprocessed_listing_excludes_final_orders() {
        let store = MemoryOrderStore::default();
        let user = Uuid::new_v4();
        for (number, status) in [
            ("12345678903", OrderStatus::New),
            ("4561261212345467", OrderStatus::Processing),
            ("79927398713", OrderStatus::Processed),
        ] {
            store.add(user, number, status).await.expect("add");
        }

        let mut pending = store.list_unprocessed().await.expect("list");
        pending.sort_by(|a, b| a.number.cmp(&b.number));
        let numbers: Vec<&str> = pending.iter().map(|order| order.number.as_str()).collect();
        assert_eq!(numbers, vec!["12345678903", "4561261212345467"]);
    }

    #[tokio::test]
    async fn balance_increase_accumulates() {
        let store = MemoryBalanceStore::default();
        let user = Uuid::new_v4();
        assert_eq!(store.get(user, None).await.expect("get"), None);

        store.increase(user, 100).await.expect("increase");
        store.increase(user, 250).await.expect("increase");
        assert_eq!(
            store.get(user, None).await.expect("get"),
            Some(Balance {
                current: 350,
                withdrawn: 0,
            })
        );
    }

    #[tokio::test]
    async fn transactions_serialize_and_resolve_idempotently() {
        let provider = MemoryTxProvider::default();
        let mut tx = provider.begin().await.expect("begin");
        tx.commit().await.expect("commit");
        tx.commit().await.expect("second commit is a no-op");
        tx.rollback().await.expect("rollback after commit is a no-op");

        // The gate must be free again for the next transaction.
        let mut next = provider.begin().await.expect("begin again");
        next.rollback().await.expect("rollback");
    }

    #[tokio::test]
    async fn duplicate_login_is_reported_as_taken() {
        let store = MemoryUserStore::default();
        let first = store.add("alice", "hash-a").await.expect("add");
        assert!(first.is_some());
        let second = store.add("alice", "hash-b").await.expect("add again");
        assert_eq!(second, None);
    }

    #[tokio::test]
    async fn secret_put_is_first_write_wins() {
        let store = MemorySecretStore::default();
        store.put("token_secret", "aa").await.expect("put");
        store.put("token_secret", "bb").await.expect("second put");
        assert_eq!(
            store.get("token_secret").await.expect("get"),
            Some("aa".to_string())
        );
    }
}
