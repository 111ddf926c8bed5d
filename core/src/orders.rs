//! Order lifecycle coordination: validates submissions, records ownership,
//! routes orders through the polling engine, and applies accrual results
//! back to storage.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::error;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

use tally_engine::AccrualPoller;
use tally_engine::EnqueueError;
use tally_protocol::AccrualResult;
use tally_protocol::Order;
use tally_protocol::OrderError;
use tally_protocol::OrderStatus;
use tally_protocol::PendingOrder;
use tally_protocol::luhn;

use crate::events::LedgerBus;
use crate::events::ORDER_PROCESSED;
use crate::events::OrderProcessed;

#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn add(&self, user_id: Uuid, number: &str, status: OrderStatus) -> anyhow::Result<()>;
    /// Apply a status change, and an accrual when present. Orders already in
    /// a final status are left untouched.
    async fn update(
        &self,
        number: &str,
        status: OrderStatus,
        accrual: Option<i64>,
    ) -> anyhow::Result<()>;
    async fn owner(&self, number: &str) -> anyhow::Result<Option<Uuid>>;
    async fn list(&self, user_id: Uuid) -> anyhow::Result<Vec<Order>>;
    /// Every order that has not reached a final status.
    async fn list_unprocessed(&self) -> anyhow::Result<Vec<PendingOrder>>;
}

/// The coordinator's view of the polling engine.
#[async_trait]
pub trait AccrualSource: Send + Sync {
    async fn enqueue(
        &self,
        number: &str,
        current_status: OrderStatus,
    ) -> Result<mpsc::Receiver<AccrualResult>, EnqueueError>;
}

#[async_trait]
impl AccrualSource for AccrualPoller {
    async fn enqueue(
        &self,
        number: &str,
        current_status: OrderStatus,
    ) -> Result<mpsc::Receiver<AccrualResult>, EnqueueError> {
        AccrualPoller::enqueue(self, number, current_status).await
    }
}

pub struct OrderService {
    store: Arc<dyn OrderStore>,
    accrual: Arc<dyn AccrualSource>,
    bus: LedgerBus,
}

impl OrderService {
    pub fn new(store: Arc<dyn OrderStore>, accrual: Arc<dyn AccrualSource>, bus: LedgerBus) -> Self {
        Self { store, accrual, bus }
    }

    /// Accept a new order number for `user_id`, persist it, and hand it to
    /// the polling engine.
    pub async fn upload(&self, user_id: Uuid, number: &str) -> Result<(), OrderError> {
        if !luhn::is_valid(number) {
            return Err(OrderError::InvalidNumber);
        }

        match self.store.owner(number).await {
            Ok(Some(owner)) if owner == user_id => return Err(OrderError::AlreadyUploaded),
            Ok(Some(_)) => return Err(OrderError::UploadedByAnotherUser),
            Ok(None) => {}
            Err(err) => {
                error!(number, "failed to look up order owner: {err:#}");
                return Err(OrderError::Internal);
            }
        }

        if let Err(err) = self.store.add(user_id, number, OrderStatus::New).await {
            error!(number, %user_id, "failed to persist order: {err:#}");
            return Err(OrderError::Internal);
        }

        self.enqueue_for_processing(number, user_id, OrderStatus::New)
            .await
    }

    /// Enqueue `number` into the polling engine and spawn a consumer that
    /// applies every emitted result to storage.
    pub async fn enqueue_for_processing(
        &self,
        number: &str,
        user_id: Uuid,
        current_status: OrderStatus,
    ) -> Result<(), OrderError> {
        if current_status.is_final() {
            return Err(OrderError::AlreadyProcessed);
        }

        let receiver = match self.accrual.enqueue(number, current_status).await {
            Ok(receiver) => receiver,
            Err(err) => {
                error!(number, "failed to enqueue order for polling: {err}");
                return Err(OrderError::Internal);
            }
        };

        tokio::spawn(apply_results(
            Arc::clone(&self.store),
            self.bus.clone(),
            receiver,
            number.to_string(),
            user_id,
        ));
        Ok(())
    }

    pub async fn list(&self, user_id: Uuid) -> Result<Vec<Order>, OrderError> {
        self.store.list(user_id).await.map_err(|err| {
            error!(%user_id, "failed to list orders: {err:#}");
            OrderError::Internal
        })
    }

    /// Re-enqueue every persisted order that never reached a final status.
    /// Called once at startup so a restart resumes in-flight work.
    pub async fn recover_unprocessed(&self) -> Result<usize, OrderError> {
        let pending = self.store.list_unprocessed().await.map_err(|err| {
            error!("failed to enumerate unprocessed orders: {err:#}");
            OrderError::Internal
        })?;

        let mut recovered = 0;
        for order in pending {
            match self
                .enqueue_for_processing(&order.number, order.user_id, order.status)
                .await
            {
                Ok(()) => recovered += 1,
                // One unrecoverable order must not take the service down.
                Err(err) => warn!(number = %order.number, "skipping order during recovery: {err}"),
            }
        }
        info!(recovered, "re-enqueued unfinished orders");
        Ok(recovered)
    }
}

/// Drains one polling task's result channel. Runs detached until the engine
/// closes the channel.
async fn apply_results(
    store: Arc<dyn OrderStore>,
    bus: LedgerBus,
    mut receiver: mpsc::Receiver<AccrualResult>,
    number: String,
    user_id: Uuid,
) {
    while let Some(result) = receiver.recv().await {
        let (status, accrual) = match result {
            Ok(update) => (update.status, update.accrual),
            Err(err) => {
                warn!(number = %number, "accrual polling gave up, marking order invalid: {err}");
                (OrderStatus::Invalid, None)
            }
        };

        if let Err(err) = store.update(&number, status, accrual).await {
            // Keep draining so later results still get a chance to apply.
            error!(number = %number, "failed to apply accrual result: {err:#}");
            continue;
        }

        if status == OrderStatus::Processed
            && let Some(amount) = accrual
            && amount > 0
        {
            bus.publish(ORDER_PROCESSED, OrderProcessed { user_id, amount });
        }
    }
}
