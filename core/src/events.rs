use tally_engine::EventBus;
use uuid::Uuid;

/// Published by the order coordinator when an order reaches `PROCESSED` with
/// a positive accrual; consumed by the ledger to credit the balance.
pub const ORDER_PROCESSED: &str = "order.processed";

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OrderProcessed {
    pub user_id: Uuid,
    /// Credited amount in hundredths.
    pub amount: i64,
}

pub type LedgerBus = EventBus<OrderProcessed>;
