use chrono::DateTime;
use chrono::Utc;
use strum::Display;
use strum::EnumString;
use thiserror::Error;
use uuid::Uuid;

/// Lifecycle of an uploaded order. Transitions move toward a final state and
/// never leave it.
#[derive(Clone, Copy, Debug, Display, EnumString, Eq, PartialEq)]
#[strum(serialize_all = "UPPERCASE")]
pub enum OrderStatus {
    New,
    Processing,
    Invalid,
    Processed,
}

impl OrderStatus {
    /// Final statuses are never polled again.
    pub fn is_final(self) -> bool {
        matches!(self, OrderStatus::Invalid | OrderStatus::Processed)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Order {
    pub number: String,
    pub status: OrderStatus,
    /// Credited amount in hundredths; present iff `status` is `Processed`.
    pub accrual: Option<i64>,
    pub uploaded_at: DateTime<Utc>,
}

/// A persisted order that has not reached a final status yet. Recovered into
/// the polling engine at startup.
#[derive(Clone, Debug, PartialEq)]
pub struct PendingOrder {
    pub number: String,
    pub user_id: Uuid,
    pub status: OrderStatus,
}

/// One status observation emitted on a polling task's result channel. Only
/// status *changes* are emitted; `accrual` accompanies `Processed`.
#[derive(Clone, Debug, PartialEq)]
pub struct AccrualUpdate {
    pub status: OrderStatus,
    pub accrual: Option<i64>,
}

/// Terminal polling failure. Receiving one means no further values follow.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum PollError {
    #[error("max attempts exceeded")]
    AttemptsExhausted,
}

pub type AccrualResult = Result<AccrualUpdate, PollError>;
