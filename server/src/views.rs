//! JSON request and response shapes. Money is fractional on the wire and
//! integer hundredths everywhere else; the conversion happens here only.

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use tally_protocol::Balance;
use tally_protocol::Order;
use tally_protocol::WithdrawalEntry;
use tally_protocol::money;

#[derive(Debug, Deserialize)]
pub struct Credentials {
    pub login: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct TokenView {
    pub token: String,
}

#[derive(Debug, Serialize)]
pub struct OrderView {
    pub number: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accrual: Option<f64>,
    pub uploaded_at: DateTime<Utc>,
}

impl From<Order> for OrderView {
    fn from(order: Order) -> Self {
        Self {
            number: order.number,
            status: order.status.to_string(),
            accrual: order.accrual.map(money::to_major),
            uploaded_at: order.uploaded_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BalanceView {
    pub current: f64,
    pub withdrawn: f64,
}

impl From<Balance> for BalanceView {
    fn from(balance: Balance) -> Self {
        Self {
            current: money::to_major(balance.current),
            withdrawn: money::to_major(balance.withdrawn),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct WithdrawRequest {
    pub order: String,
    pub sum: f64,
}

#[derive(Debug, Serialize)]
pub struct WithdrawalView {
    pub order: String,
    pub sum: f64,
    pub processed_at: DateTime<Utc>,
}

impl From<WithdrawalEntry> for WithdrawalView {
    fn from(entry: WithdrawalEntry) -> Self {
        Self {
            order: entry.order_number,
            sum: money::to_major(entry.sum),
            processed_at: entry.processed_at,
        }
    }
}
