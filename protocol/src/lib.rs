//! Domain types shared by every other crate in the workspace: orders and
//! their statuses, balances, withdrawals, accrual results, and the error
//! kinds the transport layer maps to HTTP codes.

mod balance;
mod error;
pub mod luhn;
pub mod money;
mod order;

pub use balance::Balance;
pub use balance::WithdrawalEntry;
pub use error::AccountError;
pub use error::LedgerError;
pub use error::OrderError;
pub use order::AccrualResult;
pub use order::AccrualUpdate;
pub use order::Order;
pub use order::OrderStatus;
pub use order::PendingOrder;
pub use order::PollError;
