//! Business services: the order lifecycle coordinator, the transactional
//! balance ledger, and account management. Storage is reached exclusively
//! through the port traits defined here; `tally-state` provides the
//! implementations.

pub mod account;
pub mod auth;
pub mod events;
pub mod ledger;
pub mod orders;
pub mod secrets;
pub mod txn;

pub use account::AccountService;
pub use account::UserStore;
pub use auth::TokenSigner;
pub use events::ORDER_PROCESSED;
pub use events::OrderProcessed;
pub use ledger::BalanceStore;
pub use ledger::LedgerService;
pub use ledger::WithdrawalStore;
pub use orders::AccrualSource;
pub use orders::OrderService;
pub use orders::OrderStore;
pub use secrets::SecretStore;
pub use txn::StoreTx;
pub use txn::TxProvider;
