//! The transaction seam between services and storage.

use std::any::Any;

use async_trait::async_trait;

/// Produces storage transactions. The ledger threads the returned handle
/// through every store call that must be atomic with the others.
#[async_trait]
pub trait TxProvider: Send + Sync {
    async fn begin(&self) -> anyhow::Result<Box<dyn StoreTx>>;
}

/// An open storage transaction. `commit` and `rollback` are idempotent once
/// the transaction has been resolved either way.
#[async_trait]
pub trait StoreTx: Send {
    async fn commit(&mut self) -> anyhow::Result<()>;
    async fn rollback(&mut self) -> anyhow::Result<()>;
    /// Store implementations downcast the handle to their concrete type.
    fn as_any(&mut self) -> &mut dyn Any;
}
