mod scoped;
mod shared;
mod transaction;

pub use scoped::{ScopedMemory, ScopedTxn};
pub use shared::SharedMemory;
pub use transaction::TxnScope;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MemoryError {
    /// Commit or rollback of an id that is not top-of-stack, including
    /// one already finalized. Programmer error, never ignored.
    #[error("transaction {txn} is not the current active transaction")]
    NotCurrentTransaction { txn: u64 },
    #[error("no active transaction")]
    NoActiveTransaction,
    #[error("read denied for key '{0}'")]
    ReadDenied(String),
    #[error("write denied for key '{0}'")]
    WriteDenied(String),
}
