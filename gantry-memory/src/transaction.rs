use gantry_core::Value;

use crate::{MemoryError, SharedMemory};

/// Handle passed to [`SharedMemory::transaction`] closures. Reads and
/// writes go through the enclosing transaction; `set_rollback_only`
/// forces a rollback even when the closure returns `Ok`.
pub struct TxnScope<'a> {
    memory: &'a SharedMemory,
    id: u64,
    rollback_only: bool,
}

impl<'a> TxnScope<'a> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The underlying memory, e.g. for opening a nested transaction.
    pub fn memory(&self) -> &SharedMemory {
        self.memory
    }

    pub fn read(&self, key: &str) -> Option<Value> {
        self.memory.read(key)
    }

    pub fn write(&mut self, key: impl Into<String>, value: Value) {
        self.memory.write(key, value);
    }

    pub fn set_rollback_only(&mut self) {
        self.rollback_only = true;
    }

    pub fn is_rollback_only(&self) -> bool {
        self.rollback_only
    }
}

impl SharedMemory {
    /// Scoped transaction: commits when the closure returns `Ok`,
    /// rolls back on `Err` or when marked rollback-only.
    pub fn transaction<T, F>(&self, f: F) -> Result<T, MemoryError>
    where
        F: FnOnce(&mut TxnScope<'_>) -> Result<T, MemoryError>,
    {
        let id = self.begin_transaction();
        let mut scope = TxnScope {
            memory: self,
            id,
            rollback_only: false,
        };
        match f(&mut scope) {
            Ok(value) => {
                if scope.rollback_only {
                    self.rollback_transaction(id)?;
                } else {
                    self.commit_transaction(id)?;
                }
                Ok(value)
            }
            Err(err) => {
                self.rollback_transaction(id)?;
                Err(err)
            }
        }
    }

    /// [`transaction`](Self::transaction) holding the cross-task
    /// transaction lock for the whole begin..commit sequence. The
    /// closure must not perform I/O.
    pub async fn transaction_async<T, F>(&self, f: F) -> Result<T, MemoryError>
    where
        F: FnOnce(&mut TxnScope<'_>) -> Result<T, MemoryError>,
    {
        let _guard = self.lock_transactions().await;
        self.transaction(f)
    }
}
