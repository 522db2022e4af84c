use std::collections::{HashMap, HashSet};

use gantry_core::Value;

use crate::{MemoryError, SharedMemory, TxnScope};

/// Capability-restricted alias over a [`SharedMemory`].
///
/// A view shares the identical store, transaction stack, and id
/// counter with its parent: a transaction begun through the view is
/// visible to the parent and continues the same id sequence. Only the
/// key surface is narrowed — reads to input and output keys, writes to
/// output keys.
#[derive(Clone, Debug)]
pub struct ScopedMemory {
    inner: SharedMemory,
    readable: HashSet<String>,
    writable: HashSet<String>,
}

impl ScopedMemory {
    pub(crate) fn new(
        inner: SharedMemory,
        readable: HashSet<String>,
        writable: HashSet<String>,
    ) -> Self {
        Self {
            inner,
            readable,
            writable,
        }
    }

    pub fn can_read(&self, key: &str) -> bool {
        self.readable.contains(key)
    }

    pub fn can_write(&self, key: &str) -> bool {
        self.writable.contains(key)
    }

    pub fn read(&self, key: &str) -> Result<Option<Value>, MemoryError> {
        if !self.can_read(key) {
            return Err(MemoryError::ReadDenied(key.to_string()));
        }
        Ok(self.inner.read(key))
    }

    pub fn write(&self, key: &str, value: Value) -> Result<(), MemoryError> {
        if !self.can_write(key) {
            return Err(MemoryError::WriteDenied(key.to_string()));
        }
        self.inner.write(key, value);
        Ok(())
    }

    /// The transaction-aware merge, filtered to readable keys.
    pub fn read_all(&self) -> HashMap<String, Value> {
        self.inner
            .read_all()
            .into_iter()
            .filter(|(key, _)| self.readable.contains(key))
            .collect()
    }

    pub fn begin_transaction(&self) -> u64 {
        self.inner.begin_transaction()
    }

    pub fn commit_transaction(&self, txn: u64) -> Result<(), MemoryError> {
        self.inner.commit_transaction(txn)
    }

    pub fn rollback_transaction(&self, txn: u64) -> Result<(), MemoryError> {
        self.inner.rollback_transaction(txn)
    }

    pub fn has_active_transaction(&self) -> bool {
        self.inner.has_active_transaction()
    }

    pub fn current_transaction(&self) -> Option<u64> {
        self.inner.current_transaction()
    }

    pub async fn begin_transaction_async(&self) -> u64 {
        self.inner.begin_transaction_async().await
    }

    pub async fn commit_transaction_async(&self, txn: u64) -> Result<(), MemoryError> {
        self.inner.commit_transaction_async(txn).await
    }

    pub async fn rollback_transaction_async(&self, txn: u64) -> Result<(), MemoryError> {
        self.inner.rollback_transaction_async(txn).await
    }

    /// Scoped transaction honoring this view's key permissions.
    pub fn transaction<T, F>(&self, f: F) -> Result<T, MemoryError>
    where
        F: FnOnce(&mut ScopedTxn<'_, '_>) -> Result<T, MemoryError>,
    {
        self.inner.transaction(|txn| {
            let mut scoped = ScopedTxn { txn, view: self };
            f(&mut scoped)
        })
    }

    /// [`transaction`](Self::transaction) under the cross-task
    /// transaction lock; the closure must not perform I/O.
    pub async fn transaction_async<T, F>(&self, f: F) -> Result<T, MemoryError>
    where
        F: FnOnce(&mut ScopedTxn<'_, '_>) -> Result<T, MemoryError>,
    {
        self.inner
            .transaction_async(|txn| {
                let mut scoped = ScopedTxn { txn, view: self };
                f(&mut scoped)
            })
            .await
    }
}

/// Permission-checked counterpart of [`TxnScope`] for scoped views.
pub struct ScopedTxn<'a, 'b> {
    txn: &'a mut TxnScope<'b>,
    view: &'a ScopedMemory,
}

impl<'a, 'b> ScopedTxn<'a, 'b> {
    pub fn id(&self) -> u64 {
        self.txn.id()
    }

    pub fn read(&self, key: &str) -> Result<Option<Value>, MemoryError> {
        if !self.view.can_read(key) {
            return Err(MemoryError::ReadDenied(key.to_string()));
        }
        Ok(self.txn.read(key))
    }

    pub fn write(&mut self, key: &str, value: Value) -> Result<(), MemoryError> {
        if !self.view.can_write(key) {
            return Err(MemoryError::WriteDenied(key.to_string()));
        }
        self.txn.write(key, value);
        Ok(())
    }

    pub fn set_rollback_only(&mut self) {
        self.txn.set_rollback_only();
    }
}
