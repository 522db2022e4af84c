use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use gantry_core::Value;

use crate::{MemoryError, ScopedMemory};

#[derive(Debug, Default)]
struct TxnFrame {
    parent: Option<u64>,
    writes: HashMap<String, Value>,
}

#[derive(Debug, Default)]
struct MemoryState {
    committed: HashMap<String, Value>,
    /// Active transaction ids, outermost first.
    stack: Vec<u64>,
    staged: HashMap<u64, TxnFrame>,
}

/// Transactional key/value blackboard shared by every node of a run.
///
/// Cloning yields another handle over the same store, transaction
/// stack, and id counter. Reads are transaction-aware: the innermost
/// active overlay containing a key wins, falling back to the committed
/// store. The interior mutex is only held to mutate the store or the
/// stack, never across an await; the separate async lock serializes a
/// whole begin..commit sequence across tasks.
#[derive(Clone, Debug, Default)]
pub struct SharedMemory {
    state: Arc<Mutex<MemoryState>>,
    next_txn: Arc<AtomicU64>,
    txn_lock: Arc<tokio::sync::Mutex<()>>,
}

impl SharedMemory {
    pub fn new() -> Self {
        Self::default()
    }

    fn locked(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        // A poisoned lock means a panic mid-mutation; propagating the
        // poison here would turn every later read into a panic too.
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn read(&self, key: &str) -> Option<Value> {
        let state = self.locked();
        for txn in state.stack.iter().rev() {
            if let Some(frame) = state.staged.get(txn) {
                if let Some(value) = frame.writes.get(key) {
                    return Some(value.clone());
                }
            }
        }
        state.committed.get(key).cloned()
    }

    /// Stages into the current transaction if one is active, otherwise
    /// writes the committed store directly.
    pub fn write(&self, key: impl Into<String>, value: Value) {
        let mut state = self.locked();
        match state.stack.last().copied() {
            Some(txn) => {
                state
                    .staged
                    .entry(txn)
                    .or_default()
                    .writes
                    .insert(key.into(), value);
            }
            None => {
                state.committed.insert(key.into(), value);
            }
        }
    }

    /// Committed store overlaid, outermost to innermost, by every
    /// active transaction.
    pub fn read_all(&self) -> HashMap<String, Value> {
        let state = self.locked();
        let mut merged = state.committed.clone();
        for txn in &state.stack {
            if let Some(frame) = state.staged.get(txn) {
                for (key, value) in &frame.writes {
                    merged.insert(key.clone(), value.clone());
                }
            }
        }
        merged
    }

    pub fn begin_transaction(&self) -> u64 {
        let id = self.next_txn.fetch_add(1, Ordering::SeqCst) + 1;
        let mut state = self.locked();
        let parent = state.stack.last().copied();
        state.stack.push(id);
        state.staged.insert(
            id,
            TxnFrame {
                parent,
                writes: HashMap::new(),
            },
        );
        id
    }

    /// The transaction must be the current (top-of-stack) one. Nested
    /// commits merge into the parent overlay; a root commit merges
    /// into the committed store.
    pub fn commit_transaction(&self, txn: u64) -> Result<(), MemoryError> {
        let mut state = self.locked();
        if state.stack.last() != Some(&txn) {
            return Err(MemoryError::NotCurrentTransaction { txn });
        }
        state.stack.pop();
        let frame = state
            .staged
            .remove(&txn)
            .ok_or(MemoryError::NotCurrentTransaction { txn })?;
        match frame.parent {
            Some(parent) => {
                let target = state.staged.entry(parent).or_default();
                target.writes.extend(frame.writes);
            }
            None => {
                state.committed.extend(frame.writes);
            }
        }
        Ok(())
    }

    /// Discards only this transaction's staged overlay; enclosing
    /// transactions are untouched.
    pub fn rollback_transaction(&self, txn: u64) -> Result<(), MemoryError> {
        let mut state = self.locked();
        if state.stack.last() != Some(&txn) {
            return Err(MemoryError::NotCurrentTransaction { txn });
        }
        state.stack.pop();
        state.staged.remove(&txn);
        Ok(())
    }

    pub fn has_active_transaction(&self) -> bool {
        !self.locked().stack.is_empty()
    }

    pub fn current_transaction(&self) -> Option<u64> {
        self.locked().stack.last().copied()
    }

    /// Forcibly discards every active transaction and its staged data.
    /// Crash/abort recovery: a failed run must not leave the
    /// blackboard half-staged. Returns the number discarded.
    pub fn cleanup_orphaned_transactions(&self) -> usize {
        let mut state = self.locked();
        let count = state.stack.len();
        state.stack.clear();
        state.staged.clear();
        count
    }

    /// Capability-restricted alias over the same store, transaction
    /// stack, and id counter. Reads are limited to the input and
    /// output keys, writes to the output keys.
    pub fn with_permissions<I, O, S, T>(&self, input_keys: I, output_keys: O) -> ScopedMemory
    where
        I: IntoIterator<Item = S>,
        O: IntoIterator<Item = T>,
        S: Into<String>,
        T: Into<String>,
    {
        let writable: HashSet<String> = output_keys.into_iter().map(Into::into).collect();
        let mut readable: HashSet<String> = input_keys.into_iter().map(Into::into).collect();
        readable.extend(writable.iter().cloned());
        ScopedMemory::new(self.clone(), readable, writable)
    }

    pub async fn begin_transaction_async(&self) -> u64 {
        let _guard = self.txn_lock.lock().await;
        self.begin_transaction()
    }

    pub async fn commit_transaction_async(&self, txn: u64) -> Result<(), MemoryError> {
        let _guard = self.txn_lock.lock().await;
        self.commit_transaction(txn)
    }

    pub async fn rollback_transaction_async(&self, txn: u64) -> Result<(), MemoryError> {
        let _guard = self.txn_lock.lock().await;
        self.rollback_transaction(txn)
    }

    pub(crate) async fn lock_transactions(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.txn_lock.lock().await
    }
}
