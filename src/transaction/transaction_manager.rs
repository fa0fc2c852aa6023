use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::common::types::TxnId;
use crate::transaction::lock_manager::LockManager;
use crate::transaction::transaction::{IsolationLevel, Transaction, TransactionError, TransactionState};

/// Creates transactions from a monotonic id counter and resolves ids
/// back to live transactions (the deadlock detector depends on that).
pub struct TransactionManager {
    next_txn_id: AtomicU32,
    active: Mutex<HashMap<TxnId, Arc<Transaction>>>,
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionManager {
    pub fn new() -> Self {
        Self {
            next_txn_id: AtomicU32::new(0),
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Start a transaction at the given isolation level.
    pub fn begin(&self, isolation_level: IsolationLevel) -> Arc<Transaction> {
        let txn_id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let txn = Arc::new(Transaction::new(txn_id, isolation_level));
        self.active.lock().insert(txn_id, txn.clone());
        txn
    }

    pub fn get(&self, txn_id: TxnId) -> Option<Arc<Transaction>> {
        self.active.lock().get(&txn_id).cloned()
    }

    pub fn active_txn_ids(&self) -> Vec<TxnId> {
        self.active.lock().keys().copied().collect()
    }

    /// Commit: final state, then release every row lock so waiters make
    /// progress.
    pub fn commit(&self, txn: &Arc<Transaction>, lock_manager: &LockManager) -> Result<(), TransactionError> {
        if txn.state() == TransactionState::Aborted {
            return Err(TransactionError::InvalidState(txn.id()));
        }
        txn.set_state(TransactionState::Committed);
        Self::release_all_locks(txn, lock_manager);
        self.active.lock().remove(&txn.id());
        Ok(())
    }

    /// Abort: mark the transaction dead and release its locks. Safe to
    /// call on a deadlock victim that is already marked Aborted.
    pub fn abort(&self, txn: &Arc<Transaction>, lock_manager: &LockManager) {
        txn.set_state(TransactionState::Aborted);
        Self::release_all_locks(txn, lock_manager);
        self.active.lock().remove(&txn.id());
    }

    fn release_all_locks(txn: &Transaction, lock_manager: &LockManager) {
        for rid in txn.locked_rids() {
            lock_manager.unlock(txn, &rid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_assigns_increasing_ids() {
        let manager = TransactionManager::new();
        let t0 = manager.begin(IsolationLevel::ReadCommitted);
        let t1 = manager.begin(IsolationLevel::RepeatableRead);
        assert_eq!(t0.id(), 0);
        assert_eq!(t1.id(), 1);
        assert_eq!(manager.active_txn_ids().len(), 2);
    }

    #[test]
    fn test_get_resolves_active_transactions() {
        let manager = TransactionManager::new();
        let txn = manager.begin(IsolationLevel::ReadCommitted);
        assert!(manager.get(txn.id()).is_some());
        assert!(manager.get(999).is_none());
    }
}
