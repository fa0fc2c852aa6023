use std::collections::HashSet;

use parking_lot::Mutex;
use thiserror::Error;

use crate::common::types::{Rid, TxnId};

/// Transaction isolation levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
}

/// Two-phase locking states. A transaction only acquires locks while
/// Growing; the first unlock under repeatable read moves it to
/// Shrinking, after which no lock may be acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Growing,
    Shrinking,
    Committed,
    Aborted,
}

/// Why a transaction was aborted by the lock manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    LockOnShrinking,
    SharedOnReadUncommitted,
    UpgradeConflict,
    Deadlock,
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            AbortReason::LockOnShrinking => "lock requested in shrinking phase",
            AbortReason::SharedOnReadUncommitted => "shared lock under read uncommitted",
            AbortReason::UpgradeConflict => "another upgrade is already in progress",
            AbortReason::Deadlock => "chosen as deadlock victim",
        };
        f.write_str(text)
    }
}

/// Errors that can occur during transaction processing
#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("Transaction {txn_id} aborted: {reason}")]
    Abort { txn_id: TxnId, reason: AbortReason },

    #[error("Transaction {0} not found")]
    NotFound(TxnId),

    #[error("Transaction {0} is not in a usable state")]
    InvalidState(TxnId),
}

/// An active transaction: identity, 2PL state, isolation level, and the
/// row locks it currently holds. Shared across the requesting thread
/// and the deadlock detector, so state and lock sets sit behind
/// mutexes.
pub struct Transaction {
    id: TxnId,
    isolation_level: IsolationLevel,
    state: Mutex<TransactionState>,
    shared_lock_set: Mutex<HashSet<Rid>>,
    exclusive_lock_set: Mutex<HashSet<Rid>>,
}

impl Transaction {
    pub fn new(id: TxnId, isolation_level: IsolationLevel) -> Self {
        Self {
            id,
            isolation_level,
            state: Mutex::new(TransactionState::Growing),
            shared_lock_set: Mutex::new(HashSet::new()),
            exclusive_lock_set: Mutex::new(HashSet::new()),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    pub fn state(&self) -> TransactionState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: TransactionState) {
        *self.state.lock() = state;
    }

    pub fn is_shared_locked(&self, rid: &Rid) -> bool {
        self.shared_lock_set.lock().contains(rid)
    }

    pub fn is_exclusive_locked(&self, rid: &Rid) -> bool {
        self.exclusive_lock_set.lock().contains(rid)
    }

    /// Snapshot of the shared-locked RIDs.
    pub fn shared_lock_set(&self) -> Vec<Rid> {
        self.shared_lock_set.lock().iter().copied().collect()
    }

    /// Snapshot of the exclusive-locked RIDs.
    pub fn exclusive_lock_set(&self) -> Vec<Rid> {
        self.exclusive_lock_set.lock().iter().copied().collect()
    }

    /// Every RID this transaction holds a lock on, in either mode.
    pub fn locked_rids(&self) -> Vec<Rid> {
        let mut rids: HashSet<Rid> = self.shared_lock_set.lock().iter().copied().collect();
        rids.extend(self.exclusive_lock_set.lock().iter().copied());
        rids.into_iter().collect()
    }

    pub(crate) fn add_shared_lock(&self, rid: Rid) {
        self.shared_lock_set.lock().insert(rid);
    }

    pub(crate) fn remove_shared_lock(&self, rid: &Rid) {
        self.shared_lock_set.lock().remove(rid);
    }

    pub(crate) fn add_exclusive_lock(&self, rid: Rid) {
        self.exclusive_lock_set.lock().insert(rid);
    }

    pub(crate) fn remove_exclusive_lock(&self, rid: &Rid) {
        self.exclusive_lock_set.lock().remove(rid);
    }
}
