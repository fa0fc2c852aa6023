use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::common::types::{Rid, TxnId};
use crate::transaction::transaction::{
    AbortReason, IsolationLevel, Transaction, TransactionError, TransactionState,
};
use crate::transaction::transaction_manager::TransactionManager;

/// Row lock modes. Shared is compatible with shared only; exclusive is
/// compatible with nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl LockMode {
    fn compatible(self, other: LockMode) -> bool {
        self == LockMode::Shared && other == LockMode::Shared
    }
}

#[derive(Debug, Clone, Copy)]
struct LockRequest {
    txn_id: TxnId,
    mode: LockMode,
    granted: bool,
}

struct RequestQueue {
    requests: VecDeque<LockRequest>,
    // at most one in-flight upgrade per queue
    upgrading: bool,
}

struct LockRequestQueue {
    inner: Mutex<RequestQueue>,
    cv: Condvar,
}

impl LockRequestQueue {
    fn new() -> Self {
        Self {
            inner: Mutex::new(RequestQueue {
                requests: VecDeque::new(),
                upgrading: false,
            }),
            cv: Condvar::new(),
        }
    }
}

struct LockTable {
    lock_table: HashMap<Rid, Arc<LockRequestQueue>>,
    // txn -> sorted list of txns it waits on; rebuilt every detection pass
    waits_for: BTreeMap<TxnId, Vec<TxnId>>,
}

struct LockManagerInner {
    latch: Mutex<LockTable>,
    txns: Arc<TransactionManager>,
    running: AtomicBool,
    interval: Duration,
}

pub struct LockManagerOptions {
    pub cycle_detection_interval: Duration,
    pub enable_cycle_detection: bool,
}

impl Default for LockManagerOptions {
    fn default() -> Self {
        Self {
            cycle_detection_interval: Duration::from_millis(50),
            enable_cycle_detection: true,
        }
    }
}

/// Row-level two-phase-locking lock manager.
///
/// Each RID has a FIFO request queue; a request is granted once every
/// earlier granted request is compatible with it. Blocked requests wait
/// on the queue's condition variable and observe their transaction
/// state on wakeup, so marking a transaction Aborted and broadcasting
/// cancels its waits. A background task rebuilds the wait-for graph on
/// an interval and aborts the youngest transaction of any cycle.
pub struct LockManager {
    inner: Arc<LockManagerInner>,
    detector: Mutex<Option<JoinHandle<()>>>,
}

impl LockManager {
    pub fn new(txns: Arc<TransactionManager>) -> Self {
        Self::with_options(txns, LockManagerOptions::default())
    }

    pub fn with_options(txns: Arc<TransactionManager>, options: LockManagerOptions) -> Self {
        let inner = Arc::new(LockManagerInner {
            latch: Mutex::new(LockTable {
                lock_table: HashMap::new(),
                waits_for: BTreeMap::new(),
            }),
            txns,
            running: AtomicBool::new(options.enable_cycle_detection),
            interval: options.cycle_detection_interval,
        });
        let detector = if options.enable_cycle_detection {
            let inner = inner.clone();
            Some(thread::spawn(move || Self::run_cycle_detection(inner)))
        } else {
            None
        };
        Self {
            inner,
            detector: Mutex::new(detector),
        }
    }

    /// Take a shared lock on `rid`, blocking until compatible. Fails
    /// immediately under read uncommitted, or in the shrinking phase of
    /// a repeatable-read transaction.
    pub fn lock_shared(&self, txn: &Transaction, rid: &Rid) -> Result<(), TransactionError> {
        if txn.isolation_level() == IsolationLevel::ReadUncommitted {
            return Err(Self::abort_txn(txn, AbortReason::SharedOnReadUncommitted));
        }
        if txn.isolation_level() == IsolationLevel::RepeatableRead
            && txn.state() == TransactionState::Shrinking
        {
            return Err(Self::abort_txn(txn, AbortReason::LockOnShrinking));
        }
        if txn.is_shared_locked(rid) || txn.is_exclusive_locked(rid) {
            return Ok(());
        }

        let queue = self.queue_for(*rid);
        let mut q = queue.inner.lock();
        q.requests.push_back(LockRequest {
            txn_id: txn.id(),
            mode: LockMode::Shared,
            granted: false,
        });
        loop {
            if txn.state() == TransactionState::Aborted {
                Self::cancel_request(&queue, &mut q, txn.id());
                return Err(TransactionError::Abort {
                    txn_id: txn.id(),
                    reason: AbortReason::Deadlock,
                });
            }
            if Self::is_compatible(&q.requests, txn.id(), false) {
                break;
            }
            queue.cv.wait(&mut q);
        }
        Self::grant(&mut q, txn.id());
        drop(q);

        txn.add_shared_lock(*rid);
        Ok(())
    }

    /// Take an exclusive lock on `rid`, blocking until every earlier
    /// grant has been released.
    pub fn lock_exclusive(&self, txn: &Transaction, rid: &Rid) -> Result<(), TransactionError> {
        if txn.state() == TransactionState::Shrinking {
            return Err(Self::abort_txn(txn, AbortReason::LockOnShrinking));
        }
        if txn.is_exclusive_locked(rid) {
            return Ok(());
        }

        let queue = self.queue_for(*rid);
        let mut q = queue.inner.lock();
        q.requests.push_back(LockRequest {
            txn_id: txn.id(),
            mode: LockMode::Exclusive,
            granted: false,
        });
        loop {
            if txn.state() == TransactionState::Aborted {
                Self::cancel_request(&queue, &mut q, txn.id());
                return Err(TransactionError::Abort {
                    txn_id: txn.id(),
                    reason: AbortReason::Deadlock,
                });
            }
            if Self::is_compatible(&q.requests, txn.id(), false) {
                break;
            }
            queue.cv.wait(&mut q);
        }
        Self::grant(&mut q, txn.id());
        drop(q);

        txn.add_exclusive_lock(*rid);
        Ok(())
    }

    /// Upgrade a held shared lock to exclusive. Only one upgrade may be
    /// pending per queue; a second one aborts with UpgradeConflict.
    pub fn lock_upgrade(&self, txn: &Transaction, rid: &Rid) -> Result<(), TransactionError> {
        if txn.state() == TransactionState::Shrinking {
            return Err(Self::abort_txn(txn, AbortReason::LockOnShrinking));
        }
        if txn.is_exclusive_locked(rid) {
            return Ok(());
        }

        let queue = self.queue_for(*rid);
        let mut q = queue.inner.lock();
        if q.upgrading {
            drop(q);
            return Err(Self::abort_txn(txn, AbortReason::UpgradeConflict));
        }
        q.upgrading = true;

        {
            let Some(request) = q.requests.iter_mut().find(|r| r.txn_id == txn.id()) else {
                q.upgrading = false;
                return Err(TransactionError::InvalidState(txn.id()));
            };
            debug_assert!(request.granted && request.mode == LockMode::Shared);
            request.mode = LockMode::Exclusive;
            request.granted = false;
        }

        loop {
            if txn.state() == TransactionState::Aborted {
                q.upgrading = false;
                Self::cancel_request(&queue, &mut q, txn.id());
                drop(q);
                txn.remove_shared_lock(rid);
                return Err(TransactionError::Abort {
                    txn_id: txn.id(),
                    reason: AbortReason::Deadlock,
                });
            }
            if Self::is_compatible(&q.requests, txn.id(), true) {
                break;
            }
            queue.cv.wait(&mut q);
        }
        Self::grant(&mut q, txn.id());
        q.upgrading = false;
        drop(q);

        txn.remove_shared_lock(rid);
        txn.add_exclusive_lock(*rid);
        Ok(())
    }

    /// Release the transaction's lock on `rid`. The first unlock of a
    /// growing repeatable-read transaction starts its shrinking phase.
    /// Wakes the queue when the frontmost waiter became compatible (an
    /// upgrader's flipped request can sit before the released one, so
    /// the check is not limited to the successor position). Returns
    /// whether a request was actually removed.
    pub fn unlock(&self, txn: &Transaction, rid: &Rid) -> bool {
        let queue = self.queue_for(*rid);
        let mut q = queue.inner.lock();

        if txn.isolation_level() == IsolationLevel::RepeatableRead
            && txn.state() == TransactionState::Growing
        {
            txn.set_state(TransactionState::Shrinking);
        }

        let removed = match q.requests.iter().position(|r| r.txn_id == txn.id()) {
            Some(index) => {
                let _ = q.requests.remove(index);
                if let Some(waiter) = q.requests.iter().find(|r| !r.granted) {
                    if Self::is_compatible(&q.requests, waiter.txn_id, false) {
                        queue.cv.notify_all();
                    }
                }
                true
            }
            None => false,
        };
        drop(q);

        txn.remove_shared_lock(rid);
        txn.remove_exclusive_lock(rid);
        removed
    }

    /// Add `t1 -> t2` (t1 waits on t2) to the wait-for graph. Duplicate
    /// edges are no-ops; adjacency lists stay sorted.
    pub fn add_edge(&self, t1: TxnId, t2: TxnId) {
        let mut table = self.inner.latch.lock();
        Self::insert_edge(&mut table.waits_for, t1, t2);
    }

    /// Remove `t1 -> t2` if present.
    pub fn remove_edge(&self, t1: TxnId, t2: TxnId) {
        let mut table = self.inner.latch.lock();
        if let Some(targets) = table.waits_for.get_mut(&t1) {
            if let Ok(index) = targets.binary_search(&t2) {
                targets.remove(index);
            }
        }
    }

    /// Every edge in the wait-for graph, source-major order.
    pub fn edge_list(&self) -> Vec<(TxnId, TxnId)> {
        let table = self.inner.latch.lock();
        table
            .waits_for
            .iter()
            .flat_map(|(&t1, targets)| targets.iter().map(move |&t2| (t1, t2)))
            .collect()
    }

    /// Search the current graph for a cycle; returns the youngest
    /// (highest-id) transaction on the first cycle found.
    pub fn has_cycle(&self) -> Option<TxnId> {
        let table = self.inner.latch.lock();
        Self::find_cycle(&table.waits_for)
    }

    fn abort_txn(txn: &Transaction, reason: AbortReason) -> TransactionError {
        txn.set_state(TransactionState::Aborted);
        TransactionError::Abort {
            txn_id: txn.id(),
            reason,
        }
    }

    /// Look up (or create) the request queue for a RID. The global
    /// latch is released before any queue latch is taken.
    fn queue_for(&self, rid: Rid) -> Arc<LockRequestQueue> {
        let mut table = self.inner.latch.lock();
        table
            .lock_table
            .entry(rid)
            .or_insert_with(|| Arc::new(LockRequestQueue::new()))
            .clone()
    }

    /// A plain request is compatible when every earlier granted request
    /// agrees with its mode; grants can only sit ahead of it in FIFO
    /// order. An upgrade is different: its request was flipped in place,
    /// so shared locks granted to later arrivals sit behind it — it must
    /// conflict with any other transaction's grant anywhere in the
    /// queue, and additionally requires no waiter ahead of it.
    fn is_compatible(requests: &VecDeque<LockRequest>, txn_id: TxnId, is_upgrade: bool) -> bool {
        let Some(mode) = requests.iter().find(|r| r.txn_id == txn_id).map(|r| r.mode) else {
            return false;
        };
        let mut reached_own = false;
        for request in requests {
            if request.txn_id == txn_id {
                if !is_upgrade {
                    return true;
                }
                reached_own = true;
                continue;
            }
            if is_upgrade && !reached_own && !request.granted {
                return false;
            }
            if request.granted && !request.mode.compatible(mode) {
                return false;
            }
        }
        reached_own
    }

    fn grant(q: &mut RequestQueue, txn_id: TxnId) {
        if let Some(request) = q.requests.iter_mut().find(|r| r.txn_id == txn_id) {
            request.granted = true;
        }
    }

    /// Drop an aborted waiter's queue entry and wake the queue, since
    /// removing it may unblock a follower.
    fn cancel_request(queue: &LockRequestQueue, q: &mut RequestQueue, txn_id: TxnId) {
        if let Some(index) = q.requests.iter().position(|r| r.txn_id == txn_id) {
            let _ = q.requests.remove(index);
            queue.cv.notify_all();
        }
    }

    fn insert_edge(waits_for: &mut BTreeMap<TxnId, Vec<TxnId>>, t1: TxnId, t2: TxnId) {
        let targets = waits_for.entry(t1).or_default();
        if let Err(index) = targets.binary_search(&t2) {
            targets.insert(index, t2);
        }
    }

    fn run_cycle_detection(inner: Arc<LockManagerInner>) {
        while inner.running.load(Ordering::SeqCst) {
            thread::sleep(inner.interval);
            let mut table = inner.latch.lock();
            if !inner.running.load(Ordering::SeqCst) {
                break;
            }

            table.waits_for.clear();
            Self::build_waits_for(&mut table, &inner.txns);

            while let Some(victim_id) = Self::find_cycle(&table.waits_for) {
                log::debug!("deadlock detected, aborting youngest txn {}", victim_id);
                if let Some(victim) = inner.txns.get(victim_id) {
                    victim.set_state(TransactionState::Aborted);
                }

                // wake every queue the victim could be blocked in: the
                // queues of rids locked by the transactions it waits on
                let waits_on = table.waits_for.get(&victim_id).cloned().unwrap_or_default();
                for holder_id in waits_on {
                    if let Some(holder) = inner.txns.get(holder_id) {
                        for rid in holder.locked_rids() {
                            if let Some(queue) = table.lock_table.get(&rid) {
                                // hold the queue latch across the wakeup
                                // so a waiter cannot slip between its
                                // abort check and its wait
                                let _q = queue.inner.lock();
                                queue.cv.notify_all();
                            }
                        }
                    }
                }

                table.waits_for.clear();
                Self::build_waits_for(&mut table, &inner.txns);
            }
        }
    }

    /// Rebuild the graph from the queues: every waiter gets an edge to
    /// every granted holder in its queue, skipping aborted transactions.
    fn build_waits_for(table: &mut LockTable, txns: &TransactionManager) {
        let mut edges = Vec::new();
        for queue in table.lock_table.values() {
            let q = queue.inner.lock();
            let mut holders = Vec::new();
            let mut waiters = Vec::new();
            for request in &q.requests {
                match txns.get(request.txn_id) {
                    Some(txn) if txn.state() != TransactionState::Aborted => {
                        if request.granted {
                            holders.push(request.txn_id);
                        } else {
                            waiters.push(request.txn_id);
                        }
                    }
                    _ => {}
                }
            }
            for &waiter in &waiters {
                for &holder in &holders {
                    edges.push((waiter, holder));
                }
            }
        }
        for (t1, t2) in edges {
            Self::insert_edge(&mut table.waits_for, t1, t2);
        }
    }

    /// Depth-first cycle search with an explicit stack and three-color
    /// marking, visiting vertices in ascending id order so victim
    /// selection is deterministic.
    fn find_cycle(waits_for: &BTreeMap<TxnId, Vec<TxnId>>) -> Option<TxnId> {
        #[derive(Clone, Copy, PartialEq)]
        enum Visit {
            InStack,
            Done,
        }
        let mut colors: HashMap<TxnId, Visit> = HashMap::new();

        for &start in waits_for.keys() {
            if colors.contains_key(&start) {
                continue;
            }
            let mut stack = vec![start];
            colors.insert(start, Visit::InStack);

            while let Some(&top) = stack.last() {
                let mut pushed = false;
                if let Some(targets) = waits_for.get(&top) {
                    for &next in targets {
                        match colors.get(&next) {
                            Some(Visit::InStack) => {
                                // cycle runs from `next` to the stack top;
                                // the victim is its youngest member
                                let from = stack.iter().position(|&v| v == next)?;
                                return stack[from..].iter().copied().max();
                            }
                            Some(Visit::Done) => {}
                            None => {
                                colors.insert(next, Visit::InStack);
                                stack.push(next);
                                pushed = true;
                                break;
                            }
                        }
                    }
                }
                if !pushed {
                    colors.insert(top, Visit::Done);
                    stack.pop();
                }
            }
        }
        None
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        self.inner.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.detector.lock().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph_only_manager() -> LockManager {
        LockManager::with_options(
            Arc::new(TransactionManager::new()),
            LockManagerOptions {
                cycle_detection_interval: Duration::from_millis(50),
                enable_cycle_detection: false,
            },
        )
    }

    #[test]
    fn test_edge_list_sorted_and_deduplicated() {
        let lm = graph_only_manager();
        lm.add_edge(1, 3);
        lm.add_edge(1, 2);
        lm.add_edge(1, 2);
        lm.add_edge(0, 1);

        assert_eq!(lm.edge_list(), vec![(0, 1), (1, 2), (1, 3)]);

        lm.remove_edge(1, 3);
        lm.remove_edge(1, 99);
        assert_eq!(lm.edge_list(), vec![(0, 1), (1, 2)]);
    }

    #[test]
    fn test_no_cycle_in_dag() {
        let lm = graph_only_manager();
        lm.add_edge(0, 1);
        lm.add_edge(1, 2);
        lm.add_edge(0, 2);
        assert_eq!(lm.has_cycle(), None);
    }

    #[test]
    fn test_simple_cycle_picks_youngest() {
        let lm = graph_only_manager();
        lm.add_edge(0, 1);
        lm.add_edge(1, 0);
        assert_eq!(lm.has_cycle(), Some(1));
    }

    #[test]
    fn test_cycle_among_larger_graph() {
        let lm = graph_only_manager();
        // tail into a 3-cycle: 0 -> 1 -> 2 -> 3 -> 1
        lm.add_edge(0, 1);
        lm.add_edge(1, 2);
        lm.add_edge(2, 3);
        lm.add_edge(3, 1);
        assert_eq!(lm.has_cycle(), Some(3));

        lm.remove_edge(3, 1);
        assert_eq!(lm.has_cycle(), None);
    }

    #[test]
    fn test_self_edge_is_a_cycle() {
        let lm = graph_only_manager();
        lm.add_edge(5, 5);
        assert_eq!(lm.has_cycle(), Some(5));
    }
}
