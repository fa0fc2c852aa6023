use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use alderdb::common::types::Rid;
use alderdb::transaction::{
    AbortReason, IsolationLevel, LockManager, LockManagerOptions, TransactionError,
    TransactionManager, TransactionState,
};

fn setup() -> (Arc<TransactionManager>, Arc<LockManager>) {
    let txns = Arc::new(TransactionManager::new());
    let lock_manager = Arc::new(LockManager::with_options(
        txns.clone(),
        LockManagerOptions {
            cycle_detection_interval: Duration::from_millis(10),
            enable_cycle_detection: true,
        },
    ));
    (txns, lock_manager)
}

fn assert_abort(result: Result<(), TransactionError>, expected: AbortReason) {
    match result {
        Err(TransactionError::Abort { reason, .. }) => assert_eq!(reason, expected),
        other => panic!("expected abort with {:?}, got {:?}", expected, other),
    }
}

#[test]
fn test_shared_locks_coexist() {
    let (txns, lm) = setup();
    let t1 = txns.begin(IsolationLevel::RepeatableRead);
    let t2 = txns.begin(IsolationLevel::RepeatableRead);
    let rid = Rid::new(0, 0);

    lm.lock_shared(&t1, &rid).unwrap();
    lm.lock_shared(&t2, &rid).unwrap();
    assert!(t1.is_shared_locked(&rid));
    assert!(t2.is_shared_locked(&rid));

    // re-requesting a held lock succeeds without a second queue entry
    lm.lock_shared(&t1, &rid).unwrap();
}

#[test]
fn test_exclusive_waits_for_all_shared_holders() {
    let (txns, lm) = setup();
    let t1 = txns.begin(IsolationLevel::RepeatableRead);
    let t2 = txns.begin(IsolationLevel::RepeatableRead);
    let t3 = txns.begin(IsolationLevel::RepeatableRead);
    let rid = Rid::new(0, 0);

    lm.lock_shared(&t1, &rid).unwrap();
    lm.lock_shared(&t2, &rid).unwrap();

    let acquired = Arc::new(AtomicBool::new(false));
    let waiter = {
        let (lm, t3, acquired) = (lm.clone(), t3.clone(), acquired.clone());
        thread::spawn(move || {
            lm.lock_exclusive(&t3, &rid).unwrap();
            acquired.store(true, Ordering::SeqCst);
        })
    };

    thread::sleep(Duration::from_millis(100));
    assert!(!acquired.load(Ordering::SeqCst), "X granted alongside S locks");

    lm.unlock(&t1, &rid);
    thread::sleep(Duration::from_millis(100));
    assert!(!acquired.load(Ordering::SeqCst), "X granted while one S lock remains");

    lm.unlock(&t2, &rid);
    waiter.join().unwrap();
    assert!(acquired.load(Ordering::SeqCst));
    assert!(t3.is_exclusive_locked(&rid));
}

#[test]
fn test_deadlock_aborts_youngest_transaction() {
    let (txns, lm) = setup();
    let t1 = txns.begin(IsolationLevel::RepeatableRead);
    let t2 = txns.begin(IsolationLevel::RepeatableRead);
    let r1 = Rid::new(0, 0);
    let r2 = Rid::new(0, 1);

    lm.lock_exclusive(&t1, &r1).unwrap();
    lm.lock_exclusive(&t2, &r2).unwrap();

    let older = {
        let (lm, t1) = (lm.clone(), t1.clone());
        thread::spawn(move || lm.lock_exclusive(&t1, &r2))
    };
    thread::sleep(Duration::from_millis(50));

    // closing the cycle: the detector must pick t2, the younger side
    let result = lm.lock_exclusive(&t2, &r1);
    assert_abort(result, AbortReason::Deadlock);
    assert_eq!(t2.state(), TransactionState::Aborted);

    // once the victim's locks are gone, the survivor proceeds
    txns.abort(&t2, &lm);
    older.join().unwrap().unwrap();
    assert!(t1.is_exclusive_locked(&r2));
}

#[test]
fn test_second_upgrade_fails_immediately() {
    let (txns, lm) = setup();
    let t1 = txns.begin(IsolationLevel::RepeatableRead);
    let t2 = txns.begin(IsolationLevel::RepeatableRead);
    let rid = Rid::new(0, 0);

    lm.lock_shared(&t1, &rid).unwrap();
    lm.lock_shared(&t2, &rid).unwrap();

    // t1's upgrade blocks behind t2's granted shared lock
    let first_upgrade = {
        let (lm, t1) = (lm.clone(), t1.clone());
        thread::spawn(move || lm.lock_upgrade(&t1, &rid))
    };
    thread::sleep(Duration::from_millis(100));

    let result = lm.lock_upgrade(&t2, &rid);
    assert_abort(result, AbortReason::UpgradeConflict);

    txns.abort(&t2, &lm);
    first_upgrade.join().unwrap().unwrap();
    assert!(t1.is_exclusive_locked(&rid));
    assert!(!t1.is_shared_locked(&rid));
}

#[test]
fn test_uncontended_upgrade_succeeds() {
    let (txns, lm) = setup();
    let t1 = txns.begin(IsolationLevel::RepeatableRead);
    let rid = Rid::new(0, 0);

    lm.lock_shared(&t1, &rid).unwrap();
    lm.lock_upgrade(&t1, &rid).unwrap();
    assert!(t1.is_exclusive_locked(&rid));
    assert!(!t1.is_shared_locked(&rid));

    // upgrading an already-exclusive lock is a no-op
    lm.lock_upgrade(&t1, &rid).unwrap();
}

#[test]
fn test_repeatable_read_shrinks_after_first_unlock() {
    let (txns, lm) = setup();
    let txn = txns.begin(IsolationLevel::RepeatableRead);
    let r1 = Rid::new(0, 0);
    let r2 = Rid::new(0, 1);
    let r3 = Rid::new(0, 2);

    lm.lock_shared(&txn, &r1).unwrap();
    lm.lock_shared(&txn, &r2).unwrap();
    assert_eq!(txn.state(), TransactionState::Growing);

    lm.unlock(&txn, &r1);
    assert_eq!(txn.state(), TransactionState::Shrinking);

    // 2PL: no lock may follow the first release
    assert_abort(lm.lock_shared(&txn, &r3), AbortReason::LockOnShrinking);
    assert_eq!(txn.state(), TransactionState::Aborted);
}

#[test]
fn test_exclusive_lock_rejected_while_shrinking() {
    let (txns, lm) = setup();
    let txn = txns.begin(IsolationLevel::RepeatableRead);
    let r1 = Rid::new(0, 0);
    let r2 = Rid::new(0, 1);

    lm.lock_exclusive(&txn, &r1).unwrap();
    lm.unlock(&txn, &r1);
    assert_abort(lm.lock_exclusive(&txn, &r2), AbortReason::LockOnShrinking);
}

#[test]
fn test_shared_lock_rejected_under_read_uncommitted() {
    let (txns, lm) = setup();
    let txn = txns.begin(IsolationLevel::ReadUncommitted);
    let rid = Rid::new(0, 0);

    assert_abort(lm.lock_shared(&txn, &rid), AbortReason::SharedOnReadUncommitted);
    assert_eq!(txn.state(), TransactionState::Aborted);
}

#[test]
fn test_read_committed_keeps_growing_across_unlocks() {
    let (txns, lm) = setup();
    let txn = txns.begin(IsolationLevel::ReadCommitted);
    let r1 = Rid::new(0, 0);
    let r2 = Rid::new(0, 1);

    lm.lock_shared(&txn, &r1).unwrap();
    lm.unlock(&txn, &r1);
    assert_eq!(txn.state(), TransactionState::Growing);

    // read committed may keep locking after a release
    lm.lock_shared(&txn, &r2).unwrap();
    assert!(txn.is_shared_locked(&r2));
}

#[test]
fn test_commit_releases_locks_and_wakes_waiters() {
    let (txns, lm) = setup();
    let t1 = txns.begin(IsolationLevel::RepeatableRead);
    let t2 = txns.begin(IsolationLevel::RepeatableRead);
    let rid = Rid::new(0, 0);

    lm.lock_exclusive(&t1, &rid).unwrap();

    let waiter = {
        let (lm, t2) = (lm.clone(), t2.clone());
        thread::spawn(move || lm.lock_exclusive(&t2, &rid))
    };
    thread::sleep(Duration::from_millis(50));

    txns.commit(&t1, &lm).unwrap();
    waiter.join().unwrap().unwrap();
    assert!(t2.is_exclusive_locked(&rid));
}
