// Export public modules
pub mod common;
pub mod index;
pub mod storage;
pub mod transaction;

// Re-export key items for convenient access
pub use index::btree::{BPlusTree, BTreeError, IndexKey, TreeIterator};
pub use storage::buffer::{BufferPoolError, BufferPoolManager, LruReplacer};
pub use storage::disk::DiskManager;
pub use transaction::{
    IsolationLevel, LockManager, Transaction, TransactionError, TransactionManager, TransactionState,
};
