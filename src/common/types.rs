use std::sync::Arc;
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{RawRwLock, RwLock};

/// Page size in bytes (4KB)
pub const PAGE_SIZE: usize = 4096;

/// Page ID type. Negative values are never allocated.
pub type PageId = i32;

/// Sentinel for "no page".
pub const INVALID_PAGE_ID: PageId = -1;

/// Page 0 is reserved for the index directory (header page).
pub const HEADER_PAGE_ID: PageId = 0;

/// Buffer pool frame ID type
pub type FrameId = usize;

/// Transaction ID type. A higher ID means a younger transaction.
pub type TxnId = u32;

/// LSN (Log Sequence Number) type. Reserved by the page layout; this
/// tier runs without a recovery log, so it stays 0.
pub type Lsn = u32;

/// Record ID - identifies a tuple by heap page and slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Rid {
    pub page_id: PageId,
    pub slot_num: u32,
}

impl Rid {
    pub fn new(page_id: PageId, slot_num: u32) -> Self {
        Self { page_id, slot_num }
    }
}

impl std::fmt::Display for Rid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.page_id, self.slot_num)
    }
}

/// Page structure
#[derive(Debug, Clone)]
pub struct Page {
    pub data: [u8; PAGE_SIZE],
    pub page_id: PageId,
    pub lsn: Lsn,
}

impl Page {
    pub fn new(page_id: PageId) -> Self {
        Self {
            data: [0; PAGE_SIZE],
            page_id,
            lsn: 0,
        }
    }

    pub fn reset(&mut self) {
        self.data.fill(0);
        self.page_id = INVALID_PAGE_ID;
        self.lsn = 0;
    }
}

/// Smart pointer to a page. The RwLock is the page latch: index code
/// takes it for the duration of a node read or structural change.
pub type PagePtr = Arc<RwLock<Page>>;

/// Owned read guard over a page latch; can outlive the borrow of the
/// `PagePtr` it was taken from, so a tree descent can hold several.
pub type PageReadGuard = ArcRwLockReadGuard<RawRwLock, Page>;

/// Owned write guard over a page latch.
pub type PageWriteGuard = ArcRwLockWriteGuard<RawRwLock, Page>;
