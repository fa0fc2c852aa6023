use std::sync::Arc;

use crate::common::types::{PageId, PageReadGuard, Rid, INVALID_PAGE_ID};
use crate::index::btree::error::BTreeError;
use crate::index::btree::key::IndexKey;
use crate::index::btree::node::{LeafNode, Node};
use crate::storage::buffer::BufferPoolManager;

/// Position within one leaf: the pinned page, its read latch, the
/// decoded node and the entry offset.
pub(crate) struct IterCursor<K: IndexKey> {
    pub page_id: PageId,
    pub guard: PageReadGuard,
    pub node: LeafNode<K>,
    pub position: usize,
}

/// In-order iterator over the leaf chain. Holds a read latch and a pin
/// on exactly one leaf at a time; stepping to the next leaf latches it
/// before the current one is released.
///
/// Single-latch coupling does not protect against concurrent structural
/// changes: callers must serialize iteration against writers or accept
/// missed/duplicated entries.
pub struct TreeIterator<K: IndexKey> {
    bpm: Arc<BufferPoolManager>,
    cursor: Option<IterCursor<K>>,
}

impl<K: IndexKey> TreeIterator<K> {
    pub(crate) fn new(bpm: Arc<BufferPoolManager>, cursor: Option<IterCursor<K>>) -> Self {
        Self { bpm, cursor }
    }

    /// Move to the next leaf in the chain, or to the end of iteration.
    fn advance_leaf(&mut self) -> Result<(), BTreeError> {
        let Some(IterCursor { page_id, guard, node, .. }) = self.cursor.take() else {
            return Ok(());
        };
        let next_id = node.next_page_id;

        if next_id == INVALID_PAGE_ID {
            drop(guard);
            self.bpm.unpin_page(page_id, false)?;
            return Ok(());
        }

        // latch the successor before releasing the current leaf
        let next_page = self.bpm.fetch_page(next_id)?;
        let next_guard = next_page.read_arc();
        let decoded = Node::<K>::decode(&next_guard.data);
        drop(guard);
        self.bpm.unpin_page(page_id, false)?;

        match decoded {
            Ok(Node::Leaf(node)) => {
                self.cursor = Some(IterCursor {
                    page_id: next_id,
                    guard: next_guard,
                    node,
                    position: 0,
                });
                Ok(())
            }
            Ok(Node::Internal(_)) | Err(_) => {
                drop(next_guard);
                self.bpm.unpin_page(next_id, false)?;
                Err(BTreeError::InvalidPageFormat)
            }
        }
    }
}

impl<K: IndexKey> Iterator for TreeIterator<K> {
    type Item = Result<(K, Rid), BTreeError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let cursor = self.cursor.as_mut()?;
            if cursor.position < cursor.node.size() {
                let entry = cursor.node.entries[cursor.position];
                cursor.position += 1;
                return Some(Ok(entry));
            }
            if let Err(err) = self.advance_leaf() {
                return Some(Err(err));
            }
        }
    }
}

impl<K: IndexKey> Drop for TreeIterator<K> {
    fn drop(&mut self) {
        if let Some(IterCursor { page_id, guard, .. }) = self.cursor.take() {
            drop(guard);
            let _ = self.bpm.unpin_page(page_id, false);
        }
    }
}
