use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::common::types::{PageId, Rid, HEADER_PAGE_ID, INVALID_PAGE_ID};
use crate::index::btree::error::BTreeError;
use crate::index::btree::iterator::{IterCursor, TreeIterator};
use crate::index::btree::key::IndexKey;
use crate::index::btree::latch::{LatchContext, PageGuard, RootLatch};
use crate::index::btree::node::{
    self, internal_capacity, leaf_capacity, InternalNode, LeafNode, Node, OpType,
};
use crate::storage::buffer::BufferPoolManager;
use crate::storage::page::HeaderPage;

/// Disk-resident B+ tree index over `(key, RID)` pairs with unique
/// keys. Nodes are buffer pool pages; concurrent readers and writers
/// coordinate through latch crabbing: a descent holds the parent latch
/// until the child is latched and, for writers, proven safe.
///
/// The tree-level root latch guards `root_page_id` and doubles as its
/// storage. Root changes are mirrored into the header page (page 0)
/// under the index name.
pub struct BPlusTree<K: IndexKey> {
    index_name: String,
    bpm: Arc<BufferPoolManager>,
    root_page_id: Arc<RwLock<PageId>>,
    leaf_max_size: usize,
    internal_max_size: usize,
    _marker: PhantomData<K>,
}

impl<K: IndexKey> BPlusTree<K> {
    /// Open (or create) the index named `name`, sizing nodes to fill a
    /// page.
    pub fn new(name: impl Into<String>, bpm: Arc<BufferPoolManager>) -> Result<Self, BTreeError> {
        let leaf_max = leaf_capacity::<K>();
        let internal_max = internal_capacity::<K>();
        Self::new_with_sizes(name, bpm, leaf_max, internal_max)
    }

    /// Open (or create) the index with explicit node fan-outs. Small
    /// fan-outs force deep trees, which the structural tests rely on.
    pub fn new_with_sizes(
        name: impl Into<String>,
        bpm: Arc<BufferPoolManager>,
        leaf_max_size: usize,
        internal_max_size: usize,
    ) -> Result<Self, BTreeError> {
        if leaf_max_size < 2 || leaf_max_size > leaf_capacity::<K>() {
            return Err(BTreeError::BadNodeSize(leaf_max_size));
        }
        if internal_max_size < 3 || internal_max_size > internal_capacity::<K>() {
            return Err(BTreeError::BadNodeSize(internal_max_size));
        }

        let index_name = name.into();
        let header = bpm.fetch_page(HEADER_PAGE_ID)?;
        let root = {
            let guard = header.read();
            HeaderPage::get_root_id(&guard, &index_name)
        };
        bpm.unpin_page(HEADER_PAGE_ID, false)?;

        Ok(Self {
            index_name,
            bpm,
            root_page_id: Arc::new(RwLock::new(root.unwrap_or(INVALID_PAGE_ID))),
            leaf_max_size,
            internal_max_size,
            _marker: PhantomData,
        })
    }

    pub fn is_empty(&self) -> bool {
        *self.root_page_id.read() == INVALID_PAGE_ID
    }

    /// Point lookup. Returns every RID stored under `key` (zero or one,
    /// keys are unique).
    pub fn get_value(&self, key: &K) -> Result<Vec<Rid>, BTreeError> {
        let mut ctx = LatchContext::new();
        let result = self.get_value_inner(key, &mut ctx);
        self.finish(&mut ctx, result)
    }

    /// Insert a `(key, rid)` pair. Returns `false` without modification
    /// when the key is already present.
    pub fn insert(&self, key: &K, rid: Rid) -> Result<bool, BTreeError> {
        let mut ctx = LatchContext::new();
        let result = self.insert_inner(key, rid, &mut ctx);
        self.finish(&mut ctx, result)
    }

    /// Remove `key` and its RID. Returns whether the key was present.
    pub fn remove(&self, key: &K) -> Result<bool, BTreeError> {
        let mut ctx = LatchContext::new();
        let result = self.remove_inner(key, &mut ctx);
        self.finish(&mut ctx, result)
    }

    /// Iterator over the whole tree in key order, starting at the
    /// leftmost leaf.
    pub fn begin(&self) -> Result<TreeIterator<K>, BTreeError> {
        self.make_iterator(None)
    }

    /// Iterator positioned at the first entry `>= key`.
    pub fn begin_from(&self, key: &K) -> Result<TreeIterator<K>, BTreeError> {
        self.make_iterator(Some(key))
    }

    /// Keys of every leaf, leftmost leaf first. Inspection helper for
    /// tests and debugging.
    pub fn leaf_layout(&self) -> Result<Vec<Vec<K>>, BTreeError> {
        let mut ctx = LatchContext::new();
        let cursor = match self.position_cursor(None, &mut ctx) {
            Ok(cursor) => {
                ctx.release_all(&self.bpm)?;
                cursor
            }
            Err(err) => {
                let _ = ctx.release_all(&self.bpm);
                return Err(err);
            }
        };

        let mut layout = Vec::new();
        let Some(mut cursor) = cursor else {
            return Ok(layout);
        };
        loop {
            layout.push(cursor.node.entries.iter().map(|&(k, _)| k).collect());
            let next_id = cursor.node.next_page_id;
            let IterCursor { page_id, guard, .. } = cursor;
            if next_id == INVALID_PAGE_ID {
                drop(guard);
                self.bpm.unpin_page(page_id, false)?;
                return Ok(layout);
            }
            // couple to the next leaf before releasing this one
            let next_page = self.bpm.fetch_page(next_id)?;
            let next_guard = next_page.read_arc();
            let node = Node::<K>::decode(&next_guard.data);
            drop(guard);
            self.bpm.unpin_page(page_id, false)?;
            match node {
                Ok(Node::Leaf(node)) => {
                    cursor = IterCursor {
                        page_id: next_id,
                        guard: next_guard,
                        node,
                        position: 0,
                    };
                }
                Ok(Node::Internal(_)) | Err(_) => {
                    drop(next_guard);
                    self.bpm.unpin_page(next_id, false)?;
                    return Err(BTreeError::InvalidPageFormat);
                }
            }
        }
    }

    fn get_value_inner(&self, key: &K, ctx: &mut LatchContext) -> Result<Vec<Rid>, BTreeError> {
        ctx.set_root_latch(RootLatch::Read(self.root_page_id.read_arc()));
        if ctx.root_page_id() == INVALID_PAGE_ID {
            return Ok(Vec::new());
        }
        let leaf_id = self.descend(Some(key), OpType::Read, ctx)?;
        let Node::Leaf(leaf) = self.read_node(ctx, leaf_id)? else {
            return Err(BTreeError::InvalidPageFormat);
        };
        Ok(leaf.lookup(key).into_iter().collect())
    }

    fn insert_inner(&self, key: &K, rid: Rid, ctx: &mut LatchContext) -> Result<bool, BTreeError> {
        ctx.set_root_latch(RootLatch::Write(self.root_page_id.write_arc()));
        if ctx.root_page_id() == INVALID_PAGE_ID {
            self.start_new_tree(*key, rid, ctx)?;
            return Ok(true);
        }

        let leaf_id = self.descend(Some(key), OpType::Insert, ctx)?;
        let Node::Leaf(mut leaf) = self.read_node(ctx, leaf_id)? else {
            return Err(BTreeError::InvalidPageFormat);
        };
        if leaf.lookup(key).is_some() {
            return Ok(false);
        }

        leaf.insert(*key, rid);
        if leaf.size() == self.leaf_max_size {
            let right = self.split_leaf(&mut leaf, ctx)?;
            let split_key = right.first_key();
            self.insert_into_parent(Node::Leaf(leaf), split_key, Node::Leaf(right), ctx)?;
        } else {
            self.write_node(ctx, &Node::Leaf(leaf))?;
        }
        Ok(true)
    }

    fn remove_inner(&self, key: &K, ctx: &mut LatchContext) -> Result<bool, BTreeError> {
        ctx.set_root_latch(RootLatch::Write(self.root_page_id.write_arc()));
        if ctx.root_page_id() == INVALID_PAGE_ID {
            return Ok(false);
        }

        let leaf_id = self.descend(Some(key), OpType::Delete, ctx)?;
        let Node::Leaf(mut leaf) = self.read_node(ctx, leaf_id)? else {
            return Err(BTreeError::InvalidPageFormat);
        };
        if !leaf.remove(key) {
            return Ok(false);
        }

        if leaf.size() < leaf.min_size() {
            self.coalesce_or_redistribute(Node::Leaf(leaf), ctx)?;
        } else {
            self.write_node(ctx, &Node::Leaf(leaf))?;
        }
        Ok(true)
    }

    /// Walk from the root to the leaf responsible for `key` (leftmost
    /// leaf when `key` is `None`), crabbing latches per `op`. The root
    /// latch must already be held through the context.
    fn descend(&self, key: Option<&K>, op: OpType, ctx: &mut LatchContext) -> Result<PageId, BTreeError> {
        let mut page_id = ctx.root_page_id();
        let mut has_prev = false;
        loop {
            let node = self.crab_fetch(page_id, op, has_prev, ctx)?;
            match node {
                Node::Leaf(_) => return Ok(page_id),
                Node::Internal(internal) => {
                    page_id = match key {
                        Some(key) => internal.lookup(key),
                        None => internal.value_at(0),
                    };
                    has_prev = true;
                }
            }
        }
    }

    /// Fetch and latch one page of the descent. Ancestors (and the root
    /// latch) are released as soon as this node is safe for the
    /// operation; read descents treat every node as safe.
    fn crab_fetch(
        &self,
        page_id: PageId,
        op: OpType,
        has_prev: bool,
        ctx: &mut LatchContext,
    ) -> Result<Node<K>, BTreeError> {
        let page = self.bpm.fetch_page(page_id)?;
        let guard = match op {
            OpType::Read => PageGuard::Read(page.read_arc()),
            OpType::Insert | OpType::Delete => PageGuard::Write(page.write_arc()),
        };
        let node = match Node::<K>::decode(guard.data()) {
            Ok(node) => node,
            Err(err) => {
                drop(guard);
                let _ = self.bpm.unpin_page(page_id, false);
                return Err(err);
            }
        };
        if has_prev && (op == OpType::Read || node.is_safe(op)) {
            ctx.release_all(&self.bpm)?;
        }
        ctx.push(page_id, guard);
        Ok(node)
    }

    fn start_new_tree(&self, key: K, rid: Rid, ctx: &mut LatchContext) -> Result<(), BTreeError> {
        let (page, page_id) = self.bpm.new_page()?;
        let mut root = LeafNode::new(page_id, INVALID_PAGE_ID, self.leaf_max_size);
        root.insert(key, rid);
        {
            let mut guard = page.write();
            Node::Leaf(root).encode(&mut guard.data);
        }
        self.bpm.unpin_page(page_id, true)?;
        ctx.set_root_page_id(page_id);
        self.sync_root_to_header(page_id)?;
        log::debug!("index {}: started new tree at page {}", self.index_name, page_id);
        Ok(())
    }

    /// Allocate a right sibling for an overflowing leaf, latch it into
    /// the context, and move the upper half over.
    fn split_leaf(&self, leaf: &mut LeafNode<K>, ctx: &mut LatchContext) -> Result<LeafNode<K>, BTreeError> {
        let (page, page_id) = self.bpm.new_page()?;
        ctx.push(page_id, PageGuard::Write(page.write_arc()));
        let mut right = LeafNode::new(page_id, leaf.parent_page_id, self.leaf_max_size);
        leaf.move_half_to(&mut right);
        log::trace!("split leaf {} into {}", leaf.page_id, page_id);
        Ok(right)
    }

    fn split_internal(
        &self,
        internal: &mut InternalNode<K>,
        ctx: &mut LatchContext,
    ) -> Result<InternalNode<K>, BTreeError> {
        let (page, page_id) = self.bpm.new_page()?;
        ctx.push(page_id, PageGuard::Write(page.write_arc()));
        let mut right = InternalNode::new(page_id, internal.parent_page_id, self.internal_max_size);
        for child in internal.move_half_to(&mut right) {
            self.set_parent_pointer(ctx, child, page_id)?;
        }
        log::trace!("split internal {} into {}", internal.page_id, page_id);
        Ok(right)
    }

    /// Wire a freshly split pair into their parent, growing a new root
    /// if `old` was the root and splitting the parent recursively if it
    /// overflows in turn.
    fn insert_into_parent(
        &self,
        mut old: Node<K>,
        key: K,
        mut new: Node<K>,
        ctx: &mut LatchContext,
    ) -> Result<(), BTreeError> {
        if old.parent_page_id() == INVALID_PAGE_ID {
            let (page, root_id) = self.bpm.new_page()?;
            let mut root = InternalNode::new(root_id, INVALID_PAGE_ID, self.internal_max_size);
            root.populate_new_root(old.page_id(), key, new.page_id());
            {
                let mut guard = page.write();
                Node::Internal(root).encode(&mut guard.data);
            }
            self.bpm.unpin_page(root_id, true)?;

            old.set_parent_page_id(root_id);
            new.set_parent_page_id(root_id);
            self.write_node(ctx, &old)?;
            self.write_node(ctx, &new)?;
            ctx.set_root_page_id(root_id);
            self.sync_root_to_header(root_id)?;
            log::debug!("index {}: new root page {}", self.index_name, root_id);
            return Ok(());
        }

        let parent_id = old.parent_page_id();
        new.set_parent_page_id(parent_id);
        self.write_node(ctx, &old)?;
        self.write_node(ctx, &new)?;

        let Node::Internal(mut parent) = self.read_node(ctx, parent_id)? else {
            return Err(BTreeError::InvalidPageFormat);
        };
        parent.insert_node_after(old.page_id(), key, new.page_id());
        if parent.size() == self.internal_max_size {
            let right = self.split_internal(&mut parent, ctx)?;
            let up_key = right.key_at(0);
            self.insert_into_parent(Node::Internal(parent), up_key, Node::Internal(right), ctx)
        } else {
            self.write_node(ctx, &Node::Internal(parent))
        }
    }

    /// Rebalance an underflowing node: merge with a sibling when both
    /// fit in one page, otherwise shift a single entry across. The
    /// sibling is the preceding node unless this node is its parent's
    /// first child.
    fn coalesce_or_redistribute(&self, node: Node<K>, ctx: &mut LatchContext) -> Result<(), BTreeError> {
        if node.parent_page_id() == INVALID_PAGE_ID {
            return self.adjust_root(node, ctx);
        }

        let parent_id = node.parent_page_id();
        let Node::Internal(mut parent) = self.read_node(ctx, parent_id)? else {
            return Err(BTreeError::InvalidPageFormat);
        };
        let index = parent
            .value_index(node.page_id())
            .ok_or(BTreeError::InvalidPageFormat)?;
        let (sibling_is_next, sibling_index) = if index == 0 { (true, 1) } else { (false, index - 1) };
        let sibling_id = parent.value_at(sibling_index);

        // the sibling joins the crabbing context under a write latch
        let sibling_page = self.bpm.fetch_page(sibling_id)?;
        ctx.push(sibling_id, PageGuard::Write(sibling_page.write_arc()));
        let sibling = self.read_node(ctx, sibling_id)?;

        if node.size() + sibling.size() < node.max_size() {
            // merge right into left; the right page is dropped
            let (mut left, mut right) = if sibling_is_next {
                (node, sibling)
            } else {
                (sibling, node)
            };
            let right_index = parent
                .value_index(right.page_id())
                .ok_or(BTreeError::InvalidPageFormat)?;
            let middle_key = parent.key_at(right_index);
            match (&mut left, &mut right) {
                (Node::Leaf(left), Node::Leaf(right)) => right.move_all_to(left),
                (Node::Internal(left), Node::Internal(right)) => {
                    for child in right.move_all_to(left, middle_key) {
                        self.set_parent_pointer(ctx, child, left.page_id)?;
                    }
                }
                _ => return Err(BTreeError::InvalidPageFormat),
            }
            log::trace!("coalesced page {} into {}", right.page_id(), left.page_id());
            ctx.mark_deleted(right.page_id());
            self.write_node(ctx, &left)?;

            parent.remove(right_index);
            if parent.size() < parent.min_size() {
                self.coalesce_or_redistribute(Node::Internal(parent), ctx)
            } else {
                self.write_node(ctx, &Node::Internal(parent))
            }
        } else {
            self.redistribute(node, sibling, parent, sibling_is_next, ctx)
        }
    }

    /// Move one entry between siblings and refresh the parent
    /// separator so the partition keys stay correct.
    fn redistribute(
        &self,
        node: Node<K>,
        sibling: Node<K>,
        mut parent: InternalNode<K>,
        sibling_is_next: bool,
        ctx: &mut LatchContext,
    ) -> Result<(), BTreeError> {
        match (node, sibling) {
            (Node::Leaf(mut node), Node::Leaf(mut sibling)) => {
                if sibling_is_next {
                    sibling.move_first_to_end_of(&mut node);
                    let sibling_index = parent
                        .value_index(sibling.page_id)
                        .ok_or(BTreeError::InvalidPageFormat)?;
                    parent.set_key_at(sibling_index, sibling.first_key());
                } else {
                    sibling.move_last_to_front_of(&mut node);
                    let node_index = parent
                        .value_index(node.page_id)
                        .ok_or(BTreeError::InvalidPageFormat)?;
                    parent.set_key_at(node_index, node.first_key());
                }
                self.write_node(ctx, &Node::Leaf(node))?;
                self.write_node(ctx, &Node::Leaf(sibling))?;
            }
            (Node::Internal(mut node), Node::Internal(mut sibling)) => {
                if sibling_is_next {
                    let sibling_index = parent
                        .value_index(sibling.page_id)
                        .ok_or(BTreeError::InvalidPageFormat)?;
                    let middle_key = parent.key_at(sibling_index);
                    let next_separator = sibling.key_at(1);
                    let child = sibling.move_first_to_end_of(&mut node, middle_key);
                    parent.set_key_at(sibling_index, next_separator);
                    self.set_parent_pointer(ctx, child, node.page_id)?;
                } else {
                    let node_index = parent
                        .value_index(node.page_id)
                        .ok_or(BTreeError::InvalidPageFormat)?;
                    let middle_key = parent.key_at(node_index);
                    let new_separator = sibling.key_at(sibling.size() - 1);
                    let child = sibling.move_last_to_front_of(&mut node, middle_key);
                    parent.set_key_at(node_index, new_separator);
                    self.set_parent_pointer(ctx, child, node.page_id)?;
                }
                self.write_node(ctx, &Node::Internal(node))?;
                self.write_node(ctx, &Node::Internal(sibling))?;
            }
            _ => return Err(BTreeError::InvalidPageFormat),
        }
        self.write_node(ctx, &Node::Internal(parent))
    }

    /// Underflow handling for the root: an empty root leaf ends the
    /// tree; a root internal with a single child hands the root role to
    /// that child.
    fn adjust_root(&self, node: Node<K>, ctx: &mut LatchContext) -> Result<(), BTreeError> {
        match node {
            Node::Leaf(leaf) => {
                if leaf.size() == 0 {
                    ctx.mark_deleted(leaf.page_id);
                    ctx.set_root_page_id(INVALID_PAGE_ID);
                    self.sync_root_to_header(INVALID_PAGE_ID)?;
                    log::debug!("index {}: tree emptied", self.index_name);
                } else {
                    self.write_node(ctx, &Node::Leaf(leaf))?;
                }
            }
            Node::Internal(root) => {
                if root.size() == 1 {
                    let child_id = root.value_at(0);
                    ctx.mark_deleted(root.page_id);
                    ctx.set_root_page_id(child_id);
                    self.set_parent_pointer(ctx, child_id, INVALID_PAGE_ID)?;
                    self.sync_root_to_header(child_id)?;
                    log::debug!("index {}: root collapsed into page {}", self.index_name, child_id);
                } else {
                    self.write_node(ctx, &Node::Internal(root))?;
                }
            }
        }
        Ok(())
    }

    fn make_iterator(&self, key: Option<&K>) -> Result<TreeIterator<K>, BTreeError> {
        let mut ctx = LatchContext::new();
        match self.position_cursor(key, &mut ctx) {
            Ok(cursor) => {
                ctx.release_all(&self.bpm)?;
                Ok(TreeIterator::new(self.bpm.clone(), cursor))
            }
            Err(err) => {
                let _ = ctx.release_all(&self.bpm);
                Err(err)
            }
        }
    }

    /// Descend to the starting leaf under read crabbing and hand its
    /// latch out of the context so the iterator can keep holding it.
    fn position_cursor(
        &self,
        key: Option<&K>,
        ctx: &mut LatchContext,
    ) -> Result<Option<IterCursor<K>>, BTreeError> {
        ctx.set_root_latch(RootLatch::Read(self.root_page_id.read_arc()));
        if ctx.root_page_id() == INVALID_PAGE_ID {
            return Ok(None);
        }

        let leaf_id = self.descend(key, OpType::Read, ctx)?;
        let Node::Leaf(leaf) = self.read_node(ctx, leaf_id)? else {
            return Err(BTreeError::InvalidPageFormat);
        };
        let position = match key {
            Some(key) => leaf.key_index(key),
            None => 0,
        };
        let Some(PageGuard::Read(guard)) = ctx.take_page(leaf_id) else {
            return Err(BTreeError::InvalidPageFormat);
        };
        ctx.release_root_latch();
        Ok(Some(IterCursor {
            page_id: leaf_id,
            guard,
            node: leaf,
            position,
        }))
    }

    /// Decode a node, through the context's latch when held, otherwise
    /// with a transient fetch.
    fn read_node(&self, ctx: &LatchContext, page_id: PageId) -> Result<Node<K>, BTreeError> {
        if let Some(data) = ctx.data(page_id) {
            return Node::decode(data);
        }
        let page = self.bpm.fetch_page(page_id)?;
        let node = {
            let guard = page.read();
            Node::decode(&guard.data)
        };
        self.bpm.unpin_page(page_id, false)?;
        node
    }

    /// Encode a node back to its page, through the context's write
    /// latch when held, otherwise with a transient fetch.
    fn write_node(&self, ctx: &mut LatchContext, node: &Node<K>) -> Result<(), BTreeError> {
        let page_id = node.page_id();
        if let Some(data) = ctx.data_mut(page_id) {
            node.encode(data);
            return Ok(());
        }
        let page = self.bpm.fetch_page(page_id)?;
        {
            let mut guard = page.write();
            node.encode(&mut guard.data);
        }
        self.bpm.unpin_page(page_id, true)?;
        Ok(())
    }

    /// Repoint a child's parent back-reference after it changes owner.
    fn set_parent_pointer(
        &self,
        ctx: &mut LatchContext,
        child_id: PageId,
        parent_id: PageId,
    ) -> Result<(), BTreeError> {
        if let Some(data) = ctx.data_mut(child_id) {
            node::write_parent_page_id(data, parent_id);
            return Ok(());
        }
        let page = self.bpm.fetch_page(child_id)?;
        {
            let mut guard = page.write();
            node::write_parent_page_id(&mut guard.data, parent_id);
        }
        self.bpm.unpin_page(child_id, true)?;
        Ok(())
    }

    /// Mirror a `root_page_id` change into the header page directory.
    fn sync_root_to_header(&self, root_page_id: PageId) -> Result<(), BTreeError> {
        let page = self.bpm.fetch_page(HEADER_PAGE_ID)?;
        {
            let mut guard = page.write();
            if !HeaderPage::update_record(&mut guard, &self.index_name, root_page_id) {
                HeaderPage::insert_record(&mut guard, &self.index_name, root_page_id);
            }
        }
        self.bpm.unpin_page(HEADER_PAGE_ID, true)?;
        Ok(())
    }

    /// Release everything still held by the operation, preferring the
    /// operation's own error over a release failure.
    fn finish<T>(&self, ctx: &mut LatchContext, result: Result<T, BTreeError>) -> Result<T, BTreeError> {
        let released = ctx.release_all(&self.bpm);
        let value = result?;
        released?;
        Ok(value)
    }
}
