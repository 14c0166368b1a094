use std::fmt::Write as _;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::Arc;

use log::debug;

use crate::buffer::{
    AtomicPageId, BufferPoolManager, PageId, PageRef, ReadPageGuard, WritePageGuard,
    HEADER_PAGE_ID, INVALID_PAGE_ID,
};
use crate::config::BTreeConfig;
use crate::error::{VellumError, VellumResult};
use crate::index::btree_iterator::IndexIterator;
use crate::index::comparator::KeyComparator;
use crate::storage::codec::{
    BPlusTreeInternalPageCodec, BPlusTreeLeafPageCodec, BPlusTreePageCodec, CommonCodec,
    HeaderPageCodec,
};
use crate::storage::page::{
    BPlusTreeInternalPage, BPlusTreeLeafPage, BPlusTreePage, BPlusTreePageType, RecordId,
};
use crate::transaction::{PageGuard, Transaction};

/// Write operations crab with different node-safety rules: an insert may
/// split a full child, a delete may shrink one below its minimum. Reads
/// always release ancestors as soon as the child is latched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Insert,
    Delete,
}

/// A concurrent B+tree mapping ordered byte keys to `RecordId`s over pages
/// of an external buffer pool. Writers descend with latch crabbing: the
/// root-to-leaf path stays write-latched until a child proves safe for the
/// operation, at which point every ancestor is released. The root page id
/// lives in an atomic and is persisted under the index name in the header
/// page on every change.
pub struct BPlusTreeIndex {
    index_name: String,
    comparator: KeyComparator,
    pub buffer_pool: Arc<BufferPoolManager>,
    leaf_max_size: u32,
    internal_max_size: u32,
    root_page_id: AtomicPageId,
}

impl BPlusTreeIndex {
    /// Opens the index named `index_name`, resuming from the root recorded
    /// in the header page if one exists.
    pub fn new(
        index_name: impl Into<String>,
        comparator: KeyComparator,
        buffer_pool: Arc<BufferPoolManager>,
        config: BTreeConfig,
    ) -> VellumResult<Self> {
        debug_assert!(config.leaf_max_size >= 2);
        debug_assert!(config.internal_max_size >= 3);
        let index_name = index_name.into();

        let persisted_root = {
            let guard = buffer_pool.fetch_page_read(HEADER_PAGE_ID)?;
            let (header, _) = HeaderPageCodec::decode(guard.data())?;
            header.get_root_id(&index_name)
        };

        Ok(Self {
            index_name,
            comparator,
            buffer_pool,
            leaf_max_size: config.leaf_max_size,
            internal_max_size: config.internal_max_size,
            root_page_id: AtomicPageId::new(persisted_root.unwrap_or(INVALID_PAGE_ID)),
        })
    }

    pub fn index_name(&self) -> &str {
        &self.index_name
    }

    pub fn is_empty(&self) -> bool {
        self.root_page_id.load(AtomicOrdering::SeqCst) == INVALID_PAGE_ID
    }

    pub fn root_page_id(&self) -> PageId {
        self.root_page_id.load(AtomicOrdering::SeqCst)
    }

    /// Root page id as recorded in the header page.
    pub fn persisted_root_page_id(&self) -> VellumResult<Option<PageId>> {
        let guard = self.buffer_pool.fetch_page_read(HEADER_PAGE_ID)?;
        let (header, _) = HeaderPageCodec::decode(guard.data())?;
        Ok(header.get_root_id(&self.index_name))
    }

    pub fn get(&self, key: &[u8]) -> VellumResult<Option<RecordId>> {
        let mut txn = Transaction::new();
        self.get_with_transaction(key, &mut txn)
    }

    pub fn insert(&self, key: &[u8], rid: RecordId) -> VellumResult<bool> {
        let mut txn = Transaction::new();
        self.insert_with_transaction(key, rid, &mut txn)
    }

    pub fn remove(&self, key: &[u8]) -> VellumResult<()> {
        let mut txn = Transaction::new();
        self.remove_with_transaction(key, &mut txn)
    }

    /// Point lookup through the caller's work set: the descent holds a read
    /// latch on at most two adjacent levels at any instant.
    pub fn get_with_transaction(
        &self,
        key: &[u8],
        txn: &mut Transaction,
    ) -> VellumResult<Option<RecordId>> {
        let result = self.get_inner(key, txn);
        let drained = self.drain_transaction(txn);
        let found = result?;
        drained?;
        Ok(found)
    }

    /// Inserts a key/value pair; `false` if the key is already present.
    pub fn insert_with_transaction(
        &self,
        key: &[u8],
        rid: RecordId,
        txn: &mut Transaction,
    ) -> VellumResult<bool> {
        let result = self.insert_inner(key, rid, txn);
        let drained = self.drain_transaction(txn);
        let inserted = result?;
        drained?;
        Ok(inserted)
    }

    /// Removes a key; absent keys are a silent no-op.
    pub fn remove_with_transaction(&self, key: &[u8], txn: &mut Transaction) -> VellumResult<()> {
        let result = self.remove_inner(key, txn);
        let drained = self.drain_transaction(txn);
        result?;
        drained
    }

    /// Iterator positioned at the smallest key.
    pub fn begin(&self) -> VellumResult<IndexIterator> {
        let Some(mut guard) = self.latch_root_read()? else {
            return Ok(IndexIterator::end(
                self.buffer_pool.clone(),
                self.comparator,
            ));
        };
        loop {
            let (kind, _, _) = BPlusTreePageCodec::decode_size_info(guard.data())?;
            if kind == BPlusTreePageType::LeafPage {
                return Ok(IndexIterator::new(
                    self.buffer_pool.clone(),
                    self.comparator,
                    guard.page_id(),
                    0,
                ));
            }
            let (internal, _) =
                BPlusTreeInternalPageCodec::decode(guard.data(), self.comparator)?;
            // Follow child 0 to the leftmost leaf.
            guard = self.buffer_pool.fetch_page_read(internal.value_at(0))?;
        }
    }

    /// Iterator positioned at the first key `>= key`.
    pub fn begin_at(&self, key: &[u8]) -> VellumResult<IndexIterator> {
        let Some(guard) = self.find_leaf_page_read(key)? else {
            return Ok(IndexIterator::end(
                self.buffer_pool.clone(),
                self.comparator,
            ));
        };
        let (leaf, _) = BPlusTreeLeafPageCodec::decode(guard.data(), self.comparator)?;
        let index = leaf.key_index(key);
        Ok(IndexIterator::new(
            self.buffer_pool.clone(),
            self.comparator,
            guard.page_id(),
            index,
        ))
    }

    fn get_inner(&self, key: &[u8], txn: &mut Transaction) -> VellumResult<Option<RecordId>> {
        debug_assert!(txn.page_set_is_empty());
        let Some(root_guard) = self.latch_root_read()? else {
            return Ok(None);
        };
        txn.add_into_page_set(PageGuard::Read(root_guard));

        loop {
            let child_id = {
                let current = txn
                    .last_page()
                    .ok_or_else(|| VellumError::Internal("empty work set mid-descent".to_string()))?;
                let (kind, _, _) = BPlusTreePageCodec::decode_size_info(current.data())?;
                if kind == BPlusTreePageType::LeafPage {
                    None
                } else {
                    let (internal, _) =
                        BPlusTreeInternalPageCodec::decode(current.data(), self.comparator)?;
                    Some(internal.look_up(key))
                }
            };

            match child_id {
                None => {
                    let leaf_guard = txn.pop_page_set().expect("leaf was just observed");
                    let (leaf, _) =
                        BPlusTreeLeafPageCodec::decode(leaf_guard.data(), self.comparator)?;
                    return Ok(leaf.look_up(key));
                }
                Some(child_id) => {
                    let child_guard = self.buffer_pool.fetch_page_read(child_id)?;
                    // Reads release every ancestor once the child is latched.
                    txn.release_page_set();
                    txn.add_into_page_set(PageGuard::Read(child_guard));
                }
            }
        }
    }

    fn insert_inner(
        &self,
        key: &[u8],
        rid: RecordId,
        txn: &mut Transaction,
    ) -> VellumResult<bool> {
        debug_assert!(txn.page_set_is_empty());
        loop {
            if self.is_empty() {
                self.start_new_tree()?;
            }
            // The tree may have emptied again between the check and the
            // descent; retry until we land on a leaf.
            let Some(mut leaf_guard) = self.find_leaf_page_write(key, Operation::Insert, txn)?
            else {
                continue;
            };

            let (mut leaf, _) = BPlusTreeLeafPageCodec::decode(leaf_guard.data(), self.comparator)?;
            let old_size = leaf.header.current_size;
            let new_size = leaf.insert(key, rid);
            if new_size == old_size {
                return Ok(false);
            }

            if new_size > leaf.header.max_size {
                self.split_leaf(leaf_guard, leaf, txn)?;
            } else {
                leaf_guard.overwrite(&BPlusTreeLeafPageCodec::encode(&leaf));
            }
            return Ok(true);
        }
    }

    fn remove_inner(&self, key: &[u8], txn: &mut Transaction) -> VellumResult<()> {
        debug_assert!(txn.page_set_is_empty());
        if self.is_empty() {
            return Ok(());
        }
        let Some(mut leaf_guard) = self.find_leaf_page_write(key, Operation::Delete, txn)? else {
            return Ok(());
        };

        let (mut leaf, _) = BPlusTreeLeafPageCodec::decode(leaf_guard.data(), self.comparator)?;
        let old_size = leaf.header.current_size;
        let new_size = leaf.remove_and_delete(key);
        if new_size == old_size {
            return Ok(());
        }
        leaf_guard.overwrite(&BPlusTreeLeafPageCodec::encode(&leaf));

        if new_size < leaf.min_size() {
            let leaf_page_id = leaf_guard.page_id();
            let should_delete =
                self.coalesce_or_redistribute(leaf_guard, BPlusTreePage::Leaf(leaf), txn)?;
            if should_delete {
                txn.add_into_deleted_page_set(leaf_page_id);
            }
        }
        Ok(())
    }

    /// Releases the remaining work set top-down, then applies scheduled
    /// page deletions. Every page reaching the deleted set is unpinned by
    /// then, so `delete_page` must succeed.
    fn drain_transaction(&self, txn: &mut Transaction) -> VellumResult<()> {
        txn.release_page_set();
        for page_id in txn.take_deleted_page_set() {
            let deleted = self.buffer_pool.delete_page(page_id)?;
            assert!(deleted, "deleting unpinned page {} failed", page_id);
        }
        Ok(())
    }

    /// Latches the root for reading, retrying while a concurrent writer
    /// swaps the root out from under us.
    fn latch_root_read(&self) -> VellumResult<Option<ReadPageGuard>> {
        loop {
            let root_page_id = self.root_page_id.load(AtomicOrdering::SeqCst);
            if root_page_id == INVALID_PAGE_ID {
                return Ok(None);
            }
            let guard = self.buffer_pool.fetch_page_read(root_page_id)?;
            if self.root_page_id.load(AtomicOrdering::SeqCst) == root_page_id {
                return Ok(Some(guard));
            }
        }
    }

    fn latch_root_write(&self) -> VellumResult<Option<WritePageGuard>> {
        loop {
            let root_page_id = self.root_page_id.load(AtomicOrdering::SeqCst);
            if root_page_id == INVALID_PAGE_ID {
                return Ok(None);
            }
            let guard = self.buffer_pool.fetch_page_write(root_page_id)?;
            if self.root_page_id.load(AtomicOrdering::SeqCst) == root_page_id {
                return Ok(Some(guard));
            }
        }
    }

    /// Crabbing descent for writers. Ancestors accumulate in the work set
    /// and are released as soon as the freshly latched child is safe; the
    /// target leaf is handed back to the caller still latched and pinned.
    fn find_leaf_page_write(
        &self,
        key: &[u8],
        op: Operation,
        txn: &mut Transaction,
    ) -> VellumResult<Option<WritePageGuard>> {
        let Some(root_guard) = self.latch_root_write()? else {
            return Ok(None);
        };
        txn.add_into_page_set(PageGuard::Write(root_guard));

        loop {
            let child_id = {
                let current = txn
                    .last_page()
                    .ok_or_else(|| VellumError::Internal("empty work set mid-descent".to_string()))?;
                let (kind, _, _) = BPlusTreePageCodec::decode_size_info(current.data())?;
                if kind == BPlusTreePageType::LeafPage {
                    None
                } else {
                    let (internal, _) =
                        BPlusTreeInternalPageCodec::decode(current.data(), self.comparator)?;
                    Some(internal.look_up(key))
                }
            };

            let Some(child_id) = child_id else {
                match txn.pop_page_set() {
                    Some(PageGuard::Write(leaf_guard)) => return Ok(Some(leaf_guard)),
                    _ => {
                        return Err(VellumError::Internal(
                            "write descent produced a non-write leaf guard".to_string(),
                        ))
                    }
                }
            };

            let child_guard = self.buffer_pool.fetch_page_write(child_id)?;
            let (_, child_size, child_max) =
                BPlusTreePageCodec::decode_size_info(child_guard.data())?;
            let child_is_safe = match op {
                Operation::Insert => child_size < child_max,
                Operation::Delete => child_size > child_max.div_ceil(2),
            };
            if child_is_safe {
                txn.release_page_set();
            }
            txn.add_into_page_set(PageGuard::Write(child_guard));
        }
    }

    /// Read-only latch-coupling descent used by `begin_at`; holds at most
    /// two adjacent levels.
    fn find_leaf_page_read(&self, key: &[u8]) -> VellumResult<Option<ReadPageGuard>> {
        let Some(mut guard) = self.latch_root_read()? else {
            return Ok(None);
        };
        loop {
            let (kind, _, _) = BPlusTreePageCodec::decode_size_info(guard.data())?;
            if kind == BPlusTreePageType::LeafPage {
                return Ok(Some(guard));
            }
            let (internal, _) = BPlusTreeInternalPageCodec::decode(guard.data(), self.comparator)?;
            let child_id = internal.look_up(key);
            // The child is latched before the assignment drops the parent.
            guard = self.buffer_pool.fetch_page_read(child_id)?;
        }
    }

    /// Builds a single-leaf tree and races to publish it as the root. The
    /// loser of the compare-and-set deletes its page and inserts into the
    /// winner's tree.
    fn start_new_tree(&self) -> VellumResult<()> {
        let page_ref = self.buffer_pool.new_page()?;
        let page_id = page_ref.page_id();
        let leaf = BPlusTreeLeafPage::new(
            page_id,
            INVALID_PAGE_ID,
            self.leaf_max_size,
            self.comparator,
        );
        page_ref.write().set_data(&BPlusTreeLeafPageCodec::encode(&leaf));
        drop(page_ref);

        if self
            .root_page_id
            .compare_exchange(
                INVALID_PAGE_ID,
                page_id,
                AtomicOrdering::SeqCst,
                AtomicOrdering::SeqCst,
            )
            .is_ok()
        {
            self.update_root_page_id(true)?;
            debug!("started new tree with root leaf {}", page_id);
        } else {
            let deleted = self.buffer_pool.delete_page(page_id)?;
            debug_assert!(deleted, "discarding an unpublished root leaf failed");
        }
        Ok(())
    }

    fn split_leaf(
        &self,
        leaf_guard: WritePageGuard,
        mut leaf: BPlusTreeLeafPage,
        txn: &mut Transaction,
    ) -> VellumResult<()> {
        let sibling_ref = self.buffer_pool.new_page()?;
        let mut sibling = BPlusTreeLeafPage::new(
            sibling_ref.page_id(),
            leaf.header.parent_page_id,
            self.leaf_max_size,
            self.comparator,
        );
        leaf.move_half_to(&mut sibling);
        // The separator published upward is the right sibling's first key.
        let separator = sibling.key_at(0).to_vec();
        self.insert_into_parent(
            leaf_guard,
            BPlusTreePage::Leaf(leaf),
            separator,
            sibling_ref,
            BPlusTreePage::Leaf(sibling),
            txn,
        )
    }

    /// Links a freshly split-off right sibling into the parent, splitting
    /// upward recursively. `left_guard` is the latch held on the split
    /// node; the sibling is pinned but unlatched, which is safe because it
    /// is unreachable until the parent entry (or new root) is published.
    fn insert_into_parent(
        &self,
        mut left_guard: WritePageGuard,
        mut left_page: BPlusTreePage,
        separator: Vec<u8>,
        right_ref: PageRef,
        mut right_page: BPlusTreePage,
        txn: &mut Transaction,
    ) -> VellumResult<()> {
        let left_id = left_guard.page_id();
        let right_id = right_ref.page_id();
        let left_parent_id = left_page.parent_page_id();

        if left_page.is_root() {
            debug_assert!(txn.page_set_is_empty());
            let root_ref = self.buffer_pool.new_page()?;
            let mut new_root = BPlusTreeInternalPage::new(
                root_ref.page_id(),
                INVALID_PAGE_ID,
                self.internal_max_size,
                self.comparator,
            );
            new_root.populate_new_root(left_id, separator, right_id);
            root_ref
                .write()
                .set_data(&BPlusTreeInternalPageCodec::encode(&new_root));

            left_page.set_parent_page_id(root_ref.page_id());
            right_page.set_parent_page_id(root_ref.page_id());
            right_ref
                .write()
                .set_data(&BPlusTreePageCodec::encode(&right_page));
            left_guard.overwrite(&BPlusTreePageCodec::encode(&left_page));

            // Publish while the old root is still latched: concurrent
            // traversals re-check the root id after latching and restart.
            self.root_page_id
                .store(root_ref.page_id(), AtomicOrdering::SeqCst);
            self.update_root_page_id(false)?;
            debug!("grew new root {} over {} and {}", root_ref.page_id(), left_id, right_id);
            return Ok(());
        }

        // Both halves are final: write them out and release them before
        // touching the parent. The parent is still write-latched in the
        // work set, so no traversal can reach either half meanwhile.
        right_ref
            .write()
            .set_data(&BPlusTreePageCodec::encode(&right_page));
        left_guard.overwrite(&BPlusTreePageCodec::encode(&left_page));
        drop(left_guard);
        drop(right_ref);

        let Some(PageGuard::Write(mut parent_guard)) = txn.pop_page_set() else {
            return Err(VellumError::Internal(
                "split propagation without a latched parent".to_string(),
            ));
        };
        debug_assert_eq!(parent_guard.page_id(), left_parent_id);
        let (mut parent, _) = BPlusTreeInternalPageCodec::decode(parent_guard.data(), self.comparator)?;
        parent.insert_node_after(left_id, separator, right_id)?;

        if parent.header.current_size > parent.header.max_size {
            let new_ref = self.buffer_pool.new_page()?;
            let mut new_sibling = BPlusTreeInternalPage::new(
                new_ref.page_id(),
                parent.header.parent_page_id,
                self.internal_max_size,
                self.comparator,
            );
            parent.move_half_to(&mut new_sibling, &self.buffer_pool)?;
            // The pushed-up separator is the right node's entry-0 key,
            // which stays in place as the ignored sentinel.
            let parent_separator = new_sibling.key_at(0).to_vec();
            self.insert_into_parent(
                parent_guard,
                BPlusTreePage::Internal(parent),
                parent_separator,
                new_ref,
                BPlusTreePage::Internal(new_sibling),
                txn,
            )?;
        } else {
            parent_guard.overwrite(&BPlusTreeInternalPageCodec::encode(&parent));
        }
        Ok(())
    }

    /// Restores the minimum-occupancy invariant for an underflowing node:
    /// borrow from a sibling when one is above minimum, merge otherwise.
    /// Returns `true` when `node` has been emptied and must be deleted by
    /// the caller.
    fn coalesce_or_redistribute(
        &self,
        node_guard: WritePageGuard,
        node_page: BPlusTreePage,
        txn: &mut Transaction,
    ) -> VellumResult<bool> {
        if node_page.current_size() >= node_page.min_size() {
            return Ok(false);
        }
        if node_page.is_root() {
            debug_assert!(txn.page_set_is_empty());
            return self.adjust_root(node_guard, node_page);
        }

        let Some(PageGuard::Write(mut parent_guard)) = txn.pop_page_set() else {
            return Err(VellumError::Internal(
                "underflow repair without a latched parent".to_string(),
            ));
        };
        let (mut parent, _) = BPlusTreeInternalPageCodec::decode(parent_guard.data(), self.comparator)?;
        let node_id = node_guard.page_id();
        let node_index = parent.value_index(node_id).ok_or_else(|| {
            VellumError::Internal(format!(
                "underflowing page {} missing from parent {}",
                node_id,
                parent_guard.page_id()
            ))
        })?;

        // Prefer borrowing from the left sibling.
        let mut left: Option<(WritePageGuard, BPlusTreePage)> = None;
        if node_index >= 1 {
            let left_id = parent.value_at(node_index - 1);
            let left_guard = self.buffer_pool.fetch_page_write(left_id)?;
            let (left_page, _) = BPlusTreePageCodec::decode(left_guard.data(), self.comparator)?;
            if left_page.current_size() > left_page.min_size() {
                self.redistribute(left_guard, left_page, node_guard, node_page, &mut parent, true)?;
                parent_guard.overwrite(&BPlusTreeInternalPageCodec::encode(&parent));
                return Ok(false);
            }
            left = Some((left_guard, left_page));
        }

        // Then from the right sibling.
        let mut right: Option<(WritePageGuard, BPlusTreePage)> = None;
        if node_index + 1 < parent.header.current_size as usize {
            let right_id = parent.value_at(node_index + 1);
            let right_guard = self.buffer_pool.fetch_page_write(right_id)?;
            let (right_page, _) = BPlusTreePageCodec::decode(right_guard.data(), self.comparator)?;
            if right_page.current_size() > right_page.min_size() {
                drop(left);
                self.redistribute(
                    right_guard,
                    right_page,
                    node_guard,
                    node_page,
                    &mut parent,
                    false,
                )?;
                parent_guard.overwrite(&BPlusTreeInternalPageCodec::encode(&parent));
                return Ok(false);
            }
            right = Some((right_guard, right_page));
        }

        // Neither sibling can lend: merge. The right-hand page of the pair
        // always folds into the left-hand one, so the leaf chain never
        // points at a deleted page.
        let mut node_page = node_page;
        let node_deleted;
        if let Some((mut left_guard, mut left_page)) = left {
            drop(right);
            let middle_key = parent.key_at(node_index).to_vec();
            match (&mut left_page, &mut node_page) {
                (BPlusTreePage::Leaf(left_leaf), BPlusTreePage::Leaf(node_leaf)) => {
                    node_leaf.move_all_to(left_leaf);
                }
                (BPlusTreePage::Internal(left_internal), BPlusTreePage::Internal(node_internal)) => {
                    node_internal.move_all_to(left_internal, middle_key, &self.buffer_pool)?;
                }
                _ => {
                    return Err(VellumError::Internal(
                        "sibling node kinds disagree".to_string(),
                    ))
                }
            }
            parent.remove(node_index);
            left_guard.overwrite(&BPlusTreePageCodec::encode(&left_page));
            drop(left_guard);
            drop(node_guard);
            node_deleted = true;
        } else if let Some((mut right_guard, mut right_page)) = right {
            // Leftmost child: absorb the right sibling instead and retire
            // that page here.
            let right_index = node_index + 1;
            let right_id = right_guard.page_id();
            let middle_key = parent.key_at(right_index).to_vec();
            let mut node_guard = node_guard;
            match (&mut node_page, &mut right_page) {
                (BPlusTreePage::Leaf(node_leaf), BPlusTreePage::Leaf(right_leaf)) => {
                    right_leaf.move_all_to(node_leaf);
                }
                (BPlusTreePage::Internal(node_internal), BPlusTreePage::Internal(right_internal)) => {
                    right_internal.move_all_to(node_internal, middle_key, &self.buffer_pool)?;
                }
                _ => {
                    return Err(VellumError::Internal(
                        "sibling node kinds disagree".to_string(),
                    ))
                }
            }
            parent.remove(right_index);
            node_guard.overwrite(&BPlusTreePageCodec::encode(&node_page));
            drop(right_guard);
            drop(node_guard);
            txn.add_into_deleted_page_set(right_id);
            node_deleted = false;
        } else {
            return Err(VellumError::Internal(
                "underflowing non-root node has no siblings".to_string(),
            ));
        }

        parent_guard.overwrite(&BPlusTreeInternalPageCodec::encode(&parent));
        let parent_id = parent_guard.page_id();
        let parent_deleted =
            self.coalesce_or_redistribute(parent_guard, BPlusTreePage::Internal(parent), txn)?;
        if parent_deleted {
            txn.add_into_deleted_page_set(parent_id);
        }
        Ok(node_deleted)
    }

    /// Rotates one entry from `neighbor` into `node`. Separator upkeep in
    /// the parent happens inside the move primitives, where both nodes and
    /// the parent are all under write latches.
    fn redistribute(
        &self,
        mut neighbor_guard: WritePageGuard,
        mut neighbor_page: BPlusTreePage,
        mut node_guard: WritePageGuard,
        mut node_page: BPlusTreePage,
        parent: &mut BPlusTreeInternalPage,
        neighbor_is_left: bool,
    ) -> VellumResult<()> {
        match (&mut neighbor_page, &mut node_page) {
            (BPlusTreePage::Leaf(neighbor_leaf), BPlusTreePage::Leaf(node_leaf)) => {
                if neighbor_is_left {
                    neighbor_leaf.move_last_to_front_of(node_leaf, parent)?;
                } else {
                    neighbor_leaf.move_first_to_end_of(node_leaf, parent)?;
                }
            }
            (BPlusTreePage::Internal(neighbor_internal), BPlusTreePage::Internal(node_internal)) => {
                if neighbor_is_left {
                    let node_index = parent
                        .value_index(node_internal.header.page_id)
                        .ok_or_else(|| {
                            VellumError::Internal("node missing from its parent".to_string())
                        })?;
                    neighbor_internal.move_last_to_front_of(
                        node_internal,
                        node_index,
                        parent,
                        &self.buffer_pool,
                    )?;
                } else {
                    neighbor_internal.move_first_to_end_of(
                        node_internal,
                        parent,
                        &self.buffer_pool,
                    )?;
                }
            }
            _ => {
                return Err(VellumError::Internal(
                    "sibling node kinds disagree".to_string(),
                ))
            }
        }
        neighbor_guard.overwrite(&BPlusTreePageCodec::encode(&neighbor_page));
        node_guard.overwrite(&BPlusTreePageCodec::encode(&node_page));
        Ok(())
    }

    /// Shrinks the tree at the top: an empty leaf root empties the whole
    /// tree, an internal root with a single child hands the root over to
    /// that child. Returns `true` when the old root must be deleted.
    fn adjust_root(
        &self,
        root_guard: WritePageGuard,
        root_page: BPlusTreePage,
    ) -> VellumResult<bool> {
        match root_page {
            BPlusTreePage::Leaf(leaf) => {
                if leaf.header.current_size == 0 {
                    self.root_page_id
                        .store(INVALID_PAGE_ID, AtomicOrdering::SeqCst);
                    self.update_root_page_id(false)?;
                    debug!("last key removed, tree is now empty");
                    drop(root_guard);
                    return Ok(true);
                }
                Ok(false)
            }
            BPlusTreePage::Internal(internal) => {
                if internal.header.current_size == 1 {
                    let child_id = internal.value_at(0);
                    {
                        let mut child_guard = self.buffer_pool.fetch_page_write(child_id)?;
                        let (mut child, _) =
                            BPlusTreePageCodec::decode(child_guard.data(), self.comparator)?;
                        child.set_parent_page_id(INVALID_PAGE_ID);
                        child_guard.overwrite(&BPlusTreePageCodec::encode(&child));
                    }
                    self.root_page_id.store(child_id, AtomicOrdering::SeqCst);
                    self.update_root_page_id(false)?;
                    debug!("promoted page {} to root", child_id);
                    drop(root_guard);
                    return Ok(true);
                }
                Ok(false)
            }
        }
    }

    /// Persists the current root id under the index name. The first
    /// installation inserts the header record, later changes update it.
    fn update_root_page_id(&self, insert_record: bool) -> VellumResult<()> {
        let root_page_id = self.root_page_id.load(AtomicOrdering::SeqCst);
        let mut guard = self.buffer_pool.fetch_page_write(HEADER_PAGE_ID)?;
        let (mut header, _) = HeaderPageCodec::decode(guard.data())?;
        let applied = if insert_record {
            header.insert_record(&self.index_name, root_page_id)
                || header.update_record(&self.index_name, root_page_id)
        } else {
            header.update_record(&self.index_name, root_page_id)
                || header.insert_record(&self.index_name, root_page_id)
        };
        if !applied {
            return Err(VellumError::Internal(format!(
                "failed to persist root of index {}",
                self.index_name
            )));
        }
        guard.overwrite(&HeaderPageCodec::encode(&header));
        Ok(())
    }

    /// Bulk-loads whitespace-separated i64 keys from a file; test support.
    pub fn insert_from_file(&self, path: impl AsRef<Path>) -> VellumResult<()> {
        let file = File::open(path)?;
        for line in BufReader::new(file).lines() {
            for token in line?.split_whitespace() {
                let key = token.parse::<i64>().map_err(|e| {
                    VellumError::Internal(format!("invalid key {:?}: {}", token, e))
                })?;
                self.insert(
                    &CommonCodec::encode_i64(key),
                    RecordId::new(key as u32, key as u32),
                )?;
            }
        }
        Ok(())
    }

    /// Removes whitespace-separated i64 keys listed in a file; test support.
    pub fn remove_from_file(&self, path: impl AsRef<Path>) -> VellumResult<()> {
        let file = File::open(path)?;
        for line in BufReader::new(file).lines() {
            for token in line?.split_whitespace() {
                let key = token.parse::<i64>().map_err(|e| {
                    VellumError::Internal(format!("invalid key {:?}: {}", token, e))
                })?;
                self.remove(&CommonCodec::encode_i64(key))?;
            }
        }
        Ok(())
    }

    /// Renders the tree level by level for debugging. Each node is fetched
    /// and unpinned exactly once.
    pub fn pretty_format(&self) -> VellumResult<String> {
        let root_page_id = self.root_page_id.load(AtomicOrdering::SeqCst);
        if root_page_id == INVALID_PAGE_ID {
            return Ok("Empty tree".to_string());
        }

        let mut out = String::new();
        let mut level = vec![root_page_id];
        while !level.is_empty() {
            let mut next_level = Vec::new();
            for page_id in level {
                let guard = self.buffer_pool.fetch_page_read(page_id)?;
                let (page, _) = BPlusTreePageCodec::decode(guard.data(), self.comparator)?;
                match page {
                    BPlusTreePage::Internal(internal) => {
                        write!(out, "[{}:", page_id).unwrap();
                        for i in 1..internal.header.current_size as usize {
                            write!(out, " {}", format_key(internal.key_at(i))).unwrap();
                        }
                        write!(out, "] ").unwrap();
                        next_level.extend(internal.values());
                    }
                    BPlusTreePage::Leaf(leaf) => {
                        write!(out, "({}:", page_id).unwrap();
                        for i in 0..leaf.header.current_size as usize {
                            write!(out, " {}", format_key(leaf.key_at(i))).unwrap();
                        }
                        write!(out, ") ").unwrap();
                    }
                }
            }
            out.push('\n');
            level = next_level;
        }
        Ok(out)
    }

    /// Walks the whole tree checking the structural invariants: occupancy
    /// bounds off the root, separator-consistent key ranges, parent links,
    /// uniform leaf depth, and an ordered leaf chain covering every leaf.
    /// Test support; not safe against concurrent writers.
    pub fn verify_integrity(&self) -> VellumResult<()> {
        let root_page_id = self.root_page_id.load(AtomicOrdering::SeqCst);
        if root_page_id == INVALID_PAGE_ID {
            return Ok(());
        }

        let mut leaves = Vec::new();
        let mut leaf_depth = None;
        self.verify_node(
            root_page_id,
            INVALID_PAGE_ID,
            None,
            None,
            0,
            &mut leaf_depth,
            &mut leaves,
        )?;

        // The chain from the leftmost leaf must visit exactly the leaves
        // found by the in-order walk, with keys globally ascending.
        let mut chained = Vec::new();
        let mut page_id = *leaves.first().expect("non-empty tree has a leaf");
        let mut prev_key: Option<Vec<u8>> = None;
        while page_id != INVALID_PAGE_ID {
            chained.push(page_id);
            let guard = self.buffer_pool.fetch_page_read(page_id)?;
            let (leaf, _) = BPlusTreeLeafPageCodec::decode(guard.data(), self.comparator)?;
            for (key, _) in leaf.array.iter() {
                if let Some(prev) = &prev_key {
                    if (self.comparator)(prev, key) != std::cmp::Ordering::Less {
                        return Err(VellumError::Internal(format!(
                            "leaf chain keys not ascending at page {}",
                            page_id
                        )));
                    }
                }
                prev_key = Some(key.clone());
            }
            page_id = leaf.header.next_page_id;
        }
        if chained != leaves {
            return Err(VellumError::Internal(
                "leaf chain disagrees with tree order".to_string(),
            ));
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn verify_node(
        &self,
        page_id: PageId,
        expected_parent: PageId,
        lower: Option<&[u8]>,
        upper: Option<&[u8]>,
        depth: usize,
        leaf_depth: &mut Option<usize>,
        leaves: &mut Vec<PageId>,
    ) -> VellumResult<()> {
        let page = {
            let guard = self.buffer_pool.fetch_page_read(page_id)?;
            let (page, _) = BPlusTreePageCodec::decode(guard.data(), self.comparator)?;
            page
        };

        if page.page_id() != page_id {
            return Err(VellumError::Internal(format!(
                "page {} recorded as {}",
                page_id,
                page.page_id()
            )));
        }
        if page.parent_page_id() != expected_parent {
            return Err(VellumError::Internal(format!(
                "page {} has parent {} but is referenced by {}",
                page_id,
                page.parent_page_id(),
                expected_parent
            )));
        }
        let is_root = expected_parent == INVALID_PAGE_ID;
        if !is_root
            && (page.current_size() < page.min_size() || page.current_size() > page.max_size())
        {
            return Err(VellumError::Internal(format!(
                "page {} occupancy {} outside [{}, {}]",
                page_id,
                page.current_size(),
                page.min_size(),
                page.max_size()
            )));
        }

        let in_range = |key: &[u8]| -> bool {
            let above = lower
                .map(|low| (self.comparator)(low, key) != std::cmp::Ordering::Greater)
                .unwrap_or(true);
            let below = upper
                .map(|up| (self.comparator)(key, up) == std::cmp::Ordering::Less)
                .unwrap_or(true);
            above && below
        };

        match page {
            BPlusTreePage::Leaf(leaf) => {
                match leaf_depth {
                    Some(expected) => {
                        if *expected != depth {
                            return Err(VellumError::Internal(format!(
                                "leaf {} at depth {} but expected {}",
                                page_id, depth, expected
                            )));
                        }
                    }
                    None => *leaf_depth = Some(depth),
                }
                for window in leaf.array.windows(2) {
                    if (self.comparator)(&window[0].0, &window[1].0) != std::cmp::Ordering::Less {
                        return Err(VellumError::Internal(format!(
                            "leaf {} keys not strictly ascending",
                            page_id
                        )));
                    }
                }
                for (key, _) in leaf.array.iter() {
                    if !in_range(key) {
                        return Err(VellumError::Internal(format!(
                            "leaf {} holds a key outside its separator range",
                            page_id
                        )));
                    }
                }
                leaves.push(page_id);
            }
            BPlusTreePage::Internal(internal) => {
                let size = internal.header.current_size as usize;
                for i in 2..size {
                    if (self.comparator)(internal.key_at(i - 1), internal.key_at(i))
                        != std::cmp::Ordering::Less
                    {
                        return Err(VellumError::Internal(format!(
                            "internal {} separators not strictly ascending",
                            page_id
                        )));
                    }
                }
                for i in 1..size {
                    if !in_range(internal.key_at(i)) {
                        return Err(VellumError::Internal(format!(
                            "internal {} separator outside its own range",
                            page_id
                        )));
                    }
                }
                for i in 0..size {
                    let child_lower = if i == 0 { lower } else { Some(internal.key_at(i)) };
                    let child_upper = if i + 1 < size {
                        Some(internal.key_at(i + 1))
                    } else {
                        upper
                    };
                    self.verify_node(
                        internal.value_at(i),
                        page_id,
                        child_lower,
                        child_upper,
                        depth + 1,
                        leaf_depth,
                        leaves,
                    )?;
                }
            }
        }
        Ok(())
    }
}

fn format_key(key: &[u8]) -> String {
    key.iter().map(|b| format!("{:02x}", b)).collect()
}
