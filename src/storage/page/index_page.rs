use std::cmp::Ordering;

use crate::buffer::{BufferPoolManager, PageId, INVALID_PAGE_ID};
use crate::error::{VellumError, VellumResult};
use crate::index::comparator::KeyComparator;
use crate::storage::codec::BPlusTreePageCodec;
use crate::storage::page::RecordId;

pub type InternalKV = (Vec<u8>, PageId);
pub type LeafKV = (Vec<u8>, RecordId);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BPlusTreePageType {
    LeafPage,
    InternalPage,
}

/// Tagged view over the two node kinds of the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BPlusTreePage {
    Leaf(BPlusTreeLeafPage),
    Internal(BPlusTreeInternalPage),
}

impl BPlusTreePage {
    pub fn is_leaf(&self) -> bool {
        matches!(self, Self::Leaf(_))
    }

    pub fn page_id(&self) -> PageId {
        match self {
            Self::Leaf(page) => page.header.page_id,
            Self::Internal(page) => page.header.page_id,
        }
    }

    pub fn parent_page_id(&self) -> PageId {
        match self {
            Self::Leaf(page) => page.header.parent_page_id,
            Self::Internal(page) => page.header.parent_page_id,
        }
    }

    pub fn set_parent_page_id(&mut self, parent_page_id: PageId) {
        match self {
            Self::Leaf(page) => page.header.parent_page_id = parent_page_id,
            Self::Internal(page) => page.header.parent_page_id = parent_page_id,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent_page_id() == INVALID_PAGE_ID
    }

    pub fn current_size(&self) -> u32 {
        match self {
            Self::Leaf(page) => page.header.current_size,
            Self::Internal(page) => page.header.current_size,
        }
    }

    pub fn max_size(&self) -> u32 {
        match self {
            Self::Leaf(page) => page.header.max_size,
            Self::Internal(page) => page.header.max_size,
        }
    }

    pub fn min_size(&self) -> u32 {
        self.max_size().div_ceil(2)
    }
}

/**
 * Leaf page format (keys stored in increasing order):
 *  ---------------------------------------------------------------------
 * | HEADER | KEY(1) + RID(1) | KEY(2) + RID(2) | ... | KEY(n) + RID(n) |
 *  ---------------------------------------------------------------------
 *
 * Header (21 bytes):
 *  ---------------------------------------------------------------------
 * | PageType (1) | CurrentSize (4) | MaxSize (4) | ParentPageId (4)
 * | PageId (4) | NextPageId (4) |
 *  ---------------------------------------------------------------------
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BPlusTreeLeafPage {
    pub header: BPlusTreeLeafPageHeader,
    pub array: Vec<LeafKV>,
    pub comparator: KeyComparator,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BPlusTreeLeafPageHeader {
    pub page_type: BPlusTreePageType,
    pub current_size: u32,
    pub max_size: u32,
    pub parent_page_id: PageId,
    pub page_id: PageId,
    // Right sibling in the leaf chain.
    pub next_page_id: PageId,
}

impl BPlusTreeLeafPage {
    pub fn new(
        page_id: PageId,
        parent_page_id: PageId,
        max_size: u32,
        comparator: KeyComparator,
    ) -> Self {
        Self {
            header: BPlusTreeLeafPageHeader {
                page_type: BPlusTreePageType::LeafPage,
                current_size: 0,
                max_size,
                parent_page_id,
                page_id,
                next_page_id: INVALID_PAGE_ID,
            },
            array: Vec::with_capacity(max_size as usize + 1),
            comparator,
        }
    }

    pub fn min_size(&self) -> u32 {
        self.header.max_size.div_ceil(2)
    }

    pub fn is_root(&self) -> bool {
        self.header.parent_page_id == INVALID_PAGE_ID
    }

    pub fn key_at(&self, index: usize) -> &[u8] {
        &self.array[index].0
    }

    pub fn kv_at(&self, index: usize) -> &LeafKV {
        &self.array[index]
    }

    /// First index whose key is `>=` the probe, i.e. the insertion position.
    pub fn key_index(&self, key: &[u8]) -> usize {
        self.array
            .partition_point(|(k, _)| (self.comparator)(k, key) == Ordering::Less)
    }

    pub fn look_up(&self, key: &[u8]) -> Option<RecordId> {
        let index = self.key_index(key);
        if index < self.array.len() && (self.comparator)(&self.array[index].0, key) == Ordering::Equal
        {
            Some(self.array[index].1)
        } else {
            None
        }
    }

    /// Inserts in key order; a duplicate key leaves the page unchanged
    /// (detected by the caller through the returned size).
    pub fn insert(&mut self, key: &[u8], rid: RecordId) -> u32 {
        let index = self.key_index(key);
        if index < self.array.len() && (self.comparator)(&self.array[index].0, key) == Ordering::Equal
        {
            return self.header.current_size;
        }
        self.array.insert(index, (key.to_vec(), rid));
        self.header.current_size += 1;
        self.header.current_size
    }

    /// Removes the key if present; absent keys are a no-op.
    pub fn remove_and_delete(&mut self, key: &[u8]) -> u32 {
        let index = self.key_index(key);
        if index < self.array.len() && (self.comparator)(&self.array[index].0, key) == Ordering::Equal
        {
            self.array.remove(index);
            self.header.current_size -= 1;
        }
        self.header.current_size
    }

    /// Moves the upper half of the entries into an empty right sibling and
    /// links the sibling into the leaf chain.
    pub fn move_half_to(&mut self, recipient: &mut Self) {
        debug_assert!(recipient.array.is_empty());
        let split_at = self.array.len().div_ceil(2);
        recipient.array = self.array.split_off(split_at);
        self.header.current_size = self.array.len() as u32;
        recipient.header.current_size = recipient.array.len() as u32;

        recipient.header.next_page_id = self.header.next_page_id;
        self.header.next_page_id = recipient.header.page_id;
    }

    /// Appends every entry to the left sibling during a merge; the sibling
    /// also inherits this page's next pointer, keeping the chain intact.
    pub fn move_all_to(&mut self, recipient: &mut Self) {
        debug_assert_eq!(recipient.header.next_page_id, self.header.page_id);
        recipient.array.append(&mut self.array);
        recipient.header.next_page_id = self.header.next_page_id;
        self.header.current_size = 0;
        recipient.header.current_size = recipient.array.len() as u32;
    }

    /// Rotates our first entry to the end of the left sibling and refreshes
    /// the parent separator for this page.
    pub fn move_first_to_end_of(
        &mut self,
        recipient: &mut Self,
        parent: &mut BPlusTreeInternalPage,
    ) -> VellumResult<()> {
        let kv = self.array.remove(0);
        recipient.array.push(kv);
        self.header.current_size -= 1;
        recipient.header.current_size += 1;

        let index = parent
            .value_index(self.header.page_id)
            .ok_or_else(|| VellumError::Internal("leaf missing from its parent".to_string()))?;
        parent.set_key_at(index, self.key_at(0).to_vec());
        Ok(())
    }

    /// Rotates our last entry to the front of the right sibling and
    /// refreshes the parent separator for that sibling.
    pub fn move_last_to_front_of(
        &mut self,
        recipient: &mut Self,
        parent: &mut BPlusTreeInternalPage,
    ) -> VellumResult<()> {
        let kv = self
            .array
            .pop()
            .ok_or_else(|| VellumError::Internal("rotating from an empty leaf".to_string()))?;
        let moved_key = kv.0.clone();
        recipient.array.insert(0, kv);
        self.header.current_size -= 1;
        recipient.header.current_size += 1;

        let index = parent
            .value_index(recipient.header.page_id)
            .ok_or_else(|| VellumError::Internal("leaf missing from its parent".to_string()))?;
        parent.set_key_at(index, moved_key);
        Ok(())
    }
}

/**
 * Internal page format (keys stored in increasing order):
 *  --------------------------------------------------------------------------
 * | HEADER | KEY(1)+PAGE_ID(1) | KEY(2)+PAGE_ID(2) | ... | KEY(n)+PAGE_ID(n) |
 *  --------------------------------------------------------------------------
 *
 * Entry 0's key is an unused sentinel: `n` children carry `n - 1` real
 * separators. `look_up` returns the greatest child whose separator is
 * `<=` the probe key.
 *
 * Header (17 bytes):
 *  ---------------------------------------------------------------------
 * | PageType (1) | CurrentSize (4) | MaxSize (4) | ParentPageId (4)
 * | PageId (4) |
 *  ---------------------------------------------------------------------
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BPlusTreeInternalPage {
    pub header: BPlusTreeInternalPageHeader,
    pub array: Vec<InternalKV>,
    pub comparator: KeyComparator,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BPlusTreeInternalPageHeader {
    pub page_type: BPlusTreePageType,
    pub current_size: u32,
    pub max_size: u32,
    pub parent_page_id: PageId,
    pub page_id: PageId,
}

impl BPlusTreeInternalPage {
    pub fn new(
        page_id: PageId,
        parent_page_id: PageId,
        max_size: u32,
        comparator: KeyComparator,
    ) -> Self {
        Self {
            header: BPlusTreeInternalPageHeader {
                page_type: BPlusTreePageType::InternalPage,
                current_size: 0,
                max_size,
                parent_page_id,
                page_id,
            },
            array: Vec::with_capacity(max_size as usize + 1),
            comparator,
        }
    }

    pub fn min_size(&self) -> u32 {
        self.header.max_size.div_ceil(2)
    }

    pub fn is_root(&self) -> bool {
        self.header.parent_page_id == INVALID_PAGE_ID
    }

    pub fn key_at(&self, index: usize) -> &[u8] {
        &self.array[index].0
    }

    pub fn set_key_at(&mut self, index: usize, key: Vec<u8>) {
        self.array[index].0 = key;
    }

    pub fn value_at(&self, index: usize) -> PageId {
        self.array[index].1
    }

    pub fn set_value_at(&mut self, index: usize, page_id: PageId) {
        self.array[index].1 = page_id;
    }

    pub fn values(&self) -> impl Iterator<Item = PageId> + '_ {
        self.array.iter().map(|(_, page_id)| *page_id)
    }

    /// Index of the entry whose child pointer equals `page_id`.
    pub fn value_index(&self, page_id: PageId) -> Option<usize> {
        self.array.iter().position(|(_, child)| *child == page_id)
    }

    /// Child covering `key`: the greatest child whose separator is `<=`
    /// the probe (entry 0 catches everything below the first separator).
    pub fn look_up(&self, key: &[u8]) -> PageId {
        debug_assert!(!self.array.is_empty());
        let below = self.array[1..]
            .partition_point(|(k, _)| (self.comparator)(k, key) != Ordering::Greater);
        self.array[below].1
    }

    /// Seeds a fresh root after the old root split: `[(sentinel, left),
    /// (key, right)]`.
    pub fn populate_new_root(&mut self, left_child: PageId, key: Vec<u8>, right_child: PageId) {
        debug_assert!(self.array.is_empty());
        self.array.push((Vec::new(), left_child));
        self.array.push((key, right_child));
        self.header.current_size = 2;
    }

    /// Inserts `(key, new_child)` immediately after the entry pointing at
    /// `old_child`.
    pub fn insert_node_after(
        &mut self,
        old_child: PageId,
        key: Vec<u8>,
        new_child: PageId,
    ) -> VellumResult<u32> {
        let index = self.value_index(old_child).ok_or_else(|| {
            VellumError::Internal(format!(
                "child {} not found in internal page {}",
                old_child, self.header.page_id
            ))
        })?;
        self.array.insert(index + 1, (key, new_child));
        self.header.current_size += 1;
        Ok(self.header.current_size)
    }

    pub fn remove(&mut self, index: usize) {
        self.array.remove(index);
        self.header.current_size -= 1;
    }

    /// Moves the upper half of the entries into an empty sibling and
    /// re-parents the moved children.
    pub fn move_half_to(
        &mut self,
        recipient: &mut Self,
        buffer_pool: &BufferPoolManager,
    ) -> VellumResult<()> {
        debug_assert!(recipient.array.is_empty());
        let split_at = self.array.len().div_ceil(2);
        recipient.array = self.array.split_off(split_at);
        self.header.current_size = self.array.len() as u32;
        recipient.header.current_size = recipient.array.len() as u32;

        for (_, child) in recipient.array.iter() {
            reparent(buffer_pool, *child, recipient.header.page_id, self.comparator)?;
        }
        Ok(())
    }

    /// Appends every entry to the left sibling during a merge. `middle_key`
    /// is the separator taken from the parent; it replaces this page's
    /// sentinel entry-0 key so it keeps partitioning the moved subtrees
    /// inside the merged node. Moved children are re-parented.
    pub fn move_all_to(
        &mut self,
        recipient: &mut Self,
        middle_key: Vec<u8>,
        buffer_pool: &BufferPoolManager,
    ) -> VellumResult<()> {
        let moved_children: Vec<PageId> = self.values().collect();

        let mut moved = std::mem::take(&mut self.array);
        moved[0].0 = middle_key;
        recipient.array.append(&mut moved);
        self.header.current_size = 0;
        recipient.header.current_size = recipient.array.len() as u32;

        for child in moved_children {
            reparent(buffer_pool, child, recipient.header.page_id, self.comparator)?;
        }
        Ok(())
    }

    /// Rotates our first entry (child) to the end of the left sibling: the
    /// parent separator for this page drops into the appended entry and is
    /// replaced by our next separator. The moved child is re-parented.
    pub fn move_first_to_end_of(
        &mut self,
        recipient: &mut Self,
        parent: &mut Self,
        buffer_pool: &BufferPoolManager,
    ) -> VellumResult<()> {
        let (_, child) = self.array.remove(0);
        self.header.current_size -= 1;

        let index = parent
            .value_index(self.header.page_id)
            .ok_or_else(|| VellumError::Internal("node missing from its parent".to_string()))?;
        let separator = parent.key_at(index).to_vec();
        recipient.array.push((separator, child));
        recipient.header.current_size += 1;
        parent.set_key_at(index, self.key_at(0).to_vec());

        reparent(buffer_pool, child, recipient.header.page_id, self.comparator)
    }

    /// Rotates our last entry (child) to the front of the right sibling:
    /// our last separator moves up into the parent and the old parent
    /// separator drops onto the sibling's former first child. The moved
    /// child is re-parented.
    pub fn move_last_to_front_of(
        &mut self,
        recipient: &mut Self,
        parent_index: usize,
        parent: &mut Self,
        buffer_pool: &BufferPoolManager,
    ) -> VellumResult<()> {
        let (last_key, child) = self
            .array
            .pop()
            .ok_or_else(|| VellumError::Internal("rotating from an empty node".to_string()))?;
        self.header.current_size -= 1;

        debug_assert_eq!(parent.value_at(parent_index), recipient.header.page_id);
        let separator = parent.key_at(parent_index).to_vec();
        recipient.array.insert(0, (last_key.clone(), child));
        recipient.set_key_at(1, separator);
        recipient.header.current_size += 1;
        parent.set_key_at(parent_index, last_key);

        reparent(buffer_pool, child, recipient.header.page_id, self.comparator)
    }
}

/// Rewrites a child's parent pointer through the buffer pool. Callers must
/// not hold a latch on the child.
fn reparent(
    buffer_pool: &BufferPoolManager,
    child_page_id: PageId,
    new_parent_id: PageId,
    comparator: KeyComparator,
) -> VellumResult<()> {
    let mut guard = buffer_pool.fetch_page_write(child_page_id)?;
    let (mut page, _) = BPlusTreePageCodec::decode(guard.data(), comparator)?;
    page.set_parent_page_id(new_parent_id);
    guard.overwrite(&BPlusTreePageCodec::encode(&page));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::comparator::default_comparator;

    fn key(i: i32) -> Vec<u8> {
        i.to_be_bytes().to_vec()
    }

    fn leaf(page_id: PageId, max_size: u32) -> BPlusTreeLeafPage {
        BPlusTreeLeafPage::new(page_id, INVALID_PAGE_ID, max_size, default_comparator)
    }

    fn internal(page_id: PageId, max_size: u32) -> BPlusTreeInternalPage {
        BPlusTreeInternalPage::new(page_id, INVALID_PAGE_ID, max_size, default_comparator)
    }

    #[test]
    fn leaf_insert_keeps_order_and_rejects_duplicates() {
        let mut page = leaf(2, 4);
        assert_eq!(page.insert(&key(2), RecordId::new(2, 2)), 1);
        assert_eq!(page.insert(&key(1), RecordId::new(1, 1)), 2);
        assert_eq!(page.insert(&key(3), RecordId::new(3, 3)), 3);
        // Duplicate: size unchanged.
        assert_eq!(page.insert(&key(2), RecordId::new(9, 9)), 3);

        assert_eq!(page.key_at(0), key(1).as_slice());
        assert_eq!(page.key_at(1), key(2).as_slice());
        assert_eq!(page.key_at(2), key(3).as_slice());
        assert_eq!(page.look_up(&key(2)), Some(RecordId::new(2, 2)));
        assert_eq!(page.look_up(&key(4)), None);
    }

    #[test]
    fn leaf_key_index_is_insertion_position() {
        let mut page = leaf(2, 4);
        page.insert(&key(10), RecordId::new(10, 0));
        page.insert(&key(20), RecordId::new(20, 0));
        page.insert(&key(30), RecordId::new(30, 0));

        assert_eq!(page.key_index(&key(5)), 0);
        assert_eq!(page.key_index(&key(10)), 0);
        assert_eq!(page.key_index(&key(15)), 1);
        assert_eq!(page.key_index(&key(30)), 2);
        assert_eq!(page.key_index(&key(31)), 3);
    }

    #[test]
    fn leaf_remove_is_noop_for_absent_keys() {
        let mut page = leaf(2, 4);
        page.insert(&key(1), RecordId::new(1, 0));
        page.insert(&key(2), RecordId::new(2, 0));

        assert_eq!(page.remove_and_delete(&key(3)), 2);
        assert_eq!(page.remove_and_delete(&key(1)), 1);
        assert_eq!(page.remove_and_delete(&key(1)), 1);
        assert_eq!(page.look_up(&key(2)), Some(RecordId::new(2, 0)));
    }

    #[test]
    fn leaf_move_half_links_sibling_chain() {
        let mut left = leaf(2, 4);
        left.header.next_page_id = 9;
        for i in 1..=5 {
            left.insert(&key(i), RecordId::new(i as u32, 0));
        }
        let mut right = leaf(3, 4);
        left.move_half_to(&mut right);

        assert_eq!(left.header.current_size, 3);
        assert_eq!(right.header.current_size, 2);
        assert_eq!(left.header.next_page_id, 3);
        assert_eq!(right.header.next_page_id, 9);
        assert_eq!(right.key_at(0), key(4).as_slice());
    }

    #[test]
    fn leaf_rotations_maintain_parent_separator() {
        // parent: [(sentinel, 2), (k3, 3)] over leaves 2 = [1,2] and 3 = [3,4,5]
        let mut parent = internal(10, 5);
        parent.populate_new_root(2, key(3), 3);

        let mut left = leaf(2, 4);
        left.insert(&key(1), RecordId::new(1, 0));
        left.insert(&key(2), RecordId::new(2, 0));
        let mut right = leaf(3, 4);
        for i in 3..=5 {
            right.insert(&key(i), RecordId::new(i as u32, 0));
        }

        // Borrow right's first entry into left.
        right.move_first_to_end_of(&mut left, &mut parent).unwrap();
        assert_eq!(left.header.current_size, 3);
        assert_eq!(right.header.current_size, 2);
        assert_eq!(parent.key_at(1), key(4).as_slice());

        // Rotate it back.
        left.move_last_to_front_of(&mut right, &mut parent).unwrap();
        assert_eq!(left.header.current_size, 2);
        assert_eq!(right.header.current_size, 3);
        assert_eq!(parent.key_at(1), key(3).as_slice());
    }

    #[test]
    fn leaf_move_all_to_left_sibling_fixes_chain() {
        let mut left = leaf(2, 4);
        left.header.next_page_id = 3;
        left.insert(&key(1), RecordId::new(1, 0));
        left.insert(&key(2), RecordId::new(2, 0));

        let mut right = leaf(3, 4);
        right.header.next_page_id = 7;
        right.insert(&key(3), RecordId::new(3, 0));

        right.move_all_to(&mut left);
        assert_eq!(left.header.current_size, 3);
        assert_eq!(right.header.current_size, 0);
        assert_eq!(left.header.next_page_id, 7);
        assert_eq!(left.key_at(2), key(3).as_slice());
    }

    #[test]
    fn internal_look_up_routes_on_separators() {
        let mut page = internal(10, 5);
        page.populate_new_root(1, key(10), 2);
        page.insert_node_after(2, key(20), 3).unwrap();
        page.insert_node_after(3, key(30), 4).unwrap();

        assert_eq!(page.look_up(&key(5)), 1);
        // Equal keys route right: a separator is the minimum of its subtree.
        assert_eq!(page.look_up(&key(10)), 2);
        assert_eq!(page.look_up(&key(19)), 2);
        assert_eq!(page.look_up(&key(30)), 4);
        assert_eq!(page.look_up(&key(99)), 4);
    }

    #[test]
    fn internal_insert_node_after_and_remove() {
        let mut page = internal(10, 5);
        page.populate_new_root(1, key(10), 2);
        assert_eq!(page.insert_node_after(1, key(5), 7).unwrap(), 3);

        assert_eq!(page.value_at(0), 1);
        assert_eq!(page.value_at(1), 7);
        assert_eq!(page.value_at(2), 2);
        assert_eq!(page.key_at(1), key(5).as_slice());

        page.remove(1);
        assert_eq!(page.header.current_size, 2);
        assert_eq!(page.value_index(7), None);
        assert_eq!(page.value_index(2), Some(1));
    }
}
