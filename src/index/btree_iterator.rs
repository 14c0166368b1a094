use std::sync::Arc;

use crate::buffer::{BufferPoolManager, PageId, INVALID_PAGE_ID};
use crate::error::VellumResult;
use crate::index::comparator::KeyComparator;
use crate::storage::codec::BPlusTreeLeafPageCodec;
use crate::storage::page::{LeafKV, RecordId};

/// Ordered cursor over the leaf chain. Holds only `(page_id, index)`
/// between steps: each `next` pins and read-latches the current leaf,
/// copies one entry out, and releases the leaf again before following the
/// chain. At most one leaf is pinned at any time, and the latch is never
/// held while fetching the next leaf.
pub struct IndexIterator {
    buffer_pool: Arc<BufferPoolManager>,
    comparator: KeyComparator,
    page_id: PageId,
    index: usize,
}

impl IndexIterator {
    pub(crate) fn new(
        buffer_pool: Arc<BufferPoolManager>,
        comparator: KeyComparator,
        page_id: PageId,
        index: usize,
    ) -> Self {
        Self {
            buffer_pool,
            comparator,
            page_id,
            index,
        }
    }

    pub(crate) fn end(buffer_pool: Arc<BufferPoolManager>, comparator: KeyComparator) -> Self {
        Self::new(buffer_pool, comparator, INVALID_PAGE_ID, 0)
    }

    pub fn is_end(&self) -> bool {
        self.page_id == INVALID_PAGE_ID
    }

    /// Yields the next `(key, record id)` pair, or `None` past the last
    /// entry of the rightmost leaf.
    pub fn next(&mut self) -> VellumResult<Option<LeafKV>> {
        loop {
            if self.page_id == INVALID_PAGE_ID {
                return Ok(None);
            }
            let guard = self.buffer_pool.fetch_page_read(self.page_id)?;
            let (leaf, _) = BPlusTreeLeafPageCodec::decode(guard.data(), self.comparator)?;

            if self.index < leaf.array.len() {
                let kv = leaf.array[self.index].clone();
                self.index += 1;
                return Ok(Some(kv));
            }

            // Exhausted this leaf: release it, then follow the chain.
            let next_page_id = leaf.header.next_page_id;
            drop(guard);
            self.page_id = next_page_id;
            self.index = 0;
        }
    }

    /// Convenience wrapper collecting the remaining entries.
    pub fn collect_remaining(&mut self) -> VellumResult<Vec<(Vec<u8>, RecordId)>> {
        let mut out = Vec::new();
        while let Some(kv) = self.next()? {
            out.push(kv);
        }
        Ok(out)
    }
}
