use std::collections::{HashMap, VecDeque};

use super::Replacer;
use crate::buffer::FrameId;
use crate::error::{VellumError, VellumResult};

#[derive(Debug)]
struct LruKNode {
    k: usize,
    // Timestamps of the last k accesses, oldest first.
    history: VecDeque<u64>,
    is_evictable: bool,
}

impl LruKNode {
    fn new(k: usize) -> Self {
        Self {
            k,
            history: VecDeque::new(),
            is_evictable: false,
        }
    }

    fn record_access(&mut self, timestamp: u64) {
        self.history.push_back(timestamp);
        if self.history.len() > self.k {
            self.history.pop_front();
        }
    }
}

/// LRU-K replacer: evicts the evictable frame with the largest backward
/// k-distance. Frames with fewer than k recorded accesses have infinite
/// distance and are evicted first, oldest access first.
#[derive(Debug)]
pub struct LruKReplacer {
    current_size: usize,
    replacer_size: usize,
    k: usize,
    node_store: HashMap<FrameId, LruKNode>,
    current_timestamp: u64,
}

impl LruKReplacer {
    pub fn with_k(num_frames: usize, k: usize) -> Self {
        Self {
            current_size: 0,
            replacer_size: num_frames,
            k,
            node_store: HashMap::with_capacity(num_frames),
            current_timestamp: 0,
        }
    }
}

impl Replacer for LruKReplacer {
    fn new(capacity: usize) -> Self {
        const DEFAULT_K: usize = 2;
        Self::with_k(capacity, DEFAULT_K)
    }

    fn evict(&mut self) -> Option<FrameId> {
        let mut max_k_distance = 0;
        let mut result = None;
        for (frame_id, node) in self.node_store.iter() {
            if !node.is_evictable {
                continue;
            }
            let k_distance = if node.history.len() < self.k {
                u64::MAX - node.history.front().copied().unwrap_or(0)
            } else {
                self.current_timestamp - node.history.front().copied().unwrap_or(0)
            };
            if k_distance > max_k_distance {
                max_k_distance = k_distance;
                result = Some(*frame_id);
            }
        }
        if let Some(frame_id) = result {
            self.remove(frame_id);
        }
        result
    }

    fn record_access(&mut self, frame_id: FrameId) -> VellumResult<()> {
        if let Some(node) = self.node_store.get_mut(&frame_id) {
            node.record_access(self.current_timestamp);
        } else {
            if self.node_store.len() >= self.replacer_size {
                return Err(VellumError::Internal(format!(
                    "frame {} exceeds replacer capacity {}",
                    frame_id, self.replacer_size
                )));
            }
            let mut node = LruKNode::new(self.k);
            node.record_access(self.current_timestamp);
            self.node_store.insert(frame_id, node);
        }
        self.current_timestamp += 1;
        Ok(())
    }

    fn set_evictable(&mut self, frame_id: FrameId, set_evictable: bool) -> VellumResult<()> {
        let Some(node) = self.node_store.get_mut(&frame_id) else {
            return Err(VellumError::Internal(format!(
                "frame {} not tracked by replacer",
                frame_id
            )));
        };
        let was_evictable = node.is_evictable;
        node.is_evictable = set_evictable;
        if set_evictable && !was_evictable {
            self.current_size += 1;
        } else if !set_evictable && was_evictable {
            self.current_size -= 1;
        }
        Ok(())
    }

    fn remove(&mut self, frame_id: FrameId) {
        if let Some(node) = self.node_store.get(&frame_id) {
            assert!(node.is_evictable, "cannot remove a pinned frame");
            self.node_store.remove(&frame_id);
            self.current_size -= 1;
        }
    }

    fn size(&self) -> usize {
        self.current_size
    }
}
