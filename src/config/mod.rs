#[derive(Debug, Clone, Copy)]
pub struct BufferPoolConfig {
    pub buffer_pool_size: usize,
    pub lru_k_k: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        BufferPoolConfig {
            buffer_pool_size: 1000,
            lru_k_k: 2,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct IoSchedulerConfig {
    /// Number of I/O worker threads.
    pub workers: usize,
}

impl IoSchedulerConfig {
    pub fn default_workers() -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get().min(4))
            .unwrap_or(1)
    }
}

impl Default for IoSchedulerConfig {
    fn default() -> Self {
        IoSchedulerConfig {
            workers: Self::default_workers(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BTreeConfig {
    /// Max key/value entries a leaf page holds before it must split.
    pub leaf_max_size: u32,
    /// Max children an internal page holds before it must split.
    pub internal_max_size: u32,
}

impl Default for BTreeConfig {
    fn default() -> Self {
        BTreeConfig {
            leaf_max_size: 32,
            internal_max_size: 32,
        }
    }
}
