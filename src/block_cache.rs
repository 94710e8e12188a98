//! Block cache, in which decoded table blocks are cached in-memory
//! after being retrieved from disk.
//!
//! Entries are keyed by `(table file number, block offset)` and weighted
//! by their decoded size, so the configured capacity bounds actual
//! memory use. One cache is shared by every table reader of a database.

use crate::table::block::Block;
use quick_cache::{sync::Cache, Weighter};
use std::sync::Arc;

type CacheKey = (u64, u64);

#[derive(Clone)]
struct BlockWeighter;

impl Weighter<CacheKey, Arc<Block>> for BlockWeighter {
    fn weight(&self, _: &CacheKey, block: &Arc<Block>) -> u32 {
        // NOTE: Truncation is fine: blocks are a few KiB
        #[allow(clippy::cast_possible_truncation)]
        let size = block.size() as u32;
        size.max(1)
    }
}

pub struct BlockCache {
    data: Cache<CacheKey, Arc<Block>, BlockWeighter>,
    capacity: u64,
}

impl BlockCache {
    /// Creates a cache holding roughly `bytes` worth of decoded blocks
    #[must_use]
    pub fn with_capacity_bytes(bytes: u64) -> Self {
        Self {
            data: Cache::with_weighter(10_000, bytes, BlockWeighter),
            capacity: bytes,
        }
    }

    /// Cache capacity in bytes
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Number of cached blocks
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn insert(&self, file_num: u64, offset: u64, block: Arc<Block>) {
        if self.capacity > 0 {
            self.data.insert((file_num, offset), block);
        }
    }

    #[must_use]
    pub(crate) fn get(&self, file_num: u64, offset: u64) -> Option<Arc<Block>> {
        self.data.get(&(file_num, offset))
    }
}
