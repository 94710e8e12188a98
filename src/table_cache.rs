//! Cache of open table readers, keyed by file number.
//!
//! Opening a table means a file open plus footer/index/filter reads, so
//! the handles are kept around up to `max_open_files`. Readers are
//! shared (`Arc`), so an evicted table stays usable by anyone still
//! iterating it.

use crate::{
    block_cache::BlockCache,
    file::{Fd, FileKind},
    storage::Storage,
    table::reader::Table,
};
use quick_cache::sync::Cache;
use std::sync::Arc;

pub struct TableCache {
    cache: Cache<u64, Arc<Table>>,
    storage: Arc<dyn Storage>,
    block_cache: Arc<BlockCache>,
}

impl TableCache {
    #[must_use]
    pub fn new(
        capacity: usize,
        storage: Arc<dyn Storage>,
        block_cache: Arc<BlockCache>,
    ) -> Self {
        Self {
            cache: Cache::new(capacity.max(1)),
            storage,
            block_cache,
        }
    }

    /// Returns an open reader for table `file_num`, opening and caching
    /// it on a miss
    pub fn get(&self, file_num: u64) -> crate::Result<Arc<Table>> {
        if let Some(table) = self.cache.get(&file_num) {
            return Ok(table);
        }

        let file = self
            .storage
            .open_random(Fd::new(FileKind::Table, file_num))?;

        let table = Arc::new(Table::open(
            file_num,
            file.into(),
            Arc::clone(&self.block_cache),
        )?);

        self.cache.insert(file_num, Arc::clone(&table));

        Ok(table)
    }
}
