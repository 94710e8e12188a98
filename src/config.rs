//! Database configuration.

use crate::{table::CompressionType, BlockCache, Db};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

/// Database configuration builder
#[derive(Clone)]
pub struct Config {
    /// Database folder path
    pub path: PathBuf,

    /// Memtable rotation threshold in bytes
    pub write_buffer_size: usize,

    /// Capacity of the open-table cache
    pub max_open_files: usize,

    /// Target size of data blocks inside tables
    pub block_size: usize,

    /// Entries between restart points inside a block
    pub block_restart_interval: usize,

    /// Level-0 file count that triggers compaction
    pub level0_compaction_trigger: usize,

    /// Level-0 file count at which writes get a 1 ms delay
    pub level0_slowdown_trigger: usize,

    /// Level-0 file count at which writes stall entirely
    pub level0_stop_trigger: usize,

    /// Compaction output files are cut at this size
    pub max_output_file_size: u64,

    /// The manifest is rewritten from a snapshot once it grows past this
    pub manifest_max_size: u64,

    /// Block compression
    pub compression: CompressionType,

    /// Bloom filter density; probes per key scale with this
    pub bloom_bits_per_key: usize,

    /// Shared block cache
    pub block_cache: Arc<BlockCache>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            path: ".silt.data".into(),
            write_buffer_size: 4 * 1_024 * 1_024,
            max_open_files: 1_000,
            block_size: 2 * 1_024,
            block_restart_interval: 16,
            level0_compaction_trigger: 4,
            level0_slowdown_trigger: 8,
            level0_stop_trigger: 12,
            max_output_file_size: 2 * 1_024 * 1_024,
            manifest_max_size: 64 * 1_024 * 1_024,
            compression: CompressionType::None,
            bloom_bits_per_key: 10,
            block_cache: Arc::new(BlockCache::with_capacity_bytes(16 * 1_024 * 1_024)),
        }
    }
}

impl Config {
    /// Initializes a new config pointing at a database folder
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().into(),
            ..Default::default()
        }
    }

    /// Sets the memtable rotation threshold.
    ///
    /// Defaults to 4 MiB.
    #[must_use]
    pub fn write_buffer_size(mut self, bytes: usize) -> Self {
        self.write_buffer_size = bytes;
        self
    }

    /// Sets the open-table cache capacity.
    ///
    /// Defaults to 1000.
    #[must_use]
    pub fn max_open_files(mut self, n: usize) -> Self {
        self.max_open_files = n;
        self
    }

    /// Sets the data block target size.
    ///
    /// Defaults to 2 KiB.
    ///
    /// # Panics
    ///
    /// Panics if the block size is smaller than 128 bytes.
    #[must_use]
    pub fn block_size(mut self, bytes: usize) -> Self {
        assert!(bytes >= 128);

        self.block_size = bytes;
        self
    }

    /// Sets the restart interval of block entries.
    ///
    /// Defaults to 16.
    ///
    /// # Panics
    ///
    /// Panics if `n` is 0.
    #[must_use]
    pub fn block_restart_interval(mut self, n: usize) -> Self {
        assert!(n > 0);

        self.block_restart_interval = n;
        self
    }

    /// Sets the compaction output file size.
    ///
    /// Defaults to 2 MiB.
    #[must_use]
    pub fn max_output_file_size(mut self, bytes: u64) -> Self {
        self.max_output_file_size = bytes;
        self
    }

    /// Sets the block compression.
    ///
    /// Defaults to [`CompressionType::None`].
    #[must_use]
    pub fn compression(mut self, compression: CompressionType) -> Self {
        self.compression = compression;
        self
    }

    /// Sets the bloom filter density in bits per key.
    ///
    /// Defaults to 10.
    #[must_use]
    pub fn bloom_bits_per_key(mut self, bits: usize) -> Self {
        self.bloom_bits_per_key = bits;
        self
    }

    /// Sets the block cache.
    ///
    /// A cache can be shared between databases to cap global memory
    /// usage. Defaults to 16 MiB of capacity per database.
    #[must_use]
    pub fn block_cache(mut self, block_cache: Arc<BlockCache>) -> Self {
        self.block_cache = block_cache;
        self
    }

    /// Opens the database using this config.
    ///
    /// # Errors
    ///
    /// Returns an error if the folder is locked by another process, a
    /// persistent structure is corrupt, or an I/O error occurs.
    pub fn open(self) -> crate::Result<Db> {
        Db::open(self)
    }
}
