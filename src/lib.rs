//! An embedded, single-host, ordered key-value storage engine built as a
//! leveled log-structured merge tree (LSM-tree).
//!
//! Writes go through a write-ahead journal into an in-memory sorted table
//! (memtable). Full memtables are rotated out and drained to immutable,
//! sorted on-disk tables (SSTs). A background task merges tables downward
//! through a small number of levels, reclaiming space occupied by
//! overwritten values and deletion tombstones.
//!
//! # Example usage
//!
//! ```
//! use silt::{Config, Lookup};
//! #
//! # let folder = tempfile::tempdir()?;
//!
//! let db = Config::new(folder).open()?;
//!
//! db.put(b"my_key", b"my_value")?;
//!
//! assert!(matches!(db.get(b"my_key")?, Lookup::Found(v) if &*v == b"my_value"));
//!
//! db.delete(b"my_key")?;
//! assert!(matches!(db.get(b"my_key")?, Lookup::Deleted));
//! #
//! # Ok::<(), silt::Error>(())
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::module_name_repetitions)]

mod batch;
mod block_cache;
mod bloom;
mod coding;
mod compaction;
mod config;
mod db;
mod error;
mod file;
mod iter;
mod journal;
mod key;
mod memtable;
mod merge;
mod storage;
mod table;
mod table_cache;
mod version;

pub use {
    batch::WriteBatch,
    block_cache::BlockCache,
    config::Config,
    db::{Db, DbIterator},
    error::{Error, Result},
    key::{Lookup, SeqNo, UserKey, UserValue, ValueType},
    storage::{FsStorage, Storage},
    table::CompressionType,
};
