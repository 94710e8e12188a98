//! The database object: ties the write pipeline, the memtables, the
//! version set and the background compaction together.

mod compact;
mod iter;
mod recover;
mod write;

pub use iter::DbIterator;

use crate::{
    batch::{BatchVisitor, WriteBatch},
    config::Config,
    file::{Fd, FileKind},
    journal,
    key::{Lookup, SeqNo, ValueType},
    memtable::MemTable,
    storage::{FileLock, Storage},
    table_cache::TableCache,
    version::VersionSet,
};
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering::Acquire, Ordering::Release},
        Arc, Condvar, Mutex, RwLock,
    },
};

/// Everything guarded by the engine mutex
pub(crate) struct DbState {
    /// Active memtable receiving writes
    pub(crate) mem: Arc<RwLock<MemTable>>,

    /// Rotated memtable waiting to be flushed to level 0
    pub(crate) imm: Option<Arc<RwLock<MemTable>>>,

    pub(crate) versions: VersionSet,

    /// Writer for the active journal; taken out briefly by the commit
    /// leader while appending
    pub(crate) journal: Option<journal::Writer>,

    /// File number of the active journal
    pub(crate) journal_num: u64,

    /// Last sequence number at the most recent memtable rotation; the
    /// flush edit records it
    pub(crate) frozen_seqno: SeqNo,

    /// Last assigned sequence number
    pub(crate) last_seqno: SeqNo,

    /// FIFO queue of pending writers; the head is the commit leader
    pub(crate) writers: VecDeque<Arc<write::PendingWriter>>,

    /// Whether a background compaction is scheduled or running
    pub(crate) bg_scheduled: bool,

    /// Handle of the most recently spawned background thread, joined on
    /// close so shutdown is conclusive
    pub(crate) bg_handle: Option<std::thread::JoinHandle<()>>,

    /// Sticky background error; once set, writes fail until reopen
    pub(crate) bg_error: Option<crate::Error>,
}

impl DbState {
    pub(crate) fn record_background_error(&mut self, e: &crate::Error) {
        if self.bg_error.is_none() {
            log::error!("background error: {e:?}");
            self.bg_error = Some(e.clone());
        }
    }
}

pub(crate) struct DbInner {
    pub(crate) config: Config,
    pub(crate) storage: Arc<dyn Storage>,
    pub(crate) table_cache: Arc<TableCache>,
    pub(crate) state: Mutex<DbState>,

    /// Signalled whenever background work completes, waking writers
    /// stalled on rotation room and waiters in `flush`/`close`
    pub(crate) bg_work_finished: Condvar,

    pub(crate) shutdown: AtomicBool,

    _lock: Box<dyn FileLock>,
}

impl DbInner {
    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Acquire)
    }
}

/// An embedded ordered key-value store.
///
/// All operations are thread-safe behind a shared reference; wrap the
/// database in an [`Arc`] to share it across threads.
pub struct Db {
    inner: Arc<DbInner>,
}

impl Db {
    /// Opens (or creates) the database described by `config`, using the
    /// host filesystem
    pub fn open(config: Config) -> crate::Result<Self> {
        let storage: Arc<dyn Storage> =
            Arc::new(crate::storage::FsStorage::open(&config.path)?);
        Self::open_with_storage(config, storage)
    }

    /// Opens the database against a custom [`Storage`] backend
    pub fn open_with_storage(
        config: Config,
        storage: Arc<dyn Storage>,
    ) -> crate::Result<Self> {
        recover::open(config, storage)
    }

    pub(crate) fn from_parts(
        config: Config,
        storage: Arc<dyn Storage>,
        table_cache: Arc<TableCache>,
        state: DbState,
        lock: Box<dyn FileLock>,
    ) -> Self {
        Self {
            inner: Arc::new(DbInner {
                config,
                storage,
                table_cache,
                state: Mutex::new(state),
                bg_work_finished: Condvar::new(),
                shutdown: AtomicBool::new(false),
                _lock: lock,
            }),
        }
    }

    pub(crate) fn inner(&self) -> &Arc<DbInner> {
        &self.inner
    }

    /// Inserts a key-value pair
    pub fn put<K: AsRef<[u8]>, V: AsRef<[u8]>>(&self, key: K, value: V) -> crate::Result<()> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.write(batch)
    }

    /// Deletes a key (writes a tombstone)
    pub fn delete<K: AsRef<[u8]>>(&self, key: K) -> crate::Result<()> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.write(batch)
    }

    /// Applies a batch atomically
    pub fn write(&self, batch: WriteBatch) -> crate::Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        write::write(&self.inner, Some(batch), false)
    }

    /// Point lookup at the latest committed state
    pub fn get<K: AsRef<[u8]>>(&self, key: K) -> crate::Result<Lookup> {
        if self.inner.is_shutdown() {
            return Err(crate::Error::Closed);
        }

        let user_key = key.as_ref();

        let (mem, imm, version, seqno) = {
            let state = self.inner.state.lock().expect("lock is poisoned");
            (
                Arc::clone(&state.mem),
                state.imm.clone(),
                state.versions.current(),
                state.last_seqno,
            )
        };

        match mem.read().expect("lock is poisoned").get(user_key, seqno) {
            Lookup::NotFound => {}
            found => return Ok(found),
        }

        if let Some(imm) = imm {
            match imm.read().expect("lock is poisoned").get(user_key, seqno) {
                Lookup::NotFound => {}
                found => return Ok(found),
            }
        }

        version.get(user_key, seqno, &self.inner.table_cache)
    }

    /// Ordered cursor over the latest committed state
    pub fn iter(&self) -> crate::Result<DbIterator> {
        iter::new_iterator(&self.inner)
    }

    /// Rotates the active memtable (if non-empty) and waits until the
    /// background flush has drained it to level 0
    pub fn flush_memtable(&self) -> crate::Result<()> {
        write::write(&self.inner, None, true)?;

        let mut state = self.inner.state.lock().expect("lock is poisoned");
        loop {
            if self.inner.is_shutdown() {
                return Err(crate::Error::Closed);
            }
            if let Some(e) = &state.bg_error {
                return Err(e.clone());
            }
            if state.imm.is_none() {
                return Ok(());
            }

            state = self
                .inner
                .bg_work_finished
                .wait(state)
                .expect("lock is poisoned");
        }
    }

    /// Flushes and then merges every populated level downward until the
    /// data sits in one sorted bottom run
    pub fn major_compact(&self) -> crate::Result<()> {
        self.flush_memtable()?;
        compact::major_compact(&self.inner)
    }

    /// Closes the database: stops background work and syncs the
    /// journal. Idempotent; also invoked on drop.
    pub fn close(&self) -> crate::Result<()> {
        if self.inner.shutdown.swap(true, Release) {
            return Ok(());
        }

        log::debug!("closing database");

        let mut state = self.inner.state.lock().expect("lock is poisoned");

        // Writers stalled on rotation room observe the shutdown flag
        // once woken
        self.inner.bg_work_finished.notify_all();

        while state.bg_scheduled {
            state = self
                .inner
                .bg_work_finished
                .wait(state)
                .expect("lock is poisoned");
        }

        let bg_handle = state.bg_handle.take();
        let journal = state.journal.take();
        drop(state);

        // Join so the worker has released its handle on the database
        // (and with it, eventually, the folder lock)
        if let Some(handle) = bg_handle {
            let _ = handle.join();
        }

        if let Some(mut journal) = journal {
            journal.sync()?;
        }

        Ok(())
    }

    /// Compacts one level into the next; mostly useful to drive
    /// compaction deterministically in tests
    #[doc(hidden)]
    pub fn compact_level(&self, level: usize) -> crate::Result<()> {
        compact::manual_compact_level(&self.inner, level)
    }

    /// Table file numbers per level
    #[doc(hidden)]
    #[must_use]
    pub fn level_table_nums(&self) -> Vec<Vec<u64>> {
        let state = self.inner.state.lock().expect("lock is poisoned");
        state.versions.current().file_nums()
    }

    /// User-key range `(min, max)` of every table file, per level
    #[doc(hidden)]
    #[must_use]
    pub fn level_table_ranges(&self) -> Vec<Vec<(Vec<u8>, Vec<u8>)>> {
        let version = {
            let state = self.inner.state.lock().expect("lock is poisoned");
            state.versions.current()
        };

        version
            .levels
            .iter()
            .map(|files| {
                files
                    .iter()
                    .map(|f| {
                        (
                            crate::key::user_key(&f.min_key).to_vec(),
                            crate::key::user_key(&f.max_key).to_vec(),
                        )
                    })
                    .collect()
            })
            .collect()
    }

    /// Every raw entry of every live table, as
    /// `(level, user key, seqno, value type)`
    #[doc(hidden)]
    pub fn dump_table_entries(
        &self,
    ) -> crate::Result<Vec<(usize, Vec<u8>, SeqNo, ValueType)>> {
        use crate::iter::Iter;

        let version = {
            let state = self.inner.state.lock().expect("lock is poisoned");
            state.versions.current()
        };

        let mut entries = Vec::new();

        for (level, files) in version.levels.iter().enumerate() {
            for file in files {
                let table = self.inner.table_cache.get(file.num)?;
                let mut iter = table.iter();
                let mut valid = iter.seek_first();

                while valid {
                    let (ukey, vtype, seqno) = crate::key::parse(iter.key())?;
                    entries.push((level, ukey.to_vec(), seqno, vtype));
                    valid = iter.next();
                }
                iter.status()?;
            }
        }

        Ok(entries)
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("error while closing database: {e:?}");
        }
    }
}

/// Applies decoded batch operations to a memtable
pub(crate) struct MemTableInserter<'a> {
    pub(crate) mem: &'a mut MemTable,
}

impl BatchVisitor for MemTableInserter<'_> {
    fn put(&mut self, key: &[u8], seqno: SeqNo, value: &[u8]) {
        self.mem.put(key, seqno, value);
    }

    fn delete(&mut self, key: &[u8], seqno: SeqNo) {
        self.mem.delete(key, seqno);
    }
}

/// Writes all entries of `entries` into a fresh table file.
///
/// Returns `None` (and leaves no file behind) when the source was empty.
pub(crate) fn build_table<'a, I>(
    storage: &dyn Storage,
    config: &Config,
    file_num: u64,
    entries: I,
) -> crate::Result<Option<crate::version::TableFile>>
where
    I: Iterator<Item = (&'a [u8], &'a [u8])>,
{
    let file = storage.create(Fd::new(FileKind::Table, file_num))?;

    let mut writer = crate::table::writer::TableWriter::new(
        file,
        config.block_size,
        config.block_restart_interval,
        config.compression,
        config.bloom_bits_per_key,
    );

    for (ikey, value) in entries {
        writer.append(ikey, value)?;
    }

    if writer.is_empty() {
        drop(writer);
        let _ = storage.remove(Fd::new(FileKind::Table, file_num));
        return Ok(None);
    }

    let (size, min_key, max_key, entry_count) = writer.finish()?;

    log::debug!("built table {file_num}: {entry_count} entries, {size} bytes");

    Ok(Some(crate::version::TableFile {
        num: file_num,
        size,
        min_key,
        max_key,
    }))
}
