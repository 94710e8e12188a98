//! Opening a database: manifest replay, journal replay, initial state.

use super::{build_table, compact, Db, DbState, MemTableInserter};
use crate::{
    batch::WriteBatch,
    config::Config,
    file::{Fd, FileKind},
    journal,
    key::SeqNo,
    memtable::MemTable,
    storage::Storage,
    table_cache::TableCache,
    version::{set::COMPARATOR_NAME, VersionEdit, VersionSet},
};
use std::{
    collections::{HashSet, VecDeque},
    sync::{Arc, RwLock},
};

pub(crate) fn open(config: Config, storage: Arc<dyn Storage>) -> crate::Result<Db> {
    let lock = storage.lock()?;

    log::debug!("opening database at {}", config.path.display());

    let table_cache = Arc::new(TableCache::new(
        config.max_open_files,
        Arc::clone(&storage),
        Arc::clone(&config.block_cache),
    ));

    let mut versions = VersionSet::new(
        Arc::clone(&storage),
        config.manifest_max_size,
        config.level0_compaction_trigger,
    );

    let manifest_num = match storage.current()? {
        Some(num) => num,
        None => {
            initialize_fresh_db(&*storage)?;
            storage.current()?.ok_or_else(|| {
                crate::Error::Corruption("CURRENT missing right after initialization".into())
            })?
        }
    };

    versions.recover(manifest_num)?;

    // Every table the recovered version references must exist; collect
    // the journals that still hold unflushed writes
    let fds = storage.list()?;
    let mut missing_tables: HashSet<u64> = versions.live_table_nums();
    let mut journals: Vec<u64> = Vec::new();

    for fd in &fds {
        match fd.kind {
            FileKind::Table => {
                missing_tables.remove(&fd.num);
            }
            FileKind::Journal if fd.num >= versions.journal_num => {
                journals.push(fd.num);
            }
            _ => {}
        }

        if !matches!(fd.kind, FileKind::Current | FileKind::Lock) {
            versions.mark_file_used(fd.num);
        }
    }

    if !missing_tables.is_empty() {
        let mut missing: Vec<u64> = missing_tables.into_iter().collect();
        missing.sort_unstable();
        return Err(crate::Error::Corruption(format!(
            "live table files are missing from storage: {missing:?}"
        )));
    }

    journals.sort_unstable();

    let mut edit = VersionEdit::default();
    let mut max_seqno = versions.last_seqno;

    for num in &journals {
        replay_journal(
            &*storage,
            &config,
            &mut versions,
            *num,
            &mut edit,
            &mut max_seqno,
        )?;
    }

    // The new memtable gets a fresh journal; everything older is covered
    // by tables once the edit below lands
    let journal_num = versions.alloc_file_num();
    let journal_file = storage.create(Fd::new(FileKind::Journal, journal_num))?;
    let journal_writer = journal::Writer::new(journal_file);

    edit.set_journal_num(journal_num);
    edit.set_last_seqno(max_seqno);

    // Single-threaded here, so the three-step install runs inline
    let mut job = versions.prepare(edit);
    let outcome = job.run(&*storage);
    versions.finish(job, outcome)?;

    let state = DbState {
        mem: Arc::new(RwLock::new(MemTable::new())),
        imm: None,
        versions,
        journal: Some(journal_writer),
        journal_num,
        frozen_seqno: max_seqno,
        last_seqno: max_seqno,
        writers: VecDeque::new(),
        bg_scheduled: false,
        bg_handle: None,
        bg_error: None,
    };

    let db = Db::from_parts(config, storage, table_cache, state, lock);

    {
        let inner = Arc::clone(db.inner());
        let mut guard = inner.state.lock().expect("lock is poisoned");
        guard = compact::remove_obsolete_files(&inner, guard);
        compact::maybe_schedule_compaction(&inner, &mut guard);
    }

    log::debug!("database opened at sequence {max_seqno}");

    Ok(db)
}

/// Seeds an empty folder: manifest #2 carrying the initial snapshot,
/// CURRENT pointing at it. Journal #1 is reserved but never written;
/// the open path creates its own fresh journal.
fn initialize_fresh_db(storage: &dyn Storage) -> crate::Result<()> {
    log::debug!("initializing fresh database");

    let mut edit = VersionEdit::default();
    edit.set_comparator(COMPARATOR_NAME);
    edit.set_journal_num(1);
    edit.set_next_file_num(3);
    edit.set_last_seqno(0);

    let manifest_fd = Fd::new(FileKind::Manifest, 2);
    let file = storage.create(manifest_fd)?;
    let mut writer = journal::Writer::new(file);

    let result = writer
        .append(&edit.encode())
        .and_then(|()| writer.sync())
        .and_then(|()| storage.set_current(2).map_err(Into::into));

    if result.is_err() {
        drop(writer);
        let _ = storage.remove(manifest_fd);
    }

    result
}

/// Replays one journal into (possibly several) level-0 tables.
///
/// Corrupt blocks are skipped with one-block granularity; whatever
/// records survive are applied in order.
fn replay_journal(
    storage: &dyn Storage,
    config: &Config,
    versions: &mut VersionSet,
    journal_num: u64,
    edit: &mut VersionEdit,
    max_seqno: &mut SeqNo,
) -> crate::Result<()> {
    log::debug!("replaying journal {journal_num}");

    let file = storage.open_sequential(Fd::new(FileKind::Journal, journal_num))?;
    let mut reader = journal::Reader::new(file);
    let mut mem = MemTable::new();

    loop {
        match reader.read_record() {
            journal::ReadRecord::Record(bytes) => {
                let batch = WriteBatch::from_contents(&bytes)?;

                if mem.approximate_size() > config.write_buffer_size {
                    flush_recovery_memtable(storage, config, versions, &mem, edit)?;
                    mem = MemTable::new();
                }

                let mut inserter = MemTableInserter { mem: &mut mem };
                batch.iterate(&mut inserter)?;

                if batch.count() > 0 {
                    let last = batch.sequence() + u64::from(batch.count()) - 1;
                    if last > *max_seqno {
                        *max_seqno = last;
                    }
                }
            }
            journal::ReadRecord::Skipped => {
                log::warn!("journal {journal_num}: skipped a corrupt block");
            }
            journal::ReadRecord::Eof => break,
        }
    }

    if !mem.is_empty() {
        flush_recovery_memtable(storage, config, versions, &mem, edit)?;
    }

    Ok(())
}

fn flush_recovery_memtable(
    storage: &dyn Storage,
    config: &Config,
    versions: &mut VersionSet,
    mem: &MemTable,
    edit: &mut VersionEdit,
) -> crate::Result<()> {
    let file_num = versions.alloc_file_num();

    if let Some(file) = build_table(storage, config, file_num, mem.entries())? {
        log::debug!("recovered memtable flushed to table {file_num}");
        edit.add_table(0, Arc::new(file));
    }

    Ok(())
}
