//! The write pipeline.
//!
//! Writers queue up FIFO under the engine mutex. The queue head becomes
//! the commit leader: it makes room (delaying, stalling or rotating the
//! memtable as needed), merges the batches of compatible followers into
//! one journal record, appends and applies it outside the mutex, then
//! hands every merged writer the shared result and wakes the next head.
//!
//! Sequence numbers are assigned contiguously per merged group, so
//! writes become visible in exactly their queue order.

use super::{DbInner, DbState, MemTableInserter};
use crate::{
    batch::WriteBatch,
    file::{Fd, FileKind},
    journal,
    memtable::MemTable,
};
use std::{
    sync::{Arc, Condvar, Mutex, MutexGuard, RwLock},
    time::Duration,
};

/// Merged groups stop growing at 1 MiB
const MAX_GROUP_SIZE: usize = 1 << 20;

/// Small leaders only pick up a bounded amount of followers so tiny
/// writes keep their latency
const SMALL_GROUP_SLACK: usize = 128 << 10;

pub(crate) struct PendingWriter {
    cv: Condvar,
    cell: Mutex<PendingCell>,
}

struct PendingCell {
    batch: Option<WriteBatch>,
    force_rotate: bool,
    result: Option<crate::Result<()>>,
}

impl PendingWriter {
    fn new(batch: Option<WriteBatch>, force_rotate: bool) -> Arc<Self> {
        Arc::new(Self {
            cv: Condvar::new(),
            cell: Mutex::new(PendingCell {
                batch,
                force_rotate,
                result: None,
            }),
        })
    }

    fn result(&self) -> Option<crate::Result<()>> {
        self.cell.lock().expect("lock is poisoned").result.clone()
    }

    fn finish(&self, result: crate::Result<()>) {
        self.cell.lock().expect("lock is poisoned").result = Some(result);
        self.cv.notify_one();
    }
}

/// Enqueues a write (or, with `batch == None` and `force_rotate`, a
/// flush request) and blocks until it committed or failed
pub(crate) fn write(
    inner: &Arc<DbInner>,
    batch: Option<WriteBatch>,
    force_rotate: bool,
) -> crate::Result<()> {
    if inner.is_shutdown() {
        return Err(crate::Error::Closed);
    }

    let me = PendingWriter::new(batch, force_rotate);

    let mut state = inner.state.lock().expect("lock is poisoned");
    state.writers.push_back(Arc::clone(&me));

    // Wait until this writer is the queue head, or a leader already
    // committed it as part of a merged group
    loop {
        if let Some(result) = me.result() {
            return result;
        }

        let head = state.writers.front().expect("queue holds at least us");
        if Arc::ptr_eq(head, &me) {
            break;
        }

        state = me.cv.wait(state).expect("lock is poisoned");
    }

    lead_commit(inner, state, &me)
}

/// Runs the commit as queue head. Consumes the guard; the queue entries
/// of the merged group are popped and signalled before returning.
fn lead_commit(
    inner: &Arc<DbInner>,
    state: MutexGuard<'_, DbState>,
    me: &Arc<PendingWriter>,
) -> crate::Result<()> {
    let force_rotate = me.cell.lock().expect("lock is poisoned").force_rotate;

    let (mut state, room) = make_room_for_write(inner, state, force_rotate);

    if let Err(e) = room {
        finish_group(&mut state, vec![Arc::clone(me)], &Err(e.clone()));
        return Err(e);
    }

    let leader_batch = me.cell.lock().expect("lock is poisoned").batch.take();

    let Some(leader_batch) = leader_batch else {
        // Pure flush request: rotation already happened in
        // make_room_for_write
        finish_group(&mut state, vec![Arc::clone(me)], &Ok(()));
        return Ok(());
    };

    // Merge compatible followers into one journal record
    let mut group = vec![Arc::clone(me)];
    let mut merged = leader_batch;
    let mut size = merged.size_bytes();

    let max_size = if size < SMALL_GROUP_SLACK {
        size + SMALL_GROUP_SLACK
    } else {
        MAX_GROUP_SIZE
    };

    for writer in state.writers.iter().skip(1) {
        let mut cell = writer.cell.lock().expect("lock is poisoned");

        let Some(follower_batch) = &cell.batch else {
            break;
        };
        if cell.force_rotate {
            break;
        }
        if size + follower_batch.size_bytes() > max_size {
            break;
        }

        size += follower_batch.size_bytes();
        let follower_batch = cell.batch.take().expect("batch is present");
        drop(cell);

        merged.append(&follower_batch);
        group.push(Arc::clone(writer));
    }

    let seqno = state.last_seqno + 1;
    merged.set_sequence(seqno);
    let count = merged.count();

    let mem = Arc::clone(&state.mem);
    let mut journal = state
        .journal
        .take()
        .expect("journal writer slot is only empty mid-commit");

    // The journal append is the expensive part; run it without the
    // engine mutex so readers and queueing writers keep moving
    drop(state);

    let mut result = append_to_journal(&mut journal, &mut merged);

    if result.is_ok() {
        result = apply_to_memtable(&merged, &mem);
    }

    let mut state = inner.state.lock().expect("lock is poisoned");
    state.journal = Some(journal);

    // Sequence numbers are consumed even on failure; they are never
    // reassigned
    state.last_seqno = seqno + u64::from(count) - 1;

    if let Err(e) = &result {
        state.record_background_error(e);
        inner.bg_work_finished.notify_all();
    }

    finish_group(&mut state, group, &result);

    result
}

fn append_to_journal(
    journal: &mut journal::Writer,
    batch: &mut WriteBatch,
) -> crate::Result<()> {
    journal.append(batch.contents())?;
    journal.flush()
}

fn apply_to_memtable(
    batch: &WriteBatch,
    mem: &RwLock<MemTable>,
) -> crate::Result<()> {
    let mut mem = mem.write().expect("lock is poisoned");
    let mut inserter = MemTableInserter { mem: &mut mem };
    batch.iterate(&mut inserter)
}

/// Pops the merged group off the queue, delivers the shared result, and
/// wakes the next leader
fn finish_group(
    state: &mut DbState,
    group: Vec<Arc<PendingWriter>>,
    result: &crate::Result<()>,
) {
    for writer in &group {
        let popped = state
            .writers
            .pop_front()
            .expect("merged group is at the queue head");
        debug_assert!(Arc::ptr_eq(&popped, writer));

        writer.finish(result.clone());
    }

    if let Some(next) = state.writers.front() {
        next.cv.notify_one();
    }
}

/// Loops under the engine mutex until the active memtable can take the
/// write; may sleep, stall on background work, or rotate the memtable.
fn make_room_for_write<'a>(
    inner: &'a Arc<DbInner>,
    mut state: MutexGuard<'a, DbState>,
    mut force: bool,
) -> (MutexGuard<'a, DbState>, crate::Result<()>) {
    let mut allow_delay = !force;

    loop {
        if inner.is_shutdown() {
            return (state, Err(crate::Error::Closed));
        }

        if let Some(e) = state.bg_error.clone() {
            return (state, Err(e));
        }

        let level0_files = state.versions.current().levels[0].len();

        if allow_delay && level0_files >= inner.config.level0_slowdown_trigger {
            // Let the compactor catch up a little instead of stalling
            // this writer for seconds later; each writer pays at most
            // one such delay
            allow_delay = false;
            drop(state);
            std::thread::sleep(Duration::from_millis(1));
            state = inner.state.lock().expect("lock is poisoned");
            continue;
        }

        let mem_size = state
            .mem
            .read()
            .expect("lock is poisoned")
            .approximate_size();

        if !force && mem_size <= inner.config.write_buffer_size {
            return (state, Ok(()));
        }

        if force && mem_size == 0 {
            // Nothing to rotate
            return (state, Ok(()));
        }

        if state.imm.is_some() {
            log::trace!("write stall: waiting for immutable memtable flush");
            state = inner
                .bg_work_finished
                .wait(state)
                .expect("lock is poisoned");
            continue;
        }

        if level0_files >= inner.config.level0_stop_trigger {
            log::trace!("write stall: level 0 has {level0_files} files");
            state = inner
                .bg_work_finished
                .wait(state)
                .expect("lock is poisoned");
            continue;
        }

        // Rotate: fresh journal, memtable becomes immutable
        let journal_num = state.versions.alloc_file_num();

        let file = match inner
            .storage
            .create(Fd::new(FileKind::Journal, journal_num))
        {
            Ok(file) => file,
            Err(e) => {
                state.versions.reuse_file_num(journal_num);
                return (state, Err(e.into()));
            }
        };

        if let Some(mut old_journal) = state.journal.take() {
            if let Err(e) = old_journal.sync() {
                log::warn!("could not sync retiring journal: {e:?}");
            }
        }

        log::debug!(
            "rotating memtable ({mem_size} bytes) to journal {journal_num}"
        );

        state.journal = Some(journal::Writer::new(file));
        state.journal_num = journal_num;
        state.frozen_seqno = state.last_seqno;
        state.imm = Some(std::mem::replace(
            &mut state.mem,
            Arc::new(RwLock::new(MemTable::new())),
        ));
        force = false;

        super::compact::maybe_schedule_compaction(inner, &mut state);
    }
}
