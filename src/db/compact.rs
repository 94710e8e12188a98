//! Background work: scheduling, memtable flushes (minor compaction),
//! table merges (major compaction) and the obsolete-file sweep.
//!
//! At most one compaction runs at a time. The single-slot
//! `bg_scheduled` flag is toggled under the engine mutex; the work
//! itself runs on a spawned thread and re-enters the mutex only to pick
//! inputs and install results.

use super::{build_table, DbInner, DbState};
use crate::{
    compaction::{compact_whole_level, pick_compaction, Compaction},
    file::{Fd, FileKind},
    iter::{BoxedIter, TwoLevelIter},
    key::{self, ValueType},
    merge::MergeIter,
    table::writer::TableWriter,
    version::{decode_level_file_value, LevelFileIter, TableFile, VersionEdit, LEVELS},
};
use std::sync::{Arc, MutexGuard};

/// Spawns the background worker if work is pending and none is running.
/// Engine mutex held.
pub(crate) fn maybe_schedule_compaction(inner: &Arc<DbInner>, state: &mut DbState) {
    if state.bg_scheduled || state.bg_error.is_some() || inner.is_shutdown() {
        return;
    }

    if state.imm.is_none() && !state.versions.needs_compaction() {
        return;
    }

    state.bg_scheduled = true;

    let cloned = Arc::clone(inner);
    state.bg_handle = Some(std::thread::spawn(move || background_call(&cloned)));
}

fn background_call(inner: &Arc<DbInner>) {
    let mut state = inner.state.lock().expect("lock is poisoned");
    debug_assert!(state.bg_scheduled);

    if state.bg_error.is_none() && !inner.is_shutdown() {
        state = background_compaction(inner, state);
    }

    state.bg_scheduled = false;

    // The previous round may have unlocked more work (another level
    // over budget, another immutable memtable)
    maybe_schedule_compaction(inner, &mut state);

    drop(state);
    inner.bg_work_finished.notify_all();
}

fn background_compaction<'a>(
    inner: &'a Arc<DbInner>,
    state: MutexGuard<'a, DbState>,
) -> MutexGuard<'a, DbState> {
    if state.imm.is_some() {
        return compact_memtable(inner, state);
    }

    let Some(mut compaction) =
        pick_compaction(&state.versions, inner.config.max_output_file_size)
    else {
        log::trace!("compactor: nothing to do");
        return state;
    };

    if compaction.is_trivial_move() {
        return trivial_move(inner, state, &compaction);
    }

    let (mut state, result) = do_compaction_work(inner, state, &mut compaction);

    match result {
        Ok(()) => {
            state = remove_obsolete_files(inner, state);
        }
        Err(e) => {
            state.record_background_error(&e);
        }
    }

    state
}

/// Installs an edit via the three-step manifest protocol, releasing the
/// engine mutex for the IO
fn log_and_apply<'a>(
    inner: &'a Arc<DbInner>,
    mut state: MutexGuard<'a, DbState>,
    edit: VersionEdit,
) -> (MutexGuard<'a, DbState>, crate::Result<()>) {
    let mut job = state.versions.prepare(edit);
    drop(state);

    let outcome = job.run(&*inner.storage);

    let mut state = inner.state.lock().expect("lock is poisoned");
    let result = state.versions.finish(job, outcome);

    (state, result)
}

/// Minor compaction: drain the immutable memtable into a level-0 table
fn compact_memtable<'a>(
    inner: &'a Arc<DbInner>,
    mut state: MutexGuard<'a, DbState>,
) -> MutexGuard<'a, DbState> {
    let Some(imm) = state.imm.clone() else {
        return state;
    };

    let file_num = state.versions.alloc_file_num();
    let journal_num = state.journal_num;
    let frozen_seqno = state.frozen_seqno;

    drop(state);

    log::debug!("minor compaction: memtable -> table {file_num}");

    let built = {
        let imm = imm.read().expect("lock is poisoned");
        build_table(&*inner.storage, &inner.config, file_num, imm.entries())
    };

    let state = inner.state.lock().expect("lock is poisoned");

    match built {
        Ok(built) => {
            let mut edit = VersionEdit::default();
            if let Some(file) = built {
                edit.add_table(0, Arc::new(file));
            }

            // Entries up to the rotation point are now durable in the
            // table; the journals before the rotation can go
            edit.set_journal_num(journal_num);
            edit.set_last_seqno(frozen_seqno);

            let (mut state, result) = log_and_apply(inner, state, edit);

            match result {
                Ok(()) => {
                    state.imm = None;
                    remove_obsolete_files(inner, state)
                }
                Err(e) => {
                    state.record_background_error(&e);
                    state
                }
            }
        }
        Err(e) => {
            let _ = inner
                .storage
                .remove(Fd::new(FileKind::Table, file_num));

            let mut state = state;
            state.record_background_error(&e);
            state
        }
    }
}

fn trivial_move<'a>(
    inner: &'a Arc<DbInner>,
    state: MutexGuard<'a, DbState>,
    compaction: &Compaction,
) -> MutexGuard<'a, DbState> {
    let file = Arc::clone(&compaction.inputs[0][0]);

    log::debug!(
        "trivial move: table {} from level {} to level {}",
        file.num,
        compaction.level,
        compaction.level + 1
    );

    let mut edit = VersionEdit::default();
    edit.delete_table(compaction.level, file.num);
    edit.add_table(compaction.level + 1, file);
    edit.set_compact_pointer(compaction.level, &compaction.resume_pointer());

    let (mut state, result) = log_and_apply(inner, state, edit);

    if let Err(e) = result {
        state.record_background_error(&e);
    }

    state
}

/// Major compaction: merge the inputs into fresh tables at the next
/// level and install the swap
fn do_compaction_work<'a>(
    inner: &'a Arc<DbInner>,
    state: MutexGuard<'a, DbState>,
    compaction: &mut Compaction,
) -> (MutexGuard<'a, DbState>, crate::Result<()>) {
    // Without external snapshots, everything at or below the last
    // committed sequence is fair game for version dropping
    compaction.smallest_snapshot = state.last_seqno;

    log::debug!(
        "major compaction: {} tables @ level {} + {} tables @ level {}",
        compaction.inputs[0].len(),
        compaction.level,
        compaction.inputs[1].len(),
        compaction.level + 1
    );

    drop(state);

    let result = run_compaction(inner, compaction);

    let state = inner.state.lock().expect("lock is poisoned");

    match result {
        Ok(Some(outputs)) => {
            let mut edit = VersionEdit::default();

            for file in &compaction.inputs[0] {
                edit.delete_table(compaction.level, file.num);
            }
            for file in &compaction.inputs[1] {
                edit.delete_table(compaction.level + 1, file.num);
            }
            for file in outputs {
                edit.add_table(compaction.level + 1, Arc::new(file));
            }
            edit.set_compact_pointer(compaction.level, &compaction.resume_pointer());

            log_and_apply(inner, state, edit)
        }
        Ok(None) => {
            log::debug!("compaction aborted by shutdown");
            (state, Ok(()))
        }
        Err(e) => (state, Err(e)),
    }
}

/// The merge loop. Runs without the engine mutex (except to allocate
/// output file numbers). Returns the produced tables, or `None` when
/// shutdown interrupted the run.
fn run_compaction(
    inner: &Arc<DbInner>,
    compaction: &mut Compaction,
) -> crate::Result<Option<Vec<TableFile>>> {
    let mut outputs: Vec<TableFile> = Vec::new();
    let mut current: Option<(u64, TableWriter)> = None;

    let result = compaction_loop(inner, compaction, &mut outputs, &mut current);

    match result {
        Ok(true) => {
            debug_assert!(current.is_none());
            Ok(Some(outputs))
        }
        Ok(false) => {
            discard_outputs(inner, &outputs, current);
            Ok(None)
        }
        Err(e) => {
            discard_outputs(inner, &outputs, current);
            Err(e)
        }
    }
}

fn discard_outputs(
    inner: &Arc<DbInner>,
    outputs: &[TableFile],
    current: Option<(u64, TableWriter)>,
) {
    if let Some((num, writer)) = current {
        drop(writer);
        let _ = inner.storage.remove(Fd::new(FileKind::Table, num));
    }

    for file in outputs {
        let _ = inner.storage.remove(Fd::new(FileKind::Table, file.num));
    }
}

/// Returns `Ok(false)` when shutdown interrupted the merge
fn compaction_loop(
    inner: &Arc<DbInner>,
    compaction: &mut Compaction,
    outputs: &mut Vec<TableFile>,
    current: &mut Option<(u64, TableWriter)>,
) -> crate::Result<bool> {
    let mut input = make_input_iter(inner, compaction)?;

    let mut current_user_key: Option<Vec<u8>> = None;
    // Sentinel above every real sequence number
    let mut last_seqno_for_user: u64 = u64::MAX;

    let mut valid = input.seek_first();

    while valid {
        if inner.is_shutdown() {
            // Observed only between entries; the edit is never installed
            return Ok(false);
        }

        let ikey = input.key().to_vec();

        if current.is_some() && compaction.should_stop_before(&ikey) {
            finish_output(current, outputs)?;
        }

        let mut drop_entry = false;

        match key::parse(&ikey) {
            Err(_) => {
                // Pass unparseable keys through untouched; dropping
                // would hide the corruption from later repair
                current_user_key = None;
                last_seqno_for_user = u64::MAX;
            }
            Ok((user_key, value_type, seqno)) => {
                if current_user_key.as_deref() != Some(user_key) {
                    current_user_key = Some(user_key.to_vec());
                    last_seqno_for_user = u64::MAX;
                }

                if last_seqno_for_user <= compaction.smallest_snapshot {
                    // A newer version of this user key already made it
                    // to the output and is visible to every reader
                    drop_entry = true;
                } else if value_type == ValueType::Tombstone
                    && seqno <= compaction.smallest_snapshot
                    && compaction.is_base_level_for_key(user_key)
                {
                    // The tombstone shadows nothing below the output
                    // level, so it has done its job
                    drop_entry = true;
                }

                last_seqno_for_user = seqno;
            }
        }

        if !drop_entry {
            if current.is_none() {
                let num = {
                    let mut state = inner.state.lock().expect("lock is poisoned");
                    state.versions.alloc_file_num()
                };

                let file = inner.storage.create(Fd::new(FileKind::Table, num))?;
                let writer = TableWriter::new(
                    file,
                    inner.config.block_size,
                    inner.config.block_restart_interval,
                    inner.config.compression,
                    inner.config.bloom_bits_per_key,
                );
                *current = Some((num, writer));
            }

            let (_, writer) = current.as_mut().expect("output is open");
            writer.append(&ikey, input.value())?;

            if writer.file_size() >= compaction.max_output_size {
                finish_output(current, outputs)?;
            }
        }

        valid = input.next();
    }

    input.status()?;

    if current.is_some() {
        finish_output(current, outputs)?;
    }

    Ok(true)
}

fn finish_output(
    current: &mut Option<(u64, TableWriter)>,
    outputs: &mut Vec<TableFile>,
) -> crate::Result<()> {
    let (num, writer) = current.take().expect("an output is open");
    let (size, min_key, max_key, entry_count) = writer.finish()?;

    log::debug!("compaction output table {num}: {entry_count} entries, {size} bytes");

    outputs.push(TableFile {
        num,
        size,
        min_key,
        max_key,
    });

    Ok(())
}

/// One merged cursor over all compaction inputs: level-0 files each get
/// their own table cursor (they overlap), deeper levels go through a
/// two-level cursor over the sorted file list
fn make_input_iter(
    inner: &Arc<DbInner>,
    compaction: &Compaction,
) -> crate::Result<BoxedIter> {
    let mut children: Vec<BoxedIter> = Vec::new();

    if compaction.level == 0 {
        for file in &compaction.inputs[0] {
            children.push(inner.table_cache.get(file.num)?.iter());
        }
    } else {
        children.push(level_iter(inner, compaction.inputs[0].clone())?);
    }

    if !compaction.inputs[1].is_empty() {
        children.push(level_iter(inner, compaction.inputs[1].clone())?);
    }

    Ok(Box::new(MergeIter::new(children)))
}

/// Two-level cursor over a sorted run of tables.
///
/// All tables are opened up front: the cursor must outlive any
/// concurrent obsolete-file sweep, and an open handle keeps an unlinked
/// file readable.
pub(crate) fn level_iter(
    inner: &Arc<DbInner>,
    files: Vec<Arc<TableFile>>,
) -> crate::Result<BoxedIter> {
    let tables = files
        .iter()
        .map(|f| Ok((f.num, inner.table_cache.get(f.num)?)))
        .collect::<crate::Result<std::collections::HashMap<_, _>>>()?;

    Ok(Box::new(TwoLevelIter::new(
        Box::new(LevelFileIter::new(files)),
        Box::new(move |handle_bytes| {
            let num = decode_level_file_value(handle_bytes)?;
            let table = tables.get(&num).ok_or_else(|| {
                crate::Error::Corruption(format!("table {num} missing from level cursor"))
            })?;
            Ok(table.iter())
        }),
    )))
}

/// Deletes files no longer referenced by the current state: tables
/// absent from the live set, journals older than the recovered one,
/// manifests before the active one
pub(crate) fn remove_obsolete_files<'a>(
    inner: &'a Arc<DbInner>,
    state: MutexGuard<'a, DbState>,
) -> MutexGuard<'a, DbState> {
    let live_tables = state.versions.live_table_nums();
    let keep_journals_from = state.versions.journal_num.min(state.journal_num);
    let manifest_num = state.versions.manifest_num();

    drop(state);

    let fds = match inner.storage.list() {
        Ok(fds) => fds,
        Err(e) => {
            log::warn!("obsolete-file sweep could not list storage: {e:?}");
            return inner.state.lock().expect("lock is poisoned");
        }
    };

    for fd in fds {
        let keep = match fd.kind {
            FileKind::Manifest => fd.num >= manifest_num,
            FileKind::Journal => fd.num >= keep_journals_from,
            FileKind::Table => live_tables.contains(&fd.num),
            FileKind::Current | FileKind::Lock | FileKind::Temp => true,
        };

        if !keep {
            log::debug!("removing obsolete file {}", fd.file_name());
            if let Err(e) = inner.storage.remove(fd) {
                log::warn!("could not remove {}: {e:?}", fd.file_name());
            }
        }
    }

    inner.state.lock().expect("lock is poisoned")
}

/// Merges every populated level downward in turn; afterwards all data
/// sits in the deepest non-empty level as one sorted run
pub(crate) fn major_compact(inner: &Arc<DbInner>) -> crate::Result<()> {
    for level in 0..LEVELS - 1 {
        manual_compact_level(inner, level)?;
    }

    Ok(())
}

pub(crate) fn manual_compact_level(inner: &Arc<DbInner>, level: usize) -> crate::Result<()> {
    // Claim the single compaction slot
    let mut state = inner.state.lock().expect("lock is poisoned");

    loop {
        if inner.is_shutdown() {
            return Err(crate::Error::Closed);
        }
        if let Some(e) = &state.bg_error {
            return Err(e.clone());
        }
        if !state.bg_scheduled {
            state.bg_scheduled = true;
            break;
        }

        state = inner
            .bg_work_finished
            .wait(state)
            .expect("lock is poisoned");
    }

    let compaction = compact_whole_level(
        state.versions.current(),
        level,
        inner.config.max_output_file_size,
    );

    let result = if let Some(mut compaction) = compaction {
        let (after, result) = do_compaction_work(inner, state, &mut compaction);
        state = after;

        if result.is_ok() {
            state = remove_obsolete_files(inner, state);
        } else if let Err(e) = &result {
            state.record_background_error(e);
        }

        result
    } else {
        Ok(())
    };

    state.bg_scheduled = false;
    maybe_schedule_compaction(inner, &mut state);
    drop(state);
    inner.bg_work_finished.notify_all();

    result
}
