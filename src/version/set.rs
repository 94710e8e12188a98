//! The version set: who owns the current [`Version`] and the manifest.
//!
//! All catalog mutations funnel through a three-step protocol so the
//! expensive manifest write happens outside the engine mutex:
//!
//! 1. [`VersionSet::prepare`] (mutex held): fill in the edit, build and
//!    score the successor version, decide whether the manifest rotates.
//! 2. [`ManifestJob::run`] (mutex released): create/append/sync the
//!    manifest journal, repoint `CURRENT` when a new manifest was
//!    started. Only one manifest write is ever in flight because
//!    compactions are serialized.
//! 3. [`VersionSet::finish`] (mutex held): install the new version and
//!    bookkeeping on success, or roll the manifest state back.

use super::{edit::VersionEdit, TableFile, Version, LEVELS};
use crate::{
    file::{Fd, FileKind},
    journal, key,
    storage::Storage,
};
use std::{
    cmp::Ordering,
    collections::HashSet,
    sync::Arc,
};

pub const COMPARATOR_NAME: &str = "silt.bytewise";

pub struct VersionSet {
    storage: Arc<dyn Storage>,

    current: Arc<Version>,

    pub next_file_num: u64,

    /// Journal number of the installed version; journals below this are
    /// fully represented by tables
    pub journal_num: u64,

    /// Last sequence number recorded in the manifest
    pub last_seqno: key::SeqNo,

    compact_pointers: [Option<Vec<u8>>; LEVELS],

    manifest_num: u64,
    manifest_writer: Option<journal::Writer>,
    manifest_max_size: u64,
    l0_compaction_trigger: usize,
}

impl VersionSet {
    #[must_use]
    pub fn new(
        storage: Arc<dyn Storage>,
        manifest_max_size: u64,
        l0_compaction_trigger: usize,
    ) -> Self {
        Self {
            storage,
            current: Arc::new(Version::new()),
            next_file_num: 2,
            journal_num: 0,
            last_seqno: 0,
            compact_pointers: std::array::from_fn(|_| None),
            manifest_num: 0,
            manifest_writer: None,
            manifest_max_size,
            l0_compaction_trigger,
        }
    }

    #[must_use]
    pub fn current(&self) -> Arc<Version> {
        Arc::clone(&self.current)
    }

    #[must_use]
    pub fn manifest_num(&self) -> u64 {
        self.manifest_num
    }

    #[must_use]
    pub fn compact_pointer(&self, level: usize) -> Option<&[u8]> {
        self.compact_pointers[level].as_deref()
    }

    pub fn alloc_file_num(&mut self) -> u64 {
        let num = self.next_file_num;
        self.next_file_num += 1;
        num
    }

    /// Returns an allocated-but-unused number to the pool
    pub fn reuse_file_num(&mut self, num: u64) {
        if self.next_file_num == num + 1 {
            self.next_file_num = num;
        }
    }

    /// Makes sure `num` is never handed out again
    pub fn mark_file_used(&mut self, num: u64) {
        if self.next_file_num <= num {
            self.next_file_num = num + 1;
        }
    }

    #[must_use]
    pub fn needs_compaction(&self) -> bool {
        self.current.compaction_score >= 1.0
    }

    /// Table numbers referenced by the current version
    #[must_use]
    pub fn live_table_nums(&self) -> HashSet<u64> {
        self.current
            .levels
            .iter()
            .flatten()
            .map(|f| f.num)
            .collect()
    }

    /// Step 1 of installing an edit; engine mutex held
    pub fn prepare(&mut self, mut edit: VersionEdit) -> ManifestJob {
        if edit.journal_num.is_none() {
            edit.set_journal_num(self.journal_num);
        }
        debug_assert!(edit.journal_num.unwrap_or(0) >= self.journal_num);

        if edit.last_seqno.is_none() {
            edit.set_last_seqno(self.last_seqno);
        }

        let rotate = match &self.manifest_writer {
            None => true,
            Some(writer) => writer.len() >= self.manifest_max_size,
        };

        let (manifest_num, writer) = if rotate {
            // The old writer (if any) is retired; a fresh manifest gets
            // a full snapshot before the edit
            (self.alloc_file_num(), None)
        } else {
            (self.manifest_num, self.manifest_writer.take())
        };

        edit.set_next_file_num(self.next_file_num);

        let mut builder = Builder::new(self.current());
        builder.apply(&edit);
        let mut version = builder.save();
        version.finalize(self.l0_compaction_trigger);

        let snapshot = rotate.then(|| self.snapshot_edit().encode());

        ManifestJob {
            version: Some(version),
            edit,
            writer,
            manifest_num,
            created_new: rotate,
            snapshot,
        }
    }

    /// Step 3; engine mutex held again
    pub fn finish(
        &mut self,
        mut job: ManifestJob,
        outcome: crate::Result<()>,
    ) -> crate::Result<()> {
        match outcome {
            Ok(()) => {
                self.manifest_writer = job.writer.take();
                self.manifest_num = job.manifest_num;

                for (level, ikey) in &job.edit.compact_pointers {
                    self.compact_pointers[*level] = Some(ikey.clone());
                }

                self.current = Arc::new(job.version.take().expect("version was built"));

                if let Some(num) = job.edit.journal_num {
                    self.journal_num = num;
                }
                if let Some(seqno) = job.edit.last_seqno {
                    self.last_seqno = self.last_seqno.max(seqno);
                }

                Ok(())
            }
            Err(e) => {
                log::error!("manifest write failed, keeping previous version: {e:?}");

                if job.created_new {
                    // Leave no half-written manifest behind; CURRENT was
                    // not repointed on this path
                    let fd = Fd::new(FileKind::Manifest, job.manifest_num);
                    if let Err(remove_err) = self.storage.remove(fd) {
                        log::warn!("could not remove manifest {fd:?}: {remove_err:?}");
                    }
                    self.manifest_writer = None;
                } else {
                    self.manifest_writer = job.writer.take();
                }

                Err(e)
            }
        }
    }

    /// One edit carrying the entire current state; written at the head
    /// of every fresh manifest
    fn snapshot_edit(&self) -> VersionEdit {
        let mut edit = VersionEdit::default();
        edit.set_comparator(COMPARATOR_NAME);

        for (level, pointer) in self.compact_pointers.iter().enumerate() {
            if let Some(ikey) = pointer {
                edit.set_compact_pointer(level, ikey);
            }
        }

        for (level, files) in self.current.levels.iter().enumerate() {
            for file in files {
                edit.add_table(level, Arc::clone(file));
            }
        }

        edit
    }

    /// Replays a manifest into this set; any corruption is fatal
    pub fn recover(&mut self, manifest_num: u64) -> crate::Result<()> {
        log::debug!("recovering from manifest {manifest_num}");

        let file = self
            .storage
            .open_sequential(Fd::new(FileKind::Manifest, manifest_num))?;
        let mut reader = journal::Reader::new(file);

        let mut builder = Builder::new(Arc::new(Version::new()));
        let mut journal_num = None;
        let mut next_file_num = None;
        let mut last_seqno = None;
        let mut edits = 0usize;

        loop {
            match reader.read_record() {
                journal::ReadRecord::Record(bytes) => {
                    let edit = VersionEdit::decode(&bytes)?;

                    if let Some(name) = &edit.comparator {
                        if name != COMPARATOR_NAME {
                            return Err(crate::Error::InvalidArgument(format!(
                                "manifest comparator {name:?} does not match {COMPARATOR_NAME:?}"
                            )));
                        }
                    }

                    for (level, ikey) in &edit.compact_pointers {
                        self.compact_pointers[*level] = Some(ikey.clone());
                    }

                    builder.apply(&edit);

                    journal_num = edit.journal_num.or(journal_num);
                    next_file_num = edit.next_file_num.or(next_file_num);
                    last_seqno = edit.last_seqno.or(last_seqno);
                    edits += 1;
                }
                journal::ReadRecord::Skipped => {
                    return Err(crate::Error::Corruption(format!(
                        "manifest {manifest_num} is corrupt"
                    )));
                }
                journal::ReadRecord::Eof => break,
            }
        }

        let journal_num = journal_num
            .ok_or_else(|| manifest_missing_field(manifest_num, "journal number"))?;
        let next_file_num = next_file_num
            .ok_or_else(|| manifest_missing_field(manifest_num, "next file number"))?;
        let last_seqno = last_seqno
            .ok_or_else(|| manifest_missing_field(manifest_num, "last sequence number"))?;

        let mut version = builder.save();
        version.finalize(self.l0_compaction_trigger);

        self.current = Arc::new(version);
        self.journal_num = journal_num;
        self.next_file_num = next_file_num;
        self.last_seqno = last_seqno;
        self.manifest_num = manifest_num;
        self.manifest_writer = None;

        self.mark_file_used(manifest_num);
        self.mark_file_used(journal_num);

        log::debug!(
            "recovered {edits} edits: journal {journal_num}, next file {}, last seqno {last_seqno}",
            self.next_file_num
        );

        Ok(())
    }
}

/// The manifest IO of one edit installation; runs without the engine
/// mutex
pub struct ManifestJob {
    version: Option<Version>,
    pub edit: VersionEdit,
    writer: Option<journal::Writer>,
    pub manifest_num: u64,
    created_new: bool,
    snapshot: Option<Vec<u8>>,
}

impl ManifestJob {
    /// Step 2: the actual manifest IO
    pub fn run(&mut self, storage: &dyn Storage) -> crate::Result<()> {
        if self.writer.is_none() {
            log::debug!("starting fresh manifest {}", self.manifest_num);

            let file = storage.create(Fd::new(FileKind::Manifest, self.manifest_num))?;
            let mut writer = journal::Writer::new(file);

            if let Some(snapshot) = &self.snapshot {
                writer.append(snapshot)?;
            }

            self.writer = Some(writer);
        }

        let writer = self.writer.as_mut().expect("writer was just installed");
        writer.append(&self.edit.encode())?;
        writer.sync()?;

        if self.created_new {
            storage.set_current(self.manifest_num)?;
        }

        Ok(())
    }
}

fn manifest_missing_field(manifest_num: u64, what: &str) -> crate::Error {
    crate::Error::Corruption(format!("manifest {manifest_num} never recorded the {what}"))
}

/// Builds a successor [`Version`] from a base plus one edit (or, during
/// recovery, a stream of edits)
struct Builder {
    base: Arc<Version>,
    added: [Vec<Arc<TableFile>>; LEVELS],
    deleted: [HashSet<u64>; LEVELS],
}

impl Builder {
    fn new(base: Arc<Version>) -> Self {
        Self {
            base,
            added: std::array::from_fn(|_| Vec::new()),
            deleted: std::array::from_fn(|_| HashSet::new()),
        }
    }

    fn apply(&mut self, edit: &VersionEdit) {
        for (level, num) in &edit.deleted_tables {
            self.deleted[*level].insert(*num);
        }

        for (level, file) in &edit.added_tables {
            self.deleted[*level].remove(&file.num);
            self.added[*level].push(Arc::clone(file));
        }
    }

    fn save(self) -> Version {
        let mut version = Version::new();

        for level in 0..LEVELS {
            let mut files: Vec<Arc<TableFile>> = self.base.levels[level]
                .iter()
                .filter(|f| !self.deleted[level].contains(&f.num))
                .cloned()
                .collect();

            files.extend(
                self.added[level]
                    .iter()
                    .filter(|f| !self.deleted[level].contains(&f.num))
                    .cloned(),
            );

            if level == 0 {
                // Newest flush first
                files.sort_by(|a, b| b.num.cmp(&a.num));
            } else {
                files.sort_by(|a, b| {
                    key::compare(&a.min_key, &b.min_key).then(a.num.cmp(&b.num))
                });

                debug_assert!(
                    files.windows(2).all(|pair| {
                        key::compare(&pair[0].max_key, &pair[1].min_key) == Ordering::Less
                    }),
                    "level {level} has overlapping files"
                );
            }

            version.levels[level] = files;
        }

        version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FsStorage;
    use test_log::test;

    fn table_file(num: u64, umin: &[u8], umax: &[u8]) -> Arc<TableFile> {
        Arc::new(TableFile {
            num,
            size: 1_000,
            min_key: key::build(umin, 1, key::ValueType::Value),
            max_key: key::build(umax, 1, key::ValueType::Value),
        })
    }

    fn apply(set: &mut VersionSet, edit: VersionEdit) -> crate::Result<()> {
        let mut job = set.prepare(edit);
        let storage = Arc::clone(&set.storage);
        let outcome = job.run(&*storage);
        set.finish(job, outcome)
    }

    #[test]
    fn edits_install_and_recover() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;
        let storage: Arc<dyn Storage> = Arc::new(FsStorage::open(folder.path())?);

        let mut set = VersionSet::new(Arc::clone(&storage), 64 * 1_024 * 1_024, 4);
        set.journal_num = 1;
        set.next_file_num = 3;

        let mut edit = VersionEdit::default();
        edit.add_table(0, table_file(10, b"a", b"m"));
        edit.add_table(0, table_file(11, b"c", b"z"));
        edit.set_last_seqno(42);
        apply(&mut set, edit)?;

        let mut edit = VersionEdit::default();
        edit.delete_table(0, 10);
        edit.add_table(1, table_file(12, b"a", b"m"));
        edit.set_compact_pointer(1, &key::build(b"m", 9, key::ValueType::Value));
        apply(&mut set, edit)?;

        assert_eq!(vec![vec![11], vec![12]], {
            let mut nums = set.current().file_nums();
            nums.truncate(2);
            nums
        });

        // A second set recovers the same state through CURRENT
        let manifest_num = storage.current()?.expect("CURRENT exists");
        let mut recovered = VersionSet::new(Arc::clone(&storage), 64 * 1_024 * 1_024, 4);
        recovered.recover(manifest_num)?;

        assert_eq!(set.current().file_nums(), recovered.current().file_nums());
        assert_eq!(42, recovered.last_seqno);
        assert_eq!(set.journal_num, recovered.journal_num);
        assert!(recovered.compact_pointer(1).is_some());
        assert!(recovered.next_file_num >= set.next_file_num);

        Ok(())
    }

    #[test]
    fn failed_install_leaves_version_unchanged() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;
        let storage: Arc<dyn Storage> = Arc::new(FsStorage::open(folder.path())?);

        let mut set = VersionSet::new(Arc::clone(&storage), 64 * 1_024 * 1_024, 4);

        let mut edit = VersionEdit::default();
        edit.add_table(0, table_file(10, b"a", b"m"));
        edit.set_last_seqno(1);
        apply(&mut set, edit)?;

        let before = set.current().file_nums();

        let mut edit = VersionEdit::default();
        edit.add_table(0, table_file(11, b"a", b"m"));
        let job = set.prepare(edit);
        let outcome = Err(crate::Error::Io(std::io::Error::other("injected")));
        assert!(set.finish(job, outcome).is_err());

        assert_eq!(before, set.current().file_nums());

        Ok(())
    }

    #[test]
    fn manifest_rotation_writes_snapshot() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;
        let storage: Arc<dyn Storage> = Arc::new(FsStorage::open(folder.path())?);

        // Tiny threshold: every edit rotates the manifest
        let mut set = VersionSet::new(Arc::clone(&storage), 1, 4);

        for num in 10..15 {
            let mut edit = VersionEdit::default();
            edit.add_table(1, table_file(num, &[b'a' + u8::try_from(num - 10).unwrap()], &[b'a' + u8::try_from(num - 10).unwrap()]));
            edit.set_last_seqno(num);
            apply(&mut set, edit)?;
        }

        let manifest_num = storage.current()?.expect("CURRENT exists");
        let mut recovered = VersionSet::new(Arc::clone(&storage), 64 * 1_024 * 1_024, 4);
        recovered.recover(manifest_num)?;

        assert_eq!(
            vec![10, 11, 12, 13, 14],
            recovered.current().levels[1]
                .iter()
                .map(|f| f.num)
                .collect::<Vec<_>>()
        );

        Ok(())
    }
}
