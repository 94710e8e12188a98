//! The multi-level catalog of live tables.
//!
//! A [`Version`] is an immutable snapshot of which table files exist at
//! which level. Level 0 holds memtable flushes, ordered newest-first and
//! allowed to overlap; deeper levels are sorted runs of non-overlapping
//! files. Versions are shared (`Arc`) by readers, iterators and
//! compactions; mutations go through [`VersionEdit`]s applied by the
//! [`VersionSet`].

pub mod edit;
pub mod set;

pub use edit::VersionEdit;
pub use set::VersionSet;

use crate::{
    key::{self, Lookup, SeqNo, ValueType},
    table::reader::parse_lookup,
    table_cache::TableCache,
};
use std::{cmp::Ordering, sync::Arc};

/// Number of levels in the tree
pub const LEVELS: usize = 7;

/// Target size of level 1; each deeper level is ten times larger
const LEVEL1_MAX_BYTES: u64 = 10 * 1_024 * 1_024;

#[must_use]
pub fn max_bytes_for_level(level: usize) -> u64 {
    let mut result = LEVEL1_MAX_BYTES;
    let mut level = level;
    while level > 1 {
        result *= 10;
        level -= 1;
    }
    result
}

/// Descriptor of one on-disk table file
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TableFile {
    pub num: u64,
    pub size: u64,

    /// Smallest internal key in the file
    pub min_key: Vec<u8>,

    /// Largest internal key in the file
    pub max_key: Vec<u8>,
}

impl TableFile {
    /// Whether the file's user-key range intersects `[umin, umax]`
    #[must_use]
    pub fn overlaps_user_range(&self, umin: &[u8], umax: &[u8]) -> bool {
        key::user_key(&self.max_key) >= umin && key::user_key(&self.min_key) <= umax
    }
}

#[must_use]
pub fn total_file_size(files: &[Arc<TableFile>]) -> u64 {
    files.iter().map(|f| f.size).sum()
}

/// The user-key range covered by a set of files
#[must_use]
pub fn user_range_of(files: &[Arc<TableFile>]) -> (Vec<u8>, Vec<u8>) {
    debug_assert!(!files.is_empty());

    let mut umin = key::user_key(&files[0].min_key).to_vec();
    let mut umax = key::user_key(&files[0].max_key).to_vec();

    for file in files.iter().skip(1) {
        if key::user_key(&file.min_key) < umin.as_slice() {
            umin = key::user_key(&file.min_key).to_vec();
        }
        if key::user_key(&file.max_key) > umax.as_slice() {
            umax = key::user_key(&file.max_key).to_vec();
        }
    }

    (umin, umax)
}

/// An immutable per-level view of the live table files
pub struct Version {
    pub levels: [Vec<Arc<TableFile>>; LEVELS],

    /// Most compaction-worthy level, computed by [`Version::finalize`]
    pub compaction_level: usize,

    /// Its score; >= 1.0 means compaction is needed
    pub compaction_score: f64,
}

impl Default for Version {
    fn default() -> Self {
        Self::new()
    }
}

impl Version {
    #[must_use]
    pub fn new() -> Self {
        Self {
            levels: std::array::from_fn(|_| Vec::new()),
            compaction_level: 0,
            compaction_score: 0.0,
        }
    }

    /// Precomputes which level most needs compaction.
    ///
    /// Level 0 scores by file count (too many files make every read
    /// check every file); deeper levels score by byte size against an
    /// exponentially growing budget. The last level has nowhere to push
    /// data and is excluded.
    pub fn finalize(&mut self, l0_compaction_trigger: usize) {
        let mut best_level = 0;

        // NOTE: Precision loss is fine for a heuristic score
        #[allow(clippy::cast_precision_loss)]
        let mut best_score = self.levels[0].len() as f64 / l0_compaction_trigger.max(1) as f64;

        for level in 1..LEVELS - 1 {
            // NOTE: See above
            #[allow(clippy::cast_precision_loss)]
            let score =
                total_file_size(&self.levels[level]) as f64 / max_bytes_for_level(level) as f64;

            if score > best_score {
                best_score = score;
                best_level = level;
            }
        }

        self.compaction_level = best_level;
        self.compaction_score = best_score;
    }

    /// Files of `level` whose user-key range intersects `[umin, umax]`.
    ///
    /// For level 0 the range is grown transitively: overlapping files
    /// may themselves overlap further files, and a compaction must take
    /// the whole cluster.
    #[must_use]
    pub fn overlapping_inputs(
        &self,
        level: usize,
        umin: &[u8],
        umax: &[u8],
    ) -> Vec<Arc<TableFile>> {
        let files = &self.levels[level];
        let mut umin = umin.to_vec();
        let mut umax = umax.to_vec();

        if level == 0 {
            let mut result: Vec<Arc<TableFile>> = Vec::new();
            let mut idx = 0;

            while idx < files.len() {
                let file = &files[idx];
                idx += 1;

                if !file.overlaps_user_range(&umin, &umax) {
                    continue;
                }

                let mut restart = false;

                if key::user_key(&file.min_key) < umin.as_slice() {
                    umin = key::user_key(&file.min_key).to_vec();
                    restart = true;
                }
                if key::user_key(&file.max_key) > umax.as_slice() {
                    umax = key::user_key(&file.max_key).to_vec();
                    restart = true;
                }

                if restart {
                    result.clear();
                    idx = 0;
                } else {
                    result.push(Arc::clone(file));
                }
            }

            return result;
        }

        files
            .iter()
            .filter(|file| file.overlaps_user_range(&umin, &umax))
            .cloned()
            .collect()
    }

    /// Point lookup through the levels, newest data first
    pub fn get(
        &self,
        user_key: &[u8],
        snapshot_seqno: SeqNo,
        table_cache: &TableCache,
    ) -> crate::Result<Lookup> {
        let ikey = key::build(user_key, snapshot_seqno, ValueType::Tombstone);

        // Level 0 files overlap; check them newest-first
        for file in &self.levels[0] {
            if !file.overlaps_user_range(user_key, user_key) {
                continue;
            }

            if let Some(outcome) = probe_table(file, &ikey, user_key, table_cache)? {
                return Ok(outcome);
            }
        }

        // Deeper levels are sorted and disjoint; at most one file per
        // level can hold the key
        for files in &self.levels[1..] {
            let idx = files.partition_point(|f| key::user_key(&f.max_key) < user_key);

            let Some(file) = files.get(idx) else {
                continue;
            };

            if key::user_key(&file.min_key) > user_key {
                continue;
            }

            if let Some(outcome) = probe_table(file, &ikey, user_key, table_cache)? {
                return Ok(outcome);
            }
        }

        Ok(Lookup::NotFound)
    }

    /// Table file numbers per level, for introspection and tests
    #[must_use]
    pub fn file_nums(&self) -> Vec<Vec<u64>> {
        self.levels
            .iter()
            .map(|files| files.iter().map(|f| f.num).collect())
            .collect()
    }
}

fn probe_table(
    file: &TableFile,
    ikey: &[u8],
    user_key: &[u8],
    table_cache: &TableCache,
) -> crate::Result<Option<Lookup>> {
    let table = table_cache.get(file.num)?;
    let found = table.get(ikey)?;

    match parse_lookup(found, user_key)? {
        Some((ValueType::Value, value)) => Ok(Some(Lookup::Found(Arc::from(value)))),
        Some((ValueType::Tombstone, _)) => Ok(Some(Lookup::Deleted)),
        None => Ok(None),
    }
}

/// Index cursor over a sorted, non-overlapping file list. Keys are each
/// file's largest internal key; values encode `(file number, size)` for
/// a [`crate::iter::TwoLevelIter`] to open the table.
pub struct LevelFileIter {
    files: Vec<Arc<TableFile>>,
    pos: usize,
    value: Vec<u8>,
    valid: bool,
}

impl LevelFileIter {
    #[must_use]
    pub fn new(files: Vec<Arc<TableFile>>) -> Self {
        Self {
            files,
            pos: 0,
            value: Vec::new(),
            valid: false,
        }
    }

    fn capture(&mut self, pos: usize) -> bool {
        self.pos = pos;
        self.valid = pos < self.files.len();

        if self.valid {
            let file = &self.files[pos];
            self.value.clear();
            self.value.extend_from_slice(&file.num.to_le_bytes());
            self.value.extend_from_slice(&file.size.to_le_bytes());
        }

        self.valid
    }
}

impl crate::iter::Iter for LevelFileIter {
    fn seek_first(&mut self) -> bool {
        self.capture(0)
    }

    fn seek(&mut self, target: &[u8]) -> bool {
        let pos = self
            .files
            .partition_point(|f| key::compare(&f.max_key, target) == Ordering::Less);
        self.capture(pos)
    }

    fn next(&mut self) -> bool {
        if !self.valid {
            return false;
        }
        self.capture(self.pos + 1)
    }

    fn key(&self) -> &[u8] {
        &self.files[self.pos].max_key
    }

    fn value(&self) -> &[u8] {
        &self.value
    }

    fn status(&self) -> crate::Result<()> {
        Ok(())
    }
}

/// Decodes the `(file number, size)` value of a [`LevelFileIter`] entry
pub fn decode_level_file_value(value: &[u8]) -> crate::Result<u64> {
    if value.len() != 16 {
        return Err(crate::Error::Corruption(
            "bad level file iterator value".into(),
        ));
    }

    let num = u64::from_le_bytes(value[0..8].try_into().expect("length was checked"));
    Ok(num)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::build;
    use test_log::test;

    pub(crate) fn table_file(num: u64, size: u64, umin: &[u8], umax: &[u8]) -> Arc<TableFile> {
        Arc::new(TableFile {
            num,
            size,
            min_key: build(umin, 1, ValueType::Value),
            max_key: build(umax, 1, ValueType::Value),
        })
    }

    #[test]
    fn score_prefers_overfull_level() {
        let mut version = Version::new();

        for num in 0..5 {
            version.levels[0].push(table_file(num, 1_000, b"a", b"z"));
        }
        version.finalize(4);
        assert_eq!(0, version.compaction_level);
        assert!(version.compaction_score >= 1.0);

        let mut version = Version::new();
        version.levels[1].push(table_file(9, 20 * 1_024 * 1_024, b"a", b"z"));
        version.finalize(4);
        assert_eq!(1, version.compaction_level);
        assert!(version.compaction_score >= 2.0);
    }

    #[test]
    fn level_budget_grows_tenfold() {
        assert_eq!(10 * 1_024 * 1_024, max_bytes_for_level(1));
        assert_eq!(100 * 1_024 * 1_024, max_bytes_for_level(2));
        assert_eq!(1_000 * 1_024 * 1_024, max_bytes_for_level(3));
    }

    #[test]
    fn overlap_search_is_range_based() {
        let mut version = Version::new();
        version.levels[2] = vec![
            table_file(1, 10, b"a", b"c"),
            table_file(2, 10, b"e", b"g"),
            table_file(3, 10, b"i", b"k"),
        ];

        let hits = version.overlapping_inputs(2, b"f", b"j");
        assert_eq!(vec![2, 3], hits.iter().map(|f| f.num).collect::<Vec<_>>());

        let hits = version.overlapping_inputs(2, b"x", b"z");
        assert!(hits.is_empty());
    }

    #[test]
    fn level0_overlap_grows_transitively() {
        let mut version = Version::new();
        // File 3 overlaps file 2, file 2 overlaps file 1
        version.levels[0] = vec![
            table_file(3, 10, b"f", b"j"),
            table_file(2, 10, b"c", b"g"),
            table_file(1, 10, b"a", b"d"),
        ];

        let hits = version.overlapping_inputs(0, b"i", b"j");
        let mut nums: Vec<u64> = hits.iter().map(|f| f.num).collect();
        nums.sort_unstable();
        assert_eq!(vec![1, 2, 3], nums);
    }
}
