//! Compaction picking: which files merge into which level next.
//!
//! A size compaction starts from the level the current version's score
//! points at, seeds the input with the file after the level's round-robin
//! resume pointer, and expands the input set: all transitively
//! overlapping level-0 files, the overlapping files of the next level,
//! and optionally more seed-level files when that costs nothing. Files
//! of the grandparent level are recorded so the runner can cut its
//! output before any one output file overlaps too much of them.

use crate::{
    key::{self, SeqNo},
    version::{total_file_size, user_range_of, TableFile, Version, VersionSet, LEVELS},
};
use std::{cmp::Ordering, sync::Arc};

/// A compaction writes files of at most this multiple of the output file
/// size worth of grandparent overlap before cutting a new output file
pub const GRANDPARENT_OVERLAP_FACTOR: u64 = 10;

/// Expanding the seed level is allowed while the total input stays under
/// this multiple of the output file size
pub const EXPANSION_LIMIT_FACTOR: u64 = 25;

/// One picked compaction: inputs at `level` and `level + 1`, plus the
/// grandparent overlap state driving output-file cutoff
pub struct Compaction {
    pub level: usize,

    /// `inputs[0]`: seed-level files, `inputs[1]`: next-level files
    pub inputs: [Vec<Arc<TableFile>>; 2],

    pub grandparents: Vec<Arc<TableFile>>,

    pub max_output_size: u64,

    /// Oldest sequence number any reader may still observe; versions at
    /// or below it can be dropped when shadowed
    pub smallest_snapshot: SeqNo,

    /// The version the inputs were picked from, pinned for the whole run
    pub version: Arc<Version>,

    // Grandparent cutoff state
    gp_index: usize,
    gp_overlapped_bytes: u64,
    gp_seen_key: bool,

    // Cursors into the levels below the output level, advanced only
    // forward over one run
    base_level_cursors: Vec<usize>,
}

impl Compaction {
    fn new(
        level: usize,
        seed: Vec<Arc<TableFile>>,
        version: Arc<Version>,
        max_output_size: u64,
    ) -> Self {
        let mut compaction = Self {
            level,
            inputs: [seed, Vec::new()],
            grandparents: Vec::new(),
            max_output_size,
            smallest_snapshot: 0,
            version,
            gp_index: 0,
            gp_overlapped_bytes: 0,
            gp_seen_key: false,
            base_level_cursors: vec![0; LEVELS],
        };

        compaction.expand_inputs();
        compaction
    }

    /// Grows the seed set per the input-selection rules and records the
    /// next-level and grandparent overlaps
    fn expand_inputs(&mut self) {
        let version = Arc::clone(&self.version);

        let (mut umin, mut umax) = user_range_of(&self.inputs[0]);

        if self.level == 0 {
            // Level-0 files overlap each other; the seed pulls in its
            // whole cluster
            self.inputs[0] = version.overlapping_inputs(0, &umin, &umax);
            (umin, umax) = user_range_of(&self.inputs[0]);
        }

        self.inputs[1] = version.overlapping_inputs(self.level + 1, &umin, &umax);

        // Try to grow the seed set without dragging in more next-level
        // files, as long as the total stays bounded
        let (joint_min, joint_max) = self.joint_range(&umin, &umax);
        let grown = version.overlapping_inputs(self.level, &joint_min, &joint_max);

        if grown.len() > self.inputs[0].len()
            && total_file_size(&grown) + total_file_size(&self.inputs[1])
                <= EXPANSION_LIMIT_FACTOR * self.max_output_size
        {
            let (grown_min, grown_max) = {
                let mut all: Vec<Arc<TableFile>> = grown.clone();
                all.extend(self.inputs[1].iter().cloned());
                user_range_of(&all)
            };

            let regrown_next =
                version.overlapping_inputs(self.level + 1, &grown_min, &grown_max);

            if regrown_next.len() == self.inputs[1].len() {
                log::debug!(
                    "expanding level {} inputs from {} to {} files",
                    self.level,
                    self.inputs[0].len(),
                    grown.len()
                );
                self.inputs[0] = grown;
                (umin, umax) = (grown_min, grown_max);
            }
        }

        if self.level + 2 < LEVELS {
            let (joint_min, joint_max) = self.joint_range(&umin, &umax);
            self.grandparents =
                version.overlapping_inputs(self.level + 2, &joint_min, &joint_max);
        }
    }

    /// User-key range of both input sets combined
    fn joint_range(&self, umin: &[u8], umax: &[u8]) -> (Vec<u8>, Vec<u8>) {
        let mut min = umin.to_vec();
        let mut max = umax.to_vec();

        if !self.inputs[1].is_empty() {
            let (next_min, next_max) = user_range_of(&self.inputs[1]);
            if next_min < min {
                min = next_min;
            }
            if next_max > max {
                max = next_max;
            }
        }

        (min, max)
    }

    /// A single seed file with no next-level overlap moves down as-is
    /// when it would not create expensive grandparent overlap
    #[must_use]
    pub fn is_trivial_move(&self) -> bool {
        self.level > 0
            && self.inputs[0].len() == 1
            && self.inputs[1].is_empty()
            && total_file_size(&self.grandparents)
                <= GRANDPARENT_OVERLAP_FACTOR * self.max_output_size
    }

    /// Every file consumed by this compaction
    pub fn all_inputs(&self) -> impl Iterator<Item = &Arc<TableFile>> {
        self.inputs[0].iter().chain(self.inputs[1].iter())
    }

    /// Largest internal key of the seed set; recorded as the level's
    /// resume pointer
    #[must_use]
    pub fn resume_pointer(&self) -> Vec<u8> {
        self.inputs[0]
            .iter()
            .map(|f| &f.max_key)
            .max_by(|a, b| key::compare(a, b))
            .cloned()
            .unwrap_or_default()
    }

    /// Whether the current output file should be finished before writing
    /// `ikey`, bounding how much of the grandparent level any one output
    /// file overlaps
    pub fn should_stop_before(&mut self, ikey: &[u8]) -> bool {
        while self.gp_index < self.grandparents.len()
            && key::compare(ikey, &self.grandparents[self.gp_index].max_key)
                == Ordering::Greater
        {
            self.gp_overlapped_bytes += self.grandparents[self.gp_index].size;
            self.gp_seen_key = true;
            self.gp_index += 1;
        }

        if self.gp_seen_key
            && self.gp_overlapped_bytes >= GRANDPARENT_OVERLAP_FACTOR * self.max_output_size
        {
            self.gp_overlapped_bytes = 0;
            self.gp_seen_key = false;
            return true;
        }

        false
    }

    /// Whether no level below the output level holds `user_key`. Only
    /// then may a tombstone be dropped: nothing underneath could
    /// resurface.
    ///
    /// Each deeper level keeps a forward-only cursor, so the whole
    /// compaction pays one sweep per level rather than one search per
    /// key.
    pub fn is_base_level_for_key(&mut self, user_key: &[u8]) -> bool {
        for level in self.level + 2..LEVELS {
            let files = &self.version.levels[level];
            let cursor = &mut self.base_level_cursors[level];

            while *cursor < files.len()
                && key::user_key(&files[*cursor].max_key) < user_key
            {
                *cursor += 1;
            }

            if *cursor < files.len() && key::user_key(&files[*cursor].min_key) <= user_key {
                return false;
            }
        }

        true
    }
}

/// Picks the next size compaction, if the current version needs one
#[must_use]
pub fn pick_compaction(versions: &VersionSet, max_output_size: u64) -> Option<Compaction> {
    let version = versions.current();

    if version.compaction_score < 1.0 {
        return None;
    }

    let level = version.compaction_level;
    debug_assert!(level + 1 < LEVELS);

    let files = &version.levels[level];
    if files.is_empty() {
        return None;
    }

    // Resume after the last compacted key of this level, wrapping to the
    // first file
    let mut seed = None;

    if level > 0 {
        if let Some(pointer) = versions.compact_pointer(level) {
            seed = files
                .iter()
                .find(|f| key::compare(&f.max_key, pointer) == Ordering::Greater)
                .cloned();
        }
    }

    let seed = seed.unwrap_or_else(|| Arc::clone(&files[0]));

    log::debug!(
        "picked size compaction at level {level} (score {:.2}), seed table {}",
        version.compaction_score,
        seed.num
    );

    Some(Compaction::new(
        level,
        vec![seed],
        version,
        max_output_size,
    ))
}

/// Builds a compaction over the whole of `level`, used by manual
/// compaction
#[must_use]
pub fn compact_whole_level(
    version: Arc<Version>,
    level: usize,
    max_output_size: u64,
) -> Option<Compaction> {
    if level + 1 >= LEVELS || version.levels[level].is_empty() {
        return None;
    }

    let seed = version.levels[level].clone();
    Some(Compaction::new(level, seed, version, max_output_size))
}
