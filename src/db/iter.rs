//! The public database cursor.
//!
//! Pins the memtables and the current version at creation time and
//! reads at the sequence number committed at that instant, so a scan
//! sees one consistent state regardless of concurrent writes. Internal
//! bookkeeping (older versions, tombstones, entries newer than the
//! snapshot) is skipped; keys and values are copied into caller-owned
//! buffers at this boundary.

use super::{compact, DbInner};
use crate::{
    iter::{BoxedIter, Iter},
    key::{self, SeqNo, UserKey, UserValue, ValueType},
    memtable::MemTableIter,
    merge::MergeIter,
    version::{Version, LEVELS},
};
use std::sync::Arc;

pub(crate) fn new_iterator(inner: &Arc<DbInner>) -> crate::Result<DbIterator> {
    if inner.is_shutdown() {
        return Err(crate::Error::Closed);
    }

    let (mem, imm, version, snapshot_seqno) = {
        let state = inner.state.lock().expect("lock is poisoned");
        (
            Arc::clone(&state.mem),
            state.imm.clone(),
            state.versions.current(),
            state.last_seqno,
        )
    };

    let mut children: Vec<BoxedIter> = Vec::new();
    children.push(Box::new(MemTableIter::new(mem)));

    if let Some(imm) = imm {
        children.push(Box::new(MemTableIter::new(imm)));
    }

    // Level-0 tables overlap: each is its own child. Deeper levels are
    // sorted runs behind a two-level cursor.
    for file in &version.levels[0] {
        children.push(inner.table_cache.get(file.num)?.iter());
    }

    for level in 1..LEVELS {
        if !version.levels[level].is_empty() {
            children.push(compact::level_iter(inner, version.levels[level].clone())?);
        }
    }

    Ok(DbIterator {
        db: Arc::clone(inner),
        inner: MergeIter::new(children),
        snapshot_seqno,
        _version: version,
        key: Vec::new(),
        value: Vec::new(),
        valid: false,
        started: false,
        err: None,
        err_emitted: false,
    })
}

/// Ordered cursor over the user-visible key-value pairs of a database
pub struct DbIterator {
    db: Arc<DbInner>,
    inner: MergeIter,
    snapshot_seqno: SeqNo,

    /// Keeps every table file referenced by `inner` alive
    _version: Arc<Version>,

    key: Vec<u8>,
    value: Vec<u8>,
    valid: bool,
    started: bool,
    err: Option<crate::Error>,
    err_emitted: bool,
}

impl DbIterator {
    /// Positions at the first user key
    pub fn seek_first(&mut self) -> bool {
        self.started = true;

        if self.err.is_some() {
            return false;
        }

        let valid = self.inner.seek_first();
        self.settle(valid, None)
    }

    /// Positions at the first user key >= `user_key`
    pub fn seek(&mut self, user_key: &[u8]) -> bool {
        self.started = true;

        if self.err.is_some() {
            return false;
        }

        let target = key::build(user_key, self.snapshot_seqno, ValueType::Tombstone);
        let valid = self.inner.seek(&target);
        self.settle(valid, None)
    }

    /// Advances to the next user key
    pub fn advance(&mut self) -> bool {
        if !self.started {
            return self.seek_first();
        }

        if self.err.is_some() || !self.valid {
            return false;
        }

        let skip = std::mem::take(&mut self.key);
        let valid = self.inner.next();
        self.settle(valid, Some(skip))
    }

    /// Walks the merged stream forward to the newest visible,
    /// non-deleted version of the next user key
    fn settle(&mut self, mut valid: bool, skip_user_key: Option<Vec<u8>>) -> bool {
        let mut skip = skip_user_key;

        loop {
            if self.db.is_shutdown() {
                self.err = Some(crate::Error::Released);
                self.valid = false;
                return false;
            }

            if !valid {
                if let Err(e) = self.inner.status() {
                    self.err = Some(e);
                }
                self.valid = false;
                return false;
            }

            let parsed = key::parse(self.inner.key()).map(|(u, t, s)| (u.to_vec(), t, s));

            match parsed {
                Err(e) => {
                    self.err = Some(e);
                    self.valid = false;
                    return false;
                }
                Ok((user_key, value_type, seqno)) => {
                    if seqno > self.snapshot_seqno {
                        valid = self.inner.next();
                        continue;
                    }

                    if skip.as_deref() == Some(user_key.as_slice()) {
                        // An older version of a key already surfaced
                        valid = self.inner.next();
                        continue;
                    }

                    match value_type {
                        ValueType::Tombstone => {
                            // Shadows everything older with this key
                            skip = Some(user_key);
                            valid = self.inner.next();
                        }
                        ValueType::Value => {
                            self.key = user_key;
                            self.value.clear();
                            self.value.extend_from_slice(self.inner.value());
                            self.valid = true;
                            return true;
                        }
                    }
                }
            }
        }
    }

    /// Current user key; valid after a movement returned `true`
    #[must_use]
    pub fn key(&self) -> &[u8] {
        debug_assert!(self.valid);
        &self.key
    }

    /// Current value; valid after a movement returned `true`
    #[must_use]
    pub fn value(&self) -> &[u8] {
        debug_assert!(self.valid);
        &self.value
    }

    /// Sticky error state of the cursor
    pub fn status(&self) -> crate::Result<()> {
        match &self.err {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}

impl Iterator for DbIterator {
    type Item = crate::Result<(UserKey, UserValue)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.advance() {
            return Some(Ok((
                Arc::from(self.key.as_slice()),
                Arc::from(self.value.as_slice()),
            )));
        }

        match &self.err {
            Some(e) if !self.err_emitted => {
                self.err_emitted = true;
                Some(Err(e.clone()))
            }
            _ => None,
        }
    }
}
