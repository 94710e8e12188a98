//! The version-edit codec: a tagged record stream describing one change
//! to the table catalog.
//!
//! Edits are appended to the manifest journal; replaying them in order
//! rebuilds the current [`super::Version`] and the allocator state.

use super::TableFile;
use crate::{
    coding::{get_uvarint, put_uvarint},
    key::SeqNo,
};
use std::sync::Arc;

const TAG_COMPARATOR: u64 = 1;
const TAG_JOURNAL_NUM: u64 = 2;
const TAG_NEXT_FILE_NUM: u64 = 3;
const TAG_LAST_SEQNO: u64 = 4;
const TAG_COMPACT_POINTER: u64 = 5;
const TAG_DELETED_TABLE: u64 = 6;
const TAG_ADDED_TABLE: u64 = 7;

/// A single mutation of the version state
#[derive(Clone, Debug, Default, PartialEq)]
pub struct VersionEdit {
    pub comparator: Option<String>,
    pub journal_num: Option<u64>,
    pub next_file_num: Option<u64>,
    pub last_seqno: Option<SeqNo>,

    /// `(level, key)` round-robin resume hints for the compaction picker
    pub compact_pointers: Vec<(usize, Vec<u8>)>,

    /// `(level, file number)`
    pub deleted_tables: Vec<(usize, u64)>,

    /// `(level, descriptor)`
    pub added_tables: Vec<(usize, Arc<TableFile>)>,
}

impl VersionEdit {
    pub fn set_comparator(&mut self, name: &str) {
        self.comparator = Some(name.into());
    }

    pub fn set_journal_num(&mut self, num: u64) {
        self.journal_num = Some(num);
    }

    pub fn set_next_file_num(&mut self, num: u64) {
        self.next_file_num = Some(num);
    }

    pub fn set_last_seqno(&mut self, seqno: SeqNo) {
        self.last_seqno = Some(seqno);
    }

    pub fn set_compact_pointer(&mut self, level: usize, ikey: &[u8]) {
        self.compact_pointers.push((level, ikey.to_vec()));
    }

    pub fn delete_table(&mut self, level: usize, num: u64) {
        self.deleted_tables.push((level, num));
    }

    pub fn add_table(&mut self, level: usize, file: Arc<TableFile>) {
        self.added_tables.push((level, file));
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();

        if let Some(name) = &self.comparator {
            put_uvarint(&mut out, TAG_COMPARATOR);
            put_bytes(&mut out, name.as_bytes());
        }

        if let Some(num) = self.journal_num {
            put_uvarint(&mut out, TAG_JOURNAL_NUM);
            put_uvarint(&mut out, num);
        }

        if let Some(num) = self.next_file_num {
            put_uvarint(&mut out, TAG_NEXT_FILE_NUM);
            put_uvarint(&mut out, num);
        }

        if let Some(seqno) = self.last_seqno {
            put_uvarint(&mut out, TAG_LAST_SEQNO);
            put_uvarint(&mut out, seqno);
        }

        for (level, ikey) in &self.compact_pointers {
            put_uvarint(&mut out, TAG_COMPACT_POINTER);
            put_uvarint(&mut out, *level as u64);
            put_bytes(&mut out, ikey);
        }

        for (level, num) in &self.deleted_tables {
            put_uvarint(&mut out, TAG_DELETED_TABLE);
            put_uvarint(&mut out, *level as u64);
            put_uvarint(&mut out, *num);
        }

        for (level, file) in &self.added_tables {
            put_uvarint(&mut out, TAG_ADDED_TABLE);
            put_uvarint(&mut out, *level as u64);
            put_uvarint(&mut out, file.num);
            put_uvarint(&mut out, file.size);
            put_bytes(&mut out, &file.min_key);
            put_bytes(&mut out, &file.max_key);
        }

        out
    }

    pub fn decode(buf: &[u8]) -> crate::Result<Self> {
        let mut edit = Self::default();
        let mut cursor = Cursor { buf, pos: 0 };

        while !cursor.done() {
            let tag = cursor.uvarint()?;

            match tag {
                TAG_COMPARATOR => {
                    let name = cursor.bytes()?;
                    edit.comparator = Some(
                        String::from_utf8(name)
                            .map_err(|_| corruption("comparator name is not UTF-8"))?,
                    );
                }
                TAG_JOURNAL_NUM => edit.journal_num = Some(cursor.uvarint()?),
                TAG_NEXT_FILE_NUM => edit.next_file_num = Some(cursor.uvarint()?),
                TAG_LAST_SEQNO => edit.last_seqno = Some(cursor.uvarint()?),
                TAG_COMPACT_POINTER => {
                    let level = cursor.level()?;
                    let ikey = cursor.bytes()?;
                    edit.compact_pointers.push((level, ikey));
                }
                TAG_DELETED_TABLE => {
                    let level = cursor.level()?;
                    let num = cursor.uvarint()?;
                    edit.deleted_tables.push((level, num));
                }
                TAG_ADDED_TABLE => {
                    let level = cursor.level()?;
                    let num = cursor.uvarint()?;
                    let size = cursor.uvarint()?;
                    let min_key = cursor.bytes()?;
                    let max_key = cursor.bytes()?;

                    edit.added_tables.push((
                        level,
                        Arc::new(TableFile {
                            num,
                            size,
                            min_key,
                            max_key,
                        }),
                    ));
                }
                unknown => {
                    return Err(corruption(&format!("unknown edit tag {unknown}")));
                }
            }
        }

        Ok(edit)
    }
}

fn put_bytes(dst: &mut Vec<u8>, bytes: &[u8]) {
    put_uvarint(dst, bytes.len() as u64);
    dst.extend_from_slice(bytes);
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn done(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn uvarint(&mut self) -> crate::Result<u64> {
        let (value, n) =
            get_uvarint(&self.buf[self.pos..]).ok_or_else(|| corruption("truncated varint"))?;
        self.pos += n;
        Ok(value)
    }

    fn level(&mut self) -> crate::Result<usize> {
        let level = self.uvarint()?;

        if level >= super::LEVELS as u64 {
            return Err(corruption(&format!("level {level} out of range")));
        }

        // NOTE: Truncation is fine, the bound was just checked
        #[allow(clippy::cast_possible_truncation)]
        Ok(level as usize)
    }

    fn bytes(&mut self) -> crate::Result<Vec<u8>> {
        let len = self.uvarint()?;

        // NOTE: Truncation is fine, the slice bound below re-checks
        #[allow(clippy::cast_possible_truncation)]
        let len = len as usize;

        let bytes = self
            .buf
            .get(self.pos..self.pos + len)
            .ok_or_else(|| corruption("byte field extends past record end"))?
            .to_vec();
        self.pos += len;

        Ok(bytes)
    }
}

fn corruption(msg: &str) -> crate::Error {
    crate::Error::Corruption(format!("version edit: {msg}"))
}
