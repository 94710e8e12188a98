//! Prefix-compressed blocks and their cursor.
//!
//! A block is a sequence of entries followed by a restart-point array
//! and its length:
//!
//! ```text
//! entry = [shared key len; varint] [unshared key len; varint]
//!         [value len; varint] [unshared key bytes] [value bytes]
//! block = entry* [restart offset; u32 LE]* [restart count; u32 LE]
//! ```
//!
//! Every `restart_interval`-th entry stores its key without prefix
//! compression so a seek can binary-search the restart array for a full
//! key and scan linearly from there.

use crate::{
    coding::{get_uvarint, put_uvarint},
    iter::Iter,
    key,
};
use byteorder::{ByteOrder, LittleEndian};
use std::{cmp::Ordering, sync::Arc};

/// Accumulates entries into the serialized block layout
pub struct BlockBuilder {
    buf: Vec<u8>,
    restarts: Vec<u32>,
    restart_interval: usize,
    entries: usize,
    prev_key: Vec<u8>,
}

impl BlockBuilder {
    #[must_use]
    pub fn new(restart_interval: usize) -> Self {
        debug_assert!(restart_interval >= 1);

        Self {
            buf: Vec::new(),
            restarts: Vec::new(),
            restart_interval,
            entries: 0,
            prev_key: Vec::new(),
        }
    }

    /// Appends an entry; keys must arrive in non-decreasing order
    pub fn add(&mut self, ikey: &[u8], value: &[u8]) {
        debug_assert!(
            self.entries == 0 || key::compare(&self.prev_key, ikey) != Ordering::Greater
        );

        let shared = if self.entries % self.restart_interval == 0 {
            // NOTE: Truncation is fine, blocks stay far below 4 GiB
            #[allow(clippy::cast_possible_truncation)]
            self.restarts.push(self.buf.len() as u32);
            0
        } else {
            self.prev_key
                .iter()
                .zip(ikey.iter())
                .take_while(|(a, b)| a == b)
                .count()
        };

        put_uvarint(&mut self.buf, shared as u64);
        put_uvarint(&mut self.buf, (ikey.len() - shared) as u64);
        put_uvarint(&mut self.buf, value.len() as u64);
        self.buf.extend_from_slice(&ikey[shared..]);
        self.buf.extend_from_slice(value);

        self.prev_key.clear();
        self.prev_key.extend_from_slice(ikey);
        self.entries += 1;
    }

    /// Serialized size if the block were finished now
    #[must_use]
    pub fn size_estimate(&self) -> usize {
        self.buf.len() + self.restarts.len().max(1) * 4 + 4
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    /// Appends the restart array, returning the serialized block and
    /// resetting the builder
    pub fn finish(&mut self) -> Vec<u8> {
        if self.restarts.is_empty() {
            self.restarts.push(0);
        }

        let mut buf4 = [0u8; 4];
        let restart_count = self.restarts.len();

        for restart in &self.restarts {
            LittleEndian::write_u32(&mut buf4, *restart);
            self.buf.extend_from_slice(&buf4);
        }

        // NOTE: Truncation is fine, see above
        #[allow(clippy::cast_possible_truncation)]
        LittleEndian::write_u32(&mut buf4, restart_count as u32);
        self.buf.extend_from_slice(&buf4);

        let block = std::mem::take(&mut self.buf);
        self.restarts.clear();
        self.entries = 0;
        self.prev_key.clear();
        block
    }
}

/// A decoded (decompressed, checksum-verified) block
pub struct Block {
    data: Vec<u8>,
    restart_offset: usize,
    restart_count: usize,
}

impl Block {
    pub fn new(data: Vec<u8>) -> crate::Result<Self> {
        if data.len() < 4 {
            return Err(corruption("block shorter than restart count"));
        }

        let restart_count = LittleEndian::read_u32(&data[data.len() - 4..]) as usize;
        let restart_array_len = restart_count
            .checked_mul(4)
            .and_then(|n| n.checked_add(4))
            .ok_or_else(|| corruption("restart count overflows"))?;

        let restart_offset = data
            .len()
            .checked_sub(restart_array_len)
            .ok_or_else(|| corruption("restart array larger than block"))?;

        Ok(Self {
            data,
            restart_offset,
            restart_count,
        })
    }

    /// In-memory footprint, used as the block-cache charge
    #[must_use]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    fn restart_point(&self, idx: usize) -> usize {
        let pos = self.restart_offset + idx * 4;
        LittleEndian::read_u32(&self.data[pos..pos + 4]) as usize
    }

    /// The full key stored at a restart point (shared prefix is zero
    /// there by construction)
    fn restart_key(&self, idx: usize) -> Option<&[u8]> {
        let offset = self.restart_point(idx);
        let buf = self.data.get(offset..self.restart_offset)?;

        let (_shared, n) = get_uvarint(buf)?;
        let (unshared, m) = get_uvarint(&buf[n..])?;
        let (_value_len, k) = get_uvarint(&buf[n + m..])?;

        // NOTE: Truncation is fine, lengths are bounded by the block
        #[allow(clippy::cast_possible_truncation)]
        buf.get(n + m + k..n + m + k + unshared as usize)
    }

    #[must_use]
    pub fn iter(self: &Arc<Self>) -> BlockIter {
        BlockIter {
            block: Arc::clone(self),
            offset: 0,
            key: Vec::new(),
            value_start: 0,
            value_len: 0,
            valid: false,
            err: None,
        }
    }
}

/// Cursor over one block
pub struct BlockIter {
    block: Arc<Block>,
    /// Offset of the next entry to decode
    offset: usize,
    key: Vec<u8>,
    value_start: usize,
    value_len: usize,
    valid: bool,
    err: Option<crate::Error>,
}

impl BlockIter {
    fn fail(&mut self, msg: &str) -> bool {
        self.err = Some(corruption(msg));
        self.valid = false;
        false
    }

    /// Decodes the entry at `self.offset`, extending the reconstructed
    /// key
    fn parse_entry(&mut self) -> bool {
        let block = Arc::clone(&self.block);
        let data = &block.data[..block.restart_offset];
        let offset = self.offset;

        let Some((shared, n)) = get_uvarint(&data[offset..]) else {
            return self.fail("bad shared key length");
        };
        let Some((unshared, m)) = get_uvarint(&data[offset + n..]) else {
            return self.fail("bad unshared key length");
        };
        let Some((value_len, k)) = get_uvarint(&data[offset + n + m..]) else {
            return self.fail("bad value length");
        };

        // NOTE: Truncation is fine, lengths are bounded by the block
        #[allow(clippy::cast_possible_truncation)]
        let (shared, unshared, value_len) =
            (shared as usize, unshared as usize, value_len as usize);

        if shared > self.key.len() {
            return self.fail("shared prefix longer than previous key");
        }

        let key_start = offset + n + m + k;
        let value_start = key_start + unshared;

        if value_start + value_len > data.len() {
            return self.fail("entry extends past restart array");
        }

        self.key.truncate(shared);
        self.key.extend_from_slice(&data[key_start..value_start]);
        self.value_start = value_start;
        self.value_len = value_len;
        self.offset = value_start + value_len;
        self.valid = true;

        true
    }

    /// Largest restart index whose key is <= target; 0 if even the
    /// first restart key is greater
    fn seek_restart_index(&mut self, target: &[u8]) -> Option<usize> {
        let block = Arc::clone(&self.block);
        let mut lo = 0;
        let mut hi = block.restart_count.saturating_sub(1);

        while lo < hi {
            let mid = (lo + hi + 1) / 2;

            let Some(restart_key) = block.restart_key(mid) else {
                self.fail("bad restart point");
                return None;
            };

            if key::compare(restart_key, target) == Ordering::Greater {
                hi = mid - 1;
            } else {
                lo = mid;
            }
        }

        Some(lo)
    }
}

impl Iter for BlockIter {
    fn seek_first(&mut self) -> bool {
        if self.err.is_some() {
            return false;
        }

        self.offset = 0;
        self.key.clear();
        self.valid = false;

        if self.offset >= self.block.restart_offset {
            return false;
        }

        self.parse_entry()
    }

    fn seek(&mut self, target: &[u8]) -> bool {
        if self.err.is_some() {
            return false;
        }

        let Some(restart) = self.seek_restart_index(target) else {
            return false;
        };

        self.offset = self.block.restart_point(restart);
        self.key.clear();
        self.valid = false;

        while self.offset < self.block.restart_offset {
            if !self.parse_entry() {
                return false;
            }

            if key::compare(&self.key, target) != Ordering::Less {
                return true;
            }
        }

        self.valid = false;
        false
    }

    fn next(&mut self) -> bool {
        if self.err.is_some() || !self.valid {
            return false;
        }

        if self.offset >= self.block.restart_offset {
            self.valid = false;
            return false;
        }

        self.parse_entry()
    }

    fn key(&self) -> &[u8] {
        debug_assert!(self.valid);
        &self.key
    }

    fn value(&self) -> &[u8] {
        debug_assert!(self.valid);
        &self.block.data[self.value_start..self.value_start + self.value_len]
    }

    fn status(&self) -> crate::Result<()> {
        match &self.err {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}

fn corruption(msg: &str) -> crate::Error {
    crate::Error::Corruption(format!("block: {msg}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{build, ValueType};
    use test_log::test;

    fn entries(count: usize) -> Vec<(Vec<u8>, Vec<u8>)> {
        (0..count)
            .map(|i| {
                (
                    build(format!("key{i:04}").as_bytes(), 1, ValueType::Value),
                    format!("value{i}").into_bytes(),
                )
            })
            .collect()
    }

    fn build_block(items: &[(Vec<u8>, Vec<u8>)], restart_interval: usize) -> Arc<Block> {
        let mut builder = BlockBuilder::new(restart_interval);
        for (k, v) in items {
            builder.add(k, v);
        }
        Arc::new(Block::new(builder.finish()).expect("block should parse"))
    }

    #[test]
    fn iterate_all_entries() {
        let items = entries(100);
        let block = build_block(&items, 16);

        let mut iter = block.iter();
        let mut valid = iter.seek_first();
        let mut seen = Vec::new();

        while valid {
            seen.push((iter.key().to_vec(), iter.value().to_vec()));
            valid = iter.next();
        }

        assert_eq!(items, seen);
        iter.status().expect("no error");
    }

    #[test]
    fn seek_every_key() {
        let items = entries(100);

        // Degenerate restart intervals are the interesting cases
        for restart_interval in [1, 2, 16, 128] {
            let block = build_block(&items, restart_interval);
            let mut iter = block.iter();

            for (k, v) in &items {
                assert!(iter.seek(k), "seek {k:?}");
                assert_eq!(k, iter.key());
                assert_eq!(v, iter.value());
            }
        }
    }

    #[test]
    fn seek_between_keys_lands_on_next() {
        let items = entries(10);
        let block = build_block(&items, 4);
        let mut iter = block.iter();

        let target = build(b"key0003x", 1, ValueType::Value);
        assert!(iter.seek(&target));
        assert_eq!(items[4].0, iter.key());

        let before_all = build(b"aaa", 1, ValueType::Value);
        assert!(iter.seek(&before_all));
        assert_eq!(items[0].0, iter.key());

        let past_all = build(b"zzz", 1, ValueType::Value);
        assert!(!iter.seek(&past_all));
    }

    #[test]
    fn empty_block_is_navigable() {
        let mut builder = BlockBuilder::new(16);
        let block = Arc::new(Block::new(builder.finish()).expect("block should parse"));

        let mut iter = block.iter();
        assert!(!iter.seek_first());
        assert!(!iter.seek(&build(b"x", 1, ValueType::Value)));
    }

    #[test]
    fn truncated_block_is_corruption() {
        assert!(Block::new(vec![1, 2]).is_err());

        // Claim more restarts than the block can hold
        let mut data = vec![0u8; 8];
        LittleEndian::write_u32(&mut data[4..8], 1_000_000);
        assert!(Block::new(data).is_err());
    }
}
