//! Filter blocks: per-data-block bloom filter partitions.
//!
//! A new partition is cut whenever the file grows past another 2 KiB of
//! data blocks, and partitions are looked up by the data block's byte
//! offset:
//!
//! ```text
//! [partition 0] ... [partition n]
//! [partition offset; u32 LE]*        one per partition
//! [offset array start; u32 LE]
//! [base lg; 1 byte]                  partition index = offset >> base_lg
//! ```

use crate::bloom::BloomPolicy;
use byteorder::{ByteOrder, LittleEndian};

/// Partition granularity: one filter per 2 KiB of data-block space
pub const FILTER_BASE_LG: u8 = 11;

pub struct FilterBlockBuilder {
    policy: BloomPolicy,
    keys: Vec<Vec<u8>>,
    result: Vec<u8>,
    offsets: Vec<u32>,
}

impl FilterBlockBuilder {
    #[must_use]
    pub fn new(policy: BloomPolicy) -> Self {
        Self {
            policy,
            keys: Vec::new(),
            result: Vec::new(),
            offsets: Vec::new(),
        }
    }

    /// Registers that a data block begins at `block_offset`; cuts
    /// partitions until the offset's partition exists
    pub fn start_block(&mut self, block_offset: u64) {
        let filter_index = block_offset >> FILTER_BASE_LG;

        while (self.offsets.len() as u64) < filter_index {
            self.generate_filter();
        }
    }

    /// Adds a user key to the partition under construction
    pub fn add_key(&mut self, user_key: &[u8]) {
        self.keys.push(user_key.to_vec());
    }

    fn generate_filter(&mut self) {
        // NOTE: Truncation is fine, filter blocks stay far below 4 GiB
        #[allow(clippy::cast_possible_truncation)]
        self.offsets.push(self.result.len() as u32);

        if !self.keys.is_empty() {
            self.policy.create_filter(&self.keys, &mut self.result);
            self.keys.clear();
        }
    }

    /// Finalizes the filter block
    #[must_use]
    pub fn finish(mut self) -> Vec<u8> {
        if !self.keys.is_empty() {
            self.generate_filter();
        }

        // NOTE: Truncation is fine, see above
        #[allow(clippy::cast_possible_truncation)]
        let array_start = self.result.len() as u32;

        let mut buf4 = [0u8; 4];
        for offset in &self.offsets {
            LittleEndian::write_u32(&mut buf4, *offset);
            self.result.extend_from_slice(&buf4);
        }

        LittleEndian::write_u32(&mut buf4, array_start);
        self.result.extend_from_slice(&buf4);
        self.result.push(FILTER_BASE_LG);

        self.result
    }
}

pub struct FilterBlockReader {
    data: Vec<u8>,
    array_start: usize,
    partitions: usize,
    base_lg: u8,
}

impl FilterBlockReader {
    /// Parses a filter block; malformed blocks yield `None` and lookups
    /// then skip filtering rather than fail reads
    #[must_use]
    pub fn new(data: Vec<u8>) -> Option<Self> {
        if data.len() < 5 {
            return None;
        }

        let base_lg = data[data.len() - 1];
        let array_start = LittleEndian::read_u32(&data[data.len() - 5..data.len() - 1]) as usize;

        if array_start > data.len() - 5 {
            return None;
        }

        let partitions = (data.len() - 5 - array_start) / 4;

        Some(Self {
            data,
            array_start,
            partitions,
            base_lg,
        })
    }

    fn partition_bounds(&self, idx: usize) -> Option<(usize, usize)> {
        let pos = self.array_start + idx * 4;
        let start = LittleEndian::read_u32(&self.data[pos..pos + 4]) as usize;

        let end = if idx + 1 < self.partitions {
            LittleEndian::read_u32(&self.data[pos + 4..pos + 8]) as usize
        } else {
            self.array_start
        };

        if start > end || end > self.array_start {
            return None;
        }

        Some((start, end))
    }

    /// Whether the partition covering `block_offset` may contain
    /// `user_key`
    #[must_use]
    pub fn key_may_match(&self, block_offset: u64, user_key: &[u8]) -> bool {
        let idx = (block_offset >> self.base_lg) as usize;

        if idx >= self.partitions {
            // Out of range: treat as a potential match
            return true;
        }

        match self.partition_bounds(idx) {
            Some((start, end)) if start < end => {
                BloomPolicy::key_may_match(user_key, &self.data[start..end])
            }
            // An empty partition covers a gap with no keys
            Some(_) => false,
            None => true,
        }
    }
}
