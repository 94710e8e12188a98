//! Serializes sorted entries into a table file.

use super::{
    block::BlockBuilder,
    filter_block::FilterBlockBuilder,
    BlockHandle, CompressionType, Footer,
};
use crate::{
    bloom::{BloomPolicy, FILTER_POLICY_NAME},
    coding::crc32c_pair,
    key,
    storage::WritableFile,
};
use byteorder::{ByteOrder, LittleEndian};
use std::{cmp::Ordering, io::Write};

/// Streams internal-key/value entries, in non-decreasing key order, into
/// the table file layout
pub struct TableWriter {
    file: Box<dyn WritableFile>,
    offset: u64,

    data_block: BlockBuilder,
    index_block: BlockBuilder,
    filter_block: FilterBlockBuilder,

    /// Handle of the last flushed data block, waiting for the next key
    /// so its index separator can be shortened
    pending_handle: Option<BlockHandle>,

    block_size: usize,
    compression: CompressionType,

    first_key: Option<Vec<u8>>,
    last_key: Vec<u8>,
    entry_count: usize,
}

impl TableWriter {
    #[must_use]
    pub fn new(
        file: Box<dyn WritableFile>,
        block_size: usize,
        block_restart_interval: usize,
        compression: CompressionType,
        bloom_bits_per_key: usize,
    ) -> Self {
        Self {
            file,
            offset: 0,
            data_block: BlockBuilder::new(block_restart_interval),
            // Index keys are never prefix-compressed so a seek can land
            // on any of them directly
            index_block: BlockBuilder::new(1),
            filter_block: FilterBlockBuilder::new(BloomPolicy::new(bloom_bits_per_key)),
            pending_handle: None,
            block_size,
            compression,
            first_key: None,
            last_key: Vec::new(),
            entry_count: 0,
        }
    }

    /// Appends one entry; keys must be non-decreasing under internal-key
    /// order
    pub fn append(&mut self, ikey: &[u8], value: &[u8]) -> crate::Result<()> {
        if self.entry_count > 0 && key::compare(&self.last_key, ikey) == Ordering::Greater {
            return Err(crate::Error::InvalidArgument(
                "table keys written out of order".into(),
            ));
        }

        if let Some(handle) = self.pending_handle.take() {
            let separator = key::separator(&self.last_key, ikey);
            self.index_block.add(&separator, &handle.encode());
        }

        self.filter_block.add_key(key::user_key(ikey));

        if self.first_key.is_none() {
            self.first_key = Some(ikey.to_vec());
        }
        self.last_key.clear();
        self.last_key.extend_from_slice(ikey);

        self.data_block.add(ikey, value);
        self.entry_count += 1;

        if self.data_block.size_estimate() >= self.block_size {
            self.flush_data_block()?;
        }

        Ok(())
    }

    fn flush_data_block(&mut self) -> crate::Result<()> {
        debug_assert!(!self.data_block.is_empty());

        let contents = self.data_block.finish();
        let handle = self.write_block(&contents, self.compression)?;

        self.pending_handle = Some(handle);
        self.filter_block.start_block(self.offset);

        Ok(())
    }

    /// Writes one physical block: payload (maybe compressed), the
    /// compression byte and the checksum trailer
    fn write_block(
        &mut self,
        contents: &[u8],
        compression: CompressionType,
    ) -> crate::Result<BlockHandle> {
        let (payload, compression): (std::borrow::Cow<[u8]>, CompressionType) = match compression
        {
            CompressionType::None => (contents.into(), CompressionType::None),
            CompressionType::Snappy => {
                let compressed = snap::raw::Encoder::new()
                    .compress_vec(contents)
                    .map_err(|e| {
                        crate::Error::Corruption(format!("snappy compression failed: {e}"))
                    })?;

                if compressed.len() < contents.len() {
                    (compressed.into(), CompressionType::Snappy)
                } else {
                    // Incompressible block; store it raw
                    (contents.into(), CompressionType::None)
                }
            }
        };

        let handle = BlockHandle::new(self.offset, payload.len() as u64);

        let compression_byte = [u8::from(compression)];
        let mut trailer = [0u8; 5];
        trailer[0] = compression_byte[0];
        LittleEndian::write_u32(
            &mut trailer[1..5],
            crc32c_pair(&payload, &compression_byte),
        );

        self.file.write_all(&payload)?;
        self.file.write_all(&trailer)?;
        self.offset += payload.len() as u64 + trailer.len() as u64;

        Ok(handle)
    }

    /// Finishes the table: filter block, meta-index, index and footer.
    /// Returns `(file size, first key, last key, entry count)`.
    pub fn finish(mut self) -> crate::Result<(u64, Vec<u8>, Vec<u8>, usize)> {
        if !self.data_block.is_empty() {
            self.flush_data_block()?;
        }

        if let Some(handle) = self.pending_handle.take() {
            let successor = key::successor(&self.last_key);
            self.index_block.add(&successor, &handle.encode());
        }

        // Filter blocks are stored raw: they are random bits, and the
        // reader probes them without a block cursor
        let filter_contents = std::mem::replace(
            &mut self.filter_block,
            FilterBlockBuilder::new(BloomPolicy::new(1)),
        )
        .finish();
        let filter_handle = self.write_block(&filter_contents, CompressionType::None)?;

        let mut meta_index = BlockBuilder::new(1);
        meta_index.add(
            format!("filter.{FILTER_POLICY_NAME}").as_bytes(),
            &filter_handle.encode(),
        );
        let meta_contents = meta_index.finish();
        let meta_handle = self.write_block(&meta_contents, self.compression)?;

        let index_contents = self.index_block.finish();
        let index_handle = self.write_block(&index_contents, self.compression)?;

        let footer = Footer {
            meta_index: meta_handle,
            index: index_handle,
        };
        self.file.write_all(&footer.encode())?;
        self.offset += super::FOOTER_SIZE as u64;

        self.file.sync()?;

        let first_key = self.first_key.unwrap_or_default();
        Ok((self.offset, first_key, self.last_key, self.entry_count))
    }

    /// Bytes written so far; grows as data blocks are flushed
    #[must_use]
    pub fn file_size(&self) -> u64 {
        self.offset
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entry_count == 0
    }
}
