//! Reads table files: point lookups and ordered iteration.

use super::{
    block::Block, filter_block::FilterBlockReader, BlockHandle, CompressionType, Footer,
    BLOCK_TRAILER_SIZE, FOOTER_SIZE,
};
use crate::{
    block_cache::BlockCache,
    bloom::FILTER_POLICY_NAME,
    coding::crc32c_pair,
    iter::{BoxedIter, Iter, TwoLevelIter},
    key,
    storage::RandomAccessFile,
};
use byteorder::{ByteOrder, LittleEndian};
use std::{cmp::Ordering, sync::Arc};

/// An open table file
pub struct Table {
    file: Arc<dyn RandomAccessFile>,
    file_num: u64,
    index: Arc<Block>,
    filter: Option<FilterBlockReader>,
    block_cache: Arc<BlockCache>,
}

impl Table {
    /// Opens a table: reads and verifies the footer, the index block and
    /// the bloom filter
    pub fn open(
        file_num: u64,
        file: Arc<dyn RandomAccessFile>,
        block_cache: Arc<BlockCache>,
    ) -> crate::Result<Self> {
        let file_size = file.len()?;

        if file_size < FOOTER_SIZE as u64 {
            return Err(crate::Error::Corruption(format!(
                "table {file_num} is shorter than a footer"
            )));
        }

        let mut footer_buf = [0u8; FOOTER_SIZE];
        read_fully(&*file, &mut footer_buf, file_size - FOOTER_SIZE as u64)?;
        let footer = Footer::decode(&footer_buf)?;

        let index = Arc::new(Block::new(read_block_contents(&*file, footer.index)?)?);

        let filter = load_filter(&*file, footer.meta_index).unwrap_or_else(|e| {
            log::warn!("table {file_num}: dropping unreadable filter block: {e:?}");
            None
        });

        Ok(Self {
            file,
            file_num,
            index,
            filter,
            block_cache,
        })
    }

    fn load_data_block(&self, handle: BlockHandle) -> crate::Result<Arc<Block>> {
        if let Some(block) = self.block_cache.get(self.file_num, handle.offset) {
            return Ok(block);
        }

        let block = Arc::new(Block::new(read_block_contents(&*self.file, handle)?)?);
        self.block_cache
            .insert(self.file_num, handle.offset, Arc::clone(&block));

        Ok(block)
    }

    /// Point lookup: returns the first entry with internal key >=
    /// `ikey`, if it lives in the block the index points at (or the
    /// immediately following one).
    pub fn get(&self, ikey: &[u8]) -> crate::Result<Option<(Vec<u8>, Vec<u8>)>> {
        let mut index_iter = self.index.iter();

        if !index_iter.seek(ikey) {
            index_iter.status()?;
            return Ok(None);
        }

        let (handle, _) = BlockHandle::decode(index_iter.value())?;

        if let Some(filter) = &self.filter {
            if !filter.key_may_match(handle.offset, key::user_key(ikey)) {
                return Ok(None);
            }
        }

        let block = self.load_data_block(handle)?;
        let mut block_iter = block.iter();

        if block_iter.seek(ikey) {
            return Ok(Some((block_iter.key().to_vec(), block_iter.value().to_vec())));
        }
        block_iter.status()?;

        // The index separator can under-shoot by one block; retry once
        if !index_iter.next() {
            index_iter.status()?;
            return Ok(None);
        }

        let (handle, _) = BlockHandle::decode(index_iter.value())?;
        let block = self.load_data_block(handle)?;
        let mut block_iter = block.iter();

        if block_iter.seek(ikey) {
            return Ok(Some((block_iter.key().to_vec(), block_iter.value().to_vec())));
        }
        block_iter.status()?;

        Ok(None)
    }

    /// Ordered cursor over the whole table
    #[must_use]
    pub fn iter(self: &Arc<Self>) -> BoxedIter {
        let table = Arc::clone(self);

        Box::new(TwoLevelIter::new(
            Box::new(self.index.iter()),
            Box::new(move |handle_bytes: &[u8]| {
                let (handle, _) = BlockHandle::decode(handle_bytes)?;
                let block = table.load_data_block(handle)?;
                Ok(Box::new(block.iter()) as BoxedIter)
            }),
        ))
    }
}

fn read_fully(
    file: &dyn RandomAccessFile,
    buf: &mut [u8],
    offset: u64,
) -> crate::Result<()> {
    let n = file.read_at(buf, offset)?;

    if n != buf.len() {
        return Err(crate::Error::Corruption(format!(
            "short read: wanted {} bytes at {offset}, got {n}",
            buf.len(),
        )));
    }

    Ok(())
}

/// Reads a physical block, verifies its checksum and undoes compression
fn read_block_contents(
    file: &dyn RandomAccessFile,
    handle: BlockHandle,
) -> crate::Result<Vec<u8>> {
    // NOTE: Truncation is fine, blocks are bounded by file size
    #[allow(clippy::cast_possible_truncation)]
    let mut raw = vec![0u8; handle.size as usize + BLOCK_TRAILER_SIZE];
    read_fully(file, &mut raw, handle.offset)?;

    let (payload, trailer) = raw.split_at(raw.len() - BLOCK_TRAILER_SIZE);
    let compression_byte = trailer[0];
    let expected_crc = LittleEndian::read_u32(&trailer[1..5]);

    if crc32c_pair(payload, &trailer[..1]) != expected_crc {
        return Err(crate::Error::Corruption(format!(
            "block checksum mismatch at offset {}",
            handle.offset
        )));
    }

    match CompressionType::try_from(compression_byte)? {
        CompressionType::None => Ok(payload.to_vec()),
        CompressionType::Snappy => snap::raw::Decoder::new()
            .decompress_vec(payload)
            .map_err(|e| crate::Error::Corruption(format!("snappy decompression failed: {e}"))),
    }
}

fn load_filter(
    file: &dyn RandomAccessFile,
    meta_index_handle: BlockHandle,
) -> crate::Result<Option<FilterBlockReader>> {
    let meta_block = Arc::new(Block::new(read_block_contents(file, meta_index_handle)?)?);
    let filter_key = format!("filter.{FILTER_POLICY_NAME}");

    // The meta-index holds raw string keys; walk it linearly instead of
    // seeking with the internal-key comparator
    let mut iter = meta_block.iter();
    let mut valid = iter.seek_first();

    while valid {
        if iter.key() == filter_key.as_bytes() {
            let (handle, _) = BlockHandle::decode(iter.value())?;
            let contents = read_block_contents(file, handle)?;
            return Ok(FilterBlockReader::new(contents));
        }
        valid = iter.next();
    }
    iter.status()?;

    Ok(None)
}

/// The entry a lookup found, already split into its parts
pub fn parse_lookup(
    found: Option<(Vec<u8>, Vec<u8>)>,
    user_key: &[u8],
) -> crate::Result<Option<(key::ValueType, Vec<u8>)>> {
    let Some((ikey, value)) = found else {
        return Ok(None);
    };

    let (found_user_key, value_type, _) = key::parse(&ikey)?;

    if found_user_key.cmp(user_key) == Ordering::Equal {
        Ok(Some((value_type, value)))
    } else {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        key::{build, ValueType, MAX_SEQNO},
        storage::testing::MemFile,
        table::writer::TableWriter,
    };
    use test_log::test;

    fn write_table(
        items: &[(Vec<u8>, Vec<u8>)],
        compression: CompressionType,
    ) -> (MemFile, u64) {
        let file = MemFile::default();
        let mut writer = TableWriter::new(Box::new(file.clone()), 2_048, 16, compression, 10);

        for (k, v) in items {
            writer.append(k, v).expect("append should work");
        }

        let (size, ..) = writer.finish().expect("finish should work");
        (file, size)
    }

    fn items(count: usize) -> Vec<(Vec<u8>, Vec<u8>)> {
        (0..count)
            .map(|i| {
                (
                    build(format!("key{i:05}").as_bytes(), i as u64 + 1, ValueType::Value),
                    format!("value-{i}").repeat(4).into_bytes(),
                )
            })
            .collect()
    }

    fn open_table(file: MemFile) -> Arc<Table> {
        let cache = Arc::new(BlockCache::with_capacity_bytes(1_000_000));
        Arc::new(Table::open(1, Arc::new(file), cache).expect("open should work"))
    }

    #[test]
    fn roundtrip_seek_every_key() -> crate::Result<()> {
        for compression in [CompressionType::None, CompressionType::Snappy] {
            let items = items(1_000);
            let (file, size) = write_table(&items, compression);
            assert_eq!(size, file.bytes().len() as u64);

            let table = open_table(file);

            for (k, v) in &items {
                let found = table.get(k)?;
                let (ikey, value) = found.expect("key should be found");
                assert_eq!(k, &ikey);
                assert_eq!(v, &value);
            }
        }

        Ok(())
    }

    #[test]
    fn roundtrip_full_iteration() -> crate::Result<()> {
        let items = items(1_000);
        let (file, _) = write_table(&items, CompressionType::None);
        let table = open_table(file);

        let mut iter = table.iter();
        let mut seen = Vec::new();
        let mut valid = iter.seek_first();

        while valid {
            seen.push((iter.key().to_vec(), iter.value().to_vec()));
            valid = iter.next();
        }

        iter.status()?;
        assert_eq!(items, seen);

        Ok(())
    }

    #[test]
    fn seek_skips_to_later_block() -> crate::Result<()> {
        let items = items(1_000);
        let (file, _) = write_table(&items, CompressionType::None);
        let table = open_table(file);

        let mut iter = table.iter();
        let target = build(b"key00500", MAX_SEQNO, ValueType::Tombstone);
        assert!(iter.seek(&target));
        assert_eq!(items[500].0, iter.key());

        assert!(iter.next());
        assert_eq!(items[501].0, iter.key());

        Ok(())
    }

    #[test]
    fn get_misses_cleanly() -> crate::Result<()> {
        let items = items(100);
        let (file, _) = write_table(&items, CompressionType::None);
        let table = open_table(file);

        let absent = build(b"key00050x", MAX_SEQNO, ValueType::Tombstone);
        let found = table.get(&absent)?;
        let resolved = parse_lookup(found, b"key00050x")?;
        assert!(resolved.is_none());

        let past_end = build(b"zzz", MAX_SEQNO, ValueType::Tombstone);
        assert!(table.get(&past_end)?.is_none());

        Ok(())
    }

    #[test]
    fn out_of_order_append_is_invalid_argument() {
        let file = MemFile::default();
        let mut writer =
            TableWriter::new(Box::new(file), 2_048, 16, CompressionType::None, 10);

        writer
            .append(&build(b"b", 1, ValueType::Value), b"v")
            .expect("append should work");

        let result = writer.append(&build(b"a", 1, ValueType::Value), b"v");
        assert!(matches!(result, Err(crate::Error::InvalidArgument(_))));
    }

    #[test]
    fn corrupt_block_is_detected() {
        let items = items(200);
        let (file, _) = write_table(&items, CompressionType::None);

        // Flip a byte in the first data block
        let mut bytes = file.bytes();
        bytes[10] ^= 0xff;
        file.set_bytes(bytes);

        let table = open_table(file);
        let result = table.get(&items[0].0);
        assert!(matches!(result, Err(crate::Error::Corruption(_))));
    }

    #[test]
    fn unknown_compression_byte_is_surfaced() {
        let items = items(200);
        let (file, _) = write_table(&items, CompressionType::None);

        // The first data block's compression byte sits right after its
        // payload; find it via the index by reopening the raw bytes
        let table = open_table(file.clone());
        let mut index_iter = table.index.iter();
        assert!(index_iter.seek_first());
        let (handle, _) = BlockHandle::decode(index_iter.value()).expect("handle decodes");

        // NOTE: Truncation is fine in tests
        #[allow(clippy::cast_possible_truncation)]
        let type_pos = (handle.offset + handle.size) as usize;

        let mut bytes = file.bytes();
        bytes[type_pos] = 9;
        // Fix up the checksum so the compression byte is what fails
        let crc = crc32c_pair(
            &bytes[handle.offset as usize..type_pos],
            &bytes[type_pos..=type_pos],
        );
        LittleEndian::write_u32(&mut bytes[type_pos + 1..type_pos + 5], crc);
        file.set_bytes(bytes);

        let table = open_table(file);
        let result = table.get(&items[0].0);
        assert!(matches!(
            result,
            Err(crate::Error::UnsupportedCompression(9))
        ));
    }
}
