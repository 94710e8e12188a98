//! Sorted string tables.
//!
//! A table file is a run of prefix-compressed data blocks followed by a
//! filter block, a meta-index block, an index block and a fixed-size
//! footer:
//!
//! ```text
//! [data block 0] ... [data block n]
//! [filter block]
//! [meta-index block]   "filter.bloom" -> filter handle
//! [index block]        separator key  -> data block handle
//! [footer; 48 bytes]   meta-index handle | index handle | padding | magic
//! ```
//!
//! Every physical block carries a 5-byte trailer: one compression-type
//! byte and a CRC-32C (little endian) covering the payload and the
//! compression byte.

pub mod block;
pub mod filter_block;
pub mod reader;
pub mod writer;

use crate::coding::{get_uvarint, put_uvarint};

pub const FOOTER_SIZE: usize = 48;
pub const BLOCK_TRAILER_SIZE: usize = 5;
pub const MAGIC: [u8; 8] = [0x57, 0xfb, 0x80, 0x8b, 0x24, 0x75, 0x47, 0xdb];

/// Block compression applied below the checksum framing
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum CompressionType {
    /// Store blocks as-is
    #[default]
    None,

    /// Snappy-compress each block
    Snappy,
}

impl From<CompressionType> for u8 {
    fn from(value: CompressionType) -> Self {
        match value {
            CompressionType::None => 0,
            CompressionType::Snappy => 1,
        }
    }
}

impl TryFrom<u8> for CompressionType {
    type Error = crate::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Snappy),
            _ => Err(crate::Error::UnsupportedCompression(value)),
        }
    }
}

/// Locates a block inside a table file
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct BlockHandle {
    pub offset: u64,
    pub size: u64,
}

impl BlockHandle {
    #[must_use]
    pub fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    pub fn encode_into(&self, dst: &mut Vec<u8>) {
        put_uvarint(dst, self.offset);
        put_uvarint(dst, self.size);
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(10);
        self.encode_into(&mut out);
        out
    }

    pub fn decode(buf: &[u8]) -> crate::Result<(Self, usize)> {
        let (offset, n) =
            get_uvarint(buf).ok_or_else(|| corruption("bad block handle offset"))?;
        let (size, m) =
            get_uvarint(&buf[n..]).ok_or_else(|| corruption("bad block handle size"))?;

        Ok((Self { offset, size }, n + m))
    }
}

/// The fixed-size tail of every table file
#[derive(Copy, Clone, Debug)]
pub struct Footer {
    pub meta_index: BlockHandle,
    pub index: BlockHandle,
}

impl Footer {
    #[must_use]
    pub fn encode(&self) -> [u8; FOOTER_SIZE] {
        let mut out = Vec::with_capacity(FOOTER_SIZE);
        self.meta_index.encode_into(&mut out);
        self.index.encode_into(&mut out);
        out.resize(FOOTER_SIZE - MAGIC.len(), 0);
        out.extend_from_slice(&MAGIC);

        out.try_into().expect("footer is fixed size")
    }

    pub fn decode(buf: &[u8]) -> crate::Result<Self> {
        if buf.len() != FOOTER_SIZE {
            return Err(corruption("footer has wrong length"));
        }

        if buf[FOOTER_SIZE - MAGIC.len()..] != MAGIC {
            return Err(corruption("bad footer magic"));
        }

        let (meta_index, n) = BlockHandle::decode(buf)?;
        let (index, _) = BlockHandle::decode(&buf[n..])?;

        Ok(Self { meta_index, index })
    }
}

fn corruption(msg: &str) -> crate::Error {
    crate::Error::Corruption(format!("table: {msg}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn block_handle_roundtrip() -> crate::Result<()> {
        let handle = BlockHandle::new(123_456_789, 4_096);
        let encoded = handle.encode();

        let (decoded, read) = BlockHandle::decode(&encoded)?;
        assert_eq!(handle, decoded);
        assert_eq!(encoded.len(), read);

        Ok(())
    }

    #[test]
    fn footer_roundtrip() -> crate::Result<()> {
        let footer = Footer {
            meta_index: BlockHandle::new(1_000, 64),
            index: BlockHandle::new(1_069, 512),
        };

        let encoded = footer.encode();
        assert_eq!(FOOTER_SIZE, encoded.len());
        assert_eq!(MAGIC, encoded[FOOTER_SIZE - 8..]);

        let decoded = Footer::decode(&encoded)?;
        assert_eq!(footer.meta_index, decoded.meta_index);
        assert_eq!(footer.index, decoded.index);

        Ok(())
    }

    #[test]
    fn footer_rejects_bad_magic() {
        let footer = Footer {
            meta_index: BlockHandle::new(0, 1),
            index: BlockHandle::new(1, 1),
        };

        let mut encoded = footer.encode();
        encoded[FOOTER_SIZE - 1] ^= 0xff;

        assert!(matches!(
            Footer::decode(&encoded),
            Err(crate::Error::Corruption(_))
        ));
    }
}
