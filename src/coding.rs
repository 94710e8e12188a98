//! Varint and checksum primitives shared by the journal, table and
//! manifest codecs.

use crc::{Crc, CRC_32_ISCSI};

pub const CRC32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// CRC-32C (Castagnoli) over a single buffer
#[must_use]
pub fn crc32c(data: &[u8]) -> u32 {
    CRC32C.checksum(data)
}

/// CRC-32C over two concatenated buffers without copying them together
#[must_use]
pub fn crc32c_pair(a: &[u8], b: &[u8]) -> u32 {
    let mut digest = CRC32C.digest();
    digest.update(a);
    digest.update(b);
    digest.finalize()
}

pub const MAX_VARINT_LEN: usize = 10;

/// Appends `v` to `dst` as a LEB128 varint
pub fn put_uvarint(dst: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        // NOTE: Truncation is okay and actually needed
        #[allow(clippy::cast_possible_truncation)]
        dst.push((v as u8) | 0x80);
        v >>= 7;
    }
    // NOTE: Truncation is okay and actually needed
    #[allow(clippy::cast_possible_truncation)]
    dst.push(v as u8);
}

/// Decodes a LEB128 varint from the front of `buf`.
///
/// Returns the value and the number of bytes consumed, or `None` if the
/// buffer ends mid-varint or the value overflows 64 bits.
#[must_use]
pub fn get_uvarint(buf: &[u8]) -> Option<(u64, usize)> {
    let mut value: u64 = 0;
    let mut shift = 0u32;

    for (idx, byte) in buf.iter().enumerate() {
        if idx >= MAX_VARINT_LEN {
            return None;
        }

        if *byte < 0x80 {
            if idx == MAX_VARINT_LEN - 1 && *byte > 1 {
                return None;
            }
            value |= u64::from(*byte) << shift;
            return Some((value, idx + 1));
        }

        value |= u64::from(byte & 0x7f) << shift;
        shift += 7;
    }

    None
}
