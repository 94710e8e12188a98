//! Block-framed record log with per-fragment checksums.
//!
//! The journal is a stream of 32 KiB blocks. Each block holds one or
//! more physical records with a 7-byte header:
//!
//! ```text
//! [crc32c; 4 bytes LE] [length; 2 bytes LE] [kind; 1 byte]
//! ```
//!
//! A logical record that does not fit in the remaining space of a block
//! is split into First/Middle.../Last fragments; block tails shorter than
//! a header are zero-padded. The checksum covers the fragment payload, so
//! one corrupt block never bleeds into records that start in later
//! blocks.
//!
//! The same codec carries both the write-ahead journal and the manifest.

mod reader;
mod writer;

pub use reader::{ReadRecord, Reader};
pub use writer::Writer;

pub const BLOCK_SIZE: usize = 32 * 1_024;
pub const HEADER_SIZE: usize = 7;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RecordKind {
    Full = 1,
    First = 2,
    Middle = 3,
    Last = 4,
}

impl RecordKind {
    pub(crate) fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Full),
            2 => Some(Self::First),
            3 => Some(Self::Middle),
            4 => Some(Self::Last),
            _ => None,
        }
    }
}
