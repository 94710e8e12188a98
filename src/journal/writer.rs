use super::{RecordKind, BLOCK_SIZE, HEADER_SIZE};
use crate::{coding::crc32c, storage::WritableFile};
use byteorder::{ByteOrder, LittleEndian};
use std::io::Write;

const ZEROES: [u8; HEADER_SIZE] = [0; HEADER_SIZE];

/// Appends logical records to a block-framed log file
pub struct Writer {
    file: Box<dyn WritableFile>,
    block_offset: usize,
    written: u64,
}

impl Writer {
    #[must_use]
    pub fn new(file: Box<dyn WritableFile>) -> Self {
        Self {
            file,
            block_offset: 0,
            written: 0,
        }
    }

    /// Bytes appended so far (headers and padding included); used to
    /// decide when the manifest grows too large
    #[must_use]
    pub fn len(&self) -> u64 {
        self.written
    }

    /// Appends one logical record, fragmenting it across blocks as
    /// needed
    pub fn append(&mut self, chunk: &[u8]) -> crate::Result<()> {
        let mut left = chunk;
        let mut begin = true;

        loop {
            let leftover = BLOCK_SIZE - self.block_offset;

            if leftover < HEADER_SIZE {
                // Not even a header fits; pad out the block
                if leftover > 0 {
                    self.file.write_all(&ZEROES[..leftover])?;
                    self.written += leftover as u64;
                }
                self.block_offset = 0;
            }

            let avail = BLOCK_SIZE - self.block_offset - HEADER_SIZE;
            let fragment_len = left.len().min(avail);
            let end = fragment_len == left.len();

            let kind = match (begin, end) {
                (true, true) => RecordKind::Full,
                (true, false) => RecordKind::First,
                (false, false) => RecordKind::Middle,
                (false, true) => RecordKind::Last,
            };

            self.emit(kind, &left[..fragment_len])?;

            left = &left[fragment_len..];
            begin = false;

            if end {
                break;
            }
        }

        Ok(())
    }

    fn emit(&mut self, kind: RecordKind, payload: &[u8]) -> crate::Result<()> {
        debug_assert!(self.block_offset + HEADER_SIZE + payload.len() <= BLOCK_SIZE);

        let mut header = [0u8; HEADER_SIZE];
        LittleEndian::write_u32(&mut header[0..4], crc32c(payload));

        // NOTE: Truncation is okay, fragments never exceed a block
        #[allow(clippy::cast_possible_truncation)]
        LittleEndian::write_u16(&mut header[4..6], payload.len() as u16);
        header[6] = kind as u8;

        self.file.write_all(&header)?;
        self.file.write_all(payload)?;

        self.block_offset += HEADER_SIZE + payload.len();
        self.written += (HEADER_SIZE + payload.len()) as u64;

        Ok(())
    }

    /// Pushes buffered bytes down to the OS
    pub fn flush(&mut self) -> crate::Result<()> {
        self.file.flush()?;
        Ok(())
    }

    /// Flushes and asks the OS to persist the file contents
    pub fn sync(&mut self) -> crate::Result<()> {
        self.file.sync()?;
        Ok(())
    }
}
