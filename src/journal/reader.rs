use super::{RecordKind, BLOCK_SIZE, HEADER_SIZE};
use crate::{coding::crc32c, storage::SequentialFile};
use byteorder::{ByteOrder, LittleEndian};

/// Outcome of reading one logical record
#[derive(Debug, Eq, PartialEq)]
pub enum ReadRecord {
    /// A complete record payload
    Record(Vec<u8>),

    /// The current block was corrupt (bad checksum, bad kind, truncated
    /// fragment); the reader has resynchronized at the next block
    /// boundary and can continue
    Skipped,

    /// End of the log
    Eof,
}

enum Physical {
    Fragment(RecordKind, Vec<u8>),
    Bad,
    Eof,
}

/// Reads logical records back out of a block-framed log.
///
/// The reader never surfaces a partial record: callers get a complete
/// payload, a [`ReadRecord::Skipped`] marker to continue over localized
/// corruption, or EOF. A record whose trailing fragments are missing at
/// the end of the log is dropped silently, matching the crash semantics
/// of a writer that died mid-append.
pub struct Reader {
    file: Box<dyn SequentialFile>,
    buf: Vec<u8>,
    buf_pos: usize,
    hit_eof: bool,
}

impl Reader {
    #[must_use]
    pub fn new(file: Box<dyn SequentialFile>) -> Self {
        Self {
            file,
            buf: Vec::with_capacity(BLOCK_SIZE),
            buf_pos: 0,
            hit_eof: false,
        }
    }

    /// Reads the next logical record
    pub fn read_record(&mut self) -> ReadRecord {
        let mut scratch: Vec<u8> = Vec::new();
        let mut in_fragment = false;

        loop {
            match self.next_physical() {
                Physical::Eof => {
                    // A dangling First/Middle prefix here means the
                    // writer crashed mid-record; the partial record is
                    // dropped
                    return ReadRecord::Eof;
                }
                Physical::Bad => {
                    return ReadRecord::Skipped;
                }
                Physical::Fragment(RecordKind::Full, data) => {
                    return ReadRecord::Record(data);
                }
                Physical::Fragment(RecordKind::First, data) => {
                    scratch = data;
                    in_fragment = true;
                }
                Physical::Fragment(RecordKind::Middle, data) => {
                    if in_fragment {
                        scratch.extend_from_slice(&data);
                    }
                    // A Middle without a First is the tail of a record
                    // whose head was lost to a skipped block; drop it
                }
                Physical::Fragment(RecordKind::Last, data) => {
                    if in_fragment {
                        scratch.extend_from_slice(&data);
                        return ReadRecord::Record(scratch);
                    }
                }
            }
        }
    }

    fn fill_block(&mut self) -> std::io::Result<usize> {
        self.buf.clear();
        self.buf.resize(BLOCK_SIZE, 0);
        self.buf_pos = 0;

        let mut filled = 0;
        while filled < BLOCK_SIZE {
            let n = self.file.read(&mut self.buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        self.buf.truncate(filled);
        Ok(filled)
    }

    fn next_physical(&mut self) -> Physical {
        loop {
            if self.buf.len() - self.buf_pos < HEADER_SIZE {
                if self.hit_eof {
                    return Physical::Eof;
                }

                match self.fill_block() {
                    Ok(0) => {
                        self.hit_eof = true;
                        return Physical::Eof;
                    }
                    Ok(n) => {
                        if n < BLOCK_SIZE {
                            self.hit_eof = true;
                        }
                        continue;
                    }
                    Err(e) => {
                        log::warn!("journal read failed, treating as end of log: {e:?}");
                        self.hit_eof = true;
                        return Physical::Eof;
                    }
                }
            }

            let header = &self.buf[self.buf_pos..self.buf_pos + HEADER_SIZE];
            let expected_crc = LittleEndian::read_u32(&header[0..4]);
            let len = usize::from(LittleEndian::read_u16(&header[4..6]));
            let kind_byte = header[6];

            if kind_byte == 0 && len == 0 && expected_crc == 0 {
                // Zero padding at a block tail; move to the next block
                self.buf_pos = self.buf.len();
                continue;
            }

            let Some(kind) = RecordKind::from_u8(kind_byte) else {
                self.buf_pos = self.buf.len();
                return Physical::Bad;
            };

            if self.buf_pos + HEADER_SIZE + len > self.buf.len() {
                // The header claims more payload than the block holds
                self.buf_pos = self.buf.len();
                if self.hit_eof {
                    // Torn write at the end of the log
                    return Physical::Eof;
                }
                return Physical::Bad;
            }

            let payload =
                &self.buf[self.buf_pos + HEADER_SIZE..self.buf_pos + HEADER_SIZE + len];

            if crc32c(payload) != expected_crc {
                self.buf_pos = self.buf.len();
                return Physical::Bad;
            }

            let payload = payload.to_vec();
            self.buf_pos += HEADER_SIZE + len;

            return Physical::Fragment(kind, payload);
        }
    }
}
