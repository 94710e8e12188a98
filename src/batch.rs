//! Write batches: the unit of atomicity for all mutations.
//!
//! A batch is an append-only binary log of Put/Delete operations with a
//! fixed header carrying the starting sequence number and the operation
//! count:
//!
//! ```text
//! [sequence; 8 bytes LE] [count; 4 bytes LE] [records...]
//! record = [type; 1 byte] [key len; varint] [key] ([value len; varint] [value])
//! ```
//!
//! The serialized form is exactly what gets appended to the journal, so
//! replaying a journal record is just decoding a batch.

use crate::{
    coding::{get_uvarint, put_uvarint},
    key::{SeqNo, ValueType},
};
use byteorder::{ByteOrder, LittleEndian};

pub const BATCH_HEADER_SIZE: usize = 12;

/// Visitor receiving the decoded operations of a batch, each with its
/// assigned sequence number
pub trait BatchVisitor {
    fn put(&mut self, key: &[u8], seqno: SeqNo, value: &[u8]);
    fn delete(&mut self, key: &[u8], seqno: SeqNo);
}

/// An ordered set of operations applied atomically
#[derive(Clone)]
pub struct WriteBatch {
    rep: Vec<u8>,
    count: u32,
}

impl Default for WriteBatch {
    fn default() -> Self {
        Self {
            rep: vec![0; BATCH_HEADER_SIZE],
            count: 0,
        }
    }
}

impl WriteBatch {
    /// Creates an empty batch
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a key-value insertion
    pub fn put<K: AsRef<[u8]>, V: AsRef<[u8]>>(&mut self, key: K, value: V) {
        let key = key.as_ref();
        let value = value.as_ref();

        self.count += 1;
        self.rep.push(u8::from(ValueType::Value));
        put_uvarint(&mut self.rep, key.len() as u64);
        self.rep.extend_from_slice(key);
        put_uvarint(&mut self.rep, value.len() as u64);
        self.rep.extend_from_slice(value);
    }

    /// Queues a key deletion (tombstone)
    pub fn delete<K: AsRef<[u8]>>(&mut self, key: K) {
        let key = key.as_ref();

        self.count += 1;
        self.rep.push(u8::from(ValueType::Tombstone));
        put_uvarint(&mut self.rep, key.len() as u64);
        self.rep.extend_from_slice(key);
    }

    /// Number of operations queued
    #[must_use]
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Returns `true` if no operations are queued
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Serialized size in bytes, header included
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.rep.len()
    }

    /// Stamps the starting sequence number of the batch
    pub fn set_sequence(&mut self, seqno: SeqNo) {
        LittleEndian::write_u64(&mut self.rep[0..8], seqno);
    }

    /// The starting sequence number stamped into the header
    #[must_use]
    pub fn sequence(&self) -> SeqNo {
        LittleEndian::read_u64(&self.rep[0..8])
    }

    /// The full serialized representation (journal payload)
    pub fn contents(&mut self) -> &[u8] {
        LittleEndian::write_u32(&mut self.rep[8..12], self.count);
        &self.rep
    }

    /// Reassembles a batch from its serialized representation
    pub fn from_contents(bytes: &[u8]) -> crate::Result<Self> {
        if bytes.len() < BATCH_HEADER_SIZE {
            return Err(crate::Error::Corruption(format!(
                "write batch too short: {} bytes",
                bytes.len()
            )));
        }

        Ok(Self {
            rep: bytes.to_vec(),
            count: LittleEndian::read_u32(&bytes[8..12]),
        })
    }

    /// Appends all operations of `other`, keeping this batch's header
    pub fn append(&mut self, other: &Self) {
        self.count += other.count;
        self.rep.extend_from_slice(&other.rep[BATCH_HEADER_SIZE..]);
    }

    /// Decodes the queued operations in order, handing each to the
    /// visitor with sequence numbers `sequence() + i`
    pub fn iterate<V: BatchVisitor>(&self, visitor: &mut V) -> crate::Result<()> {
        let seqno = self.sequence();
        let mut pos = BATCH_HEADER_SIZE;
        let mut decoded: u32 = 0;

        while pos < self.rep.len() {
            let op = self.rep[pos];
            pos += 1;

            let (key_len, n) = get_uvarint(&self.rep[pos..])
                .ok_or_else(|| corruption("bad key length"))?;
            pos += n;

            // NOTE: Truncation is okay, keys are bounded way below u32::MAX
            #[allow(clippy::cast_possible_truncation)]
            let key_len = key_len as usize;
            let key = self
                .rep
                .get(pos..pos + key_len)
                .ok_or_else(|| corruption("key extends past batch end"))?;
            pos += key_len;

            match ValueType::try_from(op)? {
                ValueType::Value => {
                    let (value_len, n) = get_uvarint(&self.rep[pos..])
                        .ok_or_else(|| corruption("bad value length"))?;
                    pos += n;

                    // NOTE: Truncation is okay, see above
                    #[allow(clippy::cast_possible_truncation)]
                    let value_len = value_len as usize;
                    let value = self
                        .rep
                        .get(pos..pos + value_len)
                        .ok_or_else(|| corruption("value extends past batch end"))?;
                    pos += value_len;

                    visitor.put(key, seqno + SeqNo::from(decoded), value);
                }
                ValueType::Tombstone => {
                    visitor.delete(key, seqno + SeqNo::from(decoded));
                }
            }

            decoded += 1;
        }

        if decoded == self.count {
            Ok(())
        } else {
            Err(corruption("operation count does not match header"))
        }
    }
}

fn corruption(msg: &str) -> crate::Error {
    crate::Error::Corruption(format!("write batch: {msg}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[derive(Default)]
    struct Ops(Vec<(Vec<u8>, SeqNo, Option<Vec<u8>>)>);

    impl BatchVisitor for Ops {
        fn put(&mut self, key: &[u8], seqno: SeqNo, value: &[u8]) {
            self.0.push((key.to_vec(), seqno, Some(value.to_vec())));
        }

        fn delete(&mut self, key: &[u8], seqno: SeqNo) {
            self.0.push((key.to_vec(), seqno, None));
        }
    }

    #[test]
    fn batch_roundtrip() -> crate::Result<()> {
        let mut batch = WriteBatch::new();
        batch.put(b"a", b"1");
        batch.delete(b"b");
        batch.put(b"c", b"");
        batch.set_sequence(100);

        assert_eq!(3, batch.count());
        assert_eq!(100, batch.sequence());

        let decoded = WriteBatch::from_contents(batch.contents())?;
        assert_eq!(3, decoded.count());
        assert_eq!(100, decoded.sequence());

        let mut ops = Ops::default();
        decoded.iterate(&mut ops)?;

        assert_eq!(
            vec![
                (b"a".to_vec(), 100, Some(b"1".to_vec())),
                (b"b".to_vec(), 101, None),
                (b"c".to_vec(), 102, Some(Vec::new())),
            ],
            ops.0
        );

        Ok(())
    }

    #[test]
    fn append_preserves_leader_header() -> crate::Result<()> {
        let mut leader = WriteBatch::new();
        leader.put(b"a", b"1");
        leader.set_sequence(7);

        let mut follower = WriteBatch::new();
        follower.delete(b"b");
        follower.set_sequence(9_999); // follower header is discarded

        leader.append(&follower);

        assert_eq!(2, leader.count());
        assert_eq!(7, leader.sequence());

        let mut ops = Ops::default();
        leader.iterate(&mut ops)?;
        assert_eq!(
            vec![
                (b"a".to_vec(), 7, Some(b"1".to_vec())),
                (b"b".to_vec(), 8, None),
            ],
            ops.0
        );

        Ok(())
    }

    #[test]
    fn malformed_batch_is_corruption() {
        assert!(WriteBatch::from_contents(b"short").is_err());

        let mut batch = WriteBatch::new();
        batch.put(b"a", b"1");

        let mut bytes = batch.contents().to_vec();
        bytes[BATCH_HEADER_SIZE] = 9; // invalid op type

        let decoded = WriteBatch::from_contents(&bytes).expect("header is fine");
        let mut ops = Ops::default();
        assert!(decoded.iterate(&mut ops).is_err());

        // Count mismatch
        let mut batch = WriteBatch::new();
        batch.put(b"a", b"1");
        let mut bytes = batch.contents().to_vec();
        bytes[8] = 2;
        let decoded = WriteBatch::from_contents(&bytes).expect("header is fine");
        let mut ops = Ops::default();
        assert!(decoded.iterate(&mut ops).is_err());
    }
}
