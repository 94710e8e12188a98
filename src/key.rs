//! Internal key encoding and ordering.
//!
//! An internal key is the user key followed by an 8-byte little-endian
//! trailer packing `(sequence << 8) | value_type`. Internal keys order by
//! user key ascending, then by sequence number *descending*, so the most
//! recent version of a key is seen first in an ordered scan.

use byteorder::{ByteOrder, LittleEndian};
use std::{cmp::Ordering, sync::Arc};

/// User defined key
pub type UserKey = Arc<[u8]>;

/// User defined data (blob of bytes)
pub type UserValue = Arc<[u8]>;

/// Sequence number, a monotonically increasing counter.
///
/// An item with a higher sequence number shadows an item with the same
/// user key and a lower sequence number.
pub type SeqNo = u64;

/// The sequence space is 56 bits wide; the low byte of the trailer holds
/// the value type.
pub const MAX_SEQNO: SeqNo = (1 << 56) - 1;

pub const TRAILER_SIZE: usize = 8;

/// Value type (regular value or tombstone)
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ValueType {
    /// Existing value
    Value,

    /// Deleted value
    Tombstone,
}

impl From<ValueType> for u8 {
    fn from(value: ValueType) -> Self {
        match value {
            ValueType::Value => 0,
            ValueType::Tombstone => 1,
        }
    }
}

impl TryFrom<u8> for ValueType {
    type Error = crate::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Value),
            1 => Ok(Self::Tombstone),
            _ => Err(crate::Error::Corruption(format!(
                "invalid value type: {value}"
            ))),
        }
    }
}

/// Outcome of a point lookup
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Lookup {
    /// The key exists and this is its most recent value
    Found(UserValue),

    /// The most recent version of the key is a tombstone
    Deleted,

    /// The key was never written (or was compacted away entirely)
    NotFound,
}

/// Builds an internal key from its parts
#[must_use]
pub fn build(user_key: &[u8], seqno: SeqNo, value_type: ValueType) -> Vec<u8> {
    let mut ikey = Vec::with_capacity(user_key.len() + TRAILER_SIZE);
    ikey.extend_from_slice(user_key);

    let mut trailer = [0u8; TRAILER_SIZE];
    LittleEndian::write_u64(&mut trailer, (seqno << 8) | u64::from(u8::from(value_type)));
    ikey.extend_from_slice(&trailer);

    ikey
}

/// Splits an internal key into `(user_key, value_type, seqno)`
pub fn parse(ikey: &[u8]) -> crate::Result<(&[u8], ValueType, SeqNo)> {
    if ikey.len() < TRAILER_SIZE {
        return Err(crate::Error::Corruption(format!(
            "internal key too short: {} bytes",
            ikey.len()
        )));
    }

    let trailer = LittleEndian::read_u64(&ikey[ikey.len() - TRAILER_SIZE..]);

    // NOTE: Truncation is okay and actually needed
    #[allow(clippy::cast_possible_truncation)]
    let value_type = ValueType::try_from(trailer as u8)?;

    Ok((
        &ikey[..ikey.len() - TRAILER_SIZE],
        value_type,
        trailer >> 8,
    ))
}

/// The user-key portion of an internal key
#[must_use]
pub fn user_key(ikey: &[u8]) -> &[u8] {
    debug_assert!(ikey.len() >= TRAILER_SIZE);
    &ikey[..ikey.len().saturating_sub(TRAILER_SIZE)]
}

fn trailer(ikey: &[u8]) -> u64 {
    debug_assert!(ikey.len() >= TRAILER_SIZE);
    if ikey.len() < TRAILER_SIZE {
        return 0;
    }
    LittleEndian::read_u64(&ikey[ikey.len() - TRAILER_SIZE..])
}

/// The sequence number packed into an internal key
#[must_use]
pub fn seqno(ikey: &[u8]) -> SeqNo {
    trailer(ikey) >> 8
}

/// Total order over internal keys: user key ascending, then sequence
/// number descending (newest first)
#[must_use]
pub fn compare(a: &[u8], b: &[u8]) -> Ordering {
    match user_key(a).cmp(user_key(b)) {
        Ordering::Equal => trailer(b).cmp(&trailer(a)),
        ord => ord,
    }
}

/// Shortest user key `x` with `a <= x < b`, found by bumping the first
/// byte where `a[i] + 1 < b[i]`. Falls back to `a` when no shorter
/// separator exists.
#[must_use]
pub fn user_separator(a: &[u8], b: &[u8]) -> Vec<u8> {
    let shared = a
        .iter()
        .zip(b.iter())
        .take_while(|(x, y)| x == y)
        .count();

    if shared < a.len().min(b.len()) {
        let c = a[shared];
        if c < 0xff && c + 1 < b[shared] {
            let mut out = a[..=shared].to_vec();
            *out.last_mut().expect("separator is never empty") += 1;
            return out;
        }
    }

    a.to_vec()
}

/// Smallest user key strictly greater than `a` by the same byte-bump
/// rule; returns `a` unchanged when every byte is `0xff`
#[must_use]
pub fn user_successor(a: &[u8]) -> Vec<u8> {
    for (idx, c) in a.iter().enumerate() {
        if *c < 0xff {
            let mut out = a[..=idx].to_vec();
            *out.last_mut().expect("successor is never empty") += 1;
            return out;
        }
    }

    a.to_vec()
}

fn seek_trailer() -> [u8; TRAILER_SIZE] {
    let mut out = [0u8; TRAILER_SIZE];
    LittleEndian::write_u64(&mut out, (MAX_SEQNO << 8) | u64::from(u8::from(ValueType::Value)));
    out
}

/// Index separator over internal keys.
///
/// When the user key can actually be shortened, the result gets the
/// maximum-sequence trailer so it sorts before any real entry with the
/// same user key. When it cannot, the full internal key `a` is kept, so
/// the index key never sorts below the block's last entry.
#[must_use]
pub fn separator(a: &[u8], b: &[u8]) -> Vec<u8> {
    let sep = user_separator(user_key(a), user_key(b));

    if sep.len() < user_key(a).len() && sep.as_slice() > user_key(a) {
        let mut out = sep;
        out.extend_from_slice(&seek_trailer());
        debug_assert!(compare(a, &out) == Ordering::Less);
        return out;
    }

    a.to_vec()
}

/// Index successor over internal keys, same shortening rule as
/// [`separator`]
#[must_use]
pub fn successor(a: &[u8]) -> Vec<u8> {
    let succ = user_successor(user_key(a));

    if succ.as_slice() > user_key(a) {
        let mut out = succ;
        out.extend_from_slice(&seek_trailer());
        debug_assert!(compare(a, &out) == Ordering::Less);
        return out;
    }

    a.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn build_parse_roundtrip() -> crate::Result<()> {
        let ikey = build(b"abc", 42, ValueType::Value);
        assert_eq!(11, ikey.len());

        let (ukey, vtype, seq) = parse(&ikey)?;
        assert_eq!(b"abc", ukey);
        assert_eq!(ValueType::Value, vtype);
        assert_eq!(42, seq);

        let ikey = build(b"", MAX_SEQNO, ValueType::Tombstone);
        let (ukey, vtype, seq) = parse(&ikey)?;
        assert!(ukey.is_empty());
        assert_eq!(ValueType::Tombstone, vtype);
        assert_eq!(MAX_SEQNO, seq);

        Ok(())
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse(b"short").is_err());

        let mut ikey = build(b"abc", 1, ValueType::Value);
        let end = ikey.len() - TRAILER_SIZE;
        ikey[end] = 7; // bogus value type
        assert!(parse(&ikey).is_err());
    }

    #[test]
    fn ordering_user_key_ascending_seqno_descending() {
        let a1 = build(b"a", 1, ValueType::Value);
        let a9 = build(b"a", 9, ValueType::Value);
        let b0 = build(b"b", 0, ValueType::Value);

        assert_eq!(Ordering::Less, compare(&a9, &a1));
        assert_eq!(Ordering::Greater, compare(&a1, &a9));
        assert_eq!(Ordering::Less, compare(&a1, &b0));
        assert_eq!(Ordering::Equal, compare(&a1, &a1));
    }

    #[test]
    fn user_separator_bumps_first_divergent_byte() {
        assert_eq!(b"b".to_vec(), user_separator(b"abc", b"zzz"));
        assert_eq!(b"abc".to_vec(), user_separator(b"abc", b"abd"));
        assert_eq!(b"abc".to_vec(), user_separator(b"abc", b"abcdef"));
        assert_eq!(b"ac".to_vec(), user_separator(b"abzzz", b"ae"));
    }

    #[test]
    fn user_successor_handles_max_bytes() {
        assert_eq!(b"b".to_vec(), user_successor(b"abc"));
        assert_eq!(vec![0xff, 0xff, b'b'], user_successor(&[0xff, 0xff, b'a']));
        assert_eq!(vec![0xff, 0xff], user_successor(&[0xff, 0xff]));
    }

    #[test]
    fn separator_never_sorts_below_block_end() {
        // Shortenable: separator is (shortened ukey, MAX_SEQNO)
        let a = build(b"abc", 5, ValueType::Value);
        let b = build(b"xyz", 7, ValueType::Value);
        let sep = separator(&a, &b);
        assert!(compare(&a, &sep) != Ordering::Greater);
        assert!(compare(&sep, &b) == Ordering::Less);

        // Not shortenable: separator must be the full internal key,
        // otherwise it would sort before `a` (max seqno sorts first)
        let a = build(b"abc", 5, ValueType::Value);
        let b = build(b"abd", 7, ValueType::Value);
        assert_eq!(a, separator(&a, &b));
    }
}
