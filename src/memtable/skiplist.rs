//! Arena-backed skip list over internal keys.
//!
//! Keys and values live in one packed byte arena; nodes address their
//! payload by offset and link to each other by index, so there are no
//! owning-pointer cycles and no unsafe code. The arena is append-only
//! and nodes are never unlinked, which keeps node indices stable for
//! iterators that re-enter the list between steps.

use crate::key;
use std::cmp::Ordering;

pub const MAX_HEIGHT: usize = 12;
const BRANCHING: u64 = 4;

/// Sentinel: node 0 is the head, and a next-link of 0 means "none"
pub const NIL: u32 = 0;

struct Node {
    kv_offset: usize,
    key_len: usize,
    value_len: usize,
    next: Vec<u32>,
}

pub struct SkipList {
    nodes: Vec<Node>,
    kv_data: Vec<u8>,
    height: usize,
    rng_state: u64,
    len: usize,
    kv_size: usize,
}

impl SkipList {
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            nodes: vec![Node {
                kv_offset: 0,
                key_len: 0,
                value_len: 0,
                next: vec![NIL; MAX_HEIGHT],
            }],
            kv_data: Vec::new(),
            height: 1,
            rng_state: seed | 1,
            len: 0,
            kv_size: 0,
        }
    }

    fn next_rand(&mut self) -> u64 {
        // xorshift64
        let mut x = self.rng_state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.rng_state = x;
        x
    }

    fn random_height(&mut self) -> usize {
        let mut height = 1;
        while height < MAX_HEIGHT && self.next_rand() % BRANCHING == 0 {
            height += 1;
        }
        height
    }

    #[must_use]
    pub fn key(&self, node: u32) -> &[u8] {
        let node = &self.nodes[node as usize];
        &self.kv_data[node.kv_offset..node.kv_offset + node.key_len]
    }

    #[must_use]
    pub fn value(&self, node: u32) -> &[u8] {
        let node = &self.nodes[node as usize];
        let start = node.kv_offset + node.key_len;
        &self.kv_data[start..start + node.value_len]
    }

    /// The level-0 successor of `node`, or [`NIL`]
    #[must_use]
    pub fn next(&self, node: u32) -> u32 {
        self.nodes[node as usize].next[0]
    }

    /// The first node in key order, or [`NIL`] for an empty list
    #[must_use]
    pub fn first(&self) -> u32 {
        self.nodes[0].next[0]
    }

    /// Walks down from the top level, recording at `prevs[l]` the last
    /// node at level `l` whose key is < `target`. Returns the first node
    /// with key >= `target` (or [`NIL`]).
    fn find_greater_or_equal(&self, target: &[u8], prevs: &mut [u32; MAX_HEIGHT]) -> u32 {
        let mut node = 0u32;

        for level in (0..self.height).rev() {
            loop {
                let next = self.nodes[node as usize].next[level];
                if next != NIL && key::compare(self.key(next), target) == Ordering::Less {
                    node = next;
                } else {
                    break;
                }
            }
            prevs[level] = node;
        }

        self.nodes[node as usize].next[0]
    }

    /// First node with key >= `target`, or [`NIL`]
    #[must_use]
    pub fn seek(&self, target: &[u8]) -> u32 {
        let mut prevs = [NIL; MAX_HEIGHT];
        self.find_greater_or_equal(target, &mut prevs)
    }

    /// Inserts a key-value pair. Re-inserting an identical key reuses
    /// the node, rewriting the value in place when it fits.
    pub fn insert(&mut self, ikey: &[u8], value: &[u8]) {
        let mut prevs = [NIL; MAX_HEIGHT];
        let found = self.find_greater_or_equal(ikey, &mut prevs);

        if found != NIL && self.key(found) == ikey {
            let old_len = self.nodes[found as usize].value_len;

            if old_len >= value.len() {
                let node = &self.nodes[found as usize];
                let start = node.kv_offset + node.key_len;
                self.kv_data[start..start + value.len()].copy_from_slice(value);
            } else {
                let kv_offset = self.kv_data.len();
                self.kv_data.extend_from_slice(ikey);
                self.kv_data.extend_from_slice(value);
                self.nodes[found as usize].kv_offset = kv_offset;
            }

            self.kv_size = self.kv_size - old_len + value.len();
            self.nodes[found as usize].value_len = value.len();
            return;
        }

        let height = self.random_height();

        if height > self.height {
            for prev in prevs.iter_mut().take(height).skip(self.height) {
                *prev = 0;
            }
            self.height = height;
        }

        let kv_offset = self.kv_data.len();
        self.kv_data.extend_from_slice(ikey);
        self.kv_data.extend_from_slice(value);

        let id = u32::try_from(self.nodes.len()).expect("node space exhausted");
        let mut next = vec![NIL; height];

        for (level, link) in next.iter_mut().enumerate() {
            let prev = prevs[level] as usize;
            *link = self.nodes[prev].next[level];
            self.nodes[prev].next[level] = id;
        }

        self.nodes.push(Node {
            kv_offset,
            key_len: ikey.len(),
            value_len: value.len(),
            next,
        });

        self.len += 1;
        self.kv_size += ikey.len() + value.len();
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Payload bytes held by the arena
    #[must_use]
    pub fn kv_size(&self) -> usize {
        self.kv_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{build, ValueType};
    use test_log::test;

    fn ikey(ukey: &[u8], seq: u64) -> Vec<u8> {
        build(ukey, seq, ValueType::Value)
    }

    #[test]
    fn insert_and_scan_in_order() {
        let mut list = SkipList::new(0xdead_beef);

        for (ukey, seq) in [(b"m" as &[u8], 3u64), (b"a", 1), (b"z", 2), (b"a", 9)] {
            list.insert(&ikey(ukey, seq), b"v");
        }

        assert_eq!(4, list.len());

        let mut keys = Vec::new();
        let mut node = list.first();
        while node != NIL {
            keys.push(list.key(node).to_vec());
            node = list.next(node);
        }

        // User key ascending, sequence descending
        assert_eq!(
            vec![ikey(b"a", 9), ikey(b"a", 1), ikey(b"m", 3), ikey(b"z", 2)],
            keys
        );
    }

    #[test]
    fn seek_finds_first_greater_or_equal() {
        let mut list = SkipList::new(42);
        for i in (0u64..100).step_by(2) {
            list.insert(&ikey(format!("k{i:03}").as_bytes(), 1), b"v");
        }

        let node = list.seek(&ikey(b"k005", u64::MAX >> 8));
        assert_ne!(NIL, node);
        assert_eq!(ikey(b"k006", 1), list.key(node));

        let node = list.seek(&ikey(b"k098", u64::MAX >> 8));
        assert_eq!(ikey(b"k098", 1), list.key(node));

        assert_eq!(NIL, list.seek(&ikey(b"k099", 1)));
    }

    #[test]
    fn exact_reinsert_reuses_slot() {
        let mut list = SkipList::new(7);
        let k = ikey(b"key", 5);

        list.insert(&k, b"long-initial-value");
        let before = list.kv_size();

        list.insert(&k, b"short");
        assert_eq!(1, list.len());
        assert_eq!(b"short", list.value(list.first()));
        assert!(list.kv_size() < before);

        list.insert(&k, b"a-much-longer-replacement-value");
        assert_eq!(1, list.len());
        assert_eq!(b"a-much-longer-replacement-value", list.value(list.first()));
    }

    #[test]
    fn randomized_against_btreemap() {
        use std::collections::BTreeMap;

        let mut list = SkipList::new(0x1234_5678);
        let mut model = BTreeMap::new();

        let mut x = 99u64;
        for seq in 0..2_000u64 {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;

            let ukey = format!("key{:03}", x % 500);
            let value = format!("value{seq}");

            list.insert(&ikey(ukey.as_bytes(), seq), value.as_bytes());
            model.insert(ikey(ukey.as_bytes(), seq), value.into_bytes());
        }

        assert_eq!(model.len(), list.len());

        let mut node = list.first();
        for (k, v) in &model {
            // The model's byte order differs from internal-key order,
            // so compare as sets via seek
            let found = list.seek(k);
            assert_ne!(NIL, found);
            assert_eq!(&k[..], list.key(found));
            assert_eq!(&v[..], list.value(found));
            node = list.next(node);
        }
        let _ = node;
    }
}
