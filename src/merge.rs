//! K-way merge across memtables and tables.
//!
//! Child cursors advance independently; a min-heap over their current
//! keys picks the globally smallest entry. Sources with overlapping key
//! ranges (the memtables and the level-0 tables) are merged this way,
//! with ties broken by child index so that newer sources win
//! deterministically.

use crate::iter::{BoxedIter, Iter};
use crate::key;
use min_max_heap::MinMaxHeap;
use std::cmp::Ordering;

struct HeapEntry {
    key: Vec<u8>,
    child: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        key::compare(&self.key, &other.key).then(self.child.cmp(&other.child))
    }
}

/// Merges N child cursors into one ordered cursor
pub struct MergeIter {
    children: Vec<BoxedIter>,
    heap: MinMaxHeap<HeapEntry>,
    current: Option<usize>,
    err: Option<crate::Error>,
}

impl MergeIter {
    #[must_use]
    pub fn new(children: Vec<BoxedIter>) -> Self {
        Self {
            heap: MinMaxHeap::with_capacity(children.len()),
            children,
            current: None,
            err: None,
        }
    }

    fn push_child(&mut self, idx: usize, positioned: bool) {
        if positioned {
            self.heap.push(HeapEntry {
                key: self.children[idx].key().to_vec(),
                child: idx,
            });
        } else if let Err(e) = self.children[idx].status() {
            self.err.get_or_insert(e);
        }
    }

    fn pop_current(&mut self) -> bool {
        match self.heap.pop_min() {
            Some(entry) => {
                self.current = Some(entry.child);
                true
            }
            None => {
                self.current = None;
                false
            }
        }
    }
}

impl Iter for MergeIter {
    fn seek_first(&mut self) -> bool {
        self.heap = MinMaxHeap::with_capacity(self.children.len());
        self.current = None;

        for idx in 0..self.children.len() {
            let positioned = self.children[idx].seek_first();
            self.push_child(idx, positioned);
        }

        if self.err.is_some() {
            return false;
        }

        self.pop_current()
    }

    fn seek(&mut self, target: &[u8]) -> bool {
        self.heap = MinMaxHeap::with_capacity(self.children.len());
        self.current = None;

        for idx in 0..self.children.len() {
            let positioned = self.children[idx].seek(target);
            self.push_child(idx, positioned);
        }

        if self.err.is_some() {
            return false;
        }

        self.pop_current()
    }

    fn next(&mut self) -> bool {
        if self.err.is_some() {
            return false;
        }

        let Some(current) = self.current else {
            return false;
        };

        let positioned = self.children[current].next();
        self.push_child(current, positioned);

        if self.err.is_some() {
            return false;
        }

        self.pop_current()
    }

    fn key(&self) -> &[u8] {
        let current = self.current.expect("iterator is not valid");
        self.children[current].key()
    }

    fn value(&self) -> &[u8] {
        let current = self.current.expect("iterator is not valid");
        self.children[current].value()
    }

    fn status(&self) -> crate::Result<()> {
        match &self.err {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{build, ValueType};

    struct VecIter {
        items: Vec<(Vec<u8>, Vec<u8>)>,
        pos: Option<usize>,
    }

    impl VecIter {
        fn new(mut items: Vec<(Vec<u8>, Vec<u8>)>) -> Box<Self> {
            items.sort_by(|a, b| key::compare(&a.0, &b.0));
            Box::new(Self { items, pos: None })
        }
    }

    impl Iter for VecIter {
        fn seek_first(&mut self) -> bool {
            self.pos = Some(0);
            !self.items.is_empty()
        }

        fn seek(&mut self, target: &[u8]) -> bool {
            let idx = self
                .items
                .partition_point(|(k, _)| key::compare(k, target) == Ordering::Less);
            self.pos = Some(idx);
            idx < self.items.len()
        }

        fn next(&mut self) -> bool {
            match self.pos {
                Some(p) => {
                    self.pos = Some(p + 1);
                    p + 1 < self.items.len()
                }
                None => self.seek_first(),
            }
        }

        fn key(&self) -> &[u8] {
            &self.items[self.pos.expect("valid")].0
        }

        fn value(&self) -> &[u8] {
            &self.items[self.pos.expect("valid")].1
        }

        fn status(&self) -> crate::Result<()> {
            Ok(())
        }
    }

    fn entry(ukey: &[u8], seq: u64, value: &[u8]) -> (Vec<u8>, Vec<u8>) {
        (build(ukey, seq, ValueType::Value), value.to_vec())
    }

    #[test]
    fn merge_interleaves_in_internal_order() {
        let a = VecIter::new(vec![
            entry(b"a", 1, b"old"),
            entry(b"c", 1, b"old"),
            entry(b"e", 1, b"old"),
        ]);
        let b = VecIter::new(vec![
            entry(b"a", 2, b"new"),
            entry(b"b", 2, b"new"),
            entry(b"e", 2, b"new"),
        ]);

        let mut merge = MergeIter::new(vec![a, b]);

        let mut seen = Vec::new();
        let mut valid = merge.seek_first();
        while valid {
            let (ukey, _, seq) = key::parse(merge.key()).expect("key is valid");
            seen.push((ukey.to_vec(), seq));
            valid = merge.next();
        }

        assert_eq!(
            vec![
                (b"a".to_vec(), 2),
                (b"a".to_vec(), 1),
                (b"b".to_vec(), 2),
                (b"c".to_vec(), 1),
                (b"e".to_vec(), 2),
                (b"e".to_vec(), 1),
            ],
            seen
        );
    }

    #[test]
    fn merge_seek_lands_mid_stream() {
        let a = VecIter::new(vec![entry(b"a", 1, b"x"), entry(b"m", 1, b"x")]);
        let b = VecIter::new(vec![entry(b"f", 2, b"y"), entry(b"z", 2, b"y")]);

        let mut merge = MergeIter::new(vec![a, b]);

        assert!(merge.seek(&build(b"f", crate::key::MAX_SEQNO, ValueType::Tombstone)));
        assert_eq!(b"f", key::user_key(merge.key()));

        assert!(merge.next());
        assert_eq!(b"m", key::user_key(merge.key()));

        assert!(merge.next());
        assert_eq!(b"z", key::user_key(merge.key()));

        assert!(!merge.next());
    }
}
