//! The internal iterator interface.
//!
//! Unlike `std::iter::Iterator`, engine iterators are seekable and keep
//! their current entry addressable until the next movement. Movement
//! methods return `bool`; failures are parked in a sticky status so hot
//! paths stay allocation-free.

/// A cursor over internal-key/value entries
pub trait Iter {
    /// Positions at the first entry; `false` if the source is empty
    fn seek_first(&mut self) -> bool;

    /// Positions at the first entry with key >= `target`
    fn seek(&mut self, target: &[u8]) -> bool;

    /// Advances to the next entry; `false` at the end
    fn next(&mut self) -> bool;

    /// Key of the current entry; only valid after a movement returned
    /// `true`
    fn key(&self) -> &[u8];

    /// Value of the current entry; only valid after a movement returned
    /// `true`
    fn value(&self) -> &[u8];

    /// Sticky error state. Once an iterator fails, every further
    /// movement returns `false` and this returns the error.
    fn status(&self) -> crate::Result<()>;
}

pub type BoxedIter = Box<dyn Iter>;

/// Materializes data-block style iterators from the entries of an index
/// iterator, presenting the concatenation as one cursor.
///
/// The index iterator yields opaque handle bytes as values; the factory
/// turns a handle into the child iterator it points at.
pub struct TwoLevelIter {
    index: BoxedIter,
    child: Option<BoxedIter>,
    factory: Box<dyn Fn(&[u8]) -> crate::Result<BoxedIter>>,
    err: Option<crate::Error>,
}

impl TwoLevelIter {
    pub fn new(
        index: BoxedIter,
        factory: Box<dyn Fn(&[u8]) -> crate::Result<BoxedIter>>,
    ) -> Self {
        Self {
            index,
            child: None,
            factory,
            err: None,
        }
    }

    fn open_child(&mut self) -> bool {
        match (self.factory)(self.index.value()) {
            Ok(child) => {
                self.child = Some(child);
                true
            }
            Err(e) => {
                self.err = Some(e);
                self.child = None;
                false
            }
        }
    }

    /// Moves across index entries until some child yields an entry
    fn skip_empty_children_forward(&mut self) -> bool {
        loop {
            if let Some(child) = &mut self.child {
                if child.next() {
                    return true;
                }
                if let Err(e) = child.status() {
                    self.err = Some(e);
                    return false;
                }
            }

            if !self.index.next() {
                if let Err(e) = self.index.status() {
                    self.err = Some(e);
                }
                self.child = None;
                return false;
            }

            if !self.open_child() {
                return false;
            }

            let child = self.child.as_mut().expect("child was just opened");
            if child.seek_first() {
                return true;
            }
            if let Err(e) = child.status() {
                self.err = Some(e);
                return false;
            }
        }
    }
}

impl Iter for TwoLevelIter {
    fn seek_first(&mut self) -> bool {
        if self.err.is_some() {
            return false;
        }

        self.child = None;

        if !self.index.seek_first() {
            if let Err(e) = self.index.status() {
                self.err = Some(e);
            }
            return false;
        }

        if !self.open_child() {
            return false;
        }

        let child = self.child.as_mut().expect("child was just opened");
        if child.seek_first() {
            return true;
        }
        if let Err(e) = child.status() {
            self.err = Some(e);
            return false;
        }

        self.skip_empty_children_forward()
    }

    fn seek(&mut self, target: &[u8]) -> bool {
        if self.err.is_some() {
            return false;
        }

        self.child = None;

        if !self.index.seek(target) {
            if let Err(e) = self.index.status() {
                self.err = Some(e);
            }
            return false;
        }

        if !self.open_child() {
            return false;
        }

        let child = self.child.as_mut().expect("child was just opened");
        if child.seek(target) {
            return true;
        }
        if let Err(e) = child.status() {
            self.err = Some(e);
            return false;
        }

        // The index separator may point at a block whose entries all
        // sort before the target; fall through to the next child
        self.skip_empty_children_forward()
    }

    fn next(&mut self) -> bool {
        if self.err.is_some() || self.child.is_none() {
            return false;
        }

        self.skip_empty_children_forward()
    }

    fn key(&self) -> &[u8] {
        self.child.as_ref().expect("iterator is not valid").key()
    }

    fn value(&self) -> &[u8] {
        self.child.as_ref().expect("iterator is not valid").value()
    }

    fn status(&self) -> crate::Result<()> {
        match &self.err {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}
