//! Fixed-capacity, direct-addressed transfer table (C2).
//!
//! No chaining: an insert that would collide with a live occupant fails
//! outright, and the caller treats that as transaction-id exhaustion (see
//! `server/dispatch.rs`). Capacity is rounded up to a power of two so the
//! slot computation is a mask instead of a modulo.

/// Anything stored in the table must expose the key it's addressed by.
pub trait HasTxnId {
    fn txnid(&self) -> u64;
}

#[derive(Debug)]
pub struct XferTable<T> {
    slots: Vec<Option<T>>,
    capacity_mask: u64,
    len: usize,
}

impl<T: HasTxnId> XferTable<T> {
    /// Builds a table whose capacity is the next power of two at or above
    /// `capacity_hint` (minimum 1).
    pub fn new(capacity_hint: usize) -> XferTable<T> {
        let capacity = capacity_hint.max(1).next_power_of_two();
        XferTable {
            slots: (0..capacity).map(|_| None).collect(),
            capacity_mask: (capacity - 1) as u64,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.capacity()
    }

    fn index_of(&self, txnid: u64) -> usize {
        (txnid & self.capacity_mask) as usize
    }

    /// Inserts `elem`, keyed by its own `txnid()`. Fails (returning `elem`
    /// back to the caller) if the slot is already occupied.
    pub fn insert(&mut self, elem: T) -> Result<(), T> {
        let idx = self.index_of(elem.txnid());
        if self.slots[idx].is_some() {
            return Err(elem);
        }
        self.slots[idx] = Some(elem);
        self.len += 1;
        Ok(())
    }

    pub fn find(&self, txnid: u64) -> Option<&T> {
        let idx = self.index_of(txnid);
        self.slots[idx].as_ref().filter(|e| e.txnid() == txnid)
    }

    pub fn find_mut(&mut self, txnid: u64) -> Option<&mut T> {
        let idx = self.index_of(txnid);
        self.slots[idx].as_mut().filter(|e| e.txnid() == txnid)
    }

    /// Removes and returns the element keyed by `txnid`, if present.
    pub fn remove(&mut self, txnid: u64) -> Option<T> {
        let idx = self.index_of(txnid);
        if self.slots[idx].as_ref().map(|e| e.txnid()) == Some(txnid) {
            self.len -= 1;
            self.slots[idx].take()
        } else {
            None
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.slots.iter().filter_map(|s| s.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Eq)]
    struct Elem(u64);

    impl HasTxnId for Elem {
        fn txnid(&self) -> u64 {
            self.0
        }
    }

    #[test]
    fn capacity_rounds_up_to_power_of_two() {
        let t: XferTable<Elem> = XferTable::new(5);
        assert_eq!(t.capacity(), 8);
    }

    #[test]
    fn insert_find_remove() {
        let mut t: XferTable<Elem> = XferTable::new(4);
        t.insert(Elem(1)).unwrap();
        assert_eq!(t.find(1), Some(&Elem(1)));
        assert_eq!(t.len(), 1);
        assert_eq!(t.remove(1), Some(Elem(1)));
        assert_eq!(t.find(1), None);
        assert_eq!(t.len(), 0);
    }

    #[test]
    fn collision_on_insert_fails_rather_than_chaining() {
        let mut t: XferTable<Elem> = XferTable::new(4);
        t.insert(Elem(1)).unwrap();
        // 1 and 5 collide under a mask of 3 (capacity 4).
        let err = t.insert(Elem(5));
        assert!(err.is_err());
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn full_table_rejects_further_inserts() {
        let mut t: XferTable<Elem> = XferTable::new(2);
        t.insert(Elem(0)).unwrap();
        t.insert(Elem(1)).unwrap();
        assert!(t.is_full());
        assert!(t.insert(Elem(2)).is_err());
    }
}
