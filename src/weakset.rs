//! Weakly-held edge collections.
//!
//! Every meta-node stores its reverse edges here: the edges are owned
//! strongly by the node that recorded them (in its `forces`/`creates`
//! lists), and only weakly by the node they point at.  Dropping the
//! strong side is enough to retire an edge; traversals never observe
//! retired members.

use std::collections::BTreeMap;
use std::rc::{Rc, Weak};

/// A compacting array of weak references.
///
/// `fold` iterates over the currently-live members and rewrites the
/// backing vector in place, so dropped members are reclaimed lazily as
/// a side effect of traversal.
pub struct WeakVec<T> {
    elts: Vec<Weak<T>>,
}

impl<T> WeakVec<T> {
    pub fn new() -> Self {
        WeakVec { elts: Vec::new() }
    }

    pub fn add(&mut self, elt: &Rc<T>) {
        self.elts.push(Rc::downgrade(elt));
    }

    /// Fold over live members, compacting as we go.
    pub fn fold<A, F>(&mut self, init: A, mut f: F) -> A
    where
        F: FnMut(A, Rc<T>) -> A,
    {
        let mut acc = init;
        let mut live: Vec<Weak<T>> = Vec::with_capacity(self.elts.len());
        for w in self.elts.drain(..) {
            if let Some(elt) = w.upgrade() {
                acc = f(acc, elt);
                live.push(w);
            }
        }
        self.elts = live;
        acc
    }

    /// Search live members without compacting.
    pub fn find<F>(&self, mut pred: F) -> Option<Rc<T>>
    where
        F: FnMut(&Rc<T>) -> bool,
    {
        for w in self.elts.iter() {
            if let Some(elt) = w.upgrade() {
                if pred(&elt) {
                    return Some(elt);
                }
            }
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.elts.iter().all(|w| w.upgrade().is_none())
    }
}

/// A hash-keyed bag of weakly-held elements.
///
/// Keys are source meta-node ids: elements are equal only when
/// physically identical, but bucketing by id gives consistent placement
/// and lets `fold` traverse in id order.
pub struct WeakSet<T> {
    tbl: BTreeMap<u64, WeakVec<T>>,
}

impl<T> WeakSet<T> {
    pub fn new() -> Self {
        WeakSet { tbl: BTreeMap::new() }
    }

    /// Insert `elt` under `key` unless it is already present; returns
    /// the resident element (the input, except when it was already a
    /// member).
    pub fn merge(&mut self, key: u64, elt: &Rc<T>) -> Rc<T> {
        let bucket = self.tbl.entry(key).or_insert_with(WeakVec::new);
        if let Some(prior) = bucket.find(|e| Rc::ptr_eq(e, elt)) {
            return prior;
        }
        bucket.add(elt);
        elt.clone()
    }

    /// Fold over live members in key order, compacting each bucket and
    /// dropping buckets that have emptied.
    pub fn fold<A, F>(&mut self, init: A, mut f: F) -> A
    where
        F: FnMut(A, Rc<T>) -> A,
    {
        let mut acc = init;
        let mut dead_keys = Vec::new();
        for (key, bucket) in self.tbl.iter_mut() {
            acc = bucket.fold(acc, &mut f);
            if bucket.is_empty() {
                dead_keys.push(*key);
            }
        }
        for key in dead_keys {
            self.tbl.remove(&key);
        }
        acc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_is_physical() {
        let mut s: WeakSet<u32> = WeakSet::new();
        let a = Rc::new(7);
        let b = Rc::new(7);
        let ra = s.merge(1, &a);
        let rb = s.merge(1, &b);
        assert!(Rc::ptr_eq(&ra, &a));
        assert!(Rc::ptr_eq(&rb, &b));
        // Same element merged twice resolves to the resident copy.
        assert!(Rc::ptr_eq(&s.merge(1, &a), &a));
        assert_eq!(s.fold(0, |n, _| n + 1), 2);
    }

    #[test]
    fn fold_skips_and_reclaims_dropped_members() {
        let mut s: WeakSet<u32> = WeakSet::new();
        let a = Rc::new(1);
        {
            let b = Rc::new(2);
            s.merge(2, &b);
            s.merge(1, &a);
            assert_eq!(s.fold(0, |n, _| n + 1), 2);
        }
        // `b` dropped: the next fold sees only `a`, in key order.
        let seen = s.fold(Vec::new(), |mut v, e| {
            v.push(*e);
            v
        });
        assert_eq!(seen, vec![1]);
    }
}
