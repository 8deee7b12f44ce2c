//! Articulated lists.
//!
//! A list interleaves three kinds of structure: plain `Cons` cells,
//! `Name` markers that seed the names of memoized recursions over the
//! list, and `Art` articulations that place the remainder of the list
//! behind a DCG node.  A fully articulated list puts every element in
//! its own cell, so each can be mutated independently with `set`.

use std::collections::BTreeSet;

use crate::engine::{cell, force, set, thunk, Art, Data};
use crate::memo::{mk_mfn, Mfn};
use crate::name::{name_fork, name_of_usize, name_pair, Name};

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum List<T: Data> {
    Nil,
    Cons(T, Box<List<T>>),
    Name(Name, Box<List<T>>),
    Art(Art<List<T>>),
}

impl<T: Data> List<T> {
    pub fn nil() -> Self {
        List::Nil
    }
    pub fn cons(hd: T, tl: Self) -> Self {
        List::Cons(hd, Box::new(tl))
    }
    pub fn name(nm: Name, tl: Self) -> Self {
        List::Name(nm, Box::new(tl))
    }
    pub fn art(a: Art<List<T>>) -> Self {
        List::Art(a)
    }

    pub fn is_empty(&self) -> bool {
        match self {
            List::Nil => true,
            List::Cons(..) => false,
            List::Name(_, tl) => tl.is_empty(),
            List::Art(a) => force(a).is_empty(),
        }
    }
}

/// Build a fully articulated list from a vector: element `i` sits in a
/// cell named under `nm`, returned alongside the list so callers can
/// mutate individual elements.
pub fn list_of_vec<T: Data>(nm: &Name, xs: &[T]) -> (List<T>, Vec<Art<List<T>>>) {
    let mut tail = List::Nil;
    let mut cells: Vec<Art<List<T>>> = Vec::with_capacity(xs.len());
    for (i, x) in xs.iter().enumerate().rev() {
        let (nm_cell, nm_rec) = name_fork(name_pair(nm.clone(), name_of_usize(i)));
        let l = List::name(nm_rec, List::cons(x.clone(), tail));
        let c = cell(nm_cell, l);
        cells.push(c.clone());
        tail = List::Art(c);
    }
    cells.reverse();
    (tail, cells)
}

/// Read the list out into a vector, forcing through articulations.
pub fn vec_of_list<T: Data>(l: &List<T>) -> Vec<T> {
    let mut out = Vec::new();
    let mut cur = l.clone();
    loop {
        match cur {
            List::Nil => return out,
            List::Cons(x, tl) => {
                out.push(x);
                cur = *tl;
            }
            List::Name(_, tl) => cur = *tl,
            List::Art(a) => cur = force(&a),
        }
    }
}

/// Overwrite element `i`'s head value in place, preserving its tail.
pub fn set_elt<T: Data>(cells: &[Art<List<T>>], i: usize, x: T) {
    match force(&cells[i]) {
        List::Name(nm, rest) => match *rest {
            List::Cons(_, tl) => set(&cells[i], List::Name(nm, Box::new(List::Cons(x, tl)))),
            _ => panic!("grifola::collections: articulated cell lost its cons structure"),
        },
        _ => panic!("grifola::collections: articulated cell lost its name marker"),
    }
}

/// The memoized worker behind `list_unique`.  The accumulator is the
/// set of elements seen to the left; recursion is named by the list's
/// own `Name` markers.
pub fn unique_mfn<T: Data + Ord>(nm: Name) -> Mfn<(List<T>, BTreeSet<T>), List<usize>> {
    mk_mfn(nm, |mfn, (l, seen): (List<T>, BTreeSet<T>)| match l {
        List::Nil => List::Nil,
        List::Cons(x, tl) => {
            let flag = if seen.contains(&x) { 1 } else { 0 };
            let mut seen = seen;
            seen.insert(x);
            List::cons(flag, mfn.data((*tl, seen)))
        }
        List::Name(nm, tl) => List::Art(mfn.nart(nm, (*tl, seen))),
        List::Art(a) => {
            let inner = force(&a);
            mfn.data((inner, seen))
        }
    })
}

/// Map each element to 0 when it is the first occurrence of its value
/// so far, else 1.  Returns the root articulation of the output list;
/// re-force it after mutating the input to get the repaired result.
pub fn list_unique<T: Data + Ord>(
    mfn: &Mfn<(List<T>, BTreeSet<T>), List<usize>>,
    root_nm: Name,
    l: &List<T>,
) -> Art<List<usize>> {
    let mfn = mfn.clone();
    let l = l.clone();
    thunk(root_nm, move || mfn.data((l.clone(), BTreeSet::new())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::manage;
    use crate::name::name_of_str;

    #[test]
    fn vec_roundtrip() {
        manage::init_dcg();
        let xs: Vec<usize> = vec![3, 1, 4, 1, 5];
        let (l, cells) = list_of_vec(&name_of_str("rt"), &xs);
        assert_eq!(cells.len(), 5);
        assert_eq!(vec_of_list(&l), xs);
    }

    #[test]
    fn set_elt_overwrites_in_place() {
        manage::init_dcg();
        let (l, cells) = list_of_vec(&name_of_str("se"), &[10usize, 20, 30]);
        set_elt(&cells, 1, 99);
        assert_eq!(vec_of_list(&l), vec![10, 99, 30]);
    }
}
