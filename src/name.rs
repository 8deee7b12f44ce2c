//! First-class names.
//!
//! Names give a symbolic way to identify DCG nodes across edits: a
//! memoized call keyed by a name keeps matching its table entry even
//! when its argument changes.  The engine treats names as opaque
//! identifiers; only equality and hashing matter to it.

use std::cell::RefCell;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::fmt::{Debug, Formatter};
use std::hash::{Hash, Hasher};
use std::rc::Rc;

thread_local!(static GENSYM_COUNTER: RefCell<usize> = RefCell::new(0));

/// Hash an arbitrary hashable value to a word.
pub fn my_hash<T: Hash>(obj: T) -> u64 {
    let mut hasher = DefaultHasher::new();
    obj.hash(&mut hasher);
    hasher.finish()
}

/// Like `my_hash`, with an explicit seed mixed in first.
pub fn my_hash_seeded<T: Hash>(seed: u64, obj: T) -> u64 {
    let mut hasher = DefaultHasher::new();
    seed.hash(&mut hasher);
    obj.hash(&mut hasher);
    hasher.finish()
}

// For a general semantics of symbols, see Chapter 31 of PFPL 2nd
// Edition. Harper 2015.
#[derive(Hash, PartialEq, Eq, Clone)]
enum NameSym {
    String(String),                // Strings encode globally-unique symbols.
    Usize(usize),                  // Usizes encode globally-unique symbols.
    Gensym(usize),                 // Freshly-drawn symbols; see `gensym`.
    Pair(Rc<NameSym>, Rc<NameSym>), // A pair of unique symbols is unique.
    ForkL(Rc<NameSym>),            // Left projection of a unique symbol is unique.
    ForkR(Rc<NameSym>),            // Right projection of a unique symbol is unique.
}

impl Debug for NameSym {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match *self {
            NameSym::String(ref s) => write!(f, "{}", s),
            NameSym::Usize(ref n) => write!(f, "{}", n),
            NameSym::Gensym(ref n) => write!(f, "#{}", n),
            NameSym::Pair(ref l, ref r) => write!(f, "({:?},{:?})", l, r),
            NameSym::ForkL(ref s) => write!(f, "{:?}.l", s),
            NameSym::ForkR(ref s) => write!(f, "{:?}.r", s),
        }
    }
}

/// Names provide a symbolic way to identify nodes.
#[derive(Hash, PartialEq, Eq, Clone)]
pub struct Name {
    hash: u64, // hash of symbol
    symbol: Rc<NameSym>,
}

impl Debug for Name {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        self.symbol.fmt(f)
    }
}

impl Name {
    /// Rendering for diagnostics.
    pub fn show(&self) -> String {
        format!("{:?}", self)
    }
}

pub fn name_of_string(sym: String) -> Name {
    let h = my_hash(&sym);
    let s = NameSym::String(sym);
    Name { hash: h, symbol: Rc::new(s) }
}

pub fn name_of_str(sym: &'static str) -> Name {
    name_of_string(sym.to_string())
}

pub fn name_of_usize(sym: usize) -> Name {
    let h = my_hash(&sym);
    let s = NameSym::Usize(sym);
    Name { hash: h, symbol: Rc::new(s) }
}

/// A pair of unique names, interpreted as a name, is unique.
pub fn name_pair(fst: Name, snd: Name) -> Name {
    let h = my_hash(&(fst.hash, snd.hash));
    let p = NameSym::Pair(fst.symbol, snd.symbol);
    Name { hash: h, symbol: Rc::new(p) }
}

/// Deterministically split a name into two distinct names.
pub fn name_fork(nm: Name) -> (Name, Name) {
    let h1 = my_hash(&(nm.hash, 11111111u64));
    let h2 = my_hash(&(nm.hash, 22222222u64));
    (
        Name { hash: h1, symbol: Rc::new(NameSym::ForkL(nm.symbol.clone())) },
        Name { hash: h2, symbol: Rc::new(NameSym::ForkR(nm.symbol)) },
    )
}

/// Draw a fresh, globally-unique name from a thread-local counter.
///
/// Appropriate for the outer (editor) layer, e.g. in unit tests; never
/// appropriate inside a memoized body, where it defeats reuse.
pub fn gensym() -> Name {
    let c = GENSYM_COUNTER.with(|ctr| {
        let c = *ctr.borrow();
        *ctr.borrow_mut() = c + 1;
        c
    });
    let h = my_hash(&(c, GENSYM_SEED));
    let s = NameSym::Gensym(c);
    Name { hash: h, symbol: Rc::new(s) }
}

// Distinguishes gensym hashes from usize names with the same number.
const GENSYM_SEED: u64 = 0x6753_1fab;

/// Seeded name hashing, for collaborators that bucket by name.
pub fn name_hash(seed: u64, nm: &Name) -> u64 {
    my_hash_seeded(seed, nm.hash)
}
