//! Memoized functions.
//!
//! `mk_mfn` compiles a name and a body into an `Mfn`: a record of
//! three callables sharing one memo table.  `data` runs the body as a
//! pure recursion; `art` and `nart` allocate suspensions keyed by
//! argument value or by first-class name.  The recursion handle passed
//! to the body is the `Mfn` itself.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use fxhash::FxHashMap;
use log::debug;

use crate::engine;
use crate::engine::{Art, Data, EvictionPolicy, Slot, SuspPtr};
use crate::name::Name;

/// A memo-table key; equality and hashing honour the identity mode.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub(crate) enum MemoId<Arg> {
    /// Nominal: equal iff the names are equal; the argument lives in
    /// the entry and may be overwritten in place on a hit.
    Name(Name),
    /// Structural: equal iff the argument values are equal.
    Arg(Arg),
    /// Generative: the argument paired with a runtime id, so separate
    /// invocations never collide.
    ArgGen(Arg, u64),
}

struct Entry<Arg, Res: Data> {
    /// Shared with the suspension's body closure; the nominal hit path
    /// overwrites it.
    arg: Rc<RefCell<Arg>>,
    ptr: Rc<SuspPtr<Res>>,
    birth: u64,
    touch: Cell<u64>,
}

struct MfnInner<Arg: Data, Res: Data> {
    name: Name,
    body: Box<dyn Fn(&Mfn<Arg, Res>, Arg) -> Res>,
    table: RefCell<FxHashMap<MemoId<Arg>, Entry<Arg, Res>>>,
    tick: Cell<u64>,
}

/// A memoized function: name, body, and one memo table.
pub struct Mfn<Arg: Data, Res: Data> {
    inner: Rc<MfnInner<Arg, Res>>,
}

impl<Arg: Data, Res: Data> Clone for Mfn<Arg, Res> {
    fn clone(&self) -> Self {
        Mfn { inner: self.inner.clone() }
    }
}

/// Declare a memoized function.
pub fn mk_mfn<Arg, Res, B>(name: Name, body: B) -> Mfn<Arg, Res>
where
    Arg: Data,
    Res: Data,
    B: 'static + Fn(&Mfn<Arg, Res>, Arg) -> Res,
{
    let inner = Rc::new(MfnInner {
        name,
        body: Box::new(body),
        table: RefCell::new(FxHashMap::default()),
        tick: Cell::new(0),
    });
    let as_table: Rc<dyn engine::EvictTable> = inner.clone();
    engine::register_table(Rc::downgrade(&as_table));
    Mfn { inner }
}

impl<Arg: Data, Res: Data> Mfn<Arg, Res> {
    /// Pure recursion shortcut: run the body directly, no memo entry.
    pub fn data(&self, arg: Arg) -> Res {
        (self.inner.body)(self, arg)
    }

    /// Memoized call under structural identity.
    pub fn art(&self, arg: Arg) -> Art<Res> {
        if engine::flags().disable_mfns {
            return engine::put(self.data(arg));
        }
        let key = if engine::flags().generative_ids {
            MemoId::ArgGen(arg.clone(), engine::fresh_gen_id())
        } else {
            MemoId::Arg(arg.clone())
        };
        self.lookup(key, arg)
    }

    /// Memoized call under nominal identity: the entry matches by name
    /// alone, and a hit with a different argument overwrites the
    /// stored one, filthy-marking the entry and its other creators.
    pub fn nart(&self, nm: Name, arg: Arg) -> Art<Res> {
        if engine::flags().disable_mfns {
            return engine::put(self.data(arg));
        }
        if engine::flags().disable_names {
            return self.lookup(MemoId::ArgGen(arg.clone(), engine::fresh_gen_id()), arg);
        }
        self.lookup(MemoId::Name(nm), arg)
    }

    /// Number of live memo entries; diagnostics only.
    pub fn table_len(&self) -> usize {
        self.inner.table.borrow().len()
    }

    fn tick(&self) -> u64 {
        let t = self.inner.tick.get() + 1;
        self.inner.tick.set(t);
        t
    }

    fn lookup(&self, key: MemoId<Arg>, arg: Arg) -> Art<Res> {
        let nominal = matches!(key, MemoId::Name(_));
        let hit = {
            let table = self.inner.table.borrow();
            table.get(&key).map(|e| (e.arg.clone(), e.ptr.clone()))
        };
        match hit {
            Some((arg_cell, ptr)) => {
                let t = self.tick();
                if let Some(e) = self.inner.table.borrow().get(&key) {
                    e.touch.set(t);
                }
                let arg_changed = *arg_cell.borrow() != arg;
                if arg_changed {
                    if !nominal {
                        // structural and generative keys embed the
                        // argument, so a hit implies equality
                        panic!(
                            "grifola::memo: misuse: argument mutation on a non-nominal entry of {:?}",
                            self.inner.name
                        );
                    }
                    debug!(
                        "grifola::memo: {:?}: hit with changed argument; overwriting and filthy-marking",
                        self.inner.name
                    );
                    match ptr.meta() {
                        Some(meta) => {
                            engine::filthy_mutators(&meta);
                            *arg_cell.borrow_mut() = arg.sanitize();
                            engine::mark_filthy(&meta);
                        }
                        None => {
                            *arg_cell.borrow_mut() = arg.sanitize();
                        }
                    }
                }
                self.attach(&ptr);
                let handle = if engine::flags().sanitize_pointers {
                    copy_ptr(&ptr)
                } else {
                    ptr
                };
                Art::Susp(handle)
            }
            None => {
                // the probe becomes the canonical entry
                let arg_cell = Rc::new(RefCell::new(arg.sanitize()));
                let body: Rc<dyn Fn() -> Res> = {
                    let weak = Rc::downgrade(&self.inner);
                    let arg_cell = arg_cell.clone();
                    Rc::new(move || {
                        let inner = match weak.upgrade() {
                            Some(inner) => inner,
                            None => panic!("grifola::memo: suspension outlived its memoized function"),
                        };
                        let mfn = Mfn { inner };
                        let a = arg_cell.borrow().clone();
                        (mfn.inner.body)(&mfn, a)
                    })
                };
                let ptr = Rc::new(SuspPtr {
                    slot: RefCell::new(Slot::Empty { body }),
                    external_holds: Cell::new(0),
                });
                let nm = match &key {
                    MemoId::Name(n) => n.clone(),
                    _ => self.inner.name.clone(),
                };
                let undo: Box<dyn Fn()> = {
                    let weak = Rc::downgrade(&self.inner);
                    let k = key.clone();
                    Box::new(move || {
                        if let Some(inner) = weak.upgrade() {
                            inner.table.borrow_mut().remove(&k);
                        }
                    })
                };
                install_prenode(&ptr, nm, undo);
                engine::bump_create();
                let t = self.tick();
                self.inner.table.borrow_mut().insert(
                    key,
                    Entry { arg: arg_cell, ptr: ptr.clone(), birth: t, touch: Cell::new(t) },
                );
                self.attach(&ptr);
                Art::Susp(ptr)
            }
        }
    }

    /// Record a creation edge to the canonical node, incrementing its
    /// reference count (or installing an external hold).
    fn attach(&self, ptr: &Rc<SuspPtr<Res>>) {
        let meta = match ptr.meta() {
            Some(meta) => meta,
            None => panic!("grifola::memo: canonical entry of {:?} lacks a meta node", self.inner.name),
        };
        let undo: Box<dyn Fn()> = {
            let p = ptr.clone();
            Box::new(move || engine::decr_refc(&p, false))
        };
        if engine::record_create_edge(&meta, undo) {
            engine::incr_refc(ptr);
        } else {
            engine::external_hold(ptr);
        }
    }
}

/// Transition a probe pointer's slot `Empty → Prenode`.
fn install_prenode<Res: Data>(p: &Rc<SuspPtr<Res>>, nm: Name, undo: Box<dyn Fn()>) {
    let meta = engine::fresh_meta(Some(nm));
    let mut slot = p.slot.borrow_mut();
    let prev = std::mem::replace(&mut *slot, Slot::Hole);
    match prev {
        Slot::Empty { body } => {
            *slot = Slot::Prenode { body, meta, undo: Some(undo), refc: 0 };
        }
        _ => panic!("grifola::memo: slot may only move forward from Empty"),
    }
}

/// A fresh pointer handle sharing the canonical node, when it has one.
fn copy_ptr<Res: Data>(p: &Rc<SuspPtr<Res>>) -> Rc<SuspPtr<Res>> {
    let shared = match &*p.slot.borrow() {
        Slot::Node(n) => Some(n.clone()),
        _ => None,
    };
    match shared {
        Some(n) => Rc::new(SuspPtr { slot: RefCell::new(Slot::Node(n)), external_holds: Cell::new(0) }),
        None => p.clone(),
    }
}

impl<Arg: Data, Res: Data> engine::EvictTable for MfnInner<Arg, Res> {
    fn evict(&self, policy: EvictionPolicy) -> usize {
        let cap = match policy {
            EvictionPolicy::None => return 0,
            EvictionPolicy::Fifo(k) | EvictionPolicy::Lru(k) => k,
        };
        // Collect the victims under the borrow; drop them outside it,
        // since releasing an entry can run destructors that re-enter.
        let victims: Vec<Entry<Arg, Res>> = {
            let mut table = self.table.borrow_mut();
            if table.len() <= cap {
                return 0;
            }
            let excess = table.len() - cap;
            let mut ranked: Vec<(u64, MemoId<Arg>)> = table
                .iter()
                .map(|(k, e)| {
                    let rank = match policy {
                        EvictionPolicy::Fifo(_) => e.birth,
                        _ => e.touch.get(),
                    };
                    (rank, k.clone())
                })
                .collect();
            ranked.sort_by_key(|&(rank, _)| rank);
            ranked
                .into_iter()
                .take(excess)
                .filter_map(|(_, k)| table.remove(&k))
                .collect()
        };
        let n = victims.len();
        drop(victims);
        n
    }
}
