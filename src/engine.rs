//! The demanded computation graph.
//!
//! Nodes are mutable cells and suspended computations; edges record
//! which node forced (observed) or created which other node.  Mutation
//! via `set` marks the affected reverse edges dirty; the next `force`
//! repairs the graph by a truncated in-order walk of the recorded
//! edges, re-running a suspension only when one of its observed
//! dependencies produced a different value.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::env;
use std::fmt;
use std::fmt::{Debug, Formatter};
use std::hash::{Hash, Hasher};
use std::mem::replace;
use std::rc::Rc;
use std::rc::Weak;

use fxhash::FxHashMap;
use log::{debug, warn};

use crate::name::Name;
use crate::weakset::WeakSet;

const ENGINE_MSG: &str = "grifola::engine:";

/// The id of the outside environment of Rust code; creators with this
/// id are never filthy-marked, and no node ever depends on it.
pub(crate) const ROOT_ID: u64 = 0;

/// Values that may inhabit cells and suspension results.
///
/// `sanitize` is applied to every value that crosses the DCG boundary;
/// the default of cloning is sufficient because crossing values are
/// owned copies.
pub trait Data: 'static + Clone + Eq + Hash + Debug {
    fn sanitize(&self) -> Self {
        self.clone()
    }
}
impl<T: 'static + Clone + Eq + Hash + Debug> Data for T {}

// ---------- Graph state lattices:

/// Consistency of the sub-graph beneath a just-observed node.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DcgState {
    Consistent,
    MaybeInconsistent,
}

impl DcgState {
    pub fn meet(self, other: DcgState) -> DcgState {
        match (self, other) {
            (DcgState::Consistent, DcgState::Consistent) => DcgState::Consistent,
            _ => DcgState::MaybeInconsistent,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Flag {
    Clean,
    Dirty,
    /// Mid-repair marker: the edge's source is being checked right now.
    DirtyToClean,
    /// The edge belongs to a discarded evaluation or an evicted node.
    Obsolete,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum NodeState {
    Ok,
    /// The node's argument or a creator changed; the next repair must
    /// re-evaluate unconditionally.
    Filthy,
}

// ---------- Meta-nodes and edges:

/// Identity and reverse-edge sets, shared by every kind of DCG node.
pub struct Meta {
    pub(crate) id: u64,
    nm: Option<Name>,
    pub(crate) state: Cell<NodeState>,
    /// Incoming force edges: the suspensions that observed me.
    pub(crate) dependents: RefCell<WeakSet<ForceEdge>>,
    /// Incoming creation edges: the suspensions inside which I was
    /// allocated.
    pub(crate) mutators: RefCell<WeakSet<MutEdge>>,
}

impl Debug for Meta {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self.nm {
            Some(ref nm) => write!(f, "µ{}·{:?}", self.id, nm),
            None => write!(f, "µ{}", self.id),
        }
    }
}

/// A dependency: `dependent` forced the node whose meta holds this
/// edge.  Held strongly by the dependent's recorded `forces`, weakly
/// by the target's `dependents`.
pub(crate) struct ForceEdge {
    pub(crate) dependent: Rc<Meta>,
    pub(crate) flag: Cell<Flag>,
    /// Repairs the forced node and reports whether its value still
    /// equals the one this edge observed, plus the sub-graph state.
    pub(crate) receipt: Box<dyn Fn() -> (bool, DcgState)>,
    /// Reference-count release, run when the edge becomes Obsolete.
    pub(crate) undo: Box<dyn Fn()>,
}

impl Debug for ForceEdge {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{:?}--force:{:?}-->", self.dependent, self.flag.get())
    }
}

/// A creation edge: `source` allocated the node whose meta holds this
/// edge.
pub(crate) struct MutEdge {
    pub(crate) source: Rc<Meta>,
    pub(crate) flag: Cell<Flag>,
    pub(crate) undo: Box<dyn Fn()>,
}

impl Debug for MutEdge {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{:?}--create:{:?}-->", self.source, self.flag.get())
    }
}

// ---------- Nodes:

/// An externally-written input node.  Writable only from outside any
/// force context, via `set`.
pub struct MutCell<T: Data> {
    pub(crate) meta: Rc<Meta>,
    val: RefCell<T>,
}

/// The outcome of a suspension's most recent evaluation: the cached
/// value plus the outgoing edges it recorded, in force order.
pub(crate) struct SuspState<T: Data> {
    pub(crate) body: Rc<dyn Fn() -> T>,
    pub(crate) value: Option<T>,
    pub(crate) forces: Vec<Rc<ForceEdge>>,
    pub(crate) creates: Vec<Rc<MutEdge>>,
}

/// A suspended computation in the graph.
pub struct SuspNode<T: Data> {
    pub(crate) meta: Rc<Meta>,
    /// Live incoming edges plus pending external holds; see `decr_refc`.
    pub(crate) refc: Cell<usize>,
    pub(crate) dead: Cell<bool>,
    /// Removes this node's memo entry; taken exactly once, at teardown.
    pub(crate) undo: RefCell<Option<Box<dyn Fn()>>>,
    pub(crate) state: RefCell<SuspState<T>>,
}

impl<T: Data> SuspNode<T> {
    fn fresh(
        meta: Rc<Meta>,
        body: Rc<dyn Fn() -> T>,
        undo: Option<Box<dyn Fn()>>,
        refc: usize,
    ) -> SuspNode<T> {
        SuspNode {
            meta,
            refc: Cell::new(refc),
            dead: Cell::new(false),
            undo: RefCell::new(undo),
            state: RefCell::new(SuspState { body, value: None, forces: Vec::new(), creates: Vec::new() }),
        }
    }
}

/// The slot of a suspension pointer only ever moves forward:
/// `Empty → Prenode → Node`.  (`Hole` is a transient marker used while
/// swapping; it is never observable.)
pub(crate) enum Slot<T: Data> {
    Empty { body: Rc<dyn Fn() -> T> },
    Prenode { body: Rc<dyn Fn() -> T>, meta: Rc<Meta>, undo: Option<Box<dyn Fn()>>, refc: usize },
    Node(Rc<SuspNode<T>>),
    Hole,
}

/// Stable handle to a suspension; memo-table hits share one canonical
/// pointer (and hence one node) among many call sites.
pub struct SuspPtr<T: Data> {
    pub(crate) slot: RefCell<Slot<T>>,
    /// Pending external (outside-any-frame) holds; released on drop of
    /// the last handle to this pointer.
    pub(crate) external_holds: Cell<usize>,
}

impl<T: Data> SuspPtr<T> {
    pub(crate) fn meta(&self) -> Option<Rc<Meta>> {
        match &*self.slot.borrow() {
            Slot::Prenode { meta, .. } => Some(meta.clone()),
            Slot::Node(n) => Some(n.meta.clone()),
            _ => None,
        }
    }
}

impl<T: Data> Drop for SuspPtr<T> {
    fn drop(&mut self) {
        if self.external_holds.get() == 0 {
            return;
        }
        self.external_holds.set(0);
        let node = match &*self.slot.borrow() {
            Slot::Node(n) => Some(n.clone()),
            _ => None,
        };
        match node {
            Some(n) => decr_node_refc(&n, false),
            None => {
                if let Slot::Prenode { refc, .. } = &mut *self.slot.borrow_mut() {
                    *refc = refc.saturating_sub(1);
                }
            }
        }
    }
}

// ---------- Articulations (node handles):

/// The observable handle to a DCG node.
pub enum Art<T: Data> {
    /// Eager value; no table entry, no dependency tracking.
    Rc(Rc<T>),
    Cell(Rc<MutCell<T>>),
    Susp(Rc<SuspPtr<T>>),
}

impl<T: Data> Clone for Art<T> {
    fn clone(&self) -> Self {
        match self {
            Art::Rc(v) => Art::Rc(v.clone()),
            Art::Cell(c) => Art::Cell(c.clone()),
            Art::Susp(p) => Art::Susp(p.clone()),
        }
    }
}

impl<T: Data> PartialEq for Art<T> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Art::Rc(a), Art::Rc(b)) => a == b,
            (Art::Cell(a), Art::Cell(b)) => a.meta.id == b.meta.id,
            (Art::Susp(a), Art::Susp(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                // Distinct pointers are equal only once both have been
                // backed by the same node.
                let (sa, sb) = (a.slot.borrow(), b.slot.borrow());
                match (&*sa, &*sb) {
                    (Slot::Node(m), Slot::Node(n)) => Rc::ptr_eq(m, n),
                    _ => false,
                }
            }
            _ => false,
        }
    }
}
impl<T: Data> Eq for Art<T> {}

impl<T: Data> Hash for Art<T> {
    fn hash<H: Hasher>(&self, h: &mut H) {
        match self {
            Art::Rc(v) => {
                0u8.hash(h);
                v.hash(h);
            }
            Art::Cell(c) => {
                1u8.hash(h);
                c.meta.id.hash(h);
            }
            Art::Susp(p) => {
                2u8.hash(h);
                match &*p.slot.borrow() {
                    Slot::Prenode { meta, .. } => meta.id.hash(h),
                    Slot::Node(n) => n.meta.id.hash(h),
                    _ => u64::MAX.hash(h),
                }
            }
        }
    }
}

impl<T: Data> Debug for Art<T> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Art::Rc(v) => write!(f, "&{:?}", v),
            Art::Cell(c) => write!(f, "cell@{:?}", c.meta),
            Art::Susp(p) => match p.meta() {
                Some(meta) => write!(f, "susp@{:?}", meta),
                None => write!(f, "susp@?"),
            },
        }
    }
}

// ---------- Engine configuration:

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EvictionPolicy {
    None,
    Fifo(usize),
    Lru(usize),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EvictionTime {
    OnFlush,
}

#[derive(Clone, Copy, Debug)]
pub struct Flags {
    /// Reference-count incoming edges; evict nodes whose count hits zero.
    pub ref_count: bool,
    /// Obsolete a suspension's previous edges when re-evaluation
    /// starts, rather than after it completes.
    pub dirty_exactly: bool,
    /// Cut off repair when a changed dependency still produced an equal
    /// value; when false, every dirty edge forces re-evaluation.
    pub check_receipt: bool,
    /// Memo hits hand out a fresh pointer sharing the canonical node,
    /// so external holders never alias the canonical handle.
    pub sanitize_pointers: bool,
    /// Treat nominal memo keys as generative.
    pub disable_names: bool,
    /// Classical identity: structural memo keys carry a fresh runtime
    /// id per invocation.
    pub generative_ids: bool,
    /// Collapse every memoized call to an eager, untracked value.
    pub disable_mfns: bool,
    /// Check that every ancestor frame's edges are Clean whenever a new
    /// edge is created.
    pub debug_assert: bool,
    pub eviction_policy: EvictionPolicy,
    pub eviction_time: EvictionTime,
}

impl Default for Flags {
    fn default() -> Flags {
        Flags {
            ref_count: true,
            dirty_exactly: true,
            check_receipt: true,
            sanitize_pointers: false,
            disable_names: false,
            generative_ids: false,
            disable_mfns: false,
            debug_assert: false,
            eviction_policy: EvictionPolicy::None,
            eviction_time: EvictionTime::OnFlush,
        }
    }
}

impl Flags {
    /// Defaults, overridden by `GRIFOLA_*` environment variables.
    pub fn from_env() -> Flags {
        let on = |var: &str| env::var(var).map(|v| !v.is_empty()).unwrap_or(false);
        let policy = match env::var("GRIFOLA_EVICT") {
            Ok(ref s) => {
                let parse_k = |s: &str| s.parse::<usize>().ok();
                match s.split_once(':') {
                    Some(("fifo", k)) => parse_k(k).map_or(EvictionPolicy::None, EvictionPolicy::Fifo),
                    Some(("lru", k)) => parse_k(k).map_or(EvictionPolicy::None, EvictionPolicy::Lru),
                    _ => EvictionPolicy::None,
                }
            }
            Err(_) => EvictionPolicy::None,
        };
        Flags {
            ref_count: !on("GRIFOLA_NO_REFC"),
            dirty_exactly: !on("GRIFOLA_NO_DIRTY_EXACTLY"),
            check_receipt: !on("GRIFOLA_NO_CHECK_RECEIPT"),
            sanitize_pointers: on("GRIFOLA_SANITIZE_POINTERS"),
            disable_names: on("GRIFOLA_DISABLE_NAMES"),
            generative_ids: on("GRIFOLA_GENERATIVE_IDS"),
            disable_mfns: on("GRIFOLA_DISABLE_MFNS"),
            debug_assert: on("GRIFOLA_DEBUG_ASSERT"),
            eviction_policy: policy,
            eviction_time: EvictionTime::OnFlush,
        }
    }
}

// ---------- Statistics counters:

/// Opaque statistics; the engine increments, callers interpret.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Cnt {
    /// Nodes allocated.
    pub create: usize,
    /// Suspension bodies run.
    pub eval: usize,
    /// Edges flipped Clean → Dirty.
    pub dirty: usize,
    /// Dirty edges certified clean without re-evaluation.
    pub clean: usize,
    /// Memo entries dropped by the eviction policy.
    pub evict: usize,
    /// High-water mark of the force stack.
    pub stack: usize,
}

impl Cnt {
    fn add(&self, o: &Cnt) -> Cnt {
        Cnt {
            create: self.create + o.create,
            eval: self.eval + o.eval,
            dirty: self.dirty + o.dirty,
            clean: self.clean + o.clean,
            evict: self.evict + o.evict,
            stack: self.stack.max(o.stack),
        }
    }
}

/// Run `body`, returning its result along with the counter deltas it
/// incurred.
pub fn cnt<Res, F: FnOnce() -> Res>(body: F) -> (Res, Cnt) {
    let saved = with_engine(|e| replace(&mut e.cnt, Cnt::default()));
    let x = body();
    let delta = with_engine(|e| {
        let d = replace(&mut e.cnt, Cnt::default());
        e.cnt = saved.add(&d);
        d
    });
    (x, delta)
}

// ---------- The engine proper:

/// A force frame: the currently-executing suspension and the outgoing
/// edges it has recorded so far.
pub(crate) struct Frame {
    pub(crate) edge_src: Rc<Meta>,
    pub(crate) obs_edges: Vec<Rc<ForceEdge>>,
    pub(crate) mut_edges: Vec<Rc<MutEdge>>,
}

/// Memo tables register here so `flush` can apply the eviction policy.
pub(crate) trait EvictTable {
    fn evict(&self, policy: EvictionPolicy) -> usize;
}

pub(crate) struct Engine {
    flags: Flags,
    stack: Vec<Frame>,
    cnt: Cnt,
    /// Monotone node ids; `ROOT_ID` is reserved for the environment.
    id_ctr: u64,
    /// Bumped on every observable mutation.
    seq: u64,
    /// Deferred destructors, keyed by meta id; drained by `flush`.
    undo_buff: FxHashMap<u64, Box<dyn Fn()>>,
    tables: Vec<Weak<dyn EvictTable>>,
}

impl Engine {
    fn new(flags: Flags) -> Engine {
        Engine {
            flags,
            stack: Vec::new(),
            cnt: Cnt::default(),
            id_ctr: ROOT_ID + 1,
            seq: 0,
            undo_buff: FxHashMap::default(),
            tables: Vec::new(),
        }
    }
}

thread_local!(static ENGINE: RefCell<Engine> = RefCell::new(Engine::new(Flags::from_env())));

fn with_engine<R>(f: impl FnOnce(&mut Engine) -> R) -> R {
    ENGINE.with(|e| f(&mut e.borrow_mut()))
}

pub(crate) fn flags() -> Flags {
    ENGINE
        .try_with(|e| e.try_borrow().map(|e| e.flags).unwrap_or_default())
        .unwrap_or_default()
}

/// The engine's sequence counter: bumped once per observable `set`.
pub fn seq() -> u64 {
    with_engine(|e| e.seq)
}

pub(crate) fn bump_create() {
    with_engine(|e| e.cnt.create += 1);
}

pub(crate) fn fresh_gen_id() -> u64 {
    with_engine(|e| {
        let id = e.id_ctr;
        e.id_ctr += 1;
        id
    })
}

pub(crate) fn fresh_meta(nm: Option<Name>) -> Rc<Meta> {
    let id = fresh_gen_id();
    Rc::new(Meta {
        id,
        nm,
        state: Cell::new(NodeState::Ok),
        dependents: RefCell::new(WeakSet::new()),
        mutators: RefCell::new(WeakSet::new()),
    })
}

fn engine_msg() -> String {
    let depth = ENGINE
        .try_with(|e| e.try_borrow().map(|e| e.stack.len()).unwrap_or(0))
        .unwrap_or(0);
    let mut s = String::from(ENGINE_MSG);
    for _ in 1..depth.max(1) {
        s.push_str("···〉");
    }
    s
}

pub mod manage {
    //! Engine lifecycle.
    use super::*;

    /// (Re)initialize this thread's engine with environment-derived
    /// flags.
    pub fn init_dcg() {
        init_engine(Flags::from_env());
    }

    /// (Re)initialize this thread's engine with explicit flags.
    pub fn init_engine(flags: Flags) {
        ENGINE.with(|e| *e.borrow_mut() = Engine::new(flags));
    }
}

// ---------- Edge recording:

fn check_frames_clean(e: &Engine) {
    for frame in e.stack.iter() {
        for edge in frame.obs_edges.iter() {
            if edge.flag.get() != Flag::Clean {
                panic!(
                    "{} wf: ancestor frame {:?} holds a non-clean edge at edge creation",
                    ENGINE_MSG, frame.edge_src
                );
            }
        }
    }
}

/// Record a force edge from the running frame, if any, to `target`.
/// Returns false for an external (frame-less) force.
pub(crate) fn record_force_edge(
    target: &Rc<Meta>,
    st: DcgState,
    receipt: Box<dyn Fn() -> (bool, DcgState)>,
    undo: Box<dyn Fn()>,
) -> bool {
    with_engine(|e| {
        if e.flags.debug_assert {
            check_frames_clean(e);
        }
        match e.stack.last_mut() {
            Some(frame) => {
                let flag = if st == DcgState::Consistent { Flag::Clean } else { Flag::Dirty };
                let edge = Rc::new(ForceEdge {
                    dependent: frame.edge_src.clone(),
                    flag: Cell::new(flag),
                    receipt,
                    undo,
                });
                let merged = target.dependents.borrow_mut().merge(frame.edge_src.id, &edge);
                frame.obs_edges.push(merged);
                true
            }
            None => false,
        }
    })
}

/// Record a creation edge from the running frame, if any, to `target`.
/// Returns false for an external (frame-less) creation.
pub(crate) fn record_create_edge(target: &Rc<Meta>, undo: Box<dyn Fn()>) -> bool {
    with_engine(|e| {
        if e.flags.debug_assert {
            check_frames_clean(e);
        }
        match e.stack.last_mut() {
            Some(frame) => {
                let edge = Rc::new(MutEdge {
                    source: frame.edge_src.clone(),
                    flag: Cell::new(Flag::Clean),
                    undo,
                });
                let merged = target.mutators.borrow_mut().merge(frame.edge_src.id, &edge);
                frame.mut_edges.push(merged);
                true
            }
            None => false,
        }
    })
}

// ---------- Reference counting and teardown:

pub(crate) fn incr_refc<T: Data>(p: &Rc<SuspPtr<T>>) {
    if !flags().ref_count {
        return;
    }
    match &mut *p.slot.borrow_mut() {
        Slot::Prenode { refc, .. } => *refc += 1,
        Slot::Node(n) => n.refc.set(n.refc.get() + 1),
        _ => {}
    }
}

fn incr_node_refc<T: Data>(n: &Rc<SuspNode<T>>) {
    if flags().ref_count {
        n.refc.set(n.refc.get() + 1);
    }
}

/// Install a single pending hold for an external observer or creator.
/// Released when the last handle to this pointer drops.
pub(crate) fn external_hold<T: Data>(p: &Rc<SuspPtr<T>>) {
    if !flags().ref_count {
        return;
    }
    if p.external_holds.get() == 0 {
        p.external_holds.set(1);
        incr_refc(p);
    }
}

pub(crate) fn decr_refc<T: Data>(p: &Rc<SuspPtr<T>>, undo_now: bool) {
    if !flags().ref_count {
        return;
    }
    let node = {
        let mut slot = p.slot.borrow_mut();
        match &mut *slot {
            // A prenode has no state to release; never destroy here.
            Slot::Prenode { refc, .. } => {
                *refc = refc.saturating_sub(1);
                None
            }
            Slot::Node(n) => Some(n.clone()),
            _ => None,
        }
    };
    if let Some(n) = node {
        decr_node_refc(&n, undo_now);
    }
}

pub(crate) fn decr_node_refc<T: Data>(n: &Rc<SuspNode<T>>, undo_now: bool) {
    if !flags().ref_count {
        return;
    }
    let r = n.refc.get().saturating_sub(1);
    n.refc.set(r);
    if r > 0 || n.dead.get() {
        return;
    }
    if undo_now {
        teardown_node(n);
    } else {
        let n2 = n.clone();
        let id = n.meta.id;
        // Guarded: the node may be re-demanded before the buffer drains.
        let _ = ENGINE.try_with(|e| {
            e.borrow_mut().undo_buff.insert(
                id,
                Box::new(move || {
                    if n2.refc.get() == 0 && !n2.dead.get() {
                        teardown_node(&n2);
                    }
                }),
            );
        });
    }
}

fn teardown_node<T: Data>(n: &Rc<SuspNode<T>>) {
    if n.dead.replace(true) {
        return;
    }
    debug!("{} teardown: {:?}", engine_msg(), n.meta);
    if let Some(undo) = n.undo.borrow_mut().take() {
        undo();
    }
    let (forces, creates) = {
        let mut st = n.state.borrow_mut();
        (replace(&mut st.forces, Vec::new()), replace(&mut st.creates, Vec::new()))
    };
    obsolete_edges(&forces, &creates);
}

fn obsolete_edges(forces: &[Rc<ForceEdge>], creates: &[Rc<MutEdge>]) {
    for e in forces {
        if e.flag.get() != Flag::Obsolete {
            e.flag.set(Flag::Obsolete);
            (e.undo)();
        }
    }
    for e in creates {
        if e.flag.get() != Flag::Obsolete {
            e.flag.set(Flag::Obsolete);
            (e.undo)();
        }
    }
}

fn drain_undo_buff() {
    loop {
        let work: Vec<(u64, Box<dyn Fn()>)> = with_engine(|e| e.undo_buff.drain().collect());
        if work.is_empty() {
            return;
        }
        for (_, f) in work {
            f();
        }
    }
}

/// Drain pending destructions and apply the eviction policy.  Invoked
/// between top-level interactions to amortize deletion.
pub fn flush() {
    drain_undo_buff();
    let (policy, time) = with_engine(|e| (e.flags.eviction_policy, e.flags.eviction_time));
    match (policy, time) {
        (EvictionPolicy::None, _) => {}
        (policy, EvictionTime::OnFlush) => {
            let tables: Vec<Rc<dyn EvictTable>> = with_engine(|e| {
                e.tables.retain(|w| w.upgrade().is_some());
                e.tables.iter().filter_map(|w| w.upgrade()).collect()
            });
            let mut evicted = 0;
            for t in tables {
                evicted += t.evict(policy);
            }
            with_engine(|e| e.cnt.evict += evicted);
            // evicted entries may have released last holders
            drain_undo_buff();
        }
    }
}

pub(crate) fn register_table(t: Weak<dyn EvictTable>) {
    with_engine(|e| e.tables.push(t));
}

// ---------- Dirtying:

/// Breadth-first reverse walk: flip each Clean force edge to Dirty and
/// continue through its dependent.  Edges already Dirty or Obsolete are
/// skipped, which bounds the walk and terminates it on cycles.
pub(crate) fn dirty(meta: &Rc<Meta>) {
    let mut queue: VecDeque<Rc<Meta>> = VecDeque::new();
    queue.push_back(meta.clone());
    let mut dirtied = 0usize;
    while let Some(m) = queue.pop_front() {
        let next = m.dependents.borrow_mut().fold(Vec::new(), |mut v, edge| {
            if edge.flag.get() == Flag::Clean {
                edge.flag.set(Flag::Dirty);
                v.push(edge.dependent.clone());
            }
            v
        });
        dirtied += next.len();
        for d in next {
            queue.push_back(d);
        }
    }
    if dirtied > 0 {
        debug!("{} dirty: {:?}: {} edges dirtied", engine_msg(), meta, dirtied);
        with_engine(|e| e.cnt.dirty += dirtied);
    }
}

pub(crate) fn mark_filthy(meta: &Rc<Meta>) {
    debug!("{} mark_filthy: {:?}", engine_msg(), meta);
    meta.state.set(NodeState::Filthy);
    dirty(meta);
}

/// Filthy-mark every creator of `meta` except the running frame and
/// the outside environment.  Used when a nominal memo hit replaces the
/// stored argument: whoever created the entry must re-create it.
pub(crate) fn filthy_mutators(meta: &Rc<Meta>) {
    let cur = with_engine(|e| e.stack.last().map(|f| f.edge_src.id).unwrap_or(ROOT_ID));
    let victims = meta.mutators.borrow_mut().fold(Vec::new(), |mut v, edge| {
        if edge.flag.get() != Flag::Obsolete && edge.source.id != cur && edge.source.id != ROOT_ID {
            v.push(edge.source.clone());
        }
        v
    });
    for m in victims {
        mark_filthy(&m);
    }
}

// ---------- Frames:

struct FrameGuard {
    armed: bool,
}

impl FrameGuard {
    fn push(meta: Rc<Meta>) -> FrameGuard {
        with_engine(|e| {
            e.stack.push(Frame { edge_src: meta, obs_edges: Vec::new(), mut_edges: Vec::new() });
            if e.stack.len() > e.cnt.stack {
                e.cnt.stack = e.stack.len();
            }
        });
        FrameGuard { armed: true }
    }

    fn finish(mut self) -> Frame {
        self.armed = false;
        with_engine(|e| match e.stack.pop() {
            Some(frame) => frame,
            None => panic!("{} force stack invariant broken", ENGINE_MSG),
        })
    }
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        if self.armed {
            // the user body panicked: pop the frame and discard its
            // partial edge lists before the panic propagates
            let _ = ENGINE.try_with(|e| {
                e.borrow_mut().stack.pop();
            });
        }
    }
}

// ---------- Evaluate and repair:

/// Run the suspension's body under a fresh frame and record the edges
/// it produced.  Re-evaluations replace the node's state in place.
pub(crate) fn evaluate<T: Data>(node: &Rc<SuspNode<T>>) -> (T, DcgState) {
    debug!("{} evaluate begin: {:?}", engine_msg(), node.meta);
    let (old_forces, old_creates, body) = {
        let mut st = node.state.borrow_mut();
        (
            replace(&mut st.forces, Vec::new()),
            replace(&mut st.creates, Vec::new()),
            st.body.clone(),
        )
    };
    let exact = flags().dirty_exactly;
    if exact {
        obsolete_edges(&old_forces, &old_creates);
    }
    with_engine(|e| e.cnt.eval += 1);
    let guard = FrameGuard::push(node.meta.clone());
    let val = body();
    let frame = guard.finish();
    if !exact {
        obsolete_edges(&old_forces, &old_creates);
    }
    drop((old_forces, old_creates));
    let val = val.sanitize();
    let mut st_out = DcgState::Consistent;
    for e in frame.obs_edges.iter() {
        if e.flag.get() != Flag::Clean {
            st_out = DcgState::MaybeInconsistent;
        }
    }
    for e in frame.mut_edges.iter() {
        if e.flag.get() != Flag::Clean {
            st_out = DcgState::MaybeInconsistent;
        }
    }
    if st_out != DcgState::Consistent {
        // witnesses name reuse that dirtied our own fresh edges; the
        // result is still produced
        warn!(
            "{} dcg inconsistency: evaluation of {:?} completed with non-clean outgoing edges",
            engine_msg(),
            node.meta
        );
    }
    {
        let mut st = node.state.borrow_mut();
        st.value = Some(val.clone());
        st.forces = frame.obs_edges;
        st.creates = frame.mut_edges;
    }
    debug!("{} evaluate end: {:?} produced {:?}", engine_msg(), node.meta, val);
    (val, st_out)
}

/// Truncated in-order walk over the node's recorded forces: either
/// confirm the cached value or re-evaluate.
pub(crate) fn repair<T: Data>(node: &Rc<SuspNode<T>>) -> (T, DcgState) {
    if node.meta.state.get() == NodeState::Filthy {
        node.meta.state.set(NodeState::Ok);
        debug!("{} repair: {:?} is filthy; re-evaluating", engine_msg(), node.meta);
        return evaluate(node);
    }
    if node.state.borrow().value.is_none() {
        return evaluate(node);
    }
    let check_receipt = flags().check_receipt;
    let mut idx = 0;
    loop {
        let edge = match node.state.borrow().forces.get(idx) {
            Some(e) => e.clone(),
            None => break,
        };
        match edge.flag.get() {
            Flag::Clean => {}
            // The source was evicted out from under us.
            Flag::Obsolete => return evaluate(node),
            // XXX A mid-check edge here indicates a cycle or concurrent
            // descent; re-evaluate conservatively.
            Flag::DirtyToClean => return evaluate(node),
            Flag::Dirty => {
                if !check_receipt {
                    return evaluate(node);
                }
                edge.flag.set(Flag::DirtyToClean);
                let (unchanged, st) = (edge.receipt)();
                if st == DcgState::MaybeInconsistent {
                    edge.flag.set(Flag::Dirty);
                } else {
                    edge.flag.set(Flag::Clean);
                    with_engine(|e| e.cnt.clean += 1);
                }
                if !unchanged {
                    debug!("{} repair: {:?}: dependency changed; re-evaluating", engine_msg(), node.meta);
                    return evaluate(node);
                }
            }
        }
        idx += 1;
    }
    let st = node.state.borrow().forces.iter().fold(DcgState::Consistent, |acc, e| {
        if e.flag.get() == Flag::Clean {
            acc
        } else {
            DcgState::MaybeInconsistent
        }
    });
    let val = match node.state.borrow().value.clone() {
        Some(v) => v,
        None => panic!("{} repaired node lost its cached value", ENGINE_MSG),
    };
    (val, st)
}

// ---------- Public operations:

/// Create a fresh mutable cell.  The name identifies the cell in
/// diagnostics; allocation is always fresh.
pub fn cell<T: Data>(nm: Name, val: T) -> Art<T> {
    let meta = fresh_meta(Some(nm));
    let c = Rc::new(MutCell { meta: meta.clone(), val: RefCell::new(val.sanitize()) });
    bump_create();
    debug!("{} cell: {:?}", engine_msg(), meta);
    record_create_edge(&meta, Box::new(|| {}));
    Art::Cell(c)
}

/// Mutate a cell.  Only permitted from the outer layer; a value equal
/// to the current one is a no-op.
pub fn set<T: Data>(art: &Art<T>, val: T) {
    let c = match art {
        Art::Cell(c) => c,
        _ => panic!("{} misuse: set requires a mutable cell, got {:?}", ENGINE_MSG, art),
    };
    let depth = with_engine(|e| e.stack.len());
    if depth != 0 {
        panic!("{} misuse: set is only permitted outside of any force context", ENGINE_MSG);
    }
    let changed = {
        let mut v = c.val.borrow_mut();
        if *v == val {
            false
        } else {
            *v = val.sanitize();
            true
        }
    };
    if changed {
        debug!("{} set: {:?} <- {:?}", engine_msg(), c.meta, val);
        with_engine(|e| e.seq += 1);
        dirty(&c.meta);
    }
}

/// Create an anonymous suspension.
pub fn thunk<T: Data, F: 'static + Fn() -> T>(nm: Name, body: F) -> Art<T> {
    let meta = fresh_meta(Some(nm));
    bump_create();
    let ptr = Rc::new(SuspPtr {
        slot: RefCell::new(Slot::Prenode {
            body: Rc::new(body),
            meta: meta.clone(),
            undo: None,
            refc: 0,
        }),
        external_holds: Cell::new(0),
    });
    debug!("{} thunk: {:?}", engine_msg(), meta);
    let undo = {
        let p = ptr.clone();
        Box::new(move || decr_refc(&p, false))
    };
    if record_create_edge(&meta, undo) {
        incr_refc(&ptr);
    } else {
        external_hold(&ptr);
    }
    Art::Susp(ptr)
}

/// Eager, untracked articulation.
pub fn put<T: Data>(val: T) -> Art<T> {
    Art::Rc(Rc::new(val))
}

/// Observe a node's value.  Within a running suspension this records a
/// dependency edge; at the outer layer it installs a pending hold.
pub fn force<T: Data>(art: &Art<T>) -> T {
    match art {
        Art::Rc(v) => (**v).clone(),
        Art::Cell(c) => force_cell(c),
        Art::Susp(p) => force_susp(p),
    }
}

fn force_cell<T: Data>(c: &Rc<MutCell<T>>) -> T {
    let val = c.val.borrow().clone();
    let receipt: Box<dyn Fn() -> (bool, DcgState)> = {
        let c2 = c.clone();
        let obs = val.clone();
        Box::new(move || (*c2.val.borrow() == obs, DcgState::Consistent))
    };
    record_force_edge(&c.meta, DcgState::Consistent, receipt, Box::new(|| {}));
    val.sanitize()
}

fn force_susp<T: Data>(p: &Rc<SuspPtr<T>>) -> T {
    let (node, first_time) = {
        let mut slot = p.slot.borrow_mut();
        let backed = match &*slot {
            Slot::Node(n) => Some(n.clone()),
            _ => None,
        };
        match backed {
            Some(n) => (n, false),
            None => {
                let prev = replace(&mut *slot, Slot::Hole);
                let node = match prev {
                    Slot::Empty { body } => {
                        Rc::new(SuspNode::fresh(fresh_meta(None), body, None, 0))
                    }
                    Slot::Prenode { body, meta, undo, refc } => {
                        Rc::new(SuspNode::fresh(meta, body, undo, refc))
                    }
                    _ => panic!("{} suspension slot invariant broken", ENGINE_MSG),
                };
                *slot = Slot::Node(node.clone());
                (node, true)
            }
        }
    };
    let (val, st) = if first_time { evaluate(&node) } else { repair(&node) };
    let receipt: Box<dyn Fn() -> (bool, DcgState)> = {
        let n2 = node.clone();
        let obs = val.clone();
        Box::new(move || {
            let (v, s) = repair(&n2);
            (v == obs, s)
        })
    };
    let undo = {
        let n2 = node.clone();
        Box::new(move || decr_node_refc(&n2, false))
    };
    if record_force_edge(&node.meta, st, receipt, undo) {
        incr_node_refc(&node);
    } else {
        external_hold(p);
    }
    val.sanitize()
}
