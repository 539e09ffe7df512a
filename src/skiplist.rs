//! Concurrent skip list: the ordered index over 64-bit keys.
//!
//! The structure is a lock-based concurrent skip list in the Herlihy-Shavit
//! style: each node carries a bitset of {IS_HEAD, MARKED_FOR_REMOVAL,
//! FULLY_LINKED} flags, a per-node lock, and a tower of forward pointers
//! sized at allocation. Readers never lock; they traverse atomically loaded
//! forward pointers and judge visibility by the flag word. Writers take
//! per-node locks with try-lock only and report contention to the caller,
//! which is expected to yield and retry (service tasks reschedule through
//! their worker's queue).
//!
//! Deletion is two-phase: setting MARKED_FOR_REMOVAL under the node's lock
//! is the linearization point; the structural unlink happens later, after
//! the caller's durability barrier. Unlinked nodes and superseded value
//! objects are never freed here; they are surrendered to the epoch
//! collector, which defers destruction until no worker can still observe
//! them (see `cleaner`).
//!
//! The head node is a sentinel with the full tower height; user keys occupy
//! the entire u64 range and are distinguished from the head by flag, not by
//! key value.

use std::cell::RefCell;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicU16, AtomicU64, AtomicUsize, Ordering};
use std::sync::OnceLock;

use parking_lot::lock_api::RawMutex as RawMutexApi;
use parking_lot::RawMutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

/// Tallest tower a node can have.
pub const MAX_HEIGHT: usize = 24;

const IS_HEAD: u16 = 1;
const MARKED_FOR_REMOVAL: u16 = 1 << 1;
const FULLY_LINKED: u16 = 1 << 2;

/// How long `add_or_get` spins waiting for a found node to finish linking
/// before giving up and asking the caller to retry.
const LINK_SPIN_LIMIT: usize = 1000;

/// An immutable byte sequence owned by exactly one node at a time.
pub struct ValueObject {
    data: Box<[u8]>,
}

impl ValueObject {
    pub fn new(bytes: &[u8]) -> Box<Self> {
        Box::new(Self { data: bytes.into() })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A superseded value object awaiting epoch-deferred destruction. Only the
/// collector may turn this back into an owned box.
pub struct RetiredValue(pub(crate) *mut ValueObject);

// The pointed-to object is unreachable from the index and owned solely by
// whoever holds this wrapper.
unsafe impl Send for RetiredValue {}

struct Node {
    key: u64,
    height: u8,
    flags: AtomicU16,
    lock: RawMutex,
    value: AtomicPtr<ValueObject>,
    tower: Box<[AtomicPtr<Node>]>,
}

impl Node {
    fn alloc(key: u64, height: usize, is_head: bool) -> *mut Node {
        debug_assert!((1..=MAX_HEIGHT).contains(&height));
        let tower: Box<[AtomicPtr<Node>]> =
            (0..height).map(|_| AtomicPtr::new(ptr::null_mut())).collect();
        Box::into_raw(Box::new(Node {
            key,
            height: height as u8,
            flags: AtomicU16::new(if is_head { IS_HEAD } else { 0 }),
            lock: RawMutex::INIT,
            value: AtomicPtr::new(ptr::null_mut()),
            tower,
        }))
    }

    fn forward(&self, level: usize) -> *mut Node {
        self.tower[level].load(Ordering::Acquire)
    }

    fn set_forward(&self, level: usize, next: *mut Node) {
        self.tower[level].store(next, Ordering::Release);
    }

    fn flags(&self) -> u16 {
        self.flags.load(Ordering::Acquire)
    }

    fn is_marked(&self) -> bool {
        self.flags() & MARKED_FOR_REMOVAL != 0
    }

    fn is_fully_linked(&self) -> bool {
        self.flags() & FULLY_LINKED != 0
    }

    fn max_layer(&self) -> usize {
        self.height as usize - 1
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        let value = *self.value.get_mut();
        if !value.is_null() {
            drop(unsafe { Box::from_raw(value) });
        }
    }
}

/// Shared handle to a live node. Valid for as long as the holder's epoch
/// keeps the node from being destroyed: service tasks hold one across
/// queue reschedules, the collector holds one per retired node.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct NodeRef(NonNull<Node>);

// Nodes are shared between worker threads and the collector; all mutable
// state inside is atomic or guarded by the per-node lock.
unsafe impl Send for NodeRef {}
unsafe impl Sync for NodeRef {}

impl NodeRef {
    fn new(node: *mut Node) -> Option<Self> {
        NonNull::new(node).map(NodeRef)
    }

    fn node(&self) -> &Node {
        unsafe { self.0.as_ref() }
    }

    pub fn key(&self) -> u64 {
        self.node().key
    }

    pub fn height(&self) -> usize {
        self.node().height as usize
    }

    pub fn is_marked(&self) -> bool {
        self.node().is_marked()
    }

    pub fn is_fully_linked(&self) -> bool {
        self.node().is_fully_linked()
    }

    /// Attempts to take the node's lock. The lock is a raw mutex so a
    /// service task can hold it across task reschedules; every successful
    /// `try_lock` must be paired with exactly one [`NodeRef::unlock`].
    pub fn try_lock(&self) -> bool {
        self.node().lock.try_lock()
    }

    /// Releases the node's lock. Caller must hold it.
    pub fn unlock(&self) {
        unsafe { self.node().lock.unlock() }
    }

    /// Tombstones the node. Caller must hold the node's lock; this is the
    /// linearization point of a delete.
    pub fn set_marked(&self) {
        self.node().flags.fetch_or(MARKED_FOR_REMOVAL, Ordering::Release);
    }

    /// Replaces the node's value object, returning the superseded one for
    /// the collector. Caller must hold the node's lock.
    pub fn set_value(&self, new: Box<ValueObject>) -> Option<RetiredValue> {
        let old = self.node().value.swap(Box::into_raw(new), Ordering::AcqRel);
        if old.is_null() {
            None
        } else {
            Some(RetiredValue(old))
        }
    }

    /// Reads the current value under the holder's epoch. None when the node
    /// has no value attached yet.
    pub fn read_value<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        let value = self.node().value.load(Ordering::Acquire);
        if value.is_null() {
            return None;
        }
        Some(f(unsafe { (*value).bytes() }))
    }

    /// The next live node at level 0, skipping tombstoned ones.
    pub fn next(&self) -> Option<NodeRef> {
        let mut node = self.node().forward(0);
        unsafe {
            while let Some(candidate) = node.as_ref() {
                if !candidate.is_marked() {
                    break;
                }
                node = candidate.forward(0);
            }
        }
        NodeRef::new(node)
    }
}

impl std::fmt::Debug for NodeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRef")
            .field("key", &self.key())
            .field("height", &self.height())
            .field("flags", &self.node().flags())
            .finish()
    }
}

/// A node removed from the index, awaiting epoch-deferred destruction.
pub struct RetiredNode(pub(crate) NodeRef);

/// Destroys a retired node. Caller must guarantee no worker can still
/// observe it (the collector's epoch condition).
pub(crate) unsafe fn destroy_node(retired: RetiredNode) {
    drop(Box::from_raw(retired.0 .0.as_ptr()));
}

/// Destroys a retired value object under the same contract.
pub(crate) unsafe fn destroy_value(retired: RetiredValue) {
    drop(Box::from_raw(retired.0));
}

/// Outcome of a single insert-or-acquire attempt.
pub enum AddOutcome {
    /// A fully linked live node with this key already existed.
    Found(NodeRef),
    /// A new node was created and linked.
    Created(NodeRef),
    /// Lock contention or a racing delete; yield and try again.
    Retry,
}

/// Outcome of a single unlink attempt on a marked node.
#[derive(Debug, PartialEq, Eq)]
pub enum UnlinkOutcome {
    Unlinked,
    /// Predecessor locks were contended or links moved; yield and retry.
    Retry,
}

pub struct SkipList {
    head: NonNull<Node>,
    size: AtomicUsize,
    epoch: AtomicU64,
}

unsafe impl Send for SkipList {}
unsafe impl Sync for SkipList {}

impl Default for SkipList {
    fn default() -> Self {
        Self::new()
    }
}

impl SkipList {
    pub fn new() -> Self {
        let head = Node::alloc(0, MAX_HEIGHT, true);
        Self {
            head: NonNull::new(head).unwrap(),
            size: AtomicUsize::new(0),
            epoch: AtomicU64::new(0),
        }
    }

    /// Number of fully linked, unmarked nodes.
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// The reclamation epoch as last advanced.
    pub fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Advances the reclamation epoch, returning the pre-increment value
    /// used to stamp a deferred destruction.
    pub fn advance_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::SeqCst)
    }

    fn head(&self) -> &Node {
        unsafe { self.head.as_ref() }
    }

    /// Point lookup: the unique fully linked, unmarked node with this key.
    pub fn find(&self, key: u64) -> Option<NodeRef> {
        let (node, found) = self.search(key);
        if !found {
            return None;
        }
        let node = NodeRef::new(node)?;
        if node.is_fully_linked() && !node.is_marked() {
            Some(node)
        } else {
            None
        }
    }

    /// First node whose key is >= `key`, skipping tombstoned nodes.
    pub fn lower_bound(&self, key: u64) -> Option<NodeRef> {
        let (mut node, _) = self.search(key);
        unsafe {
            while let Some(candidate) = node.as_ref() {
                if !candidate.is_marked() {
                    break;
                }
                node = candidate.forward(0);
            }
        }
        NodeRef::new(node)
    }

    /// First live node in key order, for scans from the beginning.
    pub fn first(&self) -> Option<NodeRef> {
        NodeRef(NonNull::from(self.head())).next()
    }

    /// One attempt of insert-or-acquire. On [`AddOutcome::Retry`] the caller
    /// yields (service tasks reschedule) and calls again.
    pub fn add_or_get(&self, key: u64) -> AddOutcome {
        let mut preds = [ptr::null_mut(); MAX_HEIGHT];
        let mut succs = [ptr::null_mut(); MAX_HEIGHT];
        let found_layer = self.find_insertion_point(key, &mut preds, &mut succs);

        if let Some(layer) = found_layer {
            let found = NodeRef::new(succs[layer]).expect("found layer has a node");
            if found.is_marked() {
                // A concurrent delete owns this node; wait for it to finish.
                return AddOutcome::Retry;
            }
            let mut spins = 0;
            while !found.is_fully_linked() {
                spins += 1;
                if spins >= LINK_SPIN_LIMIT {
                    return AddOutcome::Retry;
                }
                std::hint::spin_loop();
            }
            return AddOutcome::Found(found);
        }

        let height = random_height(MAX_HEIGHT);
        let Some(guard) = PredLocks::acquire(height, &preds, &succs, true) else {
            return AddOutcome::Retry;
        };

        let node = Node::alloc(key, height, false);
        unsafe {
            for level in 0..height {
                (*node).tower[level].store(succs[level], Ordering::Relaxed);
            }
            for level in 0..height {
                (*preds[level]).set_forward(level, node);
            }
            (*node).flags.fetch_or(FULLY_LINKED, Ordering::Release);
        }
        self.size.fetch_add(1, Ordering::Relaxed);
        drop(guard);
        AddOutcome::Created(NodeRef::new(node).unwrap())
    }

    /// Locates the delete candidate for `key`: a fully linked, unmarked
    /// node found at its own top layer. None means there is nothing to
    /// delete (the idempotent-erase success case).
    pub fn delete_candidate(&self, key: u64) -> Option<NodeRef> {
        let mut preds = [ptr::null_mut(); MAX_HEIGHT];
        let mut succs = [ptr::null_mut(); MAX_HEIGHT];
        let layer = self.find_insertion_point(key, &mut preds, &mut succs)?;
        let candidate = NodeRef::new(succs[layer])?;
        if candidate.is_fully_linked()
            && candidate.node().max_layer() == layer
            && !candidate.is_marked()
        {
            Some(candidate)
        } else {
            None
        }
    }

    /// One attempt to splice a marked node out of every level. The caller
    /// must have set MARKED_FOR_REMOVAL and released the node's own lock.
    /// On success the node is invisible to new traversals and must be
    /// surrendered to the collector.
    pub fn unlink(&self, node: NodeRef) -> UnlinkOutcome {
        debug_assert!(node.is_marked());
        let mut preds = [ptr::null_mut(); MAX_HEIGHT];
        let mut succs = [ptr::null_mut(); MAX_HEIGHT];
        let found = self.find_insertion_point(node.key(), &mut preds, &mut succs);
        // The node stays reachable until this unlink succeeds, and only one
        // deleter ever owns it (it marked the node).
        debug_assert_eq!(found, Some(node.node().max_layer()));

        let height = node.height();
        let Some(guard) = PredLocks::acquire(height, &preds, &succs, false) else {
            return UnlinkOutcome::Retry;
        };
        for level in (0..height).rev() {
            unsafe {
                (*preds[level]).set_forward(level, node.node().forward(level));
            }
        }
        self.size.fetch_sub(1, Ordering::Relaxed);
        drop(guard);
        UnlinkOutcome::Unlinked
    }

    /// Records predecessors and successors of `key` at every level.
    /// Returns the highest layer at which a node with this exact key was
    /// found. When found, `succs[0..=found]` all point at that node, even
    /// if a racing delete already spliced it out of some levels.
    fn find_insertion_point(
        &self,
        key: u64,
        preds: &mut [*mut Node; MAX_HEIGHT],
        succs: &mut [*mut Node; MAX_HEIGHT],
    ) -> Option<usize> {
        let mut found_layer = None;
        let mut found_node: *mut Node = ptr::null_mut();
        let mut pred: *mut Node = self.head.as_ptr();
        unsafe {
            for layer in (0..MAX_HEIGHT).rev() {
                let mut node = (*pred).forward(layer);
                while greater(key, node) {
                    pred = node;
                    node = (*node).forward(layer);
                }
                if found_layer.is_none() && !less(key, node) {
                    found_layer = Some(layer);
                    found_node = node;
                }
                preds[layer] = pred;
                succs[layer] = if found_node.is_null() { node } else { found_node };
            }
        }
        found_layer
    }

    /// Down-then-right search: returns the first node with key >= `key`
    /// and whether the keys are equal. Slightly better locality than
    /// right-then-down on the skipping pointers.
    fn search(&self, key: u64) -> (*mut Node, bool) {
        let mut pred: *mut Node = self.head.as_ptr();
        let mut height = MAX_HEIGHT;
        let mut node: *mut Node = ptr::null_mut();
        unsafe {
            loop {
                while height > 0 {
                    node = (*pred).forward(height - 1);
                    if !less(key, node) {
                        break;
                    }
                    height -= 1;
                }
                if height == 0 {
                    return (node, false);
                }
                height -= 1;

                while greater(key, node) {
                    pred = node;
                    node = (*node).forward(height);
                }
                if !less(key, node) {
                    return (node, true);
                }
            }
        }
    }
}

impl Drop for SkipList {
    fn drop(&mut self) {
        // Free every node still reachable at level 0 plus the head itself.
        // Retired nodes live in the collector's queues, not here.
        unsafe {
            let mut node = self.head().forward(0);
            while !node.is_null() {
                let next = (*node).forward(0);
                drop(Box::from_raw(node));
                node = next;
            }
            drop(Box::from_raw(self.head.as_ptr()));
        }
    }
}

/// True when `node` is the +inf sentinel (null) or its key exceeds `key`.
unsafe fn less(key: u64, node: *mut Node) -> bool {
    match node.as_ref() {
        None => true,
        Some(node) => key < node.key,
    }
}

/// True when `node` is non-null and its key is below `key`.
unsafe fn greater(key: u64, node: *mut Node) -> bool {
    match node.as_ref() {
        None => false,
        Some(node) => key > node.key,
    }
}

/// Try-locks the distinct predecessors for levels `0..height` bottom-up and
/// validates them: a predecessor must be unmarked and still point at the
/// recorded successor; when inserting, the successor must not be mid-delete.
/// Locks release on drop, in reverse order.
struct PredLocks {
    locked: [*mut Node; MAX_HEIGHT],
    count: usize,
}

impl PredLocks {
    fn acquire(
        height: usize,
        preds: &[*mut Node; MAX_HEIGHT],
        succs: &[*mut Node; MAX_HEIGHT],
        adding: bool,
    ) -> Option<PredLocks> {
        let mut guard = PredLocks { locked: [ptr::null_mut(); MAX_HEIGHT], count: 0 };
        let mut prev_pred: *mut Node = ptr::null_mut();
        for layer in 0..height {
            let pred = preds[layer];
            let succ = succs[layer];
            if pred != prev_pred {
                unsafe {
                    if !(*pred).lock.try_lock() {
                        return None; // guard drop releases what we hold
                    }
                }
                guard.locked[guard.count] = pred;
                guard.count += 1;
                prev_pred = pred;
            }
            let valid = unsafe {
                !(*pred).is_marked()
                    && (*pred).forward(layer) == succ
                    && (!adding || succ.as_ref().map_or(true, |s| !s.is_marked()))
            };
            if !valid {
                return None;
            }
        }
        Some(guard)
    }
}

impl Drop for PredLocks {
    fn drop(&mut self) {
        for i in (0..self.count).rev() {
            unsafe { (*self.locked[i]).lock.unlock() };
        }
    }
}

/// Cumulative height distribution for p = 1/e: table[i] is the probability
/// that a sampled height is <= i + 1. Computed once, read lock-free.
fn height_table() -> &'static [f64; MAX_HEIGHT] {
    static TABLE: OnceLock<[f64; MAX_HEIGHT]> = OnceLock::new();
    TABLE.get_or_init(|| {
        let prob = 1.0 / std::f64::consts::E;
        let mut table = [0.0; MAX_HEIGHT];
        let mut p = 1.0 - prob;
        table[0] = p;
        for i in 1..MAX_HEIGHT - 1 {
            p *= prob;
            table[i] = table[i - 1] + p;
        }
        table[MAX_HEIGHT - 1] = 1.0;
        table
    })
}

thread_local! {
    static HEIGHT_RNG: RefCell<SmallRng> = RefCell::new(SmallRng::from_entropy());
}

/// Samples a tower height in `1..=max` from the geometric distribution.
fn random_height(max: usize) -> usize {
    let sample: f64 = HEIGHT_RNG.with(|rng| rng.borrow_mut().gen());
    let table = height_table();
    for (i, bound) in table.iter().enumerate().take(max) {
        if sample < *bound {
            return i + 1;
        }
    }
    max
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    /// Insert with the retry loop the service layer provides in production.
    fn insert(list: &SkipList, key: u64) -> NodeRef {
        loop {
            match list.add_or_get(key) {
                AddOutcome::Found(node) | AddOutcome::Created(node) => return node,
                AddOutcome::Retry => std::hint::spin_loop(),
            }
        }
    }

    fn insert_with_value(list: &SkipList, key: u64, value: &[u8]) -> NodeRef {
        let node = insert(list, key);
        assert!(node.try_lock());
        let old = node.set_value(ValueObject::new(value));
        node.unlock();
        if let Some(old) = old {
            unsafe { destroy_value(old) };
        }
        node
    }

    /// Full remove as the erase handler performs it, minus the WAL barrier.
    /// The unlinked node is returned instead of freed: concurrent callers
    /// may still be traversing it, exactly the situation the collector
    /// exists for.
    fn remove_deferred(list: &SkipList, key: u64) -> Option<RetiredNode> {
        let candidate = list.delete_candidate(key)?;
        while !candidate.try_lock() {
            std::hint::spin_loop();
        }
        if candidate.is_marked() {
            candidate.unlock();
            return None;
        }
        candidate.set_marked();
        candidate.unlock();
        while list.unlink(candidate) == UnlinkOutcome::Retry {
            std::hint::spin_loop();
        }
        Some(RetiredNode(candidate))
    }

    /// Single-threaded remove: nothing else can observe the node, so it is
    /// destroyed on the spot.
    fn remove(list: &SkipList, key: u64) -> bool {
        match remove_deferred(list, key) {
            Some(retired) => {
                unsafe { destroy_node(retired) };
                true
            }
            None => false,
        }
    }

    fn collect_keys(list: &SkipList) -> Vec<u64> {
        let mut keys = Vec::new();
        let mut node = list.first();
        while let Some(current) = node {
            keys.push(current.key());
            node = current.next();
        }
        keys
    }

    #[test]
    fn insert_and_find() {
        let list = SkipList::new();
        insert_with_value(&list, 42, b"answer");
        assert_eq!(list.size(), 1);

        let node = list.find(42).unwrap();
        assert_eq!(node.key(), 42);
        assert_eq!(node.read_value(|v| v.to_vec()).unwrap(), b"answer");
        assert!(list.find(41).is_none());
    }

    #[test]
    fn duplicate_insert_returns_same_node() {
        let list = SkipList::new();
        let first = insert(&list, 7);
        let AddOutcome::Found(second) = list.add_or_get(7) else {
            panic!("expected existing node");
        };
        assert_eq!(first, second);
        assert_eq!(list.size(), 1);
    }

    #[test]
    fn iteration_is_key_ordered() {
        let list = SkipList::new();
        let mut keys: Vec<u64> = (1..=300).map(|i| i * 7919 % 1000).collect();
        for &key in &keys {
            insert(&list, key);
        }
        keys.sort_unstable();
        keys.dedup();
        assert_eq!(collect_keys(&list), keys);
        assert_eq!(list.size(), keys.len());
    }

    #[test]
    fn extreme_keys_are_usable() {
        let list = SkipList::new();
        insert(&list, u64::MAX);
        insert(&list, 1);
        // The head is flag-tagged, so user key 0 works even though the head
        // node carries key value 0.
        insert(&list, 0);
        assert_eq!(collect_keys(&list), vec![0, 1, u64::MAX]);
        assert!(list.find(0).is_some());
    }

    #[test]
    fn value_replacement_retires_old_object() {
        let list = SkipList::new();
        let node = insert_with_value(&list, 5, b"v1");
        assert!(node.try_lock());
        let old = node.set_value(ValueObject::new(b"v2")).expect("v1 superseded");
        node.unlock();
        unsafe { destroy_value(old) };
        assert_eq!(node.read_value(|v| v.to_vec()).unwrap(), b"v2");
    }

    #[test]
    fn remove_then_find_misses() {
        let list = SkipList::new();
        for key in [1u64, 2, 3] {
            insert_with_value(&list, key, b"x");
        }
        assert!(remove(&list, 2));
        assert!(list.find(2).is_none());
        assert_eq!(collect_keys(&list), vec![1, 3]);
        assert_eq!(list.size(), 2);
        // Idempotent: a second remove finds nothing.
        assert!(!remove(&list, 2));
    }

    #[test]
    fn marked_node_is_invisible_but_linked() {
        let list = SkipList::new();
        insert(&list, 10);
        insert(&list, 20);
        let candidate = list.delete_candidate(20).unwrap();
        assert!(candidate.try_lock());
        candidate.set_marked();
        candidate.unlock();

        // Not yet unlinked, but both lookups and iteration skip it.
        assert!(list.find(20).is_none());
        assert_eq!(collect_keys(&list), vec![10]);
        assert!(list.lower_bound(15).is_none());

        while list.unlink(candidate) == UnlinkOutcome::Retry {}
        unsafe { destroy_node(RetiredNode(candidate)) };
    }

    #[test]
    fn lower_bound_positions() {
        let list = SkipList::new();
        for key in [10u64, 20, 30] {
            insert(&list, key);
        }
        assert_eq!(list.lower_bound(5).unwrap().key(), 10);
        assert_eq!(list.lower_bound(20).unwrap().key(), 20);
        assert_eq!(list.lower_bound(21).unwrap().key(), 30);
        assert!(list.lower_bound(31).is_none());
    }

    #[test]
    fn epoch_advances_monotonically() {
        let list = SkipList::new();
        let first = list.advance_epoch();
        let second = list.advance_epoch();
        assert_eq!(second, first + 1);
        assert_eq!(list.current_epoch(), second + 1);
    }

    #[test]
    fn random_heights_stay_in_range() {
        for _ in 0..10_000 {
            let height = random_height(MAX_HEIGHT);
            assert!((1..=MAX_HEIGHT).contains(&height));
        }
        // With p = 1/e roughly 63% of nodes have height 1; leave slack for
        // sampling noise but catch a broken table.
        let ones = (0..10_000).filter(|_| random_height(MAX_HEIGHT) == 1).count();
        assert!((5000..8000).contains(&ones), "unexpected height-1 share: {ones}");
    }

    #[test]
    fn concurrent_inserts_land_sorted() {
        let list = Arc::new(SkipList::new());
        let threads: Vec<_> = (0..8u64)
            .map(|t| {
                let list = Arc::clone(&list);
                std::thread::spawn(move || {
                    for i in 0..500u64 {
                        insert(&list, t * 1_000_000 + i);
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(list.size(), 8 * 500);
        let keys = collect_keys(&list);
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn concurrent_same_key_inserts_keep_one_node() {
        let list = Arc::new(SkipList::new());
        let threads: Vec<_> = (0..8u64)
            .map(|_| {
                let list = Arc::clone(&list);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        insert(&list, 77);
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(list.size(), 1);
        assert_eq!(collect_keys(&list), vec![77]);
    }

    #[test]
    fn concurrent_insert_remove_churn() {
        let list = Arc::new(SkipList::new());
        for key in 0..100u64 {
            insert(&list, key);
        }
        let writers: Vec<_> = (0..4u64)
            .map(|t| {
                let list = Arc::clone(&list);
                std::thread::spawn(move || {
                    // Destruction waits until every thread is done, the way
                    // the collector's epoch condition would make it.
                    let mut retired = Vec::new();
                    for i in 0..250u64 {
                        let key = 1000 + t * 250 + i;
                        insert(&list, key);
                        retired.extend(remove_deferred(&list, key));
                    }
                    retired
                })
            })
            .collect();
        let retired: Vec<RetiredNode> =
            writers.into_iter().flat_map(|thread| thread.join().unwrap()).collect();
        // The stable prefix survived the churn untouched.
        assert_eq!(collect_keys(&list), (0..100u64).collect::<Vec<_>>());
        assert_eq!(list.size(), 100);
        assert_eq!(retired.len(), 4 * 250);
        for node in retired {
            unsafe { destroy_node(node) };
        }
    }
}
