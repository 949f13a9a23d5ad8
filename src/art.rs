//! A `u64`-keyed adaptive radix tree built from [`crate::lock::Lock`]s.
//!
//! Keys are decomposed into 8 big-endian bytes and the tree descends one
//! byte per level (no path compression — every leaf sits at depth 8). Each
//! branch node grows through a capacity ladder as children accumulate:
//! `Sparse` (4 slots, linear scan) → `Indirect` (16 slots, linear scan) →
//! `Full` (256 slots, direct-indexed). Growing a node replaces it outright
//! — a fresh, bigger node is built and CAS'd into the *parent's* slot — so,
//! exactly as in [`crate::bst`], a node's own [`Lock`] only ever needs to
//! guard filling one of its existing free slots; replacing the node itself
//! is guarded by whichever lock guards the pointer naming it (the parent's
//! lock, or `root_lock` at depth zero).

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::announce::WriteAnnouncements;
use crate::epoch::Epoch;
use crate::lock::{Lock, LockRuntime};
use crate::log::Log;
use crate::malloc::Allocator;
use crate::mutable::Mutable;
use crate::pool::EpochPoolImpl;
use crate::worker::WorkerInfo;

const SPARSE_CAP: usize = 4;
const INDIRECT_CAP: usize = 16;
const FULL_CAP: usize = 256;
const KEY_BYTES: usize = 8;

enum NodeKind<V, A: Allocator> {
    Leaf {
        key: u64,
        value: V,
    },
    Sparse {
        bytes: [AtomicU8; SPARSE_CAP],
        children: [Mutable<Node<V, A>>; SPARSE_CAP],
    },
    Indirect {
        bytes: [AtomicU8; INDIRECT_CAP],
        children: [Mutable<Node<V, A>>; INDIRECT_CAP],
    },
    Full {
        children: Box<[Mutable<Node<V, A>>; FULL_CAP]>,
    },
}

struct Node<V, A: Allocator> {
    kind: NodeKind<V, A>,
    lock: Lock<A>,
}

impl<V, A: Allocator> Node<V, A> {
    fn leaf(key: u64, value: V) -> Self {
        Node {
            kind: NodeKind::Leaf { key, value },
            lock: Lock::new(),
        }
    }

    fn sparse_with_one(byte: u8, child: *mut Node<V, A>) -> Self {
        let bytes = std::array::from_fn(|i| AtomicU8::new(if i == 0 { byte } else { 0 }));
        let children = std::array::from_fn(|i| {
            Mutable::new(if i == 0 { child } else { std::ptr::null_mut() })
        });
        Node {
            kind: NodeKind::Sparse { bytes, children },
            lock: Lock::new(),
        }
    }

    fn sparse_empty() -> Self {
        Node {
            kind: NodeKind::Sparse {
                bytes: std::array::from_fn(|_| AtomicU8::new(0)),
                children: std::array::from_fn(|_| Mutable::new(std::ptr::null_mut())),
            },
            lock: Lock::new(),
        }
    }

    /// Logged lookup of the child reached by `byte`, or (for a node with
    /// free capacity) the index of a free slot to insert it into.
    fn find_logged(&self, byte: u8, log: &Log) -> (*mut Node<V, A>, Option<usize>) {
        match &self.kind {
            NodeKind::Sparse { bytes, children } => {
                let mut free = None;
                for i in 0..SPARSE_CAP {
                    let c = children[i].load(log);
                    if c.is_null() {
                        free.get_or_insert(i);
                        continue;
                    }
                    if bytes[i].load(Ordering::Acquire) == byte {
                        return (c, None);
                    }
                }
                (std::ptr::null_mut(), free)
            }
            NodeKind::Indirect { bytes, children } => {
                let mut free = None;
                for i in 0..INDIRECT_CAP {
                    let c = children[i].load(log);
                    if c.is_null() {
                        free.get_or_insert(i);
                        continue;
                    }
                    if bytes[i].load(Ordering::Acquire) == byte {
                        return (c, None);
                    }
                }
                (std::ptr::null_mut(), free)
            }
            NodeKind::Full { children } => (children[byte as usize].load(log), Some(byte as usize)),
            NodeKind::Leaf { .. } => (std::ptr::null_mut(), None),
        }
    }

    fn find_unlogged(&self, byte: u8) -> *mut Node<V, A> {
        match &self.kind {
            NodeKind::Sparse { bytes, children } => (0..SPARSE_CAP)
                .find_map(|i| {
                    let c = children[i].load_unlogged();
                    (!c.is_null() && bytes[i].load(Ordering::Acquire) == byte).then_some(c)
                })
                .unwrap_or(std::ptr::null_mut()),
            NodeKind::Indirect { bytes, children } => (0..INDIRECT_CAP)
                .find_map(|i| {
                    let c = children[i].load_unlogged();
                    (!c.is_null() && bytes[i].load(Ordering::Acquire) == byte).then_some(c)
                })
                .unwrap_or(std::ptr::null_mut()),
            NodeKind::Full { children } => children[byte as usize].load_unlogged(),
            NodeKind::Leaf { .. } => std::ptr::null_mut(),
        }
    }

    /// Current occupied-slot count, for deciding whether to grow.
    fn len(&self) -> usize {
        match &self.kind {
            NodeKind::Sparse { children, .. } => children.iter().filter(|c| !c.load_unlogged().is_null()).count(),
            NodeKind::Indirect { children, .. } => children.iter().filter(|c| !c.load_unlogged().is_null()).count(),
            NodeKind::Full { children } => children.iter().filter(|c| !c.load_unlogged().is_null()).count(),
            NodeKind::Leaf { .. } => 0,
        }
    }

    /// Build the next-size-up empty replacement, pre-populated with every
    /// `(byte, child)` this node currently holds.
    fn grown_copy(&self) -> Self {
        let entries: Vec<(u8, *mut Node<V, A>)> = match &self.kind {
            NodeKind::Sparse { bytes, children } => (0..SPARSE_CAP)
                .filter_map(|i| {
                    let c = children[i].load_unlogged();
                    (!c.is_null()).then(|| (bytes[i].load(Ordering::Acquire), c))
                })
                .collect(),
            NodeKind::Indirect { bytes, children } => (0..INDIRECT_CAP)
                .filter_map(|i| {
                    let c = children[i].load_unlogged();
                    (!c.is_null()).then(|| (bytes[i].load(Ordering::Acquire), c))
                })
                .collect(),
            NodeKind::Full { .. } | NodeKind::Leaf { .. } => Vec::new(),
        };
        if entries.len() < INDIRECT_CAP {
            let mut bytes: [AtomicU8; INDIRECT_CAP] = std::array::from_fn(|_| AtomicU8::new(0));
            let children: [Mutable<Node<V, A>>; INDIRECT_CAP] =
                std::array::from_fn(|_| Mutable::new(std::ptr::null_mut()));
            for (i, (b, c)) in entries.into_iter().enumerate() {
                bytes[i] = AtomicU8::new(b);
                children[i].init_store(c);
            }
            Node {
                kind: NodeKind::Indirect { bytes, children },
                lock: Lock::new(),
            }
        } else {
            let children: Box<[Mutable<Node<V, A>>; FULL_CAP]> =
                Box::new(std::array::from_fn(|_| Mutable::new(std::ptr::null_mut())));
            for (b, c) in entries {
                children[b as usize].init_store(c);
            }
            Node {
                kind: NodeKind::Full { children },
                lock: Lock::new(),
            }
        }
    }

    fn capacity(&self) -> usize {
        match &self.kind {
            NodeKind::Sparse { .. } => SPARSE_CAP,
            NodeKind::Indirect { .. } => INDIRECT_CAP,
            NodeKind::Full { .. } => FULL_CAP,
            NodeKind::Leaf { .. } => 0,
        }
    }
}

fn key_bytes(key: u64) -> [u8; KEY_BYTES] {
    key.to_be_bytes()
}

/// A lock-free-lock adaptive radix tree mapping `u64` keys to values.
pub struct LockFreeLockArt<V, A: Allocator + Clone> {
    pool: Arc<EpochPoolImpl<Node<V, A>, A>>,
    #[allow(dead_code)]
    epoch: Arc<Epoch<A>>,
    announcements: Arc<WriteAnnouncements>,
    workers: Arc<WorkerInfo>,
    lock_rt: Arc<LockRuntime<A>>,
    root_lock: Lock<A>,
    root: Arc<Mutable<Node<V, A>>>,
    len: AtomicUsize,
}

unsafe impl<V: Send, A: Allocator + Clone + Send> Send for LockFreeLockArt<V, A> {}
unsafe impl<V: Send + Sync, A: Allocator + Clone + Send + Sync> Sync for LockFreeLockArt<V, A> {}

impl<V, A> LockFreeLockArt<V, A>
where
    V: Clone + Send + Sync + 'static,
    A: Allocator + Clone + Send + Sync + 'static,
{
    /// Build an empty tree.
    pub fn new(epoch: Arc<Epoch<A>>, announcements: Arc<WriteAnnouncements>, workers: Arc<WorkerInfo>) -> Self {
        let pool = Arc::new(EpochPoolImpl::new(epoch.clone(), workers.clone()));
        let lock_rt = Arc::new(LockRuntime::new(epoch.clone(), announcements.clone(), workers.clone()));
        let bootstrap = Log::new();
        let root_node = pool.new_obj(Node::sparse_empty(), &bootstrap);
        LockFreeLockArt {
            pool,
            epoch,
            announcements,
            workers,
            lock_rt,
            root_lock: Lock::new(),
            root: Arc::new(Mutable::new(root_node)),
            len: AtomicUsize::new(0),
        }
    }

    /// Build a standalone tree with its own epoch and write-announcement
    /// state, backed by `allocator`, following the `with_allocator`
    /// constructor convention used throughout this crate's foundation
    /// types.
    pub fn with_allocator(allocator: A, workers: Arc<WorkerInfo>) -> Self {
        let epoch = Arc::new(Epoch::new(
            workers.clone(),
            Arc::new(crate::epoch::MonotonicTimestamp::new()),
            0,
            allocator,
        ));
        let announcements = Arc::new(WriteAnnouncements::new(&workers));
        Self::new(epoch, announcements, workers)
    }

    /// Number of keys currently stored.
    pub fn size(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// Whether the tree currently holds no keys.
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Always `false`: this structure grows without a fixed capacity.
    pub fn is_bounded(&self) -> bool {
        false
    }

    /// Always `true`: this structure is safe for concurrent use.
    pub fn is_concurrent(&self) -> bool {
        true
    }

    /// Whether `key` is present.
    pub fn contain(&self, key: u64) -> bool {
        self.get(key).is_some()
    }

    /// The value stored under `key`, if present.
    pub fn get(&self, key: u64) -> Option<V> {
        let bytes = key_bytes(key);
        let mut cur = self.root.load_unlogged();
        for &b in &bytes {
            cur = match unsafe { &(*cur).kind } {
                NodeKind::Leaf { .. } => return None,
                _ => {
                    let next = unsafe { (*cur).find_unlogged(b) };
                    if next.is_null() {
                        return None;
                    }
                    next
                }
            };
        }
        match unsafe { &(*cur).kind } {
            NodeKind::Leaf { key: k, value } if *k == key => Some(value.clone()),
            _ => None,
        }
    }

    /// The smallest key currently stored, if any (leftmost leaf, i.e.
    /// smallest occupied byte chosen at every level).
    pub fn find_min_key(&self) -> Option<u64> {
        let mut cur = self.root.load_unlogged();
        loop {
            match unsafe { &(*cur).kind } {
                NodeKind::Leaf { key, .. } => return Some(*key),
                NodeKind::Sparse { bytes, children } => {
                    cur = Self::smallest_child(bytes, children, SPARSE_CAP)?;
                }
                NodeKind::Indirect { bytes, children } => {
                    cur = Self::smallest_child(bytes, children, INDIRECT_CAP)?;
                }
                NodeKind::Full { children } => {
                    cur = children.iter().find_map(|c| {
                        let p = c.load_unlogged();
                        (!p.is_null()).then_some(p)
                    })?;
                }
            }
        }
    }

    fn smallest_child(
        bytes: &[AtomicU8],
        children: &[Mutable<Node<V, A>>],
        cap: usize,
    ) -> Option<*mut Node<V, A>> {
        let mut best: Option<(u8, *mut Node<V, A>)> = None;
        for i in 0..cap {
            let c = children[i].load_unlogged();
            if c.is_null() {
                continue;
            }
            let b = bytes[i].load(Ordering::Acquire);
            if best.map_or(true, |(bb, _)| b < bb) {
                best = Some((b, c));
            }
        }
        best.map(|(_, c)| c)
    }

    /// Insert `key`/`value`. Returns `false` without effect if `key` was
    /// already present.
    pub fn add(&self, key: u64, value: V) -> bool {
        let bytes = key_bytes(key);
        loop {
            let (ancestors, depth, leaf_if_full) = self.descend(&bytes);
            if let Some(leaf) = leaf_if_full {
                // depth == KEY_BYTES: an existing leaf occupies this exact key.
                let _ = leaf;
                return false;
            }

            let caller_log = Log::new();
            let (owner_ptr, owner_is_root) = match ancestors.last().copied() {
                Some((node, _)) => (node, false),
                None => (std::ptr::null_mut(), true),
            };
            let byte = bytes[depth];
            let val = value.clone();
            let pool = self.pool.clone();

            // Build the descending chain of single-child Sparse nodes from
            // `depth + 1` down to the leaf at depth `KEY_BYTES`.
            let subtree = {
                let mut node_ptr = pool.new_obj(Node::leaf(key, val), &caller_log);
                for d in (depth + 1..KEY_BYTES).rev() {
                    node_ptr = pool.new_obj(Node::sparse_with_one(bytes[d], node_ptr), &caller_log);
                }
                node_ptr
            };

            let owner_has_room = if owner_is_root {
                unsafe { (*self.root.load_unlogged()).len() < (*self.root.load_unlogged()).capacity() }
            } else {
                unsafe { (*owner_ptr).len() < (*owner_ptr).capacity() }
            };

            let outcome = if owner_has_room {
                let owner_addr = owner_ptr as usize;
                let root = self.root.clone();
                let announcements = self.announcements.clone();
                let workers = self.workers.clone();
                let thunk: Arc<dyn Fn(&Log) -> u64 + Send + Sync> = Arc::new(move |log: &Log| {
                    let worker = workers.current_worker_id().index();
                    let owner: *mut Node<V, A> = if owner_is_root {
                        root.load(log)
                    } else {
                        owner_addr as *mut Node<V, A>
                    };
                    // SAFETY: owner names a live branch node.
                    let (existing, free_idx) = unsafe { (*owner).find_logged(byte, log) };
                    if !existing.is_null() || free_idx.is_none() {
                        return 0;
                    }
                    let idx = free_idx.unwrap();
                    match unsafe { &(*owner).kind } {
                        NodeKind::Sparse { bytes: bs, children } => {
                            bs[idx].store(byte, Ordering::Release);
                            if !children[idx].store(subtree, worker, &announcements, log) {
                                return 0;
                            }
                        }
                        NodeKind::Indirect { bytes: bs, children } => {
                            bs[idx].store(byte, Ordering::Release);
                            if !children[idx].store(subtree, worker, &announcements, log) {
                                return 0;
                            }
                        }
                        NodeKind::Full { children } => {
                            if !children[idx].store(subtree, worker, &announcements, log) {
                                return 0;
                            }
                        }
                        NodeKind::Leaf { .. } => return 0,
                    }
                    1
                });
                if owner_is_root {
                    self.root_lock.try_lock_result(&self.lock_rt, &caller_log, thunk, false)
                } else {
                    // SAFETY: owner_ptr names a live branch node found during descent.
                    let lock = unsafe { &(*owner_ptr).lock };
                    lock.try_lock_result(&self.lock_rt, &caller_log, thunk, false)
                }
            } else {
                // Owner is at capacity: grow it and CAS the grown copy into
                // whatever pointer names `owner` (root_lock at depth 0, else
                // the grandparent's lock).
                let grandparent = if ancestors.len() >= 2 {
                    Some(ancestors[ancestors.len() - 2])
                } else {
                    None
                };
                let owner_addr = owner_ptr as usize;
                let root = self.root.clone();
                let announcements = self.announcements.clone();
                let pool2 = self.pool.clone();
                let workers = self.workers.clone();
                let thunk: Arc<dyn Fn(&Log) -> u64 + Send + Sync> = Arc::new(move |log: &Log| {
                    let worker = workers.current_worker_id().index();
                    let owner_slot: &Mutable<Node<V, A>> = match grandparent {
                        None => &root,
                        Some((gp, gbyte)) => {
                            let gp = gp as *mut Node<V, A>;
                            // SAFETY: gp names a live branch node.
                            match unsafe { &(*gp).kind } {
                                NodeKind::Sparse { bytes: bs, children } => (0..SPARSE_CAP)
                                    .find(|&i| {
                                        !children[i].load(log).is_null() && bs[i].load(Ordering::Acquire) == gbyte
                                    })
                                    .map(|i| &children[i])
                                    .unwrap_or(&root),
                                NodeKind::Indirect { bytes: bs, children } => (0..INDIRECT_CAP)
                                    .find(|&i| {
                                        !children[i].load(log).is_null() && bs[i].load(Ordering::Acquire) == gbyte
                                    })
                                    .map(|i| &children[i])
                                    .unwrap_or(&root),
                                NodeKind::Full { children } => &children[gbyte as usize],
                                NodeKind::Leaf { .. } => &root,
                            }
                        }
                    };
                    let owner = owner_addr as *mut Node<V, A>;
                    if owner_slot.load(log) != owner {
                        return 0;
                    }
                    // SAFETY: owner names a live branch node at capacity.
                    let mut grown = unsafe { (*owner).grown_copy() };
                    let (existing, free_idx) = match &mut grown.kind {
                        NodeKind::Indirect { bytes: bs, children } => {
                            let free = (0..INDIRECT_CAP).find(|&i| children[i].load_unlogged().is_null());
                            let existing = (0..INDIRECT_CAP).any(|i| {
                                !children[i].load_unlogged().is_null() && bs[i].load(Ordering::Acquire) == byte
                            });
                            (existing, free)
                        }
                        NodeKind::Full { .. } => (false, Some(byte as usize)),
                        _ => (false, None),
                    };
                    if existing || free_idx.is_none() {
                        return 0;
                    }
                    let idx = free_idx.unwrap();
                    match &grown.kind {
                        NodeKind::Indirect { bytes: bs, children } => {
                            bs[idx].store(byte, Ordering::Release);
                            children[idx].init_store(subtree);
                        }
                        NodeKind::Full { children } => children[idx].init_store(subtree),
                        _ => return 0,
                    }
                    let grown_ptr = pool2.new_obj(grown, log);
                    if owner_slot.store(grown_ptr, worker, &announcements, log) {
                        1
                    } else {
                        0
                    }
                });
                match grandparent {
                    None => self.root_lock.try_lock_result(&self.lock_rt, &caller_log, thunk, false),
                    Some((gp, _)) => {
                        // SAFETY: gp names a live branch node.
                        let lock = unsafe { &(*gp).lock };
                        lock.try_lock_result(&self.lock_rt, &caller_log, thunk, false)
                    }
                }
            };

            match outcome {
                Some(1) => {
                    self.len.fetch_add(1, Ordering::AcqRel);
                    return true;
                }
                _ => continue,
            }
        }
    }

    /// Remove `key`, returning its value if present. Only ever nulls out the
    /// owning branch node's child slot and retires the leaf — the branch
    /// chain above it is left in place (no structural shrink).
    pub fn remove(&self, key: u64) -> Option<V> {
        let bytes = key_bytes(key);
        loop {
            let (ancestors, _depth, leaf_if_full) = self.descend(&bytes);
            let leaf_ptr = leaf_if_full?;
            // Every leaf sits at depth KEY_BYTES, so it always has a branch
            // node immediately above it.
            let (parent_ptr, byte) = *ancestors
                .last()
                .expect("a leaf always has a branch-node parent");

            // SAFETY: leaf_ptr was just found during descent.
            let value = match unsafe { &(*leaf_ptr).kind } {
                NodeKind::Leaf { key: k, value } if *k == key => value.clone(),
                _ => return None,
            };

            let caller_log = Log::new();
            let parent_addr = parent_ptr as usize;
            let leaf_addr = leaf_ptr as usize;
            let announcements = self.announcements.clone();
            let workers = self.workers.clone();
            let pool = self.pool.clone();
            let thunk: Arc<dyn Fn(&Log) -> u64 + Send + Sync> = Arc::new(move |log: &Log| {
                let worker = workers.current_worker_id().index();
                let parent = parent_addr as *mut Node<V, A>;
                let leaf = leaf_addr as *mut Node<V, A>;
                // SAFETY: parent names a live branch node found during descent.
                let cleared = match unsafe { &(*parent).kind } {
                    NodeKind::Sparse { bytes: bs, children } => (0..SPARSE_CAP)
                        .find(|&i| children[i].load(log) == leaf && bs[i].load(Ordering::Acquire) == byte)
                        .map(|i| children[i].store(std::ptr::null_mut(), worker, &announcements, log)),
                    NodeKind::Indirect { bytes: bs, children } => (0..INDIRECT_CAP)
                        .find(|&i| children[i].load(log) == leaf && bs[i].load(Ordering::Acquire) == byte)
                        .map(|i| children[i].store(std::ptr::null_mut(), worker, &announcements, log)),
                    NodeKind::Full { children } => {
                        if children[byte as usize].load(log) == leaf {
                            Some(children[byte as usize].store(std::ptr::null_mut(), worker, &announcements, log))
                        } else {
                            None
                        }
                    }
                    NodeKind::Leaf { .. } => None,
                };
                match cleared {
                    Some(true) => {
                        pool.retire(leaf, log);
                        1
                    }
                    _ => 0,
                }
            });
            // SAFETY: parent_ptr names a live branch node found during descent.
            let lock = unsafe { &(*parent_ptr).lock };
            match lock.try_lock_result(&self.lock_rt, &caller_log, thunk, false) {
                Some(1) => {
                    self.len.fetch_sub(1, Ordering::AcqRel);
                    return Some(value);
                }
                _ => continue,
            }
        }
    }

    /// Walk as far as possible following `bytes`. Returns the ancestor path
    /// (branch node, byte taken), the depth reached, and `Some(leaf)` only
    /// when every byte was consumed (an existing key occupies this slot).
    #[allow(clippy::type_complexity)]
    fn descend(&self, bytes: &[u8; KEY_BYTES]) -> (Vec<(*mut Node<V, A>, u8)>, usize, Option<*mut Node<V, A>>) {
        let mut ancestors = Vec::new();
        let mut cur = self.root.load_unlogged();
        for depth in 0..KEY_BYTES {
            let b = bytes[depth];
            // SAFETY: cur always names a live pool node.
            let next = unsafe { (*cur).find_unlogged(b) };
            if next.is_null() {
                return (ancestors, depth, None);
            }
            ancestors.push((cur, b));
            cur = next;
        }
        (ancestors, KEY_BYTES, Some(cur))
    }

    /// Drop every stored key, freeing storage immediately (not epoch-safe —
    /// intended for whole-structure teardown).
    pub fn clear(&self) {
        let bootstrap = Log::new();
        let fresh = self.pool.new_obj(Node::sparse_empty(), &bootstrap);
        self.root.init_store(fresh);
        self.len.store(0, Ordering::Release);
        self.pool.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epoch::MonotonicTimestamp;
    use crate::malloc::GlobalAllocator;

    fn harness(w: usize) -> LockFreeLockArt<&'static str, GlobalAllocator> {
        let workers = Arc::new(WorkerInfo::new(
            (0..w).map(|_| std::thread::current().id()).collect(),
        ));
        let epoch = Arc::new(Epoch::new(
            workers.clone(),
            Arc::new(MonotonicTimestamp::new()),
            0,
            GlobalAllocator,
        ));
        let announcements = Arc::new(WriteAnnouncements::new(&workers));
        LockFreeLockArt::new(epoch, announcements, workers)
    }

    #[test]
    fn fresh_tree_is_empty() {
        let t = harness(1);
        assert!(t.is_empty());
        assert_eq!(t.find_min_key(), None);
    }

    #[test]
    fn add_then_get_and_contain() {
        let t = harness(1);
        assert!(t.add(42, "forty-two"));
        assert!(t.contain(42));
        assert_eq!(t.get(42), Some("forty-two"));
        assert_eq!(t.size(), 1);
    }

    #[test]
    fn add_duplicate_key_is_rejected() {
        let t = harness(1);
        assert!(t.add(42, "a"));
        assert!(!t.add(42, "b"));
        assert_eq!(t.size(), 1);
    }

    #[test]
    fn many_keys_grow_nodes_through_every_tier() {
        let t = harness(1);
        // All of these share byte 0 (0x00) at depth 0, forcing the root node
        // through Sparse -> Indirect as distinct second-bytes accumulate.
        for i in 0..20u64 {
            assert!(t.add(i << 8, "v"));
        }
        assert_eq!(t.size(), 20);
        for i in 0..20u64 {
            assert!(t.contain(i << 8), "key {i} should be present");
        }
    }

    #[test]
    fn find_min_key_tracks_smallest() {
        let t = harness(1);
        for k in [500, 10, 9000, 300] {
            t.add(k, "v");
        }
        assert_eq!(t.find_min_key(), Some(10));
    }

    #[test]
    fn concurrent_adds_all_land() {
        use std::thread;

        let t = Arc::new(harness(4));
        let threads: Vec<_> = (0..4)
            .map(|base| {
                let t = t.clone();
                thread::spawn(move || {
                    for i in 0..50u64 {
                        t.add(base * 1000 + i, "v");
                    }
                })
            })
            .collect();
        for th in threads {
            th.join().unwrap();
        }
        assert_eq!(t.size(), 200);
    }

    #[test]
    fn remove_then_absent() {
        let t = harness(1);
        t.add(42, "forty-two");
        assert_eq!(t.remove(42), Some("forty-two"));
        assert!(!t.contain(42));
        assert_eq!(t.size(), 0);
        assert_eq!(t.remove(42), None);
    }

    #[test]
    fn remove_leaves_siblings_intact() {
        let t = harness(1);
        for i in 0..20u64 {
            t.add(i << 8, "v");
        }
        assert_eq!(t.remove(5 << 8), Some("v"));
        assert_eq!(t.size(), 19);
        for i in 0..20u64 {
            if i == 5 {
                assert!(!t.contain(i << 8));
            } else {
                assert!(t.contain(i << 8), "key {i} should survive the removal");
            }
        }
    }

    #[test]
    fn with_allocator_builds_standalone_tree() {
        let workers = Arc::new(WorkerInfo::new(vec![std::thread::current().id()]));
        let t: LockFreeLockArt<&'static str, GlobalAllocator> =
            LockFreeLockArt::with_allocator(GlobalAllocator, workers);
        assert!(t.add(1, "one"));
        assert_eq!(t.get(1), Some("one"));
    }
}
