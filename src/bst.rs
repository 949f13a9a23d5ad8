//! A binary search tree built from [`crate::lock::Lock`]s.
//!
//! Every internal node owns a [`Lock`] guarding *its own* child pointers;
//! searches never take a lock at all — they chase [`Mutable`] pointers
//! straight down. A modification first finds its target without locking,
//! then takes the lock(s) that guard the pointer it needs to swing, and
//! re-verifies nothing moved since the unlocked search before committing.
//! Structural changes always lock in root-to-leaf order (a grandparent
//! before the parent nested inside it), so no two operations can deadlock
//! against each other.
//!
//! Internal nodes carry a routing key copied from the leaf that was there
//! when they were created; the real keys and values live only in leaves.
//! The tree's root position is itself treated as a virtual parent, guarded
//! by a dedicated [`Lock`] (`root_lock`) rather than a real node, and
//! starts out pointing at a `Dummy` leaf standing in for the empty set.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::announce::WriteAnnouncements;
use crate::epoch::Epoch;
use crate::lock::{Lock, LockRuntime};
use crate::log::Log;
use crate::malloc::Allocator;
use crate::mutable::Mutable;
use crate::pool::EpochPoolImpl;
use crate::worker::WorkerInfo;

#[derive(Clone, Copy, Debug)]
enum Side {
    Left,
    Right,
}

enum NodeKind<K, V, A: Allocator> {
    Internal {
        key: K,
        left: Mutable<Node<K, V, A>>,
        right: Mutable<Node<K, V, A>>,
    },
    Leaf {
        key: K,
        value: V,
    },
    /// The `+∞` sentinel: stands in for "no element here".
    Dummy,
}

struct Node<K, V, A: Allocator> {
    kind: NodeKind<K, V, A>,
    lock: Lock<A>,
}

impl<K, V, A: Allocator> Node<K, V, A> {
    fn leaf(key: K, value: V) -> Self {
        Node {
            kind: NodeKind::Leaf { key, value },
            lock: Lock::new(),
        }
    }

    fn dummy() -> Self {
        Node {
            kind: NodeKind::Dummy,
            lock: Lock::new(),
        }
    }

    fn internal(key: K, left: *mut Node<K, V, A>, right: *mut Node<K, V, A>) -> Self {
        Node {
            kind: NodeKind::Internal {
                key,
                left: Mutable::new(left),
                right: Mutable::new(right),
            },
            lock: Lock::new(),
        }
    }
}

/// A lock-free-lock binary search tree mapping keys to values.
pub struct LockFreeLockBst<K, V, A: Allocator + Clone> {
    pool: Arc<EpochPoolImpl<Node<K, V, A>, A>>,
    #[allow(dead_code)]
    epoch: Arc<Epoch<A>>,
    announcements: Arc<WriteAnnouncements>,
    workers: Arc<WorkerInfo>,
    lock_rt: Arc<LockRuntime<A>>,
    root_lock: Lock<A>,
    root: Arc<Mutable<Node<K, V, A>>>,
    len: AtomicUsize,
}

unsafe impl<K: Send, V: Send, A: Allocator + Clone + Send> Send for LockFreeLockBst<K, V, A> {}
unsafe impl<K: Send + Sync, V: Send + Sync, A: Allocator + Clone + Send + Sync> Sync
    for LockFreeLockBst<K, V, A>
{
}

impl<K, V, A> LockFreeLockBst<K, V, A>
where
    K: Ord + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    A: Allocator + Clone + Send + Sync + 'static,
{
    /// Build an empty tree sharing `epoch`/`announcements`/`workers` with
    /// the rest of a structure's runtime.
    pub fn new(epoch: Arc<Epoch<A>>, announcements: Arc<WriteAnnouncements>, workers: Arc<WorkerInfo>) -> Self {
        let pool = Arc::new(EpochPoolImpl::new(epoch.clone(), workers.clone()));
        let lock_rt = Arc::new(LockRuntime::new(epoch.clone(), announcements.clone(), workers.clone()));
        let bootstrap = Log::new();
        let dummy = pool.new_obj(Node::dummy(), &bootstrap);
        LockFreeLockBst {
            pool,
            epoch,
            announcements,
            workers,
            lock_rt,
            root_lock: Lock::new(),
            root: Arc::new(Mutable::new(dummy)),
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

    /// Walk from the root to the leaf that would hold `key`, recording the
    /// `(node, side-taken)` pair at every internal node visited.
    fn find_unlogged(&self, key: &K) -> (Vec<(*mut Node<K, V, A>, Side)>, *mut Node<K, V, A>) {
        let mut ancestors = Vec::new();
        let mut cur = self.root.load_unlogged();
        loop {
            // SAFETY: `cur` always names a live pool node: it started at the
            // root and every step below follows a child pointer that, by the
            // structure's own invariant, always points at a live node.
            match unsafe { &(*cur).kind } {
                NodeKind::Internal { key: rkey, left, right } => {
                    if key < rkey {
                        ancestors.push((cur, Side::Left));
                        cur = left.load_unlogged();
                    } else {
                        ancestors.push((cur, Side::Right));
                        cur = right.load_unlogged();
                    }
                }
                NodeKind::Leaf { .. } | NodeKind::Dummy => return (ancestors, cur),
            }
        }
    }

    /// Whether `key` is present.
    pub fn contain(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// The value stored under `key`, if present.
    pub fn get(&self, key: &K) -> Option<V> {
        let (_ancestors, leaf) = self.find_unlogged(key);
        // SAFETY: leaf names a live pool node.
        match unsafe { &(*leaf).kind } {
            NodeKind::Leaf { key: k, value } if k == key => Some(value.clone()),
            _ => None,
        }
    }

    /// The smallest key currently stored, if any.
    pub fn find_min_key(&self) -> Option<K> {
        let mut cur = self.root.load_unlogged();
        loop {
            // SAFETY: see `find_unlogged`.
            match unsafe { &(*cur).kind } {
                NodeKind::Internal { left, .. } => cur = left.load_unlogged(),
                NodeKind::Leaf { key, .. } => return Some(key.clone()),
                NodeKind::Dummy => return None,
            }
        }
    }

    /// Insert `key`/`value`. Returns `false` without effect if `key` was
    /// already present.
    pub fn add(&self, key: K, value: V) -> bool {
        loop {
            let (ancestors, leaf_ptr) = self.find_unlogged(&key);
            let existing = match unsafe { &(*leaf_ptr).kind } {
                NodeKind::Leaf { key: k, .. } => Some(k.clone()),
                NodeKind::Dummy => None,
            };
            if existing.as_ref() == Some(&key) {
                return false;
            }

            let caller_log = Log::new();
            let leaf_addr = leaf_ptr as usize;
            let key2 = key.clone();
            let val2 = value.clone();
            let pool = self.pool.clone();
            let announcements = self.announcements.clone();
            let workers = self.workers.clone();
            let root = self.root.clone();

            let outcome = match ancestors.last().copied() {
                None => {
                    let thunk: Arc<dyn Fn(&Log) -> u64 + Send + Sync> = Arc::new(move |log: &Log| {
                        let leaf = leaf_addr as *mut Node<K, V, A>;
                        if root.load(log) != leaf {
                            return 0;
                        }
                        let existing = match unsafe { &(*leaf).kind } {
                            NodeKind::Leaf { key: k, .. } => Some(k.clone()),
                            NodeKind::Dummy => None,
                        };
                        let new_leaf = pool.new_obj(Node::leaf(key2.clone(), val2.clone()), log);
                        let subtree = match &existing {
                            Some(ek) if &key2 > ek => pool.new_obj(Node::internal(ek.clone(), leaf, new_leaf), log),
                            _ => pool.new_obj(Node::internal(key2.clone(), new_leaf, leaf), log),
                        };
                        let worker = workers.current_worker_id().index();
                        if root.store(subtree, worker, &announcements, log) {
                            1
                        } else {
                            0
                        }
                    });
                    self.root_lock.try_lock_result(&self.lock_rt, &caller_log, thunk, false)
                }
                Some((parent_ptr, side_pl)) => {
                    let parent_addr = parent_ptr as usize;
                    let thunk: Arc<dyn Fn(&Log) -> u64 + Send + Sync> = Arc::new(move |log: &Log| {
                        let parent = parent_addr as *mut Node<K, V, A>;
                        let leaf = leaf_addr as *mut Node<K, V, A>;
                        // SAFETY: parent was found as an Internal node during
                        // this attempt's descent.
                        let child_cell = match unsafe { &(*parent).kind } {
                            NodeKind::Internal { left, right, .. } => match side_pl {
                                Side::Left => left,
                                Side::Right => right,
                            },
                            _ => return 0,
                        };
                        if child_cell.load(log) != leaf {
                            return 0;
                        }
                        let existing = match unsafe { &(*leaf).kind } {
                            NodeKind::Leaf { key: k, .. } => Some(k.clone()),
                            NodeKind::Dummy => None,
                        };
                        if existing.as_ref() == Some(&key2) {
                            return 0;
                        }
                        let new_leaf = pool.new_obj(Node::leaf(key2.clone(), val2.clone()), log);
                        let subtree = match &existing {
                            Some(ek) if &key2 > ek => pool.new_obj(Node::internal(ek.clone(), leaf, new_leaf), log),
                            _ => pool.new_obj(Node::internal(key2.clone(), new_leaf, leaf), log),
                        };
                        let worker = workers.current_worker_id().index();
                        if child_cell.store(subtree, worker, &announcements, log) {
                            1
                        } else {
                            0
                        }
                    });
                    // SAFETY: parent_ptr names a live Internal node.
                    let p_lock = unsafe { &(*parent_ptr).lock };
                    p_lock.try_lock_result(&self.lock_rt, &caller_log, thunk, false)
                }
            };

            match outcome {
                Some(1) => {
                    self.len.fetch_add(1, Ordering::AcqRel);
                    return true;
                }
                Some(_) => continue,
                None => continue,
            }
        }
    }

    /// Remove `key`, returning its value if it was present.
    pub fn remove(&self, key: &K) -> Option<V> {
        loop {
            let (ancestors, leaf_ptr) = self.find_unlogged(key);
            let found = match unsafe { &(*leaf_ptr).kind } {
                NodeKind::Leaf { key: k, value } if k == key => Some(value.clone()),
                _ => None,
            };
            let leaf_value = found?;

            let caller_log = Log::new();
            let leaf_addr = leaf_ptr as usize;
            let pool = self.pool.clone();
            let announcements = self.announcements.clone();
            let workers = self.workers.clone();
            let root = self.root.clone();
            let lock_rt = self.lock_rt.clone();

            let outcome = match ancestors.len() {
                0 => {
                    // Sole element lives directly under the root.
                    let thunk: Arc<dyn Fn(&Log) -> u64 + Send + Sync> = Arc::new(move |log: &Log| {
                        let leaf = leaf_addr as *mut Node<K, V, A>;
                        if root.load(log) != leaf {
                            return 0;
                        }
                        let dummy = pool.new_obj(Node::dummy(), log);
                        let worker = workers.current_worker_id().index();
                        if root.store(dummy, worker, &announcements, log) {
                            1
                        } else {
                            0
                        }
                    });
                    self.root_lock.try_lock_result(&self.lock_rt, &caller_log, thunk, false)
                }
                1 => {
                    // The leaf's parent sits directly under the (virtual)
                    // root, so the root slot itself plays grandparent.
                    let (parent_ptr, side_pl) = ancestors[0];
                    let parent_addr = parent_ptr as usize;
                    let thunk: Arc<dyn Fn(&Log) -> u64 + Send + Sync> = Arc::new(move |log: &Log| {
                        let parent = parent_addr as *mut Node<K, V, A>;
                        let leaf = leaf_addr as *mut Node<K, V, A>;
                        if root.load(log) != parent {
                            return 0;
                        }
                        // SAFETY: parent is a live Internal node.
                        let sibling = match unsafe { &(*parent).kind } {
                            NodeKind::Internal { left, right, .. } => match side_pl {
                                Side::Left => {
                                    if left.load(log) != leaf {
                                        return 0;
                                    }
                                    right.load(log)
                                }
                                Side::Right => {
                                    if right.load(log) != leaf {
                                        return 0;
                                    }
                                    left.load(log)
                                }
                            },
                            _ => return 0,
                        };
                        let worker = workers.current_worker_id().index();
                        if root.store(sibling, worker, &announcements, log) {
                            1
                        } else {
                            0
                        }
                    });
                    self.root_lock.try_lock_result(&self.lock_rt, &caller_log, thunk, false)
                }
                _ => {
                    let (parent_ptr, side_pl) = ancestors[ancestors.len() - 1];
                    let (grandparent_ptr, side_pg) = ancestors[ancestors.len() - 2];
                    let parent_addr = parent_ptr as usize;
                    let grandparent_addr = grandparent_ptr as usize;

                    let thunk: Arc<dyn Fn(&Log) -> u64 + Send + Sync> = Arc::new(move |log: &Log| {
                        let parent = parent_addr as *mut Node<K, V, A>;
                        // SAFETY: parent is a live Internal node.
                        let p_lock = unsafe { &(*parent).lock };
                        let pool = pool.clone();
                        let announcements = announcements.clone();
                        let workers = workers.clone();
                        let inner_thunk: Arc<dyn Fn(&Log) -> u64 + Send + Sync> = Arc::new(move |inner_log: &Log| {
                            let parent = parent_addr as *mut Node<K, V, A>;
                            let leaf = leaf_addr as *mut Node<K, V, A>;
                            let grandparent = grandparent_addr as *mut Node<K, V, A>;
                            // SAFETY: both are live Internal nodes.
                            let sibling = match unsafe { &(*parent).kind } {
                                NodeKind::Internal { left, right, .. } => match side_pl {
                                    Side::Left => {
                                        if left.load(inner_log) != leaf {
                                            return 0;
                                        }
                                        right.load(inner_log)
                                    }
                                    Side::Right => {
                                        if right.load(inner_log) != leaf {
                                            return 0;
                                        }
                                        left.load(inner_log)
                                    }
                                },
                                _ => return 0,
                            };
                            let child_cell = match unsafe { &(*grandparent).kind } {
                                NodeKind::Internal { left, right, .. } => match side_pg {
                                    Side::Left => left,
                                    Side::Right => right,
                                },
                                _ => return 0,
                            };
                            if child_cell.load(inner_log) != parent {
                                return 0;
                            }
                            let worker = workers.current_worker_id().index();
                            if child_cell.store(sibling, worker, &announcements, inner_log) {
                                1
                            } else {
                                0
                            }
                        });
                        p_lock.try_lock_result(&lock_rt, log, inner_thunk, false).unwrap_or(0)
                    });
                    // SAFETY: grandparent_ptr names a live Internal node.
                    let g_lock = unsafe { &(*grandparent_ptr).lock };
                    g_lock.try_lock_result(&self.lock_rt, &caller_log, thunk, false)
                }
            };

            match outcome {
                Some(1) => {
                    self.pool.retire(leaf_ptr, &caller_log);
                    if let Some((parent_ptr, _)) = ancestors.last() {
                        self.pool.retire(*parent_ptr, &caller_log);
                    }
                    self.len.fetch_sub(1, Ordering::AcqRel);
                    return Some(leaf_value);
                }
                _ => continue,
            }
        }
    }

    /// Remove every key, freeing storage immediately (not epoch-safe —
    /// intended for whole-structure teardown).
    pub fn clear(&self) {
        let bootstrap = Log::new();
        let dummy = self.pool.new_obj(Node::dummy(), &bootstrap);
        self.root.init_store(dummy);
        self.len.store(0, Ordering::Release);
        self.pool.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epoch::MonotonicTimestamp;
    use crate::malloc::GlobalAllocator;

    fn harness(w: usize) -> LockFreeLockBst<i32, &'static str, GlobalAllocator> {
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
        LockFreeLockBst::new(epoch, announcements, workers)
    }

    #[test]
    fn fresh_tree_is_empty() {
        let t = harness(1);
        assert!(t.is_empty());
        assert_eq!(t.find_min_key(), None);
        assert!(!t.contain(&1));
    }

    #[test]
    fn add_then_contain_and_get() {
        let t = harness(1);
        assert!(t.add(5, "five"));
        assert!(t.contain(&5));
        assert_eq!(t.get(&5), Some("five"));
        assert_eq!(t.size(), 1);
    }

    #[test]
    fn add_duplicate_key_is_rejected() {
        let t = harness(1);
        assert!(t.add(5, "five"));
        assert!(!t.add(5, "also five"));
        assert_eq!(t.size(), 1);
    }

    #[test]
    fn find_min_key_tracks_smallest() {
        let t = harness(1);
        for k in [5, 1, 9, 3, 7] {
            t.add(k, "v");
        }
        assert_eq!(t.find_min_key(), Some(1));
    }

    #[test]
    fn remove_sole_element_empties_tree() {
        let t = harness(1);
        t.add(1, "one");
        assert_eq!(t.remove(&1), Some("one"));
        assert!(t.is_empty());
        assert!(!t.contain(&1));
    }

    #[test]
    fn remove_nested_element_preserves_siblings() {
        let t = harness(1);
        for k in [5, 2, 8, 1, 3, 7, 9] {
            t.add(k, "v");
        }
        assert_eq!(t.remove(&3), Some("v"));
        assert!(!t.contain(&3));
        for k in [5, 2, 8, 1, 7, 9] {
            assert!(t.contain(&k), "key {k} should survive removing 3");
        }
        assert_eq!(t.size(), 6);
    }

    #[test]
    fn remove_absent_key_is_none() {
        let t = harness(1);
        t.add(1, "one");
        assert_eq!(t.remove(&2), None);
    }

    #[test]
    fn concurrent_adds_all_land() {
        use std::thread;

        let t = Arc::new(harness(4));
        let threads: Vec<_> = (0..4)
            .map(|base| {
                let t = t.clone();
                thread::spawn(move || {
                    for i in 0..50 {
                        t.add(base * 1000 + i, "v");
                    }
                })
            })
            .collect();
        for th in threads {
            th.join().unwrap();
        }
        assert_eq!(t.size(), 200);
        for base in 0..4 {
            for i in 0..50 {
                assert!(t.contain(&(base * 1000 + i)));
            }
        }
    }

    #[test]
    fn with_allocator_builds_standalone_tree() {
        let workers = Arc::new(WorkerInfo::new(vec![std::thread::current().id()]));
        let t: LockFreeLockBst<i32, &'static str, GlobalAllocator> =
            LockFreeLockBst::with_allocator(GlobalAllocator, workers);
        assert!(t.add(1, "one"));
        assert_eq!(t.get(&1), Some("one"));
    }
}
