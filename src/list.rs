//! The multi-dimensional list.
//!
//! [`MdList`] stores nodes in lexicographic coordinate order inside a
//! `D`-way linked structure rooted at a sentinel zero node. Child slot
//! `d` of a node heads the sub-list of nodes agreeing with it on the
//! first `d` coordinates and strictly exceeding it at coordinate `d`, so
//! a walk from the root is monotone in the keys.
//!
//! # Write Protocol
//!
//! ```text
//! 1. guard = list.collector.enter()        // enter protected region
//! 2. (P, C) = locate(coord)                // lock-free traversal
//! 3. try_lock P, then C (then R in remove) // fixed order, no blocking
//!    - any failure: release all, back off, restart from 2
//! 4. revalidate: locate(coord) == (P, C)?  // otherwise restart
//! 5. pointer surgery                       // single-word Release stores
//! 6. drop lock guards, drop seize guard
//! ```
//!
//! Locks are always taken in ascending coordinate order (P ≺ C ≺ R),
//! and every acquisition is a `try_lock` followed by full release on
//! failure, so the protocol cannot deadlock. Removed nodes are retired
//! through the collector and freed once no guard can still reach them.

use std::cmp::Ordering;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

use seize::{Collector, Guard, LocalGuard};

use crate::coord::{key_to_coord, radix_for};
use crate::node::Node;
use crate::nodelock::LockGuard;
use crate::tracing_helpers::{debug_log, trace_log, warn_log};

/// Retry attempts after which the backoff starts yielding the thread.
const SPIN_ATTEMPTS: u32 = 6;

/// Reclaim a boxed node (seize callback).
///
/// # Safety
///
/// `ptr` must come from `Box::into_raw` and be unreachable from the
/// list by any new traversal. Seize guarantees no reader still holds it.
unsafe fn reclaim_node<T>(ptr: *mut Node<T>, _collector: &Collector) {
    // SAFETY: caller guarantees ptr is valid and unlinked.
    unsafe { drop(Box::from_raw(ptr)) };
}

/// Back off after a failed lock acquisition or revalidation.
fn backoff(attempt: u32) {
    if attempt <= SPIN_ATTEMPTS {
        for _ in 0..(1_u32 << attempt.min(SPIN_ATTEMPTS)) {
            std::hint::spin_loop();
        }
    } else {
        std::thread::yield_now();
    }
}

/// A concurrent ordered map over the key space `[0, key_space)`.
///
/// Keys are unsigned integers; values are stored as `Arc<T>` so reads
/// hand out cheap clones. All operations take `&self` and are safe to
/// call from many threads.
///
/// # Example
///
/// ```rust
/// use mdlist::MdList;
///
/// let list: MdList<&str> = MdList::new(3, 64);
/// list.insert(18, "first");
/// list.insert(18, "second");
/// assert_eq!(list.find(18).as_deref(), Some(&"second"));
/// assert!(list.find(90).is_none()); // out of key space
/// ```
pub struct MdList<T> {
    dim: usize,
    key_space: u64,
    radix: u64,

    /// Sentinel node for key 0. Never unlinked; removing key 0 clears
    /// its value slot only.
    root: *mut Node<T>,

    /// Number of keys currently holding a value.
    len: AtomicUsize,

    collector: Collector,
}

// SAFETY: the raw node pointers are owned by the list and every access
// to their mutable state goes through atomics, the per-node locks, or a
// seize guard. Values move across threads as Arc<T>, which needs
// T: Send + Sync.
unsafe impl<T: Send + Sync> Send for MdList<T> {}
unsafe impl<T: Send + Sync> Sync for MdList<T> {}

impl<T> MdList<T> {
    /// Create an empty list for keys in `[0, key_space)` using `dim`
    /// coordinate digits.
    ///
    /// The radix is derived as the smallest `M` with `M^dim >= key_space`.
    ///
    /// # Panics
    ///
    /// Panics if `dim == 0` or `key_space == 0`.
    #[must_use]
    pub fn new(dim: u32, key_space: u64) -> Self {
        assert!(dim >= 1, "dimension must be at least 1");
        assert!(key_space >= 1, "key space must be non-empty");

        let radix: u64 = radix_for(dim, key_space);
        let dim: usize = dim as usize;
        let root: *mut Node<T> =
            Box::into_raw(Box::new(Node::new(0, key_to_coord(0, dim, radix), None)));

        Self {
            dim,
            key_space,
            radix,
            root,
            len: AtomicUsize::new(0),
            collector: Collector::new(),
        }
    }

    /// The number of coordinate digits per key.
    #[inline]
    #[must_use]
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// The exclusive upper bound of the key space.
    #[inline]
    #[must_use]
    pub fn key_space(&self) -> u64 {
        self.key_space
    }

    /// The per-dimension radix.
    #[inline]
    #[must_use]
    pub fn radix(&self) -> u64 {
        self.radix
    }

    /// The number of keys currently present.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.len.load(AtomicOrdering::Relaxed)
    }

    /// Check whether no key is present.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enter a protected region and return a guard.
    ///
    /// Pass the guard to the `_with_guard` operations to amortise its
    /// cost over a batch.
    #[inline]
    #[must_use]
    pub fn guard(&self) -> LocalGuard<'_> {
        self.collector.enter()
    }

    /// Insert `value` under `key`, overwriting any previous value.
    ///
    /// Keys outside `[0, key_space)` are silently ignored.
    pub fn insert(&self, key: u64, value: T) {
        let guard = self.guard();
        self.insert_with_guard(key, value, &guard);
    }

    /// [`insert`](Self::insert) using a caller-provided guard.
    pub fn insert_with_guard(&self, key: u64, value: T, guard: &LocalGuard<'_>) {
        if key >= self.key_space {
            return;
        }
        self.insert_inner(key, &Arc::new(value), guard);
    }

    /// Look up `key`, returning its value if present.
    #[must_use]
    pub fn find(&self, key: u64) -> Option<Arc<T>> {
        let guard = self.guard();
        self.find_with_guard(key, &guard)
    }

    /// [`find`](Self::find) using a caller-provided guard.
    #[must_use]
    pub fn find_with_guard(&self, key: u64, guard: &LocalGuard<'_>) -> Option<Arc<T>> {
        if key >= self.key_space {
            return None;
        }
        let target = key_to_coord(key, self.dim, self.radix);
        let (_, curr_ptr) = self.locate(&target, guard);
        if curr_ptr.is_null() {
            return None;
        }
        // SAFETY: locate only returns pointers published by Release
        // stores, and `guard` keeps them from being reclaimed.
        let curr: &Node<T> = unsafe { &*curr_ptr };
        if curr.key() == key {
            curr.get_value()
        } else {
            None
        }
    }

    /// Remove `key`, returning its value if it was present.
    #[must_use = "check the returned value to learn whether the key was present"]
    pub fn remove(&self, key: u64) -> Option<Arc<T>> {
        let guard = self.guard();
        self.remove_with_guard(key, &guard)
    }

    /// [`remove`](Self::remove) using a caller-provided guard.
    pub fn remove_with_guard(&self, key: u64, guard: &LocalGuard<'_>) -> Option<Arc<T>> {
        if key >= self.key_space {
            return None;
        }
        self.remove_inner(key, guard)
    }

    // ========================================================================
    //  Traversal
    // ========================================================================

    /// Walk from the root towards `target`, returning the last node
    /// descended from and the node the walk stopped at.
    ///
    /// On an exact match the second pointer is the target's node. On a
    /// miss the target belongs strictly between the two, or in an empty
    /// slot of the predecessor when the second pointer is null.
    ///
    /// Takes no locks; the guard keeps every visited node alive.
    fn locate(&self, target: &[u64], _guard: &LocalGuard<'_>) -> (*mut Node<T>, *mut Node<T>) {
        let mut pred: *mut Node<T> = ptr::null_mut();
        let mut curr: *mut Node<T> = self.root;
        let mut d: usize = 0;

        while !curr.is_null() && d < self.dim {
            // SAFETY: curr came from a Release-published slot (or is the
            // root) and _guard prevents its reclamation.
            let node: &Node<T> = unsafe { &*curr };
            match target[d].cmp(&node.coord()[d]) {
                Ordering::Greater => {
                    pred = curr;
                    curr = node.child(d);
                }
                Ordering::Less => break,
                Ordering::Equal => d += 1,
            }
        }
        (pred, curr)
    }

    // ========================================================================
    //  Insert
    // ========================================================================

    fn insert_inner(&self, key: u64, value: &Arc<T>, guard: &LocalGuard<'_>) {
        let target = key_to_coord(key, self.dim, self.radix);
        let mut attempt: u32 = 0;

        loop {
            let (pred_ptr, curr_ptr) = self.locate(&target, guard);
            // SAFETY: guard-protected pointers from locate.
            let pred: Option<&Node<T>> = unsafe { pred_ptr.as_ref() };
            let curr: Option<&Node<T>> = unsafe { curr_ptr.as_ref() };

            // Locks in fixed order: predecessor first.
            let _pred_lock: Option<LockGuard<'_>> = match pred {
                Some(p) => match p.try_lock() {
                    Some(lock) => Some(lock),
                    None => {
                        attempt += 1;
                        trace_log!(key, attempt, "insert: predecessor lock contended");
                        backoff(attempt);
                        continue;
                    }
                },
                None => None,
            };
            let _curr_lock: Option<LockGuard<'_>> = match curr {
                Some(c) => match c.try_lock() {
                    Some(lock) => Some(lock),
                    None => {
                        attempt += 1;
                        trace_log!(key, attempt, "insert: successor lock contended");
                        backoff(attempt);
                        continue;
                    }
                },
                None => None,
            };

            // Revalidate: a structural change between locate and locking
            // invalidates the pair.
            if self.locate(&target, guard) != (pred_ptr, curr_ptr) {
                attempt += 1;
                trace_log!(key, attempt, "insert: revalidation failed");
                backoff(attempt);
                continue;
            }

            if let Some(c) = curr {
                if c.key() == key {
                    if c.set_value(Some(Arc::clone(value))).is_none() {
                        self.len.fetch_add(1, AtomicOrdering::Relaxed);
                    }
                    debug_log!(key, "insert: overwrote existing value");
                    return;
                }
            }

            // A miss always descended at least once: only key 0 shares
            // every digit with the sentinel, and key 0 is an exact match.
            let Some(p) = pred else {
                panic!("key {key} missed without descending from the sentinel: structure corrupted");
            };

            let splice_dim: usize = (0..self.dim)
                .find(|&d| target[d] > p.coord()[d])
                .unwrap_or_else(|| panic!("key {key} lies outside the addressable coordinate space"));

            let node = Node::new(key, target.clone(), Some(Arc::clone(value)));

            // Redistribute the successor's subtree under the new node.
            if let Some(c) = curr {
                for d in splice_dim..self.dim {
                    if target[d] < c.coord()[d] {
                        // The whole successor subtree drops below the new
                        // node at dimension d.
                        node.set_child(d, curr_ptr);
                        break;
                    }
                    debug_assert_eq!(
                        target[d],
                        c.coord()[d],
                        "successor reached through slot {splice_dim} cannot be below the new node"
                    );
                    // Equal digit: the new node takes over the successor's
                    // sub-list at d.
                    node.set_child(d, c.child(d));
                    c.set_child(d, ptr::null_mut());
                }
            }

            let node_ptr: *mut Node<T> = Box::into_raw(Box::new(node));
            // Publish: a single Release store makes the node (and the
            // subtree hanging off it) reachable.
            p.set_child(splice_dim, node_ptr);
            self.len.fetch_add(1, AtomicOrdering::Relaxed);
            trace_log!(key, splice_dim, "insert: spliced new node");
            return;
        }
    }

    // ========================================================================
    //  Remove
    // ========================================================================

    fn remove_inner(&self, key: u64, guard: &LocalGuard<'_>) -> Option<Arc<T>> {
        // The sentinel is never unlinked; removing key 0 clears its
        // value slot.
        if key == 0 {
            // SAFETY: root lives until the list drops.
            let root: &Node<T> = unsafe { &*self.root };
            let old: Option<Arc<T>> = root.set_value(None);
            if old.is_some() {
                self.len.fetch_sub(1, AtomicOrdering::Relaxed);
            }
            return old;
        }

        let target = key_to_coord(key, self.dim, self.radix);
        let mut attempt: u32 = 0;

        loop {
            let (pred_ptr, curr_ptr) = self.locate(&target, guard);
            if curr_ptr.is_null() {
                return None;
            }
            // SAFETY: guard-protected pointers from locate.
            let curr: &Node<T> = unsafe { &*curr_ptr };
            if curr.key() != key {
                return None;
            }
            assert!(
                !pred_ptr.is_null(),
                "key {key} matched a non-sentinel node without a predecessor: structure corrupted"
            );
            // SAFETY: non-null, guard-protected.
            let pred: &Node<T> = unsafe { &*pred_ptr };

            let Some(_pred_lock) = pred.try_lock() else {
                attempt += 1;
                trace_log!(key, attempt, "remove: predecessor lock contended");
                backoff(attempt);
                continue;
            };
            let Some(_curr_lock) = curr.try_lock() else {
                attempt += 1;
                trace_log!(key, attempt, "remove: victim lock contended");
                backoff(attempt);
                continue;
            };

            // The pair may have gone stale before the locks landed; a
            // stale pair must restart, not be mistaken for corruption by
            // the parent-slot scan below.
            if self.locate(&target, guard) != (pred_ptr, curr_ptr) {
                attempt += 1;
                trace_log!(key, attempt, "remove: revalidation failed");
                backoff(attempt);
                continue;
            }

            let parent_slot: usize = (0..self.dim)
                .find(|&d| pred.child(d) == curr_ptr)
                .unwrap_or_else(|| {
                    panic!("predecessor of key {key} holds no slot for it: structure corrupted")
                });

            // Replacement: the victim's highest-indexed child heads the
            // sub-list that inherits the victim's position.
            let replacement: Option<(usize, *mut Node<T>)> = curr.highest_child();
            let _repl_lock: Option<LockGuard<'_>> = match replacement {
                Some((_, repl_ptr)) => {
                    // SAFETY: non-null child slot read under the victim's
                    // lock; guard-protected.
                    let repl: &Node<T> = unsafe { &*repl_ptr };
                    match repl.try_lock() {
                        Some(lock) => Some(lock),
                        None => {
                            attempt += 1;
                            trace_log!(key, attempt, "remove: replacement lock contended");
                            backoff(attempt);
                            continue;
                        }
                    }
                }
                None => None,
            };

            // With all three locks held, every pointer feeding this
            // splice is frozen; one last check closes the window between
            // reading the replacement slot and locking it.
            if self.locate(&target, guard) != (pred_ptr, curr_ptr) {
                attempt += 1;
                warn_log!(key, attempt, "remove: pair changed under held locks");
                backoff(attempt);
                continue;
            }

            match replacement {
                Some((repl_slot, repl_ptr)) => {
                    // SAFETY: locked above.
                    let repl: &Node<T> = unsafe { &*repl_ptr };
                    // The replacement agrees with the victim on every
                    // coordinate below its slot, so it inherits the
                    // victim's lower sub-lists; its own slots there are
                    // empty while it hangs off the victim.
                    for d in 0..repl_slot {
                        repl.set_child(d, curr.child(d));
                    }
                    pred.set_child(parent_slot, repl_ptr);
                }
                None => pred.set_child(parent_slot, ptr::null_mut()),
            }

            let value: Option<Arc<T>> = curr.set_value(None);
            debug_assert!(value.is_some(), "linked non-sentinel node lost its value");
            self.len.fetch_sub(1, AtomicOrdering::Relaxed);
            debug_log!(key, parent_slot, "remove: spliced node out");

            // SAFETY: curr is unlinked; readers that still hold it sit
            // inside guards the collector waits for.
            unsafe { guard.defer_retire(curr_ptr, reclaim_node::<T>) };
            return value;
        }
    }
}

impl<T> std::fmt::Debug for MdList<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MdList")
            .field("dim", &self.dim)
            .field("key_space", &self.key_space)
            .field("radix", &self.radix)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl<T> Drop for MdList<T> {
    fn drop(&mut self) {
        // Exclusive access: free every node still linked. Nodes removed
        // earlier were retired through the collector and are not
        // reachable from here.
        let mut stack: Vec<*mut Node<T>> = vec![self.root];
        while let Some(ptr) = stack.pop() {
            if ptr.is_null() {
                continue;
            }
            // SAFETY: every linked node was allocated via Box::into_raw
            // and has exactly one parent slot pointing at it.
            let node: Box<Node<T>> = unsafe { Box::from_raw(ptr) };
            for d in 0..node.dim() {
                stack.push(node.child(d));
            }
        }
    }
}
