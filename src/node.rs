//! A single node of the multi-dimensional list.
//!
//! A node owns its key, the key's fixed coordinate vector, an optional
//! value, and one child slot per dimension. Three independent mechanisms
//! protect its mutable state:
//!
//! - the **structural lock** ([`NodeLock`]) serialises the node's
//!   participation in insert/remove pointer surgery,
//! - the **value slot** sits behind its own mutex and can be read or
//!   swapped without touching the structural lock,
//! - **child slots** are single words, written with Release and read
//!   with Acquire, so traversals never block on writers.

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::nodelock::{LockGuard, NodeLock};

/// A node keyed by `key` with `coord.len()` child slots.
///
/// Child slot `d` heads the sub-list of nodes that agree with this node
/// on coordinates `[0..d]` and strictly exceed it at coordinate `d`.
#[derive(Debug)]
pub struct Node<T> {
    key: u64,

    /// Fixed at construction; always equals the codec's digits for `key`.
    coord: Box<[u64]>,

    lock: NodeLock,

    value: Mutex<Option<Arc<T>>>,

    children: Box<[AtomicPtr<Node<T>>]>,
}

impl<T> Node<T> {
    pub(crate) fn new(key: u64, coord: Box<[u64]>, value: Option<Arc<T>>) -> Self {
        let dim: usize = coord.len();
        Self {
            key,
            coord,
            lock: NodeLock::new(),
            value: Mutex::new(value),
            children: (0..dim).map(|_| AtomicPtr::new(ptr::null_mut())).collect(),
        }
    }

    /// The node's key. Immutable, so no lock is taken.
    #[inline]
    #[must_use]
    pub fn key(&self) -> u64 {
        self.key
    }

    /// The node's coordinate vector. Immutable, so no lock is taken.
    #[inline]
    #[must_use]
    pub fn coord(&self) -> &[u64] {
        &self.coord
    }

    /// Number of child slots (the list dimension).
    #[inline]
    #[must_use]
    pub fn dim(&self) -> usize {
        self.children.len()
    }

    /// Read the value slot.
    #[must_use]
    pub fn get_value(&self) -> Option<Arc<T>> {
        self.value.lock().clone()
    }

    /// Replace the value slot, returning the previous contents.
    ///
    /// Passing `None` is the read-and-clear used when the root sentinel's
    /// key is removed.
    pub fn set_value(&self, value: Option<Arc<T>>) -> Option<Arc<T>> {
        std::mem::replace(&mut *self.value.lock(), value)
    }

    /// Load child slot `d`.
    ///
    /// # Panics
    ///
    /// Panics if `d >= self.dim()`.
    #[inline]
    #[must_use]
    pub fn child(&self, d: usize) -> *mut Node<T> {
        self.children[d].load(Ordering::Acquire)
    }

    /// Store child slot `d`.
    ///
    /// Callers hold the structural locks the splice protocol requires;
    /// the store itself is a single Release write so concurrent
    /// traversals see either the old or the new pointer.
    ///
    /// # Panics
    ///
    /// Panics if `d >= self.dim()`.
    #[inline]
    pub fn set_child(&self, d: usize, child: *mut Node<T>) {
        self.children[d].store(child, Ordering::Release);
    }

    /// The highest-indexed non-null child, with its slot index.
    ///
    /// This is the replacement candidate when the node is spliced out.
    #[must_use]
    pub(crate) fn highest_child(&self) -> Option<(usize, *mut Node<T>)> {
        (0..self.children.len()).rev().find_map(|d| {
            let child: *mut Node<T> = self.child(d);
            (!child.is_null()).then_some((d, child))
        })
    }

    /// Acquire the structural lock, blocking.
    #[must_use = "releasing a lock without using the guard is a logic error"]
    pub fn lock(&self) -> LockGuard<'_> {
        self.lock.lock()
    }

    /// Try to acquire the structural lock without blocking.
    #[inline]
    #[must_use]
    pub fn try_lock(&self) -> Option<LockGuard<'_>> {
        self.lock.try_lock()
    }
}
