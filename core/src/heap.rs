//! Fixed-capacity binary heap
//!
//! Array-backed complete binary tree: the children of the element at index
//! `i` live at `2i + 1` and `2i + 2`. The ordering is a context value rather
//! than an `Ord` bound so the same container can order by any key.
//!
//! The heap does no locking of its own. Owners that share it between tasks
//! keep it behind a mutex and hold that mutex across a whole
//! `push`/`pop`/`peek` sequence.

use heapless::Vec;

use crate::error::CapacityExceeded;

/// Ordering used by [`DeadlineHeap`]
pub trait HeapOrder<T> {
    /// Return `true` iff `a` must leave the heap before `b`.
    fn precedes(&self, a: &T, b: &T) -> bool;
}

/// Smallest element first
#[derive(Debug, Clone, Copy, Default)]
pub struct MinFirst;

impl<T: Ord> HeapOrder<T> for MinFirst {
    fn precedes(&self, a: &T, b: &T) -> bool {
        a < b
    }
}

/// Binary heap over at most `N` elements
///
/// Equal elements leave in no particular order: sifting up stops at an equal
/// parent, and sifting down prefers the left child when both children are
/// equal.
pub struct DeadlineHeap<T, const N: usize, O = MinFirst> {
    items: Vec<T, N>,
    order: O,
}

impl<T: Ord, const N: usize> DeadlineHeap<T, N, MinFirst> {
    pub const fn new() -> Self {
        Self::with_order(MinFirst)
    }
}

impl<T: Ord, const N: usize> Default for DeadlineHeap<T, N, MinFirst> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const N: usize, O: HeapOrder<T>> DeadlineHeap<T, N, O> {
    pub const fn with_order(order: O) -> Self {
        Self {
            items: Vec::new(),
            order,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    /// Element that [`Self::pop`] would return next
    pub fn peek(&self) -> Option<&T> {
        self.items.first()
    }

    /// Elements in storage (heap) order
    pub fn iter(&self) -> core::slice::Iter<'_, T> {
        self.items.iter()
    }

    /// Insert an element in O(log n)
    pub fn push(&mut self, item: T) -> Result<(), CapacityExceeded> {
        self.items.push(item).map_err(|_| CapacityExceeded)?;
        self.sift_up(self.items.len() - 1);
        Ok(())
    }

    /// Remove the top element in O(log n)
    pub fn pop(&mut self) -> Option<T> {
        if self.items.is_empty() {
            return None;
        }
        let last = self.items.len() - 1;
        self.items.swap(0, last);
        let top = self.items.pop();
        self.sift_down(0);
        top
    }

    fn sift_up(&mut self, mut pos: usize) {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if !self.order.precedes(&self.items[pos], &self.items[parent]) {
                break;
            }
            self.items.swap(pos, parent);
            pos = parent;
        }
    }

    fn sift_down(&mut self, mut pos: usize) {
        let end = self.items.len();
        loop {
            let left = 2 * pos + 1;
            if left >= end {
                break;
            }
            let right = left + 1;

            // Pick the child that leaves first; the left one on ties
            let mut child = left;
            if right < end && self.order.precedes(&self.items[right], &self.items[left]) {
                child = right;
            }

            if !self.order.precedes(&self.items[child], &self.items[pos]) {
                break;
            }
            self.items.swap(pos, child);
            pos = child;
        }
    }
}
