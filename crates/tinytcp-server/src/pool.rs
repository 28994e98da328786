//! Object pool with a release-resets-all-fields contract.
//!
//! Connection churn would otherwise allocate a socket, its locks and its
//! buffers for every accept. Retired objects are parked on a bounded free
//! list and handed out again by the next [`Pool::acquire`].
//!
//! # Invariants
//!
//! - Objects on the free list have been fully reset ([`Recycle::reset`]).
//!   Leaking a stale field into the next connection is a correctness bug.
//! - The free list never exceeds its capacity; surplus objects are dropped.

use std::sync::{Arc, Mutex};

use crate::util::lock;

/// Types that can be returned to a [`Pool`].
pub trait Recycle {
    /// Restore the freshly constructed state, releasing held resources.
    fn reset(&mut self);
}

/// Bounded free list of reusable objects.
#[derive(Debug)]
pub struct Pool<T> {
    free: Mutex<Vec<T>>,
    capacity: usize,
}

impl<T> Pool<T> {
    /// Create an empty pool keeping at most `capacity` idle objects.
    pub fn new(capacity: usize) -> Self {
        Self { free: Mutex::new(Vec::with_capacity(capacity)), capacity }
    }

    /// Take an idle object, if any.
    pub fn acquire(&self) -> Option<T> {
        lock(&self.free).pop()
    }

    /// Number of idle objects.
    pub fn len(&self) -> usize {
        lock(&self.free).len()
    }

    /// True if no idle object is available.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn park(&self, item: T) {
        let mut free = lock(&self.free);
        if free.len() < self.capacity {
            free.push(item);
        }
    }
}

impl<T: Recycle> Pool<T> {
    /// Reset `item` and keep it for reuse.
    pub fn recycle(&self, mut item: T) {
        item.reset();
        self.park(item);
    }
}

impl<T: Recycle> Pool<Arc<T>> {
    /// Reset and keep a shared object if the caller holds the last reference.
    ///
    /// Returns `false` when other references are still alive; the object is
    /// then only dropped by this call and freed by its last holder.
    pub fn recycle_shared(&self, mut item: Arc<T>) -> bool {
        let Some(inner) = Arc::get_mut(&mut item) else {
            return false;
        };
        inner.reset();
        self.park(item);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, PartialEq)]
    struct Buffer {
        data: Vec<u8>,
        uses: u32,
    }

    impl Recycle for Buffer {
        fn reset(&mut self) {
            self.data.clear();
            self.uses = 0;
        }
    }

    #[test]
    fn recycled_objects_are_reset() {
        let pool = Pool::new(4);
        pool.recycle(Buffer { data: vec![1, 2, 3], uses: 9 });

        let buffer = pool.acquire().unwrap();
        assert!(buffer.data.is_empty());
        assert!(buffer.data.capacity() >= 3, "allocation is kept");
        assert_eq!(buffer.uses, 0);
        assert!(pool.is_empty());
    }

    #[test]
    fn capacity_bounds_the_free_list() {
        let pool = Pool::new(2);
        for _ in 0..5 {
            pool.recycle(Buffer::default());
        }
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn shared_objects_recycle_only_when_unique() {
        let pool: Pool<Arc<Buffer>> = Pool::new(4);

        let item = Arc::new(Buffer { data: vec![7], uses: 1 });
        let other = Arc::clone(&item);
        assert!(!pool.recycle_shared(item));
        assert!(pool.is_empty());

        assert!(pool.recycle_shared(other));
        let reused = pool.acquire().unwrap();
        assert_eq!(*reused, Buffer::default());
    }
}
