// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Bounded job queue, one per worker.
//!
//! Ring buffer with a power-of-two capacity so wrapping is a mask.

use crate::spinlock::SpinLock;

/// Slots per worker queue unless the pool is built with another size.
pub const DEFAULT_CAPACITY: usize = 1024;

struct Ring<T> {
    slots: Vec<Option<T>>,
    head: usize,
    len: usize,
}

pub struct SyncQueue<T> {
    ring: SpinLock<Ring<T>>,
    mask: usize,
}

impl<T> SyncQueue<T> {
    /// `capacity` is rounded up to the next power of two.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1).next_power_of_two();
        let slots = (0..capacity).map(|_| None).collect();
        Self {
            ring: SpinLock::new(Ring {
                slots,
                head: 0,
                len: 0,
            }),
            mask: capacity - 1,
        }
    }

    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Append at the tail. Hands the item back if the queue is full.
    pub fn push(&self, item: T) -> Result<(), T> {
        let mut ring = self.ring.lock();
        if ring.len > self.mask {
            return Err(item);
        }
        let tail = (ring.head + ring.len) & self.mask;
        ring.slots[tail] = Some(item);
        ring.len += 1;
        Ok(())
    }

    pub fn pop(&self) -> Option<T> {
        let mut ring = self.ring.lock();
        if ring.len == 0 {
            return None;
        }
        let head = ring.head;
        let item = ring.slots[head].take();
        ring.head = (head + 1) & self.mask;
        ring.len -= 1;
        item
    }

    pub fn len(&self) -> usize {
        self.ring.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for SyncQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
