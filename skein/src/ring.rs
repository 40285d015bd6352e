// Copyright 2026 the Skein Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Fixed-capacity circular index allocator.
//!
//! A [`Ring`] hands out contiguous logical slot ranges from a power-of-two
//! capacity, tracking a monotonic write cursor and read cursor. It is the
//! foundation for every ephemeral extent: an extent embeds a ring, a producer
//! allocates slots and fills them, and a point-in-time snapshot of the live
//! window is later pushed to the device.
//!
//! Cursors wrap freely in `u32` arithmetic; only their difference is
//! meaningful. The design restricts concurrent writers to a single producer,
//! so `count()` is exact for the producer and approximate for anyone else.

use crate::{Error, Result};

/// Circular index allocator over a power-of-two capacity.
#[derive(Debug)]
pub struct Ring {
    capacity: u32,
    mask: u32,
    writes: u32,
    reads: u32,
    /// Number of live snapshots over this ring's window.
    pub(crate) snaps: u32,
}

impl Ring {
    /// Create a ring with the given slot capacity.
    ///
    /// The capacity must be a nonzero power of two so that logical cursors
    /// can be mapped to physical indices with a mask.
    pub fn new(capacity: u32) -> Self {
        assert!(capacity.is_power_of_two(), "ring capacity must be 2^n");
        Self {
            capacity,
            mask: capacity - 1,
            writes: 0,
            reads: 0,
            snaps: 0,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn mask(&self) -> u32 {
        self.mask
    }

    /// Logical write cursor. Monotonic, wraps in `u32`.
    pub fn writes(&self) -> u32 {
        self.writes
    }

    /// Logical read cursor. Monotonic, wraps in `u32`.
    pub fn reads(&self) -> u32 {
        self.reads
    }

    /// Outstanding allocated-but-unreleased slots at the sampling instant.
    pub fn count(&self) -> u32 {
        self.writes.wrapping_sub(self.reads)
    }

    /// Remaining slots available to `alloc`.
    pub fn rem(&self) -> u32 {
        self.capacity - self.count()
    }

    /// Reserve `n` contiguous logical slots, advancing the write cursor.
    ///
    /// Returns the logical index of the first reserved slot. Fails with
    /// [`Error::RingFull`] when fewer than `n` slots are free; the caller
    /// decides whether that is backpressure or a sizing bug.
    pub fn alloc(&mut self, n: u32) -> Result<u32> {
        if self.count() + n > self.capacity {
            return Err(Error::RingFull {
                requested: n,
                capacity: self.capacity,
            });
        }
        let base = self.writes;
        self.writes = self.writes.wrapping_add(n);
        Ok(base)
    }

    /// Advance the read cursor by `n`, making slots reusable.
    ///
    /// Must never exceed the number of outstanding slots.
    pub fn release(&mut self, n: u32) {
        debug_assert!(n <= self.count(), "ring release exceeds outstanding slots");
        self.reads = self.reads.wrapping_add(n);
    }

    /// Map a logical cursor value to a physical slot index.
    pub fn index(&self, cursor: u32) -> usize {
        (cursor & self.mask) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_release_round_trip() {
        let mut ring = Ring::new(8);
        let reads = ring.reads();
        let writes = ring.writes();
        ring.alloc(5).unwrap();
        ring.release(5);
        assert_eq!(ring.count(), 0);
        assert_eq!(ring.writes().wrapping_sub(writes), 5);
        assert_eq!(ring.reads().wrapping_sub(reads), 5);
    }

    #[test]
    fn alloc_full_is_backpressure() {
        let mut ring = Ring::new(4);
        ring.alloc(4).unwrap();
        assert!(matches!(
            ring.alloc(1),
            Err(Error::RingFull {
                requested: 1,
                capacity: 4
            })
        ));
        ring.release(1);
        ring.alloc(1).unwrap();
    }

    #[test]
    fn cursors_wrap_in_u32() {
        let mut ring = Ring::new(4);
        // Drive the cursors across the u32 boundary.
        for _ in 0..(1 << 16) {
            ring.alloc(3).unwrap();
            ring.release(3);
        }
        assert_eq!(ring.count(), 0);
        let base = ring.alloc(2).unwrap();
        assert_eq!(ring.index(base), (base & ring.mask()) as usize);
        assert_eq!(ring.count(), 2);
    }

    #[test]
    #[should_panic]
    fn non_power_of_two_capacity_panics() {
        let _ = Ring::new(6);
    }
}
