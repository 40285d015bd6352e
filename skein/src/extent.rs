// Copyright 2026 the Skein Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Typed memory extents.
//!
//! An extent is a region of host or device memory with a declared
//! durability, direction, and locality. The variants here cover what the
//! execution core needs: durable host storage, durable and ephemeral device
//! buffers, a host ring whose live window can be snapshotted to the device,
//! and the paired host/device buffer used for device-maintained counters.
//!
//! Allocation discipline is strict: every allocate has exactly one matching
//! free, every snapshot exactly one release, and an extent must not be freed
//! while a snapshot derived from it is live.

use bytemuck::{Pod, Zeroable};

use crate::backend::{BufferId, EventId, QueueId};
use crate::ring::Ring;
use crate::runtime::Runtime;
use crate::{Error, Result};

/// Durable permanent host storage, read-write by the host.
pub struct HostExtent<T> {
    data: Vec<T>,
}

impl<T: Pod + Zeroable> HostExtent<T> {
    pub fn new(len: usize) -> Self {
        Self {
            data: vec![T::zeroed(); len],
        }
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.data)
    }

    /// Overwrite from raw bytes, e.g. a map payload. Extra bytes from a
    /// backend's copy-alignment rounding are ignored.
    pub fn copy_from_bytes(&mut self, bytes: &[u8]) {
        let dst = bytemuck::cast_slice_mut::<T, u8>(&mut self.data);
        dst.copy_from_slice(&bytes[..dst.len()]);
    }
}

/// Durable permanent device allocation.
pub struct DeviceExtent {
    buf: BufferId,
    size: u64,
    label: &'static str,
}

impl DeviceExtent {
    pub fn alloc(rt: &mut Runtime, size: u64, label: &'static str) -> Result<Self> {
        let buf = rt
            .backend
            .alloc_device(size, label)
            .ok_or(Error::DeviceAlloc { name: label, size })?;
        Ok(Self { buf, size, label })
    }

    pub fn free(self, rt: &mut Runtime) {
        rt.backend.free_device(self.buf);
    }

    pub fn id(&self) -> BufferId {
        self.buf
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn label(&self) -> &'static str {
        self.label
    }
}

/// Ephemeral device allocation, freed explicitly when its consumer is done.
pub struct TempDeviceExtent {
    buf: BufferId,
    size: u64,
}

impl TempDeviceExtent {
    pub fn alloc(rt: &mut Runtime, size: u64, label: &'static str) -> Result<Self> {
        let buf = rt
            .backend
            .alloc_device(size, label)
            .ok_or(Error::DeviceAlloc { name: label, size })?;
        Ok(Self { buf, size })
    }

    /// Enqueue a zero fill of the whole extent.
    pub fn zero(&self, rt: &mut Runtime, queue: QueueId) -> EventId {
        rt.backend.enqueue_fill(queue, self.buf, 0, 0, self.size)
    }

    pub fn free(self, rt: &mut Runtime) {
        rt.backend.free_device(self.buf);
    }

    pub fn id(&self) -> BufferId {
        self.buf
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

/// Point-in-time capture of a host ring's live window.
///
/// Holds the logical cursor range; release it against the same ring exactly
/// once, which pops the captured slots.
#[derive(Debug)]
pub struct RingSnapshot {
    reads: u32,
    writes: u32,
}

impl RingSnapshot {
    pub fn count(&self) -> u32 {
        self.writes.wrapping_sub(self.reads)
    }
}

/// Durable host storage addressed through an embedded ring, with ephemeral
/// device snapshots.
///
/// The producer appends entries host-side; sealing captures the live window
/// and pushes it to a freshly allocated device buffer. When the window wraps
/// the physical store, materialization issues two transfers: the wrapped
/// tail of the window first, into the tail of the destination, then the head
/// chunk into the destination's head. Both ride the same queue, so awaiting
/// the head transfer's event covers both (same-queue submission order; see
/// DESIGN.md).
pub struct HostRingExtent<T> {
    ring: Ring,
    data: Vec<T>,
}

impl<T: Pod + Zeroable> HostRingExtent<T> {
    pub fn new(capacity: u32) -> Self {
        Self {
            ring: Ring::new(capacity),
            data: vec![T::zeroed(); capacity as usize],
        }
    }

    pub fn ring(&self) -> &Ring {
        &self.ring
    }

    /// Append one entry, failing with ring backpressure when full.
    pub fn push(&mut self, value: T) -> Result<()> {
        let base = self.ring.alloc(1)?;
        let index = self.ring.index(base);
        self.data[index] = value;
        Ok(())
    }

    /// Capture the live window `[reads, writes)`.
    pub fn snapshot(&mut self) -> RingSnapshot {
        self.ring.snaps += 1;
        RingSnapshot {
            reads: self.ring.reads(),
            writes: self.ring.writes(),
        }
    }

    /// Copy a snapshot's entries into a fresh ephemeral device buffer.
    ///
    /// Returns the buffer and the event that signals the copy is complete.
    /// An empty snapshot allocates a zero-length buffer and completes
    /// immediately.
    pub fn materialize(
        &self,
        rt: &mut Runtime,
        snap: &RingSnapshot,
        queue: QueueId,
        label: &'static str,
    ) -> Result<(TempDeviceExtent, EventId)> {
        let elem = std::mem::size_of::<T>() as u64;
        let count = snap.count();
        let dst = TempDeviceExtent::alloc(rt, u64::from(count) * elem, label)?;
        if count == 0 {
            let event = rt.backend.immediate_event();
            return Ok((dst, event));
        }
        let index_lo = self.ring.index(snap.reads);
        let count_max = self.ring.capacity() - index_lo as u32;
        let count_lo = count.min(count_max);
        let head = &self.data[index_lo..index_lo + count_lo as usize];
        let event = if count > count_max {
            // Wrap: the window's tail sits at the front of physical storage.
            let tail = &self.data[..(count - count_max) as usize];
            rt.backend.enqueue_write(
                queue,
                dst.id(),
                u64::from(count_lo) * elem,
                bytemuck::cast_slice(tail).to_vec(),
            );
            rt.backend
                .enqueue_write(queue, dst.id(), 0, bytemuck::cast_slice(head).to_vec())
        } else {
            rt.backend
                .enqueue_write(queue, dst.id(), 0, bytemuck::cast_slice(head).to_vec())
        };
        Ok((dst, event))
    }

    /// Release every outstanding slot. Legal only with no live snapshot.
    pub fn clear(&mut self) {
        debug_assert_eq!(self.ring.snaps, 0, "clear under a live snapshot");
        self.ring.release(self.ring.count());
    }

    /// Release a snapshot, popping its slots from the ring.
    ///
    /// Snapshots over one ring must be released in capture order.
    pub fn release(&mut self, snap: RingSnapshot) {
        debug_assert_eq!(
            snap.reads,
            self.ring.reads(),
            "snapshots released out of order"
        );
        debug_assert!(self.ring.snaps > 0);
        self.ring.release(snap.count());
        self.ring.snaps -= 1;
    }
}

impl<T> Drop for HostRingExtent<T> {
    fn drop(&mut self) {
        debug_assert_eq!(self.ring.snaps, 0, "ring extent freed under a live snapshot");
    }
}

/// Paired host-readable / device-read-write buffer for device-maintained
/// counters, with explicit read-back and zero-fill.
pub struct AtomicsExtent<T> {
    host: T,
    dev: BufferId,
    label: &'static str,
}

impl<T: Pod + Zeroable> AtomicsExtent<T> {
    pub fn alloc(rt: &mut Runtime, label: &'static str) -> Result<Self> {
        let size = std::mem::size_of::<T>() as u64;
        let dev = rt
            .backend
            .alloc_device(size, label)
            .ok_or(Error::DeviceAlloc { name: label, size })?;
        Ok(Self {
            host: T::zeroed(),
            dev,
            label,
        })
    }

    /// The host copy, valid as of the last completed `read_back`.
    pub fn host(&self) -> &T {
        &self.host
    }

    pub fn id(&self) -> BufferId {
        self.dev
    }

    /// Enqueue a device-to-host read; the completion payload carries the
    /// bytes to [`apply`](Self::apply).
    pub fn read_back(&self, rt: &mut Runtime, queue: QueueId) -> EventId {
        rt.backend
            .enqueue_read(queue, self.dev, 0, std::mem::size_of::<T>() as u64)
    }

    /// Install a completed read-back payload as the host copy.
    pub fn apply(&mut self, bytes: &[u8]) {
        self.host = bytemuck::pod_read_unaligned(&bytes[..std::mem::size_of::<T>()]);
    }

    /// Zero both sides: the host copy now, the device buffer via the queue.
    pub fn zero(&mut self, rt: &mut Runtime, queue: QueueId) -> EventId {
        self.host = T::zeroed();
        rt.backend
            .enqueue_fill(queue, self.dev, 0, 0, std::mem::size_of::<T>() as u64)
    }

    pub fn free(self, rt: &mut Runtime) {
        log::trace!("{}: freed", self.label);
        rt.backend.free_device(self.dev);
    }
}
