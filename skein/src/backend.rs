// Copyright 2026 the Skein Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Device backend interface.
//!
//! Everything the execution core asks of a GPU lives behind [`DeviceBackend`]:
//! buffer allocation, enqueued transfers, opaque kernel dispatch, and
//! completion notification. Operations are *enqueued*, never executed
//! synchronously; a backend signals completion by sending the operation's
//! [`EventId`] (plus an optional read-back payload) through the
//! [`CompletionSender`] it was constructed with. The host scheduler is the
//! only consumer of that channel, which keeps all host-state mutation on one
//! logical context no matter which thread the backend completes work on.

pub mod mock;
#[cfg(feature = "wgpu")]
pub mod wgpu;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, Sender};

/// Identity of a device buffer owned by a backend.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct BufferId(pub u64);

impl BufferId {
    pub fn next() -> Self {
        static ID_COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Identity of an enqueued operation whose completion can be awaited.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct EventId(pub u64);

impl EventId {
    pub fn next() -> Self {
        static ID_COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// A command queue acquired from a backend.
///
/// Per-queue submission order is preserved; the snapshot materialization and
/// seal paths rely on this instead of extra synchronization between
/// same-queue transfer/kernel/commit steps.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct QueueId(pub u32);

/// An opaque unit of device work registered with a backend.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct KernelId(pub u32);

/// One argument bound to a kernel dispatch, in binding order.
#[derive(Clone, Debug)]
pub enum KernelArg {
    /// A device buffer bound as read-write storage.
    Buffer(BufferId),
    /// A small immediate value, delivered as uniform data.
    Value(u32),
}

/// Completion notification for one enqueued operation.
///
/// `payload` carries read-back bytes for `enqueue_read` and `enqueue_map`
/// operations and is `None` for everything else.
pub struct Completion {
    pub event: EventId,
    pub payload: Option<Vec<u8>>,
}

/// Sending half of the completion channel, handed to a backend at
/// construction. Clone freely; completion threads hold one each.
#[derive(Clone)]
pub struct CompletionSender(Sender<Completion>);

// Completion threads are the whole point of this type.
static_assertions::assert_impl_all!(CompletionSender: Send);

impl CompletionSender {
    /// Signal that `event` finished, with optional read-back bytes.
    ///
    /// A send after the host runtime has shut down is silently dropped; the
    /// receiver owning the channel is the runtime's to close.
    pub fn signal(&self, event: EventId, payload: Option<Vec<u8>>) {
        let _ = self.0.send(Completion { event, payload });
    }
}

/// Create the completion channel shared by a runtime and its backend.
pub fn completion_channel() -> (CompletionSender, Receiver<Completion>) {
    let (tx, rx) = std::sync::mpsc::channel();
    (CompletionSender(tx), rx)
}

/// The capability interface one device backend implements.
///
/// All `enqueue_*` methods return immediately after queuing work; completion
/// is observed only through the completion channel. Device submission
/// failures are unrecoverable for the in-flight operation and panic rather
/// than surfacing a `Result`; allocation failure is the one fallible call,
/// reported by returning `None` so the caller can abort its operation.
pub trait DeviceBackend {
    /// Downcast access to the concrete backend, for construction-time
    /// configuration and test introspection.
    fn as_any(&self) -> &dyn std::any::Any;

    /// Allocate a device buffer. Zero-size allocations are valid and cheap.
    /// Returns `None` when device memory is exhausted.
    fn alloc_device(&mut self, size: u64, label: &'static str) -> Option<BufferId>;

    /// Free a device buffer. Exactly one free per allocation.
    fn free_device(&mut self, buf: BufferId);

    /// Acquire a command queue.
    fn acquire_queue(&mut self) -> QueueId;

    /// Release a command queue acquired from this backend.
    fn release_queue(&mut self, queue: QueueId);

    /// Enqueue a fill of `len` bytes at `offset` with `byte`.
    fn enqueue_fill(&mut self, queue: QueueId, buf: BufferId, byte: u8, offset: u64, len: u64)
        -> EventId;

    /// Enqueue a host-to-device write.
    fn enqueue_write(&mut self, queue: QueueId, buf: BufferId, offset: u64, bytes: Vec<u8>)
        -> EventId;

    /// Enqueue a device-to-host read of `len` bytes at `offset`; the bytes
    /// arrive as the completion payload.
    fn enqueue_read(&mut self, queue: QueueId, buf: BufferId, offset: u64, len: u64) -> EventId;

    /// Enqueue a map: expose the buffer's current contents to the host. The
    /// contents arrive as the completion payload.
    fn enqueue_map(&mut self, queue: QueueId, buf: BufferId) -> EventId;

    /// Enqueue an unmap: commit host-held contents back to the device.
    fn enqueue_unmap(&mut self, queue: QueueId, buf: BufferId, bytes: Vec<u8>) -> EventId;

    /// Enqueue an opaque kernel over `global` work items with the given
    /// arguments bound in order.
    fn enqueue_kernel(
        &mut self,
        queue: QueueId,
        kernel: KernelId,
        global: u32,
        args: &[KernelArg],
    ) -> EventId;

    /// Submit everything enqueued on `queue` to the device.
    fn flush(&mut self, queue: QueueId);

    /// Let the backend make progress while the host blocks in a scheduler
    /// pump. Poll-style; must not block indefinitely.
    fn drive(&mut self);

    /// An event that is already complete, for zero-work paths such as
    /// materializing an empty snapshot.
    fn immediate_event(&mut self) -> EventId;
}
