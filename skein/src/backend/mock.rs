// Copyright 2026 the Skein Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Host-memory backend with CPU kernel fallback.
//!
//! Buffers are plain byte vectors and kernels are registered Rust closures,
//! so the whole pipeline runs without a GPU. Enqueued operations are held
//! per queue and executed at `flush`, completing in submission order, which
//! pins the same-queue FIFO guarantee the core relies on. Tests also use the
//! issue counters to assert how many transfers or kernel launches a path
//! produced.

use std::collections::HashMap;

use super::{
    BufferId, CompletionSender, DeviceBackend, EventId, KernelArg, KernelId, QueueId,
};

/// One kernel argument as seen by a mock kernel body.
pub enum MockBinding<'a> {
    Buffer(&'a mut Vec<u8>),
    Value(u32),
}

type MockKernelFn = Box<dyn Fn(u32, &mut [MockBinding<'_>])>;

enum MockOp {
    Fill {
        event: EventId,
        buf: BufferId,
        byte: u8,
        offset: u64,
        len: u64,
    },
    Write {
        event: EventId,
        buf: BufferId,
        offset: u64,
        bytes: Vec<u8>,
    },
    Read {
        event: EventId,
        buf: BufferId,
        offset: u64,
        len: u64,
    },
    Map {
        event: EventId,
        buf: BufferId,
    },
    Unmap {
        event: EventId,
        buf: BufferId,
        bytes: Vec<u8>,
    },
    Kernel {
        event: EventId,
        kernel: KernelId,
        global: u32,
        args: Vec<KernelArg>,
    },
}

/// Host mock of a device: byte-vector buffers, closure kernels, FIFO queues.
pub struct MockBackend {
    completions: CompletionSender,
    bufs: HashMap<BufferId, Vec<u8>>,
    kernels: Vec<MockKernelFn>,
    queues: HashMap<QueueId, Vec<MockOp>>,
    next_queue: u32,
    /// Device memory budget in bytes; `None` is unlimited. Tests use this to
    /// provoke allocation failure.
    pub alloc_limit: Option<u64>,
    allocated: u64,
    /// Transfers (writes, fills, unmaps) executed so far.
    pub transfers_issued: usize,
    /// Kernel dispatches executed so far.
    pub kernels_launched: usize,
}

impl MockBackend {
    pub fn new(completions: CompletionSender) -> Self {
        Self {
            completions,
            bufs: HashMap::new(),
            kernels: Vec::new(),
            queues: HashMap::new(),
            next_queue: 0,
            alloc_limit: None,
            allocated: 0,
            transfers_issued: 0,
            kernels_launched: 0,
        }
    }

    /// Register a CPU kernel body; the returned id names it in dispatches.
    pub fn register_kernel(
        &mut self,
        body: impl Fn(u32, &mut [MockBinding<'_>]) + 'static,
    ) -> KernelId {
        let id = KernelId(self.kernels.len() as u32);
        self.kernels.push(Box::new(body));
        id
    }

    /// Read a buffer's current contents directly; test-side introspection.
    pub fn buffer(&self, buf: BufferId) -> &[u8] {
        &self.bufs[&buf]
    }

    fn run(&mut self, op: MockOp) {
        match op {
            MockOp::Fill {
                event,
                buf,
                byte,
                offset,
                len,
            } => {
                let data = self.bufs.get_mut(&buf).expect("fill of freed buffer");
                data[offset as usize..(offset + len) as usize].fill(byte);
                self.transfers_issued += 1;
                self.completions.signal(event, None);
            }
            MockOp::Write {
                event,
                buf,
                offset,
                bytes,
            } => {
                let data = self.bufs.get_mut(&buf).expect("write to freed buffer");
                data[offset as usize..offset as usize + bytes.len()].copy_from_slice(&bytes);
                self.transfers_issued += 1;
                self.completions.signal(event, None);
            }
            MockOp::Read {
                event,
                buf,
                offset,
                len,
            } => {
                let data = &self.bufs[&buf];
                let bytes = data[offset as usize..(offset + len) as usize].to_vec();
                self.completions.signal(event, Some(bytes));
            }
            MockOp::Map { event, buf } => {
                let bytes = self.bufs[&buf].clone();
                self.completions.signal(event, Some(bytes));
            }
            MockOp::Unmap { event, buf, bytes } => {
                let data = self.bufs.get_mut(&buf).expect("unmap of freed buffer");
                data.copy_from_slice(&bytes);
                self.transfers_issued += 1;
                self.completions.signal(event, None);
            }
            MockOp::Kernel {
                event,
                kernel,
                global,
                args,
            } => {
                // Move argument buffers out of the map so the kernel body can
                // hold mutable references to several at once.
                let mut taken: Vec<(BufferId, Vec<u8>)> = Vec::with_capacity(args.len());
                for arg in &args {
                    if let KernelArg::Buffer(id) = arg {
                        debug_assert!(
                            !taken.iter().any(|(t, _)| t == id),
                            "duplicate buffer argument"
                        );
                        let data = self.bufs.remove(id).expect("kernel arg buffer freed");
                        taken.push((*id, data));
                    }
                }
                {
                    let mut cursor = taken.iter_mut();
                    let mut bindings: Vec<MockBinding<'_>> = args
                        .iter()
                        .map(|arg| match arg {
                            KernelArg::Buffer(_) => {
                                MockBinding::Buffer(&mut cursor.next().unwrap().1)
                            }
                            KernelArg::Value(v) => MockBinding::Value(*v),
                        })
                        .collect();
                    (self.kernels[kernel.0 as usize])(global, &mut bindings);
                }
                for (id, data) in taken {
                    self.bufs.insert(id, data);
                }
                self.kernels_launched += 1;
                self.completions.signal(event, None);
            }
        }
    }

    fn push(&mut self, queue: QueueId, op: MockOp) {
        self.queues
            .get_mut(&queue)
            .expect("enqueue on released queue")
            .push(op);
    }
}

impl DeviceBackend for MockBackend {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn alloc_device(&mut self, size: u64, label: &'static str) -> Option<BufferId> {
        if let Some(limit) = self.alloc_limit {
            if self.allocated + size > limit {
                log::debug!("mock device allocation of {size}B for '{label}' refused");
                return None;
            }
        }
        self.allocated += size;
        let id = BufferId::next();
        self.bufs.insert(id, vec![0; size as usize]);
        Some(id)
    }

    fn free_device(&mut self, buf: BufferId) {
        let data = self.bufs.remove(&buf);
        debug_assert!(data.is_some(), "double free of device buffer");
        if let Some(data) = data {
            self.allocated -= data.len() as u64;
        }
    }

    fn acquire_queue(&mut self) -> QueueId {
        let id = QueueId(self.next_queue);
        self.next_queue += 1;
        self.queues.insert(id, Vec::new());
        id
    }

    fn release_queue(&mut self, queue: QueueId) {
        let pending = self.queues.remove(&queue);
        debug_assert!(
            pending.map_or(true, |ops| ops.is_empty()),
            "queue released with unflushed work"
        );
    }

    fn enqueue_fill(
        &mut self,
        queue: QueueId,
        buf: BufferId,
        byte: u8,
        offset: u64,
        len: u64,
    ) -> EventId {
        let event = EventId::next();
        self.push(
            queue,
            MockOp::Fill {
                event,
                buf,
                byte,
                offset,
                len,
            },
        );
        event
    }

    fn enqueue_write(
        &mut self,
        queue: QueueId,
        buf: BufferId,
        offset: u64,
        bytes: Vec<u8>,
    ) -> EventId {
        let event = EventId::next();
        self.push(
            queue,
            MockOp::Write {
                event,
                buf,
                offset,
                bytes,
            },
        );
        event
    }

    fn enqueue_read(&mut self, queue: QueueId, buf: BufferId, offset: u64, len: u64) -> EventId {
        let event = EventId::next();
        self.push(
            queue,
            MockOp::Read {
                event,
                buf,
                offset,
                len,
            },
        );
        event
    }

    fn enqueue_map(&mut self, queue: QueueId, buf: BufferId) -> EventId {
        let event = EventId::next();
        self.push(queue, MockOp::Map { event, buf });
        event
    }

    fn enqueue_unmap(&mut self, queue: QueueId, buf: BufferId, bytes: Vec<u8>) -> EventId {
        let event = EventId::next();
        self.push(queue, MockOp::Unmap { event, buf, bytes });
        event
    }

    fn enqueue_kernel(
        &mut self,
        queue: QueueId,
        kernel: KernelId,
        global: u32,
        args: &[KernelArg],
    ) -> EventId {
        let event = EventId::next();
        self.push(
            queue,
            MockOp::Kernel {
                event,
                kernel,
                global,
                args: args.to_vec(),
            },
        );
        event
    }

    fn flush(&mut self, queue: QueueId) {
        let ops = match self.queues.get_mut(&queue) {
            Some(ops) => std::mem::take(ops),
            None => return,
        };
        for op in ops {
            self.run(op);
        }
    }

    fn drive(&mut self) {
        // All mock work completes at flush; nothing to poll.
    }

    fn immediate_event(&mut self) -> EventId {
        let event = EventId::next();
        self.completions.signal(event, None);
        event
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::completion_channel;

    #[test]
    fn completions_arrive_in_submission_order() {
        let (tx, rx) = completion_channel();
        let mut backend = MockBackend::new(tx);
        let q = backend.acquire_queue();
        let buf = backend.alloc_device(8, "t").unwrap();
        let e0 = backend.enqueue_write(q, buf, 0, vec![1; 8]);
        let e1 = backend.enqueue_read(q, buf, 0, 8);
        backend.flush(q);
        assert_eq!(rx.recv().unwrap().event, e0);
        let c1 = rx.recv().unwrap();
        assert_eq!(c1.event, e1);
        assert_eq!(c1.payload.unwrap(), vec![1; 8]);
        backend.free_device(buf);
        backend.release_queue(q);
    }

    #[test]
    fn writes_stay_ordered_against_kernels_on_one_queue() {
        let (tx, rx) = completion_channel();
        let mut backend = MockBackend::new(tx);
        let stamp = backend.register_kernel(|_, bindings| {
            if let MockBinding::Buffer(buf) = &mut bindings[0] {
                buf.fill(0xaa);
            }
        });
        let q = backend.acquire_queue();
        let buf = backend.alloc_device(4, "t").unwrap();
        backend.enqueue_kernel(q, stamp, 1, &[KernelArg::Buffer(buf)]);
        let last = backend.enqueue_write(q, buf, 0, vec![0xbb; 4]);
        backend.flush(q);
        while rx.recv().unwrap().event != last {}
        // A write enqueued after a kernel lands after the kernel's effect.
        assert_eq!(backend.buffer(buf), &[0xbb; 4]);
        backend.free_device(buf);
        backend.release_queue(q);
    }

    #[test]
    fn kernel_sees_buffers_and_values() {
        let (tx, rx) = completion_channel();
        let mut backend = MockBackend::new(tx);
        let add = backend.register_kernel(|global, bindings| {
            let value = match bindings[1] {
                MockBinding::Value(v) => v,
                _ => unreachable!(),
            };
            if let MockBinding::Buffer(buf) = &mut bindings[0] {
                buf[0] = (global + value) as u8;
            }
        });
        let q = backend.acquire_queue();
        let buf = backend.alloc_device(4, "t").unwrap();
        backend.enqueue_kernel(q, add, 3, &[KernelArg::Buffer(buf), KernelArg::Value(4)]);
        backend.flush(q);
        rx.recv().unwrap();
        assert_eq!(backend.buffer(buf)[0], 7);
        assert_eq!(backend.kernels_launched, 1);
    }

    #[test]
    fn alloc_limit_refuses() {
        let (tx, _rx) = completion_channel();
        let mut backend = MockBackend::new(tx);
        backend.alloc_limit = Some(16);
        assert!(backend.alloc_device(16, "a").is_some());
        assert!(backend.alloc_device(1, "b").is_none());
    }
}
