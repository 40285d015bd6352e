// Copyright 2026 the Skein Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! wgpu-backed device backend.
//!
//! Logical queues map onto command encoders submitted to the single wgpu
//! queue; `flush` submits the encoder and wires completion signals through
//! `on_submitted_work_done` and buffer-map callbacks, which hop threads only
//! to post an event id on the completion channel. Map/unmap of a
//! device-resident extent is modeled as a read-back copy and a committing
//! write, since wgpu storage buffers have no persistent host mapping.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;

use wgpu::util::DeviceExt;
use wgpu::{
    Buffer, BufferUsages, CommandEncoder, CommandEncoderDescriptor, ComputePassDescriptor,
    ComputePipeline, Device, Queue,
};

use super::{
    BufferId, CompletionSender, DeviceBackend, EventId, KernelArg, KernelId, QueueId,
};

/// Binding slot shape for a registered kernel, in binding order.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Bind {
    /// Read-write storage buffer, bound from a [`KernelArg::Buffer`].
    Storage,
    /// Small uniform, bound from a [`KernelArg::Value`].
    Uniform,
}

struct Kernel {
    label: &'static str,
    pipeline: ComputePipeline,
    bind_group_layout: wgpu::BindGroupLayout,
}

/// Device backend over a wgpu device/queue pair.
pub struct WgpuBackend {
    device: Device,
    queue: Queue,
    completions: CompletionSender,
    bufs: HashMap<BufferId, Buffer>,
    kernels: Vec<Kernel>,
    encoders: HashMap<QueueId, CommandEncoder>,
    /// Events to signal once the queue's next submission completes.
    pending_signals: HashMap<QueueId, Vec<EventId>>,
    /// Read-backs awaiting a map after the next submission.
    pending_reads: HashMap<QueueId, Vec<(EventId, Buffer)>>,
    next_queue: u32,
}

impl WgpuBackend {
    pub fn new(device: Device, queue: Queue, completions: CompletionSender) -> Self {
        log::info!("wgpu backend up on {:?}", device.features());
        Self {
            device,
            queue,
            completions,
            bufs: HashMap::new(),
            kernels: Vec::new(),
            encoders: HashMap::new(),
            pending_signals: HashMap::new(),
            pending_reads: HashMap::new(),
            next_queue: 0,
        }
    }

    /// Register an opaque compute kernel from WGSL source.
    ///
    /// One bind group, `@workgroup_size` chosen by the shader author, entry
    /// point hardcoded as `main`; the same restrictions the rest of this
    /// backend's dispatch path assumes.
    pub fn add_kernel(
        &mut self,
        label: &'static str,
        wgsl: Cow<'static, str>,
        layout: &[Bind],
    ) -> KernelId {
        let entries = layout
            .iter()
            .enumerate()
            .map(|(i, bind)| wgpu::BindGroupLayoutEntry {
                binding: i as u32,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: match bind {
                        Bind::Storage => wgpu::BufferBindingType::Storage { read_only: false },
                        Bind::Uniform => wgpu::BufferBindingType::Uniform,
                    },
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            })
            .collect::<Vec<_>>();
        let module = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(label),
                source: wgpu::ShaderSource::Wgsl(wgsl),
            });
        let bind_group_layout =
            self.device
                .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                    label: None,
                    entries: &entries,
                });
        let pipeline_layout = self
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: None,
                bind_group_layouts: &[&bind_group_layout],
                push_constant_ranges: &[],
            });
        let pipeline = self
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(label),
                layout: Some(&pipeline_layout),
                module: &module,
                entry_point: "main",
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                cache: None,
            });
        let id = KernelId(self.kernels.len() as u32);
        self.kernels.push(Kernel {
            label,
            pipeline,
            bind_group_layout,
        });
        id
    }

    fn encoder(&mut self, queue: QueueId) -> &mut CommandEncoder {
        let device = &self.device;
        self.encoders.entry(queue).or_insert_with(|| {
            device.create_command_encoder(&CommandEncoderDescriptor { label: None })
        })
    }

    fn defer_signal(&mut self, queue: QueueId, event: EventId) {
        self.pending_signals.entry(queue).or_default().push(event);
    }

    fn buf(&self, buf: BufferId) -> &Buffer {
        self.bufs.get(&buf).expect("use of freed device buffer")
    }

    /// Write `bytes` into `buf` as an encoder-staged copy.
    ///
    /// `Queue::write_buffer` takes effect before any submitted encoder
    /// commands, which would break the per-queue FIFO order [`QueueId`]
    /// promises; staging through the encoder keeps writes ordered against
    /// kernels and reads on the same logical queue.
    fn staged_copy(&mut self, queue: QueueId, buf: BufferId, offset: u64, mut bytes: Vec<u8>) {
        // Copy sizes must be 4-byte aligned; callers write POD words, so
        // padding only ever lands inside a buffer's own alignment rounding.
        bytes.resize(bytes.len().next_multiple_of(4), 0);
        let staging = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("staged write"),
                contents: &bytes,
                usage: BufferUsages::COPY_SRC,
            });
        let dst = self.bufs.get(&buf).expect("write to freed buffer");
        let device = &self.device;
        let encoder = self.encoders.entry(queue).or_insert_with(|| {
            device.create_command_encoder(&CommandEncoderDescriptor { label: None })
        });
        encoder.copy_buffer_to_buffer(&staging, 0, dst, offset, bytes.len() as u64);
    }
}

impl DeviceBackend for WgpuBackend {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn alloc_device(&mut self, size: u64, label: &'static str) -> Option<BufferId> {
        // Zero-size extents are valid at the API level but can never be
        // bound, so give them (and odd sizes) a copy-aligned footprint.
        let rounded = size.max(4).next_multiple_of(4);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: rounded,
            usage: BufferUsages::STORAGE | BufferUsages::COPY_DST | BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let id = BufferId::next();
        self.bufs.insert(id, buffer);
        Some(id)
    }

    fn free_device(&mut self, buf: BufferId) {
        let buffer = self.bufs.remove(&buf);
        debug_assert!(buffer.is_some(), "double free of device buffer");
        if let Some(buffer) = buffer {
            buffer.destroy();
        }
    }

    fn acquire_queue(&mut self) -> QueueId {
        let id = QueueId(self.next_queue);
        self.next_queue += 1;
        id
    }

    fn release_queue(&mut self, queue: QueueId) {
        debug_assert!(
            !self.encoders.contains_key(&queue),
            "queue released with unflushed work"
        );
        self.pending_signals.remove(&queue);
        self.pending_reads.remove(&queue);
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
        if byte == 0 {
            let buffer = self.bufs.get(&buf).expect("fill of freed buffer");
            // Borrow juggling: clear through a fresh encoder reference.
            let device = &self.device;
            let encoder = self.encoders.entry(queue).or_insert_with(|| {
                device.create_command_encoder(&CommandEncoderDescriptor { label: None })
            });
            encoder.clear_buffer(buffer, offset, Some(len));
        } else {
            self.staged_copy(queue, buf, offset, vec![byte; len as usize]);
        }
        self.defer_signal(queue, event);
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
        self.staged_copy(queue, buf, offset, bytes);
        self.defer_signal(queue, event);
        event
    }

    fn enqueue_read(&mut self, queue: QueueId, buf: BufferId, offset: u64, len: u64) -> EventId {
        let event = EventId::next();
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("read-back"),
            size: len.max(4).next_multiple_of(4),
            usage: BufferUsages::MAP_READ | BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let src = self.bufs.get(&buf).expect("read of freed buffer");
        let device = &self.device;
        let encoder = self.encoders.entry(queue).or_insert_with(|| {
            device.create_command_encoder(&CommandEncoderDescriptor { label: None })
        });
        encoder.copy_buffer_to_buffer(src, offset, &staging, 0, len.next_multiple_of(4));
        self.pending_reads
            .entry(queue)
            .or_default()
            .push((event, staging));
        event
    }

    fn enqueue_map(&mut self, queue: QueueId, buf: BufferId) -> EventId {
        let size = self.buf(buf).size();
        self.enqueue_read(queue, buf, 0, size)
    }

    fn enqueue_unmap(&mut self, queue: QueueId, buf: BufferId, bytes: Vec<u8>) -> EventId {
        self.enqueue_write(queue, buf, 0, bytes)
    }

    fn enqueue_kernel(
        &mut self,
        queue: QueueId,
        kernel: KernelId,
        global: u32,
        args: &[KernelArg],
    ) -> EventId {
        let event = EventId::next();
        if global == 0 {
            // An empty dispatch is invalid in wgpu; complete with the flush.
            self.defer_signal(queue, event);
            return event;
        }
        // Uniform args become transient uniform buffers; they must outlive
        // the bind group entries, so build them first.
        let uniforms: Vec<Buffer> = args
            .iter()
            .filter_map(|arg| match arg {
                KernelArg::Value(v) => Some(self.device.create_buffer_init(
                    &wgpu::util::BufferInitDescriptor {
                        label: None,
                        contents: &v.to_le_bytes(),
                        usage: BufferUsages::UNIFORM,
                    },
                )),
                KernelArg::Buffer(_) => None,
            })
            .collect();
        let kernel = &self.kernels[kernel.0 as usize];
        let mut uniform_it = uniforms.iter();
        let entries = args
            .iter()
            .enumerate()
            .map(|(i, arg)| wgpu::BindGroupEntry {
                binding: i as u32,
                resource: match arg {
                    KernelArg::Buffer(id) => self
                        .bufs
                        .get(id)
                        .expect("kernel arg buffer freed")
                        .as_entire_binding(),
                    KernelArg::Value(_) => uniform_it.next().unwrap().as_entire_binding(),
                },
            })
            .collect::<Vec<_>>();
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(kernel.label),
            layout: &kernel.bind_group_layout,
            entries: &entries,
        });
        let device = &self.device;
        let encoder = self.encoders.entry(queue).or_insert_with(|| {
            device.create_command_encoder(&CommandEncoderDescriptor { label: None })
        });
        {
            let mut cpass = encoder.begin_compute_pass(&ComputePassDescriptor::default());
            cpass.set_pipeline(&kernel.pipeline);
            cpass.set_bind_group(0, &bind_group, &[]);
            cpass.dispatch_workgroups(global, 1, 1);
        }
        self.defer_signal(queue, event);
        event
    }

    fn flush(&mut self, queue: QueueId) {
        let encoder = self.encoders.remove(&queue);
        let signals = self.pending_signals.remove(&queue).unwrap_or_default();
        let reads = self.pending_reads.remove(&queue).unwrap_or_default();
        if encoder.is_none() && signals.is_empty() && reads.is_empty() {
            return;
        }
        self.queue
            .submit(encoder.map(CommandEncoder::finish));
        if !signals.is_empty() {
            let sender = self.completions.clone();
            self.queue.on_submitted_work_done(move || {
                for event in signals {
                    sender.signal(event, None);
                }
            });
        }
        for (event, staging) in reads {
            let staging = Arc::new(staging);
            let mapped = staging.clone();
            let sender = self.completions.clone();
            staging
                .slice(..)
                .map_async(wgpu::MapMode::Read, move |result| {
                    result.expect("device read-back failed");
                    let bytes = mapped.slice(..).get_mapped_range().to_vec();
                    mapped.unmap();
                    sender.signal(event, Some(bytes));
                });
        }
    }

    fn drive(&mut self) {
        let _ = self.device.poll(wgpu::Maintain::Poll);
    }

    fn immediate_event(&mut self) -> EventId {
        let event = EventId::next();
        self.completions.signal(event, None);
        event
    }
}
