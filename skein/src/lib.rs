// Copyright 2026 the Skein Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Skein is the execution core of a GPU-compute 2d vector renderer.
//!
//! It owns the machinery between a scene-building front end and a compute
//! device: typed memory [extents](extent) over ring allocators, a [grid]
//! dependency graph scheduling asynchronous device work, the seal/unseal
//! lifecycle that toggles the [`Composition`] and [`Styling`] resources
//! between host-writable and device-consumable, and [`Surface`] render
//! orchestration tying it all together. The pipeline kernels themselves
//! (place, sort, render) are opaque to this crate; a [`Config`] names them
//! and the [`backend`] dispatches them.
//!
//! The concurrency model is deliberately narrow: one host scheduler
//! processes every state transition, device completions arrive as messages
//! on a channel, and the only blocking points are the explicit pumps inside
//! the synchronous seal/unseal/release entry points. Happens-after edges
//! between grids are the sole ordering primitive.
//!
//! ## Getting started
//!
//! ```ignore
//! let (tx, rx) = skein::backend::completion_channel();
//! let backend: Box<dyn skein::backend::DeviceBackend> = ...;
//! let mut rt = skein::Runtime::new(backend, rx, config);
//!
//! let styling = skein::Styling::new(&mut rt, layers, groups, 0)?;
//! let group = styling.group_alloc()?;
//! styling.layer_fill_solid(0, group, peniko::Color::BLACK)?;
//!
//! let composition = skein::Composition::new(&mut rt)?;
//! composition.place(raster_id, 0, 0, 0)?;
//!
//! let surface = skein::Surface::new(&mut rt);
//! surface.render(&mut rt, clip, &styling, &composition, &target, None)?;
//! rt.pump();
//! ```

#![warn(unused_crate_dependencies)]
#![warn(clippy::print_stdout, clippy::print_stderr)]

mod composition;
mod extent;
mod grid;
mod ring;
mod runtime;
mod sched;
mod seal;
mod styling;
mod surface;

pub mod backend;

pub use peniko;

pub use composition::{Composition, PlaceCmd};
pub use extent::{AtomicsExtent, DeviceExtent, HostExtent, HostRingExtent, RingSnapshot, TempDeviceExtent};
pub use grid::{GridId, GridState, GridTask};
pub use ring::Ring;
pub use runtime::{Config, Runtime};
pub use seal::{SealState, UseLock};
pub use styling::Styling;
pub use surface::{Clip, RenderCallback, Surface};

/// Errors that can occur in Skein.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// A device allocation failed, which is fatal to the operation that
    /// needed the buffer.
    #[error("device allocation of {size} bytes for '{name}' failed")]
    DeviceAlloc { name: &'static str, size: u64 },
    /// A ring had fewer free slots than the caller asked for. Backpressure:
    /// seal the resource (releasing the ring's live window) and retry.
    #[error("ring full: {requested} slot(s) requested of a capacity of {capacity}")]
    RingFull { requested: u32, capacity: u32 },
    /// A producer operation was called outside the `Unsealed` state.
    #[error("operation requires an unsealed resource, state was {0:?}")]
    NotUnsealed(SealState),
    /// A styling table ran out of the named entry kind.
    #[error("styling table has no free {0}")]
    StylingFull(&'static str),
}

/// Specialization of `Result` for Skein-related errors.
pub type Result<T, E = Error> = std::result::Result<T, E>;
