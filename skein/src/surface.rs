// Copyright 2026 the Skein Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Surface render orchestration.
//!
//! A render is a transient request: seal both resources, take a use lock on
//! each, and hang a render grid off their sealing grids with happens-after
//! edges. Once eligible, the grid submits the render kernel against the
//! styling table, the sorted key extent, and the caller's target buffer,
//! or, for an empty scene, finishes on the spot without touching the
//! device. Completion invokes the caller's callback, drops both locks, and
//! completes the grid, which frees the request.

use std::cell::RefCell;
use std::rc::Rc;

use crate::backend::{BufferId, KernelArg, QueueId};
use crate::composition::{Composition, CompositionInner};
use crate::extent::DeviceExtent;
use crate::grid::{GridId, GridTask};
use crate::runtime::Runtime;
use crate::seal::UseLock;
use crate::styling::{Styling, StylingInner};
use crate::Result;

/// Render region in target pixels, half-open on the high edges.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Clip {
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
}

/// Invoked on the scheduler once a render's device work has completed.
pub type RenderCallback = Box<dyn FnOnce(&mut Runtime)>;

struct RenderRequest {
    clip: Clip,
    queue: QueueId,
    styling: Rc<RefCell<StylingInner>>,
    composition: Rc<RefCell<CompositionInner>>,
    target: BufferId,
    callback: Option<RenderCallback>,
    /// Held for the lifetime of the request; dropping them releases the
    /// resources on the scheduler.
    locks: (UseLock, UseLock),
}

impl RenderRequest {
    fn finish(self, rt: &mut Runtime, grid: GridId) {
        if let Some(callback) = self.callback {
            callback(rt);
        }
        drop(self.locks);
        rt.grid_complete(grid);
    }
}

struct RenderTask {
    request: Option<RenderRequest>,
}

impl GridTask for RenderTask {
    fn execute(&mut self, rt: &mut Runtime, grid: GridId) {
        let request = self.request.take().expect("render grid ran twice");
        let placed = request.composition.borrow().placed();
        if placed == 0 {
            // Empty scene: complete without any device submission.
            log::trace!("render of an empty scene, skipping submission");
            request.finish(rt, grid);
            return;
        }
        let event = {
            let styling = request.styling.borrow();
            let composition = request.composition.borrow();
            rt.backend.enqueue_kernel(
                request.queue,
                rt.config.render_kernel,
                placed,
                &[
                    KernelArg::Buffer(styling.table_id()),
                    KernelArg::Buffer(composition.keys_id()),
                    KernelArg::Buffer(request.target),
                    KernelArg::Value(request.clip.x0),
                    KernelArg::Value(request.clip.y0),
                    KernelArg::Value(request.clip.x1),
                    KernelArg::Value(request.clip.y1),
                ],
            )
        };
        rt.backend.flush(request.queue);
        rt.on_event(event, move |rt, _| request.finish(rt, grid));
    }
}

/// A render target's scheduling surface: owns the queue renders submit on.
pub struct Surface {
    queue: QueueId,
}

impl Surface {
    pub fn new(rt: &mut Runtime) -> Self {
        Self {
            queue: rt.backend.acquire_queue(),
        }
    }

    pub fn release(self, rt: &mut Runtime) {
        rt.backend.release_queue(self.queue);
    }

    /// Render a composition through a styling table into `target`.
    ///
    /// Seals both resources as needed; a failed seal aborts the render with
    /// no locks taken. Returns once the render grid is started; the
    /// `callback` runs on the scheduler after the device work (if any)
    /// completes.
    pub fn render(
        &self,
        rt: &mut Runtime,
        clip: Clip,
        styling: &Styling,
        composition: &Composition,
        target: &DeviceExtent,
        callback: Option<RenderCallback>,
    ) -> Result<()> {
        styling.seal(rt)?;
        composition.seal(rt)?;
        let locks = (styling.retain_and_lock(rt), composition.retain_and_lock(rt));
        let request = RenderRequest {
            clip,
            queue: self.queue,
            styling: styling.inner().clone(),
            composition: composition.inner().clone(),
            target: target.id(),
            callback,
            locks,
        };
        let grid = rt.grid_create(RenderTask {
            request: Some(request),
        });
        if let Some(after) = styling.inner().borrow().grid() {
            rt.grid_happens_after(grid, after);
        }
        if let Some(after) = composition.inner().borrow().grid() {
            rt.grid_happens_after(grid, after);
        }
        rt.grid_start(grid, false);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::test_runtime;
    use crate::runtime::testing::mock;
    use crate::seal::Sealable;
    use peniko::Color;
    use std::cell::Cell;

    fn scene(rt: &mut Runtime) -> (Styling, Composition) {
        let styling = Styling::new(rt, 4, 2, 0).unwrap();
        let group = styling.group_alloc().unwrap();
        styling.group_range(group, 0, 3).unwrap();
        styling
            .layer_fill_solid(0, group, Color::rgb8(255, 255, 255))
            .unwrap();
        let composition = Composition::new(rt).unwrap();
        (styling, composition)
    }

    #[test]
    fn render_waits_for_both_seals_and_stamps_the_target() {
        let mut rt = test_runtime();
        let (styling, composition) = scene(&mut rt);
        composition.place(3, 0, 0, 0).unwrap();
        composition.place(1, 0, 4, 4).unwrap();
        let target = DeviceExtent::alloc(&mut rt, 16, "target").unwrap();
        let surface = Surface::new(&mut rt);
        let done = Rc::new(Cell::new(false));
        let flag = done.clone();
        surface
            .render(
                &mut rt,
                Clip {
                    x0: 0,
                    y0: 0,
                    x1: 4,
                    y1: 4,
                },
                &styling,
                &composition,
                &target,
                Some(Box::new(move |_| flag.set(true))),
            )
            .unwrap();
        rt.pump_while(|| !done.get());
        let stamped = u32::from_le_bytes(mock(&rt).buffer(target.id())[0..4].try_into().unwrap());
        assert_eq!(stamped, 2, "render kernel did not see the placed count");
        rt.pump();
        assert_eq!(styling.inner().borrow().core().lock_count(), 0);
        assert_eq!(composition.inner().borrow().core().lock_count(), 0);
        target.free(&mut rt);
        surface.release(&mut rt);
        styling.release(&mut rt).unwrap();
        composition.release(&mut rt).unwrap();
    }

    #[test]
    fn empty_scene_completes_without_a_kernel() {
        let mut rt = test_runtime();
        let (styling, composition) = scene(&mut rt);
        let target = DeviceExtent::alloc(&mut rt, 16, "target").unwrap();
        let surface = Surface::new(&mut rt);
        let fired = Rc::new(Cell::new(0u32));
        let counter = fired.clone();
        let kernels_before = mock(&rt).kernels_launched;
        surface
            .render(
                &mut rt,
                Clip {
                    x0: 0,
                    y0: 0,
                    x1: 4,
                    y1: 4,
                },
                &styling,
                &composition,
                &target,
                Some(Box::new(move |_| counter.set(counter.get() + 1))),
            )
            .unwrap();
        rt.pump_while(|| fired.get() == 0);
        rt.pump();
        assert_eq!(fired.get(), 1);
        // Styling still seals (one commit kernel-free unmap); the render
        // itself must not have dispatched.
        assert_eq!(mock(&rt).kernels_launched, kernels_before);
        assert_eq!(styling.inner().borrow().core().lock_count(), 0);
        assert_eq!(composition.inner().borrow().core().lock_count(), 0);
        target.free(&mut rt);
        surface.release(&mut rt);
        styling.release(&mut rt).unwrap();
        composition.release(&mut rt).unwrap();
    }

    #[test]
    fn back_to_back_renders_share_the_sealed_resources() {
        let mut rt = test_runtime();
        let (styling, composition) = scene(&mut rt);
        composition.place(1, 0, 0, 0).unwrap();
        let target = DeviceExtent::alloc(&mut rt, 16, "target").unwrap();
        let surface = Surface::new(&mut rt);
        let fired = Rc::new(Cell::new(0u32));
        for _ in 0..2 {
            let counter = fired.clone();
            surface
                .render(
                    &mut rt,
                    Clip {
                        x0: 0,
                        y0: 0,
                        x1: 1,
                        y1: 1,
                    },
                    &styling,
                    &composition,
                    &target,
                    Some(Box::new(move |_| counter.set(counter.get() + 1))),
                )
                .unwrap();
        }
        rt.pump_while(|| fired.get() < 2);
        rt.pump();
        assert_eq!(fired.get(), 2);
        assert_eq!(styling.inner().borrow().core().lock_count(), 0);
        target.free(&mut rt);
        surface.release(&mut rt);
        styling.release(&mut rt).unwrap();
        composition.release(&mut rt).unwrap();
    }
}
