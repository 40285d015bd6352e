// Copyright 2026 the Skein Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The composition resource.
//!
//! A composition collects *place* commands (raster id, layer, translation)
//! in a host ring while unsealed. Sealing snapshots the ring to the device,
//! dispatches the place kernel (which expands each command into sort keys
//! and bumps the atomics) followed by the sort kernel, then reads the
//! atomics back so the host knows the placed-key count. The sealing grid is
//! what a render hangs its happens-after edge on.
//!
//! Unsealing starts a fresh placement epoch: the atomics are zeroed on both
//! sides and the next seal rebuilds the key extent from scratch.

use std::cell::RefCell;
use std::rc::Rc;

use bytemuck::{Pod, Zeroable};

use crate::backend::{BufferId, KernelArg, QueueId};
use crate::extent::{AtomicsExtent, DeviceExtent, HostRingExtent};
use crate::grid::GridId;
use crate::runtime::Runtime;
use crate::seal::{self, SealCore, SealState, Sealable, UseLock};
use crate::Result;

/// Bytes per sort key in the key extent.
const KEY_SIZE: u64 = 8;

/// One place command as the place kernel consumes it.
#[derive(Clone, Copy, Pod, Zeroable, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct PlaceCmd {
    pub raster: u32,
    pub layer: u32,
    pub tx: i32,
    pub ty: i32,
}

/// Device-maintained counters, read back at the end of each seal.
#[derive(Clone, Copy, Pod, Zeroable, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub(crate) struct CompositionAtomics {
    /// Placed-key count; zero means an empty scene.
    pub offsets: u32,
    pub keys: u32,
}

pub(crate) struct CompositionInner {
    core: SealCore,
    queue: QueueId,
    cmds: HostRingExtent<PlaceCmd>,
    keys: Option<DeviceExtent>,
    atomics: Option<AtomicsExtent<CompositionAtomics>>,
}

impl CompositionInner {
    fn keys(&self) -> &DeviceExtent {
        self.keys.as_ref().expect("composition torn down")
    }

    fn atomics(&self) -> &AtomicsExtent<CompositionAtomics> {
        self.atomics.as_ref().expect("composition torn down")
    }

    fn atomics_mut(&mut self) -> &mut AtomicsExtent<CompositionAtomics> {
        self.atomics.as_mut().expect("composition torn down")
    }

    pub(crate) fn keys_id(&self) -> BufferId {
        self.keys().id()
    }

    /// Placed-key count as of the last completed seal.
    pub(crate) fn placed(&self) -> u32 {
        self.atomics().host().offsets
    }

    pub(crate) fn grid(&self) -> Option<GridId> {
        self.core.grid()
    }
}

impl Sealable for CompositionInner {
    const LABEL: &'static str = "composition";

    fn core(&self) -> &SealCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut SealCore {
        &mut self.core
    }

    fn begin_seal(rt: &mut Runtime, res: &Rc<RefCell<Self>>, grid: GridId) -> Result<()> {
        let (snap, queue) = {
            let mut inner = res.borrow_mut();
            let snap = inner.cmds.snapshot();
            (snap, inner.queue)
        };
        let count = snap.count();
        if count == 0 {
            // Nothing placed this epoch; the key extent and atomics already
            // hold the (empty) sealed form.
            res.borrow_mut().cmds.release(snap);
            let event = rt.backend.immediate_event();
            rt.on_event(event, move |rt, _| rt.grid_complete(grid));
            return Ok(());
        }
        let (temp, _event) = {
            let inner = res.borrow();
            match inner.cmds.materialize(rt, &snap, queue, "composition-place-cmds") {
                Ok(v) => v,
                Err(err) => {
                    drop(inner);
                    res.borrow_mut().cmds.release(snap);
                    return Err(err);
                }
            }
        };
        // Same-queue submission order carries the snapshot transfer through
        // the kernels and into the read-back, so only the read-back's
        // completion needs a continuation.
        let read_event = {
            let inner = res.borrow();
            rt.backend.enqueue_kernel(
                queue,
                rt.config.place_kernel,
                count,
                &[
                    KernelArg::Buffer(temp.id()),
                    KernelArg::Buffer(inner.keys().id()),
                    KernelArg::Buffer(inner.atomics().id()),
                    KernelArg::Value(count),
                ],
            );
            rt.backend.enqueue_kernel(
                queue,
                rt.config.sort_kernel,
                count,
                &[
                    KernelArg::Buffer(inner.keys().id()),
                    KernelArg::Buffer(inner.atomics().id()),
                ],
            );
            inner.atomics().read_back(rt, queue)
        };
        rt.backend.flush(queue);
        let res = res.clone();
        rt.on_event(read_event, move |rt, payload| {
            let bytes = payload.expect("atomics read-back carried no payload");
            {
                let mut inner = res.borrow_mut();
                inner.atomics_mut().apply(&bytes);
                inner.cmds.release(snap);
                log::trace!("composition sealed with {} key(s)", inner.placed());
            }
            temp.free(rt);
            rt.grid_complete(grid);
        });
        Ok(())
    }

    fn begin_unseal(rt: &mut Runtime, res: &Rc<RefCell<Self>>) {
        let (event, queue) = {
            let mut inner = res.borrow_mut();
            let queue = inner.queue;
            let event = inner.atomics_mut().zero(rt, queue);
            (event, queue)
        };
        rt.backend.flush(queue);
        let res = res.clone();
        rt.on_event(event, move |_, _| {
            let mut inner = res.borrow_mut();
            inner
                .core
                .transition(SealState::Unsealed, CompositionInner::LABEL);
        });
    }

    fn teardown(rt: &mut Runtime, res: &Rc<RefCell<Self>>) {
        let (keys, atomics, queue) = {
            let mut inner = res.borrow_mut();
            (inner.keys.take(), inner.atomics.take(), inner.queue)
        };
        if let Some(keys) = keys {
            keys.free(rt);
        }
        if let Some(atomics) = atomics {
            atomics.free(rt);
        }
        rt.backend.release_queue(queue);
    }
}

/// Handle to a composition. Clone it only through [`retain`](Self::retain);
/// every handle must be consumed by [`release`](Self::release).
pub struct Composition {
    inner: Rc<RefCell<CompositionInner>>,
}

impl Composition {
    /// Allocate a composition sized by the runtime's [`Config`] and unseal
    /// it, returning it host-writable.
    ///
    /// [`Config`]: crate::runtime::Config
    pub fn new(rt: &mut Runtime) -> Result<Self> {
        debug_assert!(
            rt.config.place_ring <= rt.config.keys,
            "place ring cannot outgrow the key extent"
        );
        let keys = DeviceExtent::alloc(
            rt,
            u64::from(rt.config.keys) * KEY_SIZE,
            "composition-keys",
        )?;
        let atomics = match AtomicsExtent::alloc(rt, "composition-atomics") {
            Ok(atomics) => atomics,
            Err(err) => {
                keys.free(rt);
                return Err(err);
            }
        };
        let queue = rt.backend.acquire_queue();
        let place_ring = rt.config.place_ring;
        let composition = Self {
            inner: Rc::new(RefCell::new(CompositionInner {
                core: SealCore::new(SealState::Sealed),
                queue,
                cmds: HostRingExtent::new(place_ring),
                keys: Some(keys),
                atomics: Some(atomics),
            })),
        };
        composition.unseal(rt, true);
        Ok(composition)
    }

    /// Append a place command. Legal only while unsealed; a full ring is
    /// backpressure, not corruption.
    pub fn place(&self, raster: u32, layer: u32, tx: i32, ty: i32) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        inner.core.ensure_unsealed()?;
        inner.cmds.push(PlaceCmd {
            raster,
            layer,
            tx,
            ty,
        })
    }

    /// Drop every command placed this epoch. Legal only while unsealed.
    pub fn reset(&self, rt: &mut Runtime) -> Result<()> {
        let (event, queue) = {
            let mut inner = self.inner.borrow_mut();
            inner.core.ensure_unsealed()?;
            inner.cmds.clear();
            let queue = inner.queue;
            let event = inner.atomics_mut().zero(rt, queue);
            (event, queue)
        };
        rt.backend.flush(queue);
        // The state does not change; no continuation needed.
        let _ = event;
        Ok(())
    }

    /// Begin sealing: commit this epoch's commands and sort the key extent.
    /// Returns once the work is submitted; completion is observed through
    /// the sealing grid.
    pub fn seal(&self, rt: &mut Runtime) -> Result<()> {
        seal::seal(rt, &self.inner)
    }

    /// Make the composition host-writable again, starting a new placement
    /// epoch.
    pub fn unseal(&self, rt: &mut Runtime, block: bool) {
        seal::unseal(rt, &self.inner, block);
    }

    pub fn retain(&self) -> Self {
        seal::retain(&self.inner);
        Self {
            inner: self.inner.clone(),
        }
    }

    /// Consume this handle; the last release seals, quiesces, and frees the
    /// composition.
    pub fn release(self, rt: &mut Runtime) -> Result<()> {
        seal::release(rt, &self.inner)
    }

    pub fn state(&self) -> SealState {
        self.inner.borrow().core().state()
    }

    /// Placed-key count as of the last completed seal.
    pub fn placed(&self) -> u32 {
        self.inner.borrow().placed()
    }

    pub(crate) fn retain_and_lock(&self, rt: &Runtime) -> UseLock {
        seal::retain_and_lock(rt, &self.inner)
    }

    pub(crate) fn inner(&self) -> &Rc<RefCell<CompositionInner>> {
        &self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::test_runtime;
    use crate::runtime::testing::mock;
    use crate::Error;

    fn pump_until(rt: &mut Runtime, comp: &Composition, state: SealState) {
        rt.pump_while(|| comp.state() != state);
    }

    #[test]
    fn seal_places_and_sorts_keys() {
        let mut rt = test_runtime();
        let comp = Composition::new(&mut rt).unwrap();
        assert_eq!(comp.state(), SealState::Unsealed);
        comp.place(30, 2, 0, 0).unwrap();
        comp.place(10, 1, 5, -3).unwrap();
        comp.place(20, 1, 0, 0).unwrap();
        comp.seal(&mut rt).unwrap();
        pump_until(&mut rt, &comp, SealState::Sealed);
        assert_eq!(comp.placed(), 3);
        let keys_id = comp.inner().borrow().keys_id();
        let keys = mock(&rt).buffer(keys_id);
        let rasters: Vec<u32> = keys[..24]
            .chunks_exact(8)
            .map(|k| u32::from_le_bytes(k[0..4].try_into().unwrap()))
            .collect();
        assert_eq!(rasters, &[10, 20, 30], "keys not in sorted order");
        comp.release(&mut rt).unwrap();
    }

    #[test]
    fn empty_seal_launches_no_kernels() {
        let mut rt = test_runtime();
        let comp = Composition::new(&mut rt).unwrap();
        let before = mock(&rt).kernels_launched;
        comp.seal(&mut rt).unwrap();
        pump_until(&mut rt, &comp, SealState::Sealed);
        assert_eq!(comp.placed(), 0);
        assert_eq!(mock(&rt).kernels_launched, before);
        comp.release(&mut rt).unwrap();
    }

    #[test]
    fn place_while_sealed_is_an_error() {
        let mut rt = test_runtime();
        let comp = Composition::new(&mut rt).unwrap();
        comp.seal(&mut rt).unwrap();
        pump_until(&mut rt, &comp, SealState::Sealed);
        assert!(matches!(
            comp.place(1, 0, 0, 0),
            Err(Error::NotUnsealed(SealState::Sealed))
        ));
        comp.release(&mut rt).unwrap();
    }

    #[test]
    fn full_place_ring_is_backpressure() {
        let mut rt = test_runtime();
        let comp = Composition::new(&mut rt).unwrap();
        for i in 0..rt.config.place_ring {
            comp.place(i, 0, 0, 0).unwrap();
        }
        assert!(matches!(
            comp.place(99, 0, 0, 0),
            Err(Error::RingFull { .. })
        ));
        comp.seal(&mut rt).unwrap();
        pump_until(&mut rt, &comp, SealState::Sealed);
        assert_eq!(comp.placed(), rt.config.place_ring);
        comp.release(&mut rt).unwrap();
    }

    #[test]
    fn unseal_starts_a_fresh_epoch() {
        let mut rt = test_runtime();
        let comp = Composition::new(&mut rt).unwrap();
        comp.place(1, 0, 0, 0).unwrap();
        comp.place(2, 0, 0, 0).unwrap();
        comp.seal(&mut rt).unwrap();
        pump_until(&mut rt, &comp, SealState::Sealed);
        assert_eq!(comp.placed(), 2);
        comp.unseal(&mut rt, true);
        assert_eq!(comp.placed(), 0);
        comp.place(7, 0, 0, 0).unwrap();
        comp.seal(&mut rt).unwrap();
        pump_until(&mut rt, &comp, SealState::Sealed);
        assert_eq!(comp.placed(), 1);
        comp.release(&mut rt).unwrap();
    }

    #[test]
    fn reset_discards_pending_places() {
        let mut rt = test_runtime();
        let comp = Composition::new(&mut rt).unwrap();
        comp.place(1, 0, 0, 0).unwrap();
        comp.place(2, 0, 0, 0).unwrap();
        comp.reset(&mut rt).unwrap();
        rt.pump();
        comp.seal(&mut rt).unwrap();
        pump_until(&mut rt, &comp, SealState::Sealed);
        assert_eq!(comp.placed(), 0);
        comp.release(&mut rt).unwrap();
    }
}
