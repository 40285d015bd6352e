// Copyright 2026 the Skein Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The styling resource.
//!
//! Styling is one durable device table describing how layers compose:
//! a run of per-layer words, a run of per-group words, then optional extra
//! command words. While unsealed the producer writes a host shadow of the
//! table; sealing commits the shadow to the device in a single unmap, and
//! unsealing maps the device table back so edits pick up where they left
//! off. Unlike a composition, the table's contents survive the cycle.

use std::cell::RefCell;
use std::rc::Rc;

use peniko::Color;

use crate::backend::{BufferId, QueueId};
use crate::extent::{DeviceExtent, HostExtent};
use crate::grid::GridId;
use crate::runtime::Runtime;
use crate::seal::{self, SealCore, SealState, Sealable, UseLock};
use crate::{Error, Result};

/// Words per layer entry: parent group, fill command.
const LAYER_WORDS: u32 = 2;
/// Words per group entry: layer range lo, layer range hi (inclusive).
const GROUP_WORDS: u32 = 2;

pub(crate) struct StylingInner {
    core: SealCore,
    queue: QueueId,
    table: Option<DeviceExtent>,
    /// Host shadow of the table, valid while unsealed.
    shadow: HostExtent<u32>,
    layers: u32,
    groups: u32,
    groups_used: u32,
}

impl StylingInner {
    fn table(&self) -> &DeviceExtent {
        self.table.as_ref().expect("styling torn down")
    }

    pub(crate) fn table_id(&self) -> BufferId {
        self.table().id()
    }

    pub(crate) fn grid(&self) -> Option<GridId> {
        self.core.grid()
    }

    fn layer_word(&self, layer: u32) -> Result<usize> {
        if layer >= self.layers {
            return Err(Error::StylingFull("layers"));
        }
        Ok((layer * LAYER_WORDS) as usize)
    }

    fn group_word(&self, group: u32) -> Result<usize> {
        if group >= self.groups_used {
            return Err(Error::StylingFull("groups"));
        }
        Ok((self.layers * LAYER_WORDS + group * GROUP_WORDS) as usize)
    }
}

impl Sealable for StylingInner {
    const LABEL: &'static str = "styling";

    fn core(&self) -> &SealCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut SealCore {
        &mut self.core
    }

    fn begin_seal(rt: &mut Runtime, res: &Rc<RefCell<Self>>, grid: GridId) -> Result<()> {
        let (event, queue) = {
            let inner = res.borrow();
            let event = rt.backend.enqueue_unmap(
                inner.queue,
                inner.table().id(),
                inner.shadow.as_bytes().to_vec(),
            );
            (event, inner.queue)
        };
        rt.backend.flush(queue);
        rt.on_event(event, move |rt, _| rt.grid_complete(grid));
        Ok(())
    }

    fn begin_unseal(rt: &mut Runtime, res: &Rc<RefCell<Self>>) {
        let (event, queue) = {
            let inner = res.borrow();
            let event = rt.backend.enqueue_map(inner.queue, inner.table().id());
            (event, inner.queue)
        };
        rt.backend.flush(queue);
        let res = res.clone();
        rt.on_event(event, move |_, payload| {
            let bytes = payload.expect("styling map carried no payload");
            let mut inner = res.borrow_mut();
            inner.shadow.copy_from_bytes(&bytes);
            inner
                .core
                .transition(SealState::Unsealed, StylingInner::LABEL);
        });
    }

    fn teardown(rt: &mut Runtime, res: &Rc<RefCell<Self>>) {
        let (table, queue) = {
            let mut inner = res.borrow_mut();
            (inner.table.take(), inner.queue)
        };
        if let Some(table) = table {
            table.free(rt);
        }
        rt.backend.release_queue(queue);
    }
}

/// Handle to a styling table. Clone it only through
/// [`retain`](Self::retain); every handle must be consumed by
/// [`release`](Self::release).
pub struct Styling {
    inner: Rc<RefCell<StylingInner>>,
}

impl Styling {
    /// Allocate a styling table with room for `layers` layer entries,
    /// `groups` group entries, and `extras` trailing command words.
    /// The table starts unsealed and zero-filled.
    pub fn new(rt: &mut Runtime, layers: u32, groups: u32, extras: u32) -> Result<Self> {
        let words = layers * LAYER_WORDS + groups * GROUP_WORDS + extras;
        let table = DeviceExtent::alloc(rt, u64::from(words) * 4, "styling-table")?;
        let queue = rt.backend.acquire_queue();
        Ok(Self {
            inner: Rc::new(RefCell::new(StylingInner {
                core: SealCore::new(SealState::Unsealed),
                queue,
                table: Some(table),
                shadow: HostExtent::new(words as usize),
                layers,
                groups,
                groups_used: 0,
            })),
        })
    }

    /// Claim the next group slot.
    pub fn group_alloc(&self) -> Result<u32> {
        let mut inner = self.inner.borrow_mut();
        inner.core.ensure_unsealed()?;
        if inner.groups_used == inner.groups {
            return Err(Error::StylingFull("groups"));
        }
        let group = inner.groups_used;
        inner.groups_used += 1;
        Ok(group)
    }

    /// Set a group's inclusive layer range.
    pub fn group_range(&self, group: u32, lo: u32, hi: u32) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        inner.core.ensure_unsealed()?;
        let word = inner.group_word(group)?;
        let shadow = inner.shadow.as_mut_slice();
        shadow[word] = lo;
        shadow[word + 1] = hi;
        Ok(())
    }

    /// Give a layer a solid fill, recorded as a premultiplied RGBA word.
    pub fn layer_fill_solid(&self, layer: u32, group: u32, color: Color) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        inner.core.ensure_unsealed()?;
        if group >= inner.groups_used {
            return Err(Error::StylingFull("groups"));
        }
        let word = inner.layer_word(layer)?;
        let shadow = inner.shadow.as_mut_slice();
        shadow[word] = group;
        shadow[word + 1] = color.to_premul_u32();
        Ok(())
    }

    /// Begin sealing: commit the host shadow to the device table.
    pub fn seal(&self, rt: &mut Runtime) -> Result<()> {
        seal::seal(rt, &self.inner)
    }

    /// Map the device table back for further edits.
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
    /// table.
    pub fn release(self, rt: &mut Runtime) -> Result<()> {
        seal::release(rt, &self.inner)
    }

    pub fn state(&self) -> SealState {
        self.inner.borrow().core().state()
    }

    pub(crate) fn retain_and_lock(&self, rt: &Runtime) -> UseLock {
        seal::retain_and_lock(rt, &self.inner)
    }

    pub(crate) fn inner(&self) -> &Rc<RefCell<StylingInner>> {
        &self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::GridTask;
    use crate::runtime::test_runtime;
    use crate::runtime::testing::mock;
    use std::cell::Cell;

    struct Probe {
        ran: Rc<Cell<bool>>,
    }

    impl GridTask for Probe {
        fn execute(&mut self, rt: &mut Runtime, grid: GridId) {
            self.ran.set(true);
            rt.grid_complete(grid);
        }
    }

    #[test]
    fn seal_commits_the_shadow() {
        let mut rt = test_runtime();
        let styling = Styling::new(&mut rt, 4, 2, 0).unwrap();
        let group = styling.group_alloc().unwrap();
        styling.group_range(group, 0, 3).unwrap();
        styling
            .layer_fill_solid(0, group, Color::rgb8(255, 0, 0))
            .unwrap();
        styling.seal(&mut rt).unwrap();
        rt.pump_while(|| styling.state() != SealState::Sealed);
        let table_id = styling.inner().borrow().table_id();
        let table: Vec<u32> = mock(&rt)
            .buffer(table_id)
            .chunks_exact(4)
            .map(|w| u32::from_le_bytes(w.try_into().unwrap()))
            .collect();
        assert_eq!(table[0], group);
        assert_eq!(table[1], Color::rgb8(255, 0, 0).to_premul_u32());
        // Group words sit after the 4 layer entries.
        assert_eq!(&table[8..10], &[0, 3]);
        styling.release(&mut rt).unwrap();
    }

    #[test]
    fn sealing_grid_satisfies_a_dependent_only_after_the_transition() {
        let mut rt = test_runtime();
        let styling = Styling::new(&mut rt, 4, 2, 0).unwrap();
        styling.seal(&mut rt).unwrap();
        let sealing_grid = styling.inner().borrow().grid().expect("no sealing grid");
        let ran = Rc::new(Cell::new(false));
        let dependent = rt.grid_create(Probe { ran: ran.clone() });
        rt.grid_happens_after(dependent, sealing_grid);
        rt.grid_start(dependent, false);
        assert_ne!(styling.state(), SealState::Sealed);
        assert!(!ran.get());
        rt.pump_while(|| styling.state() != SealState::Sealed);
        rt.pump();
        assert!(ran.get(), "dependent never became eligible");
        styling.release(&mut rt).unwrap();
    }

    #[test]
    fn unseal_round_trips_the_table() {
        let mut rt = test_runtime();
        let styling = Styling::new(&mut rt, 2, 1, 0).unwrap();
        let group = styling.group_alloc().unwrap();
        styling
            .layer_fill_solid(1, group, Color::rgb8(0, 255, 0))
            .unwrap();
        styling.seal(&mut rt).unwrap();
        rt.pump_while(|| styling.state() != SealState::Sealed);
        styling.unseal(&mut rt, true);
        // Contents survive the cycle; keep editing where we left off.
        assert_eq!(
            styling.inner().borrow().shadow.as_slice()[3],
            Color::rgb8(0, 255, 0).to_premul_u32()
        );
        styling
            .layer_fill_solid(0, group, Color::rgb8(0, 0, 255))
            .unwrap();
        styling.release(&mut rt).unwrap();
    }

    #[test]
    fn group_capacity_is_enforced() {
        let mut rt = test_runtime();
        let styling = Styling::new(&mut rt, 4, 2, 0).unwrap();
        styling.group_alloc().unwrap();
        styling.group_alloc().unwrap();
        assert!(matches!(
            styling.group_alloc(),
            Err(Error::StylingFull("groups"))
        ));
        styling.release(&mut rt).unwrap();
    }

    #[test]
    fn edits_while_sealed_are_an_error() {
        let mut rt = test_runtime();
        let styling = Styling::new(&mut rt, 4, 2, 0).unwrap();
        let group = styling.group_alloc().unwrap();
        styling.seal(&mut rt).unwrap();
        rt.pump_while(|| styling.state() != SealState::Sealed);
        assert!(matches!(
            styling.layer_fill_solid(0, group, Color::BLACK),
            Err(Error::NotUnsealed(SealState::Sealed))
        ));
        styling.release(&mut rt).unwrap();
    }
}
