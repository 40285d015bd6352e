// Copyright 2026 the Skein Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Grid dependency graph.
//!
//! A grid is one schedulable, asynchronously-completed unit of device work.
//! Happens-after edges are the only ordering primitive: a started grid
//! becomes eligible once every predecessor has completed, at which point the
//! scheduler invokes its task. Completion notifies dependents, disposes the
//! task, and recycles the node's slot. Cancellation is unsupported; a
//! started grid always runs to completion.
//!
//! Nodes live in a slot arena with generation counters so that a handle to a
//! disposed grid degrades into a no-op edge rather than reaching a recycled
//! node.

use smallvec::SmallVec;

use crate::runtime::Runtime;

/// Handle to a grid node. Stale handles (to disposed grids) are valid
/// arguments everywhere and behave as "already complete".
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct GridId {
    index: u32,
    gen: u32,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum GridState {
    /// Allocated; edges may still be added.
    Created,
    /// `start` called; waiting for predecessors.
    Started,
    /// Task invoked; device work in flight.
    Executing,
    /// Done. The node is disposed immediately after dependents are notified.
    Complete,
}

/// The work a grid performs, plus its payload.
///
/// `execute` submits (or finishes) the grid's device work; it must arrange
/// for [`Runtime::grid_complete`] to be called exactly once, directly for
/// synchronous work or from a completion continuation otherwise. `dispose`
/// consumes the task after completion and frees whatever the payload owns.
pub trait GridTask {
    fn execute(&mut self, rt: &mut Runtime, grid: GridId);

    fn dispose(self: Box<Self>, rt: &mut Runtime) {
        let _ = rt;
    }
}

struct Node {
    gen: u32,
    state: GridState,
    /// Predecessors not yet complete.
    waiting: u32,
    dependents: SmallVec<[GridId; 4]>,
    task: Option<Box<dyn GridTask>>,
}

#[derive(Default)]
pub(crate) struct Grids {
    nodes: Vec<Node>,
    free: Vec<u32>,
}

impl Grids {
    fn get_mut(&mut self, id: GridId) -> Option<&mut Node> {
        let node = self.nodes.get_mut(id.index as usize)?;
        (node.gen == id.gen).then_some(node)
    }

    fn get(&self, id: GridId) -> Option<&Node> {
        let node = self.nodes.get(id.index as usize)?;
        (node.gen == id.gen).then_some(node)
    }
}

impl Runtime {
    /// Allocate a grid in state [`GridState::Created`].
    pub fn grid_create(&mut self, task: impl GridTask + 'static) -> GridId {
        let task: Option<Box<dyn GridTask>> = Some(Box::new(task));
        match self.grids.free.pop() {
            Some(index) => {
                let node = &mut self.grids.nodes[index as usize];
                node.state = GridState::Created;
                node.waiting = 0;
                node.dependents.clear();
                node.task = task;
                GridId {
                    index,
                    gen: node.gen,
                }
            }
            None => {
                let index = self.grids.nodes.len() as u32;
                self.grids.nodes.push(Node {
                    gen: 0,
                    state: GridState::Created,
                    waiting: 0,
                    dependents: SmallVec::new(),
                    task,
                });
                GridId { index, gen: 0 }
            }
        }
    }

    /// Add a happens-after edge: `grid` will not execute until `after` has
    /// completed. Valid only before `grid` is started. An edge to a grid
    /// that already completed (or was disposed) is a no-op.
    pub fn grid_happens_after(&mut self, grid: GridId, after: GridId) {
        debug_assert!(
            self.grids
                .get(grid)
                .is_some_and(|n| n.state == GridState::Created),
            "edges may only be added before start"
        );
        let Some(pred) = self.grids.get_mut(after) else {
            return;
        };
        if pred.state == GridState::Complete {
            return;
        }
        pred.dependents.push(grid);
        if let Some(node) = self.grids.get_mut(grid) {
            node.waiting += 1;
        }
    }

    /// Start a grid.
    ///
    /// With `force`, the task begins immediately; producers with no real
    /// dependencies, such as a seal, use it. Otherwise the grid enters
    /// [`GridState::Started`] and the scheduler invokes its task once all
    /// predecessors are complete.
    pub fn grid_start(&mut self, grid: GridId, force: bool) {
        let node = self.grids.get_mut(grid).expect("start of a disposed grid");
        debug_assert_eq!(node.state, GridState::Created, "grid started twice");
        if force {
            node.state = GridState::Executing;
            log::trace!("grid {grid:?} force-started");
            self.run_grid(grid);
            return;
        }
        node.state = GridState::Started;
        if node.waiting == 0 {
            self.defer(Box::new(move |rt| rt.run_grid(grid)));
        }
    }

    /// Mark a grid's device work finished.
    ///
    /// Called from its task: directly for synchronous work, or from a
    /// completion continuation re-entering the scheduler. Dependents are
    /// notified and the node is disposed on the next drain.
    pub fn grid_complete(&mut self, grid: GridId) {
        debug_assert!(
            self.grids
                .get(grid)
                .is_some_and(|n| n.state == GridState::Executing),
            "complete on a grid that is not executing"
        );
        self.defer(Box::new(move |rt| rt.finish_grid(grid)));
    }

    /// Current state, or `None` for a disposed grid.
    pub fn grid_state(&self, grid: GridId) -> Option<GridState> {
        self.grids.get(grid).map(|n| n.state)
    }

    fn run_grid(&mut self, grid: GridId) {
        let Some(node) = self.grids.get_mut(grid) else {
            return;
        };
        debug_assert!(matches!(
            node.state,
            GridState::Started | GridState::Executing
        ));
        node.state = GridState::Executing;
        let mut task = node.task.take().expect("grid task missing");
        log::trace!("grid {grid:?} executing");
        task.execute(self, grid);
        if let Some(node) = self.grids.get_mut(grid) {
            node.task = Some(task);
        }
    }

    fn finish_grid(&mut self, grid: GridId) {
        let Some(node) = self.grids.get_mut(grid) else {
            debug_assert!(false, "completion of a disposed grid");
            return;
        };
        node.state = GridState::Complete;
        let dependents = std::mem::take(&mut node.dependents);
        let task = node.task.take();
        log::trace!("grid {grid:?} complete, {} dependent(s)", dependents.len());
        for dep in dependents {
            if let Some(node) = self.grids.get_mut(dep) {
                debug_assert!(node.waiting > 0);
                node.waiting -= 1;
                if node.waiting == 0 && node.state == GridState::Started {
                    self.defer(Box::new(move |rt| rt.run_grid(dep)));
                }
            }
        }
        if let Some(task) = task {
            task.dispose(self);
        }
        // Recycle the slot; stale handles are fenced by the generation.
        if let Some(node) = self.grids.get_mut(grid) {
            node.gen = node.gen.wrapping_add(1);
            self.grids.free.push(grid.index);
        }
    }
}
