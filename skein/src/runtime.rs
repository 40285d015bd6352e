// Copyright 2026 the Skein Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The runtime context.
//!
//! Every operation in this crate takes an explicit `&mut Runtime`: the
//! backend, the scheduler, and the grid arena live here, and there is no
//! implicit "current" anything. A runtime is built from a boxed
//! [`DeviceBackend`], the receiving half of the completion channel, and a
//! [`Config`] naming the opaque kernels and sizing the long-lived extents.

use std::sync::mpsc::Receiver;

use crate::backend::{Completion, DeviceBackend, KernelId};
use crate::grid::Grids;
use crate::sched::Scheduler;

/// Kernel ids and extent sizing for one runtime.
///
/// The kernels are opaque units of work registered with the backend by the
/// embedding pipeline; this crate only schedules them.
#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// Expands place commands into composition keys.
    pub place_kernel: KernelId,
    /// Sorts the composition key extent.
    pub sort_kernel: KernelId,
    /// Renders sorted keys through the styling table into a target.
    pub render_kernel: KernelId,
    /// Slot capacity of a composition's place ring (power of two).
    pub place_ring: u32,
    /// Maximum keys a composition can hold.
    pub keys: u32,
}

/// Execution context: backend, scheduler, grid arena, configuration.
pub struct Runtime {
    pub(crate) backend: Box<dyn DeviceBackend>,
    pub(crate) sched: Scheduler,
    pub(crate) grids: Grids,
    pub config: Config,
}

impl Runtime {
    pub fn new(
        backend: Box<dyn DeviceBackend>,
        completions: Receiver<Completion>,
        config: Config,
    ) -> Self {
        debug_assert!(config.place_ring.is_power_of_two());
        Self {
            backend,
            sched: Scheduler::new(completions),
            grids: Grids::default(),
            config,
        }
    }

    /// Shared access to the backend, mainly for downcast introspection.
    pub fn backend(&self) -> &dyn DeviceBackend {
        &*self.backend
    }
}


#[cfg(test)]
pub(crate) use testing::test_runtime;
