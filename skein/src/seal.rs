// Copyright 2026 the Skein Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Seal/unseal lifecycle shared by [`Composition`](crate::Composition) and
//! [`Styling`](crate::Styling).
//!
//! A sealable resource cycles `Sealed → Unsealing → Unsealed → Sealing →
//! Sealed`. Unsealed means host-writable: producer calls mutate the mapped
//! host view. Sealing commits the host view to the device under a
//! force-started grid, so a render can order itself after the commit with a
//! happens-after edge. An in-flight seal is never cancelled; unseal waits it
//! out, and also waits for every outstanding [`UseLock`] before exposing
//! host pointers again.
//!
//! The generic drivers in this module own the state machine; the resource
//! types supply the extent-specific map/unmap work through [`Sealable`].

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::grid::{GridId, GridTask};
use crate::runtime::Runtime;
use crate::sched::{Action, SchedHandle};
use crate::{Error, Result};

/// Lifecycle state of a sealable resource.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SealState {
    /// Device-to-host maps in flight.
    Unsealing,
    /// Host-writable; producer calls are legal.
    Unsealed,
    /// Host-to-device commit in flight under the sealing grid.
    Sealing,
    /// Device-consumable.
    Sealed,
}

/// Common bookkeeping embedded in every sealable resource.
pub(crate) struct SealCore {
    state: SealState,
    refs: u32,
    /// Outstanding in-flight consumers; shared with [`UseLock`] guards.
    locks: Rc<Cell<u32>>,
    /// The sealing grid while a seal is in flight.
    grid: Option<GridId>,
    /// Failure parked by the sealing task for the `seal` caller.
    error: Option<Error>,
}

impl SealCore {
    pub(crate) fn new(state: SealState) -> Self {
        Self {
            state,
            refs: 1,
            locks: Rc::new(Cell::new(0)),
            grid: None,
            error: None,
        }
    }

    pub(crate) fn state(&self) -> SealState {
        self.state
    }

    /// The sealing grid, while one is in flight.
    pub(crate) fn grid(&self) -> Option<GridId> {
        self.grid
    }

    pub(crate) fn lock_count(&self) -> u32 {
        self.locks.get()
    }

    pub(crate) fn transition(&mut self, next: SealState, label: &str) {
        log::trace!("{label}: {:?} -> {next:?}", self.state);
        self.state = next;
    }

    /// Guard for producer operations, which are legal only while unsealed.
    pub(crate) fn ensure_unsealed(&self) -> Result<()> {
        if self.state == SealState::Unsealed {
            Ok(())
        } else {
            Err(Error::NotUnsealed(self.state))
        }
    }
}

/// Resource-specific halves of the lifecycle.
///
/// `begin_seal` commits host state to the device and must end in
/// `rt.grid_complete(grid)` (from a completion continuation for async
/// commits); the sealing grid's dispose then flips the state to `Sealed`.
/// `begin_unseal` maps device state back to the host and must flip the
/// state to `Unsealed` from its last continuation. `teardown` frees every
/// extent and the resource's queue; it runs once, at the last release.
pub(crate) trait Sealable: 'static {
    const LABEL: &'static str;

    fn core(&self) -> &SealCore;
    fn core_mut(&mut self) -> &mut SealCore;

    fn begin_seal(rt: &mut Runtime, res: &Rc<RefCell<Self>>, grid: GridId) -> Result<()>;
    fn begin_unseal(rt: &mut Runtime, res: &Rc<RefCell<Self>>);
    fn teardown(rt: &mut Runtime, res: &Rc<RefCell<Self>>);
}

/// Grid task driving one seal of one resource.
struct SealTask<T: Sealable> {
    res: Rc<RefCell<T>>,
}

impl<T: Sealable> GridTask for SealTask<T> {
    fn execute(&mut self, rt: &mut Runtime, grid: GridId) {
        if let Err(err) = T::begin_seal(rt, &self.res, grid) {
            let mut inner = self.res.borrow_mut();
            let core = inner.core_mut();
            // Abandon the attempt; the `seal` caller picks the error up.
            core.transition(SealState::Unsealed, T::LABEL);
            core.error = Some(err);
            drop(inner);
            rt.grid_complete(grid);
        }
    }

    fn dispose(self: Box<Self>, _rt: &mut Runtime) {
        let mut inner = self.res.borrow_mut();
        let core = inner.core_mut();
        if core.state == SealState::Sealing {
            core.transition(SealState::Sealed, T::LABEL);
        }
        core.grid = None;
    }
}

/// Drive a resource toward `Sealed`.
///
/// No-op at `Sealing` or `Sealed`. Waits out an in-flight unseal, then
/// force-starts the sealing grid; sealing has no upstream dependency, so the
/// resource's commit begins before this returns. The grid itself completes
/// asynchronously.
pub(crate) fn seal<T: Sealable>(rt: &mut Runtime, res: &Rc<RefCell<T>>) -> Result<()> {
    rt.pump_while(|| res.borrow().core().state == SealState::Unsealing);
    {
        let mut inner = res.borrow_mut();
        let core = inner.core_mut();
        match core.state {
            SealState::Sealing | SealState::Sealed => return Ok(()),
            SealState::Unsealed => core.transition(SealState::Sealing, T::LABEL),
            SealState::Unsealing => unreachable!(),
        }
    }
    let grid = rt.grid_create(SealTask { res: res.clone() });
    res.borrow_mut().core_mut().grid = Some(grid);
    rt.grid_start(grid, true);
    match res.borrow_mut().core_mut().error.take() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Drive a resource toward `Unsealed`, optionally blocking until it gets
/// there.
///
/// An in-flight seal finishes first, and every outstanding lock must drop
/// before the device-to-host maps are issued.
pub(crate) fn unseal<T: Sealable>(rt: &mut Runtime, res: &Rc<RefCell<T>>, block: bool) {
    rt.pump_while(|| res.borrow().core().state == SealState::Sealing);
    if res.borrow().core().state == SealState::Sealed {
        rt.pump_while(|| res.borrow().core().locks.get() > 0);
        res.borrow_mut()
            .core_mut()
            .transition(SealState::Unsealing, T::LABEL);
        T::begin_unseal(rt, res);
    }
    if block {
        rt.pump_while(|| res.borrow().core().state != SealState::Unsealed);
    }
}

pub(crate) fn retain<T: Sealable>(res: &Rc<RefCell<T>>) {
    res.borrow_mut().core_mut().refs += 1;
}

/// Drop one reference; the last one seals, quiesces, and tears down.
///
/// Teardown waits for the seal to land and for every lock to drop, so an
/// extent is never freed under an in-flight render.
pub(crate) fn release<T: Sealable>(rt: &mut Runtime, res: &Rc<RefCell<T>>) -> Result<()> {
    {
        let mut inner = res.borrow_mut();
        let core = inner.core_mut();
        debug_assert!(core.refs > 0, "release of a dead resource");
        core.refs -= 1;
        if core.refs > 0 {
            return Ok(());
        }
    }
    log::debug!("{}: tearing down", T::LABEL);
    // A failed seal leaves the resource unsealed with no commit in flight;
    // its extents are still safe to free, so teardown must run either way
    // or the last handle would leak them.
    let sealed = seal(rt, res);
    rt.pump_while(|| {
        let inner = res.borrow();
        let core = inner.core();
        core.state == SealState::Sealing || core.locks.get() > 0
    });
    T::teardown(rt, res);
    sealed
}

/// Take a reference and a use lock in one step, returning the RAII guard.
pub(crate) fn retain_and_lock<T: Sealable>(rt: &Runtime, res: &Rc<RefCell<T>>) -> UseLock {
    let locks = {
        let mut inner = res.borrow_mut();
        let core = inner.core_mut();
        core.refs += 1;
        core.locks.set(core.locks.get() + 1);
        core.locks.clone()
    };
    let res = res.clone();
    UseLock {
        locks,
        sched: rt.sched_handle(),
        release: Some(Box::new(move |rt| {
            let _ = release(rt, &res);
        })),
    }
}

/// Guard for one in-flight use of a sealed resource.
///
/// Dropping it decrements the lock count immediately and defers the paired
/// reference release onto the scheduler, so the guard can be dropped from a
/// completion continuation without reentering the resource.
pub struct UseLock {
    locks: Rc<Cell<u32>>,
    sched: SchedHandle,
    release: Option<Action>,
}

impl Drop for UseLock {
    fn drop(&mut self) {
        let n = self.locks.get();
        debug_assert!(n > 0, "lock count underflow");
        self.locks.set(n - 1);
        if let Some(release) = self.release.take() {
            self.sched.push(release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::test_runtime;

    #[derive(Default)]
    struct Log {
        seals: Cell<u32>,
        unseals: Cell<u32>,
        teardowns: Cell<u32>,
        fail_next_seal: Cell<bool>,
    }

    struct TestRes {
        core: SealCore,
        log: Rc<Log>,
    }

    impl TestRes {
        fn new(log: &Rc<Log>) -> Rc<RefCell<Self>> {
            Rc::new(RefCell::new(Self {
                core: SealCore::new(SealState::Unsealed),
                log: log.clone(),
            }))
        }
    }

    impl Sealable for TestRes {
        const LABEL: &'static str = "test-res";

        fn core(&self) -> &SealCore {
            &self.core
        }

        fn core_mut(&mut self) -> &mut SealCore {
            &mut self.core
        }

        fn begin_seal(rt: &mut Runtime, res: &Rc<RefCell<Self>>, grid: GridId) -> Result<()> {
            let log = res.borrow().log.clone();
            if log.fail_next_seal.take() {
                return Err(Error::DeviceAlloc {
                    name: "test-res",
                    size: 1,
                });
            }
            log.seals.set(log.seals.get() + 1);
            let event = rt.backend.immediate_event();
            rt.on_event(event, move |rt, _| rt.grid_complete(grid));
            Ok(())
        }

        fn begin_unseal(rt: &mut Runtime, res: &Rc<RefCell<Self>>) {
            let event = rt.backend.immediate_event();
            let res = res.clone();
            rt.on_event(event, move |_, _| {
                let mut inner = res.borrow_mut();
                inner.log.unseals.set(inner.log.unseals.get() + 1);
                inner.core.transition(SealState::Unsealed, Self::LABEL);
            });
        }

        fn teardown(_rt: &mut Runtime, res: &Rc<RefCell<Self>>) {
            let log = res.borrow().log.clone();
            log.teardowns.set(log.teardowns.get() + 1);
        }
    }

    #[test]
    fn unseal_seal_unseal_cycle_lands_unsealed() {
        let mut rt = test_runtime();
        let log = Rc::new(Log::default());
        let res = TestRes::new(&log);
        unseal(&mut rt, &res, true);
        assert_eq!(res.borrow().core.state(), SealState::Unsealed);
        seal(&mut rt, &res).unwrap();
        assert_eq!(res.borrow().core.state(), SealState::Sealing);
        unseal(&mut rt, &res, true);
        assert_eq!(res.borrow().core.state(), SealState::Unsealed);
        assert_eq!(log.seals.get(), 1);
        assert_eq!(log.unseals.get(), 1);
    }

    #[test]
    fn seal_is_noop_once_sealing() {
        let mut rt = test_runtime();
        let log = Rc::new(Log::default());
        let res = TestRes::new(&log);
        seal(&mut rt, &res).unwrap();
        seal(&mut rt, &res).unwrap();
        rt.pump();
        assert_eq!(res.borrow().core.state(), SealState::Sealed);
        seal(&mut rt, &res).unwrap();
        assert_eq!(log.seals.get(), 1);
    }

    #[test]
    fn failed_seal_reports_and_returns_to_unsealed() {
        let mut rt = test_runtime();
        let log = Rc::new(Log::default());
        let res = TestRes::new(&log);
        log.fail_next_seal.set(true);
        assert!(matches!(
            seal(&mut rt, &res),
            Err(Error::DeviceAlloc { .. })
        ));
        rt.pump();
        assert_eq!(res.borrow().core.state(), SealState::Unsealed);
        // The failed attempt left the machine usable.
        seal(&mut rt, &res).unwrap();
        rt.pump();
        assert_eq!(res.borrow().core.state(), SealState::Sealed);
    }

    #[test]
    fn teardown_runs_once_at_last_release() {
        let mut rt = test_runtime();
        let log = Rc::new(Log::default());
        let res = TestRes::new(&log);
        retain(&res);
        release(&mut rt, &res).unwrap();
        assert_eq!(log.teardowns.get(), 0);
        release(&mut rt, &res).unwrap();
        assert_eq!(log.teardowns.get(), 1);
    }

    #[test]
    fn failed_final_seal_still_tears_down() {
        let mut rt = test_runtime();
        let log = Rc::new(Log::default());
        let res = TestRes::new(&log);
        log.fail_next_seal.set(true);
        assert!(matches!(
            release(&mut rt, &res),
            Err(Error::DeviceAlloc { .. })
        ));
        assert_eq!(log.teardowns.get(), 1, "last release leaked the resource");
    }

    #[test]
    fn lock_defers_release_until_dropped() {
        let mut rt = test_runtime();
        let log = Rc::new(Log::default());
        let res = TestRes::new(&log);
        let guard = retain_and_lock(&rt, &res);
        assert_eq!(res.borrow().core.lock_count(), 1);
        release(&mut rt, &res).unwrap();
        assert_eq!(log.teardowns.get(), 0, "torn down under a live lock");
        drop(guard);
        assert_eq!(res.borrow().core.lock_count(), 0);
        rt.pump();
        assert_eq!(log.teardowns.get(), 1);
    }
}
