// Copyright 2026 the Skein Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Host scheduler internals.
//!
//! One logical scheduler context processes every grid-state transition and
//! every device-completion continuation. Device threads never touch host
//! state: they post an [`EventId`](crate::backend::EventId) on the completion
//! channel and the next pump runs the continuation registered for it. Work
//! that must run on the scheduler but originates host-side (grid execution,
//! deferred releases) goes through the action queue instead.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::sync::mpsc::Receiver;

use crate::backend::{Completion, EventId};
use crate::runtime::Runtime;

/// A host-side continuation for a completed device operation. Receives the
/// read-back payload when the operation produced one.
pub(crate) type Continuation = Box<dyn FnOnce(&mut Runtime, Option<Vec<u8>>)>;

/// Deferred host-side work, run on the scheduler in FIFO order.
pub(crate) type Action = Box<dyn FnOnce(&mut Runtime)>;

/// Cloneable handle onto the scheduler's action queue.
///
/// Held by RAII guards (and anything else without `&mut Runtime` in hand)
/// that needs to defer work onto the scheduler.
#[derive(Clone)]
pub(crate) struct SchedHandle(Rc<RefCell<VecDeque<Action>>>);

impl SchedHandle {
    pub(crate) fn push(&self, action: Action) {
        self.0.borrow_mut().push_back(action);
    }

    fn pop(&self) -> Option<Action> {
        self.0.borrow_mut().pop_front()
    }
}

pub(crate) struct Scheduler {
    rx: Receiver<Completion>,
    actions: SchedHandle,
    continuations: HashMap<EventId, Continuation>,
    /// Completions that arrived before a continuation was registered. A
    /// backend may complete work between enqueue and `on_event`, so the
    /// payload is parked here until the handler shows up.
    early: HashMap<EventId, Option<Vec<u8>>>,
}

impl Scheduler {
    pub(crate) fn new(rx: Receiver<Completion>) -> Self {
        Self {
            rx,
            actions: SchedHandle(Rc::new(RefCell::new(VecDeque::new()))),
            continuations: HashMap::new(),
            early: HashMap::new(),
        }
    }

    pub(crate) fn handle(&self) -> SchedHandle {
        self.actions.clone()
    }
}

impl Runtime {
    /// Register `f` to run on the scheduler once `event` completes.
    ///
    /// At most one continuation per event. If the completion already
    /// arrived, the continuation runs on the next drain.
    pub fn on_event(&mut self, event: EventId, f: impl FnOnce(&mut Runtime, Option<Vec<u8>>) + 'static) {
        if let Some(payload) = self.sched.early.remove(&event) {
            self.sched
                .actions
                .push(Box::new(move |rt| f(rt, payload)));
            return;
        }
        let prior = self.sched.continuations.insert(event, Box::new(f));
        debug_assert!(prior.is_none(), "event already has a continuation");
    }

    /// Queue host-side work to run on the scheduler.
    pub(crate) fn defer(&mut self, action: Action) {
        self.sched.actions.push(action);
    }

    pub(crate) fn sched_handle(&self) -> SchedHandle {
        self.sched.handle()
    }

    /// Run queued host actions until the queue is empty.
    ///
    /// Reentrant: an action may itself pump or drain; the queue handle is
    /// never borrowed across an action call.
    pub(crate) fn drain(&mut self) {
        while let Some(action) = self.sched.actions.pop() {
            action(self);
        }
    }

    fn dispatch(&mut self, completion: Completion) {
        match self.sched.continuations.remove(&completion.event) {
            Some(f) => f(self, completion.payload),
            None => {
                // Completion raced ahead of `on_event`.
                self.sched.early.insert(completion.event, completion.payload);
            }
        }
    }

    /// Process everything currently available: queued actions and any
    /// completions the backend has already posted. Never blocks.
    pub fn pump(&mut self) {
        self.drain();
        while let Ok(completion) = self.sched.rx.try_recv() {
            self.dispatch(completion);
            self.drain();
        }
    }

    /// Pump the scheduler while `pred` holds.
    ///
    /// The one intentional blocking point in the design: synchronous seal,
    /// unseal, and release entry points use it to wait for a specific state
    /// transition. It drains queued completions and lets the backend make
    /// progress rather than spinning.
    pub fn pump_while(&mut self, mut pred: impl FnMut() -> bool) {
        loop {
            self.pump();
            if !pred() {
                return;
            }
            self.backend.drive();
            match self
                .sched
                .rx
                .recv_timeout(std::time::Duration::from_millis(1))
            {
                Ok(completion) => self.dispatch(completion),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("completion channel closed while blocked on a state transition");
                }
            }
        }
    }
}
