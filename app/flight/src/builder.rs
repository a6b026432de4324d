// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The declarative system topology: clips, their budgets, and staged init.
//!
//! Everything, from ducts and notepads to clip state, is created up front
//! and wired together here; nothing is created or destroyed after
//! [`FlightBuilder::build`] returns. Init hooks run RAW, then READY, then
//! CRAFT, before the first dispatch.

use std::cell::RefCell;
use std::rc::Rc;

use exec::{Clip, ClipCtx, Clock, InitHooks, InitStage, Schedule, ScheduleEntry};

/// A clip shared between the schedule and an observer (telemetry, or a
/// test harness peeking at state).
pub struct SharedClip<C>(pub Rc<RefCell<C>>);

impl<C> SharedClip<C> {
    pub fn new(clip: C) -> (Self, Rc<RefCell<C>>) {
        let shared = Rc::new(RefCell::new(clip));
        (Self(Rc::clone(&shared)), shared)
    }
}

impl<C: Clip> Clip for SharedClip<C> {
    fn clip(&mut self, ctx: &ClipCtx) {
        self.0.borrow_mut().clip(ctx);
    }
}

pub struct FlightBuilder {
    clock: Rc<dyn Clock>,
    entries: Vec<ScheduleEntry>,
    init: InitHooks,
}

impl FlightBuilder {
    pub fn new(clock: Rc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: Vec::new(),
            init: InitHooks::new(),
        }
    }

    /// Appends a clip to the end of the schedule.
    pub fn clip(&mut self, name: &'static str, budget_ns: u32, clip: Box<dyn Clip>) -> &mut Self {
        self.entries.push(ScheduleEntry::clip(name, budget_ns, clip));
        self
    }

    pub fn init_hook(&mut self, stage: InitStage, hook: Box<dyn FnOnce()>) -> &mut Self {
        self.init.register(stage, hook);
        self
    }

    /// Runs initialization and hands over the schedule.
    pub fn build(mut self) -> Schedule {
        self.init.run();
        Schedule::new(self.clock, self.entries)
    }
}
