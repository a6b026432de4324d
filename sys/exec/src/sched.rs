// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Round-robin clip dispatch with per-clip budgets.

use std::rc::Rc;

use ringbuf::{ringbuf, ringbuf_entry};

use crate::clock::{Clock, Timestamp, NS_PER_MS};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Trace {
    Started(Timestamp),
    Overrun(&'static str, u64),
}

ringbuf!(Trace, 16);

/// A clip is dispatched once per epoch and must run to completion well within
/// its budget. Clips do not block and do not yield.
pub trait Clip {
    fn clip(&mut self, ctx: &ClipCtx);
}

/// Adapter for one-off clips written as closures (mostly harness glue).
pub struct FnClip<F>(pub F);

impl<F: FnMut(&ClipCtx)> Clip for FnClip<F> {
    fn clip(&mut self, ctx: &ClipCtx) {
        (self.0)(ctx)
    }
}

/// Per-dispatch context handed to a clip.
pub struct ClipCtx {
    /// Start of this clip's scheduling period.
    pub clip_start: Timestamp,
    /// Start of the current epoch (dispatch time of the first entry).
    pub epoch_start: Timestamp,
    /// Free-running epoch counter.
    pub epoch: u32,
    /// True on the first dispatch after startup, and on the first dispatch
    /// after the previous invocation overran its deadline.
    pub is_restart: bool,
    pub clock: Rc<dyn Clock>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RestartPolicy {
    /// Overrun is fatal.
    NotRestartable,
    /// Overrun abandons the invocation; the next dispatch reports a restart.
    RestartOnReschedule,
}

pub struct ScheduleEntry {
    name: &'static str,
    budget_ns: u32,
    policy: RestartPolicy,
    needs_start: bool,
    clip: Box<dyn Clip>,
}

impl ScheduleEntry {
    pub fn new(
        name: &'static str,
        budget_ns: u32,
        policy: RestartPolicy,
        clip: Box<dyn Clip>,
    ) -> Self {
        assert!(budget_ns > 0, "clip '{name}' must have a nonzero budget");
        Self {
            name,
            budget_ns,
            policy,
            needs_start: true,
            clip,
        }
    }

    /// The common case: a restartable clip.
    pub fn clip(name: &'static str, budget_ns: u32, clip: Box<dyn Clip>) -> Self {
        Self::new(name, budget_ns, RestartPolicy::RestartOnReschedule, clip)
    }
}

/// The schedule table and its cursor. One `run_epoch` is one full pass.
pub struct Schedule {
    clock: Rc<dyn Clock>,
    entries: Vec<ScheduleEntry>,
    schedule_last: Timestamp,
    epoch_start: Timestamp,
    schedule_loads: u64,
    schedule_ticks: u32,
    started: bool,
}

impl Schedule {
    pub fn new(clock: Rc<dyn Clock>, entries: Vec<ScheduleEntry>) -> Self {
        assert!(!entries.is_empty(), "schedule must contain at least one clip");
        Self {
            clock,
            entries,
            schedule_last: 0,
            epoch_start: 0,
            schedule_loads: 0,
            schedule_ticks: 0,
            started: false,
        }
    }

    /// Aligns the first dispatch to the next millisecond boundary. The first
    /// clip may get a little extra time; we can live with that.
    fn start(&mut self) {
        let now = self.clock.now_ns();
        self.schedule_last = now + NS_PER_MS - (now % NS_PER_MS);
        self.clock.sleep_until(self.schedule_last);
        self.started = true;
        ringbuf_entry!(Trace::Started(self.schedule_last));
    }

    /// Runs one full pass through the schedule.
    pub fn run_epoch(&mut self) {
        if !self.started {
            self.start();
        }
        self.epoch_start = self.schedule_last;
        for index in 0..self.entries.len() {
            self.dispatch(index);
        }
        self.schedule_ticks += 1;
    }

    pub fn run_epochs(&mut self, count: u32) {
        for _ in 0..count {
            self.run_epoch();
        }
    }

    fn dispatch(&mut self, index: usize) {
        let entry = &mut self.entries[index];
        let now = self.clock.now_ns();
        let deadline = self.schedule_last + u64::from(entry.budget_ns);

        // make sure we aren't drifting from the schedule
        assert!(
            self.schedule_last <= now && now <= deadline,
            "schedule drift at clip '{}': window {}..{} but now {}",
            entry.name,
            self.schedule_last,
            deadline,
            now,
        );

        self.schedule_loads += 1;
        let ctx = ClipCtx {
            clip_start: now,
            epoch_start: self.epoch_start,
            epoch: self.schedule_ticks,
            is_restart: entry.needs_start,
            clock: Rc::clone(&self.clock),
        };
        entry.clip.clip(&ctx);

        let finished = self.clock.now_ns();
        if finished > deadline {
            match entry.policy {
                RestartPolicy::NotRestartable => {
                    panic!(
                        "clip '{}' overran its budget by {}ns and is not restartable",
                        entry.name,
                        finished - deadline,
                    );
                }
                RestartPolicy::RestartOnReschedule => {
                    ringbuf_entry!(Trace::Overrun(entry.name, finished - deadline));
                    entry.needs_start = true;
                }
            }
        } else {
            entry.needs_start = false;
        }

        self.clock.sleep_until(deadline);
        self.schedule_last = deadline;
    }

    /// Free-running per-dispatch counter (instrumentation only).
    pub fn schedule_loads(&self) -> u64 {
        self.schedule_loads
    }

    /// Free-running per-epoch counter (instrumentation only).
    pub fn schedule_ticks(&self) -> u32 {
        self.schedule_ticks
    }

    pub fn epoch_start(&self) -> Timestamp {
        self.epoch_start
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SimClock;
    use std::cell::RefCell;

    fn sim() -> Rc<SimClock> {
        Rc::new(SimClock::new(0))
    }

    #[test]
    fn epoch_walks_entries_in_order_with_budgets() {
        let clock = sim();
        let log: Rc<RefCell<Vec<(&'static str, Timestamp)>>> = Rc::default();

        let mk = |name: &'static str, log: &Rc<RefCell<Vec<(&'static str, Timestamp)>>>| {
            let log = Rc::clone(log);
            ScheduleEntry::clip(
                name,
                100_000,
                Box::new(FnClip(move |ctx: &ClipCtx| {
                    log.borrow_mut().push((name, ctx.clip_start));
                })),
            )
        };

        let entries = vec![mk("a", &log), mk("b", &log), mk("c", &log)];
        let mut sched = Schedule::new(clock, entries);
        sched.run_epochs(2);

        let log = log.borrow();
        // first dispatch lands on the millisecond boundary
        assert_eq!(log[0], ("a", 1_000_000));
        assert_eq!(log[1], ("b", 1_100_000));
        assert_eq!(log[2], ("c", 1_200_000));
        assert_eq!(log[3], ("a", 1_300_000));
        assert_eq!(sched.schedule_ticks(), 2);
        assert_eq!(sched.schedule_loads(), 6);
    }

    #[test]
    fn restart_reported_on_first_dispatch_and_after_overrun() {
        let clock = sim();
        let restarts: Rc<RefCell<Vec<bool>>> = Rc::default();
        let overrun_next: Rc<RefCell<bool>> = Rc::default();

        let entry = {
            let clock = Rc::clone(&clock);
            let restarts = Rc::clone(&restarts);
            let overrun_next = Rc::clone(&overrun_next);
            ScheduleEntry::clip(
                "burner",
                50_000,
                Box::new(FnClip(move |ctx: &ClipCtx| {
                    restarts.borrow_mut().push(ctx.is_restart);
                    if std::mem::take(&mut *overrun_next.borrow_mut()) {
                        clock.advance(60_000);
                    }
                })),
            )
        };

        let mut sched = Schedule::new(clock, vec![entry]);
        sched.run_epoch();
        *overrun_next.borrow_mut() = true;
        sched.run_epoch(); // overruns
        sched.run_epoch(); // sees the restart
        sched.run_epoch();

        assert_eq!(*restarts.borrow(), vec![true, false, true, false]);
    }

    #[test]
    #[should_panic(expected = "overran its budget")]
    fn non_restartable_overrun_aborts() {
        let clock = sim();
        let entry = {
            let clock = Rc::clone(&clock);
            ScheduleEntry::new(
                "critical",
                50_000,
                RestartPolicy::NotRestartable,
                Box::new(FnClip(move |_: &ClipCtx| clock.advance(60_000))),
            )
        };
        let mut sched = Schedule::new(clock, vec![entry]);
        sched.run_epoch();
    }
}
