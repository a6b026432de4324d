// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Time-triggered executive: clocks, the clip schedule, and staged init.
//!
//! The executive dispatches *clips* (short, non-blocking computations) from
//! a fixed schedule. One pass through the schedule is an *epoch*. Each entry
//! carries a nanosecond budget; a clip that returns after its deadline is
//! treated as if the deadline timer had cut it off, and its next dispatch
//! reports a restart.

mod clock;
mod init;
mod sched;

pub use clock::{Clock, MissionClock, SimClock, Timestamp, NS_PER_MS, NS_PER_SEC};
pub use init::{InitHooks, InitStage};
pub use sched::{Clip, ClipCtx, FnClip, RestartPolicy, Schedule, ScheduleEntry};
