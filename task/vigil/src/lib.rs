// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Vigil: the watchdog supervisor.
//!
//! Subsystems prove liveness by reporting OK on an *aspect* every cycle
//! they complete real work. Replicated voter clips collect the aspect
//! reports, and as long as every aspect is fresh they answer the hardware
//! watchdog's challenge (a *recipe*, transformed into *food*). The monitor
//! clip is the single owner of the watchdog MMIO region: it forwards
//! recipes to the voters and feeds their answer back to the device inside
//! the allowed window.
//!
//! If an aspect goes stale, the voters command a forced reset; if the
//! voters themselves die, no food arrives and the device resets the board
//! on its own. Either way the failure ends in hardware reset, not in a
//! wedged system.
//!
//! It's unwise for the monitor to do anything that could block or fail
//! quietly: it must touch the MMIO region and nothing else. Everything
//! with policy in it lives in the voters, where it is replicated.

mod aspect;
mod monitor;
mod transform;
mod voter;

pub use aspect::{Aspect, AspectConfig};
pub use monitor::{WatchdogMmio, WatchdogMonitorClip};
pub use transform::food_from_recipe;
pub use voter::{FoodMsg, HeartbeatClip, RecipeMsg, WatchdogVoterClip, FOOD_MSG_SIZE, RECIPE_MSG_SIZE};

/// Number of voter replicas in the reference configuration.
pub const WATCHDOG_VOTER_REPLICAS: usize = 3;
