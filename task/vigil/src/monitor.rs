// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The watchdog monitor: sole owner of the watchdog MMIO region.

use std::rc::Rc;

use duct::Duct;
use exec::{Clip, ClipCtx};
use ringbuf::{ringbuf, ringbuf_entry};

use crate::voter::{FoodMsg, RecipeMsg, FOOD_MSG_SIZE, RECIPE_MSG_SIZE};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Trace {
    Fed(u32),
    FedTooEarly,
    RecipeForwarded(u32),
    ForcingReset,
}

ringbuf!(Trace, 16);

/// The watchdog device's register interface. The flight build maps the MMIO
/// region; simulation serves it from a struct.
pub trait WatchdogMmio {
    /// Read-only: the current recipe.
    fn greet(&self) -> u32;
    /// Write-only: present food to the device.
    fn feed(&self, food: u32);
    /// Read-only: absolute (truncated) time of the next deadline.
    fn deadline(&self) -> u32;
    /// Read-only constant: how early before the deadline feeding opens.
    fn early_offset(&self) -> u32;
    /// Writing the greet register is forbidden and resets the board.
    fn write_greet(&self, value: u32);
}

pub struct WatchdogMonitorClip {
    mmio: Rc<dyn WatchdogMmio>,
    food_duct: Rc<Duct>,
    recipe_duct: Rc<Duct>,
}

impl WatchdogMonitorClip {
    pub fn new(mmio: Rc<dyn WatchdogMmio>, food_duct: Rc<Duct>, recipe_duct: Rc<Duct>) -> Self {
        assert!(food_duct.receiver_replicas() == 1);
        assert!(recipe_duct.sender_replicas() == 1);
        Self {
            mmio,
            food_duct,
            recipe_duct,
        }
    }

    /// Whether the feeding window is open at `now_full`. The registers hold
    /// truncated 32-bit times, so this must be wrap-safe arithmetic rather
    /// than a plain comparison.
    fn can_feed_yet(&self, now_full: u64) -> bool {
        let now = now_full as u32;
        let deadline = self.mmio.deadline();
        let earliest = deadline.wrapping_sub(self.mmio.early_offset());
        let delay_until_earliest = earliest.wrapping_sub(now) as i32;
        delay_until_earliest <= 0
    }

    /// Kills the board: greet writes are forbidden, so the device resets.
    fn force_reset(&self) -> ! {
        ringbuf_entry!(Trace::ForcingReset);
        self.mmio.write_greet(0);
        // if we continue past here, something is really wrong... that
        // should have killed the watchdog!
        panic!("watchdog reset did not occur");
    }
}

impl Clip for WatchdogMonitorClip {
    fn clip(&mut self, ctx: &ClipCtx) {
        let mut buf = [0u8; FOOD_MSG_SIZE];
        let mut txn = self.food_duct.receive_prepare(0);
        let food_msg = if txn.receive(&mut buf) == FOOD_MSG_SIZE {
            hubpack::deserialize::<FoodMsg>(&buf).ok().map(|(msg, _)| msg)
        } else {
            None
        };
        txn.commit();

        let mut can_feed_yet = self.can_feed_yet(ctx.clip_start);

        if let Some(food_msg) = food_msg {
            if food_msg.force_reset {
                self.force_reset();
            } else if !can_feed_yet {
                ringbuf_entry!(Trace::FedTooEarly);
            } else {
                let old_deadline = self.mmio.deadline();
                self.mmio.feed(food_msg.food);
                assert!(
                    self.mmio.deadline() != old_deadline,
                    "watchdog did not accept feeding",
                );
                ringbuf_entry!(Trace::Fed(food_msg.food));
                // don't request another recipe right after feeding
                can_feed_yet = false;
            }
        }

        let mut txn = self.recipe_duct.send_prepare(0);
        if can_feed_yet {
            let msg = RecipeMsg {
                recipe: self.mmio.greet(),
            };
            ringbuf_entry!(Trace::RecipeForwarded(msg.recipe));
            let mut out = [0u8; RECIPE_MSG_SIZE];
            // failing to serialize a fixed-size message is a programmer error
            let size = hubpack::serialize(&mut out, &msg).unwrap();
            txn.send(&out[..size], 0);
        }
        txn.commit();
    }
}
