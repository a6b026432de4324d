// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The replicated voter and the heartbeat.
//!
//! Each voter replica independently consumes the recipe forwarded by the
//! monitor, checks every aspect, and emits a food message. The food duct's
//! strict voting is what turns N voter replicas into one trustworthy
//! answer: if the replicas disagree on whether to feed or what to feed,
//! the duct aborts rather than letting a corrupted voter feed the watchdog.

use std::rc::Rc;

use duct::Duct;
use exec::{Clip, ClipCtx};
use hubpack::SerializedSize;
use ringbuf::{ringbuf, ringbuf_entry};
use serde::{Deserialize, Serialize};

use crate::aspect::Aspect;
use crate::transform::food_from_recipe;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Trace {
    ForceReset,
    Food { recipe: u32, food: u32 },
}

ringbuf!(Trace, 16);

/// Monitor-to-voter: the device's current challenge.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, SerializedSize)]
pub struct RecipeMsg {
    pub recipe: u32,
}

/// Voter-to-monitor: feed this, or give up and reset.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, SerializedSize)]
pub struct FoodMsg {
    pub force_reset: bool,
    pub food: u32,
}

pub const RECIPE_MSG_SIZE: usize = <RecipeMsg as SerializedSize>::MAX_SIZE;
pub const FOOD_MSG_SIZE: usize = <FoodMsg as SerializedSize>::MAX_SIZE;

pub struct WatchdogVoterClip {
    replica_id: usize,
    aspects: Vec<Rc<Aspect>>,
    recipe_duct: Rc<Duct>,
    food_duct: Rc<Duct>,
}

impl WatchdogVoterClip {
    pub fn new(
        replica_id: usize,
        aspects: Vec<Rc<Aspect>>,
        recipe_duct: Rc<Duct>,
        food_duct: Rc<Duct>,
    ) -> Self {
        assert!(recipe_duct.message_size() >= RECIPE_MSG_SIZE);
        assert!(food_duct.message_size() >= FOOD_MSG_SIZE);
        Self {
            replica_id,
            aspects,
            recipe_duct,
            food_duct,
        }
    }
}

impl Clip for WatchdogVoterClip {
    fn clip(&mut self, ctx: &ClipCtx) {
        // the monitor's forwarded recipe, if feeding time is near
        let mut buf = [0u8; RECIPE_MSG_SIZE];
        let mut txn = self.recipe_duct.receive_prepare(self.replica_id);
        let recipe = if txn.receive(&mut buf) == RECIPE_MSG_SIZE {
            hubpack::deserialize::<RecipeMsg>(&buf).ok().map(|(msg, _)| msg)
        } else {
            None
        };
        txn.commit();

        // every aspect must be consumed every epoch, so no short-circuit
        let mut aspects_ok = true;
        for aspect in &self.aspects {
            if !aspect.check(self.replica_id, ctx.epoch_start) {
                aspects_ok = false;
            }
        }

        let mut txn = self.food_duct.send_prepare(self.replica_id);
        if !aspects_ok {
            ringbuf_entry!(Trace::ForceReset);
            let msg = FoodMsg {
                force_reset: true,
                food: 0,
            };
            let mut out = [0u8; FOOD_MSG_SIZE];
            // failing to serialize a fixed-size message is a programmer error
            let size = hubpack::serialize(&mut out, &msg).unwrap();
            txn.send(&out[..size], 0);
        } else if let Some(recipe) = recipe {
            let msg = FoodMsg {
                force_reset: false,
                food: food_from_recipe(recipe.recipe),
            };
            ringbuf_entry!(Trace::Food {
                recipe: recipe.recipe,
                food: msg.food,
            });
            let mut out = [0u8; FOOD_MSG_SIZE];
            let size = hubpack::serialize(&mut out, &msg).unwrap();
            txn.send(&out[..size], 0);
        }
        txn.commit();
    }
}

/// The executive's own liveness reporter: proves the schedule is turning.
pub struct HeartbeatClip {
    aspect: Rc<Aspect>,
    replica_id: usize,
}

impl HeartbeatClip {
    pub fn new(aspect: Rc<Aspect>, replica_id: usize) -> Self {
        Self { aspect, replica_id }
    }
}

impl Clip for HeartbeatClip {
    fn clip(&mut self, _ctx: &ClipCtx) {
        self.aspect.indicate(self.replica_id, true);
    }
}
