// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The watchdog chain end to end: recipes flow to the voter, food flows
//! back inside the window, and a stale aspect forces a board reset.

use std::cell::Cell;
use std::rc::Rc;

use app_flight::FlightBuilder;
use duct::{Duct, DuctConfig, DuctPolarity};
use exec::{ClipCtx, Clock, FnClip, InitStage, SimClock};
use task_vigil::{
    Aspect, AspectConfig, WatchdogMmio, WatchdogMonitorClip, WatchdogVoterClip, FOOD_MSG_SIZE,
    RECIPE_MSG_SIZE,
};

use app_flight::sim::StubWatchdogMmio;

struct Rig {
    schedule: exec::Schedule,
    mmio: Rc<StubWatchdogMmio>,
    healthy: Rc<Cell<bool>>,
}

fn rig() -> Rig {
    let clock = Rc::new(SimClock::new(0));

    let aspect = Aspect::new(AspectConfig {
        label: "payload",
        timeout_ns: 100_000_000,
        reporter_replicas: 1,
        voter_replicas: 1,
    });

    let recipe_duct = Rc::new(Duct::new(DuctConfig {
        label: "wdt-recipe",
        sender_replicas: 1,
        receiver_replicas: 1,
        max_flow: 1,
        message_size: RECIPE_MSG_SIZE,
        polarity: DuctPolarity::ReceiverFirst,
    }));
    let food_duct = Rc::new(Duct::new(DuctConfig {
        label: "wdt-food",
        sender_replicas: 1,
        receiver_replicas: 1,
        max_flow: 1,
        message_size: FOOD_MSG_SIZE,
        polarity: DuctPolarity::SenderFirst,
    }));

    // deadline at 150ms, feeding window opens 50ms before, 100ms period
    let mmio = Rc::new(StubWatchdogMmio::new(
        0xBEEF, 150_000_000, 50_000_000, 100_000_000,
    ));

    let healthy = Rc::new(Cell::new(true));
    let reporter = {
        let aspect = Rc::clone(&aspect);
        let healthy = Rc::clone(&healthy);
        move |_ctx: &ClipCtx| {
            aspect.indicate(0, healthy.get());
        }
    };

    let voter = WatchdogVoterClip::new(
        0,
        vec![Rc::clone(&aspect)],
        Rc::clone(&recipe_duct),
        Rc::clone(&food_duct),
    );
    let monitor = WatchdogMonitorClip::new(
        Rc::clone(&mmio) as Rc<dyn task_vigil::WatchdogMmio>,
        food_duct,
        recipe_duct,
    );

    let mut builder = FlightBuilder::new(clock as Rc<dyn Clock>);
    builder
        .init_hook(InitStage::Ready, {
            let aspect = Rc::clone(&aspect);
            Box::new(move || aspect.populate_timeout(0))
        })
        .clip("payload-heartbeat", 250_000, Box::new(FnClip(reporter)))
        .clip("wdt-voter", 250_000, Box::new(voter))
        .clip("wdt-monitor", 250_000, Box::new(monitor));

    Rig {
        schedule: builder.build(),
        mmio,
        healthy,
    }
}

#[test]
fn healthy_system_feeds_inside_the_window() {
    let mut rig = rig();
    // the window opens at 100ms; one feeding must land before the deadline
    rig.schedule.run_epochs(140);
    assert!(!rig.mmio.reset_triggered());
    assert!(rig.mmio.feedings() >= 1);
    // the deadline moved out by one period
    assert_eq!(rig.mmio.deadline(), 250_000_000);
}

#[test]
fn stale_aspect_forces_reset() {
    let mut rig = rig();
    rig.schedule.run_epochs(140);
    assert!(!rig.mmio.reset_triggered());

    // the payload stops confirming; 100ms later the voter gives up
    rig.healthy.set(false);
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        rig.schedule.run_epochs(300);
    }));
    assert!(outcome.is_err(), "the forced reset aborts the process");
    assert!(rig.mmio.reset_triggered());
    // no further feedings happened after the fault
    assert!(rig.mmio.deadline() <= 350_000_000);
}
