// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The downlink cycle: a frame from the stream is staged into radio
//! memory, transmitted, and monitored to completion.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use app_flight::builder::SharedClip;
use app_flight::sim::{StubRadio, StubRadioClip};
use app_flight::FlightBuilder;
use drv_radio::{DownlinkState, RadioDownlinkClip, DOWNLINK_BUF_LOCAL_SIZE};
use drv_starwire::rmap::{Rmap, RmapPath, RmapRouting};
use duct::{Duct, DuctConfig, DuctPolarity};
use exec::{ClipCtx, Clock, FnClip, SimClock};
use task_vigil::{Aspect, AspectConfig};

const DUCT_SIZE: usize = 1100;

struct Rig {
    schedule: exec::Schedule,
    stub: Rc<RefCell<StubRadio>>,
    downlink: Rc<RefCell<RadioDownlinkClip>>,
    feed: Rc<RefCell<VecDeque<Vec<u8>>>>,
    aspect_oks: Rc<RefCell<Vec<bool>>>,
}

fn rig() -> Rig {
    let clock = Rc::new(SimClock::new(0));

    let request = Rc::new(Duct::new(DuctConfig {
        label: "down-req",
        sender_replicas: 1,
        receiver_replicas: 1,
        max_flow: 1,
        message_size: DUCT_SIZE,
        polarity: DuctPolarity::SenderFirst,
    }));
    let reply = Rc::new(Duct::new(DuctConfig {
        label: "down-rep",
        sender_replicas: 1,
        receiver_replicas: 1,
        max_flow: 1,
        message_size: DUCT_SIZE,
        polarity: DuctPolarity::ReceiverFirst,
    }));
    let stream_duct = Rc::new(Duct::new(DuctConfig {
        label: "down-stream",
        sender_replicas: 1,
        receiver_replicas: 1,
        max_flow: 1,
        message_size: DOWNLINK_BUF_LOCAL_SIZE,
        polarity: DuctPolarity::ReceiverFirst,
    }));

    let rmap = Rmap::new(
        "radio-down",
        RmapRouting {
            destination: RmapPath::logical(0x42),
            source: RmapPath::logical(0x38),
            dest_key: 0x9D,
        },
        Rc::clone(&request),
        Rc::clone(&reply),
    );

    let aspect = Aspect::new(AspectConfig {
        label: "radio-down",
        timeout_ns: 100_000_000,
        reporter_replicas: 1,
        voter_replicas: 1,
    });
    aspect.populate_timeout(0);

    let stub = Rc::new(RefCell::new(StubRadio::new(0x42, 0x9D)));
    stub.borrow_mut().port(request, reply);

    let (downlink_clip, downlink) = SharedClip::new(RadioDownlinkClip::new(
        rmap,
        Rc::clone(&aspect),
        Rc::clone(&stream_duct),
    ));

    let aspect_oks: Rc<RefCell<Vec<bool>>> = Rc::default();
    let checker = {
        let aspect = Rc::clone(&aspect);
        let aspect_oks = Rc::clone(&aspect_oks);
        move |ctx: &ClipCtx| {
            aspect_oks.borrow_mut().push(aspect.check(0, ctx.epoch_start));
        }
    };

    let feed: Rc<RefCell<VecDeque<Vec<u8>>>> = Rc::default();
    let feeder = {
        let feed = Rc::clone(&feed);
        let stream_duct = Rc::clone(&stream_duct);
        let downlink = Rc::clone(&downlink);
        // the comm layer paces itself on the radio's readiness; a frame
        // offered mid-transmission would be dropped
        move |ctx: &ClipCtx| {
            let mut txn = stream_duct.send_prepare(0);
            if downlink.borrow().state() == DownlinkState::WaitingForStream && txn.allowed() {
                if let Some(frame) = feed.borrow_mut().pop_front() {
                    txn.send(&frame, ctx.clip_start);
                }
            }
            txn.commit();
        }
    };

    let mut builder = FlightBuilder::new(clock as Rc<dyn Clock>);
    builder
        .clip("radio-downlink", 250_000, Box::new(downlink_clip))
        .clip("stub-radio", 250_000, Box::new(StubRadioClip(Rc::clone(&stub))))
        .clip("aspect-check", 250_000, Box::new(FnClip(checker)))
        .clip("stream-feed", 250_000, Box::new(FnClip(feeder)));

    Rig {
        schedule: builder.build(),
        stub,
        downlink,
        feed,
        aspect_oks,
    }
}

#[test]
fn frame_is_staged_transmitted_and_monitored_to_idle() {
    let mut rig = rig();

    // initialization: query config, disable the transmitter
    rig.schedule.run_epochs(4);
    assert_eq!(
        rig.downlink.borrow().state(),
        DownlinkState::WaitingForStream,
    );

    let frame: Vec<u8> = (0..200u32).map(|n| (n * 7) as u8).collect();
    rig.feed.borrow_mut().push_back(frame.clone());
    rig.schedule.run_epochs(5);

    // the frame is in the transmit region and the transmitter is running
    {
        let stub = rig.stub.borrow();
        let base = drv_radio::tx_region().base as usize;
        assert_eq!(&stub.memory()[base..base + frame.len()], &frame[..]);
    }

    // the device drains the frame over a few epochs
    let mut transmitted = Vec::new();
    for _ in 0..6 {
        transmitted.extend(rig.stub.borrow_mut().tx_drain(64));
        rig.schedule.run_epochs(1);
    }
    assert_eq!(transmitted, frame);

    rig.schedule.run_epochs(2);
    assert_eq!(
        rig.downlink.borrow().state(),
        DownlinkState::WaitingForStream,
    );
    // a completed transmission is the downlink's liveness proof
    assert!(rig.aspect_oks.borrow().iter().any(|&ok| ok));
}

#[test]
fn back_to_back_frames_transmit_in_order() {
    let mut rig = rig();
    rig.schedule.run_epochs(4);

    rig.feed.borrow_mut().push_back(vec![0x11; 40]);
    rig.feed.borrow_mut().push_back(vec![0x22; 40]);

    let mut transmitted = Vec::new();
    for _ in 0..30 {
        transmitted.extend(rig.stub.borrow_mut().tx_drain(64));
        rig.schedule.run_epochs(1);
    }
    let mut expected = vec![0x11; 40];
    expected.extend(vec![0x22; 40]);
    assert_eq!(transmitted, expected);
}
