// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Three replicas of one exchange against a simplex peer: the replicas must
//! march in lockstep (every line chunk and packet they emit is voted on by
//! the ducts), and traffic must flow both ways through the votes.

use std::cell::RefCell;
use std::rc::Rc;

use app_flight::sim::PortClip;
use app_flight::FlightBuilder;
use drv_starwire::exchange::{Exchange, ExchangeConfig, ExchangeState};
use drv_starwire::rand::RandomClip;
use duct::{Duct, DuctConfig, DuctPolarity};
use exec::{Clock, SimClock};

const REPLICAS: usize = 3;
const BUF_SIZE: usize = 64;
const BUDGET: u32 = 80_000;
const EPOCH_NS: u64 = 12 * BUDGET as u64;

fn duct(
    label: &'static str,
    senders: usize,
    receivers: usize,
    max_flow: usize,
    message_size: usize,
    polarity: DuctPolarity,
) -> Rc<Duct> {
    Rc::new(Duct::new(DuctConfig {
        label,
        sender_replicas: senders,
        receiver_replicas: receivers,
        max_flow,
        message_size,
        polarity,
    }))
}

struct Rig {
    schedule: exec::Schedule,
    replicas: Vec<Rc<RefCell<Exchange>>>,
    b: Rc<RefCell<Exchange>>,
    a_port: app_flight::sim::PortHandles,
    b_port: app_flight::sim::PortHandles,
}

fn rig() -> Rig {
    let clock = Rc::new(SimClock::new(0));
    let line_size = BUF_SIZE + 1024;

    let rand_a = duct("rand-a", 1, REPLICAS, 1, 4, DuctPolarity::SenderFirst);
    let rand_b = duct("rand-b", 1, 1, 1, 4, DuctPolarity::SenderFirst);
    let a_to_b = duct("line-a-to-b", REPLICAS, 1, 1, line_size, DuctPolarity::SenderFirst);
    let b_to_a = duct("line-b-to-a", 1, REPLICAS, 1, line_size, DuctPolarity::SenderFirst);
    let a_read = duct("a-read", REPLICAS, 1, 2, BUF_SIZE, DuctPolarity::SenderFirst);
    let a_write = duct("a-write", 1, REPLICAS, 2, BUF_SIZE, DuctPolarity::ReceiverFirst);
    let b_read = duct("b-read", 1, 1, 2, BUF_SIZE, DuctPolarity::SenderFirst);
    let b_write = duct("b-write", 1, 1, 2, BUF_SIZE, DuctPolarity::ReceiverFirst);

    let replicas: Vec<Rc<RefCell<Exchange>>> = (0..REPLICAS)
        .map(|replica_id| {
            Rc::new(RefCell::new(Exchange::new(
                ExchangeConfig {
                    label: "exc-a",
                    replica_id,
                    epoch_ns: EPOCH_NS,
                },
                Rc::clone(&rand_a),
                Rc::clone(&b_to_a),
                Rc::clone(&a_to_b),
                Rc::clone(&a_read),
                Rc::clone(&a_write),
            )))
        })
        .collect();
    let b = Rc::new(RefCell::new(Exchange::new(
        ExchangeConfig {
            label: "exc-b",
            replica_id: 0,
            epoch_ns: EPOCH_NS,
        },
        Rc::clone(&rand_b),
        Rc::clone(&a_to_b),
        Rc::clone(&b_to_a),
        Rc::clone(&b_read),
        Rc::clone(&b_write),
    )));

    let a_port_clip = PortClip::new(Rc::clone(&a_read), Rc::clone(&a_write));
    let b_port_clip = PortClip::new(Rc::clone(&b_read), Rc::clone(&b_write));
    let a_port = a_port_clip.handles();
    let b_port = b_port_clip.handles();

    let mut builder = FlightBuilder::new(clock as Rc<dyn Clock>);
    builder
        .clip("rand-a", BUDGET, Box::new(RandomClip::new(rand_a, 0x1234)))
        .clip("rand-b", BUDGET, Box::new(RandomClip::new(rand_b, 0x5678)));
    for (replica_id, exchange) in replicas.iter().enumerate() {
        let names = ["exc-a0-tx", "exc-a1-tx", "exc-a2-tx"];
        let (tx, _) = Exchange::clips(Rc::clone(exchange));
        builder.clip(names[replica_id], BUDGET, Box::new(tx));
    }
    {
        let (tx, _) = Exchange::clips(Rc::clone(&b));
        builder.clip("exc-b-tx", BUDGET, Box::new(tx));
    }
    for (replica_id, exchange) in replicas.iter().enumerate() {
        let names = ["exc-a0-rx", "exc-a1-rx", "exc-a2-rx"];
        let (_, rx) = Exchange::clips(Rc::clone(exchange));
        builder.clip(names[replica_id], BUDGET, Box::new(rx));
    }
    {
        let (_, rx) = Exchange::clips(Rc::clone(&b));
        builder.clip("exc-b-rx", BUDGET, Box::new(rx));
    }
    builder
        .clip("port-a", BUDGET, Box::new(a_port_clip))
        .clip("port-b", BUDGET, Box::new(b_port_clip));

    Rig {
        schedule: builder.build(),
        replicas,
        b,
        a_port,
        b_port,
    }
}

#[test]
fn replicas_march_in_lockstep_and_carry_traffic() {
    let mut rig = rig();

    rig.schedule.run_epochs(25);
    for exchange in &rig.replicas {
        assert_eq!(
            exchange.borrow().note_snapshot().exc_state,
            ExchangeState::Operating,
        );
    }
    assert_eq!(
        rig.b.borrow().note_snapshot().exc_state,
        ExchangeState::Operating,
    );

    // every replica's note must be bit-identical
    let reference = rig.replicas[0].borrow().note_snapshot();
    for exchange in &rig.replicas[1..] {
        assert_eq!(exchange.borrow().note_snapshot(), reference);
    }

    // replicated side to simplex side: the line duct votes on three
    // identical chunks, the peer sees one
    rig.a_port.outbox.borrow_mut().push_back(vec![0xAB, 0xCD]);
    rig.schedule.run_epochs(3);
    {
        let inbox = rig.b_port.inbox.borrow();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].0, vec![0xAB, 0xCD]);
    }

    // simplex side to replicated side: the read duct votes on the three
    // replicas' committed packets
    rig.b_port.outbox.borrow_mut().push_back(vec![0x01, 0x02, 0x03]);
    rig.schedule.run_epochs(3);
    {
        let inbox = rig.a_port.inbox.borrow();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].0, vec![0x01, 0x02, 0x03]);
    }

    // the replicas are still in agreement after carrying traffic
    let reference = rig.replicas[0].borrow().note_snapshot();
    for exchange in &rig.replicas[1..] {
        assert_eq!(exchange.borrow().note_snapshot(), reference);
    }
}
