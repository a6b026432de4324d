// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Packet transfer across an established link: content, ordering, and the
//! receive timestamp matching the sender's transmission time.

use app_flight::sim::{LinkPair, EPOCH_NS};
use drv_starwire::exchange::ExchangeState;
use exec::NS_PER_MS;

fn established_pair() -> LinkPair {
    let mut pair = LinkPair::new(0x1234, 0x5678);
    pair.run_epochs(20);
    assert_eq!(
        pair.a.borrow().note_snapshot().exc_state,
        ExchangeState::Operating,
    );
    assert_eq!(
        pair.b.borrow().note_snapshot().exc_state,
        ExchangeState::Operating,
    );
    pair
}

#[test]
fn packet_crosses_with_senders_timestamp() {
    let mut pair = established_pair();

    pair.a_port
        .outbox
        .borrow_mut()
        .push_back(vec![0x01, 0x02, 0x03, 0x04]);
    pair.run_epochs(2);

    let inbox = pair.b_port.inbox.borrow();
    assert_eq!(inbox.len(), 1);
    let (packet, timestamp) = &inbox[0];
    assert_eq!(packet, &vec![0x01, 0x02, 0x03, 0x04]);

    // the port queued the packet during epoch 20, so side A's transmit
    // clip put it on the line in epoch 21; line chunks carry the sending
    // epoch's start time
    let epoch_21_start = NS_PER_MS + 21 * EPOCH_NS;
    assert_eq!(*timestamp, epoch_21_start);
}

#[test]
fn packets_arrive_in_order_in_both_directions() {
    let mut pair = established_pair();

    for n in 0..6u8 {
        pair.a_port.outbox.borrow_mut().push_back(vec![0xA0, n]);
        pair.b_port.outbox.borrow_mut().push_back(vec![0xB0, n]);
    }
    pair.run_epochs(12);

    let to_b: Vec<Vec<u8>> = pair
        .b_port
        .inbox
        .borrow()
        .iter()
        .map(|(p, _)| p.clone())
        .collect();
    let to_a: Vec<Vec<u8>> = pair
        .a_port
        .inbox
        .borrow()
        .iter()
        .map(|(p, _)| p.clone())
        .collect();
    let expect_b: Vec<Vec<u8>> = (0..6u8).map(|n| vec![0xA0, n]).collect();
    let expect_a: Vec<Vec<u8>> = (0..6u8).map(|n| vec![0xB0, n]).collect();
    assert_eq!(to_b, expect_b);
    assert_eq!(to_a, expect_a);
}

#[test]
fn maximum_size_packet_survives() {
    let mut pair = established_pair();

    // exactly fills the receive buffer; every reserved byte value included
    // so the escape path gets exercised end to end
    let payload: Vec<u8> = (0..64).map(|n| 0xC0u8.wrapping_add(n)).collect();
    pair.a_port.outbox.borrow_mut().push_back(payload.clone());
    pair.run_epochs(6);

    let inbox = pair.b_port.inbox.borrow();
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].0, payload);
}
