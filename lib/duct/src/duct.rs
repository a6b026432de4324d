// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The duct proper: a fixed-flow, strict-voting, replicated channel.
//!
//! State is a message buffer indexed `[sender][flow]` and a flow-status
//! matrix indexed `[sender][receiver]` whose cells are either a committed
//! flow count or [`MISSING_FLOW`]. Senders and receivers interact through
//! prepare/commit transactions; the epoch lock is held for the duration of a
//! transaction.
//!
//! Receiving performs strict voting: every sender replica must have
//! committed an identical message (size, timestamp, and body) at each flow
//! index, and any divergence is fatal. This localizes replica-divergence
//! detection to the exact point where inconsistent data would otherwise leak
//! into a non-replicated consumer.

use std::cell::RefCell;

use exec::Timestamp;
use static_assertions::const_assert;

use crate::eplock::EpLock;

pub const MAX_REPLICAS: usize = 254;
pub const MAX_FLOW: usize = 254;
/// Flow-status sentinel: no flow committed by this sender for this receiver.
pub const MISSING_FLOW: u8 = 255;

const_assert!(MAX_REPLICAS < MISSING_FLOW as usize + 1);
const_assert!(MAX_FLOW < MISSING_FLOW as usize);

/// Selects which side acts first in the steady-state schedule, which decides
/// how the flow-status matrix must be primed at startup.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DuctPolarity {
    /// Senders run before receivers each epoch; the matrix starts MISSING.
    SenderFirst,
    /// Receivers run before senders each epoch; the matrix starts as if
    /// every sender had committed an empty flow.
    ReceiverFirst,
}

#[derive(Clone)]
pub struct DuctConfig {
    pub label: &'static str,
    pub sender_replicas: usize,
    pub receiver_replicas: usize,
    pub max_flow: usize,
    pub message_size: usize,
    pub polarity: DuctPolarity,
}

struct Slot {
    size: usize,
    timestamp: Timestamp,
    body: Box<[u8]>,
}

struct State {
    /// `[sender][receiver]`, row-major.
    flow_status: Box<[u8]>,
    /// `[sender][flow]`, row-major.
    slots: Box<[Slot]>,
    /// Scratch for the current transaction holder.
    flow_current: u8,
}

pub struct Duct {
    label: &'static str,
    sender_replicas: usize,
    receiver_replicas: usize,
    max_flow: usize,
    message_size: usize,
    lock: EpLock,
    state: RefCell<State>,
}

impl Duct {
    /// Allocates the duct's storage. This is the only allocation the duct
    /// ever performs.
    pub fn new(config: DuctConfig) -> Self {
        assert!(
            (1..=MAX_REPLICAS).contains(&config.sender_replicas),
            "duct '{}': invalid number of sender replicas",
            config.label,
        );
        assert!(
            (1..=MAX_REPLICAS).contains(&config.receiver_replicas),
            "duct '{}': invalid number of receiver replicas",
            config.label,
        );
        assert!(
            (1..=MAX_FLOW).contains(&config.max_flow),
            "duct '{}': invalid max flow",
            config.label,
        );
        assert!(
            config.message_size >= 1,
            "duct '{}': invalid message size",
            config.label,
        );

        let initial_flow = match config.polarity {
            DuctPolarity::SenderFirst => MISSING_FLOW,
            DuctPolarity::ReceiverFirst => 0,
        };
        let flow_status =
            vec![initial_flow; config.sender_replicas * config.receiver_replicas].into_boxed_slice();
        let slots = (0..config.sender_replicas * config.max_flow)
            .map(|_| Slot {
                size: 0,
                timestamp: 0,
                body: vec![0u8; config.message_size].into_boxed_slice(),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            label: config.label,
            sender_replicas: config.sender_replicas,
            receiver_replicas: config.receiver_replicas,
            max_flow: config.max_flow,
            message_size: config.message_size,
            lock: EpLock::new(config.label),
            state: RefCell::new(State {
                flow_status,
                slots,
                flow_current: MISSING_FLOW,
            }),
        }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn message_size(&self) -> usize {
        self.message_size
    }

    pub fn max_flow(&self) -> usize {
        self.max_flow
    }

    pub fn sender_replicas(&self) -> usize {
        self.sender_replicas
    }

    pub fn receiver_replicas(&self) -> usize {
        self.receiver_replicas
    }

    /// Begins a send transaction. Aborts if any of this sender's previous
    /// flows has not been consumed: the previous receiver did not act on
    /// schedule.
    pub fn send_prepare(&self, sender_id: usize) -> DuctSendTxn<'_> {
        assert!(sender_id < self.sender_replicas);
        self.lock.acquire();

        let mut state = self.state.borrow_mut();
        for receiver_id in 0..self.receiver_replicas {
            let status = state.flow_status[sender_id * self.receiver_replicas + receiver_id];
            if status != MISSING_FLOW {
                panic!(
                    "temporal ordering broken on duct '{}': \
                     receiver {receiver_id} did not act on schedule",
                    self.label,
                );
            }
        }
        state.flow_current = 0;
        drop(state);

        DuctSendTxn {
            duct: self,
            sender_id,
            committed: false,
        }
    }

    /// Begins a receive transaction. Aborts if any sender has not committed
    /// a flow for this receiver: the previous sender did not act on schedule.
    pub fn receive_prepare(&self, receiver_id: usize) -> DuctRecvTxn<'_> {
        assert!(receiver_id < self.receiver_replicas);
        self.lock.acquire();

        let mut state = self.state.borrow_mut();
        for sender_id in 0..self.sender_replicas {
            let status = state.flow_status[sender_id * self.receiver_replicas + receiver_id];
            if status == MISSING_FLOW {
                panic!(
                    "temporal ordering broken on duct '{}': \
                     sender {sender_id} did not act on schedule",
                    self.label,
                );
            }
            assert!(status as usize <= self.max_flow);
        }
        state.flow_current = 0;
        drop(state);

        DuctRecvTxn {
            duct: self,
            receiver_id,
            committed: false,
        }
    }

    fn slot_index(&self, sender_id: usize, flow_index: usize) -> usize {
        debug_assert!(sender_id < self.sender_replicas && flow_index < self.max_flow);
        sender_id * self.max_flow + flow_index
    }
}

/// A send transaction. Must be committed; dropping one uncommitted outside
/// of a panic is a contract violation.
pub struct DuctSendTxn<'a> {
    duct: &'a Duct,
    sender_id: usize,
    committed: bool,
}

impl DuctSendTxn<'_> {
    /// True if at least one more message may be sent this epoch.
    pub fn allowed(&self) -> bool {
        let state = self.duct.state.borrow();
        assert!(state.flow_current as usize <= self.duct.max_flow);
        (state.flow_current as usize) < self.duct.max_flow
    }

    /// Copies one message into the transit buffer. Aborts if the flow budget
    /// is exhausted or the message is empty or oversized.
    pub fn send(&mut self, message: &[u8], timestamp: Timestamp) {
        assert!(
            !message.is_empty() && message.len() <= self.duct.message_size,
            "duct '{}': message size {} outside 1..={}",
            self.duct.label,
            message.len(),
            self.duct.message_size,
        );
        let mut state = self.duct.state.borrow_mut();
        let flow = state.flow_current as usize;
        assert!(
            flow < self.duct.max_flow,
            "duct '{}': sender {} exceeded max flow {}",
            self.duct.label,
            self.sender_id,
            self.duct.max_flow,
        );
        let slot = &mut state.slots[self.duct.slot_index(self.sender_id, flow)];
        slot.size = message.len();
        slot.timestamp = timestamp;
        slot.body[..message.len()].copy_from_slice(message);
        state.flow_current += 1;
    }

    /// Publishes the flow count to every receiver and releases the lock.
    pub fn commit(mut self) {
        let mut state = self.duct.state.borrow_mut();
        assert!(state.flow_current as usize <= self.duct.max_flow);
        for receiver_id in 0..self.duct.receiver_replicas {
            let cell = self.sender_id * self.duct.receiver_replicas + receiver_id;
            assert!(state.flow_status[cell] == MISSING_FLOW);
            state.flow_status[cell] = state.flow_current;
        }
        state.flow_current = MISSING_FLOW;
        drop(state);
        self.duct.lock.release();
        self.committed = true;
    }
}

impl Drop for DuctSendTxn<'_> {
    fn drop(&mut self) {
        if !self.committed && !std::thread::panicking() {
            panic!(
                "duct '{}': send transaction dropped without commit",
                self.duct.label,
            );
        }
    }
}

/// A receive transaction. Must be committed after draining the full flow.
pub struct DuctRecvTxn<'a> {
    duct: &'a Duct,
    receiver_id: usize,
    committed: bool,
}

impl DuctRecvTxn<'_> {
    /// Votes on the next flow index without copying it out, advancing
    /// `flow_current` past it. Returns the consumed flow index, the agreed
    /// size, and the agreed timestamp.
    fn vote_next(&mut self) -> Option<(usize, usize, Timestamp)> {
        let mut state = self.duct.state.borrow_mut();
        assert!(state.flow_current as usize <= self.duct.max_flow);
        if state.flow_current as usize == self.duct.max_flow {
            return None;
        }

        // all senders must agree on whether they have another message for us
        let mut another_count = 0;
        for sender_id in 0..self.duct.sender_replicas {
            let status =
                state.flow_status[sender_id * self.duct.receiver_replicas + self.receiver_id];
            assert!(status != MISSING_FLOW && status as usize <= self.duct.max_flow);
            if status > state.flow_current {
                another_count += 1;
            }
        }
        if another_count == 0 {
            return None;
        }
        assert!(
            another_count == self.duct.sender_replicas,
            "duct '{}': replicas disagree on flow count at index {}",
            self.duct.label,
            state.flow_current,
        );

        let flow = state.flow_current as usize;
        let first = &state.slots[self.duct.slot_index(0, flow)];
        let size = first.size;
        let timestamp = first.timestamp;
        assert!(size >= 1 && size <= self.duct.message_size);

        for sender_id in 1..self.duct.sender_replicas {
            let other = &state.slots[self.duct.slot_index(sender_id, flow)];
            if other.size != size
                || other.timestamp != timestamp
                || other.body[..size] != first.body[..size]
            {
                panic!(
                    "duct '{}': replica {sender_id} diverged at flow index {flow}",
                    self.duct.label,
                );
            }
        }

        state.flow_current += 1;
        Some((flow, size, timestamp))
    }

    /// Receives the next message into `out`, returning its size and send
    /// timestamp, or `None` when the epoch's flow is exhausted.
    ///
    /// All sender replicas vote: they must agree on whether another message
    /// exists, and on its exact content. Divergence is fatal.
    pub fn receive_timestamped(&mut self, out: &mut [u8]) -> Option<(usize, Timestamp)> {
        let (flow, size, timestamp) = self.vote_next()?;
        let state = self.duct.state.borrow();
        assert!(
            out.len() >= size,
            "duct '{}': receive buffer too small ({} < {})",
            self.duct.label,
            out.len(),
            size,
        );
        out[..size].copy_from_slice(&state.slots[self.duct.slot_index(0, flow)].body[..size]);
        Some((size, timestamp))
    }

    /// As [`Self::receive_timestamped`], returning only the size (0 when the
    /// flow is exhausted).
    pub fn receive(&mut self, out: &mut [u8]) -> usize {
        self.receive_timestamped(out).map_or(0, |(size, _)| size)
    }

    /// Consumes the next message without copying it out, returning its size
    /// (0 when the flow is exhausted). Voting still applies.
    pub fn discard(&mut self) -> usize {
        self.vote_next().map_or(0, |(_, size, _)| size)
    }

    /// Verifies that the full flow was consumed, marks it so, and releases
    /// the lock.
    pub fn commit(mut self) {
        let mut state = self.duct.state.borrow_mut();
        assert!(state.flow_current as usize <= self.duct.max_flow);
        for sender_id in 0..self.duct.sender_replicas {
            let cell = sender_id * self.duct.receiver_replicas + self.receiver_id;
            assert!(
                state.flow_status[cell] == state.flow_current,
                "duct '{}': receiver {} left messages unprocessed \
                 (flow_status={}, flow_current={})",
                self.duct.label,
                self.receiver_id,
                state.flow_status[cell],
                state.flow_current,
            );
            state.flow_status[cell] = MISSING_FLOW;
        }
        state.flow_current = MISSING_FLOW;
        drop(state);
        self.duct.lock.release();
        self.committed = true;
    }
}

impl Drop for DuctRecvTxn<'_> {
    fn drop(&mut self) {
        if !self.committed && !std::thread::panicking() {
            panic!(
                "duct '{}': receive transaction dropped without commit",
                self.duct.label,
            );
        }
    }
}
