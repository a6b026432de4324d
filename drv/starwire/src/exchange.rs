// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The link exchange protocol.
//!
//! Each end of a line runs an exchange: a three-state machine (CONNECTING,
//! HANDSHAKING, OPERATING) that establishes a session over the codec and
//! then moves packets under flow control. Packets may only be transmitted
//! against flow-control tokens (FCTs) granted by the peer; keep-alive tokens
//! (KATs) cross-check the packet counts so a silently desynchronized session
//! tears itself down.
//!
//! An exchange replica runs as two clips. The transmit clip consumes the
//! epoch's randomness, handles handshake/reminder timing, and encodes
//! outbound traffic; the receive clip decodes inbound traffic, walks the
//! state machine, and grants credit. The two share one replicated note.
//!
//! Any protocol violation resets the session: both directions drop whatever
//! packet was in progress, counters clear, and the ends re-handshake.

use std::cell::RefCell;
use std::rc::Rc;

use byteorder::{BigEndian, ByteOrder};
use duct::{Duct, Notepad};
use exec::{Clip, ClipCtx, Timestamp, NS_PER_MS};
use ringbuf::{ringbuf, ringbuf_entry};

use crate::codec::{Decoder, DecoderSynch, Encoder, Symbol};
use crate::MAX_OUTSTANDING_TOKENS;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Trace {
    PrimarySent(u32),
    SecondarySent(u32),
    Operating(u32),
    Reset(&'static str),
    FctGrant(u32),
    PacketCommitted(usize),
    PacketSent(usize),
    EmptyPacketDropped,
    PendingOverflow,
    ReceiveOverflow,
}

ringbuf!(Trace, 64);

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ExchangeState {
    /// Waiting for a primary handshake; will send one of our own when the
    /// countdown expires.
    #[default]
    Connecting,
    /// Primary sent; waiting for the matching secondary.
    Handshaking,
    /// Session established.
    Operating,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ReceiveState {
    /// Waiting for a start-of-packet character.
    #[default]
    Listening,
    /// Receiving the data body of a packet.
    Receiving,
    /// Packet too large for the buffer; discarding until it ends.
    Overflowed,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum TransmitState {
    /// Waiting for a new packet to send.
    #[default]
    Idle,
    /// Waiting to transmit the start-of-packet character.
    Header,
    /// Transmitting data characters.
    Body,
    /// Waiting to transmit the end-of-packet character.
    Footer,
}

/// The replicated note: every field the exchange must agree on across
/// replicas and carry across epochs.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct ExchangeNote {
    pub random: u32,

    pub exc_state: ExchangeState,
    pub recv_state: ReceiveState,
    pub txmit_state: TransmitState,

    /// Epochs until the next spontaneous event (handshake or reminders).
    pub countdown_timeout: u32,

    pub send_handshake_id: u32,
    pub recv_handshake_id: u32,
    pub send_primary_handshake: bool,
    pub send_secondary_handshake: bool,

    pub fcts_sent: u32,
    pub fcts_rcvd: u32,
    pub pkts_sent: u32,
    pub pkts_rcvd: u32,
    pub resend_fcts: bool,
    pub resend_pkts: bool,

    /// Bytes of the in-progress inbound packet already in the read buffer.
    pub read_offset: usize,
    pub read_timestamp: Timestamp,

    /// Current outbound packet length and transmit progress.
    pub write_length: usize,
    pub write_offset: usize,
    /// An outbound packet was cut off by a reset; flush an error character
    /// so the peer cannot mistake a retransmission for a continuation.
    pub write_needs_error: bool,

    pub decoder_synch: DecoderSynch,
}

pub struct ExchangeConfig {
    pub label: &'static str,
    pub replica_id: usize,
    /// Nominal epoch duration, used to convert the 3–10 ms event spacing
    /// into a countdown in epochs.
    pub epoch_ns: u64,
}

/// Bounded packet queue between the write duct (which must be drained every
/// epoch) and the credit-gated transmitter.
struct PendingQueue {
    slots: Vec<PendingSlot>,
    head: usize,
    used: usize,
}

struct PendingSlot {
    len: usize,
    data: Box<[u8]>,
}

impl PendingQueue {
    fn new(capacity: usize, message_size: usize) -> Self {
        assert!(capacity >= 1);
        Self {
            slots: (0..capacity)
                .map(|_| PendingSlot {
                    len: 0,
                    data: vec![0u8; message_size].into_boxed_slice(),
                })
                .collect(),
            head: 0,
            used: 0,
        }
    }

    /// Appends a packet, dropping the oldest pending one if full. Returns
    /// true if something was dropped.
    fn push(&mut self, bytes: &[u8]) -> bool {
        let mut dropped = false;
        if self.used == self.slots.len() {
            self.head = (self.head + 1) % self.slots.len();
            self.used -= 1;
            dropped = true;
        }
        let slot_index = (self.head + self.used) % self.slots.len();
        let slot = &mut self.slots[slot_index];
        slot.len = bytes.len();
        slot.data[..bytes.len()].copy_from_slice(bytes);
        self.used += 1;
        dropped
    }

    fn pop_into(&mut self, dst: &mut [u8]) -> Option<usize> {
        if self.used == 0 {
            return None;
        }
        let slot = &self.slots[self.head];
        dst[..slot.len].copy_from_slice(&slot.data[..slot.len]);
        let len = slot.len;
        self.head = (self.head + 1) % self.slots.len();
        self.used -= 1;
        Some(len)
    }
}

pub struct Exchange {
    label: &'static str,
    replica_id: usize,
    epoch_ns: u64,

    notepad: Notepad<ExchangeNote>,
    encoder: Encoder,
    decoder: Decoder,

    rand_duct: Rc<Duct>,
    read_duct: Rc<Duct>,
    write_duct: Rc<Duct>,

    /// In-progress inbound packet. Not replicated: divergence washes out
    /// when the duct votes on the committed packet.
    read_buffer: Box<[u8]>,
    /// Current outbound packet. Not replicated for the same reason.
    write_buffer: Box<[u8]>,
    scratch: Box<[u8]>,
    pending: PendingQueue,
}

impl Exchange {
    /// `line_rx`/`line_tx` are the byte-stream ducts to the line driver;
    /// `read`/`write` are the packet ducts to the bus consumer.
    pub fn new(
        config: ExchangeConfig,
        rand_duct: Rc<Duct>,
        line_rx: Rc<Duct>,
        line_tx: Rc<Duct>,
        read_duct: Rc<Duct>,
        write_duct: Rc<Duct>,
    ) -> Self {
        assert!(rand_duct.message_size() >= 4);
        // the credit ceiling must be able to cover a full epoch of packets
        assert!(
            read_duct.max_flow() as u32 <= MAX_OUTSTANDING_TOKENS,
            "exchange '{}' cannot receive this fast",
            config.label,
        );
        let read_size = read_duct.message_size();
        let write_size = write_duct.message_size();
        let pending_capacity = write_duct.max_flow() * 2;
        Self {
            label: config.label,
            replica_id: config.replica_id,
            epoch_ns: config.epoch_ns,
            notepad: Notepad::new(config.label, 1),
            encoder: Encoder::new(line_tx, config.replica_id),
            decoder: Decoder::new(line_rx, config.replica_id),
            rand_duct,
            read_duct,
            write_duct,
            read_buffer: vec![0u8; read_size].into_boxed_slice(),
            write_buffer: vec![0u8; write_size].into_boxed_slice(),
            scratch: vec![0u8; write_size].into_boxed_slice(),
            pending: PendingQueue::new(pending_capacity, write_size),
        }
    }

    /// Copies out the current note. Observability only.
    pub fn note_snapshot(&self) -> ExchangeNote {
        self.notepad.peek(0)
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    fn check_invariants(&self, note: &ExchangeNote) {
        assert!(
            note.pkts_sent <= note.fcts_rcvd
                && note.fcts_rcvd <= note.pkts_sent + MAX_OUTSTANDING_TOKENS,
            "exchange '{}' credit invariant violated: pkts_sent={}, fcts_rcvd={}",
            self.label,
            note.pkts_sent,
            note.fcts_rcvd,
        );
    }

    /// Random interval in the range [3ms, 10ms), expressed in epochs.
    fn period_epochs(&self, random: u32) -> u32 {
        let period_ns = 3 * NS_PER_MS + u64::from(random) % (7 * NS_PER_MS);
        (period_ns / self.epoch_ns).max(1) as u32
    }

    fn do_reset(note: &mut ExchangeNote, reason: &'static str) {
        ringbuf_entry!(Trace::Reset(reason));
        note.exc_state = ExchangeState::Connecting;
        // unless we're idle, make sure transmission starts over from the top
        if note.txmit_state != TransmitState::Idle {
            if matches!(note.txmit_state, TransmitState::Body | TransmitState::Footer) {
                note.write_needs_error = true;
            }
            note.txmit_state = TransmitState::Header;
            note.write_offset = 0;
        }
        note.recv_state = ReceiveState::Listening;
        note.read_offset = 0;
        note.send_handshake_id = 0;
        note.recv_handshake_id = 0;
        note.send_primary_handshake = false;
        note.send_secondary_handshake = false;
        note.fcts_sent = 0;
        note.fcts_rcvd = 0;
        note.pkts_sent = 0;
        note.pkts_rcvd = 0;
        note.resend_fcts = false;
        note.resend_pkts = false;
    }

    pub fn tx_clip(&mut self, ctx: &ClipCtx) {
        let mut note = self.notepad.feedforward(0, ctx.is_restart);
        let fresh = !note.valid();

        // this epoch's randomness
        let mut word = [0u8; 4];
        let mut rand_txn = self.rand_duct.receive_prepare(self.replica_id);
        if rand_txn.receive(&mut word) == 4 {
            note.random = BigEndian::read_u32(&word);
        }
        rand_txn.commit();

        // spontaneous-event timing
        if fresh {
            note.countdown_timeout = self.period_epochs(note.random);
        } else if note.countdown_timeout == 0 {
            if note.exc_state == ExchangeState::Operating {
                note.resend_fcts = true;
                note.resend_pkts = true;
            } else {
                note.send_primary_handshake = true;
            }
            note.countdown_timeout = self.period_epochs(note.random);
        } else {
            note.countdown_timeout -= 1;
        }

        self.check_invariants(&note);
        self.encoder.prepare();

        if note.send_primary_handshake && note.exc_state != ExchangeState::Operating {
            // pick an ID very likely to be distinct from the peer's
            let handshake_id = 0x8000_0000 | (note.random & 0x7FFF_FFFF);
            if self.encoder.encode_ctrl(Symbol::Handshake1, handshake_id) {
                note.send_handshake_id = handshake_id;
                note.exc_state = ExchangeState::Handshaking;
                note.send_primary_handshake = false;
                note.send_secondary_handshake = false;
                ringbuf_entry!(Trace::PrimarySent(handshake_id));
            }
        }

        if note.send_secondary_handshake && note.exc_state == ExchangeState::Connecting {
            if self
                .encoder
                .encode_ctrl(Symbol::Handshake2, note.recv_handshake_id)
            {
                note.exc_state = ExchangeState::Operating;
                note.send_primary_handshake = false;
                note.send_secondary_handshake = false;
                note.countdown_timeout = self.period_epochs(note.random);
                ringbuf_entry!(Trace::SecondarySent(note.recv_handshake_id));
                ringbuf_entry!(Trace::Operating(note.recv_handshake_id));
            }
        }

        if note.exc_state == ExchangeState::Operating {
            if note.resend_fcts && self.encoder.encode_ctrl(Symbol::FlowControl, note.fcts_sent) {
                note.resend_fcts = false;
            }
            if note.resend_pkts && self.encoder.encode_ctrl(Symbol::KeepAlive, note.pkts_sent) {
                note.resend_pkts = false;
            }
            if note.write_needs_error && self.encoder.encode_ctrl(Symbol::ErrorPacket, 0) {
                note.write_needs_error = false;
            }
        }

        // drain the write duct into the pending queue (mandatory every epoch)
        {
            let mut txn = self.write_duct.receive_prepare(self.replica_id);
            loop {
                let len = txn.receive(&mut self.scratch);
                if len == 0 {
                    break;
                }
                if self.pending.push(&self.scratch[..len]) {
                    ringbuf_entry!(Trace::PendingOverflow);
                }
            }
            txn.commit();
        }

        // transmit pump: keep going until we run out of packets or space
        loop {
            if note.txmit_state == TransmitState::Idle {
                match self.pending.pop_into(&mut self.write_buffer) {
                    Some(len) => {
                        assert!(len > 0);
                        note.write_length = len;
                        note.write_offset = 0;
                        note.txmit_state = TransmitState::Header;
                    }
                    None => break,
                }
            }

            if note.exc_state == ExchangeState::Operating
                && note.txmit_state == TransmitState::Header
                && note.pkts_sent < note.fcts_rcvd
                && self.encoder.encode_ctrl(Symbol::StartPacket, 0)
            {
                note.txmit_state = TransmitState::Body;
                note.pkts_sent += 1;
            }

            if note.exc_state == ExchangeState::Operating
                && note.txmit_state == TransmitState::Body
            {
                debug_assert!(note.write_offset < note.write_length);
                let written = self
                    .encoder
                    .encode_data(&self.write_buffer[note.write_offset..note.write_length]);
                note.write_offset += written;
                if note.write_offset == note.write_length {
                    note.txmit_state = TransmitState::Footer;
                }
            }

            if note.exc_state == ExchangeState::Operating
                && note.txmit_state == TransmitState::Footer
                && self.encoder.encode_ctrl(Symbol::EndPacket, 0)
            {
                ringbuf_entry!(Trace::PacketSent(note.write_length));
                note.txmit_state = TransmitState::Idle;
                note.write_length = 0;
                note.write_offset = 0;
                continue;
            }

            break;
        }

        // the chunk is stamped with the epoch (not the dispatch instant):
        // replicas of this clip run at different slots, and the line duct
        // votes on timestamps along with the bytes
        self.encoder.commit(ctx.epoch_start);
        self.check_invariants(&note);
    }

    pub fn rx_clip(&mut self, ctx: &ClipCtx) {
        let mut note = self.notepad.feedforward(0, ctx.is_restart);
        self.check_invariants(&note);

        self.decoder.prepare();
        let mut synch = note.decoder_synch;
        let mut read_txn = self.read_duct.send_prepare(self.replica_id);

        loop {
            let receiving = note.exc_state == ExchangeState::Operating
                && note.recv_state == ReceiveState::Receiving
                && note.read_offset < self.read_buffer.len();

            let ent = if receiving {
                self.decoder
                    .decode(&mut synch, Some(&mut self.read_buffer[note.read_offset..]))
            } else {
                self.decoder.decode(&mut synch, None)
            };
            let Some(ent) = ent else { break };

            let mut reset_reason = None;
            if let Some(symbol) = ent.ctrl {
                debug_assert!(ent.data_len == 0);
                match note.exc_state {
                    ExchangeState::Connecting => {
                        if symbol == Symbol::Handshake1 {
                            note.recv_handshake_id = ent.param;
                            note.send_secondary_handshake = true;
                        } else {
                            // if we're seeing this, the link is already in a
                            // broken state; no point being loud about it
                            reset_reason = Some("unexpected symbol while connecting");
                        }
                    }
                    ExchangeState::Handshaking => {
                        if symbol == Symbol::Handshake2 && ent.param == note.send_handshake_id {
                            note.exc_state = ExchangeState::Operating;
                            note.send_primary_handshake = false;
                            note.send_secondary_handshake = false;
                            ringbuf_entry!(Trace::Operating(ent.param));
                        } else {
                            reset_reason = Some("expected matching secondary handshake");
                        }
                    }
                    ExchangeState::Operating => match symbol {
                        Symbol::StartPacket => {
                            if note.fcts_sent <= note.pkts_rcvd {
                                reset_reason = Some("unauthorized start-of-packet");
                            } else if note.recv_state != ReceiveState::Listening {
                                reset_reason = Some("start-of-packet inside packet");
                            } else {
                                note.recv_state = ReceiveState::Receiving;
                                note.read_offset = 0;
                                note.read_timestamp = ent.timestamp;
                                note.pkts_rcvd += 1;
                            }
                        }
                        Symbol::EndPacket => match note.recv_state {
                            ReceiveState::Overflowed => {
                                // discard and get ready for another packet
                                note.recv_state = ReceiveState::Listening;
                                note.read_offset = 0;
                            }
                            ReceiveState::Receiving => {
                                if note.read_offset == 0 {
                                    ringbuf_entry!(Trace::EmptyPacketDropped);
                                } else if read_txn.allowed() {
                                    read_txn.send(
                                        &self.read_buffer[..note.read_offset],
                                        note.read_timestamp,
                                    );
                                    ringbuf_entry!(Trace::PacketCommitted(note.read_offset));
                                } else {
                                    // the peer beat our credit accounting;
                                    // losing the packet is the safe option
                                    ringbuf_entry!(Trace::ReceiveOverflow);
                                }
                                note.recv_state = ReceiveState::Listening;
                                note.read_offset = 0;
                            }
                            ReceiveState::Listening => {
                                reset_reason = Some("end-of-packet while listening");
                            }
                        },
                        Symbol::ErrorPacket => match note.recv_state {
                            ReceiveState::Receiving | ReceiveState::Overflowed => {
                                note.recv_state = ReceiveState::Listening;
                                note.read_offset = 0;
                            }
                            ReceiveState::Listening => {
                                reset_reason = Some("error-packet while listening");
                            }
                        },
                        Symbol::FlowControl => {
                            if ent.param < note.fcts_rcvd {
                                // the FCT count must never decrease
                                reset_reason = Some("abnormally low flow-control count");
                            } else if ent.param > note.pkts_sent + MAX_OUTSTANDING_TOKENS {
                                // nor increase beyond the credit ceiling
                                reset_reason = Some("abnormally high flow-control count");
                            } else {
                                note.fcts_rcvd = ent.param;
                            }
                        }
                        Symbol::KeepAlive => {
                            if ent.param != note.pkts_rcvd {
                                reset_reason = Some("keep-alive packet count mismatch");
                            }
                        }
                        _ => {
                            reset_reason = Some("unexpected symbol while operating");
                        }
                    },
                }
            } else {
                debug_assert!(ent.data_len > 0);
                if note.exc_state == ExchangeState::Operating
                    && note.recv_state == ReceiveState::Overflowed
                {
                    // discard extraneous bytes
                } else if note.exc_state != ExchangeState::Operating
                    || note.recv_state != ReceiveState::Receiving
                {
                    reset_reason = Some("unexpected data characters");
                } else if !receiving {
                    // buffer exhausted mid-packet
                    ringbuf_entry!(Trace::ReceiveOverflow);
                    note.recv_state = ReceiveState::Overflowed;
                } else {
                    note.read_offset += ent.data_len;
                    debug_assert!(note.read_offset <= self.read_buffer.len());
                }
            }

            if let Some(reason) = reset_reason {
                Self::do_reset(&mut note, reason);
            }
        }

        note.decoder_synch = synch;

        // grant credit for the receive capacity we still have
        if note.exc_state == ExchangeState::Operating {
            let in_progress = (note.recv_state != ReceiveState::Listening) as u32;
            let window =
                (self.read_duct.max_flow() as u32 - in_progress).min(MAX_OUTSTANDING_TOKENS);
            if note.pkts_rcvd + window > note.fcts_sent {
                note.fcts_sent = note.pkts_rcvd + window;
                note.resend_fcts = true;
                note.resend_pkts = true;
                note.countdown_timeout = self.period_epochs(note.random);
                ringbuf_entry!(Trace::FctGrant(note.fcts_sent));
            }
        }

        read_txn.commit();
        self.decoder.commit();
        self.check_invariants(&note);
    }

    /// Wraps a shared exchange in its transmit and receive clips.
    pub fn clips(exchange: Rc<RefCell<Exchange>>) -> (ExchangeTxClip, ExchangeRxClip) {
        (
            ExchangeTxClip(Rc::clone(&exchange)),
            ExchangeRxClip(exchange),
        )
    }
}

pub struct ExchangeTxClip(pub Rc<RefCell<Exchange>>);

impl Clip for ExchangeTxClip {
    fn clip(&mut self, ctx: &ClipCtx) {
        self.0.borrow_mut().tx_clip(ctx);
    }
}

pub struct ExchangeRxClip(pub Rc<RefCell<Exchange>>);

impl Clip for ExchangeRxClip {
    fn clip(&mut self, ctx: &ClipCtx) {
        self.0.borrow_mut().rx_clip(ctx);
    }
}
