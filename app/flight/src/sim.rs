// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulated devices and harness endpoints.
//!
//! The reference platform flies against simulated hardware, so the devices
//! here are normal code, not test scaffolding: a loopback-linked pair of
//! exchanges, an RMAP-served radio with the ping-pong receive buffer
//! arrangement, and the watchdog MMIO block. Ground-side endpoints (the
//! [`PortClip`] inbox/outbox) stand in for the rest of the spacecraft.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use drv_radio::{RadioRegister, RxState, TxState, MEM_SIZE, NUM_REGISTERS, RADIO_MAGIC};
use drv_starwire::exchange::{Exchange, ExchangeConfig, ExchangeRxClip, ExchangeTxClip};
use drv_starwire::rand::{RandomClip, Xorshift32};
use drv_starwire::{crc8::rmap_crc8, rmap::RmapFlags};
use duct::{Duct, DuctConfig, DuctPolarity};
use exec::{Clip, ClipCtx, Schedule, SimClock, Timestamp};
use ringbuf::{ringbuf, ringbuf_entry};
use task_vigil::{food_from_recipe, WatchdogMmio};

use crate::builder::FlightBuilder;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Trace {
    RadioServed { write: bool, addr: u32, status: u8 },
    RadioDiscarded(usize),
    RadioRxOverflow,
    WatchdogFed(u32),
    WatchdogKilled,
}

ringbuf!(Trace, 32);

/// Ground-side packet endpoint: queues outbound packets onto a write duct
/// and collects inbound packets (with their receive timestamps) from a read
/// duct, one epoch at a time.
pub struct PortClip {
    read_duct: Rc<Duct>,
    write_duct: Rc<Duct>,
    buffer: Box<[u8]>,
    pub inbox: Rc<RefCell<Vec<(Vec<u8>, Timestamp)>>>,
    pub outbox: Rc<RefCell<VecDeque<Vec<u8>>>>,
}

impl PortClip {
    pub fn new(read_duct: Rc<Duct>, write_duct: Rc<Duct>) -> Self {
        let buffer = vec![0u8; read_duct.message_size()].into_boxed_slice();
        Self {
            read_duct,
            write_duct,
            buffer,
            inbox: Rc::default(),
            outbox: Rc::default(),
        }
    }

    pub fn handles(&self) -> PortHandles {
        PortHandles {
            inbox: Rc::clone(&self.inbox),
            outbox: Rc::clone(&self.outbox),
        }
    }
}

#[derive(Clone)]
pub struct PortHandles {
    pub inbox: Rc<RefCell<Vec<(Vec<u8>, Timestamp)>>>,
    pub outbox: Rc<RefCell<VecDeque<Vec<u8>>>>,
}

impl Clip for PortClip {
    fn clip(&mut self, ctx: &ClipCtx) {
        let mut txn = self.read_duct.receive_prepare(0);
        while let Some((size, timestamp)) = txn.receive_timestamped(&mut self.buffer) {
            self.inbox
                .borrow_mut()
                .push((self.buffer[..size].to_vec(), timestamp));
        }
        txn.commit();

        let mut txn = self.write_duct.send_prepare(0);
        while txn.allowed() {
            let Some(packet) = self.outbox.borrow_mut().pop_front() else {
                break;
            };
            txn.send(&packet, ctx.clip_start);
        }
        txn.commit();
    }
}

/// Largest packet the loopback link carries.
pub const LINK_BUF_SIZE: usize = 64;
/// Packets per epoch on the link's packet ducts.
pub const LINK_MAX_FLOW: usize = 1;
/// Budget of each clip in the loopback schedule.
pub const CLIP_BUDGET_NS: u32 = 125_000;
/// Nominal epoch duration of the loopback schedule.
pub const EPOCH_NS: u64 = 8 * CLIP_BUDGET_NS as u64;

/// Two exchanges wired back to back through their line ducts, with a
/// ground-side port on each end.
pub struct LinkPair {
    pub clock: Rc<SimClock>,
    pub schedule: Schedule,
    pub a: Rc<RefCell<Exchange>>,
    pub b: Rc<RefCell<Exchange>>,
    pub a_port: PortHandles,
    pub b_port: PortHandles,
}

fn line_duct(label: &'static str) -> Rc<Duct> {
    Rc::new(Duct::new(DuctConfig {
        label,
        sender_replicas: 1,
        receiver_replicas: 1,
        max_flow: 1,
        message_size: LINK_MAX_FLOW * LINK_BUF_SIZE + 1024,
        polarity: DuctPolarity::SenderFirst,
    }))
}

fn rand_duct(label: &'static str) -> Rc<Duct> {
    Rc::new(Duct::new(DuctConfig {
        label,
        sender_replicas: 1,
        receiver_replicas: 1,
        max_flow: 1,
        message_size: 4,
        polarity: DuctPolarity::SenderFirst,
    }))
}

fn read_duct(label: &'static str) -> Rc<Duct> {
    Rc::new(Duct::new(DuctConfig {
        label,
        sender_replicas: 1,
        receiver_replicas: 1,
        max_flow: LINK_MAX_FLOW * 2,
        message_size: LINK_BUF_SIZE,
        polarity: DuctPolarity::SenderFirst,
    }))
}

fn write_duct(label: &'static str) -> Rc<Duct> {
    Rc::new(Duct::new(DuctConfig {
        label,
        sender_replicas: 1,
        receiver_replicas: 1,
        max_flow: LINK_MAX_FLOW * 2,
        message_size: LINK_BUF_SIZE,
        polarity: DuctPolarity::ReceiverFirst,
    }))
}

impl LinkPair {
    pub fn new(seed_a: u32, seed_b: u32) -> Self {
        let clock = Rc::new(SimClock::new(0));

        let a_to_b = line_duct("line-a-to-b");
        let b_to_a = line_duct("line-b-to-a");
        let rand_a = rand_duct("rand-a");
        let rand_b = rand_duct("rand-b");
        let a_read = read_duct("a-read");
        let a_write = write_duct("a-write");
        let b_read = read_duct("b-read");
        let b_write = write_duct("b-write");

        let a = Rc::new(RefCell::new(Exchange::new(
            ExchangeConfig {
                label: "exc-a",
                replica_id: 0,
                epoch_ns: EPOCH_NS,
            },
            Rc::clone(&rand_a),
            Rc::clone(&b_to_a),
            Rc::clone(&a_to_b),
            Rc::clone(&a_read),
            Rc::clone(&a_write),
        )));
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

        let (a_tx, a_rx) = Exchange::clips(Rc::clone(&a));
        let (b_tx, b_rx) = Exchange::clips(Rc::clone(&b));

        let a_port_clip = PortClip::new(Rc::clone(&a_read), Rc::clone(&a_write));
        let b_port_clip = PortClip::new(Rc::clone(&b_read), Rc::clone(&b_write));
        let a_port = a_port_clip.handles();
        let b_port = b_port_clip.handles();

        let mut builder = FlightBuilder::new(Rc::clone(&clock) as Rc<dyn exec::Clock>);
        builder
            .clip(
                "rand-a",
                CLIP_BUDGET_NS,
                Box::new(RandomClip::new(rand_a, seed_a)),
            )
            .clip(
                "rand-b",
                CLIP_BUDGET_NS,
                Box::new(RandomClip::new(rand_b, seed_b)),
            )
            .clip("exc-a-tx", CLIP_BUDGET_NS, Box::new(a_tx))
            .clip("exc-b-tx", CLIP_BUDGET_NS, Box::new(b_tx))
            .clip("exc-a-rx", CLIP_BUDGET_NS, Box::new(a_rx))
            .clip("exc-b-rx", CLIP_BUDGET_NS, Box::new(b_rx))
            .clip("port-a", CLIP_BUDGET_NS, Box::new(a_port_clip))
            .clip("port-b", CLIP_BUDGET_NS, Box::new(b_port_clip));
        let schedule = builder.build();

        Self {
            clock,
            schedule,
            a,
            b,
            a_port,
            b_port,
        }
    }

    pub fn run_epochs(&mut self, count: u32) {
        self.schedule.run_epochs(count);
    }
}

const REG_BLOCK_SIZE: u32 = NUM_REGISTERS as u32 * 4;
const RADIO_MEM_WINDOW: u32 = 0x1000;

/// RMAP status byte for a rejected destination key.
const STATUS_INVALID_KEY: u8 = 3;
/// RMAP status byte for an unsupported access.
const STATUS_GENERAL_ERROR: u8 = 10;

struct StubPort {
    request: Rc<Duct>,
    reply: Rc<Duct>,
}

/// The radio device, served over RMAP.
///
/// Registers live at device address 0; the memory window starts at 0x1000.
/// Reception follows the active/passive buffer-half scheme: incoming bytes
/// land at RX_PTR while RX_LEN lasts, then the device falls over to the
/// alternate registers, and goes to OVERFLOW when both are spent.
pub struct StubRadio {
    logical_address: u8,
    key: u8,
    registers: [u32; NUM_REGISTERS],
    memory: Box<[u8]>,
    ports: Vec<StubPort>,
    scratch: Box<[u8]>,
}

impl StubRadio {
    pub fn new(logical_address: u8, key: u8) -> Self {
        let mut registers = [0u32; NUM_REGISTERS];
        registers[RadioRegister::Magic as usize] = RADIO_MAGIC;
        registers[RadioRegister::MemBase as usize] = RADIO_MEM_WINDOW;
        registers[RadioRegister::MemSize as usize] = MEM_SIZE;
        Self {
            logical_address,
            key,
            registers,
            memory: vec![0u8; MEM_SIZE as usize].into_boxed_slice(),
            ports: Vec::new(),
            scratch: vec![0u8; 8192].into_boxed_slice(),
        }
    }

    /// Changes the device's bus address (for misaddressing scenarios).
    pub fn set_logical_address(&mut self, logical_address: u8) {
        self.logical_address = logical_address;
    }

    /// Attaches an RMAP initiator's duct pair.
    pub fn port(&mut self, request: Rc<Duct>, reply: Rc<Duct>) {
        assert!(request.max_flow() == 1 && reply.max_flow() == 1);
        self.ports.push(StubPort { request, reply });
    }

    pub fn reg(&self, register: RadioRegister) -> u32 {
        self.registers[register as usize]
    }

    pub fn set_reg(&mut self, register: RadioRegister, value: u32) {
        self.registers[register as usize] = value;
    }

    pub fn memory_mut(&mut self) -> &mut [u8] {
        &mut self.memory
    }

    pub fn memory(&self) -> &[u8] {
        &self.memory
    }

    /// Device-side reception: bytes arriving from the ground land in the
    /// prime buffer. The moment the prime fills, the device falls over to
    /// the alternate (or declares OVERFLOW if none is set); it never rests
    /// with an exhausted prime while an alternate is available.
    pub fn host_deliver(&mut self, mut bytes: &[u8]) {
        loop {
            if self.reg(RadioRegister::RxState) != RxState::Listening as u32 {
                if !bytes.is_empty() {
                    let err = self.reg(RadioRegister::ErrCount);
                    self.set_reg(RadioRegister::ErrCount, err + bytes.len() as u32);
                }
                return;
            }
            if self.reg(RadioRegister::RxLen) == 0 {
                let alt_ptr = self.reg(RadioRegister::RxPtrAlt);
                let alt_len = self.reg(RadioRegister::RxLenAlt);
                if alt_ptr + alt_len != 0 {
                    // fall over to the alternate buffer
                    self.set_reg(RadioRegister::RxPtr, alt_ptr);
                    self.set_reg(RadioRegister::RxLen, alt_len);
                    self.set_reg(RadioRegister::RxPtrAlt, 0);
                    self.set_reg(RadioRegister::RxLenAlt, 0);
                } else {
                    ringbuf_entry!(Trace::RadioRxOverflow);
                    self.set_reg(RadioRegister::RxState, RxState::Overflow as u32);
                }
                continue;
            }
            if bytes.is_empty() {
                return;
            }
            let ptr = self.reg(RadioRegister::RxPtr);
            let len = self.reg(RadioRegister::RxLen);
            let chunk = (bytes.len() as u32).min(len) as usize;
            self.memory[ptr as usize..ptr as usize + chunk].copy_from_slice(&bytes[..chunk]);
            self.set_reg(RadioRegister::RxPtr, ptr + chunk as u32);
            self.set_reg(RadioRegister::RxLen, len - chunk as u32);
            bytes = &bytes[chunk..];
        }
    }

    /// Device-side transmission: drains up to `max` bytes of the frame the
    /// transmitter is working on, going idle when it finishes.
    pub fn tx_drain(&mut self, max: usize) -> Vec<u8> {
        if self.reg(RadioRegister::TxState) != TxState::Active as u32 {
            return Vec::new();
        }
        let ptr = self.reg(RadioRegister::TxPtr);
        let len = self.reg(RadioRegister::TxLen);
        let chunk = (len as usize).min(max);
        let out = self.memory[ptr as usize..ptr as usize + chunk].to_vec();
        self.set_reg(RadioRegister::TxPtr, ptr + chunk as u32);
        self.set_reg(RadioRegister::TxLen, len - chunk as u32);
        if len as usize == chunk {
            self.set_reg(RadioRegister::TxState, TxState::Idle as u32);
        }
        out
    }

    /// Performs a validated access against registers or memory.
    fn access(&mut self, write: bool, addr: u32, length: u32, data: &[u8], out: &mut Vec<u8>) -> u8 {
        if write {
            debug_assert!(length as usize == data.len());
        }
        if addr < REG_BLOCK_SIZE {
            if addr % 4 != 0 || length % 4 != 0 || addr + length > REG_BLOCK_SIZE {
                return STATUS_GENERAL_ERROR;
            }
            let first = (addr / 4) as usize;
            let count = (length / 4) as usize;
            if write {
                let mut words = vec![0u32; count];
                drv_radio::words_from_be(data, &mut words);
                self.registers[first..first + count].copy_from_slice(&words);
            } else {
                let mut block = vec![0u8; count * 4];
                drv_radio::words_to_be(&self.registers[first..first + count], &mut block);
                out.extend_from_slice(&block);
            }
            0
        } else if addr >= RADIO_MEM_WINDOW && addr + length <= RADIO_MEM_WINDOW + MEM_SIZE {
            let offset = (addr - RADIO_MEM_WINDOW) as usize;
            if write {
                self.memory[offset..offset + data.len()].copy_from_slice(data);
            } else {
                out.extend_from_slice(&self.memory[offset..offset + length as usize]);
            }
            0
        } else {
            STATUS_GENERAL_ERROR
        }
    }

    /// Parses one RMAP command and produces the reply, or `None` when the
    /// packet is unaddressable garbage that a real target would discard.
    fn serve(&mut self, request: &[u8]) -> Option<Vec<u8>> {
        if request.len() < 16 {
            ringbuf_entry!(Trace::RadioDiscarded(request.len()));
            return None;
        }
        if request[0] != self.logical_address || request[1] != 0x01 {
            ringbuf_entry!(Trace::RadioDiscarded(request.len()));
            return None;
        }
        let flags = request[2];
        if flags & RmapFlags::COMMAND.bits() == 0 {
            return None;
        }
        let spal = (flags & RmapFlags::SOURCEPATH.bits()) as usize;
        let header_len = 4 + spal * 4 + 12;
        if request.len() < header_len {
            return None;
        }
        if rmap_crc8(&request[..header_len - 1]) != request[header_len - 1] {
            return None;
        }

        let source_logical = request[4 + spal * 4];
        let txn_hi = request[4 + spal * 4 + 1];
        let txn_lo = request[4 + spal * 4 + 2];
        let ext_addr = request[4 + spal * 4 + 3];
        let main_addr = u32::from_be_bytes([
            request[4 + spal * 4 + 4],
            request[4 + spal * 4 + 5],
            request[4 + spal * 4 + 6],
            request[4 + spal * 4 + 7],
        ]);
        let data_length = usize::from(request[4 + spal * 4 + 8]) << 16
            | usize::from(request[4 + spal * 4 + 9]) << 8
            | usize::from(request[4 + spal * 4 + 10]);

        let is_write = flags & RmapFlags::WRITE.bits() != 0;
        let reply_flags = flags & !(RmapFlags::COMMAND.bits() | RmapFlags::SOURCEPATH.bits());

        let mut status = 0u8;
        if request[3] != self.key {
            status = STATUS_INVALID_KEY;
        } else if ext_addr != 0 {
            status = STATUS_GENERAL_ERROR;
        }

        let mut payload = Vec::with_capacity(data_length);
        if is_write {
            // the data and its CRC must be present and intact
            if request.len() != header_len + data_length + 1 {
                return None;
            }
            let data = &request[header_len..header_len + data_length];
            if rmap_crc8(data) != request[header_len + data_length] {
                return None;
            }
            if status == 0 {
                status = self.access(true, main_addr, data_length as u32, data, &mut payload);
            }
        } else {
            if request.len() != header_len {
                return None;
            }
            if status == 0 {
                status = self.access(false, main_addr, data_length as u32, &[], &mut payload);
            }
        }

        ringbuf_entry!(Trace::RadioServed {
            write: is_write,
            addr: main_addr,
            status,
        });
        let mut reply = vec![
            source_logical,
            0x01,
            reply_flags,
            status,
            self.logical_address,
            txn_hi,
            txn_lo,
        ];
        if is_write {
            reply.push(rmap_crc8(&reply));
        } else {
            reply.push(0); // reserved
            if status != 0 {
                payload.clear();
            }
            reply.push((payload.len() >> 16) as u8);
            reply.push((payload.len() >> 8) as u8);
            reply.push(payload.len() as u8);
            reply.push(rmap_crc8(&reply));
            let data_crc = rmap_crc8(&payload);
            reply.extend_from_slice(&payload);
            reply.push(data_crc);
        }
        Some(reply)
    }
}

/// The stub radio's bus clip: answers at most one request per port per
/// epoch, replying the same epoch (the initiator sees it next epoch).
pub struct StubRadioClip(pub Rc<RefCell<StubRadio>>);

impl Clip for StubRadioClip {
    fn clip(&mut self, ctx: &ClipCtx) {
        let mut radio = self.0.borrow_mut();
        let radio = &mut *radio;
        for index in 0..radio.ports.len() {
            let request_duct = Rc::clone(&radio.ports[index].request);
            let reply_duct = Rc::clone(&radio.ports[index].reply);

            let mut reply_txn = reply_duct.send_prepare(0);
            let mut request_txn = request_duct.receive_prepare(0);
            let size = request_txn.receive(&mut radio.scratch);
            if size > 0 {
                let request = radio.scratch[..size].to_vec();
                if let Some(reply) = radio.serve(&request) {
                    if reply_txn.allowed() {
                        reply_txn.send(&reply, ctx.clip_start);
                    }
                }
            }
            request_txn.commit();
            reply_txn.commit();
        }
    }
}

/// The watchdog device's register block.
///
/// Presents a recipe through the greet register; correct food delivered
/// inside the window pushes the deadline out one period and draws a fresh
/// recipe. Wrong food, or any write to the greet register, kills the board.
pub struct StubWatchdogMmio {
    rng: RefCell<Xorshift32>,
    greet: Cell<u32>,
    deadline: Cell<u32>,
    early_offset: u32,
    period: u32,
    reset_triggered: Cell<bool>,
    feedings: Cell<u32>,
}

impl StubWatchdogMmio {
    pub fn new(seed: u32, first_deadline: u32, early_offset: u32, period: u32) -> Self {
        let mut rng = Xorshift32::new(seed);
        let greet = rng.next_u32();
        Self {
            rng: RefCell::new(rng),
            greet: Cell::new(greet),
            deadline: Cell::new(first_deadline),
            early_offset,
            period,
            reset_triggered: Cell::new(false),
            feedings: Cell::new(0),
        }
    }

    pub fn reset_triggered(&self) -> bool {
        self.reset_triggered.get()
    }

    pub fn feedings(&self) -> u32 {
        self.feedings.get()
    }
}

impl WatchdogMmio for StubWatchdogMmio {
    fn greet(&self) -> u32 {
        self.greet.get()
    }

    fn feed(&self, food: u32) {
        if self.reset_triggered.get() {
            return;
        }
        if food == food_from_recipe(self.greet.get()) {
            ringbuf_entry!(Trace::WatchdogFed(food));
            self.deadline.set(self.deadline.get().wrapping_add(self.period));
            self.greet.set(self.rng.borrow_mut().next_u32());
            self.feedings.set(self.feedings.get() + 1);
        } else {
            ringbuf_entry!(Trace::WatchdogKilled);
            self.reset_triggered.set(true);
        }
    }

    fn deadline(&self) -> u32 {
        self.deadline.get()
    }

    fn early_offset(&self) -> u32 {
        self.early_offset
    }

    fn write_greet(&self, _value: u32) {
        ringbuf_entry!(Trace::WatchdogKilled);
        self.reset_triggered.set(true);
    }
}
