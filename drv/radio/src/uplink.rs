// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The uplink pipeline: continuous reception via ping-pong buffers.
//!
//! The challenge with reception is that the device must be able to keep
//! receiving from the ground even while we are transferring part of its
//! buffer out. A ring buffer in device memory would be awkward to manage
//! over RMAP, but an active/passive pair of buffer halves works: the device
//! fills the *prime* half (RX_PTR/RX_LEN) and falls over to the *alternate*
//! half (RX_PTR_ALT/RX_LEN_ALT) when the prime fills, while we chase it
//! from behind, counting `bytes_extracted` around the two-half cycle and
//! refilling whichever half has been fully drained.
//!
//! Each epoch the clip completes last epoch's RMAP transaction and issues
//! the next one, stepping QUERY_CONFIG → DISABLE_RX → RESET_REGS →
//! QUERY_STATE → PRIME_READ → FLIPPED_READ → REFILL_BUFFERS →
//! WRITE_TO_STREAM and then cycling back to QUERY_STATE. Any non-OK status
//! holds the machine at its current step.

use std::rc::Rc;

use drv_starwire::rmap::Rmap;
use duct::{Duct, Notepad};
use exec::{Clip, ClipCtx};
use ringbuf::{ringbuf, ringbuf_entry};
use task_vigil::Aspect;

use crate::regs::{
    reg_addr, rx_halves, validate_common_config, words_from_be, words_to_be, RadioRegister,
    RxState, MEM_BASE_ADDR, NUM_REGISTERS,
};
use crate::UPLINK_BUF_LOCAL_SIZE;

const MAGIC: usize = RadioRegister::Magic as usize;
const RX_PTR: usize = RadioRegister::RxPtr as usize;
const RX_LEN: usize = RadioRegister::RxLen as usize;
const RX_PTR_ALT: usize = RadioRegister::RxPtrAlt as usize;
const RX_LEN_ALT: usize = RadioRegister::RxLenAlt as usize;
const RX_STATE: usize = RadioRegister::RxState as usize;
const MEM_BASE: usize = RadioRegister::MemBase as usize;
const MEM_SIZE_REG: usize = RadioRegister::MemSize as usize;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Trace {
    InitializingOutOfIdle,
    OverflowCleared,
    StepFailed(UplinkState),
    StreamedBytes(u32),
}

ringbuf!(Trace, 32);

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum UplinkState {
    #[default]
    Initial,
    QueryConfig,
    DisableReceive,
    ResetRegisters,
    QueryState,
    PrimeRead,
    FlippedRead,
    RefillBuffers,
    WriteToStream,
}

/// One cycle's worth of planned device reads and register updates.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ReadPlan {
    pub prime_read_address: u32,
    pub prime_read_length: u32,
    pub flipped_read_address: u32,
    pub flipped_read_length: u32,
    pub needs_update_all: bool,
    pub needs_alt_update: bool,
    pub watchdog_ok: bool,
    /// New values for RX_PTR..RX_STATE when an update is needed.
    pub new_registers: [u32; 5],
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct UplinkNote {
    pub uplink_state: UplinkState,
    pub bytes_extracted: u32,
    pub read_plan: ReadPlan,
}

/// Works out where the next reads should land, advancing `bytes_extracted`
/// and mutating `reg` to the values the device should be updated to.
pub fn compute_reads(note: &mut UplinkNote, reg: &mut [u32; NUM_REGISTERS]) -> ReadPlan {
    let halves = rx_halves();

    if reg[RX_STATE] == RxState::Idle as u32 {
        ringbuf_entry!(Trace::InitializingOutOfIdle);
        note.bytes_extracted = 0;
        reg[RX_PTR] = halves[0].base;
        reg[RX_LEN] = halves[0].size;
        reg[RX_PTR_ALT] = halves[1].base;
        reg[RX_LEN_ALT] = halves[1].size;
        reg[RX_STATE] = RxState::Listening as u32;

        // no data to read; just initialize the buffers
        return ReadPlan {
            needs_update_all: true,
            watchdog_ok: false,
            new_registers: [
                reg[RX_PTR],
                reg[RX_LEN],
                reg[RX_PTR_ALT],
                reg[RX_LEN_ALT],
                reg[RX_STATE],
            ],
            ..Default::default()
        };
    }

    // start by identifying what the current positions mean
    let end_index_h0 = halves[0].end();
    let end_index_h1 = halves[1].end();
    let end_index_prime = reg[RX_PTR] + reg[RX_LEN];
    let end_index_alt = reg[RX_PTR_ALT] + reg[RX_LEN_ALT];
    assert!(end_index_prime == end_index_h0 || end_index_prime == end_index_h1);
    assert!(end_index_prime != end_index_alt);
    if end_index_alt == 0 {
        assert!(reg[RX_PTR_ALT] == 0 && reg[RX_LEN_ALT] == 0);
    } else {
        assert!(end_index_alt == end_index_h0 || end_index_alt == end_index_h1);
    }

    // identify where the next read location should be
    let cycle_len = halves[0].size + halves[1].size;
    let read_cycle_offset = note.bytes_extracted % cycle_len;
    let read_half = usize::from(read_cycle_offset >= halves[0].size);
    let read_half_offset = read_cycle_offset - if read_half == 1 { halves[0].size } else { 0 };

    let mut read_length; // bytes to read from the current read half
    let mut read_length_flip; // bytes to read after wrapping to the other half

    if end_index_alt == 0 {
        // we WERE in the non-prime half, and switched, so the read index
        // MUST be in the non-prime half
        if end_index_prime == end_index_h0 {
            assert!(read_half == 1);
        } else {
            assert!(read_half == 0);
        }
        read_length = halves[read_half].size - read_half_offset;
        read_length_flip = reg[RX_PTR] - halves[1 - read_half].base;
    } else {
        // we ARE in the prime half, and the read index must be here
        if end_index_prime == end_index_h0 {
            assert!(read_half == 0);
        } else {
            assert!(read_half == 1);
        }
        read_length = (reg[RX_PTR] - halves[read_half].base) - read_half_offset;
        read_length_flip = 0;
    }
    assert!(read_half_offset + read_length <= halves[read_half].size);
    assert!(read_length_flip <= halves[1 - read_half].size);

    // constrain the read to the size of the bounce buffer
    let local = UPLINK_BUF_LOCAL_SIZE as u32;
    if read_length > local {
        read_length = local;
        read_length_flip = 0;
    } else if read_length + read_length_flip > local {
        read_length_flip = local - read_length;
    }
    assert!(read_length_flip == 0 || read_length != 0);

    let mut plan = ReadPlan {
        prime_read_address: halves[read_half].base + read_half_offset,
        prime_read_length: read_length,
        flipped_read_address: halves[1 - read_half].base,
        flipped_read_length: read_length_flip,
        needs_update_all: false,
        needs_alt_update: false,
        watchdog_ok: true,
        new_registers: [0; 5],
    };

    note.bytes_extracted += read_length + read_length_flip;

    // coherency check: OVERFLOW means the prime buffer ran dry
    if reg[RX_STATE] == RxState::Overflow as u32 {
        assert!(reg[RX_LEN] == 0);
    }

    // is there any unread data left in the alternate half?
    let reread_cycle_offset = note.bytes_extracted % cycle_len;
    let reread_half = usize::from(reread_cycle_offset >= halves[0].size);
    let any_unread_data_in_alternate = (reread_half == 0 && end_index_prime == end_index_h1)
        || (reread_half == 1 && end_index_prime == end_index_h0);

    if any_unread_data_in_alternate {
        // then we CANNOT safely have the alternate registers set; we will
        // have to finish reading first
        assert!(end_index_alt == 0);
    } else {
        // we CAN safely refill the alternate registers
        let new_region = if end_index_prime == end_index_h1 {
            halves[0]
        } else {
            halves[1]
        };
        if reg[RX_STATE] == RxState::Overflow as u32 {
            // simulate the effect of a flip
            reg[RX_PTR] = new_region.base;
            reg[RX_LEN] = new_region.size;
            reg[RX_PTR_ALT] = 0;
            reg[RX_LEN_ALT] = 0;
            reg[RX_STATE] = RxState::Listening as u32;
            ringbuf_entry!(Trace::OverflowCleared);
            plan.new_registers = [
                reg[RX_PTR],
                reg[RX_LEN],
                reg[RX_PTR_ALT],
                reg[RX_LEN_ALT],
                reg[RX_STATE],
            ];
            plan.needs_update_all = true;
        } else if end_index_alt == 0 {
            // refill the alternate pointer and length
            assert!(reg[RX_STATE] == RxState::Listening as u32);
            reg[RX_PTR_ALT] = new_region.base;
            reg[RX_LEN_ALT] = new_region.size;
            plan.new_registers = [
                reg[RX_PTR],
                reg[RX_LEN],
                reg[RX_PTR_ALT],
                reg[RX_LEN_ALT],
                reg[RX_STATE],
            ];
            plan.needs_alt_update = true;
        } else {
            // no refill necessary
        }
    }

    plan
}

pub struct RadioUplinkClip {
    replica_id: usize,
    rmap: Rmap,
    notepad: Notepad<UplinkNote>,
    aspect: Rc<Aspect>,
    stream_duct: Rc<Duct>,
    buf_local: Box<[u8]>,
}

impl RadioUplinkClip {
    pub fn new(replica_id: usize, rmap: Rmap, aspect: Rc<Aspect>, stream_duct: Rc<Duct>) -> Self {
        assert!(stream_duct.message_size() >= UPLINK_BUF_LOCAL_SIZE);
        Self {
            replica_id,
            rmap,
            notepad: Notepad::new("radio-uplink", 1),
            aspect,
            stream_duct,
            buf_local: vec![0u8; UPLINK_BUF_LOCAL_SIZE].into_boxed_slice(),
        }
    }

    /// Observability only.
    pub fn note_snapshot(&self) -> UplinkNote {
        self.notepad.peek(0)
    }
}

impl Clip for RadioUplinkClip {
    fn clip(&mut self, ctx: &ClipCtx) {
        let mut note = self.notepad.feedforward(0, ctx.is_restart);

        let mut registers = [0u32; NUM_REGISTERS];
        let mut txn = self.rmap.epoch_prepare();
        let mut watchdog_ok = false;

        // first, complete whatever we asked the radio last epoch
        match note.uplink_state {
            UplinkState::QueryConfig => {
                let mut buf = [0u8; NUM_REGISTERS * 4];
                let status = txn.read_complete(&mut buf);
                if status.is_ok() {
                    words_from_be(&buf, &mut registers);
                    if validate_common_config(
                        registers[MAGIC],
                        registers[MEM_BASE],
                        registers[MEM_SIZE_REG],
                    ) {
                        note.uplink_state = UplinkState::DisableReceive;
                    }
                    // otherwise: not our radio; stay here and keep asking
                } else {
                    ringbuf_entry!(Trace::StepFailed(UplinkState::QueryConfig));
                }
            }
            UplinkState::DisableReceive => {
                if txn.write_complete().is_ok() {
                    note.uplink_state = UplinkState::ResetRegisters;
                } else {
                    ringbuf_entry!(Trace::StepFailed(UplinkState::DisableReceive));
                }
            }
            UplinkState::ResetRegisters => {
                if txn.write_complete().is_ok() {
                    note.uplink_state = UplinkState::QueryState;
                } else {
                    ringbuf_entry!(Trace::StepFailed(UplinkState::ResetRegisters));
                }
            }
            UplinkState::QueryState => {
                let mut buf = [0u8; 5 * 4];
                let status = txn.read_complete(&mut buf);
                if status.is_ok() {
                    let mut words = [0u32; 5];
                    words_from_be(&buf, &mut words);
                    registers[RX_PTR..RX_PTR + 5].copy_from_slice(&words);
                    note.read_plan = compute_reads(&mut note, &mut registers);
                    note.uplink_state = UplinkState::PrimeRead;
                    watchdog_ok = note.read_plan.watchdog_ok;
                } else {
                    ringbuf_entry!(Trace::StepFailed(UplinkState::QueryState));
                }
            }
            UplinkState::PrimeRead => {
                let length = note.read_plan.prime_read_length as usize;
                if txn.read_complete(&mut self.buf_local[..length]).is_ok() {
                    note.uplink_state = UplinkState::FlippedRead;
                } else {
                    ringbuf_entry!(Trace::StepFailed(UplinkState::PrimeRead));
                }
            }
            UplinkState::FlippedRead => {
                let prime = note.read_plan.prime_read_length as usize;
                let flip = note.read_plan.flipped_read_length as usize;
                if txn
                    .read_complete(&mut self.buf_local[prime..prime + flip])
                    .is_ok()
                {
                    note.uplink_state = UplinkState::RefillBuffers;
                } else {
                    ringbuf_entry!(Trace::StepFailed(UplinkState::FlippedRead));
                }
            }
            UplinkState::RefillBuffers => {
                if txn.write_complete().is_ok() {
                    note.uplink_state = UplinkState::WriteToStream;
                } else {
                    ringbuf_entry!(Trace::StepFailed(UplinkState::RefillBuffers));
                }
            }
            UplinkState::Initial | UplinkState::WriteToStream => {}
        }

        self.aspect.indicate(self.replica_id, watchdog_ok);

        // state advances that don't need a device round trip
        if note.uplink_state == UplinkState::Initial {
            note.uplink_state = UplinkState::QueryConfig;
        }
        if (note.uplink_state == UplinkState::PrimeRead && note.read_plan.prime_read_length == 0)
            || (note.uplink_state == UplinkState::FlippedRead
                && note.read_plan.flipped_read_length == 0)
        {
            note.uplink_state = UplinkState::RefillBuffers;
        }
        if note.uplink_state == UplinkState::RefillBuffers
            && !note.read_plan.needs_update_all
            && !note.read_plan.needs_alt_update
        {
            note.uplink_state = UplinkState::WriteToStream;
        }

        let mut stream_txn = self.stream_duct.send_prepare(self.replica_id);
        if note.uplink_state == UplinkState::WriteToStream {
            let uplink_length =
                note.read_plan.prime_read_length + note.read_plan.flipped_read_length;
            if uplink_length == 0 {
                note.uplink_state = UplinkState::QueryState;
            } else if stream_txn.allowed() {
                // epoch-stamped so replicas of this clip agree byte for byte
                stream_txn.send(&self.buf_local[..uplink_length as usize], ctx.epoch_start);
                note.uplink_state = UplinkState::QueryState;
                ringbuf_entry!(Trace::StreamedBytes(uplink_length));
            }
        }
        stream_txn.commit();

        // then, start the next request
        match note.uplink_state {
            UplinkState::QueryConfig => {
                txn.read_start(
                    0x00,
                    reg_addr(RadioRegister::Magic),
                    NUM_REGISTERS * 4,
                );
            }
            UplinkState::DisableReceive => {
                let mut word = [0u8; 4];
                words_to_be(&[RxState::Idle as u32], &mut word);
                txn.write_start(0x00, reg_addr(RadioRegister::RxState), &word);
            }
            UplinkState::ResetRegisters => {
                // clear the pointer registers for a known safe starting state
                let zeros = [0u8; 4 * 4];
                txn.write_start(0x00, reg_addr(RadioRegister::RxPtr), &zeros);
            }
            UplinkState::QueryState => {
                txn.read_start(0x00, reg_addr(RadioRegister::RxPtr), 5 * 4);
            }
            UplinkState::PrimeRead => {
                assert!(note.read_plan.prime_read_length > 0);
                txn.read_start(
                    0x00,
                    MEM_BASE_ADDR + note.read_plan.prime_read_address,
                    note.read_plan.prime_read_length as usize,
                );
            }
            UplinkState::FlippedRead => {
                assert!(note.read_plan.flipped_read_length > 0);
                txn.read_start(
                    0x00,
                    MEM_BASE_ADDR + note.read_plan.flipped_read_address,
                    note.read_plan.flipped_read_length as usize,
                );
            }
            UplinkState::RefillBuffers => {
                assert!(note.read_plan.needs_update_all || note.read_plan.needs_alt_update);
                if note.read_plan.needs_update_all {
                    let mut block = [0u8; 5 * 4];
                    words_to_be(&note.read_plan.new_registers, &mut block);
                    txn.write_start(0x00, reg_addr(RadioRegister::RxPtr), &block);
                } else {
                    let mut block = [0u8; 2 * 4];
                    words_to_be(&note.read_plan.new_registers[2..4], &mut block);
                    txn.write_start(0x00, reg_addr(RadioRegister::RxPtrAlt), &block);
                }
            }
            UplinkState::Initial | UplinkState::WriteToStream => {}
        }

        txn.commit();
    }
}
