// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The downlink pipeline: single-buffered transmission.
//!
//! Much simpler than the uplink: wait for a frame on the stream duct,
//! confirm the transmitter is idle, stage the frame into the transmit
//! region, kick the transmitter, and watch TX_LEN drain to zero. One RMAP
//! transaction per epoch; any non-OK status holds the machine at its
//! current step.

use std::rc::Rc;

use drv_starwire::rmap::Rmap;
use duct::Duct;
use exec::{Clip, ClipCtx};
use ringbuf::{ringbuf, ringbuf_entry};
use task_vigil::Aspect;

use crate::regs::{
    reg_addr, tx_region, validate_common_config, words_from_be, words_to_be, RadioRegister,
    TxState, MEM_BASE_ADDR, NUM_REGISTERS,
};
use crate::DOWNLINK_BUF_LOCAL_SIZE;

const MAGIC: usize = RadioRegister::Magic as usize;
const MEM_BASE: usize = RadioRegister::MemBase as usize;
const MEM_SIZE_REG: usize = RadioRegister::MemSize as usize;

const RADIO_REPLICA_ID: usize = 0;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Trace {
    StepFailed(DownlinkState),
    NotIdle(u32),
    StreamAccepted(usize),
    StreamDroppedWhileBusy(usize),
    RemainingBytes(u32),
    TransmitComplete(usize),
}

ringbuf!(Trace, 32);

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum DownlinkState {
    #[default]
    Initial,
    QueryConfig,
    DisableTransmit,
    WaitingForStream,
    ValidateIdle,
    WriteRadioMemory,
    StartTransmit,
    MonitorTransmit,
}

pub struct RadioDownlinkClip {
    rmap: Rmap,
    aspect: Rc<Aspect>,
    stream_duct: Rc<Duct>,
    buf_local: Box<[u8]>,
    downlink_state: DownlinkState,
    downlink_length: usize,
}

impl RadioDownlinkClip {
    pub fn new(rmap: Rmap, aspect: Rc<Aspect>, stream_duct: Rc<Duct>) -> Self {
        assert!(stream_duct.message_size() <= DOWNLINK_BUF_LOCAL_SIZE);
        assert!(tx_region().size as usize >= DOWNLINK_BUF_LOCAL_SIZE);
        Self {
            rmap,
            aspect,
            stream_duct,
            buf_local: vec![0u8; DOWNLINK_BUF_LOCAL_SIZE].into_boxed_slice(),
            downlink_state: DownlinkState::Initial,
            downlink_length: 0,
        }
    }

    /// Observability only.
    pub fn state(&self) -> DownlinkState {
        self.downlink_state
    }
}

impl Clip for RadioDownlinkClip {
    fn clip(&mut self, ctx: &ClipCtx) {
        if ctx.is_restart {
            self.downlink_state = DownlinkState::Initial;
            self.downlink_length = 0;
        }

        let mut registers = [0u32; NUM_REGISTERS];
        let mut txn = self.rmap.epoch_prepare();
        let mut watchdog_ok = false;

        match self.downlink_state {
            DownlinkState::QueryConfig => {
                let mut buf = [0u8; NUM_REGISTERS * 4];
                let status = txn.read_complete(&mut buf);
                if status.is_ok() {
                    words_from_be(&buf, &mut registers);
                    if validate_common_config(
                        registers[MAGIC],
                        registers[MEM_BASE],
                        registers[MEM_SIZE_REG],
                    ) {
                        self.downlink_state = DownlinkState::DisableTransmit;
                    }
                } else {
                    ringbuf_entry!(Trace::StepFailed(DownlinkState::QueryConfig));
                }
            }
            DownlinkState::DisableTransmit => {
                if txn.write_complete().is_ok() {
                    self.downlink_state = DownlinkState::WaitingForStream;
                } else {
                    ringbuf_entry!(Trace::StepFailed(DownlinkState::DisableTransmit));
                }
            }
            DownlinkState::ValidateIdle => {
                let mut buf = [0u8; 4];
                let status = txn.read_complete(&mut buf);
                if status.is_ok() {
                    let mut word = [0u32; 1];
                    words_from_be(&buf, &mut word);
                    if word[0] != TxState::Idle as u32 {
                        // stay here until the transmitter settles
                        ringbuf_entry!(Trace::NotIdle(word[0]));
                    } else {
                        self.downlink_state = DownlinkState::WriteRadioMemory;
                    }
                } else {
                    ringbuf_entry!(Trace::StepFailed(DownlinkState::ValidateIdle));
                }
            }
            DownlinkState::WriteRadioMemory => {
                if txn.write_complete().is_ok() {
                    self.downlink_state = DownlinkState::StartTransmit;
                } else {
                    ringbuf_entry!(Trace::StepFailed(DownlinkState::WriteRadioMemory));
                }
            }
            DownlinkState::StartTransmit => {
                if txn.write_complete().is_ok() {
                    self.downlink_state = DownlinkState::MonitorTransmit;
                } else {
                    ringbuf_entry!(Trace::StepFailed(DownlinkState::StartTransmit));
                }
            }
            DownlinkState::MonitorTransmit => {
                assert!(
                    self.downlink_length >= 1 && self.downlink_length <= DOWNLINK_BUF_LOCAL_SIZE
                );
                let mut buf = [0u8; 8];
                let status = txn.read_complete(&mut buf);
                if status.is_ok() {
                    let mut words = [0u32; 2];
                    words_from_be(&buf, &mut words);
                    let (tx_len, tx_state) = (words[0], words[1]);
                    if tx_len == 0 {
                        if tx_state != TxState::Idle as u32 {
                            ringbuf_entry!(Trace::NotIdle(tx_state));
                        } else {
                            ringbuf_entry!(Trace::TransmitComplete(self.downlink_length));
                            self.downlink_state = DownlinkState::WaitingForStream;
                            self.downlink_length = 0;
                            watchdog_ok = true;
                        }
                    } else {
                        ringbuf_entry!(Trace::RemainingBytes(tx_len));
                    }
                } else {
                    ringbuf_entry!(Trace::StepFailed(DownlinkState::MonitorTransmit));
                }
            }
            DownlinkState::Initial | DownlinkState::WaitingForStream => {}
        }

        self.aspect.indicate(RADIO_REPLICA_ID, watchdog_ok);

        if self.downlink_state == DownlinkState::Initial {
            self.downlink_state = DownlinkState::QueryConfig;
        }

        // we can only take data off the stream once we know we can act on it
        let mut stream_txn = self.stream_duct.receive_prepare(RADIO_REPLICA_ID);
        if self.downlink_state == DownlinkState::WaitingForStream {
            let length = stream_txn.receive(&mut self.buf_local);
            if length > 0 {
                assert!(length <= DOWNLINK_BUF_LOCAL_SIZE);
                self.downlink_length = length;
                self.downlink_state = DownlinkState::ValidateIdle;
                ringbuf_entry!(Trace::StreamAccepted(length));
            }
        } else {
            let dropped = stream_txn.discard();
            if dropped > 0 {
                ringbuf_entry!(Trace::StreamDroppedWhileBusy(dropped));
            }
        }
        stream_txn.commit();

        match self.downlink_state {
            DownlinkState::QueryConfig => {
                txn.read_start(0x00, reg_addr(RadioRegister::Magic), NUM_REGISTERS * 4);
            }
            DownlinkState::DisableTransmit => {
                // disable transmission and zero the pointer and length
                let block = [0u8; 3 * 4];
                txn.write_start(0x00, reg_addr(RadioRegister::TxPtr), &block);
            }
            DownlinkState::ValidateIdle => {
                txn.read_start(0x00, reg_addr(RadioRegister::TxState), 4);
            }
            DownlinkState::WriteRadioMemory => {
                assert!(
                    self.downlink_length >= 1 && self.downlink_length <= DOWNLINK_BUF_LOCAL_SIZE
                );
                txn.write_start(
                    0x00,
                    MEM_BASE_ADDR + tx_region().base,
                    &self.buf_local[..self.downlink_length],
                );
            }
            DownlinkState::StartTransmit => {
                assert!(self.downlink_length as u32 <= tx_region().size);
                let mut block = [0u8; 3 * 4];
                words_to_be(
                    &[
                        tx_region().base,
                        self.downlink_length as u32,
                        TxState::Active as u32,
                    ],
                    &mut block,
                );
                txn.write_start(0x00, reg_addr(RadioRegister::TxPtr), &block);
            }
            DownlinkState::MonitorTransmit => {
                // remaining byte count, then transmitter state
                txn.read_start(0x00, reg_addr(RadioRegister::TxLen), 2 * 4);
            }
            DownlinkState::Initial | DownlinkState::WaitingForStream => {}
        }

        txn.commit();
    }
}
