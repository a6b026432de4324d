// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Remote memory access over the packet layer.
//!
//! An RMAP instance owns one outgoing and one incoming packet slot per
//! epoch. Requests go out with a monotonic 16-bit transaction ID; replies
//! are validated against the most recent request (protocol byte, flags,
//! CRCs, transaction ID, logical addresses) and silently dropped when
//! anything fails to match, leaving the caller with `NoResponse`. The
//! transactor never retries: callers hold their state machines at the
//! current step until an epoch succeeds.
//!
//! The epoch pattern is complete-then-start: a clip first completes the
//! transaction it issued last epoch, then starts the next one, inside a
//! single [`RmapTxn`].

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use bitflags::bitflags;
use byteorder::{BigEndian, ByteOrder};
use duct::{Duct, DuctRecvTxn, DuctSendTxn};
use ringbuf::{ringbuf, ringbuf_entry};

use crate::crc8::rmap_crc8;

pub const RMAP_MAX_PATH: usize = 12;
pub const RMAP_MAX_DATA_LEN: usize = 0x00FF_FFFF;

const PROTOCOL_RMAP: u8 = 0x01;
const RMAP_REPLICA_ID: usize = 0;

/// Write reply: addresses + flags + status + txn id + header CRC.
const WRITE_REPLY_LEN: usize = 8;
/// Bytes of a read reply that are not data: the header through its CRC,
/// plus the trailing data CRC.
const READ_REPLY_HEADER_LEN: usize = 13;

bitflags! {
    /// The RMAP instruction field.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct RmapFlags: u8 {
        const RESERVED    = 0x80;
        const COMMAND     = 0x40;
        const WRITE       = 0x20;
        const VERIFY      = 0x10;
        const ACKNOWLEDGE = 0x08;
        const INCREMENT   = 0x04;
        const SOURCEPATH  = 0x03;
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Trace {
    WriteStart { addr: u32, len: usize },
    ReadStart { addr: u32, len: usize },
    DroppedTruncated(usize),
    DroppedBadProtocol(u8),
    DroppedBadFlags(u8),
    DroppedBadLength(usize),
    DroppedBadHeaderCrc { found: u8, expected: u8 },
    DroppedBadDataCrc { found: u8, expected: u8 },
    DroppedBadReserved(u8),
    DroppedBadTxnId { found: u16, expected: u16 },
    DroppedBadAddressing { src: u8, dst: u8 },
    DroppedLate(usize),
    NoResponse,
    Completed(u8),
}

ringbuf!(Trace, 32);

/// One hop endpoint: an optional path prefix plus a logical address.
#[derive(Clone, Debug)]
pub struct RmapPath {
    pub path_bytes: Vec<u8>,
    pub logical_address: u8,
}

impl RmapPath {
    pub fn logical(logical_address: u8) -> Self {
        Self {
            path_bytes: Vec::new(),
            logical_address,
        }
    }
}

/// Fixed routing record for one RMAP instance.
#[derive(Clone, Debug)]
pub struct RmapRouting {
    pub destination: RmapPath,
    pub source: RmapPath,
    pub dest_key: u8,
}

/// Transaction outcome. Remote status bytes are reported verbatim; local
/// failures use the dedicated variants.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RmapStatus {
    Ok,
    /// Nonzero status byte returned by the target.
    Remote(u8),
    /// No reply, or a reply that failed validation and was dropped.
    NoResponse,
    /// A read reply carried a different amount of data than requested.
    ReadLengthDiffers,
}

impl RmapStatus {
    fn from_byte(status: u8) -> Self {
        if status == 0 {
            RmapStatus::Ok
        } else {
            RmapStatus::Remote(status)
        }
    }

    pub fn is_ok(self) -> bool {
        self == RmapStatus::Ok
    }
}

pub struct Rmap {
    label: &'static str,
    routing: RmapRouting,
    tx_duct: Rc<Duct>,
    rx_duct: Rc<Duct>,
    current_txn_id: Cell<u16>,
    scratch: RefCell<Box<[u8]>>,
}

impl Rmap {
    pub fn new(
        label: &'static str,
        routing: RmapRouting,
        tx_duct: Rc<Duct>,
        rx_duct: Rc<Duct>,
    ) -> Self {
        // exactly one transaction may be in flight per epoch
        assert!(tx_duct.max_flow() == 1 && rx_duct.max_flow() == 1);
        assert!(routing.destination.path_bytes.len() <= RMAP_MAX_PATH);
        assert!(routing.source.path_bytes.len() <= RMAP_MAX_PATH);
        let scratch = tx_duct.message_size().max(rx_duct.message_size());
        Self {
            label,
            routing,
            tx_duct,
            rx_duct,
            current_txn_id: Cell::new(0),
            scratch: RefCell::new(vec![0u8; scratch].into_boxed_slice()),
        }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Source path length in words, as carried in the instruction field.
    fn source_path_words(&self) -> usize {
        (self.routing.source.path_bytes.len() + 3) / 4
    }

    /// Bytes of header overhead in an outgoing command.
    fn command_overhead(&self) -> usize {
        self.routing.destination.path_bytes.len() + 16 + self.source_path_words() * 4
    }

    /// Largest write payload this instance can issue.
    pub fn max_write_length(&self) -> usize {
        (self.tx_duct.message_size() - self.command_overhead() - 1).min(RMAP_MAX_DATA_LEN)
    }

    /// Largest read this instance can complete.
    pub fn max_read_length(&self) -> usize {
        (self.rx_duct.message_size() - READ_REPLY_HEADER_LEN).min(RMAP_MAX_DATA_LEN)
    }

    /// Opens the paired send/receive transactions for this epoch.
    pub fn epoch_prepare(&self) -> RmapTxn<'_> {
        RmapTxn {
            rmap: self,
            tx: self.tx_duct.send_prepare(RMAP_REPLICA_ID),
            rx: self.rx_duct.receive_prepare(RMAP_REPLICA_ID),
        }
    }
}

pub struct RmapTxn<'a> {
    rmap: &'a Rmap,
    tx: DuctSendTxn<'a>,
    rx: DuctRecvTxn<'a>,
}

impl RmapTxn<'_> {
    /// Assembles and sends a write command. The reply is collected next
    /// epoch with [`Self::write_complete`].
    pub fn write_start(&mut self, ext_addr: u8, main_addr: u32, data: &[u8]) {
        let rmap = self.rmap;
        assert!(
            data.len() <= rmap.max_write_length(),
            "rmap '{}': write of {} bytes exceeds limit {}",
            rmap.label,
            data.len(),
            rmap.max_write_length(),
        );
        ringbuf_entry!(Trace::WriteStart {
            addr: main_addr,
            len: data.len(),
        });

        let flags = RmapFlags::COMMAND
            | RmapFlags::WRITE
            | RmapFlags::VERIFY
            | RmapFlags::ACKNOWLEDGE
            | RmapFlags::INCREMENT;
        let mut scratch = rmap.scratch.borrow_mut();
        let header_end = Self::build_command(rmap, &mut scratch, flags, ext_addr, main_addr, data.len());

        scratch[header_end..header_end + data.len()].copy_from_slice(data);
        let data_end = header_end + data.len();
        scratch[data_end] = rmap_crc8(data);
        let total = data_end + 1;

        assert!(total <= rmap.tx_duct.message_size());
        if !self.tx.allowed() {
            panic!(
                "rmap '{}': not permitted to transmit another packet during this epoch",
                rmap.label,
            );
        }
        self.tx.send(&scratch[..total], 0);
    }

    /// Assembles and sends a read command for `length` bytes.
    pub fn read_start(&mut self, ext_addr: u8, main_addr: u32, length: usize) {
        let rmap = self.rmap;
        assert!(
            length <= rmap.max_read_length(),
            "rmap '{}': read of {length} bytes exceeds limit {}",
            rmap.label,
            rmap.max_read_length(),
        );
        ringbuf_entry!(Trace::ReadStart {
            addr: main_addr,
            len: length,
        });

        let flags = RmapFlags::COMMAND | RmapFlags::ACKNOWLEDGE | RmapFlags::INCREMENT;
        let mut scratch = rmap.scratch.borrow_mut();
        let total = Self::build_command(rmap, &mut scratch, flags, ext_addr, main_addr, length);

        assert!(total <= rmap.tx_duct.message_size());
        if !self.tx.allowed() {
            panic!(
                "rmap '{}': not permitted to transmit another packet during this epoch",
                rmap.label,
            );
        }
        self.tx.send(&scratch[..total], 0);
    }

    /// Writes the command header (through header CRC) into `out`, bumping
    /// the transaction ID. Returns the offset just past the header CRC.
    fn build_command(
        rmap: &Rmap,
        out: &mut [u8],
        flags: RmapFlags,
        ext_addr: u8,
        main_addr: u32,
        data_length: usize,
    ) -> usize {
        assert!(data_length <= RMAP_MAX_DATA_LEN);
        let routing = &rmap.routing;
        let mut o = 0;

        out[..routing.destination.path_bytes.len()]
            .copy_from_slice(&routing.destination.path_bytes);
        o += routing.destination.path_bytes.len();

        let header_start = o;
        out[o] = routing.destination.logical_address;
        out[o + 1] = PROTOCOL_RMAP;
        let spal = rmap.source_path_words() as u8;
        assert!(RmapFlags::SOURCEPATH.bits() & spal == spal);
        out[o + 2] = flags.bits() | spal;
        out[o + 3] = routing.dest_key;
        o += 4;

        // the source path is left-padded with zeros to a whole word count;
        // leading zeros are skipped by the routers on the way back
        let padding = rmap.source_path_words() * 4 - routing.source.path_bytes.len();
        out[o..o + padding].fill(0);
        o += padding;
        out[o..o + routing.source.path_bytes.len()].copy_from_slice(&routing.source.path_bytes);
        o += routing.source.path_bytes.len();

        let txn_id = rmap.current_txn_id.get().wrapping_add(1);
        rmap.current_txn_id.set(txn_id);

        out[o] = routing.source.logical_address;
        out[o + 1] = (txn_id >> 8) as u8;
        out[o + 2] = txn_id as u8;
        out[o + 3] = ext_addr;
        BigEndian::write_u32(&mut out[o + 4..o + 8], main_addr);
        out[o + 8] = (data_length >> 16) as u8;
        out[o + 9] = (data_length >> 8) as u8;
        out[o + 10] = data_length as u8;
        o += 11;

        out[o] = rmap_crc8(&out[header_start..o]);
        o + 1
    }

    /// Collects the reply to last epoch's write. `NoResponse` covers both
    /// silence and replies dropped by validation.
    pub fn write_complete(&mut self) -> RmapStatus {
        let rmap = self.rmap;
        let mut scratch = rmap.scratch.borrow_mut();
        let count = self.rx.receive(&mut scratch);
        if count == 0 {
            ringbuf_entry!(Trace::NoResponse);
            return RmapStatus::NoResponse;
        }
        match Self::validate_write_reply(rmap, &scratch[..count]) {
            Some(status) => {
                ringbuf_entry!(Trace::Completed(status));
                RmapStatus::from_byte(status)
            }
            None => {
                ringbuf_entry!(Trace::NoResponse);
                RmapStatus::NoResponse
            }
        }
    }

    fn validate_write_reply(rmap: &Rmap, reply: &[u8]) -> Option<u8> {
        if reply.len() < WRITE_REPLY_LEN {
            ringbuf_entry!(Trace::DroppedTruncated(reply.len()));
            return None;
        }
        if reply[1] != PROTOCOL_RMAP {
            ringbuf_entry!(Trace::DroppedBadProtocol(reply[1]));
            return None;
        }
        let relevant = RmapFlags::RESERVED
            | RmapFlags::COMMAND
            | RmapFlags::WRITE
            | RmapFlags::VERIFY
            | RmapFlags::ACKNOWLEDGE
            | RmapFlags::INCREMENT;
        let expected = RmapFlags::WRITE | RmapFlags::VERIFY | RmapFlags::ACKNOWLEDGE | RmapFlags::INCREMENT;
        if reply[2] & relevant.bits() != expected.bits() {
            ringbuf_entry!(Trace::DroppedBadFlags(reply[2]));
            return None;
        }
        if reply.len() != WRITE_REPLY_LEN {
            ringbuf_entry!(Trace::DroppedBadLength(reply.len()));
            return None;
        }
        let computed = rmap_crc8(&reply[..7]);
        if computed != reply[7] {
            ringbuf_entry!(Trace::DroppedBadHeaderCrc {
                found: reply[7],
                expected: computed,
            });
            return None;
        }
        let txn_id = u16::from(reply[5]) << 8 | u16::from(reply[6]);
        if txn_id != rmap.current_txn_id.get() {
            ringbuf_entry!(Trace::DroppedBadTxnId {
                found: txn_id,
                expected: rmap.current_txn_id.get(),
            });
            return None;
        }
        if reply[0] != rmap.routing.source.logical_address
            || reply[4] != rmap.routing.destination.logical_address
        {
            ringbuf_entry!(Trace::DroppedBadAddressing {
                src: reply[0],
                dst: reply[4],
            });
            return None;
        }
        Some(reply[3])
    }

    /// Collects the reply to last epoch's read into `out`, which must be
    /// sized to the requested length.
    pub fn read_complete(&mut self, out: &mut [u8]) -> RmapStatus {
        let rmap = self.rmap;
        let mut scratch = rmap.scratch.borrow_mut();
        let count = self.rx.receive(&mut scratch);
        if count == 0 {
            ringbuf_entry!(Trace::NoResponse);
            return RmapStatus::NoResponse;
        }
        let Some((status, data_length)) = Self::validate_read_reply(rmap, &scratch[..count]) else {
            ringbuf_entry!(Trace::NoResponse);
            return RmapStatus::NoResponse;
        };

        let copy = data_length.min(out.len());
        out[..copy].copy_from_slice(&scratch[12..12 + copy]);

        ringbuf_entry!(Trace::Completed(status));
        if status != 0 {
            RmapStatus::from_byte(status)
        } else if data_length != out.len() {
            RmapStatus::ReadLengthDiffers
        } else {
            RmapStatus::Ok
        }
    }

    fn validate_read_reply(rmap: &Rmap, reply: &[u8]) -> Option<(u8, usize)> {
        if reply.len() < WRITE_REPLY_LEN {
            ringbuf_entry!(Trace::DroppedTruncated(reply.len()));
            return None;
        }
        if reply[1] != PROTOCOL_RMAP {
            ringbuf_entry!(Trace::DroppedBadProtocol(reply[1]));
            return None;
        }
        let relevant = RmapFlags::RESERVED
            | RmapFlags::COMMAND
            | RmapFlags::ACKNOWLEDGE
            | RmapFlags::INCREMENT;
        let expected = RmapFlags::ACKNOWLEDGE | RmapFlags::INCREMENT;
        if reply[2] & relevant.bits() != expected.bits() {
            ringbuf_entry!(Trace::DroppedBadFlags(reply[2]));
            return None;
        }
        if reply.len() < READ_REPLY_HEADER_LEN {
            ringbuf_entry!(Trace::DroppedTruncated(reply.len()));
            return None;
        }
        let computed = rmap_crc8(&reply[..11]);
        if computed != reply[11] {
            ringbuf_entry!(Trace::DroppedBadHeaderCrc {
                found: reply[11],
                expected: computed,
            });
            return None;
        }
        if reply[7] != 0 {
            ringbuf_entry!(Trace::DroppedBadReserved(reply[7]));
            return None;
        }
        let data_length =
            usize::from(reply[8]) << 16 | usize::from(reply[9]) << 8 | usize::from(reply[10]);
        if reply.len() != READ_REPLY_HEADER_LEN + data_length {
            ringbuf_entry!(Trace::DroppedBadLength(reply.len()));
            return None;
        }
        let data_crc = rmap_crc8(&reply[12..12 + data_length]);
        if data_crc != reply[reply.len() - 1] {
            ringbuf_entry!(Trace::DroppedBadDataCrc {
                found: reply[reply.len() - 1],
                expected: data_crc,
            });
            return None;
        }
        let txn_id = u16::from(reply[5]) << 8 | u16::from(reply[6]);
        if txn_id != rmap.current_txn_id.get() {
            ringbuf_entry!(Trace::DroppedBadTxnId {
                found: txn_id,
                expected: rmap.current_txn_id.get(),
            });
            return None;
        }
        if reply[0] != rmap.routing.source.logical_address
            || reply[4] != rmap.routing.destination.logical_address
        {
            ringbuf_entry!(Trace::DroppedBadAddressing {
                src: reply[0],
                dst: reply[4],
            });
            return None;
        }
        Some((reply[3], data_length))
    }

    /// Ends the epoch: any packet still sitting in the receive duct arrived
    /// at an unexpected time and is dropped.
    pub fn commit(mut self) {
        let late = self.rx.discard();
        if late > 0 {
            ringbuf_entry!(Trace::DroppedLate(late));
        }
        self.tx.commit();
        self.rx.commit();
    }
}
