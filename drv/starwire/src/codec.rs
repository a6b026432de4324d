// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Byte-level line coding: control characters, escaping, and the
//! per-epoch encoder and decoder.
//!
//! The line is a plain byte stream delivered in per-epoch chunks through a
//! duct. Control characters live in the reserved range 0xF8..=0xFF; any data
//! byte that collides with the range is sent as [`Symbol::EscapeSym`]
//! followed by the byte XOR 0x10. Four of the control characters carry a
//! 32-bit big-endian parameter, transmitted as (escaped) data bytes.
//!
//! Decoding is resumable across chunk boundaries: everything the decoder
//! must remember between epochs lives in [`DecoderSynch`], a plain `Copy`
//! record the link stores in its replicated note.

use std::rc::Rc;

use byteorder::{BigEndian, ByteOrder};
use duct::Duct;
use exec::Timestamp;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use static_assertions::const_assert;

/// Escaped bytes are XORed with this to move them out of the reserved range.
const ESCAPE_XOR: u8 = 0x10;

/// First byte of the reserved control-character range.
pub const RESERVED_BASE: u8 = 0xF8;

// escaping must take every reserved byte out of the reserved range
const_assert!(0xF8 ^ ESCAPE_XOR < RESERVED_BASE);
const_assert!(0xFF ^ ESCAPE_XOR < RESERVED_BASE);

/// Line symbols. The first eight correspond to reserved byte values;
/// `CodecError` is synthesized by the decoder and never appears on the wire.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum Symbol {
    Handshake1 = 0xF8,
    Handshake2 = 0xF9,
    StartPacket = 0xFA,
    EndPacket = 0xFB,
    ErrorPacket = 0xFC,
    FlowControl = 0xFD,
    KeepAlive = 0xFE,
    EscapeSym = 0xFF,
    CodecError = 0x00,
}

impl Symbol {
    pub fn from_byte(byte: u8) -> Option<Self> {
        if is_reserved(byte) {
            Symbol::from_u8(byte)
        } else {
            None
        }
    }

    /// True for symbols that carry a 32-bit parameter.
    pub fn is_parametrized(self) -> bool {
        matches!(
            self,
            Symbol::Handshake1 | Symbol::Handshake2 | Symbol::FlowControl | Symbol::KeepAlive
        )
    }

    pub fn label(self) -> &'static str {
        match self {
            Symbol::Handshake1 => "HANDSHAKE_1",
            Symbol::Handshake2 => "HANDSHAKE_2",
            Symbol::StartPacket => "START_PACKET",
            Symbol::EndPacket => "END_PACKET",
            Symbol::ErrorPacket => "ERROR_PACKET",
            Symbol::FlowControl => "FLOW_CONTROL",
            Symbol::KeepAlive => "KEEP_ALIVE",
            Symbol::EscapeSym => "ESCAPE_SYM",
            Symbol::CodecError => "CODEC_ERROR",
        }
    }
}

/// True if `byte` falls in the reserved control-character range.
pub fn is_reserved(byte: u8) -> bool {
    byte >= RESERVED_BASE
}

/// Decoder state that must survive across epoch chunks (and therefore lives
/// in the link's replicated note).
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DecoderSynch {
    in_escape: bool,
    /// Parameterized control character currently being assembled, if any.
    current: Option<Symbol>,
    param_bytes: [u8; 4],
    param_count: u8,
    timestamp: Timestamp,
}

/// One decoded entity: either a run of data bytes (counted, and copied out
/// when a destination was supplied) or a control character with optional
/// parameter.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Decoded {
    pub ctrl: Option<Symbol>,
    pub param: u32,
    pub data_len: usize,
    pub timestamp: Timestamp,
}

/// Per-replica line decoder. The chunk buffer is wiped every epoch; only
/// [`DecoderSynch`] carries state across epochs.
pub struct Decoder {
    rx_duct: Rc<Duct>,
    replica: usize,
    buffer: Box<[u8]>,
    length: usize,
    offset: usize,
    chunk_timestamp: Timestamp,
}

impl Decoder {
    pub fn new(rx_duct: Rc<Duct>, replica: usize) -> Self {
        // when ducts are used as streams, there is no need to separate their
        // elements
        assert!(rx_duct.max_flow() == 1, "line ducts carry one chunk per epoch");
        let capacity = rx_duct.message_size();
        Self {
            rx_duct,
            replica,
            buffer: vec![0u8; capacity].into_boxed_slice(),
            length: 0,
            offset: 0,
            chunk_timestamp: 0,
        }
    }

    /// Pulls this epoch's line chunk (possibly empty) out of the duct.
    pub fn prepare(&mut self) {
        let mut txn = self.rx_duct.receive_prepare(self.replica);
        match txn.receive_timestamped(&mut self.buffer) {
            Some((size, timestamp)) => {
                self.length = size;
                self.chunk_timestamp = timestamp;
            }
            None => {
                self.length = 0;
            }
        }
        self.offset = 0;
        txn.commit();
    }

    /// Verifies the epoch's chunk was fully consumed.
    pub fn commit(&mut self) {
        assert!(
            self.offset == self.length,
            "decoder left {} line bytes unconsumed",
            self.length - self.offset,
        );
    }

    /// Decodes the next entity, resuming from `synch`. Data bytes are
    /// appended to `out` when supplied, otherwise counted and discarded.
    /// Returns `None` when the chunk is exhausted with nothing to report.
    pub fn decode(&mut self, synch: &mut DecoderSynch, out: Option<&mut [u8]>) -> Option<Decoded> {
        let mut decoded;

        // primary path: no parameter in progress
        if synch.current.is_none() {
            decoded = self.decode_raw(synch, out)?;

            match decoded.ctrl {
                Some(ctrl) if ctrl.is_parametrized() => {
                    // start accumulating the parameter before reporting
                    synch.current = Some(ctrl);
                    synch.param_count = 0;
                    synch.timestamp = decoded.timestamp;
                }
                _ => return Some(decoded),
            }
        }

        // secondary path: accumulate parameter bytes, possibly across chunks
        loop {
            let current = synch.current.expect("parameter assembly underway");
            debug_assert!(current.is_parametrized());
            let count = synch.param_count as usize;

            let mut param_buf = synch.param_bytes;
            let sub = self.decode_raw(synch, Some(&mut param_buf[count..]))?;
            synch.param_bytes = param_buf;

            if sub.ctrl.is_some() {
                // a control character inside a parameter window is a codec
                // error; the partial parameter is discarded
                debug_assert!(sub.data_len == 0);
                synch.current = None;
                decoded = Decoded {
                    ctrl: Some(Symbol::CodecError),
                    param: 0,
                    data_len: 0,
                    timestamp: sub.timestamp,
                };
                return Some(decoded);
            }

            debug_assert!(sub.data_len > 0 && count + sub.data_len <= 4);
            synch.param_count += sub.data_len as u8;
            if synch.param_count == 4 {
                decoded = Decoded {
                    ctrl: Some(current),
                    param: BigEndian::read_u32(&synch.param_bytes),
                    data_len: 0,
                    timestamp: synch.timestamp,
                };
                synch.current = None;
                return Some(decoded);
            }
            // not enough bytes yet: either the chunk ran dry (decode_raw
            // returned None above) or we hit a control character; loop to
            // find out which
        }
    }

    /// Unescapes a run of bytes, stopping at a control character, at the end
    /// of the chunk, or when `out` fills. Does not interpret parameters.
    fn decode_raw(&mut self, synch: &mut DecoderSynch, out: Option<&mut [u8]>) -> Option<Decoded> {
        let mut decoded = Decoded {
            ctrl: None,
            param: 0,
            data_len: 0,
            timestamp: self.chunk_timestamp,
        };
        let capacity = out.as_ref().map(|out| out.len());
        assert!(capacity != Some(0), "data destination must have capacity");
        let mut out = out;

        loop {
            if self.offset == self.length {
                return (decoded.data_len > 0).then_some(decoded);
            }

            let cur = self.buffer[self.offset];
            self.offset += 1;

            if synch.in_escape {
                let unescaped = cur ^ ESCAPE_XOR;
                if !is_reserved(unescaped) {
                    // invalid escape sequence; report the escape itself for
                    // error handling, after any data gathered so far
                    self.offset -= 1; // reinterpret this byte, unescaped
                    if decoded.data_len > 0 {
                        return Some(decoded);
                    }
                    synch.in_escape = false;
                    decoded.ctrl = Some(Symbol::EscapeSym);
                    return Some(decoded);
                }
                synch.in_escape = false;
                if let Some(out) = out.as_deref_mut() {
                    out[decoded.data_len] = unescaped;
                }
                decoded.data_len += 1;
            } else if cur == Symbol::EscapeSym as u8 {
                synch.in_escape = true;
                continue;
            } else if is_reserved(cur) {
                if decoded.data_len > 0 {
                    // deliver gathered data first; reinterpret next round
                    self.offset -= 1;
                    return Some(decoded);
                }
                decoded.ctrl = Symbol::from_byte(cur);
                debug_assert!(decoded.ctrl.is_some());
                return Some(decoded);
            } else {
                if let Some(out) = out.as_deref_mut() {
                    out[decoded.data_len] = cur;
                }
                decoded.data_len += 1;
            }

            if let Some(capacity) = capacity {
                if decoded.data_len == capacity {
                    return Some(decoded);
                }
            }
        }
    }
}

/// Per-replica line encoder. Stateless beyond the current buffer offset;
/// the buffer is flushed to the transmit duct at commit.
pub struct Encoder {
    tx_duct: Rc<Duct>,
    replica: usize,
    buffer: Box<[u8]>,
    offset: usize,
}

impl Encoder {
    pub fn new(tx_duct: Rc<Duct>, replica: usize) -> Self {
        assert!(tx_duct.max_flow() == 1, "line ducts carry one chunk per epoch");
        let capacity = tx_duct.message_size();
        Self {
            tx_duct,
            replica,
            buffer: vec![0u8; capacity].into_boxed_slice(),
            offset: 0,
        }
    }

    pub fn prepare(&mut self) {
        self.offset = 0;
    }

    /// Escapes and appends data bytes, returning how many input bytes fit.
    pub fn encode_data(&mut self, bytes: &[u8]) -> usize {
        assert!(!bytes.is_empty());
        let mut consumed = 0;
        for &byte in bytes {
            if is_reserved(byte) {
                if self.offset + 2 > self.buffer.len() {
                    break;
                }
                self.buffer[self.offset] = Symbol::EscapeSym as u8;
                self.buffer[self.offset + 1] = byte ^ ESCAPE_XOR;
                self.offset += 2;
            } else {
                if self.offset + 1 > self.buffer.len() {
                    break;
                }
                self.buffer[self.offset] = byte;
                self.offset += 1;
            }
            consumed += 1;
        }
        consumed
    }

    /// Appends a control character (with its parameter, if it takes one).
    /// Returns false if it might not fit, so the caller can retry next epoch.
    pub fn encode_ctrl(&mut self, symbol: Symbol, param: u32) -> bool {
        assert!(
            is_reserved(symbol as u8) && symbol != Symbol::EscapeSym,
            "{} cannot be transmitted directly",
            symbol.label(),
        );
        assert!(param == 0 || symbol.is_parametrized());

        // worst case: the symbol plus four fully-escaped parameter bytes
        let reserved = if symbol.is_parametrized() { 9 } else { 1 };
        if self.offset + reserved > self.buffer.len() {
            return false;
        }

        self.buffer[self.offset] = symbol as u8;
        self.offset += 1;
        if symbol.is_parametrized() {
            let mut netparam = [0u8; 4];
            BigEndian::write_u32(&mut netparam, param);
            let actual = self.encode_data(&netparam);
            // cannot fail: space was reserved above
            assert!(actual == netparam.len());
        }
        true
    }

    /// Flushes the epoch's buffer to the transmit duct, stamped with the
    /// sending clip's time.
    pub fn commit(&mut self, timestamp: Timestamp) {
        let mut txn = self.tx_duct.send_prepare(self.replica);
        if self.offset > 0 {
            txn.send(&self.buffer[..self.offset], timestamp);
        }
        txn.commit();
    }

    /// Bytes left in the epoch's transmit buffer.
    pub fn space_remaining(&self) -> usize {
        self.buffer.len() - self.offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duct::{DuctConfig, DuctPolarity};

    fn line_duct(size: usize) -> Rc<Duct> {
        Rc::new(Duct::new(DuctConfig {
            label: "line",
            sender_replicas: 1,
            receiver_replicas: 1,
            max_flow: 1,
            message_size: size,
            polarity: DuctPolarity::SenderFirst,
        }))
    }

    fn push_chunk(duct: &Duct, bytes: &[u8], timestamp: Timestamp) {
        let mut txn = duct.send_prepare(0);
        txn.send(bytes, timestamp);
        txn.commit();
    }

    #[test]
    fn decodes_data_and_controls() {
        let d = line_duct(64);
        push_chunk(&d, &[0x01, 0x02, Symbol::StartPacket as u8, 0x03], 55);
        let mut dec = Decoder::new(Rc::clone(&d), 0);
        let mut synch = DecoderSynch::default();
        dec.prepare();

        let mut buf = [0u8; 8];
        let ent = dec.decode(&mut synch, Some(&mut buf)).unwrap();
        assert_eq!(ent.ctrl, None);
        assert_eq!(ent.data_len, 2);
        assert_eq!(&buf[..2], &[0x01, 0x02]);
        assert_eq!(ent.timestamp, 55);

        let ent = dec.decode(&mut synch, Some(&mut buf)).unwrap();
        assert_eq!(ent.ctrl, Some(Symbol::StartPacket));

        let ent = dec.decode(&mut synch, Some(&mut buf)).unwrap();
        assert_eq!(ent.data_len, 1);
        assert_eq!(buf[0], 0x03);

        assert!(dec.decode(&mut synch, Some(&mut buf)).is_none());
        dec.commit();
    }

    #[test]
    fn escape_round_trip_via_encoder() {
        let d = line_duct(64);
        let mut enc = Encoder::new(Rc::clone(&d), 0);
        enc.prepare();
        let payload = [0xF7, 0xF8, 0xFF, 0x10, 0x00];
        assert_eq!(enc.encode_data(&payload), payload.len());
        enc.commit(9);

        let mut dec = Decoder::new(d, 0);
        let mut synch = DecoderSynch::default();
        dec.prepare();
        let mut buf = [0u8; 16];
        let ent = dec.decode(&mut synch, Some(&mut buf)).unwrap();
        assert_eq!(ent.ctrl, None);
        assert_eq!(&buf[..ent.data_len], &payload);
        assert!(dec.decode(&mut synch, Some(&mut buf)).is_none());
        dec.commit();
    }

    #[test]
    fn parameter_reassembles_across_chunks() {
        let d = line_duct(64);
        let mut dec = Decoder::new(Rc::clone(&d), 0);
        let mut synch = DecoderSynch::default();

        push_chunk(&d, &[Symbol::FlowControl as u8, 0x12, 0x34], 100);
        dec.prepare();
        let mut buf = [0u8; 8];
        assert!(dec.decode(&mut synch, Some(&mut buf)).is_none());
        dec.commit();

        push_chunk(&d, &[0x56, 0x78], 200);
        dec.prepare();
        let ent = dec.decode(&mut synch, Some(&mut buf)).unwrap();
        assert_eq!(ent.ctrl, Some(Symbol::FlowControl));
        assert_eq!(ent.param, 0x1234_5678);
        // the parameter is stamped with its control character's chunk
        assert_eq!(ent.timestamp, 100);
        dec.commit();
    }

    #[test]
    fn control_inside_parameter_is_codec_error() {
        let d = line_duct(64);
        push_chunk(
            &d,
            &[Symbol::KeepAlive as u8, 0x01, Symbol::EndPacket as u8],
            7,
        );
        let mut dec = Decoder::new(d, 0);
        let mut synch = DecoderSynch::default();
        dec.prepare();
        let mut buf = [0u8; 8];
        let ent = dec.decode(&mut synch, Some(&mut buf)).unwrap();
        assert_eq!(ent.ctrl, Some(Symbol::CodecError));
        assert!(dec.decode(&mut synch, Some(&mut buf)).is_none());
        dec.commit();
    }

    #[test]
    fn invalid_escape_reports_escape_symbol() {
        let d = line_duct(64);
        // 0x22 ^ 0x10 = 0x32, not reserved: invalid escape
        push_chunk(&d, &[Symbol::EscapeSym as u8, 0x22], 7);
        let mut dec = Decoder::new(d, 0);
        let mut synch = DecoderSynch::default();
        dec.prepare();
        let mut buf = [0u8; 8];
        let ent = dec.decode(&mut synch, Some(&mut buf)).unwrap();
        assert_eq!(ent.ctrl, Some(Symbol::EscapeSym));
        // the escaped byte is then reinterpreted as plain data
        let ent = dec.decode(&mut synch, Some(&mut buf)).unwrap();
        assert_eq!(ent.data_len, 1);
        assert_eq!(buf[0], 0x22);
        dec.commit();
    }

    #[test]
    fn encoder_reports_would_block() {
        let d = line_duct(10);
        let mut enc = Encoder::new(d, 0);
        enc.prepare();
        // 9 bytes must remain for a parameterized control
        assert_eq!(enc.encode_data(&[0u8; 2]), 2);
        assert!(!enc.encode_ctrl(Symbol::FlowControl, 0xFFFF_FFFF));
        assert_eq!(enc.space_remaining(), 8);
        // a bare control still fits
        assert!(enc.encode_ctrl(Symbol::EndPacket, 0));
        enc.commit(0);
    }

    #[test]
    fn empty_epoch_commits_empty_chunk() {
        let d = line_duct(16);
        let mut enc = Encoder::new(Rc::clone(&d), 0);
        enc.prepare();
        enc.commit(0);

        let mut dec = Decoder::new(d, 0);
        let mut synch = DecoderSynch::default();
        dec.prepare();
        let mut buf = [0u8; 8];
        assert!(dec.decode(&mut synch, Some(&mut buf)).is_none());
        dec.commit();
    }
}
