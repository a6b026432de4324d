// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The radio's register file and memory map.
//!
//! All registers are 32-bit and big-endian on the wire. The register block
//! sits at device address 0; the memory window follows at
//! [`MEM_BASE_ADDR`].

use num_derive::FromPrimitive;
use ringbuf::{ringbuf, ringbuf_entry};
use zerocopy::byteorder::{BigEndian, U32};
use zerocopy::{FromBytes, IntoBytes};

type U32Be = U32<BigEndian>;

pub const RADIO_MAGIC: u32 = 0x7E1E_CA11;
pub const REG_BASE_ADDR: u32 = 0x0000;
pub const MEM_BASE_ADDR: u32 = 0x1000;
pub const MEM_SIZE: u32 = 0x4000;

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(usize)]
pub enum RadioRegister {
    Magic = 0,
    TxPtr = 1,
    TxLen = 2,
    TxState = 3,
    RxPtr = 4,
    RxLen = 5,
    RxPtrAlt = 6,
    RxLenAlt = 7,
    RxState = 8,
    ErrCount = 9,
    MemBase = 10,
    MemSize = 11,
}

pub const NUM_REGISTERS: usize = 12;

/// Device address of a register.
pub fn reg_addr(register: RadioRegister) -> u32 {
    REG_BASE_ADDR + (register as u32) * 4
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u32)]
pub enum RxState {
    Idle = 0,
    Listening = 1,
    Overflow = 2,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u32)]
pub enum TxState {
    Idle = 0,
    Active = 1,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub struct MemRegion {
    pub base: u32,
    pub size: u32,
}

impl MemRegion {
    pub fn end(self) -> u32 {
        self.base + self.size
    }
}

/// The receive halves: one being filled by the device while the other is
/// drained by the flight software.
pub fn rx_halves() -> [MemRegion; 2] {
    [
        MemRegion {
            base: 0,
            size: MEM_SIZE / 4,
        },
        MemRegion {
            base: MEM_SIZE / 4,
            size: MEM_SIZE / 4,
        },
    ]
}

/// The transmit region: the upper half of device memory.
pub fn tx_region() -> MemRegion {
    MemRegion {
        base: MEM_SIZE / 2,
        size: MEM_SIZE / 2,
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Trace {
    BadMagic(u32),
    BadMemBase(u32),
    BadMemSize(u32),
}

ringbuf!(Trace, 8);

/// Validates the device's identity words: MAGIC, MEM_BASE, MEM_SIZE.
pub fn validate_common_config(magic: u32, mem_base: u32, mem_size: u32) -> bool {
    if magic != RADIO_MAGIC {
        ringbuf_entry!(Trace::BadMagic(magic));
        return false;
    }
    if mem_base != MEM_BASE_ADDR {
        ringbuf_entry!(Trace::BadMemBase(mem_base));
        return false;
    }
    if mem_size != MEM_SIZE {
        ringbuf_entry!(Trace::BadMemSize(mem_size));
        return false;
    }
    true
}

/// Unpacks a big-endian register block into host words.
pub fn words_from_be(bytes: &[u8], out: &mut [u32]) {
    // register blocks are whole words; anything else is a framing bug
    let words = <[U32Be]>::ref_from_bytes(bytes).expect("register block must be whole words");
    assert!(words.len() == out.len());
    for (dst, src) in out.iter_mut().zip(words) {
        *dst = src.get();
    }
}

/// Packs host words into a big-endian register block.
pub fn words_to_be(words: &[u32], out: &mut [u8]) {
    assert!(out.len() == words.len() * 4);
    for (chunk, &word) in out.chunks_exact_mut(4).zip(words) {
        chunk.copy_from_slice(U32Be::new(word).as_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_packing_round_trips() {
        let words = [0x1234_5678, 0x0000_0001];
        let mut bytes = [0u8; 8];
        words_to_be(&words, &mut bytes);
        assert_eq!(bytes, [0x12, 0x34, 0x56, 0x78, 0x00, 0x00, 0x00, 0x01]);
        let mut back = [0u32; 2];
        words_from_be(&bytes, &mut back);
        assert_eq!(back, words);
    }

    #[test]
    fn memory_map_partitions_cleanly() {
        let halves = rx_halves();
        assert_eq!(halves[0].end(), halves[1].base);
        assert_eq!(halves[1].end(), tx_region().base);
        assert_eq!(tx_region().end(), MEM_SIZE);
    }

    #[test]
    fn config_validation() {
        assert!(validate_common_config(RADIO_MAGIC, MEM_BASE_ADDR, MEM_SIZE));
        assert!(!validate_common_config(0, MEM_BASE_ADDR, MEM_SIZE));
        assert!(!validate_common_config(RADIO_MAGIC, 0, MEM_SIZE));
        assert!(!validate_common_config(RADIO_MAGIC, MEM_BASE_ADDR, 0));
    }
}
