// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The RMAP header/data CRC.
//!
//! Polynomial 0x07, bit-reversed in and out, zero init and xorout, per the
//! SpaceWire RMAP definition. Header and data are covered by separate CRCs.

use crc::{Algorithm, Crc};

pub const CRC_8_RMAP: Algorithm<u8> = Algorithm {
    width: 8,
    poly: 0x07,
    init: 0x00,
    refin: true,
    refout: true,
    xorout: 0x00,
    check: 0x20,
    residue: 0x00,
};

const CRC8: Crc<u8> = Crc::<u8>::new(&CRC_8_RMAP);

pub fn rmap_crc8(data: &[u8]) -> u8 {
    CRC8.checksum(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    // reference patterns from the RMAP definition
    #[test]
    fn reference_vectors() {
        assert_eq!(rmap_crc8(b"123456789"), 0x20);
        assert_eq!(
            rmap_crc8(&[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07]),
            0x7E
        );
        assert_eq!(rmap_crc8(b"SpaceWire is fun"), 0xF5);
        assert_eq!(
            rmap_crc8(&[
                0x10, 0x56, 0xC3, 0x95, 0xA5, 0xEC, 0x62, 0x4F, 0x08, 0x1C, 0x62, 0xEE, 0xA6,
                0x35, 0x67, 0xBB,
            ]),
            0x2E
        );
        assert_eq!(
            rmap_crc8(&[0xAB, 0xCD, 0xEF, 0x01, 0x23, 0x45, 0x67, 0x89]),
            0xB2
        );
        assert_eq!(rmap_crc8(&[]), 0x00);
    }

    #[test]
    fn order_sensitive() {
        assert_ne!(rmap_crc8(b"ab"), rmap_crc8(b"ba"));
    }
}
