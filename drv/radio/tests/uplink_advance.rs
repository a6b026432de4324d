// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Property: for any amount of data the device has received, repeated read
//! planning extracts exactly that amount, never more than one bounce buffer
//! per cycle, and never trips a register-coherency assertion.

use drv_radio::{
    compute_reads, rx_halves, RadioRegister, RxState, UplinkNote, NUM_REGISTERS,
    UPLINK_BUF_LOCAL_SIZE,
};
use proptest::prelude::*;

const RX_PTR: usize = RadioRegister::RxPtr as usize;
const RX_LEN: usize = RadioRegister::RxLen as usize;
const RX_PTR_ALT: usize = RadioRegister::RxPtrAlt as usize;
const RX_LEN_ALT: usize = RadioRegister::RxLenAlt as usize;
const RX_STATE: usize = RadioRegister::RxState as usize;

/// Register-level model of the device receiving `amount` bytes: the prime
/// buffer fills, falls over to the alternate the moment it is exhausted,
/// and overflows when nothing is left.
fn deliver(reg: &mut [u32; NUM_REGISTERS], mut amount: u32) {
    loop {
        if reg[RX_STATE] != RxState::Listening as u32 {
            return;
        }
        if reg[RX_LEN] == 0 {
            if reg[RX_PTR_ALT] + reg[RX_LEN_ALT] != 0 {
                reg[RX_PTR] = reg[RX_PTR_ALT];
                reg[RX_LEN] = reg[RX_LEN_ALT];
                reg[RX_PTR_ALT] = 0;
                reg[RX_LEN_ALT] = 0;
            } else {
                reg[RX_STATE] = RxState::Overflow as u32;
            }
            continue;
        }
        if amount == 0 {
            return;
        }
        let chunk = amount.min(reg[RX_LEN]);
        reg[RX_PTR] += chunk;
        reg[RX_LEN] -= chunk;
        amount -= chunk;
    }
}

proptest! {
    #[test]
    fn extraction_is_exact_and_bounded(amount in 0u32..=8192) {
        let halves = rx_halves();
        let n = halves[0].size;
        prop_assert!(amount <= 2 * n);

        // device as the pipeline leaves it after initialization
        let mut reg = [0u32; NUM_REGISTERS];
        reg[RX_PTR] = halves[0].base;
        reg[RX_LEN] = halves[0].size;
        reg[RX_PTR_ALT] = halves[1].base;
        reg[RX_LEN_ALT] = halves[1].size;
        reg[RX_STATE] = RxState::Listening as u32;
        deliver(&mut reg, amount);

        let mut note = UplinkNote::default();
        for _ in 0..64 {
            let before = note.bytes_extracted;
            let plan = compute_reads(&mut note, &mut reg);
            let delta = note.bytes_extracted - before;
            prop_assert!(delta <= UPLINK_BUF_LOCAL_SIZE as u32);
            prop_assert_eq!(delta, plan.prime_read_length + plan.flipped_read_length);
        }
        prop_assert_eq!(note.bytes_extracted, amount);
    }
}
