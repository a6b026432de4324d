// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The radio: register-level uplink and downlink pipelines over RMAP.
//!
//! The radio device exposes a register file and a memory window on the bus.
//! Reception uses an active/passive pair of buffer halves so the device can
//! keep listening while the flight software drains the other half; the
//! uplink clip walks that arrangement with one RMAP transaction per epoch.
//! Transmission is single-buffered: the downlink clip stages a frame into
//! the transmit region, kicks the transmitter, and watches it drain.

mod downlink;
mod regs;
mod uplink;

pub use downlink::{DownlinkState, RadioDownlinkClip};
pub use regs::{
    reg_addr, rx_halves, tx_region, validate_common_config, words_from_be, words_to_be, MemRegion,
    RadioRegister, RxState, TxState, MEM_BASE_ADDR, MEM_SIZE, NUM_REGISTERS, RADIO_MAGIC,
    REG_BASE_ADDR,
};
pub use uplink::{compute_reads, RadioUplinkClip, ReadPlan, UplinkNote, UplinkState};

use static_assertions::const_assert;

/// Size of the replica-local uplink bounce buffer.
pub const UPLINK_BUF_LOCAL_SIZE: usize = 1024;
/// Size of the downlink staging buffer.
pub const DOWNLINK_BUF_LOCAL_SIZE: usize = 1024;

// the bounce buffers must fit inside their device memory regions
const_assert!(UPLINK_BUF_LOCAL_SIZE <= (MEM_SIZE / 4) as usize);
const_assert!(DOWNLINK_BUF_LOCAL_SIZE <= (MEM_SIZE / 2) as usize);
