// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Starwire: the spacecraft's full-duplex serial bus.
//!
//! The bus stack, bottom up:
//!
//! - [`codec`]: byte-level escape framing over duct-delivered line chunks.
//! - [`exchange`]: the handshaking, flow-controlled link protocol, run as a
//!   pair of clips per replica plus a randomness clip.
//! - [`switch`]: address-routed packet forwarding between bus endpoints.
//! - [`rmap`]: remote memory access transactions over the packet layer.

pub mod codec;
pub mod crc8;
pub mod exchange;
pub mod rand;
pub mod rmap;
pub mod switch;

/// Hard protocol limit on unacknowledged flow-control credit.
pub const MAX_OUTSTANDING_TOKENS: u32 = 10;
