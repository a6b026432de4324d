// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Replicated communication primitives: the epoch lock, the duct, and the
//! notepad.
//!
//! A duct is a limited-flow-rate channel used for communication between
//! replicated clips. A normal queue communicates in two directions, because
//! it applies backpressure when the sender outruns the receiver. A duct only
//! communicates in one: the sender is limited to a fixed flow per scheduling
//! epoch regardless of the receiver's behavior, and the receiver is mandated
//! to accept the full flow every epoch. A receiver that fails to hold up its
//! end trips an assertion.

mod duct;
mod eplock;
mod notepad;

pub use crate::duct::{
    Duct, DuctConfig, DuctPolarity, DuctRecvTxn, DuctSendTxn, MAX_FLOW, MAX_REPLICAS, MISSING_FLOW,
};
pub use crate::eplock::EpLock;
pub use crate::notepad::{FeedForward, Notepad};
