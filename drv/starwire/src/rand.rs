// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Deterministic randomness for the link layer.
//!
//! The link uses randomness only to spread out handshakes and keep-alive
//! reminders; it needs reproducibility, not entropy. A xorshift generator
//! with a configured seed gives every simulation run and every replica an
//! identical, auditable stream. The stream is fed forward through a duct so
//! that replicated consumers all observe the same word each epoch.

use std::rc::Rc;

use byteorder::{BigEndian, ByteOrder};
use duct::Duct;
use exec::{Clip, ClipCtx};

/// Marsaglia xorshift, 32-bit variant. Period 2^32 - 1; zero is absorbing
/// and therefore rejected as a seed.
#[derive(Copy, Clone, Debug)]
pub struct Xorshift32 {
    state: u32,
}

impl Xorshift32 {
    pub fn new(seed: u32) -> Self {
        assert!(seed != 0, "xorshift seed must be nonzero");
        Self { state: seed }
    }

    pub fn next_u32(&mut self) -> u32 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.state = x;
        x
    }
}

/// The randomness-feeding clip: one fresh word per epoch on the rand duct.
///
/// Not replicated; replication is not critical for a randomness source, and
/// the duct fans the same word out to every consumer replica.
pub struct RandomClip {
    rand_duct: Rc<Duct>,
    rng: Xorshift32,
}

impl RandomClip {
    pub fn new(rand_duct: Rc<Duct>, seed: u32) -> Self {
        assert!(rand_duct.sender_replicas() == 1);
        assert!(rand_duct.message_size() >= 4);
        Self {
            rand_duct,
            rng: Xorshift32::new(seed),
        }
    }
}

impl Clip for RandomClip {
    fn clip(&mut self, ctx: &ClipCtx) {
        let mut word = [0u8; 4];
        BigEndian::write_u32(&mut word, self.rng.next_u32());
        let mut txn = self.rand_duct.send_prepare(0);
        txn.send(&word, ctx.clip_start);
        txn.commit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_is_reproducible() {
        let mut a = Xorshift32::new(0x1234);
        let mut b = Xorshift32::new(0x1234);
        for _ in 0..100 {
            assert_eq!(a.next_u32(), b.next_u32());
        }
    }

    #[test]
    fn known_values() {
        let mut rng = Xorshift32::new(0x1234);
        assert_eq!(rng.next_u32(), 0x4A94_F1F7);
        assert_eq!(rng.next_u32(), 0x41E5_0FE2);
        let mut rng = Xorshift32::new(0x5678);
        assert_eq!(rng.next_u32(), 0x5325_30FF);
    }

    #[test]
    #[should_panic(expected = "nonzero")]
    fn zero_seed_rejected() {
        let _ = Xorshift32::new(0);
    }
}
