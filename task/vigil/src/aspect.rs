// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Liveness aspects.
//!
//! An aspect is a named liveness indicator: the monitored subsystem's
//! replicas report an OK byte on the aspect's duct each epoch they complete
//! a full cycle of real work, and each voter replica tracks the last time
//! the aspect was confirmed OK.

use std::cell::RefCell;
use std::rc::Rc;

use duct::{Duct, DuctConfig, DuctPolarity};
use exec::Timestamp;
use ringbuf::{ringbuf, ringbuf_entry};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Trace {
    NotConfirmed(&'static str),
    Recovered(&'static str),
}

ringbuf!(Trace, 16);

pub struct AspectConfig {
    pub label: &'static str,
    /// How long the aspect may go unconfirmed before the voters trip.
    pub timeout_ns: u64,
    /// Replicas of the subsystem reporting on this aspect.
    pub reporter_replicas: usize,
    /// Voter replicas watching this aspect.
    pub voter_replicas: usize,
}

pub struct Aspect {
    label: &'static str,
    timeout_ns: u64,
    duct: Rc<Duct>,
    /// Per-voter-replica timestamp of the last confirmed OK.
    last_known_ok: RefCell<Vec<Timestamp>>,
    /// Per-voter-replica memory of whether the last check failed, so
    /// recovery can be traced once rather than every epoch.
    failed: RefCell<Vec<bool>>,
}

impl Aspect {
    pub fn new(config: AspectConfig) -> Rc<Self> {
        let duct = Rc::new(Duct::new(DuctConfig {
            label: config.label,
            sender_replicas: config.reporter_replicas,
            receiver_replicas: config.voter_replicas,
            max_flow: 1,
            message_size: 1,
            polarity: DuctPolarity::SenderFirst,
        }));
        Rc::new(Self {
            label: config.label,
            timeout_ns: config.timeout_ns,
            duct,
            last_known_ok: RefCell::new(vec![0; config.voter_replicas]),
            failed: RefCell::new(vec![false; config.voter_replicas]),
        })
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Reports this epoch's liveness from reporter `replica_id`. Must be
    /// called exactly once per reporter per epoch, OK or not.
    pub fn indicate(&self, replica_id: usize, ok: bool) {
        let mut txn = self.duct.send_prepare(replica_id);
        txn.send(&[u8::from(ok)], 0);
        txn.commit();
    }

    /// Seeds the freshness clocks at init so nothing trips before the
    /// subsystems have had one full timeout period to come up.
    pub fn populate_timeout(&self, now: Timestamp) {
        for slot in self.last_known_ok.borrow_mut().iter_mut() {
            *slot = now;
        }
    }

    /// Voter-side check: consumes this epoch's reports and decides whether
    /// the aspect is still live at time `now`.
    pub fn check(&self, voter_replica: usize, now: Timestamp) -> bool {
        let mut ok_byte = [0u8; 1];
        let mut txn = self.duct.receive_prepare(voter_replica);
        let confirmed = txn.receive(&mut ok_byte) == 1 && ok_byte[0] == 1;
        txn.commit();

        let mut last = self.last_known_ok.borrow_mut();
        let mut failed = self.failed.borrow_mut();
        if confirmed {
            last[voter_replica] = now;
        } else if now < last[voter_replica] || now > last[voter_replica] + self.timeout_ns {
            if !failed[voter_replica] {
                ringbuf_entry!(Trace::NotConfirmed(self.label));
            }
            failed[voter_replica] = true;
            return false;
        }
        if failed[voter_replica] {
            ringbuf_entry!(Trace::Recovered(self.label));
            failed[voter_replica] = false;
        }
        true
    }
}
