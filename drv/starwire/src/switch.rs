// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Address-routed packet forwarding between bus endpoints.
//!
//! Every packet starts with a destination address byte. Addresses 1..=31
//! are physical: they select the port of the same number and are always
//! popped before forwarding. Addresses 32..=255 are logical: they resolve
//! through a routing table to a port, and are popped only when the route
//! says so. Unroutable packets, packets to absent ports, and packets that
//! would truncate on the outbound duct are dropped, never blocked on: the
//! switch has no backpressure to give.

use std::rc::Rc;

use duct::Duct;
use exec::{Clip, ClipCtx};
use ringbuf::{ringbuf, ringbuf_entry};

pub const PORT_BASE: usize = 1;
pub const PORT_COUNT: usize = 31;
pub const ROUTE_BASE: usize = 32;
pub const ROUTE_COUNT: usize = 256 - ROUTE_BASE;

const ROUTE_PORT_MASK: u8 = 0x1F;
const ROUTE_FLAG_ENABLED: u8 = 0x40;
const ROUTE_FLAG_POP: u8 = 0x80;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Trace {
    Forwarded { port: u8, len: usize },
    DropEmpty { port: u8 },
    DropInvalidAddress { port: u8, address: u8 },
    DropNoRoute { port: u8, address: u8 },
    DropNoPort { port: u8, outport: u8 },
    DropBacklogged { port: u8, outport: u8 },
    DropTruncation { port: u8, outport: u8, len: usize },
}

ringbuf!(Trace, 32);

struct Port {
    inbound: Rc<Duct>,
    outbound: Rc<Duct>,
}

pub struct SwitchBuilder {
    label: &'static str,
    ports: Vec<Option<Port>>,
    routes: [u8; ROUTE_COUNT],
}

impl SwitchBuilder {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            ports: (0..PORT_COUNT).map(|_| None).collect(),
            routes: [0; ROUTE_COUNT],
        }
    }

    /// Attaches a port. `inbound` carries packets to the switch; `outbound`
    /// carries packets from it.
    pub fn port(mut self, port: usize, inbound: Rc<Duct>, outbound: Rc<Duct>) -> Self {
        assert!(
            (PORT_BASE..PORT_BASE + PORT_COUNT).contains(&port),
            "switch '{}': invalid port {port}",
            self.label,
        );
        let slot = &mut self.ports[port - PORT_BASE];
        assert!(slot.is_none(), "switch '{}': port {port} already attached", self.label);
        *slot = Some(Port { inbound, outbound });
        self
    }

    /// Routes a logical address to a port, optionally popping the address
    /// byte on the way through.
    pub fn route(mut self, address: usize, port: usize, pop: bool) -> Self {
        assert!(
            (ROUTE_BASE..ROUTE_BASE + ROUTE_COUNT).contains(&address),
            "switch '{}': invalid routed address {address}",
            self.label,
        );
        assert!(
            (PORT_BASE..PORT_BASE + PORT_COUNT).contains(&port),
            "switch '{}': invalid port {port}",
            self.label,
        );
        let slot = &mut self.routes[address - ROUTE_BASE];
        assert!(*slot == 0, "switch '{}': address {address} already routed", self.label);
        *slot = port as u8 | ROUTE_FLAG_ENABLED | if pop { ROUTE_FLAG_POP } else { 0 };
        self
    }

    pub fn build(self) -> Switch {
        let scratch = self
            .ports
            .iter()
            .flatten()
            .map(|p| p.inbound.message_size())
            .max()
            .expect("switch must have at least one port");
        Switch {
            label: self.label,
            ports: self.ports,
            routes: self.routes,
            scratch: vec![0u8; scratch].into_boxed_slice(),
        }
    }
}

pub struct Switch {
    label: &'static str,
    ports: Vec<Option<Port>>,
    routes: [u8; ROUTE_COUNT],
    scratch: Box<[u8]>,
}

impl Switch {
    /// Resolves a destination address to `(port, pop)`.
    fn resolve(&self, address: u8) -> Option<(usize, bool)> {
        let address = address as usize;
        if (PORT_BASE..PORT_BASE + PORT_COUNT).contains(&address) {
            return Some((address, true));
        }
        if address >= ROUTE_BASE {
            let route = self.routes[address - ROUTE_BASE];
            if route & ROUTE_FLAG_ENABLED != 0 {
                return Some((
                    (route & ROUTE_PORT_MASK) as usize,
                    route & ROUTE_FLAG_POP != 0,
                ));
            }
        }
        None
    }

    pub fn label(&self) -> &'static str {
        self.label
    }
}

/// The switch clip: drains every inbound duct, forwarding what it can this
/// epoch and dropping the rest.
pub struct SwitchClip(pub Switch);

impl Clip for SwitchClip {
    fn clip(&mut self, _ctx: &ClipCtx) {
        let sw = &mut self.0;

        // every outbound duct owes the schedule a transaction each epoch,
        // traffic or not
        let mut out_txns: Vec<_> = sw
            .ports
            .iter()
            .map(|port| {
                port.as_ref()
                    .map(|p| (p.outbound.send_prepare(0), p.outbound.message_size()))
            })
            .collect();

        for index in 0..sw.ports.len() {
            let Some(port) = &sw.ports[index] else { continue };
            let port_number = (PORT_BASE + index) as u8;
            let mut in_txn = port.inbound.receive_prepare(0);

            while let Some((len, timestamp)) = in_txn.receive_timestamped(&mut sw.scratch) {
                if len == 0 {
                    ringbuf_entry!(Trace::DropEmpty { port: port_number });
                    continue;
                }
                let destination = sw.scratch[0];
                let Some((outport, pop)) = sw.resolve(destination) else {
                    if (destination as usize) < PORT_BASE {
                        ringbuf_entry!(Trace::DropInvalidAddress {
                            port: port_number,
                            address: destination,
                        });
                    } else {
                        ringbuf_entry!(Trace::DropNoRoute {
                            port: port_number,
                            address: destination,
                        });
                    }
                    continue;
                };

                let Some((out_txn, out_size)) = &mut out_txns[outport - PORT_BASE] else {
                    ringbuf_entry!(Trace::DropNoPort {
                        port: port_number,
                        outport: outport as u8,
                    });
                    continue;
                };

                let payload = if pop {
                    &sw.scratch[1..len]
                } else {
                    &sw.scratch[..len]
                };
                if payload.is_empty() {
                    ringbuf_entry!(Trace::DropEmpty { port: port_number });
                    continue;
                }
                if !out_txn.allowed() {
                    ringbuf_entry!(Trace::DropBacklogged {
                        port: port_number,
                        outport: outport as u8,
                    });
                    continue;
                }
                if payload.len() > *out_size {
                    // don't passively truncate; that causes trouble later
                    ringbuf_entry!(Trace::DropTruncation {
                        port: port_number,
                        outport: outport as u8,
                        len: payload.len(),
                    });
                    continue;
                }
                out_txn.send(payload, timestamp);
                ringbuf_entry!(Trace::Forwarded {
                    port: port_number,
                    len: payload.len(),
                });
            }

            in_txn.commit();
        }

        for (txn, _) in out_txns.into_iter().flatten() {
            txn.commit();
        }
    }
}
